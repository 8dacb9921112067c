/// Input-output words
///
/// Input arrives a line at a time from the host and is consumed an idiom (or a
/// character, for key) at a time. Output never goes to stdout directly: every
/// word here writes records to the shared output channel, which the host drains.
///
use crate::error::{ForthError, Result};
use crate::runtime::{radix_fmt, ForthRuntime, VmStatus};
use crate::value::DU;

pub const MAX_WIDTH: usize = 256; // widest field for setw, .r and spaces-style padding
const MAX_PRECISION: usize = 16;

/// Pull-based input. Blocking is the host's business: an empty source just
///     means the instance has to wait.
///
pub trait InputSource: Send {
    /// Append a line of text; a newline is added
    fn feed(&mut self, line: &str);
    /// Next raw character, if any
    fn key(&mut self) -> Option<char>;
    /// Text up to the delimiter. For a blank delimiter any whitespace separates
    ///     idioms and leading whitespace is skipped. The delimiter is consumed.
    fn next_idiom(&mut self, delim: char) -> Option<String>;
    /// Discard everything pending
    fn clear(&mut self);
}

/// The input buffer used by every instance
#[derive(Debug, Default)]
pub struct LineInput {
    buf: Vec<char>,
    pos: usize,
}

impl LineInput {
    pub fn new() -> LineInput {
        LineInput::default()
    }
}

impl InputSource for LineInput {
    fn feed(&mut self, line: &str) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend(line.chars());
        self.buf.push('\n');
    }

    fn key(&mut self) -> Option<char> {
        let c = self.buf.get(self.pos).copied()?;
        self.pos += 1;
        Some(c)
    }

    fn next_idiom(&mut self, delim: char) -> Option<String> {
        let blank = delim == ' ';
        if blank {
            while self.buf.get(self.pos).is_some_and(|c| c.is_whitespace()) {
                self.pos += 1;
            }
        }
        if self.pos >= self.buf.len() {
            return None;
        }
        let start = self.pos;
        while let Some(&c) = self.buf.get(self.pos) {
            if c == delim || (blank && c.is_whitespace()) {
                break;
            }
            self.pos += 1;
        }
        let idiom: String = self.buf[start..self.pos].iter().collect();
        if self.pos < self.buf.len() {
            self.pos += 1; // step over the delimiter
        }
        Some(idiom)
    }

    fn clear(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }
}

impl ForthRuntime {
    /// . ( n -- ) print the top of stack in the current radix
    pub fn f_dot(&mut self) -> Result<()> {
        let v = self.pop()?;
        self.emit_du(v);
        Ok(())
    }

    /// u. ( n -- ) print as an unsigned 32 bit integer
    pub fn f_u_dot(&mut self) -> Result<()> {
        let n = self.pop_int()? as u32;
        self.emit_str(&format!("{} ", radix_fmt(n as i64, self.radix)));
        Ok(())
    }

    /// .s ( -- ) prints a copy of the computation stack
    pub fn f_dot_s(&mut self) -> Result<()> {
        let mut text = String::from("[ ");
        for v in self.ss.as_slice() {
            match v {
                DU::Number(n) if v.is_integral() => text.push_str(&radix_fmt(*n as i64, self.radix)),
                _ => text.push_str(&v.to_string()),
            }
            text.push(' ');
        }
        text.push_str("] ");
        self.emit_str(&text);
        Ok(())
    }

    /// emit ( c -- ) print one character
    pub fn f_emit(&mut self) -> Result<()> {
        let c = self.pop_int()?;
        let c = char::from_u32(c as u32).unwrap_or(char::REPLACEMENT_CHARACTER);
        self.emit_str(&c.to_string());
        Ok(())
    }

    pub fn f_cr(&mut self) -> Result<()> {
        self.emit_str("\n");
        Ok(())
    }

    pub fn f_space(&mut self) -> Result<()> {
        self.emit_str(" ");
        Ok(())
    }

    /// spaces ( n -- ) at most one output buffer's worth
    pub fn f_spaces(&mut self) -> Result<()> {
        let n = (self.pop_int()?.max(0) as usize).min(self.out.capacity());
        self.emit_str(&" ".repeat(n));
        Ok(())
    }

    /// type ( a n -- ) print n characters of the arena string at a
    pub fn f_type(&mut self) -> Result<()> {
        let len = self.pop()?.addr()?;
        let addr = self.pop()?.addr()?;
        let s = self.dict().arena().fetch_str(addr, len)?;
        self.emit_str(&s);
        Ok(())
    }

    /// key ( -- c ) next input character. With nothing buffered the instance
    ///     goes WAITING and key runs again once more input is fed.
    ///
    pub fn f_key(&mut self) -> Result<()> {
        match self.input.key() {
            Some(c) => self.push(DU::from(c as u32 as usize)),
            None => {
                tracing::debug!(instance = self.id, "waiting for input");
                self.status = VmStatus::Waiting;
                Ok(())
            }
        }
    }

    pub fn f_hex(&mut self) -> Result<()> {
        self.radix = 16;
        Ok(())
    }

    pub fn f_decimal(&mut self) -> Result<()> {
        self.radix = 10;
        Ok(())
    }

    /// base@ ( -- n )
    pub fn f_base_get(&mut self) -> Result<()> {
        self.push(DU::from(self.radix as usize))
    }

    /// base! ( n -- ) any radix from 2 to 36
    pub fn f_base_set(&mut self) -> Result<()> {
        let n = self.pop_int()?;
        if !(2..=36).contains(&n) {
            return Err(ForthError::InvalidAddress(n.max(0) as usize));
        }
        self.radix = n as u32;
        Ok(())
    }

    fn pop_width(&mut self) -> Result<usize> {
        Ok((self.pop_int()?.max(0) as usize).min(MAX_WIDTH))
    }

    /// setw ( n -- ) 0 turns padding off
    pub fn f_setw(&mut self) -> Result<()> {
        self.fmt.width = self.pop_width()?;
        Ok(())
    }

    /// setfill ( c -- )
    pub fn f_setfill(&mut self) -> Result<()> {
        let c = self.pop_int()?;
        self.fmt.fill = char::from_u32(c as u32).unwrap_or(' ');
        Ok(())
    }

    /// setprec ( n -- ) a negative n goes back to the shortest form
    pub fn f_setprec(&mut self) -> Result<()> {
        let n = self.pop_int()?;
        self.fmt.precision = usize::try_from(n).ok().map(|p| p.min(MAX_PRECISION));
        Ok(())
    }

    /// .r ( n w -- ) no trailing space
    pub fn f_dot_r(&mut self) -> Result<()> {
        let w = self.pop_width()?;
        let text = match self.pop()? {
            DU::Number(n) => self.number_text(n),
            handle => handle.to_string(),
        };
        self.emit_str(&self.fmt.pad(&text, w));
        Ok(())
    }

    /// u.r ( n w -- )
    pub fn f_u_dot_r(&mut self) -> Result<()> {
        let w = self.pop_width()?;
        let n = self.pop_int()? as u32;
        let text = radix_fmt(n as i64, self.radix);
        self.emit_str(&self.fmt.pad(&text, w));
        Ok(())
    }
}
