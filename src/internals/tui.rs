// Interactive line editor for the console, on top of crossterm raw mode

use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::io::{self, stdout, Write};

/// Outcome of one key press
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    Continue,
    Submit(String),
    Quit,
}

/// Raw mode for as long as this lives
struct RawMode;

impl RawMode {
    fn enable() -> io::Result<RawMode> {
        enable_raw_mode()?;
        Ok(RawMode)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

#[derive(Debug)]
pub struct ForthLineEditor {
    buffer: Vec<char>,
    cursor: usize,
    history: Vec<String>,
    recall: Option<usize>, // index into history while browsing with Up/Down
    prompt: String,
}

impl ForthLineEditor {
    pub fn new(prompt: &str) -> Self {
        Self {
            buffer: Vec::new(),
            cursor: 0,
            history: Vec::new(),
            recall: None,
            prompt: prompt.to_string(),
        }
    }

    pub fn line(&self) -> String {
        self.buffer.iter().collect()
    }

    /// handle applies one key to the edit state. No terminal I/O happens here.
    pub fn handle(&mut self, key: KeyEvent) -> Edit {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Char('a') if ctrl => self.cursor = 0,
            KeyCode::Char('e') if ctrl => self.cursor = self.buffer.len(),
            KeyCode::Char('k') if ctrl => self.buffer.truncate(self.cursor),
            KeyCode::Char('c') if ctrl => return Edit::Quit,
            KeyCode::Char('d') if ctrl && self.buffer.is_empty() => return Edit::Quit,
            KeyCode::Char(c) if !ctrl => {
                self.buffer.insert(self.cursor, c);
                self.cursor += 1;
            }
            KeyCode::Backspace if self.cursor > 0 => {
                self.cursor -= 1;
                self.buffer.remove(self.cursor);
            }
            KeyCode::Delete if self.cursor < self.buffer.len() => {
                self.buffer.remove(self.cursor);
            }
            KeyCode::Left => self.cursor = self.cursor.saturating_sub(1),
            KeyCode::Right => self.cursor = (self.cursor + 1).min(self.buffer.len()),
            KeyCode::Home => self.cursor = 0,
            KeyCode::End => self.cursor = self.buffer.len(),
            KeyCode::Up => {
                let i = match self.recall {
                    Some(i) => i.saturating_sub(1),
                    None if !self.history.is_empty() => self.history.len() - 1,
                    None => return Edit::Continue,
                };
                self.recall_line(Some(i));
            }
            KeyCode::Down => match self.recall {
                Some(i) if i + 1 < self.history.len() => self.recall_line(Some(i + 1)),
                Some(_) => self.recall_line(None),
                None => {}
            },
            KeyCode::Enter => {
                let line = self.line();
                if !line.trim().is_empty() && self.history.last() != Some(&line) {
                    self.history.push(line.clone());
                }
                self.buffer.clear();
                self.cursor = 0;
                self.recall = None;
                return Edit::Submit(line);
            }
            KeyCode::Esc => return Edit::Quit,
            _ => {}
        }
        Edit::Continue
    }

    fn recall_line(&mut self, i: Option<usize>) {
        self.recall = i;
        self.buffer = match i {
            Some(i) => self.history[i].chars().collect(),
            None => Vec::new(),
        };
        self.cursor = self.buffer.len();
    }

    /// Redraw prompt and buffer, leaving the terminal cursor in place
    fn render(&self, out: &mut impl Write) -> io::Result<()> {
        write!(out, "\r\x1b[K{}{}", self.prompt, self.line())?;
        let back = self.buffer.len() - self.cursor;
        if back > 0 {
            write!(out, "\x1b[{back}D")?;
        }
        out.flush()
    }

    /// read_line edits one line in raw mode. None means the user asked to quit.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        let _raw = RawMode::enable()?;
        let mut out = stdout();
        self.render(&mut out)?;
        loop {
            let Event::Key(key) = event::read()? else {
                continue;
            };
            if key.kind == KeyEventKind::Release {
                continue;
            }
            match self.handle(key) {
                Edit::Continue => self.render(&mut out)?,
                Edit::Submit(line) => {
                    write!(out, "\r\n")?;
                    out.flush()?;
                    return Ok(Some(line));
                }
                Edit::Quit => {
                    write!(out, "\r\n")?;
                    out.flush()?;
                    return Ok(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn ctrl(c: char) -> KeyEvent {
        KeyEvent::new(KeyCode::Char(c), KeyModifiers::CONTROL)
    }

    fn type_str(ed: &mut ForthLineEditor, s: &str) {
        for c in s.chars() {
            assert_eq!(ed.handle(key(KeyCode::Char(c))), Edit::Continue);
        }
    }

    #[test]
    fn test_typing_and_submit() {
        let mut ed = ForthLineEditor::new("ok> ");
        type_str(&mut ed, "1 2 +");
        assert_eq!(ed.handle(key(KeyCode::Enter)), Edit::Submit("1 2 +".to_string()));
        assert_eq!(ed.line(), "");
    }

    #[test]
    fn test_cursor_editing() {
        let mut ed = ForthLineEditor::new("ok> ");
        type_str(&mut ed, "dp");
        ed.handle(key(KeyCode::Left));
        type_str(&mut ed, "u");
        assert_eq!(ed.line(), "dup");
        ed.handle(ctrl('a'));
        type_str(&mut ed, "3 ");
        assert_eq!(ed.line(), "3 dup");
        ed.handle(key(KeyCode::Right));
        ed.handle(ctrl('k'));
        assert_eq!(ed.line(), "3 d");
        ed.handle(ctrl('e'));
        ed.handle(key(KeyCode::Backspace));
        assert_eq!(ed.line(), "3 ");
    }

    #[test]
    fn test_shifted_characters_are_typed() {
        let mut ed = ForthLineEditor::new("ok> ");
        ed.handle(KeyEvent::new(KeyCode::Char('"'), KeyModifiers::SHIFT));
        assert_eq!(ed.line(), "\"");
    }

    #[test]
    fn test_history() {
        let mut ed = ForthLineEditor::new("ok> ");
        type_str(&mut ed, "first");
        ed.handle(key(KeyCode::Enter));
        type_str(&mut ed, "second");
        ed.handle(key(KeyCode::Enter));
        ed.handle(key(KeyCode::Up));
        assert_eq!(ed.line(), "second");
        ed.handle(key(KeyCode::Up));
        assert_eq!(ed.line(), "first");
        ed.handle(key(KeyCode::Up));
        assert_eq!(ed.line(), "first");
        ed.handle(key(KeyCode::Down));
        assert_eq!(ed.line(), "second");
        ed.handle(key(KeyCode::Down));
        assert_eq!(ed.line(), "");
    }

    #[test]
    fn test_quit_keys() {
        let mut ed = ForthLineEditor::new("ok> ");
        assert_eq!(ed.handle(key(KeyCode::Esc)), Edit::Quit);
        assert_eq!(ed.handle(ctrl('d')), Edit::Quit);
        type_str(&mut ed, "x");
        assert_eq!(ed.handle(ctrl('d')), Edit::Continue);
        assert_eq!(ed.handle(ctrl('c')), Edit::Quit);
    }

    #[test]
    fn test_render_positions_cursor() {
        let mut ed = ForthLineEditor::new("ok> ");
        type_str(&mut ed, "abc");
        ed.handle(key(KeyCode::Left));
        ed.handle(key(KeyCode::Left));
        let mut out = Vec::new();
        ed.render(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "\r\x1b[Kok> abc\x1b[2D");
    }
}
