// Compiler and Outer Interpreter

use crate::error::{ForthError, Result};
use crate::kernel::CELL;
use crate::param::{Param, BRAN, DO, DOTSTR, EXIT, LIT, LOOP, NEXT, STR, VAR, ZBRAN};
use crate::runtime::{ControlMarker, ForthRuntime, VmStatus};
use crate::value::DU;
use tracing::{debug, error, warn};

impl ForthRuntime {
    /// process_line is the outer interpreter: it appends a line to the input and
    ///     evaluates idioms until the input runs dry, the instance has to wait for
    ///     more input, or it stops.
    ///
    ///     An undefined word is reported and skipped. Any other error is reported,
    ///     the rest of the line is dropped, and the instance goes back to READY.
    ///     Fatal errors stop the instance and are returned to the caller.
    ///
    pub fn process_line(&mut self, line: &str) -> Result<()> {
        if self.status == VmStatus::Stopped {
            debug!(instance = self.id, "line ignored by stopped instance");
            return Ok(());
        }
        self.input.feed(line);
        self.status = VmStatus::Running;
        match self.interpret() {
            Ok(()) => {
                if self.status == VmStatus::Running {
                    self.status = VmStatus::Ready;
                    if self.show_stack {
                        self.f_dot_s()?;
                    }
                }
                Ok(())
            }
            Err(e) => self.fault(e),
        }
    }

    fn interpret(&mut self) -> Result<()> {
        if let Some(s) = self.suspended.take() {
            self.resume(s)?;
            if self.status != VmStatus::Running {
                return Ok(());
            }
        }
        while let Some(idiom) = self.input.next_idiom(' ') {
            match self.parse(&idiom) {
                Ok(()) => {}
                Err(e) if e.is_recoverable() => {
                    warn!(instance = self.id, "{e}");
                    self.emit_str(&format!("{e}\n"));
                }
                Err(e) => return Err(e),
            }
            if self.status != VmStatus::Running {
                break; // waiting for input, or stopped by bye
            }
        }
        Ok(())
    }

    fn fault(&mut self, e: ForthError) -> Result<()> {
        self.emit_str(&format!("{e}\n"));
        self.f_abort();
        if e.is_fatal() {
            error!(instance = self.id, ?e, "fatal error, instance stopped");
            self.status = VmStatus::Stopped;
            return Err(e);
        }
        debug!(instance = self.id, %e, "line abandoned");
        self.status = VmStatus::Ready;
        Ok(())
    }

    /// parse handles one idiom: a word to run or compile, or a number
    fn parse(&mut self, idiom: &str) -> Result<()> {
        let found = {
            let d = self.dict();
            d.find(idiom, self.ucase)
                .and_then(|w| d.word(w).map(|word| (w, word.immediate, word.prim)))
        };
        if let Some((w, immediate, prim)) = found {
            if !self.compile || immediate {
                return self.call(w);
            }
            let p = match prim {
                Some(n) => Param::builtin(n),
                None => Param::call(w, immediate),
            };
            return self.compiling(|d| d.arena_mut().append_instruction(p).map(|_| ()));
        }
        let v = self
            .number(idiom)
            .ok_or_else(|| ForthError::UndefinedWord(idiom.to_string()))?;
        if self.compile {
            self.compiling(|d| d.arena_mut().append_literal(v, false).map(|_| ()))
        } else {
            self.push(v)
        }
    }

    /// number converts an idiom in the current radix.
    ///     A leading $ forces hex, # decimal and % binary. In decimal, anything
    ///     Rust reads as an f32 is accepted as well.
    ///
    pub fn number(&self, idiom: &str) -> Option<DU> {
        let (radix, body) = match idiom.as_bytes().first()? {
            b'$' => (16, &idiom[1..]),
            b'#' => (10, &idiom[1..]),
            b'%' => (2, &idiom[1..]),
            _ => (self.radix, idiom),
        };
        let (negative, digits) = match body.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, body),
        };
        if digits.is_empty() || digits.starts_with(['+', '-']) {
            return None;
        }
        if let Ok(n) = i64::from_str_radix(digits, radix) {
            let n = if negative { -n } else { n };
            return Some(DU::Number(n as f32));
        }
        let float_chars = digits
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'));
        if radix == 10 && float_chars && digits.starts_with(|c: char| c.is_ascii_digit() || c == '.') {
            return body.parse::<f32>().ok().map(DU::Number);
        }
        None
    }

    /// Next blank-delimited name from the input, for defining words
    fn next_name(&mut self, word: &str) -> Result<String> {
        self.input
            .next_idiom(' ')
            .ok_or_else(|| ForthError::MissingName(word.to_string()))
    }

    fn require_compile(&self, word: &str) -> Result<()> {
        if self.compile {
            Ok(())
        } else {
            Err(ForthError::CompileOnly(word.to_string()))
        }
    }

    fn compile_param(&mut self, p: Param) -> Result<usize> {
        self.compiling(|d| d.arena_mut().append_instruction(p))
    }

    fn compile_branch(&mut self, op: u32, target: usize) -> Result<usize> {
        self.compiling(|d| d.arena_mut().append_branch(op, target))
    }

    /// Point an unresolved branch cell at HERE
    fn resolve(&mut self, cell: usize) -> Result<()> {
        self.compiling(|d| {
            let here = d.arena().here() as u32;
            d.arena_mut().patch_cell(cell, here)
        })
    }

    fn compile_builtin(&mut self, name: &str) -> Result<()> {
        let n = self
            .dict()
            .builtin_number(name)
            .ok_or_else(|| ForthError::UndefinedWord(name.to_string()))?;
        self.compile_param(Param::builtin(n)).map(|_| ())
    }

    ////////////////////////////////
    /// Defining words

    /// : <name> ( -- ) open a new definition and switch to compile mode
    pub fn f_colon(&mut self) -> Result<()> {
        let name = self.next_name(":")?;
        self.compiling(|d| d.begin(&name))?;
        if self.dict().find(&name, self.ucase).is_some() {
            debug!(instance = self.id, name = %name, "redefining");
        }
        self.control_stack.clear();
        self.compile = true;
        Ok(())
    }

    /// ; ( -- ) close the definition and publish it
    pub fn f_semicolon(&mut self) -> Result<()> {
        if self.dict().pending().is_none() {
            return Err(ForthError::CompileOnly(";".to_string()));
        }
        if !self.control_stack.is_empty() {
            return Err(ForthError::UnbalancedControl(";".to_string()));
        }
        let w = self.compiling(|d| {
            d.arena_mut().append_instruction(Param::op(EXIT))?;
            d.end()
        })?;
        debug!(instance = self.id, word = w, "definition complete");
        self.compile = false;
        Ok(())
    }

    /// immediate ( -- ) sets the immediate flag on the most recently defined word
    pub fn f_immediate(&mut self) -> Result<()> {
        self.compiling(|d| {
            if let Some(word) = d.last_word_mut() {
                word.immediate = true;
            }
            Ok(())
        })
    }

    /// forget <name> ( -- ) drop a word and everything defined after it
    pub fn f_forget(&mut self) -> Result<()> {
        if self.compile || self.dict().pending().is_some() {
            return Err(ForthError::ForgetInDefinition);
        }
        let name = self.next_name("forget")?;
        let ucase = self.ucase;
        self.compiling(|d| d.forget_word(&name, ucase))
    }

    /// constant <name> ( n -- )
    pub fn f_constant(&mut self) -> Result<()> {
        let v = self.pop()?;
        let name = self.next_name("constant")?;
        self.compiling(|d| d.add_word(&name, false, |a| a.append_literal(v, true).map(|_| ())))?;
        Ok(())
    }

    /// variable <name> ( -- ) a zeroed cell whose address the word pushes
    pub fn f_variable(&mut self) -> Result<()> {
        let name = self.next_name("variable")?;
        self.compiling(|d| {
            d.add_word(&name, false, |a| {
                a.append_instruction(Param::op(VAR).with_exit())?;
                a.append_du(DU::default())?;
                Ok(())
            })
        })?;
        Ok(())
    }

    /// value <name> ( n -- ) like a constant, but `to` can change it.
    ///     The literal carries the immediate bit so `to` can tell it from a constant.
    ///
    pub fn f_value(&mut self) -> Result<()> {
        let v = self.pop()?;
        let name = self.next_name("value")?;
        self.compiling(|d| {
            d.add_word(&name, false, |a| {
                a.append_instruction(Param::op(LIT).with_exit().with_immediate())?;
                a.append_du(v)?;
                Ok(())
            })
        })?;
        Ok(())
    }

    /// to <name> ( n -- ) store into a value, now or when the definition runs
    pub fn f_to(&mut self) -> Result<()> {
        let name = self.next_name("to")?;
        let addr = {
            let d = self.dict();
            let w = d
                .find(&name, self.ucase)
                .ok_or_else(|| ForthError::UndefinedWord(name.clone()))?;
            let word = d.word(w).ok_or(ForthError::InvalidAddress(w))?;
            if word.prim.is_some() {
                return Err(ForthError::NotAValue(name.clone()));
            }
            let pfa = word.pfa;
            let head = Param::decode(d.arena().fetch_cell(pfa)?);
            if head != Param::op(LIT).with_exit().with_immediate() {
                return Err(ForthError::NotAValue(name.clone()));
            }
            pfa + CELL
        };
        if self.compile {
            self.compiling(|d| d.arena_mut().append_literal(DU::from(addr), false).map(|_| ()))?;
            self.compile_builtin("!")
        } else {
            let v = self.pop()?;
            self.dict.write().arena_mut().store_du(addr, v)
        }
    }

    /// alias <name> ( w -- ) a second name for word w
    pub fn f_alias(&mut self) -> Result<()> {
        let w = self.pop()?.addr()?;
        let name = self.next_name("alias")?;
        self.compiling(|d| d.add_alias(&name, w))?;
        Ok(())
    }

    /// ' <name> ( -- w ) index of a word, for execute and alias
    pub fn f_tick(&mut self) -> Result<()> {
        let name = self.next_name("'")?;
        let w = self
            .dict()
            .find(&name, self.ucase)
            .ok_or(ForthError::UndefinedWord(name))?;
        self.push(DU::from(w))
    }

    /// [ ( -- ) interpret inside a definition
    pub fn f_lbracket(&mut self) -> Result<()> {
        self.compile = false;
        Ok(())
    }

    /// ] ( -- ) go back to compiling the open definition
    pub fn f_rbracket(&mut self) -> Result<()> {
        if self.dict().pending().is_none() {
            return Err(ForthError::CompileOnly("]".to_string()));
        }
        self.compile = true;
        Ok(())
    }

    /// literal ( n -- ) compile the top of stack as a literal
    pub fn f_literal(&mut self) -> Result<()> {
        self.require_compile("literal")?;
        let v = self.pop()?;
        self.compiling(|d| d.arena_mut().append_literal(v, false).map(|_| ()))
    }

    /// recurse ( -- ) call the word being defined
    pub fn f_recurse(&mut self) -> Result<()> {
        self.require_compile("recurse")?;
        let w = self.dict().next_index();
        self.compile_param(Param::call(w, false)).map(|_| ())
    }

    /// exit ( -- ) compile a return from the current word
    pub fn f_exit(&mut self) -> Result<()> {
        self.require_compile("exit")?;
        self.compile_param(Param::op(EXIT)).map(|_| ())
    }

    ////////////////////////////////
    /// Control structures
    ///
    /// Forward branches are compiled with a zero target and patched once the
    /// destination is known. The control stack pairs up the words.

    /// if ( f -- )
    pub fn f_if(&mut self) -> Result<()> {
        self.require_compile("if")?;
        let cell = self.compile_branch(ZBRAN, 0)?;
        self.control_stack.push(ControlMarker::If(cell));
        Ok(())
    }

    pub fn f_else(&mut self) -> Result<()> {
        self.require_compile("else")?;
        match self.control_stack.pop() {
            Some(ControlMarker::If(if_cell)) => {
                let cell = self.compile_branch(BRAN, 0)?;
                self.resolve(if_cell)?;
                self.control_stack.push(ControlMarker::Else(cell));
                Ok(())
            }
            _ => Err(ForthError::UnbalancedControl("else".to_string())),
        }
    }

    pub fn f_then(&mut self) -> Result<()> {
        self.require_compile("then")?;
        match self.control_stack.pop() {
            Some(ControlMarker::If(cell)) | Some(ControlMarker::Else(cell)) => self.resolve(cell),
            _ => Err(ForthError::UnbalancedControl("then".to_string())),
        }
    }

    pub fn f_begin(&mut self) -> Result<()> {
        self.require_compile("begin")?;
        let here = self.here();
        self.control_stack.push(ControlMarker::Begin(here));
        Ok(())
    }

    pub fn f_again(&mut self) -> Result<()> {
        self.require_compile("again")?;
        match self.control_stack.pop() {
            Some(ControlMarker::Begin(head)) => self.compile_branch(BRAN, head).map(|_| ()),
            _ => Err(ForthError::UnbalancedControl("again".to_string())),
        }
    }

    /// until ( f -- ) loop back while f is false
    pub fn f_until(&mut self) -> Result<()> {
        self.require_compile("until")?;
        match self.control_stack.pop() {
            Some(ControlMarker::Begin(head)) => self.compile_branch(ZBRAN, head).map(|_| ()),
            _ => Err(ForthError::UnbalancedControl("until".to_string())),
        }
    }

    /// while ( f -- ) leave the loop when f is false
    pub fn f_while(&mut self) -> Result<()> {
        self.require_compile("while")?;
        if !matches!(self.control_stack.last(), Some(ControlMarker::Begin(_))) {
            return Err(ForthError::UnbalancedControl("while".to_string()));
        }
        let cell = self.compile_branch(ZBRAN, 0)?;
        self.control_stack.push(ControlMarker::While(cell));
        Ok(())
    }

    pub fn f_repeat(&mut self) -> Result<()> {
        self.require_compile("repeat")?;
        let exit_cell = match self.control_stack.pop() {
            Some(ControlMarker::While(cell)) => cell,
            _ => return Err(ForthError::UnbalancedControl("repeat".to_string())),
        };
        match self.control_stack.pop() {
            Some(ControlMarker::Begin(head)) => {
                self.compile_branch(BRAN, head)?;
                self.resolve(exit_cell)
            }
            _ => Err(ForthError::UnbalancedControl("repeat".to_string())),
        }
    }

    /// for ( n -- ) the counter lives on the return stack, counting down to zero
    pub fn f_for(&mut self) -> Result<()> {
        self.require_compile("for")?;
        self.compile_builtin(">r")?;
        let here = self.here();
        self.control_stack.push(ControlMarker::For(here));
        Ok(())
    }

    pub fn f_next(&mut self) -> Result<()> {
        self.require_compile("next")?;
        match self.control_stack.pop() {
            Some(ControlMarker::For(head)) => self.compile_branch(NEXT, head).map(|_| ()),
            _ => Err(ForthError::UnbalancedControl("next".to_string())),
        }
    }

    /// do ( limit start -- )
    pub fn f_do(&mut self) -> Result<()> {
        self.require_compile("do")?;
        self.compile_param(Param::op(DO))?;
        let here = self.here();
        self.control_stack.push(ControlMarker::Do(here));
        Ok(())
    }

    pub fn f_loop(&mut self) -> Result<()> {
        self.require_compile("loop")?;
        match self.control_stack.pop() {
            Some(ControlMarker::Do(head)) => self.compile_branch(LOOP, head).map(|_| ()),
            _ => Err(ForthError::UnbalancedControl("loop".to_string())),
        }
    }

    ////////////////////////////////
    /// Strings and comments

    /// ." <text>" ( -- ) print text, compiled or right away
    pub fn f_dot_quote(&mut self) -> Result<()> {
        let text = self.input.next_idiom('"').unwrap_or_default();
        if self.compile {
            self.compiling(|d| d.arena_mut().append_str(DOTSTR, &text).map(|_| ()))
        } else {
            self.emit_str(&text);
            Ok(())
        }
    }

    /// s" <text>" ( -- a n ) compile an inline string
    pub fn f_s_quote(&mut self) -> Result<()> {
        self.require_compile("s\"")?;
        let text = self.input.next_idiom('"').unwrap_or_default();
        self.compiling(|d| d.arena_mut().append_str(STR, &text).map(|_| ()))
    }

    /// .( <text>) ( -- ) print text at once, even while compiling
    pub fn f_dot_paren(&mut self) -> Result<()> {
        let text = self.input.next_idiom(')').unwrap_or_default();
        self.emit_str(&text);
        Ok(())
    }

    pub fn f_paren(&mut self) -> Result<()> {
        self.input.next_idiom(')');
        Ok(())
    }

    pub fn f_backslash(&mut self) -> Result<()> {
        self.input.next_idiom('\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ForthError;
    use crate::runtime::tests::{boot, run, stack};
    use crate::runtime::VmStatus;
    use crate::value::DU;

    #[test]
    fn test_square() {
        let mut vm = boot();
        assert_eq!(run(&mut vm, ": SQ DUP * ;"), "");
        assert_eq!(run(&mut vm, "3 SQ ."), "9 ");
    }

    #[test]
    fn test_subtraction_order() {
        let mut vm = boot();
        run(&mut vm, "5 3 -");
        assert_eq!(stack(&vm), vec![DU::from(2)]);
    }

    #[test]
    fn test_undefined_word_skips_idiom_only() {
        let mut vm = boot();
        let out = run(&mut vm, "1 FOO 2 .");
        assert_eq!(out, "FOO ? undefined word\n2 ");
        assert_eq!(stack(&vm), vec![DU::from(1)]);
        assert_eq!(vm.status, VmStatus::Ready);
    }

    #[test]
    fn test_other_errors_drop_the_line() {
        let mut vm = boot();
        let out = run(&mut vm, "1 0 / 7 .");
        assert_eq!(out, "division by zero\n");
        assert!(stack(&vm).is_empty());
        assert_eq!(vm.status, VmStatus::Ready);
        assert_eq!(run(&mut vm, "7 ."), "7 ");
    }

    #[test]
    fn test_failed_definition_is_abandoned() {
        let mut vm = boot();
        let here = vm.here();
        run(&mut vm, ": broken 1 if 2 ;");
        assert_eq!(vm.here(), here);
        assert!(!vm.compile);
        assert!(vm.dict().find("broken", true).is_none());
    }

    #[test]
    fn test_forget() {
        let mut vm = boot();
        run(&mut vm, ": X 1 ; : Y 2 ;");
        run(&mut vm, "FORGET X");
        let out = run(&mut vm, "X");
        assert_eq!(out, "X ? undefined word\n");
        assert!(vm.dict().find("Y", true).is_none());
        assert_eq!(run(&mut vm, "forget dup"), "dup is protected\n");
    }

    #[test]
    fn test_forget_inside_definition() {
        let mut vm = boot();
        run(&mut vm, ": X 1 ;");
        let out = run(&mut vm, ": Y [ forget X ] ;");
        assert_eq!(out, format!("{}\n", ForthError::ForgetInDefinition));
        assert!(vm.dict().find("X", true).is_some());
    }

    #[test]
    fn test_shadowing_keeps_old_callers() {
        let mut vm = boot();
        run(&mut vm, ": five 5 ; : use five ;");
        run(&mut vm, ": five 6 ;");
        assert_eq!(run(&mut vm, "five . use ."), "6 5 ");
    }

    #[test]
    fn test_constants_variables_values() {
        let mut vm = boot();
        run(&mut vm, "10 constant ten variable v 0 value w");
        run(&mut vm, "42 v ! 7 to w");
        assert_eq!(run(&mut vm, "ten . v @ . w ."), "10 42 7 ");
        run(&mut vm, ": bump w 1 + to w ;");
        run(&mut vm, "bump bump");
        assert_eq!(run(&mut vm, "w ."), "9 ");
    }

    #[test]
    fn test_to_refuses_constants() {
        let mut vm = boot();
        run(&mut vm, "5 constant c variable v");
        assert_eq!(run(&mut vm, "6 to c"), "c is not a value\n");
        assert_eq!(run(&mut vm, "c ."), "5 ");
        assert_eq!(run(&mut vm, ": set 6 to c ;"), "c is not a value\n");
        assert_eq!(run(&mut vm, "c ."), "5 ");
        assert_eq!(run(&mut vm, "1 to v"), "v is not a value\n");
        assert_eq!(run(&mut vm, "1 to dup"), "dup is not a value\n");
    }

    #[test]
    fn test_immediate_runs_while_compiling() {
        let mut vm = boot();
        run(&mut vm, ": now 99 ; immediate");
        run(&mut vm, ": later now ;");
        assert_eq!(stack(&vm), vec![DU::from(99)]);
    }

    #[test]
    fn test_brackets_and_literal() {
        let mut vm = boot();
        run(&mut vm, ": six [ 2 3 * ] literal ;");
        assert_eq!(run(&mut vm, "six ."), "6 ");
    }

    #[test]
    fn test_alias() {
        let mut vm = boot();
        run(&mut vm, "' dup alias twin");
        run(&mut vm, "4 twin");
        assert_eq!(stack(&vm), vec![DU::from(4), DU::from(4)]);
    }

    #[test]
    fn test_compile_only_words() {
        let mut vm = boot();
        assert_eq!(run(&mut vm, "1 if"), "if is compile only\n");
        assert_eq!(run(&mut vm, ";"), "; is compile only\n");
        assert_eq!(run(&mut vm, ": x then ;"), "unbalanced control structure at then\n");
    }

    #[test]
    fn test_missing_name() {
        let mut vm = boot();
        assert_eq!(run(&mut vm, ":"), ": expects a name\n");
    }

    #[test]
    fn test_numbers() {
        let vm = boot();
        assert_eq!(vm.number("42"), Some(DU::from(42)));
        assert_eq!(vm.number("-7"), Some(DU::from(-7)));
        assert_eq!(vm.number("$ff"), Some(DU::from(255)));
        assert_eq!(vm.number("%101"), Some(DU::from(5)));
        assert_eq!(vm.number("2.5"), Some(DU::from(2.5f32)));
        assert_eq!(vm.number("1e3"), Some(DU::from(1000)));
        assert_eq!(vm.number("-"), None);
        assert_eq!(vm.number("--5"), None);
        assert_eq!(vm.number("inf"), None);
        assert_eq!(vm.number("abc"), None);
    }

    #[test]
    fn test_hex_input() {
        let mut vm = boot();
        run(&mut vm, "hex ff decimal");
        assert_eq!(stack(&vm), vec![DU::from(255)]);
    }

    #[test]
    fn test_comments() {
        let mut vm = boot();
        assert_eq!(run(&mut vm, "1 ( two ) 3 \\ 4 5"), "");
        assert_eq!(stack(&vm), vec![DU::from(1), DU::from(3)]);
        assert_eq!(run(&mut vm, ".( hello)"), "hello");
    }

    #[test]
    fn test_stopped_instance_ignores_input() {
        let mut vm = boot();
        run(&mut vm, "bye 1 2");
        assert_eq!(vm.status, VmStatus::Stopped);
        assert!(stack(&vm).is_empty());
        run(&mut vm, "3");
        assert!(stack(&vm).is_empty());
    }

    #[test]
    fn test_fatal_error_stops_instance() {
        let params = crate::config::Params {
            arena_size: 8,
            ..crate::config::Params::default()
        };
        let mut vm = crate::runtime::tests::boot_with(params);
        let r = vm.process_line(": big 1 2 3 ;");
        assert!(matches!(r, Err(ForthError::ArenaExhausted { .. })));
        assert_eq!(vm.status, VmStatus::Stopped);
        vm.reset();
        assert_eq!(vm.status, VmStatus::Ready);
    }
}
