/// Inner Interpreter
///
/// Runs compiled bodies out of the shared arena. One loop handles every colon word:
/// calls push the return address on the return stack and jump, EXIT pops it back.
/// Nothing here recurses on the Rust stack, so nesting depth is bounded only by
/// the return stack capacity.
///
use crate::error::{ForthError, Result};
use crate::kernel::CELL;
use crate::param::{Param, BRAN, DO, DOTSTR, EXIT, LIT, LOOP, MAX_OP, NEXT, STR, VAR, ZBRAN};
use crate::runtime::{ForthRuntime, Suspend, VmStatus};
use crate::value::DU;

impl ForthRuntime {
    /// call runs word w from the outer interpreter.
    ///     Builtins run directly; colon words start a fresh nest.
    ///
    pub fn call(&mut self, w: usize) -> Result<()> {
        let (pfa, prim) = {
            let d = self.dict();
            let word = d.word(w).ok_or(ForthError::InvalidAddress(w))?;
            (word.pfa, word.prim)
        };
        self.wp = w;
        match prim {
            Some(n) => {
                let code = self.builtin_code(n)?;
                code(self)?;
                if self.status == VmStatus::Waiting && self.suspended.is_none() {
                    self.suspended = Some(Suspend::Word(w));
                }
                Ok(())
            }
            None => self.nest(pfa),
        }
    }

    /// nest executes the body at pfa until its final EXIT
    pub fn nest(&mut self, pfa: usize) -> Result<()> {
        let base = self.rs.depth();
        self.ip = pfa;
        self.run_from(base)
    }

    /// Continue a suspended instance where it stopped
    pub(crate) fn resume(&mut self, s: Suspend) -> Result<()> {
        tracing::debug!(instance = self.id, ?s, "resuming");
        match s {
            Suspend::Word(w) => self.call(w),
            Suspend::Nest { base } => self.run_from(base),
        }
    }

    fn run_from(&mut self, base: usize) -> Result<()> {
        let outer = self.in_nest;
        self.in_nest = true;
        let result = self.inner_loop(base);
        self.in_nest = outer;
        result
    }

    /// The instruction loop. Returns when EXIT finds the return stack back at `base`,
    ///     or when a builtin leaves the instance WAITING. In that case IP is left on the
    ///     builtin so that resuming runs it again.
    ///
    fn inner_loop(&mut self, base: usize) -> Result<()> {
        loop {
            let at = self.ip;
            let p = Param::decode(self.dict().arena().fetch_cell(at)?);
            self.ip = at + CELL;

            if p.colon {
                let pfa = self
                    .dict()
                    .word(p.index as usize)
                    .map(|w| w.pfa)
                    .ok_or(ForthError::InvalidAddress(at))?;
                if !p.exit {
                    self.rpush(DU::from(self.ip))?;
                } // with exit set this is a tail jump
                self.ip = pfa;
                continue;
            }

            match p.index {
                EXIT => {}
                LIT => {
                    let v = self.dict().arena().fetch_du(self.ip)?;
                    self.ip += CELL;
                    self.push(v)?;
                }
                STR => {
                    let (addr, s) = self.inline_str()?;
                    self.push(DU::from(addr))?;
                    self.push(DU::from(s.len()))?;
                }
                DOTSTR => {
                    let (_, s) = self.inline_str()?;
                    self.emit_str(&s);
                }
                BRAN => {
                    self.ip = self.operand()?;
                }
                ZBRAN => {
                    if self.pop()?.truthy() {
                        self.ip += CELL;
                    } else {
                        self.ip = self.operand()?;
                    }
                }
                NEXT => {
                    let n = self.rs.peek(0).map_err(|_| ForthError::ReturnStackUnderflow)?.int()?;
                    if n > 0 {
                        let _ = self.rs.set_top(DU::from(n - 1));
                        self.ip = self.operand()?;
                    } else {
                        self.rpop()?;
                        self.ip += CELL;
                    }
                }
                DO => {
                    let start = self.pop()?;
                    let limit = self.pop()?;
                    self.rpush(limit)?;
                    self.rpush(start)?;
                }
                LOOP => {
                    let i = self.rpop()?.number()? + 1.0;
                    let limit = self.rs.peek(0).map_err(|_| ForthError::ReturnStackUnderflow)?.number()?;
                    if i < limit {
                        self.rpush(DU::Number(i))?;
                        self.ip = self.operand()?;
                    } else {
                        self.rpop()?;
                        self.ip += CELL;
                    }
                }
                VAR => {
                    self.push(DU::from(self.ip))?;
                }
                op if op >= MAX_OP => {
                    let code = self.builtin_code((op - MAX_OP) as usize)?;
                    code(self)?;
                    if self.status == VmStatus::Waiting {
                        self.ip = at;
                        self.suspended = Some(Suspend::Nest { base });
                        return Ok(());
                    }
                }
                _ => return Err(ForthError::InvalidAddress(at)),
            }

            if p.exit || p.index == EXIT {
                if self.rs.depth() <= base {
                    return Ok(());
                }
                self.ip = self.rpop()?.addr()?;
            }
        }
    }

    /// The operand cell at IP, as an arena address
    fn operand(&self) -> Result<usize> {
        Ok(self.dict().arena().fetch_cell(self.ip)? as usize)
    }

    /// Read the inline string at IP and step over it
    fn inline_str(&mut self) -> Result<(usize, String)> {
        let d = self.dict();
        let padded = d.arena().fetch_cell(self.ip)? as usize;
        let addr = self.ip + CELL;
        let s = d.arena().fetch_str(addr, padded)?;
        drop(d);
        self.ip = addr + padded;
        Ok((addr, s))
    }

    /// execute ( w -- ) Run the word with index w.
    ///     Inside a colon word this is a call like any other, with no Rust recursion.
    ///
    pub fn f_execute(&mut self) -> Result<()> {
        let w = self.pop()?.addr()?;
        let (pfa, prim) = {
            let d = self.dict();
            let word = d.word(w).ok_or(ForthError::InvalidAddress(w))?;
            (word.pfa, word.prim)
        };
        match prim {
            Some(n) => {
                let code = self.builtin_code(n)?;
                self.wp = w;
                code(self)?;
                if self.status == VmStatus::Waiting {
                    self.push(DU::from(w))?; // run again on resume
                }
                Ok(())
            }
            None if self.in_nest => {
                self.rpush(DU::from(self.ip))?;
                self.ip = pfa;
                Ok(())
            }
            None => self.nest(pfa),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Params;
    use crate::error::ForthError;
    use crate::runtime::tests::{boot, boot_with, run, stack};
    use crate::runtime::VmStatus;
    use crate::value::DU;

    #[test]
    fn test_nested_calls_return_in_order() {
        let mut vm = boot();
        run(&mut vm, ": C 3 ;");
        run(&mut vm, ": B 2 C 20 ;");
        run(&mut vm, ": A 1 B 10 ;");
        run(&mut vm, "A");
        assert_eq!(stack(&vm), vec![1, 2, 3, 20, 10].into_iter().map(DU::from).collect::<Vec<_>>());
        assert_eq!(vm.rs.depth(), 0);
        assert_eq!(vm.status, VmStatus::Ready);
    }

    #[test]
    fn test_return_stack_capacity_bounds_depth() {
        let params = Params {
            rstack_size: 2,
            ..Params::default()
        };
        let mut vm = boot_with(params);
        run(&mut vm, ": C 3 ; : B C ; : A B ;");
        run(&mut vm, "A");
        assert_eq!(stack(&vm), vec![DU::from(3)]);

        let params = Params {
            rstack_size: 1,
            ..Params::default()
        };
        let mut vm = boot_with(params);
        run(&mut vm, ": C 3 ; : B C ; : A B ;");
        let out = run(&mut vm, "A");
        assert_eq!(out, format!("{}\n", ForthError::ReturnStackOverflow));
        assert_eq!(vm.rs.depth(), 0);
        assert_eq!(vm.status, VmStatus::Ready);
    }

    #[test]
    fn test_literals_and_strings() {
        let mut vm = boot();
        run(&mut vm, r#": greet ." hi" 42 ;"#);
        assert_eq!(run(&mut vm, "greet ."), "hi42 ");
        run(&mut vm, r#": msg s" hello" ;"#);
        run(&mut vm, "msg");
        assert_eq!(vm.top().unwrap(), DU::from(5));
        assert_eq!(run(&mut vm, "type"), "hello");
    }

    #[test]
    fn test_branches() {
        let mut vm = boot();
        run(&mut vm, ": sign 0< if -1 else 1 then ;");
        assert_eq!(run(&mut vm, "-5 sign . 5 sign ."), "-1 1 ");
        run(&mut vm, ": count 0 begin 1 + dup 5 = until ;");
        assert_eq!(run(&mut vm, "count ."), "5 ");
        run(&mut vm, ": halve begin dup 1 > while 2 / repeat ;");
        assert_eq!(run(&mut vm, "16 halve ."), "1 ");
    }

    #[test]
    fn test_counted_loops() {
        let mut vm = boot();
        run(&mut vm, ": down 3 for i . next ;");
        assert_eq!(run(&mut vm, "down"), "3 2 1 0 ");
        run(&mut vm, ": up 4 1 do i . loop ;");
        assert_eq!(run(&mut vm, "up"), "1 2 3 ");
        assert_eq!(vm.rs.depth(), 0);
    }

    #[test]
    fn test_execute_inside_definition() {
        let mut vm = boot();
        run(&mut vm, ": sq dup * ;");
        run(&mut vm, ": apply execute 1 + ;");
        assert_eq!(run(&mut vm, "5 ' sq apply ."), "26 ");
        assert_eq!(run(&mut vm, "7 ' dup execute + ."), "14 ");
    }

    #[test]
    fn test_recursion() {
        let mut vm = boot();
        run(&mut vm, ": fact dup 1 > if dup 1 - recurse * then ;");
        assert_eq!(run(&mut vm, "5 fact ."), "120 ");
    }

    #[test]
    fn test_exit_leaves_early() {
        let mut vm = boot();
        run(&mut vm, ": early 1 exit 2 ;");
        run(&mut vm, "early");
        assert_eq!(stack(&vm), vec![DU::from(1)]);
    }
}
