// Debugging help

use crate::error::{ForthError, Result};
use crate::kernel::{Dictionary, CELL};
use crate::param::{Param, BRAN, DOTSTR, EXIT, LIT, LOOP, MAX_OP, NEXT, OPCODE_NAMES, STR, VAR, ZBRAN};
use crate::runtime::ForthRuntime;
use std::fmt::Write;

impl ForthRuntime {
    /// show-stack ( -- ) turns on stack printing after every line
    ///
    pub fn f_show_stack(&mut self) -> Result<()> {
        self.show_stack = true;
        Ok(())
    }

    /// hide-stack ( -- ) turns off stack printing after every line
    ///
    pub fn f_hide_stack(&mut self) -> Result<()> {
        self.show_stack = false;
        Ok(())
    }

    /// words ( -- ) list the dictionary, newest first
    pub fn f_words(&mut self) -> Result<()> {
        let mut text = String::new();
        for w in self.dict().words().iter().rev() {
            text.push_str(&w.name);
            text.push(' ');
        }
        text.push('\n');
        self.emit_str(&text);
        Ok(())
    }

    /// see <name> ( -- ) prints the definition of a word
    ///     Taking a postfix word name (normally used interactively), this is the Forth decompiler.
    ///
    pub fn f_see(&mut self) -> Result<()> {
        let name = self
            .input
            .next_idiom(' ')
            .ok_or_else(|| ForthError::MissingName("see".to_string()))?;
        let text = {
            let d = self.dict();
            let w = d
                .find(&name, self.ucase)
                .ok_or_else(|| ForthError::UndefinedWord(name.clone()))?;
            decompile(&d, w)?
        };
        self.emit_str(&text);
        Ok(())
    }
}

/// Reconstruct the source form of word w from its compiled body
pub fn decompile(d: &Dictionary, w: usize) -> Result<String> {
    let word = d.word(w).ok_or(ForthError::InvalidAddress(w))?;
    if let Some(n) = word.prim {
        let doc = d.builtin(n).map(|b| b.doc.as_str()).unwrap_or_default();
        return Ok(format!("Builtin: {doc}\n"));
    }
    let arena = d.arena();
    let head = Param::decode(arena.fetch_cell(word.pfa)?);
    if !head.colon && head.exit {
        let v = arena.fetch_du(word.pfa + CELL)?;
        match head.index {
            LIT if head.immediate => return Ok(format!("Value: {} = {v}\n", word.name)),
            LIT => return Ok(format!("Constant: {} = {v}\n", word.name)),
            VAR => return Ok(format!("Variable: {} = {v}\n", word.name)),
            _ => {}
        }
    }

    // the body runs up to the next definition, or HERE
    let end = d
        .words()
        .iter()
        .map(|o| o.pfa)
        .filter(|&pfa| pfa > word.pfa)
        .min()
        .unwrap_or(arena.here());

    let mut out = format!(": {} ", word.name);
    let mut at = word.pfa;
    while at < end {
        let p = Param::decode(arena.fetch_cell(at)?);
        at += CELL;
        if p.colon {
            let callee = p.index as usize;
            let name = d.word(callee).map(|c| c.name.as_str()).unwrap_or("recurse");
            let _ = write!(out, "{name} ");
            continue;
        }
        match p.index {
            EXIT if at >= end => out.push_str("; "),
            LIT => {
                let _ = write!(out, "{} ", arena.fetch_du(at)?);
                at += CELL;
            }
            STR | DOTSTR => {
                let padded = arena.fetch_cell(at)? as usize;
                let s = arena.fetch_str(at + CELL, padded)?;
                let opener = if p.index == STR { "s\"" } else { ".\"" };
                let _ = write!(out, "{opener} {s}\" ");
                at += CELL + padded;
            }
            BRAN | ZBRAN | NEXT | LOOP => {
                let target = arena.fetch_cell(at)?;
                let _ = write!(out, "{}:{target} ", OPCODE_NAMES[p.index as usize]);
                at += CELL;
            }
            op if op >= MAX_OP => {
                let name = d
                    .builtin((op - MAX_OP) as usize)
                    .map(|b| b.name.as_str())
                    .unwrap_or("?");
                let _ = write!(out, "{name} ");
            }
            op => {
                let name = OPCODE_NAMES.get(op as usize).copied().unwrap_or("?");
                let _ = write!(out, "{name} ");
            }
        }
        if p.exit {
            out.push_str("exit ");
        }
    }
    if word.immediate {
        out.push_str("immediate");
    }
    out.push('\n');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use crate::runtime::tests::{boot, run};

    #[test]
    fn test_see_colon_word() {
        let mut vm = boot();
        run(&mut vm, ": sq dup * ;");
        assert_eq!(run(&mut vm, "see sq"), ": sq dup * ; \n");
        run(&mut vm, ": greet .\" hi\" 7 ; immediate");
        assert_eq!(run(&mut vm, "see greet"), ": greet .\" hi\" 7 ; immediate\n");
    }

    #[test]
    fn test_see_branches_and_exit() {
        let mut vm = boot();
        run(&mut vm, ": f if 1 exit then 2 ;");
        let text = run(&mut vm, "see f");
        assert!(text.starts_with(": f 0branch:"), "{text}");
        assert!(text.contains(" 1 exit 2 ; "), "{text}");
    }

    #[test]
    fn test_see_data_words() {
        let mut vm = boot();
        run(&mut vm, "5 constant five variable v 3 value n");
        assert_eq!(run(&mut vm, "see five"), "Constant: five = 5\n");
        assert_eq!(run(&mut vm, "see n"), "Value: n = 3\n");
        assert_eq!(run(&mut vm, "see v"), "Variable: v = 0\n");
        assert!(run(&mut vm, "see dup").starts_with("Builtin: dup ( n -- n n )"));
        assert_eq!(run(&mut vm, "see nothing"), "nothing ? undefined word\n");
    }

    #[test]
    fn test_words_lists_newest_first() {
        let mut vm = boot();
        run(&mut vm, ": newest ;");
        assert!(run(&mut vm, "words").starts_with("newest "));
    }

    #[test]
    fn test_show_stack_after_each_line() {
        let mut vm = boot();
        run(&mut vm, "show-stack");
        assert_eq!(run(&mut vm, "1 2"), "[ 1 2 ] ");
        run(&mut vm, "hide-stack");
        assert_eq!(run(&mut vm, "3"), "");
    }
}
