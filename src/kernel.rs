//////////////////////////////////////////////////////////////
/// Forth Interpreter Kernel
///
/// This module holds the data structures every VM instance shares: the arena that
/// stores compiled code, literals and strings, and the dictionary of words that
/// points into it. Nothing outside this module places bytes in the arena.
///
/// The arena is append-only. The only ways to move the high-water mark back are
/// forget() and abandoning an unfinished definition, both of which truncate.
///
use crate::error::{ForthError, Result};
use crate::param::{Param, LIT};
use crate::runtime::ForthRuntime;
use crate::value::{Packed, DU};

pub const ALIGN: usize = 4; // alignment unit for cells and strings
pub const CELL: usize = 4; // size of an IU and of a packed DU

/// Round up to the alignment unit
pub fn align(n: usize) -> usize {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

/// Native code for a builtin word
pub type BuiltinCode = fn(&mut ForthRuntime) -> Result<()>;

/// The internal format for builtins: a name, code pointer, and documentation string for use by SEE
pub struct BuiltInFn {
    pub name: String,
    pub code: BuiltinCode,
    pub doc: String,
}

/// Fixed capacity byte region holding all compiled bodies
#[derive(Debug)]
pub struct Arena {
    mem: Vec<u8>,
    capacity: usize,
}

impl Arena {
    pub fn new(capacity: usize) -> Arena {
        Arena {
            mem: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// First free byte
    pub fn here(&self) -> usize {
        self.mem.len()
    }

    pub fn free(&self) -> usize {
        self.capacity - self.mem.len()
    }

    /// append_bytes copies raw bytes to HERE and returns where they landed
    pub fn append_bytes(&mut self, bytes: &[u8]) -> Result<usize> {
        if bytes.len() > self.free() {
            return Err(ForthError::ArenaExhausted {
                need: bytes.len(),
                free: self.free(),
            });
        }
        let at = self.here();
        self.mem.extend_from_slice(bytes);
        Ok(at)
    }

    pub fn append_instruction(&mut self, p: Param) -> Result<usize> {
        self.append_bytes(&p.encode().to_le_bytes())
    }

    pub fn append_du(&mut self, du: DU) -> Result<usize> {
        self.append_bytes(&Packed::pack(du)?.to_le_bytes())
    }

    /// append_literal compiles LIT followed by the packed value
    pub fn append_literal(&mut self, du: DU, exit: bool) -> Result<usize> {
        self.ensure(2 * CELL)?;
        let lit = if exit {
            Param::op(LIT).with_exit()
        } else {
            Param::op(LIT)
        };
        let at = self.append_instruction(lit)?;
        self.append_du(du)?;
        Ok(at)
    }

    /// append_cell writes a raw operand cell (branch target, string length)
    pub fn append_cell(&mut self, cell: u32) -> Result<usize> {
        self.append_bytes(&cell.to_le_bytes())
    }

    /// append_branch compiles a branching opcode and its target cell, returning the cell's address
    pub fn append_branch(&mut self, op: u32, target: usize) -> Result<usize> {
        self.ensure(2 * CELL)?;
        self.append_instruction(Param::op(op))?;
        self.append_cell(target as u32)
    }

    /// append_str compiles a string opcode, a cell holding the padded length,
    /// then the bytes, a NUL, and padding up to the alignment unit.
    ///
    pub fn append_str(&mut self, op: u32, s: &str) -> Result<usize> {
        let padded = align(s.len() + 1);
        self.ensure(2 * CELL + padded)?;
        let at = self.append_instruction(Param::op(op))?;
        self.append_cell(padded as u32)?;
        let mut bytes = s.as_bytes().to_vec();
        bytes.resize(padded, 0);
        self.append_bytes(&bytes)?;
        Ok(at)
    }

    /// Rewrite a cell already in the arena, used to resolve forward branches
    pub fn patch_cell(&mut self, addr: usize, value: u32) -> Result<()> {
        let cell = self.cell_mut(addr)?;
        cell.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn fetch_cell(&self, addr: usize) -> Result<u32> {
        let cell = self.cell(addr)?;
        Ok(u32::from_le_bytes([cell[0], cell[1], cell[2], cell[3]]))
    }

    pub fn fetch_du(&self, addr: usize) -> Result<DU> {
        Packed(self.fetch_cell(addr)?).unpack()
    }

    pub fn store_du(&mut self, addr: usize, du: DU) -> Result<()> {
        let packed = Packed::pack(du)?;
        let cell = self.cell_mut(addr)?;
        cell.copy_from_slice(&packed.to_le_bytes());
        Ok(())
    }

    /// Inline string of padded length `len` at addr, without its NUL padding
    pub fn fetch_str(&self, addr: usize, len: usize) -> Result<String> {
        let bytes = addr
            .checked_add(len)
            .and_then(|end| self.mem.get(addr..end))
            .ok_or(ForthError::InvalidAddress(addr))?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(len);
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    pub fn truncate(&mut self, here: usize) {
        self.mem.truncate(here);
    }

    fn ensure(&self, need: usize) -> Result<()> {
        if need > self.free() {
            return Err(ForthError::ArenaExhausted {
                need,
                free: self.free(),
            });
        }
        Ok(())
    }

    fn cell(&self, addr: usize) -> Result<&[u8]> {
        addr.checked_add(CELL)
            .and_then(|end| self.mem.get(addr..end))
            .ok_or(ForthError::InvalidAddress(addr))
    }

    fn cell_mut(&mut self, addr: usize) -> Result<&mut [u8]> {
        addr.checked_add(CELL)
            .and_then(|end| self.mem.get_mut(addr..end))
            .ok_or(ForthError::InvalidAddress(addr))
    }
}

/// A dictionary entry
#[derive(Debug, Clone, PartialEq)]
pub struct Word {
    pub name: String,
    pub immediate: bool,
    pub pfa: usize,           // start of the body in the arena
    pub prim: Option<usize>,  // builtin number for native words
    pub here: usize,          // arena HERE when the entry was made; forget truncates to it
}

/// Dictionary length and arena HERE at some point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mark {
    pub words: usize,
    pub here: usize,
}

/// Ordered word list plus the arena it indexes, shared by every instance
pub struct Dictionary {
    words: Vec<Word>,
    arena: Arena,
    builtins: Vec<BuiltInFn>,
    pending: Option<Word>,
    fence: Mark,
}

impl Dictionary {
    pub fn new(arena_size: usize) -> Dictionary {
        Dictionary {
            words: Vec::new(),
            arena: Arena::new(arena_size),
            builtins: Vec::new(),
            pending: None,
            fence: Mark::default(),
        }
    }

    /// add_builtin registers native code and the word that names it
    pub fn add_builtin(&mut self, name: &str, code: BuiltinCode, doc: &str, immediate: bool) -> usize {
        self.builtins.push(BuiltInFn {
            name: name.to_string(),
            code,
            doc: doc.to_string(),
        });
        self.words.push(Word {
            name: name.to_string(),
            immediate,
            pfa: self.arena.here(),
            prim: Some(self.builtins.len() - 1),
            here: self.arena.here(),
        });
        self.words.len() - 1
    }

    /// add_word creates a word whose body is laid down by `build`, visible at once.
    ///     Used for constants, variables and values; colon words go through begin/end.
    ///     A failed build leaves neither a word nor stray bytes behind.
    ///
    pub fn add_word<F>(&mut self, name: &str, immediate: bool, build: F) -> Result<usize>
    where
        F: FnOnce(&mut Arena) -> Result<()>,
    {
        let pfa = self.arena.here();
        if let Err(e) = build(&mut self.arena) {
            self.arena.truncate(pfa);
            return Err(e);
        }
        self.words.push(Word {
            name: name.to_string(),
            immediate,
            pfa,
            prim: None,
            here: pfa,
        });
        Ok(self.words.len() - 1)
    }

    /// add_alias gives an existing word a second name sharing its body.
    ///     The alias owns no arena bytes, so forgetting it keeps the target's body.
    ///
    pub fn add_alias(&mut self, name: &str, index: usize) -> Result<usize> {
        let target = self
            .words
            .get(index)
            .cloned()
            .ok_or(ForthError::InvalidAddress(index))?;
        self.words.push(Word {
            name: name.to_string(),
            here: self.arena.here(),
            ..target
        });
        Ok(self.words.len() - 1)
    }

    /// Open a colon definition. The word stays invisible to find() until end().
    pub fn begin(&mut self, name: &str) -> Result<()> {
        if let Some(open) = &self.pending {
            return Err(ForthError::NestedDefinition(open.name.clone()));
        }
        self.pending = Some(Word {
            name: name.to_string(),
            immediate: false,
            pfa: self.arena.here(),
            prim: None,
            here: self.arena.here(),
        });
        Ok(())
    }

    /// Publish the open definition, returning its index
    pub fn end(&mut self) -> Result<usize> {
        let word = self
            .pending
            .take()
            .ok_or_else(|| ForthError::CompileOnly(";".to_string()))?;
        self.words.push(word);
        Ok(self.words.len() - 1)
    }

    /// Drop an unfinished definition along with everything it compiled
    pub fn abandon(&mut self) {
        if let Some(word) = self.pending.take() {
            self.arena.truncate(word.pfa);
        }
    }

    pub fn pending(&self) -> Option<&Word> {
        self.pending.as_ref()
    }

    /// Index the open definition will get once published
    pub fn next_index(&self) -> usize {
        self.words.len()
    }

    /// find scans from the newest word back, so redefinitions shadow older ones
    pub fn find(&self, name: &str, ucase: bool) -> Option<usize> {
        self.words.iter().rposition(|w| {
            if ucase {
                w.name.eq_ignore_ascii_case(name)
            } else {
                w.name == name
            }
        })
    }

    pub fn word(&self, index: usize) -> Option<&Word> {
        self.words.get(index)
    }

    pub fn words(&self) -> &[Word] {
        &self.words
    }

    pub fn last_word_mut(&mut self) -> Option<&mut Word> {
        self.words.last_mut()
    }

    pub fn builtin(&self, n: usize) -> Option<&BuiltInFn> {
        self.builtins.get(n)
    }

    /// Builtin number by its native name, ignoring any user word that shadows it
    pub fn builtin_number(&self, name: &str) -> Option<usize> {
        self.builtins.iter().position(|b| b.name == name)
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut Arena {
        &mut self.arena
    }

    pub fn mark(&self) -> Mark {
        Mark {
            words: self.words.len(),
            here: self.arena.here(),
        }
    }

    /// forget discards every word and every arena byte defined after the mark
    pub fn forget(&mut self, mark: Mark) {
        self.words.truncate(mark.words);
        self.arena.truncate(mark.here);
    }

    /// Everything at or below the fence survives FORGET
    pub fn set_fence(&mut self) {
        self.fence = self.mark();
    }

    /// FORGET <name>: remove the word and everything defined after it
    pub fn forget_word(&mut self, name: &str, ucase: bool) -> Result<()> {
        let index = self
            .find(name, ucase)
            .ok_or_else(|| ForthError::UndefinedWord(name.to_string()))?;
        if index < self.fence.words {
            return Err(ForthError::ForgetProtected(name.to_string()));
        }
        let here = self.words[index].here;
        self.forget(Mark { words: index, here });
        Ok(())
    }
}
