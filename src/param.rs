//////////////////////////////////////////////////////////////
/// Instruction fields
///
/// Every compiled instruction is one u32 (an IU) in the arena:
///
///     bits  0..=28   index       word index, inner opcode, or MAX_OP + builtin number
///     bit   29       exit        return to the caller after this instruction
///     bit   30       immediate   the called word is immediate (kept for SEE)
///     bit   31       colon       index names a dictionary word rather than a primitive
///
/// Inner opcodes that need an operand take it from the cell that follows, the same
/// way LIT is followed by its value: branch targets are absolute arena addresses,
/// string opcodes are followed by the padded byte length and then the bytes.
///
pub const INDEX_MASK: u32 = 0x1FFF_FFFF;
pub const EXIT_BIT: u32 = 1 << 29;
pub const IMMEDIATE_BIT: u32 = 1 << 30;
pub const COLON_BIT: u32 = 1 << 31;

// Inner interpreter opcodes
pub const EXIT: u32 = 0; // return from a colon word
pub const LIT: u32 = 1; // push the packed DU that follows
pub const STR: u32 = 2; // push address and length of the inline string, skip it
pub const DOTSTR: u32 = 3; // emit the inline string, skip it
pub const BRAN: u32 = 4; // jump to target
pub const ZBRAN: u32 = 5; // pop, jump to target if zero
pub const NEXT: u32 = 6; // for..next counter on the return stack
pub const DO: u32 = 7; // move limit and start to the return stack
pub const LOOP: u32 = 8; // bump the do..loop index, jump to target while below limit
pub const VAR: u32 = 9; // push the address of the cell that follows
pub const MAX_OP: u32 = 16; // builtins are numbered from here

pub const OPCODE_NAMES: [&str; 10] = [
    "exit", "lit", "s\"", ".\"", "branch", "0branch", "next", "do", "loop", "var",
];

/// Decoded form of an IU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Param {
    pub index: u32,
    pub exit: bool,
    pub immediate: bool,
    pub colon: bool,
}

impl Param {
    /// A primitive: an inner opcode or a builtin
    pub fn op(index: u32) -> Param {
        Param {
            index,
            ..Param::default()
        }
    }

    pub fn builtin(number: usize) -> Param {
        Param::op(MAX_OP + number as u32)
    }

    /// A call to a colon word by dictionary index
    pub fn call(word: usize, immediate: bool) -> Param {
        Param {
            index: word as u32,
            immediate,
            colon: true,
            exit: false,
        }
    }

    pub fn with_exit(mut self) -> Param {
        self.exit = true;
        self
    }

    /// On a primitive the immediate bit is free; `value` uses it to mark its literal
    pub fn with_immediate(mut self) -> Param {
        self.immediate = true;
        self
    }

    pub fn encode(self) -> u32 {
        let mut iu = self.index & INDEX_MASK;
        if self.exit {
            iu |= EXIT_BIT;
        }
        if self.immediate {
            iu |= IMMEDIATE_BIT;
        }
        if self.colon {
            iu |= COLON_BIT;
        }
        iu
    }

    pub fn decode(iu: u32) -> Param {
        Param {
            index: iu & INDEX_MASK,
            exit: iu & EXIT_BIT != 0,
            immediate: iu & IMMEDIATE_BIT != 0,
            colon: iu & COLON_BIT != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::{prop_assert_eq, proptest};

    #[test]
    fn test_field_positions() {
        let p = Param::call(5, true).with_exit();
        assert_eq!(p.encode(), 5 | EXIT_BIT | IMMEDIATE_BIT | COLON_BIT);
        assert_eq!(Param::op(LIT).encode(), 1);
        assert_eq!(Param::builtin(3).encode(), MAX_OP + 3);
        assert_eq!(Param::decode(COLON_BIT).index, 0);
        assert!(Param::decode(COLON_BIT).colon);
    }

    #[test]
    fn test_value_mark() {
        let p = Param::op(LIT).with_exit().with_immediate();
        assert_eq!(p.encode(), LIT | EXIT_BIT | IMMEDIATE_BIT);
        assert_ne!(p, Param::op(LIT).with_exit());
        assert!(!Param::decode(p.encode()).colon);
    }

    #[test]
    fn test_index_is_masked() {
        let p = Param::op(INDEX_MASK + 1);
        assert_eq!(p.encode() & INDEX_MASK, 0);
    }

    proptest! {
        #[test]
        fn every_pattern_round_trips(iu: u32) {
            prop_assert_eq!(Param::decode(iu).encode(), iu);
        }

        #[test]
        fn fields_round_trip(index in 0u32..=INDEX_MASK, exit: bool, immediate: bool, colon: bool) {
            let p = Param { index, exit, immediate, colon };
            prop_assert_eq!(Param::decode(p.encode()), p);
        }
    }
}
