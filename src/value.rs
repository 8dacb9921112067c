//////////////////////////////////////////////////////////////
/// Value cells
///
/// A DU is the unit carried by the stacks and stored in compiled literals.
/// It is either a plain real number or a handle naming an object owned by the
/// object layer. Stacks hold the enum form; the arena holds the packed form.
///
/// Packed layout (one u32):
///
///     numbers     IEEE-754 single precision bits, every NaN folded to 0x7FC0_0000
///     handles     0xFFA0_0000 | index        (sign, all-ones exponent, quiet bit clear, tag bit set)
///     reserved    any other negative signalling NaN, rejected on unpack
///
use crate::error::{ForthError, Result};
use std::fmt;

pub const CANONICAL_NAN: u32 = 0x7FC0_0000;
pub const HANDLE_TAG: u32 = 0xFFA0_0000;
pub const HANDLE_MASK: u32 = 0x001F_FFFF; // 21 bits of object index
const SNAN_NEG_MASK: u32 = 0xFFE0_0000; // sign, exponent, quiet and tag bits
const SNAN_NEG: u32 = 0xFF80_0000;

/// The value cell
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DU {
    Number(f32),
    Handle(u32),
}

impl Default for DU {
    fn default() -> Self {
        DU::Number(0.0)
    }
}

impl DU {
    /// encode_handle wraps an object index, refusing indices the packed form cannot carry
    pub fn encode_handle(index: u32) -> Result<DU> {
        if index > HANDLE_MASK {
            return Err(ForthError::HandleOutOfRange(index));
        }
        Ok(DU::Handle(index))
    }

    /// checked passes numbers through and range-checks handles
    pub fn checked(self) -> Result<DU> {
        match self {
            DU::Handle(index) => DU::encode_handle(index),
            number => Ok(number),
        }
    }

    /// decode_handle returns the object index of a handle; plain numbers are not objects
    pub fn decode_handle(self) -> Result<u32> {
        match self {
            DU::Handle(index) => Ok(index),
            DU::Number(_) => Err(ForthError::NotAnObject),
        }
    }

    pub fn is_handle(&self) -> bool {
        matches!(self, DU::Handle(_))
    }

    pub fn number(self) -> Result<f32> {
        match self {
            DU::Number(n) => Ok(n),
            DU::Handle(_) => Err(ForthError::NotANumber),
        }
    }

    /// Truncating integer view, used by logic words, counters and radix printing
    pub fn int(self) -> Result<i32> {
        Ok(self.number()? as i32)
    }

    /// Arena address view; negative or fractional values are rejected
    pub fn addr(self) -> Result<usize> {
        let n = self.number()?;
        if n < 0.0 || n.fract() != 0.0 {
            return Err(ForthError::InvalidAddress(n.max(0.0) as usize));
        }
        Ok(n as usize)
    }

    pub fn is_integral(&self) -> bool {
        match self {
            DU::Number(n) => n.is_finite() && n.fract() == 0.0,
            DU::Handle(_) => false,
        }
    }

    /// Forth truth: zero is false, everything else true
    pub fn truthy(&self) -> bool {
        match self {
            DU::Number(n) => *n != 0.0,
            DU::Handle(_) => true,
        }
    }

    pub fn flag(b: bool) -> DU {
        DU::Number(if b { -1.0 } else { 0.0 })
    }
}

impl From<f32> for DU {
    fn from(n: f32) -> Self {
        DU::Number(n)
    }
}

impl From<i32> for DU {
    fn from(n: i32) -> Self {
        DU::Number(n as f32)
    }
}

impl From<usize> for DU {
    fn from(n: usize) -> Self {
        DU::Number(n as f32)
    }
}

impl fmt::Display for DU {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DU::Number(n) if self.is_integral() => write!(f, "{}", *n as i64),
            DU::Number(n) => write!(f, "{n}"),
            DU::Handle(i) => write!(f, "<obj {i}>"),
        }
    }
}

/// Single-width packed form of a DU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packed(pub u32);

impl Packed {
    /// pack fails for a handle whose index does not fit the tag's payload
    pub fn pack(du: DU) -> Result<Packed> {
        match du {
            DU::Number(n) if n.is_nan() => Ok(Packed(CANONICAL_NAN)),
            DU::Number(n) => Ok(Packed(n.to_bits())),
            DU::Handle(index) => DU::encode_handle(index).map(|_| Packed(HANDLE_TAG | index)),
        }
    }

    pub fn is_handle(self) -> bool {
        self.0 & SNAN_NEG_MASK == HANDLE_TAG
    }

    /// unpack recovers the cell; reserved patterns mean the arena has been corrupted
    pub fn unpack(self) -> Result<DU> {
        let bits = self.0;
        if self.is_handle() {
            Ok(DU::Handle(bits & HANDLE_MASK))
        } else if bits & SNAN_NEG_MASK == SNAN_NEG && bits & HANDLE_MASK != 0 {
            Err(ForthError::InvalidHandleDecode(bits))
        } else {
            Ok(DU::Number(f32::from_bits(bits)))
        }
    }

    pub fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::{prop_assert, prop_assert_eq, proptest};

    fn same(a: DU, b: DU) -> bool {
        match (a, b) {
            (DU::Number(x), DU::Number(y)) => x.to_bits() == y.to_bits() || (x.is_nan() && y.is_nan()),
            (DU::Handle(x), DU::Handle(y)) => x == y,
            _ => false,
        }
    }

    #[test]
    fn test_boundary_numbers_are_not_handles() {
        let edges = [
            0.0f32,
            -0.0,
            1.0,
            -1.0,
            f32::MAX,
            f32::MIN,
            f32::MIN_POSITIVE,
            -f32::MIN_POSITIVE,
            f32::EPSILON,
            f32::from_bits(1),          // smallest subnormal
            f32::from_bits(0x8000_0001), // negative subnormal
            f32::INFINITY,
            f32::NEG_INFINITY,
            f32::NAN,
            -f32::NAN,
            0.0f32 / 0.0,
        ];
        for n in edges {
            let p = Packed::pack(DU::Number(n)).unwrap();
            assert!(!p.is_handle(), "{n} packed as a handle");
            let back = p.unpack().unwrap();
            assert!(!back.is_handle());
            assert!(same(back, DU::Number(n)), "{n} did not round-trip");
        }
    }

    #[test]
    fn test_negative_zero_keeps_sign() {
        let back = Packed::pack(DU::Number(-0.0)).unwrap().unpack().unwrap();
        match back {
            DU::Number(n) => assert!(n == 0.0 && n.is_sign_negative()),
            _ => panic!("negative zero became a handle"),
        }
    }

    #[test]
    fn test_handle_range() {
        assert_eq!(DU::encode_handle(0).unwrap(), DU::Handle(0));
        assert_eq!(DU::encode_handle(HANDLE_MASK).unwrap(), DU::Handle(HANDLE_MASK));
        assert!(matches!(
            DU::encode_handle(HANDLE_MASK + 1),
            Err(ForthError::HandleOutOfRange(_))
        ));
        assert_eq!(Packed::pack(DU::Handle(0)).unwrap().0, 0xFFA0_0000);
    }

    #[test]
    fn test_out_of_range_handles_never_pack() {
        for index in [HANDLE_MASK + 1, HANDLE_MASK + 4, u32::MAX] {
            assert!(matches!(
                Packed::pack(DU::Handle(index)),
                Err(ForthError::HandleOutOfRange(i)) if i == index
            ));
            assert!(DU::Handle(index).checked().is_err());
        }
        assert_eq!(DU::from(3).checked().unwrap(), DU::from(3));
        assert_eq!(DU::Handle(5).checked().unwrap(), DU::Handle(5));
    }

    #[test]
    fn test_decode_number_is_not_an_object() {
        assert!(matches!(DU::Number(3.0).decode_handle(), Err(ForthError::NotAnObject)));
    }

    #[test]
    fn test_reserved_patterns_are_fatal() {
        for bits in [0xFF80_0001u32, 0xFF9F_FFFF, 0xFF81_2345] {
            let err = Packed(bits).unpack().unwrap_err();
            assert!(matches!(err, ForthError::InvalidHandleDecode(b) if b == bits));
            assert!(err.is_fatal());
        }
        // negative infinity sits right next to the reserved space
        assert_eq!(Packed(0xFF80_0000).unpack().unwrap(), DU::Number(f32::NEG_INFINITY));
    }

    #[test]
    fn test_display() {
        assert_eq!(DU::from(9).to_string(), "9");
        assert_eq!(DU::from(-2.5f32).to_string(), "-2.5");
        assert_eq!(DU::Handle(7).to_string(), "<obj 7>");
    }

    #[test]
    fn test_addr() {
        assert_eq!(DU::from(12).addr().unwrap(), 12);
        assert!(DU::from(-4).addr().is_err());
        assert!(DU::from(1.5f32).addr().is_err());
    }

    proptest! {
        #[test]
        fn handles_round_trip(index in 0u32..=HANDLE_MASK) {
            let du = DU::encode_handle(index).unwrap();
            prop_assert_eq!(du.decode_handle().unwrap(), index);
            let packed = Packed::pack(du).unwrap();
            prop_assert!(packed.is_handle());
            prop_assert_eq!(packed.unpack().unwrap(), du);
        }

        #[test]
        fn numbers_never_alias_handles(bits: u32) {
            let n = f32::from_bits(bits);
            let packed = Packed::pack(DU::Number(n)).unwrap();
            prop_assert!(!packed.is_handle());
            let back = packed.unpack().unwrap();
            prop_assert!(same(back, DU::Number(n)));
        }

        #[test]
        fn arithmetic_stays_numeric(a: f32, b: f32) {
            for r in [a + b, a - b, a * b, a / b] {
                prop_assert!(!Packed::pack(DU::Number(r)).unwrap().is_handle());
            }
        }
    }
}
