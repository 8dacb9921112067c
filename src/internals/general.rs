// General-purpose builtin words

use crate::error::{ForthError, Result};
use crate::internals::tensor::TensorOp;
use crate::runtime::ForthRuntime;
use crate::value::DU;

impl ForthRuntime {
    /// Arithmetic that hands off to the object layer when a handle is involved
    fn arith(&mut self, op: TensorOp, f: fn(f32, f32) -> f32) -> Result<()> {
        let j = self.pop()?;
        let k = self.pop()?;
        if j.is_handle() || k.is_handle() {
            self.push(k)?;
            self.push(j)?;
            return self.object_op(op);
        }
        self.push(DU::Number(f(k.number()?, j.number()?)))
    }

    /// Basic Forth operations on the stack.
    ///
    pub fn f_plus(&mut self) -> Result<()> {
        self.arith(TensorOp::Add, |a, b| a + b)
    }

    pub fn f_minus(&mut self) -> Result<()> {
        self.arith(TensorOp::Sub, |a, b| a - b)
    }

    pub fn f_times(&mut self) -> Result<()> {
        self.arith(TensorOp::Mul, |a, b| a * b)
    }

    pub fn f_divide(&mut self) -> Result<()> {
        if self.top()? == DU::Number(0.0) {
            return Err(ForthError::DivideByZero);
        }
        self.arith(TensorOp::Div, |a, b| a / b)
    }

    pub fn f_mod(&mut self) -> Result<()> {
        if self.top()?.number()? == 0.0 {
            return Err(ForthError::DivideByZero);
        }
        self.pop2_push1(|a, b| a % b)
    }

    pub fn f_negate(&mut self) -> Result<()> {
        self.pop1_push1(|a| -a)
    }

    pub fn f_abs(&mut self) -> Result<()> {
        self.pop1_push1(f32::abs)
    }

    /// floor ( n -- n' ) round toward negative infinity
    pub fn f_floor(&mut self) -> Result<()> {
        self.pop1_push1(f32::floor)
    }

    pub fn f_max(&mut self) -> Result<()> {
        self.pop2_push1(f32::max)
    }

    pub fn f_min(&mut self) -> Result<()> {
        self.pop2_push1(f32::min)
    }

    pub fn f_equal(&mut self) -> Result<()> {
        let j = self.pop()?;
        let k = self.pop()?;
        self.push(DU::flag(j == k))
    }

    pub fn f_less(&mut self) -> Result<()> {
        self.pop2_push1(|a, b| if a < b { -1.0 } else { 0.0 })
    }

    pub fn f_greater(&mut self) -> Result<()> {
        self.pop2_push1(|a, b| if a > b { -1.0 } else { 0.0 })
    }

    pub fn f_0equal(&mut self) -> Result<()> {
        let v = self.pop()?;
        self.push(DU::flag(!v.truthy()))
    }

    pub fn f_0less(&mut self) -> Result<()> {
        self.pop1_push1(|a| if a < 0.0 { -1.0 } else { 0.0 })
    }

    /// Bitwise words work on the integer part
    fn bitwise(&mut self, f: fn(i32, i32) -> i32) -> Result<()> {
        let j = self.pop_int()?;
        let k = self.pop_int()?;
        self.push(DU::from(f(k, j)))
    }

    pub fn f_and(&mut self) -> Result<()> {
        self.bitwise(|a, b| a & b)
    }

    pub fn f_or(&mut self) -> Result<()> {
        self.bitwise(|a, b| a | b)
    }

    pub fn f_xor(&mut self) -> Result<()> {
        self.bitwise(|a, b| a ^ b)
    }

    pub fn f_not(&mut self) -> Result<()> {
        let n = self.pop_int()?;
        self.push(DU::from(!n))
    }

    pub fn f_dup(&mut self) -> Result<()> {
        let top = self.top()?;
        self.push(top)
    }

    pub fn f_drop(&mut self) -> Result<()> {
        self.pop().map(|_| ())
    }

    pub fn f_swap(&mut self) -> Result<()> {
        let a = self.pop()?;
        let b = self.pop()?;
        self.push(a)?;
        self.push(b)
    }

    pub fn f_over(&mut self) -> Result<()> {
        let second = self.ss.peek(1).map_err(|_| ForthError::StackUnderflow)?;
        self.push(second)
    }

    pub fn f_rot(&mut self) -> Result<()> {
        let first = self.pop()?;
        let second = self.pop()?;
        let third = self.pop()?;
        self.push(second)?;
        self.push(first)?;
        self.push(third)
    }

    /// pick ( ... n -- ... v ) 0 pick is dup
    pub fn f_pick(&mut self) -> Result<()> {
        let n = self.pop()?.addr()?;
        let v = self.ss.peek(n).map_err(|_| ForthError::StackUnderflow)?;
        self.push(v)
    }

    pub fn f_q_dup(&mut self) -> Result<()> {
        let top = self.top()?;
        if top.truthy() {
            self.push(top)?;
        }
        Ok(())
    }

    pub fn f_nip(&mut self) -> Result<()> {
        let top = self.pop()?;
        self.pop()?;
        self.push(top)
    }

    pub fn f_stack_depth(&mut self) -> Result<()> {
        let depth = self.ss.depth();
        self.push(DU::from(depth))
    }

    pub fn f_to_r(&mut self) -> Result<()> {
        let v = self.pop()?;
        self.rpush(v)
    }

    pub fn f_r_from(&mut self) -> Result<()> {
        let v = self.rpop()?;
        self.push(v)
    }

    /// r@ and i ( -- n ) copy the top of the return stack
    pub fn f_r_get(&mut self) -> Result<()> {
        let v = self.rs.peek(0).map_err(|_| ForthError::ReturnStackUnderflow)?;
        self.push(v)
    }

    /// @ ( a -- n ) fetch a cell from the arena
    pub fn f_get(&mut self) -> Result<()> {
        let addr = self.pop()?.addr()?;
        let v = self.dict().arena().fetch_du(addr)?;
        self.push(v)
    }

    /// ! ( n a -- ) store into an existing arena cell
    pub fn f_store(&mut self) -> Result<()> {
        let addr = self.pop()?.addr()?;
        let v = self.pop()?;
        self.dict.write().arena_mut().store_du(addr, v)
    }

    pub fn f_here(&mut self) -> Result<()> {
        let here = self.here();
        self.push(DU::from(here))
    }

    /// , ( n -- ) append a cell at HERE
    pub fn f_comma(&mut self) -> Result<()> {
        let v = self.pop()?;
        self.compiling(|d| d.arena_mut().append_du(v).map(|_| ()))
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ForthError;
    use crate::runtime::tests::{boot, run, stack};
    use crate::runtime::VmStatus;
    use crate::value::DU;

    fn nums(v: &[f32]) -> Vec<DU> {
        v.iter().map(|n| DU::Number(*n)).collect()
    }

    #[test]
    fn test_arithmetic() {
        let mut vm = boot();
        run(&mut vm, "2 3 + 10 4 - 6 7 * 7 2 / 7 3 mod");
        assert_eq!(stack(&vm), nums(&[5.0, 6.0, 42.0, 3.5, 1.0]));
    }

    #[test]
    fn test_unary_and_minmax() {
        let mut vm = boot();
        run(&mut vm, "5 negate -4 abs 3 9 max 3 9 min -2.5 floor 2.5 floor");
        assert_eq!(stack(&vm), nums(&[-5.0, 4.0, 9.0, 3.0, -3.0, 2.0]));
    }

    #[test]
    fn test_divide_by_zero() {
        let mut vm = boot();
        assert_eq!(run(&mut vm, "1 0 mod"), format!("{}\n", ForthError::DivideByZero));
    }

    #[test]
    fn test_comparisons() {
        let mut vm = boot();
        run(&mut vm, "1 2 < 2 1 < 2 1 > 3 3 = 0 0= 5 0= -1 0<");
        assert_eq!(stack(&vm), nums(&[-1.0, 0.0, -1.0, -1.0, -1.0, 0.0, -1.0]));
    }

    #[test]
    fn test_logic() {
        let mut vm = boot();
        run(&mut vm, "12 10 and 12 10 or 12 10 xor 0 not");
        assert_eq!(stack(&vm), nums(&[8.0, 14.0, 6.0, -1.0]));
    }

    #[test]
    fn test_stack_words() {
        let mut vm = boot();
        run(&mut vm, "1 2 swap over rot");
        assert_eq!(stack(&vm), nums(&[1.0, 2.0, 2.0]));
        run(&mut vm, "drop drop 0 ?dup 7 ?dup nip depth");
        assert_eq!(stack(&vm), nums(&[1.0, 0.0, 7.0, 3.0]));
        run(&mut vm, "3 pick");
        assert_eq!(vm.top().unwrap(), DU::from(1));
    }

    #[test]
    fn test_underflow_is_reported() {
        let mut vm = boot();
        assert_eq!(run(&mut vm, "1 +"), "stack underflow\n");
        assert!(stack(&vm).is_empty());
    }

    #[test]
    fn test_return_stack_words() {
        let mut vm = boot();
        run(&mut vm, ": shuffle >r 10 r@ r> ;");
        run(&mut vm, "5 shuffle");
        assert_eq!(stack(&vm), nums(&[10.0, 5.0, 5.0]));
        assert_eq!(vm.rs.depth(), 0);
    }

    #[test]
    fn test_memory_words() {
        let mut vm = boot();
        run(&mut vm, "here 99 , dup @");
        let s = stack(&vm);
        assert_eq!(s[1], DU::from(99));
        run(&mut vm, "drop 5 swap ! here 4 - @");
        assert_eq!(stack(&vm), nums(&[5.0]));
        assert_eq!(run(&mut vm, "100000 @"), "invalid address 100000\n");
    }

    #[test]
    fn test_huge_addresses_are_reported() {
        let mut vm = boot();
        for line in ["1e30 @", "7 1e30 !", "0 1e30 type", "1e30 0 type", "here 1e30 type"] {
            let out = run(&mut vm, line);
            assert!(out.starts_with("invalid address"), "{line}: {out}");
            assert_eq!(vm.status, VmStatus::Ready);
            assert!(stack(&vm).is_empty());
        }
        assert_eq!(run(&mut vm, "1 2 + ."), "3 ");
    }
}
