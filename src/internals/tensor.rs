/// Object layer words
///
/// Tensors, datasets and models live outside the VM. Stacks only ever see their
/// handles; the arithmetic is done by whatever ObjectStore the host plugs in.
/// Element-wise functions still work on plain numbers without a store.
///
/// Every handle a store hands back is range checked before it reaches a stack.
///
use crate::error::{ForthError, Result};
use crate::runtime::ForthRuntime;
use crate::value::DU;

/// Operation selector passed to the math collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorOp {
    Add,
    Sub,
    Mul,
    Div,
    MatMul,
    Inverse,
    Transpose,
    Exp,
    Ln,
    Tanh,
    Relu,
    Sigmoid,
    Sum,
    Avg,
    Vector,   // ( n -- t )
    Matrix,   // ( h w -- t )
    Fill,     // ( t n -- t ) in place
    Identity, // ( t -- t ) in place
    Solve,    // ( b a -- x )
    Det,
    Lu,
    Triu,
    Tril,
    Assign,   // ( t n1 .. nk -- t ) operands gathered by `}`
}

impl TensorOp {
    /// Operands taken from the stack
    pub fn arity(self) -> usize {
        match self {
            TensorOp::Add
            | TensorOp::Sub
            | TensorOp::Mul
            | TensorOp::Div
            | TensorOp::MatMul
            | TensorOp::Matrix
            | TensorOp::Fill
            | TensorOp::Solve => 2,
            _ => 1,
        }
    }

    /// The same operation on a plain number, where that makes sense
    pub fn scalar(self, x: f32) -> Option<f32> {
        match self {
            TensorOp::Exp => Some(x.exp()),
            TensorOp::Ln => Some(x.ln()),
            TensorOp::Tanh => Some(x.tanh()),
            TensorOp::Relu => Some(x.max(0.0)),
            TensorOp::Sigmoid => Some(1.0 / (1.0 + (-x).exp())),
            TensorOp::Sum | TensorOp::Avg | TensorOp::Transpose => Some(x),
            TensorOp::Det | TensorOp::Triu | TensorOp::Tril => Some(x),
            _ => None,
        }
    }
}

/// The heap that handles point into. Implementations own every object and
///     must be safe to call from several instances at once.
///
pub trait ObjectStore: Send + Sync {
    /// Run an operation; operands are in stack order, deepest first
    fn apply(&self, op: TensorOp, args: &[DU]) -> Result<DU>;
    /// Release an object
    fn free(&self, handle: u32) -> Result<()>;
    /// Short printable form for `.`
    fn describe(&self, handle: u32) -> String;
}

impl ForthRuntime {
    fn store(&self) -> Result<&dyn ObjectStore> {
        self.objects.as_deref().ok_or(ForthError::NoObjectLayer)
    }

    /// object_op pops the operands of op and pushes the result.
    ///     Plain numbers are handled here when the operation allows it,
    ///     anything involving a handle goes to the store.
    ///
    pub fn object_op(&mut self, op: TensorOp) -> Result<()> {
        let mut args = Vec::with_capacity(op.arity());
        for _ in 0..op.arity() {
            args.push(self.pop()?);
        }
        args.reverse();
        if let [DU::Number(x)] = args[..] {
            if let Some(y) = op.scalar(x) {
                return self.push(DU::Number(y));
            }
        }
        let result = self.store()?.apply(op, &args)?.checked()?;
        tracing::trace!(instance = self.id, ?op, ?result, "object op");
        self.push(result)
    }

    pub fn f_vector(&mut self) -> Result<()> {
        self.object_op(TensorOp::Vector)
    }

    pub fn f_matrix(&mut self) -> Result<()> {
        self.object_op(TensorOp::Matrix)
    }

    pub fn f_fill(&mut self) -> Result<()> {
        self.object_op(TensorOp::Fill)
    }

    pub fn f_eye(&mut self) -> Result<()> {
        self.object_op(TensorOp::Identity)
    }

    pub fn f_solve(&mut self) -> Result<()> {
        self.object_op(TensorOp::Solve)
    }

    pub fn f_det(&mut self) -> Result<()> {
        self.object_op(TensorOp::Det)
    }

    pub fn f_lu(&mut self) -> Result<()> {
        self.object_op(TensorOp::Lu)
    }

    pub fn f_triu(&mut self) -> Result<()> {
        self.object_op(TensorOp::Triu)
    }

    pub fn f_tril(&mut self) -> Result<()> {
        self.object_op(TensorOp::Tril)
    }

    /// { ( t -- t ) numbers pushed from here on are destined for t
    pub fn f_tensor_open(&mut self) -> Result<()> {
        if self.ten_mark.is_some() {
            return Err(ForthError::UnbalancedControl("{".to_string()));
        }
        self.top()?.decode_handle()?;
        self.ten_mark = Some(self.ss.depth());
        Ok(())
    }

    /// } ( t n1 .. nk -- t ) hand the numbers since `{` to the store, row by row
    pub fn f_tensor_close(&mut self) -> Result<()> {
        let mark = self
            .ten_mark
            .take()
            .ok_or_else(|| ForthError::UnbalancedControl("}".to_string()))?;
        let count = self.ss.depth().checked_sub(mark).ok_or(ForthError::StackUnderflow)?;
        let mut args = Vec::with_capacity(count + 1);
        for _ in 0..=count {
            args.push(self.pop()?);
        }
        args.reverse();
        let result = self.store()?.apply(TensorOp::Assign, &args)?.checked()?;
        tracing::trace!(instance = self.id, values = count, "tensor literal");
        self.push(result)
    }

    pub fn f_matmul(&mut self) -> Result<()> {
        self.object_op(TensorOp::MatMul)
    }

    pub fn f_inverse(&mut self) -> Result<()> {
        self.object_op(TensorOp::Inverse)
    }

    pub fn f_transpose(&mut self) -> Result<()> {
        self.object_op(TensorOp::Transpose)
    }

    pub fn f_exp(&mut self) -> Result<()> {
        self.object_op(TensorOp::Exp)
    }

    pub fn f_ln(&mut self) -> Result<()> {
        self.object_op(TensorOp::Ln)
    }

    pub fn f_tanh(&mut self) -> Result<()> {
        self.object_op(TensorOp::Tanh)
    }

    pub fn f_relu(&mut self) -> Result<()> {
        self.object_op(TensorOp::Relu)
    }

    pub fn f_sigmoid(&mut self) -> Result<()> {
        self.object_op(TensorOp::Sigmoid)
    }

    pub fn f_sum(&mut self) -> Result<()> {
        self.object_op(TensorOp::Sum)
    }

    pub fn f_avg(&mut self) -> Result<()> {
        self.object_op(TensorOp::Avg)
    }

    /// free ( h -- ) release the object behind a handle
    pub fn f_free(&mut self) -> Result<()> {
        let h = self.pop()?.decode_handle()?;
        self.store()?.free(h)
    }
}
