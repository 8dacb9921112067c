//////////////////////////////////////////////////////////////
/// Object heap
///
/// The collaborator that handles point into when t4 runs as a console program:
/// a slab of dense f32 tensors of rank one or two, shared by every instance
/// behind one mutex, and a file store that saves them in the three save modes.
///
/// Matrices are row major. A vector of n elements takes part in matrix
/// arithmetic as an n by 1 column.
///
use crate::error::{ForthError, Result};
use crate::internals::files::{Persistence, SaveMode};
use crate::internals::tensor::{ObjectStore, TensorOp};
use crate::value::DU;
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::fs;
use std::sync::Arc;

pub const MAX_ELEMENTS: usize = 1 << 20; // largest tensor the console will allocate
const EPSILON: f32 = 1.0e-6; // pivots below this are treated as zero
const NPY_MAGIC: &[u8] = b"\x93NUMPY";
const DESCRIBE_LIMIT: usize = 16; // show the elements of tensors up to this size

fn fail(op: TensorOp, message: impl Into<String>) -> ForthError {
    ForthError::Collaborator {
        op: format!("{op:?}"),
        message: message.into(),
    }
}

/// A dense rank one or rank two tensor
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn zeros(shape: Vec<usize>) -> Tensor {
        let len = shape.iter().product();
        Tensor {
            shape,
            data: vec![0.0; len],
        }
    }

    pub fn from_rows(rows: usize, cols: usize, data: Vec<f32>) -> Tensor {
        Tensor {
            shape: vec![rows, cols],
            data,
        }
    }

    /// Rows and columns; a vector is a column
    pub fn dims(&self) -> (usize, usize) {
        match self.shape[..] {
            [n] => (n, 1),
            [r, c] => (r, c),
            _ => (self.data.len(), 1),
        }
    }

    /// Same shape, new contents
    fn with_data(&self, data: Vec<f32>) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            data,
        }
    }

    fn square(&self, op: TensorOp) -> Result<usize> {
        match self.shape[..] {
            [r, c] if r == c => Ok(r),
            _ => Err(fail(op, format!("{} is not square", shape_text(&self.shape)))),
        }
    }
}

fn shape_text(shape: &[usize]) -> String {
    let dims: Vec<String> = shape.iter().map(usize::to_string).collect();
    format!("[{}]", dims.join(","))
}

/// Row-reduce `a` (n by n) together with `b` (n by k) until `a` is the identity.
///     On return `b` holds a⁻¹b. Partial pivoting keeps the reduction stable.
///
fn gauss_jordan(op: TensorOp, n: usize, a: &mut [f32], k: usize, b: &mut [f32]) -> Result<()> {
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i * n + col].abs().total_cmp(&a[j * n + col].abs()))
            .unwrap_or(col);
        if a[pivot * n + col].abs() < EPSILON {
            return Err(fail(op, "matrix is singular"));
        }
        if pivot != col {
            for j in 0..n {
                a.swap(pivot * n + j, col * n + j);
            }
            for j in 0..k {
                b.swap(pivot * k + j, col * k + j);
            }
        }
        let p = a[col * n + col];
        for j in 0..n {
            a[col * n + j] /= p;
        }
        for j in 0..k {
            b[col * k + j] /= p;
        }
        for row in (0..n).filter(|&r| r != col) {
            let f = a[row * n + col];
            if f == 0.0 {
                continue;
            }
            for j in 0..n {
                a[row * n + j] -= f * a[col * n + j];
            }
            for j in 0..k {
                b[row * k + j] -= f * b[col * k + j];
            }
        }
    }
    Ok(())
}

fn matmul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (m, k) = a.dims();
    let (k2, n) = b.dims();
    if k != k2 {
        return Err(fail(
            TensorOp::MatMul,
            format!("shape mismatch {} x {}", shape_text(&a.shape), shape_text(&b.shape)),
        ));
    }
    let mut data = vec![0.0; m * n];
    for i in 0..m {
        for j in 0..n {
            data[i * n + j] = (0..k).map(|x| a.data[i * k + x] * b.data[x * n + j]).sum();
        }
    }
    let shape = if b.shape.len() == 1 { vec![m] } else { vec![m, n] };
    Ok(Tensor { shape, data })
}

fn transpose(t: &Tensor) -> Tensor {
    let (r, c) = t.dims();
    let mut data = vec![0.0; r * c];
    for i in 0..r {
        for j in 0..c {
            data[j * r + i] = t.data[i * c + j];
        }
    }
    Tensor::from_rows(c, r, data)
}

fn inverse(t: &Tensor) -> Result<Tensor> {
    let n = t.square(TensorOp::Inverse)?;
    let mut a = t.data.clone();
    let mut inv = Tensor::zeros(vec![n, n]);
    for i in 0..n {
        inv.data[i * n + i] = 1.0;
    }
    gauss_jordan(TensorOp::Inverse, n, &mut a, n, &mut inv.data)?;
    Ok(inv)
}

fn solve(b: &Tensor, a: &Tensor) -> Result<Tensor> {
    let n = a.square(TensorOp::Solve)?;
    let (rows, k) = b.dims();
    if rows != n {
        return Err(fail(
            TensorOp::Solve,
            format!("{} does not match {}", shape_text(&b.shape), shape_text(&a.shape)),
        ));
    }
    let mut m = a.data.clone();
    let mut x = b.clone();
    gauss_jordan(TensorOp::Solve, n, &mut m, k, &mut x.data)?;
    Ok(x)
}

/// Doolittle factors without pivoting: L below the diagonal (its unit diagonal
///     implied), U on and above it
///
fn lu(t: &Tensor) -> Result<Tensor> {
    let n = t.square(TensorOp::Lu)?;
    let mut m = t.data.clone();
    for k in 0..n {
        let p = m[k * n + k];
        if p.abs() < EPSILON {
            return Err(fail(TensorOp::Lu, "zero pivot"));
        }
        for i in k + 1..n {
            let l = m[i * n + k] / p;
            m[i * n + k] = l;
            for j in k + 1..n {
                m[i * n + j] -= l * m[k * n + j];
            }
        }
    }
    Ok(t.with_data(m))
}

/// Determinant by elimination with partial pivoting; a singular matrix gives 0
fn det(t: &Tensor) -> Result<f32> {
    let n = t.square(TensorOp::Det)?;
    let mut m = t.data.clone();
    let mut d = 1.0;
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| m[i * n + col].abs().total_cmp(&m[j * n + col].abs()))
            .unwrap_or(col);
        if m[pivot * n + col] == 0.0 {
            return Ok(0.0);
        }
        if pivot != col {
            for j in 0..n {
                m.swap(pivot * n + j, col * n + j);
            }
            d = -d;
        }
        let p = m[col * n + col];
        d *= p;
        for row in col + 1..n {
            let f = m[row * n + col] / p;
            for j in col..n {
                m[row * n + j] -= f * m[col * n + j];
            }
        }
    }
    Ok(d)
}

fn triangle(t: &Tensor, op: TensorOp) -> Result<Tensor> {
    let (r, c) = match t.shape[..] {
        [r, c] => (r, c),
        _ => return Err(fail(op, "needs a matrix")),
    };
    let mut data = t.data.clone();
    for i in 0..r {
        for j in 0..c {
            let drop = if op == TensorOp::Triu { j < i } else { j > i };
            if drop {
                data[i * c + j] = 0.0;
            }
        }
    }
    Ok(t.with_data(data))
}

/// Tensor dimension from a stack number
fn dimension(op: TensorOp, v: DU) -> Result<usize> {
    let n = v.number()?;
    if n < 1.0 || n.fract() != 0.0 || n > MAX_ELEMENTS as f32 {
        return Err(fail(op, format!("bad dimension {v}")));
    }
    Ok(n as usize)
}

/// The tensor heap
#[derive(Default)]
pub struct TensorStore {
    slots: Mutex<Vec<Option<Tensor>>>,
}

impl TensorStore {
    pub fn new() -> TensorStore {
        TensorStore::default()
    }

    /// insert places a tensor in the lowest free slot and returns its handle
    pub fn insert(&self, t: Tensor) -> Result<DU> {
        let mut slots = self.slots.lock();
        let index = match slots.iter().position(Option::is_none) {
            Some(i) => i,
            None => slots.len(),
        };
        let handle = DU::encode_handle(index as u32)?;
        if index == slots.len() {
            slots.push(Some(t));
        } else {
            slots[index] = Some(t);
        }
        Ok(handle)
    }

    /// A copy of the tensor behind handle h
    pub fn get(&self, h: u32) -> Result<Tensor> {
        self.slots
            .lock()
            .get(h as usize)
            .cloned()
            .flatten()
            .ok_or(ForthError::NotAnObject)
    }

    fn tensor(&self, v: DU) -> Result<Tensor> {
        self.get(v.decode_handle()?)
    }

    /// Change a tensor where it lives; the handle stays the same
    fn update<F>(&self, v: DU, f: F) -> Result<DU>
    where
        F: FnOnce(&mut Tensor) -> Result<()>,
    {
        let h = v.decode_handle()?;
        let mut slots = self.slots.lock();
        let t = slots
            .get_mut(h as usize)
            .and_then(Option::as_mut)
            .ok_or(ForthError::NotAnObject)?;
        f(t)?;
        Ok(v)
    }

    /// Element-wise arithmetic; a plain number on either side is broadcast
    fn binary(&self, op: TensorOp, a: DU, b: DU) -> Result<Tensor> {
        let f: fn(f32, f32) -> f32 = match op {
            TensorOp::Add => |x, y| x + y,
            TensorOp::Sub => |x, y| x - y,
            TensorOp::Mul => |x, y| x * y,
            _ => |x, y| x / y,
        };
        match (a, b) {
            (DU::Handle(_), DU::Number(y)) => {
                let t = self.tensor(a)?;
                Ok(t.with_data(t.data.iter().map(|&x| f(x, y)).collect()))
            }
            (DU::Number(x), DU::Handle(_)) => {
                let t = self.tensor(b)?;
                Ok(t.with_data(t.data.iter().map(|&y| f(x, y)).collect()))
            }
            _ => {
                let (s, t) = (self.tensor(a)?, self.tensor(b)?);
                if s.shape != t.shape {
                    return Err(fail(
                        op,
                        format!("shape mismatch {} and {}", shape_text(&s.shape), shape_text(&t.shape)),
                    ));
                }
                Ok(s.with_data(s.data.iter().zip(&t.data).map(|(&x, &y)| f(x, y)).collect()))
            }
        }
    }
}

impl ObjectStore for TensorStore {
    fn apply(&self, op: TensorOp, args: &[DU]) -> Result<DU> {
        let arg = |i: usize| args.get(i).copied().ok_or(ForthError::StackUnderflow);
        let made = match op {
            TensorOp::Vector => Tensor::zeros(vec![dimension(op, arg(0)?)?]),
            TensorOp::Matrix => {
                let (h, w) = (dimension(op, arg(0)?)?, dimension(op, arg(1)?)?);
                if h * w > MAX_ELEMENTS {
                    return Err(fail(op, format!("{h} x {w} is too large")));
                }
                Tensor::zeros(vec![h, w])
            }
            TensorOp::Add | TensorOp::Sub | TensorOp::Mul | TensorOp::Div => {
                self.binary(op, arg(0)?, arg(1)?)?
            }
            TensorOp::MatMul => matmul(&self.tensor(arg(0)?)?, &self.tensor(arg(1)?)?)?,
            TensorOp::Inverse => inverse(&self.tensor(arg(0)?)?)?,
            TensorOp::Transpose => transpose(&self.tensor(arg(0)?)?),
            TensorOp::Exp | TensorOp::Ln | TensorOp::Tanh | TensorOp::Relu | TensorOp::Sigmoid => {
                let t = self.tensor(arg(0)?)?;
                t.with_data(t.data.iter().map(|&x| op.scalar(x).unwrap_or(x)).collect())
            }
            TensorOp::Sum => return Ok(DU::Number(self.tensor(arg(0)?)?.data.iter().sum())),
            TensorOp::Avg => {
                let t = self.tensor(arg(0)?)?;
                return Ok(DU::Number(t.data.iter().sum::<f32>() / t.data.len().max(1) as f32));
            }
            TensorOp::Det => return Ok(DU::Number(det(&self.tensor(arg(0)?)?)?)),
            TensorOp::Fill => {
                let v = arg(1)?.number()?;
                return self.update(arg(0)?, |t| {
                    t.data.fill(v);
                    Ok(())
                });
            }
            TensorOp::Identity => {
                return self.update(arg(0)?, |t| {
                    let (r, c) = t.dims();
                    t.data.fill(0.0);
                    for i in 0..r.min(c) {
                        t.data[i * c + i] = 1.0;
                    }
                    Ok(())
                });
            }
            TensorOp::Assign => {
                let values = args
                    .get(1..)
                    .unwrap_or_default()
                    .iter()
                    .map(|v| v.number())
                    .collect::<Result<Vec<f32>>>()?;
                return self.update(arg(0)?, |t| {
                    if values.len() != t.data.len() {
                        return Err(fail(
                            op,
                            format!("expected {} values, got {}", t.data.len(), values.len()),
                        ));
                    }
                    t.data.copy_from_slice(&values);
                    Ok(())
                });
            }
            TensorOp::Solve => solve(&self.tensor(arg(0)?)?, &self.tensor(arg(1)?)?)?,
            TensorOp::Lu => lu(&self.tensor(arg(0)?)?)?,
            TensorOp::Triu | TensorOp::Tril => triangle(&self.tensor(arg(0)?)?, op)?,
        };
        self.insert(made)
    }

    fn free(&self, handle: u32) -> Result<()> {
        let mut slots = self.slots.lock();
        match slots.get_mut(handle as usize) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                Ok(())
            }
            _ => Err(ForthError::NotAnObject),
        }
    }

    fn describe(&self, handle: u32) -> String {
        let Ok(t) = self.get(handle) else {
            return format!("<freed {handle}>");
        };
        let mut text = format!("tensor{}", shape_text(&t.shape));
        if t.data.len() <= DESCRIBE_LIMIT {
            text.push_str("{ ");
            for x in &t.data {
                let _ = write!(text, "{} ", DU::Number(*x));
            }
            text.push('}');
        }
        text
    }
}

////////////////////////////
/// Files
///
/// Text files hold the shape on the first line and one row per line after it.
/// Raw files are bare little endian f32 and load back as a vector.
/// Npy files follow the NumPy 1.0 array format for '<f4' data in C order.
///
pub struct FileStore {
    store: Arc<TensorStore>,
}

impl FileStore {
    pub fn new(store: Arc<TensorStore>) -> FileStore {
        FileStore { store }
    }
}

fn bad_file(fname: &str, message: &str) -> ForthError {
    ForthError::Collaborator {
        op: "load".to_string(),
        message: format!("{fname}: {message}"),
    }
}

fn to_text(t: &Tensor) -> String {
    let (_, cols) = match t.shape[..] {
        [n] => (1, n),
        _ => t.dims(),
    };
    let mut out = t.shape.iter().map(usize::to_string).collect::<Vec<_>>().join(" ");
    out.push('\n');
    for row in t.data.chunks(cols.max(1)) {
        let cells: Vec<String> = row.iter().map(f32::to_string).collect();
        out.push_str(&cells.join(" "));
        out.push('\n');
    }
    out
}

fn check_shape(shape: Vec<usize>, len: usize, fname: &str) -> Result<Vec<usize>> {
    if shape.is_empty() || shape.len() > 2 || shape.contains(&0) {
        return Err(bad_file(fname, "only vectors and matrices are supported"));
    }
    if shape.iter().product::<usize>() != len || len > MAX_ELEMENTS {
        return Err(bad_file(fname, "shape does not match the data"));
    }
    Ok(shape)
}

fn from_text(text: &str, fname: &str) -> Result<Tensor> {
    let mut lines = text.lines();
    let shape = lines
        .next()
        .unwrap_or_default()
        .split_whitespace()
        .map(str::parse::<usize>)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| bad_file(fname, "bad shape line"))?;
    let data = lines
        .flat_map(str::split_whitespace)
        .map(str::parse::<f32>)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| bad_file(fname, "bad number"))?;
    let shape = check_shape(shape, data.len(), fname)?;
    Ok(Tensor { shape, data })
}

fn from_raw(bytes: &[u8], fname: &str) -> Result<Tensor> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(bad_file(fname, "length is not a whole number of f32"));
    }
    let data: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let shape = check_shape(vec![data.len()], data.len(), fname)?;
    Ok(Tensor { shape, data })
}

fn to_npy(t: &Tensor) -> Vec<u8> {
    let shape = match t.shape[..] {
        [n] => format!("({n},)"),
        _ => format!("({})", t.shape.iter().map(usize::to_string).collect::<Vec<_>>().join(", ")),
    };
    let mut header = format!("{{'descr': '<f4', 'fortran_order': False, 'shape': {shape}, }}");
    // magic, version and length take 10 bytes; the header ends in a newline on a 64 byte boundary
    let total = (10 + header.len() + 1).div_ceil(64) * 64;
    while 10 + header.len() + 1 < total {
        header.push(' ');
    }
    header.push('\n');
    let mut out = Vec::with_capacity(total + 4 * t.data.len());
    out.extend_from_slice(NPY_MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    for x in &t.data {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

fn from_npy(bytes: &[u8], fname: &str) -> Result<Tensor> {
    if !bytes.starts_with(NPY_MAGIC) || bytes.len() < 10 {
        return Err(bad_file(fname, "not an npy file"));
    }
    let (len, start) = match bytes[6] {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 if bytes.len() >= 12 => (
            u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
            12,
        ),
        v => return Err(bad_file(fname, &format!("npy version {v} not supported"))),
    };
    let header = bytes
        .get(start..start + len)
        .map(String::from_utf8_lossy)
        .ok_or_else(|| bad_file(fname, "truncated header"))?;
    if !header.contains("'<f4'") || header.contains("'fortran_order': True") {
        return Err(bad_file(fname, "only little endian f32 in C order is supported"));
    }
    let dims = header
        .split("'shape':")
        .nth(1)
        .and_then(|rest| rest.split_once('(').map(|(_, r)| r))
        .and_then(|rest| rest.split_once(')').map(|(d, _)| d))
        .ok_or_else(|| bad_file(fname, "no shape in header"))?;
    let shape = dims
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::parse::<usize>)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| bad_file(fname, "bad shape"))?;
    let mut t = from_raw(&bytes[start + len..], fname)?;
    t.shape = check_shape(shape, t.data.len(), fname)?;
    Ok(t)
}

impl Persistence for FileStore {
    fn save(&self, object: DU, mode: SaveMode, fname: &str) -> Result<()> {
        let t = self.store.tensor(object)?;
        let bytes = match mode {
            SaveMode::Text => to_text(&t).into_bytes(),
            SaveMode::Raw => t.data.iter().flat_map(|x| x.to_le_bytes()).collect(),
            SaveMode::Npy => to_npy(&t),
        };
        fs::write(fname, bytes)?;
        Ok(())
    }

    fn load(&self, mode: SaveMode, fname: &str) -> Result<DU> {
        let bytes = fs::read(fname)?;
        let t = match mode {
            SaveMode::Text => from_text(&String::from_utf8_lossy(&bytes), fname)?,
            SaveMode::Raw => from_raw(&bytes, fname)?,
            SaveMode::Npy => from_npy(&bytes, fname)?,
        };
        self.store.insert(t)
    }
}
