//////////////////////////////////////////////////////////////////
/// runtime.rs
///
/// Forth Runtime Engine
///
/// This module defines the ForthRuntime struct, the state of one VM instance.
/// Each instance owns its stacks, instruction pointer and status; the dictionary,
/// arena and output channel are shared with every other instance.
/// It also installs the builtin word set into a fresh dictionary (compile_builtins).
///
use crate::config::Params;
use crate::error::{ForthError, Result};
use crate::internals::console::{InputSource, LineInput};
use crate::internals::files::Persistence;
use crate::internals::tensor::ObjectStore;
use crate::kernel::{BuiltinCode, Dictionary};
use crate::ostream::OutputChannel;
use crate::stack::{Stack, StackError};
use crate::value::DU;
use parking_lot::{RwLock, RwLockReadGuard};
use std::sync::Arc;

/// Instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    Ready,
    Running,
    Waiting,
    Stopped,
}

/// Where to pick up again after WAITING
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspend {
    Word(usize),          // a builtin called straight from the outer interpreter
    Nest { base: usize }, // inside a colon word, IP and the return stack hold the rest
}

/// Number formatting set by setw, setfill and setprec.
///     A zero width and no precision leave numbers in their compact typed records.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumFormat {
    pub width: usize,
    pub fill: char,
    pub precision: Option<usize>,
}

impl Default for NumFormat {
    fn default() -> Self {
        NumFormat {
            width: 0,
            fill: ' ',
            precision: None,
        }
    }
}

impl NumFormat {
    pub fn is_plain(&self) -> bool {
        self.width == 0 && self.precision.is_none()
    }

    /// Right-justify text in `width` columns using the fill character
    pub fn pad(&self, text: &str, width: usize) -> String {
        let len = text.chars().count();
        let mut out: String = std::iter::repeat(self.fill).take(width.saturating_sub(len)).collect();
        out.push_str(text);
        out
    }
}

/// Compile-time markers for control structures; each holds an arena address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMarker {
    If(usize),    // unresolved 0branch target cell
    Else(usize),  // unresolved branch target cell
    Begin(usize), // loop head
    While(usize), // unresolved 0branch target cell
    For(usize),   // loop head
    Do(usize),    // loop head
}

pub struct ForthRuntime {
    pub id: usize,                         // producer id on the output channel
    pub status: VmStatus,
    pub dict: Arc<RwLock<Dictionary>>,     // shared, read-mostly
    pub out: Arc<OutputChannel>,           // shared
    pub objects: Option<Arc<dyn ObjectStore>>,
    pub persist: Option<Arc<dyn Persistence>>,
    pub input: Box<dyn InputSource>,
    pub ss: Stack<DU>,                     // parameter stack
    pub rs: Stack<DU>,                     // return stack
    pub ip: usize,                         // instruction pointer
    pub wp: usize,                         // word being executed
    pub compile: bool,                     // true while a definition is open
    pub radix: u32,                        // for numeric I/O
    pub ucase: bool,                       // case-insensitive lookup
    pub may_compile: bool,                 // only the designated instance compiles
    pub leader: bool,                      // only group leaders write output
    pub show_stack: bool,                  // dump the stack after every line
    pub control_stack: Vec<ControlMarker>, // stack for control structures like IF, BEGIN, WHILE
    pub fmt: NumFormat,                    // setw / setfill / setprec state
    pub(crate) ten_mark: Option<usize>,    // stack depth at `{` while a tensor literal is open
    pub(crate) in_nest: bool,
    pub(crate) suspended: Option<Suspend>,
}

impl ForthRuntime {
    pub fn new(
        id: usize,
        dict: Arc<RwLock<Dictionary>>,
        out: Arc<OutputChannel>,
        params: &Params,
    ) -> ForthRuntime {
        ForthRuntime {
            id,
            status: VmStatus::Ready,
            dict,
            out,
            objects: None,
            persist: None,
            input: Box::new(LineInput::new()),
            ss: Stack::new(params.stack_size),
            rs: Stack::new(params.rstack_size),
            ip: 0,
            wp: 0,
            compile: false,
            radix: 10,
            ucase: params.ucase,
            may_compile: id == 0,
            leader: id % params.group.max(1) == 0,
            show_stack: false,
            control_stack: Vec::new(),
            fmt: NumFormat::default(),
            ten_mark: None,
            in_nest: false,
            suspended: None,
        }
    }

    /// Shared read access to the dictionary, held only briefly
    pub fn dict(&self) -> RwLockReadGuard<'_, Dictionary> {
        self.dict.read()
    }

    /// compiling runs `f` with exclusive access to the dictionary, if this instance may compile
    pub fn compiling<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Dictionary) -> Result<T>,
    {
        if !self.may_compile {
            return Err(ForthError::CompileNotPermitted(self.id));
        }
        let mut dict = self.dict.write();
        f(&mut dict)
    }

    /// Return the current value of the HERE pointer.
    pub fn here(&self) -> usize {
        self.dict().arena().here()
    }

    // Stack accessors that turn stack faults into interpreter errors

    pub fn push(&mut self, v: DU) -> Result<()> {
        self.ss.push(v).map_err(|_| ForthError::StackOverflow)
    }

    pub fn pop(&mut self) -> Result<DU> {
        self.ss.pop().map_err(|_| ForthError::StackUnderflow)
    }

    pub fn top(&self) -> Result<DU> {
        self.ss.peek(0).map_err(|_| ForthError::StackUnderflow)
    }

    pub fn pop_num(&mut self) -> Result<f32> {
        self.pop()?.number()
    }

    pub fn pop_int(&mut self) -> Result<i32> {
        self.pop()?.int()
    }

    pub fn rpush(&mut self, v: DU) -> Result<()> {
        self.rs.push(v).map_err(|e| match e {
            StackError::StackFull => ForthError::ReturnStackOverflow,
            StackError::StackEmpty => ForthError::ReturnStackUnderflow,
        })
    }

    pub fn rpop(&mut self) -> Result<DU> {
        self.rs.pop().map_err(|_| ForthError::ReturnStackUnderflow)
    }

    pub fn pop2_push1<F>(&mut self, f: F) -> Result<()>
    where
        F: Fn(f32, f32) -> f32,
    {
        let j = self.pop_num()?;
        let k = self.pop_num()?;
        self.push(DU::Number(f(k, j)))
    }

    pub fn pop1_push1<F>(&mut self, f: F) -> Result<()>
    where
        F: Fn(f32) -> f32,
    {
        let x = self.pop_num()?;
        self.push(DU::Number(f(x)))
    }

    /// Native code for builtin number n
    pub fn builtin_code(&self, n: usize) -> Result<BuiltinCode> {
        self.dict()
            .builtin(n)
            .map(|b| b.code)
            .ok_or(ForthError::InvalidAddress(n))
    }

    /// abort empties the stacks, drops any open definition and the rest of the input
    pub fn f_abort(&mut self) {
        if self.may_compile && self.dict().pending().is_some() {
            self.dict.write().abandon();
        }
        self.f_clear();
        self.input.clear();
    }

    /// f_clear resets the stacks and interpreter state
    pub fn f_clear(&mut self) {
        self.ss.clear();
        self.rs.clear();
        self.control_stack.clear();
        self.ten_mark = None;
        self.compile = false;
        self.suspended = None;
        self.in_nest = false;
    }

    /// reset returns a stopped or faulted instance to READY
    pub fn reset(&mut self) {
        self.f_abort();
        self.radix = 10;
        self.fmt = NumFormat::default();
        self.status = VmStatus::Ready;
        tracing::info!(instance = self.id, "instance reset");
    }

    /// bye ( -- ) stop this instance
    pub fn f_bye(&mut self) -> Result<()> {
        self.status = VmStatus::Stopped;
        tracing::info!(instance = self.id, "instance stopped");
        Ok(())
    }

    /// True once the instance has stopped, by bye or by the host
    pub fn should_exit(&self) -> bool {
        self.status == VmStatus::Stopped
    }

    /// Write a string record unless this instance is a follower. Dropped records are only logged.
    pub fn emit_str(&self, s: &str) {
        if !self.leader {
            return;
        }
        if let Err(e) = self.out.write_str(self.id, s) {
            tracing::debug!(instance = self.id, ?e, "output record dropped");
        }
    }

    /// Write a number in the current radix
    pub fn emit_du(&self, v: DU) {
        if !self.leader {
            return;
        }
        let n = match v {
            DU::Number(n) => n,
            DU::Handle(h) => {
                let text = match &self.objects {
                    Some(store) => store.describe(h),
                    None => v.to_string(),
                };
                return self.emit_str(&format!("{text} "));
            }
        };
        let whole = v.is_integral() && n >= i32::MIN as f32 && n <= i32::MAX as f32;
        if !self.fmt.is_plain() {
            let text = self.fmt.pad(&self.number_text(n), self.fmt.width);
            return self.emit_str(&format!("{text} "));
        }
        let r = match self.radix {
            10 if whole => self.out.write_int(self.id, n as i32),
            16 if whole => self.out.write_hex(self.id, n as i32),
            10 | 16 => self.out.write_float(self.id, n),
            _ if whole => self.out.write_str(self.id, &format!("{} ", radix_fmt(n as i64, self.radix))),
            _ => self.out.write_float(self.id, n),
        };
        if let Err(e) = r {
            tracing::debug!(instance = self.id, ?e, "output record dropped");
        }
    }

    /// Text of a number in the current radix and precision
    pub fn number_text(&self, n: f32) -> String {
        let whole = n.is_finite() && n.fract() == 0.0 && n >= i32::MIN as f32 && n <= i32::MAX as f32;
        match self.fmt.precision {
            _ if whole => radix_fmt(n as i64, self.radix),
            Some(p) => format!("{n:.p$}"),
            None => n.to_string(),
        }
    }

    /// compile_builtins installs every word that is implemented in Rust.
    ///     Each one gets a dictionary entry and a slot in the builtin table.
    ///
    pub fn compile_builtins(d: &mut Dictionary) {
        // stack
        d.add_builtin("dup", ForthRuntime::f_dup, "dup ( n -- n n ) Duplicate the top of stack", false);
        d.add_builtin("drop", ForthRuntime::f_drop, "drop ( n -- ) Discard the top of stack", false);
        d.add_builtin("swap", ForthRuntime::f_swap, "swap ( m n -- n m ) Exchange the top two items", false);
        d.add_builtin("over", ForthRuntime::f_over, "over ( m n -- m n m ) Copy the second item to the top", false);
        d.add_builtin("rot", ForthRuntime::f_rot, "rot ( a b c -- b c a ) Rotate the third item to the top", false);
        d.add_builtin("pick", ForthRuntime::f_pick, "pick ( ... n -- ... v ) Copy the nth item to the top", false);
        d.add_builtin("?dup", ForthRuntime::f_q_dup, "?dup ( n -- n n | 0 ) Duplicate if non-zero", false);
        d.add_builtin("nip", ForthRuntime::f_nip, "nip ( m n -- n ) Drop the second item", false);
        d.add_builtin("depth", ForthRuntime::f_stack_depth, "depth ( -- n ) Number of items on the stack", false);
        d.add_builtin(">r", ForthRuntime::f_to_r, ">r ( n -- ) Move the top of stack to the return stack", false);
        d.add_builtin("r>", ForthRuntime::f_r_from, "r> ( -- n ) Move the top of the return stack to the stack", false);
        d.add_builtin("r@", ForthRuntime::f_r_get, "r@ ( -- n ) Copy the top of the return stack", false);
        d.add_builtin("i", ForthRuntime::f_r_get, "i ( -- n ) Current loop index", false);
        // arithmetic and logic
        d.add_builtin("+", ForthRuntime::f_plus, "+ ( j k -- j+k ) Add, or combine two objects", false);
        d.add_builtin("-", ForthRuntime::f_minus, "- ( j k -- j-k ) Subtract", false);
        d.add_builtin("*", ForthRuntime::f_times, "* ( j k -- j*k ) Multiply", false);
        d.add_builtin("/", ForthRuntime::f_divide, "/ ( j k -- j/k ) Divide", false);
        d.add_builtin("mod", ForthRuntime::f_mod, "mod ( j k -- j%k ) Remainder", false);
        d.add_builtin("negate", ForthRuntime::f_negate, "negate ( n -- -n )", false);
        d.add_builtin("abs", ForthRuntime::f_abs, "abs ( n -- |n| )", false);
        d.add_builtin("floor", ForthRuntime::f_floor, "floor ( n -- n' ) Largest integer not above n", false);
        d.add_builtin("max", ForthRuntime::f_max, "max ( j k -- n ) Larger of two", false);
        d.add_builtin("min", ForthRuntime::f_min, "min ( j k -- n ) Smaller of two", false);
        d.add_builtin("=", ForthRuntime::f_equal, "= ( j k -- f ) True if equal", false);
        d.add_builtin("<", ForthRuntime::f_less, "< ( j k -- f ) True if j < k", false);
        d.add_builtin(">", ForthRuntime::f_greater, "> ( j k -- f ) True if j > k", false);
        d.add_builtin("0=", ForthRuntime::f_0equal, "0= ( n -- f ) True if zero", false);
        d.add_builtin("0<", ForthRuntime::f_0less, "0< ( n -- f ) True if negative", false);
        d.add_builtin("and", ForthRuntime::f_and, "and ( j k -- n ) Bitwise and of the integer parts", false);
        d.add_builtin("or", ForthRuntime::f_or, "or ( j k -- n ) Bitwise or of the integer parts", false);
        d.add_builtin("xor", ForthRuntime::f_xor, "xor ( j k -- n ) Bitwise xor of the integer parts", false);
        d.add_builtin("not", ForthRuntime::f_not, "not ( n -- ~n ) Bitwise inversion", false);
        // memory
        d.add_builtin("@", ForthRuntime::f_get, "@ ( a -- n ) Fetch the cell at arena address a", false);
        d.add_builtin("!", ForthRuntime::f_store, "! ( n a -- ) Store n at arena address a", false);
        d.add_builtin("here", ForthRuntime::f_here, "here ( -- a ) First free arena address", false);
        d.add_builtin(",", ForthRuntime::f_comma, ", ( n -- ) Append a cell to the arena", false);
        d.add_builtin("'", ForthRuntime::f_tick, "' <name> ( -- w ) Index of the named word", false);
        d.add_builtin("execute", ForthRuntime::f_execute, "execute ( w -- ) Run the word with index w", false);
        // defining words
        d.add_builtin(":", ForthRuntime::f_colon, ": <name> ( -- ) Start a definition", false);
        d.add_builtin(";", ForthRuntime::f_semicolon, "; ( -- ) Finish a definition", true);
        d.add_builtin("immediate", ForthRuntime::f_immediate, "immediate ( -- ) Mark the last word immediate", false);
        d.add_builtin("constant", ForthRuntime::f_constant, "constant <name> ( n -- ) Define a constant", false);
        d.add_builtin("variable", ForthRuntime::f_variable, "variable <name> ( -- ) Define a variable", false);
        d.add_builtin("value", ForthRuntime::f_value, "value <name> ( n -- ) Define a value", false);
        d.add_builtin("to", ForthRuntime::f_to, "to <name> ( n -- ) Update a value", true);
        d.add_builtin("alias", ForthRuntime::f_alias, "alias <name> ( w -- ) Give word w a second name", false);
        d.add_builtin("forget", ForthRuntime::f_forget, "forget <name> ( -- ) Drop the word and all later ones", false);
        // compile state and control structures
        d.add_builtin("[", ForthRuntime::f_lbracket, "[ ( -- ) Interpret inside a definition", true);
        d.add_builtin("]", ForthRuntime::f_rbracket, "] ( -- ) Resume compiling", false);
        d.add_builtin("literal", ForthRuntime::f_literal, "literal ( n -- ) Compile n as a literal", true);
        d.add_builtin("recurse", ForthRuntime::f_recurse, "recurse ( -- ) Call the definition being compiled", true);
        d.add_builtin("exit", ForthRuntime::f_exit, "exit ( -- ) Return from the current word", true);
        d.add_builtin("if", ForthRuntime::f_if, "if ( f -- ) Run what follows when f is true", true);
        d.add_builtin("else", ForthRuntime::f_else, "else ( -- ) Alternative branch of if", true);
        d.add_builtin("then", ForthRuntime::f_then, "then ( -- ) End of if", true);
        d.add_builtin("begin", ForthRuntime::f_begin, "begin ( -- ) Start of a loop", true);
        d.add_builtin("again", ForthRuntime::f_again, "again ( -- ) Loop back to begin forever", true);
        d.add_builtin("until", ForthRuntime::f_until, "until ( f -- ) Loop back to begin until f is true", true);
        d.add_builtin("while", ForthRuntime::f_while, "while ( f -- ) Leave the begin loop when f is false", true);
        d.add_builtin("repeat", ForthRuntime::f_repeat, "repeat ( -- ) End of begin..while loop", true);
        d.add_builtin("for", ForthRuntime::f_for, "for ( n -- ) Run the loop body n+1 times", true);
        d.add_builtin("next", ForthRuntime::f_next, "next ( -- ) End of for loop", true);
        d.add_builtin("do", ForthRuntime::f_do, "do ( limit start -- ) Counted loop", true);
        d.add_builtin("loop", ForthRuntime::f_loop, "loop ( -- ) End of do loop", true);
        // strings, comments and output
        d.add_builtin(".\"", ForthRuntime::f_dot_quote, ".\" <text>\" ( -- ) Print text", true);
        d.add_builtin("s\"", ForthRuntime::f_s_quote, "s\" <text>\" ( -- a n ) Compile a string", true);
        d.add_builtin(".(", ForthRuntime::f_dot_paren, ".( <text>) ( -- ) Print text now", true);
        d.add_builtin("(", ForthRuntime::f_paren, "( <text>) ( -- ) Comment", true);
        d.add_builtin("\\", ForthRuntime::f_backslash, "\\ ( -- ) Comment to end of line", true);
        d.add_builtin("type", ForthRuntime::f_type, "type ( a n -- ) Print an arena string", false);
        d.add_builtin("emit", ForthRuntime::f_emit, "emit ( c -- ) Print a character", false);
        d.add_builtin("cr", ForthRuntime::f_cr, "cr ( -- ) Print a newline", false);
        d.add_builtin("space", ForthRuntime::f_space, "space ( -- ) Print a space", false);
        d.add_builtin("spaces", ForthRuntime::f_spaces, "spaces ( n -- ) Print n spaces", false);
        d.add_builtin(".", ForthRuntime::f_dot, ". ( n -- ) Print the top of stack", false);
        d.add_builtin("u.", ForthRuntime::f_u_dot, "u. ( n -- ) Print as unsigned", false);
        d.add_builtin(".s", ForthRuntime::f_dot_s, ".s ( -- ) Print the stack", false);
        d.add_builtin("key", ForthRuntime::f_key, "key ( -- c ) Next input character, waiting for one", false);
        d.add_builtin("hex", ForthRuntime::f_hex, "hex ( -- ) Radix 16", false);
        d.add_builtin("decimal", ForthRuntime::f_decimal, "decimal ( -- ) Radix 10", false);
        d.add_builtin("base@", ForthRuntime::f_base_get, "base@ ( -- n ) Current radix", false);
        d.add_builtin("base!", ForthRuntime::f_base_set, "base! ( n -- ) Set the radix", false);
        d.add_builtin("setbase", ForthRuntime::f_base_set, "setbase ( n -- ) Set the radix", false);
        d.add_builtin("setw", ForthRuntime::f_setw, "setw ( n -- ) Pad printed numbers to n columns", false);
        d.add_builtin("setfill", ForthRuntime::f_setfill, "setfill ( c -- ) Padding character for setw", false);
        d.add_builtin("setprec", ForthRuntime::f_setprec, "setprec ( n -- ) Digits after the point, -1 for shortest", false);
        d.add_builtin(".r", ForthRuntime::f_dot_r, ".r ( n w -- ) Print n right-justified in w columns", false);
        d.add_builtin("u.r", ForthRuntime::f_u_dot_r, "u.r ( n w -- ) Print unsigned, right-justified in w columns", false);
        // introspection and lifecycle
        d.add_builtin("words", ForthRuntime::f_words, "words ( -- ) List the dictionary", false);
        d.add_builtin("see", ForthRuntime::f_see, "see <name> ( -- ) Decompile a word", false);
        d.add_builtin("show-stack", ForthRuntime::f_show_stack, "show-stack ( -- ) Dump the stack after each line", false);
        d.add_builtin("hide-stack", ForthRuntime::f_hide_stack, "hide-stack ( -- ) Stop dumping the stack", false);
        d.add_builtin("bye", ForthRuntime::f_bye, "bye ( -- ) Stop this instance", false);
        // object layer
        d.add_builtin("matmul", ForthRuntime::f_matmul, "matmul ( a b -- c ) Matrix product", false);
        d.add_builtin("inverse", ForthRuntime::f_inverse, "inverse ( a -- b ) Matrix inverse", false);
        d.add_builtin("transpose", ForthRuntime::f_transpose, "transpose ( a -- b ) Matrix transpose", false);
        d.add_builtin("exp", ForthRuntime::f_exp, "exp ( n -- e^n )", false);
        d.add_builtin("ln", ForthRuntime::f_ln, "ln ( n -- log n )", false);
        d.add_builtin("tanh", ForthRuntime::f_tanh, "tanh ( n -- tanh n )", false);
        d.add_builtin("relu", ForthRuntime::f_relu, "relu ( n -- max(0,n) )", false);
        d.add_builtin("sigmoid", ForthRuntime::f_sigmoid, "sigmoid ( n -- 1/(1+e^-n) )", false);
        d.add_builtin("sum", ForthRuntime::f_sum, "sum ( a -- n ) Sum of all elements", false);
        d.add_builtin("avg", ForthRuntime::f_avg, "avg ( a -- n ) Mean of all elements", false);
        d.add_builtin("vector", ForthRuntime::f_vector, "vector ( n -- t ) New zeroed vector of n elements", false);
        d.add_builtin("matrix", ForthRuntime::f_matrix, "matrix ( h w -- t ) New zeroed h by w matrix", false);
        d.add_builtin("fill", ForthRuntime::f_fill, "fill ( t n -- t ) Set every element to n", false);
        d.add_builtin("eye", ForthRuntime::f_eye, "eye ( t -- t ) Make t an identity matrix", false);
        d.add_builtin("{", ForthRuntime::f_tensor_open, "{ ( t -- t ) Start a tensor literal", false);
        d.add_builtin("}", ForthRuntime::f_tensor_close, "} ( t n1 .. nk -- t ) Store the numbers into t, row by row", false);
        d.add_builtin("solve", ForthRuntime::f_solve, "solve ( b a -- x ) Solve a x = b", false);
        d.add_builtin("det", ForthRuntime::f_det, "det ( a -- n ) Determinant", false);
        d.add_builtin("lu", ForthRuntime::f_lu, "lu ( a -- b ) LU factors packed in one matrix", false);
        d.add_builtin("triu", ForthRuntime::f_triu, "triu ( a -- b ) Upper triangle", false);
        d.add_builtin("tril", ForthRuntime::f_tril, "tril ( a -- b ) Lower triangle", false);
        d.add_builtin("free", ForthRuntime::f_free, "free ( a -- ) Release an object", false);
        d.add_builtin("save", ForthRuntime::f_save, "save <file> ( a mode -- ) Persist an object", false);
        d.add_builtin("load", ForthRuntime::f_load, "load <file> ( mode -- a ) Restore an object", false);
    }
}

/// Format an integer in any radix from 2 to 36
pub fn radix_fmt(n: i64, radix: u32) -> String {
    if !(2..=36).contains(&radix) {
        return n.to_string();
    }
    let mut digits = Vec::new();
    let mut v = n.unsigned_abs();
    loop {
        let d = (v % radix as u64) as u32;
        digits.push(std::char::from_digit(d, radix).unwrap_or('?'));
        v /= radix as u64;
        if v == 0 {
            break;
        }
    }
    if n < 0 {
        digits.push('-');
    }
    digits.iter().rev().collect()
}

/////////////////////////
/// TESTS
///
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ostream::render;

    /// A booted single instance with its own dictionary and channel
    pub fn boot() -> ForthRuntime {
        boot_with(Params::default())
    }

    pub fn boot_with(params: Params) -> ForthRuntime {
        let mut d = Dictionary::new(params.arena_size);
        ForthRuntime::compile_builtins(&mut d);
        d.set_fence();
        let dict = Arc::new(RwLock::new(d));
        let out = Arc::new(OutputChannel::new(params.obuf_size));
        ForthRuntime::new(0, dict, out, &params)
    }

    /// Run a line and return whatever it printed
    pub fn run(vm: &mut ForthRuntime, line: &str) -> String {
        let _ = vm.process_line(line);
        render(&vm.out.drain(), false)
    }

    pub fn stack(vm: &ForthRuntime) -> Vec<DU> {
        vm.ss.as_slice().to_vec()
    }

    #[test]
    fn test_stack_push_and_pop() {
        let mut rt = boot();
        rt.push(DU::from(42)).unwrap();
        assert_eq!(rt.pop().unwrap(), DU::from(42));
        assert!(matches!(rt.pop(), Err(ForthError::StackUnderflow)));
    }

    #[test]
    fn test_stack_overflow() {
        let mut rt = boot_with(Params {
            stack_size: 2,
            ..Params::default()
        });
        rt.push(DU::from(1)).unwrap();
        rt.push(DU::from(2)).unwrap();
        assert!(matches!(rt.push(DU::from(3)), Err(ForthError::StackOverflow)));
    }

    #[test]
    fn test_new_runtime() {
        let rt = boot();
        assert_eq!(rt.status, VmStatus::Ready);
        assert!(rt.may_compile);
        assert!(rt.leader);
        assert_eq!(rt.radix, 10);
        assert!(!rt.compile);
    }

    #[test]
    fn test_compile_builtins() {
        let rt = boot();
        let d = rt.dict();
        assert_eq!(d.builtin(0).map(|b| b.name.as_str()), Some("dup"));
        let semi = d.find(";", true).unwrap();
        assert!(d.word(semi).unwrap().immediate);
        let dup = d.find("DUP", true).unwrap();
        assert!(!d.word(dup).unwrap().immediate);
        assert_eq!(d.word(dup).unwrap().prim, Some(0));
    }

    #[test]
    fn test_add_and_call_builtin() {
        let mut rt = boot();

        fn sample_add(rt: &mut ForthRuntime) -> Result<()> {
            let b = rt.pop_num()?;
            let a = rt.pop_num()?;
            rt.push(DU::Number(a + b))
        }

        let w = rt.dict.write().add_builtin("add", sample_add, "Add two numbers", false);
        rt.push(DU::from(10)).unwrap();
        rt.push(DU::from(32)).unwrap();
        rt.call(w).unwrap();
        assert_eq!(rt.pop().unwrap(), DU::from(42));
    }

    #[test]
    fn test_followers_do_not_write() {
        let params = Params {
            group: 2,
            ..Params::default()
        };
        let rt = boot_with(params.clone());
        let follower = ForthRuntime::new(1, Arc::clone(&rt.dict), Arc::clone(&rt.out), &params);
        assert!(!follower.leader);
        assert!(!follower.may_compile);
        follower.emit_du(DU::from(5));
        rt.emit_du(DU::from(6));
        let records = rt.out.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].producer, 0);
    }

    #[test]
    fn test_emit_du_kinds() {
        let mut rt = boot();
        rt.emit_du(DU::from(9));
        rt.emit_du(DU::from(2.5f32));
        rt.radix = 16;
        rt.emit_du(DU::from(255));
        rt.radix = 2;
        rt.emit_du(DU::from(5));
        assert_eq!(render(&rt.out.drain(), false), "9 2.5 ff 101 ");
    }

    #[test]
    fn test_formatted_numbers() {
        let mut rt = boot();
        rt.fmt.width = 5;
        rt.emit_du(DU::from(42));
        rt.fmt.fill = '0';
        rt.emit_du(DU::from(-7));
        rt.fmt = NumFormat {
            precision: Some(2),
            ..NumFormat::default()
        };
        rt.emit_du(DU::from(3.14159f32));
        rt.emit_du(DU::from(8));
        assert_eq!(render(&rt.out.drain(), false), "   42 000-7 3.14 8 ");
        rt.reset();
        assert!(rt.fmt.is_plain());
    }

    #[test]
    fn test_radix_fmt() {
        assert_eq!(radix_fmt(255, 16), "ff");
        assert_eq!(radix_fmt(-5, 2), "-101");
        assert_eq!(radix_fmt(0, 8), "0");
        assert_eq!(radix_fmt(7, 1), "7");
    }

    #[test]
    fn test_f_abort() {
        let mut rt = boot();
        rt.push(DU::from(42)).unwrap();
        rt.rpush(DU::from(99)).unwrap();
        rt.f_abort();
        assert_eq!(rt.ss.depth(), 0);
        assert_eq!(rt.rs.depth(), 0);
    }

    #[test]
    fn test_bye_and_reset() {
        let mut rt = boot();
        rt.f_bye().unwrap();
        assert!(rt.should_exit());
        rt.reset();
        assert_eq!(rt.status, VmStatus::Ready);
    }

    #[test]
    fn test_compile_not_permitted() {
        let mut rt = boot();
        rt.may_compile = false;
        let r = rt.compiling(|d| Ok(d.mark()));
        assert!(matches!(r, Err(ForthError::CompileNotPermitted(0))));
    }
}
