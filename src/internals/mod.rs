// Builtin word families, each an `impl ForthRuntime` block

pub mod compiler;
pub mod console;
pub mod debug;
pub mod files;
pub mod general;
pub mod inner;
pub mod tensor;
pub mod tui;
