// Interpreter errors

use thiserror::Error;

/// Result type used by every builtin and compiler helper
pub type Result<T> = std::result::Result<T, ForthError>;

/// Everything that can go wrong inside a VM instance.
///
///     UndefinedWord is recoverable: the offending idiom is skipped and the line continues.
///     InvalidHandleDecode and ArenaExhausted are fatal and stop the instance.
///     Everything else abandons the current line and returns the instance to READY.
///
#[derive(Debug, Error)]
pub enum ForthError {
    #[error("{0} ? undefined word")]
    UndefinedWord(String),

    #[error("stack underflow")]
    StackUnderflow,

    #[error("stack overflow")]
    StackOverflow,

    #[error("return stack underflow")]
    ReturnStackUnderflow,

    #[error("return stack overflow")]
    ReturnStackOverflow,

    #[error("arena exhausted: need {need} bytes, {free} free")]
    ArenaExhausted { need: usize, free: usize },

    #[error("invalid handle pattern {0:#010x}")]
    InvalidHandleDecode(u32),

    #[error("output record of {size} bytes dropped")]
    OutputChannelOverflow { size: usize },

    #[error("{0} is compile only")]
    CompileOnly(String),

    #[error("definition of {0} still open")]
    NestedDefinition(String),

    #[error("cannot forget inside a definition")]
    ForgetInDefinition,

    #[error("{0} is protected")]
    ForgetProtected(String),

    #[error("instance {0} may not compile")]
    CompileNotPermitted(usize),

    #[error("{0} expects a name")]
    MissingName(String),

    #[error("unbalanced control structure at {0}")]
    UnbalancedControl(String),

    #[error("{0} is not a value")]
    NotAValue(String),

    #[error("invalid address {0}")]
    InvalidAddress(usize),

    #[error("division by zero")]
    DivideByZero,

    #[error("not an object")]
    NotAnObject,

    #[error("object where a number was expected")]
    NotANumber,

    #[error("handle index {0} out of range")]
    HandleOutOfRange(u32),

    #[error("object layer not enabled")]
    NoObjectLayer,

    #[error("no instance {0}")]
    NoInstance(usize),

    #[error("bad configuration: {0}")]
    Config(String),

    #[error("{op}: {message}")]
    Collaborator { op: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ForthError {
    /// Fatal errors put the instance into STOPPED.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ForthError::InvalidHandleDecode(_) | ForthError::ArenaExhausted { .. }
        )
    }

    /// Recoverable errors only skip the idiom that raised them.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ForthError::UndefinedWord(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ForthError::UndefinedWord("foo".into()).is_recoverable());
        assert!(!ForthError::UndefinedWord("foo".into()).is_fatal());
        assert!(ForthError::InvalidHandleDecode(0xFF80_0001).is_fatal());
        assert!(ForthError::ArenaExhausted { need: 4, free: 0 }.is_fatal());
        assert!(!ForthError::StackUnderflow.is_fatal());
        assert!(!ForthError::StackUnderflow.is_recoverable());
        assert!(!ForthError::OutputChannelOverflow { size: 8 }.is_fatal());
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            ForthError::UndefinedWord("FOO".into()).to_string(),
            "FOO ? undefined word"
        );
        assert_eq!(
            ForthError::InvalidHandleDecode(0xFF80_0001).to_string(),
            "invalid handle pattern 0xff800001"
        );
    }
}
