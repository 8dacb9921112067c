// system configuration and command line processing

use crate::error::{ForthError, Result};
use crate::ostream::MAX_PRODUCER;
use argh::FromArgs;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_INSTANCES: usize = 1;
pub const DEFAULT_GROUP: usize = 1;
pub const DEFAULT_OBUF_SIZE: usize = 64 * 1024;
pub const DEFAULT_ARENA_SIZE: usize = 256 * 1024;
pub const DEFAULT_STACK_SIZE: usize = 64;
pub const DEFAULT_RSTACK_SIZE: usize = 64;
pub const MAX_ARENA_SIZE: usize = 1 << 24; // every address stays exact in an f32 cell

#[derive(FromArgs)]
/// command line arguments for t4.
pub struct Config {
    /// load a file at startup.
    #[argh(option, short = 'f')]
    pub loaded_file: Option<String>,

    /// skip loading the core word set.
    #[argh(switch, short = 'n')]
    pub no_core: bool,

    /// number of VM instances.
    #[argh(option, short = 'i', default = "DEFAULT_INSTANCES")]
    pub instances: usize,

    /// instances per group; only the first of each group writes output.
    #[argh(option, short = 'g', default = "DEFAULT_GROUP")]
    pub group: usize,

    /// output buffer size in bytes.
    #[argh(option, default = "DEFAULT_OBUF_SIZE")]
    pub obuf: usize,

    /// arena size in bytes.
    #[argh(option, default = "DEFAULT_ARENA_SIZE")]
    pub arena: usize,

    /// data and return stack depth in cells.
    #[argh(option, default = "DEFAULT_STACK_SIZE")]
    pub stack: usize,

    /// make word lookup case sensitive.
    #[argh(switch, short = 'c')]
    pub case_sensitive: bool,

    /// verbose logging.
    #[argh(switch, short = 'v')]
    pub verbose: bool,
}

impl Config {
    pub fn process_args() -> Config {
        argh::from_env()
    }

    pub fn params(&self) -> Params {
        Params {
            instances: self.instances,
            group: self.group,
            obuf_size: self.obuf,
            arena_size: self.arena,
            stack_size: self.stack,
            rstack_size: self.stack,
            ucase: !self.case_sensitive,
        }
    }
}

/// Sizes and switches every part of the system is built from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Params {
    pub instances: usize,
    pub group: usize,
    pub obuf_size: usize,
    pub arena_size: usize,
    pub stack_size: usize,
    pub rstack_size: usize,
    pub ucase: bool, // case-insensitive lookup
}

impl Default for Params {
    fn default() -> Self {
        Params {
            instances: DEFAULT_INSTANCES,
            group: DEFAULT_GROUP,
            obuf_size: DEFAULT_OBUF_SIZE,
            arena_size: DEFAULT_ARENA_SIZE,
            stack_size: DEFAULT_STACK_SIZE,
            rstack_size: DEFAULT_RSTACK_SIZE,
            ucase: true,
        }
    }
}

impl Params {
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(ForthError::Config(msg));
        if self.instances == 0 || self.instances > MAX_PRODUCER + 1 {
            return bad(format!("instances must be 1..={}", MAX_PRODUCER + 1));
        }
        if self.group == 0 {
            return bad("group size must be at least 1".to_string());
        }
        if self.arena_size == 0 || self.arena_size > MAX_ARENA_SIZE {
            return bad(format!("arena must be 1..={MAX_ARENA_SIZE} bytes"));
        }
        if self.obuf_size == 0 || self.stack_size == 0 || self.rstack_size == 0 {
            return bad("buffer and stack sizes must be non-zero".to_string());
        }
        Ok(())
    }
}
