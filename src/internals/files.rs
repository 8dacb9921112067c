////////////////////////////
/// File: src/internals/files.rs
///
/// Object persistence words.
///      save and load hand a handle, a mode byte and a file name to the
///      persistence collaborator. What ends up on disk is its business.
///

use crate::error::{ForthError, Result};
use crate::runtime::ForthRuntime;
use crate::value::DU;

/// Serialization format requested by the mode byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    Text, //  0 => human readable
    Raw,  //  1 => raw little endian floats
    Npy,  //  2 => array archive
}

impl SaveMode {
    pub fn from_byte(mode: u8) -> Option<SaveMode> {
        match mode {
            0 => Some(SaveMode::Text),
            1 => Some(SaveMode::Raw),
            2 => Some(SaveMode::Npy),
            _ => None,
        }
    }
}

/// Host side of save and load
pub trait Persistence: Send + Sync {
    fn save(&self, object: DU, mode: SaveMode, fname: &str) -> Result<()>;
    fn load(&self, mode: SaveMode, fname: &str) -> Result<DU>;
}

impl ForthRuntime {
    fn persistence(&self) -> Result<&dyn Persistence> {
        self.persist.as_deref().ok_or(ForthError::NoObjectLayer)
    }

    fn pop_mode(&mut self, word: &str) -> Result<SaveMode> {
        let n = self.pop_int()?;
        u8::try_from(n)
            .ok()
            .and_then(SaveMode::from_byte)
            .ok_or_else(|| ForthError::Collaborator {
                op: word.to_string(),
                message: format!("unknown mode {n}"),
            })
    }

    fn file_name(&mut self, word: &str) -> Result<String> {
        self.input
            .next_idiom(' ')
            .ok_or_else(|| ForthError::MissingName(word.to_string()))
    }

    /// save <file> ( h mode -- ) write an object out
    pub fn f_save(&mut self) -> Result<()> {
        let mode = self.pop_mode("save")?;
        let object = self.pop()?;
        object.decode_handle()?;
        let fname = self.file_name("save")?;
        self.persistence()?.save(object, mode, &fname)?;
        tracing::info!(instance = self.id, file = %fname, ?mode, "object saved");
        Ok(())
    }

    /// load <file> ( mode -- h ) read an object back
    pub fn f_load(&mut self) -> Result<()> {
        let mode = self.pop_mode("load")?;
        let fname = self.file_name("load")?;
        let object = self.persistence()?.load(mode, &fname)?.checked()?;
        tracing::info!(instance = self.id, file = %fname, ?mode, "object loaded");
        self.push(object)
    }
}
