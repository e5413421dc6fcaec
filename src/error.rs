//! Error types for the capture → render → present pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by the overlay pipeline.
///
/// None of these terminate the process. `DeviceLost` is the only variant
/// that permanently disables rendering; everything else leaves the engine
/// usable.
#[derive(Error, Debug)]
pub enum CrtError {
    /// An operation was requested before its precondition was met
    #[error("Not ready: {0}")]
    Unready(String),

    /// Shader source failed to parse, validate or link
    #[error("Shader compile failed: {0}")]
    Compile(String),

    /// Texture import or allocation failed for a single frame
    #[error("GPU resource error: {0}")]
    Resource(String),

    /// The GPU device is gone; the engine must be rebuilt
    #[error("GPU device lost: {0}")]
    DeviceLost(String),

    /// Capture session could not start or continue
    #[error("Capture failed: {0}")]
    Capture(String),

    /// Display identifier does not resolve to an active display
    #[error("Display {0} not found")]
    DisplayNotFound(u32),

    /// `reload_shader` called before any shader compiled
    #[error("No shader source to reload")]
    NoSourceToReload,

    /// Reading a shader or config file failed
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is malformed
    #[error("Config error: {0}")]
    Config(String),
}

impl CrtError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CrtError>;
