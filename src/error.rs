//! Error types for mapping, SPI setup, transfers and LED patterns

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::spi::{PollStage, TransferMode};

/// Failure to expose a physical window in the process address space
#[derive(Debug, Error)]
pub enum MapError {
    /// Zero-length window, or one that runs past the 32-bit physical space
    #[error("invalid physical range: base=0x{base:08x} length={length}")]
    InvalidRange { base: u32, length: usize },

    /// The caller lacks the privilege to open the physical memory device
    #[error("permission denied opening {}", path.display())]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The physical memory device could not be opened for another reason
    #[error("physical memory device {} unavailable", path.display())]
    DeviceUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The OS refused the mapping request
    #[error("failed to map 0x{length:x} bytes at physical 0x{base:08x}")]
    MapFailed {
        base: u64,
        length: usize,
        #[source]
        source: io::Error,
    },
}

/// Failure to bring up an SPI session
#[derive(Debug, Error)]
pub enum InitError {
    #[error("transfer mode {0:?} is not supported, only polled transfers are implemented")]
    UnsupportedMode(TransferMode),

    #[error("SPI device index {device} out of range (0..{count})")]
    InvalidDevice { device: u8, count: u8 },

    #[error("failed to map SPI registers")]
    Map(#[from] MapError),
}

/// Failure of a single SPI transaction
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("SPI session was never initialized")]
    NotInitialized,

    #[error("SPI session has been released, its register window is unmapped")]
    StaleSession,

    #[error("rx buffer holds {rx} bytes but {tx} bytes are being sent")]
    LengthMismatch { tx: usize, rx: usize },

    /// The hardware did not reach the expected status in time. Transfer-Active
    /// has already been de-asserted when this is returned.
    #[error("timed out after {timeout:?} in {stage} at byte {byte_index}")]
    PollTimeout {
        stage: PollStage,
        byte_index: usize,
        timeout: Duration,
    },
}

/// Failure to read a configuration or pattern file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid pattern file")]
    Pattern(#[from] PatternError),
}

/// Pattern that cannot be turned into an Automatrix frame
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("unreadable pattern shape: expected 16x16, received {rows}x{cols}")]
    Shape { rows: usize, cols: usize },

    #[error("invalid cell {found:?} at row {row}, column {col}")]
    InvalidCell { row: usize, col: usize, found: char },

    /// Too many LEDs lit at once for the matrix supply
    #[error("pattern lights {lit} LEDs, exceeding the power budget of {budget}")]
    PowerBudget { lit: usize, budget: usize },

    #[error("LED map must be a permutation of 0..8, got {0:?}")]
    InvalidLedMap(Vec<u8>),
}
