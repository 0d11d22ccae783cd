//! User-space SPI for the Raspberry Pi 4
//!
//! Register-level control of the BCM2711 SPI master from a Linux process,
//! without a kernel driver, plus the Automatrix LED pattern encoding that
//! rides on top of it.
//!
//! # Architecture
//!
//! ```text
//! Caller (SpiConfig, pattern::Frame)
//!     │
//!     ▼
//! ┌──────────────────────────┐
//! │        SpiSession        │  init / transact / release
//! └────────────┬─────────────┘
//!              ▼
//! ┌──────────────────────────┐
//! │     Transfer engine      │  TA, TXD, FIFO, DONE polling
//! └────────────┬─────────────┘
//!              ▼
//! ┌──────────────────────────┐
//! │  PeripheralMemoryMapper  │  page-aligned /dev/mem window
//! └────────────┬─────────────┘
//!              ▼
//!          BCM2711 HW
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use rpi4_spi::mmap::{DevMem, PeripheralMemoryMapper};
//! use rpi4_spi::spi::{SpiConfig, SpiSession};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mapper = PeripheralMemoryMapper::new(DevMem::new());
//! let mut spi = SpiSession::init(mapper, SpiConfig::new(0, 500))?;
//! spi.transact(b"Hello")?;
//! spi.release();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod mmap;
pub mod pattern;
pub mod spi;

pub use error::{ConfigError, InitError, MapError, PatternError, TransferError};
pub use mmap::{MappedRegion, PeripheralMemoryMapper, PhysicalAddressRange, PhysicalMemory};
pub use pattern::{Pattern, PatternEncoder};
pub use spi::{SpiConfig, SpiSession, TransferMode};
