//! BCM2711 SPI master, polled mode
//!
//! # Hardware Configuration
//!
//! SPI0 pins on the 40-pin header (ALT0):
//!
//! | Function | BCM GPIO | Physical Pin |
//! |----------|----------|--------------|
//! | SCLK     | GPIO 11  | Pin 23       |
//! | MOSI     | GPIO 10  | Pin 19       |
//! | MISO     | GPIO 9   | Pin 21       |
//! | CE0      | GPIO 8   | Pin 24       |
//! | CE1      | GPIO 7   | Pin 26       |
//!
//! Pin muxing is left to the OS (`dtparam=spi=on`); this module only touches
//! the SPI register block.

pub mod config;
pub mod regs;
pub mod session;
pub mod transfer;

pub use config::{Soc, SpiConfig, TransferMode};
pub use regs::{Register, RegisterIo, RegisterSnapshot};
pub use session::SpiSession;
pub use transfer::PollStage;
