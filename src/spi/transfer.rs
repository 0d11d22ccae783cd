//! Polled transfer engine
//!
//! Drives the controller purely through its registers:
//!
//! ```text
//! Idle ──TA=1──► Active ──┬─► WaitForFifoSpace ─► Loaded ─► WaitForDone ─┐
//!                         │                                              │
//!                         └──────────────── next byte ◄──────────────────┘
//!                         │
//!                         └─ all bytes sent ──TA=0──► Idle
//! ```
//!
//! Every poll is bounded. When a bound expires, Transfer-Active is dropped
//! before the error is reported so the controller does not stay mid-frame.

use std::fmt;
use std::hint;
use std::time::{Duration, Instant};

use log::{trace, warn};

use super::config::{SpiConfig, TransferMode};
use super::regs::{cs_bits, Register, RegisterIo};
use crate::error::TransferError;

/// Upper bound on bytes drained after a frame; the RX FIFO is 64 bytes deep
const RX_FIFO_DEPTH: usize = 64;

/// Status wait a transfer can time out in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStage {
    /// Waiting for TXD (TX FIFO has space)
    WaitForFifoSpace,
    /// Waiting for DONE (frame shifted out)
    WaitForDone,
}

impl fmt::Display for PollStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollStage::WaitForFifoSpace => f.write_str("wait for TX FIFO space"),
            PollStage::WaitForDone => f.write_str("wait for transfer done"),
        }
    }
}

/// Program clock divider, SPI mode 0 and, for polled operation, DMA off
pub fn configure<R: RegisterIo + ?Sized>(regs: &R, config: &SpiConfig) {
    regs.write(Register::Clk, config.speed);

    // CPOL=0 (clock idles low), CPHA=0 (first edge mid-bit)
    let mut cs = regs.read(Register::Cs);
    cs &= !(cs_bits::CPOL | cs_bits::CPHA);
    if config.mode == TransferMode::Polled {
        cs &= !cs_bits::DMAEN;
    }
    regs.write(Register::Cs, cs);
}

/// Run one transaction: assert TA, shift out `tx` byte by byte, de-assert TA
///
/// When `rx` is given it must be as long as `tx` and receives the byte
/// clocked in alongside each transmitted one. Otherwise received bytes are
/// drained and dropped.
pub fn run<R: RegisterIo + ?Sized>(
    regs: &R,
    tx: &[u8],
    mut rx: Option<&mut [u8]>,
    timeout: Duration,
) -> Result<(), TransferError> {
    if let Some(rx) = rx.as_deref() {
        if rx.len() != tx.len() {
            return Err(TransferError::LengthMismatch {
                tx: tx.len(),
                rx: rx.len(),
            });
        }
    }

    trace!("spi: TA=1, {} bytes", tx.len());
    regs.set_bits(Register::Cs, cs_bits::TA);

    let result = tx.iter().enumerate().try_for_each(|(index, &byte)| -> Result<(), TransferError> {
        poll_until(regs, cs_bits::TXD, PollStage::WaitForFifoSpace, index, timeout)?;
        regs.write(Register::Fifo, u32::from(byte));
        trace!("spi: byte {} = 0x{:02x} loaded", index, byte);
        poll_until(regs, cs_bits::DONE, PollStage::WaitForDone, index, timeout)?;

        let slot = rx.as_deref_mut().map(|rx| &mut rx[index]);
        drain_rx(regs, slot);
        Ok(())
    });

    regs.clear_bits(Register::Cs, cs_bits::TA);
    trace!("spi: TA=0");

    if let Err(ref err) = result {
        warn!("spi transfer aborted, transfer-active de-asserted: {}", err);
    }
    result
}

fn poll_until<R: RegisterIo + ?Sized>(
    regs: &R,
    mask: u32,
    stage: PollStage,
    byte_index: usize,
    timeout: Duration,
) -> Result<(), TransferError> {
    let deadline = Instant::now() + timeout;
    loop {
        if regs.read(Register::Cs) & mask != 0 {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(TransferError::PollTimeout {
                stage,
                byte_index,
                timeout,
            });
        }
        hint::spin_loop();
    }
}

/// Empty the RX FIFO, keeping the first byte if there is somewhere to put it
fn drain_rx<R: RegisterIo + ?Sized>(regs: &R, mut slot: Option<&mut u8>) {
    for _ in 0..RX_FIFO_DEPTH {
        if regs.read(Register::Cs) & cs_bits::RXD == 0 {
            break;
        }
        let value = regs.read(Register::Fifo) as u8;
        if let Some(slot) = slot.take() {
            *slot = value;
        }
    }
}
