//! BCM2711 SPI register block
//!
//! Register map from the BCM2711 ARM Peripherals datasheet, section 9.5.
//! Every instance is six consecutive 32-bit registers:
//!
//! | Offset | Register | Function                       |
//! |--------|----------|--------------------------------|
//! | 0x00   | CS       | Control and status             |
//! | 0x04   | FIFO     | TX and RX FIFOs                |
//! | 0x08   | CLK      | Clock divider                  |
//! | 0x0C   | DLEN     | Data length (DMA mode only)    |
//! | 0x10   | LTOH     | LoSSI mode TOH                 |
//! | 0x14   | DC       | DMA DREQ controls              |

use std::fmt;

use crate::mmap::MappedRegion;

/// SPI0 offset from the peripheral base (ARM physical addressing)
pub const SPI0_OFFSET: u32 = 0x20_4000;

/// Distance between consecutive SPI instances
pub const SPI_INSTANCE_STRIDE: u32 = 0x200;

/// Number of instance slots addressable from SPI0 with [`SPI_INSTANCE_STRIDE`]
pub const SPI_INSTANCE_COUNT: u8 = 7;

/// Length of one register block
pub const SPI_REGISTER_LEN: usize = 0x18;

/// CS register bits
pub mod cs_bits {
    /// Chip select (2 bits)
    pub const CS_MASK: u32 = 0x03;
    /// Clock phase: 0 = first SCLK transition at middle of data bit
    pub const CPHA: u32 = 1 << 2;
    /// Clock polarity: 0 = rest state of clock low
    pub const CPOL: u32 = 1 << 3;
    /// Clear TX FIFO (one-shot)
    pub const CLEAR_TX: u32 = 1 << 4;
    /// Clear RX FIFO (one-shot)
    pub const CLEAR_RX: u32 = 1 << 5;
    /// Chip select polarity
    pub const CSPOL: u32 = 1 << 6;
    /// Transfer active
    pub const TA: u32 = 1 << 7;
    /// DMA enable
    pub const DMAEN: u32 = 1 << 8;
    /// Interrupt on done
    pub const INTD: u32 = 1 << 9;
    /// Interrupt on RXR
    pub const INTR: u32 = 1 << 10;
    /// Auto deassert chip select at end of DMA transfer
    pub const ADCS: u32 = 1 << 11;
    /// Read enable (bidirectional mode)
    pub const REN: u32 = 1 << 12;
    /// LoSSI enable
    pub const LEN: u32 = 1 << 13;
    /// Transfer done
    pub const DONE: u32 = 1 << 16;
    /// RX FIFO contains data
    pub const RXD: u32 = 1 << 17;
    /// TX FIFO has space for at least one byte
    pub const TXD: u32 = 1 << 18;
    /// RX FIFO needs reading (3/4 full)
    pub const RXR: u32 = 1 << 19;
    /// RX FIFO full
    pub const RXF: u32 = 1 << 20;
    /// CS0 polarity
    pub const CSPOL0: u32 = 1 << 21;
    /// CS1 polarity
    pub const CSPOL1: u32 = 1 << 22;
    /// CS2 polarity
    pub const CSPOL2: u32 = 1 << 23;

    /// Read-only status bits
    pub const STATUS_MASK: u32 = DONE | RXD | TXD | RXR | RXF;
}

/// One register of the SPI block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    Cs,
    Fifo,
    Clk,
    Dlen,
    Ltoh,
    Dc,
}

impl Register {
    pub const ALL: [Register; 6] = [
        Register::Cs,
        Register::Fifo,
        Register::Clk,
        Register::Dlen,
        Register::Ltoh,
        Register::Dc,
    ];

    /// Byte offset from the start of the block
    pub const fn offset(self) -> usize {
        match self {
            Register::Cs => 0x00,
            Register::Fifo => 0x04,
            Register::Clk => 0x08,
            Register::Dlen => 0x0C,
            Register::Ltoh => 0x10,
            Register::Dc => 0x14,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Register::Cs => "CS",
            Register::Fifo => "FIFO",
            Register::Clk => "CLK",
            Register::Dlen => "DLEN",
            Register::Ltoh => "LTOH",
            Register::Dc => "DC",
        }
    }
}

/// Access to an SPI register block
///
/// Implementations must perform every access against live hardware state:
/// no caching, no elision, no reordering.
pub trait RegisterIo {
    fn read(&self, reg: Register) -> u32;

    fn write(&self, reg: Register, value: u32);

    /// Read-modify-write setting `mask`
    fn set_bits(&self, reg: Register, mask: u32) {
        let value = self.read(reg);
        self.write(reg, value | mask);
    }

    /// Read-modify-write clearing `mask`, leaving every other bit as read
    fn clear_bits(&self, reg: Register, mask: u32) {
        let value = self.read(reg);
        self.write(reg, value & !mask);
    }
}

/// Register block overlaid on a mapped region, accessed with volatile loads
/// and stores
pub struct MmioRegisters<'a> {
    region: &'a MappedRegion,
}

impl<'a> MmioRegisters<'a> {
    pub fn new(region: &'a MappedRegion) -> Self {
        debug_assert!(region.len() >= SPI_REGISTER_LEN);
        Self { region }
    }
}

impl RegisterIo for MmioRegisters<'_> {
    #[inline]
    fn read(&self, reg: Register) -> u32 {
        self.region.read_u32(reg.offset())
    }

    #[inline]
    fn write(&self, reg: Register, value: u32) {
        self.region.write_u32(reg.offset(), value)
    }
}

/// Values of all six registers at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSnapshot {
    pub cs: u32,
    pub fifo: u32,
    pub clk: u32,
    pub dlen: u32,
    pub ltoh: u32,
    pub dc: u32,
}

impl RegisterSnapshot {
    /// Read every register in block order
    ///
    /// Reading FIFO pops a byte when the RX FIFO holds data.
    pub fn capture<R: RegisterIo + ?Sized>(regs: &R) -> Self {
        Self {
            cs: regs.read(Register::Cs),
            fifo: regs.read(Register::Fifo),
            clk: regs.read(Register::Clk),
            dlen: regs.read(Register::Dlen),
            ltoh: regs.read(Register::Ltoh),
            dc: regs.read(Register::Dc),
        }
    }

    pub fn get(&self, reg: Register) -> u32 {
        match reg {
            Register::Cs => self.cs,
            Register::Fifo => self.fifo,
            Register::Clk => self.clk,
            Register::Dlen => self.dlen,
            Register::Ltoh => self.ltoh,
            Register::Dc => self.dc,
        }
    }
}

impl fmt::Display for RegisterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, reg) in Register::ALL.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{:<5} 0x{:08x}", format!("{}:", reg.name()), self.get(*reg))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct Plain(RefCell<[u32; 6]>);

    impl RegisterIo for Plain {
        fn read(&self, reg: Register) -> u32 {
            self.0.borrow()[reg.offset() / 4]
        }

        fn write(&self, reg: Register, value: u32) {
            self.0.borrow_mut()[reg.offset() / 4] = value;
        }
    }

    #[test]
    fn test_offsets_are_consecutive_words() {
        for (i, reg) in Register::ALL.iter().enumerate() {
            assert_eq!(reg.offset(), i * 4);
        }
        assert_eq!(Register::Dc.offset() + 4, SPI_REGISTER_LEN);
    }

    #[test]
    fn test_status_bit_positions() {
        assert_eq!(cs_bits::TA, 0x80);
        assert_eq!(cs_bits::DONE, 0x1_0000);
        assert_eq!(cs_bits::RXD, 0x2_0000);
        assert_eq!(cs_bits::TXD, 0x4_0000);
        assert_eq!(cs_bits::DMAEN, 0x100);
        assert_eq!(cs_bits::CPHA | cs_bits::CPOL, 0b1100);
    }

    #[test]
    fn test_clear_bits_preserves_others() {
        let regs = Plain(RefCell::new([0; 6]));
        regs.write(Register::Cs, cs_bits::TA | cs_bits::CSPOL | 0b01);
        regs.clear_bits(Register::Cs, cs_bits::TA);
        assert_eq!(regs.read(Register::Cs), cs_bits::CSPOL | 0b01);
    }

    #[test]
    fn test_snapshot_display() {
        let regs = Plain(RefCell::new([0x0004_1000, 0, 0x1f4, 0, 0x1, 0x3020_1050]));
        let text = RegisterSnapshot::capture(&regs).to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], "CS:   0x00041000");
        assert_eq!(lines[2], "CLK:  0x000001f4");
        assert_eq!(lines[5], "DC:   0x30201050");
    }
}
