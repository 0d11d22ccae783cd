//! SPI sessions
//!
//! A session owns the mapped register window of one SPI instance together
//! with the configuration that produced it. Sessions are created by
//! [`SpiSession::init`] and threaded explicitly into every transaction.
//! Only one session should drive a given physical instance at a time; the
//! hardware has a single FIFO and chip-select state machine.

use log::{debug, log_enabled, Level};

use super::config::{SpiConfig, TransferMode};
use super::regs::{MmioRegisters, RegisterSnapshot, SPI_INSTANCE_COUNT};
use super::transfer;
use crate::error::{InitError, TransferError};
use crate::mmap::{MappedRegion, PeripheralMemoryMapper, PhysicalMemory};

enum SessionState<P: PhysicalMemory> {
    Uninitialized,
    Live {
        mapper: PeripheralMemoryMapper<P>,
        region: MappedRegion,
    },
    Released,
}

/// Polled SPI master session over one mapped register block
pub struct SpiSession<P: PhysicalMemory> {
    config: SpiConfig,
    state: SessionState<P>,
}

impl<P: PhysicalMemory> Default for SpiSession<P> {
    /// A placeholder session; every transaction fails with `NotInitialized`
    fn default() -> Self {
        Self {
            config: SpiConfig::default(),
            state: SessionState::Uninitialized,
        }
    }
}

impl<P: PhysicalMemory> SpiSession<P> {
    /// Map the configured SPI instance and program clock and mode
    pub fn init(mapper: PeripheralMemoryMapper<P>, config: SpiConfig) -> Result<Self, InitError> {
        if config.mode != TransferMode::Polled {
            return Err(InitError::UnsupportedMode(config.mode));
        }
        if config.device >= SPI_INSTANCE_COUNT {
            return Err(InitError::InvalidDevice {
                device: config.device,
                count: SPI_INSTANCE_COUNT,
            });
        }

        let region = mapper.map(config.register_range()?)?;
        {
            let regs = MmioRegisters::new(&region);
            transfer::configure(&regs, &config);

            if log_enabled!(Level::Debug) {
                debug!(
                    "SPI{} registers after init:\n{}",
                    config.device,
                    RegisterSnapshot::capture(&regs)
                );
            }
        }
        debug!(
            "SPI device {} initialized at 0x{:08x} (CDIV {})",
            config.device,
            config.physical_base(),
            config.speed
        );

        Ok(Self {
            config,
            state: SessionState::Live { mapper, region },
        })
    }

    pub fn config(&self) -> &SpiConfig {
        &self.config
    }

    /// Whether the register window is still mapped
    pub fn is_live(&self) -> bool {
        matches!(self.state, SessionState::Live { .. })
    }

    /// Send `tx`, discarding the bytes clocked in
    pub fn transact(&mut self, tx: &[u8]) -> Result<(), TransferError> {
        let timeout = self.config.poll_timeout;
        let regs = self.registers_io()?;
        transfer::run(&regs, tx, None, timeout)
    }

    /// Send `tx` and store the byte received alongside each one in `rx`
    pub fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), TransferError> {
        let timeout = self.config.poll_timeout;
        let regs = self.registers_io()?;
        transfer::run(&regs, tx, Some(rx), timeout)
    }

    /// Read all six registers
    pub fn registers(&self) -> Result<RegisterSnapshot, TransferError> {
        Ok(RegisterSnapshot::capture(&self.registers_io()?))
    }

    /// Unmap the register window; later transactions fail with `StaleSession`
    pub fn release(&mut self) {
        match std::mem::replace(&mut self.state, SessionState::Released) {
            SessionState::Live { mapper, region } => {
                mapper.unmap(region);
                debug!("SPI device {} released", self.config.device);
            }
            SessionState::Uninitialized => self.state = SessionState::Uninitialized,
            SessionState::Released => {}
        }
    }

    fn registers_io(&self) -> Result<MmioRegisters<'_>, TransferError> {
        match &self.state {
            SessionState::Live { region, .. } => Ok(MmioRegisters::new(region)),
            SessionState::Uninitialized => Err(TransferError::NotInitialized),
            SessionState::Released => Err(TransferError::StaleSession),
        }
    }
}

impl<P: PhysicalMemory> Drop for SpiSession<P> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MapError;
    use crate::mmap::{SimFault, SimulatedMemory};
    use crate::spi::regs::{cs_bits, Register, SPI0_OFFSET};
    use crate::spi::Soc;
    use std::time::Duration;

    const SPI0: u64 = 0xFE20_4000;

    fn sim() -> SimulatedMemory {
        SimulatedMemory::new(u64::from(Soc::Bcm2711.peripheral_base() + SPI0_OFFSET), 0x1000)
    }

    fn reg(device: u8, reg: Register) -> u64 {
        SPI0 + u64::from(device) * 0x200 + reg.offset() as u64
    }

    fn init(sim: &SimulatedMemory, config: SpiConfig) -> SpiSession<SimulatedMemory> {
        SpiSession::init(PeripheralMemoryMapper::new(sim.clone()), config).unwrap()
    }

    #[test]
    fn test_init_programs_clock_divider() {
        let sim = sim();
        let _session = init(&sim, SpiConfig::new(0, 1234));
        assert_eq!(sim.read_u32(reg(0, Register::Clk)), 1234);
    }

    #[test]
    fn test_init_clears_mode_and_dma_bits() {
        let sim = sim();
        sim.write_u32(
            reg(1, Register::Cs),
            cs_bits::CPOL | cs_bits::CPHA | cs_bits::DMAEN | cs_bits::CSPOL,
        );

        let _session = init(&sim, SpiConfig::new(1, 64));

        let cs = sim.read_u32(reg(1, Register::Cs));
        assert_eq!(cs & cs_bits::DMAEN, 0);
        assert_eq!(cs & (cs_bits::CPOL | cs_bits::CPHA), 0);
        assert_eq!(cs & cs_bits::CSPOL, cs_bits::CSPOL);
        assert_eq!(sim.read_u32(reg(1, Register::Clk)), 64);
        // Neighbouring instance untouched
        assert_eq!(sim.read_u32(reg(0, Register::Clk)), 0);
    }

    #[test]
    fn test_init_rejects_unsupported_mode() {
        let sim = sim();
        for mode in [TransferMode::Interrupt, TransferMode::Dma] {
            let result = SpiSession::init(
                PeripheralMemoryMapper::new(sim.clone()),
                SpiConfig::new(0, 500).with_mode(mode),
            );
            assert!(matches!(result, Err(InitError::UnsupportedMode(m)) if m == mode));
        }
        assert_eq!(sim.live_mappings(), 0);
    }

    #[test]
    fn test_init_rejects_invalid_device() {
        let sim = sim();
        let result = SpiSession::init(PeripheralMemoryMapper::new(sim.clone()), SpiConfig::new(7, 500));
        assert!(matches!(result, Err(InitError::InvalidDevice { device: 7, count: 7 })));
    }

    #[test]
    fn test_init_propagates_map_error() {
        let sim = sim();
        sim.fail_open(Some(SimFault::PermissionDenied));

        let result = SpiSession::init(PeripheralMemoryMapper::new(sim.clone()), SpiConfig::default());
        assert!(matches!(
            result,
            Err(InitError::Map(MapError::PermissionDenied { .. }))
        ));
        assert_eq!(sim.open_handles(), 0);
    }

    #[test]
    fn test_transact_hello() {
        let sim = sim();
        let mut session = init(&sim, SpiConfig::default());
        let extra = cs_bits::CSPOL | cs_bits::INTD | 0b01;
        sim.write_u32(reg(0, Register::Cs), cs_bits::TXD | cs_bits::DONE | extra);

        session.transact(&[0x48, 0x65, 0x6c, 0x6c, 0x6f]).unwrap();

        assert_eq!(sim.read_u32(reg(0, Register::Fifo)), 0x6f);
        let cs = sim.read_u32(reg(0, Register::Cs));
        assert_eq!(cs & cs_bits::TA, 0);
        assert_eq!(cs, cs_bits::TXD | cs_bits::DONE | extra);
    }

    #[test]
    fn test_transact_empty() {
        let sim = sim();
        let mut session = init(&sim, SpiConfig::default());
        sim.write_u32(reg(0, Register::Fifo), 0xAB);

        session.transact(&[]).unwrap();

        assert_eq!(sim.read_u32(reg(0, Register::Fifo)), 0xAB);
        assert_eq!(sim.read_u32(reg(0, Register::Cs)) & cs_bits::TA, 0);
    }

    #[test]
    fn test_transact_times_out_without_status() {
        let sim = sim();
        let config = SpiConfig::default().with_poll_timeout(Duration::from_millis(5));
        let mut session = init(&sim, config);
        sim.write_u32(reg(0, Register::Cs), cs_bits::CSPOL);

        let err = session.transact(b"x").unwrap_err();
        assert!(matches!(err, TransferError::PollTimeout { byte_index: 0, .. }));
        assert_eq!(sim.read_u32(reg(0, Register::Cs)), cs_bits::CSPOL);
    }

    #[test]
    fn test_transfer_length_mismatch() {
        let sim = sim();
        let mut session = init(&sim, SpiConfig::default());
        let mut rx = [0u8; 1];
        assert!(matches!(
            session.transfer(b"ab", &mut rx),
            Err(TransferError::LengthMismatch { tx: 2, rx: 1 })
        ));
    }

    #[test]
    fn test_transact_after_release_is_stale() {
        let sim = sim();
        let mut session = init(&sim, SpiConfig::default());
        session.release();
        assert!(!session.is_live());
        assert_eq!(sim.live_mappings(), 0);

        let before = sim.read_u32(reg(0, Register::Cs));
        assert!(matches!(session.transact(b"hi"), Err(TransferError::StaleSession)));
        assert!(matches!(session.registers(), Err(TransferError::StaleSession)));
        assert_eq!(sim.read_u32(reg(0, Register::Cs)), before);

        // Releasing twice is harmless
        session.release();
        assert_eq!(sim.live_mappings(), 0);
    }

    #[test]
    fn test_uninitialized_session() {
        let mut session: SpiSession<SimulatedMemory> = SpiSession::default();
        assert!(matches!(session.transact(b"hi"), Err(TransferError::NotInitialized)));
        assert!(!session.is_live());
    }

    #[test]
    fn test_drop_releases_mapping() {
        let sim = sim();
        let session = init(&sim, SpiConfig::default());
        assert_eq!(sim.live_mappings(), 1);
        drop(session);
        assert_eq!(sim.live_mappings(), 0);
        assert_eq!(sim.open_handles(), 0);
    }

    #[test]
    fn test_registers_snapshot() {
        let sim = sim();
        let session = init(&sim, SpiConfig::new(0, 32));
        sim.write_u32(reg(0, Register::Dc), 0x3020_1050);

        let snapshot = session.registers().unwrap();
        assert_eq!(snapshot.clk, 32);
        assert_eq!(snapshot.dc, 0x3020_1050);
    }
}
