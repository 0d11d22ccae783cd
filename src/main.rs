//! rpi4-spi command line tool
//!
//! Drives a BCM2711 SPI master directly through `/dev/mem`.
//!
//! # Usage
//!
//! ```bash
//! # Show the register window for SPI0
//! rpi4-spi info
//!
//! # Initialize SPI0 and dump its registers (needs root)
//! sudo rpi4-spi dump --speed 500
//!
//! # Send bytes
//! sudo rpi4-spi send 0x48 0x65 0x6c 0x6c 0x6f
//! sudo rpi4-spi send --text Hello --read
//!
//! # Dry run against simulated memory
//! rpi4-spi --simulate send --text Hello
//!
//! # Show and send Automatrix patterns (built-in name or text file)
//! rpi4-spi pattern dpc
//! sudo rpi4-spi send --pattern focus
//!
//! # Print the effective configuration as TOML
//! rpi4-spi --config spi.toml config
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

#[cfg(unix)]
use rpi4_spi::mmap::DevMem;
use rpi4_spi::mmap::{PeripheralMemoryMapper, PhysicalMemory, SimulatedMemory};
use rpi4_spi::pattern::{self, Frame, PatternConfig, PatternStream};
use rpi4_spi::spi::regs::{cs_bits, Register, SPI_REGISTER_LEN};
use rpi4_spi::spi::{Soc, SpiConfig, SpiSession};

/// Polled SPI master over /dev/mem
#[derive(Parser)]
#[command(name = "rpi4-spi")]
#[command(author = "Prasanna Gautam")]
#[command(version = "0.1.0")]
#[command(about = "User-space polled SPI master for the Raspberry Pi 4")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML config file (flags below override its values)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SPI instance index
    #[arg(short, long, global = true)]
    device: Option<u8>,

    /// Clock divider written to CLK
    #[arg(short, long, global = true)]
    speed: Option<u32>,

    /// SoC (bcm2835, bcm2837, bcm2711)
    #[arg(long, global = true)]
    soc: Option<Soc>,

    /// Bound on each status poll, in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Physical memory device
    #[arg(long, global = true, default_value = "/dev/mem")]
    mem: PathBuf,

    /// Run against simulated memory instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the computed register window without touching hardware
    Info,

    /// Initialize the device and print its registers
    Dump,

    /// Send bytes over SPI
    Send {
        /// Bytes to send, hex (0x48 or 48)
        #[arg(value_parser = parse_byte)]
        bytes: Vec<u8>,

        /// Send a string instead of hex bytes
        #[arg(short, long, conflicts_with = "bytes")]
        text: Option<String>,

        /// Send Automatrix pattern frames: upper, lower, left, right, dpc,
        /// focus, off, or a 16x16 text file
        #[arg(short, long, conflicts_with_all = ["bytes", "text"])]
        pattern: Option<String>,

        /// Capture and print the bytes received
        #[arg(short, long)]
        read: bool,
    },

    /// Encode Automatrix patterns and show the frames without sending
    Pattern {
        /// Built-in pattern name or 16x16 text file
        source: String,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = effective_config(&cli)?;
    let patterns = match &cli.config {
        Some(path) => PatternConfig::load(path)
            .with_context(|| format!("Failed to load pattern settings: {}", path.display()))?,
        None => PatternConfig::default(),
    };

    match &cli.command {
        Commands::Info => {
            print_info(&config);
            Ok(())
        }
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            print!("\n{}", patterns.to_toml_string()?);
            Ok(())
        }
        Commands::Pattern { source } => preview_patterns(source, &patterns),
        command => {
            if cli.simulate {
                let sim = SimulatedMemory::new(u64::from(config.physical_base()), SPI_REGISTER_LEN);
                // Idle controller with an empty TX FIFO
                sim.write_u32(
                    u64::from(config.physical_base()) + Register::Cs.offset() as u64,
                    cs_bits::TXD | cs_bits::DONE,
                );
                println!("{} Using simulated memory", "[*]".cyan().bold());
                run_command(sim, config, &patterns, command)
            } else {
                run_hardware(&cli.mem, config, &patterns, command)
            }
        }
    }
}

#[cfg(unix)]
fn run_hardware(
    mem: &Path,
    config: SpiConfig,
    patterns: &PatternConfig,
    command: &Commands,
) -> Result<()> {
    run_command(DevMem::with_path(mem), config, patterns, command)
}

#[cfg(not(unix))]
fn run_hardware(
    mem: &Path,
    _config: SpiConfig,
    _patterns: &PatternConfig,
    _command: &Commands,
) -> Result<()> {
    bail!(
        "{} is only available on unix hosts, use --simulate",
        mem.display()
    )
}

fn effective_config(cli: &Cli) -> Result<SpiConfig> {
    let mut config = match &cli.config {
        Some(path) => SpiConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => SpiConfig::default(),
    };

    if let Some(device) = cli.device {
        config.device = device;
    }
    if let Some(speed) = cli.speed {
        config.speed = speed;
    }
    if let Some(soc) = cli.soc {
        config.soc = soc;
    }
    if let Some(ms) = cli.timeout_ms {
        config.poll_timeout = Duration::from_millis(ms);
    }
    Ok(config)
}

fn run_command<P: PhysicalMemory>(
    memory: P,
    config: SpiConfig,
    patterns: &PatternConfig,
    command: &Commands,
) -> Result<()> {
    let device = config.device;
    let mut session = SpiSession::init(PeripheralMemoryMapper::new(memory), config)
        .with_context(|| format!("Failed to initialize SPI device {}", device))?;

    println!(
        "{} SPI{} initialized at 0x{:08x}",
        "[OK]".green().bold(),
        device,
        session.config().physical_base()
    );

    match command {
        Commands::Dump => {
            let snapshot = session.registers()?;
            println!("{}", "=".repeat(40));
            println!("{}", format!("SPI{} Registers", device).cyan().bold());
            println!("{}", "=".repeat(40));
            println!("{}", snapshot);
        }

        Commands::Send {
            bytes,
            text,
            pattern,
            read,
        } => {
            let payloads = match (text, pattern) {
                (Some(text), _) => vec![text.as_bytes().to_vec()],
                (None, Some(source)) => encode_patterns(source, patterns)?
                    .iter()
                    .map(|frame| frame.to_vec())
                    .collect(),
                (None, None) => vec![bytes.clone()],
            };

            for tx in &payloads {
                println!("{} {} bytes: {}", "[TX]".cyan().bold(), tx.len(), hex(tx));

                if *read {
                    let mut rx = vec![0u8; tx.len()];
                    session.transfer(tx, &mut rx)?;
                    println!("{} {} bytes: {}", "[RX]".cyan().bold(), rx.len(), hex(&rx));
                } else {
                    session.transact(tx)?;
                }
            }
            println!("{}", "[OK] Transfer complete".green());
        }

        Commands::Info | Commands::Config | Commands::Pattern { .. } => {
            bail!("command does not need a session")
        }
    }

    session.release();
    Ok(())
}

/// Resolve a built-in pattern name, falling back to a pattern file
fn resolve_patterns(source: &str, config: &PatternConfig) -> Result<Vec<pattern::Pattern>> {
    match config.builtin(source) {
        Some(patterns) => Ok(patterns),
        None => {
            let pattern = pattern::Pattern::load(Path::new(source))
                .with_context(|| format!("'{}' is neither a built-in pattern nor a pattern file", source))?;
            Ok(vec![pattern])
        }
    }
}

fn encode_patterns(source: &str, config: &PatternConfig) -> Result<Vec<Frame>> {
    let mut stream = PatternStream::new(config.encoder());
    for (i, pattern) in resolve_patterns(source, config)?.iter().enumerate() {
        stream
            .push(pattern)
            .with_context(|| format!("Pattern {} of '{}' cannot be encoded", i, source))?;
    }
    Ok(stream.frames().to_vec())
}

fn preview_patterns(source: &str, config: &PatternConfig) -> Result<()> {
    let frames = encode_patterns(source, config)?;
    let encoder = config.encoder();

    for (i, frame) in frames.iter().enumerate() {
        let decoded = encoder.decode(frame);
        println!("{}", "=".repeat(40));
        println!(
            "{}",
            format!("Pattern {} ({} LEDs lit)", i, decoded.lit()).cyan().bold()
        );
        println!("{}", "=".repeat(40));
        print!("{}", decoded);
        println!("{} {}", "[TX]".cyan().bold(), hex(frame));
    }
    Ok(())
}

fn print_info(config: &SpiConfig) {
    println!("{}", "=".repeat(50));
    println!("{}", format!("SPI{} ({})", config.device, config.soc).cyan().bold());
    println!("{}", "=".repeat(50));
    println!("  Peripheral base: 0x{:08x}", config.soc.peripheral_base());
    println!("  Register block:  0x{:08x} (+0x{:x})", config.physical_base(), SPI_REGISTER_LEN);
    println!("  Mode:            {:?}", config.mode);
    println!("  Clock divider:   {}", config.speed);
    println!("  Poll timeout:    {:?}", config.poll_timeout);
    for reg in Register::ALL {
        println!(
            "    {:<5} 0x{:08x}",
            reg.name(),
            config.physical_base() as usize + reg.offset()
        );
    }
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u8::from_str_radix(digits, 16).map_err(|e| format!("invalid byte '{}': {}", s, e))
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
