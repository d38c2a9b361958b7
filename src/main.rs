use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::Parser;

use eeprog::checksum::ChecksumMode;
use eeprog::eeprom::PagedEeprom;
use eeprog::image;
use eeprog::programmer::Programmer;
use eeprog::target::Target;
use eeprog::transport::serial::{DEFAULT_BAUDRATE, DEFAULT_PORT};
use eeprog::transport::{EmulatedTransport, SerialTransport, Transport};
use eeprog::{Config, LinkError, MemoryType};

#[derive(clap::Parser)]
#[clap(
    name = "eeprog",
    version,
    about = "Read and write I2C EEPROMs through a serial programmer board"
)]
struct Cli {
    /// Memory fitted on the board: 24LC16, X24645, 24LC64 or 24LC256
    #[clap(required_unless_present = "list_ports")]
    target: Option<MemoryType>,

    /// Read the whole memory into FILE
    #[clap(short, long, conflicts_with = "write")]
    read: bool,

    /// Write FILE to the whole memory
    #[clap(short, long)]
    write: bool,

    /// Image file [default: mem_out.bin for --read, mem_in.bin for --write]
    #[clap(short, long)]
    file: Option<PathBuf>,

    /// Serial port of the programmer
    #[clap(short, long, default_value = DEFAULT_PORT)]
    port: String,

    #[clap(short, long, default_value_t = DEFAULT_BAUDRATE)]
    baudrate: u32,

    /// YAML file overriding timeouts and retry limits
    #[clap(long)]
    config: Option<PathBuf>,

    /// Enforce CRC-16 on every frame; the board must be built with it too
    #[clap(long)]
    crc: bool,

    /// Run against an emulated board with a blank memory instead of a serial port
    #[clap(long)]
    emulate: bool,

    /// List available serial ports and exit
    #[clap(long)]
    list_ports: bool,

    /// Hexdump the memory after reading it
    #[clap(long, requires = "read")]
    dump: bool,

    /// Verbose output, repeat for more
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    if cli.list_ports {
        let ports = SerialTransport::scan_ports()?;
        if ports.is_empty() {
            log::warn!("No serial ports found");
        }
        for port in ports {
            println!("{}", port);
        }
        return Ok(());
    }
    let memory = cli
        .target
        .ok_or_else(|| anyhow::format_err!("no target memory given"))?;

    let mut config = Config::load(cli.config.as_deref())?;
    if cli.crc {
        config = config.with_checksum(ChecksumMode::Crc16);
    }

    // Check the image before anything goes on the wire
    let source = if cli.write {
        let path = cli.file.clone().unwrap_or_else(|| PathBuf::from("mem_in.bin"));
        let data = image::read_image_from_file(&path, memory.capacity())?;
        log::info!("Image size: {}", data.len());
        if data.len() != memory.capacity() {
            return Err(LinkError::SizeMismatch {
                expected: memory.capacity(),
                actual: data.len(),
            }
            .into());
        }
        Some(data)
    } else {
        None
    };

    let transport: Box<dyn Transport> = if cli.emulate {
        let eeprom = PagedEeprom::new(memory)?;
        Box::new(EmulatedTransport::new(Target::new(eeprom, config.target.clone())))
    } else {
        Box::new(SerialTransport::open(&cli.port, cli.baudrate)?)
    };

    // Ctrl+C unwinds through the programmer so the board gets DISCONNECT
    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = interrupt.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))?;

    let mut programmer = Programmer::new(transport, memory, config.link.clone())
        .with_progress(true)
        .with_interrupt(interrupt);
    programmer.connect()?;
    programmer.dump_info()?;

    if cli.read {
        let path = cli.file.unwrap_or_else(|| PathBuf::from("mem_out.bin"));
        let data = programmer.read()?;
        image::write_image_to_file(&path, &data)?;
        if cli.dump {
            let mut out = Vec::new();
            hxdmp::hexdump(&data, &mut out)?;
            println!("{}", String::from_utf8_lossy(&out));
        }
    } else if let Some(data) = source {
        programmer.write(&data)?;
        log::info!("Write done");
    } else {
        programmer.ping()?;
        log::info!("Programmer alive");
    }

    programmer.close()?;
    Ok(())
}
