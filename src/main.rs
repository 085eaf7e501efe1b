use std::net::IpAddr;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};

use netprog::constants::{net, uart, DEFAULT_READ_TIMEOUT, DEFAULT_TIMEOUT};
use netprog::format;
use netprog::transport::{self, Baudrate, NetTransport, SerialTransport, Transport};
use netprog::uart::{DataBits, Parity, StopBits, UartBaudrate};
use netprog::{ChipDB, Flashing, MemoryImage, MemoryOp, Programmer, SessionConfig};
use netprog::{UartConfig, UartSession};

#[derive(clap::Parser)]
#[command(
    name = "netprog",
    about = "Program AVR MCUs through a networked or serial ISP bridge"
)]
struct Cli {
    /// Part id or name, e.g. m328p
    #[arg(short = 'p', long = "part")]
    part: Option<String>,

    /// Memory operation memory:op:target, e.g. flash:w:firmware.hex or hfuse:w:0xD9
    #[arg(short = 'U', value_name = "MEMORY:OP:TARGET")]
    operations: Vec<String>,

    /// Erase the chip before anything else. Implied by a flash write
    #[arg(short = 'e', long = "erase")]
    erase: bool,

    /// Read back written flash/EEPROM and compare
    #[arg(short = 'V', long = "verify")]
    verify: bool,

    /// Serial device of a directly attached bridge
    #[arg(short = 'P', long = "port")]
    port: Option<String>,

    #[arg(long, value_enum, default_value_t = Baudrate::default())]
    baud: Baudrate,

    /// Bridge address; discovered by broadcast when omitted
    #[arg(long)]
    host: Option<IpAddr>,

    /// Local port the bridge answers discovery on
    #[arg(long, default_value_t = net::DISCOVERY_PORT)]
    discovery_port: u16,

    /// Discovery key
    #[arg(long, default_value = net::DEFAULT_KEY)]
    key: String,

    /// Reply timeout of programming requests
    #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_millis() as u64)]
    timeout_ms: u64,

    /// Reply timeout of memory reads
    #[arg(long, default_value_t = DEFAULT_READ_TIMEOUT.as_secs())]
    read_timeout_s: u64,

    /// More output, repeat for packet traces
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// List known parts and exit
    #[arg(long)]
    list_parts: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the target's UART output through the bridge until Ctrl-C
    Monitor {
        #[arg(long = "uart-baud", value_enum, default_value_t = UartBaudrate::default())]
        baudrate: UartBaudrate,

        #[arg(long, value_enum, default_value_t = Parity::default())]
        parity: Parity,

        #[arg(long, value_enum, default_value_t = DataBits::default())]
        data_bits: DataBits,

        #[arg(long, value_enum, default_value_t = StopBits::default())]
        stop_bits: StopBits,
    },
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let level = match (cli.quiet, cli.verbose) {
        (true, _) => simplelog::LevelFilter::Warn,
        (false, 0) => simplelog::LevelFilter::Info,
        (false, 1) => simplelog::LevelFilter::Debug,
        (false, _) => simplelog::LevelFilter::Trace,
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(e: &anyhow::Error) -> u8 {
    e.downcast_ref::<netprog::Error>()
        .map(|e| e.category().exit_code() as u8)
        .unwrap_or(1)
}

fn run(cli: Cli) -> Result<()> {
    let db = ChipDB::load()?;
    if cli.list_parts {
        for chip in db.parts() {
            println!("{:<8} {}", chip.id, chip.name);
        }
        return Ok(());
    }

    if let Some(Commands::Monitor {
        baudrate,
        parity,
        data_bits,
        stop_bits,
    }) = cli.command
    {
        let config = UartConfig {
            baudrate,
            parity,
            data_bits,
            stop_bits,
        };
        return monitor(&cli, config);
    }

    let part = cli.part.as_deref().ok_or_else(|| {
        netprog::Error::InvalidArgument("Please specify the MCU part with -p".into())
    })?;
    let chip = db.find_chip(part)?;

    // Everything the command line asks for is checked before touching the device
    let mut operations = Vec::with_capacity(cli.operations.len());
    for op in &cli.operations {
        let op: MemoryOp = op.parse()?;
        let image = match &op {
            MemoryOp::WriteMemory { path, .. } => Some(format::read_image(path)?),
            _ => None,
        };
        operations.push((op, image));
    }

    let config = SessionConfig {
        timeout: Duration::from_millis(cli.timeout_ms),
        read_timeout: Duration::from_secs(cli.read_timeout_s),
        progress: !cli.quiet,
    };
    let transport = open_transport(&cli)?;

    let mut flashing = Flashing::new(transport, chip, config);
    flashing.dump_info();
    flashing.init()?;

    if cli.erase || operations.iter().any(|(op, _)| op.is_flash_write()) {
        flashing.erase()?;
    }

    for (op, image) in &operations {
        let started = Instant::now();
        execute(&mut flashing, op, image.as_ref(), cli.verify)?;
        log::info!(
            "{} done in {:.3}s",
            op.memory_name(),
            started.elapsed().as_secs_f64()
        );
    }

    flashing.stop()?;
    Ok(())
}

fn open_transport(cli: &Cli) -> Result<Box<dyn Transport>> {
    let transport: Box<dyn Transport> = match &cli.port {
        Some(port) => Box::new(SerialTransport::open(port, cli.baud)?),
        None => {
            let host = match cli.host {
                Some(host) => host,
                None => transport::discover(&cli.key, cli.discovery_port)?,
            };
            Box::new(NetTransport::connect(host)?)
        }
    };
    Ok(transport)
}

fn monitor(cli: &Cli, config: UartConfig) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))?;

    let transport = open_transport(cli)?;
    let timeout = Duration::from_millis(cli.timeout_ms);
    let mut session = UartSession::open(transport, config, timeout)?;
    let stdout = std::io::stdout();
    let forwarded = session.forward(&mut stdout.lock(), &running, uart::POLL_INTERVAL)?;
    session.close()?;
    log::info!("Forwarded {} bytes", forwarded);
    Ok(())
}

fn execute<T: Transport>(
    flashing: &mut Flashing<T>,
    op: &MemoryOp,
    image: Option<&MemoryImage>,
    verify: bool,
) -> Result<()> {
    match op {
        MemoryOp::WriteMemory { memory, path } => {
            let image = image.ok_or_else(|| {
                netprog::Error::InternalError(format!("{} was not loaded", path.display()))
            })?;
            log::info!("Writing {} bytes from {} to {}", image.len(), path.display(), memory);
            flashing.burn_memory(*memory, image)?;
            if verify {
                flashing.verify(*memory, image)?;
            }
        }
        MemoryOp::ReadMemory { memory, path } => {
            let dump = flashing.read_memory(*memory)?;
            format::write_image(path, *memory, &dump)?;
        }
        MemoryOp::WriteFuse { fuse, value } => {
            flashing.write_fuse(*fuse, *value)?;
        }
        MemoryOp::ReadFuse { fuse, path } => {
            let value = flashing.read_fuse(*fuse)?;
            if let Some(path) = path {
                format::write_bytes(path, &[value])?;
            }
        }
    }
    Ok(())
}
