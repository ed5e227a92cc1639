use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};

use rfisp::device::parse_signature_text;
use rfisp::format::{read_image_from_file, write_image_to_file};
use rfisp::transport::{Baudrate, Loopback, SerialBridge};
use rfisp::{Flashing, MemoryTarget, PartDB, SessionConfig, Transport};

#[derive(Parser)]
#[command(
    name = "rfisp",
    version,
    about = "Program AVR parts over a 2.4 GHz radio link through their bootloader"
)]
struct Cli {
    /// Serial port of the radio bridge, the first one found if omitted
    #[arg(long, short, global = true)]
    port: Option<String>,

    #[arg(long, short, global = true, value_enum, default_value_t = Baudrate::default())]
    baudrate: Baudrate,

    /// Talk to a simulated bootloader on a blank part instead of the radio
    #[arg(long, global = true, value_name = "PART")]
    simulate: Option<String>,

    /// Session settings (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// HELLO attempts before giving up
    #[arg(long, global = true)]
    retries: Option<u8>,

    /// -v for debug output, -vv to trace every frame
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Normalize a record file, optionally dumping its contents
    Hex {
        input: PathBuf,
        /// Where to write the re-serialized records, stdout if omitted
        output: Option<PathBuf>,
        #[arg(long)]
        dump: bool,
    },
    /// Handshake with the bootloader and print what it reports
    Test {
        /// Expected signature (e.g. 1e950f) or part name
        signature: String,
    },
    /// Program flash, verify it and start the application
    Upload { signature: String, path: PathBuf },
    /// Read flash into a record file
    Download {
        signature: String,
        path: PathBuf,
        /// First address, 0 if omitted
        #[arg(long, value_parser = parse_address)]
        start: Option<u16>,
        /// Last address, the end of the application section if omitted
        #[arg(long, value_parser = parse_address)]
        end: Option<u16>,
    },
    /// EEPROM access
    #[command(subcommand)]
    Eeprom(EepromCommand),
}

#[derive(Subcommand)]
enum EepromCommand {
    /// Write the allocated bytes of a record file and verify them
    Upload { signature: String, path: PathBuf },
    /// Read the whole EEPROM into a record file
    Download { signature: String, path: PathBuf },
}

fn parse_address(s: &str) -> std::result::Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address {:?}: {}", s, e))
}

/// Accepts a raw signature or a part name from the database.
fn resolve_signature(s: &str) -> Result<[u8; 3]> {
    if let Ok(signature) = parse_signature_text(s) {
        return Ok(signature);
    }
    Ok(PartDB::load()?.find_by_name(s)?.signature)
}

fn open_transport(cli: &Cli, config: &SessionConfig) -> Result<Box<dyn Transport>> {
    if let Some(part) = &cli.simulate {
        let db = PartDB::load()?;
        let part = match parse_signature_text(part) {
            Ok(signature) => db.find_by_signature(signature)?,
            Err(_) => db.find_by_name(part)?,
        };
        log::info!("Simulating {} ({} bytes available)", part, part.available_flash());
        return Ok(Box::new(Loopback::new(MemoryTarget::from_part(&part))));
    }
    let bridge = match &cli.port {
        Some(port) => SerialBridge::open(port, cli.baudrate, config.send_timeout())?,
        None => SerialBridge::open_any(cli.baudrate, config.send_timeout())?,
    };
    Ok(Box::new(bridge))
}

fn connect(
    cli: &Cli,
    config: &SessionConfig,
    signature: &str,
) -> Result<Flashing<Box<dyn Transport>>> {
    let signature = resolve_signature(signature)?;
    let transport = open_transport(cli, config)?;
    let flashing = Flashing::hello(transport, config.clone(), signature)?;
    flashing.dump_info()?;
    Ok(flashing)
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

    let mut config = match &cli.config {
        Some(path) => SessionConfig::from_file(path)?,
        None => SessionConfig::default(),
    };
    if let Some(retries) = cli.retries {
        anyhow::ensure!(retries > 0, "at least one HELLO attempt is needed");
        config.hello_retries = retries;
    }

    match &cli.command {
        Command::Hex {
            input,
            output,
            dump,
        } => {
            let image = read_image_from_file(input)?;
            log::info!(
                "{} bytes allocated in 0x{:04x}..=0x{:04x}",
                image.total_allocated_bytes(),
                image.min_address(),
                image.max_address()
            );
            if *dump {
                println!("{}", image.hexdump()?);
            }
            match output {
                Some(path) => write_image_to_file(path, &image, config.record_len())?,
                None => print!("{}", image.to_text_with(config.record_len())?),
            }
        }
        Command::Test { signature } => {
            connect(&cli, &config, signature)?;
        }
        Command::Upload { signature, path } => {
            let image = read_image_from_file(path)?;
            log::info!("Firmware size: {}", image.total_allocated_bytes());
            let mut flashing = connect(&cli, &config, signature)?;
            flashing.upload(&image)?;
            flashing.finish()?;
        }
        Command::Download {
            signature,
            path,
            start,
            end,
        } => {
            let mut flashing = connect(&cli, &config, signature)?;
            let image = match (start, end) {
                (None, None) => flashing.download_all()?,
                (start, end) => {
                    let last = flashing.session().available_flash.saturating_sub(1);
                    flashing.download(start.unwrap_or(0), end.unwrap_or(last))?
                }
            };
            write_image_to_file(path, &image, config.record_len())?;
        }
        Command::Eeprom(EepromCommand::Upload { signature, path }) => {
            let image = read_image_from_file(path)?;
            let mut flashing = connect(&cli, &config, signature)?;
            flashing.eeprom_upload(&image)?;
        }
        Command::Eeprom(EepromCommand::Download { signature, path }) => {
            let mut flashing = connect(&cli, &config, signature)?;
            let image = flashing.eeprom_download()?;
            write_image_to_file(path, &image, config.record_len())?;
        }
    }

    Ok(())
}
