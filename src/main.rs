use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use optiboot::{
    BootConfig, ByteChannel, DeviceParams, Halt, Watchdog,
    config::TransportKind,
    device::ChipDB,
    format::{Firmware, read_firmware_from_file},
    host::{Programmer, reassemble},
    sim::{LoopbackRadio, ScriptedUart, SimEeprom, SimulatedMcu},
    transport::{Baudrate, RadioLink, SerialChannel, SerialPortUart, Uart},
};

#[derive(Parser)]
#[command(
    name = "optiboot",
    version,
    about = "STK500v1 bootloader core, run against a simulated AVR"
)]
struct Cli {
    /// More output, repeat for protocol traces
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List supported parts
    Devices,
    /// Show the build parameters for a part
    Info {
        #[arg(long, default_value = "ATmega328P")]
        chip: String,
        /// Bootloader config file (YAML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Upload a firmware image into a simulated part, then reboot it
    Flash {
        #[arg(long, default_value = "ATmega328P")]
        chip: String,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Talk over the simulated radio link instead of the UART
        #[arg(long)]
        radio: bool,
        /// Probability that a radio ack is lost
        #[arg(long, default_value_t = 0.0)]
        ack_loss: f64,
        /// Probability that the host sends a radio packet twice
        #[arg(long, default_value_t = 0.0)]
        dup_rate: f64,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Skip the read-back
        #[arg(long)]
        no_verify: bool,
        /// Hexdump the programmed flash
        #[arg(long)]
        dump: bool,
        /// The path to the file to be downloaded to the code flash
        path: PathBuf,
    },
    /// Answer a real host (e.g. avrdude -c arduino) over a serial port
    Serve {
        #[arg(long, default_value = "ATmega328P")]
        chip: String,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Serial port, the first one found if omitted
        #[arg(short, long)]
        port: Option<String>,
        #[arg(short, long, value_enum, default_value_t = Baudrate::default())]
        baud: Baudrate,
        /// Application image preloaded into flash
        #[arg(long)]
        image: Option<PathBuf>,
    },
}

/// Byte channel that advances a progress bar for every request byte.
struct Metered<C> {
    inner: C,
    bar: ProgressBar,
}

impl<C: ByteChannel> ByteChannel for Metered<C> {
    fn start(&mut self, config: &BootConfig) -> bool {
        self.inner.start(config)
    }

    fn read_byte(&mut self, wdt: &mut dyn Watchdog) -> Result<u8, Halt> {
        let b = self.inner.read_byte(wdt)?;
        self.bar.inc(1);
        Ok(b)
    }

    fn write_byte(&mut self, byte: u8) {
        self.inner.write_byte(byte);
    }

    fn shutdown(&mut self) {
        self.inner.shutdown();
    }
}

fn load_config(path: Option<PathBuf>) -> Result<BootConfig> {
    match path {
        Some(p) => BootConfig::load(p),
        None => Ok(BootConfig::default()),
    }
}

fn find_params(chip: &str) -> Result<DeviceParams> {
    let db = ChipDB::load()?;
    let chip = db.find_chip(chip)?;
    log::info!("Chip: {}", chip);
    Ok(chip.params())
}

fn progress_bar(len: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")?
            .progress_chars("#>-"),
    );
    Ok(pb)
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

    match cli.command {
        Commands::Devices => {
            let db = ChipDB::load()?;
            for family in db.families() {
                println!("{}: {}", family.name, family.description);
                for chip in &family.variants {
                    println!(
                        "  {:<12} {}  flash {:>6}  page {:>3}  eeprom {:>4}  [{}]",
                        chip.name,
                        hex::encode(chip.signature),
                        chip.flash_size,
                        chip.page_size,
                        chip.eeprom_size,
                        chip.aliases.join(", ")
                    );
                }
            }
        }
        Commands::Info { chip, config } => {
            let params = find_params(&chip)?;
            let config = load_config(config)?;
            println!("signature:     {}", hex::encode(params.signature));
            println!("flash:         {} bytes, {} byte pages", params.flash_size, params.page_size);
            println!("nrww section:  {:#06x}..{:#06x}", params.nrww_start, params.flash_size);
            println!("eeprom:        {} bytes", params.eeprom_size);
            println!("ram start:     {:#06x}", params.ram_start);
            println!("version:       {}.{}", config.version_major, config.version_minor);
            println!("transport:     {:?}", config.transport);
            println!("entry causes:  {:?}", config.entry_causes);
            println!("timeout:       {:?}", config.session_timeout);
            println!("{}", serde_yaml::to_string(&config.capabilities)?);
        }
        Commands::Flash {
            chip,
            config,
            radio,
            ack_loss,
            dup_rate,
            seed,
            no_verify,
            dump,
            path,
        } => {
            let params = find_params(&chip)?;
            let mut config = load_config(config)?;
            if radio {
                config.transport = TransportKind::Radio;
            }
            let firmware = read_firmware_from_file(path)?;
            log::info!(
                "Firmware size: {} bytes @{:#06x}",
                firmware.data.len(),
                firmware.base
            );
            flash(params, &config, &firmware, !no_verify, dump, (ack_loss, dup_rate, seed))?;
        }
        Commands::Serve {
            chip,
            config,
            port,
            baud,
            image,
        } => {
            let params = find_params(&chip)?;
            let config = load_config(config)?;
            let uart = match port {
                Some(port) => SerialPortUart::open(&port, baud)?,
                None => SerialPortUart::open_nth(0, baud)?,
            };
            let mut mcu = SimulatedMcu::new(params).with_wall_clock();
            if let Some(image) = image {
                let firmware = read_firmware_from_file(image)?;
                mcu.load_flash(firmware.base, &firmware.data)?;
            }
            serve(mcu, SerialChannel::new(uart), params, &config)?;
        }
    }

    Ok(())
}

fn flash(
    params: DeviceParams,
    config: &BootConfig,
    firmware: &Firmware,
    verify: bool,
    dump: bool,
    (ack_loss, dup_rate, seed): (f64, f64, u64),
) -> Result<()> {
    let programmer = Programmer::new(params).verify(verify);
    let session = programmer.plan(firmware)?;
    let script = session.script();

    let mut mcu = SimulatedMcu::new(params);
    let mut eeprom = SimEeprom::new(params.eeprom_size.max(1));
    let bar = progress_bar(script.len() as u64)?;

    let (halt, output) = match config.transport {
        TransportKind::Serial => {
            let mut chan = Metered {
                inner: SerialChannel::new(ScriptedUart::from_bytes(&script)),
                bar,
            };
            let halt = optiboot::boot(&mut mcu, &mut chan, &mut eeprom, params, config);
            chan.bar.finish();
            (halt, chan.inner.uart().output().to_vec())
        }
        TransportKind::Radio => {
            let mut radio = LoopbackRadio::with_seed(seed);
            radio.set_ack_loss(ack_loss);
            radio.set_duplicate_rate(dup_rate);
            for packet in session.packets(0) {
                radio.push_packet(&packet);
            }
            let mut chan = Metered {
                inner: RadioLink::new(radio),
                bar,
            };
            let halt = optiboot::boot(&mut mcu, &mut chan, &mut eeprom, params, config);
            chan.bar.finish();
            let link = &chan.inner;
            log::info!(
                "{} packets sent, {} abandoned",
                link.radio().sent().len(),
                link.abandoned()
            );
            (halt, reassemble(link.radio().sent()))
        }
    };
    log::info!("Session ended: {:?}", halt);

    let report = programmer.check(&session, firmware, &output)?;
    log::info!(
        "Device {} running bootloader {}.{}, {} page(s) written",
        hex::encode(report.signature),
        report.version.0,
        report.version.1,
        report.pages_written
    );
    match report.verified {
        Some(true) => log::info!("Verified!"),
        Some(false) => anyhow::bail!("read-back does not match the image"),
        None => log::info!("Verify skipped"),
    }
    let start = firmware.base as usize;
    anyhow::ensure!(
        mcu.flash()[start..start + firmware.data.len()] == firmware.data[..],
        "flash content does not match the image"
    );

    if dump {
        let mut out = Vec::new();
        hxdmp::hexdump(&mcu.flash()[start..start + firmware.data.len()], &mut out)?;
        println!("{}", String::from_utf8_lossy(&out));
    }

    // The reset after LEAVE_PROGMODE goes straight to the application.
    let mut idle = SerialChannel::new(ScriptedUart::new());
    match optiboot::boot(&mut mcu, &mut idle, &mut eeprom, params, config) {
        Halt::StartApplication(cause) => {
            log::info!("Application started, reset cause {:?}", cause)
        }
        other => anyhow::bail!("device did not start the application: {:?}", other),
    }
    Ok(())
}

fn serve(
    mut mcu: SimulatedMcu,
    mut chan: SerialChannel<SerialPortUart>,
    params: DeviceParams,
    config: &BootConfig,
) -> Result<()> {
    let mut eeprom = SimEeprom::new(params.eeprom_size.max(1));
    loop {
        match optiboot::boot(&mut mcu, &mut chan, &mut eeprom, params, config) {
            Halt::WatchdogReset => log::info!("Watchdog reset"),
            Halt::StartApplication(cause) => {
                log::info!(
                    "Application running (reset cause {:?}), send any byte to reset",
                    cause
                );
                while !chan.uart_mut().rx_complete() {}
                chan.uart_mut().discard_input()?;
                mcu.external_reset();
            }
        }
    }
}
