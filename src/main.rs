use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use log::{info, warn};

use dvbtuner::arbiter::{Arbitrator, RequestOrigin};
use dvbtuner::channel::{self, Channel};
use dvbtuner::config::Config;
use dvbtuner::device::{self, Device};
use dvbtuner::diseqc::{DiseqcSource, NoDiseqc};
use dvbtuner::transfer::{TransferPath, TransferRequest};

const DEFAULT_CONFIG: &str = "etc/dvbtuner.toml";
const DEFAULT_CHANNELS: &str = "etc/channels.conf";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List DVB devices and what they provide
    Devices,
    /// Tune a device to a channel and wait for lock
    Tune {
        /// Channel name or number in the channels file
        channel: String,
        #[arg(short = 'C', long, default_value = DEFAULT_CHANNELS)]
        channels: PathBuf,
        /// Lock timeout in milliseconds
        #[arg(short, long, default_value_t = 5000)]
        timeout: u64,
        /// Route the streams to the decoder of the device
        #[arg(long)]
        live: bool,
    },
    /// Check system readiness
    Doctor {
        #[arg(short = 'C', long, default_value = DEFAULT_CHANNELS)]
        channels: PathBuf,
    },
}

/// Nothing consumes relayed streams in the command line tool.
struct LoggingTransfer;

impl TransferPath for LoggingTransfer {
    fn start(&self, device: usize, request: TransferRequest) {
        info!(
            "transfer mode for {} from device {} (vpid {}, apids {:?})",
            request.channel_id,
            device + 1,
            request.video_pid,
            request.audio_pids
        );
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Devices => cmd_devices(&cli.config),
        Command::Tune {
            channel,
            channels,
            timeout,
            live,
        } => cmd_tune(&cli.config, &channels, &channel, Duration::from_millis(timeout), live),
        Command::Doctor { channels } => cmd_doctor(&cli.config, &channels),
    }
}

/// Loads the configuration, falling back to defaults when the file is absent.
fn load_config(path: &Path) -> Config {
    if !path.exists() {
        info!("{} not found, using defaults", path.display());
        return Config::default();
    }
    match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

fn find_channel<'a>(channels: &'a [Channel], wanted: &str) -> Option<&'a Channel> {
    match wanted.parse::<u32>() {
        Ok(number) => channels.iter().find(|c| c.number == number),
        Err(_) => channels.iter().find(|c| c.name.eq_ignore_ascii_case(wanted)),
    }
}

fn describe(device: &Device) -> String {
    let mut parts = vec![format!("{}", device.delivery_system())];
    if device.provided_systems() > 1 {
        parts.push(format!("{} systems", device.provided_systems()));
    }
    if let Some(video) = device.video_index() {
        parts.push(format!("decoder on /dev/video{video}"));
    }
    if device.is_primary() {
        parts.push("primary".to_string());
    }
    parts.join(", ")
}

fn cmd_devices(config_path: &Path) {
    let config = load_config(config_path);
    let devices = device::discover(&config, Arc::new(NoDiseqc));
    if devices.is_empty() {
        eprintln!("No DVB devices found.");
        process::exit(1);
    }
    for device in &devices {
        println!(
            "device {} (adapter{}): {}",
            device.card_index() + 1,
            device.adapter(),
            describe(device)
        );
    }
}

fn cmd_tune(config_path: &Path, channels_path: &Path, wanted: &str, timeout: Duration, live: bool) {
    let config = load_config(config_path);
    let channels = match channel::parse_channels_conf(channels_path) {
        Ok(channels) => channels,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };
    let Some(channel) = find_channel(&channels, wanted) else {
        eprintln!("Error: channel '{wanted}' not found in {}", channels_path.display());
        process::exit(1);
    };

    if config.switch.diseqc {
        warn!("no DiSEqC table is available, satellite channels can't be tuned");
    }
    let diseqc: Arc<dyn DiseqcSource> = Arc::new(NoDiseqc);
    let mut devices = device::discover(&config, Arc::clone(&diseqc));
    let arbitrator = Arbitrator::new(
        config.policy.clone(),
        config.switch.clone(),
        diseqc,
        Arc::new(LoggingTransfer),
    );

    let Some(device) = devices
        .iter_mut()
        .find(|d| arbitrator.provides_channel(d, channel, Some(0)).available)
    else {
        eprintln!("Error: no device can provide channel {} ({})", channel.number, channel.name);
        process::exit(1);
    };

    if let Err(e) = arbitrator.set_channel(device, channel, live, RequestOrigin::Viewer) {
        eprintln!("Error: {e}");
        process::exit(1);
    }

    let started = Instant::now();
    if arbitrator.has_lock(device, timeout) {
        println!(
            "Locked on {} ({}) after {} ms on device {}",
            channel.name,
            channel.id(),
            started.elapsed().as_millis(),
            device.card_index() + 1
        );
    } else {
        println!("No lock on {} within {} ms", channel.name, timeout.as_millis());
        process::exit(1);
    }
}

fn cmd_doctor(config_path: &Path, channels_path: &Path) {
    const GREEN: &str = "\x1b[32m";
    const RED: &str = "\x1b[31m";
    const BOLD: &str = "\x1b[1m";
    const RESET: &str = "\x1b[0m";

    let mut ok = true;

    // 1. DVB adapters
    print!("DVB adapters ... ");
    let adapters = device::list_adapters();
    if adapters.is_empty() {
        println!("{RED}{BOLD}NOT FOUND{RESET}");
        ok = false;
    } else {
        let names: Vec<String> = adapters.iter().map(|a| format!("adapter{a}")).collect();
        println!("{GREEN}OK{RESET} ({})", names.join(", "));
    }

    // 2. configuration
    print!("{} ... ", config_path.display());
    let config = if !config_path.exists() {
        println!("{GREEN}OK{RESET} (not present, using defaults)");
        Config::default()
    } else {
        match Config::load(config_path) {
            Ok(config) => {
                println!("{GREEN}OK{RESET}");
                config
            }
            Err(e) => {
                println!("{RED}{BOLD}INVALID{RESET}");
                println!("  {e}");
                ok = false;
                Config::default()
            }
        }
    };

    // 3. channels
    print!("{} ... ", channels_path.display());
    if !channels_path.exists() {
        println!("{RED}{BOLD}NOT FOUND{RESET}");
        ok = false;
    } else {
        match channel::parse_channels_conf(channels_path) {
            Ok(channels) if channels.is_empty() => {
                println!("{RED}{BOLD}EMPTY{RESET} (no channels)");
                ok = false;
            }
            Ok(channels) => {
                println!("{GREEN}OK{RESET} ({} channels)", channels.len());
            }
            Err(e) => {
                println!("{RED}{BOLD}INVALID{RESET}");
                println!("  {e}");
                ok = false;
            }
        }
    }

    // 4. frontends and demux
    if !adapters.is_empty() {
        let devices = device::discover(&config, Arc::new(NoDiseqc));
        for device in &devices {
            print!("device {} ... ", device.card_index() + 1);
            if device.tuner().is_none() {
                println!("{RED}{BOLD}NO TUNER{RESET}");
                ok = false;
                continue;
            }
            // PAT section filter
            match device.open_section_filter(0x00, 0x00, 0xFF) {
                Ok(_) => println!("{GREEN}OK{RESET} ({})", describe(device)),
                Err(e) => {
                    println!("{RED}{BOLD}DEMUX FAILED{RESET}");
                    println!("  {e}");
                    ok = false;
                }
            }
        }
    }

    println!();
    if ok {
        println!("{GREEN}{BOLD}All checks passed.{RESET}");
    } else {
        println!("{RED}{BOLD}Some checks failed.{RESET}");
        process::exit(1);
    }
}
