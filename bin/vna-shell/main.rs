use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info, warn, LevelFilter};
use std::{path::PathBuf, process::ExitCode, time::Duration};

use vna_link::{load_config_or_default, AppConfig, Command, Session, VnaError, Warnings};

/// Send SCPI commands to a network analyzer with full error checking
#[derive(Parser, Debug)]
#[command(name = "vna-shell")]
#[command(about = "Synchronized SCPI access to a vector network analyzer", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Instrument host name or IP address
    #[arg(long)]
    host: Option<String>,

    /// Raw SCPI socket port
    #[arg(long)]
    port: Option<u16>,

    /// Write a JSONL transcript of every command to this file
    #[arg(long, value_name = "FILE")]
    transcript: Option<PathBuf>,

    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Print the instrument identity
    Idn,
    /// Send a command that has no reply
    Write {
        command: String,
        /// Wait for the operation to complete before checking errors
        #[arg(long)]
        long_running: bool,
        /// Completion deadline in milliseconds
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },
    /// Send a query and print its reply
    Query { command: String },
    /// Copy a local file to the instrument
    Upload { local: PathBuf, remote: String },
    /// Copy a file from the instrument
    Download { remote: String, local: PathBuf },
    /// List stored calibration sets
    CalSets,
    /// Run one sweep and wait for it to finish
    Sweep {
        #[arg(long, default_value_t = 1)]
        channel: u32,
        /// Completion deadline in milliseconds
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();
    let config = load_config_or_default(args.config.as_deref());

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.log_level.clone());
    initialize_logging(&log_level);

    match run(args, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            if let Some(code) = e.fault_code() {
                eprintln!("instrument error {code}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args, config: AppConfig) -> Result<(), VnaError> {
    let host = args.host.unwrap_or_else(|| config.instrument.host.clone());
    let port = args.port.unwrap_or(config.instrument.port);
    info!("=== vna-shell ===");
    info!("Instrument: {host}:{port}");

    let mut builder = Session::builder()
        .address(&host)
        .port(port)
        .connection(config.connection_config())
        .config(config.session_config());
    if let Some(path) = args.transcript.or(config.logging.transcript_path.clone()) {
        info!("Transcript: {}", path.display());
        builder = builder.transcript(path);
    }
    let mut session = builder.connect()?;

    match args.command {
        Action::Idn => {
            let id = session.identify()?;
            println!("{}", id.manufacturer);
            println!("{} (serial {}, firmware {})", id.model, id.serial, id.firmware);
        }
        Action::Write {
            command,
            long_running,
            timeout_ms,
        } => {
            let mut builder = Command::action(command);
            if long_running {
                builder = builder.long_running();
            }
            if let Some(ms) = timeout_ms {
                builder = builder.timeout(Duration::from_millis(ms));
            }
            report_warnings(&session.execute(&builder.build())?);
        }
        Action::Sweep { channel, timeout_ms } => {
            let timeout = timeout_ms.map(Duration::from_millis);
            report_warnings(&session.single_trigger(timeout, channel)?);
        }
        Action::Query { command } => {
            println!("{}", session.query_raw(&command)?);
        }
        Action::Upload { local, remote } => {
            report_warnings(&session.upload_file_from(&local, &remote)?);
            println!("{} -> {remote}", local.display());
        }
        Action::Download { remote, local } => {
            let bytes = session.download_file_to(&remote, &local)?;
            println!("{remote} -> {} ({bytes} bytes)", local.display());
        }
        Action::CalSets => {
            for set in session.list_cal_sets()? {
                println!("{set}");
            }
        }
    }

    session.disconnect()
}

fn report_warnings(warnings: &Warnings) {
    for w in warnings {
        warn!("Instrument warning {},\"{}\"", w.code, w.message);
    }
}

fn initialize_logging(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}
