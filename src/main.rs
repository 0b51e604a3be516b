use std::io::Write;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn, LevelFilter};

use forcewalker::logging::init_rust_logging_with;
use forcewalker::{
    list_ports, Channel, LiveView, LogStatusSink, ProfileStore, SerialConnector, SerialSession,
    SessionConfig,
};

#[derive(Parser, Debug)]
#[command(
    name = "forcewalker",
    version,
    about = "Read, calibrate and record the walker force sensor"
)]
struct Cli {
    /// JSON file with session settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Calibration profile file (default: per-user data directory)
    #[arg(long, global = true)]
    profile: Option<PathBuf>,
    /// Log every accepted raw frame
    #[arg(long, global = true)]
    echo_raw: bool,
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct PortArgs {
    /// Serial port, e.g. /dev/ttyACM0 or COM3
    port: String,
    /// Seconds to wait for the device to finish its setup
    #[arg(long, default_value_t = 15.0)]
    ready_timeout: f64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available serial ports
    Ports,
    /// Print live calibrated values until Ctrl-C
    Monitor {
        #[command(flatten)]
        port: PortArgs,
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<f64>,
    },
    /// Record for a fixed time and print per-channel statistics
    Record {
        #[command(flatten)]
        port: PortArgs,
        #[arg(long, default_value_t = 10.0)]
        seconds: f64,
    },
    /// Zero all channels with the walker unloaded
    Tare {
        #[command(flatten)]
        port: PortArgs,
    },
    /// Calibrate one channel with a known weight
    Calibrate {
        #[command(flatten)]
        port: PortArgs,
        /// rr, rf, lr, lf or 0-3
        #[arg(long)]
        channel: Channel,
        /// Reference weight in grams
        #[arg(long)]
        weight: f64,
    },
    /// Inspect or reset the saved calibration profile
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
}

#[derive(Subcommand, Debug)]
enum ProfileAction {
    Show,
    Reset,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_rust_logging_with(match cli.verbose {
        0 => None,
        1 => Some(LevelFilter::Debug),
        _ => Some(LevelFilter::Trace),
    });

    let mut config = match &cli.config {
        Some(path) => SessionConfig::load_from_file(path),
        None => SessionConfig::default(),
    };
    config.echo_raw |= cli.echo_raw;
    let store = profile_store(&cli, &config)?;

    match &cli.command {
        Command::Ports => {
            let ports = list_ports().context("failed to enumerate serial ports")?;
            if ports.is_empty() {
                println!("No serial ports found.");
            }
            for port in ports {
                println!("{port}");
            }
        }
        Command::Monitor { port, seconds } => {
            let session = open_session(port, store, config)?;
            monitor(&session, *seconds)?;
        }
        Command::Record { port, seconds } => {
            let session = open_session(port, store, config)?;
            record(&session, *seconds)?;
        }
        Command::Tare { port } => {
            let session = open_session(port, store, config)?;
            println!("Taring; keep the walker unloaded...");
            let outcome = session.tare()?;
            println!(
                "Tare values: {:?} ({} samples, {} rejected)",
                outcome.tare, outcome.samples, outcome.rejected
            );
            if !outcome.saved {
                eprintln!("Warning: tare applied but the profile could not be saved");
            }
        }
        Command::Calibrate {
            port,
            channel,
            weight,
        } => {
            let session = open_session(port, store, config)?;
            println!("Calibrating {channel}; place {weight} g on it...");
            let outcome = session.calibrate(*channel, *weight)?;
            println!(
                "Calibration value for {}: {:.6} ({} samples, {} rejected)",
                outcome.channel, outcome.scale, outcome.samples, outcome.rejected
            );
            if !outcome.saved {
                eprintln!("Warning: calibration applied but the profile could not be saved");
            }
        }
        Command::Profile { action } => match action {
            ProfileAction::Show => show_profile(&store)?,
            ProfileAction::Reset => {
                if store.delete()? {
                    println!("Deleted {}", store.path().display());
                } else {
                    println!("No saved profile at {}", store.path().display());
                }
            }
        },
    }
    Ok(())
}

fn profile_store(cli: &Cli, config: &SessionConfig) -> Result<ProfileStore> {
    match cli.profile.as_ref().or(config.profile_path.as_ref()) {
        Some(path) => Ok(ProfileStore::new(path)),
        None => ProfileStore::default_location().context("cannot locate calibration profile"),
    }
}

fn open_session(
    args: &PortArgs,
    store: ProfileStore,
    config: SessionConfig,
) -> Result<SerialSession> {
    let connector = SerialConnector::new(&args.port)
        .with_baud_rate(config.baud_rate)
        .with_timeout(config.read_timeout());
    let session = SerialSession::connect(connector, store, Arc::new(LogStatusSink), config)
        .with_context(|| format!("failed to open {}", args.port))?;

    let timeout = Duration::try_from_secs_f64(args.ready_timeout)
        .context("--ready-timeout must be a non-negative number of seconds")?;
    info!("Waiting up to {timeout:?} for the device...");
    session
        .wait_until_ready(timeout)
        .context("device did not finish its setup")?;
    Ok(session)
}

fn show_profile(store: &ProfileStore) -> Result<()> {
    let Some(profile) = store.load()? else {
        println!("No saved profile at {}", store.path().display());
        return Ok(());
    };
    println!("Profile: {}", store.path().display());
    if let Some(saved_at) = profile.saved_at {
        println!("Saved at: {saved_at:.0} (unix seconds)");
    }
    println!(
        "Tared: {}  Calibrated: {}",
        profile.is_tared, profile.is_calibrated
    );
    for channel in Channel::ALL {
        println!(
            "  {:<12} tare {:>12.3}  scale {:>12.6}",
            channel.label(),
            profile.tare[channel.index()],
            profile.scale[channel.index()]
        );
    }
    Ok(())
}

fn record(session: &SerialSession, seconds: f64) -> Result<()> {
    let duration = Duration::try_from_secs_f64(seconds)
        .context("--seconds must be a non-negative number")?;
    session.start_recording()?;
    println!("Recording for {seconds}s...");
    thread::sleep(duration);
    let samples = session.stop_recording()?;

    let recording = session.recording()?;
    println!("{samples} samples over {:.2}s", recording.duration());
    for channel in Channel::ALL {
        if let Some(s) = recording.summary(channel) {
            println!(
                "  {:<12} mean {:>10.2}  min {:>10.2}  max {:>10.2}",
                channel.label(),
                s.mean,
                s.min,
                s.max
            );
        }
    }
    Ok(())
}

/// Drain the live view on a fixed tick, redrawing one status line.
fn monitor(session: &SerialSession, seconds: Option<f64>) -> Result<()> {
    let limit = seconds
        .map(Duration::try_from_secs_f64)
        .transpose()
        .context("--seconds must be a non-negative number")?;
    let tick = session.config().live_tick();
    let batch = session.config().live_drain_batch;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let started = tokio::time::Instant::now();
        let mut view: Option<LiveView> = Some(session.open_live_view()?);
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let mut stdout = std::io::stdout();
        loop {
            tokio::select! {
                _ = &mut ctrl_c => break,
                _ = ticker.tick() => {
                    if limit.is_some_and(|limit| started.elapsed() >= limit) {
                        break;
                    }
                    // A device restart deactivates the feed; reopen once it is ready again.
                    if !view.as_ref().is_some_and(|v| v.feed().is_active()) {
                        view = None;
                        if session.is_ready() {
                            view = Some(session.open_live_view()?);
                            info!("live view reopened");
                        }
                        continue;
                    }
                    let Some(latest) = view.as_mut().and_then(|v| v.drain(batch)) else {
                        continue;
                    };
                    let line: Vec<String> = Channel::ALL
                        .iter()
                        .map(|c| format!("{} {:>9.2}", c.code().to_uppercase(), latest[c.index()]))
                        .collect();
                    write!(stdout, "\r{}", line.join("  "))?;
                    stdout.flush()?;
                }
            }
        }
        writeln!(stdout)?;
        if let Some(view) = &view {
            info!("{} samples in the live window", view.rings().len());
        }
        Ok::<_, anyhow::Error>(())
    })?;

    let stats = session.stats()?;
    if stats.live_dropped > 0 {
        warn!("display fell behind: {} live samples dropped", stats.live_dropped);
    }
    info!(
        "{} frames, {} rejected lines, {} decode errors",
        stats.frames, stats.rejected, stats.decode_errors
    );
    Ok(())
}
