mod coaching;
mod config;
mod connection;
mod cues;
mod device_scanner;
mod error;
mod heart_rate;
mod pace;
mod recorder;
mod sensor;
mod session;
mod simulation;
mod tick;
mod timeseries;
mod zones;

use clap::Parser;
use config::{Settings, SettingsHandle};
use cues::LogCueSink;
use pace::LocationFix;
use recorder::{JsonStore, MemoryStore, Recorder, SessionStore};
use sensor::{Handler, SensorLink};
use session::{SessionController, SessionHandle, SessionSnapshot};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tick::Clock;

/// Heart rate zone coaching from a Bluetooth heart rate sensor
#[derive(Parser, Debug)]
#[command(name = "zone-coach", version, about)]
struct Args {
    /// Sensor address to connect to, instead of the saved device
    #[arg(long)]
    device: Option<String>,

    /// Start a simulated session without a sensor
    #[arg(long)]
    simulate: bool,

    /// Path to config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for session records
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Keep session records and settings changes in memory only
    #[arg(long)]
    ephemeral: bool,

    /// Print a status line every second
    #[arg(long)]
    watch: bool,

    /// Log filter, e.g. "debug" or "zone_coach=trace"
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum ConsoleCommand {
    Start(Option<String>),
    Pause,
    Resume,
    Toggle,
    Stop,
    Skip,
    Simulate,
    Scan,
    Select(String),
    Fix {
        latitude: f64,
        longitude: f64,
        accuracy_m: f64,
        speed_mps: Option<f64>,
    },
    Status,
    Quit,
}

fn parse_command(line: &str) -> Result<ConsoleCommand, String> {
    let mut words = line.split_whitespace();
    let command = words.next().ok_or_else(|| "empty command".to_string())?;
    let number = |word: Option<&str>, what: &str| -> Result<f64, String> {
        word.ok_or_else(|| format!("missing {}", what))?
            .parse::<f64>()
            .map_err(|e| format!("invalid {}: {}", what, e))
    };

    let parsed = match command {
        "start" => ConsoleCommand::Start(words.next().map(str::to_string)),
        "pause" => ConsoleCommand::Pause,
        "resume" => ConsoleCommand::Resume,
        "p" => ConsoleCommand::Toggle,
        "stop" => ConsoleCommand::Stop,
        "skip" => ConsoleCommand::Skip,
        "sim" => ConsoleCommand::Simulate,
        "scan" => ConsoleCommand::Scan,
        "select" => ConsoleCommand::Select(
            words
                .next()
                .ok_or_else(|| "missing device address".to_string())?
                .to_string(),
        ),
        "fix" => ConsoleCommand::Fix {
            latitude: number(words.next(), "latitude")?,
            longitude: number(words.next(), "longitude")?,
            accuracy_m: number(words.next(), "accuracy")?,
            speed_mps: match words.next() {
                Some(word) => Some(number(Some(word), "speed")?),
                None => None,
            },
        },
        "status" => ConsoleCommand::Status,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(format!("unknown command '{}'", other)),
    };
    Ok(parsed)
}

fn format_status(snapshot: &SessionSnapshot) -> String {
    let phase = match snapshot.phase_seconds_remaining {
        Some(remaining) => format!("{} ({}s left)", snapshot.phase.label(), remaining),
        None => snapshot.phase.label().to_string(),
    };
    let zone = snapshot
        .coaching
        .as_ref()
        .map_or("-".to_string(), |c| c.zone.clone());
    let pace = if snapshot.pace_min_per_km > 0.0 {
        format!("{:.2} min/km", snapshot.pace_min_per_km)
    } else {
        "-".to_string()
    };
    let bpm = match snapshot.bit_width {
        Some(width) => format!("{} ({})", snapshot.bpm, width.describe()),
        None => snapshot.bpm.to_string(),
    };
    format!(
        "[{}] {} | bpm {} avg {} zone {} | run {}s pause {}s | {} {:.2} km pace {} | {}",
        snapshot.status.label(),
        phase,
        bpm,
        snapshot.avg_bpm,
        zone,
        snapshot.seconds_running,
        snapshot.seconds_paused,
        snapshot.run_mode.as_str(),
        snapshot.distance_km,
        pace,
        snapshot.connection_status
    )
}

fn execute(handle: &SessionHandle, clock: &Clock, command: ConsoleCommand) {
    match command {
        ConsoleCommand::Start(address) => handle.start(address),
        ConsoleCommand::Pause => handle.pause(),
        ConsoleCommand::Resume => handle.resume(),
        ConsoleCommand::Toggle => handle.toggle_pause(),
        ConsoleCommand::Stop => handle.stop(),
        ConsoleCommand::Skip => handle.skip_phase(),
        ConsoleCommand::Simulate => handle.toggle_simulation(),
        ConsoleCommand::Scan => handle.scan(),
        ConsoleCommand::Select(address) => handle.select_device(address),
        ConsoleCommand::Fix {
            latitude,
            longitude,
            accuracy_m,
            speed_mps,
        } => handle.push_location(LocationFix {
            timestamp_ms: clock.now_ms(),
            latitude,
            longitude,
            accuracy_m,
            speed_mps,
        }),
        ConsoleCommand::Status => {
            let snapshot = handle.snapshot();
            println!("{}", format_status(&snapshot));
            for device in &snapshot.discovered_devices {
                println!("  {}  {}", device.address, device.name);
            }
            if let Some(error) = &snapshot.error_message {
                println!("  error: {}", error);
            }
        }
        ConsoleCommand::Quit => {}
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = args.config.clone().unwrap_or_else(Settings::config_path);
    log::info!("Using config: {}", config_path.display());
    let settings = if args.ephemeral {
        SettingsHandle::in_memory(Settings::load_from(&config_path)?)
    } else {
        SettingsHandle::load_from(config_path)?
    };

    let store: Box<dyn SessionStore> = if args.ephemeral {
        Box::new(MemoryStore::new())
    } else {
        let dir = args
            .data_dir
            .clone()
            .or_else(JsonStore::default_dir)
            .unwrap_or_else(|| PathBuf::from("sessions"));
        Box::new(JsonStore::open(dir)?)
    };

    let clock = Clock::new();
    let (events_tx, events_rx) = mpsc::channel();

    // Sensor transport gets its own thread and tokio runtime
    let (link, transport) = SensorLink::new(Handler::new(events_tx.clone(), clock));
    thread::spawn(move || link.run());

    let (controller, snapshot_rx) = SessionController::new(
        settings.clone(),
        Recorder::new(store),
        Box::new(LogCueSink),
        transport,
        events_tx.clone(),
        clock,
    );
    let controller_thread = thread::spawn(move || controller.run(events_rx));
    let handle = SessionHandle::new(events_tx, snapshot_rx);

    if args.simulate {
        if settings.current().simulation_enabled {
            handle.start(None);
        } else {
            handle.toggle_simulation();
        }
    } else if args.device.is_some() {
        handle.start(args.device.clone());
    }

    let watching = Arc::new(AtomicBool::new(args.watch));
    if args.watch {
        let snapshots = handle.subscribe();
        let watching = watching.clone();
        thread::spawn(move || {
            while watching.load(Ordering::Relaxed) {
                println!("{}", format_status(&snapshots.borrow()));
                thread::sleep(Duration::from_secs(1));
            }
        });
    }

    let (exit_tx, exit_rx) = mpsc::channel();
    spawn_signal_watcher(exit_tx.clone())?;
    spawn_console(handle.clone(), clock, exit_tx);

    let exit = shutdown_on(&exit_rx, &handle, controller_thread);
    watching.store(false, Ordering::Relaxed);
    log::info!("Exited via {:?}", exit);
    Ok(())
}

/// What ended the process.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Exit {
    Console,
    Signal,
}

/// Reads line commands until `quit` or EOF.
fn spawn_console(handle: SessionHandle, clock: Clock, exit: mpsc::Sender<Exit>) {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    log::error!("Failed to read stdin: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Ok(ConsoleCommand::Quit) => break,
                Ok(command) => execute(&handle, &clock, command),
                Err(e) => eprintln!("{}", e),
            }
        }
        let _ = exit.send(Exit::Console);
    });
}

/// Ctrl-C and SIGTERM request the same orderly shutdown as `quit`.
fn spawn_signal_watcher(exit: mpsc::Sender<Exit>) -> io::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    thread::spawn(move || {
        rt.block_on(wait_for_signal());
        let _ = exit.send(Exit::Signal);
    });
    Ok(())
}

async fn wait_for_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("Ctrl-C handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => log::info!("Interrupted, stopping session"),
        _ = terminate => log::info!("Terminated, stopping session"),
    }
}

/// Blocks until something asks to exit, then stops the controller and waits
/// for it so the session record is finalized.
fn shutdown_on(
    exit: &mpsc::Receiver<Exit>,
    handle: &SessionHandle,
    controller: thread::JoinHandle<()>,
) -> Exit {
    let reason = exit.recv().unwrap_or(Exit::Console);
    handle.shutdown();
    if controller.join().is_err() {
        log::error!("Session controller thread panicked");
    }
    reason
}

fn main() {
    let args = Args::parse();

    let filter = args.log_level.clone().unwrap_or_else(|| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    if let Err(e) = run(args) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heart_rate::BitWidth;

    #[test]
    fn test_parse_session_commands() {
        assert_eq!(parse_command("start"), Ok(ConsoleCommand::Start(None)));
        assert_eq!(
            parse_command("start AA:BB"),
            Ok(ConsoleCommand::Start(Some("AA:BB".to_string())))
        );
        assert_eq!(parse_command("  skip "), Ok(ConsoleCommand::Skip));
        assert_eq!(parse_command("p"), Ok(ConsoleCommand::Toggle));
        assert_eq!(parse_command("exit"), Ok(ConsoleCommand::Quit));
        assert!(parse_command("select").is_err());
        assert!(parse_command("jump").is_err());
    }

    #[test]
    fn test_parse_fix_with_optional_speed() {
        assert_eq!(
            parse_command("fix 51.5 -0.12 8"),
            Ok(ConsoleCommand::Fix {
                latitude: 51.5,
                longitude: -0.12,
                accuracy_m: 8.0,
                speed_mps: None,
            })
        );
        match parse_command("fix 51.5 -0.12 8 3.2") {
            Ok(ConsoleCommand::Fix { speed_mps, .. }) => assert_eq!(speed_mps, Some(3.2)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(parse_command("fix 51.5 north 8").is_err());
    }

    #[test]
    fn test_signal_exit_finalizes_session() {
        let store = MemoryStore::new();
        let (transport_tx, _transport_rx) = mpsc::channel();
        let (events_tx, events_rx) = mpsc::channel();
        let settings = Settings {
            simulation_enabled: true,
            ..Settings::default()
        };
        let (controller, snapshot_rx) = SessionController::new(
            SettingsHandle::in_memory(settings),
            Recorder::new(Box::new(store.clone())),
            Box::new(LogCueSink),
            transport_tx,
            events_tx.clone(),
            Clock::new(),
        );
        let controller = controller.with_tick_interval(None);
        let controller_thread = thread::spawn(move || controller.run(events_rx));
        let handle = SessionHandle::new(events_tx, snapshot_rx);
        handle.start(None);

        let (exit_tx, exit_rx) = mpsc::channel();
        exit_tx.send(Exit::Signal).unwrap();
        assert_eq!(shutdown_on(&exit_rx, &handle, controller_thread), Exit::Signal);

        let sessions = store.sessions();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].summary.is_some());
    }

    #[test]
    fn test_status_line_shows_phase_and_pace() {
        let snapshot = SessionSnapshot {
            phase_seconds_remaining: Some(42),
            pace_min_per_km: 5.5,
            ..SessionSnapshot::default()
        };
        let line = format_status(&snapshot);
        assert!(line.starts_with("[Idle] Warm Up (42s left) | bpm 0 avg"));
        assert!(line.contains("treadmill 0.00 km pace 5.50 min/km"));

        let line = format_status(&SessionSnapshot {
            bpm: 142,
            bit_width: Some(BitWidth::Eight),
            ..SessionSnapshot::default()
        });
        assert!(line.contains("bpm 142 (8-bit (UINT8))"));
    }
}
