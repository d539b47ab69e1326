use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use parking_lot::Mutex;
use rustls::crypto::{ring, CryptoProvider};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use study_session::config::{AppConfig, ConfigStore};
use study_session::events::{EventBus, SessionEvent};
use study_session::media::{SpeechPattern, SyntheticDevices};
use study_session::session::{LocalIdentity, Participant, SessionCommand, StudySession};
use study_session::signaling::protocol::UserId;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Headless study-session participant
#[derive(Parser, Debug)]
#[command(name = "study-session")]
#[command(version, about = "Join a live study session from the terminal", long_about = None)]
struct CliArgs {
    /// REST API base URL (overrides config file)
    #[arg(long, value_name = "URL")]
    api_url: Option<String>,

    /// Study group to join
    #[arg(short = 'g', long, value_name = "ID")]
    group_id: String,

    /// Local user id
    #[arg(short = 'u', long, value_name = "ID")]
    user_id: String,

    /// Display name
    #[arg(short = 'n', long, value_name = "NAME", default_value = "Guest")]
    user_name: String,

    /// Signaling URL (default: resolved from the session info endpoint)
    #[arg(long, value_name = "URL")]
    signaling_url: Option<String>,

    /// TOML configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Make the synthetic microphone alternate between talking and silence
    #[arg(long)]
    simulate_speech: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Log output format (text, json)
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// A line typed on stdin
#[derive(Debug, PartialEq)]
enum CliCommand {
    Session(SessionCommand),
    Who,
    Leave,
    Help,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose, args.log_format);

    if CryptoProvider::install_default(ring::default_provider()).is_err() {
        tracing::debug!("Crypto provider already installed");
    }

    tracing::info!("Starting study-session v{}", env!("CARGO_PKG_VERSION"));

    let store = match args.config {
        Some(ref path) => ConfigStore::load(path).await?,
        None => ConfigStore::in_memory(AppConfig::default()),
    };

    // Apply CLI argument overrides (not written back to the file)
    let mut config = (*store.get()).clone();
    if let Some(ref url) = args.api_url {
        config.server.api_base_url = url.clone();
    }
    if let Some(ref url) = args.signaling_url {
        config.server.signaling_url = Some(url.clone());
    }
    let config = Arc::new(config);

    let user_id = UserId::new(args.user_id.clone());
    let mut devices = SyntheticDevices::new(user_id.participant_id());
    if args.simulate_speech {
        devices = devices.with_speech(SpeechPattern::default());
    }

    let events = Arc::new(EventBus::new());
    let roster: Arc<Mutex<Vec<Participant>>> = Arc::new(Mutex::new(vec![]));
    spawn_event_printer(&events, roster.clone());

    let mut session = StudySession::start(
        config,
        &args.group_id,
        LocalIdentity {
            user_id,
            user_name: args.user_name.clone(),
        },
        Arc::new(devices),
        events,
    )
    .await?;
    tracing::info!("Joined study group {}, type 'help' for commands", session.group_id());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            _ = session.finished() => {
                tracing::info!("Session closed by the server");
                return Ok(());
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    Some(CliCommand::Session(command)) => session.command(command)?,
                    Some(CliCommand::Who) => print_roster(&roster.lock()),
                    Some(CliCommand::Leave) => break,
                    Some(CliCommand::Help) => print_help(),
                    None if line.trim().is_empty() => {}
                    None => println!("unknown command: {}", line.trim()),
                }
            }
        }
    }

    session.leave().await;
    tracing::info!("Left study group {}", args.group_id);
    Ok(())
}

fn parse_command(line: &str) -> Option<CliCommand> {
    let line = line.trim();
    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    let command = match word {
        "mic" => CliCommand::Session(SessionCommand::ToggleMic),
        "cam" => CliCommand::Session(SessionCommand::ToggleCamera),
        "share" => CliCommand::Session(SessionCommand::ToggleScreenShare),
        "hand" => CliCommand::Session(SessionCommand::ToggleHand),
        "say" if !rest.trim().is_empty() => {
            CliCommand::Session(SessionCommand::SendChat(rest.to_string()))
        }
        "who" => CliCommand::Who,
        "leave" | "quit" => CliCommand::Leave,
        "help" | "?" => CliCommand::Help,
        _ => return None,
    };
    Some(command)
}

fn print_help() {
    println!("mic | cam | share | hand | say <text> | who | leave");
}

fn print_roster(participants: &[Participant]) {
    for p in participants {
        let mut flags = vec![];
        if p.muted {
            flags.push("muted");
        }
        if p.camera_off {
            flags.push("camera off");
        }
        if p.screen_sharing {
            flags.push("sharing");
        }
        if p.hand_raised {
            flags.push("hand");
        }
        if p.speaking {
            flags.push("speaking");
        }
        println!("{:<12} {:<20} {}", p.id, p.name, flags.join(", "));
    }
}

fn spawn_event_printer(events: &EventBus, roster: Arc<Mutex<Vec<Participant>>>) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("Event printer lagged by {} events", n);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            match event {
                SessionEvent::ParticipantsChanged { participants } => {
                    *roster.lock() = participants;
                }
                SessionEvent::ChatMessage { message } => {
                    println!(
                        "[{}] {}",
                        message.user_name.as_deref().unwrap_or("?"),
                        message.message
                    );
                }
                SessionEvent::HandRaised {
                    participant_name,
                    hand_raised,
                } => {
                    let verb = if hand_raised { "raised" } else { "lowered" };
                    println!("* {} {} their hand", participant_name, verb);
                }
                SessionEvent::MediaError { device, message } => {
                    println!("! {} unavailable: {}", device, message);
                }
                SessionEvent::ServerError { message } => println!("! server: {}", message),
                SessionEvent::SessionEnded { .. } => break,
                other => tracing::debug!("Event: {:?}", other),
            }
        }
    });
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8, format: LogFormat) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "study_session=error,webrtc=error",
        LogLevel::Warn => "study_session=warn,webrtc=warn",
        LogLevel::Info => "study_session=info,webrtc=warn",
        LogLevel::Verbose => "study_session=debug,webrtc=warn",
        LogLevel::Debug => "study_session=debug,webrtc=info",
        LogLevel::Trace => "study_session=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let (text_layer, json_layer) = match format {
        LogFormat::Text => (
            Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            ),
        ),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer)
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
