//! Headless velo operator: delayed live view, slow-motion replay and
//! session recording driven from stdin

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use velo::capture::Frame;
use velo::display::Presenter;
use velo::pipeline::Mode;
use velo::{Config, Session};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Source to open: device index, device path, stream URL or pattern[:WxH]
    #[clap(short, long)]
    source: Option<String>,

    /// TOML config file, overridden by VELO__SECTION__KEY variables
    #[clap(short, long)]
    config: Option<PathBuf>,
}

/// Operator commands read from stdin, one per line
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Replay,
    Record,
    Delay(f64),
    History(f64),
    Speed(f64),
    Status,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let command = match (words.next()?, words.next()) {
            ("r", None) => Self::Replay,
            ("rec", None) => Self::Record,
            ("s", None) => Self::Status,
            ("q", None) => Self::Quit,
            ("delay", Some(n)) => Self::Delay(n.parse().ok()?),
            ("history", Some(n)) => Self::History(n.parse().ok()?),
            ("speed", Some(f)) => Self::Speed(f.parse().ok()?),
            _ => return None,
        };
        words.next().is_none().then_some(command)
    }
}

/// Stands in for a window: logs what would be shown once a second
struct LogPresenter {
    window_start: Instant,
    frames: u32,
}

impl Presenter for LogPresenter {
    fn present(&mut self, frame: &Frame, mode: Mode) {
        self.frames += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            info!(
                ?mode,
                sequence = frame.sequence(),
                size = %format!("{}x{}", frame.width(), frame.height()),
                fps = self.frames as f64 / elapsed.as_secs_f64(),
                "presenting"
            );
            self.window_start = Instant::now();
            self.frames = 0;
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("velo=info"));
    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()),
    );
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();
}

fn apply(session: &Session, command: Command) {
    let mut settings = session.replay_settings();
    match command {
        Command::Replay => match session.toggle_replay() {
            Ok(outcome) => info!(?outcome, "replay toggled"),
            Err(e) => warn!("replay failed: {}", e),
        },
        Command::Record => {
            session.toggle_recording();
        }
        Command::Status => info!(status = ?session.status(), "status"),
        Command::Delay(value) | Command::History(value) | Command::Speed(value) => {
            match command {
                Command::Delay(_) => settings.delay_seconds = value,
                Command::History(_) => settings.replay_seconds = value,
                _ => settings.playback_speed_factor = value,
            }
            match session.reconfigure(&settings) {
                Ok(caps) => info!(?caps, "settings applied"),
                Err(e) => warn!("settings rejected: {}", e),
            }
        }
        Command::Quit => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let args = Args::parse();
    info!("velo launching...");

    let config = Config::load(args.config.as_deref()).wrap_err("loading configuration")?;
    let source = args.source.unwrap_or_else(|| config.capture.source.clone());

    let session = Arc::new(Session::new(config)?);
    session
        .start_source(&source)
        .wrap_err_with(|| format!("opening source {source:?}"))?;
    info!(
        source = %source,
        recording = %session.recording_path().display(),
        "commands: r | rec | delay N | history N | speed F | s | q"
    );

    let tick = session.render_tick(LogPresenter {
        window_start: Instant::now(),
        frames: 0,
    })?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("stdin closed");
                    break;
                };
                match Command::parse(&line) {
                    Some(Command::Quit) => break,
                    Some(command) => apply(&session, command),
                    None if line.trim().is_empty() => {}
                    None => warn!(input = %line.trim(), "unknown command"),
                }
            }
        }
    }

    // joins blocking threads, keep it off the runtime workers
    let closing = session.clone();
    let report = tokio::task::spawn_blocking(move || closing.shutdown()).await?;
    tick.stop();
    info!(
        ?report,
        recording = %session.recording_path().display(),
        "velo shutting down"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_operator_commands() {
        assert_eq!(Command::parse("r"), Some(Command::Replay));
        assert_eq!(Command::parse(" rec "), Some(Command::Record));
        assert_eq!(Command::parse("delay 2.5"), Some(Command::Delay(2.5)));
        assert_eq!(Command::parse("history 8"), Some(Command::History(8.0)));
        assert_eq!(Command::parse("speed 0.25"), Some(Command::Speed(0.25)));
        assert_eq!(Command::parse("q"), Some(Command::Quit));
    }

    #[test]
    fn rejects_malformed_commands() {
        assert_eq!(Command::parse(""), None);
        assert_eq!(Command::parse("delay"), None);
        assert_eq!(Command::parse("delay fast"), None);
        assert_eq!(Command::parse("r now"), None);
        assert_eq!(Command::parse("speed 0.5 0.5"), None);
    }
}
