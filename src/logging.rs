//! Log output for the tunnel. Everything goes to stderr; the core writes no
//! files.

use clap::ValueEnum;
use std::io::{StderrLock, Write};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, for a person watching the tunnel
    #[default]
    Pretty,
    /// One line per event
    Compact,
    /// One JSON object per event
    Json,
}

/// Whether ANSI colours are written.
#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum ColorMode {
    /// Only when stderr is a terminal
    #[default]
    Auto,
    Always,
    Never,
}

impl ColorMode {
    pub fn should_enable(self) -> bool {
        match self {
            Self::Auto => std::io::IsTerminal::is_terminal(&std::io::stderr()),
            mode => mode == Self::Always,
        }
    }
}

/// Crates whose debug output is transport chatter rather than tunnel events.
const QUIET_CRATES: &[&str] = &["russh", "russh_keys", "ssh_key"];

/// Holds the stderr lock for one event and flushes every write through, so
/// a piped stderr sees each line as soon as it is logged.
struct EventWriter(StderrLock<'static>);

impl Write for EventWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write_all(buf)?;
        self.0.flush()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

fn event_writer() -> EventWriter {
    EventWriter(std::io::stderr().lock())
}

/// Build the level filter.
///
/// `rust_log` (the `RUST_LOG` value) wins over `log_level`. SSH crates are
/// held at `error` unless trace is requested or `rust_log` names them.
pub fn build_filter(log_level: &str, rust_log: Option<&str>) -> EnvFilter {
    let rust_log = rust_log.filter(|s| !s.trim().is_empty());

    let mut filter = match rust_log {
        Some(directives) => EnvFilter::try_new(directives),
        None => EnvFilter::try_new(log_level),
    }
    .unwrap_or_else(|_| EnvFilter::new("info"));

    let wants_verbose_ssh = log_level.eq_ignore_ascii_case("trace")
        || rust_log.is_some_and(|s| QUIET_CRATES.iter().any(|c| s.contains(c)));

    if !wants_verbose_ssh {
        for krate in QUIET_CRATES {
            if let Ok(directive) = format!("{}=error", krate).parse() {
                filter = filter.add_directive(directive);
            }
        }
    }

    filter
}

/// Install the global subscriber.
pub fn init_logging(log_level: &str, format: LogFormat, color: ColorMode) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = build_filter(log_level, rust_log.as_deref());
    let ansi = color.should_enable();

    let output = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(event_writer)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(ansi)
            .with_target(false)
            .with_writer(event_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_ansi(ansi)
            .with_target(false)
            .with_writer(event_writer)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(output.with_filter(filter))
        .init();
}
