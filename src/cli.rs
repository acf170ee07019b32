use clap::Parser;
use ezdemo::config::{self, RelayConfig, TransportConfig, TunnelParams};
use ezdemo::logging::{ColorMode, LogFormat};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "ezdemo")]
#[command(
    author,
    version,
    about = "Expose a local TCP service to the internet through an ezdemo reverse tunnel"
)]
pub struct Cli {
    /// Username on the relay host
    #[arg(short = 'u', long = "user", env = "EZDEMO_USER")]
    pub user: String,

    /// Port the relay host listens on for public connections
    #[arg(
        short = 'r',
        long = "remote-port",
        env = "EZDEMO_REMOTE_PORT",
        value_parser = config::validate_port
    )]
    pub remote_port: u16,

    /// Local port to expose
    #[arg(
        short = 'p',
        long = "port",
        default_value_t = config::DEFAULT_LOCAL_PORT,
        value_parser = config::validate_port
    )]
    pub local_port: u16,

    /// Path to the private key issued for this tunnel
    #[arg(short = 'i', long = "identity", env = "EZDEMO_IDENTITY")]
    pub identity_file: PathBuf,

    /// Relay host
    #[arg(long = "host", env = "EZDEMO_HOST", default_value = config::REMOTE_HOST)]
    pub host: String,

    /// SSH port of the relay host
    #[arg(
        short = 'P',
        long = "ssh-port",
        env = "EZDEMO_SSH_PORT",
        default_value_t = config::CONTROL_PORT,
        value_parser = config::validate_port
    )]
    pub ssh_port: u16,

    /// Host the local service listens on
    #[arg(long = "local-host", default_value = config::LOCAL_HOST)]
    pub local_host: String,

    /// How often idle reads and accepts re-check for shutdown, in milliseconds
    #[arg(
        long = "poll-interval-ms",
        default_value = "1000",
        value_parser = clap::value_parser!(u64).range(1..=1000)
    )]
    pub poll_interval_ms: u64,

    /// Timeout for connecting to the relay host, in seconds
    #[arg(long = "connect-timeout", default_value = "10")]
    pub connect_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value = "pretty")]
    pub log_format: LogFormat,

    /// Enable colored log output (auto-detected by default)
    #[arg(long = "color", default_value = "auto")]
    pub color: ColorMode,
}

impl Cli {
    pub fn tunnel_params(&self) -> TunnelParams {
        TunnelParams {
            remote_host: self.host.clone(),
            control_port: self.ssh_port,
            username: self.user.clone(),
            credential_path: self.identity_file.clone(),
            remote_bind_port: self.remote_port,
            local_host: self.local_host.clone(),
            local_port: self.local_port,
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            ..Default::default()
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig::with_poll_interval(Duration::from_millis(self.poll_interval_ms))
    }
}
