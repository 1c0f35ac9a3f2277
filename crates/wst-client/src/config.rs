use clap::{Parser, Subcommand};

#[derive(Debug, Clone, Parser)]
#[command(name = "wst-client", version, about)]
struct Args {
    /// WebSocket URL of the tunnel endpoint, e.g. `ws://127.0.0.1:8080/tunnel`.
    ///
    /// Environment variable: `WST_REMOTE`.
    #[arg(long, env = "WST_REMOTE")]
    remote: String,

    /// Log filter (tracing-subscriber EnvFilter syntax).
    ///
    /// Environment variable: `WST_LOG_LEVEL`.
    #[arg(long, env = "WST_LOG_LEVEL")]
    log_level: Option<String>,

    /// Seconds to wait for the tunnel to deliver its network configuration.
    #[arg(long, default_value_t = 10)]
    ready_timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Fetch a path over HTTP/1.0 through the tunnel and print the response.
    Get {
        /// `host:port` to connect to (IPv6 hosts in brackets).
        target: String,
        #[arg(long, default_value = "/")]
        path: String,
    },
    /// Send one UDP datagram and print the first reply.
    Udp {
        target: String,
        payload: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub remote: String,
    /// Explicit log filter; `None` defers to `RUST_LOG`.
    pub log_level: Option<String>,
    pub ready_timeout: std::time::Duration,
    pub command: Command,
}

impl Config {
    pub fn load() -> Self {
        Self::from_args(Args::parse())
    }

    fn from_args(args: Args) -> Self {
        let log_level = args
            .log_level
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Self {
            remote: args.remote.trim().to_string(),
            log_level,
            ready_timeout: std::time::Duration::from_secs(args.ready_timeout),
            command: args.command,
        }
    }
}
