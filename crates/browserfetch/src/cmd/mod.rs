use std::path::PathBuf;
use std::time::Duration;

use browserfetch_broker::{BrokerConfig, DEFAULT_HOST, DEFAULT_PORT};
use clap::{Args, Subcommand};

use crate::exit::{io_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod eval;
pub mod fetch;
pub mod script;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a broker until interrupted.
    Serve(ServeArgs),
    /// Evaluate JavaScript in a tab.
    Eval(EvalArgs),
    /// Run fetch() in a tab and print the response.
    Fetch(FetchArgs),
    /// Print the browser userscript.
    Script(ScriptArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, broker: BrokerArgs, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, broker, format),
        Command::Eval(args) => eval::run(args, broker, format),
        Command::Fetch(args) => fetch::run(args, broker, format),
        Command::Script(args) => script::run(args, broker),
        Command::Version(args) => version::run(args),
    }
}

/// Where the primary broker listens.
#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Address the primary broker listens on.
    #[arg(
        long = "broker-host",
        env = "BROWSERFETCH_HOST",
        default_value = DEFAULT_HOST,
        global = true
    )]
    pub broker_host: String,
    /// Port the primary broker listens on.
    #[arg(long, env = "BROWSERFETCH_PORT", default_value_t = DEFAULT_PORT, global = true)]
    pub port: u16,
}

impl BrokerArgs {
    pub fn config(&self, default_timeout: Duration) -> BrokerConfig {
        BrokerConfig {
            host: self.broker_host.clone(),
            port: self.port,
            default_timeout,
            ..BrokerConfig::default()
        }
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Timeout for relayed calls that do not carry their own (e.g. 95s).
    #[arg(long, default_value = "95s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct EvalArgs {
    /// Host name the target tab registered under.
    pub host: String,
    /// JavaScript to evaluate. If it yields a function, the function is
    /// called with --arg; promises are awaited.
    pub code: String,
    /// JSON argument for the function.
    #[arg(long, value_name = "JSON")]
    pub arg: Option<String>,
    /// How long to wait for the tab and its reply (e.g. 30s, 500ms).
    #[arg(long, default_value = "95s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// URL to fetch.
    pub url: String,
    /// Tab to fetch from. Defaults to the URL's host[:port].
    #[arg(long)]
    pub host: Option<String>,
    /// HTTP method.
    #[arg(long, short = 'X')]
    pub method: Option<String>,
    /// Request header (repeatable).
    #[arg(long = "header", short = 'H', value_name = "NAME:VALUE")]
    pub headers: Vec<String>,
    /// Query parameter appended to the URL (repeatable).
    #[arg(long = "param", value_name = "KEY=VALUE")]
    pub params: Vec<String>,
    /// Raw string request body.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read the request body from a file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// How long to wait for the tab and its reply (e.g. 30s, 500ms).
    #[arg(long, default_value = "95s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct ScriptArgs {
    /// JavaScript expression tabs use as their host name instead of
    /// `location.host`.
    #[arg(long, value_name = "JS_EXPR")]
    pub host_name: Option<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn runtime() -> CliResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("failed to start async runtime", err))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("95").unwrap(), Duration::from_secs(95));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert_eq!(parse_duration("0s").unwrap_err().code, USAGE);
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn broker_args_fill_config() {
        let args = BrokerArgs {
            broker_host: "::1".to_string(),
            port: 9999,
        };
        let config = args.config(Duration::from_secs(3));
        assert_eq!(config.addr(), "[::1]:9999");
        assert_eq!(config.default_timeout, Duration::from_secs(3));
    }
}
