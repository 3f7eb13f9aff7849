mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::{BrokerArgs, Command};
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(
    name = "browserfetch",
    version,
    about = "Evaluate JavaScript and run fetch() inside your browser tabs"
)]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "warn", global = true)]
    log_level: LogLevel,

    #[command(flatten)]
    broker: BrokerArgs,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, cli.broker, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_eval_subcommand() {
        let cli = Cli::try_parse_from([
            "browserfetch",
            "eval",
            "example.com",
            "(a) => a * 2",
            "--arg",
            "21",
            "--timeout",
            "3s",
        ])
        .expect("eval args should parse");

        assert!(matches!(cli.command, Command::Eval(_)));
    }

    #[test]
    fn broker_flags_are_global() {
        let cli = Cli::try_parse_from([
            "browserfetch",
            "script",
            "--broker-host",
            "0.0.0.0",
            "--port",
            "9999",
        ])
        .expect("global broker args should parse");

        assert_eq!(cli.broker.broker_host, "0.0.0.0");
        assert_eq!(cli.broker.port, 9999);
    }

    #[test]
    fn rejects_conflicting_body_args() {
        let err = Cli::try_parse_from([
            "browserfetch",
            "fetch",
            "https://example.com/",
            "--data",
            "hello",
            "--file",
            "/tmp/body.bin",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn fetch_accepts_repeated_headers() {
        let cli = Cli::try_parse_from([
            "browserfetch",
            "fetch",
            "https://example.com/",
            "-X",
            "POST",
            "-H",
            "Accept: text/plain",
            "-H",
            "X-Trace: 1",
            "--host",
            "example.com",
        ])
        .expect("fetch args should parse");

        match cli.command {
            Command::Fetch(args) => {
                assert_eq!(args.headers.len(), 2);
                assert_eq!(args.host.as_deref(), Some("example.com"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
