//! CLI entry point for instrument-session
//!
//! Sends single commands to an instrument and watches its status feedback.
//!
//! # Usage
//!
//! Query a pump's liquid level:
//! ```bash
//! instrument-session --profile pump --address /dev/ttyUSB0 query DN
//! ```
//!
//! Run inwards 100 steps against the built-in simulator:
//! ```bash
//! instrument-session --simulate query RI 100
//! ```
//!
//! Print status feedback for ten seconds:
//! ```bash
//! instrument-session --config pump.toml monitor --duration 10s
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use humantime_serde::re::humantime::parse_duration;
use instrument_session::codec::{CodecKind, Value};
use instrument_session::config::{DeviceProfile, SessionConfig};
use instrument_session::logging::{self, LoggingConfig, OutputFormat};
use instrument_session::sim::{DuplexConnector, SimulatedDma, SimulatedPump};
use instrument_session::transport::{Connector, TcpConnector};
use instrument_session::{InstrumentSession, Reply};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "instrument-session")]
#[command(about = "Command/response sessions with serial laboratory instruments", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Device profile supplying defaults (pump, balance, dma)
    #[arg(long, global = true, default_value = "pump")]
    profile: DeviceProfile,

    /// Serial port path or host:port, overriding the configuration
    #[arg(long, global = true)]
    address: Option<String>,

    /// Talk to an in-process simulated device instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    /// Log level, overriding the configuration
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one command and print the reply
    Query {
        /// Command code (e.g. DN, RI, CLR)
        code: String,

        /// Command arguments, in wire order
        args: Vec<String>,

        /// Reply timeout, overriding the configuration
        #[arg(long, value_parser = parse_duration)]
        timeout: Option<Duration>,
    },

    /// Print status feedback samples as they arrive
    Monitor {
        /// How long to watch
        #[arg(long, default_value = "10s", value_parser = parse_duration)]
        duration: Duration,

        /// Status codes to poll, overriding the configuration (comma separated)
        #[arg(long, value_delimiter = ',')]
        codes: Vec<String>,
    },

    /// Print the effective configuration as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = SessionConfig::load(cli.config.as_deref(), cli.profile)
        .context("Failed to load configuration")?;
    if let Some(address) = &cli.address {
        config.address = address.clone();
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    if cli.simulate && config.address.is_empty() {
        config.address = format!("sim://{}", cli.profile);
    }
    if let Commands::Monitor { codes, .. } = &cli.command {
        if !codes.is_empty() {
            config.feedback.codes = codes.clone();
        }
    }

    let format = if cli.json_logs {
        OutputFormat::Json
    } else {
        OutputFormat::Compact
    };
    logging::init(
        LoggingConfig::from_session_config(&config)
            .map_err(anyhow::Error::msg)?
            .with_format(format),
    )
    .map_err(anyhow::Error::msg)?;

    if let Commands::ShowConfig = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    config.validate()?;

    let connector = connector_for(&config, cli.simulate)?;
    let session = InstrumentSession::from_config(connector, config)?;

    let result = match cli.command {
        Commands::Query {
            code,
            args,
            timeout,
        } => run_query(&session, &code, &args, timeout).await,
        Commands::Monitor { duration, .. } => run_monitor(&session, duration).await,
        Commands::ShowConfig => Ok(()),
    };

    session.disconnect().await;
    result
}

/// Pick a connector: simulator, TCP for `host:port`, serial otherwise.
fn connector_for(config: &SessionConfig, simulate: bool) -> Result<Arc<dyn Connector>> {
    if simulate {
        let connector = match config.codec {
            CodecKind::Address { channel } => DuplexConnector::new(SimulatedPump::with_terminator(
                channel,
                config.connection.delimiter_byte(),
            )),
            CodecKind::Template { channel } => DuplexConnector::new(SimulatedDma::new(channel)),
        };
        return Ok(Arc::new(connector));
    }

    if is_socket_address(&config.address) {
        return Ok(Arc::new(TcpConnector));
    }

    #[cfg(feature = "instrument_serial")]
    return Ok(Arc::new(instrument_session::transport::SerialConnector));

    #[cfg(not(feature = "instrument_serial"))]
    bail!(
        "'{}' looks like a serial port, but serial support requires the 'instrument_serial' feature",
        config.address
    );
}

fn is_socket_address(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

async fn run_query(
    session: &InstrumentSession,
    code: &str,
    args: &[String],
    timeout: Option<Duration>,
) -> Result<()> {
    let values = args.iter().map(|a| Value::parse_token(a)).collect();
    let query = &session.config().query;

    session.connect_configured().await?;
    let reply = session
        .query(
            code,
            values,
            timeout.unwrap_or(query.timeout),
            query.settle_delay,
        )
        .await?;

    match reply {
        Reply::Value(value) => {
            println!("{}", value);
            Ok(())
        }
        Reply::DeviceError(fault) => bail!("Device reported {}", fault),
    }
}

async fn run_monitor(session: &InstrumentSession, duration: Duration) -> Result<()> {
    if session.config().feedback.codes.is_empty() {
        bail!("No feedback codes configured; pass --codes or set [feedback] codes");
    }

    let mut samples = session.subscribe_feedback();
    session.connect_configured().await?;

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            received = samples.recv() => match received {
                Ok(sample) => println!(
                    "{}  {:<3} {}",
                    sample.at.format("%H:%M:%S%.3f"),
                    sample.code,
                    sample.reply
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Monitor fell behind; samples dropped");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_addresses_are_recognised() {
        assert!(is_socket_address("127.0.0.1:5025"));
        assert!(is_socket_address("dma.lab:4001"));
        assert!(!is_socket_address("/dev/ttyUSB0"));
        assert!(!is_socket_address("COM3"));
        assert!(!is_socket_address(":5025"));
    }

    #[test]
    fn cli_parses_query_with_args() {
        let cli = Cli::parse_from([
            "instrument-session",
            "--simulate",
            "--profile",
            "dma",
            "query",
            "INIT",
            "3",
            "12",
        ]);
        assert!(cli.simulate);
        assert_eq!(cli.profile, DeviceProfile::Dma);
        match cli.command {
            Commands::Query { code, args, .. } => {
                assert_eq!(code, "INIT");
                assert_eq!(args, vec!["3", "12"]);
            }
            _ => panic!("expected query"),
        }
    }
}
