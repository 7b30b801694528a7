//! errorrelay CLI
//!
//! Thin wrapper over `errorrelay-core`: load config, apply flag overrides,
//! then either run the relay or inspect the report port.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use errorrelay_core::arbiter::{self, PortOwnership, ProcessClass};
use errorrelay_core::config::{Config, LogFormat};
use errorrelay_core::logging::init_logging;
use errorrelay_core::relay::Relay;

#[derive(Parser, Debug)]
#[command(
    name = "errorrelay",
    version,
    about = "Relay recent runtime errors from an instrumented app to an AI assistant"
)]
struct Cli {
    /// Config file path (default: $XDG_CONFIG_HOME/errorrelay/errorrelay.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Arbitrate the port, listen for reports, and serve MCP on stdio
    Serve {
        /// Report port (overrides config)
        #[arg(short, long, env = "ERRORRELAY_PORT")]
        port: Option<u16>,

        /// Interface to bind (overrides config)
        #[arg(long)]
        host: Option<IpAddr>,

        /// Log level filter (overrides config)
        #[arg(long, env = "ERRORRELAY_LOG_LEVEL")]
        log_level: Option<String>,

        /// Log format: pretty or json (overrides config)
        #[arg(long)]
        log_format: Option<LogFormat>,

        /// Skip port arbitration and make a single bind attempt
        #[arg(long)]
        no_arbitrate: bool,
    },

    /// Show who holds the report port without terminating anything
    CheckPort {
        /// Port to inspect (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    PrintConfig,
}

#[derive(Serialize)]
struct CheckPortOutput {
    addr: SocketAddr,
    ownership: PortOwnership,
}

/// How long shutdown waits for blocking work (the stdin reader) to finish.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

fn main() -> Result<()> {
    let cli = Cli::parse();
    let result = block_on_then_shutdown(run(cli))?;

    if let Err(err) = &result {
        if let Some(remediation) = err
            .downcast_ref::<errorrelay_core::Error>()
            .and_then(errorrelay_core::Error::remediation)
        {
            eprintln!("{}", remediation.render_plain());
        }
    }
    result
}

/// Drive `future` on a fresh runtime, then shut the runtime down without
/// waiting on blocking threads still parked in a read (stdin after Ctrl-C).
fn block_on_then_shutdown<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    Ok(output)
}

async fn run(cli: Cli) -> Result<()> {
    let mut config =
        Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Serve {
            port,
            host,
            log_level,
            log_format,
            no_arbitrate,
        } => {
            if let Some(port) = port {
                config.relay.port = port;
            }
            if let Some(host) = host {
                config.relay.host = host;
            }
            if let Some(level) = log_level {
                config.logging.level = level;
            }
            if let Some(format) = log_format {
                config.logging.format = format;
            }
            if no_arbitrate {
                config.arbiter.enabled = false;
            }
            config
                .validate()
                .map_err(errorrelay_core::Error::from)
                .context("Invalid configuration")?;
            serve(config).await
        }
        Commands::CheckPort { port, json } => {
            if let Some(port) = port {
                config.relay.port = port;
            }
            check_port(&config, json).await
        }
        Commands::PrintConfig => {
            let rendered =
                toml::to_string_pretty(&config).context("Failed to serialize configuration")?;
            print!("{rendered}");
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    init_logging(&config.logging).context("Failed to initialize logging")?;
    tracing::info!(
        version = errorrelay_core::VERSION,
        addr = %config.relay.socket_addr(),
        "Starting errorrelay"
    );

    let report = Relay::new(config)
        .run()
        .await
        .context("Relay terminated with an error")?;

    tracing::info!(addr = %report.addr, listener = %report.listener, "errorrelay exiting");
    Ok(())
}

async fn check_port(config: &Config, json: bool) -> Result<()> {
    let addr = config.relay.socket_addr();
    let names = config.arbiter.compatible_process_names.clone();
    let inspector = arbiter::system_inspector();

    let ownership = tokio::task::spawn_blocking(move || {
        arbiter::inspect(addr, inspector.as_ref(), &names)
    })
    .await
    .context("Port inspection task failed")?
    .map_err(errorrelay_core::Error::from)
    .with_context(|| format!("Failed to inspect port {}", addr.port()))?;

    if json {
        let output = CheckPortOutput { addr, ownership };
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("Failed to serialize output")?
        );
    } else {
        for line in describe_ownership(addr, &ownership) {
            println!("{line}");
        }
    }
    Ok(())
}

fn describe_ownership(addr: SocketAddr, ownership: &PortOwnership) -> Vec<String> {
    let (headline, owners) = match ownership {
        PortOwnership::Unbound => (format!("{addr} is free"), &[][..]),
        PortOwnership::NoOwnerFound => (
            format!("{addr} is busy but no owning process was found"),
            &[][..],
        ),
        PortOwnership::OwnedByCompatible { owners } => (
            format!("{addr} is held by a previous relay instance (would be reclaimed)"),
            owners.as_slice(),
        ),
        PortOwnership::OwnedByForeign { owners } => (
            format!("{addr} is held by a foreign process (would not be reclaimed)"),
            owners.as_slice(),
        ),
    };

    let mut lines = vec![headline];
    lines.extend(owners.iter().map(|owner| {
        format!(
            "  pid {:<8} {:<11} {}",
            owner.pid,
            match owner.class {
                ProcessClass::Compatible => "compatible",
                ProcessClass::Foreign => "foreign",
            },
            owner.name.as_deref().unwrap_or("<unknown>")
        )
    }));
    lines
}
