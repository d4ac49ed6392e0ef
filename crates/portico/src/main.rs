//! Portico — connection front-end for a DoH/DoT resolver.
//!
//! Terminates (or forwards) TLS, frames DNS-over-TCP, bridges queries into
//! the resolver, and self-regulates admission from OS load signals.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use portico_config::Config;
use portico_metrics::{parse_format, parse_level, LogConfig};
use portico_server::handler::{NullResolver, RequestHandler};
use portico_server::{FrontendConfig, Stats, Supervisor, TlsSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

mod lifecycle;

use lifecycle::{Bus, Event};

/// Portico DNS front-end.
#[derive(Parser, Debug)]
#[command(name = "portico")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the front-end (default)
    Run,

    /// Print and validate the effective environment configuration
    Validate,

    /// Show version information
    Version,
}

fn init_logging(config: &Config, cli_level: Option<&str>, quiet: bool) {
    let level = if quiet {
        tracing::Level::ERROR
    } else {
        parse_level(cli_level.unwrap_or(&config.log.level))
    };

    portico_metrics::init_tracing(&LogConfig {
        level,
        format: parse_format(&config.log.format),
        span_events: false,
    });
}

/// Maps the environment configuration onto the server crate's config.
fn frontend_config(config: &Config) -> FrontendConfig {
    FrontendConfig {
        dot_port: config.ports.dot,
        dot_proxy_port: config.ports.dot_proxy,
        doh_port: config.ports.doh,
        dot_cleartext_port: config.ports.dot_cleartext,
        doh_cleartext_port: config.ports.doh_cleartext,
        check_port: config.ports.check,
        backlog: config.tcp_backlog,
        io_timeout: Duration::from_millis(config.io_timeout_ms),
        shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
        min_conns: config.min_conns,
        max_conns: config.max_conns,
        cleartext: config.cleartext,
        proxy_proto: config.dot_over_proxy_proto,
        tls: match (&config.tls_key, &config.tls_crt) {
            (Some(key), Some(crt)) => Some(TlsSettings {
                key_path: key.clone(),
                cert_path: crt.clone(),
                hosts: config.tls_hosts.clone(),
            }),
            _ => None,
        },
        secret_b64: config.secret_b64.clone(),
        image_ref: config.image_ref.clone(),
        measure_heap: config.measure_heap,
        on_local: config.on_local,
    }
}

async fn run(config: Config) -> Result<()> {
    let bus = Bus::new();
    bus.publish(Event::Prepare);

    // The resolver is linked in by the deployment; the stand-in keeps the
    // front-end protocol-correct (DoT answers become SERVFAIL).
    let handler: Arc<dyn RequestHandler> = Arc::new(NullResolver);

    let stats = Stats::new();
    let tracker = portico_server::ConnTracker::new(stats.clone());
    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    let supervisor = Arc::new(
        Supervisor::new(
            frontend_config(&config),
            handler,
            stats,
            tracker,
            shutdown_tx.clone(),
        )
        .context("failed to build the listener supervisor")?,
    );

    // Signals and admission escalation both land on the bus as `stop`.
    {
        let bus = bus.clone();
        tokio::spawn(async move {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
                .expect("failed to register SIGINT handler");

            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
            }
            bus.publish(Event::Stop);
        });
    }
    {
        let bus = bus.clone();
        let mut escalation = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if escalation.recv().await.is_ok() {
                bus.publish(Event::Stop);
            }
        });
    }

    bus.publish(Event::Go);
    let mut run_task = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.run().await }
    });

    tokio::select! {
        res = &mut run_task => {
            match res {
                Ok(Ok(())) => info!("all listeners stopped"),
                Ok(Err(e)) => {
                    error!(error = %e, "listener supervisor failed");
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
        _ = lifecycle::until_stop(bus.subscribe()) => {
            // Hard deadline first: the process exits 0 no matter what is
            // still pending when it fires.
            let deadline = Duration::from_millis(config.shutdown_timeout_ms);
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                error!("shutdown deadline reached, forcing exit");
                std::process::exit(0);
            });

            let _ = shutdown_tx.send(());
            supervisor.drain();
        }
    }

    info!("portico stopped");
    std::process::exit(0);
}

fn validate(config: &Config) -> Result<()> {
    config
        .validate()
        .context("configuration validation failed")?;

    println!("{}", serde_json::to_string_pretty(config)?);
    println!("configuration is valid");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Version) = &cli.command {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = Config::from_env().context("failed to read environment configuration")?;

    if let Some(Commands::Validate) = &cli.command {
        return validate(&config);
    }

    config.validate().context("invalid configuration")?;
    init_logging(&config, cli.log_level.as_deref(), cli.quiet);

    // rustls needs one process-wide crypto provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    run(config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["portico"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.quiet);

        let cli = Cli::try_parse_from(["portico", "validate"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Validate)));

        let cli = Cli::try_parse_from(["portico", "-l", "debug", "run"]).unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Some(Commands::Run)));
    }

    #[test]
    fn test_frontend_config_mapping() {
        let mut config = Config::default();
        config.ports.dot = 853;
        config.io_timeout_ms = 7000;
        config.cleartext = true;

        let fe = frontend_config(&config);
        assert_eq!(fe.dot_port, 853);
        assert_eq!(fe.io_timeout, Duration::from_secs(7));
        assert!(fe.cleartext);
        assert!(fe.tls.is_none());
    }
}
