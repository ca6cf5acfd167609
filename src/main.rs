//! IoGate CLI
//!
//! Runs the gateway data plane described by a YAML configuration file:
//! - serial lines whose newline-delimited JSON is published to MQTT topics,
//!   and MQTT topics forwarded back to the lines,
//! - Modbus RTU field devices polled into named readings,
//! - local digital/analog inputs, digital outputs and automation rules,
//! - command topics that write registers or outputs and acknowledge them.
//!
//! `iogate check` only parses the configuration and prints what it contains.

use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use iogate_lib::config::{BrokerId, GatewayConfig};
use iogate_lib::gateway::{Backends, Gateway};
use log::*;
use std::panic;
use std::time::Duration;

mod commandline;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

fn print_summary(config: &GatewayConfig) {
    println!("Serial lines:     {}", config.channels.len());
    println!(
        "Field devices:    {} ({} register nodes)",
        config.devices.len(),
        config.nodes.len()
    );
    for id in [BrokerId::Local, BrokerId::Cloud] {
        match config.brokers.get(id) {
            Some(broker) if broker.enabled => println!("Broker {id}:     {}", broker.url),
            Some(_) => println!("Broker {id}:     disabled"),
            None => println!("Broker {id}:     not configured"),
        }
    }
    println!("Publish topics:   {}", config.publish.len());
    println!("Subscriptions:    {}", config.subscribe.len());
    println!("Command topics:   {}", config.commands.len());
    println!("Reports:          {}", config.reports.len());
    println!(
        "Rules:            {} ({} enabled)",
        config.rules.len(),
        config.rules.iter().filter(|r| r.enabled).count()
    );
    println!(
        "Local I/O:        {} outputs, {} digital inputs, {} analog inputs",
        config.io.outputs.len(),
        config.io.inputs.len(),
        config.io.analog.len()
    );
}

async fn shutdown_signal(stop_after: Option<Duration>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
        trace!("Received Ctrl-C");
    };
    match stop_after {
        Some(duration) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = tokio::time::sleep(duration) => info!("Stopping after {duration:?}"),
            }
        }
        None => ctrl_c.await,
    }
}

/// All gateway work is interleaved on the calling thread.
fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

async fn run_gateway(
    mut config: GatewayConfig,
    stop_after: Option<Duration>,
    no_publish: bool,
    no_subscribe: bool,
) -> Result<()> {
    config.autostart.publish &= !no_publish;
    config.autostart.subscribe &= !no_subscribe;

    let mut gateway = Gateway::new(Backends::system(&config.io));
    if let Err(err) = gateway.apply(config).await {
        // Serial lines, field devices and rules keep running without a broker.
        warn!("Gateway started with errors: {err}");
    }
    gateway.run(shutdown_signal(stop_after)).await;
    Ok(())
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "IoGate started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Load the configuration snapshot
    let config = GatewayConfig::from_file(&args.config)
        .with_context(|| format!("Cannot load configuration from {:?}", args.config))?;
    trace!("Config: {config:?}");

    // 3. Execute the command
    match args.command {
        commandline::CliCommands::Check => {
            info!("Executing: Check configuration");
            print_summary(&config);
        }
        commandline::CliCommands::Run {
            stop_after,
            no_publish,
            no_subscribe,
        } => {
            info!("Starting gateway");
            let runtime = runtime().with_context(|| "Cannot create tokio runtime")?;
            runtime.block_on(run_gateway(config, stop_after, no_publish, no_subscribe))?;
        }
    }
    Ok(())
}
