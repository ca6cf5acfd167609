use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use iogate_lib::config::GatewayConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run the gateway: open serial lines and field devices, connect the
    /// brokers and keep polling, publishing and evaluating rules until Ctrl-C.
    #[clap(verbatim_doc_comment)]
    Run {
        /// Stop on its own after this time (e.g., "30s", "1h").
        /// Runs until interrupted when omitted.
        #[arg(long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
        stop_after: Option<Duration>,

        /// Do not start the serial to broker publishers.
        #[arg(long)]
        no_publish: bool,

        /// Do not subscribe the broker to serial topics.
        #[arg(long)]
        no_subscribe: bool,
    },

    /// Parse the configuration file and print a summary of it.
    Check,
}

const fn about_text() -> &'static str {
    "IoGate - Field-bus, serial and local I/O to MQTT gateway."
}

#[derive(Parser, Debug)]
#[command(name="iogate", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warn.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// The gateway configuration file.
    #[arg(global = true, short, long, default_value = GatewayConfig::DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: CliCommands,
}
