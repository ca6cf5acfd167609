//! Data plane of an industrial IoT gateway.
//!
//! The crate bridges field-bus devices and local I/O to MQTT brokers:
//!
//! 1.  **Serial lines** ([`serial`]): every line is opened once, reopened when
//!     it drops, and its newline-delimited text is framed into JSON values or
//!     raw text.
//! 2.  **Field devices** ([`field`]): Modbus RTU register nodes are polled on
//!     per-device intervals into the shared [`readings::Readings`], and can be
//!     written on demand.
//! 3.  **Messaging** ([`bridge`]): one bridge per broker (local and cloud)
//!     publishes line values and template reports, forwards subscribed topics
//!     back to serial lines and executes command topics.
//! 4.  **Automation** ([`rules`]): comparator rules drive the digital outputs
//!     of [`io`] from live readings.
//!
//! A [`gateway::Gateway`] owns all of the above and runs them from a single
//! loop on top of one [`scheduler::Scheduler`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use iogate_lib::config::GatewayConfig;
//! use iogate_lib::gateway::{Backends, Gateway};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::from_file("iogate.yml")?;
//!     let mut gateway = Gateway::new(Backends::system(&config.io));
//!     gateway.apply(config).await?;
//!     gateway
//!         .run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
mod error;
pub mod field;
pub mod gateway;
pub mod io;
pub mod protocol;
pub mod readings;
pub mod rules;
pub mod scheduler;
pub mod serial;

pub use error::{Error, Result};
