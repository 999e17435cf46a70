//! Sluice relay engine
//!
//! Accepts TCP clients, connects each one to a fixed upstream and copies
//! bytes both ways, optionally piping either direction through an external
//! filter command.
//!
//! ```no_run
//! use sluice_relay::{Listener, RelayConfig};
//!
//! # async fn serve() -> Result<(), sluice_relay::StartupError> {
//! let config = RelayConfig::new(9000, "localhost", 9001).with_filter_out("tr a-z A-Z");
//! let mut listener = Listener::bind(config)?;
//! listener.run().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod filter;
pub mod listener;
pub mod registry;
pub mod worker;

pub use config::RelayConfig;
pub use connection::{CompletionFlag, Connection, ConnectionId, ConnectionIdGenerator};
pub use error::{exit_code, ConfigError, ConnectError, FilterError, StartupError};
pub use filter::{FilterChild, FilterProcess};
pub use listener::{bind_std, Listener, ListenerStats};
pub use registry::Registry;
pub use worker::{CloseReason, Direction, RelayStats, WorkerOutcome, WorkerState};
