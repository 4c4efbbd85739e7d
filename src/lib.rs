//! # pinbroker
//!
//! Command broker serializing access to MCP23017-family I/O expanders
//! on a shared, non-reentrant bus.
//!
//! Multiple independent clients submit typed register/pin commands; a
//! single dispatcher owns the bus, drains the queue in FIFO order, and
//! publishes results back under the submission token. Commands and
//! results both carry a bounded lifetime: under a sluggish bus, stale
//! commands expire silently instead of piling up, so the most recent
//! user intent tends to win. Delivery is deliberately not guaranteed.
//!
//! ## Quick start
//!
//! ```rust
//! use std::time::Duration;
//! use pinbroker::{Broker, BrokerConfig, CommandValue, SimulatedBus, Verb};
//!
//! let bus = SimulatedBus::new();
//! bus.add_board(0x20);
//!
//! let mut broker = Broker::new(BrokerConfig::default());
//! broker.start(bus).unwrap();
//!
//! let value = broker
//!     .submit_and_wait(Verb::Identify, 0x20, 0, Duration::from_secs(1))
//!     .unwrap();
//! assert_eq!(value, CommandValue::Flag(true));
//! broker.stop();
//! ```
//!
//! ## Architecture
//!
//! - [`registers`] - bit-level model of the expander's register pairs
//! - [`protocol`] - the nine command verbs and the wire-text encoding
//! - [`store`] - shared expiring FIFO of commands and pending results
//! - [`dispatcher`] - the single worker executing against the bus
//! - [`bus`] - driver boundary and the simulated bus
//! - [`broker`] - client facade with start/stop lifecycle

pub mod broker;
pub mod bus;
pub mod dispatcher;
pub mod protocol;
pub mod registers;
pub mod store;

// Re-export the main public types for convenience
pub use broker::{Broker, BrokerConfig, BrokerError, BrokerStats};
pub use bus::{BusDriver, BusError, SimulatedBus};
pub use protocol::{Command, CommandValue, PendingResult, Token, Verb};
pub use store::{CommandStore, FetchOutcome, StoreError};
