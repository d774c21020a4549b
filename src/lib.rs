//! # Secnode Core Library
//!
//! A SECoP (Sample Environment Communication Protocol) node with support for:
//! - Line based JSON protocol over TCP and WebSocket
//! - Modules with typed parameters and commands
//! - Event subscriptions and remote logging
//! - Per poll group pollers
//! - Routing of several upstream nodes into one
//! - UDP discovery
//!
//! ## Example
//!
//! ```rust,no_run
//! use secnode_core::{NodeConfig, ServerControl};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config: NodeConfig = r#"
//!         [node]
//!         equipment_id = "demo"
//!         interfaces = ["tcp://10767"]
//!
//!         [[modules]]
//!         name = "T"
//!         [[modules.parameters]]
//!         name = "value"
//!         datainfo = { type = "double", unit = "K" }
//!     "#
//!     .parse()?;
//!
//!     secnode_core::core::server::serve(config, None, ServerControl::new()).await
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod core;
pub mod utils;

// Re-exports for convenience
pub use crate::config::{ConfigError, ModuleConfig, NodeConfig};
pub use crate::core::client::{ClientEvent, SecopClient};
pub use crate::core::codec::{Message, SecopCodec};
pub use crate::core::datatype::DataType;
pub use crate::core::dispatcher::{Dispatch, Dispatcher, NodeInfo};
pub use crate::core::errors::SecopError;
pub use crate::core::module::{Command, Driver, Module, ParamValue, Parameter};
pub use crate::core::router::Router;
pub use crate::core::server::{RunningNode, ServerControl};
pub use crate::core::transport::{Interface, Scheme};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
