//! Core module containing the SECoP node
//!
//! This module provides:
//! - Wire protocol: actions, message codec, framing
//! - Data types and the module/parameter/command model
//! - Dispatcher with subscriptions, activation and remote logging
//! - TCP and WebSocket interfaces
//! - Pollers, the state machine and the startup barrier
//! - Client, router and UDP discovery
//! - Server orchestration

pub mod client;
pub mod codec;
pub mod datatype;
pub mod discovery;
pub mod dispatcher;
pub mod errors;
pub mod logger;
pub mod module;
pub mod multievent;
pub mod poller;
pub mod protocol;
pub mod router;
pub mod server;
pub mod state_machine;
pub mod transport;
