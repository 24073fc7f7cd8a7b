//! calld_transfers - Call Transfer Orchestration
//!
//! Moves live calls between parties by driving a telephony switch through
//! its REST API and reacting to its event stream.
//!
//! # Modules
//!
//! - [`config`] - YAML configuration per environment
//! - [`logging`] - tracing subscriber setup
//! - [`switch`] - Switch REST client, event stream and channel model
//! - [`bus`] - Message bus seam (outbound milestones, inbound requests)
//! - [`transfer`] - Transfer state machine, persistence and HTTP surface

pub mod bus;
pub mod config;
pub mod logging;
pub mod switch;
pub mod transfer;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use switch::{SwitchClient, SwitchError};
pub use transfer::{Transfer, TransferError, TransferStatus, TransfersService};
