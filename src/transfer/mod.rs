//! Call Transfer FSM
//!
//! Moves a live call from the party who received it (initiator) to a third
//! party (recipient), attended or blind, by driving switch bridges and
//! channels through a persisted state machine.
//!
//! # State Machine
//!
//! ```text
//! ready ──────────────────────────────┐
//! non_stasis → moving_to_stasis_* → starting → ringback → answered → ended
//!                                              │                     ▲
//!                                              └─ blind_transferred ─┘
//! ```
//!
//! # Invariants
//!
//! 1. **One transition at a time**: every transition runs under the global
//!    state lock, switch commands included
//! 2. **One transfer per initiator**: [`TransferLock`] is taken at creation
//!    and given back on `ended` or on failure
//! 3. **Ended is absorbing**: late hangups are no-ops and publish nothing
//! 4. **Closed table**: every state answers every event, if only to reject it

pub mod api;
pub mod dispatcher;
pub mod error;
pub mod factory;
pub mod lock;
pub mod machine;
pub mod notifier;
pub mod persistor;
pub mod service;
pub mod state;
pub mod store;
pub mod types;


// Re-exports for convenience
pub use dispatcher::EventDispatcher;
pub use error::TransferError;
pub use factory::{StateFactory, TransferScope};
pub use lock::TransferLock;
pub use notifier::Notifier;
pub use persistor::StatePersistor;
pub use service::{CreateTransferRequest, TransfersService, UserTransferRequest};
pub use state::{TransferEvent, TransferStatus};
pub use store::{FileKvStore, KvStore, MemoryKvStore, SwitchVarStore};
pub use types::{Destination, Role, Transfer, TransferFlow, TransferId};
