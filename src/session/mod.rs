//! Session module - lifecycle of the single owned player instance.
//!
//! - `state.rs` - in-memory session record and its durable `session.json` mirror
//! - `manager.rs` - start/sync/close/restore and the single-owner rule

mod manager;
mod state;
#[cfg(test)]
pub(crate) mod testing;

pub use manager::{CloseOutcome, RunningStatus, SessionError, SessionManager, StartOutcome, Timeouts};
pub use state::{Session, SessionRecord, SessionState, SessionStatus, SessionStore, StoreError};
