//! Live session lifecycle
//!
//! - `state` - session states, the start request and snapshots
//! - `runner` - `LiveRunner`, the single owner of the active session

pub mod runner;
pub mod state;

pub use runner::LiveRunner;
pub use state::{LiveSessionRequest, SessionSnapshot, SessionState};
