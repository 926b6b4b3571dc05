//! Primary Session lifecycle.

mod dispatch;
mod manager;
mod state;

pub use manager::SessionManager;
pub use state::{Action, Admission, DropReason, Phase, SessionState, admit};
