pub mod attachment;
pub mod controller;
pub mod handle;
pub mod state;

pub use controller::{ChatSession, SessionConfig};
pub use handle::ChatSessionHandle;
pub use state::SessionState;
