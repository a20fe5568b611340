//! One-to-one realtime chat core.
//!
//! A [`ChatBackend`] owns the SQLite-backed chat store and the in-process
//! [`RealtimeBus`]. Each signed-in user drives a [`ChatSession`] actor through
//! a [`ChatSessionHandle`].

pub mod auth;
pub mod backend;
pub mod common;
pub mod config;
pub mod error;
pub mod network;
pub mod session;
pub mod storage;

pub use auth::{AuthProvider, StaticAuthProvider};
pub use backend::ChatBackend;
pub use common::{Attachment, AttachmentKind, Chat, Message, PendingFile, SessionEvent};
pub use error::{ChatError, Result};
pub use network::{BlobStore, HttpBlobStore, LocalBlobStore, RealtimeBus};
pub use session::{ChatSession, ChatSessionHandle, SessionConfig};
pub use storage::{ChatDatabase, StoreLimits};
