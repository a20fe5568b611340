pub mod chat_db;
pub mod database;
pub mod messages;
pub mod sessions;
pub mod unread;

pub use chat_db::{ChatDatabase, StoreLimits};

use std::fs;
use std::path::Path;

/// Ensure the directory holding `path` exists.
pub fn ensure_parent_dir<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
