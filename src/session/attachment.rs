//! Client side of the attachment pipeline: size guard, path naming, upload.

use std::path::Path;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use uuid::Uuid;

use crate::common::{Attachment, AttachmentKind, PendingFile};
use crate::error::{ChatError, Result};
use crate::network::BlobStore;

/// Client-side upload guard. The blob store enforces its own limit as well.
pub const MAX_CLIENT_FILE_BYTES: usize = 5 * 1024 * 1024;

const MAX_EXTENSION_LEN: usize = 10;
const FALLBACK_EXTENSION: &str = "bin";

static UNSAFE_EXTENSION_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[^a-z0-9]").expect("extension pattern is valid"));

pub fn check_file_size(file: &PendingFile, max_bytes: usize) -> Result<()> {
    if file.size() > max_bytes {
        return Err(ChatError::Validation(format!(
            "{} is {} bytes; attachments are limited to {} bytes",
            file.name,
            file.size(),
            max_bytes
        )));
    }
    Ok(())
}

fn sanitize_extension(raw: &str) -> Option<String> {
    let cleaned = UNSAFE_EXTENSION_CHARS
        .replace_all(&raw.to_ascii_lowercase(), "")
        .chars()
        .take(MAX_EXTENSION_LEN)
        .collect::<String>();
    (!cleaned.is_empty()).then_some(cleaned)
}

/// Extension from the file name, else from the MIME subtype, else `bin`.
pub fn file_extension(file_name: &str, mime_type: &str) -> String {
    let from_name = file_name
        .rsplit_once('.')
        .and_then(|(stem, ext)| (!stem.is_empty()).then_some(ext))
        .and_then(sanitize_extension);

    from_name
        .or_else(|| {
            mime_type
                .split_once('/')
                .and_then(|(_, subtype)| sanitize_extension(subtype.split(';').next().unwrap_or("")))
        })
        .unwrap_or_else(|| FALLBACK_EXTENSION.to_string())
}

/// `{chat_id}/{unix_millis}-{random hex}.{ext}`
pub fn attachment_path(chat_id: &str, file: &PendingFile) -> String {
    let random = hex::encode(&Uuid::new_v4().as_bytes()[..6]);
    format!(
        "{chat_id}/{}-{random}.{}",
        Utc::now().timestamp_millis(),
        file_extension(&file.name, &file.mime_type)
    )
}

/// Upload `file` for `chat_id`. Nothing reaches the store when the size guard trips.
pub async fn upload_attachment(
    store: &dyn BlobStore,
    chat_id: &str,
    file: PendingFile,
    max_bytes: usize,
) -> Result<Attachment> {
    check_file_size(&file, max_bytes)?;

    let kind = AttachmentKind::from_mime(&file.mime_type);
    let path = attachment_path(chat_id, &file);
    let size = file.size();

    let url = store
        .upload(&path, file.bytes, &file.mime_type)
        .await
        .map_err(|err| match err {
            ChatError::Upload(reason) => ChatError::Upload(reason),
            other => ChatError::Upload(other.to_string()),
        })?;

    log::info!("Uploaded {kind} attachment for chat {chat_id} ({size} bytes)");
    Ok(Attachment { url, kind })
}

/// MIME type from the file extension, `application/octet-stream` when unknown.
pub fn guess_mime_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Read a local file into a [`PendingFile`], typed by its extension.
pub fn read_pending_file(path: &Path) -> Result<PendingFile> {
    let bytes = std::fs::read(path)?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    Ok(PendingFile::new(name, guess_mime_type(path), bytes))
}
