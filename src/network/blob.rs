use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use uuid::Uuid;

use crate::error::{ChatError, Result};

/// Storage for attachment bytes.
///
/// `upload` must either store the whole file and return a URL that is usable
/// right away, or fail without leaving anything behind.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, path: &str, bytes: Vec<u8>, mime_type: &str) -> Result<String>;
}

/// Reject absolute paths and `..` segments.
fn check_relative(path: &str) -> Result<()> {
    let candidate = Path::new(path);
    let safe = !path.is_empty()
        && candidate
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if safe {
        Ok(())
    } else {
        Err(ChatError::Upload(format!("refusing unsafe blob path `{path}`")))
    }
}

fn check_size(len: usize, max_bytes: usize) -> Result<()> {
    if len > max_bytes {
        Err(ChatError::Upload(format!(
            "file is {len} bytes, store accepts at most {max_bytes}"
        )))
    } else {
        Ok(())
    }
}

/// Blob store on the local filesystem.
pub struct LocalBlobStore {
    root: PathBuf,
    public_base_url: String,
    max_bytes: usize,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>, max_bytes: usize) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
            max_bytes,
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>, mime_type: &str) -> Result<String> {
        check_relative(path)?;
        check_size(bytes.len(), self.max_bytes)?;

        let target = self.root.join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| ChatError::Upload(format!("cannot create {}: {err}", parent.display())))?;
        }

        // Write aside and rename so readers never see a partial file.
        let staging = target.with_extension(format!("part-{}", Uuid::new_v4().simple()));
        if let Err(err) = tokio::fs::write(&staging, &bytes).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(ChatError::Upload(format!("write failed for {path}: {err}")));
        }
        if let Err(err) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(ChatError::Upload(format!("rename failed for {path}: {err}")));
        }

        log::info!("Stored blob {path} ({} bytes, {mime_type})", bytes.len());
        Ok(format!("{}/{}", self.public_base_url.trim_end_matches('/'), path))
    }
}

/// Blob store behind an HTTP object-storage API (`PUT {endpoint}/{bucket}/{path}`).
pub struct HttpBlobStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    token: Option<String>,
    public_base_url: String,
    max_bytes: usize,
}

impl HttpBlobStore {
    pub fn new(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        token: Option<String>,
        public_base_url: impl Into<String>,
        max_bytes: usize,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            token,
            public_base_url: public_base_url.into(),
            max_bytes,
        }
    }

    fn object_url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.bucket,
            path
        )
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>, mime_type: &str) -> Result<String> {
        check_relative(path)?;
        check_size(bytes.len(), self.max_bytes)?;

        let url = self.object_url(path);
        let mut request = self
            .client
            .put(&url)
            .header(CONTENT_TYPE, mime_type)
            .body(bytes);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| ChatError::Upload(format!("PUT {url} failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Upload(format!("PUT {url} returned {status}: {body}")));
        }

        log::info!("Uploaded blob {path} to bucket {}", self.bucket);
        Ok(format!(
            "{}/{}/{}",
            self.public_base_url.trim_end_matches('/'),
            self.bucket,
            path
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn local_store_writes_whole_file_and_returns_url() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path(), "https://files.test/", 1024);

        let url = store
            .upload("chat-1/100-abcd.png", vec![7u8; 64], "image/png")
            .await
            .unwrap();
        assert_eq!(url, "https://files.test/chat-1/100-abcd.png");

        let stored = std::fs::read(dir.path().join("chat-1/100-abcd.png")).unwrap();
        assert_eq!(stored.len(), 64);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("chat-1"))
            .unwrap()
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn local_store_enforces_its_own_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path(), "https://files.test", 10);
        let err = store
            .upload("chat-1/big.bin", vec![0u8; 11], "application/octet-stream")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Upload(_)));
        assert!(!dir.path().join("chat-1").exists());
    }

    #[tokio::test]
    async fn unsafe_paths_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path(), "https://files.test", 1024);
        for path in ["../escape.txt", "/etc/passwd", ""] {
            assert!(matches!(
                store.upload(path, vec![1], "text/plain").await,
                Err(ChatError::Upload(_))
            ));
        }
    }

    #[test]
    fn http_store_builds_object_url() {
        let store = HttpBlobStore::new(
            "https://storage.test/object/",
            "chat-attachments",
            None,
            "https://cdn.test",
            1024,
        );
        assert_eq!(
            store.object_url("c/1-a.pdf"),
            "https://storage.test/object/chat-attachments/c/1-a.pdf"
        );
    }

    fn http_store(server: &MockServer) -> HttpBlobStore {
        HttpBlobStore::new(
            server.uri(),
            "chat-attachments",
            Some("t0ken".to_string()),
            "https://cdn.test",
            1024,
        )
    }

    #[tokio::test]
    async fn http_store_puts_with_bearer_and_returns_public_url() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/chat-attachments/chat-1/1-ab.pdf"))
            .and(header("authorization", "Bearer t0ken"))
            .and(header("content-type", "application/pdf"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let url = http_store(&server)
            .upload("chat-1/1-ab.pdf", vec![1; 16], "application/pdf")
            .await
            .unwrap();
        assert_eq!(url, "https://cdn.test/chat-attachments/chat-1/1-ab.pdf");
    }

    #[tokio::test]
    async fn http_store_rejected_put_is_an_upload_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(403).set_body_string("bucket is read-only"))
            .expect(1)
            .mount(&server)
            .await;

        let err = http_store(&server)
            .upload("chat-1/1-ab.pdf", vec![1; 16], "application/pdf")
            .await
            .unwrap_err();
        match err {
            ChatError::Upload(reason) => {
                assert!(reason.contains("403"), "{reason}");
                assert!(reason.contains("bucket is read-only"), "{reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn http_store_checks_size_before_any_request() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = http_store(&server)
            .upload("chat-1/big.bin", vec![0; 2048], "application/octet-stream")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Upload(_)));
    }
}
