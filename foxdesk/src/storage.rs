//! Attachment file storage on the local filesystem.
//!
//! Files live at `<storage_dir>/<ticket_id>/<attachment_id>`; the database keeps the relative
//! path, the original (sanitized) name and a SHA-256 checksum. The same policy (size limit and
//! extension denylist) applies to API uploads and email attachments.

use crate::{
    config::AttachmentsConfig,
    db::errors::{DbError, Result},
    types::{AttachmentId, TicketId},
};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Why an attachment was not accepted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AttachmentRejection {
    #[error("file type .{extension} is not allowed")]
    DeniedExtension { extension: String },

    #[error("file is {size} bytes, the limit is {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("file is empty")]
    Empty,
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    /// Path relative to the storage directory
    pub storage_path: String,
    pub sha256: String,
    pub size_bytes: i64,
}

#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    base_path: PathBuf,
    max_size_bytes: u64,
    denied_extensions: Vec<String>,
}

impl LocalFileStorage {
    pub fn new(config: &AttachmentsConfig) -> Self {
        Self {
            base_path: config.storage_dir.clone(),
            max_size_bytes: config.max_size_bytes,
            denied_extensions: config.denied_extensions.iter().map(|e| e.trim_start_matches('.').to_lowercase()).collect(),
        }
    }

    /// Check a file against the size limit and extension denylist before storing it.
    pub fn check(&self, filename: &str, size: u64) -> std::result::Result<(), AttachmentRejection> {
        if size == 0 {
            return Err(AttachmentRejection::Empty);
        }
        if size > self.max_size_bytes {
            return Err(AttachmentRejection::TooLarge {
                size,
                max: self.max_size_bytes,
            });
        }
        // Every dotted segment counts, so `invoice.exe.pdf` is refused as well as `invoice.pdf.exe`
        let lowered = filename.to_lowercase();
        for extension in lowered.split('.').skip(1) {
            if self.denied_extensions.iter().any(|denied| denied == extension) {
                return Err(AttachmentRejection::DeniedExtension {
                    extension: extension.to_string(),
                });
            }
        }
        Ok(())
    }

    fn resolve(&self, storage_path: &str) -> Result<PathBuf> {
        let relative = Path::new(storage_path);
        if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(DbError::Other(anyhow::anyhow!("invalid storage path '{storage_path}'")));
        }
        Ok(self.base_path.join(relative))
    }

    pub async fn store(&self, ticket_id: TicketId, attachment_id: AttachmentId, content: &[u8]) -> Result<StoredFile> {
        let storage_path = format!("{ticket_id}/{attachment_id}");
        let full_path = self.resolve(&storage_path)?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DbError::Other(anyhow::anyhow!("failed to create {}: {e}", parent.display())))?;
        }

        let mut file = fs::File::create(&full_path)
            .await
            .map_err(|e| DbError::Other(anyhow::anyhow!("failed to create {}: {e}", full_path.display())))?;
        let written: Result<()> = async {
            file.write_all(content)
                .await
                .map_err(|e| DbError::Other(anyhow::anyhow!("failed to write attachment: {e}")))?;
            file.sync_all()
                .await
                .map_err(|e| DbError::Other(anyhow::anyhow!("failed to sync attachment: {e}")))
        }
        .await;
        if let Err(e) = written {
            drop(file);
            // A partial file is not referenced by any row yet.
            if let Err(remove) = fs::remove_file(&full_path).await {
                warn!(path = %full_path.display(), error = %remove, "Failed to remove partial attachment");
            }
            return Err(e);
        }

        Ok(StoredFile {
            storage_path,
            sha256: hex_digest(content),
            size_bytes: content.len() as i64,
        })
    }

    pub async fn retrieve(&self, storage_path: &str) -> Result<Vec<u8>> {
        let full_path = self.resolve(storage_path)?;
        match fs::read(&full_path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(DbError::NotFound),
            Err(e) => Err(DbError::Other(anyhow::anyhow!("failed to read attachment: {e}"))),
        }
    }

    /// Remove a stored file. Missing files are not an error.
    pub async fn delete(&self, storage_path: &str) -> Result<()> {
        let full_path = self.resolve(storage_path)?;
        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DbError::Other(anyhow::anyhow!("failed to delete attachment: {e}"))),
        }
    }

    /// Remove the directory holding a ticket's attachments.
    pub async fn delete_ticket_dir(&self, ticket_id: TicketId) -> Result<()> {
        let dir = self.base_path.join(ticket_id.to_string());
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DbError::Other(anyhow::anyhow!("failed to delete {}: {e}", dir.display()))),
        }
    }
}

fn hex_digest(content: &[u8]) -> String {
    Sha256::digest(content).iter().map(|b| format!("{b:02x}")).collect()
}

/// Reduce a client-supplied file name to a safe display name.
///
/// Path components are dropped, control characters and path separators removed, and the
/// result is capped at 200 characters. Empty results become `attachment`.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '"' | '<' | '>' | ':' | '|' | '?' | '*'))
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.').trim();
    if trimmed.is_empty() {
        return "attachment".to_string();
    }
    trimmed.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(dir: &Path) -> LocalFileStorage {
        LocalFileStorage::new(&AttachmentsConfig {
            storage_dir: dir.to_path_buf(),
            max_size_bytes: 16,
            denied_extensions: vec!["exe".to_string(), ".JS".to_string()],
        })
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\me\\report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("  inv\u{0}oice?.pdf "), "invoice.pdf");
        assert_eq!(sanitize_filename("..."), "attachment");
        assert_eq!(sanitize_filename(""), "attachment");
        assert_eq!(sanitize_filename(&"a".repeat(300)).len(), 200);
    }

    #[test]
    fn test_check_policy() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());

        assert!(storage.check("notes.txt", 10).is_ok());
        assert_eq!(storage.check("notes.txt", 0), Err(AttachmentRejection::Empty));
        assert_eq!(storage.check("notes.txt", 17), Err(AttachmentRejection::TooLarge { size: 17, max: 16 }));
        assert_eq!(
            storage.check("Setup.EXE", 10),
            Err(AttachmentRejection::DeniedExtension {
                extension: "exe".to_string()
            })
        );
        assert!(matches!(
            storage.check("script.js.txt", 10),
            Err(AttachmentRejection::DeniedExtension { .. })
        ));
        assert!(storage.check("README", 10).is_ok());
    }

    #[tokio::test]
    async fn test_store_retrieve_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let ticket_id = uuid::Uuid::new_v4();
        let attachment_id = uuid::Uuid::new_v4();

        let stored = storage.store(ticket_id, attachment_id, b"hello").await.unwrap();
        assert_eq!(stored.size_bytes, 5);
        assert_eq!(stored.sha256, "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824");
        assert_eq!(storage.retrieve(&stored.storage_path).await.unwrap(), b"hello");

        storage.delete(&stored.storage_path).await.unwrap();
        assert!(matches!(storage.retrieve(&stored.storage_path).await, Err(DbError::NotFound)));
        storage.delete(&stored.storage_path).await.unwrap();
        storage.delete_ticket_dir(ticket_id).await.unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_failed_write_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let ticket_id = uuid::Uuid::new_v4();
        let attachment_id = uuid::Uuid::new_v4();

        // Writes to /dev/full fail with ENOSPC after the file has been opened
        let ticket_dir = dir.path().join(ticket_id.to_string());
        std::fs::create_dir_all(&ticket_dir).unwrap();
        let target = ticket_dir.join(attachment_id.to_string());
        std::os::unix::fs::symlink("/dev/full", &target).unwrap();

        assert!(storage.store(ticket_id, attachment_id, b"hello").await.is_err());
        assert!(std::fs::symlink_metadata(&target).is_err());
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        assert!(storage.retrieve("../secret").await.is_err());
    }
}
