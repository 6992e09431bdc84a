//! Sandboxed file storage for uploads and produced documents.
//!
//! Bytes live at `<root>/<kind>/<id>` where `id` is a UUID issued by the
//! store. Paths are derived from the id alone and re-validated against the
//! canonical root on every access.

use std::fmt;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::codec::DocumentFormat;
use crate::config::UploadConfig;
use crate::db::file_repo::{self, FileRow};
use crate::db::{format_timestamp, parse_timestamp, Database, DatabaseError};
use crate::error::{RedlineError, Result};
use crate::sanitize;

/// First bytes of every zip archive, and so of every DOCX.
const ZIP_SIGNATURE: &[u8] = b"PK\x03\x04";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Upload,
    Output,
}

impl FileKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Upload => "upload",
            FileKind::Output => "output",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "upload" => Ok(FileKind::Upload),
            "output" => Ok(FileKind::Output),
            other => Err(format!("unknown file kind '{}'", other)),
        }
    }
}

/// Metadata of a stored file. The on-disk path is never exposed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    pub kind: FileKind,
    pub original_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the content.
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn format(&self) -> Option<DocumentFormat> {
        DocumentFormat::from_file_name(&self.original_name)
    }

    fn from_row(row: &FileRow) -> std::result::Result<Self, DatabaseError> {
        let kind = row
            .kind
            .parse::<FileKind>()
            .map_err(|reason| DatabaseError::CorruptRow {
                table: "files",
                id: row.id.clone(),
                reason,
            })?;
        Ok(Self {
            id: row.id.clone(),
            kind,
            original_name: row.original_name.clone(),
            mime_type: row.mime_type.clone(),
            size_bytes: row.size_bytes,
            checksum: row.checksum.clone(),
            created_at: parse_timestamp(&row.created_at, "files", &row.id)?,
            expires_at: parse_timestamp(&row.expires_at, "files", &row.id)?,
        })
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn relative_path(kind: FileKind, id: &str) -> String {
    format!("{}/{}", kind.as_str(), id)
}

pub struct FileStore {
    root: PathBuf,
    db: Database,
    ttl: Duration,
    upload: UploadConfig,
}

impl FileStore {
    /// Opens the store, creating the root and its kind directories.
    pub fn open(root: &Path, db: Database, ttl: Duration, upload: UploadConfig) -> Result<Self> {
        for kind in [FileKind::Upload, FileKind::Output] {
            let dir = root.join(kind.as_str());
            std::fs::create_dir_all(&dir).map_err(|e| RedlineError::Io {
                path: dir.clone(),
                source: e,
            })?;
        }
        let root = root.canonicalize().map_err(|e| RedlineError::Io {
            path: root.to_path_buf(),
            source: e,
        })?;

        log::info!("File store rooted at {}", root.display());
        Ok(Self {
            root,
            db,
            ttl,
            upload,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn validate(&self, kind: FileKind, bytes: &[u8], original_name: &str) -> Result<DocumentFormat> {
        let ext = original_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        let allowed = kind == FileKind::Output
            || self
                .upload
                .allowed_extensions
                .iter()
                .any(|a| a.eq_ignore_ascii_case(&ext));
        let format = match DocumentFormat::from_extension(&ext) {
            Some(format) if allowed => format,
            _ => {
                return Err(RedlineError::Validation(format!(
                    "file type '.{}' is not allowed",
                    ext
                )))
            }
        };

        if kind == FileKind::Upload && bytes.is_empty() {
            return Err(RedlineError::Validation("file is empty".to_string()));
        }
        if kind == FileKind::Upload && bytes.len() as u64 > self.upload.max_upload_bytes {
            return Err(RedlineError::Validation(format!(
                "file is {} bytes, limit is {}",
                bytes.len(),
                self.upload.max_upload_bytes
            )));
        }
        if format == DocumentFormat::Docx && !bytes.starts_with(ZIP_SIGNATURE) {
            return Err(RedlineError::Validation(
                "file is not a valid .docx document".to_string(),
            ));
        }
        Ok(format)
    }

    /// Validates and stores bytes, returning the new record.
    pub fn put(&self, kind: FileKind, bytes: &[u8], original_name: &str) -> Result<FileRecord> {
        let original_name = sanitize::display_name(original_name);
        self.validate(kind, bytes, &original_name)?;

        let now = Utc::now();
        let expires_at = now.checked_add_signed(self.ttl).ok_or_else(|| {
            RedlineError::Validation("file time-to-live is out of range".to_string())
        })?;

        let id = Uuid::new_v4().to_string();
        let relative = relative_path(kind, &id);
        let final_path = self.root.join(&relative);
        let temp_path = self.root.join(kind.as_str()).join(format!(".{}.part", id));

        let write = || -> std::io::Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            std::fs::rename(&temp_path, &final_path)
        };
        if let Err(e) = write() {
            let _ = std::fs::remove_file(&temp_path);
            return Err(RedlineError::Io {
                path: final_path,
                source: e,
            });
        }

        let record = FileRecord {
            id: id.clone(),
            kind,
            mime_type: mime_guess::from_path(&original_name)
                .first()
                .map(|m| m.to_string()),
            original_name,
            size_bytes: bytes.len() as u64,
            checksum: sha256_hex(bytes),
            created_at: now,
            expires_at,
        };

        let row = FileRow {
            id: id.clone(),
            kind: kind.as_str().to_string(),
            path: relative,
            original_name: record.original_name.clone(),
            mime_type: record.mime_type.clone(),
            size_bytes: record.size_bytes,
            checksum: record.checksum.clone(),
            created_at: format_timestamp(record.created_at),
            expires_at: format_timestamp(record.expires_at),
        };
        if let Err(e) = file_repo::insert(&self.db, &row) {
            let _ = std::fs::remove_file(&final_path);
            return Err(e.into());
        }

        log::debug!(
            "Stored {} file {} ({} bytes)",
            kind,
            id,
            record.size_bytes
        );
        Ok(record)
    }

    /// Returns a live record. Expired files are `NotFound` even before the
    /// sweep removes them.
    pub fn get(&self, id: &str) -> Result<FileRecord> {
        self.get_at(id, Utc::now())
    }

    pub fn get_at(&self, id: &str, now: DateTime<Utc>) -> Result<FileRecord> {
        let not_found = || RedlineError::NotFound(format!("file {}", id));
        let row = file_repo::find_by_id(&self.db, id)?.ok_or_else(not_found)?;
        let record = FileRecord::from_row(&row)?;
        if record.is_expired(now) {
            return Err(not_found());
        }
        Ok(record)
    }

    fn violation(&self, id: &str, reason: &str) -> RedlineError {
        log::error!(
            "Rejected file access (id hash {}): {}",
            sanitize::hash_path(Path::new(id)),
            reason
        );
        RedlineError::SecurityViolation(reason.to_string())
    }

    fn check_id(&self, id: &str) -> Result<()> {
        let canonical = Uuid::parse_str(id)
            .ok()
            .map(|u| u.hyphenated().to_string());
        if canonical.as_deref() != Some(id) {
            return Err(self.violation(id, "file id is not a canonical identifier"));
        }
        Ok(())
    }

    /// Joins a row's stored path onto the root after checking it is exactly
    /// `<kind>/<id>` and made only of plain components.
    fn stored_path(&self, row: &FileRow) -> Result<PathBuf> {
        self.check_id(&row.id)?;
        let kind = row
            .kind
            .parse::<FileKind>()
            .map_err(|_| self.violation(&row.id, "stored file kind is unknown"))?;
        if row.path != relative_path(kind, &row.id) {
            return Err(self.violation(&row.id, "stored path does not match file id"));
        }
        let relative = Path::new(&row.path);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(self.violation(&row.id, "stored path is not relative to the root"));
        }
        Ok(self.root.join(relative))
    }

    /// Absolute path of a stored file, re-validated against the root.
    pub fn resolve_path(&self, id: &str) -> Result<PathBuf> {
        self.check_id(id)?;
        let row = file_repo::find_by_id(&self.db, id)?
            .ok_or_else(|| RedlineError::NotFound(format!("file {}", id)))?;
        let path = self.stored_path(&row)?;

        match path.canonicalize() {
            Ok(canonical) if canonical.starts_with(&self.root) => Ok(canonical),
            Ok(_) => Err(self.violation(id, "path escapes the storage root")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(path),
            Err(e) => Err(RedlineError::Io { path, source: e }),
        }
    }

    /// Reads a live file's bytes and verifies them against the checksum.
    pub fn read(&self, id: &str) -> Result<(FileRecord, Vec<u8>)> {
        let record = self.get(id)?;
        let path = self.resolve_path(&record.id)?;

        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RedlineError::NotFound(format!("file {}", id)));
            }
            Err(e) => return Err(RedlineError::Io { path, source: e }),
        };

        let actual = sha256_hex(&bytes);
        if actual != record.checksum {
            log::error!("Checksum mismatch for file {}", record.id);
            return Err(RedlineError::Integrity {
                id: record.id,
                expected: record.checksum,
                actual,
            });
        }
        Ok((record, bytes))
    }

    /// Deletes every file with `expires_at <= now`. Returns the removed ids.
    ///
    /// The row goes first so a concurrent reader sees `NotFound` rather than
    /// a record without bytes.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let expired = file_repo::find_expired(&self.db, &format_timestamp(now))?;
        let mut removed = Vec::with_capacity(expired.len());

        for row in expired {
            let path = match self.stored_path(&row) {
                Ok(path) => path,
                Err(e) => {
                    log::error!("Not sweeping file {}: {}", row.id, e);
                    continue;
                }
            };
            if !file_repo::delete(&self.db, &row.id)? {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!(
                    "Failed to remove expired file {}: {}",
                    sanitize::redact_path(&path),
                    e
                ),
            }
            removed.push(row.id);
        }

        if !removed.is_empty() {
            log::info!("Swept {} expired files", removed.len());
        }
        Ok(removed)
    }
}
