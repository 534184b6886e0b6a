//! On-disk locations and the rules document
//!
//! Files live in `~/.oxideterm` (`%APPDATA%\OxideTerm` on Windows).

use std::path::PathBuf;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};

use crate::rules::{RuleDocument, RULES_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Rules version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

/// Per-user OxideTerm configuration directory
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(dir) = dirs::config_dir() {
            return Ok(dir.join("OxideTerm"));
        }
    }

    dirs::home_dir()
        .map(|home| home.join(".oxideterm"))
        .ok_or(StorageError::NoConfigDir)
}

/// Default rules document
pub fn rules_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("port_forwards.json"))
}

pub fn settings_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("forwarding.json"))
}

/// The rules document on disk
#[derive(Debug, Clone)]
pub struct RuleStorage {
    path: PathBuf,
}

impl RuleStorage {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Read the document.
    ///
    /// A missing file is an empty document. Unparseable content is copied
    /// aside and also treated as empty; a newer `version` is an error.
    pub async fn load(&self) -> Result<RuleDocument, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RuleDocument::default())
            }
            Err(e) => return Err(e.into()),
        };

        let doc: RuleDocument = match serde_json::from_str(&contents) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Unparseable rules document {:?}: {}", self.path, e);
                self.set_aside().await;
                return Ok(RuleDocument::default());
            }
        };

        if doc.version > RULES_VERSION {
            return Err(StorageError::VersionTooNew {
                found: doc.version,
                supported: RULES_VERSION,
            });
        }
        Ok(doc)
    }

    /// Copy an unreadable document to `<name>.backup.<timestamp>`
    async fn set_aside(&self) {
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let backup = self.path.with_extension(format!("json.backup.{}", stamp));
        match fs::copy(&self.path, &backup).await {
            Ok(_) => warn!("Kept a copy at {:?}, continuing with no rules", backup),
            Err(e) => error!("Could not copy {:?} aside: {}", self.path, e),
        }
    }

    /// Replace the document atomically (temp file + rename)
    pub async fn save(&self, doc: &RuleDocument) -> Result<(), StorageError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }

        let json = serde_json::to_vec_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
