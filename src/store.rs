//! Durable account store
//!
//! A single JSON document per account. Writes go to a sibling
//! temporary file that is renamed over the original, and the in-memory
//! snapshot is swapped only after the rename succeeded, so readers
//! never observe half-written settings.

use crate::error::{Error, Result};
use crate::settings::ConfiguredSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Persisted account state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAccount {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configured: Option<ConfiguredSettings>,
}

impl StoredAccount {
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.configured.is_some()
    }

    #[must_use]
    pub fn addr(&self) -> Option<&str> {
        self.configured.as_ref().map(|s| s.addr.as_str())
    }
}

/// Handle to the durable storage of one account.
#[derive(Debug)]
pub struct AccountStore {
    path: Option<PathBuf>,
    snapshot: RwLock<StoredAccount>,
}

impl AccountStore {
    /// Open the store at `path`, loading existing state.
    ///
    /// A missing or empty file is an unconfigured account; the file is
    /// created on the first successful configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or does
    /// not contain a valid account document.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let account = match fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => StoredAccount::default(),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                Error::Store(format!("Failed to parse {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoredAccount::default(),
            Err(e) => return Err(e.into()),
        };

        info!(
            "Opened account store at {} (configured: {})",
            path.display(),
            account.is_configured()
        );

        Ok(Self {
            path: Some(path),
            snapshot: RwLock::new(account),
        })
    }

    /// A store that lives only as long as the process.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            snapshot: RwLock::new(StoredAccount::default()),
        }
    }

    /// Location on disk, `None` for an in-memory store.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.read().is_configured()
    }

    /// A copy of the current persisted state.
    #[must_use]
    pub fn load(&self) -> StoredAccount {
        self.read().clone()
    }

    /// Replace the configured settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be written; the
    /// previous settings stay in effect.
    pub async fn save_settings(&self, settings: ConfiguredSettings) -> Result<()> {
        let account = StoredAccount {
            configured: Some(settings),
        };

        if let Some(path) = &self.path {
            write_atomic(path, &account).await?;
            debug!("Wrote account store {}", path.display());
        }

        *self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = account;
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoredAccount> {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn write_atomic(path: &Path, account: &StoredAccount) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_string_pretty(account)?;
    let tmp = tmp_path(path);

    let written = match write_synced(&tmp, json.as_bytes()).await {
        Ok(()) => fs::rename(&tmp, path).await.map_err(|e| {
            Error::Store(format!(
                "Failed to replace {} with {}: {e}",
                path.display(),
                tmp.display()
            ))
        }),
        Err(e) => Err(e),
    };
    if written.is_err() {
        fs::remove_file(&tmp).await.ok();
    }
    written
}

async fn write_synced(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
