//! On-disk storage
//!
//! ```text
//! <root>/
//!   5/objdict.eds
//!   17/objdict.eds
//!   flash/
//!     0b6f…e1.yaml
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cangw_core::{
    next_flash_state, DeviceId, DictionaryStore, FlashPhase, FlashState, FlashStateStore,
    OrderId, StoreError, StoreResult,
};
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

const DICTIONARY_FILE: &str = "objdict.eds";
const FLASH_DIR: &str = "flash";

/// Directory-backed store for dictionaries and flash state
pub struct FileStorage {
    root: PathBuf,
    /// Serializes read-modify-write cycles on flash records
    flash_lock: Mutex<()>,
}

impl FileStorage {
    /// Open (and create if needed) a storage root
    pub async fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        create_private_dir(&root).await?;
        create_private_dir(&root.join(FLASH_DIR)).await?;
        debug!(root = %root.display(), "File storage opened");
        Ok(Self {
            root,
            flash_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dictionary_path(&self, device: DeviceId) -> PathBuf {
        self.root.join(device.to_string()).join(DICTIONARY_FILE)
    }

    fn flash_path(&self, order: OrderId) -> PathBuf {
        self.root.join(FLASH_DIR).join(format!("{}.yaml", order))
    }

    async fn read_flash_state(&self, order: OrderId) -> StoreResult<Option<FlashState>> {
        match tokio::fs::read(self.flash_path(order)).await {
            Ok(data) => serde_yaml::from_slice(&data)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

async fn create_private_dir(path: &Path) -> StoreResult<()> {
    tokio::fs::create_dir_all(path).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).await?;
    }
    Ok(())
}

/// Write through a uniquely named temporary sibling, flush it to disk and
/// rename it over `path`. Readers never observe a partially written file and
/// concurrent writers of the same path never share a temporary.
async fn write_atomic(path: &Path, data: &[u8]) -> StoreResult<()> {
    let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[async_trait]
impl DictionaryStore for FileStorage {
    async fn save_dictionary(&self, device: DeviceId, dictionary: &[u8]) -> StoreResult<()> {
        create_private_dir(&self.root.join(device.to_string())).await?;
        write_atomic(&self.dictionary_path(device), dictionary).await?;
        debug!(device_id = %device, size = dictionary.len(), "Dictionary stored");
        Ok(())
    }

    async fn load_dictionary(&self, device: DeviceId) -> StoreResult<Vec<u8>> {
        match tokio::fs::read(self.dictionary_path(device)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(format!(
                "dictionary for device {}",
                device
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_device_ids(&self) -> StoreResult<Vec<DeviceId>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            // "flash" and anything else non-numeric is not a device
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            {
                ids.push(DeviceId(id));
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl FlashStateStore for FileStorage {
    async fn save_flash_state(
        &self,
        order: OrderId,
        phase: FlashPhase,
        error: Option<&str>,
    ) -> StoreResult<FlashState> {
        let _guard = self.flash_lock.lock().await;

        let existing = self.read_flash_state(order).await?;
        let state = next_flash_state(existing, order, phase, error, Utc::now())?;
        let yaml =
            serde_yaml::to_string(&state).map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_atomic(&self.flash_path(order), yaml.as_bytes()).await?;
        Ok(state)
    }

    async fn load_flash_state(&self, order: OrderId) -> StoreResult<FlashState> {
        self.read_flash_state(order)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("flash order {}", order)))
    }
}
