pub mod fs;


use crate::{
    config::{ConfigErrors, StorageConfig},
    error::RemoteError,
};
use chrono::{DateTime, Duration, Months, Utc};
use sha2::{Digest, Sha256};
use std::{
    fs::File,
    io::{self, Read},
    path::Path,
    sync::Arc,
};

/// Container receiving the tools every job preparation step fetches
pub const TOOLS_CONTAINER: &str = "tools";

/// Container receiving the versioned simulation application archives
pub const APPLICATION_CONTAINER: &str = "application";

/// Object as listed from a container
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobInfo {
    pub name: String,
    pub size: u64,
    // hex sha256 of the content, when the store tracks it
    pub checksum: Option<String>,
}

/// Validity window of a read only capability url
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapabilityWindow {
    pub start: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
}

impl CapabilityWindow {
    /// window for staged job inputs: from 15 minutes ago until 12 months from now
    pub fn staged_input() -> Self {
        let now = Utc::now();

        Self {
            start: now - Duration::minutes(15),
            expiry: now
                .checked_add_months(Months::new(12))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// window for shared tool blobs: from an hour ago until 2 months from now
    pub fn shared_tool() -> Self {
        let now = Utc::now();

        Self {
            start: now - Duration::hours(1),
            expiry: now
                .checked_add_months(Months::new(2))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

/// Object store contract consumed by the orchestration core.
///
/// Implementations are expected to be safe for concurrent use, transfers of distinct blobs are
/// fanned out over a thread pool.
pub trait ObjectStore: Send + Sync {
    fn create_container(&self, container: &str) -> Result<(), RemoteError>;
    fn container_exists(&self, container: &str) -> Result<bool, RemoteError>;
    fn delete_container(&self, container: &str) -> Result<(), RemoteError>;

    /// Lists all blobs of a container, an absent container lists as empty
    fn list(&self, container: &str) -> Result<Vec<BlobInfo>, RemoteError>;
    fn properties(&self, container: &str, blob: &str) -> Result<Option<BlobInfo>, RemoteError>;
    fn upload(&self, container: &str, blob: &str, source: &Path) -> Result<(), RemoteError>;
    fn download(&self, container: &str, blob: &str, target: &Path) -> Result<(), RemoteError>;
    fn delete(&self, container: &str, blob: &str) -> Result<(), RemoteError>;

    /// Base url of a container, deterministic for a given name
    fn container_url(&self, container: &str) -> String;

    /// Account and key used to sign capabilities
    fn credentials(&self) -> (&str, &str);

    fn exists(&self, container: &str, blob: &str) -> Result<bool, RemoteError> {
        Ok(self.properties(container, blob)?.is_some())
    }

    /// Url granting read access to one blob for the given window, appended as query suffix
    fn read_capability(&self, container: &str, blob: &str, window: CapabilityWindow) -> String {
        let (account, key) = self.credentials();
        let start = window.start.format("%Y-%m-%dT%H:%M:%SZ");
        let expiry = window.expiry.format("%Y-%m-%dT%H:%M:%SZ");

        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hasher.update(format!("r\n{start}\n{expiry}\n/{account}/{container}/{blob}").as_bytes());
        let signature = format!("{:x}", hasher.finalize());

        format!(
            "{}/{blob}?sp=r&st={start}&se={expiry}&sig={signature}",
            self.container_url(container)
        )
    }
}

/// load the configured object store
pub fn load(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>, ConfigErrors> {
    match config.name.as_str() {
        "fs" => Ok(Arc::new(fs::FsStore::new(
            config.root.clone(),
            config.account.clone(),
            config.key.clone(),
        ))),
        _ => Err(ConfigErrors::UnsupportedStorage(config.name.clone())),
    }
}

/// hex sha256 of a local file
pub fn file_checksum(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// lower case extension of a blob name including the dot, empty if there is none
pub fn extension(blob: &str) -> String {
    Path::new(blob)
        .extension()
        .map(|extension| format!(".{}", extension.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}
