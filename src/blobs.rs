use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _};
use log::error;

use crate::config::BlobStoreConfig;

/// A client for archiving full log files in an object store.
///
/// Only the put side is modelled; whoever holds the returned URL serves the
/// bytes.  Cloud backends are deployment add-ons, the filesystem backend
/// below is what ships in-tree (and what the tests use).
pub trait BlobStore: Send {
    /// Uploads a test log and returns its URL, or None if the upload failed
    /// for whatever reason.  Uploads are best-effort: a lost full log still
    /// leaves the inline snippet in the database.
    fn upload_test_log(&self, test_id: i64, name: &str, file: &Path) -> Option<String> {
        let blob_name = format!("test_{test_id}_{name}");
        match self.put(&blob_name, file) {
            Ok(url) => Some(url),
            Err(err) => {
                error!("couldn't upload {blob_name}: {err:#}");
                None
            }
        }
    }

    /// Stores the file under the given name and returns its URL.
    fn put(&self, name: &str, file: &Path) -> anyhow::Result<String>;
}

/// Blob store backed by a plain directory, typically one served by a static
/// file server.
pub struct FsBlobStore {
    root: PathBuf,
    base_url: String,
}

impl FsBlobStore {
    pub fn new(root: PathBuf, base_url: String) -> Self {
        Self {
            root,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, name: &str, file: &Path) -> anyhow::Result<String> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating {}", self.root.display()))?;
        let dest = self.root.join(name);
        fs::copy(file, &dest)
            .with_context(|| format!("copying {} to {}", file.display(), dest.display()))?;
        Ok(format!("{}/{name}", self.base_url))
    }
}

/// Instantiates the client selected by the `service` key of the blob-store
/// configuration.
pub fn from_config(config: &BlobStoreConfig) -> anyhow::Result<Box<dyn BlobStore>> {
    match config.service.as_str() {
        "fs" => Ok(Box::new(FsBlobStore::new(
            config.require_root()?.to_owned(),
            config.require_base_url()?.to_owned(),
        ))),
        service => bail!("unknown blob store service '{service}'"),
    }
}
