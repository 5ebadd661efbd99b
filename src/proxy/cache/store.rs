use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs as async_fs;
use tokio::fs::File as AsyncFile;

use super::ContentHash;

const NEW_DIR_NAME: &str = "new";

/// The on-disk blob layout: 256 hex shard directories plus a temp directory
/// for in-flight admissions. A blob with hash `H` lives at
/// `base/<hex(H[0])>/<hex(H[1..])>`. Blob contents are immutable.
#[derive(Debug, Clone)]
pub(super) struct BlobStore {
    base: PathBuf,
    new_dir: PathBuf,
}

impl BlobStore {
    pub(super) fn init(base: &Path) -> Result<Self> {
        fs::create_dir_all(base)
            .with_context(|| format!("failed to create cache root {}", base.display()))?;
        for shard in 0..=255u32 {
            let dir = base.join(format!("{shard:02x}"));
            match fs::create_dir(&dir) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to create shard {}", dir.display()));
                }
            }
        }
        let new_dir = base.join(NEW_DIR_NAME);
        match fs::create_dir(&new_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to create temp dir {}", new_dir.display()));
            }
        }

        let store = Self {
            base: base.to_path_buf(),
            new_dir,
        };
        store.remove_stale_temp_files()?;
        Ok(store)
    }

    pub(super) fn base(&self) -> &Path {
        &self.base
    }

    pub(super) fn blob_path(&self, hash: ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        self.base.join(&hex[..2]).join(&hex[2..])
    }

    pub(super) async fn open_body(&self, hash: ContentHash) -> std::io::Result<(AsyncFile, u64)> {
        let path = self.blob_path(hash);
        let file = AsyncFile::open(&path).await?;
        let size = file.metadata().await?.len();
        Ok((file, size))
    }

    pub(super) async fn create_temp(&self) -> Result<(AsyncFile, PathBuf)> {
        let name = format!("tmp_{}", uuid::Uuid::new_v4());
        let path = self.new_dir.join(name);
        let file = async_fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to create temp file {}", path.display()))?;
        Ok((file, path))
    }

    /// Links a finished temp file to its content-addressed name. An existing
    /// link means an identical body was admitted concurrently; that counts
    /// as success.
    pub(super) async fn link_blob(&self, temp: &Path, hash: ContentHash) -> std::io::Result<()> {
        match async_fs::hard_link(temp, self.blob_path(hash)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub(super) fn remove_blob_blocking(&self, hash: ContentHash) -> std::io::Result<()> {
        match fs::remove_file(self.blob_path(hash)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Leftovers from admissions interrupted by a crash.
    fn remove_stale_temp_files(&self) -> Result<()> {
        for entry in fs::read_dir(&self.new_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path()).ok();
            }
        }
        Ok(())
    }
}
