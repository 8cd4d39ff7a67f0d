use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use bytesize::ByteSize;
use walkdir::WalkDir;

use crate::error::Error;
use crate::probe::{existing_ancestor, DataDirectory};

type Result<T> = crate::Result<T>;

/// Free space and identity of the volumes the data lives on.
pub trait VolumeStats: Send + Sync {
    /// Bytes available to unprivileged writers on the volume holding `path`.
    fn free_bytes(&self, path: &Path) -> Result<u64>;

    /// Device id of the volume holding `path`, or of its closest existing ancestor.
    fn device(&self, path: &Path) -> Result<u64>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsVolumes;

impl VolumeStats for StatvfsVolumes {
    fn free_bytes(&self, path: &Path) -> Result<u64> {
        let path = existing_ancestor(path);
        let stat = nix::sys::statvfs::statvfs(path).map_err(|e| Error::Resource {
            path: path.to_path_buf(),
            source: e.into(),
        })?;
        #[allow(clippy::unnecessary_cast)]
        let free = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        Ok(free)
    }

    fn device(&self, path: &Path) -> Result<u64> {
        let path = existing_ancestor(path);
        let meta = std::fs::metadata(path).map_err(Error::io(path))?;
        Ok(meta.dev())
    }
}

/// Decides whether a copy or upgrade fits on the destination volume.
pub struct SpaceBudgeter<'a> {
    volumes: &'a dyn VolumeStats,
    safety_margin: ByteSize,
}

impl<'a> SpaceBudgeter<'a> {
    pub fn new(volumes: &'a dyn VolumeStats, safety_margin: ByteSize) -> Self {
        Self {
            volumes,
            safety_margin,
        }
    }

    /// `size(source) * multiplier + margin <= free(destination)`.
    pub async fn can_accommodate(
        &self,
        source: &DataDirectory,
        destination_volume: &Path,
        multiplier: u64,
    ) -> Result<bool> {
        self.check(source, destination_volume, multiplier)
            .await
            .map(|shortfall| shortfall.is_none())
    }

    /// Like [`SpaceBudgeter::can_accommodate`], but fails with [`Error::InsufficientSpace`].
    pub async fn require(
        &self,
        source: &DataDirectory,
        destination_volume: &Path,
        multiplier: u64,
    ) -> Result<()> {
        match self.check(source, destination_volume, multiplier).await? {
            None => Ok(()),
            Some((needed, available)) => Err(Error::InsufficientSpace {
                volume: destination_volume.to_path_buf(),
                needed,
                available,
            }),
        }
    }

    async fn check(
        &self,
        source: &DataDirectory,
        destination_volume: &Path,
        multiplier: u64,
    ) -> Result<Option<(u64, u64)>> {
        let size = source.size_bytes().await?;
        let needed = size
            .saturating_mul(multiplier)
            .saturating_add(self.safety_margin.as_u64());
        let available = self.volumes.free_bytes(destination_volume)?;

        tracing::info!(
            "`{}` is {}, need {} on `{}`, {} available",
            source.path.display(),
            ByteSize::b(size),
            ByteSize::b(needed),
            destination_volume.display(),
            ByteSize::b(available),
        );

        Ok((needed > available).then_some((needed, available)))
    }
}

/// Sum of the apparent sizes of all regular files under `path`.
pub async fn tree_size(path: PathBuf) -> Result<u64> {
    tokio::task::spawn_blocking(move || {
        let mut total = 0u64;
        for entry in WalkDir::new(&path).follow_links(false) {
            let entry = entry.map_err(|e| Error::Resource {
                path: e.path().unwrap_or(path.as_path()).to_path_buf(),
                source: e.into(),
            })?;
            if entry.file_type().is_file() {
                let meta = entry.metadata().map_err(|e| Error::Resource {
                    path: entry.path().to_path_buf(),
                    source: e.into(),
                })?;
                total += meta.size();
            }
        }
        Ok(total)
    })
    .await
    .map_err(|e| Error::Internal(e.to_string()))?
}
