use std::fs::{self, FileTimes};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::config::ClusterLayout;
use crate::error::Error;
use crate::probe::{self, DataDirectory};

type Result<T> = crate::Result<T>;

/// Unix account a directory or a helper process belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    pub fn lookup(name: &str) -> Result<Self> {
        let user = nix::unistd::User::from_name(name)
            .map_err(|e| Error::Internal(format!("failed to look up user `{name}`: {e}")))?
            .ok_or_else(|| Error::Internal(format!("no such user: `{name}`")))?;
        Ok(Self {
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
        })
    }

    pub fn of(path: &Path) -> Result<Self> {
        let meta = fs::symlink_metadata(path).map_err(Error::io(path))?;
        Ok(Self {
            uid: meta.uid(),
            gid: meta.gid(),
        })
    }
}

/// Guarded moves and copies of data directories.
///
/// Nothing here overwrites an existing path, and the only way to delete data is [`Relocator::purge`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Relocator;

impl Relocator {
    /// Renames `path` to `<path>.<timestamp>`, appending a counter if that name is taken.
    pub async fn move_aside(&self, path: &Path) -> Result<PathBuf> {
        self.move_aside_at(path, Utc::now()).await
    }

    pub async fn move_aside_at(&self, path: &Path, now: DateTime<Utc>) -> Result<PathBuf> {
        let (parent, name) = match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => (parent, name.to_string_lossy().into_owned()),
            _ => return Err(Error::validation(path, "cannot move aside a root path")),
        };
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(Error::io(parent))?;

        let stamp = now.format("%Y-%m-%d_%H-%M-%S");
        let mut dest = parent.join(format!("{name}.{stamp}"));
        let mut n = 0;
        while try_exists(&dest)? {
            n += 1;
            dest = parent.join(format!("{name}.{stamp}-{n}"));
        }

        tokio::fs::rename(path, &dest).await.map_err(Error::io(path))?;
        tracing::info!("moved `{}` aside to `{}`", path.display(), dest.display());

        Ok(dest)
    }

    /// Moves aside whatever is at `path`, so that it can be created afresh.
    pub async fn make_room(&self, path: &Path) -> Result<Option<PathBuf>> {
        if try_exists(path)? {
            self.move_aside(path).await.map(Some)
        } else {
            Ok(None)
        }
    }

    /// Recursively copies `src` to `dst`, keeping permissions, modification times, symlinks and,
    /// when running privileged, ownership. `dst` must not exist.
    ///
    /// A failed copy is left on disk as is.
    pub async fn copy_preserving_metadata(&self, src: &Path, dst: &Path) -> Result<()> {
        if try_exists(dst)? {
            return Err(Error::DestinationExists(dst.to_path_buf()));
        }
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(Error::io(parent))?;
        }

        tracing::info!("copying `{}` to `{}`", src.display(), dst.display());
        let src = src.to_path_buf();
        let dst = dst.to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
    }

    /// Creates `path` if needed and fixes its ownership and mode. Safe to call repeatedly.
    pub async fn ensure_owned_directory(
        &self,
        path: &Path,
        owner: Option<Owner>,
        mode: u32,
    ) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(Error::io(path))?;
        let meta = tokio::fs::metadata(path).await.map_err(Error::io(path))?;

        if let Some(owner) = owner {
            if meta.uid() != owner.uid || meta.gid() != owner.gid {
                std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid))
                    .map_err(Error::io(path))?;
            }
        }

        if meta.permissions().mode() & 0o7777 != mode {
            tokio::fs::set_permissions(path, fs::Permissions::from_mode(mode))
                .await
                .map_err(Error::io(path))?;
        }

        Ok(())
    }

    /// Creates a cluster's root, socket and log directories. The data directory is left to
    /// [`Relocator::promote`].
    pub async fn ensure_cluster_directories(
        &self,
        cluster: &ClusterLayout,
        owner: Option<Owner>,
    ) -> Result<()> {
        self.ensure_owned_directory(&cluster.root, owner, 0o755)
            .await?;
        self.ensure_owned_directory(&cluster.socket_dir, owner, 0o755)
            .await?;
        self.ensure_owned_directory(&cluster.log_dir, owner, 0o755)
            .await
    }

    /// Renames a verified staging directory into its final location.
    pub async fn promote(&self, staging: &Path, dst: &Path) -> Result<()> {
        if try_exists(dst)? {
            return Err(Error::DestinationExists(dst.to_path_buf()));
        }
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(Error::io(parent))?;
        }
        tokio::fs::rename(staging, dst)
            .await
            .map_err(Error::io(staging))?;
        tracing::info!("promoted `{}` to `{}`", staging.display(), dst.display());

        Ok(())
    }

    /// Deletes `victim`, provided deletion is authorized and `verified` still carries a valid
    /// version marker on disk. Returns whether anything was deleted.
    pub async fn purge(
        &self,
        victim: &Path,
        verified: &DataDirectory,
        authorized: bool,
    ) -> Result<bool> {
        if !authorized {
            tracing::info!("keeping `{}`: purge not allowed", victim.display());
            return Ok(false);
        }
        if victim == verified.path {
            return Err(Error::validation(victim, "cannot purge the verified copy itself"));
        }
        match probe::read_marker(&verified.path)? {
            Some(version) if Some(version) == verified.version => (),
            _ => {
                tracing::warn!(
                    "keeping `{}`: `{}` does not hold a valid copy",
                    victim.display(),
                    verified.path.display()
                );
                return Ok(false);
            }
        }
        if !try_exists(victim)? {
            return Ok(false);
        }

        tokio::fs::remove_dir_all(victim)
            .await
            .map_err(Error::io(victim))?;
        tracing::info!("removed `{}`", victim.display());

        Ok(true)
    }
}

pub(crate) fn try_exists(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io(path)(e)),
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let privileged = nix::unistd::geteuid().is_root();
    // directory metadata is applied last, so that read-only directories can still be filled
    let mut dirs = Vec::new();

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            Error::Resource {
                path,
                source: e.into(),
            }
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let target = dst.join(rel);
        let meta = entry.metadata().map_err(|e| Error::Resource {
            path: entry.path().to_path_buf(),
            source: e.into(),
        })?;
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir(&target).map_err(Error::io(&target))?;
            dirs.push((target, meta));
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).map_err(Error::io(entry.path()))?;
            std::os::unix::fs::symlink(&link, &target).map_err(Error::io(&target))?;
            if privileged {
                std::os::unix::fs::lchown(&target, Some(meta.uid()), Some(meta.gid()))
                    .map_err(Error::io(&target))?;
            }
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target).map_err(Error::io(&target))?;
            let times = FileTimes::new()
                .set_accessed(meta.accessed().map_err(Error::io(entry.path()))?)
                .set_modified(meta.modified().map_err(Error::io(entry.path()))?);
            fs::File::open(&target)
                .and_then(|f| f.set_times(times))
                .map_err(Error::io(&target))?;
            if privileged {
                std::os::unix::fs::chown(&target, Some(meta.uid()), Some(meta.gid()))
                    .map_err(Error::io(&target))?;
            }
        } else {
            tracing::warn!("skipping special file `{}`", entry.path().display());
        }
    }

    for (dir, meta) in dirs.into_iter().rev() {
        if privileged {
            std::os::unix::fs::chown(&dir, Some(meta.uid()), Some(meta.gid()))
                .map_err(Error::io(&dir))?;
        }
        fs::set_permissions(&dir, meta.permissions()).map_err(Error::io(&dir))?;
    }

    Ok(())
}
