//! Operator-requested relocation of an old recording directory.
//!
//! `mv.flag` in a volume root holds the path of a previous recording
//! directory whose contents move into the root. `rm.flag` holds one to
//! delete. A flag is removed once handled, and also when its path is
//! missing or overlaps the volume root.

use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::domain::Volume;
use crate::utils::fs;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relocation {
    Move(PathBuf),
    Remove(PathBuf),
}

impl Relocation {
    pub fn path(&self) -> &Path {
        match self {
            Self::Move(path) | Self::Remove(path) => path,
        }
    }

    fn flag(&self, volume: &Volume) -> PathBuf {
        match self {
            Self::Move(_) => volume.move_flag(),
            Self::Remove(_) => volume.remove_flag(),
        }
    }
}

/// Relocations requested for `volume`, moves first.
///
/// Flags naming an unusable directory are deleted here.
pub async fn pending(volume: &Volume) -> Vec<Relocation> {
    let mut tasks = Vec::new();
    let flags: [(PathBuf, fn(PathBuf) -> Relocation); 2] = [
        (volume.move_flag(), Relocation::Move),
        (volume.remove_flag(), Relocation::Remove),
    ];
    for (flag, make) in flags {
        let content = match tokio::fs::read_to_string(&flag).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                let e = fs::io_error("reading", &flag, e);
                warn!(volume = %volume.id, error = %e, "Cannot read relocation flag");
                continue;
            }
        };

        let path = PathBuf::from(content.trim());
        match check_target(volume, &path).await {
            Ok(()) => tasks.push(make(path)),
            Err(e) => {
                warn!(
                    volume = %volume.id,
                    flag = %flag.display(),
                    error = %e,
                    "Ignoring relocation flag"
                );
                discard_flag(volume, &flag).await;
            }
        }
    }
    tasks
}

async fn check_target(volume: &Volume, path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() || !path.is_absolute() {
        return Err(Error::validation(format!(
            "'{}' is not an absolute path",
            path.display()
        )));
    }
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(Error::validation(format!(
                "'{}' is not a directory",
                path.display()
            )));
        }
        Err(e) => return Err(fs::io_error("inspecting", path, e)),
    }

    let path = tokio::fs::canonicalize(path)
        .await
        .map_err(|e| fs::io_error("resolving", path, e))?;
    let root = tokio::fs::canonicalize(&volume.root)
        .await
        .unwrap_or_else(|_| volume.root.clone());
    if path.starts_with(&root) || root.starts_with(&path) {
        return Err(Error::validation(format!(
            "'{}' overlaps the volume root {}",
            path.display(),
            root.display()
        )));
    }
    Ok(())
}

/// Carry out one relocation, then delete its flag.
///
/// The flag is deleted even when the relocation fails part way.
pub async fn execute(volume: &Volume, relocation: &Relocation) -> Result<()> {
    let result = match relocation {
        Relocation::Move(from) => {
            warn!(
                volume = %volume.id,
                from = %from.display(),
                to = %volume.root.display(),
                "Moving recording directory"
            );
            let (from, to) = (from.clone(), volume.root.clone());
            tokio::task::spawn_blocking(move || fs::merge_dir_sync(&from, &to))
                .await
                .map_err(|e| Error::Other(format!("directory move task failed: {e}")))
                .and_then(|result| result)
                .map(|(moved, skipped)| {
                    if skipped > 0 {
                        warn!(
                            volume = %volume.id,
                            moved,
                            skipped,
                            "Files left behind because their destination exists"
                        );
                    } else {
                        info!(volume = %volume.id, moved, "Recording directory moved");
                    }
                })
        }
        Relocation::Remove(dir) => {
            warn!(volume = %volume.id, dir = %dir.display(), "Deleting recording directory");
            fs::remove_dir_all_if_exists(dir).await.map(|_| ())
        }
    };

    if let Err(e) = &result {
        error!(
            volume = %volume.id,
            path = %relocation.path().display(),
            error = %e,
            "Relocation failed"
        );
    }
    discard_flag(volume, &relocation.flag(volume)).await;
    result
}

async fn discard_flag(volume: &Volume, flag: &Path) {
    if let Err(e) = fs::remove_file_if_exists(flag).await {
        warn!(volume = %volume.id, error = %e, "Cannot remove relocation flag");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RetentionPolicy;

    fn volume(root: PathBuf) -> Volume {
        Volume {
            id: "primary".into(),
            root,
            device: None,
            array: None,
            reserved_headroom_bytes: 0,
            standby: None,
            retention: RetentionPolicy::default(),
        }
    }

    #[tokio::test]
    async fn test_unusable_targets_discard_their_flag() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("rec");
        std::fs::create_dir_all(root.join("gate")).unwrap();
        let volume = volume(root.clone());

        let missing = dir.path().join("missing");
        std::fs::write(volume.move_flag(), missing.display().to_string()).unwrap();
        std::fs::write(volume.remove_flag(), root.join("gate").display().to_string()).unwrap();

        assert!(pending(&volume).await.is_empty());
        assert!(!volume.move_flag().exists());
        assert!(!volume.remove_flag().exists());
        assert!(root.join("gate").exists());
    }

    #[tokio::test]
    async fn test_parent_of_root_is_never_removed() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("rec");
        std::fs::create_dir_all(&root).unwrap();
        let volume = volume(root.clone());

        std::fs::write(volume.remove_flag(), format!("  {}\n", dir.path().display())).unwrap();
        assert!(pending(&volume).await.is_empty());
        assert!(root.exists());
    }

    #[tokio::test]
    async fn test_pending_lists_moves_first() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("rec");
        let old = dir.path().join("old");
        let older = dir.path().join("older");
        for d in [&root, &old, &older] {
            std::fs::create_dir_all(d).unwrap();
        }
        let volume = volume(root);

        std::fs::write(volume.remove_flag(), format!("{}\n", older.display())).unwrap();
        std::fs::write(volume.move_flag(), old.display().to_string()).unwrap();

        assert_eq!(
            pending(&volume).await,
            vec![Relocation::Move(old), Relocation::Remove(older)]
        );
        assert!(volume.move_flag().exists());
    }
}
