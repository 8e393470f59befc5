//! OS-level capacity queries.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sysinfo::Disks;

use crate::{Error, Result};

/// Free and total bytes of the filesystem holding a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capacity {
    pub free_bytes: u64,
    pub total_bytes: u64,
}

impl Capacity {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }
}

#[async_trait]
pub trait CapacityProbe: Send + Sync {
    async fn capacity(&self, path: &Path) -> Result<Capacity>;
}

/// Capacity probe backed by `sysinfo`'s disk list.
///
/// The disk list is refreshed on every query so mounts that come and go
/// between polls are picked up.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskCapacityProbe;

#[async_trait]
impl CapacityProbe for DiskCapacityProbe {
    async fn capacity(&self, path: &Path) -> Result<Capacity> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let resolved = std::fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
            let disks = Disks::new_with_refreshed_list();
            let mounts = disks.list().iter().map(|disk| {
                (
                    disk.mount_point().to_path_buf(),
                    Capacity {
                        free_bytes: disk.available_space(),
                        total_bytes: disk.total_space(),
                    },
                )
            });
            best_mount(&resolved, mounts)
                .ok_or_else(|| Error::not_found("Disk", path.display().to_string()))
        })
        .await
        .map_err(|e| Error::Other(format!("capacity query panicked: {e}")))?
    }
}

/// Pick the mount with the longest mount point that contains `path`.
fn best_mount(
    path: &Path,
    mounts: impl IntoIterator<Item = (PathBuf, Capacity)>,
) -> Option<Capacity> {
    let mut best: Option<(usize, Capacity)> = None;
    for (mount_point, capacity) in mounts {
        if !path.starts_with(&mount_point) {
            continue;
        }
        let depth = mount_point.components().count();
        if best.is_none_or(|(len, _)| depth > len) {
            best = Some((depth, capacity));
        }
    }
    best.map(|(_, capacity)| capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(free: u64) -> Capacity {
        Capacity {
            free_bytes: free,
            total_bytes: 100,
        }
    }

    #[test]
    fn test_best_mount_prefers_most_specific() {
        let mounts = vec![
            (PathBuf::from("/"), cap(1)),
            (PathBuf::from("/srv"), cap(2)),
            (PathBuf::from("/srv/rec"), cap(3)),
        ];
        assert_eq!(
            best_mount(Path::new("/srv/rec/gate"), mounts.clone()),
            Some(cap(3))
        );
        assert_eq!(best_mount(Path::new("/srv/other"), mounts.clone()), Some(cap(2)));
        // Component-wise match: /srv/recordings is not under /srv/rec.
        assert_eq!(
            best_mount(Path::new("/srv/recordings"), mounts),
            Some(cap(2))
        );
    }

    #[test]
    fn test_best_mount_none() {
        let mounts = vec![(PathBuf::from("/mnt/a"), cap(1))];
        assert_eq!(best_mount(Path::new("/srv"), mounts), None);
    }

    #[test]
    fn test_used_bytes() {
        assert_eq!(cap(30).used_bytes(), 70);
    }
}
