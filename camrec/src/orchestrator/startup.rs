//! Volume preparation before any recording starts.

use std::collections::HashSet;
use std::path::Path;

use tracing::{info, warn};

use crate::domain::Volume;
use crate::utils::fs;
use crate::{Error, Result};

/// Volumes after the startup write probe.
#[derive(Debug, Clone, Default)]
pub struct PreparedVolumes {
    /// Every configured volume, writable roots canonicalized.
    pub volumes: Vec<Volume>,
    /// Volumes that failed the probe. Each of them has a standby.
    pub unwritable: HashSet<String>,
}

/// Create and probe every volume root.
///
/// A volume that cannot be written and has no standby is a configuration
/// error. One with a standby is reported in [`PreparedVolumes::unwritable`]
/// and its cameras start on the standby.
pub async fn prepare_volumes(volumes: Vec<Volume>) -> Result<PreparedVolumes> {
    let mut prepared = PreparedVolumes::default();

    for mut volume in volumes {
        match probe(&volume.root).await {
            Ok(()) => {
                if let Ok(root) = tokio::fs::canonicalize(&volume.root).await {
                    volume.root = root;
                }
                info!(volume = %volume.id, root = %volume.root.display(), "Volume is writable");
            }
            Err(e) => match &volume.standby {
                Some(standby) => {
                    warn!(
                        volume = %volume.id,
                        standby = %standby,
                        error = %e,
                        "Volume is not writable, its cameras start on the standby"
                    );
                    prepared.unwritable.insert(volume.id.clone());
                }
                None => {
                    return Err(Error::config(format!(
                        "volume '{}' is not writable and has no standby: {}",
                        volume.id, e
                    )));
                }
            },
        }
        prepared.volumes.push(volume);
    }

    Ok(prepared)
}

/// Blocking write probe, off the runtime threads.
pub(crate) async fn probe(root: &Path) -> Result<()> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || fs::probe_writable(&root))
        .await
        .map_err(|e| Error::Other(format!("write probe task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RetentionPolicy;
    use std::path::PathBuf;

    fn volume(id: &str, root: PathBuf, standby: Option<&str>) -> Volume {
        Volume {
            id: id.into(),
            root,
            device: None,
            array: None,
            reserved_headroom_bytes: 0,
            standby: standby.map(str::to_string),
            retention: RetentionPolicy::default(),
        }
    }

    #[tokio::test]
    async fn test_prepare_creates_roots() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("rec");

        let prepared = prepare_volumes(vec![volume("primary", root.clone(), None)])
            .await
            .unwrap();
        assert!(root.is_dir());
        assert!(prepared.unwritable.is_empty());
        assert_eq!(prepared.volumes[0].root, root.canonicalize().unwrap());
    }

    #[tokio::test]
    async fn test_unwritable_volume() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file cannot become a volume root.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let bad_root = blocker.join("rec");

        let err = prepare_volumes(vec![volume("primary", bad_root.clone(), None)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let prepared = prepare_volumes(vec![
            volume("primary", bad_root, Some("spare")),
            volume("spare", dir.path().join("spare"), None),
        ])
        .await
        .unwrap();
        assert!(prepared.unwritable.contains("primary"));
        assert!(!prepared.unwritable.contains("spare"));
        assert_eq!(prepared.volumes.len(), 2);
    }
}
