//! On-connect crash-recovery scratch area: one file per captured device
//! address under `ID_FILE_DIRECTORY`, removed on clean release. Survives
//! an ungraceful exit so a startup cleanup pass can find addresses that
//! were captured when the process died.

use std::path::{Path, PathBuf};

use pyde1_core::message::DeviceRole;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ScratchArea {
    directory: PathBuf,
    suffix: String,
}

impl ScratchArea {
    pub fn new(directory: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        ScratchArea {
            directory: directory.into(),
            suffix: suffix.into(),
        }
    }

    fn path_for(&self, role: DeviceRole) -> PathBuf {
        self.directory.join(format!("{role}.{}", self.suffix))
    }

    /// Records `address` as captured for `role`. Content is the address
    /// alone, matching the scratch area's documented format.
    pub fn mark_captured(&self, role: DeviceRole, address: &str) {
        if let Err(e) = std::fs::create_dir_all(&self.directory) {
            warn!(error = %e, dir = %self.directory.display(), "could not create scratch directory");
            return;
        }
        if let Err(e) = std::fs::write(self.path_for(role), address) {
            warn!(error = %e, role = %role, "could not write scratch file");
        }
    }

    /// Removes the scratch file on a clean release.
    pub fn clear(&self, role: DeviceRole) {
        let path = self.path_for(role);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, path = %path.display(), "could not remove scratch file"),
        }
    }

    /// Reads back an address left over from a prior process, if any.
    pub fn read(&self, role: DeviceRole) -> Option<String> {
        std::fs::read_to_string(self.path_for(role)).ok()
    }

    /// Startup cleanup: every scratch file present indicates a session the
    /// OS may still believe is live. `on_stale` is invoked once per
    /// leftover (role, address) pair so the caller can force-drop it
    /// before devices are recaptured.
    pub fn cleanup_stale(&self, roles: &[DeviceRole], mut on_stale: impl FnMut(DeviceRole, String)) {
        for &role in roles {
            let path = self.path_for(role);
            if !path.exists() {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(address) => {
                    debug!(role = %role, address, "found stale scratch file, forcing cleanup");
                    on_stale(role, address);
                    self.clear(role);
                }
                Err(e) => warn!(error = %e, path = %path.display(), "could not read stale scratch file"),
            }
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mark_then_read_round_trips_address() {
        let dir = tempdir();
        let area = ScratchArea::new(dir.clone(), "btid");
        area.mark_captured(DeviceRole::Scale, "AA:BB:CC:DD:EE:FF");
        assert_eq!(area.read(DeviceRole::Scale), Some("AA:BB:CC:DD:EE:FF".to_string()));
        area.clear(DeviceRole::Scale);
        assert_eq!(area.read(DeviceRole::Scale), None);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn cleanup_stale_invokes_callback_once_per_leftover_file() {
        let dir = tempdir();
        let area = ScratchArea::new(dir.clone(), "btid");
        area.mark_captured(DeviceRole::De1, "11:22:33:44:55:66");
        let mut seen = Vec::new();
        area.cleanup_stale(&[DeviceRole::De1, DeviceRole::Scale], |role, addr| {
            seen.push((role, addr));
        });
        assert_eq!(seen, vec![(DeviceRole::De1, "11:22:33:44:55:66".to_string())]);
        assert_eq!(area.read(DeviceRole::De1), None);
        std::fs::remove_dir_all(dir).ok();
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("pyde1-scratch-test-{}", std::process::id()));
        dir.push(uuid::Uuid::new_v4().to_string());
        dir
    }
}
