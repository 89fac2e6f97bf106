//! Runtime directory selection and preparation.
//!
//! Runs before any supervisor starts: detect whether the root filesystem is
//! writable, pick the runtime directory accordingly, and make sure the
//! writable subdirectories recognized application families expect are in
//! place. Every operation here is best-effort; failures degrade to warnings
//! because a missing convenience directory must never keep the fleet down.

use crate::config::FleetConfig;
use fs::directory_manager::{DirectoryManager, DirectoryManagerFs};
use fs::file::deleter::FileDeleter;
use fs::file::writer::FileWriter;
use fs::LocalFile;
use nix::unistd::{chown, Group, Uid, User};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const APP_DIR_NAME: &str = "procwarden";
const PID_FILE_NAME: &str = "procwarden.pid";
const PROBE_FILE_NAME: &str = ".procwarden-probe";

const EROFS: i32 = 30;

/// The selected runtime directory plus what the probe learned about the
/// root filesystem.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeDirectory {
    pub path: PathBuf,
    pub read_only_root: bool,
}

/// Application families whose conventional runtime subdirectories and
/// ownership are prepared when they appear in the fleet.
const FAMILIES: &[(&str, &[&str], Option<&str>)] = &[
    ("php-fpm", &["php-fpm"], Some("www-data")),
    ("nginx", &["nginx", "nginx/body"], Some("www-data")),
    ("redis", &["redis"], Some("redis")),
];

pub struct RuntimeDirSetup<D = DirectoryManagerFs> {
    directory_manager: D,
    var_run: PathBuf,
    run: PathBuf,
    root: PathBuf,
    privileged: bool,
}

impl Default for RuntimeDirSetup {
    fn default() -> Self {
        Self {
            directory_manager: DirectoryManagerFs,
            var_run: PathBuf::from("/var/run"),
            run: PathBuf::from("/run"),
            root: PathBuf::from("/"),
            privileged: Uid::effective().is_root(),
        }
    }
}

impl<D: DirectoryManager> RuntimeDirSetup<D> {
    /// Test constructor with every path injectable.
    pub fn with_paths(
        directory_manager: D,
        var_run: PathBuf,
        run: PathBuf,
        root: PathBuf,
        privileged: bool,
    ) -> Self {
        Self {
            directory_manager,
            var_run,
            run,
            root,
            privileged,
        }
    }

    /// Detects a read-only root by writing and deleting a probe file: always
    /// in the temp location, and on the root itself when privileged. The
    /// override short-circuits both probes.
    pub fn detect_read_only_root(&self, read_only_override: Option<bool>) -> bool {
        if let Some(read_only) = read_only_override {
            debug!(read_only, "read-only root set by override");
            return read_only;
        }

        let temp_probe = std::env::temp_dir().join(PROBE_FILE_NAME);
        if let Err(err) = probe_write(&temp_probe) {
            warn!(%err, "temp location is not writable");
        }

        if !self.privileged {
            return false;
        }

        let root_probe = self.root.join(PROBE_FILE_NAME);
        match probe_write(&root_probe) {
            Ok(()) => false,
            Err(err) => {
                let read_only = err
                    .raw_os_error()
                    .map(|errno| errno == EROFS)
                    .unwrap_or(false);
                debug!(%err, read_only, "root probe failed");
                read_only
            }
        }
    }

    /// Picks and creates the runtime directory, then prepares the
    /// subdirectories of every recognized application family found in the
    /// fleet.
    pub fn prepare(&self, config: &FleetConfig, read_only_override: Option<bool>) -> RuntimeDirectory {
        let read_only_root = self.detect_read_only_root(read_only_override);

        let base = if read_only_root {
            self.run.join(APP_DIR_NAME)
        } else {
            self.var_run.join(APP_DIR_NAME)
        };

        let path = match self.directory_manager.create_with_mode(&base, 0o755) {
            Ok(()) => base,
            Err(err) => {
                let fallback = std::env::temp_dir().join(APP_DIR_NAME);
                warn!(%err, path = %base.display(), fallback = %fallback.display(),
                    "could not create the runtime directory; falling back");
                if let Err(err) = self.directory_manager.create_with_mode(&fallback, 0o755) {
                    warn!(%err, "could not create the fallback runtime directory either");
                }
                fallback
            }
        };

        for (family, subdirs, owner) in FAMILIES {
            if !fleet_uses_family(config, family) {
                continue;
            }
            info!(family, "preparing runtime subdirectories");
            for subdir in *subdirs {
                let dir = path.join(subdir);
                if let Err(err) = self.directory_manager.create_with_mode(&dir, 0o755) {
                    warn!(%err, path = %dir.display(), "could not create family subdirectory");
                    continue;
                }
                if self.privileged {
                    if let Some(owner) = owner {
                        apply_ownership(&dir, owner);
                    }
                }
            }
        }

        RuntimeDirectory {
            path,
            read_only_root,
        }
    }
}

/// Records the supervisor pid in the runtime directory. Best-effort.
pub fn write_pid_file(runtime_dir: &Path) -> Option<PathBuf> {
    let path = runtime_dir.join(PID_FILE_NAME);
    match LocalFile.write_with_mode(&path, std::process::id().to_string(), 0o644) {
        Ok(()) => Some(path),
        Err(err) => {
            warn!(%err, path = %path.display(), "could not write the pid file");
            None
        }
    }
}

fn probe_write(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, b"probe")?;
    LocalFile.delete(path)
}

fn fleet_uses_family(config: &FleetConfig, family: &str) -> bool {
    config.enabled_processes().any(|(_, process)| {
        process
            .command
            .first()
            .map(|bin| bin.contains(family))
            .unwrap_or(false)
    })
}

/// Conventional ownership for a family directory; only attempted when
/// running as root, and failure is only a warning.
fn apply_ownership(dir: &Path, owner: &str) {
    let user = match User::from_name(owner) {
        Ok(Some(user)) => user,
        Ok(None) => {
            debug!(owner, "owner user does not exist; leaving root ownership");
            return;
        }
        Err(err) => {
            warn!(%err, owner, "could not look up the owner user");
            return;
        }
    };
    let group = Group::from_name(owner).ok().flatten().map(|group| group.gid);

    if let Err(err) = chown(dir, Some(user.uid), group) {
        warn!(%err, path = %dir.display(), owner, "could not apply ownership");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigLoader;

    fn config(command: &str) -> FleetConfig {
        ConfigLoader::new(true)
            .load_from_str(&format!(
                "version: '1'\nprocesses:\n  app:\n    command: [\"{command}\"]\n"
            ))
            .unwrap()
    }

    fn setup(base: &Path, privileged: bool) -> RuntimeDirSetup {
        RuntimeDirSetup::with_paths(
            DirectoryManagerFs,
            base.join("var/run"),
            base.join("run"),
            base.join("rootfs"),
            privileged,
        )
    }

    #[test]
    fn writable_root_selects_var_run() {
        let base = tempfile::tempdir().unwrap();
        let runtime = setup(base.path(), false).prepare(&config("/bin/app"), Some(false));

        assert!(!runtime.read_only_root);
        assert_eq!(runtime.path, base.path().join("var/run/procwarden"));
        assert!(runtime.path.is_dir());
    }

    #[test]
    fn read_only_root_selects_run() {
        let base = tempfile::tempdir().unwrap();
        let runtime = setup(base.path(), false).prepare(&config("/bin/app"), Some(true));

        assert!(runtime.read_only_root);
        assert_eq!(runtime.path, base.path().join("run/procwarden"));
    }

    #[test]
    fn override_short_circuits_the_probe() {
        let base = tempfile::tempdir().unwrap();
        let probe = setup(base.path(), false);
        assert!(probe.detect_read_only_root(Some(true)));
        assert!(!probe.detect_read_only_root(Some(false)));
    }

    #[test]
    fn unprivileged_probe_reports_writable() {
        let base = tempfile::tempdir().unwrap();
        assert!(!setup(base.path(), false).detect_read_only_root(None));
    }

    #[test]
    fn family_subdirectories_are_prepared() {
        let base = tempfile::tempdir().unwrap();
        let runtime = setup(base.path(), false).prepare(&config("/usr/sbin/php-fpm"), Some(false));

        assert!(runtime.path.join("php-fpm").is_dir());
        assert!(!runtime.path.join("nginx").exists());
    }

    #[test]
    fn pid_file_is_written() {
        let base = tempfile::tempdir().unwrap();
        let pid_path = write_pid_file(base.path()).unwrap();

        let content = std::fs::read_to_string(pid_path).unwrap();
        assert_eq!(content, std::process::id().to_string());
    }
}
