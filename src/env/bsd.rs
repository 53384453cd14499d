//! The BSD chroot backend: a worker slot under `{build_base}/SL{id:02}`
//! composed from the canonical mount table, with supervised execution and
//! an idempotent teardown ladder.

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::env::exec::{run_supervised, PidTracker};
use crate::env::{
    sys, template, Environment, ExecResult, ExecSpec, FsType, MountSpec, MOUNT_TABLE,
};
use crate::error::{CleanupError, Error, MountError, SetupError};
use crate::logger::Logger;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

const UNMOUNT_RETRIES: usize = 10;
const UNMOUNT_RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct BsdEnvironment {
    worker_id: u32,
    cfg: Config,
    base: PathBuf,
    tracker: PidTracker,
    /// Successfully mounted targets, in mount order.
    mounted: Mutex<Vec<PathBuf>>,
}

impl BsdEnvironment {
    pub fn new(worker_id: u32, cfg: &Config) -> Self {
        Self {
            worker_id,
            cfg: cfg.clone(),
            base: cfg.slot_path(worker_id),
            tracker: PidTracker::new(),
            mounted: Mutex::new(Vec::new()),
        }
    }

    fn mount_one(&self, spec: &MountSpec) -> Result<bool, MountError> {
        let target = self.base.join(spec.target);
        let source = spec.source.resolve(&self.cfg);
        if spec.optional {
            match &source {
                Some(path) if path.is_dir() => {}
                _ => return Ok(false),
            }
        }
        let mount_err = |err: io::Error| MountError {
            path: target.clone(),
            fstype: spec.fstype.as_str(),
            source_spec: source
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| spec.source.label().to_string()),
            op: "mount",
            source: Box::new(err),
        };
        match spec.fstype {
            FsType::DirOnly => Ok(false),
            FsType::Nullfs => {
                let source = match source.clone() {
                    Some(s) => s,
                    None => {
                        return Err(mount_err(io::Error::new(
                            io::ErrorKind::NotFound,
                            "nullfs source unresolved",
                        )))
                    }
                };
                sys::mount_nullfs(&source, &target, spec.read_only).map_err(mount_err)?;
                Ok(true)
            }
            FsType::Tmpfs => {
                sys::mount_tmpfs(&target, spec.size).map_err(mount_err)?;
                Ok(true)
            }
            FsType::Devfs => {
                sys::mount_devfs(&target).map_err(mount_err)?;
                Ok(true)
            }
            FsType::Procfs => {
                sys::mount_procfs(&target).map_err(mount_err)?;
                Ok(true)
            }
        }
    }
}

impl Environment for BsdEnvironment {
    fn worker_id(&self) -> u32 {
        self.worker_id
    }

    fn base_path(&self) -> PathBuf {
        self.base.clone()
    }

    fn setup(&mut self, logger: &dyn Logger) -> Result<(), Error> {
        if !nix::unistd::Uid::effective().is_root() {
            return Err(Error::RequiresRoot);
        }
        fs::create_dir_all(&self.base)
            .map_err(|err| Error::io(format!("creating {}", self.base.display()), err))?;
        for spec in MOUNT_TABLE {
            let target = self.base.join(spec.target);
            fs::create_dir_all(&target)
                .map_err(|err| Error::io(format!("creating {}", target.display()), err))?;
        }

        template::copy_into(&self.cfg.template_path(), &self.base)?;

        let mut failures = Vec::new();
        for spec in MOUNT_TABLE {
            match self.mount_one(spec) {
                Ok(true) => {
                    if let Ok(mut mounted) = self.mounted.lock() {
                        mounted.push(self.base.join(spec.target));
                    }
                }
                Ok(false) => {
                    logger.debug(&format!(
                        "phase=setup status=skipped worker=SL{:02} target={}",
                        self.worker_id, spec.target
                    ));
                }
                Err(err) => {
                    logger.error(&format!(
                        "phase=setup status=mount-failed worker=SL{:02} target={} reason={}",
                        self.worker_id, spec.target, err
                    ));
                    failures.push(err);
                }
            }
        }
        if !failures.is_empty() {
            return Err(Error::Setup(SetupError {
                op: "mount",
                mounts: failures,
                source: None,
            }));
        }
        logger.info(&format!(
            "phase=setup status=ready worker=SL{:02} base={}",
            self.worker_id,
            self.base.display()
        ));
        Ok(())
    }

    fn execute(
        &self,
        cancel: &CancelToken,
        spec: &ExecSpec,
        logger: &dyn Logger,
    ) -> Result<ExecResult, Error> {
        run_supervised(&self.tracker, cancel, &self.base, spec, logger)
    }

    fn cleanup(&self, logger: &dyn Logger) -> Result<(), Error> {
        if self.base.as_os_str().is_empty() {
            return Ok(());
        }

        self.tracker.terminate_all(logger);

        let mounted: Vec<PathBuf> = self
            .mounted
            .lock()
            .map(|mut m| m.drain(..).collect())
            .unwrap_or_default();
        let mut busy = Vec::new();
        for target in mounted.iter().rev() {
            let mut attempts = 0;
            loop {
                match sys::unmount(target) {
                    Ok(()) => break,
                    Err(err) if err.raw_os_error() == Some(libc::EBUSY) => {
                        attempts += 1;
                        if attempts >= UNMOUNT_RETRIES {
                            logger.error(&format!(
                                "phase=cleanup status=still-busy target={}",
                                target.display()
                            ));
                            busy.push(target.clone());
                            break;
                        }
                        logger.warn(&format!(
                            "phase=cleanup status=busy attempt={attempts} target={}",
                            target.display()
                        ));
                        thread::sleep(UNMOUNT_RETRY_DELAY);
                    }
                    Err(err) => {
                        // Not mounted (or a host without these mounts);
                        // nothing left to undo for this target.
                        logger.debug(&format!(
                            "phase=cleanup status=unmount-skipped target={} reason={err}",
                            target.display()
                        ));
                        break;
                    }
                }
            }
        }
        if !busy.is_empty() {
            // Put the stuck ones back so a later cleanup can retry.
            if let Ok(mut mounted) = self.mounted.lock() {
                *mounted = busy.clone();
            }
            return Err(Error::Cleanup(CleanupError {
                op: "unmount",
                mounts: busy,
                source: None,
            }));
        }

        if self.base.exists()
            && let Err(err) = fs::remove_dir_all(&self.base)
        {
            logger.warn(&format!(
                "phase=cleanup status=leftover base={} reason={err}",
                self.base.display()
            ));
        }
        logger.info(&format!(
            "phase=cleanup status=done worker=SL{:02}",
            self.worker_id
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::MemoryLogger;

    #[test]
    fn cleanup_without_setup_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = crate::config::tests::test_config(dir.path());
        let env = BsdEnvironment::new(0, &cfg);
        let logger = MemoryLogger::new();
        env.cleanup(&logger).expect("idempotent cleanup");
        env.cleanup(&logger).expect("second cleanup");
        assert!(!env.base_path().exists());
    }

    #[test]
    fn cleanup_removes_a_partially_created_base() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = crate::config::tests::test_config(dir.path());
        let env = BsdEnvironment::new(3, &cfg);
        fs::create_dir_all(env.base_path().join("construction")).expect("seed base");
        let logger = MemoryLogger::new();
        env.cleanup(&logger).expect("cleanup");
        assert!(!env.base_path().exists());
    }

    #[test]
    fn setup_requires_root() {
        if nix::unistd::Uid::effective().is_root() {
            // Under a root test runner the uid guard cannot be observed.
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = crate::config::tests::test_config(dir.path());
        let mut env = BsdEnvironment::new(0, &cfg);
        let logger = MemoryLogger::new();
        assert!(matches!(env.setup(&logger), Err(Error::RequiresRoot)));
    }

    #[test]
    fn slot_base_follows_worker_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = crate::config::tests::test_config(dir.path());
        let env = BsdEnvironment::new(7, &cfg);
        assert!(env.base_path().ends_with("SL07"));
        assert_eq!(env.worker_id(), 7);
    }
}
