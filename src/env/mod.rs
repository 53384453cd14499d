pub mod bsd;
pub mod exec;
pub mod helper;
pub mod mock;
pub mod sys;
pub mod template;

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::Error;
use crate::logger::Logger;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// A command to run inside a worker's chroot.
#[derive(Debug, Clone, Default)]
pub struct ExecSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Absolute path inside the chroot; defaults to `/`.
    pub workdir: Option<String>,
    pub timeout: Option<Duration>,
}

impl ExecSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Single-line rendering for logs and error messages.
    pub fn rendered(&self) -> String {
        let mut out = self.command.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub elapsed: Duration,
}

/// One isolated build root, owned by exactly one worker.
pub trait Environment: Send {
    fn worker_id(&self) -> u32;
    fn base_path(&self) -> PathBuf;
    /// Not idempotent across failures; a failed setup is followed by
    /// `cleanup`, never by a second `setup`.
    fn setup(&mut self, logger: &dyn Logger) -> Result<(), Error>;
    fn execute(
        &self,
        cancel: &CancelToken,
        spec: &ExecSpec,
        logger: &dyn Logger,
    ) -> Result<ExecResult, Error>;
    /// Idempotent; succeeds even if `setup` failed or was never called.
    fn cleanup(&self, logger: &dyn Logger) -> Result<(), Error>;
}

pub type EnvFactory = Arc<dyn Fn(u32, &Config) -> Box<dyn Environment> + Send + Sync>;

fn registry() -> &'static Mutex<HashMap<String, EnvFactory>> {
    static BACKENDS: OnceLock<Mutex<HashMap<String, EnvFactory>>> = OnceLock::new();
    BACKENDS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Install a backend factory; tests use this to substitute scripted mocks.
pub fn register_backend(name: &str, factory: EnvFactory) {
    if let Ok(mut backends) = registry().lock() {
        backends.insert(name.to_string(), factory);
    }
}

pub fn create(name: &str, worker_id: u32, cfg: &Config) -> Result<Box<dyn Environment>, Error> {
    if let Ok(backends) = registry().lock()
        && let Some(factory) = backends.get(name)
    {
        return Ok(factory(worker_id, cfg));
    }
    match name {
        "bsd" => Ok(Box::new(bsd::BsdEnvironment::new(worker_id, cfg))),
        "mock" => Ok(Box::new(mock::MockEnvironment::permissive(worker_id, cfg))),
        _ => Err(Error::Validation(format!("unknown environment backend '{name}'"))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    Nullfs,
    Tmpfs,
    Devfs,
    Procfs,
    /// Directory creation only, nothing mounted.
    DirOnly,
}

impl FsType {
    pub fn as_str(self) -> &'static str {
        match self {
            FsType::Nullfs => "nullfs",
            FsType::Tmpfs => "tmpfs",
            FsType::Devfs => "devfs",
            FsType::Procfs => "procfs",
            FsType::DirOnly => "dir",
        }
    }
}

/// Where a mount's source comes from. `System` expands the `$/` prefix
/// against `system_path`; `Dummy` is a tmpfs; the config variants name the
/// host trees shared into every chroot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountSource {
    Dummy,
    System(&'static str),
    DPorts,
    Options,
    Packages,
    DistFiles,
    CCache,
    Kernel,
    None,
}

impl MountSource {
    pub fn resolve(self, cfg: &Config) -> Option<PathBuf> {
        match self {
            MountSource::Dummy | MountSource::Kernel | MountSource::None => None,
            MountSource::System(rel) => Some(cfg.system_path.join(rel)),
            MountSource::DPorts => Some(cfg.dports_path.clone()),
            MountSource::Options => Some(cfg.options_path.clone()),
            MountSource::Packages => Some(cfg.packages_path.clone()),
            MountSource::DistFiles => Some(cfg.dist_files_path.clone()),
            MountSource::CCache => cfg.ccache_path.clone(),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MountSource::Dummy => "dummy",
            MountSource::System(rel) => rel,
            MountSource::DPorts => "dports",
            MountSource::Options => "options",
            MountSource::Packages => "packages",
            MountSource::DistFiles => "distfiles",
            MountSource::CCache => "ccache",
            MountSource::Kernel => "kernel",
            MountSource::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MountSpec {
    /// Target path relative to the worker base.
    pub target: &'static str,
    pub fstype: FsType,
    pub source: MountSource,
    pub read_only: bool,
    pub size: Option<&'static str>,
    pub optional: bool,
}

const fn req(
    target: &'static str,
    fstype: FsType,
    source: MountSource,
    read_only: bool,
) -> MountSpec {
    MountSpec {
        target,
        fstype,
        source,
        read_only,
        size: None,
        optional: false,
    }
}

/// The canonical chroot composition, in mount order. Cleanup walks it in
/// reverse.
pub const MOUNT_TABLE: &[MountSpec] = &[
    req("bin", FsType::Nullfs, MountSource::System("bin"), true),
    req("sbin", FsType::Nullfs, MountSource::System("sbin"), true),
    req("lib", FsType::Nullfs, MountSource::System("lib"), true),
    req("libexec", FsType::Nullfs, MountSource::System("libexec"), true),
    req("boot", FsType::Tmpfs, MountSource::Dummy, false),
    req("boot/modules.local", FsType::Tmpfs, MountSource::Dummy, false),
    req("usr/bin", FsType::Nullfs, MountSource::System("usr/bin"), true),
    req("usr/sbin", FsType::Nullfs, MountSource::System("usr/sbin"), true),
    req("usr/lib", FsType::Nullfs, MountSource::System("usr/lib"), true),
    req(
        "usr/libdata",
        FsType::Nullfs,
        MountSource::System("usr/libdata"),
        true,
    ),
    req(
        "usr/libexec",
        FsType::Nullfs,
        MountSource::System("usr/libexec"),
        true,
    ),
    req(
        "usr/include",
        FsType::Nullfs,
        MountSource::System("usr/include"),
        true,
    ),
    req(
        "usr/share",
        FsType::Nullfs,
        MountSource::System("usr/share"),
        true,
    ),
    req(
        "usr/games",
        FsType::Nullfs,
        MountSource::System("usr/games"),
        true,
    ),
    MountSpec {
        target: "usr/src",
        fstype: FsType::Nullfs,
        source: MountSource::System("usr/src"),
        read_only: true,
        size: None,
        optional: true,
    },
    MountSpec {
        target: "usr/local",
        fstype: FsType::Tmpfs,
        source: MountSource::Dummy,
        read_only: false,
        size: Some("16g"),
        optional: false,
    },
    req("usr/packages", FsType::DirOnly, MountSource::None, false),
    req("xports", FsType::Nullfs, MountSource::DPorts, true),
    req("options", FsType::Nullfs, MountSource::Options, false),
    req("packages", FsType::Nullfs, MountSource::Packages, false),
    req("distfiles", FsType::Nullfs, MountSource::DistFiles, false),
    MountSpec {
        target: "construction",
        fstype: FsType::Tmpfs,
        source: MountSource::Dummy,
        read_only: false,
        size: Some("64g"),
        optional: false,
    },
    MountSpec {
        target: "ccache",
        fstype: FsType::Nullfs,
        source: MountSource::CCache,
        read_only: false,
        size: None,
        optional: true,
    },
    req("tmp", FsType::Tmpfs, MountSource::Dummy, false),
    req("dev", FsType::Devfs, MountSource::Kernel, false),
    MountSpec {
        target: "proc",
        fstype: FsType::Procfs,
        source: MountSource::Kernel,
        read_only: true,
        size: None,
        optional: false,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_table_shape_is_canonical() {
        assert_eq!(MOUNT_TABLE[0].target, "bin");
        assert_eq!(MOUNT_TABLE.last().unwrap().target, "proc");
        let ro_system: Vec<&MountSpec> = MOUNT_TABLE
            .iter()
            .filter(|m| matches!(m.source, MountSource::System(_)))
            .collect();
        assert!(ro_system.iter().all(|m| m.read_only));
        let tmpfs_sized: Vec<&str> = MOUNT_TABLE
            .iter()
            .filter(|m| m.size.is_some())
            .map(|m| m.target)
            .collect();
        assert_eq!(tmpfs_sized, vec!["usr/local", "construction"]);
        assert!(
            MOUNT_TABLE
                .iter()
                .filter(|m| m.optional)
                .map(|m| m.target)
                .eq(["usr/src", "ccache"])
        );
    }

    #[test]
    fn mount_sources_resolve_against_the_config() {
        let cfg = crate::config::tests::test_config(std::path::Path::new("/tmp/x"));
        assert_eq!(
            MountSource::System("usr/bin").resolve(&cfg),
            Some(PathBuf::from("/usr/bin"))
        );
        assert_eq!(MountSource::DPorts.resolve(&cfg), Some(cfg.dports_path.clone()));
        assert_eq!(MountSource::Dummy.resolve(&cfg), None);
        assert_eq!(MountSource::CCache.resolve(&cfg), None);
    }

    #[test]
    fn exec_spec_renders_a_command_line() {
        let spec = ExecSpec::new("make")
            .arg("-C")
            .arg("/xports/print/indexinfo")
            .arg("build")
            .env_var("BATCH", "yes");
        assert_eq!(spec.rendered(), "make -C /xports/print/indexinfo build");
        assert_eq!(spec.env, vec![("BATCH".to_string(), "yes".to_string())]);
    }

    #[test]
    fn unknown_backend_is_a_validation_error() {
        let cfg = crate::config::tests::test_config(std::path::Path::new("/tmp/x"));
        assert!(matches!(
            create("no-such-backend", 0, &cfg),
            Err(Error::Validation(_))
        ));
    }
}
