use std::path::PathBuf;
use std::thread;

pub const TEMPLATE_DIR: &str = "Template";
pub const DEFAULT_DB_FILE: &str = "builds.db";
pub const PKG_PORT_ORIGIN: &str = "ports-mgmt/pkg";

/// Configuration record consumed by the core. The loader (CLI flags or an
/// external file) fills this in; the core only reads it.
#[derive(Debug, Clone)]
pub struct Config {
    pub build_base: PathBuf,
    pub system_path: PathBuf,
    pub dports_path: PathBuf,
    pub packages_path: PathBuf,
    pub dist_files_path: PathBuf,
    pub options_path: PathBuf,
    pub ccache_path: Option<PathBuf>,
    pub logs_path: PathBuf,
    pub max_workers: usize,
    pub check_plist: bool,
    pub db_path: PathBuf,
    pub env_backend: String,
}

impl Config {
    pub fn default_workers() -> usize {
        let cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cpus.min(16)
    }

    /// Per-worker chroot base, `{build_base}/SL{id:02}`.
    pub fn slot_path(&self, worker_id: u32) -> PathBuf {
        self.build_base.join(format!("SL{worker_id:02}"))
    }

    pub fn template_path(&self) -> PathBuf {
        self.build_base.join(TEMPLATE_DIR)
    }

    pub fn packages_all(&self) -> PathBuf {
        self.packages_path.join("All")
    }

    pub fn port_path(&self, origin: &str) -> PathBuf {
        self.dports_path.join(origin)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_config(base: &std::path::Path) -> Config {
        Config {
            build_base: base.join("build"),
            system_path: PathBuf::from("/"),
            dports_path: base.join("dports"),
            packages_path: base.join("packages"),
            dist_files_path: base.join("distfiles"),
            options_path: base.join("options"),
            ccache_path: None,
            logs_path: base.join("logs"),
            max_workers: 2,
            check_plist: false,
            db_path: base.join("build").join(DEFAULT_DB_FILE),
            env_backend: "mock".to_string(),
        }
    }

    #[test]
    fn slot_paths_follow_naming_convention() {
        let cfg = test_config(std::path::Path::new("/tmp/x"));
        assert!(cfg.slot_path(0).ends_with("SL00"));
        assert!(cfg.slot_path(99).ends_with("SL99"));
        assert!(cfg.template_path().ends_with("Template"));
        assert!(cfg.packages_all().ends_with("packages/All"));
    }

    #[test]
    fn default_workers_is_bounded() {
        let workers = Config::default_workers();
        assert!(workers >= 1);
        assert!(workers <= 16);
    }
}
