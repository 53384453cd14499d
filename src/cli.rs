use crate::config::{Config, DEFAULT_DB_FILE};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "dports2pkg",
    version,
    about = "Build binary packages from a BSD dports tree in parallel chroot workers"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build the listed ports and their dependency closure.
    Build(BuildArgs),
    /// Show the latest successful build recorded for a port.
    Latest(LatestArgs),
}

#[derive(Debug, Args)]
pub struct BuildArgs {
    /// Port specs: `category/name[@flavor]` or absolute dports paths.
    #[arg(required = true)]
    pub specs: Vec<String>,

    /// Base directory for worker slots, the Template, and the database.
    #[arg(long, default_value = "/build")]
    pub build_base: PathBuf,

    /// Host system root shared read-only into every chroot.
    #[arg(long, default_value = "/")]
    pub system_path: PathBuf,

    /// The dports tree.
    #[arg(long, default_value = "/usr/dports")]
    pub dports: PathBuf,

    /// Where built packages land (`All/` underneath).
    #[arg(long, default_value = "/usr/packages")]
    pub packages: PathBuf,

    /// Shared distfile cache.
    #[arg(long, default_value = "/usr/distfiles")]
    pub distfiles: PathBuf,

    /// Port options directory.
    #[arg(long, default_value = "/usr/local/etc/dports-options")]
    pub options: PathBuf,

    /// Optional ccache directory shared into the chroots.
    #[arg(long)]
    pub ccache: Option<PathBuf>,

    /// Report/log directory; defaults to `{build-base}/logs`.
    #[arg(long)]
    pub logs: Option<PathBuf>,

    /// Worker count; defaults to min(16, CPU count).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Run `check-plist` between stage and package.
    #[arg(long)]
    pub check_plist: bool,

    /// Build database path; defaults to `{build-base}/builds.db`.
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Isolation backend.
    #[arg(long, default_value = "bsd")]
    pub env_backend: String,

    /// Emit debug-level log records.
    #[arg(long)]
    pub verbose: bool,
}

impl BuildArgs {
    pub fn effective_workers(&self) -> usize {
        self.workers.unwrap_or_else(Config::default_workers).max(1)
    }

    pub fn effective_logs(&self) -> PathBuf {
        self.logs
            .clone()
            .unwrap_or_else(|| self.build_base.join("logs"))
    }

    pub fn effective_db(&self) -> PathBuf {
        self.db
            .clone()
            .unwrap_or_else(|| self.build_base.join(DEFAULT_DB_FILE))
    }

    pub fn to_config(&self) -> Config {
        Config {
            build_base: self.build_base.clone(),
            system_path: self.system_path.clone(),
            dports_path: self.dports.clone(),
            packages_path: self.packages.clone(),
            dist_files_path: self.distfiles.clone(),
            options_path: self.options.clone(),
            ccache_path: self.ccache.clone(),
            logs_path: self.effective_logs(),
            max_workers: self.effective_workers(),
            check_plist: self.check_plist,
            db_path: self.effective_db(),
            env_backend: self.env_backend.clone(),
        }
    }
}

#[derive(Debug, Args)]
pub struct LatestArgs {
    /// Port spec, `category/name[@flavor]`.
    pub spec: String,

    /// Restrict the lookup to one version; empty means most recent.
    #[arg(long)]
    pub version: Option<String>,

    #[arg(long, default_value = "/build")]
    pub build_base: PathBuf,

    #[arg(long, default_value = "/usr/dports")]
    pub dports: PathBuf,

    #[arg(long)]
    pub db: Option<PathBuf>,
}

impl LatestArgs {
    pub fn effective_db(&self) -> PathBuf {
        self.db
            .clone()
            .unwrap_or_else(|| self.build_base.join(DEFAULT_DB_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn build_command_uses_expected_defaults() {
        let cli = Cli::try_parse_from(["dports2pkg", "build", "print/indexinfo"])
            .expect("build defaults should parse");
        let Command::Build(args) = cli.command else {
            panic!("expected build command")
        };
        assert_eq!(args.specs, vec!["print/indexinfo".to_string()]);
        assert_eq!(args.build_base, PathBuf::from("/build"));
        assert_eq!(args.dports, PathBuf::from("/usr/dports"));
        assert_eq!(args.env_backend, "bsd");
        assert!(!args.check_plist);
        assert!(args.effective_workers() >= 1);
        assert!(args.effective_workers() <= 16);
        assert_eq!(args.effective_logs(), PathBuf::from("/build/logs"));
        assert_eq!(args.effective_db(), PathBuf::from("/build/builds.db"));

        let cfg = args.to_config();
        assert_eq!(cfg.slot_path(0), PathBuf::from("/build/SL00"));
        assert_eq!(cfg.packages_all(), PathBuf::from("/usr/packages/All"));
    }

    #[test]
    fn build_command_accepts_overrides() {
        let cli = Cli::try_parse_from([
            "dports2pkg",
            "build",
            "misc/help2man",
            "lang/python@py39",
            "--build-base",
            "/scratch/build",
            "--dports",
            "/scratch/dports",
            "--workers",
            "4",
            "--check-plist",
            "--ccache",
            "/scratch/ccache",
            "--env-backend",
            "mock",
        ])
        .expect("overrides should parse");
        let Command::Build(args) = cli.command else {
            panic!("expected build command")
        };
        assert_eq!(args.specs.len(), 2);
        assert_eq!(args.effective_workers(), 4);
        let cfg = args.to_config();
        assert_eq!(cfg.build_base, PathBuf::from("/scratch/build"));
        assert_eq!(cfg.ccache_path, Some(PathBuf::from("/scratch/ccache")));
        assert!(cfg.check_plist);
        assert_eq!(cfg.env_backend, "mock");
        assert_eq!(cfg.db_path, PathBuf::from("/scratch/build/builds.db"));
    }

    #[test]
    fn build_command_requires_at_least_one_spec() {
        assert!(Cli::try_parse_from(["dports2pkg", "build"]).is_err());
    }

    #[test]
    fn latest_command_parses() {
        let cli = Cli::try_parse_from([
            "dports2pkg",
            "latest",
            "print/indexinfo",
            "--version",
            "0.3.1",
        ])
        .expect("latest should parse");
        let Command::Latest(args) = cli.command else {
            panic!("expected latest command")
        };
        assert_eq!(args.spec, "print/indexinfo");
        assert_eq!(args.version.as_deref(), Some("0.3.1"));
        assert_eq!(args.effective_db(), PathBuf::from("/build/builds.db"));
    }
}
