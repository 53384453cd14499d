use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::Error;
use crate::logger::Logger;
use crate::port::{DepSpecs, Port, PortFlags, PortId, PortRegistry, BuildStateRegistry};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

/// The ten variables queried per port, in output order.
pub const QUERY_VARS: [&str; 10] = [
    "PKGNAME",
    "PKGVERSION",
    "PKGFILE",
    "FETCH_DEPENDS",
    "EXTRACT_DEPENDS",
    "PATCH_DEPENDS",
    "BUILD_DEPENDS",
    "LIB_DEPENDS",
    "RUN_DEPENDS",
    "IGNORE",
];

/// One line per variable, exactly as `make -V` prints them.
#[derive(Debug, Clone, Default)]
pub struct RawPortQuery {
    pub pkgname: String,
    pub pkgversion: String,
    pub pkgfile: String,
    pub fetch_depends: String,
    pub extract_depends: String,
    pub patch_depends: String,
    pub build_depends: String,
    pub lib_depends: String,
    pub run_depends: String,
    pub ignore: String,
}

impl RawPortQuery {
    fn from_lines(origin: &str, raw: &str) -> Result<Self, Error> {
        let lines: Vec<&str> = raw.lines().collect();
        if lines.len() < QUERY_VARS.len() {
            return Err(Error::CorruptPort {
                origin: origin.to_string(),
                reason: format!(
                    "expected {} variable lines, got {}",
                    QUERY_VARS.len(),
                    lines.len()
                ),
            });
        }
        Ok(Self {
            pkgname: lines[0].trim().to_string(),
            pkgversion: lines[1].trim().to_string(),
            pkgfile: lines[2].trim().to_string(),
            fetch_depends: lines[3].trim().to_string(),
            extract_depends: lines[4].trim().to_string(),
            patch_depends: lines[5].trim().to_string(),
            build_depends: lines[6].trim().to_string(),
            lib_depends: lines[7].trim().to_string(),
            run_depends: lines[8].trim().to_string(),
            ignore: lines[9].trim().to_string(),
        })
    }
}

/// Abstract ports querier; production is `make`-backed, tests read
/// pre-recorded ten-line fixture files.
pub trait PortsQuerier: Send + Sync {
    fn query(&self, cfg: &Config, id: &PortId) -> Result<RawPortQuery, Error>;
}

/// Runs `make -C <portdir> [FLAVOR=<f>] -V <var>...` on the host.
pub struct MakeQuerier;

impl PortsQuerier for MakeQuerier {
    fn query(&self, cfg: &Config, id: &PortId) -> Result<RawPortQuery, Error> {
        let origin = id.origin();
        let portdir = cfg.port_path(&origin);
        if !portdir.join("Makefile").is_file() {
            return Err(Error::PortNotFound(id.to_string()));
        }
        let mut cmd = Command::new("make");
        cmd.arg("-C").arg(&portdir);
        if let Some(flavor) = &id.flavor {
            cmd.arg(format!("FLAVOR={flavor}"));
        }
        for var in QUERY_VARS {
            cmd.arg("-V").arg(var);
        }
        let output = cmd.output().map_err(|err| Error::CorruptPort {
            origin: origin.clone(),
            reason: format!("failed to run make: {err}"),
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::CorruptPort {
                origin,
                reason: format!(
                    "make exited with {}: {}",
                    output.status,
                    stderr.lines().next().unwrap_or("")
                ),
            });
        }
        RawPortQuery::from_lines(&origin, &String::from_utf8_lossy(&output.stdout))
    }
}

/// Reads `{root}/{category}/{name}[@flavor].vars` fixture files.
pub struct FixtureQuerier {
    root: PathBuf,
}

impl FixtureQuerier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn fixture_path(&self, id: &PortId) -> PathBuf {
        let name = match &id.flavor {
            Some(flavor) => format!("{}@{}.vars", id.name, flavor),
            None => format!("{}.vars", id.name),
        };
        self.root.join(&id.category).join(name)
    }
}

impl PortsQuerier for FixtureQuerier {
    fn query(&self, _cfg: &Config, id: &PortId) -> Result<RawPortQuery, Error> {
        let path = self.fixture_path(id);
        if !path.is_file() {
            return Err(Error::PortNotFound(id.to_string()));
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|err| Error::io(format!("reading fixture {}", path.display()), err))?;
        RawPortQuery::from_lines(&id.origin(), &raw)
    }
}

/// Extract `category/name[@flavor]` identities from a raw dependency
/// specification string. Tokens are `tool_or_lib:origin[:target]`; the
/// middle field is kept, everything else discarded. Tokens whose second
/// field begins with `/nonexistent` correspond to unresolved
/// `${NONEXISTENT}` substitutions and are dropped.
pub fn parse_dep_tokens(raw: &str, dports_root: &Path) -> Vec<PortId> {
    let mut out: Vec<PortId> = Vec::new();
    for token in raw.split_whitespace() {
        let Some((_, rest)) = token.split_once(':') else {
            continue;
        };
        if rest.starts_with("/nonexistent") {
            continue;
        }
        let field = rest.split(':').next().unwrap_or(rest);
        let Ok(id) = PortId::parse(field, dports_root) else {
            continue;
        };
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

#[derive(Debug)]
pub struct ResolveFailure {
    pub spec: String,
    pub error: Error,
}

#[derive(Debug, Default)]
pub struct ResolveOutcome {
    pub ports: Vec<Arc<Port>>,
    pub failures: Vec<ResolveFailure>,
}

/// Port metadata resolver running queries on a bounded worker pool.
pub struct Resolver {
    querier: Arc<dyn PortsQuerier>,
    pool: rayon::ThreadPool,
}

impl Resolver {
    pub fn new(querier: Arc<dyn PortsQuerier>, max_workers: usize) -> Result<Self, Error> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_workers.max(1))
            .build()
            .map_err(|err| Error::Validation(format!("resolver pool: {err}")))?;
        Ok(Self { querier, pool })
    }

    /// Resolve a batch of user-facing spec strings. Per-spec failures are
    /// aggregated, never aborting the batch; cancellation does abort.
    pub fn resolve_specs(
        &self,
        cancel: &CancelToken,
        cfg: &Config,
        specs: &[String],
        registry: &PortRegistry,
        states: &BuildStateRegistry,
        logger: &dyn Logger,
    ) -> Result<ResolveOutcome, Error> {
        if specs.is_empty() {
            return Err(Error::EmptySpec);
        }
        let mut ids = Vec::new();
        let mut outcome = ResolveOutcome::default();
        for spec in specs {
            match PortId::parse(spec, &cfg.dports_path) {
                Ok(id) => {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
                Err(error) => {
                    logger.warn(&format!("phase=resolve status=invalid-spec spec={spec}"));
                    outcome.failures.push(ResolveFailure {
                        spec: spec.clone(),
                        error,
                    });
                }
            }
        }
        self.resolve_ids(cancel, cfg, &ids, registry, states, logger, true, &mut outcome)?;
        if outcome.ports.is_empty() {
            return Err(Error::NoValidPorts);
        }
        Ok(outcome)
    }

    /// Resolve dependency identities discovered during graph closure; the
    /// ManualSel flag is not applied and an all-failed batch is not an error.
    pub fn resolve_deps(
        &self,
        cancel: &CancelToken,
        cfg: &Config,
        ids: &[PortId],
        registry: &PortRegistry,
        states: &BuildStateRegistry,
        logger: &dyn Logger,
    ) -> Result<ResolveOutcome, Error> {
        let mut outcome = ResolveOutcome::default();
        self.resolve_ids(cancel, cfg, ids, registry, states, logger, false, &mut outcome)?;
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_ids(
        &self,
        cancel: &CancelToken,
        cfg: &Config,
        ids: &[PortId],
        registry: &PortRegistry,
        states: &BuildStateRegistry,
        logger: &dyn Logger,
        manual: bool,
        outcome: &mut ResolveOutcome,
    ) -> Result<(), Error> {
        let mut unknown = Vec::new();
        for id in ids {
            if let Some(port) = registry.get(id) {
                if manual {
                    states.add_flags(id, PortFlags::MANUAL_SEL);
                }
                outcome.ports.push(port);
            } else {
                unknown.push(id.clone());
            }
        }
        if unknown.is_empty() {
            return Ok(());
        }

        let querier = Arc::clone(&self.querier);
        let results: Vec<(PortId, Result<RawPortQuery, Error>)> = self.pool.install(|| {
            unknown
                .par_iter()
                .map(|id| {
                    if cancel.is_cancelled() {
                        return (id.clone(), Err(cancel.err("port query")));
                    }
                    (id.clone(), querier.query(cfg, id))
                })
                .collect()
        });

        for (id, result) in results {
            match result {
                Ok(raw) => {
                    let port = self.build_port(&id, raw, states, logger);
                    let port = registry.insert(port);
                    if manual {
                        states.add_flags(&id, PortFlags::MANUAL_SEL);
                    }
                    outcome.ports.push(port);
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    let flags = match &err {
                        Error::PortNotFound(_) => PortFlags::NOT_FOUND,
                        _ => PortFlags::CORRUPT,
                    };
                    logger.warn(&format!(
                        "phase=resolve status=failed port={id} reason={err}"
                    ));
                    registry.insert(Port::placeholder(id.clone()));
                    states.add_flags(&id, flags | PortFlags::NO_BUILD_IGNORE);
                    if manual {
                        states.add_flags(&id, PortFlags::MANUAL_SEL);
                    }
                    outcome.failures.push(ResolveFailure {
                        spec: id.to_string(),
                        error: err,
                    });
                }
            }
        }
        Ok(())
    }

    fn build_port(
        &self,
        id: &PortId,
        raw: RawPortQuery,
        states: &BuildStateRegistry,
        logger: &dyn Logger,
    ) -> Port {
        let version = if raw.pkgversion.is_empty() {
            raw.pkgname
                .rsplit_once('-')
                .map(|(_, v)| v.to_string())
                .unwrap_or_default()
        } else {
            raw.pkgversion.clone()
        };
        let pkg_file = if raw.pkgfile.is_empty() {
            states.add_flags(id, PortFlags::META);
            logger.debug(&format!("phase=resolve status=meta-port port={id}"));
            format!("{}-{}.pkg", id.name, version)
        } else {
            Path::new(&raw.pkgfile)
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or(raw.pkgfile.clone())
        };
        let ignore = if raw.ignore.is_empty() {
            None
        } else {
            states.add_flags(id, PortFlags::IGNORED | PortFlags::NO_BUILD_IGNORE);
            states.set_ignore_reason(id, raw.ignore.clone());
            logger.info(&format!(
                "phase=resolve status=ignored port={id} reason={}",
                raw.ignore
            ));
            Some(raw.ignore)
        };
        Port {
            id: id.clone(),
            version,
            pkg_file,
            ignore,
            deps: DepSpecs {
                fetch: raw.fetch_depends,
                extract: raw.extract_depends,
                patch: raw.patch_depends,
                build: raw.build_depends,
                lib: raw.lib_depends,
                run: raw.run_depends,
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::logger::MemoryLogger;
    use std::fs;

    pub(crate) fn write_fixture(root: &Path, origin: &str, lines: &[&str; 10]) {
        let path = root.join(format!("{origin}.vars"));
        fs::create_dir_all(path.parent().expect("fixture parent")).expect("fixture dir");
        fs::write(&path, format!("{}\n", lines.join("\n"))).expect("fixture write");
    }

    pub(crate) fn leaf_fixture(name: &str, version: &str) -> [String; 10] {
        [
            format!("{name}-{version}"),
            version.to_string(),
            format!("/usr/packages/All/{name}-{version}.pkg"),
            String::new(),
            String::new(),
            String::new(),
            String::new(),
            String::new(),
            String::new(),
            String::new(),
        ]
    }

    fn setup() -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = crate::config::tests::test_config(dir.path());
        (dir, cfg)
    }

    #[test]
    fn dep_token_parsing_extracts_origins() {
        let root = Path::new("/usr/dports");
        let raw = "gmake:devel/gmake:build libfoo.so:devel/foo \
                   x:/nonexistent:patch indexinfo>=1:print/indexinfo \
                   py:lang/python@py39 junk noise:/usr/dports/misc/help2man";
        let ids = parse_dep_tokens(raw, root);
        let rendered: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "devel/gmake",
                "devel/foo",
                "print/indexinfo",
                "lang/python@py39",
                "misc/help2man",
            ]
        );
    }

    #[test]
    fn duplicate_dep_tokens_are_coalesced() {
        let root = Path::new("/usr/dports");
        let ids = parse_dep_tokens("a:devel/gmake b:devel/gmake", root);
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn resolve_builds_ports_and_aggregates_failures() {
        let (dir, cfg) = setup();
        let fixtures = dir.path().join("fixtures");
        let good = leaf_fixture("indexinfo", "0.3.1");
        let good: Vec<&str> = good.iter().map(String::as_str).collect();
        write_fixture(&fixtures, "print/indexinfo", good.as_slice().try_into().unwrap());

        let resolver =
            Resolver::new(Arc::new(FixtureQuerier::new(&fixtures)), 2).expect("resolver");
        let registry = PortRegistry::new();
        let states = BuildStateRegistry::new();
        let logger = MemoryLogger::new();
        let cancel = CancelToken::new();

        let specs = vec![
            "print/indexinfo".to_string(),
            "misc/missing".to_string(),
            "not-a-spec".to_string(),
        ];
        let outcome = resolver
            .resolve_specs(&cancel, &cfg, &specs, &registry, &states, &logger)
            .expect("batch resolves");
        assert_eq!(outcome.ports.len(), 1);
        assert_eq!(outcome.failures.len(), 2);
        assert_eq!(outcome.ports[0].version, "0.3.1");
        assert_eq!(outcome.ports[0].pkg_file, "indexinfo-0.3.1.pkg");

        let good_id = PortId::new("print", "indexinfo", None);
        assert!(states.has_flags(&good_id, PortFlags::MANUAL_SEL));

        // The missing port keeps its NotFound flag on a placeholder.
        let missing_id = PortId::new("misc", "missing", None);
        assert!(registry.contains(&missing_id));
        assert!(states.has_flags(
            &missing_id,
            PortFlags::NOT_FOUND | PortFlags::NO_BUILD_IGNORE
        ));
    }

    #[test]
    fn meta_and_ignored_policies_apply() {
        let (dir, cfg) = setup();
        let fixtures = dir.path().join("fixtures");
        write_fixture(
            &fixtures,
            "misc/meta-bundle",
            &[
                "meta-bundle-1.0",
                "1.0",
                "",
                "",
                "",
                "",
                "a:devel/gmake",
                "",
                "",
                "",
            ],
        );
        write_fixture(
            &fixtures,
            "x11/broken",
            &[
                "broken-2.0",
                "2.0",
                "/usr/packages/All/broken-2.0.pkg",
                "",
                "",
                "",
                "",
                "",
                "",
                "is marked as broken",
            ],
        );

        let resolver =
            Resolver::new(Arc::new(FixtureQuerier::new(&fixtures)), 2).expect("resolver");
        let registry = PortRegistry::new();
        let states = BuildStateRegistry::new();
        let logger = MemoryLogger::new();
        let cancel = CancelToken::new();

        let specs = vec!["misc/meta-bundle".to_string(), "x11/broken".to_string()];
        let outcome = resolver
            .resolve_specs(&cancel, &cfg, &specs, &registry, &states, &logger)
            .expect("batch resolves");
        assert_eq!(outcome.ports.len(), 2);

        let meta_id = PortId::new("misc", "meta-bundle", None);
        assert!(states.has_flags(&meta_id, PortFlags::META));
        let meta = registry.get(&meta_id).expect("meta port");
        assert_eq!(meta.pkg_file, "meta-bundle-1.0.pkg");

        let broken_id = PortId::new("x11", "broken", None);
        assert!(states.has_flags(
            &broken_id,
            PortFlags::IGNORED | PortFlags::NO_BUILD_IGNORE
        ));
        assert_eq!(
            states.ignore_reason(&broken_id).as_deref(),
            Some("is marked as broken")
        );
    }

    #[test]
    fn all_specs_failing_is_no_valid_ports() {
        let (dir, cfg) = setup();
        let resolver = Resolver::new(
            Arc::new(FixtureQuerier::new(dir.path().join("fixtures"))),
            2,
        )
        .expect("resolver");
        let registry = PortRegistry::new();
        let states = BuildStateRegistry::new();
        let logger = MemoryLogger::new();
        let cancel = CancelToken::new();

        let err = resolver
            .resolve_specs(
                &cancel,
                &cfg,
                &["misc/nope".to_string()],
                &registry,
                &states,
                &logger,
            )
            .expect_err("must fail");
        assert!(matches!(err, Error::NoValidPorts));

        let err = resolver
            .resolve_specs(&cancel, &cfg, &[], &registry, &states, &logger)
            .expect_err("must fail");
        assert!(matches!(err, Error::EmptySpec));
    }

    #[test]
    fn repeated_resolution_adds_no_new_ports() {
        let (dir, cfg) = setup();
        let fixtures = dir.path().join("fixtures");
        let lines = leaf_fixture("indexinfo", "0.3.1");
        let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
        write_fixture(&fixtures, "print/indexinfo", lines.as_slice().try_into().unwrap());

        let resolver =
            Resolver::new(Arc::new(FixtureQuerier::new(&fixtures)), 2).expect("resolver");
        let registry = PortRegistry::new();
        let states = BuildStateRegistry::new();
        let logger = MemoryLogger::new();
        let cancel = CancelToken::new();
        let specs = vec!["print/indexinfo".to_string()];

        let first = resolver
            .resolve_specs(&cancel, &cfg, &specs, &registry, &states, &logger)
            .expect("first");
        let second = resolver
            .resolve_specs(&cancel, &cfg, &specs, &registry, &states, &logger)
            .expect("second");
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&first.ports[0], &second.ports[0]));
    }
}
