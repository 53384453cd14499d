use crate::error::Error;
use bitflags::bitflags;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Identity of a port: `category/name[@flavor]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId {
    pub category: String,
    pub name: String,
    pub flavor: Option<String>,
}

impl PortId {
    pub fn new(category: &str, name: &str, flavor: Option<&str>) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            flavor: flavor.map(|f| f.to_string()),
        }
    }

    /// Parse a user-supplied spec. Accepted forms: `category/name`,
    /// `category/name@flavor`, or an absolute path under the dports root
    /// (trimmed to `category/name`).
    pub fn parse(spec: &str, dports_root: &Path) -> Result<Self, Error> {
        let mut spec = spec.trim();
        if spec.is_empty() {
            return Err(Error::InvalidSpec(String::new()));
        }
        let trimmed;
        if spec.starts_with('/') {
            let root = dports_root.to_string_lossy();
            let Some(rest) = spec
                .strip_prefix(root.as_ref())
                .map(|r| r.trim_start_matches('/'))
            else {
                return Err(Error::InvalidSpec(spec.to_string()));
            };
            trimmed = rest.to_string();
            spec = &trimmed;
        }
        let (origin, flavor) = match spec.split_once('@') {
            Some((origin, flavor)) if !flavor.is_empty() => (origin, Some(flavor)),
            Some(_) => return Err(Error::InvalidSpec(spec.to_string())),
            None => (spec, None),
        };
        let Some((category, name)) = origin.split_once('/') else {
            return Err(Error::InvalidSpec(spec.to_string()));
        };
        if category.is_empty() || name.is_empty() || name.contains('/') {
            return Err(Error::InvalidSpec(spec.to_string()));
        }
        Ok(Self::new(category, name, flavor))
    }

    /// `category/name` without the flavor tag; names the port directory.
    pub fn origin(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }

    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.flavor {
            Some(flavor) => write!(f, "{}/{}@{}", self.category, self.name, flavor),
            None => write!(f, "{}/{}", self.category, self.name),
        }
    }
}

/// Dependency kinds, in Makefile order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DepKind {
    Fetch = 1,
    Extract = 2,
    Patch = 3,
    Build = 4,
    Lib = 5,
    Run = 6,
}

impl DepKind {
    pub const ALL: [DepKind; 6] = [
        DepKind::Fetch,
        DepKind::Extract,
        DepKind::Patch,
        DepKind::Build,
        DepKind::Lib,
        DepKind::Run,
    ];
}

/// Raw dependency specification strings as reported by `make -V`, one per
/// kind, unparsed.
#[derive(Debug, Clone, Default)]
pub struct DepSpecs {
    pub fetch: String,
    pub extract: String,
    pub patch: String,
    pub build: String,
    pub lib: String,
    pub run: String,
}

impl DepSpecs {
    pub fn get(&self, kind: DepKind) -> &str {
        match kind {
            DepKind::Fetch => &self.fetch,
            DepKind::Extract => &self.extract,
            DepKind::Patch => &self.patch,
            DepKind::Build => &self.build,
            DepKind::Lib => &self.lib,
            DepKind::Run => &self.run,
        }
    }
}

/// Immutable port metadata. Created only by resolver queries; all mutable
/// build status lives in the BuildStateRegistry.
#[derive(Debug)]
pub struct Port {
    pub id: PortId,
    pub version: String,
    pub pkg_file: String,
    pub ignore: Option<String>,
    pub deps: DepSpecs,
}

impl Port {
    /// Placeholder for a port whose query failed; carries identity only.
    pub fn placeholder(id: PortId) -> Self {
        Self {
            id,
            version: String::new(),
            pkg_file: String::new(),
            ignore: None,
            deps: DepSpecs::default(),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortFlags: u32 {
        /// User listed this port directly.
        const MANUAL_SEL      = 1 << 0;
        /// Port produces no package file.
        const META            = 1 << 1;
        /// Synthetic flavor aggregator.
        const DUMMY           = 1 << 2;
        const SUCCESS         = 1 << 3;
        const FAILED          = 1 << 4;
        /// Skipped because a prerequisite failed.
        const SKIPPED         = 1 << 5;
        /// Port declares itself unbuildable (IGNORE set).
        const IGNORED         = 1 << 6;
        /// Derived "do not attempt".
        const NO_BUILD_IGNORE = 1 << 7;
        const NOT_FOUND       = 1 << 8;
        /// Makefile query failed.
        const CORRUPT         = 1 << 9;
        /// Package file exists on disk.
        const PACKAGED        = 1 << 10;
        const RUNNING         = 1 << 11;
        /// The pkg manager port; bootstrapped before anything else.
        const PKG_PKG         = 1 << 12;
    }
}

impl PortFlags {
    /// States after which a dependent may be scheduled (or skipped).
    pub fn terminal() -> PortFlags {
        PortFlags::SUCCESS
            | PortFlags::FAILED
            | PortFlags::SKIPPED
            | PortFlags::IGNORED
            | PortFlags::NO_BUILD_IGNORE
    }
}

/// Registry of resolved ports. Two parses of the same identity return the
/// same `Arc<Port>`; the resolver is the only mutator.
#[derive(Default)]
pub struct PortRegistry {
    ports: Mutex<HashMap<String, Arc<Port>>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, port: Port) -> Arc<Port> {
        let mut ports = self.ports.lock().expect("port registry poisoned");
        let key = port.id.key();
        Arc::clone(ports.entry(key).or_insert_with(|| Arc::new(port)))
    }

    pub fn get(&self, id: &PortId) -> Option<Arc<Port>> {
        self.ports
            .lock()
            .expect("port registry poisoned")
            .get(&id.key())
            .cloned()
    }

    pub fn contains(&self, id: &PortId) -> bool {
        self.ports
            .lock()
            .expect("port registry poisoned")
            .contains_key(&id.key())
    }

    pub fn len(&self) -> usize {
        self.ports.lock().expect("port registry poisoned").len()
    }

    pub fn all(&self) -> Vec<Arc<Port>> {
        let mut ports: Vec<Arc<Port>> = self
            .ports
            .lock()
            .expect("port registry poisoned")
            .values()
            .cloned()
            .collect();
        ports.sort_by(|a, b| a.id.cmp(&b.id));
        ports
    }
}

/// Per-port mutable build status, separated from the immutable Port.
#[derive(Debug, Clone)]
pub struct BuildState {
    pub flags: PortFlags,
    pub ignore_reason: Option<String>,
    pub last_phase: String,
}

impl Default for BuildState {
    fn default() -> Self {
        Self {
            flags: PortFlags::empty(),
            ignore_reason: None,
            last_phase: String::new(),
        }
    }
}

/// Concurrent-safe map of PortId -> BuildState with atomic
/// read-modify-write flag helpers.
#[derive(Default)]
pub struct BuildStateRegistry {
    states: Mutex<HashMap<String, BuildState>>,
}

impl BuildStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, id: &PortId, f: impl FnOnce(&mut BuildState) -> T) -> T {
        let mut states = self.states.lock().expect("state registry poisoned");
        f(states.entry(id.key()).or_default())
    }

    pub fn add_flags(&self, id: &PortId, flags: PortFlags) {
        self.with_state(id, |state| state.flags |= flags);
    }

    pub fn clear_flags(&self, id: &PortId, flags: PortFlags) {
        self.with_state(id, |state| state.flags &= !flags);
    }

    /// True when every bit in `flags` is set.
    pub fn has_flags(&self, id: &PortId, flags: PortFlags) -> bool {
        self.with_state(id, |state| state.flags.contains(flags))
    }

    /// True when any bit in `flags` is set.
    pub fn has_any_flags(&self, id: &PortId, flags: PortFlags) -> bool {
        self.with_state(id, |state| state.flags.intersects(flags))
    }

    pub fn set_ignore_reason(&self, id: &PortId, reason: impl Into<String>) {
        self.with_state(id, |state| state.ignore_reason = Some(reason.into()));
    }

    pub fn ignore_reason(&self, id: &PortId) -> Option<String> {
        self.with_state(id, |state| state.ignore_reason.clone())
    }

    pub fn set_last_phase(&self, id: &PortId, phase: &str) {
        self.with_state(id, |state| state.last_phase = phase.to_string());
    }

    pub fn last_phase(&self, id: &PortId) -> String {
        self.with_state(id, |state| state.last_phase.clone())
    }

    pub fn snapshot(&self, id: &PortId) -> BuildState {
        self.with_state(id, |state| state.clone())
    }

    pub fn is_terminal(&self, id: &PortId) -> bool {
        self.has_any_flags(id, PortFlags::terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn parse_accepts_origin_flavor_and_path_forms() {
        let root = PathBuf::from("/usr/dports");
        let plain = PortId::parse("print/indexinfo", &root).expect("plain spec");
        assert_eq!(plain.origin(), "print/indexinfo");
        assert_eq!(plain.flavor, None);

        let flavored = PortId::parse("lang/python@py39", &root).expect("flavored spec");
        assert_eq!(flavored.to_string(), "lang/python@py39");

        let pathed = PortId::parse("/usr/dports/misc/help2man", &root).expect("path spec");
        assert_eq!(pathed.origin(), "misc/help2man");
    }

    #[test]
    fn parse_rejects_malformed_specs() {
        let root = PathBuf::from("/usr/dports");
        for bad in ["", "indexinfo", "print/", "/etc/passwd", "a/b@", "a/b/c@x"] {
            assert!(
                matches!(PortId::parse(bad, &root), Err(Error::InvalidSpec(_))),
                "spec {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn registry_returns_same_instance_for_same_identity() {
        let registry = PortRegistry::new();
        let id = PortId::new("print", "indexinfo", None);
        let first = registry.insert(Port::placeholder(id.clone()));
        let second = registry.insert(Port::placeholder(id.clone()));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&id));
    }

    #[test]
    fn flag_helpers_are_atomic_read_modify_write() {
        let states = BuildStateRegistry::new();
        let id = PortId::new("misc", "help2man", None);
        states.add_flags(&id, PortFlags::RUNNING);
        assert!(states.has_flags(&id, PortFlags::RUNNING));
        states.clear_flags(&id, PortFlags::RUNNING);
        states.add_flags(&id, PortFlags::SUCCESS | PortFlags::PACKAGED);
        assert!(states.has_flags(&id, PortFlags::SUCCESS | PortFlags::PACKAGED));
        assert!(states.has_any_flags(&id, PortFlags::terminal()));
        assert!(states.is_terminal(&id));
        assert!(!states.has_flags(&id, PortFlags::FAILED));
    }

    #[test]
    fn ignore_reason_and_last_phase_round_trip() {
        let states = BuildStateRegistry::new();
        let id = PortId::new("x11", "broken", None);
        states.set_ignore_reason(&id, "is marked as broken");
        states.set_last_phase(&id, "configure");
        let snap = states.snapshot(&id);
        assert_eq!(snap.ignore_reason.as_deref(), Some("is marked as broken"));
        assert_eq!(snap.last_phase, "configure");
    }
}
