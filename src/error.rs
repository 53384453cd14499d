use std::path::PathBuf;
use thiserror::Error;

/// Boxed cause for error variants that wrap foreign failures.
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    // Resolver and graph.
    #[error("empty port spec list")]
    EmptySpec,
    #[error("invalid port spec '{0}'")]
    InvalidSpec(String),
    #[error("port not found: {0}")]
    PortNotFound(String),
    #[error("no valid ports after resolution")]
    NoValidPorts,
    #[error("corrupt port {origin}: {reason}")]
    CorruptPort { origin: String, reason: String },
    #[error("dependency cycle detected among {0} ports: {1}", .remaining.len(), .remaining.join(", "))]
    CycleDetected { remaining: Vec<String> },

    // Build database.
    #[error("record not found: {0}")]
    RecordNotFound(String),
    #[error("build database is closed")]
    DatabaseClosed,
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    PackageIndex(#[from] PackageIndexError),
    #[error(transparent)]
    Crc(#[from] CrcError),

    // Isolation environment.
    #[error("environment setup requires root")]
    RequiresRoot,
    #[error(transparent)]
    Mount(#[from] MountError),
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    // Cancellation.
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("pkg bootstrap failed: {0}")]
    BootstrapFailed(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{op}: {source}")]
    Io {
        op: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn io(op: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            op: op.into(),
            source,
        }
    }

    /// True when the error, or any wrapped cause, is a cancellation or an
    /// expired deadline.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled(_) | Error::DeadlineExceeded(_) => true,
            Error::Execution(exec) => exec
                .source
                .as_deref()
                .is_some_and(|cause| cause.is_cancelled()),
            Error::Setup(setup) => setup
                .source
                .as_deref()
                .is_some_and(|cause| cause.is_cancelled()),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
#[error("database {op} failed: {source}")]
pub struct DatabaseError {
    pub op: &'static str,
    #[source]
    pub source: Cause,
}

impl DatabaseError {
    pub fn new(op: &'static str, source: impl Into<Cause>) -> Self {
        Self {
            op,
            source: source.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("record {uuid} {op} failed: {source}")]
pub struct RecordError {
    pub uuid: String,
    pub op: &'static str,
    #[source]
    pub source: Cause,
}

impl RecordError {
    pub fn new(uuid: impl Into<String>, op: &'static str, source: impl Into<Cause>) -> Self {
        Self {
            uuid: uuid.into(),
            op,
            source: source.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("package index {op} failed for {portdir}@{version}: {source}")]
pub struct PackageIndexError {
    pub portdir: String,
    pub version: String,
    pub op: &'static str,
    #[source]
    pub source: Cause,
}

impl PackageIndexError {
    pub fn new(
        portdir: impl Into<String>,
        version: impl Into<String>,
        op: &'static str,
        source: impl Into<Cause>,
    ) -> Self {
        Self {
            portdir: portdir.into(),
            version: version.into(),
            op,
            source: source.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("fingerprint {op} failed for {portdir}: {source}")]
pub struct CrcError {
    pub portdir: String,
    pub op: &'static str,
    #[source]
    pub source: Cause,
}

impl CrcError {
    pub fn new(portdir: impl Into<String>, op: &'static str, source: impl Into<Cause>) -> Self {
        Self {
            portdir: portdir.into(),
            op,
            source: source.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("mount {fstype} {source_spec} -> {path} failed during {op}: {source}")]
pub struct MountError {
    pub path: PathBuf,
    pub fstype: &'static str,
    pub source_spec: String,
    pub op: &'static str,
    #[source]
    pub source: Cause,
}

#[derive(Debug, Error)]
#[error("environment setup {op} failed ({} mounts affected)", .mounts.len())]
pub struct SetupError {
    pub op: &'static str,
    pub mounts: Vec<MountError>,
    #[source]
    pub source: Option<Box<Error>>,
}

#[derive(Debug, Error)]
#[error("command '{command}' {op} failed with exit code {exit_code}")]
pub struct ExecutionError {
    pub command: String,
    pub exit_code: i32,
    pub op: &'static str,
    #[source]
    pub source: Option<Box<Error>>,
}

impl ExecutionError {
    pub fn new(command: impl Into<String>, exit_code: i32, op: &'static str, source: Error) -> Self {
        Self {
            command: command.into(),
            exit_code,
            op,
            source: Some(Box::new(source)),
        }
    }
}

#[derive(Debug, Error)]
#[error("environment cleanup {op} left {} mounts behind", .mounts.len())]
pub struct CleanupError {
    pub op: &'static str,
    pub mounts: Vec<PathBuf>,
    #[source]
    pub source: Option<Box<Error>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_visible_through_execution_wrapper() {
        let err = Error::Execution(ExecutionError::new(
            "make build",
            -1,
            "execute",
            Error::Cancelled("interrupted".to_string()),
        ));
        assert!(err.is_cancelled());

        let plain = Error::Execution(ExecutionError {
            command: "make build".to_string(),
            exit_code: 1,
            op: "execute",
            source: None,
        });
        assert!(!plain.is_cancelled());
    }

    #[test]
    fn deadline_counts_as_cancellation() {
        assert!(Error::DeadlineExceeded("make timed out".to_string()).is_cancelled());
        assert!(!Error::NoValidPorts.is_cancelled());
    }
}
