use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Success,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Success => "success",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logging seam consumed by every component; the core never writes to
/// stdout/stderr directly. Messages are single `key=value` records in the
/// style `phase=... status=...`.
pub trait Logger: Send + Sync {
    fn log(&self, level: Level, message: &str);

    fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }
    fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }
    fn warn(&self, message: &str) {
        self.log(Level::Warn, message);
    }
    fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }
    /// Success-list recording: one line per port that built cleanly.
    fn success(&self, message: &str) {
        self.log(Level::Success, message);
    }
}

/// Contextual wrapper carrying a worker slot and the first 8 characters of
/// a build UUID; prefixes every record it forwards.
pub struct ScopedLogger {
    inner: Arc<dyn Logger>,
    prefix: String,
}

impl ScopedLogger {
    pub fn new(inner: Arc<dyn Logger>, worker_id: Option<u32>, build_id: Option<&str>) -> Self {
        let mut prefix = String::new();
        if let Some(id) = worker_id {
            prefix.push_str(&format!("worker=SL{id:02} "));
        }
        if let Some(uuid) = build_id {
            let short: String = uuid.chars().take(8).collect();
            prefix.push_str(&format!("build={short} "));
        }
        Self { inner, prefix }
    }
}

impl Logger for ScopedLogger {
    fn log(&self, level: Level, message: &str) {
        self.inner.log(level, &format!("{}{}", self.prefix, message));
    }
}

/// Production variant: one `level=... key=value` line per record on stdout.
#[derive(Default)]
pub struct TermLogger {
    pub verbose: bool,
}

impl Logger for TermLogger {
    fn log(&self, level: Level, message: &str) {
        if level == Level::Debug && !self.verbose {
            return;
        }
        println!("level={level} {message}");
    }
}

/// No-op variant; a legal implementation of the seam.
pub struct NopLogger;

impl Logger for NopLogger {
    fn log(&self, _level: Level, _message: &str) {}
}

/// Capturing variant for tests.
#[derive(Default)]
pub struct MemoryLogger {
    records: Mutex<Vec<(Level, String)>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(Level, String)> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.records()
            .iter()
            .any(|(_, message)| message.contains(needle))
    }

    pub fn success_list(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|(level, _)| *level == Level::Success)
            .map(|(_, message)| message)
            .collect()
    }
}

impl Logger for MemoryLogger {
    fn log(&self, level: Level, message: &str) {
        if let Ok(mut records) = self.records.lock() {
            records.push((level, message.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_logger_prefixes_worker_and_build_id() {
        let memory = Arc::new(MemoryLogger::new());
        let scoped = ScopedLogger::new(
            memory.clone(),
            Some(3),
            Some("a1b2c3d4-0000-0000-0000-000000000000"),
        );
        scoped.info("phase=build status=started");
        let records = memory.records();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].1,
            "worker=SL03 build=a1b2c3d4 phase=build status=started"
        );
    }

    #[test]
    fn memory_logger_collects_success_list() {
        let memory = MemoryLogger::new();
        memory.success("port=print/indexinfo");
        memory.info("phase=build status=dispatch");
        assert_eq!(memory.success_list(), vec!["port=print/indexinfo"]);
        assert!(memory.contains("status=dispatch"));
    }
}
