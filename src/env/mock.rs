//! Scripted mock backend for orchestrator tests: records every call and
//! answers with a programmable exit code, with no processes or mounts.

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::env::{Environment, ExecResult, ExecSpec};
use crate::error::{Error, ExecutionError};
use crate::logger::Logger;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MockCall {
    pub worker_id: u32,
    pub command: String,
    pub args: Vec<String>,
}

impl MockCall {
    pub fn rendered(&self) -> String {
        let mut out = self.command.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

type ExecHook = dyn Fn(u32, &ExecSpec) -> i32 + Send + Sync;

/// Shared behavior and call log for a family of mock environments.
pub struct MockScript {
    calls: Mutex<Vec<MockCall>>,
    setups: Mutex<Vec<u32>>,
    cleanups: Mutex<Vec<u32>>,
    exec_hook: Box<ExecHook>,
    pub fail_setup: bool,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            setups: Mutex::new(Vec::new()),
            cleanups: Mutex::new(Vec::new()),
            exec_hook: Box::new(|_, _| 0),
            fail_setup: false,
        }
    }
}

impl MockScript {
    pub fn new(exec_hook: impl Fn(u32, &ExecSpec) -> i32 + Send + Sync + 'static) -> Self {
        Self {
            exec_hook: Box::new(exec_hook),
            ..Self::default()
        }
    }

    pub fn failing_setup() -> Self {
        Self {
            fail_setup: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn setups(&self) -> Vec<u32> {
        self.setups.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn cleanups(&self) -> Vec<u32> {
        self.cleanups.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

pub struct MockEnvironment {
    worker_id: u32,
    base: PathBuf,
    script: Arc<MockScript>,
}

impl MockEnvironment {
    pub fn new(worker_id: u32, cfg: &Config, script: Arc<MockScript>) -> Self {
        Self {
            worker_id,
            base: cfg.slot_path(worker_id),
            script,
        }
    }

    /// The default `mock` backend: every command succeeds.
    pub fn permissive(worker_id: u32, cfg: &Config) -> Self {
        Self::new(worker_id, cfg, Arc::new(MockScript::default()))
    }
}

impl Environment for MockEnvironment {
    fn worker_id(&self) -> u32 {
        self.worker_id
    }

    fn base_path(&self) -> PathBuf {
        self.base.clone()
    }

    fn setup(&mut self, _logger: &dyn Logger) -> Result<(), Error> {
        if let Ok(mut setups) = self.script.setups.lock() {
            setups.push(self.worker_id);
        }
        if self.script.fail_setup {
            return Err(Error::Setup(crate::error::SetupError {
                op: "mount",
                mounts: Vec::new(),
                source: None,
            }));
        }
        Ok(())
    }

    fn execute(
        &self,
        cancel: &CancelToken,
        spec: &ExecSpec,
        _logger: &dyn Logger,
    ) -> Result<ExecResult, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Execution(ExecutionError::new(
                spec.rendered(),
                -1,
                "execute",
                cancel.err("mock command"),
            )));
        }
        if let Ok(mut calls) = self.script.calls.lock() {
            calls.push(MockCall {
                worker_id: self.worker_id,
                command: spec.command.clone(),
                args: spec.args.clone(),
            });
        }
        let exit_code = (self.script.exec_hook)(self.worker_id, spec);
        Ok(ExecResult {
            exit_code,
            elapsed: Duration::from_millis(1),
        })
    }

    fn cleanup(&self, _logger: &dyn Logger) -> Result<(), Error> {
        if let Ok(mut cleanups) = self.script.cleanups.lock() {
            cleanups.push(self.worker_id);
        }
        Ok(())
    }
}
