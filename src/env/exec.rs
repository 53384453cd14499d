use crate::cancel::CancelToken;
use crate::env::{ExecResult, ExecSpec};
use crate::error::{Error, ExecutionError};
use crate::logger::Logger;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

pub const WORKER_HELPER_FLAG: &str = "--worker-helper";

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const TERM_GRACE: Duration = Duration::from_secs(2);

/// PIDs of live helper processes for one environment. Execute appends at
/// spawn and removes at wait-return; the cleanup path reads it
/// concurrently, hence the mutex.
#[derive(Default)]
pub struct PidTracker {
    pids: Mutex<Vec<i32>>,
}

impl PidTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, pid: i32) {
        if let Ok(mut pids) = self.pids.lock() {
            pids.push(pid);
        }
    }

    fn remove(&self, pid: i32) {
        if let Ok(mut pids) = self.pids.lock() {
            pids.retain(|p| *p != pid);
        }
    }

    pub fn snapshot(&self) -> Vec<i32> {
        self.pids.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// SIGTERM each tracked process group, wait the grace period, SIGKILL
    /// whatever is still alive.
    pub fn terminate_all(&self, logger: &dyn Logger) {
        let pids = self.snapshot();
        if pids.is_empty() {
            return;
        }
        for pid in &pids {
            logger.info(&format!("phase=cleanup status=terminating pgid={pid}"));
            let _ = kill(Pid::from_raw(-pid), Signal::SIGTERM);
        }
        let deadline = Instant::now() + TERM_GRACE;
        while Instant::now() < deadline && !self.snapshot().is_empty() {
            thread::sleep(Duration::from_millis(50));
        }
        for pid in self.snapshot() {
            logger.warn(&format!("phase=cleanup status=killing pgid={pid}"));
            let _ = kill(Pid::from_raw(-pid), Signal::SIGKILL);
        }
    }
}

/// Build the self-re-exec argument vector for the worker helper. This
/// interface is stable: the binary calls itself through it.
pub fn helper_args(chroot: &Path, spec: &ExecSpec) -> Vec<String> {
    let mut args = vec![
        WORKER_HELPER_FLAG.to_string(),
        format!("--chroot={}", chroot.display()),
    ];
    if let Some(workdir) = &spec.workdir {
        args.push(format!("--workdir={workdir}"));
    }
    if let Some(timeout) = spec.timeout {
        args.push(format!("--timeout={}", timeout.as_secs().max(1)));
    }
    args.push("--".to_string());
    args.push(spec.command.clone());
    args.extend(spec.args.iter().cloned());
    args
}

fn stream_output<R: Read + Send>(reader: R, logger: &dyn Logger) {
    let reader = BufReader::new(reader);
    for line in reader.lines() {
        match line {
            Ok(line) => logger.info(&line),
            Err(_) => break,
        }
    }
}

fn kill_group_ladder(child: &mut Child, pid: i32) {
    let _ = kill(Pid::from_raw(-pid), Signal::SIGTERM);
    let deadline = Instant::now() + TERM_GRACE;
    loop {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
    let _ = kill(Pid::from_raw(-pid), Signal::SIGKILL);
    let _ = child.wait();
}

/// Run one command inside `chroot` under a worker-helper subprocess in its
/// own process group, streaming output into the logger.
///
/// The cancellation token is consulted before the child's exit status is
/// interpreted: a cancelled or expired token always wins and surfaces as
/// exit code -1 with the token's error as the cause.
pub fn run_supervised(
    tracker: &PidTracker,
    cancel: &CancelToken,
    chroot: &Path,
    spec: &ExecSpec,
    logger: &dyn Logger,
) -> Result<ExecResult, Error> {
    if let Some(workdir) = &spec.workdir
        && !workdir.starts_with('/')
    {
        return Err(Error::Validation(format!(
            "workdir must be absolute, got '{workdir}'"
        )));
    }
    let exe = std::env::current_exe()
        .map_err(|err| Error::io("locating current executable", err))?;

    let exec_cancel = match spec.timeout {
        Some(timeout) => cancel.child_with_deadline(Instant::now() + timeout),
        None => cancel.child(),
    };

    let started = Instant::now();
    let mut command = Command::new(exe);
    command
        .args(helper_args(chroot, spec))
        .envs(spec.env.iter().map(|(k, v)| (k.clone(), v.clone())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let mut child = command.spawn().map_err(|err| {
        Error::Execution(ExecutionError::new(
            spec.rendered(),
            -1,
            "spawn",
            Error::io("spawning worker helper", err),
        ))
    })?;
    let pid = child.id() as i32;
    tracker.add(pid);
    logger.debug(&format!(
        "phase=execute status=started pid={pid} command={}",
        spec.rendered()
    ));

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let status = thread::scope(|scope| {
        if let Some(stdout) = stdout {
            scope.spawn(|| stream_output(stdout, logger));
        }
        if let Some(stderr) = stderr {
            scope.spawn(|| stream_output(stderr, logger));
        }
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(err) => {
                    kill_group_ladder(&mut child, pid);
                    return Err(Error::io("waiting for worker helper", err));
                }
            }
            if exec_cancel.is_cancelled() {
                kill_group_ladder(&mut child, pid);
                return Err(exec_cancel.err("supervised command"));
            }
            thread::sleep(POLL_INTERVAL);
        }
    });
    tracker.remove(pid);

    let status = match status {
        Ok(status) => status,
        Err(cause) => {
            return Err(Error::Execution(ExecutionError::new(
                spec.rendered(),
                -1,
                "execute",
                cause,
            )));
        }
    };

    // The token is checked before the exit status is interpreted; a
    // cancellation that raced the child's exit still wins.
    if exec_cancel.is_cancelled() {
        return Err(Error::Execution(ExecutionError::new(
            spec.rendered(),
            -1,
            "execute",
            exec_cancel.err("supervised command"),
        )));
    }

    let exit_code = status.code().unwrap_or(-1);
    let elapsed = started.elapsed();
    logger.debug(&format!(
        "phase=execute status=finished pid={pid} exit={exit_code} elapsed_ms={}",
        elapsed.as_millis()
    ));
    Ok(ExecResult { exit_code, elapsed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::MemoryLogger;
    use std::path::PathBuf;

    #[test]
    fn helper_args_follow_the_reinvocation_contract() {
        let spec = ExecSpec {
            command: "make".to_string(),
            args: vec!["build".to_string()],
            env: vec![],
            workdir: Some("/construction".to_string()),
            timeout: Some(Duration::from_secs(3600)),
        };
        let args = helper_args(&PathBuf::from("/build/SL00"), &spec);
        assert_eq!(
            args,
            vec![
                "--worker-helper",
                "--chroot=/build/SL00",
                "--workdir=/construction",
                "--timeout=3600",
                "--",
                "make",
                "build",
            ]
        );
    }

    #[test]
    fn relative_workdir_is_rejected() {
        let tracker = PidTracker::new();
        let cancel = CancelToken::new();
        let logger = MemoryLogger::new();
        let spec = ExecSpec {
            command: "true".to_string(),
            workdir: Some("construction".to_string()),
            ..ExecSpec::default()
        };
        let err = run_supervised(&tracker, &cancel, Path::new("/"), &spec, &logger)
            .expect_err("relative workdir");
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn pre_cancelled_token_wins_over_exit_status() {
        let tracker = PidTracker::new();
        let cancel = CancelToken::new();
        cancel.cancel("interrupted");
        let logger = MemoryLogger::new();
        let spec = ExecSpec::new("/bin/sh").arg("-c").arg("exit 0");
        let err = run_supervised(&tracker, &cancel, Path::new("/"), &spec, &logger)
            .expect_err("cancelled execute");
        match &err {
            Error::Execution(exec) => {
                assert_eq!(exec.exit_code, -1);
                assert!(err.is_cancelled());
            }
            other => panic!("expected execution error, got {other}"),
        }
        assert!(tracker.snapshot().is_empty());
    }
}
