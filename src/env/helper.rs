//! The `--worker-helper` re-exec mode. Detected from argv before any other
//! initialization; behaves as an opaque standalone program: it acquires
//! reaper status, chroots, runs the requested command, and guarantees no
//! descendant outlives it. Exit code equals the command's, or 1 on any
//! helper-internal failure.

use crate::env::exec::WORKER_HELPER_FLAG;
use crate::env::sys;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use std::fs::File;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

pub fn is_helper_invocation(args: &[String]) -> bool {
    args.get(1).is_some_and(|arg| arg == WORKER_HELPER_FLAG)
}

#[derive(Debug, Default)]
struct HelperArgs {
    chroot: String,
    workdir: Option<String>,
    timeout: Option<Duration>,
    command: Vec<String>,
}

fn parse_args(args: &[String]) -> Result<HelperArgs, String> {
    let mut parsed = HelperArgs::default();
    let mut iter = args.iter().skip(2);
    for arg in iter.by_ref() {
        if arg == "--" {
            break;
        } else if let Some(path) = arg.strip_prefix("--chroot=") {
            parsed.chroot = path.to_string();
        } else if let Some(path) = arg.strip_prefix("--workdir=") {
            parsed.workdir = Some(path.to_string());
        } else if let Some(secs) = arg.strip_prefix("--timeout=") {
            let secs: u64 = secs
                .parse()
                .map_err(|_| format!("bad --timeout value '{secs}'"))?;
            parsed.timeout = Some(Duration::from_secs(secs));
        } else {
            return Err(format!("unknown helper argument '{arg}'"));
        }
    }
    parsed.command = iter.cloned().collect();
    if parsed.chroot.is_empty() {
        return Err("missing --chroot".to_string());
    }
    if parsed.command.is_empty() {
        return Err("missing command after --".to_string());
    }
    Ok(parsed)
}

/// Reap every zombie in the helper's process group. The parent started us
/// as a group leader, so the group is exactly the chroot subtree minus
/// anything that called setsid (which reap-all already killed).
fn drain_zombies() {
    loop {
        match waitpid(Pid::from_raw(0), Some(WaitPidFlag::WNOHANG)) {
            Ok(status) if status.pid().is_some() => continue,
            _ => break,
        }
    }
}

pub fn run(args: &[String]) -> i32 {
    let parsed = match parse_args(args) {
        Ok(parsed) => parsed,
        Err(reason) => {
            eprintln!("worker-helper: {reason}");
            return 1;
        }
    };

    // Opened before chroot so redirection keeps working afterwards.
    let devnull = match File::open("/dev/null") {
        Ok(file) => file,
        Err(err) => {
            eprintln!("worker-helper: opening /dev/null: {err}");
            return 1;
        }
    };

    // Reaper status must be acquired while still outside the chroot.
    if let Err(err) = sys::become_subtree_reaper() {
        eprintln!("worker-helper: acquiring reaper: {err}");
    }

    if parsed.chroot != "/" {
        if let Err(err) = nix::unistd::chroot(Path::new(&parsed.chroot)) {
            eprintln!("worker-helper: chroot {}: {err}", parsed.chroot);
            return 1;
        }
    }
    let workdir = parsed.workdir.as_deref().unwrap_or("/");
    if let Err(err) = std::env::set_current_dir(workdir) {
        eprintln!("worker-helper: chdir {workdir}: {err}");
        return 1;
    }

    let mut child = match Command::new(&parsed.command[0])
        .args(&parsed.command[1..])
        .stdin(Stdio::from(devnull))
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            eprintln!("worker-helper: spawning {}: {err}", parsed.command[0]);
            return 1;
        }
    };

    let deadline = parsed.timeout.map(|t| Instant::now() + t);
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(err) => {
                eprintln!("worker-helper: waiting for command: {err}");
                let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
                let _ = child.wait();
                let _ = sys::kill_descendants();
                drain_zombies();
                return 1;
            }
        }
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            eprintln!("worker-helper: command timed out, killing");
            let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
            let _ = child.wait();
            let _ = sys::kill_descendants();
            drain_zombies();
            return 1;
        }
        thread::sleep(Duration::from_millis(100));
    };

    // Nothing may outlive the helper: kill stragglers, then reap.
    if let Err(err) = sys::kill_descendants() {
        eprintln!("worker-helper: reap-all: {err}");
    }
    drain_zombies();

    status.code().unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn detects_helper_invocations() {
        assert!(is_helper_invocation(&argv(&[
            "dports2pkg",
            "--worker-helper",
            "--chroot=/build/SL00",
        ])));
        assert!(!is_helper_invocation(&argv(&["dports2pkg", "build"])));
        assert!(!is_helper_invocation(&argv(&["dports2pkg"])));
    }

    #[test]
    fn parses_the_full_contract() {
        let parsed = parse_args(&argv(&[
            "dports2pkg",
            "--worker-helper",
            "--chroot=/build/SL00",
            "--workdir=/construction",
            "--timeout=3600",
            "--",
            "make",
            "-C",
            "/xports/print/indexinfo",
            "build",
        ]))
        .expect("parse");
        assert_eq!(parsed.chroot, "/build/SL00");
        assert_eq!(parsed.workdir.as_deref(), Some("/construction"));
        assert_eq!(parsed.timeout, Some(Duration::from_secs(3600)));
        assert_eq!(parsed.command, vec!["make", "-C", "/xports/print/indexinfo", "build"]);
    }

    #[test]
    fn rejects_malformed_invocations() {
        assert!(parse_args(&argv(&["dports2pkg", "--worker-helper", "--", "true"])).is_err());
        assert!(parse_args(&argv(&[
            "dports2pkg",
            "--worker-helper",
            "--chroot=/x",
            "--",
        ]))
        .is_err());
        assert!(parse_args(&argv(&[
            "dports2pkg",
            "--worker-helper",
            "--chroot=/x",
            "--bogus",
            "--",
            "true",
        ]))
        .is_err());
    }

    #[test]
    fn helper_runs_and_times_out_commands_without_chroot() {
        // A chroot of "/" skips chroot(2), so this runs unprivileged.
        let code = run(&argv(&[
            "dports2pkg",
            "--worker-helper",
            "--chroot=/",
            "--",
            "/bin/sh",
            "-c",
            "exit 7",
        ]));
        assert_eq!(code, 7);

        let started = Instant::now();
        let code = run(&argv(&[
            "dports2pkg",
            "--worker-helper",
            "--chroot=/",
            "--timeout=1",
            "--",
            "/bin/sh",
            "-c",
            "sleep 30",
        ]));
        assert_eq!(code, 1);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
