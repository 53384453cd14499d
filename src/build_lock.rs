use anyhow::{Context, Result, bail};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE_NAME: &str = ".dports2pkg.lock";
const STATE_FILE_NAME: &str = ".dports2pkg-session.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionState {
    pid: u32,
    specs: Vec<String>,
    started_at_utc: String,
}

/// Exclusive lock on the build base: worker slots and the database writer
/// belong to one invocation at a time. Released on drop.
#[derive(Debug)]
pub struct BuildSessionGuard {
    lock_file: fs::File,
    state_file: PathBuf,
}

impl BuildSessionGuard {
    pub fn acquire(build_base: &Path, specs: &[String]) -> Result<Self> {
        fs::create_dir_all(build_base)
            .with_context(|| format!("creating build base {}", build_base.display()))?;

        let lock_path = build_base.join(LOCK_FILE_NAME);
        let state_file = build_base.join(STATE_FILE_NAME);
        let mut lock_file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("opening lock file {}", lock_path.display()))?;

        if let Err(err) = FileExt::try_lock_exclusive(&lock_file) {
            if err.kind() == ErrorKind::WouldBlock {
                let owner = load_state(&state_file)
                    .ok()
                    .flatten()
                    .map(|state| {
                        format!(
                            "pid={} specs={} started={}",
                            state.pid,
                            state.specs.join(","),
                            state.started_at_utc
                        )
                    })
                    .unwrap_or_else(|| "unknown".to_string());
                bail!(
                    "build base is already in use: {owner} (state file: {})",
                    state_file.display()
                );
            }
            return Err(err)
                .with_context(|| format!("acquiring build lock {}", lock_path.display()));
        }

        let pid = std::process::id();
        let state = SessionState {
            pid,
            specs: specs.to_vec(),
            started_at_utc: chrono::Utc::now().to_rfc3339(),
        };
        write_state(&state_file, &state)?;

        lock_file
            .set_len(0)
            .with_context(|| format!("truncating lock file {}", lock_path.display()))?;
        writeln!(lock_file, "pid={pid}")
            .with_context(|| format!("writing lock file {}", lock_path.display()))?;
        lock_file
            .flush()
            .with_context(|| format!("flushing lock file {}", lock_path.display()))?;

        Ok(Self {
            lock_file,
            state_file,
        })
    }
}

impl Drop for BuildSessionGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.state_file);
        let _ = FileExt::unlock(&self.lock_file);
    }
}

fn load_state(path: &Path) -> Result<Option<SessionState>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading session state {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&raw)
        .map(Some)
        .with_context(|| format!("parsing session state {}", path.display()))
}

fn write_state(path: &Path, state: &SessionState) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let payload = serde_json::to_vec_pretty(state).context("serializing session state")?;
    fs::write(&tmp, payload)
        .with_context(|| format!("writing temp session state {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("committing session state {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_state_and_release_removes_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().join("build");
        let state_file = base.join(STATE_FILE_NAME);
        {
            let _guard = BuildSessionGuard::acquire(&base, &["print/indexinfo".to_string()])
                .expect("acquire");
            let state = load_state(&state_file)
                .expect("load")
                .expect("state present");
            assert_eq!(state.pid, std::process::id());
            assert_eq!(state.specs, vec!["print/indexinfo".to_string()]);
        }
        assert!(load_state(&state_file).expect("load").is_none());
    }

    #[test]
    fn second_acquire_in_the_same_process_names_the_owner() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().join("build");
        let _guard =
            BuildSessionGuard::acquire(&base, &["misc/help2man".to_string()]).expect("acquire");
        let err = BuildSessionGuard::acquire(&base, &["misc/other".to_string()])
            .expect_err("held lock");
        let message = format!("{err}");
        assert!(message.contains("already in use"), "got: {message}");
    }
}
