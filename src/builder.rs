//! The build orchestrator: a dependency-gated dispatch queue feeding a
//! fixed pool of workers, each owning one isolation environment.

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::db::{BuildDb, BuildRecord, BuildStatus};
use crate::env::template;
use crate::env::{self, Environment, ExecSpec};
use crate::error::Error;
use crate::graph::DependencyGraph;
use crate::logger::{Logger, ScopedLogger};
use crate::port::{BuildStateRegistry, Port, PortFlags, PortId};
use crate::reports::{self, ReportEntry};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Make targets run for every port, in order. `*-depends` targets are
/// no-ops here; prerequisites are installed with `pkg add` beforehand.
pub const BUILD_PHASES: [&str; 8] = [
    "fetch",
    "checksum",
    "extract",
    "patch",
    "configure",
    "build",
    "stage",
    "package",
];

/// Reserved slot for the synchronous pkg bootstrap.
pub const BOOTSTRAP_WORKER_ID: u32 = 99;

const DISPATCH_POLL: Duration = Duration::from_millis(50);
const QUEUE_POLL: Duration = Duration::from_millis(100);
const WORKER_JOIN_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub ignored: usize,
    pub duration: Duration,
}

/// The resolved transitive closure in topological order, plus its edges.
pub struct BuildPlan {
    pub order: Vec<Arc<Port>>,
    pub graph: DependencyGraph,
}

struct EnvSlot {
    env: Mutex<Box<dyn Environment>>,
}

struct Shared {
    cancel: CancelToken,
    cfg: Config,
    db: Arc<BuildDb>,
    states: Arc<BuildStateRegistry>,
    logger: Arc<dyn Logger>,
    plan: Arc<BuildPlan>,
    envs: Mutex<Vec<Arc<EnvSlot>>>,
    active_workers: Mutex<usize>,
    workers_done: Condvar,
    stats: Mutex<BuildStats>,
    outcomes: Mutex<Vec<ReportEntry>>,
    fatal: Mutex<Option<Error>>,
}

impl Shared {
    fn bump(&self, f: impl FnOnce(&mut BuildStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    fn push_outcome(
        &self,
        port: &Port,
        status: &str,
        reason: String,
        uuid: &str,
        elapsed: Duration,
    ) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.push(ReportEntry {
                origin: port.id.origin(),
                flavor: port.id.flavor.clone().unwrap_or_default(),
                version: port.version.clone(),
                status: status.to_string(),
                reason,
                uuid: uuid.to_string(),
                elapsed_secs: elapsed.as_secs_f64(),
            });
        }
    }

    fn set_fatal(&self, err: Error) {
        let reason = format!("fatal: {err}");
        if let Ok(mut fatal) = self.fatal.lock()
            && fatal.is_none()
        {
            *fatal = Some(err);
        }
        self.cancel.cancel(reason);
    }

    fn cleanup_envs(&self) {
        let slots: Vec<Arc<EnvSlot>> = self
            .envs
            .lock()
            .map(|slots| slots.clone())
            .unwrap_or_default();
        for slot in slots {
            if let Ok(env) = slot.env.lock()
                && let Err(err) = env.cleanup(self.logger.as_ref())
            {
                self.logger.error(&format!(
                    "phase=cleanup status=failed worker=SL{:02} reason={err}",
                    env.worker_id()
                ));
            }
        }
    }

    fn wait_for_workers(&self) {
        let deadline = Instant::now() + WORKER_JOIN_GRACE;
        let Ok(mut active) = self.active_workers.lock() else {
            return;
        };
        while *active > 0 && Instant::now() < deadline {
            let Ok((guard, _)) = self
                .workers_done
                .wait_timeout(active, Duration::from_millis(500))
            else {
                return;
            };
            active = guard;
        }
    }
}

/// Handed to the caller before any side-effecting work begins. A signal
/// handler calls `run` to cancel the build, wait for the workers, and tear
/// every environment down; it captures the orchestrator state by
/// reference, so it works while the build is still in progress.
pub struct CleanupHandle {
    shared: Arc<Shared>,
}

impl CleanupHandle {
    pub fn run(&self) {
        self.shared.cancel.cancel("cleanup requested");
        self.shared.wait_for_workers();
        self.shared.cleanup_envs();
    }
}

struct ActiveGuard(Arc<Shared>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.0.active_workers.lock() {
            *active = active.saturating_sub(1);
        }
        self.0.workers_done.notify_all();
    }
}

/// Drive the whole plan to completion. Returns the run statistics; the
/// error is set only for cancellation, a worker setup failure, or a failed
/// pkg bootstrap. Per-port build failures are recorded, propagated to
/// dependents as skips, and do not abort the run.
pub fn run_build(
    cancel: &CancelToken,
    plan: BuildPlan,
    cfg: &Config,
    db: Arc<BuildDb>,
    states: Arc<BuildStateRegistry>,
    logger: Arc<dyn Logger>,
    on_cleanup_ready: impl FnOnce(CleanupHandle),
) -> Result<BuildStats, Error> {
    let started = Instant::now();
    let run_cancel = cancel.child();
    let total = plan.order.len();
    let shared = Arc::new(Shared {
        cancel: run_cancel.clone(),
        cfg: cfg.clone(),
        db,
        states,
        logger: Arc::clone(&logger),
        plan: Arc::new(plan),
        envs: Mutex::new(Vec::new()),
        active_workers: Mutex::new(0),
        workers_done: Condvar::new(),
        stats: Mutex::new(BuildStats {
            total,
            ..BuildStats::default()
        }),
        outcomes: Mutex::new(Vec::new()),
        fatal: Mutex::new(None),
    });

    on_cleanup_ready(CleanupHandle {
        shared: Arc::clone(&shared),
    });

    logger.info(&format!(
        "phase=build status=started total={total} workers={}",
        cfg.max_workers
    ));

    let pkg_port = shared
        .plan
        .order
        .iter()
        .find(|port| shared.states.has_flags(&port.id, PortFlags::PKG_PKG))
        .cloned();
    if let Some(pkg_port) = pkg_port
        && let Err(err) = bootstrap_pkg(&shared, &pkg_port)
    {
        shared.cleanup_envs();
        return Err(err);
    }

    let (tx, rx) = mpsc::channel::<Arc<Port>>();
    let rx = Arc::new(Mutex::new(rx));
    let mut handles = Vec::new();
    for worker_id in 0..cfg.max_workers.max(1) as u32 {
        if let Ok(mut active) = shared.active_workers.lock() {
            *active += 1;
        }
        let shared = Arc::clone(&shared);
        let rx = Arc::clone(&rx);
        handles.push(thread::spawn(move || worker_main(shared, rx, worker_id)));
    }

    let mut counted = HashSet::new();
    let dispatched = dispatch(&shared, tx, &mut counted);

    for handle in handles {
        let _ = handle.join();
    }
    final_accounting(&shared, &dispatched, &mut counted);

    shared.bump(|stats| stats.duration = started.elapsed());
    let outcomes: Vec<ReportEntry> = shared
        .outcomes
        .lock()
        .map(|o| o.clone())
        .unwrap_or_default();
    let stem = format!(
        "batch_{}_{}",
        outcomes.len(),
        Utc::now().format("%Y%m%d%H%M%S")
    );
    if let Err(err) = reports::write_reports(&outcomes, &cfg.logs_path, &stem, logger.as_ref()) {
        logger.warn(&format!("phase=report status=failed reason={err}"));
    }

    shared.cleanup_envs();

    let stats = shared
        .stats
        .lock()
        .map(|s| s.clone())
        .unwrap_or_default();
    logger.info(&format!(
        "phase=build status=finished total={} success={} failed={} skipped={} ignored={} elapsed_ms={}",
        stats.total,
        stats.success,
        stats.failed,
        stats.skipped,
        stats.ignored,
        stats.duration.as_millis()
    ));

    if let Ok(mut fatal) = shared.fatal.lock()
        && let Some(err) = fatal.take()
    {
        return Err(err);
    }
    if run_cancel.is_cancelled() {
        return Err(run_cancel.err("build run"));
    }
    Ok(stats)
}

/// Walk the ordered plan, enqueueing each port once every prerequisite is
/// terminal; re-scan on a short cadence as workers publish transitions.
fn dispatch(
    shared: &Arc<Shared>,
    tx: Sender<Arc<Port>>,
    counted: &mut HashSet<String>,
) -> HashSet<String> {
    let mut dispatched: HashSet<String> = HashSet::new();
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        let mut all_done = true;
        for port in &shared.plan.order {
            let key = port.id.key();
            if counted.contains(&key) {
                continue;
            }
            if dispatched.contains(&key) {
                if shared.states.is_terminal(&port.id) {
                    counted.insert(key);
                } else {
                    all_done = false;
                }
                continue;
            }
            match feeder_decision(shared, port) {
                FeederDecision::Counted => {
                    counted.insert(key);
                }
                FeederDecision::Wait => {
                    all_done = false;
                }
                FeederDecision::Enqueue => {
                    shared.logger.info(&format!(
                        "phase=dispatch status=enqueued port={}",
                        port.id
                    ));
                    if tx.send(Arc::clone(port)).is_err() {
                        all_done = false;
                        break;
                    }
                    dispatched.insert(key);
                    all_done = false;
                }
            }
        }
        if all_done {
            break;
        }
        thread::sleep(DISPATCH_POLL);
    }
    dispatched
}

enum FeederDecision {
    Counted,
    Wait,
    Enqueue,
}

fn feeder_decision(shared: &Arc<Shared>, port: &Arc<Port>) -> FeederDecision {
    let id = &port.id;
    let states = &shared.states;

    // Bootstrap already accounted for the pkg port.
    if states.has_flags(id, PortFlags::PKG_PKG) {
        return FeederDecision::Counted;
    }
    if states.has_flags(id, PortFlags::SKIPPED) {
        let reason = "a prerequisite failed".to_string();
        shared.bump(|s| s.skipped += 1);
        shared.push_outcome(port, "skipped", reason, "", Duration::ZERO);
        return FeederDecision::Counted;
    }
    if states.has_any_flags(
        id,
        PortFlags::NOT_FOUND | PortFlags::CORRUPT | PortFlags::IGNORED,
    ) {
        let reason = states
            .ignore_reason(id)
            .unwrap_or_else(|| "port cannot be built".to_string());
        shared.bump(|s| s.ignored += 1);
        shared.push_outcome(port, "ignored", reason, "", Duration::ZERO);
        return FeederDecision::Counted;
    }
    if states.has_flags(id, PortFlags::SUCCESS) {
        shared.bump(|s| s.success += 1);
        shared.push_outcome(port, "success", "already built".to_string(), "", Duration::ZERO);
        return FeederDecision::Counted;
    }
    if states.has_flags(id, PortFlags::FAILED) {
        shared.bump(|s| s.failed += 1);
        shared.push_outcome(port, "failed", "already failed".to_string(), "", Duration::ZERO);
        return FeederDecision::Counted;
    }
    if states.has_flags(id, PortFlags::NO_BUILD_IGNORE) {
        shared.bump(|s| s.ignored += 1);
        shared.push_outcome(port, "ignored", "marked do-not-build".to_string(), "", Duration::ZERO);
        return FeederDecision::Counted;
    }
    if states.has_flags(id, PortFlags::META) {
        states.add_flags(id, PortFlags::SUCCESS);
        shared.bump(|s| s.success += 1);
        shared.push_outcome(
            port,
            "success",
            "meta port, no package produced".to_string(),
            "",
            Duration::ZERO,
        );
        return FeederDecision::Counted;
    }

    let mut failed_prereq = None;
    for edge in shared.plan.graph.depends_on(id) {
        if !states.is_terminal(&edge.to) {
            return FeederDecision::Wait;
        }
        if states.has_any_flags(
            &edge.to,
            PortFlags::FAILED
                | PortFlags::SKIPPED
                | PortFlags::IGNORED
                | PortFlags::NO_BUILD_IGNORE
                | PortFlags::NOT_FOUND
                | PortFlags::CORRUPT,
        ) {
            failed_prereq = Some(edge.to.clone());
        }
    }
    if let Some(prereq) = failed_prereq {
        states.add_flags(id, PortFlags::SKIPPED | PortFlags::NO_BUILD_IGNORE);
        shared.logger.info(&format!(
            "phase=dispatch status=skipped port={id} reason=prerequisite-{prereq}"
        ));
        shared.bump(|s| s.skipped += 1);
        shared.push_outcome(
            port,
            "skipped",
            format!("prerequisite {prereq} did not build"),
            "",
            Duration::ZERO,
        );
        return FeederDecision::Counted;
    }

    // Unchanged fingerprint with the package on disk: up to date.
    let origin = id.origin();
    if let Ok(fp) = shared.db.compute_port_crc(&shared.cfg, &origin, &shared.cancel)
        && !shared.db.needs_build(&origin, fp)
        && shared.cfg.packages_all().join(&port.pkg_file).is_file()
    {
        states.add_flags(id, PortFlags::SUCCESS | PortFlags::PACKAGED);
        shared.logger.info(&format!(
            "phase=dispatch status=up-to-date port={id} crc={fp:08x}"
        ));
        shared.bump(|s| s.skipped += 1);
        shared.push_outcome(
            port,
            "up-to-date",
            "fingerprint unchanged and package present".to_string(),
            "",
            Duration::ZERO,
        );
        return FeederDecision::Counted;
    }

    FeederDecision::Enqueue
}

/// Account for every port the dispatcher never finalized; runs after the
/// workers have joined, so terminal flags are settled.
fn final_accounting(shared: &Arc<Shared>, dispatched: &HashSet<String>, counted: &mut HashSet<String>) {
    for port in &shared.plan.order {
        let key = port.id.key();
        if counted.contains(&key) {
            continue;
        }
        counted.insert(key.clone());
        if dispatched.contains(&key) && shared.states.is_terminal(&port.id) {
            // The worker that finished it already accounted for it.
            continue;
        }
        let reason = if shared.cancel.is_cancelled() {
            "cancelled before the port could build".to_string()
        } else {
            "scheduler ended before the port became ready".to_string()
        };
        shared.bump(|s| s.skipped += 1);
        shared.push_outcome(port, "skipped", reason, "", Duration::ZERO);
    }
}

fn worker_main(shared: Arc<Shared>, rx: Arc<Mutex<Receiver<Arc<Port>>>>, worker_id: u32) {
    let _guard = ActiveGuard(Arc::clone(&shared));
    let scoped = ScopedLogger::new(Arc::clone(&shared.logger), Some(worker_id), None);

    let env = match env::create(&shared.cfg.env_backend, worker_id, &shared.cfg) {
        Ok(env) => env,
        Err(err) => {
            scoped.error(&format!("phase=worker status=create-failed reason={err}"));
            shared.set_fatal(err);
            return;
        }
    };
    let slot = Arc::new(EnvSlot {
        env: Mutex::new(env),
    });
    if let Ok(mut envs) = shared.envs.lock() {
        envs.push(Arc::clone(&slot));
    }
    {
        let Ok(mut env) = slot.env.lock() else {
            return;
        };
        if let Err(err) = env.setup(&scoped) {
            scoped.error(&format!("phase=worker status=setup-failed reason={err}"));
            shared.set_fatal(err);
            return;
        }
    }

    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        let received = {
            let Ok(rx) = rx.lock() else {
                break;
            };
            rx.recv_timeout(QUEUE_POLL)
        };
        match received {
            Ok(port) => build_port(&shared, &slot, worker_id, &port),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn make_phase_spec(port: &Port, phase: &str) -> ExecSpec {
    let mut spec = ExecSpec::new("make")
        .arg("-C")
        .arg(format!("/xports/{}", port.id.origin()));
    if let Some(flavor) = &port.id.flavor {
        spec = spec.arg(format!("FLAVOR={flavor}"));
    }
    spec.arg(phase)
        .arg("BATCH=yes")
        .arg("PORTSDIR=/xports")
        .arg("WRKDIRPREFIX=/construction")
        .arg("DISTDIR=/distfiles")
        .arg("PACKAGES=/packages")
        .arg("PKG_DBDIR=/var/db/pkg")
}

/// Every transitive prerequisite of `id`, keyed for set membership.
fn transitive_prereqs(plan: &BuildPlan, id: &PortId) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut queue: Vec<PortId> = plan
        .graph
        .depends_on(id)
        .iter()
        .map(|edge| edge.to.clone())
        .collect();
    while let Some(next) = queue.pop() {
        if !seen.insert(next.key()) {
            continue;
        }
        queue.extend(plan.graph.depends_on(&next).iter().map(|e| e.to.clone()));
    }
    seen
}

/// `pkg add` every already-built prerequisite package into the chroot.
/// A non-zero exit fails the port unless the package turns out to already
/// be installed.
fn install_packages(
    shared: &Arc<Shared>,
    slot: &Arc<EnvSlot>,
    port: &Port,
    scoped: &dyn Logger,
) -> Result<(), String> {
    let prereqs = transitive_prereqs(&shared.plan, &port.id);
    for dep in &shared.plan.order {
        if !prereqs.contains(&dep.id.key()) {
            continue;
        }
        // pkg itself comes in with the Template, not via pkg add.
        if shared.states.has_flags(&dep.id, PortFlags::PKG_PKG) {
            continue;
        }
        if !shared
            .states
            .has_flags(&dep.id, PortFlags::SUCCESS | PortFlags::PACKAGED)
        {
            continue;
        }
        shared.states.set_last_phase(&port.id, "install-pkgs");
        let spec = ExecSpec::new("pkg")
            .arg("add")
            .arg(format!("/packages/All/{}", dep.pkg_file));
        let result = {
            let env = slot.env.lock().map_err(|_| "environment lock poisoned")?;
            env.execute(&shared.cancel, &spec, scoped)
        };
        match result {
            Ok(res) if res.exit_code == 0 => {}
            Ok(res) => {
                let probe = ExecSpec::new("pkg").arg("info").arg("-e").arg(&dep.id.name);
                let installed = {
                    let env = slot.env.lock().map_err(|_| "environment lock poisoned")?;
                    env.execute(&shared.cancel, &probe, scoped)
                };
                match installed {
                    Ok(info) if info.exit_code == 0 => {
                        scoped.debug(&format!(
                            "phase=install-pkgs status=already-installed pkg={}",
                            dep.pkg_file
                        ));
                    }
                    _ => {
                        return Err(format!(
                            "pkg add {} exited with {}",
                            dep.pkg_file, res.exit_code
                        ));
                    }
                }
            }
            Err(err) => return Err(format!("pkg add {}: {err}", dep.pkg_file)),
        }
    }
    Ok(())
}

fn run_phase_sequence(
    shared: &Arc<Shared>,
    slot: &Arc<EnvSlot>,
    port: &Port,
    scoped: &dyn Logger,
    install_prereqs: bool,
) -> Result<(), String> {
    if install_prereqs {
        install_packages(shared, slot, port, scoped)?;
    }
    let mut phases: Vec<&str> = BUILD_PHASES.to_vec();
    if shared.cfg.check_plist {
        let at = phases.iter().position(|p| *p == "package").unwrap_or(0);
        phases.insert(at, "check-plist");
    }
    for phase in phases {
        if shared.cancel.is_cancelled() {
            return Err(shared.cancel.err("build phases").to_string());
        }
        shared.states.set_last_phase(&port.id, phase);
        scoped.info(&format!(
            "phase={phase} status=started port={}",
            port.id
        ));
        let spec = make_phase_spec(port, phase);
        let result = {
            let env = slot.env.lock().map_err(|_| "environment lock poisoned")?;
            env.execute(&shared.cancel, &spec, scoped)
        };
        match result {
            Ok(res) if res.exit_code == 0 => {}
            Ok(res) => return Err(format!("phase {phase} exited with {}", res.exit_code)),
            Err(err) => return Err(format!("phase {phase}: {err}")),
        }
    }
    Ok(())
}

fn build_port(shared: &Arc<Shared>, slot: &Arc<EnvSlot>, worker_id: u32, port: &Arc<Port>) {
    let started = Instant::now();
    let origin = port.id.origin();
    let build_uuid = Uuid::new_v4().to_string();
    let scoped = ScopedLogger::new(
        Arc::clone(&shared.logger),
        Some(worker_id),
        Some(&build_uuid),
    );

    let rec = BuildRecord::running(build_uuid.clone(), &origin, &port.version);
    if let Err(err) = shared.db.save_record(&rec) {
        scoped.warn(&format!("phase=build status=record-failed reason={err}"));
    }
    shared.states.add_flags(&port.id, PortFlags::RUNNING);
    scoped.info(&format!("phase=build status=started port={}", port.id));

    let result = run_phase_sequence(shared, slot, port, &scoped, true);
    match result {
        Ok(()) => {
            let pkg_path = shared.cfg.packages_all().join(&port.pkg_file);
            if pkg_path.is_file() {
                finish_success(shared, port, &build_uuid, &scoped, started);
            } else {
                finish_failed(
                    shared,
                    port,
                    &build_uuid,
                    &scoped,
                    format!("package file {} missing after build", pkg_path.display()),
                    started,
                );
            }
        }
        Err(reason) => finish_failed(shared, port, &build_uuid, &scoped, reason, started),
    }
}

fn finish_success(
    shared: &Arc<Shared>,
    port: &Arc<Port>,
    build_uuid: &str,
    scoped: &dyn Logger,
    started: Instant,
) {
    let origin = port.id.origin();
    // The port really did build; a stale index is logged, never fatal.
    if let Err(err) = shared
        .db
        .update_record_status(build_uuid, BuildStatus::Success, Utc::now())
    {
        scoped.warn(&format!("phase=build status=record-failed reason={err}"));
    }
    match shared
        .db
        .compute_port_crc(&shared.cfg, &origin, &shared.cancel)
    {
        Ok(fp) => {
            if let Err(err) = shared.db.update_crc(&origin, fp) {
                scoped.warn(&format!("phase=build status=crc-failed reason={err}"));
            }
        }
        Err(err) => {
            scoped.warn(&format!("phase=build status=crc-failed reason={err}"));
        }
    }
    if let Err(err) = shared
        .db
        .update_package_index(&origin, &port.version, build_uuid)
    {
        scoped.warn(&format!("phase=build status=index-failed reason={err}"));
    }

    shared.states.clear_flags(&port.id, PortFlags::RUNNING);
    shared
        .states
        .add_flags(&port.id, PortFlags::SUCCESS | PortFlags::PACKAGED);
    shared.bump(|s| s.success += 1);
    shared.push_outcome(port, "success", String::new(), build_uuid, started.elapsed());
    scoped.success(&format!(
        "port={} version={} elapsed_ms={}",
        port.id,
        port.version,
        started.elapsed().as_millis()
    ));
}

fn finish_failed(
    shared: &Arc<Shared>,
    port: &Arc<Port>,
    build_uuid: &str,
    scoped: &dyn Logger,
    reason: String,
    started: Instant,
) {
    if let Err(err) = shared
        .db
        .update_record_status(build_uuid, BuildStatus::Failed, Utc::now())
    {
        scoped.warn(&format!("phase=build status=record-failed reason={err}"));
    }
    shared.states.clear_flags(&port.id, PortFlags::RUNNING);
    shared.states.add_flags(&port.id, PortFlags::FAILED);
    shared.bump(|s| s.failed += 1);
    shared.push_outcome(port, "failed", reason.clone(), build_uuid, started.elapsed());
    scoped.error(&format!(
        "phase=build status=failed port={} last_phase={} reason={reason}",
        port.id,
        shared.states.last_phase(&port.id)
    ));
    skip_dependents(shared, &port.id);
}

/// Mark every transitive dependent of a failed port as skipped. The
/// dispatcher counts them when it next scans.
fn skip_dependents(shared: &Arc<Shared>, failed: &PortId) {
    let mut visited = HashSet::new();
    let mut queue: Vec<PortId> = shared
        .plan
        .graph
        .dependents(failed)
        .iter()
        .map(|edge| edge.from.clone())
        .collect();
    while let Some(next) = queue.pop() {
        if !visited.insert(next.key()) {
            continue;
        }
        if shared.states.is_terminal(&next) {
            continue;
        }
        shared
            .states
            .add_flags(&next, PortFlags::SKIPPED | PortFlags::NO_BUILD_IGNORE);
        shared.logger.info(&format!(
            "phase=build status=skip-propagated port={next} cause={failed}"
        ));
        queue.extend(
            shared
                .plan
                .graph
                .dependents(&next)
                .iter()
                .map(|edge| edge.from.clone()),
        );
    }
}

/// Build `ports-mgmt/pkg` synchronously on the reserved slot before any
/// worker starts, and install the result into the Template. Failure aborts
/// the whole run.
fn bootstrap_pkg(shared: &Arc<Shared>, port: &Arc<Port>) -> Result<(), Error> {
    let cfg = &shared.cfg;
    let origin = port.id.origin();

    let current_fp = shared
        .db
        .compute_port_crc(cfg, &origin, &shared.cancel)
        .ok();
    if let Some(fp) = current_fp
        && !shared.db.needs_build(&origin, fp)
        && template::has_pkg(cfg)
    {
        shared
            .states
            .add_flags(&port.id, PortFlags::SUCCESS | PortFlags::PACKAGED);
        shared.bump(|s| s.skipped += 1);
        shared.push_outcome(
            port,
            "up-to-date",
            "pkg fingerprint unchanged and template binary present".to_string(),
            "",
            Duration::ZERO,
        );
        shared.logger.info("phase=bootstrap status=up-to-date port=ports-mgmt/pkg");
        return Ok(());
    }

    shared
        .logger
        .info("phase=bootstrap status=started port=ports-mgmt/pkg");
    let started = Instant::now();
    let env = env::create(&cfg.env_backend, BOOTSTRAP_WORKER_ID, cfg)?;
    let slot = Arc::new(EnvSlot {
        env: Mutex::new(env),
    });
    if let Ok(mut envs) = shared.envs.lock() {
        envs.push(Arc::clone(&slot));
    }
    {
        let mut env = slot
            .env
            .lock()
            .map_err(|_| Error::Validation("environment lock poisoned".to_string()))?;
        let scoped = ScopedLogger::new(Arc::clone(&shared.logger), Some(BOOTSTRAP_WORKER_ID), None);
        env.setup(&scoped)?;
    }

    let build_uuid = Uuid::new_v4().to_string();
    let scoped = ScopedLogger::new(
        Arc::clone(&shared.logger),
        Some(BOOTSTRAP_WORKER_ID),
        Some(&build_uuid),
    );
    let rec = BuildRecord::running(build_uuid.clone(), &origin, &port.version);
    if let Err(err) = shared.db.save_record(&rec) {
        scoped.warn(&format!("phase=bootstrap status=record-failed reason={err}"));
    }
    shared.states.add_flags(&port.id, PortFlags::RUNNING);

    let result = run_phase_sequence(shared, &slot, port, &scoped, false);
    let outcome = match result {
        Ok(()) => {
            let pkg_path = cfg.packages_all().join(&port.pkg_file);
            if pkg_path.is_file() {
                Ok(())
            } else {
                Err(format!("package file {} missing after build", pkg_path.display()))
            }
        }
        Err(reason) => Err(reason),
    };

    match outcome {
        Ok(()) => {
            finish_success(shared, port, &build_uuid, &scoped, started);
            template::install_pkg(cfg, &port.pkg_file, &scoped).map_err(|err| {
                Error::BootstrapFailed(format!("installing pkg into template: {err}"))
            })?;
            cleanup_slot(shared, &slot);
            Ok(())
        }
        Err(reason) => {
            finish_failed(shared, port, &build_uuid, &scoped, reason.clone(), started);
            cleanup_slot(shared, &slot);
            Err(Error::BootstrapFailed(reason))
        }
    }
}

fn cleanup_slot(shared: &Arc<Shared>, slot: &Arc<EnvSlot>) {
    if let Ok(env) = slot.env.lock()
        && let Err(err) = env.cleanup(shared.logger.as_ref())
    {
        shared.logger.warn(&format!(
            "phase=bootstrap status=cleanup-failed reason={err}"
        ));
    }
}
