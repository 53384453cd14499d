mod build_lock;
mod builder;
mod cancel;
mod cli;
mod config;
mod db;
mod env;
mod error;
mod fingerprint;
mod graph;
mod logger;
mod port;
mod reports;
mod resolver;

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

fn main() -> ExitCode {
    // Helper mode is selected from argv before any other initialization;
    // the helper must behave as an opaque standalone program.
    let args: Vec<String> = std::env::args().collect();
    if env::helper::is_helper_invocation(&args) {
        let code = env::helper::run(&args);
        return ExitCode::from(code.clamp(0, 255) as u8);
    }

    let cli = cli::Cli::parse();
    match cli.command {
        cli::Command::Build(args) => match run_build_command(&args) {
            Ok(stats) => {
                println!(
                    "build total={} success={} failed={} skipped={} ignored={} elapsed={:.1}s",
                    stats.total,
                    stats.success,
                    stats.failed,
                    stats.skipped,
                    stats.ignored,
                    stats.duration.as_secs_f64()
                );
                if stats.failed > 0 {
                    ExitCode::FAILURE
                } else {
                    ExitCode::SUCCESS
                }
            }
            Err(err) => {
                eprintln!("build failed: {err:#}");
                ExitCode::FAILURE
            }
        },
        cli::Command::Latest(args) => match run_latest_command(&args) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("latest lookup failed: {err:#}");
                ExitCode::FAILURE
            }
        },
    }
}

fn run_build_command(args: &cli::BuildArgs) -> Result<builder::BuildStats> {
    let cfg = args.to_config();
    let logger: Arc<dyn logger::Logger> = Arc::new(logger::TermLogger {
        verbose: args.verbose,
    });

    let _session = build_lock::BuildSessionGuard::acquire(&cfg.build_base, &args.specs)?;

    let cancel = cancel::CancelToken::new();
    let cleanup_slot: Arc<Mutex<Option<builder::CleanupHandle>>> = Arc::new(Mutex::new(None));
    {
        let cancel = cancel.clone();
        let cleanup_slot = Arc::clone(&cleanup_slot);
        ctrlc::set_handler(move || {
            cancel.cancel("interrupted by signal");
            if let Ok(mut slot) = cleanup_slot.lock()
                && let Some(handle) = slot.take()
            {
                handle.run();
            }
        })
        .context("installing signal handler")?;
    }

    let registry = port::PortRegistry::new();
    let states = Arc::new(port::BuildStateRegistry::new());
    let resolver = resolver::Resolver::new(Arc::new(resolver::MakeQuerier), cfg.max_workers)?;

    let outcome =
        resolver.resolve_specs(&cancel, &cfg, &args.specs, &registry, &states, logger.as_ref())?;
    for failure in &outcome.failures {
        logger.warn(&format!(
            "phase=resolve status=spec-failed spec={} reason={}",
            failure.spec, failure.error
        ));
    }
    graph::resolve_closure(
        &cancel,
        &cfg,
        &resolver,
        &outcome.ports,
        &registry,
        &states,
        logger.as_ref(),
    )?;
    let dep_graph = graph::link_graph(&cfg, &registry, &states, logger.as_ref());
    let order = graph::topo_order(&dep_graph, &registry, graph::OrderMode::Strict)?;
    let plan = builder::BuildPlan {
        order,
        graph: dep_graph,
    };

    env::template::populate(&cfg, logger.as_ref())?;

    let db = Arc::new(db::BuildDb::open(&cfg.db_path)?);
    let stats = builder::run_build(
        &cancel,
        plan,
        &cfg,
        Arc::clone(&db),
        states,
        logger,
        |handle| {
            if let Ok(mut slot) = cleanup_slot.lock() {
                *slot = Some(handle);
            }
        },
    )?;
    db.close();
    Ok(stats)
}

fn run_latest_command(args: &cli::LatestArgs) -> Result<()> {
    let id = port::PortId::parse(&args.spec, &args.dports)?;
    let db = db::BuildDb::open(&args.effective_db())?;
    let rec = db.latest_for(&id.origin(), args.version.as_deref().unwrap_or(""))?;
    println!(
        "uuid={} portdir={} version={} status={} started={} finished={}",
        rec.uuid,
        rec.portdir,
        rec.version,
        rec.status,
        rec.started_at.to_rfc3339(),
        rec.finished_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    );
    db.close();
    Ok(())
}
