//! C8 — Build Driver: assembles the immutable plan and shared mutable
//! state, spawns one state-machine task per package, awaits quiescence,
//! and aggregates the final report (spec §4.8).
//!
//! Grounded on `orchestrator.rs`'s `PipelineOrchestrator::execute_job`
//! top-level shape (construct context, spawn tasks, await quiescence,
//! aggregate) and `dag.rs`'s validate-before-run style.

use crate::config::BuildConfig;
use crate::error::BuildException;
use crate::gate::LibReadyLatch;
use crate::governor::Governor;
use crate::haddock::HaddockStore;
use crate::ledger::Ledger;
use crate::package::{run_package, PackageContext};
use crate::package_db::PackageDb;
use crate::plan::BuildPlan;
use crate::toolchain::Toolchain;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

/// Runs every package in `plan` to completion and returns the collected
/// warnings, or a `BuildException` aggregating per-package failures
/// (spec §4.8 steps 1-8).
pub async fn perform_build(
    plan: BuildPlan,
    config: BuildConfig,
    toolchain: Arc<dyn Toolchain>,
) -> Result<Vec<String>, BuildException> {
    let config = config
        .validated()
        .await
        .map_err(|e| single_error("config", e))?;

    if tokio::fs::metadata(&config.log_dir).await.is_ok() {
        let _ = tokio::fs::remove_dir_all(&config.log_dir).await;
    }
    tokio::fs::create_dir_all(&config.log_dir)
        .await
        .map_err(|e| single_error("log_dir", e.into()))?;

    let package_db = PackageDb::init(&config, toolchain.as_ref())
        .await
        .map_err(|e| single_error("pkgdb", e.into()))?;

    let plan = Arc::new(plan);
    let config = Arc::new(config);
    let ledger = Ledger::new(crate::ledger::root_dir(&config.install_dest));
    let governor = Governor::new(config.jobs);
    let haddock_store = Arc::new(HaddockStore::new());

    let latches: HashMap<String, LibReadyLatch> = plan
        .packages
        .keys()
        .map(|name| (name.clone(), LibReadyLatch::new()))
        .collect();

    let ctx = Arc::new(PackageContext {
        plan: plan.clone(),
        config,
        toolchain,
        ledger,
        package_db: Arc::new(package_db),
        haddock_store,
        governor,
        latches: Arc::new(latches),
        tool_providers: Arc::new(plan.tool_providers()),
        errors: Arc::new(AsyncMutex::new(HashMap::new())),
        warnings: Arc::new(AsyncMutex::new(Vec::new())),
    });

    info!(package_count = plan.packages.len(), "spawning package tasks");
    let mut tasks = Vec::with_capacity(plan.packages.len());
    for name in plan.packages.keys() {
        let ctx = ctx.clone();
        let name = name.clone();
        tasks.push(tokio::spawn(run_package(ctx, name)));
    }
    for t in tasks {
        let _ = t.await;
    }

    ctx.governor.active.wait_for_zero().await;

    let errors = ctx.errors.lock().await.clone();
    let warnings = ctx.warnings.lock().await.clone();
    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(BuildException { errors, warnings })
    }
}

fn single_error(key: &str, e: crate::error::BuildError) -> BuildException {
    let mut errors = HashMap::new();
    errors.insert(key.to_string(), e.truncated_display());
    BuildException {
        errors,
        warnings: Vec::new(),
    }
}

