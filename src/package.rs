//! C7 — Per-Package State Machine: drives one package through
//! unpack/configure/build/register/haddock/test/bench with correct
//! gating, skip, and failure rules (spec §4.7).
//!
//! Grounded on `orchestrator.rs`'s `execute_stage`/`run_dag` control flow
//! (lazy per-node execution, checkpoint-then-continue, error
//! classification) and `job.rs`'s state machine transitions, generalised
//! from a fixed 4-stage pipeline to this seven-stage sequence.

use crate::config::BuildConfig;
use crate::error::{BuildError, Result};
use crate::gate::{DependencyGate, LibReadyLatch};
use crate::governor::Governor;
use crate::haddock::HaddockStore;
use crate::ledger::{should_rerun, Ledger, Stage};
use crate::package_db::PackageDb;
use crate::plan::{BuildPlan, Component, TestState};
use crate::toolchain::{configure_args, Toolchain};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};

const TEST_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Everything a package task needs, shared across every task the driver
/// spawns (spec §3 "shared state").
pub struct PackageContext {
    pub plan: Arc<BuildPlan>,
    pub config: Arc<BuildConfig>,
    pub toolchain: Arc<dyn Toolchain>,
    pub ledger: Ledger,
    pub package_db: Arc<PackageDb>,
    pub haddock_store: Arc<HaddockStore>,
    pub governor: Governor,
    pub latches: Arc<HashMap<String, LibReadyLatch>>,
    pub tool_providers: Arc<HashMap<String, Vec<String>>>,
    pub errors: Arc<AsyncMutex<HashMap<String, String>>>,
    pub warnings: Arc<AsyncMutex<Vec<String>>>,
}

/// Finaliser: publishes `libReady=false` if no stage already published a
/// value, mirroring the teacher's try/finally wrapper around task entry
/// (spec §4.7 "Entry").
struct LibReadyGuard<'a> {
    latch: &'a LibReadyLatch,
}

impl Drop for LibReadyGuard<'_> {
    fn drop(&mut self) {
        if self.latch.snapshot().is_none() {
            self.latch.publish(false);
        }
    }
}

/// Runs the whole state machine for one package. Never propagates an
/// error to the caller: failures are recorded into `ctx.errors` and the
/// function returns, matching "the driver never re-throws mid-run"
/// (spec §7c).
#[instrument(skip(ctx), fields(package = %name))]
pub async fn run_package(ctx: Arc<PackageContext>, name: String) {
    let _active = ctx.governor.active.enter().await;

    let latch = match ctx.latches.get(&name) {
        Some(l) => l.clone(),
        None => return,
    };
    let _guard = LibReadyGuard { latch: &latch };

    if ctx.config.no_rebuild_cabal && name == "Cabal" {
        info!("skipping rebuild of Cabal itself");
        latch.publish(true);
        return;
    }

    if let Err(e) = drive(&ctx, &name, &latch).await {
        warn!(error = %e, "package task failed");
        ctx.errors
            .lock()
            .await
            .insert(name.clone(), e.truncated_display());
    }
}

async fn drive(ctx: &Arc<PackageContext>, name: &str, latch: &LibReadyLatch) -> Result<()> {
    let pkg = ctx
        .plan
        .packages
        .get(name)
        .ok_or_else(|| BuildError::Config(format!("{name} not in plan")))?
        .clone();
    let id = pkg.package_id(name);

    let lib_components: HashSet<Component> =
        [Component::Library, Component::Executable].into_iter().collect();
    let tool_providers = ctx.tool_providers.clone();
    let latches = ctx.latches.clone();

    if pkg.constraints.skip_build {
        info!(package = %id, "skipBuild set, never publishing libReady");
        return Ok(());
    }

    // UNPACK + CONFIGURE (lazy in spec terms; both run once, unconditionally,
    // on first demand — there is only one demand point in this sequential task).
    let gate = DependencyGate::new(&ctx.plan, &latches, &tool_providers);
    gate.wait(name, &lib_components, ctx.config.tool_missing_policy)
        .await?;

    let work_dir = unpack(ctx, name, &pkg).await?;

    let cfg_args = configure_args(
        &ctx.config,
        &id,
        &pkg.constraints.flag_overrides,
        pkg.constraints.enable_lib_profile,
        false,
        false,
        &pkg.constraints.configure_args,
    );
    run_tool(ctx, &id, "configure", &work_dir, "Setup", "configure", cfg_args).await?;

    // BUILD
    let prev = ctx.ledger.get(Stage::Build, &id).await;
    let need_build =
        prev != crate::ledger::LedgerEntry::Success || (pkg.has_library && !ctx.package_db.is_registered(name));
    if prev == crate::ledger::LedgerEntry::Success && pkg.has_library && !ctx.package_db.is_registered(name) {
        ctx.warnings.lock().await.push(format!(
            "{id}: ledger says Build=success but package is not registered; rebuilding"
        ));
    }

    if need_build {
        ctx.ledger.clear_all(&id).await?;
        run_tool(ctx, &id, "build", &work_dir, "Setup", "build", vec![]).await?;
        run_tool(ctx, &id, "copy", &work_dir, "Setup", "copy", vec![]).await?;
        {
            let _reg = ctx.governor.register_lock().await;
            run_tool(ctx, &id, "register", &work_dir, "Setup", "register", vec![]).await?;
        }
        ctx.ledger.put(Stage::Build, &id, true).await?;
        ctx.package_db.mark_registered(name);
    }

    // Publish libReady before the post-build stages so downstream library
    // consumers proceed in parallel with haddock/test/bench (spec §4.7).
    latch.publish(true);

    if ctx.config.build_haddock
        && should_rerun(ctx.ledger.get(Stage::Haddock, &id).await, pkg.constraints.haddocks)
        && pkg.has_modules
    {
        let outcome = run_haddock(ctx, name, &id, &pkg, &work_dir).await;
        apply_policy(ctx, &id, "haddock", pkg.constraints.haddocks, outcome).await?;
    }

    if ctx.config.build_tests && should_rerun(ctx.ledger.get(Stage::Test, &id).await, pkg.constraints.tests) {
        let test_required: HashSet<Component> = [Component::Library, Component::Executable, Component::TestSuite]
            .into_iter()
            .collect();
        gate.wait(name, &test_required, ctx.config.tool_missing_policy).await?;
        let outcome = run_tests(ctx, &id, &pkg, &work_dir).await;
        apply_policy(ctx, &id, "test", pkg.constraints.tests, outcome).await?;
    }

    if ctx.config.build_benchmarks
        && should_rerun(ctx.ledger.get(Stage::Bench, &id).await, pkg.constraints.benches)
    {
        let bench_required: HashSet<Component> = [Component::Library, Component::Executable, Component::Benchmark]
            .into_iter()
            .collect();
        gate.wait(name, &bench_required, ctx.config.tool_missing_policy).await?;
        let outcome = run_bench(ctx, &id, &pkg, &work_dir).await;
        apply_policy(ctx, &id, "bench", pkg.constraints.benches, outcome).await?;
    }

    Ok(())
}

/// UNPACK (spec §4.7): fetch or clone the source, synthesise `Setup.hs`
/// for `build-type: Simple` packages. Archive extraction and HTTP fetch
/// are external collaborators (spec §1 Out of scope); this invokes the
/// conventional external commands for them rather than implementing the
/// transfer itself.
async fn unpack(
    ctx: &Arc<PackageContext>,
    name: &str,
    pkg: &crate::plan::PackagePlan,
) -> Result<PathBuf> {
    let id = pkg.package_id(name);
    let work_dir = ctx.config.install_dest.join("build").join(&id);
    tokio::fs::create_dir_all(&work_dir).await?;

    let argv = if name == "Cabal" && ctx.config.cabal_from_head {
        vec![
            "git".to_string(),
            "clone".to_string(),
            "https://github.com/haskell/cabal".to_string(),
            ".".to_string(),
        ]
    } else if let Some(url) = &pkg.source_url {
        vec!["fetch-and-untar".to_string(), url.clone()]
    } else {
        vec!["cabal-unpack".to_string(), name.to_string(), pkg.version.clone()]
    };

    let env = ctx.env_for(&work_dir);
    {
        let _job = ctx.governor.acquire_job().await;
        ctx.toolchain
            .run(&id, "unpack", &work_dir, &argv, &env, None)
            .await?;
    }

    if pkg.build_type_simple {
        let setup_lhs = work_dir.join("Setup.lhs");
        if tokio::fs::metadata(&setup_lhs).await.is_ok() {
            tokio::fs::remove_file(&setup_lhs).await?;
        }
        tokio::fs::write(
            work_dir.join("Setup.hs"),
            "import Distribution.Simple\nmain = defaultMain\n",
        )
        .await?;
    }

    if ctx.config.allow_newer {
        let _job = ctx.governor.acquire_job().await;
        ctx.toolchain
            .run(&id, "unpack", &work_dir, &["allow-newer-rewrite".to_string()], &env, None)
            .await?;
    }

    Ok(work_dir)
}

async fn run_tool(
    ctx: &Arc<PackageContext>,
    id: &str,
    stage_log_name: &str,
    cwd: &std::path::Path,
    program: &str,
    sub: &str,
    mut extra: Vec<String>,
) -> Result<()> {
    let mut argv = crate::toolchain::runghc_args(
        &ctx.config,
        vec![program.to_string(), sub.to_string()],
    );
    argv.append(&mut extra);
    let env = ctx.env_for(cwd);
    let _job = ctx.governor.acquire_job().await;
    ctx.toolchain.run(id, stage_log_name, cwd, &argv, &env, None).await
}

async fn run_haddock(
    ctx: &Arc<PackageContext>,
    name: &str,
    id: &str,
    pkg: &crate::plan::PackagePlan,
    work_dir: &std::path::Path,
) -> Result<()> {
    let closure = ctx.haddock_store.closure(&ctx.plan, name).await;
    let mut argv = crate::toolchain::runghc_args(&ctx.config, vec!["Setup".to_string(), "haddock".to_string()]);
    argv.push("--html".to_string());
    argv.push(format!("--html-location=../{id}/"));
    if ctx.config.build_hoogle {
        argv.push("--hoogle".to_string());
    }
    argv.extend(ctx.haddock_store.read_interface_args(&closure));

    run_tool_argv(ctx, id, "haddock", work_dir, argv).await?;

    let produced = work_dir.join("dist/doc/html").join(name);
    let dest = ctx.config.doc_dir(id);
    if tokio::fs::metadata(&produced).await.is_ok() {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let _ = tokio::fs::remove_dir_all(&dest).await;
        tokio::fs::rename(&produced, &dest).await?;
    }
    let haddock_file = dest.join(format!("{name}.haddock"));
    if tokio::fs::metadata(&haddock_file).await.is_ok() {
        let canonical = tokio::fs::canonicalize(&haddock_file).await?;
        ctx.haddock_store.record_interface(id, canonical);
    }
    ctx.ledger.put(Stage::Haddock, id, true).await?;
    let _ = pkg;
    Ok(())
}

/// Reconfigure with tests enabled (spec §4.7 "required because the prior
/// configure disabled them"): a real `configure_args` invocation, not a
/// bare `--enable-tests`, so install dirs/`--package-db`/flags set by the
/// initial configure are not reset to defaults.
async fn run_tests(
    ctx: &Arc<PackageContext>,
    id: &str,
    pkg: &crate::plan::PackagePlan,
    work_dir: &std::path::Path,
) -> Result<()> {
    let cfg_args = configure_args(
        &ctx.config,
        id,
        &pkg.constraints.flag_overrides,
        pkg.constraints.enable_lib_profile,
        true,
        false,
        &pkg.constraints.configure_args,
    );
    run_tool(ctx, id, "test", work_dir, "Setup", "configure", cfg_args).await?;
    run_tool(ctx, id, "test", work_dir, "Setup", "build", vec![]).await?;

    let bin = work_dir.join("dist/build").join(id).join(id);
    if tokio::fs::metadata(&bin).await.is_err() {
        info!(%id, "test suite binary not built, skipping execution");
        ctx.ledger.put(Stage::Test, id, true).await?;
        return Ok(());
    }

    let env = ctx.env_for(work_dir);
    let result = {
        let _job = ctx.governor.acquire_job().await;
        ctx.toolchain
            .run(
                id,
                "test",
                work_dir,
                &[bin.display().to_string()],
                &env,
                Some(TEST_TIMEOUT),
            )
            .await
    };
    ctx.ledger.put(Stage::Test, id, result.is_ok()).await?;
    result
}

/// Reconfigure with benchmarks enabled, same rationale as `run_tests`.
async fn run_bench(
    ctx: &Arc<PackageContext>,
    id: &str,
    pkg: &crate::plan::PackagePlan,
    work_dir: &std::path::Path,
) -> Result<()> {
    let cfg_args = configure_args(
        &ctx.config,
        id,
        &pkg.constraints.flag_overrides,
        pkg.constraints.enable_lib_profile,
        false,
        true,
        &pkg.constraints.configure_args,
    );
    let result = run_tool(ctx, id, "bench", work_dir, "Setup", "configure", cfg_args).await;
    let result = if result.is_ok() {
        run_tool(ctx, id, "bench", work_dir, "Setup", "build", vec![]).await
    } else {
        result
    };
    ctx.ledger.put(Stage::Bench, id, result.is_ok()).await?;
    result
}

async fn run_tool_argv(
    ctx: &Arc<PackageContext>,
    id: &str,
    stage_log_name: &str,
    cwd: &std::path::Path,
    argv: Vec<String>,
) -> Result<()> {
    let env = ctx.env_for(cwd);
    let _job = ctx.governor.acquire_job().await;
    ctx.toolchain.run(id, stage_log_name, cwd, &argv, &env, None).await
}

/// Applies the `TestState` vs. actual-outcome policy (spec §7b).
async fn apply_policy(
    ctx: &Arc<PackageContext>,
    id: &str,
    stage: &str,
    expected: TestState,
    outcome: Result<()>,
) -> Result<()> {
    match (expected, outcome) {
        (TestState::ExpectSuccess, Err(e)) => Err(e),
        (TestState::ExpectFailure, Ok(())) => {
            ctx.warnings
                .lock()
                .await
                .push(format!("{id}: unexpected {stage} success"));
            Ok(())
        }
        _ => Ok(()),
    }
}

impl PackageContext {
    fn env_for(&self, _cwd: &std::path::Path) -> Vec<(String, String)> {
        let local_db = match &self.config.db_mode {
            crate::config::DbMode::Local(p) => Some(p.as_path()),
            crate::config::DbMode::Global => None,
        };
        crate::config::filter_env(
            std::env::vars(),
            &self.config.env_deny_list,
            &self.config.bin_dir(),
            local_db,
        )
    }
}
