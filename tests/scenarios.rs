//! Integration tests exercising the full driver against a fake toolchain
//! that records invocations instead of spawning real processes
//! (SPEC_FULL.md §8), covering the numbered scenarios of spec §8.

use async_trait::async_trait;
use curator_build::{
    perform_build, BuildConfig, BuildPlan, Component, Dependency, PackageConstraints, PackagePlan,
    TestState, Toolchain, ToolMissingPolicy,
};
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct FakeToolchain {
    calls: DashMap<String, Vec<Vec<String>>>,
    fail_build: Vec<String>,
}

#[async_trait]
impl Toolchain for FakeToolchain {
    async fn run(
        &self,
        package_id: &str,
        stage_log_name: &str,
        _cwd: &Path,
        argv: &[String],
        _env: &[(String, String)],
        _timeout: Option<Duration>,
    ) -> curator_build::Result<()> {
        self.calls
            .entry(package_id.to_string())
            .or_default()
            .push(argv.to_vec());

        let base = package_id.rsplit_once('-').map(|(n, _)| n).unwrap_or(package_id);
        if stage_log_name == "build"
            && argv.iter().any(|a| a == "build")
            && self.fail_build.iter().any(|n| n == base)
        {
            return Err(curator_build::BuildError::ProcessFailed("Setup build".into(), 1));
        }
        Ok(())
    }
}

fn simple_pkg(deps: Vec<Dependency>) -> PackagePlan {
    PackagePlan {
        version: "1.0".to_string(),
        description: String::new(),
        has_library: true,
        has_modules: true,
        build_type_simple: true,
        dependencies: deps,
        constraints: PackageConstraints::default(),
        source_url: None,
    }
}

fn dep(name: &str) -> Dependency {
    Dependency {
        name: name.to_string(),
        consuming: [Component::Library].into_iter().collect(),
        is_tool: false,
    }
}

fn base_config(tmp: &Path) -> BuildConfig {
    let mut cfg = BuildConfig::new(tmp.join("install"), tmp.join("logs"));
    cfg.build_haddock = false;
    cfg.tool_missing_policy = ToolMissingPolicy::Silent;
    cfg
}

/// Scenario 1: B depends on A; both build successfully.
#[tokio::test]
async fn dependency_chain_succeeds() {
    let tmp = tempfile::tempdir().unwrap();
    let mut plan = BuildPlan::default();
    plan.packages.insert("a".to_string(), simple_pkg(vec![]));
    plan.packages.insert("b".to_string(), simple_pkg(vec![dep("a")]));

    let toolchain = Arc::new(FakeToolchain::default());
    let result = perform_build(plan, base_config(tmp.path()), toolchain).await;
    assert!(result.is_ok(), "{:?}", result.err());
}

/// Scenario 2: A's build fails; B (depends on A) fails with `DependencyFailed`.
#[tokio::test]
async fn dependency_failure_cascades() {
    let tmp = tempfile::tempdir().unwrap();
    let mut plan = BuildPlan::default();
    plan.packages.insert("a".to_string(), simple_pkg(vec![]));
    plan.packages.insert("b".to_string(), simple_pkg(vec![dep("a")]));

    let toolchain = Arc::new(FakeToolchain {
        fail_build: vec!["a".to_string()],
        ..Default::default()
    });
    let err = perform_build(plan, base_config(tmp.path()), toolchain)
        .await
        .unwrap_err();
    assert!(err.errors.contains_key("a"));
    assert!(err.errors.get("b").unwrap().contains("a"));
}

/// Scenario 4: skipBuild package never publishes libReady; its consumer
/// fails with `DependencyFailed`.
#[tokio::test]
async fn skip_build_blocks_consumers() {
    let tmp = tempfile::tempdir().unwrap();
    let mut plan = BuildPlan::default();
    let mut y = simple_pkg(vec![]);
    y.constraints.skip_build = true;
    plan.packages.insert("y".to_string(), y);
    plan.packages.insert("z".to_string(), simple_pkg(vec![dep("y")]));

    let toolchain = Arc::new(FakeToolchain::default());
    let err = perform_build(plan, base_config(tmp.path()), toolchain)
        .await
        .unwrap_err();
    assert!(!err.errors.contains_key("y"));
    assert!(err.errors.get("z").unwrap().contains("y"));
}

/// Scenario 3: test state ExpectFailure + unexpected success produces a
/// warning, not an error.
#[tokio::test]
async fn unexpected_test_success_warns() {
    let tmp = tempfile::tempdir().unwrap();
    let mut plan = BuildPlan::default();
    let mut x = simple_pkg(vec![]);
    x.constraints.tests = TestState::ExpectFailure;
    plan.packages.insert("x".to_string(), x);

    let mut cfg = base_config(tmp.path());
    cfg.build_tests = true;
    let toolchain = Arc::new(FakeToolchain::default());
    let warnings = perform_build(plan, cfg, toolchain).await.unwrap();
    assert!(warnings.iter().any(|w| w.contains("unexpected")));
}
