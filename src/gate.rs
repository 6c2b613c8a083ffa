//! C5 — Dependency Gate: blocks a package's stages until its required
//! dependencies have reached the required stage (spec §4.5), plus the
//! single-assignment `libReady` latch each package publishes into
//! (spec §3, §9).
//!
//! Grounded on `job.rs`'s `JobStateMachine` single-writer transition
//! discipline, generalised from an enum of terminal states to a
//! write-once-many-readers boolean latch built on `tokio::sync::watch`.

use crate::error::{BuildError, Result};
use crate::plan::{BuildPlan, Component};
use std::collections::{HashMap, HashSet};
use tokio::sync::watch;

/// Per-package single-assignment latch: written exactly once — `true` when
/// the library has been built, copied, and registered; `false` on fatal
/// task exit. Readers block until written (spec §3 I1).
#[derive(Clone)]
pub struct LibReadyLatch {
    tx: std::sync::Arc<watch::Sender<Option<bool>>>,
    rx: watch::Receiver<Option<bool>>,
}

impl LibReadyLatch {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Write the latch. Panics on a second write — I1 is enforced by
    /// construction (each package task owns exactly one `LibReadyLatch`
    /// and calls this at most once, from its single finaliser).
    pub fn publish(&self, value: bool) {
        let mut written = false;
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(value);
                written = true;
            }
            written
        });
        debug_assert!(written, "libReady latch written twice");
    }

    /// Block until written, returning the published value.
    pub async fn wait(&self) -> bool {
        let mut rx = self.rx.clone();
        loop {
            if let Some(v) = *rx.borrow() {
                return v;
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Non-blocking snapshot for the gate's atomic check (spec §4.5 "one
    /// atomic check against the latest snapshot of the latches").
    pub fn snapshot(&self) -> Option<bool> {
        *self.rx.borrow()
    }
}

impl Default for LibReadyLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// The dependency gate (spec §4.5). `latches` holds every package's
/// `libReady` latch so the gate can snapshot-then-wait.
pub struct DependencyGate<'a> {
    plan: &'a BuildPlan,
    latches: &'a HashMap<String, LibReadyLatch>,
    tool_providers: &'a HashMap<String, Vec<String>>,
}

impl<'a> DependencyGate<'a> {
    pub fn new(
        plan: &'a BuildPlan,
        latches: &'a HashMap<String, LibReadyLatch>,
        tool_providers: &'a HashMap<String, Vec<String>>,
    ) -> Self {
        Self {
            plan,
            latches,
            tool_providers,
        }
    }

    /// Block until every dependency of `pkg_name` whose consuming-component
    /// set intersects `required` has published `libReady`, or fail fast the
    /// instant any of them is known to have failed (spec §4.5: "if any
    /// required dependency has already failed, the waiting task fails fast
    /// rather than blocking on other deps").
    pub async fn wait(
        &self,
        pkg_name: &str,
        required: &HashSet<Component>,
        tool_missing_policy: crate::config::ToolMissingPolicy,
    ) -> Result<()> {
        let pkg = self
            .plan
            .packages
            .get(pkg_name)
            .ok_or_else(|| BuildError::Config(format!("{pkg_name} not in plan")))?;

        // Fast-fail pass: any dependency whose latch already resolved to
        // false fails this task immediately without waiting on the rest.
        for dep in pkg.deps_for(required) {
            if let Some(name) = self.resolve_dependency(dep, tool_missing_policy)? {
                if let Some(latch) = self.latches.get(&name) {
                    if latch.snapshot() == Some(false) {
                        return Err(BuildError::DependencyFailed(name));
                    }
                }
            }
        }

        for dep in pkg.deps_for(required) {
            let Some(name) = self.resolve_dependency(dep, tool_missing_policy)? else {
                continue;
            };
            let latch = self
                .latches
                .get(&name)
                .ok_or_else(|| BuildError::DependencyMissing(name.clone()))?;
            if !latch.wait().await {
                return Err(BuildError::DependencyFailed(name));
            }
        }
        Ok(())
    }

    /// Returns `Some(package_name)` to wait on, or `None` if the dependency
    /// should be skipped (core package, or a tolerated missing tool).
    fn resolve_dependency(
        &self,
        dep: &crate::plan::Dependency,
        tool_missing_policy: crate::config::ToolMissingPolicy,
    ) -> Result<Option<String>> {
        if self.plan.is_core(&dep.name) {
            return Ok(None);
        }
        if dep.is_tool {
            return self.resolve_tool(&dep.name, tool_missing_policy);
        }
        if !self.plan.packages.contains_key(&dep.name) {
            return Err(BuildError::DependencyMissing(dep.name.clone()));
        }
        Ok(Some(dep.name.clone()))
    }

    fn resolve_tool(
        &self,
        tool: &str,
        policy: crate::config::ToolMissingPolicy,
    ) -> Result<Option<String>> {
        match self.tool_providers.get(tool).and_then(|v| v.first()) {
            Some(provider) => Ok(Some(provider.clone())),
            None => {
                let tolerated = self.plan.core_executables.contains(tool)
                    || policy == crate::config::ToolMissingPolicy::Silent;
                if tolerated {
                    Ok(None)
                } else {
                    Err(BuildError::ToolMissing(tool.to_string()))
                }
            }
        }
    }
}
