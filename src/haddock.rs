//! C4 — Haddock Interface Store: tracks `.haddock` files produced per
//! package and computes deep dependency closures for cross-linking
//! (spec §4.4).
//!
//! Grounded on `dependency_graph.rs`'s `ReverseDependencyIndex` /
//! `compute_affected_files` pattern (a `DashMap`-backed graph index with a
//! traversal helper), adapted from BFS-over-reverse-edges to the memoised
//! DFS-with-placeholder closure spec §4.4/§9 requires — self-cycles are
//! legal here (a package may depend on itself) where the teacher's file
//! graph had none.

use crate::plan::{BuildPlan, Component};
use dashmap::DashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// `haddockFiles` (spec §3): "name-version" -> absolute path of `.haddock`.
#[derive(Debug, Clone, Default)]
pub struct HaddockStore {
    files: Arc<DashMap<String, PathBuf>>,
    /// Guards the memo's insert-placeholder -> recurse -> overwrite section
    /// so two concurrent callers never observe a partial placeholder
    /// (spec §4.4, §9).
    memo: Arc<Mutex<std::collections::HashMap<String, HashSet<String>>>>,
}

impl HaddockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_interface(&self, package_id: &str, path: PathBuf) {
        self.files.insert(package_id.to_string(), path);
    }

    #[allow(dead_code)]
    pub fn interface_path(&self, package_id: &str) -> Option<PathBuf> {
        self.files.get(package_id).map(|e| e.value().clone())
    }

    /// Transitive set of library-or-executable dependency names reachable
    /// from `package_name`, computed lazily via memoised DFS over the
    /// plan's dependency map. A placeholder (empty set) is inserted before
    /// recursing so self-cycles terminate; it is then overwritten with the
    /// real closure. The whole insertion-then-recurse-then-overwrite
    /// section for one node is serialised under `memo`'s lock.
    pub async fn closure(&self, plan: &BuildPlan, package_name: &str) -> HashSet<String> {
        let mut memo = self.memo.lock().await;
        Self::closure_locked(plan, package_name, &mut memo)
    }

    fn closure_locked(
        plan: &BuildPlan,
        name: &str,
        memo: &mut std::collections::HashMap<String, HashSet<String>>,
    ) -> HashSet<String> {
        if let Some(cached) = memo.get(name) {
            return cached.clone();
        }
        // Placeholder before recursing: a self-edge (name depending on
        // itself) hits this branch on re-entry and sees the empty set,
        // terminating instead of looping forever.
        memo.insert(name.to_string(), HashSet::new());

        let mut result = HashSet::new();
        if let Some(pkg) = plan.packages.get(name) {
            let lib_exe: HashSet<Component> =
                [Component::Library, Component::Executable].into_iter().collect();
            for dep in pkg.deps_for(&lib_exe) {
                if dep.is_tool || plan.is_core(&dep.name) {
                    continue;
                }
                result.insert(dep.name.clone());
                result.extend(Self::closure_locked(plan, &dep.name, memo));
            }
        }

        memo.insert(name.to_string(), result.clone());
        result
    }

    /// `--haddock-options=--read-interface=../<pkg-ver>/,<path>` for every
    /// entry in `haddockFiles` whose base name lies in `closure(this_package)`
    /// (spec §4.4).
    pub fn read_interface_args(&self, closure: &HashSet<String>) -> Vec<String> {
        let mut args = Vec::new();
        for entry in self.files.iter() {
            let package_id = entry.key();
            let name = package_id.rsplit_once('-').map(|(n, _)| n).unwrap_or(package_id);
            if closure.contains(name) {
                args.push(format!(
                    "--haddock-options=--read-interface=../{package_id}/,{}",
                    entry.value().display()
                ));
            }
        }
        args.sort();
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Dependency, PackageConstraints, PackagePlan};

    fn pkg(deps: &[&str]) -> PackagePlan {
        PackagePlan {
            version: "1.0".to_string(),
            description: String::new(),
            has_library: true,
            has_modules: true,
                build_type_simple: true,
            dependencies: deps
                .iter()
                .map(|d| Dependency {
                    name: d.to_string(),
                    consuming: [Component::Library].into_iter().collect(),
                    is_tool: false,
                })
                .collect(),
            constraints: PackageConstraints::default(),
            source_url: None,
        }
    }

    #[tokio::test]
    async fn closure_handles_self_cycle() {
        let mut plan = BuildPlan::default();
        plan.packages.insert("a".to_string(), pkg(&["a", "b"]));
        plan.packages.insert("b".to_string(), pkg(&[]));

        let store = HaddockStore::new();
        let closure = store.closure(&plan, "a").await;

        assert_eq!(closure, ["a", "b"].into_iter().map(String::from).collect());
    }

    #[tokio::test]
    async fn closure_is_transitive() {
        let mut plan = BuildPlan::default();
        plan.packages.insert("a".to_string(), pkg(&["b"]));
        plan.packages.insert("b".to_string(), pkg(&["c"]));
        plan.packages.insert("c".to_string(), pkg(&[]));

        let store = HaddockStore::new();
        let closure = store.closure(&plan, "a").await;
        assert_eq!(closure, ["b", "c"].into_iter().map(String::from).collect());
    }

    #[tokio::test]
    async fn closure_skips_core_packages() {
        let mut plan = BuildPlan::default();
        plan.core_packages.insert("base".to_string());
        plan.packages.insert("a".to_string(), pkg(&["base"]));

        let store = HaddockStore::new();
        let closure = store.closure(&plan, "a").await;
        assert!(closure.is_empty());
    }

    #[test]
    fn read_interface_args_filters_by_closure() {
        let store = HaddockStore::new();
        store.record_interface("a-1.0", PathBuf::from("/doc/a-1.0/a.haddock"));
        store.record_interface("b-2.0", PathBuf::from("/doc/b-2.0/b.haddock"));

        let closure: HashSet<String> = ["a".to_string()].into_iter().collect();
        let args = store.read_interface_args(&closure);

        assert_eq!(args.len(), 1);
        assert!(args[0].contains("a-1.0"));
    }
}
