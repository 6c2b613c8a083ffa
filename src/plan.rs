//! The immutable build plan: packages, versions, constraints, and the
//! component/dependency graph a plan-constructor (external, §6) hands us.

use std::collections::{HashMap, HashSet};

/// One of the four buildable component kinds a package can declare (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    Library,
    Executable,
    TestSuite,
    Benchmark,
}

impl Component {
    pub fn all() -> [Component; 4] {
        [
            Component::Library,
            Component::Executable,
            Component::TestSuite,
            Component::Benchmark,
        ]
    }
}

/// Whether a haddock/test/bench stage is expected to pass, fail, or not run
/// at all (spec §3). Only `ExpectSuccess` escalates a stage failure into a
/// hard error for the owning task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestState {
    DontBuild,
    ExpectSuccess,
    ExpectFailure,
}

/// Per-package build knobs (spec §3).
#[derive(Debug, Clone)]
pub struct PackageConstraints {
    pub flag_overrides: HashMap<String, bool>,
    pub configure_args: Vec<String>,
    pub skip_build: bool,
    pub haddocks: TestState,
    pub tests: TestState,
    pub benches: TestState,
    pub enable_lib_profile: bool,
}

impl Default for PackageConstraints {
    fn default() -> Self {
        Self {
            flag_overrides: HashMap::new(),
            configure_args: Vec::new(),
            skip_build: false,
            haddocks: TestState::ExpectSuccess,
            tests: TestState::DontBuild,
            benches: TestState::DontBuild,
            enable_lib_profile: false,
        }
    }
}

/// One dependency edge: `name` is required by the set of `consuming`
/// components of the depending package (spec §3 — "Description enumerates
/// ... for each declared tool or library dependency the set of consuming
/// components").
#[derive(Debug, Clone)]
pub struct Dependency {
    pub name: String,
    pub consuming: HashSet<Component>,
    pub is_tool: bool,
}

/// A single package's plan entry.
#[derive(Debug, Clone)]
pub struct PackagePlan {
    pub version: String,
    pub description: String,
    pub has_library: bool,
    pub has_modules: bool,
    /// Whether the parsed `.cabal` declares `build-type: Simple`, in which
    /// case UNPACK synthesises a default `Setup.hs` (spec §4.7).
    pub build_type_simple: bool,
    pub dependencies: Vec<Dependency>,
    pub constraints: PackageConstraints,
    pub source_url: Option<String>,
}

impl PackagePlan {
    /// Dependencies whose consuming-component set intersects `required`.
    pub fn deps_for<'a>(&'a self, required: &'a HashSet<Component>) -> impl Iterator<Item = &'a Dependency> + 'a {
        self.dependencies
            .iter()
            .filter(move |d| !d.consuming.is_disjoint(required))
    }

    pub fn package_id(&self, name: &str) -> String {
        format!("{name}-{}", self.version)
    }
}

/// The immutable, frozen build plan (spec §3).
#[derive(Debug, Clone, Default)]
pub struct BuildPlan {
    pub packages: HashMap<String, PackagePlan>,
    pub core_packages: HashSet<String>,
    pub core_executables: HashSet<String>,
    /// declared-tool-name -> providing package names, consulting overrides (spec §4.8 step 5).
    pub tool_overrides: HashMap<String, Vec<String>>,
}

impl BuildPlan {
    pub fn is_core(&self, name: &str) -> bool {
        self.core_packages.contains(name)
    }

    /// Build the declared-tool-name -> providing-packages map (spec §4.8 step 5,
    /// §4.5 "Tool dependencies are resolved through a name->providing-packages map").
    pub fn tool_providers(&self) -> HashMap<String, Vec<String>> {
        let mut map: HashMap<String, Vec<String>> = self.tool_overrides.clone();
        for (name, pkg) in self.packages.iter() {
            if pkg.has_library {
                map.entry(name.clone()).or_default().push(name.clone());
            }
        }
        map
    }
}
