use crate::error::{BuildError, Result};
use std::path::{Path, PathBuf};

/// Where the binary package database lives (spec §4.3).
#[derive(Debug, Clone)]
pub enum DbMode {
    Global,
    Local(PathBuf),
}

/// §9 open question, resolved: whether a missing non-core tool is a hard
/// error or silently tolerated (matching the original's upstream-bug
/// workaround).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolMissingPolicy {
    #[default]
    Silent,
    Strict,
}

/// The `PerformBuild` config of spec §6, realised as a concrete struct
/// (SPEC_FULL.md §3 ADDED).
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub install_dest: PathBuf,
    pub log_dir: PathBuf,
    pub jobs: usize,
    pub db_mode: DbMode,
    pub build_haddock: bool,
    pub build_tests: bool,
    pub build_benchmarks: bool,
    pub verbose: bool,
    pub allow_newer: bool,
    pub build_hoogle: bool,
    pub no_rebuild_cabal: bool,
    pub cabal_from_head: bool,
    pub env_deny_list: Vec<String>,
    pub tool_missing_policy: ToolMissingPolicy,
}

impl BuildConfig {
    pub fn new(install_dest: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_dest: install_dest.into(),
            log_dir: log_dir.into(),
            jobs: num_cpus::get(),
            db_mode: DbMode::Global,
            build_haddock: true,
            build_tests: false,
            build_benchmarks: false,
            verbose: false,
            allow_newer: false,
            build_hoogle: false,
            no_rebuild_cabal: false,
            cabal_from_head: false,
            env_deny_list: default_env_deny_list(),
            tool_missing_policy: ToolMissingPolicy::default(),
        }
    }

    /// Validate and canonicalise paths, creating directories on demand
    /// (SPEC_FULL.md §4 ADDED C9 — validated once at driver construction,
    /// never discovered mid-run).
    pub async fn validated(mut self) -> Result<Self> {
        if self.jobs == 0 {
            return Err(BuildError::Config("jobs must be >= 1".into()));
        }
        self.install_dest = canonicalize_creating(&self.install_dest).await?;
        self.log_dir = canonicalize_creating(&self.log_dir).await?;
        if let DbMode::Local(ref mut p) = self.db_mode {
            *p = canonicalize_creating(p).await?;
        }
        Ok(self)
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.install_dest.join("bin")
    }
    pub fn lib_dir(&self) -> PathBuf {
        self.install_dest.join("lib")
    }
    pub fn share_dir(&self) -> PathBuf {
        self.install_dest.join("share")
    }
    pub fn libexec_dir(&self) -> PathBuf {
        self.install_dest.join("libexec")
    }
    pub fn etc_dir(&self) -> PathBuf {
        self.install_dest.join("etc")
    }
    pub fn doc_dir(&self, name_version: &str) -> PathBuf {
        self.install_dest.join("doc").join(name_version)
    }
    pub fn pkgdb_dir(&self) -> PathBuf {
        self.install_dest.join("pkgdb")
    }
    pub fn prevres_dir(&self) -> PathBuf {
        self.install_dest.join("prevres")
    }
}

async fn canonicalize_creating(p: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(p).await?;
    Ok(tokio::fs::canonicalize(p).await?)
}

fn default_env_deny_list() -> Vec<String> {
    vec![
        "GITHUB_TOKEN".to_string(),
        "NPM_TOKEN".to_string(),
        "CARGO_REGISTRY_TOKEN".to_string(),
        "AWS_SECRET_ACCESS_KEY".to_string(),
    ]
}

/// Pure environment filter (spec §5, §9 "a pure function over a list of
/// (string,string); no global mutable env state required").
pub fn filter_env(
    inherited: impl IntoIterator<Item = (String, String)>,
    deny_list: &[String],
    bin_dir: &Path,
    local_db: Option<&Path>,
) -> Vec<(String, String)> {
    let path_sep = if cfg!(windows) { ';' } else { ':' };
    let deny_upper: Vec<String> = deny_list.iter().map(|s| s.to_uppercase()).collect();

    let mut env: Vec<(String, String)> = inherited
        .into_iter()
        .filter(|(k, _)| !deny_upper.contains(&k.to_uppercase()))
        .collect();

    if let Some(entry) = env.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case("PATH")) {
        entry.1 = format!("{}{}{}", bin_dir.display(), path_sep, entry.1);
    } else {
        env.push(("PATH".to_string(), bin_dir.display().to_string()));
    }

    if let Some(db) = local_db {
        env.push((
            "HASKELL_PACKAGE_SANDBOX".to_string(),
            db.display().to_string(),
        ));
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_env_removes_denied_case_insensitively() {
        let inherited = vec![
            ("github_token".to_string(), "secret".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ];
        let out = filter_env(
            inherited,
            &["GITHUB_TOKEN".to_string()],
            Path::new("/install/bin"),
            None,
        );
        assert!(!out.iter().any(|(k, _)| k.eq_ignore_ascii_case("github_token")));
        let path = out.iter().find(|(k, _)| k == "PATH").unwrap();
        assert!(path.1.starts_with("/install/bin"));
        assert!(path.1.ends_with("/usr/bin"));
    }

    #[test]
    fn filter_env_exports_local_db() {
        let out = filter_env(vec![], &[], Path::new("/bin"), Some(Path::new("/db")));
        assert!(out
            .iter()
            .any(|(k, v)| k == "HASKELL_PACKAGE_SANDBOX" && v == "/db"));
    }
}
