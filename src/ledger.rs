//! C1 — Result Ledger: a content-addressable on-disk store recording
//! per-(package, stage) success/failure so a crashed run can resume
//! without redoing already-completed stages (spec §4.1).
//!
//! Grounded on `checkpoint.rs`'s `CheckpointManager` (save/replace/load
//! shape), reimplemented over the filesystem per spec §4.1/§6 instead of
//! an in-memory `Vec<Checkpoint>`.

use crate::plan::TestState;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Build,
    Haddock,
    Test,
    Bench,
}

impl Stage {
    fn dir_name(self) -> &'static str {
        match self {
            Stage::Build => "Build",
            Stage::Haddock => "Haddock",
            Stage::Test => "Test",
            Stage::Bench => "Bench",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEntry {
    NoResult,
    Success,
    Failure,
}

/// Filesystem-backed ledger rooted at `<install_dest>/prevres/`.
#[derive(Debug, Clone)]
pub struct Ledger {
    root: PathBuf,
}

impl Ledger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, stage: Stage, package_id: &str) -> PathBuf {
        self.root.join(stage.dir_name()).join(package_id)
    }

    /// Any I/O error maps to `NoResult` (spec §4.1).
    pub async fn get(&self, stage: Stage, package_id: &str) -> LedgerEntry {
        match tokio::fs::read(self.path(stage, package_id)).await {
            Ok(bytes) if bytes == b"success" => LedgerEntry::Success,
            Ok(bytes) if bytes == b"failure" => LedgerEntry::Failure,
            Ok(_) => LedgerEntry::NoResult,
            Err(e) => {
                debug!(%package_id, stage = ?stage, error = %e, "ledger read miss");
                LedgerEntry::NoResult
            }
        }
    }

    /// Atomic overwrite; parent directory created on demand.
    pub async fn put(&self, stage: Stage, package_id: &str, success: bool) -> std::io::Result<()> {
        let path = self.path(stage, package_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = if success { "success" } else { "failure" };
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await
    }

    /// Delete entries for every stage of a package; missing files ignored.
    pub async fn clear_all(&self, package_id: &str) -> std::io::Result<()> {
        for stage in [Stage::Build, Stage::Haddock, Stage::Test, Stage::Bench] {
            match tokio::fs::remove_file(self.path(stage, package_id)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(%package_id, stage = ?stage, error = %e, "failed clearing ledger entry");
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

/// The rerun rule (spec §4.1, §8 laws):
/// `Don'tBuild -> false`; `NoResult -> true`; `Success -> false`;
/// `Failure -> (expected == ExpectSuccess)`.
pub fn should_rerun(prev: LedgerEntry, expected: TestState) -> bool {
    match (prev, expected) {
        (_, TestState::DontBuild) => false,
        (LedgerEntry::NoResult, _) => true,
        (LedgerEntry::Success, _) => false,
        (LedgerEntry::Failure, TestState::ExpectSuccess) => true,
        (LedgerEntry::Failure, TestState::ExpectFailure) => false,
    }
}

pub fn root_dir(install_dest: &Path) -> PathBuf {
    install_dest.join("prevres")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(tmp.path());

        assert_eq!(ledger.get(Stage::Build, "a-1.0").await, LedgerEntry::NoResult);

        ledger.put(Stage::Build, "a-1.0", true).await.unwrap();
        assert_eq!(ledger.get(Stage::Build, "a-1.0").await, LedgerEntry::Success);

        ledger.put(Stage::Build, "a-1.0", false).await.unwrap();
        assert_eq!(ledger.get(Stage::Build, "a-1.0").await, LedgerEntry::Failure);

        ledger.clear_all("a-1.0").await.unwrap();
        assert_eq!(ledger.get(Stage::Build, "a-1.0").await, LedgerEntry::NoResult);
    }

    #[tokio::test]
    async fn clear_all_ignores_missing_files() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(tmp.path());
        ledger.clear_all("never-built-1.0").await.unwrap();
    }

    #[test]
    fn rerun_rule_table() {
        use LedgerEntry::*;
        use TestState::*;

        assert!(!should_rerun(Success, ExpectSuccess));
        assert!(!should_rerun(Success, ExpectFailure));
        assert!(should_rerun(NoResult, ExpectSuccess));
        assert!(should_rerun(NoResult, ExpectFailure));
        assert!(!should_rerun(NoResult, DontBuild));
        assert!(should_rerun(Failure, ExpectSuccess));
        assert!(!should_rerun(Failure, ExpectFailure));
        assert!(!should_rerun(Failure, DontBuild));
    }
}
