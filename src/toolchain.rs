//! C2 — Toolchain Adapter: drives the external builder (configure / build /
//! copy / register / haddock) and captures its combined output to a
//! per-stage log file (spec §4.2, §6).
//!
//! Grounded on `orchestrator.rs`'s `execute_stage` (timeout wrapping via
//! `tokio::time::timeout`, structured error mapping) and the argv-builder /
//! shell-quoted-log-line conventions in
//! `examples/nya3jp-cros-bazel/portage/bin/build_package`.

use crate::config::{BuildConfig, DbMode};
use crate::error::{BuildError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, instrument, warn};

/// Process-execution boundary, so C7's state machine can be driven in
/// tests by a recording fake instead of spawning real `cabal`/`haddock`
/// processes (SPEC_FULL.md §8 — "a fake toolchain adapter that records
/// invocations").
#[async_trait]
pub trait Toolchain: Send + Sync {
    async fn run(
        &self,
        package_id: &str,
        stage_log_name: &str,
        cwd: &Path,
        argv: &[String],
        env: &[(String, String)],
        timeout: Option<Duration>,
    ) -> Result<()>;
}

/// Appends to a vector of argv fragments (spec §9 "writer-log for argv
/// construction... a simple append-to-vector in a scoped builder").
#[derive(Debug, Default, Clone)]
pub struct ArgvBuilder(Vec<String>);

impl ArgvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, arg: impl Into<String>) -> Self {
        self.0.push(arg.into());
        self
    }

    pub fn extend(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.0.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> Vec<String> {
        self.0
    }
}

/// `runghcArgs` (spec §4.2): prepends `-clear-package-db
/// -global-package-db` and, if a local DB is configured, `-package-db=<db>`.
pub fn runghc_args(config: &BuildConfig, trailing: Vec<String>) -> Vec<String> {
    let mut builder = ArgvBuilder::new()
        .push("-clear-package-db")
        .push("-global-package-db");
    if let DbMode::Local(db) = &config.db_mode {
        builder = builder.push(format!("-package-db={}", db.display()));
    }
    builder.extend(trailing).build()
}

/// `configureArgs` (spec §4.2): per-tree install dirs, signed flags,
/// profiling/dynamic toggles, then plan-supplied args appended verbatim.
pub fn configure_args(
    config: &BuildConfig,
    name_version: &str,
    flag_overrides: &std::collections::HashMap<String, bool>,
    enable_lib_profile: bool,
    enable_tests: bool,
    enable_benchmarks: bool,
    plan_configure_args: &[String],
) -> Vec<String> {
    let mut builder = ArgvBuilder::new();

    builder = match &config.db_mode {
        DbMode::Global => builder.push("--package-db=global"),
        DbMode::Local(db) => builder.push(format!("--package-db={}", db.display())),
    };

    builder = builder
        .push(format!("--bindir={}", config.bin_dir().display()))
        .push(format!("--libdir={}", config.lib_dir().display()))
        .push(format!("--datadir={}", config.share_dir().display()))
        .push(format!("--libexecdir={}", config.libexec_dir().display()))
        .push(format!("--sysconfdir={}", config.etc_dir().display()))
        .push(format!(
            "--htmldir={}",
            config
                .doc_dir(name_version)
                .join("html")
                .join("haddock")
                .display()
        ));

    if !flag_overrides.is_empty() {
        let mut flags: Vec<_> = flag_overrides.iter().collect();
        flags.sort_by_key(|(name, _)| (*name).clone());
        let joined = flags
            .into_iter()
            .map(|(name, on)| format!("{}{}", if *on { "+" } else { "-" }, name))
            .collect::<Vec<_>>()
            .join(" ");
        builder = builder.push(format!("--flags={joined}"));
    }

    if enable_lib_profile {
        builder = builder.push("--enable-library-profiling");
    }
    builder = builder.push("--enable-executable-dynamic");

    if enable_tests {
        builder = builder.push("--enable-tests");
    }
    if enable_benchmarks {
        builder = builder.push("--enable-benchmarks");
    }

    builder.extend(plan_configure_args.to_vec()).build()
}

/// Every external-process invocation is given a working directory, a
/// filtered environment, and a stage-specific log file opened lazily on
/// first write (spec §4.2, §6).
pub struct ToolchainAdapter {
    log_dir: PathBuf,
}

impl ToolchainAdapter {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    fn log_path(&self, package_id: &str, stage_log_name: &str) -> PathBuf {
        self.log_dir.join(package_id).join(format!("{stage_log_name}.out"))
    }
}

#[async_trait]
impl Toolchain for ToolchainAdapter {
    /// Run `argv[0] argv[1..]` in `cwd`, with `env` applied on top of the
    /// process's inherited environment, combined stdout/stderr appended to
    /// the stage log file, line-prefixed with the shell-quoted command.
    /// Non-zero exit raises `ProcessFailed`; async cancellation (the
    /// `timeout` elapsing) terminates the child before returning.
    #[instrument(skip(self, env), fields(package = %package_id, stage = %stage_log_name))]
    async fn run(
        &self,
        package_id: &str,
        stage_log_name: &str,
        cwd: &Path,
        argv: &[String],
        env: &[(String, String)],
        timeout: Option<Duration>,
    ) -> Result<()> {
        let log_path = self.log_path(package_id, stage_log_name);
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let quoted = shell_words::join(argv);
        info!(command = %quoted, "spawning external process");

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(cwd)
            .env_clear()
            .envs(env.iter().cloned())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let mut stdout = child.stdout.take().expect("piped");
        let mut stderr = child.stderr.take().expect("piped");

        let run = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let (out_res, err_res, wait_res) = tokio::join!(
                tokio::io::AsyncReadExt::read_to_end(&mut stdout, &mut out),
                tokio::io::AsyncReadExt::read_to_end(&mut stderr, &mut err),
                child.wait(),
            );
            out_res?;
            err_res?;
            wait_res.map(|status| (status, out, err))
        };

        let (status, out, err) = match timeout {
            Some(d) => match tokio::time::timeout(d, run).await {
                Ok(res) => res?,
                Err(_) => {
                    warn!(timeout_ms = d.as_millis() as u64, "process timed out, terminating");
                    return Err(BuildError::Timeout(stage_log_name.to_string(), d));
                }
            },
            None => run.await?,
        };

        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;
        log.write_all(format!("$ {quoted}\n").as_bytes()).await?;
        log.write_all(&out).await?;
        log.write_all(&err).await?;
        log.write_all(format!("(exit status: {status})\n").as_bytes())
            .await?;

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            warn!(exit_code = code, "process exited non-zero");
            return Err(BuildError::ProcessFailed(quoted, code));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_records_success_log() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = ToolchainAdapter::new(tmp.path().join("logs"));
        let cwd = tempfile::tempdir().unwrap();

        adapter
            .run(
                "pkg-1.0",
                "build",
                cwd.path(),
                &["true".to_string()],
                &[],
                None,
            )
            .await
            .unwrap();

        let log = tokio::fs::read_to_string(tmp.path().join("logs/pkg-1.0/build.out"))
            .await
            .unwrap();
        assert!(log.contains("$ true"));
    }

    #[tokio::test]
    async fn run_maps_nonzero_exit_to_process_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = ToolchainAdapter::new(tmp.path().join("logs"));
        let cwd = tempfile::tempdir().unwrap();

        let err = adapter
            .run(
                "pkg-1.0",
                "build",
                cwd.path(),
                &["false".to_string()],
                &[],
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BuildError::ProcessFailed(_, _)));
    }

    #[tokio::test]
    async fn run_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = ToolchainAdapter::new(tmp.path().join("logs"));
        let cwd = tempfile::tempdir().unwrap();

        let err = adapter
            .run(
                "pkg-1.0",
                "test",
                cwd.path(),
                &["sleep".to_string(), "5".to_string()],
                &[],
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BuildError::Timeout(_, _)));
    }

    #[test]
    fn configure_args_includes_install_dirs_and_flags() {
        let config = BuildConfig::new("/install", "/logs");
        let mut flags = std::collections::HashMap::new();
        flags.insert("threaded".to_string(), true);
        flags.insert("dev".to_string(), false);

        let args = configure_args(&config, "pkg-1.0", &flags, false, true, false, &["--extra".to_string()]);
        assert!(args.iter().any(|a| a.starts_with("--bindir=")));
        assert!(args.contains(&"--flags=-dev +threaded".to_string()));
        assert!(args.contains(&"--enable-tests".to_string()));
        assert!(!args.contains(&"--enable-benchmarks".to_string()));
        assert_eq!(args.last().unwrap(), "--extra");
    }
}
