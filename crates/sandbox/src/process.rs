//! Running the node binary: one-shot subcommands and the long-lived `run`.

use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::paths::HomePaths;

/// Time a node gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("spawn {}: {source}", .binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("init in {} exited with {status}: {stderr}", .home.display())]
    InitFailed {
        home: PathBuf,
        status: ExitStatus,
        stderr: String,
    },

    #[error("expected {} after init", .path.display())]
    MissingFile { path: PathBuf },

    #[error("dump-state in {} exited with {status}: {stderr}", .home.display())]
    DumpFailed {
        home: PathBuf,
        status: ExitStatus,
        stderr: String,
    },

    #[error("signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: Errno,
    },
}

/// How a spawned node ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    Exited(ExitStatus),
    /// Waiting on the child failed; the process state is unknown.
    Failed(String),
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(status) if status.success())
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(status) => write!(f, "{status}"),
            Self::Failed(e) => write!(f, "wait failed: {e}"),
        }
    }
}

/// Invokes one node executable.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    binary: PathBuf,
    debug_logs: bool,
}

impl ProcessRunner {
    pub fn new(binary: PathBuf, debug_logs: bool) -> Self {
        Self { binary, debug_logs }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// `--home <home> init --fast`, then check the files `run` needs.
    pub async fn initialize(&self, home: &Path) -> Result<(), ProcessError> {
        let output = self
            .command(home)
            .args(["init", "--fast"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| self.spawn_error(source))?;
        if !output.status.success() {
            return Err(ProcessError::InitFailed {
                home: home.to_path_buf(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let paths = HomePaths::new(home.to_path_buf());
        for path in [paths.config(), paths.genesis()] {
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(ProcessError::MissingFile { path });
            }
        }
        debug!(home = %home.display(), "node home initialized");
        Ok(())
    }

    /// Start `--home <home> run` in the background.
    ///
    /// stderr is forwarded to the log at `warn` unless debug logs are on, in
    /// which case all stdio is inherited.
    pub async fn spawn_node(
        &self,
        home: &Path,
        rpc_addr: &str,
        net_addr: &str,
    ) -> Result<NodeProcess, ProcessError> {
        let mut cmd = self.command(home);
        cmd.arg("run")
            .args(["--rpc-addr", rpc_addr])
            .args(["--network-addr", net_addr])
            .kill_on_drop(true);
        if self.debug_logs {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped());
        }

        let mut child = cmd.spawn().map_err(|source| self.spawn_error(source))?;
        let pid = child.id();
        info!(pid, rpc_addr, net_addr, home = %home.display(), "node spawned");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        warn!(pid, "stderr: {line}");
                    }
                }
            });
        }

        let (tx, rx) = watch::channel(None);
        let monitor = tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ProcessExit::Exited(status),
                Err(e) => ProcessExit::Failed(e.to_string()),
            };
            debug!(pid, %exit, "node exited");
            let _ = tx.send(Some(exit));
        });

        Ok(NodeProcess {
            pid,
            exit: rx,
            monitor,
        })
    }

    /// `--home <home> view-state dump-state --stream`; files land in `<home>/output`.
    pub async fn dump_state(&self, home: &Path) -> Result<(), ProcessError> {
        let output = self
            .command(home)
            .args(["view-state", "dump-state", "--stream"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| self.spawn_error(source))?;
        if !output.status.success() {
            return Err(ProcessError::DumpFailed {
                home: home.to_path_buf(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Run with arbitrary arguments and inherited stdio.
    pub async fn run_passthrough<I, S>(&self, args: I) -> Result<ExitStatus, ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command::new(&self.binary)
            .args(args)
            .status()
            .await
            .map_err(|source| self.spawn_error(source))
    }

    fn command(&self, home: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--home").arg(home);
        cmd
    }

    fn spawn_error(&self, source: std::io::Error) -> ProcessError {
        ProcessError::Spawn {
            binary: self.binary.clone(),
            source,
        }
    }
}

/// A running node. Dropping the handle kills the process.
#[derive(Debug)]
pub struct NodeProcess {
    pid: Option<u32>,
    exit: watch::Receiver<Option<ProcessExit>>,
    monitor: JoinHandle<()>,
}

impl NodeProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The exit, if the process has already ended.
    pub fn try_exit(&self) -> Option<ProcessExit> {
        self.exit.borrow().clone()
    }

    pub async fn wait_exit(&self) -> ProcessExit {
        let mut rx = self.exit.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit
                .clone()
                .unwrap_or_else(|| ProcessExit::Failed("no exit status".into())),
            Err(_) => ProcessExit::Failed("process monitor stopped".into()),
        }
    }

    /// SIGTERM, then SIGKILL if the node is still alive after a grace period.
    pub async fn terminate(&self) -> Result<ProcessExit, ProcessError> {
        if let Some(exit) = self.try_exit() {
            return Ok(exit);
        }
        self.signal(Signal::SIGTERM)?;
        match tokio::time::timeout(TERMINATE_GRACE, self.wait_exit()).await {
            Ok(exit) => Ok(exit),
            Err(_) => {
                warn!(pid = self.pid, "node ignored SIGTERM, killing");
                self.signal(Signal::SIGKILL)?;
                Ok(self.wait_exit().await)
            }
        }
    }

    fn signal(&self, signal: Signal) -> Result<(), ProcessError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let Ok(raw) = i32::try_from(pid) else {
            return Ok(());
        };
        match kill(Pid::from_raw(raw), signal) {
            // Already gone; the monitor reports the exit.
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(ProcessError::Signal { pid, source }),
        }
    }
}

impl Drop for NodeProcess {
    fn drop(&mut self) {
        self.monitor.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::process::ExitStatusExt;

    use super::*;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("node.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn initialize_checks_generated_files() {
        let bin_dir = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(
            script(
                bin_dir.path(),
                r#"touch "$2/config.json" "$2/genesis.json""#
            ),
            false,
        );

        runner.initialize(home.path()).await.unwrap();
        assert!(home.path().join("config.json").exists());
    }

    #[tokio::test]
    async fn initialize_without_genesis_is_missing_file() {
        let bin_dir = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(script(bin_dir.path(), r#"touch "$2/config.json""#), false);

        let err = runner.initialize(home.path()).await.unwrap_err();
        match err {
            ProcessError::MissingFile { path } => assert!(path.ends_with("genesis.json")),
            other => panic!("expected MissingFile, got {other}"),
        }
    }

    #[tokio::test]
    async fn failed_init_captures_stderr() {
        let bin_dir = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(
            script(bin_dir.path(), "echo 'bad flag' >&2\nexit 2"),
            false,
        );

        let err = runner.initialize(home.path()).await.unwrap_err();
        match err {
            ProcessError::InitFailed { status, stderr, .. } => {
                assert_eq!(status.code(), Some(2));
                assert_eq!(stderr, "bad flag");
            }
            other => panic!("expected InitFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let runner = ProcessRunner::new(PathBuf::from("/nonexistent/near-sandbox"), false);
        let err = runner
            .spawn_node(Path::new("/tmp"), "127.0.0.1:1", "127.0.0.1:2")
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }), "got: {err}");
    }

    #[tokio::test]
    async fn early_exit_is_observable() {
        let bin_dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(script(bin_dir.path(), "exit 7"), false);

        let node = runner
            .spawn_node(bin_dir.path(), "127.0.0.1:1", "127.0.0.1:2")
            .await
            .unwrap();
        let exit = node.wait_exit().await;
        assert_eq!(exit, ProcessExit::Exited(ExitStatus::from_raw(7 << 8)));
        assert_eq!(node.try_exit(), Some(exit.clone()));
        // Terminating an exited node reports the recorded exit.
        assert_eq!(node.terminate().await.unwrap(), exit);
    }

    #[tokio::test]
    async fn terminate_stops_running_node() {
        let bin_dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(script(bin_dir.path(), "exec sleep 30"), false);

        let node = runner
            .spawn_node(bin_dir.path(), "127.0.0.1:1", "127.0.0.1:2")
            .await
            .unwrap();
        assert!(node.pid().is_some());
        assert_eq!(node.try_exit(), None);

        let exit = node.terminate().await.unwrap();
        match exit {
            ProcessExit::Exited(status) => assert_eq!(status.signal(), Some(15)),
            other => panic!("expected signal exit, got {other}"),
        }
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn node_receives_addresses() {
        let bin_dir = tempfile::tempdir().unwrap();
        let out = bin_dir.path().join("args");
        let runner = ProcessRunner::new(
            script(bin_dir.path(), &format!(r#"echo "$@" > {}"#, out.display())),
            false,
        );

        let node = runner
            .spawn_node(Path::new("/work"), "127.0.0.1:3030", "127.0.0.1:24567")
            .await
            .unwrap();
        assert!(node.wait_exit().await.success());
        assert_eq!(
            std::fs::read_to_string(&out).unwrap().trim(),
            "--home /work run --rpc-addr 127.0.0.1:3030 --network-addr 127.0.0.1:24567"
        );
    }

    #[tokio::test]
    async fn failed_dump_is_reported() {
        let bin_dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(script(bin_dir.path(), "echo nope >&2\nexit 1"), false);

        let err = runner.dump_state(bin_dir.path()).await.unwrap_err();
        assert!(matches!(err, ProcessError::DumpFailed { .. }), "got: {err}");
    }

    #[tokio::test]
    async fn passthrough_returns_exit_status() {
        let bin_dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(script(bin_dir.path(), r#"exit "$1""#), false);

        let status = runner.run_passthrough(["4"]).await.unwrap();
        assert_eq!(status.code(), Some(4));
    }
}
