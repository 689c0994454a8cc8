//! Launch, log and terminate external processes

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::error::{ProcessError, SpawnError};
use super::signal;

/// Pause after a process is reaped so it can release ports and files
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// How long a process gets to honour SIGTERM before it is killed
pub const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Log file prefix; logs are named `<prefix>-<pid>.log`
pub const DEFAULT_LOG_PREFIX: &str = "test-server";

/// How long output may keep flowing after the process itself exited
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Summary of a terminated process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitReport {
    pub pid: u32,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub bytes_logged: u64,
}

#[derive(Debug, Clone)]
struct ExitInfo {
    status: Result<ExitStatus, String>,
    copied: Result<u64, String>,
}

/// A running child process started by a [`Supervisor`]
#[derive(Debug)]
pub struct ManagedProcess {
    pid: u32,
    argv: Vec<String>,
    log_path: PathBuf,
    exit: watch::Receiver<Option<ExitInfo>>,
    terminated: bool,
}

impl ManagedProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// File receiving the process's standard output
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Whether the process has terminated on its own or otherwise
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if self.terminated || self.has_exited() {
            return;
        }
        warn!("Process {} dropped without terminate, killing it", self.pid);
        if let Err(e) = signal::send(self.pid, Signal::SIGKILL) {
            warn!("Failed to kill process {}: {}", self.pid, e);
        }
    }
}

/// Starts external processes and stops them again
#[derive(Debug, Clone)]
pub struct Supervisor {
    log_dir: PathBuf,
    log_prefix: String,
    grace: Duration,
    exit_timeout: Duration,
}

impl Supervisor {
    /// Supervisor writing output logs into `log_dir`
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            log_prefix: DEFAULT_LOG_PREFIX.to_string(),
            grace: DEFAULT_GRACE,
            exit_timeout: DEFAULT_EXIT_TIMEOUT,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.log_prefix = prefix.into();
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_exit_timeout(mut self, exit_timeout: Duration) -> Self {
        self.exit_timeout = exit_timeout;
        self
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Spawn `argv` and start logging its output
    pub async fn launch(&self, argv: Vec<String>) -> Result<ManagedProcess, SpawnError> {
        let (program, args) = argv.split_first().ok_or(SpawnError::EmptyArgv)?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SpawnError::Spawn {
                program: program.clone(),
                source,
            })?;

        let Some(pid) = child.id() else {
            return Err(SpawnError::Spawn {
                program: program.clone(),
                source: io::Error::new(io::ErrorKind::Other, "exited before it could be tracked"),
            });
        };

        let log_path = self.log_dir.join(format!("{}-{}.log", self.log_prefix, pid));
        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&log_path)
            .await
        {
            Ok(file) => file,
            Err(source) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(SpawnError::LogFile {
                    path: log_path,
                    source,
                });
            }
        };

        let copier = tokio::spawn(copy_output(child.stdout.take(), file));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(pid, stderr));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(watch_exit(pid, child, copier, exit_tx));

        info!(
            "Started {} (pid {}), output in {}",
            program,
            pid,
            log_path.display()
        );

        Ok(ManagedProcess {
            pid,
            argv,
            log_path,
            exit: exit_rx,
            terminated: false,
        })
    }

    /// Send SIGTERM, reap the process, then wait out the grace interval.
    ///
    /// A process that ignores SIGTERM, or cannot be sent it, is killed.
    /// Ports and files held by the process may only be reused once this
    /// returns.
    pub async fn terminate(&self, mut process: ManagedProcess) -> Result<ExitReport, ProcessError> {
        let pid = process.pid;

        let asked = process.has_exited()
            || match signal::send(pid, Signal::SIGTERM) {
                Ok(_) => true,
                Err(e) => {
                    warn!("Failed to send SIGTERM to process {}: {}", pid, e);
                    false
                }
            };

        let waited = if asked {
            timeout(self.exit_timeout, wait_exit(&mut process.exit)).await.ok()
        } else {
            None
        };
        let info = match waited {
            Some(info) => info,
            None => {
                if asked {
                    warn!(
                        "Process {} ignored SIGTERM for {:?}, killing it",
                        pid, self.exit_timeout
                    );
                }
                signal::send(pid, Signal::SIGKILL)
                    .map_err(|source| ProcessError::Signal { pid, source })?;
                wait_exit(&mut process.exit).await
            }
        };
        process.terminated = true;

        debug!("Process {} reaped, waiting {:?}", pid, self.grace);
        sleep(self.grace).await;

        let info = info.ok_or_else(|| ProcessError::Wait {
            pid,
            message: "exit watcher ended without a status".to_string(),
        })?;
        let status = info
            .status
            .map_err(|message| ProcessError::Wait { pid, message })?;
        let bytes_logged = info
            .copied
            .map_err(|message| ProcessError::OutputCopy { pid, message })?;

        info!("Process {} terminated: {}", pid, status);
        Ok(ExitReport {
            pid,
            code: status.code(),
            signal: status.signal(),
            bytes_logged,
        })
    }
}

async fn wait_exit(exit: &mut watch::Receiver<Option<ExitInfo>>) -> Option<ExitInfo> {
    match exit.wait_for(Option::is_some).await {
        Ok(info) => info.clone(),
        Err(_) => None,
    }
}

async fn copy_output(stdout: Option<ChildStdout>, mut file: File) -> io::Result<u64> {
    let Some(mut stdout) = stdout else {
        return Ok(0);
    };
    let copied = tokio::io::copy(&mut stdout, &mut file).await?;
    file.flush().await?;
    Ok(copied)
}

async fn drain_stderr(pid: u32, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(pid, "{}", line);
    }
}

async fn watch_exit(
    pid: u32,
    mut child: Child,
    mut copier: JoinHandle<io::Result<u64>>,
    exit: watch::Sender<Option<ExitInfo>>,
) {
    let status = child.wait().await.map_err(|e| e.to_string());

    // The log is closed exactly once: either the copier finishes or it is
    // aborted here, and both drop the file.
    let copied = match timeout(DRAIN_TIMEOUT, &mut copier).await {
        Ok(Ok(Ok(bytes))) => Ok(bytes),
        Ok(Ok(Err(e))) => Err(e.to_string()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => {
            copier.abort();
            Err("output still open after exit".to_string())
        }
    };

    match &status {
        Ok(status) => debug!("Process {} exited: {}", pid, status),
        Err(e) => warn!("Process {} could not be reaped: {}", pid, e),
    }
    exit.send_replace(Some(ExitInfo { status, copied }));
}
