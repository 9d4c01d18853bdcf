//! Process supervisor
//!
//! Runs long-lived units as child processes. Their stdout/stderr lines are
//! pushed through a bounded queue and re-emitted through `tracing` with a
//! `unit` field. A unit that exits non-zero while the supervisor is active is
//! restarted after a fixed backoff, up to `max_restarts` within the restart
//! window. Cancellation sends SIGTERM and escalates to SIGKILL after the
//! shutdown grace.

use crate::config::SupervisorConfig;
use crate::error::AppError;
use futures::future::join_all;
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the log-line queue between children and the forwarder.
const LINE_QUEUE_CAPACITY: usize = 256;

/// One supervised unit
#[derive(Debug, Clone)]
pub struct UnitSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
}

impl UnitSpec {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// How a unit's supervision ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitExit {
    /// The child exited 0 on its own.
    Completed,
    /// Cancellation stopped the child.
    Stopped,
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub backoff: Duration,
    pub max_restarts: usize,
    pub window: Duration,
    pub shutdown_grace: Duration,
}

impl From<&SupervisorConfig> for RestartPolicy {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            backoff: Duration::from_secs(config.restart_backoff_secs),
            max_restarts: config.max_restarts,
            window: Duration::from_secs(config.restart_window_secs),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
        }
    }
}

struct UnitLine {
    unit: String,
    stream: &'static str,
    line: String,
}

pub struct Supervisor {
    policy: RestartPolicy,
}

impl Supervisor {
    pub fn new(policy: RestartPolicy) -> Self {
        Self { policy }
    }

    /// Supervise every unit until all of them end. When one unit gives up,
    /// the others are stopped and the crash is returned.
    pub async fn run_all(
        &self,
        units: Vec<UnitSpec>,
        cancel: CancellationToken,
    ) -> Result<(), AppError> {
        let token = cancel.child_token();
        let runs = units.into_iter().map(|unit| {
            let token = token.clone();
            async move {
                let result = self.run(unit, token.clone()).await;
                if result.is_err() {
                    token.cancel();
                }
                result
            }
        });

        let mut first_error = None;
        for result in join_all(runs).await {
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Supervise a single unit.
    pub async fn run(&self, unit: UnitSpec, cancel: CancellationToken) -> Result<UnitExit, AppError> {
        let (tx, rx) = mpsc::channel(LINE_QUEUE_CAPACITY);
        tokio::spawn(forward_lines(rx));

        let mut restarts: VecDeque<Instant> = VecDeque::new();

        loop {
            if cancel.is_cancelled() {
                return Ok(UnitExit::Stopped);
            }

            let mut child = spawn_unit(&unit, &tx)?;
            info!("▶️  Started unit {} (pid {:?})", unit.name, child.id());

            let status = tokio::select! {
                status = child.wait() => status?,
                _ = cancel.cancelled() => {
                    terminate(&unit.name, &mut child, self.policy.shutdown_grace).await;
                    return Ok(UnitExit::Stopped);
                }
            };

            if status.success() {
                info!("Unit {} exited cleanly", unit.name);
                return Ok(UnitExit::Completed);
            }

            let now = Instant::now();
            while restarts
                .front()
                .is_some_and(|at| now.duration_since(*at) > self.policy.window)
            {
                restarts.pop_front();
            }
            if restarts.len() >= self.policy.max_restarts {
                error!(
                    "❌ Unit {} crashed {} times within {:?}, giving up",
                    unit.name,
                    restarts.len() + 1,
                    self.policy.window
                );
                return Err(AppError::SubprocessCrash(format!(
                    "{} exited with {} and exhausted its restart budget",
                    unit.name,
                    describe(status)
                )));
            }
            restarts.push_back(now);

            warn!(
                "⚠️  Unit {} exited with {}, restarting in {:?}",
                unit.name,
                describe(status),
                self.policy.backoff
            );
            tokio::select! {
                _ = cancel.cancelled() => return Ok(UnitExit::Stopped),
                _ = tokio::time::sleep(self.policy.backoff) => {}
            }
        }
    }
}

fn spawn_unit(unit: &UnitSpec, tx: &mpsc::Sender<UnitLine>) -> Result<Child, AppError> {
    let mut child = Command::new(&unit.program)
        .args(&unit.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AppError::SubprocessCrash(format!("failed to spawn {}: {}", unit.name, e)))?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(read_lines(unit.name.clone(), "stdout", stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(read_lines(unit.name.clone(), "stderr", stderr, tx.clone()));
    }
    Ok(child)
}

async fn read_lines<R>(unit: String, stream: &'static str, reader: R, tx: mpsc::Sender<UnitLine>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let sent = tx
            .send(UnitLine {
                unit: unit.clone(),
                stream,
                line,
            })
            .await;
        if sent.is_err() {
            break;
        }
    }
}

async fn forward_lines(mut rx: mpsc::Receiver<UnitLine>) {
    while let Some(entry) = rx.recv().await {
        info!(unit = %entry.unit, stream = entry.stream, "{}", entry.line);
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
async fn terminate(name: &str, child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        debug!("Sending SIGTERM to unit {} (pid {})", name, pid);
        send_sigterm(pid);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => info!("Unit {} stopped ({})", name, describe(status)),
        Ok(Err(e)) => warn!("Failed waiting for unit {}: {}", name, e),
        Err(_) => {
            warn!("Unit {} ignored SIGTERM for {:?}, killing", name, grace);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill unit {}: {}", name, e);
            }
        }
    }
}

/// Ask a process to terminate. Returns false when the signal could not be
/// delivered (no such process).
pub fn send_sigterm(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Some(pid) = valid_pid(pid) else {
            return false;
        };
        // SAFETY: kill(2) has no memory-safety preconditions.
        unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Whether a process with this pid is alive.
pub fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Some(pid) = valid_pid(pid) else {
            return false;
        };
        // SAFETY: signal 0 only performs the permission and existence check.
        unsafe { libc::kill(pid, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Zero and negative values address process groups; never signal those.
#[cfg(unix)]
fn valid_pid(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|p| *p > 0)
}

fn describe(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn policy(max_restarts: usize) -> RestartPolicy {
        RestartPolicy {
            backoff: Duration::from_millis(10),
            max_restarts,
            window: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    fn sh(name: &str, script: &str) -> UnitSpec {
        UnitSpec::new(name, "sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn clean_exit_is_not_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("starts");
        let unit = sh("once", &format!("echo start >> {}; exit 0", marker.display()));

        let exit = Supervisor::new(policy(3))
            .run(unit, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(exit, UnitExit::Completed);
        let starts = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(starts.lines().count(), 1);
    }

    #[tokio::test]
    async fn crashing_unit_restarts_until_budget_is_spent() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("starts");
        let unit = sh("crashy", &format!("echo start >> {}; exit 3", marker.display()));

        let result = Supervisor::new(policy(2))
            .run(unit, CancellationToken::new())
            .await;

        assert!(matches!(result, Err(AppError::SubprocessCrash(_))));
        let starts = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(starts.lines().count(), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_running_unit() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let exit = Supervisor::new(policy(3))
            .run(UnitSpec::new("sleeper", "sleep").arg("30"), cancel)
            .await
            .unwrap();

        assert_eq!(exit, UnitExit::Stopped);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn one_unit_giving_up_stops_the_others() {
        let units = vec![
            UnitSpec::new("sleeper", "sleep").arg("30"),
            sh("crashy", "exit 1"),
        ];

        let started = Instant::now();
        let result = Supervisor::new(policy(0))
            .run_all(units, CancellationToken::new())
            .await;

        assert!(matches!(result, Err(AppError::SubprocessCrash(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(0));
        assert!(!send_sigterm(u32::MAX));
    }
}
