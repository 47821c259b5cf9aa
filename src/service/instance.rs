//! # Service instance: one config, at most one live child process.
//!
//! A [`Service`] owns a sanitized [`ServiceConfig`] and drives it through a
//! single-process lifecycle:
//!
//! ```text
//!    UNSTARTED ──start──▶ RUNNING ──child exits──▶ EXITED
//!       ▲                    │                       │
//!       └────────────────────┴───────start───────────┘
//! ```
//!
//! The lifecycle signal is a single watch channel of [`Phase`]: waiting for
//! "started" or "exited" returns immediately when the service is already in
//! that phase, and blocks until the next transition otherwise. The epoch
//! increments on every transition so watchers can tell restarts apart from
//! the state they last saw.
//!
//! ## Rules
//! - At most one live child per instance; `start` fails with
//!   `AlreadyRunning` instead of racing.
//! - Exited state (pid, exit status, end time, user-stopped) is retained
//!   until the next `start` resets it. Captured output is retained across
//!   restarts; the ring indexes it by pid.
//! - Children are placed in a fresh process group so signals aimed at the
//!   daemon never propagate to services, and so `stop` can reach stubborn
//!   grandchildren via the negated group id.
//! - The state lock is never held across child I/O or child wait.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, RwLock};

use crate::config::settings::ESCALATION_INTERVAL;
use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::events::{Bus, Info, INFO_TAIL_LINES};
use crate::service::output::OutputRing;

/// Interval between periodic Info snapshots while running.
const PUBLISH_INTERVAL: Duration = Duration::from_secs(3);

/// Where the lifecycle currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phase {
    pub running: bool,
    /// Bumped on every transition; distinguishes restarts.
    pub epoch: u64,
}

#[derive(Debug, Default)]
struct RunState {
    pid: u32,
    start_time: Option<SystemTime>,
    end_time: Option<SystemTime>,
    /// `Some(success)` once the child has been reaped.
    exit_success: Option<bool>,
    /// Set when a user-requested stop observed the exit.
    user_stopped: bool,
}

/// A named service and its (at most one) live child process.
pub struct Service {
    me: Weak<Service>,
    conf: RwLock<ServiceConfig>,
    state: RwLock<RunState>,
    phase: watch::Sender<Phase>,
    output: Arc<OutputRing>,
}

impl Service {
    /// Creates an unstarted service from a sanitized config.
    pub fn new(conf: ServiceConfig) -> Arc<Service> {
        let (phase, _) = watch::channel(Phase {
            running: false,
            epoch: 0,
        });
        Arc::new_cyclic(|me| Service {
            me: me.clone(),
            conf: RwLock::new(conf),
            state: RwLock::new(RunState::default()),
            phase,
            output: Arc::new(OutputRing::new()),
        })
    }

    /// True while a child process is live.
    pub fn running(&self) -> bool {
        self.phase.borrow().running
    }

    /// Last known child pid (live or exited), 0 before the first start.
    pub async fn pid(&self) -> u32 {
        self.state.read().await.pid
    }

    /// Snapshot of the config.
    pub async fn config(&self) -> ServiceConfig {
        self.conf.read().await.clone()
    }

    pub fn output(&self) -> &Arc<OutputRing> {
        &self.output
    }

    /// A receiver of lifecycle transitions, for restart watchers.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Overwrites `auto-start`; safe on a running service.
    pub async fn set_auto_start(&self, auto_start: bool) {
        self.conf.write().await.auto_start = auto_start;
    }

    /// Overwrites `restart-on-exit`; safe on a running service.
    pub async fn set_restart_on_exit(&self, restart_on_exit: bool) {
        self.conf.write().await.restart_on_exit = restart_on_exit;
    }

    /// Mutates temp/clean-after, the only config fields that may change
    /// meaning after creation.
    pub async fn set_permanence(&self, temp: bool, clean_after: Duration) {
        let mut conf = self.conf.write().await;
        if temp {
            conf.temp = true;
            conf.clean_after = clean_after;
        } else {
            conf.temp = false;
            conf.clean_after = Duration::ZERO;
        }
    }

    /// Starts the child process.
    ///
    /// On success the service is RUNNING, the ring follows the new pid, the
    /// periodic publisher and exit watcher are live, and one snapshot has
    /// been published to `bus`.
    pub async fn start(&self, bus: &Bus) -> Result<(), ServiceError> {
        let conf = self.conf.read().await.clone();

        let mut st = self.state.write().await;
        if self.running() {
            return Err(ServiceError::AlreadyRunning);
        }

        // Clear previous run's values even if this start errors out.
        *st = RunState::default();

        let program = resolve_program(&conf.program)?;

        let mut cmd = Command::new(&program);
        cmd.args(&conf.args)
            .env_clear()
            .envs(&conf.env)
            .current_dir(&conf.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Fresh process group: daemon-directed signals must not reach
        // services, and stop() wants a group to escalate against.
        unsafe {
            cmd.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|source| ServiceError::Spawn {
            program: conf.program.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.start_kill();
            return Err(ServiceError::Spawn {
                program: conf.program.clone(),
                source: io::Error::other("failed to open output pipes"),
            });
        };

        st.pid = pid;
        st.start_time = Some(SystemTime::now());
        // Transition while still holding the state lock so a concurrent
        // start can't observe the gap.
        self.phase.send_modify(|p| {
            p.running = true;
            p.epoch += 1;
        });
        drop(st);

        tracing::info!(service = %conf.name, program = %conf.program, pid, "service started");

        let output_done = Arc::clone(&self.output)
            .follow_new_process(pid, stdout, stderr)
            .await;
        self.spawn_publisher(bus.clone());
        self.spawn_exit_watcher(child, output_done, bus.clone());

        bus.publish(self.info().await);
        Ok(())
    }

    /// Stops the child with escalating signals.
    ///
    /// For each target in `[pid, -pgid]`, sends INT, TERM, then KILL,
    /// waiting up to `escalation` (default 10s) after each for the exit
    /// watcher to observe the child gone. A no-op when not running.
    pub async fn stop(&self, escalation: Duration) -> Result<(), ServiceError> {
        if !self.running() {
            return Ok(());
        }
        let escalation = if escalation.is_zero() {
            ESCALATION_INTERVAL
        } else {
            escalation
        };

        let pid = self.state.read().await.pid;
        if pid == 0 {
            return Ok(());
        }

        let name = self.conf.read().await.name.clone();
        let mut rx = self.phase.subscribe();

        // The child is its own group leader, so -pid addresses the group;
        // the fallback reach for stubborn subprocesses.
        for target in [pid as i32, -(pid as i32)] {
            for sig in [libc::SIGINT, libc::SIGTERM, libc::SIGKILL] {
                tracing::debug!(service = %name, target, sig, "sending stop signal");
                unsafe {
                    libc::kill(target, sig);
                }

                let timed_out = tokio::time::timeout(escalation, rx.wait_for(|p| !p.running))
                    .await
                    .is_err();
                if !timed_out {
                    self.state.write().await.user_stopped = true;
                    return Ok(());
                }
            }
        }

        Err(ServiceError::StopFailed)
    }

    /// Blocks until the service is not running. Immediate when stopped.
    pub async fn wait(&self) {
        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|p| !p.running).await;
    }

    /// Computes an Info snapshot under shared locks.
    pub async fn info(&self) -> Info {
        let conf = self.conf.read().await.clone();
        let st = self.state.read().await;
        let running = self.running();

        let runtime = match (running, st.start_time, st.end_time) {
            (true, Some(start), _) => SystemTime::now()
                .duration_since(start)
                .unwrap_or_default(),
            (false, Some(start), Some(end)) => end.duration_since(start).unwrap_or_default(),
            _ => Duration::ZERO,
        };

        let succeeded = !running
            && (st.user_stopped || (!conf.restart_on_exit && st.exit_success == Some(true)));

        let tail = self.output.tail_lines(INFO_TAIL_LINES).await;

        Info {
            running,
            pid: st.pid,
            succeeded,
            dead: false,
            start_time: st.start_time,
            end_time: st.end_time,
            runtime,
            tail,
            config: conf,
        }
    }

    /// Publishes a snapshot every few seconds while this run lasts.
    fn spawn_publisher(&self, bus: Bus) {
        let Some(svc) = self.me.upgrade() else { return };
        let run_epoch = self.phase.borrow().epoch;

        tokio::spawn(async move {
            let mut rx = svc.phase.subscribe();
            let mut ticker = tokio::time::interval(PUBLISH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                {
                    let p = rx.borrow_and_update();
                    if !p.running || p.epoch != run_epoch {
                        return;
                    }
                }
                tokio::select! {
                    res = rx.changed() => {
                        if res.is_err() {
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        bus.publish(svc.info().await);
                    }
                }
            }
        });
    }

    /// Waits for output to drain, reaps the child, records the exit, and
    /// publishes the final snapshot of this run.
    fn spawn_exit_watcher(
        &self,
        mut child: Child,
        output_done: oneshot::Receiver<()>,
        bus: Bus,
    ) {
        let Some(svc) = self.me.upgrade() else { return };
        tokio::spawn(async move {
            // Exhaust both pipes before waiting; wait() would close them
            // under the scanners otherwise.
            let _ = output_done.await;

            let status = child.wait().await;
            let success = status.as_ref().map(|s| s.success()).unwrap_or(false);

            {
                let conf = svc.conf.read().await;
                match &status {
                    Ok(s) => tracing::info!(
                        service = %conf.name,
                        program = %conf.program,
                        status = %s,
                        "service exited"
                    ),
                    Err(err) => tracing::warn!(
                        service = %conf.name,
                        error = %err,
                        "failed to reap service"
                    ),
                }
            }

            {
                let mut st = svc.state.write().await;
                st.end_time = Some(SystemTime::now());
                st.exit_success = Some(success);
                svc.phase.send_modify(|p| {
                    p.running = false;
                    p.epoch += 1;
                });
            }

            bus.publish(svc.info().await);
        });
    }
}

/// Resolves a program to an executable path.
///
/// Bare names are looked up on PATH; anything containing a separator is
/// checked as-is.
fn resolve_program(program: &str) -> Result<PathBuf, ServiceError> {
    let as_path = Path::new(program);
    if program.contains('/') {
        if is_executable(as_path) {
            return Ok(as_path.to_path_buf());
        }
        return Err(ServiceError::Resolve {
            program: program.to_string(),
        });
    }

    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(program);
            if is_executable(&candidate) {
                return Ok(candidate);
            }
        }
    }

    Err(ServiceError::Resolve {
        program: program.to_string(),
    })
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn conf(name: &str, program: &str, args: &[&str]) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            dir: PathBuf::from("/"),
            env: BTreeMap::new(),
            auto_start: false,
            restart_on_exit: false,
            temp: false,
            clean_after: Duration::ZERO,
        }
    }

    fn test_bus() -> Bus {
        let (bus, pump, _updates) = Bus::new();
        pump.spawn(|_| {});
        bus
    }

    #[test]
    fn resolve_finds_sh() {
        assert!(resolve_program("sh").is_ok());
        assert!(resolve_program("/bin/sh").is_ok());
        assert!(resolve_program("definitely-not-a-real-program-xyz").is_err());
    }

    #[tokio::test]
    async fn echo_service_runs_to_success() {
        let bus = test_bus();
        let svc = Service::new(conf("echo", "sh", &["-c", "echo out; echo err >&2"]));

        svc.start(&bus).await.expect("start");
        tokio::time::timeout(Duration::from_secs(5), svc.wait())
            .await
            .expect("exit timed out");

        let info = svc.info().await;
        assert!(!info.running);
        assert!(info.succeeded);
        assert!(info.pid > 0);
        assert!(info.end_time.is_some());

        // Give the final flush a moment, then both streams are in the ring.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let chunk = svc.output().get(0, 0, 0).await;
        let mut texts: Vec<&str> = chunk.lines.iter().map(|l| l.text.as_str()).collect();
        texts.sort_unstable();
        assert_eq!(texts, vec!["err", "out"]);
        assert!(chunk.lines.iter().any(|l| l.stderr));
        assert!(chunk.lines.iter().any(|l| !l.stderr));
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let bus = test_bus();
        let svc = Service::new(conf("sleeper", "sleep", &["5"]));

        svc.start(&bus).await.expect("start");
        assert!(matches!(
            svc.start(&bus).await,
            Err(ServiceError::AlreadyRunning)
        ));

        svc.stop(Duration::from_millis(200)).await.expect("stop");
        assert!(!svc.running());
    }

    #[tokio::test]
    async fn stop_marks_user_stopped() {
        let bus = test_bus();
        let svc = Service::new(conf("sleeper", "sleep", &["30"]));

        svc.start(&bus).await.expect("start");
        svc.stop(Duration::from_millis(500)).await.expect("stop");

        let info = svc.info().await;
        assert!(!info.running);
        assert!(info.succeeded, "a user stop counts as success");
        assert!(info.end_time.is_some());

        // Wait after stop returns immediately.
        tokio::time::timeout(Duration::from_millis(100), svc.wait())
            .await
            .expect("wait should not block after stop");
    }

    #[tokio::test]
    async fn stop_when_not_running_is_ok() {
        let svc = Service::new(conf("idle", "true", &[]));
        svc.stop(Duration::from_millis(100)).await.expect("idempotent stop");
    }

    #[tokio::test]
    async fn missing_program_is_resolve_error() {
        let bus = test_bus();
        let svc = Service::new(conf("ghost", "definitely-not-a-real-program-xyz", &[]));
        assert!(matches!(
            svc.start(&bus).await,
            Err(ServiceError::Resolve { .. })
        ));
        assert!(!svc.running());
    }

    #[tokio::test]
    async fn env_is_not_inherited() {
        std::env::set_var("PROCVISOR_TEST_LEAK", "leaked");
        let bus = test_bus();
        let mut c = conf("env-check", "sh", &["-c", "echo \"v=${PROCVISOR_TEST_LEAK:-none}\""]);
        c.env.insert("OWN".to_string(), "1".to_string());
        let svc = Service::new(c);

        svc.start(&bus).await.expect("start");
        tokio::time::timeout(Duration::from_secs(5), svc.wait())
            .await
            .expect("exit timed out");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let chunk = svc.output().get(0, 0, 0).await;
        assert_eq!(chunk.lines.len(), 1);
        assert_eq!(chunk.lines[0].text, "v=none");
    }
}
