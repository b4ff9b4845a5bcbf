//! Target-process lifecycle and coverage collection.
//!
//! An [`Agent`] owns exactly one target process at a time and walks the
//! state machine `Idle -> Running -> Stopped`, one execution per pass.
//! Exit codes are classified against the *configured* crash and timeout
//! codes of the instrumentation wrapper. A watchdog thread is armed at
//! `start` and kills the target when the budget expires, so even an
//! exchange blocked on a hung target is unblocked by the child's death;
//! the run is recorded as a timeout. Coverage collection degrades to an
//! all-zero map when the wrapper left no (or a garbled) hit-count file,
//! it never aborts the loop.

use std::{
    fs,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
    time::{Duration, Instant, SystemTime},
};

use crate::{config::EngineConfig, coverage::CoverageMap, trace::Trace, Error};

/// How one target execution ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitKind {
    /// The target exited (or was stopped by the engine) normally.
    Ok,
    /// The wrapper reported a target crash.
    Crash,
    /// The wrapper reported a timeout, or the watchdog expired.
    Timeout,
}

/// Lifecycle states of an [`Agent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentState {
    /// No execution yet.
    Idle,
    /// A target process is live.
    Running,
    /// The last execution finished, results can be collected.
    Stopped,
}

/// The full outcome of one execution. Never mutated after creation.
#[derive(Clone, Debug)]
pub struct ExecutionResult {
    /// Process-wide unique run identifier.
    pub run_id: u64,
    /// The trace the engine intended to execute.
    pub trace: Trace,
    /// What was actually sent and received, as reported by the wire
    /// collaborator. May diverge from `trace`.
    pub observed: Trace,
    /// Crash/timeout classification.
    pub exit: ExitKind,
    /// Wall-clock start of the execution.
    pub started: SystemTime,
    /// Wall-clock end of the execution.
    pub stopped: SystemTime,
    /// The run's coverage map (all-zero under degraded collection).
    pub coverage: CoverageMap,
    /// The hit-count file this run's coverage was read from.
    pub hitcount_file: PathBuf,
    /// The target's log file for this run.
    pub log_file: PathBuf,
}

impl ExecutionResult {
    /// True if the target crashed.
    #[must_use]
    pub fn crash(&self) -> bool {
        self.exit == ExitKind::Crash
    }

    /// True if the run timed out.
    #[must_use]
    pub fn timeout(&self) -> bool {
        self.exit == ExitKind::Timeout
    }
}

/// The narrow seam to the wire-level collaborator: serialize the trace,
/// run the protocol exchange, report what was actually observed.
pub trait TargetExecutor {
    /// Executes `trace` against the live target and returns the
    /// observed trace.
    fn execute_trace(&mut self, trace: &Trace) -> Result<Trace, Error>;
}

/// An executor that performs no I/O and always reports the same
/// observed trace. The stand-in for tests and dry runs.
#[derive(Clone, Debug)]
pub struct StaticExecutor {
    observed: Trace,
}

impl StaticExecutor {
    /// An executor always observing `observed`.
    #[must_use]
    pub fn new(observed: Trace) -> Self {
        Self { observed }
    }
}

impl TargetExecutor for StaticExecutor {
    fn execute_trace(&mut self, _trace: &Trace) -> Result<Trace, Error> {
        Ok(self.observed.clone())
    }
}

/// Substitutes the invocation template's placeholders and splits it
/// into argv. `[output]`, `[id]`, `[cert]` and `[key]` are replaced
/// token-wise.
#[must_use]
pub fn render_command(
    template: &str,
    output_dir: &Path,
    run_id: u64,
    cert: &Path,
    key: &Path,
) -> Vec<String> {
    template
        .split_whitespace()
        .map(|token| {
            token
                .replace("[output]", &output_dir.display().to_string())
                .replace("[id]", &run_id.to_string())
                .replace("[cert]", &cert.display().to_string())
                .replace("[key]", &key.display().to_string())
        })
        .collect()
}

/// The per-execution watchdog thread and its cancel channel.
#[derive(Debug)]
struct Watchdog {
    cancel: mpsc::Sender<()>,
    thread: thread::JoinHandle<()>,
}

/// Owns one target-process lifecycle and converts raw instrumentation
/// output into a [`CoverageMap`].
#[derive(Debug)]
pub struct Agent {
    config: Arc<EngineConfig>,
    state: AgentState,
    /// Shared with the watchdog thread, which kills the child in place
    /// when the budget expires.
    child: Arc<Mutex<Option<Child>>>,
    watchdog: Option<Watchdog>,
    timed_out: Arc<AtomicBool>,
    run_id: u64,
    launched: Option<Instant>,
    started: SystemTime,
    stopped: SystemTime,
    exit: ExitKind,
}

impl Agent {
    /// A fresh, idle agent.
    #[must_use]
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self {
            config,
            state: AgentState::Idle,
            child: Arc::new(Mutex::new(None)),
            watchdog: None,
            timed_out: Arc::new(AtomicBool::new(false)),
            run_id: 0,
            launched: None,
            started: SystemTime::UNIX_EPOCH,
            stopped: SystemTime::UNIX_EPOCH,
            exit: ExitKind::Ok,
        }
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> AgentState {
        self.state
    }

    fn hitcount_file(&self, run_id: u64) -> PathBuf {
        self.config.output_dir.join(format!("{run_id}.cov"))
    }

    fn log_file(&self, run_id: u64) -> PathBuf {
        self.config.output_dir.join(format!("{run_id}.log"))
    }

    /// Launches the target under the instrumentation wrapper for one
    /// execution, binding the configured certificate and key, and arms
    /// the watchdog for it.
    pub fn start(&mut self, run_id: u64) -> Result<(), Error> {
        if self.state == AgentState::Running {
            return Err(Error::agent_lifecycle("cannot start a running agent"));
        }
        fs::create_dir_all(&self.config.output_dir)?;
        let argv = render_command(
            &self.config.command,
            &self.config.output_dir,
            run_id,
            &self.config.cert_file,
            &self.config.key_file,
        );
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::configuration("empty target command"))?;
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        log::debug!("run {run_id}: launched target `{program}` (pid {})", child.id());

        *self.child.lock().expect("agent child lock poisoned") = Some(child);
        self.timed_out.store(false, Ordering::Relaxed);
        self.watchdog = Some(self.arm_watchdog(run_id));
        self.run_id = run_id;
        self.launched = Some(Instant::now());
        self.started = SystemTime::now();
        self.state = AgentState::Running;
        Ok(())
    }

    /// Spawns the watchdog for the current execution. Cancelled by
    /// `stop`; on expiry it kills the child while it still sits in the
    /// shared slot, which also unblocks an exchange hanging on it.
    fn arm_watchdog(&self, run_id: u64) -> Watchdog {
        let (cancel, expiry) = mpsc::channel();
        let slot = Arc::clone(&self.child);
        let timed_out = Arc::clone(&self.timed_out);
        let budget = self.config.exec_timeout;
        let thread = thread::spawn(move || {
            if expiry.recv_timeout(budget).is_ok() {
                return;
            }
            let mut slot = slot.lock().expect("agent child lock poisoned");
            if let Some(child) = slot.as_mut() {
                let _ = child.kill();
                timed_out.store(true, Ordering::Relaxed);
                log::warn!("run {run_id}: watchdog expired after {budget:?}, target killed");
            }
        });
        Watchdog { cancel, thread }
    }

    /// Disarms the watchdog, terminates the target and classifies how
    /// it ended.
    ///
    /// A process the watchdog already killed is recorded as
    /// [`ExitKind::Timeout`]; a process that already exited is
    /// classified by its exit code; anything the engine stopped itself
    /// counts as a normal end.
    pub fn stop(&mut self) -> Result<(), Error> {
        if self.state != AgentState::Running {
            return Err(Error::agent_lifecycle("cannot stop a stopped agent"));
        }
        let mut child = self
            .child
            .lock()
            .expect("agent child lock poisoned")
            .take()
            .expect("running agent owns a child");
        // disarm before classifying so the expiry flag is settled
        if let Some(watchdog) = self.watchdog.take() {
            let _ = watchdog.cancel.send(());
            let _ = watchdog.thread.join();
        }
        let elapsed = self
            .launched
            .take()
            .map_or(Duration::ZERO, |at| at.elapsed());
        let budget = self.config.exec_timeout;

        self.exit = if self.timed_out.load(Ordering::Relaxed) {
            child.wait()?;
            ExitKind::Timeout
        } else {
            match child.try_wait()? {
                Some(status) => self.classify(status.code()),
                None if elapsed >= budget => {
                    child.kill()?;
                    child.wait()?;
                    log::warn!(
                        "run {}: watchdog expired after {elapsed:?}, target killed",
                        self.run_id
                    );
                    ExitKind::Timeout
                }
                None => {
                    child.kill()?;
                    let status = child.wait()?;
                    self.classify(status.code())
                }
            }
        };
        self.stopped = SystemTime::now();
        self.state = AgentState::Stopped;
        Ok(())
    }

    fn classify(&self, code: Option<i32>) -> ExitKind {
        match code {
            Some(code) if code == self.config.crash_exit_code => ExitKind::Crash,
            Some(code) if code == self.config.timeout_exit_code => ExitKind::Timeout,
            // signal-terminated by our own kill, or a normal exit
            _ => ExitKind::Ok,
        }
    }

    /// Builds the [`ExecutionResult`] for the last execution.
    ///
    /// A missing or empty hit-count file, and a file rejected by the
    /// parser, both degrade to an all-zero coverage map; neither fails
    /// the run.
    pub fn collect_result(&self, trace: Trace, observed: Trace) -> Result<ExecutionResult, Error> {
        if self.state != AgentState::Stopped {
            return Err(Error::agent_lifecycle(
                "cannot collect results, agent still running",
            ));
        }
        let hitcount_file = self.hitcount_file(self.run_id);
        let map_len = self.config.map_len;

        let coverage = if hitcount_file.exists() {
            match CoverageMap::from_hitcount_file(&hitcount_file, map_len) {
                Ok(map) => map,
                Err(err) => {
                    log::error!(
                        "run {}: rejected hit-count file {}: {err}",
                        self.run_id,
                        hitcount_file.display()
                    );
                    CoverageMap::new(map_len)
                }
            }
        } else {
            log::warn!(
                "run {}: no instrumentation output at {}, degrading to empty coverage",
                self.run_id,
                hitcount_file.display()
            );
            CoverageMap::new(map_len)
        };

        Ok(ExecutionResult {
            run_id: self.run_id,
            trace,
            observed,
            exit: self.exit,
            started: self.started,
            stopped: self.stopped,
            coverage,
            hitcount_file,
            log_file: self.log_file(self.run_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{env, fs, path::Path, sync::Arc, thread, time::Duration};

    use super::{render_command, Agent, AgentState, ExitKind};
    use crate::{config::EngineConfig, trace::Trace, Error};

    fn config_with_timeout(command: &str, exec_timeout: Duration) -> Arc<EngineConfig> {
        let tmp = env::temp_dir().join("evofuzz-agent-tests");
        Arc::new(
            EngineConfig::builder()
                .command(command)
                .output_dir(tmp.clone())
                .findings_dir(tmp.join("findings"))
                .cert_file("cert.pem")
                .key_file("key.pem")
                .map_len(16)
                .exec_timeout(exec_timeout)
                .build(),
        )
    }

    fn config_with_command(command: &str) -> Arc<EngineConfig> {
        config_with_timeout(command, Duration::from_secs(5))
    }

    #[test]
    fn test_render_command_substitutes_placeholders() {
        let argv = render_command(
            "wrapper -o [output]/[id].cov -- server [cert] [key]",
            Path::new("/tmp/out"),
            42,
            Path::new("/pki/cert.pem"),
            Path::new("/pki/key.pem"),
        );
        assert_eq!(
            argv,
            vec![
                "wrapper",
                "-o",
                "/tmp/out/42.cov",
                "--",
                "server",
                "/pki/cert.pem",
                "/pki/key.pem"
            ]
        );
    }

    #[test]
    fn test_double_start_is_a_lifecycle_error() {
        let mut agent = Agent::new(config_with_command("sleep 5"));
        agent.start(1).unwrap();
        assert!(matches!(agent.start(2), Err(Error::AgentLifecycle(_))));
        agent.stop().unwrap();
    }

    #[test]
    fn test_stop_when_idle_is_a_lifecycle_error() {
        let mut agent = Agent::new(config_with_command("true"));
        assert!(matches!(agent.stop(), Err(Error::AgentLifecycle(_))));
    }

    #[test]
    fn test_collect_while_running_is_a_lifecycle_error() {
        let mut agent = Agent::new(config_with_command("sleep 5"));
        agent.start(3).unwrap();
        let res = agent.collect_result(Trace::new(), Trace::new());
        assert!(matches!(res, Err(Error::AgentLifecycle(_))));
        agent.stop().unwrap();
    }

    #[test]
    fn test_missing_hitcount_file_degrades_to_zero_map() {
        let mut agent = Agent::new(config_with_command("true"));
        agent.start(4).unwrap();
        agent.stop().unwrap();
        let result = agent.collect_result(Trace::new(), Trace::new()).unwrap();
        assert_eq!(result.coverage.covered(), 0);
        assert_eq!(result.coverage.len(), 16);
    }

    #[test]
    fn test_crash_exit_code_is_classified() {
        // diff on two nonexistent files exits with code 2
        let mut agent = Agent::new(config_with_command("diff /nonexistent/a /nonexistent/b"));
        agent.start(5).unwrap();
        // give the process a moment to exit on its own
        thread::sleep(Duration::from_millis(200));
        agent.stop().unwrap();
        assert_eq!(agent.state(), AgentState::Stopped);
        let result = agent.collect_result(Trace::new(), Trace::new()).unwrap();
        assert_eq!(result.exit, ExitKind::Crash);
        assert!(result.crash());
    }

    #[test]
    fn test_watchdog_kills_a_hung_target_mid_exchange() {
        let config = config_with_timeout("sleep 5", Duration::from_millis(200));
        let mut agent = Agent::new(config);
        agent.start(7).unwrap();

        // the exchange hangs: nobody calls stop while the budget runs out
        thread::sleep(Duration::from_millis(800));
        let status = agent
            .child
            .lock()
            .unwrap()
            .as_mut()
            .unwrap()
            .try_wait()
            .unwrap();
        assert!(status.is_some(), "target should be dead before stop");

        agent.stop().unwrap();
        let result = agent.collect_result(Trace::new(), Trace::new()).unwrap();
        assert_eq!(result.exit, ExitKind::Timeout);
        assert!(result.timeout());
    }

    #[test]
    fn test_garbled_hitcount_file_degrades_to_zero_map() {
        let mut agent = Agent::new(config_with_command("true"));
        agent.start(6).unwrap();
        agent.stop().unwrap();
        let path = env::temp_dir().join("evofuzz-agent-tests").join("6.cov");
        fs::write(&path, "bogus:line:here\n").unwrap();
        let result = agent.collect_result(Trace::new(), Trace::new()).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(result.coverage.covered(), 0);
    }
}
