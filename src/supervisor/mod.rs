mod ticks;
#[cfg(test)]
mod tests;

use std::process::Child;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::SupervisorConfig;
use crate::exclusion::ExclusionSet;
use crate::launcher::{self, LaunchError, LaunchRequest, TerminalWrapper};
use crate::output::{self, OutputCapture};
use crate::prelude::*;
use crate::process::{ProcessTable, ProcessTree, SystemProcessTable, WalkOrder, kill_process};
use crate::runner::RunnerAdapter;
use crate::supervisor::ticks::{MonitorState, TickContext, TickDecision};

/// How long `finish` waits for the drain threads to hit EOF before the
/// capture is sealed anyway.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    /// The whole process tree is gone.
    TreeDrained,
    /// Only excluded processes were left for the configured number of ticks.
    IdleTimeout,
    /// The runner declared the game dead.
    RunnerStopped,
    /// `stop` was called.
    Requested,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            StopReason::TreeDrained => "the process tree drained",
            StopReason::IdleTimeout => "no game processes were left",
            StopReason::RunnerStopped => "the runner stopped the game",
            StopReason::Requested => "stop was requested",
        };
        f.write_str(text)
    }
}

/// Final report of one supervised session, delivered exactly once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionOutcome {
    /// Exit code of the root process, when it exited and reported one.
    pub exit_code: Option<i32>,
    pub reason: StopReason,
    /// Bounded tail of the game's combined stdout and stderr.
    pub output: String,
}

struct Control {
    finishing: bool,
    is_running: bool,
    root_exited: bool,
    last_exit_code: Option<i32>,
    attached: Vec<Supervisor>,
    stop_hook: Option<Box<dyn FnOnce() + Send>>,
}

struct Shared {
    root_pid: u32,
    config: SupervisorConfig,
    exclusions: ExclusionSet,
    runner: Arc<dyn RunnerAdapter>,
    capture: OutputCapture,
    drains: Mutex<Vec<std::thread::JoinHandle<()>>>,
    control: Mutex<Control>,
    outcome_tx: watch::Sender<Option<SessionOutcome>>,
}

impl Shared {
    fn record_exit(&self, code: Option<i32>) {
        let mut control = self.control.lock().unwrap();
        control.root_exited = true;
        control.last_exit_code = code;
    }

    fn root_exited(&self) -> bool {
        self.control.lock().unwrap().root_exited
    }

    /// Single exit path of a session. The first caller wins; everyone else
    /// returns immediately. Ordering: attached sessions stop, then the stop
    /// hook runs, then `is_running` flips, then the tree is killed if asked,
    /// then the outcome fires.
    fn finish(&self, reason: StopReason, force_kill_tree: bool) {
        let (attached, stop_hook) = {
            let mut control = self.control.lock().unwrap();
            if control.finishing {
                return;
            }
            control.finishing = true;
            (
                std::mem::take(&mut control.attached),
                control.stop_hook.take(),
            )
        };

        for child in attached {
            child.stop(false);
        }
        if let Some(stop_hook) = stop_hook {
            stop_hook();
        }

        self.control.lock().unwrap().is_running = false;

        if force_kill_tree {
            self.kill_tree();
        }

        // Once the tree drained, the root exited or the tree was just killed,
        // the pipe writers are gone and the drains hit EOF within moments.
        // Let them pull the last bytes out of the pipes before the capture
        // freezes.
        if reason == StopReason::TreeDrained || force_kill_tree || self.root_exited() {
            self.join_drains();
        }

        self.capture.seal();
        let outcome = SessionOutcome {
            exit_code: self.control.lock().unwrap().last_exit_code,
            reason,
            output: self.capture.contents(),
        };
        debug!(
            "session over: {:?}, exit code {:?}",
            reason, outcome.exit_code
        );
        self.outcome_tx.send_replace(Some(outcome));
    }

    /// Wait for the drain threads, but never longer than `DRAIN_GRACE`: a
    /// drain wedged on a backpressured echo sink must not wedge the stop
    /// path.
    fn join_drains(&self) {
        let handles = std::mem::take(&mut *self.drains.lock().unwrap());
        let deadline = Instant::now() + DRAIN_GRACE;
        for handle in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }

    fn kill_tree(&self) {
        let mut table = SystemProcessTable::new();
        kill_tree_with(self.root_pid, self.runner.as_ref(), &mut table, |pid| {
            if let Err(err) = kill_process(pid) {
                warn!("{err}");
            }
        });
    }
}

/// Signal every process of the tree from the leaves up, so a parent is never
/// taken down while its children still depend on it. When the table cannot be
/// read the root is still signaled.
fn kill_tree_with(
    root_pid: u32,
    runner: &dyn RunnerAdapter,
    table: &mut dyn ProcessTable,
    mut kill: impl FnMut(u32),
) {
    let tree = match ProcessTree::capture(root_pid, table, Some(runner)) {
        Ok(tree) => tree,
        Err(err) => {
            warn!("cannot walk the tree for the kill: {err}");
            kill(root_pid);
            return;
        }
    };

    for snapshot in tree.walk(WalkOrder::BottomUp) {
        debug!("killing {} ({})", snapshot.name, snapshot.pid);
        kill(snapshot.pid);
    }
}

/// Watches one launched game session: spawns the command, re-walks its process
/// tree on every heartbeat and decides when the session is really over.
///
/// Cheap to clone; every clone observes the same session.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
    outcome: watch::Receiver<Option<SessionOutcome>>,
}

impl Supervisor {
    /// Spawn the command and arm the heartbeat. Must be called from within a
    /// tokio runtime; the monitor runs as a background task.
    pub fn launch(
        mut request: LaunchRequest,
        runner: Arc<dyn RunnerAdapter>,
        config: SupervisorConfig,
    ) -> Result<Self, LaunchError> {
        // A zero heartbeat would panic the interval timer and a zero idle
        // threshold would end the session on its very first tick.
        let config = SupervisorConfig {
            heartbeat: config.heartbeat.max(Duration::from_millis(1)),
            max_idle_ticks: config.max_idle_ticks.max(1),
            ..config
        };

        if request.working_directory.is_none() {
            request.working_directory = runner
                .working_directory()
                .map(|dir| dir.to_string_lossy().into_owned());
        }

        let mut launched = launcher::launch(&request)?;

        let mut exclusions = ExclusionSet::baseline();
        exclusions.extend(config.extra_exclusions.iter().cloned());
        exclusions.extend(runner.excluded_process_names());
        if let Some(wrapper) = &launched.wrapper {
            exclusions.extend(wrapper.excluded_names().iter().cloned());
        }

        let capture = OutputCapture::new(config.capture_limit_bytes);
        let mut drains = Vec::new();
        if let Some(stdout) = launched.child.stdout.take() {
            let echo = config.echo_output.then(std::io::stdout);
            drains.push(output::spawn_drain(stdout, echo, capture.clone(), None));
        }
        if let Some(stderr) = launched.child.stderr.take() {
            let echo = config.echo_output.then(std::io::stderr);
            drains.push(output::spawn_drain(
                stderr,
                echo,
                capture.clone(),
                Some("[stderr]"),
            ));
        }

        let (outcome_tx, outcome_rx) = watch::channel(None);
        let shared = Arc::new(Shared {
            root_pid: launched.child.id(),
            config,
            exclusions,
            runner,
            capture,
            drains: Mutex::new(drains),
            control: Mutex::new(Control {
                finishing: false,
                is_running: true,
                root_exited: false,
                last_exit_code: None,
                attached: Vec::new(),
                stop_hook: None,
            }),
            outcome_tx,
        });

        info!(
            "watching pid {}: {}",
            shared.root_pid,
            shell_words::join(&request.command)
        );
        tokio::spawn(monitor(
            Arc::clone(&shared),
            launched.child,
            launched.wrapper,
            outcome_rx.clone(),
        ));

        Ok(Self {
            shared,
            outcome: outcome_rx,
        })
    }

    pub fn root_pid(&self) -> u32 {
        self.shared.root_pid
    }

    /// False once the session has been declared over.
    pub fn is_running(&self) -> bool {
        self.shared.control.lock().unwrap().is_running
    }

    /// The session outcome, if the session already ended.
    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.outcome.borrow().clone()
    }

    /// Register a dependent session that is stopped (without a kill) before
    /// this one finishes stopping.
    pub fn attach(&self, child: Supervisor) {
        let lost_the_race = {
            let mut control = self.shared.control.lock().unwrap();
            if control.finishing {
                Some(child)
            } else {
                control.attached.push(child);
                None
            }
        };
        if let Some(child) = lost_the_race {
            child.stop(false);
        }
    }

    /// Closure invoked exactly once while stopping, after attached sessions
    /// were stopped and before `is_running` flips.
    pub fn set_stop_hook(&self, hook: impl FnOnce() + Send + 'static) {
        self.shared.control.lock().unwrap().stop_hook = Some(Box::new(hook));
    }

    /// End the session. With `force_kill_tree` every process still in the
    /// tree is killed from the leaves up to the root. Idempotent: later calls
    /// are no-ops and the outcome still fires exactly once.
    pub fn stop(&self, force_kill_tree: bool) {
        self.shared.finish(StopReason::Requested, force_kill_tree);
    }

    /// Wait for the session to end and return its outcome.
    pub async fn wait(&mut self) -> SessionOutcome {
        loop {
            if let Some(outcome) = self.outcome.borrow_and_update().clone() {
                return outcome;
            }
            if self.outcome.changed().await.is_err() {
                // Unreachable while this handle keeps the sender alive.
                return SessionOutcome {
                    exit_code: None,
                    reason: StopReason::Requested,
                    output: self.shared.capture.contents(),
                };
            }
        }
    }
}

async fn monitor(
    shared: Arc<Shared>,
    child: Child,
    wrapper: Option<TerminalWrapper>,
    mut outcome_rx: watch::Receiver<Option<SessionOutcome>>,
) {
    let started_at = Instant::now();
    let mut child = Some(child);
    let mut table = SystemProcessTable::new();
    let mut state = MonitorState::default();
    let mut interval = tokio::time::interval(shared.config.heartbeat);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = outcome_rx.changed() => break,
        }

        if let Some(child) = child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => shared.record_exit(status.code()),
                Ok(None) => {}
                Err(err) => debug!("cannot poll the root process: {err}"),
            }
        }

        let (tree, table_read_failed) =
            match ProcessTree::capture(shared.root_pid, &mut table, Some(shared.runner.as_ref())) {
                Ok(tree) => (tree, false),
                Err(err) => {
                    warn!("{err}");
                    (ProcessTree::default(), true)
                }
            };

        let observation = ticks::classify(&tree, &shared.exclusions);
        let ctx = TickContext {
            observation,
            elapsed: started_at.elapsed(),
            runner_alive: shared.runner.is_game_alive(),
            table_read_failed,
            root_exited: shared.root_exited(),
        };

        match ticks::decide(&mut state, &shared.config, &ctx) {
            TickDecision::Continue => {}
            TickDecision::AwaitRootExit => {
                debug!("every watched child is a zombie, joining the root process");
                child = join_root(&shared, child).await;
            }
            TickDecision::Finish(reason) => {
                shared.finish(reason, false);
                break;
            }
        }
    }

    // The root may still be dying at this point; reap it off the runtime.
    if let Some(mut child) = child.take() {
        std::thread::spawn(move || {
            let _ = child.wait();
        });
    }

    drop(wrapper);
}

/// Block on `Child::wait` off the async runtime. `wait` caches the exit
/// status, so the later `try_wait` in the heartbeat stays valid.
async fn join_root(shared: &Shared, child: Option<Child>) -> Option<Child> {
    let Some(mut child) = child else {
        return None;
    };
    match tokio::task::spawn_blocking(move || {
        let status = child.wait();
        (child, status)
    })
    .await
    {
        Ok((child, Ok(status))) => {
            shared.record_exit(status.code());
            Some(child)
        }
        Ok((child, Err(err))) => {
            debug!("cannot join the root process: {err}");
            Some(child)
        }
        Err(err) => {
            error!("root join task failed: {err}");
            None
        }
    }
}
