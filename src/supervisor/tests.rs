use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;

use super::*;
use crate::process::{ProcessSnapshot, ProcessState, ProcessTable, ProcessTableError, process_gone};
use crate::runner::NullRunner;

const WAIT_BUDGET: Duration = Duration::from_secs(10);

/// Fast heartbeat for tests. Warm-up stays wide enough that an empty tree
/// right after spawn never ends the session on its own; quick exits are still
/// detected through the root's exit status.
fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        heartbeat: Duration::from_millis(25),
        warmup: Duration::from_millis(500),
        max_idle_ticks: 3,
        echo_output: false,
        ..Default::default()
    }
}

fn sh_request(script: &str) -> LaunchRequest {
    LaunchRequest {
        command: vec!["sh".into(), "-c".into(), script.into()],
        ..Default::default()
    }
}

fn launch_sh(script: &str, config: SupervisorConfig) -> Supervisor {
    Supervisor::launch(sh_request(script), Arc::new(NullRunner), config).unwrap()
}

async fn wait_for(supervisor: &mut Supervisor) -> SessionOutcome {
    timeout(WAIT_BUDGET, supervisor.wait())
        .await
        .expect("session did not end in time")
}

#[test_log::test(tokio::test)]
async fn a_quick_command_drains_and_reports_its_exit_code() {
    let mut supervisor = launch_sh("echo session-done; exit 7", fast_config());

    let outcome = wait_for(&mut supervisor).await;

    assert_eq!(outcome.reason, StopReason::TreeDrained);
    assert_eq!(outcome.exit_code, Some(7));
    assert!(outcome.output.contains("session-done"));
    assert!(!supervisor.is_running());
}

#[test_log::test(tokio::test)]
async fn a_zero_heartbeat_still_reports_an_outcome() {
    // Zero is out of range for the interval timer; `launch` floors it.
    let config = SupervisorConfig {
        heartbeat: Duration::ZERO,
        ..fast_config()
    };
    let mut supervisor = launch_sh("exit 0", config);

    let outcome = wait_for(&mut supervisor).await;

    assert_eq!(outcome.reason, StopReason::TreeDrained);
    assert_eq!(outcome.exit_code, Some(0));
}

#[test_log::test(tokio::test)]
async fn stderr_is_captured_alongside_stdout() {
    let mut supervisor = launch_sh("echo to-stdout; echo to-stderr >&2", fast_config());

    let outcome = wait_for(&mut supervisor).await;

    assert!(outcome.output.contains("to-stdout"));
    assert!(outcome.output.contains("to-stderr"));
}

#[test_log::test(tokio::test)]
async fn the_outcome_captures_everything_written_before_exit() {
    // The drains are joined before the capture seals, so bytes the game wrote
    // right before exiting end up in the outcome instead of the pipe.
    let mut supervisor = launch_sh("seq 1 2000", fast_config());

    let outcome = wait_for(&mut supervisor).await;

    assert_eq!(outcome.reason, StopReason::TreeDrained);
    assert!(outcome.output.ends_with("1999\n2000\n"));
}

#[test_log::test(tokio::test)]
async fn excluded_leftovers_time_out_while_the_root_lives() {
    // tee exits immediately and lingers as a zombie child of the root: the
    // tree never empties, but nothing watchable is left either.
    let mut supervisor = launch_sh(
        "tee </dev/null >/dev/null & exec sleep 3",
        fast_config(),
    );

    let outcome = wait_for(&mut supervisor).await;

    assert_eq!(outcome.reason, StopReason::IdleTimeout);
    assert_eq!(outcome.exit_code, None);
}

#[test_log::test(tokio::test)]
async fn a_watched_child_keeps_the_session_alive_until_it_exits() {
    // `sleep` runs as a real child of the shell, so the watched count latches
    // monitoring and holds the session open until the child exits.
    let mut supervisor = launch_sh("sleep 1 & wait", fast_config());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(supervisor.is_running());

    let outcome = wait_for(&mut supervisor).await;
    assert_eq!(outcome.reason, StopReason::TreeDrained);
    assert_eq!(outcome.exit_code, Some(0));
}

#[test_log::test(tokio::test)]
async fn a_zero_idle_threshold_does_not_end_a_live_session() {
    // `launch` floors the threshold to one tick, so a live watched child
    // still resets the counter before it can fire.
    let config = SupervisorConfig {
        max_idle_ticks: 0,
        ..fast_config()
    };
    let mut supervisor = launch_sh("sleep 2 & wait", config);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(supervisor.is_running());

    supervisor.stop(true);
    let outcome = wait_for(&mut supervisor).await;
    assert_eq!(outcome.reason, StopReason::Requested);
}

#[test_log::test(tokio::test)]
async fn the_runner_verdict_ends_the_session() {
    struct SwitchRunner {
        alive: AtomicBool,
    }

    impl RunnerAdapter for SwitchRunner {
        fn name(&self) -> &str {
            "switch"
        }

        fn is_game_alive(&self) -> Option<bool> {
            Some(self.alive.load(Ordering::SeqCst))
        }
    }

    let runner = Arc::new(SwitchRunner {
        alive: AtomicBool::new(true),
    });
    let mut supervisor = Supervisor::launch(
        sh_request("sleep 3"),
        Arc::clone(&runner) as Arc<dyn RunnerAdapter>,
        fast_config(),
    )
    .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    runner.alive.store(false, Ordering::SeqCst);

    let outcome = wait_for(&mut supervisor).await;
    assert_eq!(outcome.reason, StopReason::RunnerStopped);
    assert_eq!(outcome.exit_code, None);
}

#[test_log::test(tokio::test)]
async fn stop_is_idempotent_and_fires_one_outcome() {
    let mut supervisor = launch_sh("sleep 2", fast_config());

    supervisor.stop(false);
    supervisor.stop(false);

    let outcome = wait_for(&mut supervisor).await;
    assert_eq!(outcome.reason, StopReason::Requested);
    assert!(!supervisor.is_running());

    supervisor.stop(false);
    assert_eq!(supervisor.outcome(), Some(outcome));
}

#[test_log::test(tokio::test)]
async fn a_forced_stop_kills_the_whole_tree() {
    let mut supervisor = launch_sh("sleep 5 & exec sleep 5", fast_config());
    let root_pid = supervisor.root_pid();

    tokio::time::sleep(Duration::from_millis(150)).await;
    supervisor.stop(true);

    let outcome = wait_for(&mut supervisor).await;
    assert_eq!(outcome.reason, StopReason::Requested);

    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while !process_gone(root_pid) {
        assert!(
            std::time::Instant::now() < deadline,
            "root pid {root_pid} survived the forced stop"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[test_log::test]
fn a_forced_kill_signals_leaves_before_parents() {
    struct CannedTable(Vec<ProcessSnapshot>);

    impl ProcessTable for CannedTable {
        fn snapshot(&mut self) -> Result<Vec<ProcessSnapshot>, ProcessTableError> {
            Ok(self.0.clone())
        }
    }

    let entry = |pid: u32, parent_pid: u32, name: &str| ProcessSnapshot {
        pid,
        parent_pid: Some(parent_pid),
        name: name.into(),
        state: ProcessState::Running,
    };
    let mut table = CannedTable(vec![
        entry(4000, 1, "game-launcher"),
        entry(4001, 4000, "shell-wrapper"),
        entry(4002, 4001, "game-bin"),
    ]);

    let mut order = Vec::new();
    kill_tree_with(4000, &NullRunner, &mut table, |pid| order.push(pid));

    assert_eq!(order, vec![4002, 4001, 4000]);
}

#[test_log::test]
fn an_unreadable_table_still_signals_the_root() {
    struct UnreadableTable;

    impl ProcessTable for UnreadableTable {
        fn snapshot(&mut self) -> Result<Vec<ProcessSnapshot>, ProcessTableError> {
            Err(ProcessTableError("table unavailable".into()))
        }
    }

    let mut order = Vec::new();
    kill_tree_with(4000, &NullRunner, &mut UnreadableTable, |pid| order.push(pid));

    assert_eq!(order, vec![4000]);
}

#[test_log::test(tokio::test)]
async fn attached_sessions_stop_before_the_owner_reports_stopped() {
    let owner = launch_sh("sleep 2", fast_config());
    let dependent = launch_sh("sleep 2", fast_config());
    let mut dependent_watch = dependent.clone();

    owner.attach(dependent);
    owner.stop(false);

    let outcome = timeout(WAIT_BUDGET, dependent_watch.wait())
        .await
        .expect("the attached session was not stopped");
    assert_eq!(outcome.reason, StopReason::Requested);
    assert!(!owner.is_running());
}

#[test_log::test(tokio::test)]
async fn attaching_to_a_stopped_session_still_stops_the_dependent() {
    let owner = launch_sh("sleep 2", fast_config());
    let dependent = launch_sh("sleep 2", fast_config());
    let mut dependent_watch = dependent.clone();

    owner.stop(false);
    owner.attach(dependent);

    let outcome = timeout(WAIT_BUDGET, dependent_watch.wait())
        .await
        .expect("the attached session was not stopped");
    assert_eq!(outcome.reason, StopReason::Requested);
}

#[test_log::test(tokio::test)]
async fn the_stop_hook_runs_before_is_running_flips() {
    let supervisor = launch_sh("sleep 2", fast_config());
    let watcher = supervisor.clone();
    let observed_running = Arc::new(AtomicBool::new(false));
    let observed = Arc::clone(&observed_running);

    supervisor.set_stop_hook(move || {
        observed.store(watcher.is_running(), Ordering::SeqCst);
    });
    supervisor.stop(false);

    assert!(observed_running.load(Ordering::SeqCst));
    assert!(!supervisor.is_running());
}

#[test_log::test(tokio::test)]
async fn a_terminal_wrapper_is_excluded_from_the_watch() {
    let term_dir = TempDir::new().unwrap();
    let term_path = term_dir.path().join("fake-term");
    std::fs::write(&term_path, "#!/bin/sh\nshift\nexec \"$@\"\n").unwrap();
    std::fs::set_permissions(&term_path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let path_with_fake = format!(
        "{}:{}",
        term_dir.path().display(),
        std::env::var("PATH").unwrap()
    );

    temp_env::async_with_vars([("PATH", Some(path_with_fake))], async {
        let request = LaunchRequest {
            command: vec![
                "sh".into(),
                "-c".into(),
                "echo terminal-ready; sleep 2".into(),
            ],
            env: BTreeMap::from([("GAMEWATCH_WRAP".into(), "1".into())]),
            working_directory: None,
            terminal: Some("fake-term".into()),
        };
        // Wide warm-up so the first ticks before the game child shows up
        // cannot end the session.
        let config = SupervisorConfig {
            warmup: Duration::from_secs(60),
            ..fast_config()
        };
        let mut supervisor = Supervisor::launch(request, Arc::new(NullRunner), config).unwrap();

        // While `sleep` runs the session must stay open: the wrapper script
        // and the terminal are excluded, the game child is watched.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(supervisor.is_running());
        supervisor.stop(true);

        let outcome = wait_for(&mut supervisor).await;
        assert_eq!(outcome.reason, StopReason::Requested);
        assert!(outcome.output.contains("terminal-ready"));
    })
    .await;
}
