use std::time::Duration;

use crate::config::SupervisorConfig;
use crate::exclusion::ExclusionSet;
use crate::prelude::*;
use crate::process::{ProcessTree, WalkOrder};
use crate::supervisor::StopReason;

/// Counts extracted from one tree capture.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TickObservation {
    /// Every descendant of the root, excluded names included.
    pub children: usize,
    /// Descendants whose name is not in the exclusion set.
    pub watched_children: usize,
    /// Watched descendants currently in zombie state.
    pub watched_zombies: usize,
    /// Whether the root process itself still has a table entry.
    pub root_present: bool,
}

/// Everything one heartbeat knows beyond the persistent monitor state.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TickContext {
    pub observation: TickObservation,
    /// Time since the session was launched.
    pub elapsed: Duration,
    pub runner_alive: Option<bool>,
    pub table_read_failed: bool,
    /// Whether the root process handle has reported an exit status.
    pub root_exited: bool,
}

/// State carried from one heartbeat to the next.
#[derive(Debug, Default)]
pub(crate) struct MonitorState {
    pub cycles_without_children: u32,
    /// Latched on the first tick that sees a watched child; never reverts.
    pub monitoring_started: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickDecision {
    Continue,
    /// Every watched child is a zombie: join the root before the next tick.
    AwaitRootExit,
    Finish(StopReason),
}

pub(crate) fn classify(tree: &ProcessTree, exclusions: &ExclusionSet) -> TickObservation {
    let mut observation = TickObservation {
        root_present: tree.root().is_some(),
        ..Default::default()
    };

    for snapshot in tree.descendants(WalkOrder::TopDown) {
        observation.children += 1;
        if exclusions.is_excluded(&snapshot.name) {
            continue;
        }
        debug!("{}\t{}\t{}", snapshot.pid, snapshot.state, snapshot.name);
        observation.watched_children += 1;
        if snapshot.is_zombie() {
            observation.watched_zombies += 1;
        }
    }

    observation
}

pub(crate) fn decide(
    state: &mut MonitorState,
    config: &SupervisorConfig,
    ctx: &TickContext,
) -> TickDecision {
    let observation = &ctx.observation;

    if observation.watched_children > 0 && !state.monitoring_started {
        debug!("a game process appeared, monitoring started");
        state.monitoring_started = true;
    }

    if ctx.runner_alive == Some(false) {
        return TickDecision::Finish(StopReason::RunnerStopped);
    }

    // Once a game process has been seen, warm-up no longer applies.
    let past_warmup = state.monitoring_started || ctx.elapsed > config.warmup;

    if observation.watched_children > 0 {
        state.cycles_without_children = 0;
    } else if past_warmup {
        state.cycles_without_children += 1;
        debug!(
            "no watched children, cycle {} of {}",
            state.cycles_without_children, config.max_idle_ticks
        );
    }

    if !ctx.table_read_failed && observation.children == 0 {
        // Inside warm-up an empty tree only ends the session once the root
        // itself is known to have exited.
        if past_warmup || (!observation.root_present && ctx.root_exited) {
            return TickDecision::Finish(StopReason::TreeDrained);
        }
    }

    if state.cycles_without_children >= config.max_idle_ticks {
        return TickDecision::Finish(StopReason::IdleTimeout);
    }

    if observation.watched_zombies > 0 && observation.watched_zombies == observation.watched_children
    {
        return TickDecision::AwaitRootExit;
    }

    TickDecision::Continue
}
