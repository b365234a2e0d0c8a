use std::collections::{HashMap, HashSet};

use crate::prelude::*;
use crate::process::snapshot::{ProcessSnapshot, ProcessTable, ProcessTableError};
use crate::runner::RunnerAdapter;

/// Direction of a depth-first traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOrder {
    /// Parents before children. Used for counting and classification.
    TopDown,
    /// Children before parents, root last. Used for tree-wide kills.
    BottomUp,
}

#[derive(Debug, Clone)]
struct ProcessNode {
    snapshot: ProcessSnapshot,
    children: Vec<ProcessNode>,
}

/// Fully materialized descendant tree of one root pid, captured in a single
/// read of the process table. Processes reported by a runner that live outside
/// the root's parent chain are grafted in at capture time; when the root itself
/// is gone they are kept as detached subtrees so the session still sees them.
#[derive(Debug, Clone, Default)]
pub struct ProcessTree {
    root: Option<ProcessNode>,
    detached: Vec<ProcessNode>,
}

impl ProcessTree {
    /// Build the tree from one table read, merging in runner-managed processes
    /// that are not reachable through parent links (Wine games keep running
    /// under wineserver after their launcher chain has exited).
    pub fn capture(
        root_pid: u32,
        table: &mut dyn ProcessTable,
        runner: Option<&dyn RunnerAdapter>,
    ) -> Result<Self, ProcessTableError> {
        let snapshots = table.snapshot()?;
        let mut tree = Self::from_snapshots(root_pid, &snapshots);

        if let Some(runner) = runner {
            if runner.manages_process_namespace() {
                tree.merge_runner_processes(runner, &snapshots);
            }
        }

        Ok(tree)
    }

    /// Pure constructor over canned snapshots, without any runner merge.
    pub fn from_snapshots(root_pid: u32, snapshots: &[ProcessSnapshot]) -> Self {
        let by_pid = index_by_pid(snapshots);
        let by_parent = index_by_parent(snapshots);
        let mut visited = HashSet::new();

        let root = by_pid
            .get(&root_pid)
            .map(|snapshot| build_node((*snapshot).clone(), &by_parent, &mut visited));

        Self {
            root,
            detached: Vec::new(),
        }
    }

    fn merge_runner_processes(&mut self, runner: &dyn RunnerAdapter, snapshots: &[ProcessSnapshot]) {
        let pids = match runner.managed_pids() {
            Ok(pids) => pids,
            Err(err) => {
                warn!("runner {} failed to report its processes: {err}", runner.name());
                return;
            }
        };

        let by_pid = index_by_pid(snapshots);
        let by_parent = index_by_parent(snapshots);
        let service_names = runner.service_process_names();
        let mut visited: HashSet<u32> = self.pids().into_iter().collect();

        for pid in pids {
            if visited.contains(&pid) {
                continue;
            }
            let Some(snapshot) = by_pid.get(&pid) else {
                continue;
            };
            if service_names.contains(&snapshot.name) {
                continue;
            }
            let node = build_node((*snapshot).clone(), &by_parent, &mut visited);
            match self.root.as_mut() {
                Some(root) => root.children.push(node),
                None => self.detached.push(node),
            }
        }
    }

    pub fn root(&self) -> Option<&ProcessSnapshot> {
        self.root.as_ref().map(|node| &node.snapshot)
    }

    /// True when the walk would yield nothing at all.
    pub fn is_empty(&self) -> bool {
        self.root.is_none() && self.detached.is_empty()
    }

    /// Every node including the root. `BottomUp` yields the root last.
    pub fn walk(&self, order: WalkOrder) -> Vec<&ProcessSnapshot> {
        let mut out = Vec::new();
        for node in &self.detached {
            visit(node, order, &mut out);
        }
        if let Some(root) = &self.root {
            visit(root, order, &mut out);
        }
        out
    }

    /// Every node except the root itself. Detached runner subtrees count as
    /// descendants: they belong to the session even without a parent link.
    pub fn descendants(&self, order: WalkOrder) -> Vec<&ProcessSnapshot> {
        let mut out = Vec::new();
        for node in &self.detached {
            visit(node, order, &mut out);
        }
        if let Some(root) = &self.root {
            for child in &root.children {
                visit(child, order, &mut out);
            }
        }
        out
    }

    fn pids(&self) -> Vec<u32> {
        self.walk(WalkOrder::TopDown)
            .into_iter()
            .map(|snapshot| snapshot.pid)
            .collect()
    }
}

fn index_by_pid(snapshots: &[ProcessSnapshot]) -> HashMap<u32, &ProcessSnapshot> {
    snapshots.iter().map(|snapshot| (snapshot.pid, snapshot)).collect()
}

fn index_by_parent(snapshots: &[ProcessSnapshot]) -> HashMap<u32, Vec<&ProcessSnapshot>> {
    let mut index: HashMap<u32, Vec<&ProcessSnapshot>> = HashMap::new();
    for snapshot in snapshots {
        if let Some(parent_pid) = snapshot.parent_pid {
            index.entry(parent_pid).or_default().push(snapshot);
        }
    }
    index
}

// Pid reuse between two reads can make a parent link point back into the
// subtree; the visited set keeps the build finite and each pid unique.
fn build_node(
    snapshot: ProcessSnapshot,
    by_parent: &HashMap<u32, Vec<&ProcessSnapshot>>,
    visited: &mut HashSet<u32>,
) -> ProcessNode {
    visited.insert(snapshot.pid);
    let mut children = Vec::new();
    if let Some(kids) = by_parent.get(&snapshot.pid) {
        for kid in kids {
            if visited.contains(&kid.pid) {
                continue;
            }
            children.push(build_node((*kid).clone(), by_parent, visited));
        }
    }
    ProcessNode { snapshot, children }
}

fn visit<'a>(node: &'a ProcessNode, order: WalkOrder, out: &mut Vec<&'a ProcessSnapshot>) {
    if order == WalkOrder::TopDown {
        out.push(&node.snapshot);
    }
    for child in &node.children {
        visit(child, order, out);
    }
    if order == WalkOrder::BottomUp {
        out.push(&node.snapshot);
    }
}
