//! A two-sided tree around one transaction: its ancestors above and its descendants below.

use crate::model::DateRange;
use crate::trace::{EdgeSet, TraceOptions, TransactionGroup};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::{debug, trace};

#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, Hash, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum FocusNodeKind {
    Parent,
    Current,
    Child,
}

#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct FocusNode {
    pub txid: String,

    /// Negative for ancestors, positive for descendants, zero for the focus.
    pub level: i32,

    pub kind: FocusNodeKind,
    pub date: DateTime<Utc>,

    /// Satoshis.
    pub amount: u64,

    pub wallets: BTreeSet<String>,

    /// Txids from the focus to this node, inclusive.
    pub path: Vec<String>,

    /// Arena indices of the nodes expanded from this one.
    pub children: Vec<usize>,
}

#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct FocusStats {
    /// Sum of the amounts of every distinct transaction in the tree.
    pub total_flow: u64,

    /// Amount of the most distant ancestor, or of the focus without ancestors.
    pub initial_value: u64,

    /// Amount of the most distant descendant, or of the focus without descendants.
    pub final_value: u64,

    pub value_change: i64,

    /// Zero when `initial_value` is zero.
    pub value_change_percent: Decimal,

    pub transaction_count: usize,
    pub wallet_count: usize,
    pub date_range: Option<DateRange>,
}

#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct FocusTree {
    /// The focus is always at index 0. A transaction appears at most once per side of the focus,
    /// and a node's children are one level further from the focus.
    pub nodes: Vec<FocusNode>,

    pub stats: FocusStats,
}

impl FocusTree {
    pub fn focus(&self) -> &FocusNode {
        &self.nodes[0]
    }

    pub fn children(&self, index: usize) -> impl Iterator<Item = &FocusNode> {
        self.nodes[index]
            .children
            .iter()
            .map(|&child| &self.nodes[child])
    }

    /// All arena entries at `level`.
    pub fn level(&self, level: i32) -> impl Iterator<Item = &FocusNode> {
        self.nodes.iter().filter(move |node| node.level == level)
    }
}

/// Expand ancestors and descendants of `txid` along `edges`.
///
/// The walk is breadth first, so each transaction lands at its shortest distance from the focus.
/// Levels are bounded by `opts.max_depth` on each side, and paths by `opts.max_path_length`
/// hops. A transaction is expanded at most once per side; reaching it again at the same level
/// only links the existing node. Returns `None` when `txid` is not one of `groups`.
pub fn focus_tree(
    txid: &str,
    groups: &[TransactionGroup],
    edges: &EdgeSet,
    opts: &TraceOptions,
) -> Option<FocusTree> {
    let by_txid: HashMap<&str, &TransactionGroup> = groups
        .iter()
        .map(|group| (group.txid.as_str(), group))
        .collect();

    let focus = by_txid.get(txid)?;
    let max_level = i32::try_from(opts.max_depth).unwrap_or(i32::MAX);

    let mut nodes = vec![focus_node(focus, 0, FocusNodeKind::Current, vec![txid.to_string()])];
    let mut seen = HashMap::from([
        ((FocusNodeKind::Parent, focus.txid.as_str()), 0),
        ((FocusNodeKind::Child, focus.txid.as_str()), 0),
    ]);
    let mut queue = VecDeque::from([0]);

    while let Some(index) = queue.pop_front() {
        let (kind, level) = (nodes[index].kind, nodes[index].level);
        let current = nodes[index].txid.clone();

        let mut next = Vec::new();
        if kind != FocusNodeKind::Child && level > -max_level {
            for edge in edges.parents_of(&current) {
                next.push((edge.parent.as_str(), level - 1, FocusNodeKind::Parent));
            }
        }
        if kind != FocusNodeKind::Parent && level < max_level {
            for edge in edges.children_of(&current) {
                next.push((edge.child.as_str(), level + 1, FocusNodeKind::Child));
            }
        }

        for (txid, level, kind) in next {
            let Some(group) = by_txid.get(txid) else {
                continue;
            };

            let path = &nodes[index].path;
            if path.iter().any(|on_path| on_path == txid) {
                debug!("Cycle through `{txid}` from `{current}`");
                continue;
            }
            if path.len() > opts.max_path_length {
                debug!("Path limit reached at `{current}`");
                continue;
            }

            if let Some(&existing) = seen.get(&(kind, group.txid.as_str())) {
                // Only a sibling level keeps the arena layered.
                if nodes[existing].level == level && !nodes[index].children.contains(&existing) {
                    nodes[index].children.push(existing);
                }
                trace!("`{txid}` already expanded");
                continue;
            }

            let mut path = path.clone();
            path.push(txid.to_string());

            let child = nodes.len();
            nodes.push(focus_node(group, level, kind, path));
            nodes[index].children.push(child);
            seen.insert((kind, group.txid.as_str()), child);
            queue.push_back(child);
        }
    }

    let stats = focus_stats(&nodes);

    Some(FocusTree { nodes, stats })
}

fn focus_node(
    group: &TransactionGroup,
    level: i32,
    kind: FocusNodeKind,
    path: Vec<String>,
) -> FocusNode {
    FocusNode {
        txid: group.txid.clone(),
        level,
        kind,
        date: group.date,
        amount: group.total_amount(),
        wallets: group.wallets(),
        path,
        children: Vec::new(),
    }
}

fn focus_stats(nodes: &[FocusNode]) -> FocusStats {
    let mut distinct = HashMap::<&str, &FocusNode>::new();
    for node in nodes {
        distinct.entry(node.txid.as_str()).or_insert(node);
    }

    // Ties go to the first node in the arena.
    let mut initial = &nodes[0];
    let mut last = &nodes[0];
    for node in nodes {
        if node.level < initial.level {
            initial = node;
        }
        if node.level > last.level {
            last = node;
        }
    }

    let initial_value = initial.amount;
    let final_value = last.amount;
    let value_change = final_value as i64 - initial_value as i64;
    let value_change_percent = if initial_value == 0 {
        Decimal::ZERO
    } else {
        Decimal::from(value_change) * Decimal::ONE_HUNDRED / Decimal::from(initial_value)
    };

    let wallets: BTreeSet<&str> = distinct
        .values()
        .flat_map(|node| node.wallets.iter().map(String::as_str))
        .collect();

    FocusStats {
        total_flow: distinct.values().map(|node| node.amount).sum(),
        initial_value,
        final_value,
        value_change,
        value_change_percent,
        transaction_count: distinct.len(),
        wallet_count: wallets.len(),
        date_range: DateRange::from_dates(distinct.values().map(|node| node.date)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::record::tests::record;
    use crate::trace::{group_transactions, trace_relationships, Confidence};
    use similar_asserts::assert_eq;
    use tracing_test::traced_test;

    fn groups() -> Vec<TransactionGroup> {
        group_transactions(&[
            record("A", "2023-01-01T00:00:00Z", 10_000, Some("funding"), Some("hot")),
            record("A", "2023-01-01T00:00:00Z", -10_000, Some("X"), Some("hot")),
            record("B", "2023-01-02T00:00:00Z", 10_000, Some("X"), Some("hot")),
            record("B", "2023-01-02T00:00:00Z", -9_000, Some("Y"), Some("hot")),
            record("C", "2023-01-03T00:00:00Z", 9_000, Some("Y"), Some("cold")),
            record("C", "2023-01-03T00:00:00Z", -8_000, Some("Z"), Some("cold")),
            record("D", "2023-01-04T00:00:00Z", 8_000, Some("Z"), Some("cold")),
        ])
    }

    fn opts(max_depth: usize) -> TraceOptions {
        TraceOptions {
            max_depth,
            ..Default::default()
        }
    }

    #[test]
    #[traced_test]
    fn test_focus_one_level() {
        let _ = tracing_log::LogTracer::init();

        let groups = groups();
        let edges = trace_relationships(&groups, &opts(10), None);
        let tree = focus_tree("B", &groups, &edges, &opts(1)).unwrap();

        let shape: Vec<_> = tree
            .nodes
            .iter()
            .map(|node| (node.txid.as_str(), node.level, node.kind))
            .collect();
        assert_eq!(
            shape,
            [
                ("B", 0, FocusNodeKind::Current),
                ("A", -1, FocusNodeKind::Parent),
                ("C", 1, FocusNodeKind::Child),
            ]
        );
        assert_eq!(tree.focus().children, [1, 2]);
        assert_eq!(tree.nodes[2].path, ["B", "C"]);

        let stats = &tree.stats;
        assert_eq!(stats.total_flow, 20_000 + 19_000 + 17_000);
        assert_eq!(stats.initial_value, 20_000);
        assert_eq!(stats.final_value, 17_000);
        assert_eq!(stats.value_change, -3_000);
        assert_eq!(stats.value_change_percent, Decimal::from(-15));
        assert_eq!(stats.transaction_count, 3);
        assert_eq!(stats.wallet_count, 2);
    }

    #[test]
    #[traced_test]
    fn test_focus_full_depth() {
        let _ = tracing_log::LogTracer::init();

        let groups = groups();
        let edges = trace_relationships(&groups, &opts(10), None);
        let tree = focus_tree("B", &groups, &edges, &opts(10)).unwrap();

        assert_eq!(tree.level(2).map(|node| node.txid.as_str()).collect::<Vec<_>>(), ["D"]);
        assert_eq!(tree.stats.final_value, 8_000);
        assert_eq!(tree.stats.transaction_count, 4);
        assert!(tree.level(-2).next().is_none());

        assert!(focus_tree("missing", &groups, &edges, &opts(10)).is_none());
    }

    #[test]
    #[traced_test]
    fn test_focus_path_length_bound() {
        let _ = tracing_log::LogTracer::init();

        let groups = groups();
        let edges = trace_relationships(&groups, &opts(10), None);
        let opts = TraceOptions {
            max_depth: 10,
            max_path_length: 1,
            ..Default::default()
        };
        let tree = focus_tree("B", &groups, &edges, &opts).unwrap();

        assert_eq!(tree.nodes.len(), 3);
        assert!(tree.level(2).next().is_none());
        assert_eq!(tree.stats.final_value, 17_000);
        assert!(logs_contain("Path limit reached at `C`"));
    }

    #[test]
    #[traced_test]
    fn test_focus_reused_address_stays_linear() {
        let _ = tracing_log::LogTracer::init();

        // Every transaction receives at and sends from one address, so each earlier
        // transaction is a parent of every later one.
        let n = 20;
        let mut records = Vec::new();
        for day in 1..=n {
            let txid = format!("T{day:02}");
            let date = format!("2023-01-{day:02}T00:00:00Z");
            records.push(record(&txid, &date, 1_000, Some("X"), Some("hot")));
            records.push(record(&txid, &date, -1_000, Some("X"), Some("hot")));
        }
        let groups = group_transactions(&records);
        let edges = trace_relationships(&groups, &opts(10), None);
        assert_eq!(edges.len(), n * (n - 1) / 2);

        let tree = focus_tree(&format!("T{n:02}"), &groups, &edges, &opts(10)).unwrap();

        assert!(tree.nodes.len() <= 2 * n + 1);
        assert_eq!(tree.stats.transaction_count, n);
        assert_eq!(tree.level(-1).count(), n - 1);
        assert!(tree.level(-2).next().is_none());

        // A mid-chain focus reaches both sides once each.
        let tree = focus_tree("T10", &groups, &edges, &opts(10)).unwrap();
        assert_eq!(tree.nodes.len(), n);
        assert_eq!(tree.level(-1).count(), 9);
        assert_eq!(tree.level(1).count(), 10);
    }

    #[test]
    #[traced_test]
    fn test_focus_cycle_guard() {
        let _ = tracing_log::LogTracer::init();

        let groups = group_transactions(&[
            record("A", "2023-01-01T00:00:00Z", 0, None, None),
            record("B", "2023-01-02T00:00:00Z", 5_000, None, None),
        ]);
        let mut edges = EdgeSet::default();
        edges.insert("A", "B", Confidence::Exact);
        edges.insert("B", "A", Confidence::Exact);

        let tree = focus_tree("A", &groups, &edges, &opts(10)).unwrap();

        assert_eq!(tree.nodes.len(), 3);
        assert_eq!(tree.stats.transaction_count, 2);
        assert_eq!(tree.stats.value_change_percent, Decimal::ZERO);
        assert!(logs_contain("Cycle through"));
    }
}
