//! Exact tracing through previous-output references.
//!
//! Each transaction's parents are the in-set transactions its inputs spend from. The walk starts
//! from the newest transactions that nothing else spends (the tips), then from anything the first
//! walks did not reach, and follows parents with an explicit stack. A parent dated after the
//! transaction spending it is ignored. A branch stops without error
//! when it would exceed the hop bound or revisit a txid already on its own path.

use super::{Confidence, EdgeSet, TraceOptions, TransactionGroup};
use esploda::esplora::Transaction;
use std::collections::HashMap;
use tracing::{debug, trace};

pub(super) fn trace_exact(
    groups: &[TransactionGroup],
    raw: &HashMap<String, Transaction>,
    opts: &TraceOptions,
) -> EdgeSet {
    let mut edges = EdgeSet::default();
    let parents = in_set_parents(groups, raw, &mut edges);

    let mut spent = vec![false; groups.len()];
    for &parent in parents.iter().flatten() {
        spent[parent] = true;
    }

    // Newest first; txid breaks ties so the walk order is deterministic.
    let mut order: Vec<usize> = (0..groups.len()).collect();
    order.sort_by(|&a, &b| {
        groups[b]
            .date
            .cmp(&groups[a].date)
            .then_with(|| groups[a].txid.cmp(&groups[b].txid))
    });
    let tips = order.iter().filter(|&&position| !spent[position]);
    let rest = order.iter().filter(|&&position| spent[position]);

    let max_hops = opts.max_depth.min(opts.max_path_length);
    let mut visited = vec![false; groups.len()];

    // Largest remaining hop budget each transaction has been expanded with. A transaction is only
    // expanded again with a strictly larger budget, which bounds the total work.
    let mut expanded: Vec<Option<usize>> = vec![None; groups.len()];

    for &seed in tips.chain(rest) {
        if visited[seed] {
            continue;
        }
        trace!("Tracing ancestors of `{}`", groups[seed].txid);

        let mut stack = vec![vec![seed]];
        while let Some(path) = stack.pop() {
            let Some(&node) = path.last() else {
                continue;
            };
            visited[node] = true;
            edges.stats_mut().inc_visits();

            let remaining = max_hops.saturating_sub(path.len() - 1);
            if expanded[node].is_some_and(|budget| budget >= remaining) {
                continue;
            }
            expanded[node] = Some(remaining);

            if remaining == 0 {
                if !parents[node].is_empty() {
                    debug!("Hop limit reached at `{}`", groups[node].txid);
                    edges.stats_mut().inc_truncated();
                }
                continue;
            }

            for &parent in &parents[node] {
                if path.contains(&parent) {
                    debug!(
                        "Cycle through `{}` and `{}`",
                        groups[parent].txid, groups[node].txid
                    );
                    edges.stats_mut().inc_cycles_blocked();
                    continue;
                }

                edges.insert(&groups[parent].txid, &groups[node].txid, Confidence::Exact);

                let mut next = path.clone();
                next.push(parent);
                stack.push(next);
            }
        }
    }

    edges
}

/// For each group, the positions of the groups its inputs spend from, in input order.
fn in_set_parents(
    groups: &[TransactionGroup],
    raw: &HashMap<String, Transaction>,
    edges: &mut EdgeSet,
) -> Vec<Vec<usize>> {
    let positions: HashMap<&str, usize> = groups
        .iter()
        .enumerate()
        .map(|(position, group)| (group.txid.as_str(), position))
        .collect();

    let mut parents = Vec::with_capacity(groups.len());
    for (position, group) in groups.iter().enumerate() {
        let mut group_parents = Vec::new();

        match raw.get(&group.txid) {
            Some(tx) => {
                for input in tx.inputs.iter().filter(|input| !input.is_coinbase()) {
                    let txid = input.txid.to_string();
                    match positions.get(txid.as_str()) {
                        Some(&parent) if parent == position => {
                            edges.stats_mut().inc_cycles_blocked();
                        }
                        // Same-block spends share a timestamp, so only a newer parent is rejected.
                        Some(&parent) if groups[parent].date > group.date => {
                            debug!(
                                "`{}` spends from the newer `{}`, ignoring",
                                group.txid, groups[parent].txid
                            );
                            edges.stats_mut().inc_rejected_by_date();
                        }
                        Some(&parent) if !group_parents.contains(&parent) => {
                            group_parents.push(parent);
                        }
                        _ => (),
                    }
                }
            }
            None => {
                debug!("No blockchain data for `{}`, skipping", group.txid);
                edges.stats_mut().inc_missing_raw_data();
            }
        }

        parents.push(group_parents);
    }

    parents
}
