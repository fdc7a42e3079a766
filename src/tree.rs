//! Assemble traced transactions into trees.
//!
//! Spend-chain trees partition transactions along spend edges. Wallet-flow trees, flow chains and
//! focused trees are alternative views over the same data, see the submodules.

use crate::model::{Direction, NodeInput, PriceLookup, TransactionNode, TransactionTree};
use crate::trace::{classify_outputs, AddressIndex, EdgeSet, TransactionGroup};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, trace};

pub mod chain;
pub mod focus;
pub mod wallet_flow;

pub use self::chain::build_flow_chains;
pub use self::focus::{focus_tree, FocusNode, FocusNodeKind, FocusStats, FocusTree};
pub use self::wallet_flow::{build_wallet_flow_trees, WalletFlowTree, WalletTxInfo, WalletTxType};

#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct BuildOptions {
    /// Also start a tree at every transaction with an externally funded input, even when it has a
    /// parent. Such a transaction then appears in more than one tree.
    ///
    /// When disabled, trees partition the transactions exactly.
    pub allow_overlapping_roots: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            allow_overlapping_roots: true,
        }
    }
}

/// Build spend-chain trees, largest first.
///
/// Each node takes the parent of the first edge into it. Later edges into the same node are
/// ignored, and do not add the node to the other parent's children either.
pub fn build_trees(
    groups: &[TransactionGroup],
    edges: &EdgeSet,
    opts: &BuildOptions,
) -> Vec<TransactionTree> {
    let index = AddressIndex::new(groups);
    let positions: HashMap<&str, usize> = groups
        .iter()
        .enumerate()
        .map(|(position, group)| (group.txid.as_str(), position))
        .collect();

    let mut nodes: Vec<_> = groups
        .iter()
        .map(|group| transaction_node(group, groups, &index))
        .collect();
    let mut children = vec![Vec::new(); groups.len()];

    for edge in edges {
        let (Some(&parent), Some(&child)) = (
            positions.get(edge.parent.as_str()),
            positions.get(edge.child.as_str()),
        ) else {
            continue;
        };
        if parent == child {
            continue;
        }

        if let Some(existing) = &nodes[child].parent {
            debug!(
                "`{}` already has parent `{existing}`, ignoring `{}`",
                edge.child, edge.parent
            );
            continue;
        }
        nodes[child].parent = Some(edge.parent.clone());
        nodes[parent].children.push(edge.child.clone());
        children[parent].push(child);
    }

    let roots = groups.iter().enumerate().filter_map(|(position, group)| {
        let externally_funded = opts.allow_overlapping_roots
            && group
                .input_addresses()
                .any(|address| index.is_external_input(address));

        (nodes[position].parent.is_none() || externally_funded).then_some(position)
    });

    let mut covered = vec![false; groups.len()];
    let mut trees = Vec::new();
    for root in roots {
        trees.push(collect_tree(root, &nodes, &children, &mut covered));
    }

    // Transactions whose ancestry loops back on itself have no root. Each loop becomes a tree of
    // its own, rooted at its first transaction.
    for position in 0..groups.len() {
        if !covered[position] {
            debug!("`{}` is not reachable from any root", groups[position].txid);
            trees.push(collect_tree(position, &nodes, &children, &mut covered));
        }
    }

    trees.sort_by(|a, b| b.len().cmp(&a.len()));

    trees
}

fn transaction_node(
    group: &TransactionGroup,
    groups: &[TransactionGroup],
    index: &AddressIndex,
) -> TransactionNode {
    let inputs = group
        .records
        .iter()
        .filter(|record| record.direction == Direction::Input)
        .map(|record| NodeInput {
            address: record.address.clone(),
            amount: record.amount(),
        })
        .collect();

    TransactionNode {
        id: group.txid.clone(),
        date: group.date,
        confirmed: group.confirmed,
        wallets: group.wallets(),
        inputs,
        outputs: classify_outputs(group, groups, index),
        children: Vec::new(),
        parent: None,
        total_amount: group.total_amount(),
        fee: group.fee(),
        price: None,
        price_usd: None,
    }
}

/// Depth-first walk along `children` from `root`.
fn collect_tree(
    root: usize,
    nodes: &[TransactionNode],
    children: &[Vec<usize>],
    covered: &mut [bool],
) -> TransactionTree {
    let mut visited = HashSet::new();
    let mut members = BTreeMap::new();
    let mut stack = vec![root];

    while let Some(position) = stack.pop() {
        if !visited.insert(position) {
            continue;
        }
        covered[position] = true;

        let node = &nodes[position];
        members.insert(node.id.clone(), node.clone());
        stack.extend(children[position].iter().rev());
    }
    trace!("Tree at `{}` has {} nodes", nodes[root].id, members.len());

    TransactionTree::new(nodes[root].id.clone(), members)
}

/// Look up the price of every node and recompute each tree's USD total.
///
/// Nodes without a price keep `None` and do not count towards the total.
pub fn backfill_prices<P>(trees: &mut [TransactionTree], prices: &P)
where
    P: PriceLookup + ?Sized,
{
    let mut lookups = HashMap::<NaiveDate, Option<Decimal>>::new();

    for tree in trees.iter_mut() {
        for node in tree.nodes.values_mut() {
            let date = node.date.date_naive();
            let price = *lookups
                .entry(date)
                .or_insert_with(|| prices.get_price(date));

            node.set_price(price);
        }
        tree.update_aggregates();
    }

    let missing = lookups.values().filter(|price| price.is_none()).count();
    if missing > 0 {
        debug!("No price for {missing} of {} dates", lookups.len());
    }
}
