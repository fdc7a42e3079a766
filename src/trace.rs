//! Spend relationship tracing.
//!
//! Given the records of a set of transactions, infer directed edges `parent -> child` meaning the
//! child consumed an output the parent produced. Without blockchain data this relies on address
//! reuse between records, which is a heuristic. With raw transactions the edges come from the
//! inputs' previous-output references and are exact. Every edge says which of the two it is.

use crate::model::{Direction, NodeOutput, NormalizedTransaction, TraceStats};
use chrono::{DateTime, Utc};
use esploda::esplora::Transaction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

mod exact;

/// Knobs for [`trace_relationships`].
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct TraceOptions {
    /// Link transactions through their inputs' previous-output txids instead of address reuse.
    pub use_real_blockchain_data: bool,

    /// Maximum number of ancestor hops followed from any transaction.
    pub max_depth: usize,

    /// Maximum number of edges in one traversal path.
    pub max_path_length: usize,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            use_real_blockchain_data: false,
            max_depth: 10,
            max_path_length: 10,
        }
    }
}

/// How an edge was established.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, Hash, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// An input of the child references the parent's txid.
    Exact,

    /// The child spends from an address the parent paid to, and the parent is strictly older.
    Heuristic,
}

#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct Edge {
    pub parent: String,
    pub child: String,
    pub confidence: Confidence,
}

/// Deduplicated edges in discovery order, with the counters collected while tracing them.
#[derive(Clone, Debug, Default, Serialize)]
pub struct EdgeSet {
    edges: Vec<Edge>,

    #[serde(skip)]
    pairs: HashSet<(String, String)>,
    #[serde(skip)]
    by_parent: HashMap<String, Vec<usize>>,
    #[serde(skip)]
    by_child: HashMap<String, Vec<usize>>,

    stats: TraceStats,
}

impl EdgeSet {
    /// Add an edge. Returns `false` if the `(parent, child)` pair is already present.
    pub fn insert(&mut self, parent: &str, child: &str, confidence: Confidence) -> bool {
        if !self.pairs.insert((parent.to_string(), child.to_string())) {
            return false;
        }

        match confidence {
            Confidence::Exact => self.stats.inc_exact_edges(),
            Confidence::Heuristic => self.stats.inc_heuristic_edges(),
        }

        let position = self.edges.len();
        self.by_parent
            .entry(parent.to_string())
            .or_default()
            .push(position);
        self.by_child
            .entry(child.to_string())
            .or_default()
            .push(position);
        self.edges.push(Edge {
            parent: parent.to_string(),
            child: child.to_string(),
            confidence,
        });

        true
    }

    pub fn contains(&self, parent: &str, child: &str) -> bool {
        self.pairs
            .contains(&(parent.to_string(), child.to_string()))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Edge> {
        self.edges.iter()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Edges into `child`, in discovery order.
    pub fn parents_of<'a>(&'a self, child: &str) -> impl Iterator<Item = &'a Edge> + 'a {
        let positions = self.by_child.get(child).map(Vec::as_slice).unwrap_or_default();

        positions.iter().map(move |&position| &self.edges[position])
    }

    /// Edges out of `parent`, in discovery order.
    pub fn children_of<'a>(&'a self, parent: &str) -> impl Iterator<Item = &'a Edge> + 'a {
        let positions = self.by_parent.get(parent).map(Vec::as_slice).unwrap_or_default();

        positions.iter().map(move |&position| &self.edges[position])
    }

    pub fn stats(&self) -> &TraceStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut TraceStats {
        &mut self.stats
    }
}

impl<'a> IntoIterator for &'a EdgeSet {
    type Item = &'a Edge;
    type IntoIter = std::slice::Iter<'a, Edge>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// All records sharing one txid.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct TransactionGroup {
    pub txid: String,

    /// Earliest date among the records.
    pub date: DateTime<Utc>,

    /// `true` only if every record is confirmed.
    pub confirmed: bool,

    pub records: Vec<NormalizedTransaction>,
}

impl TransactionGroup {
    /// Addresses of received legs, in record order.
    pub fn input_addresses(&self) -> impl Iterator<Item = &str> {
        self.addresses(Direction::Input)
    }

    /// Addresses of sent legs, in record order.
    pub fn output_addresses(&self) -> impl Iterator<Item = &str> {
        self.addresses(Direction::Output)
    }

    fn addresses(&self, direction: Direction) -> impl Iterator<Item = &str> {
        self.records
            .iter()
            .filter(move |record| record.direction == direction)
            .filter_map(|record| record.address.as_deref())
    }

    /// Sum of absolute leg amounts.
    pub fn total_amount(&self) -> u64 {
        self.records.iter().map(NormalizedTransaction::amount).sum()
    }

    /// The fee reported for this transaction. Wallets report the same fee on each of their
    /// records, so this is the largest one seen rather than a sum.
    pub fn fee(&self) -> u64 {
        self.records
            .iter()
            .filter_map(|record| record.fee)
            .max()
            .unwrap_or_default()
    }

    pub fn wallets(&self) -> BTreeSet<String> {
        self.records
            .iter()
            .filter_map(|record| record.wallet.clone())
            .collect()
    }
}

/// Group records by txid, in order of first appearance.
pub fn group_transactions(records: &[NormalizedTransaction]) -> Vec<TransactionGroup> {
    let mut positions = HashMap::<&str, usize>::new();
    let mut groups = Vec::<TransactionGroup>::new();

    for record in records {
        match positions.get(record.txid.as_str()) {
            Some(&position) => {
                let group = &mut groups[position];
                group.date = group.date.min(record.date);
                group.confirmed &= record.confirmed;
                group.records.push(record.clone());
            }
            None => {
                positions.insert(record.txid.as_str(), groups.len());
                groups.push(TransactionGroup {
                    txid: record.txid.clone(),
                    date: record.date,
                    confirmed: record.confirmed,
                    records: vec![record.clone()],
                });
            }
        }
    }

    groups
}

/// Which transactions paid to, and spent from, each address.
#[derive(Debug, Default)]
pub struct AddressIndex {
    producers: HashMap<String, Vec<usize>>,
    consumers: HashMap<String, Vec<usize>>,
}

impl AddressIndex {
    pub fn new(groups: &[TransactionGroup]) -> Self {
        let mut index = Self::default();

        for (position, group) in groups.iter().enumerate() {
            for address in group.output_addresses() {
                push_unique(index.producers.entry(address.to_string()).or_default(), position);
            }
            for address in group.input_addresses() {
                push_unique(index.consumers.entry(address.to_string()).or_default(), position);
            }
        }

        index
    }

    /// Positions of the groups that produced an output at `address`.
    pub fn producers(&self, address: &str) -> &[usize] {
        self.producers.get(address).map(Vec::as_slice).unwrap_or_default()
    }

    /// Positions of the groups that consumed an input from `address`.
    pub fn consumers(&self, address: &str) -> &[usize] {
        self.consumers.get(address).map(Vec::as_slice).unwrap_or_default()
    }

    /// An input address that no transaction in the set ever paid to is funded from outside.
    pub fn is_external_input(&self, address: &str) -> bool {
        self.producers(address).is_empty()
    }
}

fn push_unique(positions: &mut Vec<usize>, position: usize) {
    if positions.last() != Some(&position) {
        positions.push(position);
    }
}

/// Infer spend edges between the given transactions.
///
/// Exact tracing needs `raw` to contain the blockchain data for the transactions. When it was
/// requested but no data is supplied, the address heuristic is used instead.
pub fn trace_relationships(
    groups: &[TransactionGroup],
    opts: &TraceOptions,
    raw: Option<&HashMap<String, Transaction>>,
) -> EdgeSet {
    let edges = match (opts.use_real_blockchain_data, raw) {
        (true, Some(raw)) => exact::trace_exact(groups, raw, opts),
        (true, None) => {
            warn!("No blockchain data available, falling back to the address heuristic");
            trace_heuristic(groups)
        }
        (false, _) => trace_heuristic(groups),
    };
    debug!("Traced {} edges: {:?}", edges.len(), edges.stats());

    edges
}

fn trace_heuristic(groups: &[TransactionGroup]) -> EdgeSet {
    let index = AddressIndex::new(groups);
    let mut edges = EdgeSet::default();

    for (position, child) in groups.iter().enumerate() {
        edges.stats_mut().inc_visits();

        for address in child.input_addresses() {
            for &candidate in index.producers(address) {
                if candidate == position {
                    continue;
                }

                // Ties are rejected so same-timestamp records can never form a cycle.
                let parent = &groups[candidate];
                if parent.date < child.date {
                    edges.insert(&parent.txid, &child.txid, Confidence::Heuristic);
                } else {
                    edges.stats_mut().inc_rejected_by_date();
                }
            }
        }
    }

    edges
}

/// Classify the sent legs of `group` as change, external, or neither.
///
/// - An address paid more than once by the same transaction is change.
/// - An address that a later transaction spends from is a reused own address: neither change
///   nor external.
/// - Anything else is external.
pub fn classify_outputs(
    group: &TransactionGroup,
    groups: &[TransactionGroup],
    index: &AddressIndex,
) -> Vec<NodeOutput> {
    let outputs: Vec<_> = group
        .records
        .iter()
        .filter(|record| record.direction == Direction::Output)
        .collect();

    outputs
        .iter()
        .map(|record| {
            let (is_change, is_external) = match record.address.as_deref() {
                Some(address) => {
                    let repeats = outputs
                        .iter()
                        .filter(|other| other.address.as_deref() == Some(address))
                        .count();
                    let spent_later = index
                        .consumers(address)
                        .iter()
                        .any(|&position| groups[position].date > group.date);

                    if repeats > 1 {
                        (true, false)
                    } else if spent_later {
                        (false, false)
                    } else {
                        (false, true)
                    }
                }
                None => (false, true),
            };

            NodeOutput {
                address: record.address.clone(),
                amount: record.amount(),
                is_change,
                is_external,
            }
        })
        .collect()
}
