use crate::model::{classify_address, AddressInfo};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const SATS_PER_BTC: i64 = 100_000_000;

/// Value consumed by a transaction.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct NodeInput {
    pub address: Option<String>,
    pub amount: u64,
}

/// Value produced by a transaction.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct NodeOutput {
    pub address: Option<String>,
    pub amount: u64,
    pub is_change: bool,
    pub is_external: bool,
}

/// One transaction in a tree.
///
/// `children` is authoritative for traversal. `parent` is a back-reference only.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct TransactionNode {
    pub id: String,
    pub date: DateTime<Utc>,
    pub confirmed: bool,
    pub wallets: BTreeSet<String>,
    pub inputs: Vec<NodeInput>,
    pub outputs: Vec<NodeOutput>,
    pub children: Vec<String>,
    pub parent: Option<String>,

    /// Sum of absolute leg amounts, in satoshis.
    pub total_amount: u64,
    pub fee: u64,

    /// USD per BTC on the transaction date.
    pub price: Option<Decimal>,

    /// `total_amount` valued in USD.
    pub price_usd: Option<Decimal>,
}

/// Inclusive span of dates.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// A set of transactions connected by spend edges, or by address links for chains.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct TransactionTree {
    pub root_id: String,
    pub nodes: BTreeMap<String, TransactionNode>,
    pub total_amount: u64,
    pub total_value_usd: Decimal,
    pub date_range: Option<DateRange>,

    /// Set only for address-linked chains.
    pub chain_length: Option<usize>,
}

/// Display-oriented digest of a [`TransactionTree`].
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct TreeSummary {
    pub root_id: String,
    pub node_count: usize,
    pub input_count: usize,
    pub output_count: usize,
    pub external_count: usize,
    pub change_count: usize,
    pub total_amount: u64,
    pub total_value_usd: Decimal,
    pub date_range: Option<DateRange>,
    pub description: String,
}

impl TransactionNode {
    /// Classified addresses of this node, flagged by side.
    pub fn address_infos(&self) -> Vec<AddressInfo> {
        let inputs = self
            .inputs
            .iter()
            .filter_map(|input| input.address.as_deref())
            .map(|address| classify_address(address).as_input());
        let outputs = self
            .outputs
            .iter()
            .filter_map(|output| output.address.as_deref())
            .map(|address| classify_address(address).as_output());

        inputs.chain(outputs).collect()
    }

    /// Set the price and derive the USD value of `total_amount`.
    pub fn set_price(&mut self, price: Option<Decimal>) {
        self.price = price;
        self.price_usd = price.map(|price| sats_to_btc(self.total_amount) * price);
    }
}

impl DateRange {
    pub fn new(date: DateTime<Utc>) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn extend(&mut self, date: DateTime<Utc>) {
        self.start = self.start.min(date);
        self.end = self.end.max(date);
    }

    /// Range over all dates, or `None` when there are none.
    pub fn from_dates<I>(dates: I) -> Option<Self>
    where
        I: IntoIterator<Item = DateTime<Utc>>,
    {
        let mut dates = dates.into_iter();
        let mut range = Self::new(dates.next()?);
        for date in dates {
            range.extend(date);
        }

        Some(range)
    }
}

impl TransactionTree {
    /// Create a tree from its member nodes and compute the aggregates.
    pub fn new(root_id: String, nodes: BTreeMap<String, TransactionNode>) -> Self {
        let mut tree = Self {
            root_id,
            nodes,
            total_amount: 0,
            total_value_usd: Decimal::ZERO,
            date_range: None,
            chain_length: None,
        };
        tree.update_aggregates();

        tree
    }

    /// Recompute `total_amount`, `total_value_usd` and `date_range` from the member nodes.
    ///
    /// Unpriced nodes contribute nothing to `total_value_usd`.
    pub fn update_aggregates(&mut self) {
        self.total_amount = self.nodes.values().map(|node| node.total_amount).sum();
        self.total_value_usd = self.nodes.values().filter_map(|node| node.price_usd).sum();
        self.date_range = DateRange::from_dates(self.nodes.values().map(|node| node.date));
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn summarize(&self) -> TreeSummary {
        let outputs = self.nodes.values().flat_map(|node| &node.outputs);
        let external_count = outputs.clone().filter(|output| output.is_external).count();
        let change_count = outputs.filter(|output| output.is_change).count();
        let input_count = self.nodes.values().map(|node| node.inputs.len()).sum();
        let output_count = self.nodes.values().map(|node| node.outputs.len()).sum();

        let description = match self.chain_length {
            Some(length) => {
                format!("UTXO Chain: {length} transactions showing coin movement between wallets")
            }
            None => {
                let mut description =
                    format!("Tree with {input_count} inputs and {output_count} outputs");
                if external_count > 0 {
                    description.push_str(&format!(" ({external_count} external)"));
                }
                if change_count > 0 {
                    description.push_str(&format!(" ({change_count} change)"));
                }
                description
            }
        };

        TreeSummary {
            root_id: self.root_id.clone(),
            node_count: self.nodes.len(),
            input_count,
            output_count,
            external_count,
            change_count,
            total_amount: self.total_amount,
            total_value_usd: self.total_value_usd,
            date_range: self.date_range,
            description,
        }
    }
}

/// Convert satoshis to a BTC decimal with 8 places.
pub fn sats_to_btc(sats: u64) -> Decimal {
    Decimal::from_i128_with_scale(sats as i128, 8)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use similar_asserts::assert_eq;
    use tracing_test::traced_test;

    pub(crate) fn node(id: &str, date: &str, total_amount: u64) -> TransactionNode {
        TransactionNode {
            id: id.to_string(),
            date: date.parse().unwrap(),
            confirmed: true,
            wallets: BTreeSet::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            children: Vec::new(),
            parent: None,
            total_amount,
            fee: 0,
            price: None,
            price_usd: None,
        }
    }

    #[test]
    #[traced_test]
    fn test_tree_aggregates() {
        let _ = tracing_log::LogTracer::init();

        let mut a = node("a", "2023-01-01T00:00:00Z", 50_000_000);
        a.set_price(Some(Decimal::from(20_000)));
        let b = node("b", "2023-03-01T00:00:00Z", 25_000_000);
        let nodes = BTreeMap::from([("a".to_string(), a), ("b".to_string(), b)]);

        let tree = TransactionTree::new("a".to_string(), nodes);

        assert_eq!(tree.total_amount, 75_000_000);
        assert_eq!(tree.total_value_usd, Decimal::from(10_000));
        let range = tree.date_range.unwrap();
        assert_eq!(range.start, "2023-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert_eq!(range.end, "2023-03-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    #[traced_test]
    fn test_summary_description() {
        let _ = tracing_log::LogTracer::init();

        let mut a = node("a", "2023-01-01T00:00:00Z", 3_000);
        a.inputs.push(NodeInput {
            address: Some("1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2".to_string()),
            amount: 3_000,
        });
        a.outputs.push(NodeOutput {
            address: Some("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq".to_string()),
            amount: 2_000,
            is_change: false,
            is_external: true,
        });
        a.outputs.push(NodeOutput {
            address: None,
            amount: 1_000,
            is_change: false,
            is_external: false,
        });
        let mut tree = TransactionTree::new("a".to_string(), BTreeMap::from([("a".into(), a)]));

        let summary = tree.summarize();
        assert_eq!(summary.description, "Tree with 1 inputs and 2 outputs (1 external)");
        assert_eq!(summary.external_count, 1);
        assert_eq!(summary.change_count, 0);

        tree.chain_length = Some(1);
        assert_eq!(
            tree.summarize().description,
            "UTXO Chain: 1 transactions showing coin movement between wallets"
        );

        let infos = tree.nodes["a"].address_infos();
        assert_eq!(infos.len(), 2);
        assert!(infos[0].is_input && !infos[0].is_output);
        assert!(infos[1].is_output && !infos[1].is_input);
    }
}
