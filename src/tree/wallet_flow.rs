//! One tree per wallet, holding every transaction that moved value in or out of it.
//!
//! Unlike spend-chain trees these are not exclusive: a transfer between two wallets is a member of
//! both wallets' trees.

use crate::model::{NodeInput, NodeOutput, TransactionNode, TransactionTree, UtxoFlow};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// A transaction's direction relative to one wallet.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum WalletTxType {
    /// The wallet is on both sides.
    Internal,
    Received,
    Sent,
    Unknown,
}

#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct WalletTxInfo {
    pub transaction_type: WalletTxType,

    /// Other named wallets on the transaction's legs.
    pub related_wallets: BTreeSet<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct WalletFlowTree {
    pub wallet: String,
    pub tree: TransactionTree,

    /// Keyed by txid.
    pub annotations: BTreeMap<String, WalletTxInfo>,

    pub total_received: u64,
    pub total_sent: u64,

    /// `total_received - total_sent`
    pub balance: i64,
}

impl WalletFlowTree {
    pub fn transaction_count(&self) -> usize {
        self.tree.len()
    }
}

/// Build a tree for every wallet named in `flows`, busiest wallet first.
pub fn build_wallet_flow_trees(flows: &[UtxoFlow]) -> Vec<WalletFlowTree> {
    let wallets: BTreeSet<&str> = flows
        .iter()
        .flat_map(|flow| [flow.from_wallet.as_deref(), flow.to_wallet.as_deref()])
        .flatten()
        .collect();

    let mut trees: Vec<_> = wallets
        .into_iter()
        .map(|wallet| wallet_flow_tree(wallet, flows))
        .collect();
    trees.sort_by(|a, b| b.transaction_count().cmp(&a.transaction_count()));

    trees
}

fn wallet_flow_tree(wallet: &str, flows: &[UtxoFlow]) -> WalletFlowTree {
    let mut by_txid = BTreeMap::<&str, Vec<&UtxoFlow>>::new();
    for flow in flows.iter().filter(|flow| flow.touches(wallet)) {
        by_txid.entry(flow.txid.as_str()).or_default().push(flow);
    }

    let mut nodes = BTreeMap::new();
    let mut annotations = BTreeMap::new();
    let mut total_received = 0;
    let mut total_sent = 0;

    for (txid, legs) in by_txid {
        let incoming: Vec<_> = legs
            .iter()
            .filter(|flow| flow.to_wallet.as_deref() == Some(wallet))
            .collect();
        let outgoing: Vec<_> = legs
            .iter()
            .filter(|flow| flow.from_wallet.as_deref() == Some(wallet))
            .collect();

        let transaction_type = match (incoming.is_empty(), outgoing.is_empty()) {
            (false, false) => WalletTxType::Internal,
            (false, true) => WalletTxType::Received,
            (true, false) => WalletTxType::Sent,
            (true, true) => WalletTxType::Unknown,
        };

        let received: u64 = incoming.iter().map(|flow| flow.amount).sum();
        let sent: u64 = outgoing.iter().map(|flow| flow.amount).sum();
        total_received += received;
        total_sent += sent;

        let wallets: BTreeSet<String> = legs
            .iter()
            .flat_map(|flow| [&flow.from_wallet, &flow.to_wallet])
            .flatten()
            .cloned()
            .collect();
        let related_wallets = wallets
            .iter()
            .filter(|name| *name != wallet && *name != "external")
            .cloned()
            .collect();

        let first = legs[0];
        let node = TransactionNode {
            id: txid.to_string(),
            date: first.date,
            confirmed: true,
            wallets,
            inputs: incoming
                .iter()
                .map(|flow| NodeInput {
                    address: Some(flow.from_address.clone()),
                    amount: flow.amount,
                })
                .collect(),
            outputs: outgoing
                .iter()
                .map(|flow| NodeOutput {
                    address: Some(flow.to_address.clone()),
                    amount: flow.amount,
                    is_change: flow.is_change,
                    is_external: flow.to_wallet.is_none(),
                })
                .collect(),
            children: Vec::new(),
            parent: None,
            total_amount: legs.iter().map(|flow| flow.amount).sum(),
            fee: first.fee.unwrap_or_default(),
            price: None,
            price_usd: None,
        };

        nodes.insert(txid.to_string(), node);
        annotations.insert(
            txid.to_string(),
            WalletTxInfo {
                transaction_type,
                related_wallets,
            },
        );
    }
    debug!("Wallet `{wallet}` has {} transactions", nodes.len());

    WalletFlowTree {
        wallet: wallet.to_string(),
        tree: TransactionTree::new(format!("wallet_{wallet}"), nodes),
        annotations,
        total_received,
        total_sent,
        balance: total_received as i64 - total_sent as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FlowType;
    use similar_asserts::assert_eq;
    use tracing_test::traced_test;

    fn flow(txid: &str, from: Option<&str>, to: Option<&str>, amount: u64) -> UtxoFlow {
        UtxoFlow {
            from_wallet: from.map(str::to_string),
            to_wallet: to.map(str::to_string),
            from_address: format!("{}-addr", from.unwrap_or("ext")),
            to_address: format!("{}-addr", to.unwrap_or("ext")),
            amount,
            txid: txid.to_string(),
            date: "2023-05-01T00:00:00Z".parse().unwrap(),
            fee: Some(200),
            flow_type: if from.is_some() && from == to {
                FlowType::Internal
            } else {
                FlowType::External
            },
            is_change: false,
        }
    }

    #[test]
    #[traced_test]
    fn test_transfer_appears_in_both_wallets() {
        let _ = tracing_log::LogTracer::init();

        let flows = [
            flow("t1", Some("A"), Some("B"), 50_000),
            flow("t2", None, Some("A"), 80_000),
            flow("t3", Some("A"), None, 10_000),
        ];
        let trees = build_wallet_flow_trees(&flows);

        assert_eq!(trees.len(), 2);
        assert_eq!(trees[0].wallet, "A");
        assert_eq!(trees[0].tree.root_id, "wallet_A");
        assert_eq!(trees[0].transaction_count(), 3);
        assert_eq!(trees[1].wallet, "B");
        assert!(trees[0].tree.nodes.contains_key("t1"));
        assert!(trees[1].tree.nodes.contains_key("t1"));

        let a = &trees[0];
        assert_eq!(a.annotations["t1"].transaction_type, WalletTxType::Sent);
        assert_eq!(
            a.annotations["t1"].related_wallets,
            BTreeSet::from(["B".to_string()])
        );
        assert_eq!(a.annotations["t2"].transaction_type, WalletTxType::Received);
        assert!(a.annotations["t2"].related_wallets.is_empty());
        assert_eq!(a.total_received, 80_000);
        assert_eq!(a.total_sent, 60_000);
        assert_eq!(a.balance, 20_000);

        let b = &trees[1];
        assert_eq!(b.annotations["t1"].transaction_type, WalletTxType::Received);
        assert_eq!(b.tree.nodes["t1"].inputs.len(), 1);
        assert!(b.tree.nodes["t1"].outputs.is_empty());
        assert_eq!(b.balance, 50_000);

        assert!(a.tree.nodes["t3"].outputs[0].is_external);
    }

    #[test]
    #[traced_test]
    fn test_self_transfer_is_internal() {
        let _ = tracing_log::LogTracer::init();

        let flows = [flow("t1", Some("A"), Some("A"), 5_000)];
        let trees = build_wallet_flow_trees(&flows);

        assert_eq!(trees.len(), 1);
        let info = &trees[0].annotations["t1"];
        assert_eq!(info.transaction_type, WalletTxType::Internal);
        assert!(info.related_wallets.is_empty());
        assert_eq!(trees[0].balance, 0);
    }
}
