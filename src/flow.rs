//! Wallet-to-wallet value flows derived from blockchain data.
//!
//! Every input/output pairing of a transaction is a candidate flow. Addresses are resolved to
//! wallets through an [`AddressBook`]. Pairs that stay inside one wallet are dropped unless the
//! transaction consolidates coins.

use crate::model::{FlowType, UtxoFlow, WalletFlowSummary};
use esploda::esplora::Transaction;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, trace};

/// Amounts below this many satoshis moved within one wallet are considered change.
const CHANGE_THRESHOLD: u64 = 100_000;

/// Which wallet owns each known address.
#[derive(Clone, Debug, Default)]
pub struct AddressBook {
    wallets: HashMap<String, String>,
}

impl AddressBook {
    pub fn insert(&mut self, address: String, wallet: String) {
        self.wallets.insert(address, wallet);
    }

    pub fn wallet_of(&self, address: &str) -> Option<&str> {
        self.wallets.get(address).map(String::as_str)
    }

    pub fn extend(&mut self, other: AddressBook) {
        self.wallets.extend(other.wallets);
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }
}

impl FromIterator<(String, String)> for AddressBook {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            wallets: iter.into_iter().collect(),
        }
    }
}

/// Pair every input with every output of each confirmed transaction.
///
/// The amount of a flow is the value of its output. Unconfirmed transactions and legs without an
/// address are skipped. Flows are ordered by date, then txid.
pub fn build_flows<'a, I>(txs: I, book: &AddressBook) -> Vec<UtxoFlow>
where
    I: IntoIterator<Item = &'a Transaction>,
{
    let mut flows = Vec::new();

    for tx in txs {
        let Some(date) = tx.block_time() else {
            trace!("Skipping unconfirmed transaction `{}`", tx.txid);
            continue;
        };
        let txid = tx.txid.to_string();
        let consolidates = tx.inputs.len() > tx.outputs.len();

        for from_address in tx.input_addresses() {
            let from_wallet = book.wallet_of(from_address);

            for output in &tx.outputs {
                let Some(to_address) = output.address.as_deref() else {
                    continue;
                };
                let to_wallet = book.wallet_of(to_address);

                if from_wallet == to_wallet && !consolidates {
                    continue;
                }

                let flow_type = match (from_wallet, to_wallet) {
                    (Some(from), Some(to)) if from == to && consolidates => FlowType::Consolidation,
                    (Some(from), Some(to)) if from == to => FlowType::Internal,
                    _ => FlowType::External,
                };

                flows.push(UtxoFlow {
                    from_wallet: from_wallet.map(str::to_string),
                    to_wallet: to_wallet.map(str::to_string),
                    from_address: from_address.to_string(),
                    to_address: to_address.to_string(),
                    amount: output.value,
                    txid: txid.clone(),
                    date,
                    fee: (tx.fee > 0).then_some(tx.fee),
                    flow_type,
                    is_change: flow_type == FlowType::Internal && output.value < CHANGE_THRESHOLD,
                });
            }
        }
    }

    flows.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.txid.cmp(&b.txid)));
    debug!("Built {} flows", flows.len());

    flows
}

/// Totals of the flows touching `wallet`.
pub fn wallet_summary(flows: &[UtxoFlow], wallet: &str) -> WalletFlowSummary {
    let mut summary = WalletFlowSummary {
        wallet: wallet.to_string(),
        ..Default::default()
    };

    for flow in flows.iter().filter(|flow| flow.touches(wallet)) {
        let incoming = flow.to_wallet.as_deref() == Some(wallet);
        let outgoing = flow.from_wallet.as_deref() == Some(wallet);

        if incoming {
            summary.total_received += flow.amount;
            summary.utxo_count += 1;
        }
        if outgoing {
            summary.total_sent += flow.amount;
        }

        match flow.flow_type {
            FlowType::Consolidation if incoming && outgoing => summary.consolidation_count += 1,
            FlowType::External if incoming != outgoing => summary.external_transfer_count += 1,
            _ => (),
        }
    }
    summary.current_balance = summary.total_received as i64 - summary.total_sent as i64;

    summary
}

/// Flows from wallet `from` to wallet `to`.
pub fn wallet_to_wallet<'a>(
    flows: &'a [UtxoFlow],
    from: &'a str,
    to: &'a str,
) -> impl Iterator<Item = &'a UtxoFlow> + 'a {
    flows.iter().filter(move |flow| {
        flow.from_wallet.as_deref() == Some(from) && flow.to_wallet.as_deref() == Some(to)
    })
}

/// Txids of the transactions consolidating coins within `wallet`.
pub fn consolidations<'a>(flows: &'a [UtxoFlow], wallet: &str) -> BTreeSet<&'a str> {
    flows
        .iter()
        .filter(|flow| flow.flow_type == FlowType::Consolidation)
        .filter(|flow| flow.from_wallet.as_deref() == Some(wallet))
        .map(|flow| flow.txid.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use esploda::bitcoin::ScriptBuf;
    use esploda::esplora::{Status, TxIn, TxOut};
    use similar_asserts::assert_eq;
    use tracing_test::traced_test;

    fn txid(n: u32) -> String {
        format!("{n:064x}")
    }

    fn output(address: Option<&str>, value: u64) -> TxOut {
        TxOut {
            script_pubkey: ScriptBuf::new(),
            script_type: None,
            address: address.map(str::to_string),
            value,
        }
    }

    fn input(address: Option<&str>) -> TxIn {
        TxIn {
            txid: txid(0xffff).parse().unwrap(),
            index: 0,
            previous_output: Some(output(address, 0)),
            sequence: 0,
        }
    }

    fn tx(n: u32, inputs: Vec<TxIn>, outputs: Vec<TxOut>) -> Transaction {
        Transaction {
            txid: txid(n).parse().unwrap(),
            version: 2,
            inputs,
            outputs,
            size: 0,
            weight: 0,
            fee: 500,
            status: Status::Confirmed {
                block_height: 800_000 + n,
                block_hash: "00000000000000000002a7c4c1e48d76c5a37902165a270156b7a8d72728a054"
                    .parse()
                    .unwrap(),
                block_time: chrono::DateTime::from_timestamp(1_700_000_000 + i64::from(n), 0)
                    .unwrap(),
            },
        }
    }

    fn book() -> AddressBook {
        [("a1", "A"), ("a2", "A"), ("a3", "A"), ("b1", "B")]
            .into_iter()
            .map(|(address, wallet)| (address.to_string(), wallet.to_string()))
            .collect()
    }

    #[test]
    #[traced_test]
    fn test_build_flows() {
        let _ = tracing_log::LogTracer::init();

        let txs = [
            // A pays B, with change back to A
            tx(
                1,
                vec![input(Some("a1"))],
                vec![output(Some("b1"), 40_000), output(Some("a2"), 9_000)],
            ),
            // A consolidates two coins
            tx(
                2,
                vec![input(Some("a1")), input(Some("a2"))],
                vec![output(Some("a3"), 70_000)],
            ),
            // Outsider pays A, with an OP_RETURN output
            tx(3, vec![input(Some("x1"))], vec![output(Some("a1"), 5_000), output(None, 0)]),
        ];
        let mut unconfirmed = tx(4, vec![input(Some("a1"))], vec![output(Some("b1"), 1)]);
        unconfirmed.status = Status::Unconfirmed;

        let flows = build_flows(txs.iter().chain([&unconfirmed]), &book());

        let shape: Vec<_> = flows
            .iter()
            .map(|flow| {
                (
                    flow.from_address.as_str(),
                    flow.to_address.as_str(),
                    flow.amount,
                    flow.flow_type,
                )
            })
            .collect();
        assert_eq!(
            shape,
            [
                ("a1", "b1", 40_000, FlowType::External),
                ("a1", "a3", 70_000, FlowType::Consolidation),
                ("a2", "a3", 70_000, FlowType::Consolidation),
                ("x1", "a1", 5_000, FlowType::External),
            ]
        );
        assert_eq!(flows[0].fee, Some(500));
        assert_eq!(flows[3].from_wallet, None);
        assert!(flows.iter().all(|flow| !flow.is_change));

        let summary = wallet_summary(&flows, "A");
        assert_eq!(summary.total_received, 70_000 * 2 + 5_000);
        assert_eq!(summary.total_sent, 40_000 + 70_000 * 2);
        assert_eq!(summary.current_balance, -35_000);
        assert_eq!(summary.utxo_count, 3);
        assert_eq!(summary.consolidation_count, 2);
        assert_eq!(summary.external_transfer_count, 2);

        assert_eq!(wallet_to_wallet(&flows, "A", "B").count(), 1);
        assert_eq!(wallet_to_wallet(&flows, "B", "A").count(), 0);
        assert_eq!(
            consolidations(&flows, "A").into_iter().collect::<Vec<_>>(),
            [txid(2).as_str()]
        );
        assert!(consolidations(&flows, "B").is_empty());
    }

    #[test]
    #[traced_test]
    fn test_address_book() {
        let _ = tracing_log::LogTracer::init();

        let mut book = book();
        assert_eq!(book.wallet_of("b1"), Some("B"));
        assert_eq!(book.wallet_of("nope"), None);

        book.insert("b1".to_string(), "C".to_string());
        assert_eq!(book.wallet_of("b1"), Some("C"));
        assert_eq!(book.len(), 4);
    }
}
