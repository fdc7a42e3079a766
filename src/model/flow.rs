use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Relationship between the wallets on either side of a flow.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, Hash, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum FlowType {
    Internal,
    External,
    Consolidation,
}

/// One input-to-output pairing inside a transaction.
///
/// A wallet of `None` means the address is not in the address book, which is treated as
/// "external".
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct UtxoFlow {
    pub from_wallet: Option<String>,
    pub to_wallet: Option<String>,
    pub from_address: String,
    pub to_address: String,

    /// Satoshis.
    pub amount: u64,

    pub txid: String,
    pub date: DateTime<Utc>,
    pub fee: Option<u64>,
    pub flow_type: FlowType,
    pub is_change: bool,
}

impl UtxoFlow {
    /// Whether `wallet` is the source or destination of this flow.
    pub fn touches(&self, wallet: &str) -> bool {
        self.from_wallet.as_deref() == Some(wallet) || self.to_wallet.as_deref() == Some(wallet)
    }
}

/// Flow totals for one wallet.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct WalletFlowSummary {
    pub wallet: String,
    pub total_received: u64,
    pub total_sent: u64,
    pub current_balance: i64,

    /// Number of incoming legs.
    pub utxo_count: usize,

    pub consolidation_count: usize,
    pub external_transfer_count: usize,
}
