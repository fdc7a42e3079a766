use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which way value moved relative to the wallet that owns a record.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Value flows into the owning wallet (received).
    Input,

    /// Value flows out of the owning wallet (sent).
    Output,
}

impl Direction {
    /// Sign rule used when a record has no explicit direction. Zero counts as received.
    pub fn from_value(value: i64) -> Self {
        if value >= 0 {
            Self::Input
        } else {
            Self::Output
        }
    }
}

/// One leg of a transaction as seen by one wallet.
///
/// A txid is not unique across records: the same transaction shows up once per wallet that
/// touches it, and once per address leg in network exports.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, Hash, PartialEq)]
pub struct NormalizedTransaction {
    pub txid: String,
    pub date: DateTime<Utc>,
    pub direction: Direction,

    /// Signed amount in satoshis. The sign is informational.
    pub value: i64,

    pub label: String,
    pub fee: Option<u64>,
    pub confirmed: bool,

    /// Running balance reported by the source. Never recomputed.
    pub balance: Option<i64>,

    /// Address of this leg, when the source reports one.
    pub address: Option<String>,

    /// Name of the wallet this record was imported from.
    pub wallet: Option<String>,
}

impl NormalizedTransaction {
    /// Transacted amount in satoshis.
    pub fn amount(&self) -> u64 {
        self.value.unsigned_abs()
    }
}

/// Totals for one wallet, computed from its records.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct WalletStats {
    pub total_received: u64,
    pub total_sent: u64,
    pub total_fees: u64,

    /// `received - sent - fees`
    pub balance: i64,

    pub transaction_count: usize,
}

/// Per-wallet totals over a set of records. Records without a wallet name are ignored.
pub fn wallet_stats(records: &[NormalizedTransaction]) -> BTreeMap<String, WalletStats> {
    let mut stats = BTreeMap::<String, WalletStats>::new();

    for record in records {
        let Some(wallet) = record.wallet.as_ref() else {
            continue;
        };
        let entry = stats.entry(wallet.clone()).or_default();

        match record.direction {
            Direction::Input => entry.total_received += record.amount(),
            Direction::Output => entry.total_sent += record.amount(),
        }
        entry.total_fees += record.fee.unwrap_or_default();
        entry.transaction_count += 1;
    }

    for entry in stats.values_mut() {
        entry.balance =
            entry.total_received as i64 - entry.total_sent as i64 - entry.total_fees as i64;
    }

    stats
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tracing_test::traced_test;

    /// Test fixture builder shared by the tracer and tree tests.
    pub(crate) fn record(
        txid: &str,
        date: &str,
        value: i64,
        address: Option<&str>,
        wallet: Option<&str>,
    ) -> NormalizedTransaction {
        NormalizedTransaction {
            txid: txid.to_string(),
            date: date.parse().unwrap(),
            direction: Direction::from_value(value),
            value,
            label: String::new(),
            fee: None,
            confirmed: true,
            balance: None,
            address: address.map(str::to_string),
            wallet: wallet.map(str::to_string),
        }
    }

    #[test]
    #[traced_test]
    fn test_direction_sign_rule() {
        let _ = tracing_log::LogTracer::init();

        assert_eq!(Direction::from_value(-50_000), Direction::Output);
        assert_eq!(Direction::from_value(50_000), Direction::Input);
        assert_eq!(Direction::from_value(0), Direction::Input);
    }

    #[test]
    #[traced_test]
    fn test_wallet_stats() {
        let _ = tracing_log::LogTracer::init();

        let mut sent = record("b", "2023-01-02T00:00:00Z", -40_000, None, Some("hot"));
        sent.fee = Some(1_000);
        let records = [
            record("a", "2023-01-01T00:00:00Z", 100_000, None, Some("hot")),
            sent,
            record("c", "2023-01-03T00:00:00Z", 5_000, None, Some("cold")),
            record("d", "2023-01-03T00:00:00Z", 7_000, None, None),
        ];

        let stats = wallet_stats(&records);

        assert_eq!(stats.len(), 2);
        let hot = &stats["hot"];
        assert_eq!(hot.total_received, 100_000);
        assert_eq!(hot.total_sent, 40_000);
        assert_eq!(hot.total_fees, 1_000);
        assert_eq!(hot.balance, 59_000);
        assert_eq!(hot.transaction_count, 2);
        assert_eq!(stats["cold"].balance, 5_000);
    }
}
