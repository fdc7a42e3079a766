//! Persistence for normalized records and fetched blockchain data.

use crate::model::NormalizedTransaction;
use esploda::esplora::Transaction;
use ron::{de::SpannedError, ser::PrettyConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

pub const STORE_VERSION: &str = "1.0.0";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("Unable to deserialize")]
    Deserialize(#[from] SpannedError),

    #[error("Unable to serialize")]
    Serialize(#[from] ron::Error),

    #[error("Expected version `{STORE_VERSION}`, found `{0}`")]
    Version(String),
}

/// The persistence collaborator.
///
/// Exists as a trait so that unit tests and alternative backends can stand in for
/// [`MemoryStore`].
pub trait Store {
    /// Records imported for one wallet, in import order.
    fn list_transactions_for_wallet(&self, wallet: &str) -> Vec<NormalizedTransaction>;

    /// Every record, in import order.
    fn list_all_transactions(&self) -> Vec<NormalizedTransaction>;

    fn get_cached_raw_transaction(&self, txid: &str) -> Option<Transaction>;

    /// Cache a raw transaction, tagged with the provider that served it.
    fn put_cached_raw_transaction(&mut self, txid: &str, data: Transaction, source: &str);
}

#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct CachedRawTx {
    pub source: String,
    pub data: Transaction,
}

/// In-memory [`Store`] that can be saved to and loaded from RON.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct MemoryStore {
    records: Vec<NormalizedTransaction>,
    raw: BTreeMap<String, CachedRawTx>,
}

#[derive(Debug, Deserialize, Serialize)]
struct StoreFile {
    semver: String,
    store: MemoryStore,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append records, skipping any identical to one already stored.
    ///
    /// Returns the number of records added.
    pub fn add_records<I>(&mut self, records: I) -> usize
    where
        I: IntoIterator<Item = NormalizedTransaction>,
    {
        let before = self.records.len();
        let mut seen: HashSet<NormalizedTransaction> = self.records.iter().cloned().collect();
        for record in records {
            if seen.insert(record.clone()) {
                self.records.push(record);
            }
        }

        self.records.len() - before
    }

    /// Names of the wallets with records, sorted.
    pub fn wallets(&self) -> Vec<&str> {
        let mut wallets: Vec<_> = self
            .records
            .iter()
            .filter_map(|record| record.wallet.as_deref())
            .collect();
        wallets.sort_unstable();
        wallets.dedup();

        wallets
    }

    pub fn cached_source(&self, txid: &str) -> Option<&str> {
        self.raw.get(txid).map(|cached| cached.source.as_str())
    }

    pub fn raw_len(&self) -> usize {
        self.raw.len()
    }

    /// Take the cached raw transactions of `other` that this store does not have yet.
    pub fn merge_raw_cache(&mut self, other: MemoryStore) {
        for (txid, cached) in other.raw {
            self.raw.entry(txid).or_insert(cached);
        }
    }

    /// A copy of this store without its records.
    pub fn raw_cache(&self) -> MemoryStore {
        MemoryStore {
            records: Vec::new(),
            raw: self.raw.clone(),
        }
    }

    /// Load a `MemoryStore` from the given path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        debug!("Reading store from {path:?}");

        let serialized = std::fs::read_to_string(path)?;
        Self::from_ron(&serialized)
    }

    /// Save a `MemoryStore` to the given path.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        debug!("Writing store to {path:?}");

        std::fs::write(path, self.to_ron()?)?;

        Ok(())
    }

    fn from_ron(serialized: &str) -> Result<Self, StoreError> {
        let file: StoreFile = ron::from_str(serialized)?;

        if file.semver == STORE_VERSION {
            Ok(file.store)
        } else {
            Err(StoreError::Version(file.semver))
        }
    }

    fn to_ron(&self) -> Result<String, StoreError> {
        #[derive(Serialize)]
        struct StoreFileRef<'a> {
            semver: &'a str,
            store: &'a MemoryStore,
        }

        let file = StoreFileRef {
            semver: STORE_VERSION,
            store: self,
        };

        Ok(ron::ser::to_string_pretty(&file, PrettyConfig::default())?)
    }
}

impl Store for MemoryStore {
    fn list_transactions_for_wallet(&self, wallet: &str) -> Vec<NormalizedTransaction> {
        self.records
            .iter()
            .filter(|record| record.wallet.as_deref() == Some(wallet))
            .cloned()
            .collect()
    }

    fn list_all_transactions(&self) -> Vec<NormalizedTransaction> {
        self.records.clone()
    }

    fn get_cached_raw_transaction(&self, txid: &str) -> Option<Transaction> {
        self.raw.get(txid).map(|cached| cached.data.clone())
    }

    fn put_cached_raw_transaction(&mut self, txid: &str, data: Transaction, source: &str) {
        self.raw.insert(
            txid.to_string(),
            CachedRawTx {
                source: source.to_string(),
                data,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::raw_tx;
    use crate::model::record::tests::record;
    use similar_asserts::assert_eq;
    use tracing_test::traced_test;

    fn store() -> MemoryStore {
        let mut store = MemoryStore::new();
        let added = store.add_records([
            record("a", "2023-01-01T00:00:00Z", 1_000, Some("addr"), Some("hot")),
            record("b", "2023-01-02T00:00:00Z", -500, None, Some("cold")),
            record("a", "2023-01-01T00:00:00Z", 1_000, Some("addr"), Some("hot")),
        ]);
        assert_eq!(added, 2);

        let txid = format!("{:064x}", 1);
        store.put_cached_raw_transaction(&txid, raw_tx(&txid), "mempool.space");

        store
    }

    #[test]
    #[traced_test]
    fn test_store_queries() {
        let _ = tracing_log::LogTracer::init();

        let store = store();
        assert_eq!(store.list_all_transactions().len(), 2);
        assert_eq!(store.list_transactions_for_wallet("hot").len(), 1);
        assert!(store.list_transactions_for_wallet("other").is_empty());
        assert_eq!(store.wallets(), ["cold", "hot"]);

        let txid = format!("{:064x}", 1);
        assert_eq!(store.get_cached_raw_transaction(&txid), Some(raw_tx(&txid)));
        assert_eq!(store.cached_source(&txid), Some("mempool.space"));
        assert_eq!(store.get_cached_raw_transaction("unknown"), None);
    }

    #[test]
    #[traced_test]
    fn test_store_dedup_keeps_order() {
        let _ = tracing_log::LogTracer::init();

        let mut store = store();
        let batch: Vec<_> = (0..1_000)
            .map(|n| {
                let txid = format!("t{}", n % 50);
                record(&txid, "2023-02-01T00:00:00Z", 100, Some("addr"), Some("hot"))
            })
            .collect();
        assert_eq!(store.add_records(batch.clone()), 50);
        assert_eq!(store.add_records(batch), 0);

        // Differing in any field is a different record.
        let mut changed = record("a", "2023-01-01T00:00:00Z", 1_000, Some("addr"), Some("hot"));
        changed.confirmed = false;
        assert_eq!(store.add_records([changed]), 1);

        let txids: Vec<_> = store
            .list_all_transactions()
            .into_iter()
            .map(|record| record.txid)
            .take(4)
            .collect();
        assert_eq!(txids, ["a", "b", "t0", "t1"]);
        assert_eq!(store.list_all_transactions().len(), 53);
    }

    #[test]
    #[traced_test]
    fn test_store_ron() {
        let _ = tracing_log::LogTracer::init();

        let store = store();
        let serialized = store.to_ron().unwrap();
        assert_eq!(MemoryStore::from_ron(&serialized).unwrap(), store);

        let mut merged = MemoryStore::new();
        merged.merge_raw_cache(store.raw_cache());
        assert!(merged.list_all_transactions().is_empty());
        assert_eq!(merged.raw_len(), 1);

        let old = serialized.replace(STORE_VERSION, "0.0.1");
        assert!(matches!(
            MemoryStore::from_ron(&old),
            Err(StoreError::Version(version)) if version == "0.0.1"
        ));
    }
}
