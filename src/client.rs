use crate::store::Store;
use esploda::esplora::Transaction;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, env};
use thiserror::Error;
use tracing::{debug, warn};
use ureq::tls::{TlsConfig, TlsProvider};
use ureq::Agent;

pub mod cache;
pub mod esplora;
pub mod price;

// We are choosing 32 threads by default, but the public Esplora servers rate limit well before
// that matters.
const DEFAULT_THREADPOOL_SIZE: usize = 32;

pub type TxResult = Result<Fetched, ProviderError>;

/// A transaction and the provider that served it.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct Fetched {
    pub tx: Transaction,
    pub source: String,
}

/// The blockchain data collaborator.
///
/// Exists as a trait so that unit tests can mock the provider responses.
pub trait ProviderApi {
    /// Fetch raw transactions by txid. Every requested txid has an entry in the result.
    fn get_transactions(&self, txids: &[String]) -> HashMap<String, TxResult>;
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    #[error("Transaction `{0}` not found")]
    NotFound(String),

    #[error("Provider unavailable for `{0}`: {1}")]
    Unavailable(String, String),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Error parsing RAYON_NUM_THREADS")]
    RayonThreadPoolSize(#[source] std::num::ParseIntError),

    #[error("Rayon thread pool error")]
    RayonThreadPoolInit(#[from] rayon::ThreadPoolBuildError),
}

pub(crate) fn create_thread_pool() -> Result<(usize, ThreadPool), PoolError> {
    // Configure the Rayon thread pool for high I/O concurrency.
    let num_threads = env::var("RAYON_NUM_THREADS")
        .unwrap_or_else(|_| DEFAULT_THREADPOOL_SIZE.to_string())
        .parse()
        .map_err(PoolError::RayonThreadPoolSize)?;

    let pool = ThreadPoolBuilder::new().num_threads(num_threads).build()?;

    Ok((num_threads, pool))
}

pub(crate) fn http_agent(max_idle_connections_per_host: usize) -> Agent {
    Agent::from(
        Agent::config_builder()
            .max_idle_connections_per_host(max_idle_connections_per_host)
            .tls_config(
                TlsConfig::builder()
                    .provider(TlsProvider::NativeTls)
                    .build(),
            )
            .build(),
    )
}

/// Raw transactions resolved for a set of txids.
#[derive(Debug, Default)]
pub struct Resolved {
    pub transactions: HashMap<String, Transaction>,

    /// Txids the provider could not serve. These are left out of exact tracing.
    pub skipped: Vec<String>,
}

/// Resolve raw transactions from the store's cache, fetching only the misses from `provider`.
///
/// Fetched transactions are written back to the store with their source. Provider failures never
/// fail the batch: the txid is logged and listed in [`Resolved::skipped`].
pub fn resolve_raw_transactions<P, S>(provider: &P, store: &mut S, txids: &[String]) -> Resolved
where
    P: ProviderApi + ?Sized,
    S: Store + ?Sized,
{
    let mut resolved = Resolved::default();
    let mut misses = Vec::new();

    for txid in txids {
        if resolved.transactions.contains_key(txid) || misses.contains(txid) {
            continue;
        }
        match store.get_cached_raw_transaction(txid) {
            Some(tx) => {
                resolved.transactions.insert(txid.clone(), tx);
            }
            None => misses.push(txid.clone()),
        }
    }
    debug!(
        "{} raw transactions cached, {} to fetch",
        resolved.transactions.len(),
        misses.len()
    );

    if misses.is_empty() {
        return resolved;
    }

    let mut fetched = provider.get_transactions(&misses);
    for txid in misses {
        match fetched.remove(&txid) {
            Some(Ok(Fetched { tx, source })) => {
                store.put_cached_raw_transaction(&txid, tx.clone(), &source);
                resolved.transactions.insert(txid, tx);
            }
            Some(Err(err)) => {
                warn!("Skipping `{txid}`: {err}");
                resolved.skipped.push(txid);
            }
            None => {
                warn!("Skipping `{txid}`: no response from provider");
                resolved.skipped.push(txid);
            }
        }
    }

    resolved
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use esploda::esplora::Status;
    use std::cell::RefCell;
    use tracing_test::traced_test;

    pub(crate) fn raw_tx(txid: &str) -> Transaction {
        Transaction {
            txid: txid.parse().unwrap(),
            version: 2,
            inputs: Vec::new(),
            outputs: Vec::new(),
            size: 0,
            weight: 0,
            fee: 0,
            status: Status::Unconfirmed,
        }
    }

    #[derive(Default)]
    struct MockProvider {
        responses: HashMap<String, TxResult>,
        requested: RefCell<Vec<String>>,
    }

    impl ProviderApi for MockProvider {
        fn get_transactions(&self, txids: &[String]) -> HashMap<String, TxResult> {
            self.requested.borrow_mut().extend(txids.iter().cloned());

            txids
                .iter()
                .filter_map(|txid| Some((txid.clone(), self.responses.get(txid)?.clone())))
                .collect()
        }
    }

    #[test]
    #[traced_test]
    fn test_resolve_uses_cache_and_skips_failures() {
        let _ = tracing_log::LogTracer::init();

        let [cached, fetched, missing, down, silent] =
            [1, 2, 3, 4, 5].map(|n: u32| format!("{n:064x}"));

        let mut store = MemoryStore::default();
        store.put_cached_raw_transaction(&cached, raw_tx(&cached), "earlier");

        let provider = MockProvider {
            responses: HashMap::from([
                (
                    fetched.clone(),
                    Ok(Fetched {
                        tx: raw_tx(&fetched),
                        source: "mempool.space".to_string(),
                    }),
                ),
                (missing.clone(), Err(ProviderError::NotFound(missing.clone()))),
                (
                    down.clone(),
                    Err(ProviderError::Unavailable(down.clone(), "timeout".to_string())),
                ),
            ]),
            ..Default::default()
        };

        let txids = [&cached, &fetched, &missing, &down, &silent, &fetched].map(String::clone);
        let resolved = resolve_raw_transactions(&provider, &mut store, &txids);

        assert_eq!(
            *provider.requested.borrow(),
            [&fetched, &missing, &down, &silent].map(String::clone)
        );
        assert_eq!(resolved.transactions.len(), 2);
        assert!(resolved.transactions.contains_key(&cached));
        assert!(resolved.transactions.contains_key(&fetched));
        assert_eq!(resolved.skipped, [missing, down, silent]);
        assert!(logs_contain("not found"));

        // The fetched transaction was written back with its source.
        assert_eq!(store.cached_source(&fetched), Some("mempool.space"));

        // Everything is cached now, so nothing is fetched.
        provider.requested.borrow_mut().clear();
        let resolved = resolve_raw_transactions(&provider, &mut store, &[cached, fetched]);
        assert!(provider.requested.borrow().is_empty());
        assert_eq!(resolved.transactions.len(), 2);
    }
}
