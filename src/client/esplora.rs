use super::cache::TtlCache;
use super::{Fetched, PoolError, ProviderApi, ProviderError, TxResult};
use esploda::bitcoin::Txid;
use esploda::esplora::{ApiError, Esplora, Transaction};
use rayon::{prelude::*, ThreadPool};
use std::{collections::HashMap, sync::Arc, thread, time::Duration, time::Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use ureq::Agent;

/// Requests in flight at once. The public servers throttle bursts.
const BATCH_SIZE: usize = 10;

/// Pause between batches.
const BATCH_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum EsploraClientError {
    #[error("Invalid Esplora URI")]
    EsploraUri(#[from] ApiError),

    #[error("No Esplora servers configured")]
    NoServers,

    #[error("Thread Pool error")]
    ThreadPool(#[from] PoolError),
}

/// A concurrent Esplora client with failover between servers.
///
/// Servers are tried in the order given. Successful responses are kept in a shared [`TtlCache`].
pub struct EsploraClient {
    pool: ThreadPool,
    agent: Agent,
    servers: Vec<Esplora>,
    cache: Arc<TtlCache<String, Fetched>>,
}

impl EsploraClient {
    /// Create a new Esplora client with the provided API server URIs.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # fn main() -> Result<(), utxotrace::client::esplora::EsploraClientError> {
    /// # use std::{sync::Arc, time::Duration};
    /// # use utxotrace::client::{cache::TtlCache, esplora::EsploraClient};
    /// let cache = Arc::new(TtlCache::new(Duration::from_secs(86_400)));
    /// let client = EsploraClient::new(
    ///     &["https://mempool.space/api/", "https://blockstream.info/api/"],
    ///     cache,
    /// )?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn new<S>(
        api_servers: &[S],
        cache: Arc<TtlCache<String, Fetched>>,
    ) -> Result<Self, EsploraClientError>
    where
        S: AsRef<str>,
    {
        if api_servers.is_empty() {
            return Err(EsploraClientError::NoServers);
        }
        let servers = api_servers
            .iter()
            .map(|server| Esplora::new(server.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        let (num_threads, pool) = super::create_thread_pool()?;
        let agent = super::http_agent(num_threads);

        Ok(Self {
            pool,
            agent,
            servers,
            cache,
        })
    }

    /// Hosts of the configured servers, in failover order.
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.servers.iter().filter_map(Esplora::host)
    }

    /// Height of the chain tip from the first server that answers.
    pub fn tip_height(&self) -> Option<u32> {
        for esplora in &self.servers {
            let source = esplora.host().unwrap_or("esplora");
            match fetch_tip_height(&self.agent, esplora) {
                Ok(height) => {
                    debug!("Chain tip at {height} on {source}");
                    return Some(height);
                }
                Err(err) => warn!("Tip height failed on {source}: {err}"),
            }
        }

        None
    }

    fn get_transaction(&self, txid: &str) -> TxResult {
        if let Some(fetched) = self.cache.get(txid) {
            trace!("TxId `{txid}` served from cache");
            return Ok(fetched);
        }

        let fetched = fetch_tx(&self.agent, &self.servers, txid)?;
        self.cache.insert(txid.to_string(), fetched.clone());

        Ok(fetched)
    }
}

impl ProviderApi for EsploraClient {
    fn get_transactions(&self, txids: &[String]) -> HashMap<String, TxResult> {
        let mut results = HashMap::with_capacity(txids.len());

        for (i, batch) in txids.chunks(BATCH_SIZE).enumerate() {
            if i > 0 {
                thread::sleep(BATCH_DELAY);
            }
            debug!("Fetching batch {} ({} transactions)", i + 1, batch.len());

            let fetched: Vec<_> = self.pool.in_place_scope(|_scope| {
                batch
                    .par_iter()
                    .map(|txid| (txid.clone(), self.get_transaction(txid)))
                    .collect()
            });
            results.extend(fetched);
        }

        results
    }
}

/// Try each server in turn until one returns the transaction.
///
/// The error is `NotFound` only when every server answered 404.
fn fetch_tx(agent: &Agent, servers: &[Esplora], txid: &str) -> TxResult {
    let thread_id = thread::current().id();
    let parsed: Txid = txid
        .parse()
        .map_err(|_| ProviderError::NotFound(txid.to_string()))?;

    let mut error = ProviderError::NotFound(txid.to_string());
    for esplora in servers {
        let source = esplora.host().unwrap_or("esplora").to_string();
        info!("Fetching TxId `{txid}` from {source} on {thread_id:?}");

        let start = Instant::now();
        match fetch_from(agent, esplora, parsed) {
            Ok(tx) => {
                let dur = start.elapsed();
                info!("TxId `{txid}` received in {dur:?}");
                trace!("{tx:#?}");

                return Ok(Fetched { tx, source });
            }
            Err(ureq::Error::StatusCode(404)) => {
                debug!("TxId `{txid}` not found on {source}");
            }
            Err(err) => {
                warn!("TxId `{txid}` failed on {source}: {err}");
                error = ProviderError::Unavailable(txid.to_string(), err.to_string());
            }
        }
    }

    Err(error)
}

fn fetch_from(agent: &Agent, esplora: &Esplora, txid: Txid) -> Result<Transaction, ureq::Error> {
    let req = esplora.get_tx(txid)?;
    let mut resp = agent.run(req)?;

    resp.body_mut().read_json()
}

fn fetch_tip_height(agent: &Agent, esplora: &Esplora) -> Result<u32, ureq::Error> {
    let req = esplora.get_tip_height()?;
    let mut resp = agent.run(req)?;
    let body = resp.body_mut().read_to_string()?;

    body.trim()
        .parse()
        .map_err(|err| ureq::Error::Other(Box::new(err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::raw_tx;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_cached_transactions_skip_network() {
        let _ = tracing_log::LogTracer::init();

        let txid = format!("{:064x}", 7);
        let cache = Arc::new(TtlCache::new(Duration::from_secs(60)));
        cache.insert(
            txid.clone(),
            Fetched {
                tx: raw_tx(&txid),
                source: "blockstream.info".to_string(),
            },
        );

        // The servers are unreachable; only the cache can answer.
        let client = EsploraClient::new(&["http://127.0.0.1:9/api/"], cache).unwrap();
        let results = client.get_transactions(&[txid.clone()]);

        let fetched = results[&txid].as_ref().unwrap();
        assert_eq!(fetched.source, "blockstream.info");
        assert_eq!(client.hosts().collect::<Vec<_>>(), ["127.0.0.1"]);
    }

    #[test]
    #[traced_test]
    fn test_bad_txid_is_not_found() {
        let _ = tracing_log::LogTracer::init();

        let agent = crate::client::http_agent(1);
        let servers = [Esplora::new("http://127.0.0.1:9/api/").unwrap()];

        assert_eq!(
            fetch_tx(&agent, &servers, "not-a-txid"),
            Err(ProviderError::NotFound("not-a-txid".to_string()))
        );
    }

    #[test]
    #[traced_test]
    fn test_server_list_validation() {
        let _ = tracing_log::LogTracer::init();

        let cache = Arc::new(TtlCache::new(Duration::from_secs(60)));
        let empty: [&str; 0] = [];

        assert!(matches!(
            EsploraClient::new(&empty, cache.clone()),
            Err(EsploraClientError::NoServers)
        ));
        assert!(matches!(
            EsploraClient::new(&["/relative/"], cache),
            Err(EsploraClientError::EsploraUri(_))
        ));
    }
}
