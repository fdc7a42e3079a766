use super::cache::TtlCache;
use crate::model::PriceLookup;
use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::{sync::Arc, thread, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};
use ureq::Agent;

pub const YAHOO_CHART_API: &str = "https://query1.finance.yahoo.com/v8/finance/chart/BTC-USD";

/// How long a fetched daily close stays cached.
pub const PRICE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const BATCH_SIZE: usize = 10;
const BATCH_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum PriceFetchError {
    #[error("HTTP error")]
    Http(#[from] ureq::Error),

    #[error("No closing price for {0}")]
    MissingClose(NaiveDate),

    #[error("Unrepresentable price")]
    Decimal(#[from] rust_decimal::Error),
}

/// Daily BTCUSD closes from the Yahoo Finance chart API.
///
/// A failed lookup is logged and resolves to `None`.
pub struct YahooPriceClient {
    agent: Agent,
    base_url: String,
    cache: Arc<TtlCache<NaiveDate, Decimal>>,
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    #[serde(default)]
    result: Vec<ChartResult>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<Quote>,
}

#[derive(Debug, Deserialize)]
struct Quote {
    #[serde(default)]
    close: Vec<Option<f64>>,
}

impl ChartResponse {
    fn close(&self) -> Option<f64> {
        let result = self.chart.result.first()?;
        let quote = result.indicators.quote.first()?;

        quote.close.iter().flatten().next().copied()
    }
}

impl YahooPriceClient {
    pub fn new(cache: Arc<TtlCache<NaiveDate, Decimal>>) -> Self {
        Self::with_base_url(YAHOO_CHART_API, cache)
    }

    pub fn with_base_url(base_url: &str, cache: Arc<TtlCache<NaiveDate, Decimal>>) -> Self {
        Self {
            agent: super::http_agent(BATCH_SIZE),
            base_url: base_url.trim_end_matches('/').to_string(),
            cache,
        }
    }

    fn chart_url(&self, date: NaiveDate) -> String {
        let start = date.and_time(NaiveTime::MIN).and_utc().timestamp();
        let end = start + 24 * 60 * 60;

        format!(
            "{}?period1={start}&period2={end}&interval=1d",
            self.base_url
        )
    }

    fn fetch(&self, date: NaiveDate) -> Result<Decimal, PriceFetchError> {
        let url = self.chart_url(date);
        debug!("Fetching BTCUSD close for {date}");

        let chart: ChartResponse = self.agent.get(&url).call()?.body_mut().read_json()?;
        let close = chart.close().ok_or(PriceFetchError::MissingClose(date))?;

        Ok(Decimal::try_from(close)?.round_dp(2))
    }

    /// Resolve prices for many dates, in batches with a pause between them.
    pub fn prefetch<I>(&self, dates: I) -> BTreeMap<NaiveDate, Decimal>
    where
        I: IntoIterator<Item = NaiveDate>,
    {
        let dates: Vec<_> = dates
            .into_iter()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut prices = BTreeMap::new();

        for (i, batch) in dates.chunks(BATCH_SIZE).enumerate() {
            if i > 0 {
                thread::sleep(BATCH_DELAY);
            }
            for &date in batch {
                if let Some(price) = self.get_price(date) {
                    prices.insert(date, price);
                }
            }
        }

        prices
    }
}

impl PriceLookup for YahooPriceClient {
    fn get_price(&self, date: NaiveDate) -> Option<Decimal> {
        if let Some(price) = self.cache.get(&date) {
            return Some(price);
        }

        match self.fetch(date) {
            Ok(price) => {
                self.cache.insert(date, price);
                Some(price)
            }
            Err(err) => {
                warn!("No BTCUSD price for {date}: {err}");
                None
            }
        }
    }
}
