use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use std::{collections::BTreeMap, ffi::OsStr, fs, path::Path};
use thiserror::Error;
use tracing::{debug, warn};

const ONE_DAY: u64 = 60 * 60 * 24;

#[derive(Debug, Error)]
pub enum PriceDbError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("RON parsing error")]
    Parse(#[from] ron::de::SpannedError),

    #[error("DB has an invalid aggregation granularity")]
    InvalidGranularity,
}

/// Source of historical BTCUSD prices.
///
/// `None` means the price cannot be resolved. Implementations must never substitute a made-up
/// value.
pub trait PriceLookup {
    fn get_price(&self, date: NaiveDate) -> Option<Decimal>;
}

impl<T: PriceLookup + ?Sized> PriceLookup for &T {
    fn get_price(&self, date: NaiveDate) -> Option<Decimal> {
        (**self).get_price(date)
    }
}

/// A price source with no data. Every lookup is unresolved.
#[derive(Debug, Default)]
pub struct NoPrices;

impl PriceLookup for NoPrices {
    fn get_price(&self, _date: NaiveDate) -> Option<Decimal> {
        None
    }
}

/// Prices already resolved by date, e.g. prefetched from an HTTP source.
impl PriceLookup for BTreeMap<NaiveDate, Decimal> {
    fn get_price(&self, date: NaiveDate) -> Option<Decimal> {
        self.get(&date).copied()
    }
}

pub type PriceMap = BTreeMap<u64, Decimal>;

/// Offline BTCUSD price database, keyed by UNIX timestamp.
#[derive(Debug)]
pub struct PriceDb {
    /// Timestamp granularity.
    ///
    /// Equal to the interval between each timestamp in the keys, minus 1 second.
    granularity: u64,

    btc: PriceMap,
}

impl PriceDb {
    /// Load every `*-btcusd.ron` file in the given directory.
    pub fn new<P>(path: P) -> Result<Self, PriceDbError>
    where
        P: AsRef<Path>,
    {
        let mut btc = PriceMap::new();

        for entry in fs::read_dir(path.as_ref())? {
            let path = entry?.path();

            if path.is_file() && path.extension() == Some(OsStr::new("ron")) {
                let is_btcusd = path
                    .file_stem()
                    .and_then(OsStr::to_str)
                    .is_some_and(|name| name.ends_with("-btcusd"));

                if is_btcusd {
                    debug!("Reading prices from {path:?}");
                    btc.extend(read_ron(&path)?);
                }
            }
        }

        Self::from_map(btc)
    }

    /// Create a DB from an in-memory map. A map with fewer than two entries is assumed daily.
    pub fn from_map(btc: PriceMap) -> Result<Self, PriceDbError> {
        if btc.is_empty() {
            warn!("Missing BTCUSD prices");
        }

        let granularity = match btc.len() {
            0 | 1 => ONE_DAY,
            _ => check_granularity(&btc)?,
        };

        Ok(Self {
            // Make lower-bound searches exclusive
            granularity: granularity - 1,
            btc,
        })
    }

    /// The latest price recorded within one granularity window before `datetime`.
    pub fn get(&self, datetime: DateTime<Utc>) -> Option<Decimal> {
        let end = u64::try_from(datetime.timestamp()).ok()?;
        let start = end.saturating_sub(self.granularity);

        let price = self.btc.range(start..=end).next_back().map(|(_k, v)| *v);
        if price.is_none() {
            debug!("No BTCUSD price for {datetime}");
        }

        price
    }
}

impl PriceLookup for PriceDb {
    fn get_price(&self, date: NaiveDate) -> Option<Decimal> {
        self.get(date.and_time(NaiveTime::MIN).and_utc())
    }
}

fn read_ron(path: &Path) -> Result<PriceMap, PriceDbError> {
    let data = fs::read_to_string(path)?;
    let prices = ron::from_str::<PriceMap>(&data)?;

    Ok(prices)
}

fn check_granularity(map: &PriceMap) -> Result<u64, PriceDbError> {
    let mut keys = map.keys().zip(map.keys().skip(1));
    let (first, second) = keys.next().ok_or(PriceDbError::InvalidGranularity)?;
    let granularity = second - first;

    if granularity > 0 && keys.all(|(a, b)| b - a == granularity) {
        Ok(granularity)
    } else {
        Err(PriceDbError::InvalidGranularity)
    }
}
