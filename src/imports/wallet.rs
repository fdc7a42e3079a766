//! Wallet and network CSV exports, normalized into [`NormalizedTransaction`] records.
//!
//! Two header dialects are recognized by column name:
//!
//! - Wallet exports: `Date (UTC),Label,Value,Balance,Fee,Txid` with values in satoshis.
//! - Network exports: `Confirmed,Date,Type,Label,Address,Amount (BTC),ID` with amounts in BTC.
//!
//! Quote characters around a field are stripped. Delimiters inside quotes are *not* escaped, so a
//! label containing a comma shifts the remaining columns of that row. Rows that fail to parse are
//! skipped with a warning. Only a missing or empty header fails the whole file.

use crate::flow::AddressBook;
use crate::model::{Direction, NormalizedTransaction, SATS_PER_BTC};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use csv::StringRecord;
use rust_decimal::{prelude::ToPrimitive as _, Decimal};
use serde::Deserialize;
use std::{io::Read, path::Path, str::FromStr as _};
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("CSV header row is missing")]
    MissingHeader,

    #[error("CSV header row is empty")]
    EmptyHeader,

    #[error("CSV header has no `{0}` column")]
    MissingColumn(&'static str),

    #[error("CSV parsing error")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Error)]
enum RowError {
    #[error("invalid date `{0}`")]
    Date(String),

    #[error("invalid amount `{0}`")]
    Amount(String),
}

/// How amounts are denominated in a file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Unit {
    /// Integer satoshis. Decimal values are read as BTC.
    Sats,

    /// Decimal BTC.
    Btc,
}

/// Column positions resolved from the header row.
#[derive(Debug)]
struct Columns {
    date: usize,
    txid: usize,
    value: (usize, Unit),
    label: Option<usize>,
    balance: Option<usize>,
    fee: Option<usize>,
    confirmed: Option<usize>,
    kind: Option<usize>,
    address: Option<usize>,
}

impl Columns {
    fn from_header(header: &StringRecord) -> Result<Self, ParseError> {
        let names: Vec<_> = header.iter().map(unquote).collect();
        if names.iter().all(|name| name.is_empty()) {
            return Err(ParseError::EmptyHeader);
        }

        // Header names are matched case-sensitively.
        let find = |candidates: &[&str]| {
            candidates
                .iter()
                .find_map(|candidate| names.iter().position(|name| name == candidate))
        };

        let value = match (find(&["Value"]), find(&["Amount (BTC)", "Amount"])) {
            (Some(index), _) => (index, Unit::Sats),
            (None, Some(index)) => (index, Unit::Btc),
            (None, None) => return Err(ParseError::MissingColumn("Value")),
        };

        Ok(Self {
            date: find(&["Date (UTC)", "Date"]).ok_or(ParseError::MissingColumn("Date"))?,
            txid: find(&["Txid", "ID"]).ok_or(ParseError::MissingColumn("Txid"))?,
            value,
            label: find(&["Label"]),
            balance: find(&["Balance"]),
            fee: find(&["Fee"]),
            confirmed: find(&["Confirmed"]),
            kind: find(&["Type"]),
            address: find(&["Address"]),
        })
    }

    /// Parse one data row. `Ok(None)` means the row has no txid and is dropped.
    fn parse_row(
        &self,
        row: &StringRecord,
        wallet: Option<&str>,
    ) -> Result<Option<NormalizedTransaction>, RowError> {
        let get = |index: usize| row.get(index).map(unquote).unwrap_or_default();
        let get_opt = |index: Option<usize>| index.map(get).filter(|field| !field.is_empty());

        let txid = get(self.txid);
        if txid.is_empty() {
            return Ok(None);
        }

        let date = get(self.date);
        let date = parse_date(date).ok_or_else(|| RowError::Date(date.to_string()))?;

        let (value_index, unit) = self.value;
        let value = get(value_index);
        let value = parse_amount(value, unit).ok_or_else(|| RowError::Amount(value.to_string()))?;

        let fee = get_opt(self.fee)
            .map(|fee| parse_amount(fee, Unit::Sats).ok_or_else(|| RowError::Amount(fee.into())))
            .transpose()?
            .map(i64::unsigned_abs);
        let balance = get_opt(self.balance)
            .map(|balance| {
                parse_amount(balance, Unit::Sats).ok_or_else(|| RowError::Amount(balance.into()))
            })
            .transpose()?;

        let direction = match get_opt(self.kind) {
            Some(kind) if kind.starts_with("Received") => Direction::Input,
            Some(kind) if kind.starts_with("Sent") => Direction::Output,
            _ => Direction::from_value(value),
        };

        let confirmed = get_opt(self.confirmed)
            .map(|flag| !matches!(flag.to_ascii_lowercase().as_str(), "false" | "no" | "0"))
            .unwrap_or(true);

        Ok(Some(NormalizedTransaction {
            txid: txid.to_string(),
            date,
            direction,
            value,
            label: get_opt(self.label).unwrap_or_default().to_string(),
            fee,
            confirmed,
            balance,
            address: get_opt(self.address).map(str::to_string),
            wallet: wallet.map(str::to_string),
        }))
    }
}

/// Normalize CSV text that is not associated with any wallet.
pub fn normalize_csv(text: &str) -> Result<Vec<NormalizedTransaction>, ParseError> {
    normalize_reader(text.as_bytes(), None)
}

/// Read a wallet export. Records are stamped with the wallet name derived from the file name.
pub fn read_wallet(path: impl AsRef<Path>) -> Result<Vec<NormalizedTransaction>, ParseError> {
    let path = path.as_ref();
    let wallet = wallet_name(path);
    debug!("Reading wallet {wallet:?} from {path:?}");

    let file = std::fs::File::open(path).map_err(csv::Error::from)?;
    normalize_reader(file, wallet.as_deref())
}

/// Read a network transaction export. Records are not associated with a wallet.
pub fn read_network(path: impl AsRef<Path>) -> Result<Vec<NormalizedTransaction>, ParseError> {
    let path = path.as_ref();
    debug!("Reading network transactions from {path:?}");

    let file = std::fs::File::open(path).map_err(csv::Error::from)?;
    normalize_reader(file, None)
}

/// Wallet name for an export file: the file stem up to its last `-`.
///
/// `cold-storage-2023.csv` is the `cold-storage` wallet.
pub fn wallet_name(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let name = stem.rsplit_once('-').map_or(stem, |(name, _)| name);

    (!name.is_empty()).then(|| name.to_string())
}

/// Read a `wallet,address` CSV into an address book.
pub fn read_addresses(path: impl AsRef<Path>) -> Result<AddressBook, csv::Error> {
    #[derive(Debug, Deserialize)]
    struct AddressesCsvRow {
        wallet: String,
        address: String,
    }

    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut book = AddressBook::default();
    for row in reader.deserialize::<AddressesCsvRow>() {
        let row = row?;

        book.insert(row.address, row.wallet);
    }

    Ok(book)
}

fn normalize_reader<R: Read>(
    reader: R,
    wallet: Option<&str>,
) -> Result<Vec<NormalizedTransaction>, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut rows = reader.records();

    let header = rows.next().ok_or(ParseError::MissingHeader)??;
    let columns = Columns::from_header(&header)?;
    trace!("Resolved CSV columns: {columns:?}");

    let mut records = Vec::new();
    for row in rows {
        let row = match row {
            Ok(row) => row,
            Err(err) => {
                warn!("Skipping unreadable CSV row: {err}");
                continue;
            }
        };
        let line = row.position().map(|pos| pos.line()).unwrap_or_default();

        match columns.parse_row(&row, wallet) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => trace!("Dropping CSV row {line} without a txid"),
            Err(err) => warn!("Skipping malformed CSV row {line}: {err}"),
        }
    }

    Ok(records)
}

/// Strip whitespace and one pair of surrounding quotes.
fn unquote(field: &str) -> &str {
    let field = field.trim();
    let field = field.strip_prefix('"').unwrap_or(field);
    let field = field.strip_suffix('"').unwrap_or(field);

    field.trim()
}

/// Parse a timestamp as UTC. Accepts RFC 3339, ISO 8601 without zone, and plain dates.
pub(crate) fn parse_date(date: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc3339(date) {
        return Some(date.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(date, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .ok()
                .map(|date| date.and_time(NaiveTime::MIN))
        })
        .map(|date| date.and_utc())
}

/// Parse a signed amount into satoshis.
fn parse_amount(amount: &str, unit: Unit) -> Option<i64> {
    if unit == Unit::Sats {
        if let Ok(sats) = amount.parse::<i64>() {
            return Some(sats);
        }
        if !amount.contains('.') {
            return None;
        }
    }

    let btc = Decimal::from_str(amount).ok()?;
    let sats = btc.checked_mul(Decimal::from(SATS_PER_BTC))?;
    if !sats.fract().is_zero() {
        return None;
    }

    sats.to_i64()
}
