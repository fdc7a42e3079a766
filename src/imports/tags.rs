//! Per-transaction annotations for the cost-basis calculator.
//!
//! A tags CSV has the columns `txid,tx_type,price`. `tx_type` is one of `purchase`, `sell` or
//! `move`, and `price` optionally overrides the looked-up USD price for that transaction.

use crate::basis::TransactionType;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::{collections::HashMap, path::Path, str::FromStr as _};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TagsError {
    #[error("CSV parsing error")]
    Csv(#[from] csv::Error),

    #[error("Unknown tx_type: `{0}`")]
    TxType(String),

    #[error("Invalid price `{0}`")]
    Price(String, #[source] rust_decimal::Error),
}

#[derive(Debug, Default)]
pub struct TxTags {
    tags: HashMap<String, TxTag>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxTag {
    pub kind: TransactionType,
    pub price: Option<Decimal>,
}

impl TxTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, txid: &str) -> Option<&TxTag> {
        self.tags.get(txid)
    }

    pub fn insert(&mut self, txid: String, tag: TxTag) {
        self.tags.insert(txid, tag);
    }

    pub fn extend(&mut self, other: TxTags) {
        self.tags.extend(other.tags);
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

pub fn read_tx_tags(path: impl AsRef<Path>) -> Result<TxTags, TagsError> {
    let reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_path(path)?;

    parse_tx_tags(reader)
}

fn parse_tx_tags<R: std::io::Read>(mut reader: csv::Reader<R>) -> Result<TxTags, TagsError> {
    #[derive(Debug, Deserialize)]
    struct TxTagsCsvRow {
        txid: String,
        tx_type: String,
        #[serde(default)]
        price: String,
    }

    let mut tags = TxTags::new();
    for row in reader.deserialize::<TxTagsCsvRow>() {
        let row = row?;
        let kind = match row.tx_type.as_str() {
            "purchase" => TransactionType::Purchase,
            "sell" => TransactionType::Sell,
            "move" => TransactionType::Move,
            _ => return Err(TagsError::TxType(row.tx_type)),
        };
        let price = if row.price.is_empty() {
            None
        } else {
            let price = Decimal::from_str(&row.price);

            Some(price.map_err(|err| TagsError::Price(row.price, err))?)
        };

        tags.insert(row.txid, TxTag { kind, price });
    }

    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn reader(data: &str) -> csv::Reader<&[u8]> {
        csv::ReaderBuilder::new()
            .comment(Some(b'#'))
            .trim(csv::Trim::All)
            .from_reader(data.as_bytes())
    }

    #[test]
    #[traced_test]
    fn test_parse_tx_tags() {
        let _ = tracing_log::LogTracer::init();

        let tags = parse_tx_tags(reader(
            "txid,tx_type,price\n# between my own wallets\na1,move,\nb2,sell,41000.50\n",
        ))
        .unwrap();

        assert_eq!(tags.len(), 2);
        assert_eq!(
            tags.get("a1"),
            Some(&TxTag {
                kind: TransactionType::Move,
                price: None
            })
        );
        assert_eq!(tags.get("b2").unwrap().price, Some(Decimal::new(4_100_050, 2)));
        assert!(tags.get("c3").is_none());
    }

    #[test]
    #[traced_test]
    fn test_parse_tx_tags_errors() {
        let _ = tracing_log::LogTracer::init();

        assert!(matches!(
            parse_tx_tags(reader("txid,tx_type,price\na1,gift,\n")),
            Err(TagsError::TxType(kind)) if kind == "gift"
        ));
        assert!(matches!(
            parse_tx_tags(reader("txid,tx_type,price\na1,sell,cheap\n")),
            Err(TagsError::Price(..))
        ));
    }
}
