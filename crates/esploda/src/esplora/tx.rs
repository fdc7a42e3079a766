//! Bitcoin transactions as reported by Esplora.

use bitcoin::{BlockHash, ScriptBuf, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// JSON Parsing errors for [`Transaction`].
#[derive(Debug, Error)]
pub enum Error {
    /// Missing `status.block_height` field.
    #[error("Missing `status.block_height` field")]
    Height,

    /// Missing `status.block_hash` field.
    #[error("Missing `status.block_hash` field")]
    Hash,

    /// Missing or invalid `status.block_time` field.
    #[error("Missing or invalid `status.block_time` field")]
    Time,
}

/// A transaction is a transfer of Bitcoin value.
///
/// All amounts are denominated in satoshis.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct Transaction {
    /// Transaction ID.
    pub txid: Txid,

    pub version: u32,

    /// Transaction inputs.
    #[serde(rename = "vin")]
    pub inputs: Vec<TxIn>,

    /// Transaction outputs.
    #[serde(rename = "vout")]
    pub outputs: Vec<TxOut>,

    #[serde(default)]
    pub size: u32,
    #[serde(default)]
    pub weight: u32,

    /// Fee paid for the transaction.
    #[serde(default)]
    pub fee: u64,

    /// Indicates whether the transaction has been confirmed by the network, and information about
    /// which block it exists in (if confirmed).
    pub status: Status,
}

/// [`Transaction`] input.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct TxIn {
    /// Previous transaction output ID.
    ///
    /// When all zeros, this input is declared as coinbase (newly generated coins).
    pub txid: Txid,

    /// Previous transaction output index.
    ///
    /// When `0xffff_ffff`, this input is declared as coinbase (newly generated coins).
    #[serde(rename = "vout")]
    pub index: u32,

    /// Previous transaction output, including its address when the script has one.
    ///
    /// When `None`, this input is declared as coinbase (newly generated coins).
    #[serde(rename = "prevout")]
    pub previous_output: Option<TxOut>,

    #[serde(default)]
    pub sequence: u32,
}

/// [`Transaction`] output.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct TxOut {
    /// Script public key.
    #[serde(rename = "scriptpubkey")]
    pub script_pubkey: ScriptBuf,

    /// Esplora's script classification, e.g. `v0_p2wpkh` or `p2sh`.
    #[serde(rename = "scriptpubkey_type", default)]
    pub script_type: Option<String>,

    /// Encoded address. Absent for `OP_RETURN` and bare scripts.
    #[serde(rename = "scriptpubkey_address", default)]
    pub address: Option<String>,

    pub value: u64,
}

/// Network consensus status for [`Transaction`].
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, Ord, PartialEq, PartialOrd)]
#[serde(try_from = "JsonStatus")]
#[serde(into = "JsonStatus")]
pub enum Status {
    /// Transaction has not yet been confirmed by the network.
    Unconfirmed,

    /// Transaction has been confirmed by consensus.
    Confirmed {
        /// The block height containing the transaction.
        block_height: u32,

        /// The block hash that uniquely identifies the block.
        block_hash: BlockHash,

        /// Absolute timestamp for the block, as agreed upon by the network.
        block_time: DateTime<Utc>,
    },
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
struct JsonStatus {
    confirmed: bool,
    block_height: Option<u32>,
    block_hash: Option<BlockHash>,
    block_time: Option<i64>,
}

impl TryFrom<JsonStatus> for Status {
    type Error = Error;

    fn try_from(value: JsonStatus) -> Result<Self, Self::Error> {
        if !value.confirmed {
            return Ok(Status::Unconfirmed);
        }

        Ok(Status::Confirmed {
            block_height: value.block_height.ok_or(Error::Height)?,
            block_hash: value.block_hash.ok_or(Error::Hash)?,
            block_time: value
                .block_time
                .and_then(|timestamp| DateTime::from_timestamp(timestamp, 0))
                .ok_or(Error::Time)?,
        })
    }
}

impl From<Status> for JsonStatus {
    fn from(value: Status) -> Self {
        match value {
            Status::Unconfirmed => JsonStatus {
                confirmed: false,
                block_height: None,
                block_hash: None,
                block_time: None,
            },
            Status::Confirmed {
                block_height,
                block_hash,
                block_time,
            } => JsonStatus {
                confirmed: true,
                block_height: Some(block_height),
                block_hash: Some(block_hash),
                block_time: Some(block_time.timestamp()),
            },
        }
    }
}

impl Transaction {
    /// Block timestamp, or `None` while unconfirmed.
    pub fn block_time(&self) -> Option<DateTime<Utc>> {
        match self.status {
            Status::Unconfirmed => None,
            Status::Confirmed { block_time, .. } => Some(block_time),
        }
    }

    /// Height of the confirming block, or `None` while unconfirmed.
    pub fn block_height(&self) -> Option<u32> {
        match self.status {
            Status::Unconfirmed => None,
            Status::Confirmed { block_height, .. } => Some(block_height),
        }
    }

    /// Addresses of the outputs being spent, in input order. Coinbase and script-only inputs
    /// are skipped.
    pub fn input_addresses(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .filter_map(|input| input.previous_output.as_ref())
            .filter_map(|prevout| prevout.address.as_deref())
    }

    /// Addresses of this transaction's outputs, in output order.
    pub fn output_addresses(&self) -> impl Iterator<Item = &str> {
        self.outputs
            .iter()
            .filter_map(|output| output.address.as_deref())
    }
}

impl TxIn {
    /// Returns `true` if this transaction input is coinbase (newly generated coins).
    pub fn is_coinbase(&self) -> bool {
        let txid_bytes = AsRef::<[u8; 32]>::as_ref(&self.txid);

        txid_bytes.iter().all(|byte| *byte == 0) && self.index == 0xffff_ffff
    }
}
