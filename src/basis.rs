//! Average-cost basis over BTC purchases and sales.
//!
//! Purchases add to the running balance and to the total cost. A sale is valued at the average
//! cost of the balance it draws from, and removes its share of both. Moves between own wallets
//! are not disposals and leave the state alone.

use crate::imports::tags::TxTags;
use crate::model::{sats_to_btc, Direction, NormalizedTransaction, PriceLookup};
use crate::trace::{group_transactions, TransactionGroup};
use chrono::{DateTime, Utc};
use esploda::esplora::Transaction as RawTransaction;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display};
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, Hash, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Purchase,
    Sell,
    Move,
}

impl Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Purchase => "purchase",
            Self::Sell => "sell",
            Self::Move => "move",
        })
    }
}

/// A taxable view of one transaction. Amounts are in BTC, prices in USD per BTC.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct Transaction {
    pub txid: String,
    pub kind: TransactionType,
    pub amount: Decimal,
    pub fee: Decimal,
    pub date: DateTime<Utc>,
    pub block_height: Option<u32>,
    pub confirmations: Option<u32>,

    /// `None` when no price could be resolved for the date.
    pub price: Option<Decimal>,

    /// Set on sales only, and only when it can be computed.
    pub cost_basis: Option<Decimal>,
    pub profit_loss: Option<Decimal>,

    pub addresses: Vec<String>,
    pub description: String,
}

impl Transaction {
    /// Derive a transaction from all records sharing one txid.
    ///
    /// A tag decides the kind when there is one. Otherwise records in both directions are a move,
    /// received records a purchase, and sent records a sale. The tag's price overrides `prices`.
    pub fn from_group(group: &TransactionGroup, tags: &TxTags, prices: &dyn PriceLookup) -> Self {
        let sum = |direction: Direction| -> u64 {
            group
                .records
                .iter()
                .filter(|record| record.direction == direction)
                .map(NormalizedTransaction::amount)
                .sum()
        };
        let received = sum(Direction::Input);
        let sent = sum(Direction::Output);

        let tag = tags.get(&group.txid);
        let kind = match tag {
            Some(tag) => tag.kind,
            None if received > 0 && sent > 0 => TransactionType::Move,
            None if sent > 0 => TransactionType::Sell,
            None => TransactionType::Purchase,
        };

        let amount = match kind {
            TransactionType::Purchase if received > 0 => received,
            TransactionType::Sell if sent > 0 => sent,
            _ => received.max(sent),
        };

        let price = tag
            .and_then(|tag| tag.price)
            .or_else(|| prices.get_price(group.date.date_naive()));

        let mut addresses: Vec<String> = group
            .records
            .iter()
            .filter_map(|record| record.address.clone())
            .collect();
        addresses.sort_unstable();
        addresses.dedup();

        let description = group
            .records
            .iter()
            .map(|record| record.label.as_str())
            .find(|label| !label.is_empty())
            .unwrap_or_default()
            .to_string();

        Self {
            txid: group.txid.clone(),
            kind,
            amount: sats_to_btc(amount),
            fee: sats_to_btc(group.fee()),
            date: group.date,
            block_height: None,
            confirmations: None,
            price,
            cost_basis: None,
            profit_loss: None,
            addresses,
            description,
        }
    }
}

/// Group records by txid into transactions, ordered by date.
pub fn records_to_transactions(
    records: &[NormalizedTransaction],
    tags: &TxTags,
    prices: &dyn PriceLookup,
) -> Vec<Transaction> {
    let mut txs: Vec<_> = group_transactions(records)
        .iter()
        .map(|group| Transaction::from_group(group, tags, prices))
        .collect();
    txs.sort_by(|a, b| a.date.cmp(&b.date));

    txs
}

/// Fill `block_height` and `confirmations` from fetched blockchain data.
///
/// Confirmations count the confirming block itself, so a transaction in the tip block has one.
/// They need `tip_height`; an unconfirmed transaction has zero either way. Transactions without
/// fetched data are left alone.
pub fn apply_block_status(
    txs: &mut [Transaction],
    raw: &HashMap<String, RawTransaction>,
    tip_height: Option<u32>,
) {
    for tx in txs {
        let Some(raw_tx) = raw.get(&tx.txid) else {
            continue;
        };

        tx.block_height = raw_tx.block_height();
        tx.confirmations = match tx.block_height {
            Some(height) => tip_height.and_then(|tip| tip.checked_sub(height)).map(|depth| depth + 1),
            None => Some(0),
        };
    }
}

/// Valuation of one sale.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Disposal {
    pub average_cost: Decimal,
    pub cost_basis: Decimal,
    pub profit_loss: Decimal,
}

/// Running state of the average-cost fold.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CostBasis {
    running_balance: Decimal,
    total_cost: Decimal,
}

impl CostBasis {
    pub fn new() -> Self {
        Self::default()
    }

    /// BTC currently held.
    pub fn running_balance(&self) -> Decimal {
        self.running_balance
    }

    /// USD cost of the BTC currently held.
    pub fn total_cost(&self) -> Decimal {
        self.total_cost
    }

    /// Advance the state over one transaction. Returns the valuation if it is a sale that can be
    /// valued: there must be a balance to sell from and a price.
    pub fn apply(&mut self, tx: &Transaction) -> Option<Disposal> {
        match tx.kind {
            TransactionType::Purchase => {
                self.running_balance += tx.amount;
                match tx.price {
                    Some(price) => self.total_cost += tx.amount * price,
                    None => debug!("Purchase `{}` has no price, adding no cost", tx.txid),
                }

                None
            }

            TransactionType::Sell => {
                let price = tx.price?;
                if self.running_balance <= Decimal::ZERO {
                    debug!("Sale `{}` with nothing held", tx.txid);
                    return None;
                }

                let average_cost = self.total_cost / self.running_balance;
                let cost_basis = average_cost * tx.amount;
                let profit_loss = price * tx.amount - cost_basis;

                if tx.amount > self.running_balance {
                    warn!(
                        "Sale `{}` of {} BTC exceeds the balance of {} BTC",
                        tx.txid, tx.amount, self.running_balance
                    );
                    self.total_cost = Decimal::ZERO;
                    self.running_balance = Decimal::ZERO;
                } else {
                    let sold = tx.amount / self.running_balance;
                    self.total_cost -= self.total_cost * sold;
                    self.running_balance -= tx.amount;
                }

                Some(Disposal {
                    average_cost,
                    cost_basis,
                    profit_loss,
                })
            }

            TransactionType::Move => None,
        }
    }
}

/// Fill in `cost_basis` and `profit_loss` for every sale that can be valued.
///
/// Transactions are folded in the order given, which is expected to be chronological. The output
/// has the same length and order as the input.
pub fn compute_cost_basis(txs: Vec<Transaction>) -> Vec<Transaction> {
    let mut state = CostBasis::new();

    txs.into_iter()
        .map(|mut tx| {
            let disposal = state.apply(&tx);
            tx.cost_basis = disposal.map(|disposal| disposal.cost_basis);
            tx.profit_loss = disposal.map(|disposal| disposal.profit_loss);

            tx
        })
        .collect()
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct TransactionSummary {
    pub total_purchased: Decimal,
    pub total_sold: Decimal,
    pub total_moved: Decimal,
    pub total_fees: Decimal,

    /// Amount-weighted over purchases with a price.
    pub average_purchase_price: Option<Decimal>,

    /// Amount-weighted over sales with a price.
    pub average_sell_price: Option<Decimal>,

    /// Over sales that could be valued.
    pub total_profit_loss: Decimal,

    /// `total_purchased - total_sold`
    pub remaining_balance: Decimal,

    /// Purchases and sales without a price.
    pub unpriced: Vec<String>,
}

impl Display for TransactionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let average = |price: Option<Decimal>| {
            price.map_or_else(|| "n/a".to_string(), |price| format!("${:.2}", price))
        };

        writeln!(f, "Cost Basis Summary")?;
        writeln!(f, "==== ===== =======")?;
        writeln!(f)?;
        writeln!(f, "Purchased:         {} BTC", self.total_purchased)?;
        writeln!(f, "Sold:              {} BTC", self.total_sold)?;
        writeln!(f, "Moved:             {} BTC", self.total_moved)?;
        writeln!(f, "Fees:              {} BTC", self.total_fees)?;
        writeln!(f, "Remaining:         {} BTC", self.remaining_balance)?;
        writeln!(f, "Avg purchase:      {}", average(self.average_purchase_price))?;
        writeln!(f, "Avg sell:          {}", average(self.average_sell_price))?;
        writeln!(f, "Profit/loss:       ${:.2}", self.total_profit_loss)?;

        for txid in &self.unpriced {
            writeln!(f, "❌ No price for {txid}")?;
        }

        Ok(())
    }
}

pub fn summarize_transactions(txs: &[Transaction]) -> TransactionSummary {
    let mut summary = TransactionSummary::default();

    let weighted = |kind: TransactionType| -> Option<Decimal> {
        let (amount, value) = txs
            .iter()
            .filter(|tx| tx.kind == kind)
            .filter_map(|tx| Some((tx.amount, tx.amount * tx.price?)))
            .fold((Decimal::ZERO, Decimal::ZERO), |(amount, value), tx| {
                (amount + tx.0, value + tx.1)
            });

        (!amount.is_zero()).then(|| value / amount)
    };
    summary.average_purchase_price = weighted(TransactionType::Purchase);
    summary.average_sell_price = weighted(TransactionType::Sell);

    for tx in txs {
        match tx.kind {
            TransactionType::Purchase => summary.total_purchased += tx.amount,
            TransactionType::Sell => summary.total_sold += tx.amount,
            TransactionType::Move => summary.total_moved += tx.amount,
        }
        summary.total_fees += tx.fee;
        summary.total_profit_loss += tx.profit_loss.unwrap_or_default();

        if tx.kind != TransactionType::Move && tx.price.is_none() {
            summary.unpriced.push(tx.txid.clone());
        }
    }
    summary.remaining_balance = summary.total_purchased - summary.total_sold;

    summary
}
