//! Trade signals and position snapshots received from a master account.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::OrderType;

/// A master opened a position or placed a pending order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenSignal {
    /// Master-side ticket
    pub ticket: u64,

    /// Symbol as published by the master (already stripped of master affixes)
    pub symbol: String,

    pub order_type: OrderType,

    /// Master volume in lots
    pub lots: Decimal,

    /// Master fill price (or pending price)
    pub price: Decimal,

    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub magic_number: Option<i64>,
    pub comment: Option<String>,

    /// When the master executed the trade
    pub timestamp: DateTime<Utc>,

    pub source_account: String,
}

/// A master closed all or part of a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseSignal {
    pub ticket: u64,

    /// Fraction of the current volume to close. `None`, 0 or >= 1 mean full close.
    pub close_ratio: Option<Decimal>,

    pub timestamp: DateTime<Utc>,
    pub source_account: String,
}

impl CloseSignal {
    pub fn is_full_close(&self) -> bool {
        match self.close_ratio {
            Some(ratio) => ratio <= Decimal::ZERO || ratio >= Decimal::ONE,
            None => true,
        }
    }
}

/// A master changed the protective levels of a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifySignal {
    pub ticket: u64,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
    pub source_account: String,
}

/// Incremental trade event keyed by master ticket.
#[derive(Debug, Clone, PartialEq)]
pub enum TradeSignal {
    Open(OpenSignal),
    Close(CloseSignal),
    Modify(ModifySignal),
}

impl TradeSignal {
    pub fn ticket(&self) -> u64 {
        match self {
            Self::Open(s) => s.ticket,
            Self::Close(s) => s.ticket,
            Self::Modify(s) => s.ticket,
        }
    }

    pub fn source_account(&self) -> &str {
        match self {
            Self::Open(s) => &s.source_account,
            Self::Close(s) => &s.source_account,
            Self::Modify(s) => &s.source_account,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Open(s) => s.timestamp,
            Self::Close(s) => s.timestamp,
            Self::Modify(s) => s.timestamp,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::Open(_) => "Open",
            Self::Close(_) => "Close",
            Self::Modify(_) => "Modify",
        }
    }
}

/// One position in a master snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionInfo {
    pub ticket: u64,
    pub symbol: String,
    pub order_type: OrderType,
    pub lots: Decimal,
    pub open_price: Decimal,
    pub open_time: DateTime<Utc>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub magic_number: Option<i64>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl PositionInfo {
    /// View this snapshot entry as the Open signal that would have created it.
    pub fn as_open_signal(&self, source_account: &str) -> OpenSignal {
        OpenSignal {
            ticket: self.ticket,
            symbol: self.symbol.clone(),
            order_type: self.order_type,
            lots: self.lots,
            price: self.open_price,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            magic_number: self.magic_number,
            comment: self.comment.clone(),
            timestamp: self.open_time,
            source_account: source_account.to_string(),
        }
    }
}

/// Complete position set of a master at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub source_account: String,
    #[serde(default)]
    pub positions: Vec<PositionInfo>,
    pub timestamp: DateTime<Utc>,
}
