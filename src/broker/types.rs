//! Broker-side records and requests.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::OrderType;

/// Volume and price granularity of a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub symbol: String,
    pub digits: u32,
    pub point: Decimal,
    pub volume_min: Decimal,
    pub volume_step: Decimal,
    pub volume_max: Decimal,
}

impl SymbolSpec {
    pub fn new(
        symbol: impl Into<String>,
        digits: u32,
        volume_min: Decimal,
        volume_step: Decimal,
        volume_max: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            digits,
            point: Decimal::new(1, digits),
            volume_min,
            volume_step,
            volume_max,
        }
    }

    /// Typical retail FX contract: 5 digits (3 for JPY crosses), 0.01 lot steps.
    pub fn forex(symbol: &str) -> Self {
        let digits = if symbol.to_uppercase().contains("JPY") { 3 } else { 5 };
        Self::new(
            symbol,
            digits,
            Decimal::new(1, 2),
            Decimal::new(1, 2),
            Decimal::from(100),
        )
    }
}

/// Top of book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
    pub time: DateTime<Utc>,
}

impl Quote {
    /// Price a market order of this direction executes at.
    pub fn price_for(&self, order_type: OrderType) -> Decimal {
        if order_type.is_buy() {
            self.ask
        } else {
            self.bid
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub balance: Decimal,
    pub equity: Decimal,
    pub trade_allowed: bool,
}

/// Open position on the terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub ticket: u64,
    pub symbol: String,
    /// Buy or Sell
    pub order_type: OrderType,
    pub volume: Decimal,
    pub open_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub magic: i64,
    pub comment: String,
    pub open_time: DateTime<Utc>,
}

/// Working pending order on the terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub ticket: u64,
    pub symbol: String,
    pub order_type: OrderType,
    pub volume: Decimal,
    pub price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub magic: i64,
    pub comment: String,
    pub expiry: Option<DateTime<Utc>>,
    pub placed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketOrderRequest {
    pub symbol: String,
    /// Buy or Sell
    pub side: OrderType,
    pub volume: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub magic: i64,
    pub comment: String,
    /// Max slippage in points
    pub deviation: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingOrderRequest {
    pub symbol: String,
    pub order_type: OrderType,
    pub volume: Decimal,
    pub price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub magic: i64,
    pub comment: String,
    /// `None` is good-till-cancelled
    pub expiry: Option<DateTime<Utc>>,
}

/// Broker view of an order placed earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    /// Still working
    Pending,
    /// Filled into the given position
    Filled { position_ticket: u64 },
    /// Deleted or expired
    Cancelled,
    /// Neither working nor in history
    Missing,
}

/// How pending-order fills become visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillReporting {
    /// Broker pushes a notification per fill
    Events,
    /// Engine must poll order state every tick
    Polling,
}

/// A pending order turned into a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillEvent {
    pub order_ticket: u64,
    pub position_ticket: u64,
}
