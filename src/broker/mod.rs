//! Broker capability: the terminal the slave trades on.
//!
//! One trait, one implementation per platform. The engine never branches on
//! the platform; fill reporting style is declared by the broker itself.

mod paper;
mod types;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

pub use paper::{PaperBook, PaperBroker};
pub use types::{
    AccountInfo, BrokerOrder, BrokerPosition, FillEvent, FillReporting, MarketOrderRequest,
    OrderState, PendingOrderRequest, Quote, SymbolSpec,
};

/// Convenience alias for broker results.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors returned by broker implementations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Network or terminal connectivity failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// Price moved while the request was in flight.
    #[error("requote: {0}")]
    Requote(String),
    /// Trade context busy with another request.
    #[error("trade context busy")]
    Busy,
    /// Request parameters are invalid for the symbol.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Broker refused the request (margin, market closed, trading disabled).
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("ticket {0} not found")]
    NotFound(u64),
    #[error("no quote for {0}")]
    NoQuote(String),
}

impl BrokerError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Requote(_) | Self::Busy)
    }
}

/// Order placement and account access on the local terminal.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Human-friendly name for logs.
    fn name(&self) -> &str;

    /// How this broker reports pending-order fills.
    fn fill_reporting(&self) -> FillReporting;

    /// Open a market position, returning its ticket.
    async fn open_market(&mut self, request: &MarketOrderRequest) -> BrokerResult<u64>;

    /// Place a limit or stop order, returning its ticket.
    async fn place_pending(&mut self, request: &PendingOrderRequest) -> BrokerResult<u64>;

    /// Close `volume` lots of a position.
    async fn close(&mut self, ticket: u64, volume: Decimal) -> BrokerResult<()>;

    /// Set protective levels of a position or pending order. `None` clears the level.
    async fn modify(
        &mut self,
        ticket: u64,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> BrokerResult<()>;

    async fn cancel_pending(&mut self, ticket: u64) -> BrokerResult<()>;

    async fn positions(&self) -> BrokerResult<Vec<BrokerPosition>>;

    async fn pending_orders(&self) -> BrokerResult<Vec<BrokerOrder>>;

    /// Select a single open position.
    async fn position(&self, ticket: u64) -> BrokerResult<Option<BrokerPosition>>;

    /// Current state of an order placed earlier.
    async fn order_state(&self, ticket: u64) -> BrokerResult<OrderState>;

    async fn symbol_spec(&self, symbol: &str) -> BrokerResult<SymbolSpec>;

    async fn quote(&self, symbol: &str) -> BrokerResult<Option<Quote>>;

    async fn account(&self) -> BrokerResult<AccountInfo>;

    /// Fill notifications since the last call. Event-reporting brokers only.
    fn take_fill_events(&mut self) -> Vec<FillEvent> {
        Vec::new()
    }
}
