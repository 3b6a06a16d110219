//! Simulated terminal.
//!
//! Keeps positions, pending orders and order history in memory, fills
//! pending orders as quotes cross them and expires them by time. The book
//! can be exported and restored so a restart sees the same terminal state.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::OrderType;

use super::{
    AccountInfo, Broker, BrokerError, BrokerOrder, BrokerPosition, BrokerResult, FillEvent,
    FillReporting, MarketOrderRequest, OrderState, PendingOrderRequest, Quote, SymbolSpec,
};

/// Number of mutating calls received, failed ones included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaperCalls {
    pub open_market: usize,
    pub place_pending: usize,
    pub close: usize,
    pub modify: usize,
    pub cancel_pending: usize,
}

impl PaperCalls {
    pub fn total(&self) -> usize {
        self.open_market + self.place_pending + self.close + self.modify + self.cancel_pending
    }
}

/// Persistable terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperBook {
    pub next_ticket: u64,
    pub account: AccountInfo,
    pub positions: Vec<BrokerPosition>,
    pub orders: Vec<BrokerOrder>,
}

impl Default for PaperBook {
    fn default() -> Self {
        Self {
            next_ticket: 1000,
            account: AccountInfo {
                balance: Decimal::from(10_000),
                equity: Decimal::from(10_000),
                trade_allowed: true,
            },
            positions: Vec::new(),
            orders: Vec::new(),
        }
    }
}

pub struct PaperBroker {
    name: String,
    fill_reporting: FillReporting,
    next_ticket: u64,
    account: AccountInfo,
    specs: HashMap<String, SymbolSpec>,
    quotes: HashMap<String, Quote>,
    positions: BTreeMap<u64, BrokerPosition>,
    orders: BTreeMap<u64, BrokerOrder>,
    history: HashMap<u64, OrderState>,
    fill_events: Vec<FillEvent>,
    failures: VecDeque<BrokerError>,
    calls: PaperCalls,
}

impl PaperBroker {
    pub fn new(fill_reporting: FillReporting) -> Self {
        Self::from_book(PaperBook::default(), fill_reporting)
    }

    /// Restore a terminal from a saved book.
    pub fn from_book(book: PaperBook, fill_reporting: FillReporting) -> Self {
        Self {
            name: "paper".to_string(),
            fill_reporting,
            next_ticket: book.next_ticket,
            account: book.account,
            specs: HashMap::new(),
            quotes: HashMap::new(),
            positions: book.positions.into_iter().map(|p| (p.ticket, p)).collect(),
            orders: book.orders.into_iter().map(|o| (o.ticket, o)).collect(),
            history: HashMap::new(),
            fill_events: Vec::new(),
            failures: VecDeque::new(),
            calls: PaperCalls::default(),
        }
    }

    /// Export the current terminal state.
    pub fn book(&self) -> PaperBook {
        PaperBook {
            next_ticket: self.next_ticket,
            account: self.account.clone(),
            positions: self.positions.values().cloned().collect(),
            orders: self.orders.values().cloned().collect(),
        }
    }

    pub fn with_spec(mut self, spec: SymbolSpec) -> Self {
        self.specs.insert(spec.symbol.clone(), spec);
        self
    }

    pub fn set_account(&mut self, balance: Decimal, equity: Decimal) {
        self.account.balance = balance;
        self.account.equity = equity;
    }

    pub fn set_trade_allowed(&mut self, allowed: bool) {
        self.account.trade_allowed = allowed;
    }

    /// The next mutating call fails with `error`.
    pub fn fail_next(&mut self, error: BrokerError) {
        self.failures.push_back(error);
    }

    pub fn calls(&self) -> PaperCalls {
        self.calls
    }

    /// Insert a position directly, as if opened by hand on the terminal.
    pub fn insert_position(&mut self, position: BrokerPosition) {
        self.next_ticket = self.next_ticket.max(position.ticket + 1);
        self.positions.insert(position.ticket, position);
    }

    /// Insert a pending order directly, as if placed by hand on the terminal.
    pub fn insert_order(&mut self, order: BrokerOrder) {
        self.next_ticket = self.next_ticket.max(order.ticket + 1);
        self.orders.insert(order.ticket, order);
    }

    pub fn set_quote(&mut self, symbol: &str, bid: Decimal, ask: Decimal) {
        self.set_quote_at(symbol, bid, ask, Utc::now());
    }

    /// Update a quote, then fill crossed orders and expire stale ones.
    pub fn set_quote_at(&mut self, symbol: &str, bid: Decimal, ask: Decimal, time: DateTime<Utc>) {
        self.quotes
            .insert(symbol.to_string(), Quote { bid, ask, time });
        self.expire_orders(time);

        let crossed: Vec<u64> = self
            .orders
            .values()
            .filter(|o| o.symbol == symbol && Self::is_crossed(o, bid, ask))
            .map(|o| o.ticket)
            .collect();

        for ticket in crossed {
            self.fill_order(ticket, time);
        }
    }

    /// Cancel orders whose expiry is at or before `now`.
    pub fn expire_orders(&mut self, now: DateTime<Utc>) {
        let expired: Vec<u64> = self
            .orders
            .values()
            .filter(|o| o.expiry.is_some_and(|e| e <= now))
            .map(|o| o.ticket)
            .collect();

        for ticket in expired {
            self.orders.remove(&ticket);
            self.history.insert(ticket, OrderState::Cancelled);
            debug!(ticket = ticket, "Paper order expired");
        }
    }

    fn is_crossed(order: &BrokerOrder, bid: Decimal, ask: Decimal) -> bool {
        match order.order_type {
            OrderType::BuyLimit => ask <= order.price,
            OrderType::BuyStop => ask >= order.price,
            OrderType::SellLimit => bid >= order.price,
            OrderType::SellStop => bid <= order.price,
            OrderType::Buy | OrderType::Sell => false,
        }
    }

    fn fill_order(&mut self, ticket: u64, time: DateTime<Utc>) {
        let Some(order) = self.orders.remove(&ticket) else {
            return;
        };

        // Event-reporting platforms open a new position ticket and keep the
        // order in history; polling platforms reuse the order ticket.
        let position_ticket = match self.fill_reporting {
            FillReporting::Events => {
                let position_ticket = self.allocate_ticket();
                self.history.insert(ticket, OrderState::Filled { position_ticket });
                self.fill_events.push(FillEvent {
                    order_ticket: ticket,
                    position_ticket,
                });
                position_ticket
            }
            FillReporting::Polling => ticket,
        };

        debug!(order = ticket, position = position_ticket, "Paper order filled");
        self.positions.insert(
            position_ticket,
            BrokerPosition {
                ticket: position_ticket,
                symbol: order.symbol,
                order_type: order.order_type.market_side(),
                volume: order.volume,
                open_price: order.price,
                stop_loss: order.stop_loss,
                take_profit: order.take_profit,
                magic: order.magic,
                comment: order.comment,
                open_time: time,
            },
        );
    }

    fn allocate_ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }

    fn injected_failure(&mut self) -> BrokerResult<()> {
        match self.failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn spec_for(&self, symbol: &str) -> SymbolSpec {
        self.specs
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| SymbolSpec::forex(symbol))
    }

    fn check_volume(&self, symbol: &str, volume: Decimal) -> BrokerResult<()> {
        let spec = self.spec_for(symbol);
        let on_step = spec.volume_step.is_zero() || (volume % spec.volume_step).is_zero();
        if volume < spec.volume_min || volume > spec.volume_max || !on_step {
            return Err(BrokerError::InvalidRequest(format!(
                "invalid volume {} for {}",
                volume, symbol
            )));
        }
        Ok(())
    }

    fn check_trade_allowed(&self) -> BrokerResult<()> {
        if self.account.trade_allowed {
            Ok(())
        } else {
            Err(BrokerError::Rejected("trading disabled".to_string()))
        }
    }
}

#[async_trait]
impl Broker for PaperBroker {
    fn name(&self) -> &str {
        &self.name
    }

    fn fill_reporting(&self) -> FillReporting {
        self.fill_reporting
    }

    async fn open_market(&mut self, request: &MarketOrderRequest) -> BrokerResult<u64> {
        self.calls.open_market += 1;
        self.injected_failure()?;
        self.check_trade_allowed()?;

        if request.side.is_pending() {
            return Err(BrokerError::InvalidRequest(format!(
                "{} is not a market side",
                request.side
            )));
        }
        self.check_volume(&request.symbol, request.volume)?;
        let quote = self
            .quotes
            .get(&request.symbol)
            .cloned()
            .ok_or_else(|| BrokerError::NoQuote(request.symbol.clone()))?;

        let ticket = self.allocate_ticket();
        self.positions.insert(
            ticket,
            BrokerPosition {
                ticket,
                symbol: request.symbol.clone(),
                order_type: request.side,
                volume: request.volume,
                open_price: quote.price_for(request.side),
                stop_loss: request.stop_loss,
                take_profit: request.take_profit,
                magic: request.magic,
                comment: request.comment.clone(),
                open_time: quote.time,
            },
        );
        Ok(ticket)
    }

    async fn place_pending(&mut self, request: &PendingOrderRequest) -> BrokerResult<u64> {
        self.calls.place_pending += 1;
        self.injected_failure()?;
        self.check_trade_allowed()?;

        if !request.order_type.is_pending() {
            return Err(BrokerError::InvalidRequest(format!(
                "{} is not a pending type",
                request.order_type
            )));
        }
        self.check_volume(&request.symbol, request.volume)?;

        if let Some(quote) = self.quotes.get(&request.symbol) {
            let valid = match request.order_type {
                OrderType::BuyLimit => request.price <= quote.ask,
                OrderType::BuyStop => request.price >= quote.ask,
                OrderType::SellLimit => request.price >= quote.bid,
                OrderType::SellStop => request.price <= quote.bid,
                OrderType::Buy | OrderType::Sell => false,
            };
            if !valid {
                return Err(BrokerError::InvalidRequest(format!(
                    "invalid price {} for {}",
                    request.price, request.order_type
                )));
            }
        }

        let ticket = self.allocate_ticket();
        self.orders.insert(
            ticket,
            BrokerOrder {
                ticket,
                symbol: request.symbol.clone(),
                order_type: request.order_type,
                volume: request.volume,
                price: request.price,
                stop_loss: request.stop_loss,
                take_profit: request.take_profit,
                magic: request.magic,
                comment: request.comment.clone(),
                expiry: request.expiry,
                placed_at: Utc::now(),
            },
        );
        Ok(ticket)
    }

    async fn close(&mut self, ticket: u64, volume: Decimal) -> BrokerResult<()> {
        self.calls.close += 1;
        self.injected_failure()?;

        let (symbol, current) = match self.positions.get(&ticket) {
            Some(p) => (p.symbol.clone(), p.volume),
            None => return Err(BrokerError::NotFound(ticket)),
        };
        if volume > current {
            return Err(BrokerError::InvalidRequest(format!(
                "close volume {} exceeds position volume {}",
                volume, current
            )));
        }
        self.check_volume(&symbol, volume)?;

        if volume == current {
            self.positions.remove(&ticket);
        } else if let Some(position) = self.positions.get_mut(&ticket) {
            position.volume = current - volume;
        }
        Ok(())
    }

    async fn modify(
        &mut self,
        ticket: u64,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> BrokerResult<()> {
        self.calls.modify += 1;
        self.injected_failure()?;

        if let Some(position) = self.positions.get_mut(&ticket) {
            position.stop_loss = stop_loss;
            position.take_profit = take_profit;
            return Ok(());
        }
        if let Some(order) = self.orders.get_mut(&ticket) {
            order.stop_loss = stop_loss;
            order.take_profit = take_profit;
            return Ok(());
        }
        Err(BrokerError::NotFound(ticket))
    }

    async fn cancel_pending(&mut self, ticket: u64) -> BrokerResult<()> {
        self.calls.cancel_pending += 1;
        self.injected_failure()?;

        match self.orders.remove(&ticket) {
            Some(_) => {
                self.history.insert(ticket, OrderState::Cancelled);
                Ok(())
            }
            None => Err(BrokerError::NotFound(ticket)),
        }
    }

    async fn positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        Ok(self.positions.values().cloned().collect())
    }

    async fn pending_orders(&self) -> BrokerResult<Vec<BrokerOrder>> {
        Ok(self.orders.values().cloned().collect())
    }

    async fn position(&self, ticket: u64) -> BrokerResult<Option<BrokerPosition>> {
        Ok(self.positions.get(&ticket).cloned())
    }

    async fn order_state(&self, ticket: u64) -> BrokerResult<OrderState> {
        if self.orders.contains_key(&ticket) {
            return Ok(OrderState::Pending);
        }
        Ok(self
            .history
            .get(&ticket)
            .copied()
            .unwrap_or(OrderState::Missing))
    }

    async fn symbol_spec(&self, symbol: &str) -> BrokerResult<SymbolSpec> {
        Ok(self.spec_for(symbol))
    }

    async fn quote(&self, symbol: &str) -> BrokerResult<Option<Quote>> {
        Ok(self.quotes.get(symbol).cloned())
    }

    async fn account(&self) -> BrokerResult<AccountInfo> {
        Ok(self.account.clone())
    }

    fn take_fill_events(&mut self) -> Vec<FillEvent> {
        std::mem::take(&mut self.fill_events)
    }
}
