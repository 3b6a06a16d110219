//! Execution engine: applies master signals to the local terminal.
//!
//! Per master ticket:
//! - Open: idempotent on the ticket, evaluated by policy, executed with retries
//! - Close: full or partial; a close for a never-filled order cancels it
//! - Modify: SL/TP update that never clears an existing level implicitly
//! - Pending fills: promoted to confirmed mappings when the broker reports them

use std::fmt;
use std::time::{Duration, Instant};

use backoff::backoff::{Backoff, Constant};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, BrokerResult, MarketOrderRequest, PendingOrderRequest};
use crate::metrics::{LatencySummary, LatencyTracker};
use crate::models::{
    CloseSignal, ModifySignal, OpenSignal, OrderType, PositionInfo, ReplicationConfig,
    TradeSignal,
};

use super::evaluator::{
    Decision, MarketContext, OrderParams, PendingParams, RejectReason, SignalEvaluator,
};
use super::fills::{FillDetector, FillResolution};
use super::recovery::{RecoveryReport, RecoveryScanner};
use super::sizing::partial_close_volume;
use super::ticket_mapper::{build_market_comment, build_pending_comment, TicketMapper};

/// Result of handling one signal or sync action.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    Opened { local_ticket: u64, volume: Decimal },
    PendingPlaced { pending_ticket: u64, order_type: OrderType, price: Decimal },
    Closed { local_ticket: u64 },
    PartiallyClosed { local_ticket: u64, volume: Decimal },
    /// Local position was already gone; mapping dropped
    AlreadyClosed { local_ticket: u64 },
    PendingCancelled { pending_ticket: u64 },
    Modified { local_ticket: u64 },
    /// Master ticket already mapped
    Duplicate,
    /// No mapping for the master ticket
    UnknownTicket,
    Rejected(RejectReason),
    Skipped(String),
    Failed(String),
}

impl SignalOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Opened { .. } => "opened",
            Self::PendingPlaced { .. } => "pending_placed",
            Self::Closed { .. } => "closed",
            Self::PartiallyClosed { .. } => "partially_closed",
            Self::AlreadyClosed { .. } => "already_closed",
            Self::PendingCancelled { .. } => "pending_cancelled",
            Self::Modified { .. } => "modified",
            Self::Duplicate => "duplicate",
            Self::UnknownTicket => "unknown_ticket",
            Self::Rejected(_) => "rejected",
            Self::Skipped(_) => "skipped",
            Self::Failed(_) => "failed",
        }
    }

    pub fn local_ticket(&self) -> Option<u64> {
        match self {
            Self::Opened { local_ticket, .. }
            | Self::Closed { local_ticket }
            | Self::PartiallyClosed { local_ticket, .. }
            | Self::AlreadyClosed { local_ticket }
            | Self::Modified { local_ticket } => Some(*local_ticket),
            Self::PendingPlaced { pending_ticket, .. }
            | Self::PendingCancelled { pending_ticket } => Some(*pending_ticket),
            _ => None,
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            Self::Opened { volume, .. } | Self::PartiallyClosed { volume, .. } => {
                Some(format!("volume {}", volume))
            }
            Self::PendingPlaced { order_type, price, .. } => {
                Some(format!("{} @ {}", order_type, price))
            }
            Self::Rejected(reason) => Some(reason.to_string()),
            Self::Skipped(reason) | Self::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for SignalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.detail() {
            Some(detail) => write!(f, "{} ({})", self.label(), detail),
            None => f.write_str(self.label()),
        }
    }
}

/// Counters over the engine's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    pub opened: u64,
    pub deferred: u64,
    pub closed: u64,
    pub modified: u64,
    pub rejected: u64,
    pub ignored: u64,
    pub failed: u64,
    pub fills_promoted: u64,
    pub pending_dropped: u64,
}

/// One broker mutation, replayable across retry attempts.
#[derive(Debug, Clone, Copy)]
enum BrokerCall<'a> {
    Market(&'a MarketOrderRequest),
    Pending(&'a PendingOrderRequest),
    Close { ticket: u64, volume: Decimal },
    Modify { ticket: u64, stop_loss: Option<Decimal>, take_profit: Option<Decimal> },
    Cancel { ticket: u64 },
}

/// Owns the broker and the ticket mapping.
pub struct ExecutionEngine<B: Broker> {
    broker: B,
    mapper: TicketMapper,
    evaluator: SignalEvaluator,
    fill_detector: FillDetector,
    latency: LatencyTracker,
    retry_delay: Duration,
    stats: ExecutionStats,
}

impl<B: Broker> ExecutionEngine<B> {
    pub fn new(broker: B, retry_delay: Duration) -> Self {
        let fill_detector = FillDetector::for_reporting(broker.fill_reporting());
        Self {
            broker,
            mapper: TicketMapper::new(),
            evaluator: SignalEvaluator::new(),
            fill_detector,
            latency: LatencyTracker::new(),
            retry_delay,
            stats: ExecutionStats::default(),
        }
    }

    pub fn with_evaluator(mut self, evaluator: SignalEvaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut B {
        &mut self.broker
    }

    pub fn into_broker(self) -> B {
        self.broker
    }

    pub fn mapper(&self) -> &TicketMapper {
        &self.mapper
    }

    pub fn mapper_mut(&mut self) -> &mut TicketMapper {
        &mut self.mapper
    }

    pub fn evaluator(&self) -> &SignalEvaluator {
        &self.evaluator
    }

    pub fn stats(&self) -> ExecutionStats {
        self.stats
    }

    pub fn latency_summary(&self) -> LatencySummary {
        self.latency.summary()
    }

    /// Rebuild the ticket mapping from the terminal. Run once before any signal.
    pub async fn recover(&mut self) -> BrokerResult<RecoveryReport> {
        RecoveryScanner.run(&self.broker, &mut self.mapper).await
    }

    /// Apply one master signal under `config`.
    pub async fn handle_signal(
        &mut self,
        signal: &TradeSignal,
        config: &ReplicationConfig,
    ) -> SignalOutcome {
        let outcome = match signal {
            TradeSignal::Open(open) => self.open(open, config).await,
            TradeSignal::Close(close) => self.close(close, config).await,
            TradeSignal::Modify(modify) => self.modify(modify, config).await,
        };
        self.record(signal.ticket(), signal.action(), &outcome);
        outcome
    }

    /// Open a snapshot position that has no local counterpart.
    pub async fn sync_position(
        &mut self,
        position: &PositionInfo,
        config: &ReplicationConfig,
    ) -> SignalOutcome {
        let outcome = self.sync_open(position, config).await;
        self.record(position.ticket, "Sync", &outcome);
        outcome
    }

    /// Whether a master ticket already has a confirmed or pending counterpart.
    pub fn is_mapped(&self, remote: u64) -> bool {
        self.mapper.get_local(remote).is_some() || self.mapper.get_pending(remote).is_some()
    }

    async fn open(&mut self, signal: &OpenSignal, config: &ReplicationConfig) -> SignalOutcome {
        // 1. Replay guard
        if self.is_mapped(signal.ticket) {
            debug!(remote = signal.ticket, "Open already applied, ignoring");
            return SignalOutcome::Duplicate;
        }

        // 2. Cheap gates before touching the broker
        if let Err(reason) = self.evaluator.check_gates(signal, config) {
            return SignalOutcome::Rejected(reason);
        }

        // 3. Local market context
        let symbol = self.evaluator.local_symbol(&signal.symbol, config);
        let market = match self.market_context(&symbol).await {
            Ok(market) => market,
            Err(e) => return SignalOutcome::Failed(format!("market context for {}: {}", symbol, e)),
        };

        // 4. Decide and execute
        let decision = self.evaluator.evaluate_open(signal, config, &market);
        self.execute(signal.ticket, decision, config).await
    }

    async fn sync_open(
        &mut self,
        position: &PositionInfo,
        config: &ReplicationConfig,
    ) -> SignalOutcome {
        if self.is_mapped(position.ticket) {
            return SignalOutcome::Duplicate;
        }

        let symbol = self.evaluator.local_symbol(&position.symbol, config);
        let market = match self.market_context(&symbol).await {
            Ok(market) => market,
            Err(e) => return SignalOutcome::Failed(format!("market context for {}: {}", symbol, e)),
        };

        let decision = self.evaluator.evaluate_sync(position, config, &market);
        self.execute(position.ticket, decision, config).await
    }

    async fn market_context(&self, symbol: &str) -> BrokerResult<MarketContext> {
        let spec = self.broker.symbol_spec(symbol).await?;
        let quote = self.broker.quote(symbol).await?;
        let account = self.broker.account().await?;
        Ok(MarketContext {
            spec,
            quote,
            local_equity: account.equity,
        })
    }

    async fn execute(
        &mut self,
        remote: u64,
        decision: Decision,
        config: &ReplicationConfig,
    ) -> SignalOutcome {
        match decision {
            Decision::Apply(params) => self.execute_market(remote, params, config).await,
            Decision::Defer(params) => self.execute_pending(remote, params, config).await,
            Decision::Reject(reason) => SignalOutcome::Rejected(reason),
        }
    }

    async fn execute_market(
        &mut self,
        remote: u64,
        params: OrderParams,
        config: &ReplicationConfig,
    ) -> SignalOutcome {
        let request = MarketOrderRequest {
            symbol: params.symbol,
            side: params.order_type,
            volume: params.volume,
            stop_loss: params.stop_loss,
            take_profit: params.take_profit,
            magic: params.magic,
            comment: build_market_comment(remote),
            deviation: config.max_slippage,
        };

        match self.submit_with_retries(BrokerCall::Market(&request), config.max_retries).await {
            Ok(local_ticket) => {
                if let Err(e) = self.mapper.add_mapping(remote, local_ticket) {
                    error!(error = %e, "Opened position could not be mapped");
                }
                SignalOutcome::Opened {
                    local_ticket,
                    volume: request.volume,
                }
            }
            Err(e) => SignalOutcome::Failed(e.to_string()),
        }
    }

    async fn execute_pending(
        &mut self,
        remote: u64,
        params: PendingParams,
        config: &ReplicationConfig,
    ) -> SignalOutcome {
        let request = PendingOrderRequest {
            symbol: params.symbol,
            order_type: params.order_type,
            volume: params.volume,
            price: params.price,
            stop_loss: params.stop_loss,
            take_profit: params.take_profit,
            magic: params.magic,
            comment: build_pending_comment(remote),
            expiry: params.expiry,
        };

        match self.submit_with_retries(BrokerCall::Pending(&request), config.max_retries).await {
            Ok(pending_ticket) => {
                if let Err(e) = self.mapper.add_pending(remote, pending_ticket) {
                    error!(error = %e, "Pending order could not be mapped");
                }
                SignalOutcome::PendingPlaced {
                    pending_ticket,
                    order_type: request.order_type,
                    price: request.price,
                }
            }
            Err(e) => SignalOutcome::Failed(e.to_string()),
        }
    }

    async fn close(&mut self, signal: &CloseSignal, config: &ReplicationConfig) -> SignalOutcome {
        let Some(local_ticket) = self.mapper.get_local(signal.ticket) else {
            return self.cancel_pending(signal.ticket, config).await;
        };

        let position = match self.broker.position(local_ticket).await {
            Ok(Some(position)) => position,
            Ok(None) => {
                self.mapper.remove_mapping(signal.ticket);
                return SignalOutcome::AlreadyClosed { local_ticket };
            }
            Err(e) => return SignalOutcome::Failed(e.to_string()),
        };

        let mut volume = position.volume;
        if !signal.is_full_close() {
            let ratio = signal.close_ratio.unwrap_or(Decimal::ONE);
            let spec = match self.broker.symbol_spec(&position.symbol).await {
                Ok(spec) => spec,
                Err(e) => return SignalOutcome::Failed(e.to_string()),
            };
            volume = match partial_close_volume(position.volume, ratio, &spec) {
                Some(volume) => volume,
                None => {
                    return SignalOutcome::Skipped(format!(
                        "partial close of {} x {} is below minimum volume {}",
                        position.volume, ratio, spec.volume_min
                    ))
                }
            };
        }

        let call = BrokerCall::Close {
            ticket: local_ticket,
            volume,
        };
        match self.submit_with_retries(call, config.max_retries).await {
            Ok(_) if volume < position.volume => SignalOutcome::PartiallyClosed {
                local_ticket,
                volume,
            },
            Ok(_) => {
                self.mapper.remove_mapping(signal.ticket);
                SignalOutcome::Closed { local_ticket }
            }
            Err(BrokerError::NotFound(_)) => {
                self.mapper.remove_mapping(signal.ticket);
                SignalOutcome::AlreadyClosed { local_ticket }
            }
            Err(e) => SignalOutcome::Failed(e.to_string()),
        }
    }

    /// Close for a master ticket whose local order never filled.
    async fn cancel_pending(&mut self, remote: u64, config: &ReplicationConfig) -> SignalOutcome {
        let Some(pending_ticket) = self.mapper.get_pending(remote) else {
            debug!(remote = remote, "Close for unknown ticket, ignoring");
            return SignalOutcome::UnknownTicket;
        };

        let call = BrokerCall::Cancel {
            ticket: pending_ticket,
        };
        match self.submit_with_retries(call, config.max_retries).await {
            Ok(_) | Err(BrokerError::NotFound(_)) => {
                self.mapper.remove_pending(remote);
                SignalOutcome::PendingCancelled { pending_ticket }
            }
            Err(e) => SignalOutcome::Failed(e.to_string()),
        }
    }

    async fn modify(&mut self, signal: &ModifySignal, config: &ReplicationConfig) -> SignalOutcome {
        let current = if let Some(local) = self.mapper.get_local(signal.ticket) {
            match self.broker.position(local).await {
                Ok(Some(p)) => Some((local, p.stop_loss, p.take_profit)),
                Ok(None) => None,
                Err(e) => return SignalOutcome::Failed(e.to_string()),
            }
        } else if let Some(pending) = self.mapper.get_pending(signal.ticket) {
            match self.broker.pending_orders().await {
                Ok(orders) => orders
                    .into_iter()
                    .find(|o| o.ticket == pending)
                    .map(|o| (pending, o.stop_loss, o.take_profit)),
                Err(e) => return SignalOutcome::Failed(e.to_string()),
            }
        } else {
            None
        };

        let Some((ticket, current_sl, current_tp)) = current else {
            debug!(remote = signal.ticket, "Modify for unknown or unselectable ticket, ignoring");
            return SignalOutcome::UnknownTicket;
        };

        // Unset incoming levels keep the existing ones
        let stop_loss = signal.stop_loss.or(current_sl);
        let take_profit = signal.take_profit.or(current_tp);
        if stop_loss == current_sl && take_profit == current_tp {
            return SignalOutcome::Skipped("levels unchanged".to_string());
        }

        let call = BrokerCall::Modify {
            ticket,
            stop_loss,
            take_profit,
        };
        match self.submit_with_retries(call, config.max_retries).await {
            Ok(_) => SignalOutcome::Modified {
                local_ticket: ticket,
            },
            Err(e) => SignalOutcome::Failed(e.to_string()),
        }
    }

    /// Poll or drain pending-order fills and apply them to the mapping.
    pub async fn detect_fills(&mut self) -> Vec<FillResolution> {
        if self.mapper.pending_len() == 0 {
            // Still drain so stale events do not pile up
            self.broker.take_fill_events();
            return Vec::new();
        }

        let resolutions = self.fill_detector.detect(&mut self.broker, &self.mapper).await;
        for resolution in &resolutions {
            self.apply_fill(*resolution);
        }
        resolutions
    }

    /// Promote a filled pending order or drop a cancelled one.
    pub fn apply_fill(&mut self, resolution: FillResolution) {
        match resolution {
            FillResolution::Filled {
                pending_ticket,
                position_ticket,
            } => {
                if let Some(remote) = self.mapper.promote_pending(pending_ticket, position_ticket) {
                    self.stats.fills_promoted += 1;
                    info!(
                        remote = remote,
                        order = pending_ticket,
                        position = position_ticket,
                        "Pending order filled"
                    );
                }
            }
            FillResolution::Cancelled { pending_ticket } => {
                if let Some(remote) = self.mapper.remote_for_pending(pending_ticket) {
                    self.mapper.remove_pending(remote);
                    self.stats.pending_dropped += 1;
                    info!(remote = remote, order = pending_ticket, "Pending order cancelled or expired");
                }
            }
        }
    }

    async fn submit(&mut self, call: BrokerCall<'_>) -> BrokerResult<u64> {
        match call {
            BrokerCall::Market(request) => self.broker.open_market(request).await,
            BrokerCall::Pending(request) => self.broker.place_pending(request).await,
            BrokerCall::Close { ticket, volume } => {
                self.broker.close(ticket, volume).await.map(|_| ticket)
            }
            BrokerCall::Modify {
                ticket,
                stop_loss,
                take_profit,
            } => self
                .broker
                .modify(ticket, stop_loss, take_profit)
                .await
                .map(|_| ticket),
            BrokerCall::Cancel { ticket } => {
                self.broker.cancel_pending(ticket).await.map(|_| ticket)
            }
        }
    }

    /// Up to `max_retries` attempts with a fixed delay; only retryable errors are retried.
    async fn submit_with_retries(
        &mut self,
        call: BrokerCall<'_>,
        max_retries: u32,
    ) -> BrokerResult<u64> {
        let attempts = max_retries.max(1);
        let mut delay = Constant::new(self.retry_delay);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let started = Instant::now();
            let result = self.submit(call).await;
            self.latency.record(started.elapsed());

            match result {
                Ok(ticket) => return Ok(ticket),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        attempt = attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Broker call failed, retrying"
                    );
                    if let Some(wait) = delay.next_backoff() {
                        tokio::time::sleep(wait).await;
                    }
                }
                Err(e) => {
                    if e.is_retryable() {
                        error!(attempts = attempt, error = %e, "Broker call failed, retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }

    fn record(&mut self, remote: u64, action: &str, outcome: &SignalOutcome) {
        match outcome {
            SignalOutcome::Opened { local_ticket, volume } => {
                self.stats.opened += 1;
                info!(remote = remote, local = local_ticket, volume = %volume, "Position opened");
            }
            SignalOutcome::PendingPlaced {
                pending_ticket,
                order_type,
                price,
            } => {
                self.stats.deferred += 1;
                info!(
                    remote = remote,
                    local = pending_ticket,
                    order_type = %order_type,
                    price = %price,
                    "Pending order placed"
                );
            }
            SignalOutcome::Closed { local_ticket }
            | SignalOutcome::AlreadyClosed { local_ticket } => {
                self.stats.closed += 1;
                info!(remote = remote, local = local_ticket, outcome = outcome.label(), "Position closed");
            }
            SignalOutcome::PartiallyClosed { local_ticket, volume } => {
                self.stats.closed += 1;
                info!(remote = remote, local = local_ticket, volume = %volume, "Position partially closed");
            }
            SignalOutcome::PendingCancelled { pending_ticket } => {
                self.stats.closed += 1;
                info!(remote = remote, local = pending_ticket, "Pending order cancelled");
            }
            SignalOutcome::Modified { local_ticket } => {
                self.stats.modified += 1;
                info!(remote = remote, local = local_ticket, "Protective levels modified");
            }
            SignalOutcome::Duplicate | SignalOutcome::UnknownTicket => {
                self.stats.ignored += 1;
            }
            SignalOutcome::Skipped(reason) => {
                self.stats.ignored += 1;
                info!(remote = remote, action = action, reason = %reason, "Signal skipped");
            }
            SignalOutcome::Rejected(reason) => {
                self.stats.rejected += 1;
                info!(remote = remote, action = action, reason = %reason, "Signal rejected");
            }
            SignalOutcome::Failed(reason) => {
                self.stats.failed += 1;
                error!(remote = remote, action = action, error = %reason, "Signal failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{FillReporting, PaperBroker};
    use crate::models::ConnectionStatus;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn config() -> ReplicationConfig {
        ReplicationConfig {
            status: ConnectionStatus::Connected,
            ..ReplicationConfig::new("MASTER1")
        }
    }

    fn engine() -> ExecutionEngine<PaperBroker> {
        let mut broker = PaperBroker::new(FillReporting::Polling);
        broker.set_quote_at("EURUSD", dec!(1.1048), dec!(1.1050), now());
        ExecutionEngine::new(broker, std::time::Duration::ZERO)
            .with_evaluator(SignalEvaluator::with_reference_time(now()))
    }

    fn open(ticket: u64, order_type: OrderType, lots: Decimal) -> TradeSignal {
        TradeSignal::Open(OpenSignal {
            ticket,
            symbol: "EURUSD".to_string(),
            order_type,
            lots,
            price: dec!(1.1050),
            stop_loss: None,
            take_profit: None,
            magic_number: Some(0),
            comment: None,
            timestamp: now(),
            source_account: "MASTER1".to_string(),
        })
    }

    fn close(ticket: u64, close_ratio: Option<Decimal>) -> TradeSignal {
        TradeSignal::Close(CloseSignal {
            ticket,
            close_ratio,
            timestamp: now(),
            source_account: "MASTER1".to_string(),
        })
    }

    fn modify(ticket: u64, stop_loss: Option<Decimal>, take_profit: Option<Decimal>) -> TradeSignal {
        TradeSignal::Modify(ModifySignal {
            ticket,
            stop_loss,
            take_profit,
            timestamp: now(),
            source_account: "MASTER1".to_string(),
        })
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let mut engine = engine();
        let config = config();
        let signal = open(500, OrderType::Buy, dec!(1.0));

        let first = engine.handle_signal(&signal, &config).await;
        let second = engine.handle_signal(&signal, &config).await;

        assert!(matches!(first, SignalOutcome::Opened { .. }));
        assert_eq!(second, SignalOutcome::Duplicate);
        assert_eq!(engine.broker().calls().open_market, 1);
        assert_eq!(engine.mapper().active_len(), 1);
    }

    #[tokio::test]
    async fn test_open_with_multiplier_and_reverse() {
        let mut engine = engine();
        let config = ReplicationConfig {
            lot_multiplier: dec!(2.0),
            ..config()
        };

        let outcome = engine
            .handle_signal(&open(500, OrderType::Buy, dec!(1.0)), &config)
            .await;
        let local = outcome.local_ticket().unwrap();
        let position = engine.broker().position(local).await.unwrap().unwrap();
        assert_eq!(position.order_type, OrderType::Buy);
        assert_eq!(position.volume, dec!(2));
        assert_eq!(position.comment, "M500");
        assert_eq!(engine.mapper().get_local(500), Some(local));

        let reversed = ReplicationConfig {
            reverse_trade: true,
            ..config
        };
        let outcome = engine
            .handle_signal(&open(501, OrderType::Buy, dec!(1.0)), &reversed)
            .await;
        let local = outcome.local_ticket().unwrap();
        let position = engine.broker().position(local).await.unwrap().unwrap();
        assert_eq!(position.order_type, OrderType::Sell);
    }

    #[tokio::test]
    async fn test_partial_then_full_close() {
        let mut engine = engine();
        let config = ReplicationConfig {
            lot_multiplier: dec!(2.0),
            ..config()
        };
        engine
            .handle_signal(&open(500, OrderType::Buy, dec!(1.0)), &config)
            .await;
        let local = engine.mapper().get_local(500).unwrap();

        let partial = engine.handle_signal(&close(500, Some(dec!(0.5))), &config).await;
        assert_eq!(
            partial,
            SignalOutcome::PartiallyClosed {
                local_ticket: local,
                volume: dec!(1)
            }
        );
        assert_eq!(engine.mapper().get_local(500), Some(local));
        let remaining = engine.broker().position(local).await.unwrap().unwrap();
        assert_eq!(remaining.volume, dec!(1.0));

        let full = engine.handle_signal(&close(500, Some(dec!(0))), &config).await;
        assert_eq!(full, SignalOutcome::Closed { local_ticket: local });
        assert_eq!(engine.mapper().get_local(500), None);
        assert!(engine.broker().position(local).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_close_below_minimum_is_skipped() {
        let mut engine = engine();
        let config = config();
        engine
            .handle_signal(&open(500, OrderType::Buy, dec!(0.01)), &config)
            .await;

        let outcome = engine.handle_signal(&close(500, Some(dec!(0.5))), &config).await;
        assert!(matches!(outcome, SignalOutcome::Skipped(_)));
        assert_eq!(engine.broker().calls().close, 0);
        assert!(engine.mapper().get_local(500).is_some());
    }

    #[tokio::test]
    async fn test_close_unknown_and_already_closed() {
        let mut engine = engine();
        let config = config();

        let unknown = engine.handle_signal(&close(999, None), &config).await;
        assert_eq!(unknown, SignalOutcome::UnknownTicket);
        assert_eq!(engine.broker().calls().total(), 0);

        engine
            .handle_signal(&open(500, OrderType::Buy, dec!(1.0)), &config)
            .await;
        let local = engine.mapper().get_local(500).unwrap();
        // Closed by hand on the terminal
        engine.broker_mut().close(local, dec!(1)).await.unwrap();

        let outcome = engine.handle_signal(&close(500, None), &config).await;
        assert_eq!(outcome, SignalOutcome::AlreadyClosed { local_ticket: local });
        assert_eq!(engine.mapper().get_local(500), None);
    }

    #[tokio::test]
    async fn test_retryable_errors_are_retried() {
        let mut engine = engine();
        let config = config();
        engine.broker_mut().fail_next(BrokerError::Busy);
        engine.broker_mut().fail_next(BrokerError::Requote("moved".to_string()));

        let outcome = engine
            .handle_signal(&open(500, OrderType::Buy, dec!(1.0)), &config)
            .await;

        assert!(matches!(outcome, SignalOutcome::Opened { .. }));
        assert_eq!(engine.broker().calls().open_market, 3);
        assert_eq!(engine.latency_summary().count, 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_and_permanent_failure() {
        let mut engine = engine();
        let config = ReplicationConfig {
            max_retries: 2,
            ..config()
        };
        engine.broker_mut().fail_next(BrokerError::Busy);
        engine.broker_mut().fail_next(BrokerError::Busy);

        let outcome = engine
            .handle_signal(&open(500, OrderType::Buy, dec!(1.0)), &config)
            .await;
        assert!(matches!(outcome, SignalOutcome::Failed(_)));
        assert_eq!(engine.broker().calls().open_market, 2);
        assert!(!engine.is_mapped(500));

        engine
            .broker_mut()
            .fail_next(BrokerError::Rejected("not enough money".to_string()));
        let outcome = engine
            .handle_signal(&open(501, OrderType::Buy, dec!(1.0)), &config)
            .await;
        assert!(matches!(outcome, SignalOutcome::Failed(_)));
        assert_eq!(engine.broker().calls().open_market, 3);
        assert_eq!(engine.stats().failed, 2);
    }

    #[tokio::test]
    async fn test_rejection_makes_no_broker_call() {
        let mut engine = engine();
        let config = ReplicationConfig {
            status: ConnectionStatus::Enabled,
            ..config()
        };

        let outcome = engine
            .handle_signal(&open(500, OrderType::Buy, dec!(1.0)), &config)
            .await;
        assert_eq!(
            outcome,
            SignalOutcome::Rejected(RejectReason::NotConnected(ConnectionStatus::Enabled))
        );
        assert_eq!(engine.broker().calls().total(), 0);
        assert_eq!(engine.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_stale_signal_deferred_then_filled() {
        let mut engine = engine();
        let config = ReplicationConfig {
            use_pending_order_for_delayed: true,
            ..config()
        };
        let mut signal = match open(500, OrderType::Buy, dec!(1.0)) {
            TradeSignal::Open(signal) => signal,
            _ => unreachable!(),
        };
        signal.price = dec!(1.1000);
        signal.timestamp = now() - ChronoDuration::seconds(30);

        let outcome = engine.handle_signal(&TradeSignal::Open(signal), &config).await;
        assert_eq!(
            outcome,
            SignalOutcome::PendingPlaced {
                pending_ticket: 1000,
                order_type: OrderType::BuyLimit,
                price: dec!(1.1000)
            }
        );
        assert_eq!(engine.mapper().get_pending(500), Some(1000));
        assert_eq!(engine.mapper().get_local(500), None);

        engine
            .broker_mut()
            .set_quote_at("EURUSD", dec!(1.0998), dec!(1.1000), now());
        let fills = engine.detect_fills().await;

        assert_eq!(fills.len(), 1);
        assert_eq!(engine.mapper().get_local(500), Some(1000));
        assert_eq!(engine.mapper().get_pending(500), None);
        assert_eq!(engine.stats().fills_promoted, 1);
    }

    #[tokio::test]
    async fn test_close_of_unfilled_order_cancels_it() {
        let mut engine = engine();
        let config = ReplicationConfig {
            copy_pending_orders: true,
            ..config()
        };
        let mut signal = match open(500, OrderType::SellLimit, dec!(1.0)) {
            TradeSignal::Open(signal) => signal,
            _ => unreachable!(),
        };
        signal.price = dec!(1.1200);
        engine.handle_signal(&TradeSignal::Open(signal), &config).await;
        let pending = engine.mapper().get_pending(500).unwrap();

        let outcome = engine.handle_signal(&close(500, None), &config).await;
        assert_eq!(outcome, SignalOutcome::PendingCancelled { pending_ticket: pending });
        assert_eq!(engine.mapper().get_pending(500), None);
        assert!(engine.broker().pending_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_modify_keeps_unset_levels() {
        let mut engine = engine();
        let config = config();
        engine
            .handle_signal(&open(500, OrderType::Buy, dec!(1.0)), &config)
            .await;
        let local = engine.mapper().get_local(500).unwrap();

        let outcome = engine
            .handle_signal(&modify(500, Some(dec!(1.0950)), Some(dec!(1.1200))), &config)
            .await;
        assert_eq!(outcome, SignalOutcome::Modified { local_ticket: local });

        engine
            .handle_signal(&modify(500, None, Some(dec!(1.1300))), &config)
            .await;
        let position = engine.broker().position(local).await.unwrap().unwrap();
        assert_eq!(position.stop_loss, Some(dec!(1.0950)));
        assert_eq!(position.take_profit, Some(dec!(1.1300)));

        let unchanged = engine
            .handle_signal(&modify(500, None, Some(dec!(1.1300))), &config)
            .await;
        assert!(matches!(unchanged, SignalOutcome::Skipped(_)));
        assert_eq!(engine.broker().calls().modify, 2);

        let unknown = engine.handle_signal(&modify(777, Some(dec!(1.0)), None), &config).await;
        assert_eq!(unknown, SignalOutcome::UnknownTicket);
    }
}
