//! Decides whether and how a master signal is replicated.
//!
//! Pure policy: no broker calls. The caller supplies the local market context
//! (symbol spec, quote, equity) and acts on the returned [`Decision`].

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::broker::{Quote, SymbolSpec};
use crate::models::{
    ConnectionStatus, OpenSignal, OrderType, PositionInfo, ReplicationConfig, SyncMode,
};

use super::pricing::{deviation_pips, pending_type_for};
use super::sizing::LotSizer;
use super::symbols::SymbolResolver;

/// Local market state for the resolved symbol.
#[derive(Debug, Clone)]
pub struct MarketContext {
    pub spec: SymbolSpec,
    pub quote: Option<Quote>,
    pub local_equity: Decimal,
}

/// Transformed market order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderParams {
    pub symbol: String,
    /// Buy or Sell
    pub order_type: OrderType,
    pub volume: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub magic: i64,
    /// Master price the order is replicating
    pub reference_price: Decimal,
}

/// Transformed limit/stop order.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingParams {
    pub symbol: String,
    pub order_type: OrderType,
    pub volume: Decimal,
    pub price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub magic: i64,
    pub expiry: Option<DateTime<Utc>>,
}

/// Why a signal was not replicated.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    NotConnected(ConnectionStatus),
    NewOrdersDisabled,
    SymbolFiltered(String),
    MagicFiltered(i64),
    LotsOutOfRange { lots: Decimal, min: Decimal, max: Decimal },
    VolumeOverflow(Decimal),
    PendingCopyDisabled(OrderType),
    TooStale { age_ms: i64, max_ms: u64 },
    PriceDeviation { pips: Decimal, max_pips: Decimal },
    NoQuote(String),
    SyncDisabled,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected(status) => write!(f, "master link is {}", status),
            Self::NewOrdersDisabled => write!(f, "new orders disabled"),
            Self::SymbolFiltered(symbol) => write!(f, "symbol {} filtered", symbol),
            Self::MagicFiltered(magic) => write!(f, "magic {} filtered", magic),
            Self::LotsOutOfRange { lots, min, max } => {
                write!(f, "master lots {} outside [{}, {}]", lots, min, max)
            }
            Self::VolumeOverflow(lots) => write!(f, "scaled volume for {} lots overflows", lots),
            Self::PendingCopyDisabled(order_type) => {
                write!(f, "pending order copy disabled ({})", order_type)
            }
            Self::TooStale { age_ms, max_ms } => {
                write!(f, "signal age {}ms exceeds {}ms", age_ms, max_ms)
            }
            Self::PriceDeviation { pips, max_pips } => {
                write!(f, "price deviation {} pips exceeds {}", pips, max_pips)
            }
            Self::NoQuote(symbol) => write!(f, "no quote for {}", symbol),
            Self::SyncDisabled => write!(f, "sync disabled"),
        }
    }
}

/// Outcome of evaluating a signal.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Execute at market now
    Apply(OrderParams),
    /// Place a pending order and wait for the price
    Defer(PendingParams),
    Reject(RejectReason),
}

/// Policy evaluation against a master's config.
#[derive(Debug, Clone, Default)]
pub struct SignalEvaluator {
    /// Fixed clock for deterministic evaluation
    reference_time: Option<DateTime<Utc>>,
}

impl SignalEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reference_time(reference_time: DateTime<Utc>) -> Self {
        Self {
            reference_time: Some(reference_time),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.reference_time.unwrap_or_else(Utc::now)
    }

    pub fn signal_age_ms(&self, timestamp: DateTime<Utc>) -> i64 {
        (self.now() - timestamp).num_milliseconds()
    }

    /// Local symbol for a wire symbol.
    pub fn local_symbol(&self, symbol: &str, config: &ReplicationConfig) -> String {
        SymbolResolver::new(config).resolve(symbol)
    }

    /// Status, permission, filter and lot-bound gates for new exposure.
    pub fn check_gates(
        &self,
        signal: &OpenSignal,
        config: &ReplicationConfig,
    ) -> Result<(), RejectReason> {
        if config.status != ConnectionStatus::Connected {
            return Err(RejectReason::NotConnected(config.status));
        }
        if !config.allow_new_orders {
            return Err(RejectReason::NewOrdersDisabled);
        }

        let clean = SymbolResolver::new(config).clean(&signal.symbol).to_string();
        if !config.filters.allows_symbol(&clean) {
            return Err(RejectReason::SymbolFiltered(clean));
        }
        if !config.filters.allows_magic(signal.magic_number) {
            return Err(RejectReason::MagicFiltered(signal.magic_number.unwrap_or(0)));
        }

        let below = config.source_lot_min > Decimal::ZERO && signal.lots < config.source_lot_min;
        let above = config.source_lot_max > Decimal::ZERO && signal.lots > config.source_lot_max;
        if below || above {
            return Err(RejectReason::LotsOutOfRange {
                lots: signal.lots,
                min: config.source_lot_min,
                max: config.source_lot_max,
            });
        }

        Ok(())
    }

    /// Evaluate an incremental Open signal.
    pub fn evaluate_open(
        &self,
        signal: &OpenSignal,
        config: &ReplicationConfig,
        market: &MarketContext,
    ) -> Decision {
        // 1. Policy gates
        if let Err(reason) = self.check_gates(signal, config) {
            return Decision::Reject(reason);
        }

        let order_type = self.direction(signal.order_type, config);
        let Some(volume) =
            LotSizer::new(config).lots_for(signal.lots, market.local_equity, &market.spec)
        else {
            return Decision::Reject(RejectReason::VolumeOverflow(signal.lots));
        };

        // 2. Master pending orders are mirrored as pending orders
        if signal.order_type.is_pending() {
            if !config.copy_pending_orders {
                return Decision::Reject(RejectReason::PendingCopyDisabled(signal.order_type));
            }
            return Decision::Defer(PendingParams {
                symbol: market.spec.symbol.clone(),
                order_type,
                volume,
                price: signal.price,
                stop_loss: signal.stop_loss,
                take_profit: signal.take_profit,
                magic: signal.magic_number.unwrap_or(0),
                expiry: None,
            });
        }

        // 3. Staleness
        let age_ms = self.signal_age_ms(signal.timestamp);
        let max_ms = config.max_signal_delay_ms;
        if age_ms > max_ms as i64 {
            if !config.use_pending_order_for_delayed || signal.price.is_zero() {
                return Decision::Reject(RejectReason::TooStale { age_ms, max_ms });
            }

            let pending_type = pending_type_for(order_type, signal.price, market.quote.as_ref());
            debug!(
                ticket = signal.ticket,
                age_ms = age_ms,
                order_type = %pending_type,
                "Deferring stale signal to pending order"
            );
            return Decision::Defer(PendingParams {
                symbol: market.spec.symbol.clone(),
                order_type: pending_type,
                volume,
                price: signal.price,
                stop_loss: signal.stop_loss,
                take_profit: signal.take_profit,
                magic: signal.magic_number.unwrap_or(0),
                expiry: self.expiry(config),
            });
        }

        Decision::Apply(OrderParams {
            symbol: market.spec.symbol.clone(),
            order_type,
            volume,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            magic: signal.magic_number.unwrap_or(0),
            reference_price: signal.price,
        })
    }

    /// Evaluate a snapshot position missing locally, under the config's sync mode.
    pub fn evaluate_sync(
        &self,
        position: &PositionInfo,
        config: &ReplicationConfig,
        market: &MarketContext,
    ) -> Decision {
        let signal = position.as_open_signal(&config.master_account);
        if let Err(reason) = self.check_gates(&signal, config) {
            return Decision::Reject(reason);
        }

        let order_type = self.direction(position.order_type, config);
        let Some(volume) =
            LotSizer::new(config).lots_for(position.lots, market.local_equity, &market.spec)
        else {
            return Decision::Reject(RejectReason::VolumeOverflow(position.lots));
        };

        let pending = |order_type: OrderType, expiry: Option<DateTime<Utc>>| PendingParams {
            symbol: market.spec.symbol.clone(),
            order_type,
            volume,
            price: position.open_price,
            stop_loss: position.stop_loss,
            take_profit: position.take_profit,
            magic: position.magic_number.unwrap_or(0),
            expiry,
        };

        if position.order_type.is_pending() {
            if !config.copy_pending_orders {
                return Decision::Reject(RejectReason::PendingCopyDisabled(position.order_type));
            }
            return Decision::Defer(pending(order_type, None));
        }

        match config.sync_mode {
            SyncMode::Skip => Decision::Reject(RejectReason::SyncDisabled),
            SyncMode::LimitOrder => {
                let pending_type =
                    pending_type_for(order_type, position.open_price, market.quote.as_ref());
                Decision::Defer(pending(pending_type, self.expiry(config)))
            }
            SyncMode::MarketOrder => {
                let Some(quote) = market.quote.as_ref() else {
                    return Decision::Reject(RejectReason::NoQuote(market.spec.symbol.clone()));
                };
                let current = quote.price_for(order_type);
                if let Err(reason) = Self::check_price_deviation(
                    &market.spec,
                    position.open_price,
                    current,
                    config.market_sync_max_pips,
                ) {
                    return Decision::Reject(reason);
                }

                Decision::Apply(OrderParams {
                    symbol: market.spec.symbol.clone(),
                    order_type,
                    volume,
                    stop_loss: position.stop_loss,
                    take_profit: position.take_profit,
                    magic: position.magic_number.unwrap_or(0),
                    reference_price: position.open_price,
                })
            }
        }
    }

    /// Fail when `current` is more than `max_pips` away from `reference`.
    pub fn check_price_deviation(
        spec: &SymbolSpec,
        reference: Decimal,
        current: Decimal,
        max_pips: Decimal,
    ) -> Result<Decimal, RejectReason> {
        let pips = deviation_pips(spec, reference, current);
        if max_pips > Decimal::ZERO && pips > max_pips {
            return Err(RejectReason::PriceDeviation { pips, max_pips });
        }
        Ok(pips)
    }

    fn direction(&self, order_type: OrderType, config: &ReplicationConfig) -> OrderType {
        if config.reverse_trade {
            order_type.reversed()
        } else {
            order_type
        }
    }

    fn expiry(&self, config: &ReplicationConfig) -> Option<DateTime<Utc>> {
        (config.limit_order_expiry_min > 0)
            .then(|| self.now() + Duration::minutes(i64::from(config.limit_order_expiry_min)))
    }
}
