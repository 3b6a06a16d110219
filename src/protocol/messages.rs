//! Wire message shapes exchanged with the relay.
//!
//! Inbound messages convert into domain types; conversion rejects
//! payloads that are well-formed JSON but structurally incomplete.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{
    CloseSignal, ConnectionStatus, LotCalculationMode, ModifySignal, OpenSignal, OrderType,
    ReplicationConfig, SymbolMapping, SyncMode, TradeFilters, TradeSignal,
};

use super::CodecError;

/// Trade action discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeAction {
    Open,
    Close,
    Modify,
}

/// Flat trade signal as published by the master side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignalMessage {
    pub action: TradeAction,
    pub ticket: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_type: Option<OrderType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lots: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magic_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub source_account: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_ratio: Option<Decimal>,
}

/// Zero protective levels on the wire mean "not set".
fn level(value: Option<Decimal>) -> Option<Decimal> {
    value.filter(|v| !v.is_zero())
}

impl TryFrom<TradeSignalMessage> for TradeSignal {
    type Error = CodecError;

    fn try_from(msg: TradeSignalMessage) -> Result<Self, Self::Error> {
        match msg.action {
            TradeAction::Open => {
                let missing = |field: &str| {
                    CodecError::InvalidMessage(format!(
                        "open signal {} is missing {}",
                        msg.ticket, field
                    ))
                };
                let symbol = msg
                    .symbol
                    .clone()
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| missing("symbol"))?;
                let order_type = msg.order_type.ok_or_else(|| missing("order_type"))?;
                let lots = msg
                    .lots
                    .filter(|l| *l > Decimal::ZERO)
                    .ok_or_else(|| missing("lots"))?;

                Ok(TradeSignal::Open(OpenSignal {
                    ticket: msg.ticket,
                    symbol,
                    order_type,
                    lots,
                    price: msg.open_price.unwrap_or(Decimal::ZERO),
                    stop_loss: level(msg.stop_loss),
                    take_profit: level(msg.take_profit),
                    magic_number: msg.magic_number,
                    comment: msg.comment,
                    timestamp: msg.timestamp,
                    source_account: msg.source_account,
                }))
            }
            TradeAction::Close => Ok(TradeSignal::Close(CloseSignal {
                ticket: msg.ticket,
                close_ratio: msg.close_ratio,
                timestamp: msg.timestamp,
                source_account: msg.source_account,
            })),
            TradeAction::Modify => Ok(TradeSignal::Modify(ModifySignal {
                ticket: msg.ticket,
                stop_loss: level(msg.stop_loss),
                take_profit: level(msg.take_profit),
                timestamp: msg.timestamp,
                source_account: msg.source_account,
            })),
        }
    }
}

impl From<&TradeSignal> for TradeSignalMessage {
    fn from(signal: &TradeSignal) -> Self {
        let mut msg = TradeSignalMessage {
            action: TradeAction::Open,
            ticket: signal.ticket(),
            symbol: None,
            order_type: None,
            lots: None,
            open_price: None,
            stop_loss: None,
            take_profit: None,
            magic_number: None,
            comment: None,
            timestamp: signal.timestamp(),
            source_account: signal.source_account().to_string(),
            close_ratio: None,
        };

        match signal {
            TradeSignal::Open(open) => {
                msg.symbol = Some(open.symbol.clone());
                msg.order_type = Some(open.order_type);
                msg.lots = Some(open.lots);
                msg.open_price = Some(open.price);
                msg.stop_loss = open.stop_loss;
                msg.take_profit = open.take_profit;
                msg.magic_number = open.magic_number;
                msg.comment = open.comment.clone();
            }
            TradeSignal::Close(close) => {
                msg.action = TradeAction::Close;
                msg.close_ratio = close.close_ratio;
            }
            TradeSignal::Modify(modify) => {
                msg.action = TradeAction::Modify;
                msg.stop_loss = modify.stop_loss;
                msg.take_profit = modify.take_profit;
            }
        }
        msg
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_signal_delay_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

/// Per-master configuration pushed to a slave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveConfigMessage {
    /// Slave account the config is addressed to
    pub account_id: String,
    pub master_account: String,
    #[serde(default)]
    pub trade_group_id: String,
    pub status: i32,
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub lot_calculation_mode: LotCalculationMode,
    #[serde(default)]
    pub lot_multiplier: Option<Decimal>,
    #[serde(default)]
    pub reverse_trade: bool,
    #[serde(default)]
    pub symbol_prefix: Option<String>,
    #[serde(default)]
    pub symbol_suffix: Option<String>,
    #[serde(default)]
    pub symbol_mappings: Vec<SymbolMapping>,
    #[serde(default)]
    pub filters: TradeFilters,
    #[serde(default)]
    pub config_version: u32,
    #[serde(default)]
    pub source_lot_min: Option<Decimal>,
    #[serde(default)]
    pub source_lot_max: Option<Decimal>,
    #[serde(default)]
    pub master_equity: Option<Decimal>,

    #[serde(default)]
    pub sync_mode: SyncMode,
    #[serde(default)]
    pub limit_order_expiry_min: Option<u32>,
    #[serde(default)]
    pub market_sync_max_pips: Option<Decimal>,
    #[serde(default)]
    pub max_slippage: Option<u32>,
    #[serde(default)]
    pub copy_pending_orders: bool,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_signal_delay_ms")]
    pub max_signal_delay_ms: u64,
    #[serde(default)]
    pub use_pending_order_for_delayed: bool,
    #[serde(default = "default_true")]
    pub allow_new_orders: bool,
}

impl TryFrom<SlaveConfigMessage> for ReplicationConfig {
    type Error = CodecError;

    fn try_from(msg: SlaveConfigMessage) -> Result<Self, Self::Error> {
        if msg.master_account.is_empty() {
            return Err(CodecError::InvalidMessage(
                "config without master_account".to_string(),
            ));
        }
        let status = ConnectionStatus::try_from(msg.status).map_err(CodecError::InvalidMessage)?;
        let defaults = ReplicationConfig::default();

        Ok(ReplicationConfig {
            trade_group_id: if msg.trade_group_id.is_empty() {
                msg.master_account.clone()
            } else {
                msg.trade_group_id
            },
            master_account: msg.master_account,
            status,
            lot_calculation_mode: msg.lot_calculation_mode,
            lot_multiplier: msg
                .lot_multiplier
                .filter(|m| *m > Decimal::ZERO)
                .unwrap_or(defaults.lot_multiplier),
            master_equity: msg.master_equity,
            source_lot_min: msg.source_lot_min.unwrap_or(Decimal::ZERO),
            source_lot_max: msg.source_lot_max.unwrap_or(Decimal::ZERO),
            reverse_trade: msg.reverse_trade,
            symbol_prefix: msg.symbol_prefix.unwrap_or_default(),
            symbol_suffix: msg.symbol_suffix.unwrap_or_default(),
            symbol_mappings: msg.symbol_mappings,
            filters: msg.filters,
            sync_mode: msg.sync_mode,
            limit_order_expiry_min: msg.limit_order_expiry_min.unwrap_or(0),
            market_sync_max_pips: msg
                .market_sync_max_pips
                .unwrap_or(defaults.market_sync_max_pips),
            max_slippage: msg.max_slippage.unwrap_or(defaults.max_slippage),
            copy_pending_orders: msg.copy_pending_orders,
            max_retries: msg.max_retries,
            max_signal_delay_ms: msg.max_signal_delay_ms,
            use_pending_order_for_delayed: msg.use_pending_order_for_delayed,
            allow_new_orders: msg.allow_new_orders,
            config_version: msg.config_version,
            timestamp: msg.timestamp,
        })
    }
}

/// Ask a master for its full position set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequestMessage {
    pub slave_account: String,
    pub master_account: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

/// Periodic liveness report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub message_type: String,
    pub account_id: String,
    pub balance: Decimal,
    pub equity: Decimal,
    pub open_positions: usize,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub ea_type: String,
    pub platform: String,
    pub is_trade_allowed: bool,
}

/// Ask the relay to (re)send every config addressed to this slave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestConfigMessage {
    pub message_type: String,
    pub account_id: String,
    pub ea_type: String,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of handling one master signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReportMessage {
    pub slave_account: String,
    pub master_account: String,
    pub master_ticket: u64,
    pub action: String,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_ticket: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn open_message() -> TradeSignalMessage {
        TradeSignalMessage {
            action: TradeAction::Open,
            ticket: 500,
            symbol: Some("EURUSD".to_string()),
            order_type: Some(OrderType::Buy),
            lots: Some(dec!(1.0)),
            open_price: Some(dec!(1.1)),
            stop_loss: Some(Decimal::ZERO),
            take_profit: Some(dec!(1.12)),
            magic_number: Some(7),
            comment: None,
            timestamp: Utc::now(),
            source_account: "M1".to_string(),
            close_ratio: None,
        }
    }

    #[test]
    fn test_open_message_to_signal() {
        let signal = TradeSignal::try_from(open_message()).unwrap();
        let TradeSignal::Open(open) = signal else {
            panic!("expected open signal");
        };
        assert_eq!(open.ticket, 500);
        assert_eq!(open.stop_loss, None); // zero means unset
        assert_eq!(open.take_profit, Some(dec!(1.12)));
    }

    #[test]
    fn test_open_without_symbol_is_invalid() {
        let mut msg = open_message();
        msg.symbol = None;
        assert!(matches!(
            TradeSignal::try_from(msg),
            Err(CodecError::InvalidMessage(_))
        ));

        let mut msg = open_message();
        msg.lots = Some(Decimal::ZERO);
        assert!(TradeSignal::try_from(msg).is_err());
    }

    #[test]
    fn test_config_defaults_for_omitted_fields() {
        let json = r#"{
            "account_id": "S1",
            "master_account": "M1",
            "status": 2,
            "timestamp": "2025-01-01T00:00:00Z"
        }"#;
        let msg: SlaveConfigMessage = serde_json::from_str(json).unwrap();
        let config = ReplicationConfig::try_from(msg).unwrap();

        assert_eq!(config.status, ConnectionStatus::Connected);
        assert_eq!(config.trade_group_id, "M1");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_signal_delay_ms, 5000);
        assert!(config.allow_new_orders);
        assert_eq!(config.lot_multiplier, dec!(1.0));
        assert_eq!(config.sync_mode, SyncMode::Skip);
    }

    #[test]
    fn test_config_unknown_status_rejected() {
        let json = r#"{
            "account_id": "S1",
            "master_account": "M1",
            "status": 9,
            "timestamp": "2025-01-01T00:00:00Z"
        }"#;
        let msg: SlaveConfigMessage = serde_json::from_str(json).unwrap();
        assert!(ReplicationConfig::try_from(msg).is_err());
    }
}
