//! Per-master replication policy.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Link state between this slave and a master, as decided by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum ConnectionStatus {
    /// Link torn down server-side
    NoConfig,
    Disabled,
    /// Enabled but the master is offline
    Enabled,
    Connected,
}

impl ConnectionStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::NoConfig => -1,
            Self::Disabled => 0,
            Self::Enabled => 1,
            Self::Connected => 2,
        }
    }
}

impl TryFrom<i32> for ConnectionStatus {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            -1 => Ok(Self::NoConfig),
            0 => Ok(Self::Disabled),
            1 => Ok(Self::Enabled),
            2 => Ok(Self::Connected),
            other => Err(format!("unknown connection status code: {}", other)),
        }
    }
}

impl From<ConnectionStatus> for i32 {
    fn from(status: ConnectionStatus) -> Self {
        status.code()
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NoConfig => "no-config",
            Self::Disabled => "disabled",
            Self::Enabled => "enabled",
            Self::Connected => "connected",
        };
        f.write_str(label)
    }
}

/// How slave lots are derived from master lots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LotCalculationMode {
    /// master_lots * lot_multiplier
    #[default]
    Multiplier,
    /// master_lots * local_equity / master_equity
    MarginRatio,
}

/// How open master positions are adopted when the link (re)connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Skip,
    LimitOrder,
    MarketOrder,
}

/// Explicit source -> target symbol rename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolMapping {
    pub source_symbol: String,
    pub target_symbol: String,
}

/// Allow/block lists. An empty allow list admits everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeFilters {
    #[serde(default)]
    pub allowed_symbols: Vec<String>,
    #[serde(default)]
    pub blocked_symbols: Vec<String>,
    #[serde(default)]
    pub allowed_magic_numbers: Vec<i64>,
    #[serde(default)]
    pub blocked_magic_numbers: Vec<i64>,
}

impl TradeFilters {
    pub fn allows_symbol(&self, symbol: &str) -> bool {
        if self
            .blocked_symbols
            .iter()
            .any(|s| s.eq_ignore_ascii_case(symbol))
        {
            return false;
        }
        self.allowed_symbols.is_empty()
            || self
                .allowed_symbols
                .iter()
                .any(|s| s.eq_ignore_ascii_case(symbol))
    }

    /// Magic lists only apply to signals that carry a magic number.
    pub fn allows_magic(&self, magic: Option<i64>) -> bool {
        let Some(magic) = magic else {
            return true;
        };
        if self.blocked_magic_numbers.contains(&magic) {
            return false;
        }
        self.allowed_magic_numbers.is_empty() || self.allowed_magic_numbers.contains(&magic)
    }
}

/// Active replication policy for one master. Always replaced wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Master account this policy applies to
    pub master_account: String,

    /// Publishing group of the master; topics derive from it
    pub trade_group_id: String,

    pub status: ConnectionStatus,

    // Lot sizing
    pub lot_calculation_mode: LotCalculationMode,
    pub lot_multiplier: Decimal,
    /// Master equity for margin-ratio sizing
    pub master_equity: Option<Decimal>,
    /// Zero means unbounded
    pub source_lot_min: Decimal,
    /// Zero means unbounded
    pub source_lot_max: Decimal,

    // Transformation
    pub reverse_trade: bool,
    pub symbol_prefix: String,
    pub symbol_suffix: String,
    pub symbol_mappings: Vec<SymbolMapping>,
    pub filters: TradeFilters,

    // Sync policy
    pub sync_mode: SyncMode,
    /// Expiry of limit/deferred orders in minutes; zero is good-till-cancelled
    pub limit_order_expiry_min: u32,
    pub market_sync_max_pips: Decimal,

    // Execution policy
    /// Max slippage in points for market orders
    pub max_slippage: u32,
    pub copy_pending_orders: bool,
    pub max_retries: u32,
    /// Zero disables the staleness check
    pub max_signal_delay_ms: u64,
    pub use_pending_order_for_delayed: bool,
    pub allow_new_orders: bool,

    pub config_version: u32,
    pub timestamp: DateTime<Utc>,
}

impl ReplicationConfig {
    /// Policy with default execution settings for a master.
    pub fn new(master_account: impl Into<String>) -> Self {
        let master_account = master_account.into();
        Self {
            trade_group_id: master_account.clone(),
            master_account,
            ..Self::default()
        }
    }

    /// Account used to derive subscription topics.
    pub fn topic_account(&self) -> &str {
        if self.trade_group_id.is_empty() {
            &self.master_account
        } else {
            &self.trade_group_id
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            master_account: String::new(),
            trade_group_id: String::new(),
            status: ConnectionStatus::Enabled,
            lot_calculation_mode: LotCalculationMode::Multiplier,
            lot_multiplier: dec!(1.0),
            master_equity: None,
            source_lot_min: Decimal::ZERO,
            source_lot_max: Decimal::ZERO,
            reverse_trade: false,
            symbol_prefix: String::new(),
            symbol_suffix: String::new(),
            symbol_mappings: Vec::new(),
            filters: TradeFilters::default(),
            sync_mode: SyncMode::Skip,
            limit_order_expiry_min: 0,
            market_sync_max_pips: dec!(10),      // 10 pips
            max_slippage: 30,                    // 3 pips on 5-digit symbols
            copy_pending_orders: false,
            max_retries: 3,
            max_signal_delay_ms: 5000,           // 5 seconds
            use_pending_order_for_delayed: false,
            allow_new_orders: true,
            config_version: 0,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ConnectionStatus::try_from(-1).unwrap(), ConnectionStatus::NoConfig);
        assert_eq!(ConnectionStatus::try_from(2).unwrap(), ConnectionStatus::Connected);
        assert!(ConnectionStatus::try_from(7).is_err());
        assert_eq!(i32::from(ConnectionStatus::Disabled), 0);
    }

    #[test]
    fn test_symbol_filters() {
        let filters = TradeFilters {
            allowed_symbols: vec!["EURUSD".to_string(), "GBPUSD".to_string()],
            blocked_symbols: vec!["GBPUSD".to_string()],
            ..Default::default()
        };

        assert!(filters.allows_symbol("EURUSD"));
        assert!(filters.allows_symbol("eurusd"));
        assert!(!filters.allows_symbol("GBPUSD")); // blocked wins
        assert!(!filters.allows_symbol("USDJPY")); // not in allow list
        assert!(TradeFilters::default().allows_symbol("XAUUSD"));
    }

    #[test]
    fn test_magic_filters() {
        let filters = TradeFilters {
            allowed_magic_numbers: vec![100, 200],
            blocked_magic_numbers: vec![200],
            ..Default::default()
        };

        assert!(filters.allows_magic(Some(100)));
        assert!(!filters.allows_magic(Some(200)));
        assert!(!filters.allows_magic(Some(300)));
        assert!(filters.allows_magic(None));

        let block_only = TradeFilters {
            blocked_magic_numbers: vec![0],
            ..Default::default()
        };
        assert!(block_only.allows_magic(None));
        assert!(!block_only.allows_magic(Some(0)));
        assert!(block_only.allows_magic(Some(5)));
    }

    #[test]
    fn test_topic_account_falls_back_to_master() {
        let mut config = ReplicationConfig::new("MASTER_1");
        assert_eq!(config.topic_account(), "MASTER_1");

        config.trade_group_id = String::new();
        assert_eq!(config.topic_account(), "MASTER_1");

        config.trade_group_id = "GROUP_A".to_string();
        assert_eq!(config.topic_account(), "GROUP_A");
    }
}
