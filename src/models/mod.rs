//! Domain models: order types, trade signals, snapshots and replication policy.

mod config;
mod order_type;
mod signal;

pub use config::{
    ConnectionStatus, LotCalculationMode, ReplicationConfig, SymbolMapping, SyncMode,
    TradeFilters,
};
pub use order_type::OrderType;
pub use signal::{CloseSignal, ModifySignal, OpenSignal, PositionInfo, PositionSnapshot, TradeSignal};
