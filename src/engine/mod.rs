//! Replication core: mapping, policy, execution, sync and recovery.

mod config_store;
mod evaluator;
mod executor;
mod fills;
mod pricing;
mod reconciler;
mod recovery;
mod sizing;
mod symbols;
mod ticket_mapper;

pub use config_store::{ConfigChange, ConfigStore};
pub use evaluator::SignalEvaluator;
pub use executor::{ExecutionEngine, ExecutionStats, SignalOutcome};
pub use reconciler::SnapshotReconciler;
pub use recovery::{RecoveryReport, RecoveryScanner};
pub use ticket_mapper::{parse_ticket_tag, TicketMapper};
