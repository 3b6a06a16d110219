//! Snapshot sync on (re)connection to a master.
//!
//! `Idle -> AwaitingSnapshot -> Reconciling -> Idle`, tracked per master.
//! Convergence is additive: positions missing locally are opened under the
//! master's sync mode, local positions absent from the snapshot are left alone.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::models::{PositionSnapshot, ReplicationConfig, SyncMode};
use crate::protocol::{Codec, SyncRequestMessage, SYNC_REQUEST_TOPIC};
use crate::transport::Transport;

use super::executor::{ExecutionEngine, SignalOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    AwaitingSnapshot { requested_at: DateTime<Utc> },
    Reconciling,
}

/// Counts from one reconciled snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub master_account: String,
    pub received: usize,
    pub already_mapped: usize,
    pub opened: usize,
    pub pending_placed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} positions, {} mapped, {} opened, {} pending, {} skipped, {} failed",
            self.master_account,
            self.received,
            self.already_mapped,
            self.opened,
            self.pending_placed,
            self.skipped,
            self.failed
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct MasterSync {
    state: SyncState,
    last_sync: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SnapshotReconciler {
    slave_account: String,
    masters: HashMap<String, MasterSync>,
}

impl SnapshotReconciler {
    pub fn new(slave_account: impl Into<String>) -> Self {
        Self {
            slave_account: slave_account.into(),
            masters: HashMap::new(),
        }
    }

    pub fn state(&self, master_account: &str) -> SyncState {
        self.masters
            .get(master_account)
            .map(|m| m.state)
            .unwrap_or(SyncState::Idle)
    }

    /// Publish a sync request and wait for the master's snapshot.
    ///
    /// Requests go out on the relay route, never on the subscribed snapshot
    /// topic, so a slave does not receive its own request back.
    ///
    /// Returns `false` when the master's sync mode is `Skip` or the request
    /// could not be sent.
    pub fn request_sync<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        codec: &dyn Codec,
        config: &ReplicationConfig,
    ) -> bool {
        if config.sync_mode == SyncMode::Skip {
            debug!(master = %config.master_account, "Sync mode is skip, no snapshot requested");
            return false;
        }

        let master = config.master_account.clone();
        let now = Utc::now();
        let last_sync = self.masters.get(&master).and_then(|m| m.last_sync);
        let request = SyncRequestMessage {
            slave_account: self.slave_account.clone(),
            master_account: master.clone(),
            last_sync_time: last_sync,
            timestamp: now,
        };

        let sent = codec
            .encode_sync_request(&request)
            .map_err(|e| e.to_string())
            .and_then(|payload| {
                transport
                    .publish(SYNC_REQUEST_TOPIC, &payload)
                    .map_err(|e| e.to_string())
            });
        if let Err(e) = sent {
            warn!(master = %master, error = %e, "Sync request not sent");
            return false;
        }

        info!(master = %master, mode = ?config.sync_mode, "Snapshot requested");
        self.masters.insert(
            master,
            MasterSync {
                state: SyncState::AwaitingSnapshot { requested_at: now },
                last_sync,
            },
        );
        true
    }

    /// Reconcile a snapshot from a master we are waiting on.
    ///
    /// Unsolicited snapshots are ignored and return `None`.
    pub async fn on_snapshot<B: Broker>(
        &mut self,
        engine: &mut ExecutionEngine<B>,
        snapshot: &PositionSnapshot,
        config: &ReplicationConfig,
    ) -> Option<ReconcileReport> {
        let master = config.master_account.as_str();
        let Some(entry) = self.masters.get_mut(master) else {
            debug!(master = %master, "Unsolicited snapshot ignored");
            return None;
        };
        if !matches!(entry.state, SyncState::AwaitingSnapshot { .. }) {
            debug!(master = %master, state = ?entry.state, "Snapshot not expected, ignored");
            return None;
        }
        entry.state = SyncState::Reconciling;

        let mut report = ReconcileReport {
            master_account: master.to_string(),
            received: snapshot.positions.len(),
            ..ReconcileReport::default()
        };

        for position in &snapshot.positions {
            if engine.is_mapped(position.ticket) {
                report.already_mapped += 1;
                continue;
            }

            match engine.sync_position(position, config).await {
                SignalOutcome::Opened { .. } => report.opened += 1,
                SignalOutcome::PendingPlaced { .. } => report.pending_placed += 1,
                SignalOutcome::Duplicate => report.already_mapped += 1,
                SignalOutcome::Failed(_) => report.failed += 1,
                _ => report.skipped += 1,
            }
        }

        if let Some(entry) = self.masters.get_mut(master) {
            entry.state = SyncState::Idle;
            entry.last_sync = Some(snapshot.timestamp);
        }
        info!(report = %report, "Snapshot reconciled");
        Some(report)
    }

    /// Drop state for a master whose link was removed.
    pub fn forget(&mut self, master_account: &str) {
        self.masters.remove(master_account);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{FillReporting, PaperBroker};
    use crate::engine::SignalEvaluator;
    use crate::models::{ConnectionStatus, OrderType, PositionInfo};
    use crate::protocol::JsonCodec;
    use crate::transport::MemoryTransport;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn config(sync_mode: SyncMode) -> ReplicationConfig {
        ReplicationConfig {
            status: ConnectionStatus::Connected,
            sync_mode,
            market_sync_max_pips: dec!(5),
            ..ReplicationConfig::new("M1")
        }
    }

    fn engine() -> ExecutionEngine<PaperBroker> {
        let mut broker = PaperBroker::new(FillReporting::Polling);
        broker.set_quote_at("EURUSD", dec!(1.10090), dec!(1.10100), now());
        ExecutionEngine::new(broker, std::time::Duration::ZERO)
            .with_evaluator(SignalEvaluator::with_reference_time(now()))
    }

    fn position(ticket: u64, order_type: OrderType, open_price: Decimal) -> PositionInfo {
        PositionInfo {
            ticket,
            symbol: "EURUSD".to_string(),
            order_type,
            lots: dec!(0.5),
            open_price,
            open_time: now(),
            stop_loss: None,
            take_profit: None,
            magic_number: None,
            comment: None,
        }
    }

    fn snapshot(positions: Vec<PositionInfo>) -> PositionSnapshot {
        PositionSnapshot {
            source_account: "M1".to_string(),
            positions,
            timestamp: now(),
        }
    }

    fn requested(reconciler: &mut SnapshotReconciler, config: &ReplicationConfig) -> MemoryTransport {
        let (mut transport, _bus) = MemoryTransport::new();
        assert!(reconciler.request_sync(&mut transport, &JsonCodec, config));
        transport
    }

    #[test]
    fn test_request_publishes_on_request_route() {
        let mut reconciler = SnapshotReconciler::new("S1");
        let transport = requested(&mut reconciler, &config(SyncMode::LimitOrder));

        assert!(transport.published_on("sync/M1/S1").next().is_none());
        let payloads: Vec<&[u8]> = transport.published_on(SYNC_REQUEST_TOPIC).collect();
        assert_eq!(payloads.len(), 1);
        let value: serde_json::Value = serde_json::from_slice(payloads[0]).unwrap();
        assert_eq!(value["slave_account"], "S1");
        assert_eq!(value["master_account"], "M1");
        assert!(matches!(
            reconciler.state("M1"),
            SyncState::AwaitingSnapshot { .. }
        ));
    }

    #[test]
    fn test_skip_mode_requests_nothing() {
        let mut reconciler = SnapshotReconciler::new("S1");
        let (mut transport, _bus) = MemoryTransport::new();

        let sent = reconciler.request_sync(&mut transport, &JsonCodec, &config(SyncMode::Skip));

        assert!(!sent);
        assert!(transport.published().is_empty());
        assert_eq!(reconciler.state("M1"), SyncState::Idle);
    }

    #[tokio::test]
    async fn test_market_sync_deviation_guard() {
        let mut reconciler = SnapshotReconciler::new("S1");
        let config = config(SyncMode::MarketOrder);
        let _transport = requested(&mut reconciler, &config);
        let mut engine = engine();

        // 10 pips away from the ask with a 5 pip limit
        let report = reconciler
            .on_snapshot(&mut engine, &snapshot(vec![position(7, OrderType::Buy, dec!(1.10000))]), &config)
            .await
            .unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.opened, 0);
        assert_eq!(engine.broker().calls().total(), 0);
        assert!(!engine.is_mapped(7));
        assert_eq!(reconciler.state("M1"), SyncState::Idle);
    }

    #[tokio::test]
    async fn test_market_sync_opens_within_tolerance() {
        let mut reconciler = SnapshotReconciler::new("S1");
        let config = config(SyncMode::MarketOrder);
        let _transport = requested(&mut reconciler, &config);
        let mut engine = engine();

        let report = reconciler
            .on_snapshot(&mut engine, &snapshot(vec![position(7, OrderType::Buy, dec!(1.10080))]), &config)
            .await
            .unwrap();

        assert_eq!(report.opened, 1);
        assert!(engine.mapper().get_local(7).is_some());
    }

    #[tokio::test]
    async fn test_limit_sync_places_pending_and_skips_mapped() {
        let mut reconciler = SnapshotReconciler::new("S1");
        let config = ReplicationConfig {
            limit_order_expiry_min: 60,
            ..config(SyncMode::LimitOrder)
        };
        let _transport = requested(&mut reconciler, &config);
        let mut engine = engine();
        engine.mapper_mut().add_mapping(8, 4242).unwrap();

        let report = reconciler
            .on_snapshot(
                &mut engine,
                &snapshot(vec![
                    position(7, OrderType::Sell, dec!(1.10500)),
                    position(8, OrderType::Buy, dec!(1.10000)),
                ]),
                &config,
            )
            .await
            .unwrap();

        assert_eq!(report.pending_placed, 1);
        assert_eq!(report.already_mapped, 1);
        let pending = engine.mapper().get_pending(7).unwrap();
        let orders = engine.broker().pending_orders().await.unwrap();
        let order = orders.iter().find(|o| o.ticket == pending).unwrap();
        assert_eq!(order.order_type, OrderType::SellLimit);
        assert_eq!(order.price, dec!(1.10500));
        assert_eq!(order.expiry, Some(now() + chrono::Duration::minutes(60)));
    }

    #[tokio::test]
    async fn test_unsolicited_snapshot_ignored() {
        let mut reconciler = SnapshotReconciler::new("S1");
        let config = config(SyncMode::MarketOrder);
        let mut engine = engine();

        let report = reconciler
            .on_snapshot(&mut engine, &snapshot(vec![position(7, OrderType::Buy, dec!(1.10100))]), &config)
            .await;

        assert!(report.is_none());
        assert_eq!(engine.broker().calls().total(), 0);
    }

    #[tokio::test]
    async fn test_additive_only() {
        let mut reconciler = SnapshotReconciler::new("S1");
        let config = config(SyncMode::MarketOrder);
        let _transport = requested(&mut reconciler, &config);
        let mut engine = engine();
        engine.mapper_mut().add_mapping(99, 5000).unwrap();

        let report = reconciler
            .on_snapshot(&mut engine, &snapshot(Vec::new()), &config)
            .await
            .unwrap();

        assert_eq!(report, ReconcileReport {
            master_account: "M1".to_string(),
            ..ReconcileReport::default()
        });
        assert_eq!(engine.mapper().get_local(99), Some(5000));
        assert_eq!(engine.broker().calls().total(), 0);
    }
}
