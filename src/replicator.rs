//! Replicator: the slave-side engine context and its tick loop.
//!
//! Handles:
//! - Startup recovery of the ticket mapping and config request
//! - Draining inbound frames and routing them by topic
//! - Config updates, trade signals and position snapshots
//! - Pending-order fill detection
//! - Heartbeats and execution reports back to the relay

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::engine::{
    ConfigChange, ConfigStore, ExecutionEngine, ExecutionStats, RecoveryReport, SignalEvaluator,
    SignalOutcome, SnapshotReconciler,
};
use crate::metrics::LatencySummary;
use crate::models::{ReplicationConfig, TradeSignal};
use crate::protocol::{
    classify, config_topic, report_topic, Codec, ExecutionReportMessage, HeartbeatMessage,
    JsonCodec, RequestConfigMessage, TopicKind, GLOBAL_CONFIG_TOPIC, HEARTBEAT_TOPIC,
    REQUEST_CONFIG_TOPIC,
};
use crate::settings::EngineSettings;
use crate::transport::Transport;

const EA_TYPE: &str = "Slave";

/// Frame counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounters {
    pub received: u64,
    pub dropped: u64,
    pub configs: u64,
    pub signals: u64,
    pub snapshots: u64,
    pub reports: u64,
    pub heartbeats: u64,
}

/// Slave-side replication for one terminal.
pub struct Replicator<B: Broker, T: Transport> {
    settings: EngineSettings,
    engine: ExecutionEngine<B>,
    configs: ConfigStore,
    reconciler: SnapshotReconciler,
    transport: T,
    codec: Box<dyn Codec>,
    counters: FrameCounters,
    last_heartbeat: Option<Instant>,
    last_trade_allowed: Option<bool>,
    started_at: DateTime<Utc>,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
}

impl<B: Broker, T: Transport> Replicator<B, T> {
    pub fn new(settings: EngineSettings, broker: B, transport: T) -> Self {
        let engine = ExecutionEngine::new(broker, settings.retry_delay());
        Self {
            configs: ConfigStore::new(settings.account_id.clone()),
            reconciler: SnapshotReconciler::new(settings.account_id.clone()),
            settings,
            engine,
            transport,
            codec: Box::new(JsonCodec),
            counters: FrameCounters::default(),
            last_heartbeat: None,
            last_trade_allowed: None,
            started_at: Utc::now(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_codec(mut self, codec: Box<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_evaluator(mut self, evaluator: SignalEvaluator) -> Self {
        self.engine = self.engine.with_evaluator(evaluator);
        self
    }

    /// Get shutdown signal for external control.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn engine(&self) -> &ExecutionEngine<B> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ExecutionEngine<B> {
        &mut self.engine
    }

    pub fn configs(&self) -> &ConfigStore {
        &self.configs
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_broker(self) -> B {
        self.engine.into_broker()
    }

    /// Subscribe to config topics, recover the mapping and ask for configs.
    ///
    /// Must run before the first tick.
    pub async fn start(&mut self) -> Result<RecoveryReport> {
        let account = self.settings.account_id.clone();
        info!(account = %account, broker = self.engine.broker().name(), "Starting replicator");

        // 1. Config topics
        for topic in [config_topic(&account), GLOBAL_CONFIG_TOPIC.to_string()] {
            if let Err(e) = self.transport.subscribe(&topic) {
                warn!(topic = %topic, error = %e, "Config subscription failed");
            }
        }

        // 2. Mapping from the terminal's comment tags
        let report = self
            .engine
            .recover()
            .await
            .context("Failed to recover ticket mapping")?;
        info!(report = %report, "Recovery complete");

        // 3. Ask the relay for our configs
        self.request_config();
        self.last_trade_allowed = match self.engine.broker().account().await {
            Ok(account) => Some(account.trade_allowed),
            Err(e) => {
                warn!(error = %e, "Account not readable at startup");
                None
            }
        };

        self.started_at = Utc::now();
        Ok(report)
    }

    fn request_config(&mut self) {
        let request = RequestConfigMessage {
            message_type: "RequestConfig".to_string(),
            account_id: self.settings.account_id.clone(),
            ea_type: EA_TYPE.to_string(),
            timestamp: Utc::now(),
        };
        match self.codec.encode_config_request(&request) {
            Ok(payload) => {
                if let Err(e) = self.transport.publish(REQUEST_CONFIG_TOPIC, &payload) {
                    warn!(error = %e, "Config request not sent");
                }
            }
            Err(e) => error!(error = %e, "Failed to encode config request"),
        }
    }

    /// Main run loop, until Ctrl+C or the shutdown signal.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            tick_ms = self.settings.tick_interval_ms,
            max_messages = self.settings.max_messages_per_tick,
            "Starting replicator run loop"
        );

        let mut ticker = interval(self.settings.tick_interval());

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        while !self.shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;

            if let Err(e) = self.tick().await {
                error!(error = %e, "Error in replicator tick");
            }
        }

        info!("Replicator stopped");
        Ok(())
    }

    /// Single iteration: heartbeat, inbound frames, pending fills.
    ///
    /// Returns the number of frames processed.
    pub async fn tick(&mut self) -> Result<usize> {
        // 1. Heartbeat when due; a failed beat waits for the next interval
        if self.heartbeat_due() {
            if let Err(e) = self.send_heartbeat().await {
                warn!(error = %e, "Heartbeat not sent");
            }
            self.last_heartbeat = Some(Instant::now());
        }

        // 2. Inbound frames, bounded per tick
        let mut processed = 0;
        while processed < self.settings.max_messages_per_tick {
            let Some((topic, payload)) = self.transport.try_receive() else {
                break;
            };
            processed += 1;
            self.counters.received += 1;
            self.dispatch(&topic, &payload).await;
        }

        // 3. Pending orders that filled or went away
        self.engine.detect_fills().await;

        Ok(processed)
    }

    async fn dispatch(&mut self, topic: &str, payload: &[u8]) {
        match classify(topic) {
            TopicKind::Config { account } if account == self.settings.account_id => {
                self.on_config(payload)
            }
            TopicKind::GlobalConfig => {
                debug!("Global config ignored");
            }
            TopicKind::Trade { .. } => self.on_trade(topic, payload).await,
            TopicKind::Sync { .. } => self.on_snapshot(topic, payload).await,
            TopicKind::Config { .. } | TopicKind::Other => {
                self.counters.dropped += 1;
                debug!(topic = %topic, "Frame for unknown topic dropped");
            }
        }
    }

    fn on_config(&mut self, payload: &[u8]) {
        let config = match self.codec.decode_slave_config(payload) {
            Ok(config) => config,
            Err(e) => {
                self.counters.dropped += 1;
                error!(error = %e, "Malformed config dropped");
                return;
            }
        };
        self.counters.configs += 1;

        let master = config.master_account.clone();
        let change = self.configs.apply(&mut self.transport, config);
        match change {
            ConfigChange::Removed => self.reconciler.forget(&master),
            change if change.is_newly_connected() => {
                let Some(config) = self.configs.get(&master) else {
                    return;
                };
                self.reconciler
                    .request_sync(&mut self.transport, self.codec.as_ref(), config);
            }
            _ => {}
        }
    }

    async fn on_trade(&mut self, topic: &str, payload: &[u8]) {
        let Some(config) = self.configs.find_by_topic(topic).cloned() else {
            self.counters.dropped += 1;
            debug!(topic = %topic, "Signal for unconfigured master dropped");
            return;
        };

        let signal = match self.codec.decode_trade_signal(payload) {
            Ok(signal) => signal,
            Err(e) => {
                self.counters.dropped += 1;
                error!(topic = %topic, error = %e, "Malformed trade signal dropped");
                return;
            }
        };
        self.counters.signals += 1;

        let outcome = self.engine.handle_signal(&signal, &config).await;
        self.publish_report(&config, &signal, &outcome);
    }

    async fn on_snapshot(&mut self, topic: &str, payload: &[u8]) {
        let Some(config) = self.configs.find_by_topic(topic).cloned() else {
            self.counters.dropped += 1;
            debug!(topic = %topic, "Snapshot for unconfigured master dropped");
            return;
        };

        let snapshot = match self.codec.decode_position_snapshot(payload) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.counters.dropped += 1;
                error!(topic = %topic, error = %e, "Malformed snapshot dropped");
                return;
            }
        };
        self.counters.snapshots += 1;

        self.reconciler
            .on_snapshot(&mut self.engine, &snapshot, &config)
            .await;
    }

    fn publish_report(
        &mut self,
        config: &ReplicationConfig,
        signal: &TradeSignal,
        outcome: &SignalOutcome,
    ) {
        let report = ExecutionReportMessage {
            slave_account: self.settings.account_id.clone(),
            master_account: config.master_account.clone(),
            master_ticket: signal.ticket(),
            action: signal.action().to_string(),
            outcome: outcome.label().to_string(),
            local_ticket: outcome.local_ticket(),
            detail: outcome.detail(),
            timestamp: Utc::now(),
        };

        let topic = report_topic(&self.settings.account_id);
        let sent = self
            .codec
            .encode_execution_report(&report)
            .map_err(|e| e.to_string())
            .and_then(|payload| {
                self.transport
                    .publish(&topic, &payload)
                    .map_err(|e| e.to_string())
            });
        match sent {
            Ok(()) => self.counters.reports += 1,
            Err(e) => warn!(error = %e, "Execution report not sent"),
        }
    }

    fn heartbeat_due(&self) -> bool {
        self.last_heartbeat
            .map_or(true, |at| at.elapsed() >= self.settings.heartbeat_interval())
    }

    async fn send_heartbeat(&mut self) -> Result<()> {
        let broker = self.engine.broker();
        let account = broker.account().await.context("Failed to read account")?;
        let open_positions = broker
            .positions()
            .await
            .context("Failed to read positions")?
            .len();

        let heartbeat = HeartbeatMessage {
            message_type: "Heartbeat".to_string(),
            account_id: self.settings.account_id.clone(),
            balance: account.balance,
            equity: account.equity,
            open_positions,
            timestamp: Utc::now(),
            version: self.settings.version.clone(),
            ea_type: EA_TYPE.to_string(),
            platform: self.settings.platform.clone(),
            is_trade_allowed: account.trade_allowed,
        };

        let payload = self.codec.encode_heartbeat(&heartbeat)?;
        self.transport.publish(HEARTBEAT_TOPIC, &payload)?;
        self.counters.heartbeats += 1;

        // Ask again once trading is switched on
        if account.trade_allowed && self.last_trade_allowed == Some(false) {
            info!("Trading enabled, requesting config");
            self.request_config();
        }
        self.last_trade_allowed = Some(account.trade_allowed);
        Ok(())
    }

    pub fn stats(&self) -> ReplicatorStats {
        ReplicatorStats {
            account_id: self.settings.account_id.clone(),
            masters: self.configs.len(),
            confirmed_mappings: self.engine.mapper().active_len(),
            pending_mappings: self.engine.mapper().pending_len(),
            execution: self.engine.stats(),
            frames: self.counters,
            latency: self.engine.latency_summary(),
            started_at: self.started_at,
        }
    }
}

/// Replicator statistics.
#[derive(Debug, Clone)]
pub struct ReplicatorStats {
    pub account_id: String,
    pub masters: usize,
    pub confirmed_mappings: usize,
    pub pending_mappings: usize,
    pub execution: ExecutionStats,
    pub frames: FrameCounters,
    pub latency: LatencySummary,
    pub started_at: DateTime<Utc>,
}

impl fmt::Display for ReplicatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let e = &self.execution;
        writeln!(f, "=== Replicator Statistics ===")?;
        writeln!(f, "Account:         {}", self.account_id)?;
        writeln!(f, "Running Since:   {}", self.started_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(f, "Masters:         {}", self.masters)?;
        writeln!(f, "Mappings:        {} confirmed, {} pending",
            self.confirmed_mappings, self.pending_mappings)?;
        writeln!(f, "Frames:          {} received, {} dropped",
            self.frames.received, self.frames.dropped)?;
        writeln!(f, "Signals:         {} (Opened: {}, Deferred: {}, Rejected: {}, Failed: {})",
            self.frames.signals, e.opened, e.deferred, e.rejected, e.failed)?;
        writeln!(f, "Closes/Modifies: {} / {}", e.closed, e.modified)?;
        writeln!(f, "Pending Fills:   {} promoted, {} dropped", e.fills_promoted, e.pending_dropped)?;
        writeln!(f, "Broker Latency:  {}", self.latency)?;
        Ok(())
    }
}
