//! Active replication policy per linked master.
//!
//! Configs are replaced wholesale on every update. The store also owns the
//! trade/sync subscriptions for each master so they track the config's
//! lifecycle.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::models::{ConnectionStatus, ReplicationConfig};
use crate::protocol::{sync_topic, trade_topic};
use crate::transport::Transport;

/// What an applied config changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigChange {
    /// First config for this master
    Added { subscribed: bool, connected: bool },
    Updated {
        /// Topics changed and were re-subscribed
        resubscribed: bool,
        /// Status moved into `Connected`
        became_connected: bool,
    },
    /// Link torn down; entry dropped
    Removed,
    /// Removal for a master that was never configured
    Unknown,
}

impl ConfigChange {
    /// Whether the master just became reachable and a snapshot sync may be due.
    pub fn is_newly_connected(&self) -> bool {
        matches!(
            self,
            Self::Added {
                connected: true,
                ..
            } | Self::Updated {
                became_connected: true,
                ..
            }
        )
    }
}

#[derive(Debug, Clone)]
struct ConfigEntry {
    config: ReplicationConfig,
    trade_topic: String,
    sync_topic: String,
}

/// Per-master configs for one slave account.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    slave_account: String,
    entries: HashMap<String, ConfigEntry>,
}

impl ConfigStore {
    pub fn new(slave_account: impl Into<String>) -> Self {
        Self {
            slave_account: slave_account.into(),
            entries: HashMap::new(),
        }
    }

    pub fn slave_account(&self) -> &str {
        &self.slave_account
    }

    /// Upsert or remove the config for `config.master_account`.
    ///
    /// Subscription failures are logged; the config is stored regardless.
    pub fn apply<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        config: ReplicationConfig,
    ) -> ConfigChange {
        let master = config.master_account.clone();

        if config.status == ConnectionStatus::NoConfig {
            return match self.entries.remove(&master) {
                Some(entry) => {
                    self.release(transport, &entry.trade_topic, &master);
                    self.release(transport, &entry.sync_topic, &master);
                    info!(master = %master, "Master config removed");
                    ConfigChange::Removed
                }
                None => ConfigChange::Unknown,
            };
        }

        let trade = trade_topic(config.topic_account(), &self.slave_account);
        let sync = sync_topic(config.topic_account(), &self.slave_account);

        let change = match self.entries.get(&master) {
            None => {
                let subscribed =
                    Self::subscribe(transport, &trade) & Self::subscribe(transport, &sync);
                info!(
                    master = %master,
                    status = %config.status,
                    version = config.config_version,
                    topic = %trade,
                    "Master config added"
                );
                ConfigChange::Added {
                    subscribed,
                    connected: config.status == ConnectionStatus::Connected,
                }
            }
            Some(existing) => {
                if config.config_version < existing.config.config_version {
                    warn!(
                        master = %master,
                        stored = existing.config.config_version,
                        received = config.config_version,
                        "Config version went backwards, applying anyway"
                    );
                }

                let resubscribed = existing.trade_topic != trade;
                if resubscribed {
                    self.release(transport, &existing.trade_topic, &master);
                    self.release(transport, &existing.sync_topic, &master);
                    Self::subscribe(transport, &trade);
                    Self::subscribe(transport, &sync);
                }

                let became_connected = existing.config.status != ConnectionStatus::Connected
                    && config.status == ConnectionStatus::Connected;
                info!(
                    master = %master,
                    status = %config.status,
                    version = config.config_version,
                    resubscribed = resubscribed,
                    "Master config updated"
                );
                ConfigChange::Updated {
                    resubscribed,
                    became_connected,
                }
            }
        };

        self.entries.insert(
            master,
            ConfigEntry {
                config,
                trade_topic: trade,
                sync_topic: sync,
            },
        );
        change
    }

    pub fn get(&self, master_account: &str) -> Option<&ReplicationConfig> {
        self.entries.get(master_account).map(|e| &e.config)
    }

    /// Config whose trade or sync topic is `topic`.
    pub fn find_by_topic(&self, topic: &str) -> Option<&ReplicationConfig> {
        self.entries
            .values()
            .find(|e| e.trade_topic == topic || e.sync_topic == topic)
            .map(|e| &e.config)
    }

    /// Configured masters, sorted.
    pub fn masters(&self) -> Vec<&str> {
        let mut masters: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        masters.sort_unstable();
        masters
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn subscribe<T: Transport + ?Sized>(transport: &mut T, topic: &str) -> bool {
        match transport.subscribe(topic) {
            Ok(()) => true,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Subscribe failed, config kept");
                false
            }
        }
    }

    /// Unsubscribe `topic` unless another master in the same group still uses it.
    fn release<T: Transport + ?Sized>(&self, transport: &mut T, topic: &str, master: &str) {
        let shared = self
            .entries
            .iter()
            .any(|(m, e)| m != master && (e.trade_topic == topic || e.sync_topic == topic));
        if shared {
            debug!(topic = %topic, master = %master, "Topic still used by group, kept");
            return;
        }
        if let Err(e) = transport.unsubscribe(topic) {
            warn!(topic = %topic, error = %e, "Unsubscribe failed");
        }
    }
}
