//! Session scripts for driving a paper replicator.
//!
//! One JSON object per line:
//! `{"step":"frame","topic":"trade/M1/S1","payload":{...}}`,
//! `{"step":"quote","symbol":"EURUSD","bid":"1.1","ask":"1.10002"}`,
//! `{"step":"wait","ms":250}`, `{"step":"tick","count":3}`.
//! Blank lines and lines starting with `#` are skipped.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::broker::PaperBroker;
use crate::replicator::Replicator;
use crate::transport::{MemoryBus, MemoryTransport};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ReplayStep {
    /// Inject one inbound frame
    Frame { topic: String, payload: Value },
    /// Move the paper market
    Quote {
        symbol: String,
        bid: Decimal,
        ask: Decimal,
    },
    Wait { ms: u64 },
    /// Run replicator ticks
    Tick {
        #[serde(default = "default_tick_count")]
        count: u32,
    },
}

fn default_tick_count() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub frames: usize,
    pub quotes: usize,
    pub ticks: usize,
}

/// Parse a script, reporting the failing line.
pub fn parse_script(text: &str) -> Result<Vec<ReplayStep>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid step on line {}", i + 1))
        })
        .collect()
}

/// Stamp the current time on object payloads that carry none.
pub fn stamp_payload(mut payload: Value) -> Value {
    if let Value::Object(map) = &mut payload {
        map.entry("timestamp")
            .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
    }
    payload
}

/// Run `steps` against a paper replicator fed through `bus`.
///
/// A trailing tick is always run so the last frames are processed.
pub async fn replay(
    replicator: &mut Replicator<PaperBroker, MemoryTransport>,
    bus: &MemoryBus,
    steps: &[ReplayStep],
) -> Result<ReplaySummary> {
    let mut summary = ReplaySummary::default();

    for step in steps {
        match step {
            ReplayStep::Frame { topic, payload } => {
                let payload = serde_json::to_vec(&stamp_payload(payload.clone()))?;
                bus.deliver(topic, &payload)
                    .with_context(|| format!("Failed to deliver frame on {}", topic))?;
                summary.frames += 1;
            }
            ReplayStep::Quote { symbol, bid, ask } => {
                replicator
                    .engine_mut()
                    .broker_mut()
                    .set_quote(symbol, *bid, *ask);
                summary.quotes += 1;
            }
            ReplayStep::Wait { ms } => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            ReplayStep::Tick { count } => {
                for _ in 0..*count {
                    replicator.tick().await?;
                    summary.ticks += 1;
                }
            }
        }
        debug!(step = ?step, "Replay step done");
    }

    replicator.tick().await?;
    summary.ticks += 1;
    Ok(summary)
}
