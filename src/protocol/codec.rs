//! Payload encoding.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::models::{PositionSnapshot, ReplicationConfig, TradeSignal};

use super::messages::{
    ExecutionReportMessage, HeartbeatMessage, RequestConfigMessage, SlaveConfigMessage,
    SyncRequestMessage, TradeSignalMessage,
};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Decode inbound payloads into domain types and encode outbound messages.
pub trait Codec: Send + Sync {
    fn decode_trade_signal(&self, payload: &[u8]) -> Result<TradeSignal, CodecError>;
    fn decode_slave_config(&self, payload: &[u8]) -> Result<ReplicationConfig, CodecError>;
    fn decode_position_snapshot(&self, payload: &[u8]) -> Result<PositionSnapshot, CodecError>;

    fn encode_sync_request(&self, msg: &SyncRequestMessage) -> Result<Vec<u8>, CodecError>;
    fn encode_heartbeat(&self, msg: &HeartbeatMessage) -> Result<Vec<u8>, CodecError>;
    fn encode_config_request(&self, msg: &RequestConfigMessage) -> Result<Vec<u8>, CodecError>;
    fn encode_execution_report(&self, msg: &ExecutionReportMessage)
        -> Result<Vec<u8>, CodecError>;
}

/// JSON payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(payload).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(e.to_string()))
    }
}

impl Codec for JsonCodec {
    fn decode_trade_signal(&self, payload: &[u8]) -> Result<TradeSignal, CodecError> {
        let msg: TradeSignalMessage = Self::decode(payload)?;
        TradeSignal::try_from(msg)
    }

    fn decode_slave_config(&self, payload: &[u8]) -> Result<ReplicationConfig, CodecError> {
        let msg: SlaveConfigMessage = Self::decode(payload)?;
        ReplicationConfig::try_from(msg)
    }

    fn decode_position_snapshot(&self, payload: &[u8]) -> Result<PositionSnapshot, CodecError> {
        let snapshot: PositionSnapshot = Self::decode(payload)?;
        if snapshot.source_account.is_empty() {
            return Err(CodecError::InvalidMessage(
                "snapshot without source_account".to_string(),
            ));
        }
        Ok(snapshot)
    }

    fn encode_sync_request(&self, msg: &SyncRequestMessage) -> Result<Vec<u8>, CodecError> {
        Self::encode(msg)
    }

    fn encode_heartbeat(&self, msg: &HeartbeatMessage) -> Result<Vec<u8>, CodecError> {
        Self::encode(msg)
    }

    fn encode_config_request(&self, msg: &RequestConfigMessage) -> Result<Vec<u8>, CodecError> {
        Self::encode(msg)
    }

    fn encode_execution_report(
        &self,
        msg: &ExecutionReportMessage,
    ) -> Result<Vec<u8>, CodecError> {
        Self::encode(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderType;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn test_decode_close_signal() {
        let payload = br#"{"action":"Close","ticket":500,"close_ratio":0.5,
            "timestamp":"2025-03-01T12:00:00Z","source_account":"M1"}"#;
        let signal = JsonCodec.decode_trade_signal(payload).unwrap();

        let TradeSignal::Close(close) = signal else {
            panic!("expected close");
        };
        assert_eq!(close.ticket, 500);
        assert_eq!(close.close_ratio, Some(dec!(0.5)));
        assert!(!close.is_full_close());
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        let err = JsonCodec.decode_trade_signal(b"\x93\x01\x02").unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn test_decode_snapshot() {
        let payload = br#"{"source_account":"M1","timestamp":"2025-03-01T12:00:00Z",
            "positions":[{"ticket":9,"symbol":"EURUSD","order_type":"Sell","lots":"0.2",
            "open_price":"1.1","open_time":"2025-03-01T11:00:00Z"}]}"#;
        let snapshot = JsonCodec.decode_position_snapshot(payload).unwrap();
        assert_eq!(snapshot.positions.len(), 1);
        assert_eq!(snapshot.positions[0].order_type, OrderType::Sell);
        assert_eq!(snapshot.positions[0].lots, dec!(0.2));
    }

    #[test]
    fn test_encode_sync_request() {
        let msg = SyncRequestMessage {
            slave_account: "S1".to_string(),
            master_account: "M1".to_string(),
            last_sync_time: None,
            timestamp: Utc::now(),
        };
        let bytes = JsonCodec.encode_sync_request(&msg).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["master_account"], "M1");
        assert!(value.get("last_sync_time").is_none());
    }
}
