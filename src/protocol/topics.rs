//! Topic naming and frame layout on the message bus.
//!
//! A frame is `topic + ' ' + payload`; topics therefore never contain a space.

use thiserror::Error;

pub const GLOBAL_CONFIG_TOPIC: &str = "config/global";
pub const HEARTBEAT_TOPIC: &str = "heartbeat";
pub const REQUEST_CONFIG_TOPIC: &str = "request_config";
pub const SYNC_REQUEST_TOPIC: &str = "sync_request";

const FRAME_SEPARATOR: u8 = b' ';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("topic contains a space: {0:?}")]
    InvalidTopic(String),
    #[error("frame has no topic separator")]
    MissingSeparator,
    #[error("topic is not valid UTF-8")]
    InvalidEncoding,
}

/// Config for one slave account.
pub fn config_topic(account: &str) -> String {
    format!("config/{}", account)
}

/// Trade signals from a master to a specific slave.
pub fn trade_topic(master: &str, slave: &str) -> String {
    format!("trade/{}/{}", master, slave)
}

/// Position snapshots from a master to one slave.
pub fn sync_topic(master: &str, slave: &str) -> String {
    format!("sync/{}/{}", master, slave)
}

/// Execution outcomes published by a slave.
pub fn report_topic(slave: &str) -> String {
    format!("report/{}", slave)
}

/// What an inbound topic addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind<'a> {
    Config { account: &'a str },
    GlobalConfig,
    Trade { master: &'a str, slave: &'a str },
    Sync { master: &'a str, slave: &'a str },
    Other,
}

pub fn classify(topic: &str) -> TopicKind<'_> {
    if topic == GLOBAL_CONFIG_TOPIC {
        return TopicKind::GlobalConfig;
    }

    let mut parts = topic.splitn(3, '/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("config"), Some(account), None) if !account.is_empty() => {
            TopicKind::Config { account }
        }
        (Some("trade"), Some(master), Some(slave)) => TopicKind::Trade { master, slave },
        (Some("sync"), Some(master), Some(slave)) => TopicKind::Sync { master, slave },
        _ => TopicKind::Other,
    }
}

/// Join a topic and payload into one frame.
pub fn build_frame(topic: &str, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if topic.as_bytes().contains(&FRAME_SEPARATOR) {
        return Err(FrameError::InvalidTopic(topic.to_string()));
    }

    let mut frame = Vec::with_capacity(topic.len() + 1 + payload.len());
    frame.extend_from_slice(topic.as_bytes());
    frame.push(FRAME_SEPARATOR);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Split a frame at the first space.
pub fn split_frame(frame: &[u8]) -> Result<(&str, &[u8]), FrameError> {
    let pos = frame
        .iter()
        .position(|b| *b == FRAME_SEPARATOR)
        .ok_or(FrameError::MissingSeparator)?;
    let topic = std::str::from_utf8(&frame[..pos]).map_err(|_| FrameError::InvalidEncoding)?;
    Ok((topic, &frame[pos + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_depend_only_on_accounts() {
        assert_eq!(trade_topic("M1", "S1"), "trade/M1/S1");
        assert_eq!(sync_topic("M1", "S1"), "sync/M1/S1");
        assert_eq!(config_topic("S1"), "config/S1");
        assert_eq!(trade_topic("M1", "S1"), trade_topic("M1", "S1"));
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("config/global"), TopicKind::GlobalConfig);
        assert_eq!(classify("config/S1"), TopicKind::Config { account: "S1" });
        assert_eq!(
            classify("trade/M1/S1"),
            TopicKind::Trade { master: "M1", slave: "S1" }
        );
        assert_eq!(
            classify("sync/M1/S1"),
            TopicKind::Sync { master: "M1", slave: "S1" }
        );
        assert_eq!(classify("heartbeat"), TopicKind::Other);
        assert_eq!(classify("trade/M1"), TopicKind::Other);
    }

    #[test]
    fn test_frame_split_at_first_space() {
        let frame = build_frame("trade/M1/S1", b"{\"a\": 1}").unwrap();
        let (topic, payload) = split_frame(&frame).unwrap();
        assert_eq!(topic, "trade/M1/S1");
        assert_eq!(payload, b"{\"a\": 1}");
    }

    #[test]
    fn test_frame_rejects_space_in_topic() {
        assert_eq!(
            build_frame("bad topic", b"x"),
            Err(FrameError::InvalidTopic("bad topic".to_string()))
        );
        assert_eq!(split_frame(b"no-separator"), Err(FrameError::MissingSeparator));
    }
}
