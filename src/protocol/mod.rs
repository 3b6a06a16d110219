//! Wire protocol: topics, frames, message shapes and payload codec.

mod codec;
mod messages;
mod topics;

pub use codec::{Codec, CodecError, JsonCodec};
pub use messages::{
    ExecutionReportMessage, HeartbeatMessage, RequestConfigMessage, SyncRequestMessage,
};
pub use topics::{
    build_frame, classify, config_topic, report_topic, split_frame, sync_topic, trade_topic,
    TopicKind, GLOBAL_CONFIG_TOPIC, HEARTBEAT_TOPIC, REQUEST_CONFIG_TOPIC, SYNC_REQUEST_TOPIC,
};
