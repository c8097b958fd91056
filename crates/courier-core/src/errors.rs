use serde_json::{json, Map, Value};

use crate::envelope::Envelope;
use crate::ports::{CacheError, DirectoryError, PublishError};

pub const CHANNEL_LAYER_DISABLED_MESSAGE: &str =
    "Channel layer disabled, a pub/sub layer is required for broadcast";

/// Recoverable per-frame faults. Each one is reported to the originating
/// connection as an error envelope with a fixed wire name; none of them
/// closes the connection.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Action not exist")]
    ActionNotExist,

    #[error("Payload signature wrong: missing `{required}`")]
    PayloadSignatureWrong { required: String },

    #[error("Action signature wrong: unexpected `{unexpected}`")]
    ActionSignatureWrong { unexpected: String },

    #[error("Recipient not exist")]
    RecipientNotExist,

    #[error("You cannot be the recipient")]
    RecipientIsMe,

    #[error("{CHANNEL_LAYER_DISABLED_MESSAGE}")]
    ChannelLayerDisabled,

    #[error("{message}")]
    Custom { message: String },
}

impl ProtocolError {
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom {
            message: message.into(),
        }
    }

    /// Event name the error envelope is sent under.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::ActionNotExist => "error.action_not_exist",
            Self::PayloadSignatureWrong { .. } => "error.payload_signature_wrong",
            Self::ActionSignatureWrong { .. } => "error.action_signature_wrong",
            Self::RecipientNotExist => "error.recipient_not_exist",
            Self::RecipientIsMe => "error.recipient_is_me",
            Self::ChannelLayerDisabled => "error.channel_layer_disabled",
            Self::Custom { .. } => "error",
        }
    }

    /// Short classification string for logging/metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ActionNotExist => "action_not_exist",
            Self::PayloadSignatureWrong { .. } => "payload_signature_wrong",
            Self::ActionSignatureWrong { .. } => "action_signature_wrong",
            Self::RecipientNotExist => "recipient_not_exist",
            Self::RecipientIsMe => "recipient_is_me",
            Self::ChannelLayerDisabled => "channel_layer_disabled",
            Self::Custom { .. } => "custom",
        }
    }

    fn message(&self) -> String {
        match self {
            Self::PayloadSignatureWrong { .. } => "Payload signature wrong".into(),
            Self::ActionSignatureWrong { .. } => "Action signature wrong".into(),
            other => other.to_string(),
        }
    }

    pub fn payload(&self) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("message".into(), json!(self.message()));
        match self {
            Self::PayloadSignatureWrong { required } => {
                payload.insert("required".into(), json!(required));
            }
            Self::ActionSignatureWrong { unexpected } => {
                payload.insert("unexpected".into(), json!(unexpected));
            }
            _ => {}
        }
        payload
    }

    pub fn to_envelope(&self) -> Envelope {
        Envelope::new(self.wire_name(), self.payload())
    }
}

/// Unclassified faults. They are not turned into error envelopes; the
/// surrounding transport logs them and decides what to do with the
/// connection.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("payload decode failed for {event}: {source}")]
    Decode {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("hook fault in {event}: {message}")]
    Hook { event: String, message: String },

    /// A server-initiated broadcast failed its own signature check.
    #[error("broadcast of {event} refused: {source}")]
    Broadcast {
        event: String,
        #[source]
        source: ProtocolError,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
