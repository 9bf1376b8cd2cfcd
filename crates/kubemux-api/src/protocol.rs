//! Wire protocol spoken over a stream connection
//!
//! Every frame is one JSON object with a `type` tag. Clients send
//! [`ClientMessage`]s; the server answers with [`ServerMessage`]s. Field
//! names are camelCase.

use std::sync::Arc;

use kubemux_auth::AuthSnapshot;
use kubemux_common::{ClusterId, ErrorCode, Revision};
use kubemux_stream::{StreamError, Update};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Control message sent by a client
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Open a subscription; without `cluster` it is a broadcast to every cluster
    Subscribe {
        /// Echoed in the acknowledgement or error
        request_id: Option<String>,
        /// Target cluster
        cluster: Option<ClusterId>,
        /// Resource kind (plural, kind, or short name)
        kind: String,
        /// Raw scope, normalized server side
        #[serde(default)]
        scope: String,
    },
    /// Reopen a subscription after `from_revision`
    Resume {
        /// Echoed in the acknowledgement, reset, or error
        request_id: Option<String>,
        /// Target cluster
        cluster: ClusterId,
        /// Resource kind
        kind: String,
        /// Raw scope
        #[serde(default)]
        scope: String,
        /// Last revision the client holds
        from_revision: Revision,
        /// Epoch the revision was issued under; a revision is meaningless
        /// without it
        epoch: String,
    },
    /// Close a subscription
    Unsubscribe {
        /// Subscription to close
        subscription_id: String,
    },
    /// Restart auth recovery for a cluster
    RetryAuth {
        /// Target cluster
        cluster: ClusterId,
    },
}

impl ClientMessage {
    /// Parse one text frame
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Request id carried by the message, if any
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Subscribe { request_id, .. } | Self::Resume { request_id, .. } => {
                request_id.as_deref()
            }
            Self::Unsubscribe { .. } | Self::RetryAuth { .. } => None,
        }
    }
}

/// Message sent by the server
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// A subscription was opened
    Subscribed {
        /// Request this answers
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        /// Id tagging every later message of the subscription
        subscription_id: String,
        /// Cluster
        cluster: ClusterId,
        /// Canonical kind
        kind: String,
        /// Canonical scope
        scope: String,
        /// Manager epoch the revisions belong to
        epoch: String,
        /// Series revision at the time of subscribing
        revision: Revision,
        /// Delivery is suspended while the cluster recovers its credentials
        degraded: bool,
        /// Opened by a resume rather than a subscribe
        resumed: bool,
    },
    /// One revisioned change
    Update {
        /// Subscription
        subscription_id: String,
        /// Cluster
        cluster: ClusterId,
        /// Manager epoch
        epoch: String,
        /// Revision and payload
        #[serde(flatten)]
        update: Arc<Update>,
    },
    /// The client must discard its state and subscribe again
    Reset {
        /// Request this answers
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        /// Subscription that was cut off
        #[serde(skip_serializing_if = "Option::is_none")]
        subscription_id: Option<String>,
        /// Cluster
        cluster: ClusterId,
        /// Kind
        kind: String,
        /// Scope
        scope: String,
        /// Human-readable cause
        reason: String,
    },
    /// A request or subscription failed
    Error {
        /// Request this answers
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        /// Subscription that failed
        #[serde(skip_serializing_if = "Option::is_none")]
        subscription_id: Option<String>,
        /// Cluster
        #[serde(skip_serializing_if = "Option::is_none")]
        cluster: Option<ClusterId>,
        /// Machine-readable code
        code: ErrorCode,
        /// Human-readable message
        message: String,
    },
    /// A subscription was closed on request
    Unsubscribed {
        /// Subscription
        subscription_id: String,
    },
    /// Auth state of a cluster the connection subscribes to
    AuthState {
        /// Cluster
        cluster: ClusterId,
        /// State, reason, and recovery progress
        #[serde(flatten)]
        snapshot: AuthSnapshot,
    },
}

impl ServerMessage {
    /// Error message for a failed stream operation
    pub fn stream_error(
        request_id: Option<String>,
        subscription_id: Option<String>,
        cluster: Option<ClusterId>,
        err: &StreamError,
    ) -> Self {
        Self::Error {
            request_id,
            subscription_id,
            cluster,
            code: err.code(),
            message: err.to_string(),
        }
    }

    /// Encode as a text frame
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// Protocol framing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Inbound frame is not a valid control message
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Outbound message could not be serialized
    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Wire error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Malformed(_) => ErrorCode::InvalidRequest,
            Self::Encode(_) => ErrorCode::Internal,
        }
    }
}
