//! Units exchanged across the bridge and with peers.

use serde::{Deserialize, Serialize};

/// A frame plus the connection it belongs to, carried across the bridge queue
/// and the bus. The body is opaque to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeEnvelope {
    /// Complete frame bytes.
    pub body: Vec<u8>,
    /// Source or destination connection.
    pub connection_id: String,
}

impl BridgeEnvelope {
    /// Create an envelope.
    pub fn new(body: Vec<u8>, connection_id: impl Into<String>) -> Self {
        Self {
            body,
            connection_id: connection_id.into(),
        }
    }
}

/// Application-level request/response envelope carried in type-1 frames.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceData {
    /// Correlation id, echoed in the response.
    pub id: String,
    /// Resource path, with or without a leading `/`.
    pub invoke: String,
    /// Opaque payload, encoded per the resource's media type.
    #[serde(default)]
    pub data: Option<String>,
}

impl InterfaceData {
    /// Create an envelope.
    pub fn new(id: impl Into<String>, invoke: impl Into<String>, data: Option<String>) -> Self {
        Self {
            id: id.into(),
            invoke: invoke.into(),
            data,
        }
    }

    /// The path a response to `invoke` is addressed to.
    pub fn back_path(invoke: &str) -> String {
        if invoke.starts_with('/') {
            format!("/back{invoke}")
        } else {
            format!("/back/{invoke}")
        }
    }

    /// Build the response to this request, keeping the correlation id.
    pub fn reply(&self, data: Option<String>) -> Self {
        Self {
            id: self.id.clone(),
            invoke: Self::back_path(&self.invoke),
            data,
        }
    }
}
