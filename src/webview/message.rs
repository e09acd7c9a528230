//! Host <-> render surface message format.
//!
//! Every message is a JSON object `{ "type": string, "data"?: any }`.
//!
//! # Reserved types
//!
//! - `ready`: sent once by the surface when its script has loaded.
//!   Unlocks outbound delivery for that session.

use serde::{Deserialize, Serialize};

/// Message exchanged with a render surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl SurfaceMessage {
    /// Inbound handshake type.
    pub const READY: &'static str = "ready";

    /// Create a message without data
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: None,
        }
    }

    /// Create a message carrying `data`
    pub fn with_data(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data: Some(data),
        }
    }

    /// The surface's handshake message
    pub fn ready() -> Self {
        Self::new(Self::READY)
    }

    pub fn is_ready_signal(&self) -> bool {
        self.kind == Self::READY
    }

    /// Serialize to a JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!(r#"{{"type":"{}"}}"#, self.kind))
    }

    /// Parse an inbound JSON string
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_omitted_when_absent() {
        assert_eq!(SurfaceMessage::ready().to_json(), r#"{"type":"ready"}"#);
    }

    #[test]
    fn test_parse_with_data() {
        let msg = SurfaceMessage::from_json(r#"{"type":"select","data":{"node":"a.ts"}}"#).unwrap();
        assert_eq!(msg.kind, "select");
        assert_eq!(msg.data.unwrap()["node"], "a.ts");
    }

    #[test]
    fn test_parse_rejects_missing_type() {
        assert!(SurfaceMessage::from_json(r#"{"data":{}}"#).is_err());
    }

    #[test]
    fn test_ready_signal() {
        assert!(SurfaceMessage::ready().is_ready_signal());
        assert!(!SurfaceMessage::new("Ready").is_ready_signal());
    }
}
