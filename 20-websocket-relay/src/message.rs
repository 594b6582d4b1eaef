use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Chat envelope exchanged over the wire and through the relay queues.
///
/// Encoded as one JSON object per Text frame:
/// `{"clientId": "...", "userName": "...", "ip": "...", "data": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub client_id: String,
    pub user_name: String,
    pub ip: String,
    pub data: String,
}

#[derive(Debug, Error)]
#[error("malformed chat message: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

impl ChatMessage {
    pub fn new(
        client_id: impl Into<String>,
        user_name: impl Into<String>,
        ip: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            user_name: user_name.into(),
            ip: ip.into(),
            data: data.into(),
        }
    }

    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> String {
        // A struct of plain strings always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Human-readable line used by console echo and the terminal client.
    pub fn render(&self) -> String {
        format!("[{}-{}]:{}", self.user_name, self.ip, self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_uses_camel_case_fields() {
        let message = ChatMessage::new("c-1", "alice", "10.0.0.2", "hi");
        let value: serde_json::Value =
            serde_json::from_str(&message.encode()).expect("valid json");

        assert_eq!(value["clientId"], "c-1");
        assert_eq!(value["userName"], "alice");
        assert_eq!(value["ip"], "10.0.0.2");
        assert_eq!(value["data"], "hi");
    }

    #[test]
    fn decodes_payload_from_peer() {
        let parsed = ChatMessage::decode(
            r#"{"clientId":"c-9","userName":"bob","ip":"127.0.0.1","data":"yo"}"#,
        )
        .expect("decode");

        assert_eq!(parsed, ChatMessage::new("c-9", "bob", "127.0.0.1", "yo"));
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(ChatMessage::decode("not json").is_err());
        assert!(ChatMessage::decode(r#"{"userName":"bob"}"#).is_err());
    }

    #[test]
    fn renders_sender_and_address() {
        let message = ChatMessage::new("c-1", "alice", "10.0.0.2", "hello");
        assert_eq!(message.render(), "[alice-10.0.0.2]:hello");
    }
}
