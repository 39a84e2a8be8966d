//! Chunk types for the runlet protocol.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// The originator of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Emitted on behalf of the language model.
    Assistant,
    /// Emitted by the execution environment.
    Computer,
}

/// The kind of information a chunk carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    /// Program output (stdout or stderr text).
    Console,
    /// The 1-based source line about to execute.
    ActiveLine,
    /// A request to approve execution before anything is spawned.
    Confirmation,
    /// A terminal error: user-code failure or environment failure.
    Error,
}

/// The payload of a confirmation chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    /// The code awaiting approval.
    pub code: String,
    /// The language the code would run in.
    pub language: String,
}

impl ConfirmationRequest {
    /// Create a new confirmation request.
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language: language.into(),
        }
    }
}

/// Chunk content: plain text for console/active_line/error chunks, a
/// structured request for confirmation chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChunkContent {
    /// Plain text content.
    Text(String),
    /// Structured confirmation content.
    Confirmation(ConfirmationRequest),
}

impl ChunkContent {
    /// The text content, if this is a text chunk.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ChunkContent::Text(text) => Some(text),
            ChunkContent::Confirmation(_) => None,
        }
    }

    /// The confirmation request, if this is a confirmation chunk.
    pub fn as_confirmation(&self) -> Option<&ConfirmationRequest> {
        match self {
            ChunkContent::Text(_) => None,
            ChunkContent::Confirmation(request) => Some(request),
        }
    }
}

impl From<&str> for ChunkContent {
    fn from(text: &str) -> Self {
        ChunkContent::Text(text.to_string())
    }
}

impl From<String> for ChunkContent {
    fn from(text: String) -> Self {
        ChunkContent::Text(text)
    }
}

/// One framed unit of the streaming execution protocol.
///
/// Serializes to the wire shape
/// `{ "role", "type", "content", "start"?, "end"? }`. The `start`/`end`
/// flags are omitted when unset; consumers detect execution boundaries by
/// these flags alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Who this chunk speaks for.
    pub role: Role,
    /// The kind of chunk.
    #[serde(rename = "type")]
    pub chunk_type: ChunkType,
    /// The chunk payload.
    pub content: ChunkContent,
    /// Set on the chunk that opens an execution's output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<bool>,
    /// Set on the chunk that closes an execution's output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<bool>,
}

impl Chunk {
    /// The chunk opening an execution's console output.
    pub fn console_start() -> Self {
        Self {
            role: Role::Computer,
            chunk_type: ChunkType::Console,
            content: ChunkContent::Text(String::new()),
            start: Some(true),
            end: None,
        }
    }

    /// A console content chunk.
    pub fn console(text: impl Into<String>) -> Self {
        Self {
            role: Role::Computer,
            chunk_type: ChunkType::Console,
            content: ChunkContent::Text(text.into()),
            start: None,
            end: None,
        }
    }

    /// The chunk closing an execution's console output.
    pub fn console_end() -> Self {
        Self {
            role: Role::Computer,
            chunk_type: ChunkType::Console,
            content: ChunkContent::Text(String::new()),
            start: None,
            end: Some(true),
        }
    }

    /// An active-line notice for the given 1-based source line.
    pub fn active_line(line: u32) -> Self {
        Self {
            role: Role::Computer,
            chunk_type: ChunkType::ActiveLine,
            content: ChunkContent::Text(line.to_string()),
            start: None,
            end: None,
        }
    }

    /// A confirmation request for the given language and code.
    pub fn confirmation(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            role: Role::Computer,
            chunk_type: ChunkType::Confirmation,
            content: ChunkContent::Confirmation(ConfirmationRequest::new(language, code)),
            start: None,
            end: None,
        }
    }

    /// A terminal error chunk with human-readable text.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            role: Role::Computer,
            chunk_type: ChunkType::Error,
            content: ChunkContent::Text(text.into()),
            start: None,
            end: None,
        }
    }

    /// Whether this chunk opens an execution.
    pub fn is_start(&self) -> bool {
        self.start == Some(true)
    }

    /// Whether this chunk closes an execution.
    pub fn is_end(&self) -> bool {
        self.end == Some(true)
    }

    /// Serialize to the wire shape.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from the wire shape.
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_wire_values() {
        assert_eq!(serde_json::to_value(Role::Assistant).unwrap(), "assistant");
        assert_eq!(serde_json::to_value(Role::Computer).unwrap(), "computer");
    }

    #[test]
    fn test_chunk_type_wire_values() {
        assert_eq!(
            serde_json::to_value(ChunkType::ActiveLine).unwrap(),
            "active_line"
        );
        assert_eq!(serde_json::to_value(ChunkType::Error).unwrap(), "error");
    }

    #[test]
    fn test_confirmation_wire_shape() {
        let chunk = Chunk::confirmation("shell", "ls -la");
        let value = serde_json::to_value(&chunk).unwrap();

        assert_eq!(value["type"], "confirmation");
        assert_eq!(value["content"]["code"], "ls -la");
        assert_eq!(value["content"]["language"], "shell");
    }

    #[test]
    fn test_untagged_content_deserialization() {
        let text: ChunkContent = serde_json::from_str(r#""plain""#).unwrap();
        assert_eq!(text.as_text(), Some("plain"));

        let structured: ChunkContent =
            serde_json::from_str(r#"{"code": "x = 1", "language": "python"}"#).unwrap();
        assert!(structured.as_confirmation().is_some());
    }
}
