//! User message normalization
//!
//! A message arrives as plain text or as `{text, attachments}` and leaves as
//! two forms: the stream-json user turn written to the CLI, and a simplified
//! string for the transcript and the UI echo.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{Error, Result};

/// File attached to a user message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub name: Option<String>,
    pub media_type: String,
    /// Base64 payload, for images and PDFs
    #[serde(default)]
    pub data: Option<String>,
    /// Inline content, for text files
    #[serde(default)]
    pub text: Option<String>,
}

/// A user message as front-ends hand it over
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutgoingMessage {
    Text(String),
    Structured {
        text: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
    },
}

impl OutgoingMessage {
    /// Parse a message shape received over a loosely typed transport
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| Error::InvalidMessage(format!("Malformed message: {}", e)))
    }
}

impl From<&str> for OutgoingMessage {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for OutgoingMessage {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// Both forms of one user turn
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    /// Stream-json line for the CLI
    pub wire: Value,
    /// What the transcript and UI show
    pub display: String,
}

pub fn normalize(message: OutgoingMessage) -> Result<NormalizedMessage> {
    let (text, attachments) = match message {
        OutgoingMessage::Text(text) => (text, Vec::new()),
        OutgoingMessage::Structured { text, attachments } => (text, attachments),
    };

    if text.trim().is_empty() && attachments.is_empty() {
        return Err(Error::InvalidMessage("Message is empty".to_string()));
    }

    if attachments.is_empty() {
        return Ok(NormalizedMessage {
            wire: user_turn(Value::String(text.clone())),
            display: text,
        });
    }

    let mut blocks = Vec::with_capacity(attachments.len() + 1);
    let mut display = text.clone();

    for attachment in &attachments {
        blocks.push(attachment_block(attachment)?);
        let name = attachment.name.as_deref().unwrap_or(&attachment.media_type);
        if !display.is_empty() {
            display.push('\n');
        }
        display.push_str(&format!("[Attachment: {}]", name));
    }
    if !text.trim().is_empty() {
        blocks.push(json!({ "type": "text", "text": text }));
    }

    Ok(NormalizedMessage {
        wire: user_turn(Value::Array(blocks)),
        display,
    })
}

fn attachment_block(attachment: &Attachment) -> Result<Value> {
    let media_type = attachment.media_type.as_str();
    match (&attachment.data, &attachment.text) {
        (Some(data), _) if media_type.starts_with("image/") => Ok(json!({
            "type": "image",
            "source": { "type": "base64", "media_type": media_type, "data": data },
        })),
        (Some(data), _) if media_type == "application/pdf" => Ok(json!({
            "type": "document",
            "source": { "type": "base64", "media_type": media_type, "data": data },
        })),
        (_, Some(text)) => {
            let name = attachment.name.as_deref().unwrap_or("attachment");
            Ok(json!({
                "type": "text",
                "text": format!("<file name=\"{}\">\n{}\n</file>", name, text),
            }))
        }
        (Some(_), None) => Err(Error::InvalidMessage(format!(
            "Unsupported binary attachment type: {}",
            media_type
        ))),
        (None, None) => Err(Error::InvalidMessage(
            "Attachment has neither data nor text".to_string(),
        )),
    }
}

fn user_turn(content: Value) -> Value {
    json!({
        "type": "user",
        "message": { "role": "user", "content": content },
        "parent_tool_use_id": null,
    })
}
