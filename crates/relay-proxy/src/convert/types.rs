//! Anthropic Messages API types — the intermediate request shape every
//! transformer consumes.
//!
//! Deserialization is deliberately permissive: unknown content block types
//! are captured by a catch-all variant so a request never fails to parse on
//! new Anthropic block kinds, and the system prompt accepts both the plain
//! string and block-array forms.

use serde::{Deserialize, Serialize};

/// Deserialize `system` from either a plain string or an array of text blocks.
fn deserialize_system_prompt<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SystemPrompt {
        Text(String),
        Blocks(Vec<SystemBlock>),
    }

    #[derive(Deserialize)]
    struct SystemBlock {
        text: String,
    }

    let maybe: Option<SystemPrompt> = Option::deserialize(deserializer)?;
    Ok(maybe.map(|sp| match sp {
        SystemPrompt::Text(s) => s,
        SystemPrompt::Blocks(blocks) => blocks
            .into_iter()
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join("\n"),
    }))
}

/// Top-level body for `POST /v1/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<Message>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_system_prompt"
    )]
    pub system: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,

    #[serde(default)]
    pub stream: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
}

/// A single message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(flatten)]
    pub content: MessageContent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Message content — either a plain string or an array of content blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text { content: String },
    Blocks { content: Vec<ContentBlock> },
}

/// A single content block within a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<serde_json::Value>,
    },
    #[serde(rename = "image")]
    Image { source: ImageSource },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<ToolResultContent>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    /// Catch-all for block types this gateway does not translate
    /// (`thinking`, `server_tool_use`, `citations`, ...).
    #[serde(other)]
    Other,
}

/// Image source: `base64` carries `media_type` + `data`, `url` carries `url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Content of a `tool_result` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl ToolResultContent {
    /// Flatten to plain text for providers that take string tool output.
    pub fn to_text(&self) -> String {
        match self {
            ToolResultContent::Text(s) => s.clone(),
            ToolResultContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text, .. } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// A tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

/// Tool choice specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Named(NamedToolChoice),
    Simple(SimpleToolChoice),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleToolChoice {
    #[serde(rename = "type")]
    pub choice_type: ToolChoiceMode,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceMode {
    Auto,
    Any,
    None,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedToolChoice {
    #[serde(rename = "type")]
    pub choice_type: ToolChoiceMode,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_simple_message() {
        let json =
            r#"{"model":"test","max_tokens":100,"messages":[{"role":"user","content":"Hello"}]}"#;
        let req: MessagesRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.model, "test");
        assert_eq!(req.max_tokens, 100);
        assert_eq!(req.messages.len(), 1);
        assert!(!req.stream);
    }

    #[test]
    fn test_deserialize_system_string_and_blocks() {
        let json = r#"{"model":"test","max_tokens":100,"system":"Be helpful","messages":[{"role":"user","content":"Hi"}]}"#;
        let req: MessagesRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.system, Some("Be helpful".to_string()));

        let json = r#"{"model":"test","max_tokens":100,"system":[{"type":"text","text":"One"},{"type":"text","text":"Two"}],"messages":[{"role":"user","content":"Hi"}]}"#;
        let req: MessagesRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.system, Some("One\nTwo".to_string()));
    }

    #[test]
    fn test_deserialize_unknown_content_blocks() {
        let json = r#"{
            "model": "test",
            "max_tokens": 100,
            "messages": [{
                "role": "assistant",
                "content": [
                    {"type": "thinking", "thinking": "hmm"},
                    {"type": "text", "text": "answer"},
                    {"type": "citations", "citations": []}
                ]
            }]
        }"#;
        let req: MessagesRequest = serde_json::from_str(json).unwrap();
        match &req.messages[0].content {
            MessageContent::Blocks { content } => {
                assert_eq!(content.len(), 3);
                assert!(matches!(&content[0], ContentBlock::Other));
                assert!(matches!(&content[1], ContentBlock::Text { .. }));
                assert!(matches!(&content[2], ContentBlock::Other));
            }
            _ => panic!("expected blocks content"),
        }
    }

    #[test]
    fn test_deserialize_image_sources() {
        let json = r#"{
            "model": "test",
            "max_tokens": 100,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "abc123"}},
                    {"type": "image", "source": {"type": "url", "url": "https://example.com/cat.png"}}
                ]
            }]
        }"#;
        let req: MessagesRequest = serde_json::from_str(json).unwrap();
        match &req.messages[0].content {
            MessageContent::Blocks { content } => {
                match &content[0] {
                    ContentBlock::Image { source } => {
                        assert_eq!(source.source_type, "base64");
                        assert_eq!(source.media_type.as_deref(), Some("image/png"));
                        assert_eq!(source.data.as_deref(), Some("abc123"));
                    }
                    _ => panic!("expected image block"),
                }
                match &content[1] {
                    ContentBlock::Image { source } => {
                        assert_eq!(source.source_type, "url");
                        assert_eq!(source.url.as_deref(), Some("https://example.com/cat.png"));
                    }
                    _ => panic!("expected image block"),
                }
            }
            _ => panic!("expected blocks content"),
        }
    }

    #[test]
    fn test_tool_result_content_to_text() {
        let text = ToolResultContent::Text("plain".into());
        assert_eq!(text.to_text(), "plain");

        let blocks = ToolResultContent::Blocks(vec![
            ContentBlock::Text {
                text: "a".into(),
                cache_control: None,
            },
            ContentBlock::Other,
            ContentBlock::Text {
                text: "b".into(),
                cache_control: None,
            },
        ]);
        assert_eq!(blocks.to_text(), "a\nb");
    }

    #[test]
    fn test_deserialize_tool_choice() {
        let json = r#"{"model":"t","max_tokens":1,"messages":[],"tool_choice":{"type":"auto"}}"#;
        let req: MessagesRequest = serde_json::from_str(json).unwrap();
        assert!(matches!(
            req.tool_choice,
            Some(ToolChoice::Simple(SimpleToolChoice {
                choice_type: ToolChoiceMode::Auto
            }))
        ));

        let json =
            r#"{"model":"t","max_tokens":1,"messages":[],"tool_choice":{"type":"tool","name":"search"}}"#;
        let req: MessagesRequest = serde_json::from_str(json).unwrap();
        match req.tool_choice {
            Some(ToolChoice::Named(n)) => assert_eq!(n.name, "search"),
            other => panic!("expected named tool choice, got {other:?}"),
        }
    }
}
