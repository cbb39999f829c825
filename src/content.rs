use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Author of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("Unknown role: {}", other)),
        }
    }
}

/// Body of a message, in the OpenAI chat shape.
///
/// `Text` serializes as a bare JSON string, `Composite` as an array of typed
/// parts. The same JSON is stored and sent over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Composite(Parts),
}

/// Non-empty ordered list of content parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ContentPart>", into = "Vec<ContentPart>")]
pub struct Parts(Vec<ContentPart>);

impl TryFrom<Vec<ContentPart>> for Parts {
    type Error = String;

    fn try_from(parts: Vec<ContentPart>) -> Result<Self, Self::Error> {
        if parts.is_empty() {
            return Err("composite content needs at least one part".to_string());
        }
        Ok(Parts(parts))
    }
}

impl From<Parts> for Vec<ContentPart> {
    fn from(parts: Parts) -> Self {
        parts.0
    }
}

impl Parts {
    pub fn as_slice(&self) -> &[ContentPart] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

/// Inline image reference. Only `data:` URLs are accepted so a stored message
/// stays replayable without the original file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawImageUrl")]
pub struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct RawImageUrl {
    url: String,
}

impl TryFrom<RawImageUrl> for ImageUrl {
    type Error = String;

    fn try_from(raw: RawImageUrl) -> Result<Self, Self::Error> {
        if !raw.url.starts_with("data:") {
            return Err("image part must carry an inline data URL".to_string());
        }
        Ok(ImageUrl { url: raw.url })
    }
}

impl ImageUrl {
    /// Caller guarantees `url` is a `data:` URL.
    pub(crate) fn inline(url: String) -> Self {
        debug_assert!(url.starts_with("data:"));
        ImageUrl { url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl MessageContent {
    /// Text part followed by one inline image.
    pub fn text_with_image(text: impl Into<String>, image: ImageUrl) -> Self {
        MessageContent::Composite(Parts(vec![
            ContentPart::Text { text: text.into() },
            ContentPart::ImageUrl { image_url: image },
        ]))
    }

    /// Builds composite content, `None` when `parts` is empty.
    pub fn composite(parts: Vec<ContentPart>) -> Option<Self> {
        Parts::try_from(parts).ok().map(MessageContent::Composite)
    }

    /// All text carried by the content, parts joined with newlines.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Composite(parts) => parts
                .as_slice()
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn images(&self) -> impl Iterator<Item = &ImageUrl> {
        let parts: &[ContentPart] = match self {
            MessageContent::Text(_) => &[],
            MessageContent::Composite(parts) => parts.as_slice(),
        };
        parts.iter().filter_map(|part| match part {
            ContentPart::ImageUrl { image_url } => Some(image_url),
            ContentPart::Text { .. } => None,
        })
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}
