use crate::content::ImageUrl;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::path::Path;

/// Default upper bound on a staged image, before base64 expansion.
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

/// An image staged for the next send, held as an inline data URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageAttachment {
    mime_type: String,
    data_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image is empty")]
    Empty,
    #[error("Image is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("Not a supported image (detected: {0})")]
    NotAnImage(String),
    #[error("Malformed data URL: {0}")]
    Decode(String),
}

impl ImageAttachment {
    /// Sniffs the image type from `bytes` and encodes them as a data URL.
    pub fn from_bytes(bytes: &[u8], max_bytes: usize) -> Result<Self, AttachmentError> {
        if bytes.is_empty() {
            return Err(AttachmentError::Empty);
        }
        if bytes.len() > max_bytes {
            return Err(AttachmentError::TooLarge {
                size: bytes.len(),
                limit: max_bytes,
            });
        }
        let kind = infer::get(bytes)
            .ok_or_else(|| AttachmentError::NotAnImage("unknown".to_string()))?;
        if kind.matcher_type() != infer::MatcherType::Image {
            return Err(AttachmentError::NotAnImage(kind.mime_type().to_string()));
        }

        let mime_type = kind.mime_type().to_string();
        let data_url = format!("data:{};base64,{}", mime_type, STANDARD.encode(bytes));
        Ok(Self {
            mime_type,
            data_url,
        })
    }

    pub async fn from_path(path: &Path, max_bytes: usize) -> Result<Self, AttachmentError> {
        let size = tokio::fs::metadata(path).await?.len() as usize;
        if size > max_bytes {
            return Err(AttachmentError::TooLarge {
                size,
                limit: max_bytes,
            });
        }
        let bytes = tokio::fs::read(path).await?;
        Self::from_bytes(&bytes, max_bytes)
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn data_url(&self) -> &str {
        &self.data_url
    }

    /// Raw image bytes carried by the data URL.
    pub fn decode(&self) -> Result<Vec<u8>, AttachmentError> {
        decode_data_url(&self.data_url)
    }

    pub fn to_image_url(&self) -> ImageUrl {
        ImageUrl::inline(self.data_url.clone())
    }
}

/// Decodes the payload of a base64 `data:` URL.
pub fn decode_data_url(url: &str) -> Result<Vec<u8>, AttachmentError> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| AttachmentError::Decode("missing data: scheme".to_string()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| AttachmentError::Decode("missing payload separator".to_string()))?;
    if !header.ends_with(";base64") {
        return Err(AttachmentError::Decode("payload is not base64".to_string()));
    }
    STANDARD
        .decode(payload)
        .map_err(|e| AttachmentError::Decode(e.to_string()))
}
