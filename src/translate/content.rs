//! Normalize public message content into the native text + images representation.
//!
//! Public content is either a bare string or an ordered list of typed parts.
//! Text parts are concatenated in order; image parts are decoded from their
//! inline base64 payload and appended, in order, to the native image list.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::native_types::{ImageData, NativeMessage};
use super::openai_types::{ChatMessage, ContentPart, MessageContent};
use crate::error::{Result, ShimError};

/// Native text and images extracted from one message's content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedContent {
    pub text: String,
    pub images: Vec<ImageData>,
}

/// Canonicalize a message's content field. Pure.
pub fn normalize(content: &MessageContent) -> Result<NormalizedContent> {
    match content {
        MessageContent::Text(text) => Ok(NormalizedContent {
            text: text.clone(),
            images: Vec::new(),
        }),
        MessageContent::Parts(parts) => {
            let mut normalized = NormalizedContent::default();
            for part in parts {
                match part {
                    ContentPart::Text { text } => normalized.text.push_str(text),
                    ContentPart::ImageUrl { image_url } => {
                        normalized.images.push(decode_image(image_url.url())?);
                    }
                    ContentPart::Unsupported => {
                        return Err(ShimError::malformed_content(
                            "content part must be of type \"text\" or \"image_url\"",
                        ));
                    }
                }
            }
            Ok(normalized)
        }
    }
}

/// Translate one public chat message into its native form.
pub fn to_native_message(msg: &ChatMessage) -> Result<NativeMessage> {
    let NormalizedContent { text, images } = normalize(&msg.content)?;
    Ok(NativeMessage {
        role: msg.role.as_str().to_string(),
        content: text,
        images,
    })
}

/// Decode an inline image reference.
///
/// Accepts `data:<media-type>;base64,<payload>` URIs and bare base64 payloads.
/// ASCII whitespace inside the payload is ignored.
pub fn decode_image(url: &str) -> Result<ImageData> {
    let trimmed = url.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Err(ShimError::malformed_content(
            "remote image URLs are not supported; send the image inline as a base64 data URI",
        ));
    }

    let payload = match trimmed.strip_prefix("data:") {
        Some(rest) => {
            let (header, payload) = rest.split_once(',').ok_or_else(|| {
                ShimError::malformed_content("image data URI is missing its ',' separator")
            })?;
            if !header.ends_with(";base64") {
                return Err(ShimError::malformed_content(
                    "image data URI must use base64 encoding",
                ));
            }
            payload
        }
        None => trimmed,
    };

    let compact: Vec<u8> = payload
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if compact.is_empty() {
        return Err(ShimError::malformed_content("image payload is empty"));
    }

    STANDARD
        .decode(&compact)
        .map(ImageData)
        .map_err(|e| ShimError::malformed_content(format!("invalid base64 image payload: {e}")))
}
