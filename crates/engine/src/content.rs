use serde::Deserialize;
use serde_json::Value;

use super::types::ImageGenerationRecord;

/// Flattened text shown in place of a structured image-generation result.
pub const DEFAULT_IMAGE_PLACEHOLDER: &str = "[image]";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedContent {
    pub content: String,
    pub image_generation: Option<ImageGenerationRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentSegment {
    #[serde(alias = "input_text", alias = "output_text")]
    Text {
        #[serde(default)]
        text: String,
    },
    ImageUrl {
        image_url: ImageUrlRef,
    },
    Image {
        url: String,
    },
    ImageGeneration(ImageGenerationRecord),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ImageUrlRef {
    Plain(String),
    Object { url: String },
}

impl ImageUrlRef {
    fn into_url(self) -> String {
        match self {
            Self::Plain(url) | Self::Object { url } => url,
        }
    }
}

/// Flattens a server content value (string, single segment or segment list) for display.
///
/// Segment order is preserved and nothing is inserted between segments. Shapes that are
/// not understood flatten to an empty string; this never fails.
pub fn normalize_content(raw: &Value, image_placeholder: &str) -> NormalizedContent {
    let mut normalized = NormalizedContent::default();

    match raw {
        Value::String(text) => normalized.content = text.clone(),
        Value::Array(segments) => {
            for segment in segments {
                let rendered =
                    render_segment(segment, image_placeholder, &mut normalized.image_generation);
                normalized.content.push_str(&rendered);
            }
        }
        Value::Object(_) => {
            normalized.content =
                render_segment(raw, image_placeholder, &mut normalized.image_generation);
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }

    normalized
}

fn render_segment(
    segment: &Value,
    image_placeholder: &str,
    image_generation: &mut Option<ImageGenerationRecord>,
) -> String {
    if let Value::String(text) = segment {
        return text.clone();
    }

    match ContentSegment::deserialize(segment) {
        Ok(ContentSegment::Text { text }) => text,
        Ok(ContentSegment::ImageUrl { image_url }) => image_url.into_url(),
        Ok(ContentSegment::Image { url }) => url,
        Ok(ContentSegment::ImageGeneration(record)) => {
            if image_generation.is_none() {
                *image_generation = Some(record);
            }
            image_placeholder.to_string()
        }
        Err(error) => {
            tracing::debug!(error = %error, "skipping unrecognized content segment");
            String::new()
        }
    }
}
