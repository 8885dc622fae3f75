use serde::{Deserialize, Serialize};

/// One piece of message content. Order within a version is render order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    Image { url: String },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        Part::Image { url: url.into() }
    }

    /// The empty text part used as a placeholder while a reply is generated.
    pub fn placeholder() -> Self {
        Part::text("")
    }

    /// Whether this part would render as nothing at all.
    pub fn is_blank(&self) -> bool {
        match self {
            Part::Text { text } => text.is_empty(),
            Part::Image { .. } => false,
        }
    }
}

/// An incremental piece of streamed model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    Text(String),
    Image(String),
}

/// Apply a delta to a list of parts: text extends the trailing text part (or
/// opens a new one), images always open a new part.
pub(crate) fn apply_delta(parts: &mut Vec<Part>, delta: Delta) {
    match delta {
        Delta::Text(chunk) => match parts.last_mut() {
            Some(Part::Text { text }) => text.push_str(&chunk),
            _ => parts.push(Part::Text { text: chunk }),
        },
        Delta::Image(url) => {
            // A lone placeholder is replaced rather than left dangling in front
            // of the image.
            if matches!(parts.last(), Some(part) if part.is_blank()) {
                parts.pop();
            }
            parts.push(Part::Image { url });
        }
    }
}

/// Whether the parts carry any visible content.
pub fn has_content(parts: &[Part]) -> bool {
    parts.iter().any(|part| !part.is_blank())
}

/// Concatenated text of all text parts.
pub fn plain_text(parts: &[Part]) -> String {
    parts
        .iter()
        .filter_map(|part| match part {
            Part::Text { text } => Some(text.as_str()),
            Part::Image { .. } => None,
        })
        .collect()
}
