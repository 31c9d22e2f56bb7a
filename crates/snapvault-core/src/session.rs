use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::meta::SessionMeta;

/// An in-memory session: a set of captured windows plus user metadata.
///
/// This is the object the capture/annotation layers produce and consume;
/// the core only moves it through the codec and the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default = "default_session_version")]
    pub version: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub windows: Vec<SessionWindow>,
    #[serde(default)]
    pub metadata: SessionMeta,
}

fn default_session_version() -> String {
    "1.0".to_string()
}

impl Session {
    pub fn new(metadata: SessionMeta) -> Self {
        Self {
            version: default_session_version(),
            created_at: Utc::now(),
            windows: Vec::new(),
            metadata,
        }
    }
}

/// One captured window: geometry, zoom, the PNG payload, and its draw
/// history (annotation strokes, kept opaque to the core).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionWindow {
    #[serde(default)]
    pub geometry: WindowGeometry,
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// PNG bytes, carried as base64 in the session JSON. `None` when the
    /// payload has been externalized into the artifact's `images/` entries.
    #[serde(default, with = "base64_png")]
    pub image_png: Option<Vec<u8>>,
    #[serde(default)]
    pub draw_history: Vec<serde_json::Value>,
}

fn default_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WindowGeometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Base64 transport for optional binary image payloads.
mod base64_png {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(s) => STANDARD
                .decode(s.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Build the immutable session filename: `YYYYMMDDhhmmss_<slug>.fastshot`.
///
/// The slug comes from the session name, falling back to the description,
/// falling back to "session"; it is sanitized to alphanumerics, `-`, `_`
/// and truncated to 30 characters.
pub fn generate_filename(name: &str, desc: &str, at: DateTime<Utc>) -> String {
    let source = if !name.trim().is_empty() { name } else { desc };
    let slug = sanitize_slug(source);
    let slug = if slug.is_empty() {
        "session".to_string()
    } else {
        slug
    };
    format!("{}_{slug}.fastshot", at.format("%Y%m%d%H%M%S"))
}

fn sanitize_slug(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .map(|c| if c == ' ' { '_' } else { c })
        .take(30)
        .collect()
}
