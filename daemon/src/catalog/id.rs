use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a library video.
///
/// Ids double as cache file stems, so only ASCII alphanumerics, `-` and `_`
/// are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VideoId(String);

impl VideoId {
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= 128
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then_some(Self(id))
    }

    /// Extract the id embedded in a remote reference, if it has a known shape.
    ///
    /// Handles `watch?v=<id>`, `youtu.be/<id>`, `/shorts/<id>`, `/embed/<id>`
    /// and `/live/<id>`. Anything else returns `None` and the id reported by
    /// the fetch tool while probing is used instead.
    pub fn from_reference(reference: &str) -> Option<Self> {
        let reference = reference.trim();
        let without_scheme = reference
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(reference);
        let (host, rest) = without_scheme
            .split_once('/')
            .unwrap_or((without_scheme, ""));
        let host = host.trim_start_matches("www.").trim_start_matches("m.");

        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
        let path = path.split('#').next().unwrap_or_default();

        if host == "youtu.be" {
            return path.split('/').next().and_then(Self::new);
        }

        if !host.ends_with("youtube.com") && !host.ends_with("youtube-nocookie.com") {
            return None;
        }

        if path == "watch" {
            return query
                .split('#')
                .next()
                .unwrap_or_default()
                .split('&')
                .find_map(|pair| pair.strip_prefix("v="))
                .and_then(Self::new);
        }

        let mut segments = path.split('/');
        match segments.next() {
            Some("shorts" | "embed" | "live" | "v") => segments.next().and_then(Self::new),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for VideoId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value.clone()).ok_or_else(|| format!("invalid video id: {:?}", value))
    }
}

impl From<VideoId> for String {
    fn from(id: VideoId) -> Self {
        id.0
    }
}
