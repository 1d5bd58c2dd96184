//! Attachments travel inside the message text as a delimited block:
//!
//! ```text
//! ----------(<file name>)><media kind>]
//! <url>
//! ==========
//! ```
//!
//! The media kind is the MIME top-level type of the uploaded file.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

const BLOCK_OPEN: &str = "----------(";
const NAME_END: &str = ")>";
const KIND_END: &str = "]\n";
const BLOCK_CLOSE: &str = "\n==========";
const VIDEO_CALL_MARKER: &str = "Video call:";

const IMAGE_EXTENSIONS: &[&str] = &["jpeg", "jpg", "gif", "png"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "ogg"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Other(String),
}

impl MediaKind {
    /// `image/png` -> `Image`, `application/pdf` -> `Other("application")`.
    pub fn from_mime(mime: &str) -> Self {
        let top = mime.split('/').next().unwrap_or_default().trim();
        Self::from_label(top)
    }

    fn from_label(label: &str) -> Self {
        match label {
            "image" => Self::Image,
            "video" => Self::Video,
            "audio" => Self::Audio,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Other(label) => label,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub name: String,
    pub kind: MediaKind,
    pub url: String,
}

impl AttachmentRef {
    pub fn new(name: impl Into<String>, kind: MediaKind, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            url: url.into(),
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "{BLOCK_OPEN}{}{NAME_END}{}{KIND_END}{}{BLOCK_CLOSE}",
            self.name, self.kind, self.url
        )
    }

    /// Returns `None` unless the whole content is exactly one attachment block.
    pub fn parse(content: &str) -> Option<Self> {
        let inner = content
            .strip_prefix(BLOCK_OPEN)?
            .strip_suffix(BLOCK_CLOSE)?;
        let (name, rest) = inner.split_once(NAME_END)?;
        let (kind, url) = rest.split_once(KIND_END)?;
        if [name, kind, url].iter().any(|part| part.contains('\n')) {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            kind: MediaKind::from_label(kind),
            url: url.to_string(),
        })
    }
}

/// How a message body should be presented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Attachment(AttachmentRef),
    VideoCall { url: String },
    Image { url: String },
    Video { url: String },
    Link { url: String },
    Text,
}

impl MessageBody {
    pub fn classify(content: &str) -> Self {
        if let Some(attachment) = AttachmentRef::parse(content) {
            return Self::Attachment(attachment);
        }

        if let Some((_, rest)) = content.split_once(VIDEO_CALL_MARKER) {
            return Self::VideoCall {
                url: rest.trim().to_string(),
            };
        }

        if let Some(last) = content.split_whitespace().last() {
            if is_http_url(last) {
                if has_extension(last, IMAGE_EXTENSIONS) {
                    return Self::Image {
                        url: last.to_string(),
                    };
                }
                if has_extension(last, VIDEO_EXTENSIONS) {
                    return Self::Video {
                        url: last.to_string(),
                    };
                }
            }
        }

        match content.split_whitespace().find(|token| is_http_url(token)) {
            Some(url) => Self::Link {
                url: url.to_string(),
            },
            None => Self::Text,
        }
    }
}

pub fn video_call_content(call_url: &str) -> String {
    format!("{VIDEO_CALL_MARKER} {call_url}")
}

fn is_http_url(token: &str) -> bool {
    Url::parse(token)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host().is_some())
        .unwrap_or(false)
}

fn has_extension(url: &str, extensions: &[&str]) -> bool {
    url.rsplit_once('.')
        .map(|(_, ext)| extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}
