//! Output-identifier transforms and format-based exclusion filters

use serde::{Deserialize, Serialize};

use crate::document::DocumentFormat;

/// Rewrites applied to every output identifier, in a fixed order: strip
/// prefix/suffix, add prefix/suffix, randomized rename, URI-encoding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputTransforms {
    pub strip_prefix: Option<String>,
    pub strip_suffix: Option<String>,
    pub add_prefix: Option<String>,
    pub add_suffix: Option<String>,
    /// Prepend a random 64-bit hex tag to spread output identifiers.
    pub randomize: bool,
    /// Percent-encode characters outside the unreserved set (and `/`).
    pub uri_encode: bool,
}

impl OutputTransforms {
    pub fn is_identity(&self) -> bool {
        self.strip_prefix.is_none()
            && self.strip_suffix.is_none()
            && self.add_prefix.is_none()
            && self.add_suffix.is_none()
            && !self.randomize
            && !self.uri_encode
    }

    pub fn apply(&self, uri: &str) -> String {
        let mut out = uri;
        if let Some(prefix) = &self.strip_prefix {
            out = out.strip_prefix(prefix.as_str()).unwrap_or(out);
        }
        if let Some(suffix) = &self.strip_suffix {
            out = out.strip_suffix(suffix.as_str()).unwrap_or(out);
        }
        let mut out = out.to_string();
        if let Some(prefix) = &self.add_prefix {
            out.insert_str(0, prefix);
        }
        if let Some(suffix) = &self.add_suffix {
            out.push_str(suffix);
        }
        if self.randomize {
            out = format!("{:016x}-{}", rand::random::<u64>(), out);
        }
        if self.uri_encode {
            out = uri_encode(&out);
        }
        out
    }
}

/// Percent-encodes everything outside `[A-Za-z0-9._~-]` and `/`.
pub fn uri_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                out.push(byte as char);
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

/// Drops documents of the listed formats from the write set.
#[derive(Debug, Clone, Default)]
pub struct FormatFilter {
    pub exclude: Vec<DocumentFormat>,
}

impl FormatFilter {
    pub fn excluding(formats: Vec<DocumentFormat>) -> Self {
        Self { exclude: formats }
    }

    pub fn is_empty(&self) -> bool {
        self.exclude.is_empty()
    }

    pub fn excludes(&self, format: DocumentFormat) -> bool {
        self.exclude.contains(&format)
    }
}
