//! Document model shared by every endpoint and pipeline stage
//!
//! A document is an owned content buffer plus a metadata record. Batches are
//! fixed-size and null-padded: a `None` slot was never an identifier and is
//! skipped uniformly at every later stage.

use std::collections::BTreeSet;

/// Storage format of a document's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Xml,
    Text,
    Binary,
}

impl DocumentFormat {
    /// Infer a format from a path-like identifier's extension.
    pub fn from_identifier(identifier: &str) -> Self {
        let ext = identifier
            .rsplit('/')
            .next()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase());
        match ext.as_deref() {
            Some("xml" | "xsl" | "xslt" | "xhtml" | "svg" | "rdf") => Self::Xml,
            Some(
                "txt" | "text" | "json" | "csv" | "tsv" | "md" | "html" | "htm" | "css" | "js",
            ) => Self::Text,
            _ => Self::Binary,
        }
    }
}

impl std::fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Xml => write!(f, "xml"),
            Self::Text => write!(f, "text"),
            Self::Binary => write!(f, "binary"),
        }
    }
}

impl std::str::FromStr for DocumentFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "xml" => Ok(Self::Xml),
            "text" => Ok(Self::Text),
            "binary" => Ok(Self::Binary),
            other => Err(anyhow::anyhow!("unknown document format: {:?}", other)),
        }
    }
}

/// One capability granted to a role.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Permission {
    pub role: String,
    pub capability: String,
}

impl Permission {
    pub fn new(role: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            capability: capability.into(),
        }
    }
}

/// Structured metadata attached to every document.
///
/// Always present once a document leaves a reader; endpoints that have no
/// native metadata (the filesystem tree) fill in defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub format: DocumentFormat,
    pub collections: BTreeSet<String>,
    pub permissions: Vec<Permission>,
    pub quality: i32,
    /// Raw XML fragment carried through verbatim.
    pub properties: Option<String>,
    pub checksum: Option<String>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            format: DocumentFormat::Binary,
            collections: BTreeSet::new(),
            permissions: Vec::new(),
            quality: 0,
            properties: None,
            checksum: None,
        }
    }
}

impl Metadata {
    pub fn with_format(format: DocumentFormat) -> Self {
        Self {
            format,
            ..Default::default()
        }
    }

    /// Structural equality: collections are a set, permissions an unordered
    /// multiset. Used by round-trip checks rather than derive(PartialEq).
    pub fn structurally_equal(&self, other: &Self) -> bool {
        let mut ours = self.permissions.clone();
        let mut theirs = other.permissions.clone();
        ours.sort();
        theirs.sort();
        self.format == other.format
            && self.collections == other.collections
            && ours == theirs
            && self.quality == other.quality
            && self.properties == other.properties
            && self.checksum == other.checksum
    }
}

/// Owned content plus metadata.
#[derive(Debug, Clone)]
pub struct Document {
    pub content: Vec<u8>,
    pub metadata: Metadata,
}

impl Document {
    pub fn new(content: Vec<u8>, metadata: Metadata) -> Self {
        Self { content, metadata }
    }

    /// Lowercase hex CRC32 of the content, the format used by the optional
    /// metadata checksum field.
    pub fn content_checksum(&self) -> String {
        format!("{:08x}", crc32fast::hash(&self.content))
    }
}

/// Fixed-size, null-padded batch of documents moving through one task.
///
/// `uris` marks which slots were originally non-null and never changes after
/// construction; `outputs` holds the transformed output identifiers and is
/// cleared for slots dropped by a filter.
#[derive(Debug)]
pub struct DocumentBatch {
    uris: Vec<Option<String>>,
    outputs: Vec<Option<String>>,
    docs: Vec<Option<Document>>,
}

impl DocumentBatch {
    pub fn new(uris: Vec<Option<String>>) -> Self {
        let len = uris.len();
        Self {
            uris,
            outputs: vec![None; len],
            docs: (0..len).map(|_| None).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.uris.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }

    pub fn uri(&self, slot: usize) -> Option<&str> {
        self.uris.get(slot).and_then(|uri| uri.as_deref())
    }

    pub fn uris(&self) -> &[Option<String>] {
        &self.uris
    }

    /// Indices of originally non-null slots.
    pub fn occupied(&self) -> impl Iterator<Item = usize> + '_ {
        self.uris
            .iter()
            .enumerate()
            .filter_map(|(slot, uri)| uri.as_ref().map(|_| slot))
    }

    pub fn document(&self, slot: usize) -> Option<&Document> {
        self.docs.get(slot).and_then(|doc| doc.as_ref())
    }

    pub fn set_document(&mut self, slot: usize, doc: Document) {
        self.docs[slot] = Some(doc);
    }

    pub fn output(&self, slot: usize) -> Option<&str> {
        self.outputs.get(slot).and_then(|uri| uri.as_deref())
    }

    pub fn set_output(&mut self, slot: usize, uri: String) {
        self.outputs[slot] = Some(uri);
    }

    /// Drops a slot from the write set (filtering); the original uri stays so
    /// the slot still produces its timing event.
    pub fn drop_from_output(&mut self, slot: usize) {
        self.outputs[slot] = None;
        self.docs[slot] = None;
    }

    /// Slots that survived read + transform + filter and will be persisted.
    pub fn writable(&self) -> impl Iterator<Item = (usize, &str, &Document)> + '_ {
        (0..self.len()).filter_map(|slot| {
            match (self.output(slot), self.document(slot)) {
                (Some(uri), Some(doc)) => Some((slot, uri, doc)),
                _ => None,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_identifier() {
        assert_eq!(
            DocumentFormat::from_identifier("a/b/doc.xml"),
            DocumentFormat::Xml
        );
        assert_eq!(
            DocumentFormat::from_identifier("notes.TXT"),
            DocumentFormat::Text
        );
        assert_eq!(
            DocumentFormat::from_identifier("image.png"),
            DocumentFormat::Binary
        );
        assert_eq!(
            DocumentFormat::from_identifier("no-extension"),
            DocumentFormat::Binary
        );
    }

    #[test]
    fn format_parse_round_trip() {
        for format in [
            DocumentFormat::Xml,
            DocumentFormat::Text,
            DocumentFormat::Binary,
        ] {
            assert_eq!(format.to_string().parse::<DocumentFormat>().unwrap(), format);
        }
        assert!("bogus".parse::<DocumentFormat>().is_err());
    }

    #[test]
    fn structural_equality_ignores_permission_order() {
        let mut left = Metadata::with_format(DocumentFormat::Text);
        left.permissions = vec![
            Permission::new("reader", "read"),
            Permission::new("writer", "update"),
        ];
        let mut right = left.clone();
        right.permissions.reverse();
        assert!(left.structurally_equal(&right));
        right.quality = 7;
        assert!(!left.structurally_equal(&right));
    }

    #[test]
    fn batch_tracks_occupied_and_writable_slots() {
        let mut batch = DocumentBatch::new(vec![Some("a".to_string()), None, Some("c".to_string())]);
        assert_eq!(batch.occupied().collect::<Vec<_>>(), vec![0, 2]);
        batch.set_document(0, Document::new(b"x".to_vec(), Metadata::default()));
        batch.set_document(2, Document::new(b"y".to_vec(), Metadata::default()));
        batch.set_output(0, "a".to_string());
        batch.set_output(2, "c".to_string());
        batch.drop_from_output(0);
        let written: Vec<usize> = batch.writable().map(|(slot, _, _)| slot).collect();
        assert_eq!(written, vec![2]);
        // filtering never touches the original uri
        assert_eq!(batch.uri(0), Some("a"));
    }
}
