//! UTF-8 XML codec for the archive metadata record
//!
//! Every content entry in an archive is paired with a metadata twin entry
//! holding this record. The shape is fixed and flat, so the codec is a small
//! hand-written writer/scanner rather than a generic XML stack; the
//! `properties` element is an opaque fragment carried through verbatim.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <document-metadata>
//!   <format>text</format>
//!   <collections><collection>reports</collection></collections>
//!   <permissions><permission><role>reader</role><capability>read</capability></permission></permissions>
//!   <quality>2</quality>
//!   <properties><p:last-author xmlns:p="urn:props">jk</p:last-author></properties>
//!   <checksum>0a1b2c3d</checksum>
//! </document-metadata>
//! ```

use anyhow::{anyhow, Context};

use crate::document::{Metadata, Permission};

const ROOT: &str = "document-metadata";

/// Serializes a metadata record to its XML form.
pub fn to_xml(metadata: &Metadata) -> String {
    let mut out = String::with_capacity(256);
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<document-metadata>");
    out.push_str("<format>");
    out.push_str(&metadata.format.to_string());
    out.push_str("</format>");
    out.push_str("<collections>");
    for collection in &metadata.collections {
        out.push_str("<collection>");
        push_escaped(&mut out, collection);
        out.push_str("</collection>");
    }
    out.push_str("</collections>");
    out.push_str("<permissions>");
    for permission in &metadata.permissions {
        out.push_str("<permission><role>");
        push_escaped(&mut out, &permission.role);
        out.push_str("</role><capability>");
        push_escaped(&mut out, &permission.capability);
        out.push_str("</capability></permission>");
    }
    out.push_str("</permissions>");
    out.push_str("<quality>");
    out.push_str(&metadata.quality.to_string());
    out.push_str("</quality>");
    if let Some(properties) = &metadata.properties {
        // opaque fragment, written as-is
        out.push_str("<properties>");
        out.push_str(properties);
        out.push_str("</properties>");
    }
    if let Some(checksum) = &metadata.checksum {
        out.push_str("<checksum>");
        push_escaped(&mut out, checksum);
        out.push_str("</checksum>");
    }
    out.push_str("</document-metadata>");
    out
}

/// Parses a metadata record from its XML form.
pub fn from_xml(xml: &str) -> anyhow::Result<Metadata> {
    let body = section(xml, ROOT)
        .ok_or_else(|| anyhow!("missing <{}> element in metadata record", ROOT))?;
    let format = section(body, "format")
        .ok_or_else(|| anyhow!("metadata record has no <format> element"))?
        .trim()
        .parse()
        .context("parsing metadata format")?;
    let mut metadata = Metadata::with_format(format);
    if let Some(collections) = section(body, "collections") {
        for collection in sections(collections, "collection") {
            metadata.collections.insert(unescape(collection)?);
        }
    }
    if let Some(permissions) = section(body, "permissions") {
        for permission in sections(permissions, "permission") {
            let role = section(permission, "role")
                .ok_or_else(|| anyhow!("permission without <role>"))?;
            let capability = section(permission, "capability")
                .ok_or_else(|| anyhow!("permission without <capability>"))?;
            metadata
                .permissions
                .push(Permission::new(unescape(role)?, unescape(capability)?));
        }
    }
    if let Some(quality) = section(body, "quality") {
        metadata.quality = quality
            .trim()
            .parse()
            .with_context(|| format!("parsing metadata quality {:?}", quality))?;
    }
    // properties is a raw fragment, not unescaped
    metadata.properties = section(body, "properties").map(str::to_string);
    metadata.checksum = match section(body, "checksum") {
        Some(checksum) => Some(unescape(checksum)?),
        None => None,
    };
    Ok(metadata)
}

fn push_escaped(out: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
}

fn unescape(value: &str) -> anyhow::Result<String> {
    if !value.contains('&') {
        return Ok(value.to_string());
    }
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let end = rest
            .find(';')
            .ok_or_else(|| anyhow!("unterminated entity in {:?}", value))?;
        let entity = &rest[1..end];
        match entity {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            _ => {
                let code = entity
                    .strip_prefix("#x")
                    .map(|hex| u32::from_str_radix(hex, 16))
                    .or_else(|| entity.strip_prefix('#').map(|dec| dec.parse()))
                    .ok_or_else(|| anyhow!("unknown entity &{};", entity))?
                    .with_context(|| format!("bad character reference &{};", entity))?;
                out.push(
                    char::from_u32(code)
                        .ok_or_else(|| anyhow!("invalid character reference &{};", entity))?,
                );
            }
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Inner text of the first `<tag>...</tag>` in `xml`, `None` when absent.
fn section<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(&xml[start..end])
}

/// Inner texts of every `<tag>...</tag>` in `xml`, in order.
fn sections<'a>(xml: &'a str, tag: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut rest = xml;
    std::iter::from_fn(move || {
        let start = rest.find(&open)? + open.len();
        let end = rest[start..].find(&close)? + start;
        let inner = &rest[start..end];
        rest = &rest[end + close.len()..];
        Some(inner)
    })
}
