//! C3 — turns HLS playlist bytes into typed tags, attributes, and segment records.
//!
//! No direct teacher analogue (the teacher only reads XML); grounded on the tag/attribute-list
//! shape visible in `other_examples/5416b44c_raibu-stream-hls-playlist__src-playlist.rs.rs` and
//! `other_examples/86f7b96e_SentryShot-sentryshot__src-hls-playlist.rs.rs`, but hand-rolled rather
//! than pulled in via a playlist crate, to match the teacher's hand-rolled-parser idiom (`lib.rs`
//! implements its own XML-adjacent parsing helpers rather than reaching for a higher-level DASH
//! crate).

use crate::error::{ManifestError, Result};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistType {
    Master,
    Media,
}

/// A single attribute value from a tag's attribute list. §4.5.1: "Attribute values are
/// quoted-string or enumerated; unquoting trims the `"` pair only; commas inside quoted values
/// are literal."
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    QuotedString(String),
    Enumerated(String),
}

impl AttributeValue {
    pub fn as_str(&self) -> &str {
        match self {
            AttributeValue::QuotedString(s) => s,
            AttributeValue::Enumerated(s) => s,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_str().parse().ok()
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_str().parse().ok()
    }
}

/// `Tag = (id, name, attribute list, value)` per §4.5.1. `id` is the tag's ordinal position in
/// the playlist, used to scope tags like `#EXT-X-KEY`/`#EXT-X-MAP` that "apply from this line
/// forward".
#[derive(Debug, Clone)]
pub struct Tag {
    pub id: usize,
    pub name: String,
    pub attributes: HashMap<String, AttributeValue>,
    /// The text after `:` that isn't an attribute list (e.g. `#EXTINF:5.0,title`'s duration, or a
    /// bare URI line represented as a synthetic `#EXT-X-URI` tag by the line-based parser).
    pub value: Option<String>,
}

impl Tag {
    pub fn attr(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Re-serializes this tag to its canonical textual form. §4.5.1: "`toString` of a tag must
    /// reproduce its canonical input when re-serialized."
    pub fn to_playlist_line(&self) -> String {
        if self.attributes.is_empty() {
            match &self.value {
                Some(v) => format!("#{}:{v}", self.name),
                None => format!("#{}", self.name),
            }
        } else {
            let mut parts: Vec<String> = self
                .attributes
                .iter()
                .map(|(k, v)| match v {
                    AttributeValue::QuotedString(s) => format!("{k}=\"{s}\""),
                    AttributeValue::Enumerated(s) => format!("{k}={s}"),
                })
                .collect();
            parts.sort();
            format!("#{}:{}", self.name, parts.join(","))
        }
    }
}

/// Parse a comma-separated HLS attribute list, respecting quoted-string commas.
fn parse_attribute_list(s: &str) -> HashMap<String, AttributeValue> {
    let mut attrs = HashMap::new();
    let mut chars = s.char_indices().peekable();
    let mut field_start = 0;
    let mut in_quotes = false;
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => in_quotes = !in_quotes,
            b',' if !in_quotes => {
                push_attr(&mut attrs, &s[field_start..i]);
                field_start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    if field_start < s.len() {
        push_attr(&mut attrs, &s[field_start..]);
    }
    let _ = &mut chars;
    attrs
}

fn push_attr(attrs: &mut HashMap<String, AttributeValue>, field: &str) {
    let Some((key, value)) = field.split_once('=') else { return };
    let key = key.trim().to_string();
    let value = value.trim();
    if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
        attrs.insert(key, AttributeValue::QuotedString(value[1..value.len() - 1].to_string()));
    } else {
        attrs.insert(key, AttributeValue::Enumerated(value.to_string()));
    }
}

/// One `#EXTINF`-delimited segment record: the tags scoped to it (in document order) plus its URI
/// line.
#[derive(Debug, Clone)]
pub struct SegmentRecord {
    pub tags: Vec<Tag>,
    pub uri: String,
}

#[derive(Debug, Clone)]
pub struct Playlist {
    pub playlist_type: PlaylistType,
    /// Every parsed tag, in document order (including segment-scoped ones).
    pub tags: Vec<Tag>,
    pub segments: Vec<SegmentRecord>,
    pub absolute_uri: String,
}

const MASTER_ONLY_TAGS: &[&str] = &["EXT-X-STREAM-INF", "EXT-X-MEDIA", "EXT-X-IMAGE-STREAM-INF", "EXT-X-SESSION-KEY", "EXT-X-SESSION-DATA"];
const MEDIA_ONLY_TAGS: &[&str] = &["EXTINF", "EXT-X-KEY", "EXT-X-MAP", "EXT-X-BYTERANGE", "EXT-X-DISCONTINUITY", "EXT-X-PROGRAM-DATE-TIME", "EXT-X-GAP", "EXT-X-TARGETDURATION", "EXT-X-MEDIA-SEQUENCE", "EXT-X-ENDLIST"];

/// §4.5.3 — `EXT-X-DEFINE`/`{$NAME}` variable substitution, run before tokenizing. Collects
/// `NAME="..."` / `VALUE="..."` definitions (and `IMPORT="..."` references into `imported`, the
/// values a parent master playlist already defined), then replaces every `{$NAME}` occurrence in
/// the rest of the playlist. Returns the substituted text and the final variable table, so a
/// master playlist's variables can be threaded as `imported` into its child media playlists.
pub fn substitute_variables(text: &str, imported: &HashMap<String, String>) -> Result<(String, HashMap<String, String>)> {
    let mut vars = imported.clone();
    let mut out_lines = Vec::with_capacity(text.lines().count());
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("#EXT-X-DEFINE:") {
            let attrs = parse_attribute_list(rest);
            if let Some(name) = attrs.get("NAME") {
                let value = attrs.get("VALUE").map(|v| v.as_str().to_string()).unwrap_or_default();
                vars.insert(name.as_str().to_string(), value);
            } else if let Some(name) = attrs.get("IMPORT") {
                if !imported.contains_key(name.as_str()) {
                    return Err(ManifestError::manifest_malformed(format!(
                        "EXT-X-DEFINE IMPORT of variable \"{}\" not defined in the parent master playlist",
                        name.as_str()
                    )));
                }
            }
            out_lines.push(line.to_string());
            continue;
        }
        out_lines.push(substitute_line(line, &vars));
    }
    Ok((out_lines.join("\n"), vars))
}

fn substitute_line(line: &str, vars: &HashMap<String, String>) -> String {
    if !line.contains("{$") {
        return line.to_string();
    }
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(start) = rest.find("{$") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        if let Some(end) = after.find('}') {
            let name = &after[..end];
            match vars.get(name) {
                Some(value) => out.push_str(value),
                None => out.push_str(&rest[start..start + 2 + end + 1]),
            }
            rest = &after[end + 1..];
        } else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        }
    }
    out.push_str(rest);
    out
}

/// Line-based tokenizer. §4.5.1: "Parsing is line-based after `#EXTM3U`; empty lines and
/// `#`-prefixed non-tag lines are ignored."
pub fn tokenize(text: &str, absolute_uri: &str) -> Result<Playlist> {
    let mut lines = text.lines();
    let Some(first) = lines.next() else {
        return Err(ManifestError::HlsPlaylistHeaderMissing);
    };
    if first.trim() != "#EXTM3U" {
        return Err(ManifestError::HlsPlaylistHeaderMissing);
    }

    let mut tags = Vec::new();
    let mut segments = Vec::new();
    let mut pending_segment_tags: Vec<Tag> = Vec::new();
    let mut saw_master_tag = false;
    let mut saw_media_tag = false;
    let mut id = 0usize;

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix('#') {
            if let Some(colon) = rest.find(':') {
                let name = rest[..colon].to_string();
                let body = &rest[colon + 1..];
                let attributes = if body.contains('=') { parse_attribute_list(body) } else { HashMap::new() };
                let value = if attributes.is_empty() { Some(body.to_string()) } else { None };
                if MASTER_ONLY_TAGS.contains(&name.as_str()) {
                    saw_master_tag = true;
                }
                if MEDIA_ONLY_TAGS.contains(&name.as_str()) {
                    saw_media_tag = true;
                }
                let tag = Tag { id, name: name.clone(), attributes, value };
                id += 1;
                if name == "EXTINF" {
                    pending_segment_tags.push(tag.clone());
                    tags.push(tag);
                } else {
                    tags.push(tag.clone());
                    pending_segment_tags.push(tag);
                }
            } else {
                // a bare tag with no `:`, e.g. #EXT-X-ENDLIST, #EXT-X-DISCONTINUITY,
                // #EXT-X-INDEPENDENT-SEGMENTS
                if MEDIA_ONLY_TAGS.contains(&rest) {
                    saw_media_tag = true;
                }
                let tag = Tag { id, name: rest.to_string(), attributes: HashMap::new(), value: None };
                id += 1;
                tags.push(tag.clone());
                pending_segment_tags.push(tag);
            }
            continue;
        }
        // a bare URI line: either a variant/media-playlist URI (master) or a segment URI (media).
        if pending_segment_tags.iter().any(|t| t.name == "EXTINF") {
            segments.push(SegmentRecord {
                tags: std::mem::take(&mut pending_segment_tags),
                uri: line.to_string(),
            });
        } else {
            tags.push(Tag { id, name: "EXT-X-URI".to_string(), attributes: HashMap::new(), value: Some(line.to_string()) });
            id += 1;
            pending_segment_tags.clear();
        }
    }

    if saw_master_tag && saw_media_tag {
        return Err(ManifestError::HlsInvalidPlaylistHierarchy);
    }

    let playlist_type = if saw_master_tag { PlaylistType::Master } else { PlaylistType::Media };
    Ok(Playlist { playlist_type, tags, segments, absolute_uri: absolute_uri.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_header_is_rejected() {
        let err = tokenize("#EXT-X-VERSION:3\n", "http://x/p.m3u8").unwrap_err();
        assert!(matches!(err, ManifestError::HlsPlaylistHeaderMissing));
    }

    #[test]
    fn mixed_master_and_media_tags_is_rejected() {
        let text = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=100\nlow.m3u8\n#EXTINF:5,\nseg.ts\n";
        let err = tokenize(text, "http://x/p.m3u8").unwrap_err();
        assert!(matches!(err, ManifestError::HlsInvalidPlaylistHierarchy));
    }

    #[test]
    fn parses_media_playlist_segments_and_attributes() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-MAP:URI=\"init.mp4\",BYTERANGE=\"616@0\"\n#EXTINF:5,\n#EXT-X-BYTERANGE:121090@616\nmain.mp4\n#EXT-X-ENDLIST\n";
        let pl = tokenize(text, "http://x/p.m3u8").unwrap();
        assert_eq!(pl.playlist_type, PlaylistType::Media);
        assert_eq!(pl.segments.len(), 1);
        assert_eq!(pl.segments[0].uri, "main.mp4");
        let map_tag = pl.tags.iter().find(|t| t.name == "EXT-X-MAP").unwrap();
        assert_eq!(map_tag.attr("URI").unwrap().as_str(), "init.mp4");
        assert_eq!(map_tag.attr("BYTERANGE").unwrap().as_str(), "616@0");
    }

    #[test]
    fn attribute_list_respects_quoted_commas() {
        let attrs = parse_attribute_list(r#"CODECS="avc1,mp4a",BANDWIDTH=200"#);
        assert_eq!(attrs.get("CODECS").unwrap().as_str(), "avc1,mp4a");
        assert_eq!(attrs.get("BANDWIDTH").unwrap().as_str(), "200");
    }

    #[test]
    fn define_substitutes_name_in_later_lines() {
        let text = "#EXTM3U\n#EXT-X-DEFINE:NAME=\"base\",VALUE=\"http://cdn.example\"\n#EXT-X-STREAM-INF:BANDWIDTH=100\n{$base}/low.m3u8\n";
        let (out, vars) = substitute_variables(text, &HashMap::new()).unwrap();
        assert!(out.contains("http://cdn.example/low.m3u8"));
        assert_eq!(vars.get("base").unwrap(), "http://cdn.example");
    }

    #[test]
    fn define_import_requires_parent_variable() {
        let text = "#EXTM3U\n#EXT-X-DEFINE:IMPORT=\"base\"\n#EXTINF:5,\n{$base}/seg.ts\n#EXT-X-ENDLIST\n";
        let err = substitute_variables(text, &HashMap::new()).unwrap_err();
        assert!(matches!(err, ManifestError::ManifestMalformed(_)));

        let mut imported = HashMap::new();
        imported.insert("base".to_string(), "http://cdn.example".to_string());
        let (out, _) = substitute_variables(text, &imported).unwrap();
        assert!(out.contains("http://cdn.example/seg.ts"));
    }

    #[test]
    fn tag_round_trips_to_canonical_line() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-ENDLIST\n";
        let pl = tokenize(text, "http://x/p.m3u8").unwrap();
        let td = pl.tags.iter().find(|t| t.name == "EXT-X-TARGETDURATION").unwrap();
        assert_eq!(td.to_playlist_line(), "#EXT-X-TARGETDURATION:6");
    }
}
