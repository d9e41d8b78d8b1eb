//! C4 — the DASH MPD XML tree: serde structs deserialized directly from the manifest bytes.
//!
//! Directly grounded on the teacher's `MPD`/`Period`/`AdaptationSet`/`Representation`/
//! `SegmentTemplate`/`SegmentTimeline`/`S`/`SegmentList`/`SegmentURL`/`SegmentBase`/
//! `ContentProtection`/`EventStream`/`UTCTiming`/`Role`/`BaseURL` structs in `lib.rs`, kept
//! field-for-field where the shape matches. Diverges from the teacher in three ways the real XSD
//! (and this engine's needs) call for but the teacher's VOD-only model didn't: `BaseURL` and
//! `ContentProtection` become `Vec` instead of `Option` (the schema permits repetition, needed for
//! the multiplicative BaseURL combination), `Label` is added, and `MPD/Location` is added for
//! update-fetch redirection.

use crate::error::{ManifestError, Result};
use serde::de;
use serde::Deserialize;

/// Parse an ISO-8601 `xs:duration` string ("PT10S", "PT1H2M3.5S") into seconds. Grounded on the
/// teacher's `parse_xs_duration`, simplified to `f64` seconds since every consumer in this crate
/// works in floating-point presentation time rather than `std::time::Duration`.
pub fn parse_xs_duration(s: &str) -> Result<f64> {
    match iso8601::duration(s) {
        Ok(iso8601::Duration::Weeks(w)) => Ok(w as f64 * 7.0 * 24.0 * 3600.0),
        Ok(iso8601::Duration::YMDHMS { year, month, day, hour, minute, second, millisecond }) => {
            let mut secs = second as f64 + millisecond as f64 / 1000.0;
            secs += minute as f64 * 60.0;
            secs += hour as f64 * 3600.0;
            secs += day as f64 * 86400.0;
            secs += month as f64 * 86400.0 * 31.0;
            secs += year as f64 * 86400.0 * 365.0;
            Ok(secs)
        }
        Err(e) => Err(ManifestError::manifest_malformed(format!("invalid xs:duration {s:?}: {e:?}"))),
    }
}

fn deserialize_xs_duration<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: de::Deserializer<'de>,
{
    match <Option<String>>::deserialize(deserializer) {
        Ok(Some(s)) => parse_xs_duration(&s).map(Some).map_err(de::Error::custom),
        Ok(None) => Ok(None),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct S {
    pub t: Option<i64>,
    pub d: Option<i64>,
    pub r: Option<i64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SegmentTimeline {
    #[serde(rename = "S", default)]
    pub segments: Vec<S>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Initialization {
    pub sourceURL: Option<String>,
    pub range: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SegmentTemplate {
    pub initialization: Option<String>,
    pub media: Option<String>,
    pub index: Option<String>,
    #[serde(rename = "SegmentTimeline")]
    pub segment_timeline: Option<SegmentTimeline>,
    pub startNumber: Option<u64>,
    pub duration: Option<u64>,
    pub timescale: Option<u64>,
    pub presentationTimeOffset: Option<u64>,
    pub availabilityTimeOffset: Option<f64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BaseURL {
    #[serde(rename = "$value")]
    pub base: String,
    pub serviceLocation: Option<String>,
    pub availabilityTimeOffset: Option<f64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SegmentBase {
    #[serde(rename = "Initialization")]
    pub initialization: Option<Initialization>,
    pub timescale: Option<u64>,
    pub presentationTimeOffset: Option<u64>,
    pub indexRange: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SegmentURL {
    pub media: Option<String>,
    pub mediaRange: Option<String>,
    pub index: Option<String>,
    pub indexRange: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SegmentList {
    pub duration: Option<u64>,
    pub timescale: Option<u64>,
    #[serde(rename = "Initialization")]
    pub initialization: Option<Initialization>,
    #[serde(rename = "SegmentTimeline")]
    pub segment_timeline: Option<SegmentTimeline>,
    #[serde(rename = "SegmentURL", default)]
    pub segment_urls: Vec<SegmentURL>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AudioChannelConfiguration {
    pub schemeIdUri: Option<String>,
    pub value: Option<String>,
}

/// §4.4.7: "common values are mapped to key-system identifiers and CENC init-data is attached to
/// the stream" — `crate::dash::parser::key_system_for_scheme` does the mapping.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ContentProtection {
    pub schemeIdUri: Option<String>,
    pub value: Option<String>,
    pub robustness: Option<String>,
    #[serde(rename = "cenc:default_KID")]
    pub default_kid: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Role {
    pub schemeIdUri: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Label {
    #[serde(rename = "$value")]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Representation {
    pub id: Option<String>,
    pub mimeType: Option<String>,
    pub codecs: Option<String>,
    pub bandwidth: Option<u64>,
    pub audioSamplingRate: Option<u64>,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub frameRate: Option<String>,
    #[serde(rename = "BaseURL", default)]
    pub base_urls: Vec<BaseURL>,
    #[serde(rename = "AudioChannelConfiguration")]
    pub audio_channel_configuration: Option<AudioChannelConfiguration>,
    #[serde(rename = "SegmentTemplate")]
    pub segment_template: Option<SegmentTemplate>,
    #[serde(rename = "SegmentBase")]
    pub segment_base: Option<SegmentBase>,
    #[serde(rename = "SegmentList")]
    pub segment_list: Option<SegmentList>,
    #[serde(rename = "ContentProtection", default)]
    pub content_protections: Vec<ContentProtection>,
    #[serde(rename = "Label", default)]
    pub labels: Vec<Label>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AdaptationSet {
    pub id: Option<i64>,
    #[serde(rename = "BaseURL", default)]
    pub base_urls: Vec<BaseURL>,
    pub group: Option<i64>,
    pub contentType: Option<String>,
    pub lang: Option<String>,
    pub mimeType: Option<String>,
    pub codecs: Option<String>,
    pub frameRate: Option<String>,
    #[serde(rename = "SegmentTemplate")]
    pub segment_template: Option<SegmentTemplate>,
    #[serde(rename = "Role", default)]
    pub roles: Vec<Role>,
    #[serde(rename = "ContentProtection", default)]
    pub content_protections: Vec<ContentProtection>,
    #[serde(rename = "Label", default)]
    pub labels: Vec<Label>,
    #[serde(rename = "Representation", default)]
    pub representations: Vec<Representation>,
}

impl AdaptationSet {
    pub fn is_audio(&self) -> bool {
        self.contentType.as_deref() == Some("audio")
            || self.mimeType.as_deref().is_some_and(|m| m.starts_with("audio/"))
    }

    pub fn is_video(&self) -> bool {
        self.contentType.as_deref() == Some("video")
            || self.mimeType.as_deref().is_some_and(|m| m.starts_with("video/"))
    }

    /// Thumbnail/tile AdaptationSets, signalled with `contentType="image"` (and conventionally
    /// `image/jpeg` or `image/png` tiled sprites rather than a playable media MIME type).
    pub fn is_image(&self) -> bool {
        self.contentType.as_deref() == Some("image")
            || self.mimeType.as_deref().is_some_and(|m| m.starts_with("image/"))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Event {
    pub id: Option<String>,
    #[serde(default)]
    pub presentationTime: i64,
    #[serde(default)]
    pub duration: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventStream {
    pub schemeIdUri: Option<String>,
    pub value: Option<String>,
    pub timescale: Option<u64>,
    #[serde(rename = "Event", default)]
    pub events: Vec<Event>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Period {
    pub id: Option<String>,
    pub start: Option<String>,
    #[serde(default, deserialize_with = "deserialize_xs_duration")]
    pub duration: Option<f64>,
    #[serde(rename = "BaseURL", default)]
    pub base_urls: Vec<BaseURL>,
    #[serde(rename = "SegmentTemplate")]
    pub segment_template: Option<SegmentTemplate>,
    #[serde(rename = "AdaptationSet", default)]
    pub adaptation_sets: Vec<AdaptationSet>,
    #[serde(rename = "EventStream", default)]
    pub event_streams: Vec<EventStream>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct UTCTiming {
    pub schemeIdUri: Option<String>,
    pub value: Option<String>,
}

/// `MPD/Location`: additional URIs the update loop should fetch from instead of the original
/// request URI (§4.4.1 step 4).
#[derive(Debug, Deserialize, Clone)]
pub struct Location {
    #[serde(rename = "$value")]
    pub uri: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MPD {
    #[serde(rename = "type", default = "default_mpd_type")]
    pub mpdtype: String,
    pub availabilityStartTime: Option<String>,
    pub minimumUpdatePeriod: Option<String>,
    pub timeShiftBufferDepth: Option<String>,
    pub suggestedPresentationDelay: Option<String>,
    pub publishTime: Option<String>,
    #[serde(default, deserialize_with = "deserialize_xs_duration")]
    pub mediaPresentationDuration: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_xs_duration")]
    pub maxSegmentDuration: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_xs_duration")]
    pub minBufferTime: Option<f64>,
    #[serde(rename = "Period", default)]
    pub periods: Vec<Period>,
    #[serde(rename = "BaseURL", default)]
    pub base_urls: Vec<BaseURL>,
    #[serde(rename = "Location", default)]
    pub locations: Vec<Location>,
    #[serde(rename = "UTCTiming", default)]
    pub utc_timings: Vec<UTCTiming>,
}

fn default_mpd_type() -> String {
    "static".to_string()
}

/// Deserialize an MPD document. Grounded on the teacher's `pub fn parse(xml: &str) -> Result<MPD>`,
/// using `serde_path_to_error` so a malformed manifest reports the failing element path instead of
/// only a byte offset.
pub fn parse(xml: &str) -> Result<MPD> {
    let mut de = quick_xml::de::Deserializer::from_str(xml);
    serde_path_to_error::deserialize(&mut de)
        .map_err(|e| ManifestError::manifest_malformed(format!("{e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_static_mpd() {
        let xml = r#"<?xml version="1.0"?>
            <MPD type="static" mediaPresentationDuration="PT10S">
              <Period>
                <AdaptationSet contentType="video">
                  <Representation id="v1" bandwidth="500000">
                    <SegmentTemplate media="s$Number$.mp4" duration="2" timescale="1" startNumber="1"/>
                  </Representation>
                </AdaptationSet>
              </Period>
            </MPD>"#;
        let mpd = parse(xml).unwrap();
        assert_eq!(mpd.mpdtype, "static");
        assert_eq!(mpd.mediaPresentationDuration, Some(10.0));
        assert_eq!(mpd.periods.len(), 1);
        assert_eq!(mpd.periods[0].adaptation_sets[0].representations[0].id.as_deref(), Some("v1"));
    }

    #[test]
    fn xs_duration_parses_hours_minutes_seconds() {
        assert_eq!(parse_xs_duration("PT1H2M3S").unwrap(), 3723.0);
        assert_eq!(parse_xs_duration("PT30S").unwrap(), 30.0);
    }
}
