//! §3.1/§3.5 — the uniform `Manifest`/`Variant`/`Stream` model both parsers populate.
//!
//! No direct teacher analogue: the teacher's output is a one-shot `Vec<Url>` handed to a
//! downloader, not a live, queryable presentation description. Grounded on the "record of
//! renditions" shape visible in `other_examples/5416b44c_raibu-stream-hls-playlist__src-playlist.rs.rs`
//! (`MultivariantPlaylist`/`RenditionGroup`/`*Rendition` structs), generalized so DASH and HLS
//! populate the same types.

use crate::segment_index::SegmentIndex;
use crate::timeline::PresentationTimeline;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Audio,
    Video,
    Text,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Dash,
    Hls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HdrRange {
    Sdr,
    Hdr10,
    Hlg,
    DolbyVision,
}

/// A single protection system attached to a `Stream` (§4.4.7: "common values are mapped to
/// key-system identifiers and CENC init-data is attached to the stream"). This is metadata only —
/// decrypting media with it is a non-goal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrmInfo {
    /// EME-style reverse-domain identifier, e.g. `com.widevine.alpha`. `None` when the scheme URI
    /// is recognized as CENC protection-signaling only (`urn:mpeg:dash:mp4protection:2011`) and
    /// carries no specific key system of its own.
    pub key_system: Option<String>,
    pub scheme_id_uri: String,
    pub default_kid: Option<String>,
}

/// A single Representation / HLS rendition of one content type.
///
/// Streams that share underlying segmentation must be reference-equal across the variants that
/// hold them (§3.5); callers therefore always hold a `Stream` behind an `Arc` and clone the `Arc`,
/// never construct a second `Stream` for the same underlying playlist/Representation.
pub struct Stream {
    pub id: String,
    pub content_type: ContentType,
    pub codecs: Option<String>,
    pub mime_type: Option<String>,
    pub language: Option<String>,
    pub label: Option<String>,
    pub roles: Vec<String>,
    pub frame_rate: Option<f64>,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub channel_count: Option<u32>,
    pub hdr_range: Option<HdrRange>,
    pub bandwidth: Option<u64>,
    pub group_id: Option<String>,
    pub closed_captions: Vec<(String, String)>,
    pub drm_info: Vec<DrmInfo>,
    /// Lazily created on first `create_segment_index()`, per §3.5 ("a segment-index factory; lazy,
    /// created on first `createSegmentIndex()` call").
    segment_index: Mutex<Option<Arc<Mutex<SegmentIndex>>>>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("content_type", &self.content_type)
            .field("codecs", &self.codecs)
            .field("language", &self.language)
            .finish_non_exhaustive()
    }
}

impl Stream {
    pub fn new(id: impl Into<String>, content_type: ContentType) -> Self {
        Stream {
            id: id.into(),
            content_type,
            codecs: None,
            mime_type: None,
            language: None,
            label: None,
            roles: Vec::new(),
            frame_rate: None,
            width: None,
            height: None,
            channel_count: None,
            hdr_range: None,
            bandwidth: None,
            group_id: None,
            closed_captions: Vec::new(),
            drm_info: Vec::new(),
            segment_index: Mutex::new(None),
        }
    }

    /// Returns the existing index if one was already created for this stream, else builds one
    /// via `factory` and stores it so subsequent calls (and other variants sharing this stream)
    /// see the same instance.
    pub fn get_or_create_segment_index(
        &self,
        factory: impl FnOnce() -> crate::error::Result<SegmentIndex>,
    ) -> crate::error::Result<Arc<Mutex<SegmentIndex>>> {
        let mut slot = self.segment_index.lock().unwrap();
        if let Some(existing) = &*slot {
            return Ok(existing.clone());
        }
        let idx = Arc::new(Mutex::new(factory()?));
        *slot = Some(idx.clone());
        Ok(idx)
    }

    pub fn segment_index(&self) -> Option<Arc<Mutex<SegmentIndex>>> {
        self.segment_index.lock().unwrap().clone()
    }
}

/// A pairing of zero-or-one audio and zero-or-one video stream (§3.1). HLS terminology
/// generalized, per the glossary, to also describe a DASH AdaptationSet pairing.
#[derive(Debug, Clone)]
pub struct Variant {
    pub id: String,
    pub bandwidth: Option<u64>,
    pub language: Option<String>,
    pub audio: Option<Arc<Stream>>,
    pub video: Option<Arc<Stream>>,
}

impl Variant {
    /// §3.1: "variant bandwidth is AVERAGE-BANDWIDTH if present, else BANDWIDTH" — callers pass
    /// the already-resolved value in; this just documents the invariant at the type that carries it.
    pub fn effective_bandwidth(&self) -> Option<u64> {
        self.bandwidth
    }
}

pub struct Manifest {
    pub kind: ManifestKind,
    pub timeline: Arc<PresentationTimeline>,
    pub variants: Vec<Variant>,
    pub text_streams: Vec<Arc<Stream>>,
    pub image_streams: Vec<Arc<Stream>>,
    pub sequence_mode: bool,
}

impl Manifest {
    pub fn new(kind: ManifestKind, timeline: Arc<PresentationTimeline>) -> Self {
        Manifest {
            kind,
            timeline,
            variants: Vec::new(),
            text_streams: Vec::new(),
            image_streams: Vec::new(),
            sequence_mode: false,
        }
    }

    pub fn is_live(&self) -> bool {
        self.timeline.is_live()
    }
}
