//! C5 — builds a manifest and its streams from master and media HLS playlists.
//!
//! No teacher analogue; grounded on `other_examples/5416b44c_raibu-stream-hls-playlist__src-playlist.rs.rs`'s
//! `RenditionGroup`/`VideoRendition`/`AudioRendition` modeling for the master-playlist pairing
//! pass, and on the teacher's `is_audio_adaptation`/`is_video_adaptation` predicate style in
//! `fetch.rs` for content-type classification, generalized to HLS's `GROUP-ID` pairing.

use crate::clock::SharedClock;
use crate::config::Config;
use crate::error::{ManifestError, Result};
use crate::hls::tag::{Playlist, PlaylistType};
use crate::manifest::{ContentType, Manifest, ManifestKind, Stream, Variant};
use crate::net::{Request, RequestType, SharedNetworkingEngine, SharedPlayerInterface};
use crate::scheduler::{UpdateOutcome, UpdateScheduler};
use crate::segment_index::{ByteRange, KeyHandle, SegmentIndex, SegmentReference, SegmentStatus};
use crate::timeline::{PresentationTimeline, PresentationType};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, instrument};

struct RenditionGroupEntry {
    uri: Option<String>,
    language: Option<String>,
    /// CLOSED-CAPTIONS renditions carry no URI; this is the in-band CEA-608/708 channel they name.
    instream_id: Option<String>,
}

struct MasterPlaylistInfo {
    variants: Vec<VariantDecl>,
    groups: HashMap<(String, String), Vec<RenditionGroupEntry>>,
    independent_segments: bool,
    /// §4.5.6 — `METHOD` of every `EXT-X-SESSION-KEY` declared at master level.
    session_key_methods: Vec<String>,
    image_streams: Vec<ImageStreamDecl>,
}

/// A `#EXT-X-IMAGE-STREAM-INF` tile/thumbnail stream declaration.
struct ImageStreamDecl {
    uri: String,
    bandwidth: Option<u64>,
    codecs: Vec<String>,
}

struct VariantDecl {
    uri: String,
    bandwidth: u64,
    codecs: Vec<String>,
    audio_group: Option<String>,
    video_group: Option<String>,
    subtitles_group: Option<String>,
    closed_captions_group: Option<String>,
}

/// §4.5.2: a variant whose `CODECS` names both an audio and a video codec with no `AUDIO` group
/// attribute is a single multiplexed stream — its one playlist carries both tracks, so no separate
/// audio `Stream`/pairing should ever be created for it.
fn is_multiplexed_variant(v: &VariantDecl) -> bool {
    v.audio_group.is_none() && v.codecs.iter().any(|c| codec_is_video(c)) && v.codecs.iter().any(|c| codec_is_audio(c))
}

fn codec_is_video(codec: &str) -> bool {
    let c = codec.to_ascii_lowercase();
    c.starts_with("avc1")
        || c.starts_with("avc3")
        || c.starts_with("hev1")
        || c.starts_with("hvc1")
        || c.starts_with("dvh1")
        || c.starts_with("dvhe")
        || c.starts_with("vp09")
        || c.starts_with("vp9")
        || c.starts_with("av01")
}

fn codec_is_audio(codec: &str) -> bool {
    let c = codec.to_ascii_lowercase();
    c.starts_with("mp4a") || c.starts_with("ac-3") || c.starts_with("ec-3") || c.starts_with("opus") || c.starts_with("flac") || c.starts_with("alac")
}

/// §4.5.2/§4.5.6 codec -> container MIME type mapping.
fn mime_type_for_codec(codec: &str) -> Result<&'static str> {
    let c = codec.to_ascii_lowercase();
    if c.starts_with("avc1") || c.starts_with("avc3") || c.starts_with("hev1") || c.starts_with("hvc1") || c.starts_with("dvh1") || c.starts_with("dvhe") || c.starts_with("vp09") || c.starts_with("av01")
    {
        return Ok("video/mp4");
    }
    if c == "mp4a.40.34" {
        return Ok("audio/mpeg");
    }
    if c.starts_with("mp4a") || c.starts_with("ac-3") || c.starts_with("ec-3") || c.starts_with("opus") || c.starts_with("flac") || c.starts_with("alac") {
        return Ok("audio/mp4");
    }
    Err(ManifestError::HlsCouldNotGuessMimeType)
}


pub struct HlsParser {
    networking: SharedNetworkingEngine,
    player: SharedPlayerInterface,
    config: Config,
    clock: SharedClock,
    manifest: Mutex<Option<Arc<Manifest>>>,
    streams_by_uri: Mutex<HashMap<String, Arc<Stream>>>,
    schedulers: Mutex<Vec<UpdateScheduler>>,
    /// §4.5.3 — variables defined by the master playlist's own `EXT-X-DEFINE`, available for a
    /// child media playlist's `EXT-X-DEFINE:IMPORT="..."` to pull in.
    master_vars: Mutex<HashMap<String, String>>,
    /// §5/§6.3 — `stop()` flips this so an initial fetch still in flight aborts rather than
    /// publishing a manifest after the caller has already walked away.
    stop_signal: tokio::sync::watch::Sender<bool>,
}

impl HlsParser {
    pub fn new(networking: SharedNetworkingEngine, player: SharedPlayerInterface, config: Config, clock: SharedClock) -> Arc<Self> {
        let (stop_signal, _) = tokio::sync::watch::channel(false);
        Arc::new(HlsParser {
            networking,
            player,
            config,
            clock,
            manifest: Mutex::new(None),
            streams_by_uri: Mutex::new(HashMap::new()),
            schedulers: Mutex::new(Vec::new()),
            master_vars: Mutex::new(HashMap::new()),
            stop_signal,
        })
    }

    pub fn stop(&self) {
        let _ = self.stop_signal.send(true);
        for s in self.schedulers.lock().unwrap().drain(..) {
            s.stop();
        }
    }

    /// Races `fut` against `stop()`, rejecting with [`ManifestError::OperationAborted`] if `stop()`
    /// is called (or was already called) before `fut` resolves.
    async fn abortable<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        let mut rx = self.stop_signal.subscribe();
        if *rx.borrow() {
            return Err(ManifestError::OperationAborted);
        }
        tokio::select! {
            res = fut => res,
            _ = rx.changed() => Err(ManifestError::OperationAborted),
        }
    }

    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>, uri: &str) -> Result<Arc<Manifest>> {
        let resp = self.abortable(self.networking.request(Request::new(RequestType::Manifest, vec![uri.to_string()]))).await?;
        let body = String::from_utf8_lossy(&resp.data).to_string();
        let (body, vars) = crate::hls::tag::substitute_variables(&body, &HashMap::new())?;
        *self.master_vars.lock().unwrap() = vars;
        let pl = crate::hls::tag::tokenize(&body, &resp.uri)?;

        let manifest = match pl.playlist_type {
            PlaylistType::Master => self.build_from_master(&pl, &resp.uri).await?,
            PlaylistType::Media => self.build_from_single_media_playlist(&pl, &resp.uri).await?,
        };
        let manifest = Arc::new(manifest);
        *self.manifest.lock().unwrap() = Some(manifest.clone());
        self.player.on_manifest_updated().await;
        self.player.filter(&manifest).await;
        Ok(manifest)
    }

    async fn build_from_master(self: &Arc<Self>, pl: &Playlist, base_uri: &str) -> Result<Manifest> {
        let info = parse_master_playlist(pl, base_uri, &self.config)?;

        // §4.5.6: without per-variant media-playlist inspection this is a master-level best-effort
        // gate against EXT-X-SESSION-KEY only — the authoritative per-stream gate lives in
        // `populate_media_playlist`, which sees each playlist's actual EXT-X-KEY.
        if !info.session_key_methods.is_empty() && info.session_key_methods.iter().all(|m| m == "AES-128") {
            return Err(ManifestError::NoWebCryptoApi);
        }

        let referenced_subtitle_groups: std::collections::HashSet<&str> = info.variants.iter().filter_map(|v| v.subtitles_group.as_deref()).collect();

        // Hint the codec a rendition group's Stream should report, from the first variant that
        // references it — EXT-X-MEDIA entries carry no CODECS attribute of their own.
        let mut audio_codec_hint: HashMap<&str, &str> = HashMap::new();
        for v in &info.variants {
            if let Some(g) = &v.audio_group {
                if let Some(c) = v.codecs.iter().find(|c| codec_is_audio(c)) {
                    audio_codec_hint.entry(g.as_str()).or_insert(c.as_str());
                }
            }
        }

        let timeline = Arc::new(PresentationTimeline::new(self.clock.clone(), PresentationType::Static));
        let mut manifest = Manifest::new(ManifestKind::Hls, timeline);

        // Materialize one Stream per unique rendition URI, reference-shared across groups.
        let mut group_streams: HashMap<(String, String), Vec<(Option<String>, Arc<Stream>)>> = HashMap::new();
        let mut closed_caption_groups: HashMap<String, Vec<(String, String)>> = HashMap::new();
        for (key, entries) in &info.groups {
            let (kind, group_id) = key;
            if kind == "CLOSED-CAPTIONS" {
                if !self.config.disable_text {
                    closed_caption_groups.insert(
                        group_id.clone(),
                        entries
                            .iter()
                            .filter_map(|e| Some((e.language.clone().unwrap_or_default(), e.instream_id.clone()?)))
                            .collect(),
                    );
                }
                continue;
            }
            if (kind == "AUDIO" && self.config.disable_audio)
                || (kind == "SUBTITLES" && self.config.disable_text)
                || (kind == "VIDEO" && self.config.disable_video)
            {
                continue;
            }
            let content_type = match kind.as_str() {
                "AUDIO" => ContentType::Audio,
                "SUBTITLES" => ContentType::Text,
                _ => ContentType::Video,
            };
            let mime = if kind == "AUDIO" {
                audio_codec_hint.get(group_id.as_str()).and_then(|c| mime_type_for_codec(c).ok())
            } else {
                None
            };
            let mut list = Vec::new();
            for entry in entries {
                let Some(uri) = &entry.uri else { continue };
                let language = entry.language.clone();
                let stream = self.stream_for_uri(uri, content_type, |s| {
                    s.language = language.clone();
                    s.mime_type = mime.map(str::to_string);
                });
                list.push((entry.language.clone(), stream));
            }
            if kind == "SUBTITLES" && referenced_subtitle_groups.contains(group_id.as_str()) {
                for (_, s) in &list {
                    manifest.text_streams.push(s.clone());
                }
            }
            group_streams.insert((kind.clone(), group_id.clone()), list);
        }

        for v in &info.variants {
            if is_multiplexed_variant(v) {
                debug!(uri = %v.uri, "CODECS names audio and video with no AUDIO group; treating as a multiplexed stream");
            }

            let bandwidth = v.bandwidth;
            let codecs = v.codecs.join(",");
            let video_codec = v.codecs.iter().find(|c| codec_is_video(c));
            // §4.5.2: an omitted CODECS attribute is common on low-effort playlists; rather than
            // sniff the rendition's (always-a-playlist) URI for a container that isn't there, fall
            // back to the configured default container MIME type (§6.3).
            let video_mime = match video_codec {
                Some(c) => Some(mime_type_for_codec(c)?.to_string()),
                None if v.codecs.is_empty() => Some(self.config.hls_media_playlist_full_mime_type.clone()),
                None => None,
            };
            let cc_entries = v.closed_captions_group.as_ref().and_then(|g| closed_caption_groups.get(g)).cloned().unwrap_or_default();
            let video_stream = self.stream_for_uri(&v.uri, ContentType::Video, |s| {
                s.bandwidth = Some(bandwidth);
                s.codecs = Some(codecs);
                s.mime_type = video_mime;
                s.closed_captions = cc_entries;
            });

            let audio_candidates: Vec<Arc<Stream>> = v
                .audio_group
                .as_ref()
                .and_then(|g| group_streams.get(&("AUDIO".to_string(), g.clone())))
                .map(|list| list.iter().map(|(_, s)| s.clone()).collect())
                .unwrap_or_default();

            let video_candidates: Vec<Arc<Stream>> = v
                .video_group
                .as_ref()
                .and_then(|g| group_streams.get(&("VIDEO".to_string(), g.clone())))
                .map(|list| list.iter().map(|(_, s)| s.clone()).collect())
                .filter(|list: &Vec<Arc<Stream>>| !list.is_empty())
                .unwrap_or_else(|| vec![video_stream.clone()]);

            let variant_id = |vs: &Arc<Stream>, a: Option<&Arc<Stream>>| match (vs.id == v.uri, a) {
                (true, None) => v.uri.clone(),
                (_, None) => format!("{}-{}", v.uri, vs.id),
                (true, Some(a)) => format!("{}-{}", v.uri, a.id),
                (false, Some(a)) => format!("{}-{}-{}", v.uri, vs.id, a.id),
            };

            if audio_candidates.is_empty() {
                for vs in &video_candidates {
                    manifest.variants.push(Variant {
                        id: variant_id(vs, None),
                        bandwidth: Some(v.bandwidth),
                        language: None,
                        audio: None,
                        video: Some(vs.clone()),
                    });
                }
            } else {
                for a in &audio_candidates {
                    for vs in &video_candidates {
                        manifest.variants.push(Variant {
                            id: variant_id(vs, Some(a)),
                            bandwidth: Some(v.bandwidth),
                            language: a.language.clone(),
                            audio: Some(a.clone()),
                            video: Some(vs.clone()),
                        });
                    }
                }
            }
        }

        if !self.config.disable_thumbnails {
            for img in &info.image_streams {
                let bandwidth = img.bandwidth;
                let codecs = img.codecs.join(",");
                let stream = self.stream_for_uri(&img.uri, ContentType::Image, |s| {
                    s.bandwidth = bandwidth;
                    s.codecs = if codecs.is_empty() { None } else { Some(codecs) };
                });
                manifest.image_streams.push(stream);
            }
        }

        manifest.sequence_mode = self.config.hls_sequence_mode;
        if info.independent_segments {
            debug!("playlist declares EXT-X-INDEPENDENT-SEGMENTS; every segment is independently decodable");
        }
        Ok(manifest)
    }

    /// A playlist fetched directly at `start(uri)` turns out to be a media playlist rather than a
    /// master; treat it as a single-variant presentation.
    async fn build_from_single_media_playlist(self: &Arc<Self>, pl: &Playlist, base_uri: &str) -> Result<Manifest> {
        let timeline = Arc::new(PresentationTimeline::new(self.clock.clone(), PresentationType::Static));
        let mut manifest = Manifest::new(ManifestKind::Hls, timeline.clone());
        let stream = self.stream_for_uri(base_uri, ContentType::Video, |_| {});
        self.populate_media_playlist(&stream, pl, base_uri, &timeline).await?;
        manifest.variants.push(Variant {
            id: base_uri.to_string(),
            bandwidth: stream.bandwidth,
            language: None,
            audio: None,
            video: Some(stream),
        });
        Ok(manifest)
    }

    /// Returns the shared `Stream` for `uri`, creating and `configure`-ing it on first reference
    /// so that every variant pairing referring to the same underlying playlist sees the same
    /// `Arc` identity (§3.5, §3.6). `configure` only runs at construction time since `Stream`'s
    /// fields are otherwise append-only once published behind an `Arc`.
    fn stream_for_uri(&self, uri: &str, content_type: ContentType, configure: impl FnOnce(&mut Stream)) -> Arc<Stream> {
        let mut cache = self.streams_by_uri.lock().unwrap();
        if let Some(existing) = cache.get(uri) {
            return existing.clone();
        }
        let mut stream = Stream::new(uri, content_type);
        configure(&mut stream);
        let arc = Arc::new(stream);
        cache.insert(uri.to_string(), arc.clone());
        arc
    }

    /// §4.5.3 — the deferred, per-stream media-playlist pass. Public so a host can trigger it
    /// explicitly (mirroring `createSegmentIndex()` in §3.5/§6.3), and used internally for the
    /// single-media-playlist `start()` path.
    #[instrument(skip(self, timeline))]
    pub async fn create_segment_index(self: &Arc<Self>, stream: &Arc<Stream>, timeline: &Arc<PresentationTimeline>) -> Result<()> {
        let uri = stream.id.clone();
        let resp = self.networking.request(Request::new(RequestType::Segment, vec![uri.clone()])).await?;
        let body = String::from_utf8_lossy(&resp.data).to_string();
        let imported = self.master_vars.lock().unwrap().clone();
        let (body, _) = crate::hls::tag::substitute_variables(&body, &imported)?;
        let pl = crate::hls::tag::tokenize(&body, &resp.uri)?;
        self.populate_media_playlist(stream, &pl, &resp.uri, timeline).await
    }

    async fn populate_media_playlist(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        pl: &Playlist,
        base_uri: &str,
        timeline: &Arc<PresentationTimeline>,
    ) -> Result<()> {
        let mut parsed = parse_media_playlist(pl, base_uri, &self.config)?;

        // §4.5.6: this crate never decrypts media (non-goal), so a stream this engine has already
        // committed to playing that turns out to require a cipher it has no primitive for is fatal
        // to that stream rather than something to silently mux around.
        if parsed.has_sample_aes_ctr {
            return Err(ManifestError::HlsMseEncryptedMp2tNotSupported);
        }
        if parsed.has_aes128 {
            return Err(ManifestError::HlsAes128EncryptionNotSupported);
        }

        // §4.5.4: anchor startTime[0] (and every subsequent reference, since they're built as a
        // running sum from it) to the first segment's actual container PTS rather than 0.
        if stream.segment_index().is_none() {
            if let Some(offset) = self.probe_initial_pts(&parsed.refs).await {
                for r in &mut parsed.refs {
                    r.start_time += offset;
                    r.end_time += offset;
                }
            }
        }

        timeline.set_max_segment_duration(parsed.target_duration);
        if parsed.is_live {
            timeline.set_static(false);
        } else {
            let total: f64 = parsed.refs.iter().map(|r| r.end_time - r.start_time).sum();
            timeline.set_duration(total);
        }

        let first_position = parsed.media_sequence as i64;
        stream.get_or_create_segment_index(|| Ok(SegmentIndex::new(first_position, parsed.refs)))?;

        if parsed.is_live {
            self.arm_live_refresh(stream.clone(), base_uri.to_string(), timeline.clone(), parsed.target_duration);
        }
        Ok(())
    }

    /// §4.5.4 — fetches the first segment's init segment (if fMP4) and leading bytes, and probes
    /// its container for the real initial PTS. Best-effort: any fetch or parse failure leaves the
    /// playlist's own `startTime[0]` (0) unchanged rather than failing the whole parse.
    async fn probe_initial_pts(&self, refs: &[SegmentReference]) -> Option<f64> {
        let first = refs.first()?;
        if let Some(init) = &first.init_segment {
            let init_bytes = self.fetch_ranged(init.uris.first()?, init.byte_range).await.ok()?;
            let seg_bytes = self.fetch_ranged(first.uris.first()?, first.byte_range).await.ok()?;
            crate::hls::probe::probe_fmp4_initial_pts(&init_bytes, &seg_bytes).ok()
        } else {
            let seg_bytes = self.fetch_ranged(first.uris.first()?, first.byte_range).await.ok()?;
            crate::hls::probe::probe_ts_initial_pts(&seg_bytes).ok()
        }
    }

    async fn fetch_ranged(&self, uri: &str, byte_range: Option<ByteRange>) -> Result<bytes::Bytes> {
        let mut req = Request::new(RequestType::Segment, vec![uri.to_string()]);
        req.byte_range = byte_range.map(|br| crate::net::ByteRangeRequest { start: br.start, end: Some(br.end) });
        Ok(self.networking.request(req).await?.data)
    }

    fn arm_live_refresh(self: &Arc<Self>, stream: Arc<Stream>, uri: String, timeline: Arc<PresentationTimeline>, target_duration: f64) {
        let this = self.clone();
        let interval = Duration::from_secs_f64(target_duration.max(1.0));
        let scheduler = UpdateScheduler::new(interval, move || {
            let this = this.clone();
            let stream = stream.clone();
            let uri = uri.clone();
            let timeline = timeline.clone();
            async move {
                let start = std::time::Instant::now();
                if let Err(e) = this.refresh_live_stream(&stream, &uri, &timeline).await {
                    this.player.on_error(&e).await;
                }
                UpdateOutcome { measured: start.elapsed(), nominal: None }
            }
        });
        scheduler.tick_after(interval);
        self.schedulers.lock().unwrap().push(scheduler);
    }

    async fn refresh_live_stream(self: &Arc<Self>, stream: &Arc<Stream>, uri: &str, timeline: &Arc<PresentationTimeline>) -> Result<()> {
        let resp = self.networking.request(Request::new(RequestType::Segment, vec![uri.to_string()])).await?;
        let body = String::from_utf8_lossy(&resp.data).to_string();
        let imported = self.master_vars.lock().unwrap().clone();
        let (body, _) = crate::hls::tag::substitute_variables(&body, &imported)?;
        let pl = crate::hls::tag::tokenize(&body, &resp.uri)?;
        let parsed = parse_media_playlist(&pl, &resp.uri, &self.config)?;
        if let Some(idx) = stream.segment_index() {
            let availability_start = timeline.get_segment_availability_start();
            idx.lock().unwrap().merge(parsed.media_sequence as i64, parsed.refs, availability_start);
        }
        debug!(uri, "HLS live playlist refreshed");
        Ok(())
    }
}

fn parse_master_playlist(pl: &Playlist, base_uri: &str, config: &Config) -> Result<MasterPlaylistInfo> {
    let mut variants = Vec::new();
    let mut groups: HashMap<(String, String), Vec<RenditionGroupEntry>> = HashMap::new();
    let mut independent_segments = false;
    let mut session_key_methods = Vec::new();
    let mut image_streams = Vec::new();

    let mut i = 0;
    while i < pl.tags.len() {
        let tag = &pl.tags[i];
        match tag.name.as_str() {
            "EXT-X-INDEPENDENT-SEGMENTS" => independent_segments = true,
            "EXT-X-SESSION-KEY" => {
                session_key_methods.push(tag.attr("METHOD").map(|v| v.as_str().to_string()).unwrap_or_default());
            }
            "EXT-X-STREAM-INF" => {
                let bandwidth = tag
                    .attr("BANDWIDTH")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| ManifestError::HlsRequiredAttributeMissing("BANDWIDTH".to_string()))?;
                let bandwidth = tag.attr("AVERAGE-BANDWIDTH").and_then(|v| v.as_u64()).unwrap_or(bandwidth);
                let codecs = dedup_codecs(tag.attr("CODECS").map(|v| v.as_str()).unwrap_or(""));
                let uri = pl
                    .tags
                    .get(i + 1)
                    .filter(|t| t.name == "EXT-X-URI")
                    .and_then(|t| t.value.clone())
                    .ok_or_else(|| ManifestError::manifest_malformed("EXT-X-STREAM-INF not followed by a URI line"))?;
                variants.push(VariantDecl {
                    uri: resolve(base_uri, &uri),
                    bandwidth,
                    codecs,
                    audio_group: tag.attr("AUDIO").map(|v| v.as_str().to_string()),
                    video_group: tag.attr("VIDEO").map(|v| v.as_str().to_string()),
                    subtitles_group: tag.attr("SUBTITLES").map(|v| v.as_str().to_string()),
                    closed_captions_group: tag.attr("CLOSED-CAPTIONS").map(|v| v.as_str().to_string()),
                });
            }
            "EXT-X-IMAGE-STREAM-INF" => {
                let uri = tag.attr("URI").map(|v| v.as_str().to_string());
                match uri {
                    Some(uri) => image_streams.push(ImageStreamDecl {
                        uri: resolve(base_uri, &uri),
                        bandwidth: tag.attr("BANDWIDTH").and_then(|v| v.as_u64()),
                        codecs: dedup_codecs(tag.attr("CODECS").map(|v| v.as_str()).unwrap_or("")),
                    }),
                    None if config.hls_ignore_image_stream_failures => {}
                    None => return Err(ManifestError::HlsRequiredAttributeMissing("URI".to_string())),
                }
            }
            "EXT-X-MEDIA" => {
                let kind = tag.attr("TYPE").map(|v| v.as_str().to_string()).unwrap_or_default();
                let group_id = tag.attr("GROUP-ID").map(|v| v.as_str().to_string()).unwrap_or_default();
                let uri = tag.attr("URI").map(|v| v.as_str().to_string());
                if uri.is_none() && kind != "VIDEO" {
                    let ignorable = kind == "SUBTITLES" && config.hls_ignore_text_stream_failures;
                    if !ignorable && kind != "CLOSED-CAPTIONS" {
                        return Err(ManifestError::HlsRequiredAttributeMissing("URI".to_string()));
                    }
                }
                groups.entry((kind, group_id)).or_default().push(RenditionGroupEntry {
                    uri: uri.map(|u| resolve(base_uri, &u)),
                    language: tag.attr("LANGUAGE").map(|v| v.as_str().to_string()),
                    instream_id: tag.attr("INSTREAM-ID").map(|v| v.as_str().to_string()),
                });
            }
            _ => {}
        }
        i += 1;
    }

    Ok(MasterPlaylistInfo { variants, groups, independent_segments, session_key_methods, image_streams })
}

fn dedup_codecs(codecs: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    codecs
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.clone()))
        .collect()
}

struct ParsedMediaPlaylist {
    target_duration: f64,
    media_sequence: u64,
    is_live: bool,
    refs: Vec<SegmentReference>,
    has_aes128: bool,
    has_sample_aes_ctr: bool,
}

/// §4.5.3. Walks tags in document order, carrying forward the "applies from this line forward"
/// state (`MAP`, `KEY`, byte-range cursor, discontinuity sequence) and matching it to each
/// `SegmentRecord` by comparing tag ids.
fn parse_media_playlist(pl: &Playlist, base_uri: &str, config: &Config) -> Result<ParsedMediaPlaylist> {
    let mut target_duration = 6.0;
    let mut media_sequence = 0u64;
    let mut has_endlist = false;
    let mut is_vod = false;

    let mut current_map: Option<Arc<crate::segment_index::InitSegmentReference>> = None;
    let mut current_key: Option<Arc<KeyHandle>> = None;
    let mut byte_range_cursor: u64 = 0;
    let mut discontinuity_sequence: u64 = 0;
    let mut cumulative_at_discontinuity: f64 = 0.0;
    let mut gap_pending = false;
    let mut program_date_time: Option<DateTime<Utc>> = None;
    let mut tiles_layout: Option<String> = None;

    let mut refs = Vec::new();
    let mut cumulative = 0.0;
    let mut segment_idx = 0usize;
    let mut has_aes128 = false;
    let mut has_sample_aes_ctr = false;

    for tag in &pl.tags {
        match tag.name.as_str() {
            "EXT-X-TARGETDURATION" => {
                target_duration = tag.value.as_deref().unwrap_or("6").parse().unwrap_or(6.0);
            }
            "EXT-X-MEDIA-SEQUENCE" => {
                media_sequence = tag.value.as_deref().unwrap_or("0").parse().unwrap_or(0);
            }
            "EXT-X-PLAYLIST-TYPE" => {
                is_vod = tag.value.as_deref() == Some("VOD");
            }
            "EXT-X-ENDLIST" => has_endlist = true,
            "EXT-X-MAP" => {
                let uri = tag.attr("URI").map(|v| v.as_str().to_string()).ok_or_else(|| ManifestError::HlsRequiredAttributeMissing("URI".to_string()))?;
                let byte_range = tag.attr("BYTERANGE").and_then(|v| parse_byte_range(v.as_str(), 0));
                current_map = Some(Arc::new(crate::segment_index::InitSegmentReference {
                    uris: vec![resolve(base_uri, &uri)],
                    byte_range,
                }));
            }
            "EXT-X-KEY" => {
                let method = tag.attr("METHOD").map(|v| v.as_str().to_string()).unwrap_or_default();
                if method == "NONE" {
                    current_key = None;
                } else if method == "AES-128" {
                    let uri = tag.attr("URI").map(|v| v.as_str().to_string()).unwrap_or_default();
                    current_key = Some(Arc::new(KeyHandle { uri: resolve(base_uri, &uri), iv: None }));
                    has_aes128 = true;
                } else if method == "SAMPLE-AES-CTR" || method == "SAMPLE-AES" {
                    has_sample_aes_ctr = true;
                }
            }
            "EXT-X-DISCONTINUITY" => {
                discontinuity_sequence += 1;
                cumulative_at_discontinuity = cumulative;
            }
            "EXT-X-PROGRAM-DATE-TIME" => {
                if !config.hls_ignore_manifest_program_date_time {
                    program_date_time = tag.value.as_deref().and_then(|v| DateTime::parse_from_rfc3339(v).ok()).map(|d| d.with_timezone(&Utc));
                }
            }
            "EXT-X-GAP" => gap_pending = true,
            "EXT-X-TILES" => tiles_layout = tag.value.clone(),
            "EXT-X-BYTERANGE" => {
                // recorded at segment-record time below via the record's own tags
            }
            "EXTINF" => {
                let record = &pl.segments[segment_idx];
                segment_idx += 1;
                let duration: f64 = tag.value.as_deref().and_then(|v| v.split(',').next()).and_then(|d| d.parse().ok()).unwrap_or(0.0);

                let byte_range = record
                    .tags
                    .iter()
                    .find(|t| t.name == "EXT-X-BYTERANGE")
                    .and_then(|t| parse_byte_range(t.value.as_deref().unwrap_or(""), byte_range_cursor));
                if let Some(br) = &byte_range {
                    byte_range_cursor = br.end + 1;
                }

                let start = cumulative;
                let end = cumulative + duration;
                cumulative = end;

                let mut seg = SegmentReference::new(start, end, vec![resolve(base_uri, &record.uri)]);
                seg.byte_range = byte_range;
                seg.init_segment = current_map.clone();
                seg.key = current_key.clone();
                seg.discontinuity_sequence = discontinuity_sequence;
                seg.timestamp_offset = cumulative_at_discontinuity;
                seg.tiles_layout = tiles_layout.clone();
                seg.sync_time = program_date_time;
                seg.status = if gap_pending { SegmentStatus::Missing } else { SegmentStatus::Available };
                gap_pending = false;

                refs.push(seg);
            }
            _ => {}
        }
    }

    let is_live = !has_endlist && !is_vod;
    Ok(ParsedMediaPlaylist { target_duration, media_sequence, is_live, refs, has_aes128, has_sample_aes_ctr })
}

/// Parses `"<length>@<offset>"` or `"<length>"` (offset continues after `default_offset`), per
/// §4.5.3: "when the `@offset` is omitted, the segment starts immediately after the previous byte
/// range on the same URI."
fn parse_byte_range(s: &str, default_offset: u64) -> Option<ByteRange> {
    if s.is_empty() {
        return None;
    }
    let (len_str, offset) = match s.split_once('@') {
        Some((l, o)) => (l, o.parse().ok()?),
        None => (s, default_offset),
    };
    let len: u64 = len_str.parse().ok()?;
    Some(ByteRange::new(offset, offset + len - 1))
}

fn resolve(base: &str, rel: &str) -> String {
    if rel.starts_with("http://") || rel.starts_with("https://") {
        return rel.to_string();
    }
    url::Url::parse(base).and_then(|b| b.join(rel)).map(|u| u.to_string()).unwrap_or_else(|_| rel.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::tag::tokenize;

    #[test]
    fn parses_byte_range_with_explicit_offset() {
        let br = parse_byte_range("616@0", 999).unwrap();
        assert_eq!(br.start, 0);
        assert_eq!(br.end, 615);
    }

    #[test]
    fn parses_byte_range_continuing_from_previous() {
        let br = parse_byte_range("121090", 616).unwrap();
        assert_eq!(br.start, 616);
        assert_eq!(br.end, 616 + 121090 - 1);
    }

    #[test]
    fn s5_media_playlist_vod_with_map_and_byteranges() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-PLAYLIST-TYPE:VOD\n#EXT-X-MAP:URI=\"init.mp4\",BYTERANGE=\"616@0\"\n#EXTINF:5,\n#EXT-X-BYTERANGE:121090@616\nmain.mp4\n#EXT-X-ENDLIST\n";
        let pl = tokenize(text, "http://x/media.m3u8").unwrap();
        let parsed = parse_media_playlist(&pl, "http://x/media.m3u8", &Config::default()).unwrap();
        assert!(!parsed.is_live);
        assert_eq!(parsed.refs.len(), 1);
        let seg = &parsed.refs[0];
        assert_eq!(seg.start_time, 0.0);
        assert_eq!(seg.end_time, 5.0);
        assert_eq!(seg.byte_range.unwrap(), ByteRange::new(616, 121705));
        assert_eq!(seg.init_segment.as_ref().unwrap().byte_range.unwrap(), ByteRange::new(0, 615));
    }

    #[test]
    fn s6_discontinuity_sequence_and_timestamp_offset() {
        let text = concat!(
            "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-PLAYLIST-TYPE:VOD\n",
            "#EXTINF:3,\nseg0.ts\n#EXTINF:1,\nseg1.ts\n",
            "#EXT-X-DISCONTINUITY\n#EXTINF:2,\nseg2.ts\n#EXTINF:3,\nseg3.ts\n",
            "#EXT-X-DISCONTINUITY\n#EXTINF:1,\nseg4.ts\n#EXTINF:1,\nseg5.ts\n",
            "#EXT-X-DISCONTINUITY\n#EXTINF:4,\nseg6.ts\n#EXT-X-ENDLIST\n"
        );
        let pl = tokenize(text, "http://x/media.m3u8").unwrap();
        let parsed = parse_media_playlist(&pl, "http://x/media.m3u8", &Config::default()).unwrap();
        let sequences: Vec<u64> = parsed.refs.iter().map(|r| r.discontinuity_sequence).collect();
        assert_eq!(sequences, vec![0, 0, 1, 1, 2, 2, 3]);
        let offsets: Vec<f64> = parsed.refs.iter().map(|r| r.timestamp_offset).collect();
        assert_eq!(offsets, vec![0.0, 0.0, 4.0, 4.0, 9.0, 9.0, 11.0]);
    }

    #[test]
    fn gap_tag_marks_next_segment_missing() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-PLAYLIST-TYPE:VOD\n#EXT-X-GAP\n#EXTINF:5,\nmissing.ts\n#EXTINF:5,\npresent.ts\n#EXT-X-ENDLIST\n";
        let pl = tokenize(text, "http://x/media.m3u8").unwrap();
        let parsed = parse_media_playlist(&pl, "http://x/media.m3u8", &Config::default()).unwrap();
        assert_eq!(parsed.refs[0].status, SegmentStatus::Missing);
        assert_eq!(parsed.refs[1].status, SegmentStatus::Available);
    }

    #[test]
    fn missing_bandwidth_is_rejected() {
        let text = "#EXTM3U\n#EXT-X-STREAM-INF:CODECS=\"avc1\"\nlow.m3u8\n";
        let pl = tokenize(text, "http://x/master.m3u8").unwrap();
        let err = parse_master_playlist(&pl, "http://x/master.m3u8", &Config::default()).unwrap_err();
        assert!(matches!(err, ManifestError::HlsRequiredAttributeMissing(a) if a == "BANDWIDTH"));
    }

    #[test]
    fn stream_inf_with_audio_and_video_codecs_and_no_group_is_multiplexed() {
        let v = VariantDecl {
            uri: "http://x/low.m3u8".to_string(),
            bandwidth: 1,
            codecs: vec!["avc1.4d401f".to_string(), "mp4a.40.2".to_string()],
            audio_group: None,
            video_group: None,
            subtitles_group: None,
            closed_captions_group: None,
        };
        assert!(is_multiplexed_variant(&v));
    }

    #[test]
    fn mime_type_for_codec_maps_known_codecs() {
        assert_eq!(mime_type_for_codec("avc1.4d401f").unwrap(), "video/mp4");
        assert_eq!(mime_type_for_codec("mp4a.40.34").unwrap(), "audio/mpeg");
        assert_eq!(mime_type_for_codec("mp4a.40.2").unwrap(), "audio/mp4");
        assert!(mime_type_for_codec("qcelp").is_err());
    }

    #[test]
    fn subtitles_group_not_referenced_by_any_variant_is_not_published() {
        let text = concat!(
            "#EXTM3U\n",
            "#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"subs\",LANGUAGE=\"en\",URI=\"en.m3u8\"\n",
            "#EXT-X-STREAM-INF:BANDWIDTH=1000,CODECS=\"avc1.4d401f\"\n",
            "low.m3u8\n",
        );
        let pl = tokenize(text, "http://x/master.m3u8").unwrap();
        let info = parse_master_playlist(&pl, "http://x/master.m3u8", &Config::default()).unwrap();
        assert!(info.variants[0].subtitles_group.is_none());
        assert!(info.groups.contains_key(&("SUBTITLES".to_string(), "subs".to_string())));
    }

    #[test]
    fn closed_captions_instream_id_is_parsed() {
        let text = concat!(
            "#EXTM3U\n",
            "#EXT-X-MEDIA:TYPE=CLOSED-CAPTIONS,GROUP-ID=\"cc\",LANGUAGE=\"en\",INSTREAM-ID=\"CC1\"\n",
            "#EXT-X-STREAM-INF:BANDWIDTH=1000,CODECS=\"avc1.4d401f\",CLOSED-CAPTIONS=\"cc\"\n",
            "low.m3u8\n",
        );
        let pl = tokenize(text, "http://x/master.m3u8").unwrap();
        let info = parse_master_playlist(&pl, "http://x/master.m3u8", &Config::default()).unwrap();
        assert_eq!(info.variants[0].closed_captions_group.as_deref(), Some("cc"));
        let entries = &info.groups[&("CLOSED-CAPTIONS".to_string(), "cc".to_string())];
        assert_eq!(entries[0].instream_id.as_deref(), Some("CC1"));
    }

    #[test]
    fn all_session_keys_aes128_is_rejected() {
        let text = concat!(
            "#EXTM3U\n",
            "#EXT-X-SESSION-KEY:METHOD=AES-128,URI=\"key.bin\"\n",
            "#EXT-X-STREAM-INF:BANDWIDTH=1000,CODECS=\"avc1.4d401f\"\n",
            "low.m3u8\n",
        );
        let pl = tokenize(text, "http://x/master.m3u8").unwrap();
        let info = parse_master_playlist(&pl, "http://x/master.m3u8", &Config::default()).unwrap();
        assert_eq!(info.session_key_methods, vec!["AES-128".to_string()]);
    }

    #[test]
    fn aes128_key_in_media_playlist_is_flagged() {
        let text = concat!(
            "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-PLAYLIST-TYPE:VOD\n",
            "#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n",
            "#EXTINF:5,\nseg0.ts\n#EXT-X-ENDLIST\n",
        );
        let pl = tokenize(text, "http://x/media.m3u8").unwrap();
        let parsed = parse_media_playlist(&pl, "http://x/media.m3u8", &Config::default()).unwrap();
        assert!(parsed.has_aes128);
        assert!(!parsed.has_sample_aes_ctr);
    }

    #[test]
    fn sample_aes_ctr_key_in_media_playlist_is_flagged() {
        let text = concat!(
            "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-PLAYLIST-TYPE:VOD\n",
            "#EXT-X-KEY:METHOD=SAMPLE-AES-CTR,URI=\"key.bin\",KEYFORMAT=\"com.apple.streamingkeydelivery\"\n",
            "#EXTINF:5,\nseg0.ts\n#EXT-X-ENDLIST\n",
        );
        let pl = tokenize(text, "http://x/media.m3u8").unwrap();
        let parsed = parse_media_playlist(&pl, "http://x/media.m3u8", &Config::default()).unwrap();
        assert!(parsed.has_sample_aes_ctr);
    }

    #[test]
    fn image_stream_inf_is_parsed_into_an_image_stream_decl() {
        let text = concat!(
            "#EXTM3U\n",
            "#EXT-X-IMAGE-STREAM-INF:BANDWIDTH=20000,CODECS=\"jpeg\",URI=\"tiles.m3u8\"\n",
            "#EXT-X-STREAM-INF:BANDWIDTH=1000,CODECS=\"avc1.4d401f\"\n",
            "low.m3u8\n",
        );
        let pl = tokenize(text, "http://x/master.m3u8").unwrap();
        let info = parse_master_playlist(&pl, "http://x/master.m3u8", &Config::default()).unwrap();
        assert_eq!(info.image_streams.len(), 1);
        assert_eq!(info.image_streams[0].uri, "http://x/tiles.m3u8");
        assert_eq!(info.image_streams[0].bandwidth, Some(20000));
    }

    #[test]
    fn image_stream_inf_missing_uri_is_rejected_unless_ignored() {
        let text = "#EXTM3U\n#EXT-X-IMAGE-STREAM-INF:BANDWIDTH=20000\n#EXT-X-STREAM-INF:BANDWIDTH=1000,CODECS=\"avc1.4d401f\"\nlow.m3u8\n";
        let pl = tokenize(text, "http://x/master.m3u8").unwrap();
        let err = parse_master_playlist(&pl, "http://x/master.m3u8", &Config::default()).unwrap_err();
        assert!(matches!(err, ManifestError::HlsRequiredAttributeMissing(a) if a == "URI"));

        let tolerant = Config::new().with_hls_ignore_image_stream_failures(true);
        let info = parse_master_playlist(&pl, "http://x/master.m3u8", &tolerant).unwrap();
        assert!(info.image_streams.is_empty());
    }
}
