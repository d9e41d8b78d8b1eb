//! C6 — builds a live-updatable [`Manifest`](crate::manifest::Manifest) from an MPD tree.
//!
//! Grounded on the teacher's `fetch.rs` period/adaptation/representation walk (`do_period_audio`
//! and its video counterpart) and its `resolve_url_template`/BaseURL-joining arithmetic, but
//! restructured around the update/reconcile loop of §4.4.5 instead of a one-shot download: the
//! teacher never re-fetches an MPD, this parser is built to do so on every scheduler tick.

use crate::clock::SharedClock;
use crate::config::Config;
use crate::dash::model::{self, SegmentTemplate, SegmentTimeline, MPD};
use crate::error::{ManifestError, Result};
use crate::manifest::{ContentType, Manifest, ManifestKind, Stream, Variant};
use crate::net::{Request, RequestType, SharedNetworkingEngine, SharedPlayerInterface};
use crate::scheduler::{UpdateOutcome, UpdateScheduler};
use crate::segment_index::{SegmentIndex, SegmentReference};
use crate::timeline::{PresentationTimeline, PresentationType};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

/// Floor applied to `minimumUpdatePeriod="PT0S"` so a misbehaving live manifest can't busy-loop
/// the scheduler (§4.4.1 step 10).
const MIN_UPDATE_PERIOD: Duration = Duration::from_secs(2);

struct PeriodLayout {
    id: String,
    start: f64,
    duration: f64,
}

struct ParserState {
    request_uri: String,
    effective_uri: String,
    location_uris: Vec<String>,
    banned: std::collections::HashSet<String>,
    periods: Vec<PeriodLayout>,
    /// Representation id -> stream, so an update can find the existing stream object to `merge`
    /// into rather than constructing a new one (§4.4.5 step 3: "every existing stream identity is
    /// preserved").
    streams_by_repr_id: HashMap<String, Arc<Stream>>,
    /// Regions already reported via `onTimelineRegionAdded`, keyed on millisecond-rounded
    /// (start, end) so floating-point region math from two passes over the same Period compares
    /// equal.
    seen_regions: std::collections::HashSet<(i64, i64)>,
    /// Stream ids already reported via `newDrmInfo`, so a Representation's `ContentProtection` is
    /// only surfaced to the host once even though `reconcile` re-walks it on every update tick.
    seen_drm_streams: std::collections::HashSet<String>,
}

/// Drives the DASH parse-then-live-update lifecycle for one presentation.
pub struct DashParser {
    networking: SharedNetworkingEngine,
    player: SharedPlayerInterface,
    config: Config,
    clock: SharedClock,
    state: Mutex<ParserState>,
    manifest: Mutex<Option<Arc<Manifest>>>,
    scheduler: Mutex<Option<UpdateScheduler>>,
    /// §5/§6.3 — `stop()` flips this so an initial fetch still in flight aborts rather than
    /// publishing a manifest after the caller has already walked away.
    stop_signal: tokio::sync::watch::Sender<bool>,
}

impl DashParser {
    pub fn new(networking: SharedNetworkingEngine, player: SharedPlayerInterface, config: Config, clock: SharedClock) -> Arc<Self> {
        let (stop_signal, _) = tokio::sync::watch::channel(false);
        Arc::new(DashParser {
            networking,
            player,
            config,
            clock,
            state: Mutex::new(ParserState {
                request_uri: String::new(),
                effective_uri: String::new(),
                location_uris: Vec::new(),
                banned: Default::default(),
                periods: Vec::new(),
                streams_by_repr_id: HashMap::new(),
                seen_regions: Default::default(),
                seen_drm_streams: Default::default(),
            }),
            manifest: Mutex::new(None),
            scheduler: Mutex::new(None),
            stop_signal,
        })
    }

    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>, uri: &str) -> Result<Arc<Manifest>> {
        self.state.lock().unwrap().request_uri = uri.to_string();
        let (mpd, effective_uri) = self.abortable(self.fetch_and_parse(&[uri.to_string()])).await?;
        let (manifest, regions) = self.build_manifest(&mpd, &effective_uri)?;
        let manifest = Arc::new(manifest);
        *self.manifest.lock().unwrap() = Some(manifest.clone());

        self.sync_utc_timing(&mpd, &manifest.timeline).await;

        self.player.on_manifest_updated().await;
        self.player.filter(&manifest).await;
        self.notify_new_regions(regions).await;
        self.notify_new_drm_info(&manifest).await;

        if manifest.is_live() {
            self.arm_scheduler(&mpd);
        }
        Ok(manifest)
    }

    pub fn stop(&self) {
        let _ = self.stop_signal.send(true);
        if let Some(s) = self.scheduler.lock().unwrap().take() {
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

    /// Force an immediate DASH update (§6.3 `update()` test/host hook).
    pub async fn update(self: &Arc<Self>) -> Result<()> {
        self.run_update().await
    }

    pub fn ban_location(&self, uri: &str) {
        self.state.lock().unwrap().banned.insert(uri.to_string());
    }

    fn arm_scheduler(self: &Arc<Self>, mpd: &MPD) {
        let Some(mup) = mpd.minimumUpdatePeriod.as_deref() else { return };
        let Ok(secs) = model::parse_xs_duration(mup) else { return };
        let interval = Duration::from_secs_f64(secs).max(MIN_UPDATE_PERIOD);

        let this = self.clone();
        let scheduler = UpdateScheduler::new(interval, move || {
            let this = this.clone();
            async move {
                let start = std::time::Instant::now();
                if let Err(e) = this.run_update().await {
                    this.player.on_error(&e).await;
                }
                UpdateOutcome { measured: start.elapsed(), nominal: None }
            }
        });
        scheduler.tick_after(interval);
        *self.scheduler.lock().unwrap() = Some(scheduler);
    }

    #[instrument(skip(self))]
    async fn run_update(self: &Arc<Self>) -> Result<()> {
        let fetch_uris = {
            let s = self.state.lock().unwrap();
            let mut uris = if s.location_uris.is_empty() {
                vec![s.effective_uri.clone()]
            } else {
                s.location_uris.clone()
            };
            uris.retain(|u| !s.banned.contains(u));
            uris
        };
        let (mpd, effective_uri) = self.fetch_and_parse(&fetch_uris).await?;
        let regions = self.reconcile(&mpd, &effective_uri)?;
        if let Some(manifest) = self.manifest.lock().unwrap().clone() {
            self.sync_utc_timing(&mpd, &manifest.timeline).await;
            self.player.on_manifest_updated().await;
            self.player.filter(&manifest).await;
            self.notify_new_drm_info(&manifest).await;
        }
        self.notify_new_regions(regions).await;
        Ok(())
    }

    /// §4.4.3 — applies the first UTCTiming scheme this crate understands, falling back to
    /// `config.dash_clock_sync_uri` when the MPD declares none. Best-effort: an unreachable or
    /// unrecognized scheme leaves the clock offset unchanged rather than failing the update.
    async fn sync_utc_timing(&self, mpd: &MPD, timeline: &Arc<PresentationTimeline>) {
        for ut in &mpd.utc_timings {
            if self.apply_utc_timing(ut, timeline).await {
                return;
            }
        }
        if let Some(uri) = &self.config.dash_clock_sync_uri {
            let fallback = model::UTCTiming {
                schemeIdUri: Some("urn:mpeg:dash:utc:http-xsdate:2014".to_string()),
                value: Some(uri.clone()),
            };
            self.apply_utc_timing(&fallback, timeline).await;
        }
    }

    async fn apply_utc_timing(&self, ut: &model::UTCTiming, timeline: &Arc<PresentationTimeline>) -> bool {
        let (Some(scheme), Some(value)) = (ut.schemeIdUri.as_deref(), ut.value.as_deref()) else {
            return false;
        };
        let server_time = match scheme {
            "urn:mpeg:dash:utc:direct:2014" => DateTime::parse_from_rfc3339(value).ok().map(|d| d.with_timezone(&Utc)),
            "urn:mpeg:dash:utc:http-xsdate:2014" | "urn:mpeg:dash:utc:http-iso:2014" => {
                let req = Request::new(RequestType::Timing, vec![value.to_string()]);
                match self.networking.request(req).await {
                    Ok(resp) => std::str::from_utf8(&resp.data).ok().and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok()).map(|d| d.with_timezone(&Utc)),
                    Err(_) => None,
                }
            }
            "urn:mpeg:dash:utc:http-head:2014" => {
                let req = Request::new(RequestType::Timing, vec![value.to_string()]);
                match self.networking.request(req).await {
                    Ok(resp) => resp.headers.get("Date").and_then(|d| DateTime::parse_from_rfc2822(d).ok()).map(|d| d.with_timezone(&Utc)),
                    Err(_) => None,
                }
            }
            _ => {
                warn!(scheme, "unsupported UTCTiming scheme, clock offset unchanged");
                None
            }
        };
        let Some(server_time) = server_time else { return false };
        if !self.config.dash_auto_correct_drift {
            debug!(scheme, "UTCTiming resolved but dash_auto_correct_drift is disabled, clock offset unchanged");
            return true;
        }
        let offset = (server_time - self.clock.now()).num_milliseconds() as f64 / 1000.0;
        timeline.set_clock_offset(offset);
        true
    }

    async fn fetch_and_parse(&self, uris: &[String]) -> Result<(MPD, String)> {
        let req = Request::new(RequestType::Manifest, uris.to_vec());
        let resp = self.networking.request(req).await?;
        let body = String::from_utf8_lossy(&resp.data);
        let mpd = model::parse(&body)?;
        if mpd.periods.is_empty() && mpd.locations.is_empty() {
            return Err(ManifestError::ManifestInvalid("MPD has no periods".to_string()));
        }
        Ok((mpd, resp.uri))
    }

    /// §4.4.2 — resolve each period's effective `[start, start+duration)`.
    fn layout_periods(mpd: &MPD, manifest_duration: Option<f64>, is_static: bool) -> Result<Vec<PeriodLayout>> {
        let mut out = Vec::with_capacity(mpd.periods.len());
        let mut prev_end = 0.0;
        for (i, p) in mpd.periods.iter().enumerate() {
            let start = if let Some(s) = &p.start {
                model::parse_xs_duration(s)?
            } else if i == 0 {
                0.0
            } else {
                prev_end
            };
            if i > 0 && start < prev_end {
                warn!(period = ?p.id, "period overlaps previous period end, later period wins");
            }
            out.push(PeriodLayout {
                id: p.id.clone().unwrap_or_else(|| format!("period-{i}")),
                start,
                duration: 0.0, // patched below once we know the next period's start
            });
            prev_end = start + p.duration.unwrap_or(0.0);
        }
        let n = out.len();
        for i in 0..n {
            out[i].duration = if let Some(d) = mpd.periods[i].duration {
                d
            } else if i + 1 < n {
                out[i + 1].start - out[i].start
            } else if is_static {
                manifest_duration.unwrap_or(f64::INFINITY) - out[i].start
            } else {
                f64::INFINITY
            };
        }
        Ok(out)
    }

    fn build_manifest(&self, mpd: &MPD, effective_uri: &str) -> Result<(Manifest, Vec<(f64, f64)>)> {
        let is_static = mpd.mpdtype != "dynamic";
        let presentation_type = if is_static { PresentationType::Static } else { PresentationType::Dynamic };
        let timeline = Arc::new(PresentationTimeline::new(self.clock.clone(), presentation_type));

        if let Some(start) = &mpd.availabilityStartTime {
            if let Ok(dt) = DateTime::parse_from_rfc3339(start) {
                timeline.set_availability_start(dt.with_timezone(&Utc));
            }
        }
        if let Some(tsbd) = &mpd.timeShiftBufferDepth {
            timeline.set_segment_availability_duration(model::parse_xs_duration(tsbd)?);
        }
        if let Some(spd) = &mpd.suggestedPresentationDelay {
            timeline.set_delay(model::parse_xs_duration(spd)?);
        } else if !self.config.dash_ignore_min_buffer_time {
            // §5.3.1.2 of ISO/IEC 23009-1: absent an explicit delay, a player's minimum safe
            // startup latency is its buffer floor, @minBufferTime.
            if let Some(mbt) = mpd.minBufferTime {
                timeline.set_delay(mbt);
            }
        }
        if let Some(msd) = mpd.maxSegmentDuration {
            timeline.set_max_segment_duration(msd);
        }
        if let Some(w) = self.config.availability_window_override {
            timeline.set_segment_availability_duration(w);
        }

        let periods = Self::layout_periods(mpd, mpd.mediaPresentationDuration, is_static)?;
        if is_static {
            timeline.set_duration(mpd.mediaPresentationDuration.unwrap_or_else(|| {
                periods.last().map(|p| p.start + p.duration).unwrap_or(0.0)
            }));
        } else {
            timeline.set_duration(f64::INFINITY);
        }

        let mut manifest = Manifest::new(ManifestKind::Dash, timeline);
        let mut streams_by_repr_id = HashMap::new();
        let mut regions = Vec::new();

        for (period, layout) in mpd.periods.iter().zip(periods.iter()) {
            self.build_period_variants(period, layout, mpd, effective_uri, &mut manifest, &mut streams_by_repr_id, &mut regions)?;
        }

        let mut state = self.state.lock().unwrap();
        state.effective_uri = effective_uri.to_string();
        state.location_uris = mpd
            .locations
            .iter()
            .map(|l| resolve_against(&state.request_uri, &l.uri))
            .collect();
        state.periods = periods;
        state.streams_by_repr_id = streams_by_repr_id;
        drop(state);

        Ok((manifest, regions))
    }

    fn build_period_variants(
        &self,
        period: &model::Period,
        layout: &PeriodLayout,
        mpd: &MPD,
        effective_uri: &str,
        manifest: &mut Manifest,
        streams_by_repr_id: &mut HashMap<String, Arc<Stream>>,
        regions: &mut Vec<(f64, f64)>,
    ) -> Result<()> {
        let mpd_bases = candidate_bases(effective_uri, &mpd.base_urls);
        let period_bases = combine_bases(&mpd_bases, &period.base_urls);

        let mut audio_streams = Vec::new();
        let mut video_streams = Vec::new();

        for aset in &period.adaptation_sets {
            let aset_bases = combine_bases(&period_bases, &aset.base_urls);
            let content_type = if aset.is_audio() {
                ContentType::Audio
            } else if aset.is_video() {
                ContentType::Video
            } else if aset.is_image() {
                ContentType::Image
            } else {
                ContentType::Text
            };

            let disabled = match content_type {
                ContentType::Audio => self.config.disable_audio,
                ContentType::Video => self.config.disable_video,
                ContentType::Text => self.config.disable_text,
                ContentType::Image => self.config.disable_thumbnails,
            };
            if disabled {
                continue;
            }

            for repr in &aset.representations {
                let repr_id = repr.id.clone().unwrap_or_else(|| format!("{}-{}", layout.id, video_streams.len() + audio_streams.len()));
                let stream = Arc::new(self.build_stream(repr, aset, content_type, &repr_id));

                let repr_bases = combine_bases(&aset_bases, &repr.base_urls);
                let template = repr.segment_template.as_ref().or(aset.segment_template.as_ref()).or(period.segment_template.as_ref());
                let (mut refs, skip) = self.build_segment_references(repr, template, &repr_bases, layout, &manifest.timeline)?;
                if let Some(limit) = self.config.dash_initial_segment_limit {
                    refs.truncate(limit as usize);
                }
                if !refs.is_empty() {
                    let first_position = template.and_then(|t| t.startNumber).unwrap_or(1) as i64 + skip as i64;
                    stream.get_or_create_segment_index(|| Ok(SegmentIndex::new(first_position, refs)))?;
                }

                streams_by_repr_id.insert(repr_id, stream.clone());
                match content_type {
                    ContentType::Audio => audio_streams.push(stream),
                    ContentType::Video => video_streams.push(stream),
                    ContentType::Text => manifest.text_streams.push(stream),
                    ContentType::Image => manifest.image_streams.push(stream),
                }
            }
        }

        if video_streams.is_empty() {
            for a in audio_streams {
                manifest.variants.push(Variant {
                    id: a.id.clone(),
                    bandwidth: a.bandwidth,
                    language: a.language.clone(),
                    audio: Some(a),
                    video: None,
                });
            }
        } else if audio_streams.is_empty() {
            for v in video_streams {
                manifest.variants.push(Variant {
                    id: v.id.clone(),
                    bandwidth: v.bandwidth,
                    language: None,
                    audio: None,
                    video: Some(v),
                });
            }
        } else {
            for v in &video_streams {
                for a in &audio_streams {
                    manifest.variants.push(Variant {
                        id: format!("{}-{}", v.id, a.id),
                        bandwidth: v.bandwidth,
                        language: a.language.clone(),
                        audio: Some(a.clone()),
                        video: Some(v.clone()),
                    });
                }
            }
        }

        self.build_event_regions(period, layout, regions);
        Ok(())
    }

    fn build_stream(&self, repr: &model::Representation, aset: &model::AdaptationSet, content_type: ContentType, id: &str) -> Stream {
        let mut stream = Stream::new(id, content_type);
        stream.codecs = repr.codecs.clone().or_else(|| aset.codecs.clone());
        stream.mime_type = repr.mimeType.clone().or_else(|| aset.mimeType.clone());
        stream.language = aset.lang.clone();
        stream.label = repr.labels.first().or(aset.labels.first()).and_then(|l| l.content.clone());
        stream.roles = aset.roles.iter().filter_map(|r| r.value.clone()).collect();
        stream.width = repr.width;
        stream.height = repr.height;
        stream.bandwidth = repr.bandwidth;
        stream.frame_rate = repr
            .frameRate
            .as_deref()
            .or(aset.frameRate.as_deref())
            .and_then(parse_frame_rate);
        stream.drm_info = aset
            .content_protections
            .iter()
            .chain(repr.content_protections.iter())
            .map(|cp| crate::manifest::DrmInfo {
                key_system: cp.schemeIdUri.as_deref().and_then(key_system_for_scheme).map(str::to_string),
                scheme_id_uri: cp.schemeIdUri.clone().unwrap_or_default(),
                default_kid: cp.default_kid.clone(),
            })
            .collect();
        stream
    }

    /// §4.4.6 — the three segment-construction modes.
    /// Returns the segment references along with how many leading segments (counted from the
    /// template's `@startNumber` baseline) were skipped to clip the list to the availability
    /// window — callers add this to `@startNumber` to get the position of the first returned
    /// reference, so the index position stays consistent with what was actually generated.
    fn build_segment_references(
        &self,
        repr: &model::Representation,
        template: Option<&SegmentTemplate>,
        bases: &[String],
        layout: &PeriodLayout,
        timeline: &Arc<PresentationTimeline>,
    ) -> Result<(Vec<SegmentReference>, u64)> {
        if let Some(tpl) = template {
            let timescale = tpl.timescale.unwrap_or(1) as f64;
            if let Some(tl) = &tpl.segment_timeline {
                let refs = self.build_from_segment_timeline(tpl, tl, timescale, bases, repr.id.as_deref(), layout, timeline)?;
                return Ok((refs, 0));
            }
            if let Some(dur) = tpl.duration {
                return self.build_from_fixed_duration(tpl, dur as f64 / timescale, bases, repr.id.as_deref(), layout, timeline);
            }
        }
        if let Some(sl) = &repr.segment_list {
            return Ok((self.build_from_segment_list(sl, bases)?, 0));
        }
        Ok((Vec::new(), 0))
    }

    fn build_from_segment_timeline(
        &self,
        tpl: &SegmentTemplate,
        tl: &SegmentTimeline,
        timescale: f64,
        bases: &[String],
        repr_id: Option<&str>,
        layout: &PeriodLayout,
        timeline: &Arc<PresentationTimeline>,
    ) -> Result<Vec<SegmentReference>> {
        let cap_ticks = if layout.duration.is_finite() {
            Some(layout.duration * timescale)
        } else {
            Some((timeline.get_segment_availability_end() - layout.start) * timescale)
        };
        let entries = expand_segment_timeline(tl, cap_ticks)?;
        let start_number = tpl.startNumber.unwrap_or(1);
        let media = tpl.media.as_deref().ok_or_else(|| ManifestError::manifest_malformed("SegmentTemplate missing @media"))?;

        let mut refs = Vec::with_capacity(entries.len());
        for (i, (t, d)) in entries.iter().enumerate() {
            let number = start_number + i as u64;
            let uris = bases
                .iter()
                .map(|b| resolve_template_and_join(b, media, repr_id, Some(number), Some(*t as u64), None))
                .collect::<Result<Vec<_>>>()?;
            let start = layout.start + *t as f64 / timescale;
            let end = layout.start + (*t + *d) as f64 / timescale;
            refs.push(SegmentReference::new(start, end, uris));
        }
        Ok(refs)
    }

    fn build_from_fixed_duration(
        &self,
        tpl: &SegmentTemplate,
        segment_duration: f64,
        bases: &[String],
        repr_id: Option<&str>,
        layout: &PeriodLayout,
        timeline: &Arc<PresentationTimeline>,
    ) -> Result<(Vec<SegmentReference>, u64)> {
        let media = tpl.media.as_deref().ok_or_else(|| ManifestError::manifest_malformed("SegmentTemplate missing @media"))?;
        let start_number = tpl.startNumber.unwrap_or(1);

        let materialize_end = if layout.duration.is_finite() {
            layout.start + layout.duration
        } else {
            timeline.get_segment_availability_end()
        };

        // §4.4.6: for a dynamic presentation the generated list is truncated to the availability
        // window. Starting the loop at the first in-window segment (rather than always at i=0)
        // keeps the nominal first-position this method implies stable across update ticks, instead
        // of growing a stale prefix that `SegmentIndex::merge` has to filter out every time. The
        // caller must add the returned skip count to `@startNumber` when registering this list's
        // first position with a `SegmentIndex`, or position and segment number diverge again.
        let i0: u64 = if timeline.is_live() && segment_duration > 0.0 {
            let availability_start = timeline.get_segment_availability_start();
            (((availability_start - layout.start) / segment_duration).floor().max(0.0)) as u64
        } else {
            0
        };
        let mut i = i0;
        let mut refs = Vec::new();
        loop {
            let start = layout.start + i as f64 * segment_duration;
            if start >= materialize_end {
                break;
            }
            let end = (start + segment_duration).min(materialize_end.max(start));
            let number = start_number + i;
            let uris = bases
                .iter()
                .map(|b| resolve_template_and_join(b, media, repr_id, Some(number), Some((i as f64 * segment_duration) as u64), None))
                .collect::<Result<Vec<_>>>()?;
            refs.push(SegmentReference::new(start, end, uris));
            i += 1;
            if i > 100_000 {
                warn!("fixed-duration segment materialization exceeded safety cap");
                break;
            }
        }
        Ok((refs, i0))
    }

    fn build_from_segment_list(&self, sl: &model::SegmentList, bases: &[String]) -> Result<Vec<SegmentReference>> {
        let timescale = sl.timescale.unwrap_or(1) as f64;
        let durations: Vec<f64> = if let Some(tl) = &sl.segment_timeline {
            expand_segment_timeline(tl, None)?.into_iter().map(|(_, d)| d as f64 / timescale).collect()
        } else {
            let d = sl.duration.unwrap_or(0) as f64 / timescale;
            vec![d; sl.segment_urls.len()]
        };

        let mut refs = Vec::with_capacity(sl.segment_urls.len());
        let mut cursor = 0.0;
        for (i, su) in sl.segment_urls.iter().enumerate() {
            let dur = durations.get(i).copied().unwrap_or(0.0);
            let uris = match &su.media {
                Some(m) => bases.iter().map(|b| join_url(b, m)).collect::<Result<Vec<_>>>()?,
                None => bases.to_vec(),
            };
            refs.push(SegmentReference::new(cursor, cursor + dur, uris));
            cursor += dur;
        }
        Ok(refs)
    }

    /// §4.4.4 — EventStream clipping.
    fn build_event_regions(&self, period: &model::Period, layout: &PeriodLayout, out: &mut Vec<(f64, f64)>) {
        for (start, end) in event_regions(period, layout) {
            trace!(period = %layout.id, start, end, "event stream region");
            out.push((start, end));
        }
    }

    /// §6.2 `onTimelineRegionAdded`: reports each region in `regions` to the player exactly once,
    /// tracking what has already been reported in `state.seen_regions`.
    async fn notify_new_regions(&self, regions: Vec<(f64, f64)>) {
        let fresh: Vec<(f64, f64)> = {
            let mut state = self.state.lock().unwrap();
            regions
                .into_iter()
                .filter(|(start, end)| {
                    state.seen_regions.insert(((start * 1000.0).round() as i64, (end * 1000.0).round() as i64))
                })
                .collect()
        };
        for (start, end) in fresh {
            self.player.on_timeline_region_added(crate::net::TimelineRegion { start, end }).await;
        }
    }

    /// §6.2 `newDrmInfo`: reports each Stream carrying `ContentProtection` to the player exactly
    /// once, tracking what has already been reported in `state.seen_drm_streams`.
    async fn notify_new_drm_info(&self, manifest: &Manifest) {
        let streams: Vec<Arc<Stream>> = manifest
            .variants
            .iter()
            .flat_map(|v| [&v.audio, &v.video].into_iter().flatten().cloned())
            .chain(manifest.text_streams.iter().cloned())
            .chain(manifest.image_streams.iter().cloned())
            .filter(|s| !s.drm_info.is_empty())
            .collect();
        let fresh: Vec<Arc<Stream>> = {
            let mut state = self.state.lock().unwrap();
            streams.into_iter().filter(|s| state.seen_drm_streams.insert(s.id.clone())).collect()
        };
        for s in fresh {
            self.player.new_drm_info(&s).await;
        }
    }

    /// §4.4.5 — reconcile a re-fetched MPD into the live manifest. Returns the EventStream
    /// regions visible in this MPD revision, for the caller to diff against what's already been
    /// reported via `onTimelineRegionAdded`.
    fn reconcile(&self, mpd: &MPD, effective_uri: &str) -> Result<Vec<(f64, f64)>> {
        let old_manifest = {
            let guard = self.manifest.lock().unwrap();
            guard.as_ref().cloned().ok_or_else(|| ManifestError::other("update() called before start()"))?
        };

        if let Some(tsbd) = &mpd.timeShiftBufferDepth {
            old_manifest.timeline.set_segment_availability_duration(model::parse_xs_duration(tsbd)?);
        }
        if let Some(spd) = &mpd.suggestedPresentationDelay {
            old_manifest.timeline.set_delay(model::parse_xs_duration(spd)?);
        }

        let is_static = mpd.mpdtype != "dynamic";
        let new_periods = Self::layout_periods(mpd, mpd.mediaPresentationDuration, is_static)?;

        let mut state = self.state.lock().unwrap();
        state.effective_uri = effective_uri.to_string();
        state.location_uris = mpd
            .locations
            .iter()
            .map(|l| resolve_against(&state.request_uri, &l.uri))
            .collect();

        // §4.4.5 step 3: Periods are matched by @id, not position. A Period whose id was already
        // known is reconciled in place (its Representations' segment indices merged); one whose id
        // is new is built fresh and appended; a previously-known Period absent from this revision
        // is left untouched rather than torn down ("missing Periods remain").
        let known_ids: std::collections::HashSet<String> = state.periods.iter().map(|p| p.id.clone()).collect();

        let mut appended_variants = Vec::new();
        let mut appended_text = Vec::new();
        let mut appended_image = Vec::new();
        let mut regions = Vec::new();

        for (period, layout) in mpd.periods.iter().zip(new_periods.iter()) {
            if known_ids.contains(&layout.id) {
                let mpd_bases = candidate_bases(effective_uri, &mpd.base_urls);
                let period_bases = combine_bases(&mpd_bases, &period.base_urls);
                for aset in &period.adaptation_sets {
                    let aset_bases = combine_bases(&period_bases, &aset.base_urls);
                    for repr in &aset.representations {
                        let Some(repr_id) = &repr.id else { continue };
                        let Some(stream) = state.streams_by_repr_id.get(repr_id).cloned() else { continue };
                        let repr_bases = combine_bases(&aset_bases, &repr.base_urls);
                        let template = repr.segment_template.as_ref().or(aset.segment_template.as_ref()).or(period.segment_template.as_ref());
                        let (refs, skip) = self.build_segment_references(repr, template, &repr_bases, layout, &old_manifest.timeline)?;
                        if let Some(idx) = stream.segment_index() {
                            let first_position = template.and_then(|t| t.startNumber).unwrap_or(1) as i64 + skip as i64;
                            let availability_start = old_manifest.timeline.get_segment_availability_start();
                            idx.lock().unwrap().merge(first_position, refs, availability_start);
                        }
                    }
                }
                self.build_event_regions(period, layout, &mut regions);
            } else {
                let mut fresh = Manifest::new(old_manifest.kind, old_manifest.timeline.clone());
                self.build_period_variants(period, layout, mpd, effective_uri, &mut fresh, &mut state.streams_by_repr_id, &mut regions)?;
                appended_variants.extend(fresh.variants);
                appended_text.extend(fresh.text_streams);
                appended_image.extend(fresh.image_streams);
            }
        }
        state.periods = new_periods;
        drop(state);

        if !appended_variants.is_empty() || !appended_text.is_empty() || !appended_image.is_empty() {
            let mut merged = Manifest {
                kind: old_manifest.kind,
                timeline: old_manifest.timeline.clone(),
                variants: old_manifest.variants.clone(),
                text_streams: old_manifest.text_streams.clone(),
                image_streams: old_manifest.image_streams.clone(),
                sequence_mode: old_manifest.sequence_mode,
            };
            merged.variants.extend(appended_variants);
            merged.text_streams.extend(appended_text);
            merged.image_streams.extend(appended_image);
            *self.manifest.lock().unwrap() = Some(Arc::new(merged));
        }

        let availability_start = old_manifest.timeline.get_segment_availability_start();
        let current = self.manifest.lock().unwrap().as_ref().unwrap().clone();
        for v in &current.variants {
            for s in [&v.audio, &v.video].into_iter().flatten() {
                if let Some(idx) = s.segment_index() {
                    idx.lock().unwrap().evict(availability_start);
                }
            }
        }
        info!(availability_start, "DASH manifest reconciled");
        Ok(regions)
    }
}

/// §4.4.4 — clips each Event's `[presentationTime, presentationTime+duration)` (in the
/// EventStream's own timescale) to the period's wall-clock span, yielding presentation-time
/// regions a player can surface as timeline markers.
fn event_regions(period: &model::Period, layout: &PeriodLayout) -> Vec<(f64, f64)> {
    let mut out = Vec::new();
    for es in &period.event_streams {
        let timescale = es.timescale.unwrap_or(1) as f64;
        for ev in &es.events {
            let region_start = layout.start + ev.presentationTime as f64 / timescale;
            let region_end = (region_start + ev.duration as f64 / timescale).min(layout.start + layout.duration);
            out.push((region_start, region_end));
        }
    }
    out
}

/// §4.4.7 — maps a `ContentProtection`'s `@schemeIdUri` to an EME key-system identifier. The
/// generic CENC signaling scheme (`urn:mpeg:dash:mp4protection:2011`) names no key system of its
/// own, so it returns `None`; the element is still recorded on `DrmInfo` for its `default_kid`.
fn key_system_for_scheme(scheme_id_uri: &str) -> Option<&'static str> {
    match scheme_id_uri.to_ascii_lowercase().as_str() {
        "urn:uuid:edef8ba9-79d6-6ac4-cbd1-d8b98e1cea9c" => Some("com.widevine.alpha"),
        "urn:uuid:9a04f079-9840-4286-ab92-e65be0885f95" => Some("com.microsoft.playready"),
        "urn:uuid:e2719d58-a985-b3c9-781a-b030af78d30e" => Some("org.w3.clearkey"),
        "urn:uuid:f239e769-efa3-4850-9c16-a903c6932efb" => Some("com.adobe.primetime"),
        _ => None,
    }
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    if let Some((num, den)) = s.split_once('/') {
        let n: f64 = num.parse().ok()?;
        let d: f64 = den.parse().ok()?;
        if d != 0.0 { Some(n / d) } else { None }
    } else {
        s.parse().ok()
    }
}

fn resolve_against(base: &str, rel: &str) -> String {
    join_url(base, rel).unwrap_or_else(|_| rel.to_string())
}

fn join_url(base: &str, rel: &str) -> Result<String> {
    if rel.starts_with("http://") || rel.starts_with("https://") {
        return Ok(rel.to_string());
    }
    let base_url = url::Url::parse(base)?;
    Ok(base_url.join(rel)?.to_string())
}

/// §4.4.6 — BaseURL combination is multiplicative: each level's candidate list is joined against
/// every candidate from the level above.
fn candidate_bases(effective_uri: &str, mpd_base_urls: &[model::BaseURL]) -> Vec<String> {
    if mpd_base_urls.is_empty() {
        return vec![effective_uri.to_string()];
    }
    mpd_base_urls
        .iter()
        .map(|b| join_url(effective_uri, &b.base).unwrap_or_else(|_| b.base.clone()))
        .collect()
}

fn combine_bases(parent: &[String], children: &[model::BaseURL]) -> Vec<String> {
    if children.is_empty() {
        return parent.to_vec();
    }
    let mut out = Vec::with_capacity(parent.len() * children.len());
    for p in parent {
        for c in children {
            out.push(join_url(p, &c.base).unwrap_or_else(|_| c.base.clone()));
        }
    }
    out
}

fn resolve_template_and_join(
    base: &str,
    media: &str,
    repr_id: Option<&str>,
    number: Option<u64>,
    time: Option<u64>,
    bandwidth: Option<u64>,
) -> Result<String> {
    let resolved = resolve_url_template(media, repr_id, number, time, bandwidth);
    join_url(base, &resolved)
}

/// Grounded on the teacher's `resolve_url_template`: literal `$Ident$` substitution plus the
/// `$Ident%0Nd$` zero-padded-width variant, implemented with the same two-pass regex approach.
pub fn resolve_url_template(
    template: &str,
    repr_id: Option<&str>,
    number: Option<u64>,
    time: Option<u64>,
    bandwidth: Option<u64>,
) -> String {
    let mut result = template.replace("$$", "\u{0}");
    let params: [(&str, Option<String>); 4] = [
        ("RepresentationID", repr_id.map(|s| s.to_string())),
        ("Number", number.map(|n| n.to_string())),
        ("Time", time.map(|t| t.to_string())),
        ("Bandwidth", bandwidth.map(|b| b.to_string())),
    ];
    for (key, value) in &params {
        let Some(value) = value else { continue };
        let ident = format!("${key}$");
        if result.contains(&ident) {
            result = result.replace(&ident, value);
        }
        let re = Regex::new(&format!(r"\${key}%0([\d])d\$")).unwrap();
        if let Some(cap) = re.captures(&result.clone()) {
            let width: usize = cap[1].parse().unwrap_or(1);
            let padded = format!("{value:0>width$}");
            if let Some(m) = re.find(&result) {
                result = format!("{}{}{}", &result[..m.start()], padded, &result[m.end()..]);
            }
        }
    }
    result.replace('\u{0}', "$")
}

/// §4.3 — SegmentTimeline expansion: `t` inheritance, `r` repeat-count expansion, `r=-1` capped by
/// `cap_ticks` (period end or availability-window end, in the same timescale as `d`/`t`).
fn expand_segment_timeline(tl: &SegmentTimeline, cap_ticks: Option<f64>) -> Result<Vec<(i64, i64)>> {
    let mut out = Vec::new();
    let mut cursor: i64 = 0;
    for (idx, s) in tl.segments.iter().enumerate() {
        let t = s.t.unwrap_or(cursor);
        let Some(d) = s.d else {
            return Err(ManifestError::manifest_malformed(format!("SegmentTimeline <S> at index {idx} is missing @d")));
        };
        let repeat = s.r.unwrap_or(0);
        if repeat >= 0 {
            for k in 0..=repeat {
                out.push((t + k * d, d));
            }
            cursor = t + (repeat + 1) * d;
        } else {
            // r == -1: repeat until the cap.
            let cap = cap_ticks.unwrap_or(t as f64 + d as f64);
            let mut cur = t;
            while (cur as f64) < cap {
                out.push((cur, d));
                cur += d;
            }
            cursor = cur;
        }
    }
    Ok(out)
}
