//! C1 — the presentation timeline shared by the DASH and HLS parsers.
//!
//! Grounded on the MPD top-level attributes the teacher already models in its `MPD` struct
//! (`availabilityStartTime`, `timeShiftBufferDepth`, `suggestedPresentationDelay`,
//! `mediaPresentationDuration`), restructured here as the operations §4.2 names rather than as
//! bare XML-shaped fields, and shared with the HLS parser (which populates it from
//! `#EXT-X-TARGETDURATION`/`#EXT-X-PLAYLIST-TYPE` instead of MPD attributes).

use crate::clock::SharedClock;
use chrono::{DateTime, Utc};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationType {
    Static,
    Dynamic,
}

#[derive(Debug)]
struct State {
    availability_start: DateTime<Utc>,
    duration: f64,
    segment_availability_duration: f64,
    max_segment_duration: f64,
    presentation_delay: f64,
    clock_offset: f64,
    presentation_type: PresentationType,
}

/// Presentation-timeline state: duration, availability window, seek range, offset, liveness.
///
/// All mutators take `&self` (interior mutability via a `Mutex`) because the timeline is shared
/// between the manifest the host holds and the parser driving live updates; the manifest's public
/// surface never exposes `&mut Manifest` to the host while an update scheduler tick might be
/// concurrently revising timeline fields (§5, "Segment-index mutation during an update is atomic").
pub struct PresentationTimeline {
    state: Mutex<State>,
    clock: SharedClock,
}

impl PresentationTimeline {
    pub fn new(clock: SharedClock, presentation_type: PresentationType) -> Self {
        PresentationTimeline {
            state: Mutex::new(State {
                availability_start: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
                duration: 0.0,
                segment_availability_duration: f64::INFINITY,
                max_segment_duration: 1.0,
                presentation_delay: 0.0,
                clock_offset: 0.0,
                presentation_type,
            }),
            clock,
        }
    }

    pub fn set_duration(&self, d: f64) {
        self.state.lock().unwrap().duration = d;
    }

    pub fn get_duration(&self) -> f64 {
        self.state.lock().unwrap().duration
    }

    pub fn set_availability_start(&self, t: DateTime<Utc>) {
        self.state.lock().unwrap().availability_start = t;
    }

    pub fn get_availability_start(&self) -> DateTime<Utc> {
        self.state.lock().unwrap().availability_start
    }

    pub fn set_segment_availability_duration(&self, w: f64) {
        self.state.lock().unwrap().segment_availability_duration = w;
    }

    pub fn set_delay(&self, p: f64) {
        self.state.lock().unwrap().presentation_delay = p;
    }

    pub fn get_delay(&self) -> f64 {
        self.state.lock().unwrap().presentation_delay
    }

    pub fn set_max_segment_duration(&self, m: f64) {
        self.state.lock().unwrap().max_segment_duration = m;
    }

    pub fn get_max_segment_duration(&self) -> f64 {
        self.state.lock().unwrap().max_segment_duration
    }

    pub fn set_static(&self, is_static: bool) {
        self.state.lock().unwrap().presentation_type = if is_static {
            PresentationType::Static
        } else {
            PresentationType::Dynamic
        };
    }

    pub fn set_clock_offset(&self, offset_secs: f64) {
        self.state.lock().unwrap().clock_offset = offset_secs;
    }

    pub fn get_clock_offset(&self) -> f64 {
        self.state.lock().unwrap().clock_offset
    }

    pub fn is_live(&self) -> bool {
        self.state.lock().unwrap().presentation_type == PresentationType::Dynamic
    }

    /// True when `type=static`, duration is finite, and `availabilityStart` is already in the
    /// past — an "in-progress" VOD recording that behaves like live for seek-range purposes.
    pub fn is_in_progress(&self) -> bool {
        let s = self.state.lock().unwrap();
        s.presentation_type == PresentationType::Static
            && s.duration.is_finite()
            && s.availability_start <= self.clock.now()
    }

    fn wall_now_secs(&self) -> f64 {
        self.clock.now().timestamp_millis() as f64 / 1000.0
    }

    pub fn get_segment_availability_start(&self) -> f64 {
        let s = self.state.lock().unwrap();
        if s.presentation_type == PresentationType::Static {
            return 0.0;
        }
        let wall_now = self.wall_now_secs();
        let astart = s.availability_start.timestamp_millis() as f64 / 1000.0;
        let start = wall_now - s.clock_offset - astart - s.segment_availability_duration;
        let start = start.max(0.0);
        drop(s);
        start.min(self.get_segment_availability_end())
    }

    pub fn get_segment_availability_end(&self) -> f64 {
        let s = self.state.lock().unwrap();
        if s.presentation_type == PresentationType::Static {
            return s.duration;
        }
        let wall_now = self.wall_now_secs();
        let astart = s.availability_start.timestamp_millis() as f64 / 1000.0;
        let end = wall_now - s.clock_offset - astart - s.max_segment_duration;
        end.min(s.duration)
    }

    pub fn get_seek_range_start(&self) -> f64 {
        self.get_segment_availability_start()
    }

    pub fn get_seek_range_end(&self) -> f64 {
        let delay = self.get_delay();
        let end = self.get_segment_availability_end() - delay;
        end.max(self.get_segment_availability_start())
    }
}

impl std::fmt::Debug for PresentationTimeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.lock().unwrap();
        f.debug_struct("PresentationTimeline")
            .field("presentation_type", &s.presentation_type)
            .field("duration", &s.duration)
            .field("availability_start", &s.availability_start)
            .field("segment_availability_duration", &s.segment_availability_duration)
            .field("max_segment_duration", &s.max_segment_duration)
            .field("presentation_delay", &s.presentation_delay)
            .field("clock_offset", &s.clock_offset)
            .finish()
    }
}
