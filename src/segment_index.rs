//! C2 — segment reference and segment index.
//!
//! Grounded on the teacher's `SegmentTimeline`/`S`/`SegmentTemplate`/`SegmentList` handling in
//! `lib.rs`, and on the `$Number$`/`$Time$` substitution and repeat-count expansion arithmetic in
//! `fetch.rs`, restructured into the position-keyed, evictable, mergeable ordered sequence that
//! §3.4/§4.3 describe rather than the one-shot Vec<Url> the teacher builds for a single download.

use std::sync::Arc;

/// Whether a segment is known to be fetchable right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    Available,
    Missing,
}

/// An inclusive byte range, as parsed from `indexRange`/`mediaRange`/`#EXT-X-BYTERANGE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        ByteRange { start, end }
    }

    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Content-addressed by URI + byte range, so cheap to duplicate (§3.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitSegmentReference {
    pub uris: Vec<String>,
    pub byte_range: Option<ByteRange>,
}

/// An opaque handle naming the AES-128 key that decrypts a segment's bytes. The engine never
/// performs decryption (§1 Non-goals); it only carries enough information for a DRM/decryption
/// collaborator to locate the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHandle {
    pub uri: String,
    pub iv: Option<[u8; 16]>,
}

/// Metadata for one media segment (§3.3).
#[derive(Debug, Clone)]
pub struct SegmentReference {
    pub start_time: f64,
    pub end_time: f64,
    /// Candidate URIs, in fallback order. A `BaseURL` cartesian product (DASH) or a single media
    /// URI (HLS) both land here.
    pub uris: Vec<String>,
    pub byte_range: Option<ByteRange>,
    pub init_segment: Option<Arc<InitSegmentReference>>,
    pub timestamp_offset: f64,
    pub append_window_start: f64,
    pub append_window_end: f64,
    pub discontinuity_sequence: u64,
    pub status: SegmentStatus,
    pub key: Option<Arc<KeyHandle>>,
    pub tiles_layout: Option<String>,
    pub sync_time: Option<chrono::DateTime<chrono::Utc>>,
}

impl SegmentReference {
    pub fn new(start_time: f64, end_time: f64, uris: Vec<String>) -> Self {
        SegmentReference {
            start_time,
            end_time,
            uris,
            byte_range: None,
            init_segment: None,
            timestamp_offset: 0.0,
            append_window_start: 0.0,
            append_window_end: f64::INFINITY,
            discontinuity_sequence: 0,
            status: SegmentStatus::Available,
            key: None,
            tiles_layout: None,
            sync_time: None,
        }
    }

    pub fn contains(&self, t: f64) -> bool {
        self.start_time <= t && t < self.end_time
    }
}

/// An ordered, position-keyed, evictable sequence of segment references for one stream (§3.4).
///
/// Represented as a `Vec` plus a `first_position` offset, exactly as §4.3 specifies: `evict`
/// shrinks the head of the vector and advances the offset so that surviving positions are
/// unchanged and references remain reference-stable (tested in `tests/segment_index.rs`).
#[derive(Debug, Default)]
pub struct SegmentIndex {
    first_position: i64,
    refs: Vec<Arc<SegmentReference>>,
}

impl SegmentIndex {
    pub fn new(first_position: i64, refs: Vec<SegmentReference>) -> Self {
        SegmentIndex {
            first_position,
            refs: refs.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn empty() -> Self {
        SegmentIndex {
            first_position: 0,
            refs: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn first_position(&self) -> Option<i64> {
        if self.refs.is_empty() {
            None
        } else {
            Some(self.first_position)
        }
    }

    pub fn last_position(&self) -> Option<i64> {
        if self.refs.is_empty() {
            None
        } else {
            Some(self.first_position + self.refs.len() as i64 - 1)
        }
    }

    fn index_of(&self, position: i64) -> Option<usize> {
        if self.refs.is_empty() {
            return None;
        }
        let idx = position - self.first_position;
        if idx < 0 || idx as usize >= self.refs.len() {
            None
        } else {
            Some(idx as usize)
        }
    }

    /// `get(position) -> reference | null`.
    pub fn get(&self, position: i64) -> Option<&Arc<SegmentReference>> {
        self.index_of(position).map(|i| &self.refs[i])
    }

    /// `find(t) -> position | null`: first position whose `[startTime, endTime)` contains `t`,
    /// or the earliest position with `startTime >= t` if `t` precedes the range.
    pub fn find(&self, t: f64) -> Option<i64> {
        if self.refs.is_empty() {
            return None;
        }
        // Binary search for the first reference whose end_time is > t; references are
        // non-overlapping and sorted by start_time, so this is equivalent to a search on
        // start_time for our purposes.
        let mut lo = 0usize;
        let mut hi = self.refs.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.refs[mid].end_time <= t {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo >= self.refs.len() {
            return None;
        }
        Some(self.first_position + lo as i64)
    }

    /// Drop every reference with `endTime <= threshold`. Positions of remaining references do
    /// not change.
    pub fn evict(&mut self, threshold: f64) {
        let mut drop_count = 0;
        for r in &self.refs {
            if r.end_time <= threshold {
                drop_count += 1;
            } else {
                break;
            }
        }
        if drop_count > 0 {
            self.refs.drain(0..drop_count);
            self.first_position += drop_count as i64;
        }
    }

    /// DASH-live / HLS-live update: align the incoming list to the current list by position.
    /// References whose position overlaps an existing entry replace it; references past the
    /// current tail extend it. `availability_start` discards incoming references that have
    /// already fallen out of the availability window before they are ever inserted.
    pub fn merge(&mut self, new_first_position: i64, incoming: Vec<SegmentReference>, availability_start: f64) {
        // `incoming` is in position order, so references that have already fallen out of the
        // availability window are always a leading prefix. Count that prefix and shift
        // `new_first_position` past it, so the first surviving reference keeps the position it
        // would have had if the stale ones were never generated.
        let dropped = incoming.iter().take_while(|r| r.end_time <= availability_start).count();
        let new_first_position = new_first_position + dropped as i64;
        let incoming: Vec<Arc<SegmentReference>> = incoming.into_iter().skip(dropped).map(Arc::new).collect();
        if incoming.is_empty() {
            return;
        }
        if self.refs.is_empty() {
            self.first_position = new_first_position;
            self.refs = incoming;
            return;
        }
        let current_last = self.first_position + self.refs.len() as i64 - 1;
        let incoming_last = new_first_position + incoming.len() as i64 - 1;

        if new_first_position > current_last + 1 {
            // Pure append with a gap the source considers the live edge; we still lay it out
            // contiguously because positions are never supposed to skip meaning mid-index.
            self.refs.extend(incoming);
            return;
        }
        if incoming_last < self.first_position {
            // Entirely stale relative to what we already have: nothing to do.
            return;
        }

        // Overlap region: splice incoming into place, replacing any existing entries at the
        // same position and extending the tail with anything new.
        let overlap_start = new_first_position.max(self.first_position);
        let keep_head = (overlap_start - self.first_position).max(0) as usize;
        self.refs.truncate(keep_head);
        let skip_incoming = (overlap_start - new_first_position).max(0) as usize;
        self.refs.extend(incoming.into_iter().skip(skip_incoming));
    }

    /// Lazy, finite iteration in position order.
    pub fn iter(&self) -> impl Iterator<Item = (i64, &Arc<SegmentReference>)> {
        self.refs
            .iter()
            .enumerate()
            .map(move |(i, r)| (self.first_position + i as i64, r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: f64, end: f64) -> SegmentReference {
        SegmentReference::new(start, end, vec![format!("s{start}.mp4")])
    }

    #[test]
    fn find_returns_containing_position() {
        let idx = SegmentIndex::new(5, vec![seg(0.0, 2.0), seg(2.0, 4.0), seg(4.0, 6.0)]);
        assert_eq!(idx.find(0.5), Some(5));
        assert_eq!(idx.find(2.0), Some(6));
        assert_eq!(idx.find(5.9), Some(7));
        let p = idx.find(3.0).unwrap();
        let r = idx.get(p).unwrap();
        assert!(r.start_time <= 3.0 && 3.0 < r.end_time);
    }

    #[test]
    fn find_before_range_returns_earliest() {
        let idx = SegmentIndex::new(0, vec![seg(10.0, 12.0), seg(12.0, 14.0)]);
        assert_eq!(idx.find(0.0), Some(0));
    }

    #[test]
    fn find_after_range_returns_none() {
        let idx = SegmentIndex::new(0, vec![seg(0.0, 2.0)]);
        assert_eq!(idx.find(5.0), None);
    }

    #[test]
    fn evict_preserves_surviving_positions_and_identity() {
        let mut idx = SegmentIndex::new(0, vec![seg(0.0, 10.0), seg(10.0, 15.0), seg(15.0, 30.0)]);
        let kept_ptr = Arc::as_ptr(idx.get(2).unwrap());
        idx.evict(11.0);
        assert_eq!(idx.first_position(), Some(1));
        assert!(idx.get(0).is_none());
        assert_eq!(Arc::as_ptr(idx.get(2).unwrap()), kept_ptr);
    }

    #[test]
    fn merge_replaces_overlap_and_extends_tail() {
        let mut idx = SegmentIndex::new(0, vec![seg(0.0, 2.0), seg(2.0, 4.0)]);
        idx.merge(1, vec![seg(2.0, 4.0), seg(4.0, 6.0), seg(6.0, 8.0)], 0.0);
        assert_eq!(idx.first_position(), Some(0));
        assert_eq!(idx.last_position(), Some(3));
        assert_eq!(idx.get(1).unwrap().end_time, 4.0);
        assert_eq!(idx.get(3).unwrap().end_time, 8.0);
    }

    #[test]
    fn merge_discards_references_before_availability_window() {
        let mut idx = SegmentIndex::new(0, vec![seg(0.0, 10.0)]);
        idx.merge(1, vec![seg(10.0, 11.0), seg(11.0, 20.0)], 15.0);
        // the [10,11) reference ends before the availability window and is discarded
        assert_eq!(idx.last_position(), Some(1));
        assert_eq!(idx.get(1).unwrap().start_time, 11.0);
    }

    #[test]
    fn merge_keeps_positions_stable_when_source_always_regenerates_from_the_same_first_position() {
        // Some sources (e.g. a DASH fixed-duration SegmentTemplate list that isn't clipped to the
        // availability window) always report the same nominal first_position and rely on the
        // availability filter to trim the stale head. seg1(2-4) must land at the same position on
        // both ticks regardless of how many leading references the filter drops.
        let mut idx = SegmentIndex::new(0, vec![]);
        idx.merge(1, vec![seg(0.0, 2.0), seg(2.0, 4.0)], 0.0);
        assert_eq!(idx.first_position(), Some(1));
        assert_eq!(idx.get(2).unwrap().start_time, 2.0);

        // Availability window has advanced past seg0; the source regenerates the same list plus
        // one more trailing segment, still claiming first_position=1.
        idx.merge(1, vec![seg(0.0, 2.0), seg(2.0, 4.0), seg(4.0, 6.0)], 2.0);
        assert_eq!(idx.first_position(), Some(1));
        assert_eq!(idx.get(2).unwrap().start_time, 2.0);
        assert_eq!(idx.get(3).unwrap().start_time, 4.0);
    }

    #[test]
    fn s2_scenario_live_eviction() {
        // Spec S2: SegmentTimeline <S d=10 t=0/><S d=5/><S d=15/> => [0,10)[10,15)[15,30)
        let mut idx = SegmentIndex::new(0, vec![seg(0.0, 10.0), seg(10.0, 15.0), seg(15.0, 30.0)]);
        assert_eq!(idx.find(0.0), Some(0));
        idx.evict(11.0);
        assert_eq!(idx.find(0.0), Some(1));
        idx.evict(16.0);
        assert_eq!(idx.find(0.0), Some(2));
        idx.evict(31.0);
        assert_eq!(idx.find(0.0), None);
        assert!(idx.is_empty());
    }
}
