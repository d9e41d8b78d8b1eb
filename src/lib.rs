//! A Rust library for parsing adaptive-streaming manifests (MPEG-DASH MPD and HLS playlists) into
//! a uniform, live-updatable presentation model, as used by a media player's streaming engine to
//! decide what to fetch next.
//!
//! [DASH](https://en.wikipedia.org/wiki/Dynamic_Adaptive_Streaming_over_HTTP) (dynamic adaptive
//! streaming over HTTP), also called MPEG-DASH, and [HLS](https://en.wikipedia.org/wiki/HTTP_Live_Streaming)
//! (HTTP Live Streaming) are the two manifest formats in wide use for adaptive streaming over the
//! web. A DASH Media Presentation Description (MPD) or an HLS playlist describes the renditions
//! available for a presentation and the segments that make each of them up; a player walks that
//! description to pick a rendition and schedule segment fetches, and for live content re-fetches
//! the manifest on a cadence the manifest itself specifies.
//!
//! This crate owns that description and its periodic refresh. It does not open sockets, decode
//! media, or render anything: the host injects a [`net::NetworkingEngine`] to perform requests and
//! a [`net::PlayerInterface`] to receive timeline and error notifications, and this crate's job is
//! purely to turn manifest bytes into a [`manifest::Manifest`] and keep it current.
//!
//! ## Supported
//!
//! - DASH: static and dynamic (live) MPDs, multi-period content, SegmentTemplate (both
//!   `@duration` and `SegmentTimeline`), SegmentList, SegmentBase, multiple BaseURL combination,
//!   EventStream regions, UTCTiming-based clock synchronization.
//! - HLS: master and media playlists, EXT-X-MEDIA rendition groups paired by GROUP-ID, live
//!   playlist refresh, EXT-X-MAP/EXT-X-KEY/EXT-X-BYTERANGE/EXT-X-DISCONTINUITY, initial PTS
//!   probing for both fMP4 and MPEG-TS segments.
//!
//! ## Non-goals
//!
//! - Performing HTTP requests, decrypting content, or muxing/demuxing/decoding media.
//! - ABR (bitrate selection) logic: this crate hands the host every stream and variant; picking
//!   one is the host's job.

#![allow(non_snake_case)]

pub mod clock;
pub mod config;
pub mod dash;
pub mod error;
pub mod hls;
pub mod manifest;
pub mod net;
pub mod scheduler;
pub mod segment_index;
pub mod timeline;

pub use config::Config;
pub use dash::DashParser;
pub use error::{ManifestError, Result};
pub use hls::HlsParser;
pub use manifest::{ContentType, Manifest, ManifestKind, Stream, Variant};
