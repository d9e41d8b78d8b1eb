//! §6.1/§6.2 — the networking and player interfaces this crate consumes but never implements
//! itself. The engine is a pure consumer: it builds requests, hands them to whatever
//! `NetworkingEngine` the host injects, and reports timeline/error events to whatever
//! `PlayerInterface` the host injects.
//!
//! Grounded on the teacher's `HttpClient`/request-building style in `fetch.rs` (it builds a
//! `reqwest::RequestBuilder` with headers and a byte range, then awaits a response), generalized
//! to a trait object because this crate has no concrete HTTP client dependency of its own (§1
//! Non-goals: no networking, decoding, or rendering). `async-trait` is required because plain
//! `async fn` in a trait cannot be used behind `Arc<dyn NetworkingEngine>`.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// The kind of resource a request is for, mirroring the request-type taxonomy a player's
/// networking layer branches on (retry policy, priority, CORS mode all vary by type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Manifest,
    Segment,
    Timing,
    Key,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRangeRequest {
    pub start: u64,
    pub end: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub request_type: RequestType,
    pub uris: Vec<String>,
    pub headers: HashMap<String, String>,
    pub byte_range: Option<ByteRangeRequest>,
}

impl Request {
    pub fn new(request_type: RequestType, uris: Vec<String>) -> Self {
        Request {
            request_type,
            uris,
            headers: HashMap::new(),
            byte_range: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub uri: String,
    pub data: bytes::Bytes,
    pub headers: HashMap<String, String>,
    pub status: u16,
}

/// A handle for an in-flight request that the engine may need to cancel — e.g. a PTS-probing
/// ranged fetch abandoned because the scheduler is being torn down (§4.5.4, §5).
#[async_trait]
pub trait AbortableOperation: Send + Sync {
    async fn abort(&self);
}

/// The networking collaborator a host injects. The engine never opens a socket itself.
#[async_trait]
pub trait NetworkingEngine: Send + Sync {
    async fn request(&self, req: Request) -> Result<Response>;
}

/// A DASH `EventStream` region clipped to presentation time, surfaced to the host once per
/// unique region (§6.2 `onTimelineRegionAdded`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelineRegion {
    pub start: f64,
    pub end: f64,
}

/// Timeline and diagnostic events reported to the player. None of these calls block parsing; a
/// slow or panicking player implementation must not wedge the update scheduler (§5).
///
/// Most hooks default to a no-op so a host that only cares about `on_manifest_updated`/`on_error`
/// doesn't have to implement every corner of §6.2.
#[async_trait]
pub trait PlayerInterface: Send + Sync {
    async fn on_manifest_updated(&self);
    async fn on_error(&self, err: &crate::error::ManifestError);
    async fn on_expiration_updated(&self, new_start: f64, new_end: f64);

    /// Invoked once after initial parse and once after every update, before the parser returns
    /// control to the caller.
    async fn filter(&self, _manifest: &crate::manifest::Manifest) {}

    /// Session-data and similar out-of-band notifications, identified by name.
    async fn on_event(&self, _name: &str) {}

    /// A DASH `EventStream` region; invoked exactly once per unique region.
    async fn on_timeline_region_added(&self, _region: TimelineRegion) {}

    /// Encryption metadata discovered after the initial parse (e.g. a DASH `ContentProtection`
    /// element found on a lazily-parsed Representation).
    async fn new_drm_info(&self, _stream: &crate::manifest::Stream) {}

    /// Presentation duration changed since the last notification.
    async fn update_duration(&self) {}

    fn is_low_latency_mode(&self) -> bool {
        false
    }

    fn is_auto_low_latency_mode(&self) -> bool {
        false
    }

    async fn enable_low_latency_mode(&self) {}
}

pub type SharedNetworkingEngine = Arc<dyn NetworkingEngine>;
pub type SharedPlayerInterface = Arc<dyn PlayerInterface>;

/// A lightweight in-memory `NetworkingEngine`/`PlayerInterface` pair, exposed for hosts (and this
/// crate's own tests) to exercise the parsers end to end without a real network.
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// An in-memory `NetworkingEngine` that serves fixed bodies by URI, for tests that exercise
    /// the parsers end to end without a real network (S1-S6 scenario tests).
    pub struct InMemoryNetworkingEngine {
        bodies: Mutex<HashMap<String, Vec<u8>>>,
        /// Simulates an HTTP redirect: requesting the key URI returns the value URI's body, with
        /// `Response::uri` set to the redirect target (§8 scenario S3).
        redirects: Mutex<HashMap<String, String>>,
    }

    impl InMemoryNetworkingEngine {
        pub fn new() -> Self {
            InMemoryNetworkingEngine { bodies: Mutex::new(HashMap::new()), redirects: Mutex::new(HashMap::new()) }
        }

        pub fn set(&self, uri: impl Into<String>, body: impl Into<Vec<u8>>) {
            self.bodies.lock().unwrap().insert(uri.into(), body.into());
        }

        pub fn redirect(&self, from: impl Into<String>, to: impl Into<String>) {
            self.redirects.lock().unwrap().insert(from.into(), to.into());
        }
    }

    #[async_trait]
    impl NetworkingEngine for InMemoryNetworkingEngine {
        async fn request(&self, req: Request) -> Result<Response> {
            let redirects = self.redirects.lock().unwrap();
            let bodies = self.bodies.lock().unwrap();
            for requested in &req.uris {
                let effective = redirects.get(requested).cloned().unwrap_or_else(|| requested.clone());
                if let Some(body) = bodies.get(&effective) {
                    return Ok(Response {
                        uri: effective,
                        data: bytes::Bytes::from(body.clone()),
                        headers: HashMap::new(),
                        status: 200,
                    });
                }
            }
            Err(crate::error::ManifestError::BadHttpStatus {
                status: 404,
                uri: req.uris.first().cloned().unwrap_or_default(),
            })
        }
    }

    pub struct NoopPlayerInterface;

    #[async_trait]
    impl PlayerInterface for NoopPlayerInterface {
        async fn on_manifest_updated(&self) {}
        async fn on_error(&self, _err: &crate::error::ManifestError) {}
        async fn on_expiration_updated(&self, _new_start: f64, _new_end: f64) {}
    }
}
