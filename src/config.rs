//! §6.3/§10.3 — the in-memory configuration the parser interface consumes.
//!
//! Reading a config file or CLI arguments from disk is out of scope (§1); this struct is what
//! that (absent) loading layer would produce. The chainable `with_*` builder style is grounded on
//! `DashDownloader`'s builder methods in the teacher's `fetch.rs` (`with_quality_preference`,
//! `with_language_preference`, and friends), scaled down to the handful of options §6.3 enumerates.

#[derive(Debug, Clone)]
pub struct Config {
    /// Replaces the parsed availability window when set, in seconds.
    pub availability_window_override: Option<f64>,
    pub dash_clock_sync_uri: Option<String>,
    pub dash_ignore_min_buffer_time: bool,
    pub dash_auto_correct_drift: bool,
    pub dash_initial_segment_limit: Option<u64>,
    pub hls_ignore_text_stream_failures: bool,
    pub hls_ignore_image_stream_failures: bool,
    pub hls_ignore_manifest_program_date_time: bool,
    pub hls_media_playlist_full_mime_type: String,
    pub hls_sequence_mode: bool,
    pub disable_audio: bool,
    pub disable_video: bool,
    pub disable_text: bool,
    pub disable_thumbnails: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            availability_window_override: None,
            dash_clock_sync_uri: None,
            dash_ignore_min_buffer_time: false,
            dash_auto_correct_drift: true,
            dash_initial_segment_limit: None,
            hls_ignore_text_stream_failures: false,
            hls_ignore_image_stream_failures: false,
            hls_ignore_manifest_program_date_time: false,
            hls_media_playlist_full_mime_type: "video/mp4".to_string(),
            hls_sequence_mode: false,
            disable_audio: false,
            disable_video: false,
            disable_text: false,
            disable_thumbnails: false,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_availability_window_override(mut self, seconds: f64) -> Self {
        self.availability_window_override = Some(seconds);
        self
    }

    pub fn with_dash_clock_sync_uri(mut self, uri: impl Into<String>) -> Self {
        self.dash_clock_sync_uri = Some(uri.into());
        self
    }

    pub fn with_hls_ignore_manifest_program_date_time(mut self, ignore: bool) -> Self {
        self.hls_ignore_manifest_program_date_time = ignore;
        self
    }

    pub fn with_disable_audio(mut self, disable: bool) -> Self {
        self.disable_audio = disable;
        self
    }

    pub fn with_disable_video(mut self, disable: bool) -> Self {
        self.disable_video = disable;
        self
    }

    pub fn with_disable_text(mut self, disable: bool) -> Self {
        self.disable_text = disable;
        self
    }

    pub fn with_disable_thumbnails(mut self, disable: bool) -> Self {
        self.disable_thumbnails = disable;
        self
    }

    pub fn with_dash_ignore_min_buffer_time(mut self, ignore: bool) -> Self {
        self.dash_ignore_min_buffer_time = ignore;
        self
    }

    pub fn with_dash_auto_correct_drift(mut self, auto_correct: bool) -> Self {
        self.dash_auto_correct_drift = auto_correct;
        self
    }

    pub fn with_dash_initial_segment_limit(mut self, limit: u64) -> Self {
        self.dash_initial_segment_limit = Some(limit);
        self
    }

    pub fn with_hls_ignore_image_stream_failures(mut self, ignore: bool) -> Self {
        self.hls_ignore_image_stream_failures = ignore;
        self
    }

    pub fn with_hls_media_playlist_full_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.hls_media_playlist_full_mime_type = mime_type.into();
        self
    }
}
