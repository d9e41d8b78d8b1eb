//! End-to-end HLS scenarios, mirroring `tests/dash_scenarios.rs`.

use adaptive_manifest::clock::SystemClock;
use adaptive_manifest::config::Config;
use adaptive_manifest::hls::HlsParser;
use adaptive_manifest::net::testing::{InMemoryNetworkingEngine, NoopPlayerInterface};
use adaptive_manifest::segment_index::ByteRange;
use std::sync::Arc;

const MASTER: &str = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=800000,CODECS=\"avc1.4d401f,mp4a.40.2\",AUDIO=\"aud\"
video.m3u8
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"English\",LANGUAGE=\"en\",URI=\"audio.m3u8\"
";

/// S5 — HLS master + VOD media playlist: MAP byte range and segment byte range resolve, and the
/// video stream referenced by the sole variant carries the variant's bandwidth/codecs.
#[tokio::test]
async fn s5_master_and_vod_media_playlist() {
    let net = Arc::new(InMemoryNetworkingEngine::new());
    net.set("http://example.com/master.m3u8", MASTER.as_bytes());
    net.set(
        "http://example.com/video.m3u8",
        "#EXTM3U
#EXT-X-TARGETDURATION:5
#EXT-X-PLAYLIST-TYPE:VOD
#EXT-X-MAP:URI=\"init.mp4\",BYTERANGE=\"616@0\"
#EXTINF:5,
#EXT-X-BYTERANGE:121090@616
main.mp4
#EXT-X-ENDLIST
"
        .as_bytes(),
    );
    net.set("http://example.com/audio.m3u8", "#EXTM3U\n#EXT-X-TARGETDURATION:5\n#EXT-X-ENDLIST\n".as_bytes());

    let parser = HlsParser::new(net, Arc::new(NoopPlayerInterface), Config::default(), Arc::new(SystemClock));
    let manifest = parser.start("http://example.com/master.m3u8").await.unwrap();

    assert_eq!(manifest.variants.len(), 1);
    let variant = &manifest.variants[0];
    assert_eq!(variant.bandwidth, Some(800000));
    let video = variant.video.as_ref().unwrap();
    assert_eq!(video.bandwidth, Some(800000));
    assert_eq!(video.codecs.as_deref(), Some("avc1.4d401f,mp4a.40.2"));
    assert_eq!(variant.language.as_deref(), Some("en"));

    parser.create_segment_index(video, &manifest.timeline).await.unwrap();
    let idx = video.segment_index().unwrap();
    let idx = idx.lock().unwrap();
    assert_eq!(idx.len(), 1);
    let seg = idx.get(idx.first_position().unwrap()).unwrap();
    assert_eq!(seg.start_time, 0.0);
    assert_eq!(seg.end_time, 5.0);
    assert_eq!(seg.byte_range, Some(ByteRange::new(616, 121705)));
}

const MULTI_GROUP_MASTER: &str = "#EXTM3U
#EXT-X-MEDIA:TYPE=VIDEO,GROUP-ID=\"vid\",NAME=\"HD\",URI=\"hd.m3u8\"
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"English\",LANGUAGE=\"en\",URI=\"audio.m3u8\"
#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"subs\",LANGUAGE=\"en\",URI=\"subs-en.m3u8\"
#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"unused-subs\",LANGUAGE=\"fr\",URI=\"subs-fr.m3u8\"
#EXT-X-MEDIA:TYPE=CLOSED-CAPTIONS,GROUP-ID=\"cc\",LANGUAGE=\"en\",INSTREAM-ID=\"CC1\"
#EXT-X-STREAM-INF:BANDWIDTH=800000,CODECS=\"avc1.4d401f,mp4a.40.2\",AUDIO=\"aud\",VIDEO=\"vid\",SUBTITLES=\"subs\",CLOSED-CAPTIONS=\"cc\"
low.m3u8
";

/// Exercises §4.5.2's full VIDEO/AUDIO/SUBTITLES/CLOSED-CAPTIONS group-pairing cartesian product:
/// the variant pairs with its VIDEO-group rendition (not its own playlist URI), the referenced
/// SUBTITLES group is published but the unreferenced one is not, and CLOSED-CAPTIONS entries land
/// on the paired video Stream.
#[tokio::test]
async fn group_pairing_wires_video_subtitles_and_closed_captions() {
    let net = Arc::new(InMemoryNetworkingEngine::new());
    net.set("http://example.com/master.m3u8", MULTI_GROUP_MASTER.as_bytes());

    let parser = HlsParser::new(net, Arc::new(NoopPlayerInterface), Config::default(), Arc::new(SystemClock));
    let manifest = parser.start("http://example.com/master.m3u8").await.unwrap();

    assert_eq!(manifest.variants.len(), 1);
    let variant = &manifest.variants[0];
    let video = variant.video.as_ref().unwrap();
    assert_eq!(video.id, "http://example.com/hd.m3u8");
    assert_eq!(video.closed_captions, vec![("en".to_string(), "CC1".to_string())]);
    assert_eq!(variant.audio.as_ref().unwrap().language.as_deref(), Some("en"));

    assert_eq!(manifest.text_streams.len(), 1);
    assert_eq!(manifest.text_streams[0].id, "http://example.com/subs-en.m3u8");
}

/// §4.5.6 — a master playlist whose only `EXT-X-SESSION-KEY` is AES-128 is rejected outright:
/// this engine never decrypts media and has no clear alternative to fall back to.
#[tokio::test]
async fn master_with_only_aes128_session_key_is_rejected() {
    let net = Arc::new(InMemoryNetworkingEngine::new());
    net.set(
        "http://example.com/master.m3u8",
        "#EXTM3U
#EXT-X-SESSION-KEY:METHOD=AES-128,URI=\"key.bin\"
#EXT-X-STREAM-INF:BANDWIDTH=800000,CODECS=\"avc1.4d401f\"
low.m3u8
"
        .as_bytes(),
    );

    let parser = HlsParser::new(net, Arc::new(NoopPlayerInterface), Config::default(), Arc::new(SystemClock));
    let err = parser.start("http://example.com/master.m3u8").await.unwrap_err();
    assert!(matches!(err, adaptive_manifest::error::ManifestError::NoWebCryptoApi));
}

/// `stop()` called before `start()` ever runs rejects the fetch with `OperationAborted`.
#[tokio::test]
async fn stop_before_start_aborts_the_initial_fetch() {
    let net = Arc::new(InMemoryNetworkingEngine::new());
    net.set("http://example.com/master.m3u8", MASTER.as_bytes());

    let parser = HlsParser::new(net, Arc::new(NoopPlayerInterface), Config::default(), Arc::new(SystemClock));
    parser.stop();
    let err = parser.start("http://example.com/master.m3u8").await.unwrap_err();
    assert!(err.is_aborted());
}

/// §4.5.6 — AES-128 discovered in a stream's own media playlist (no master-level session key
/// hint) is rejected when that stream's segment index is actually created.
#[tokio::test]
async fn aes128_media_playlist_rejected_on_segment_index_creation() {
    let net = Arc::new(InMemoryNetworkingEngine::new());
    net.set(
        "http://example.com/master.m3u8",
        "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=800000,CODECS=\"avc1.4d401f\"
low.m3u8
"
        .as_bytes(),
    );
    net.set(
        "http://example.com/low.m3u8",
        "#EXTM3U
#EXT-X-TARGETDURATION:5
#EXT-X-PLAYLIST-TYPE:VOD
#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"
#EXTINF:5,
seg0.ts
#EXT-X-ENDLIST
"
        .as_bytes(),
    );

    let parser = HlsParser::new(net, Arc::new(NoopPlayerInterface), Config::default(), Arc::new(SystemClock));
    let manifest = parser.start("http://example.com/master.m3u8").await.unwrap();
    let video = manifest.variants[0].video.as_ref().unwrap();
    let err = parser.create_segment_index(video, &manifest.timeline).await.unwrap_err();
    assert!(matches!(err, adaptive_manifest::error::ManifestError::HlsAes128EncryptionNotSupported));
}

/// `disable_audio` drops the AUDIO rendition group entirely, leaving video-only variants; an
/// `#EXT-X-IMAGE-STREAM-INF` tile stream is published to `manifest.image_streams` unless
/// `disable_thumbnails` is set.
#[tokio::test]
async fn disable_audio_and_disable_thumbnails_are_honored() {
    let net = Arc::new(InMemoryNetworkingEngine::new());
    net.set("http://example.com/master.m3u8", MASTER.as_bytes());
    net.set("http://example.com/video.m3u8", "#EXTM3U\n#EXT-X-TARGETDURATION:5\n#EXT-X-ENDLIST\n".as_bytes());
    net.set("http://example.com/audio.m3u8", "#EXTM3U\n#EXT-X-TARGETDURATION:5\n#EXT-X-ENDLIST\n".as_bytes());

    let config = Config::new().with_disable_audio(true).with_disable_thumbnails(true);
    let parser = HlsParser::new(net, Arc::new(NoopPlayerInterface), config, Arc::new(SystemClock));
    let manifest = parser.start("http://example.com/master.m3u8").await.unwrap();

    assert_eq!(manifest.variants.len(), 1);
    assert!(manifest.variants[0].audio.is_none());
    assert!(manifest.image_streams.is_empty());
}
