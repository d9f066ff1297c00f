//! Adaptive-segment HTTP front
//!
//! Serves `index.m3u8` / `stream.m3u8` / `init.mp4` / `<seq>.mp4` per
//! path. A muxer (reader + Segmenter) is created lazily on the first
//! request for a path and torn down by a sweep once idle; protected
//! paths answer unauthenticated requests with a Basic challenge.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use tokio::time::Instant;

use crate::conf::Conf;
use crate::error::{RelayError, Result};
use crate::frame::Track;
use crate::metrics::Metrics;
use crate::path::{
    Credentials, PathManagerHandle, Protocol, ReaderDetacher, Role, SessionIdent,
};
use crate::routine::RoutinePool;
use crate::segmenter::{Segmenter, SegmenterConfig};

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/mp4";

/// How often idle muxers are collected.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Tuning for the adaptive-segment front.
#[derive(Debug, Clone)]
pub struct HlsConfig {
    pub segmenter: SegmenterConfig,
    /// How long a segment request may wait for a pending sequence
    pub segment_wait: Duration,
    /// Idle time before a muxer is torn down
    pub close_after: Duration,
}

impl HlsConfig {
    pub fn from_conf(conf: &Conf) -> Self {
        Self {
            segmenter: SegmenterConfig {
                target_duration: conf.segment_duration(),
                window: conf.segment_window,
            },
            segment_wait: conf.segment_wait(),
            close_after: conf.muxer_close_after(),
        }
    }
}

struct MuxerInner {
    segmenter: Segmenter,
    tracks: Vec<Track>,
    detacher: ReaderDetacher,
    last_access: Mutex<Instant>,
}

#[derive(Clone)]
struct Muxer(Arc<MuxerInner>);

impl Muxer {
    fn touch(&self) {
        *self.0.last_access.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.0.last_access.lock().unwrap().elapsed()
    }
}

/// Per-path muxer pool plus the request handlers.
pub struct HlsServer {
    manager: PathManagerHandle,
    config: HlsConfig,
    pool: RoutinePool,
    metrics: Metrics,
    muxers: Mutex<HashMap<String, Muxer>>,
}

impl HlsServer {
    /// Create the server and start its idle sweep on `pool`.
    pub fn new(
        manager: PathManagerHandle,
        config: HlsConfig,
        pool: &RoutinePool,
        metrics: Metrics,
    ) -> Arc<Self> {
        let server = Arc::new(Self {
            manager,
            config,
            pool: pool.clone(),
            metrics,
            muxers: Mutex::new(HashMap::new()),
        });

        let sweeper = server.clone();
        pool.add(move |token| async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => sweeper.sweep().await,
                }
            }
            // Shutdown: release every muxer.
            let drained: Vec<Muxer> = sweeper.muxers.lock().unwrap().drain().map(|(_, m)| m).collect();
            for muxer in drained {
                muxer.0.segmenter.close();
                muxer.0.detacher.detach().await;
            }
        });

        server
    }

    async fn sweep(&self) {
        let expired: Vec<Muxer> = {
            let mut muxers = self.muxers.lock().unwrap();
            let dead: Vec<String> = muxers
                .iter()
                .filter(|(_, m)| {
                    m.0.segmenter.is_closed() || m.idle_for() > self.config.close_after
                })
                .map(|(name, _)| name.clone())
                .collect();
            dead.iter().filter_map(|n| muxers.remove(n)).collect()
        };
        for muxer in expired {
            tracing::debug!("Idle muxer torn down");
            muxer.0.segmenter.close();
            muxer.0.detacher.detach().await;
        }
    }

    /// Fetch or create the muxer for a path. The caller has already been
    /// authorized; `creds` are reused for the reader attach.
    async fn muxer(&self, name: &str, creds: Credentials) -> Result<Muxer> {
        if let Some(muxer) = self.muxers.lock().unwrap().get(name) {
            if !muxer.0.segmenter.is_closed() {
                muxer.touch();
                return Ok(muxer.clone());
            }
        }

        let session = self
            .manager
            .attach_reader(name, SessionIdent::new(Protocol::Hls), creds)
            .await?;
        let tracks = session.tracks().to_vec();
        let (handle, detacher) = session.split();
        let segmenter = Segmenter::start(
            handle,
            self.config.segmenter.clone(),
            &self.pool,
            self.metrics.clone(),
        );
        let muxer = Muxer(Arc::new(MuxerInner {
            segmenter,
            tracks,
            detacher,
            last_access: Mutex::new(Instant::now()),
        }));

        let previous = self
            .muxers
            .lock()
            .unwrap()
            .insert(name.to_string(), muxer.clone());
        if let Some(old) = previous {
            // Lost a creation race or replaced a dead muxer.
            old.0.segmenter.close();
            old.0.detacher.detach().await;
        }
        Ok(muxer)
    }

    /// `GET /<path>/index.m3u8`
    pub async fn index(&self, name: &str, creds: Credentials) -> Response {
        let provided = creds.provided();
        if let Err(e) = self
            .manager
            .get_path_conf(name, Role::Read, creds.clone())
            .await
        {
            return deny(&e, provided);
        }
        match self.muxer(name, creds).await {
            Ok(muxer) => playlist_response(master_playlist(&muxer.0.tracks)),
            Err(e) => deny(&e, provided),
        }
    }

    /// `GET /<path>/stream.m3u8`
    pub async fn media_playlist(&self, name: &str, creds: Credentials) -> Response {
        let provided = creds.provided();
        if let Err(e) = self
            .manager
            .get_path_conf(name, Role::Read, creds.clone())
            .await
        {
            return deny(&e, provided);
        }
        let muxer = match self.muxer(name, creds).await {
            Ok(m) => m,
            Err(e) => return deny(&e, provided),
        };

        // Serve nothing until the first segment exists; clients poll.
        let mut snapshot = muxer.0.segmenter.playlist();
        if snapshot.segments.is_empty() && !snapshot.closed {
            let _ = muxer
                .0
                .segmenter
                .segment(0, Some(self.config.segment_wait))
                .await;
            snapshot = muxer.0.segmenter.playlist();
        }
        playlist_response(media_playlist_text(&snapshot))
    }

    /// `GET /<path>/init.mp4`
    pub async fn init(&self, name: &str, creds: Credentials) -> Response {
        let provided = creds.provided();
        match self.authorized_muxer(name, creds).await {
            Ok(muxer) => segment_response(muxer.0.segmenter.init()),
            Err(e) => deny(&e, provided),
        }
    }

    /// `GET /<path>/<seq>.mp4`
    pub async fn segment(&self, name: &str, sequence: u64, creds: Credentials) -> Response {
        let provided = creds.provided();
        let muxer = match self.authorized_muxer(name, creds).await {
            Ok(m) => m,
            Err(e) => return deny(&e, provided),
        };
        match muxer
            .0
            .segmenter
            .segment(sequence, Some(self.config.segment_wait))
            .await
        {
            Ok(seg) => segment_response(seg.payload),
            Err(e) => deny(&e, false),
        }
    }

    async fn authorized_muxer(&self, name: &str, creds: Credentials) -> Result<Muxer> {
        self.manager
            .get_path_conf(name, Role::Read, creds.clone())
            .await?;
        self.muxer(name, creds).await
    }
}

/// Extract credentials from a request: Basic header first, then
/// `user`/`pass` query parameters.
pub fn request_credentials(headers: &HeaderMap, query: Option<&str>, ip: IpAddr) -> Credentials {
    let mut creds = Credentials::anonymous(ip);
    creds.query = query.map(String::from);

    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    {
        if let Ok(decoded) = BASE64.decode(value) {
            if let Ok(pair) = String::from_utf8(decoded) {
                let (user, pass) = pair.split_once(':').unwrap_or((pair.as_str(), ""));
                creds.user = Some(user.to_string());
                creds.pass = Some(pass.to_string());
                return creds;
            }
        }
    }

    if let Some(query) = query {
        for kv in query.split('&') {
            match kv.split_once('=') {
                Some(("user", v)) if !v.is_empty() => creds.user = Some(v.to_string()),
                Some(("pass", v)) if !v.is_empty() => creds.pass = Some(v.to_string()),
                _ => {}
            }
        }
    }
    creds
}

/// Map a relay error onto the HTTP surface. Missing credentials get a
/// Basic challenge; wrong ones get a bare 401 with no extra detail.
pub fn deny(err: &RelayError, creds_provided: bool) -> Response {
    match err {
        RelayError::Authentication if !creds_provided => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"relay\"")],
            "authentication required",
        )
            .into_response(),
        RelayError::Authentication => {
            (StatusCode::UNAUTHORIZED, "authentication failed").into_response()
        }
        RelayError::PathNotFound | RelayError::SegmentNotFound | RelayError::Timeout => {
            (StatusCode::NOT_FOUND, "not found").into_response()
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response(),
    }
}

fn playlist_response(text: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE)],
        text,
    )
        .into_response()
}

fn segment_response(bytes: Bytes) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, SEGMENT_CONTENT_TYPE)],
        bytes,
    )
        .into_response()
}

fn master_playlist(tracks: &[Track]) -> String {
    let codecs: Vec<&str> = tracks.iter().map(|t| t.codec.as_str()).collect();
    format!(
        "#EXTM3U\n\
         #EXT-X-VERSION:7\n\
         #EXT-X-STREAM-INF:BANDWIDTH=1000000,CODECS=\"{}\"\n\
         stream.m3u8\n",
        codecs.join(",")
    )
}

fn media_playlist_text(snapshot: &crate::segmenter::PlaylistSnapshot) -> String {
    let target = snapshot.target_duration.as_secs_f64().ceil() as u64;
    let first_seq = snapshot.segments.first().map_or(0, |(seq, _)| *seq);

    let mut out = format!(
        "#EXTM3U\n\
         #EXT-X-VERSION:7\n\
         #EXT-X-TARGETDURATION:{target}\n\
         #EXT-X-MEDIA-SEQUENCE:{first_seq}\n\
         #EXT-X-MAP:URI=\"init.mp4\"\n"
    );
    for (seq, duration) in &snapshot.segments {
        out.push_str(&format!("#EXTINF:{:.5},\n{seq}.mp4\n", duration.as_secs_f64()));
    }
    if snapshot.closed {
        out.push_str("#EXT-X-ENDLIST\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmenter::PlaylistSnapshot;

    #[test]
    fn test_master_playlist_lists_codecs() {
        let tracks = vec![
            Track::video("avc1.640028", Bytes::new()),
            Track::audio("mp4a.40.2", 48_000, Bytes::new()),
        ];
        let text = master_playlist(&tracks);
        assert!(text.starts_with("#EXTM3U"));
        assert!(text.contains("CODECS=\"avc1.640028,mp4a.40.2\""));
        assert!(text.contains("stream.m3u8"));
    }

    #[test]
    fn test_media_playlist_shape() {
        let snapshot = PlaylistSnapshot {
            target_duration: Duration::from_secs(2),
            segments: vec![
                (3, Duration::from_secs_f64(2.0)),
                (4, Duration::from_secs_f64(1.966)),
            ],
            closed: false,
        };
        let text = media_playlist_text(&snapshot);
        assert!(text.contains("#EXT-X-TARGETDURATION:2"));
        assert!(text.contains("#EXT-X-MEDIA-SEQUENCE:3"));
        assert!(text.contains("#EXT-X-MAP:URI=\"init.mp4\""));
        assert!(text.contains("3.mp4"));
        assert!(text.contains("4.mp4"));
        assert!(!text.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn test_media_playlist_endlist_on_close() {
        let snapshot = PlaylistSnapshot {
            target_duration: Duration::from_secs(2),
            segments: vec![(0, Duration::from_secs(1))],
            closed: true,
        };
        assert!(media_playlist_text(&snapshot).ends_with("#EXT-X-ENDLIST\n"));
    }

    #[test]
    fn test_request_credentials_basic_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Basic {}", BASE64.encode("u:p")).parse().unwrap(),
        );
        let creds = request_credentials(&headers, None, "127.0.0.1".parse().unwrap());
        assert_eq!(creds.user.as_deref(), Some("u"));
        assert_eq!(creds.pass.as_deref(), Some("p"));
    }

    #[test]
    fn test_request_credentials_query_params() {
        let headers = HeaderMap::new();
        let creds =
            request_credentials(&headers, Some("user=u&pass=p&x=1"), "127.0.0.1".parse().unwrap());
        assert_eq!(creds.user.as_deref(), Some("u"));
        assert_eq!(creds.pass.as_deref(), Some("p"));
        assert_eq!(creds.query.as_deref(), Some("user=u&pass=p&x=1"));
    }

    #[test]
    fn test_deny_challenge_only_without_credentials() {
        let with_challenge = deny(&RelayError::Authentication, false);
        assert_eq!(with_challenge.status(), StatusCode::UNAUTHORIZED);
        assert!(with_challenge
            .headers()
            .contains_key(header::WWW_AUTHENTICATE));

        let without = deny(&RelayError::Authentication, true);
        assert_eq!(without.status(), StatusCode::UNAUTHORIZED);
        assert!(!without.headers().contains_key(header::WWW_AUTHENTICATE));

        let missing = deny(&RelayError::PathNotFound, true);
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
