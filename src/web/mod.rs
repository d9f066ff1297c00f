//! Browser real-time front and the media HTTP router
//!
//! One router serves everything on the media port:
//!
//! - `/{path}/` and `/{path}/publish/` — embedded pages
//! - `/{path}/ws` and `/{path}/publish/ws` — binary message channel
//! - `/{path}/index.m3u8`, `stream.m3u8`, `init.mp4`, `{seq}.mp4` —
//!   delegated to the adaptive-segment front
//! - `/playback/...` — delegated to the playback front
//!
//! ws messages to a reading client are type-prefixed binary:
//!
//! ```text
//!   0x01 + JSON        → track list
//!   0x02 + bytes       → init descriptor (ftyp+moov)
//!   0x03 + bytes       → media segment (moof+mdat)
//! ```
//!
//! A publishing client sends a JSON track list as its first (text)
//! message, then binary frame envelopes in the native wire layout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::conn::{ConnInfo, ConnPhase, ConnRegistry};
use crate::error::{RelayError, Result};
use crate::hls::{request_credentials, HlsServer};
use crate::metrics::Metrics;
use crate::path::{Credentials, PathManagerHandle, Protocol, SessionIdent};
use crate::playback::PlaybackServer;
use crate::routine::RoutinePool;
use crate::segmenter::{Segmenter, SegmenterConfig};
use crate::server::proto;

const MSG_TRACKS: u8 = 0x01;
const MSG_INIT: u8 = 0x02;
const MSG_SEGMENT: u8 = 0x03;

/// Segment tuning for the ws channel: short segments, small window.
const WS_SEGMENT_DURATION: Duration = Duration::from_secs(1);
const WS_SEGMENT_WINDOW: usize = 8;
const WS_SEGMENT_WAIT: Duration = Duration::from_secs(30);
const WS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state behind the media router.
pub struct WebState {
    pub manager: PathManagerHandle,
    pub hls: Arc<HlsServer>,
    pub playback: Arc<PlaybackServer>,
    pub conns: ConnRegistry,
    pub pool: RoutinePool,
    pub metrics: Metrics,
}

/// Build the media router (browser + adaptive-segment + playback).
pub fn router(state: Arc<WebState>) -> Router {
    Router::new().fallback(get(dispatch)).with_state(state)
}

async fn dispatch(
    State(state): State<Arc<WebState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: Option<WebSocketUpgrade>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let path = uri.path().trim_start_matches('/').to_string();
    let query = uri.query().map(String::from);
    let creds = request_credentials(&headers, query.as_deref(), remote.ip());

    if let Some(rest) = path.strip_prefix("playback/") {
        return state.playback.dispatch(rest, creds).await;
    }

    if let Some(name) = path.strip_suffix("/index.m3u8") {
        return state.hls.index(name, creds).await;
    }
    if let Some(name) = path.strip_suffix("/stream.m3u8") {
        return state.hls.media_playlist(name, creds).await;
    }
    if let Some(name) = path.strip_suffix("/init.mp4") {
        return state.hls.init(name, creds).await;
    }
    if let Some(stripped) = path.strip_suffix(".mp4") {
        if let Some((name, seq)) = stripped.rsplit_once('/') {
            if let Ok(seq) = seq.parse::<u64>() {
                return state.hls.segment(name, seq, creds).await;
            }
        }
    }

    if let Some(rest) = path.strip_suffix("/ws") {
        let Some(ws) = ws else {
            return (StatusCode::BAD_REQUEST, "websocket upgrade required").into_response();
        };
        let (name, publish) = match rest.strip_suffix("/publish") {
            Some(name) => (name.to_string(), true),
            None => (rest.to_string(), false),
        };
        return ws.on_upgrade(move |socket| async move {
            handle_ws(socket, state, name, publish, creds, remote).await;
        });
    }

    if let Some(rest) = path.strip_suffix('/') {
        if rest.strip_suffix("/publish").is_some() {
            return Html(PUBLISH_PAGE).into_response();
        }
        if !rest.is_empty() {
            return Html(PLAYER_PAGE).into_response();
        }
    }

    (StatusCode::NOT_FOUND, "not found").into_response()
}

async fn handle_ws(
    socket: WebSocket,
    state: Arc<WebState>,
    name: String,
    publish: bool,
    creds: Credentials,
    remote: SocketAddr,
) {
    let info = Arc::new(ConnInfo::new(remote, Protocol::Web));
    let token = state.pool.token().child_token();
    state.conns.register(info.clone(), token.clone());
    state.metrics.inc(&state.metrics.conns_total);
    state.metrics.inc(&state.metrics.conns_current);

    let result = if publish {
        ws_publish(socket, &state, &name, creds, &token, &info).await
    } else {
        ws_read(socket, &state, &name, creds, &token, &info).await
    };
    if let Err(e) = result {
        tracing::debug!(conn = %info.id, path = %name, error = %e, "Web session error");
    }

    info.set_phase(ConnPhase::Closed);
    state.conns.unregister(info.id);
    state.metrics.dec(&state.metrics.conns_current);
}

fn ws_ident(info: &ConnInfo) -> SessionIdent {
    SessionIdent {
        id: info.id,
        protocol: Protocol::Web,
        created: info.created,
    }
}

async fn ws_read(
    mut socket: WebSocket,
    state: &Arc<WebState>,
    name: &str,
    creds: Credentials,
    token: &CancellationToken,
    info: &Arc<ConnInfo>,
) -> Result<()> {
    let session = tokio::select! {
        _ = token.cancelled() => return Err(RelayError::Terminated),
        res = state.manager.attach_reader(name, ws_ident(info), creds) => match res {
            Ok(s) => s,
            Err(e) => {
                let _ = socket
                    .send(WsMessage::Text(
                        serde_json::json!({ "error": e.to_string() }).to_string(),
                    ))
                    .await;
                return Ok(());
            }
        },
    };
    info.set_phase(ConnPhase::Reader);

    let tracks = session.tracks().to_vec();
    let (handle, detacher) = session.split();
    let segmenter = Segmenter::start(
        handle,
        SegmenterConfig {
            target_duration: WS_SEGMENT_DURATION,
            window: WS_SEGMENT_WINDOW,
        },
        &state.pool,
        state.metrics.clone(),
    );

    let result = async {
        send_prefixed(
            &mut socket,
            MSG_TRACKS,
            &serde_json::to_vec(&tracks).unwrap_or_default(),
            info,
        )
        .await?;
        send_prefixed(&mut socket, MSG_INIT, &segmenter.init(), info).await?;

        let mut sequence = 0u64;
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                msg = socket.recv() => match msg {
                    None | Some(Ok(WsMessage::Close(_))) => return Ok(()),
                    Some(Err(_)) => return Err(RelayError::Terminated),
                    Some(Ok(_)) => {}
                },
                res = segmenter.segment(sequence, Some(WS_SEGMENT_WAIT)) => match res {
                    Ok(seg) => {
                        send_prefixed(&mut socket, MSG_SEGMENT, &seg.payload, info).await?;
                        sequence += 1;
                    }
                    // No segment in the window yet; keep waiting.
                    Err(RelayError::Timeout) => {}
                    Err(_) => return Ok(()),
                },
            }
        }
    }
    .await;

    segmenter.close();
    detacher.detach().await;
    result
}

async fn ws_publish(
    mut socket: WebSocket,
    state: &Arc<WebState>,
    name: &str,
    creds: Credentials,
    token: &CancellationToken,
    info: &Arc<ConnInfo>,
) -> Result<()> {
    let session = tokio::select! {
        _ = token.cancelled() => return Err(RelayError::Terminated),
        res = state.manager.attach_publisher(name, ws_ident(info), creds) => match res {
            Ok(s) => s,
            Err(e) => {
                let _ = socket
                    .send(WsMessage::Text(
                        serde_json::json!({ "error": e.to_string() }).to_string(),
                    ))
                    .await;
                return Ok(());
            }
        },
    };
    info.set_phase(ConnPhase::Authorized);

    // First message: the track list.
    let tracks = match tokio::time::timeout(WS_HANDSHAKE_TIMEOUT, socket.recv()).await {
        Err(_) => {
            session.remove().await;
            return Err(RelayError::Timeout);
        }
        Ok(Some(Ok(WsMessage::Text(json)))) => {
            match serde_json::from_str::<Vec<crate::frame::Track>>(&json) {
                Ok(t) => t,
                Err(e) => {
                    session.remove().await;
                    return Err(RelayError::Protocol(e.to_string()));
                }
            }
        }
        Ok(_) => {
            session.remove().await;
            return Err(RelayError::Protocol("expected track list".into()));
        }
    };

    let stream = match session.record(tracks).await {
        Ok(s) => s,
        Err(e) => {
            let _ = socket
                .send(WsMessage::Text(
                    serde_json::json!({ "error": e.to_string() }).to_string(),
                ))
                .await;
            session.remove().await;
            return Ok(());
        }
    };
    info.set_phase(ConnPhase::Publisher);
    let _ = socket
        .send(WsMessage::Text(serde_json::json!({ "ok": true }).to_string()))
        .await;

    let mut last_dts: Vec<Option<i64>> = vec![None; stream.tracks().len()];
    let result = loop {
        let msg = tokio::select! {
            _ = token.cancelled() => break Ok(()),
            msg = socket.recv() => msg,
        };
        match msg {
            None | Some(Ok(WsMessage::Close(_))) => break Ok(()),
            Some(Ok(WsMessage::Binary(data))) => {
                let frame = match proto::decode_frame(Bytes::from(data)) {
                    Ok(f) => f,
                    Err(e) => break Err(e),
                };
                if frame.track >= last_dts.len() {
                    break Err(RelayError::Protocol("frame for unknown track".into()));
                }
                if last_dts[frame.track].is_some_and(|last| frame.dts < last) {
                    break Err(RelayError::Protocol("non-monotonic DTS".into()));
                }
                last_dts[frame.track] = Some(frame.dts);
                info.add_bytes_received(frame.payload.len() as u64 + 14);
                stream.write_frame(frame);
            }
            Some(Ok(_)) => {}
            Some(Err(_)) => break Err(RelayError::Terminated),
        }
    };

    session.remove().await;
    result
}

async fn send_prefixed(
    socket: &mut WebSocket,
    kind: u8,
    payload: &[u8],
    info: &Arc<ConnInfo>,
) -> Result<()> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push(kind);
    out.extend_from_slice(payload);
    info.add_bytes_sent(out.len() as u64);
    socket
        .send(WsMessage::Binary(out))
        .await
        .map_err(|_| RelayError::Terminated)
}

/// Embedded player page: attaches to `./ws` and feeds MSE.
const PLAYER_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>relay</title></head>
<body style="margin:0;background:#000">
<video id="v" autoplay muted playsinline style="width:100%;height:100vh"></video>
<script>
const ws = new WebSocket(new URL('ws' + location.search, location.href));
ws.binaryType = 'arraybuffer';
const video = document.getElementById('v');
const ms = new MediaSource();
video.src = URL.createObjectURL(ms);
let sb = null, queue = [], codecs = null;
function pump() {
  if (sb && !sb.updating && queue.length) sb.appendBuffer(queue.shift());
}
ws.onmessage = (ev) => {
  if (typeof ev.data === 'string') { console.error(ev.data); return; }
  const data = new Uint8Array(ev.data);
  const kind = data[0], body = data.subarray(1);
  if (kind === 1) {
    codecs = JSON.parse(new TextDecoder().decode(body)).map(t => t.codec).join(',');
  } else if (kind === 2) {
    const open = () => {
      sb = ms.addSourceBuffer('video/mp4; codecs="' + codecs + '"');
      sb.onupdateend = pump;
      queue.push(body.slice().buffer); pump();
    };
    ms.readyState === 'open' ? open() : ms.addEventListener('sourceopen', open);
  } else if (kind === 3) {
    queue.push(body.slice().buffer); pump();
  }
};
</script>
</body>
</html>
"#;

/// Embedded publish page: protocol sketch for in-browser publishers.
const PUBLISH_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>relay - publish</title></head>
<body>
<p>Open a WebSocket to <code>./ws</code>, send the track list as a JSON
text message, then binary frame envelopes
(track, dts, pts-offset, flags, payload).</p>
</body>
</html>
"#;
