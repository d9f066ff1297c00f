//! Replay of recorded segments
//!
//! Serves the record directory over the same path namespace:
//! `GET /playback/<path>/list`, `GET /playback/<path>/init.mp4`,
//! `GET /playback/<path>/<start>.mp4`. Reads are authorized against the
//! path's configuration like any live attach.

use std::path::PathBuf;
use std::sync::Arc;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::conf::validate_path_name;
use crate::hls::deny;
use crate::path::{Credentials, PathManagerHandle, Role};
use crate::record;

/// Playback handlers over the record directory.
pub struct PlaybackServer {
    manager: PathManagerHandle,
    record_dir: PathBuf,
}

impl PlaybackServer {
    pub fn new(manager: PathManagerHandle, record_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            manager,
            record_dir,
        })
    }

    /// Route a request below `/playback/`.
    pub async fn dispatch(&self, rest: &str, creds: Credentials) -> Response {
        if let Some(name) = rest.strip_suffix("/list") {
            return self.list(name, creds).await;
        }
        if let Some(stripped) = rest.strip_suffix(".mp4") {
            if let Some((name, file)) = stripped.rsplit_once('/') {
                if file == "init" {
                    return self.file(name, "init.mp4".into(), creds).await;
                }
                if let Ok(start) = file.parse::<u64>() {
                    return self
                        .file(name, record::segment_file_name(start), creds)
                        .await;
                }
            }
        }
        (StatusCode::NOT_FOUND, "not found").into_response()
    }

    async fn authorize(&self, name: &str, creds: &Credentials) -> Result<(), Response> {
        let provided = creds.provided();
        if validate_path_name(name).is_err() {
            return Err((StatusCode::NOT_FOUND, "not found").into_response());
        }
        self.manager
            .get_path_conf(name, Role::Read, creds.clone())
            .await
            .map_err(|e| deny(&e, provided))?;
        Ok(())
    }

    /// `GET /playback/<path>/list`
    async fn list(&self, name: &str, creds: Credentials) -> Response {
        if let Err(resp) = self.authorize(name, &creds).await {
            return resp;
        }

        let dir = record::path_dir(&self.record_dir, name);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(_) => return Json(json!({ "items": [] })).into_response(),
        };

        let mut items: Vec<serde_json::Value> = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name();
            let Some(stem) = file_name
                .to_str()
                .and_then(|n| n.strip_suffix(".mp4"))
            else {
                continue;
            };
            let Ok(start) = stem.parse::<u64>() else {
                continue;
            };
            let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            items.push(json!({ "start": start, "size": size }));
        }
        items.sort_by_key(|v| v["start"].as_u64());
        Json(json!({ "items": items })).into_response()
    }

    /// Serve one recorded file.
    async fn file(&self, name: &str, file_name: String, creds: Credentials) -> Response {
        if let Err(resp) = self.authorize(name, &creds).await {
            return resp;
        }

        let path = record::path_dir(&self.record_dir, name).join(file_name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "video/mp4")],
                bytes,
            )
                .into_response(),
            Err(_) => (StatusCode::NOT_FOUND, "not found").into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::{Conf, PathConf};
    use crate::metrics;
    use crate::path::{manager, CommandLauncher, PathSettings};
    use crate::routine::RoutinePool;
    use http_body_util::BodyExt;

    async fn setup(record_dir: PathBuf) -> (Arc<PlaybackServer>, RoutinePool) {
        let pool = RoutinePool::new();
        let mut conf = Conf::default();
        conf.paths.insert("live/cam1".into(), PathConf::default());
        let manager = manager::spawn(
            conf,
            PathSettings::default(),
            Arc::new(CommandLauncher),
            None,
            metrics::new(),
            &pool,
        );
        (PlaybackServer::new(manager, record_dir), pool)
    }

    fn anon() -> Credentials {
        Credentials::anonymous("127.0.0.1".parse().unwrap())
    }

    #[tokio::test]
    async fn test_list_recorded_segments() {
        let dir = tempfile::tempdir().unwrap();
        let path_dir = dir.path().join("live/cam1");
        std::fs::create_dir_all(&path_dir).unwrap();
        std::fs::write(path_dir.join("init.mp4"), b"init").unwrap();
        std::fs::write(path_dir.join(record::segment_file_name(0)), vec![0; 10]).unwrap();
        std::fs::write(path_dir.join(record::segment_file_name(90_000)), vec![0; 20]).unwrap();

        let (server, pool) = setup(dir.path().to_path_buf()).await;
        let resp = server.dispatch("live/cam1/list", anon()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let items = json["items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["start"], 0);
        assert_eq!(items[1]["start"], 90_000);
        assert_eq!(items[1]["size"], 20);

        pool.cancel();
        pool.wait().await;
    }

    #[tokio::test]
    async fn test_fetch_segment_and_miss() {
        let dir = tempfile::tempdir().unwrap();
        let path_dir = dir.path().join("live/cam1");
        std::fs::create_dir_all(&path_dir).unwrap();
        std::fs::write(path_dir.join(record::segment_file_name(42)), b"segment").unwrap();

        let (server, pool) = setup(dir.path().to_path_buf()).await;

        let resp = server.dispatch("live/cam1/42.mp4", anon()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = server.dispatch("live/cam1/43.mp4", anon()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.cancel();
        pool.wait().await;
    }

    #[tokio::test]
    async fn test_unconfigured_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (server, pool) = setup(dir.path().to_path_buf()).await;
        let resp = server.dispatch("nope/list", anon()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.cancel();
        pool.wait().await;
    }

    #[tokio::test]
    async fn test_traversal_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (server, pool) = setup(dir.path().to_path_buf()).await;
        let resp = server.dispatch("live//cam1/list", anon()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.cancel();
        pool.wait().await;
    }
}
