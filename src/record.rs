//! Record-on-publish
//!
//! A recorder is just another reader: it drives its own Segmenter and
//! writes every finished segment under `record_dir/<path>/`, named by the
//! segment's rebased start timestamp. The playback endpoints serve the
//! same directory.

use std::path::{Path, PathBuf};

use crate::metrics::Metrics;
use crate::routine::RoutinePool;
use crate::segmenter::{Segmenter, SegmenterConfig};
use crate::stream::ReaderHandle;

/// Directory for one path's recordings.
pub fn path_dir(record_dir: &Path, path_name: &str) -> PathBuf {
    record_dir.join(path_name)
}

/// File name for a segment starting at `start_dts`.
pub fn segment_file_name(start_dts: u64) -> String {
    format!("{start_dts:015}.mp4")
}

/// Start recording a Stream until it terminates.
pub fn start(
    reader: ReaderHandle,
    path_name: &str,
    record_dir: &Path,
    config: SegmenterConfig,
    pool: &RoutinePool,
    metrics: Metrics,
) {
    let dir = path_dir(record_dir, path_name);
    let name = path_name.to_string();
    let segmenter = Segmenter::start(reader, config, pool, metrics);

    pool.add(move |token| async move {
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            tracing::error!(path = %name, error = %e, "Cannot create record directory");
            return;
        }
        if let Err(e) = tokio::fs::write(dir.join("init.mp4"), segmenter.init()).await {
            tracing::error!(path = %name, error = %e, "Cannot write init descriptor");
            return;
        }
        tracing::info!(path = %name, dir = %dir.display(), "Recording started");

        let mut sequence = 0u64;
        loop {
            let segment = tokio::select! {
                _ = token.cancelled() => break,
                // Generous wait: the segmenter closing resolves it early.
                res = segmenter.segment(sequence, Some(std::time::Duration::from_secs(3600))) => res,
            };
            match segment {
                Ok(seg) => {
                    let file = dir.join(segment_file_name(seg.start_dts));
                    if let Err(e) = tokio::fs::write(&file, &seg.payload).await {
                        tracing::warn!(path = %name, error = %e, "Segment write failed");
                    }
                    sequence += 1;
                }
                // Closed or evicted: recording is over either way.
                Err(_) => break,
            }
        }
        segmenter.close();
        tracing::info!(path = %name, segments = sequence, "Recording stopped");
    });
}
