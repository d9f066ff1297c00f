//! The Path actor: single-writer / many-reader policy engine
//!
//! One actor per logical stream name. All state transitions happen in its
//! mailbox loop; external callers hold a `PathHandle` and never touch
//! actor state. On-demand lifecycle is an explicit state machine whose
//! timers are deadlines inside the actor's select.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::conf::PathConf;
use crate::error::{RelayError, Result};
use crate::frame::Track;
use crate::metrics::Metrics;
use crate::record;
use crate::routine::RoutinePool;
use crate::segmenter::SegmenterConfig;
use crate::stream::{ReaderHandle, Stream};

use super::auth::{authorize, AuthHook};
use super::messages::{
    Credentials, PathDescription, PathInfo, Role, SessionIdent, SessionInfo,
};
use super::source::SourceLauncher;

/// Mailbox depth; the actor drains promptly, this only absorbs bursts.
const MAILBOX: usize = 16;

/// Global knobs every Path actor shares.
#[derive(Debug, Clone)]
pub struct PathSettings {
    pub reader_buffer: usize,
    pub overflow_threshold: u64,
    pub segmenter: SegmenterConfig,
    pub record_dir: std::path::PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            reader_buffer: crate::stream::DEFAULT_READER_BUFFER,
            overflow_threshold: crate::stream::DEFAULT_OVERFLOW_THRESHOLD,
            segmenter: SegmenterConfig::default(),
            record_dir: std::path::PathBuf::from("./recordings"),
        }
    }
}

pub(crate) enum PathRequest {
    Describe {
        reply: oneshot::Sender<PathDescription>,
    },
    PublisherAnnounce {
        ident: SessionIdent,
        creds: Credentials,
        reply: oneshot::Sender<Result<PublisherSession>>,
    },
    PublisherRecord {
        token: u64,
        tracks: Vec<Track>,
        reply: oneshot::Sender<Result<Stream>>,
    },
    PublisherRemove {
        token: u64,
        reply: oneshot::Sender<()>,
    },
    ReaderAdd {
        ident: SessionIdent,
        creds: Credentials,
        reply: oneshot::Sender<Result<ReaderSession>>,
    },
    ReaderRemove {
        id: Uuid,
        reply: oneshot::Sender<()>,
    },
    ApiInfo {
        reply: oneshot::Sender<PathInfo>,
    },
    ApiKick {
        id: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    IsIdle {
        reply: oneshot::Sender<bool>,
    },
    ConfApply {
        conf: Box<PathConf>,
    },
    /// Terminate the actor; only the manager sends this.
    Close,
}

/// Shareable address of a Path actor.
#[derive(Clone, Debug)]
pub struct PathHandle {
    name: Arc<str>,
    tx: mpsc::Sender<PathRequest>,
}

impl PathHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> PathRequest,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| RelayError::Terminated)?;
        rx.await.map_err(|_| RelayError::Terminated)
    }

    /// Whether a Stream exists and, if so, its track set.
    pub async fn describe(&self) -> Result<PathDescription> {
        self.request(|reply| PathRequest::Describe { reply }).await
    }

    /// Claim the publisher slot.
    pub async fn publisher_announce(
        &self,
        ident: SessionIdent,
        creds: Credentials,
    ) -> Result<PublisherSession> {
        self.request(|reply| PathRequest::PublisherAnnounce { ident, creds, reply })
            .await?
    }

    /// Attach as a reader; on-demand paths may park this until the source
    /// is ready or the startup deadline passes.
    pub async fn reader_add(
        &self,
        ident: SessionIdent,
        creds: Credentials,
    ) -> Result<ReaderSession> {
        self.request(|reply| PathRequest::ReaderAdd { ident, creds, reply })
            .await?
    }

    pub(crate) async fn api_info(&self) -> Result<PathInfo> {
        self.request(|reply| PathRequest::ApiInfo { reply }).await
    }

    pub(crate) async fn api_kick(&self, id: Uuid) -> Result<()> {
        self.request(|reply| PathRequest::ApiKick { id, reply }).await?
    }

    pub(crate) async fn is_idle(&self) -> Result<bool> {
        self.request(|reply| PathRequest::IsIdle { reply }).await
    }

    pub(crate) async fn conf_apply(&self, conf: PathConf) {
        let _ = self
            .tx
            .send(PathRequest::ConfApply { conf: Box::new(conf) })
            .await;
    }

    pub(crate) async fn close(&self) {
        let _ = self.tx.send(PathRequest::Close).await;
    }

    /// Forward a pre-built request, reply channel and all.
    pub(crate) async fn send_raw(&self, req: PathRequest) {
        let _ = self.tx.send(req).await;
    }
}

/// Live publisher attachment. Obtained from `publisher_announce`; the
/// slot is released with `remove` (or unilaterally by the path).
#[derive(Debug)]
pub struct PublisherSession {
    path: PathHandle,
    ident: SessionIdent,
    token: u64,
}

impl PublisherSession {
    pub fn ident(&self) -> &SessionIdent {
        &self.ident
    }

    /// Declare the track set and create the Stream.
    pub async fn record(&self, tracks: Vec<Track>) -> Result<Stream> {
        let token = self.token;
        self.path
            .request(|reply| PathRequest::PublisherRecord { token, tracks, reply })
            .await?
    }

    /// Release the slot; the Stream closes and readers get a terminal.
    pub async fn remove(self) {
        let token = self.token;
        let _ = self
            .path
            .request(|reply| PathRequest::PublisherRemove { token, reply })
            .await;
    }
}

/// Live reader attachment.
#[derive(Debug)]
pub struct ReaderSession {
    path: PathHandle,
    ident: SessionIdent,
    handle: ReaderHandle,
}

impl ReaderSession {
    pub fn ident(&self) -> &SessionIdent {
        &self.ident
    }

    pub fn handle(&self) -> &ReaderHandle {
        &self.handle
    }

    pub fn tracks(&self) -> &[Track] {
        self.handle.tracks()
    }

    /// Detach from the path. Idempotent from the path's point of view.
    pub async fn detach(self) {
        let id = self.ident.id;
        let _ = self
            .path
            .request(|reply| PathRequest::ReaderRemove { id, reply })
            .await;
    }

    /// Take the reader handle out, keeping a guard that can detach
    /// later. Used where the handle is consumed (e.g. a Segmenter) but
    /// the attachment still needs explicit release.
    pub fn split(self) -> (ReaderHandle, ReaderDetacher) {
        (
            self.handle,
            ReaderDetacher {
                path: self.path,
                id: self.ident.id,
            },
        )
    }
}

/// Detach guard for a split `ReaderSession`.
pub struct ReaderDetacher {
    path: PathHandle,
    id: Uuid,
}

impl ReaderDetacher {
    /// Release the attachment. Safe to call more than once.
    pub async fn detach(&self) {
        let id = self.id;
        let _ = self
            .path
            .request(|reply| PathRequest::ReaderRemove { id, reply })
            .await;
    }
}

/// Spawn a Path actor onto `pool`, returning its handle.
pub(crate) fn spawn(
    name: String,
    conf_name: String,
    conf: PathConf,
    settings: PathSettings,
    launcher: Arc<dyn SourceLauncher>,
    hook: Option<Arc<dyn AuthHook>>,
    metrics: Metrics,
    pool: &RoutinePool,
) -> PathHandle {
    let (tx, rx) = mpsc::channel(MAILBOX);
    let handle = PathHandle {
        name: Arc::from(name.as_str()),
        tx,
    };

    let actor = PathActor {
        name: handle.name.clone(),
        conf_name,
        conf,
        settings,
        launcher,
        hook,
        metrics,
        handle: handle.clone(),
        pool: pool.child(),
        publisher: None,
        next_token: 0,
        stream: None,
        readers: HashMap::new(),
        on_demand: OnDemand::Absent,
    };

    pool.add(move |token| actor.run(rx, token));
    handle
}

struct PublisherSlot {
    token: u64,
    ident: SessionIdent,
    /// True when this publisher is the launched on-demand source
    on_demand_source: bool,
}

struct ReaderEntry {
    ident: SessionIdent,
    stream_reader: u64,
}

struct ParkedReader {
    ident: SessionIdent,
    reply: oneshot::Sender<Result<ReaderSession>>,
}

enum OnDemand {
    Absent,
    Starting {
        deadline: Instant,
        parked: Vec<ParkedReader>,
        stop: CancellationToken,
    },
    Ready {
        stop: CancellationToken,
    },
    Closing {
        deadline: Instant,
        stop: CancellationToken,
    },
}

struct PathActor {
    name: Arc<str>,
    conf_name: String,
    conf: PathConf,
    settings: PathSettings,
    launcher: Arc<dyn SourceLauncher>,
    hook: Option<Arc<dyn AuthHook>>,
    metrics: Metrics,
    handle: PathHandle,
    /// Child pool for the recorder routine
    pool: RoutinePool,
    publisher: Option<PublisherSlot>,
    next_token: u64,
    stream: Option<Stream>,
    readers: HashMap<Uuid, ReaderEntry>,
    on_demand: OnDemand,
}

impl PathActor {
    async fn run(mut self, mut rx: mpsc::Receiver<PathRequest>, token: CancellationToken) {
        tracing::debug!(path = %self.name, conf = %self.conf_name, "Path created");

        if let Some(cmd) = self.conf.run_on_init.clone() {
            self.launcher.launch(&self.name, &cmd, token.child_token());
        }

        loop {
            let deadline = self.on_demand_deadline();
            tokio::select! {
                _ = token.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(PathRequest::Close) | None => break,
                    Some(req) => self.handle_request(req).await,
                },
                _ = deadline_sleep(deadline) => self.on_deadline(),
            }
        }

        self.shutdown().await;
        tracing::debug!(path = %self.name, "Path closed");
    }

    fn on_demand_deadline(&self) -> Option<Instant> {
        match &self.on_demand {
            OnDemand::Starting { deadline, .. } | OnDemand::Closing { deadline, .. } => {
                Some(*deadline)
            }
            _ => None,
        }
    }

    fn on_deadline(&mut self) {
        match std::mem::replace(&mut self.on_demand, OnDemand::Absent) {
            OnDemand::Starting { parked, stop, .. } => {
                tracing::warn!(path = %self.name, "On-demand source start timed out");
                stop.cancel();
                for p in parked {
                    let _ = p.reply.send(Err(RelayError::Timeout));
                }
            }
            OnDemand::Closing { stop, .. } => {
                tracing::info!(path = %self.name, "On-demand source stopped: no readers");
                stop.cancel();
            }
            other => self.on_demand = other,
        }
    }

    async fn handle_request(&mut self, req: PathRequest) {
        match req {
            PathRequest::Describe { reply } => {
                let _ = reply.send(PathDescription {
                    ready: self.stream.is_some(),
                    tracks: self.stream.as_ref().map(|s| s.tracks().to_vec()),
                });
            }
            PathRequest::PublisherAnnounce { ident, creds, reply } => {
                let _ = reply.send(self.publisher_announce(ident, creds).await);
            }
            PathRequest::PublisherRecord { token, tracks, reply } => {
                let _ = reply.send(self.publisher_record(token, tracks));
            }
            PathRequest::PublisherRemove { token, reply } => {
                if self.publisher.as_ref().is_some_and(|p| p.token == token) {
                    self.close_publisher();
                }
                let _ = reply.send(());
            }
            PathRequest::ReaderAdd { ident, creds, reply } => {
                self.reader_add(ident, creds, reply).await;
            }
            PathRequest::ReaderRemove { id, reply } => {
                self.reader_remove(id);
                let _ = reply.send(());
            }
            PathRequest::ApiInfo { reply } => {
                let _ = reply.send(self.api_info());
            }
            PathRequest::ApiKick { id, reply } => {
                let _ = reply.send(self.api_kick(id));
            }
            PathRequest::IsIdle { reply } => {
                let idle = self.publisher.is_none()
                    && self.readers.is_empty()
                    && matches!(self.on_demand, OnDemand::Absent);
                let _ = reply.send(idle);
            }
            PathRequest::ConfApply { conf } => {
                tracing::info!(path = %self.name, "Path configuration hot-applied");
                self.conf = *conf;
            }
            // Intercepted by the actor loop.
            PathRequest::Close => {}
        }
    }

    async fn publisher_announce(
        &mut self,
        ident: SessionIdent,
        creds: Credentials,
    ) -> Result<PublisherSession> {
        authorize(&self.name, &self.conf, Role::Publish, &creds, self.hook.as_ref()).await?;

        // A reconnect during the close window cancels the teardown.
        if matches!(self.on_demand, OnDemand::Closing { .. }) {
            if let OnDemand::Closing { stop, .. } =
                std::mem::replace(&mut self.on_demand, OnDemand::Absent)
            {
                self.on_demand = OnDemand::Ready { stop };
            }
        }

        if self.publisher.is_some() {
            if !self.conf.allow_swap {
                return Err(RelayError::PathBusy);
            }
            tracing::info!(path = %self.name, "Publisher swapped out");
            self.close_publisher();
        }

        let token = self.next_token;
        self.next_token += 1;
        let on_demand_source = matches!(self.on_demand, OnDemand::Starting { .. });
        self.publisher = Some(PublisherSlot {
            token,
            ident: ident.clone(),
            on_demand_source,
        });
        tracing::info!(path = %self.name, session = %ident.id, "Publisher announced");

        Ok(PublisherSession {
            path: self.handle.clone(),
            ident,
            token,
        })
    }

    fn publisher_record(&mut self, token: u64, tracks: Vec<Track>) -> Result<Stream> {
        let slot = self
            .publisher
            .as_ref()
            .filter(|p| p.token == token)
            .ok_or(RelayError::Terminated)?;
        if self.stream.is_some() {
            return Err(RelayError::Protocol("stream already recording".into()));
        }
        if tracks.is_empty() {
            return Err(RelayError::Protocol("empty track set".into()));
        }

        let stream = Stream::new(tracks, self.settings.overflow_threshold, self.metrics.clone());
        self.stream = Some(stream.clone());
        self.metrics.inc(&self.metrics.paths_publishing);
        tracing::info!(
            path = %self.name,
            session = %slot.ident.id,
            tracks = stream.tracks().len(),
            "Stream created"
        );

        if let OnDemand::Starting { parked, stop, .. } =
            std::mem::replace(&mut self.on_demand, OnDemand::Absent)
        {
            self.on_demand = OnDemand::Ready { stop };
            for p in parked {
                self.attach_reader(p.ident, p.reply);
            }
        }

        if self.conf.record {
            let reader = stream.add_reader(self.settings.reader_buffer);
            record::start(
                reader,
                &self.name,
                &self.settings.record_dir,
                self.settings.segmenter.clone(),
                &self.pool,
                self.metrics.clone(),
            );
        }

        Ok(stream)
    }

    async fn reader_add(
        &mut self,
        ident: SessionIdent,
        creds: Credentials,
        reply: oneshot::Sender<Result<ReaderSession>>,
    ) {
        if let Err(e) =
            authorize(&self.name, &self.conf, Role::Read, &creds, self.hook.as_ref()).await
        {
            let _ = reply.send(Err(e));
            return;
        }

        if self.stream.is_some() {
            // A reader arriving during the close window cancels it.
            if matches!(self.on_demand, OnDemand::Closing { .. }) {
                if let OnDemand::Closing { stop, .. } =
                    std::mem::replace(&mut self.on_demand, OnDemand::Absent)
                {
                    self.on_demand = OnDemand::Ready { stop };
                }
            }
            self.attach_reader(ident, reply);
            return;
        }

        let Some(cmd) = self.conf.on_demand.clone() else {
            let _ = reply.send(Err(RelayError::PathNotFound));
            return;
        };

        match &mut self.on_demand {
            OnDemand::Starting { parked, .. } => {
                parked.push(ParkedReader { ident, reply });
            }
            OnDemand::Absent => {
                let stop = self.pool.token().child_token();
                self.launcher.launch(&self.name, &cmd, stop.clone());
                tracing::info!(path = %self.name, "On-demand source starting");
                self.on_demand = OnDemand::Starting {
                    deadline: Instant::now()
                        + std::time::Duration::from_secs(self.conf.on_demand_start_timeout_secs),
                    parked: vec![ParkedReader { ident, reply }],
                    stop,
                };
            }
            // Ready/Closing imply a Stream; unreachable without one.
            _ => {
                let _ = reply.send(Err(RelayError::Terminated));
            }
        }
    }

    fn attach_reader(
        &mut self,
        ident: SessionIdent,
        reply: oneshot::Sender<Result<ReaderSession>>,
    ) {
        let stream = self.stream.as_ref().expect("attach without stream");
        let handle = stream.add_reader(self.settings.reader_buffer);
        let stream_reader = handle.id();
        let session = ReaderSession {
            path: self.handle.clone(),
            ident: ident.clone(),
            handle,
        };
        if reply.send(Ok(session)).is_err() {
            // Caller went away while parked; undo the attach.
            stream.remove_reader_by_id(stream_reader);
            return;
        }
        tracing::info!(path = %self.name, session = %ident.id, "Reader attached");
        self.readers.insert(ident.id, ReaderEntry { ident, stream_reader });
    }

    fn reader_remove(&mut self, id: Uuid) {
        let Some(entry) = self.readers.remove(&id) else {
            return;
        };
        if let Some(stream) = &self.stream {
            stream.remove_reader_by_id(entry.stream_reader);
        }
        tracing::info!(path = %self.name, session = %id, "Reader detached");

        if self.readers.is_empty() {
            if let OnDemand::Ready { stop } =
                std::mem::replace(&mut self.on_demand, OnDemand::Absent)
            {
                tracing::info!(
                    path = %self.name,
                    close_after_secs = self.conf.on_demand_close_after_secs,
                    "Last reader left; arming on-demand close timer"
                );
                self.on_demand = OnDemand::Closing {
                    deadline: Instant::now()
                        + std::time::Duration::from_secs(self.conf.on_demand_close_after_secs),
                    stop,
                };
            }
        }
    }

    fn api_info(&self) -> PathInfo {
        PathInfo {
            name: self.name.to_string(),
            conf_name: self.conf_name.clone(),
            source: self
                .publisher
                .as_ref()
                .map(|p| SessionInfo::from_ident(&p.ident)),
            source_ready: self.stream.is_some(),
            readers: self
                .readers
                .values()
                .map(|r| SessionInfo::from_ident(&r.ident))
                .collect(),
        }
    }

    fn api_kick(&mut self, id: Uuid) -> Result<()> {
        if self.publisher.as_ref().is_some_and(|p| p.ident.id == id) {
            tracing::info!(path = %self.name, session = %id, "Publisher kicked");
            self.close_publisher();
            return Ok(());
        }
        if self.readers.contains_key(&id) {
            tracing::info!(path = %self.name, session = %id, "Reader kicked");
            self.reader_remove(id);
            return Ok(());
        }
        Err(RelayError::PathNotFound)
    }

    /// Tear down the Stream (readers get terminals) and free the slot.
    fn close_publisher(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.close();
            self.metrics.dec(&self.metrics.paths_publishing);
        }
        self.readers.clear();
        if let Some(slot) = self.publisher.take() {
            // A dead on-demand source tears its state down; a source that
            // never recorded stays Starting until the ready deadline.
            if slot.on_demand_source
                && matches!(
                    self.on_demand,
                    OnDemand::Ready { .. } | OnDemand::Closing { .. }
                )
            {
                if let OnDemand::Ready { stop } | OnDemand::Closing { stop, .. } =
                    std::mem::replace(&mut self.on_demand, OnDemand::Absent)
                {
                    stop.cancel();
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        self.close_publisher();
        if let OnDemand::Starting { parked, stop, .. } =
            std::mem::replace(&mut self.on_demand, OnDemand::Absent)
        {
            stop.cancel();
            for p in parked {
                let _ = p.reply.send(Err(RelayError::Terminated));
            }
        }
        self.pool.cancel();
        self.pool.wait().await;
    }
}

async fn deadline_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
