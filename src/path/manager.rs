//! Path Manager: name resolution, actor lifecycle, config reload
//!
//! The single owner of the name → Path actor map. Every attach flows
//! through it; replies are relayed by forwarding the caller's oneshot
//! into the Path actor, so a parked on-demand attach never blocks the
//! manager loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::conf::{validate_path_name, Conf, PathConf};
use crate::error::{RelayError, Result};
use crate::metrics::Metrics;
use crate::routine::RoutinePool;

use super::actor::{self, PathHandle, PathRequest, PathSettings, PublisherSession, ReaderSession};
use super::auth::{authorize, AuthHook};
use super::messages::{Credentials, PathDescription, PathInfo, Role, SessionIdent};
use super::source::SourceLauncher;

/// How often idle dynamically-spawned actors are collected.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

pub(crate) enum ManagerRequest {
    GetPathConf {
        name: String,
        role: Role,
        creds: Credentials,
        reply: oneshot::Sender<Result<PathConf>>,
    },
    AttachPublisher {
        name: String,
        ident: SessionIdent,
        creds: Credentials,
        reply: oneshot::Sender<Result<PublisherSession>>,
    },
    AttachReader {
        name: String,
        ident: SessionIdent,
        creds: Credentials,
        reply: oneshot::Sender<Result<ReaderSession>>,
    },
    Describe {
        name: String,
        reply: oneshot::Sender<Result<PathDescription>>,
    },
    ApiPathsList {
        reply: oneshot::Sender<Vec<PathInfo>>,
    },
    ApiKick {
        id: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    ConfPathAdd {
        name: String,
        conf: Box<PathConf>,
        reply: oneshot::Sender<std::result::Result<(), String>>,
    },
    ConfPathEdit {
        name: String,
        conf: Box<PathConf>,
        reply: oneshot::Sender<std::result::Result<(), String>>,
    },
    ConfPathRemove {
        name: String,
        reply: oneshot::Sender<std::result::Result<(), String>>,
    },
    Reload {
        conf: Box<Conf>,
        reply: oneshot::Sender<std::result::Result<(), String>>,
    },
}

/// Shareable address of the Path Manager.
#[derive(Clone)]
pub struct PathManagerHandle {
    tx: mpsc::Sender<ManagerRequest>,
}

impl PathManagerHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ManagerRequest,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| RelayError::Terminated)?;
        rx.await.map_err(|_| RelayError::Terminated)
    }

    /// Resolve and authorize, returning the effective configuration.
    pub async fn get_path_conf(
        &self,
        name: &str,
        role: Role,
        creds: Credentials,
    ) -> Result<PathConf> {
        let name = name.to_string();
        self.request(|reply| ManagerRequest::GetPathConf { name, role, creds, reply })
            .await?
    }

    /// Attach as publisher, spawning the Path actor on demand.
    pub async fn attach_publisher(
        &self,
        name: &str,
        ident: SessionIdent,
        creds: Credentials,
    ) -> Result<PublisherSession> {
        let name = name.to_string();
        self.request(|reply| ManagerRequest::AttachPublisher { name, ident, creds, reply })
            .await?
    }

    /// Attach as reader, spawning the Path actor on demand.
    pub async fn attach_reader(
        &self,
        name: &str,
        ident: SessionIdent,
        creds: Credentials,
    ) -> Result<ReaderSession> {
        let name = name.to_string();
        self.request(|reply| ManagerRequest::AttachReader { name, ident, creds, reply })
            .await?
    }

    /// Whether the named path currently has a Stream.
    pub async fn describe(&self, name: &str) -> Result<PathDescription> {
        let name = name.to_string();
        self.request(|reply| ManagerRequest::Describe { name, reply })
            .await?
    }

    /// Snapshot of all live paths.
    pub async fn api_paths_list(&self) -> Result<Vec<PathInfo>> {
        self.request(|reply| ManagerRequest::ApiPathsList { reply })
            .await
    }

    /// Terminate the session with the given id on whichever path holds it.
    pub async fn api_kick(&self, id: Uuid) -> Result<()> {
        self.request(|reply| ManagerRequest::ApiKick { id, reply })
            .await?
    }

    pub async fn conf_path_add(
        &self,
        name: &str,
        conf: PathConf,
    ) -> Result<std::result::Result<(), String>> {
        let name = name.to_string();
        self.request(|reply| ManagerRequest::ConfPathAdd {
            name,
            conf: Box::new(conf),
            reply,
        })
        .await
    }

    pub async fn conf_path_edit(
        &self,
        name: &str,
        conf: PathConf,
    ) -> Result<std::result::Result<(), String>> {
        let name = name.to_string();
        self.request(|reply| ManagerRequest::ConfPathEdit {
            name,
            conf: Box::new(conf),
            reply,
        })
        .await
    }

    pub async fn conf_path_remove(&self, name: &str) -> Result<std::result::Result<(), String>> {
        let name = name.to_string();
        self.request(|reply| ManagerRequest::ConfPathRemove { name, reply })
            .await
    }

    /// Swap in a new configuration, restarting only what changed.
    pub async fn reload(&self, conf: Conf) -> Result<std::result::Result<(), String>> {
        self.request(|reply| ManagerRequest::Reload {
            conf: Box::new(conf),
            reply,
        })
        .await
    }
}

/// Spawn the Path Manager onto `pool`.
pub fn spawn(
    conf: Conf,
    settings: PathSettings,
    launcher: Arc<dyn SourceLauncher>,
    hook: Option<Arc<dyn AuthHook>>,
    metrics: Metrics,
    pool: &RoutinePool,
) -> PathManagerHandle {
    let (tx, rx) = mpsc::channel(64);
    let handle = PathManagerHandle { tx };

    let manager = PathManager {
        conf,
        settings,
        launcher,
        hook,
        metrics,
        pool: pool.clone(),
        actors: HashMap::new(),
    };

    pool.add(move |token| manager.run(rx, token));
    handle
}

struct PathEntry {
    handle: PathHandle,
    conf_name: String,
    /// Static (always-on) actors are never idle-collected
    static_source: bool,
}

struct PathManager {
    conf: Conf,
    settings: PathSettings,
    launcher: Arc<dyn SourceLauncher>,
    hook: Option<Arc<dyn AuthHook>>,
    metrics: Metrics,
    pool: RoutinePool,
    actors: HashMap<String, PathEntry>,
}

impl PathManager {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<ManagerRequest>,
        token: CancellationToken,
    ) {
        // Always-on sources exist from startup.
        self.spawn_static_paths();

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(req) => self.handle_request(req).await,
                    None => break,
                },
                _ = sweep.tick() => self.sweep_idle().await,
            }
        }

        for (_, entry) in self.actors.drain() {
            close_actor(&entry.handle).await;
        }
    }

    fn spawn_static_paths(&mut self) {
        let static_names: Vec<String> = self
            .conf
            .paths
            .iter()
            .filter(|(name, pc)| !crate::conf::is_template(name) && pc.run_on_init.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        for name in static_names {
            let pconf = self.conf.paths[&name].clone();
            self.spawn_actor(name.clone(), name, pconf, true);
        }
    }

    fn spawn_actor(
        &mut self,
        name: String,
        conf_name: String,
        pconf: PathConf,
        static_source: bool,
    ) {
        let handle = actor::spawn(
            name.clone(),
            conf_name.clone(),
            pconf,
            self.settings.clone(),
            self.launcher.clone(),
            self.hook.clone(),
            self.metrics.clone(),
            &self.pool,
        );
        self.actors.insert(
            name,
            PathEntry {
                handle,
                conf_name,
                static_source,
            },
        );
    }

    /// Resolve a concrete name and return (or create) its actor.
    fn ensure_actor(&mut self, name: &str) -> Result<&PathEntry> {
        validate_path_name(name).map_err(|_| RelayError::PathNotFound)?;
        if !self.actors.contains_key(name) {
            let (conf_name, pconf, _captures) = self
                .conf
                .resolve(name)
                .map(|(k, c, caps)| (k.to_string(), c.clone(), caps))
                .ok_or(RelayError::PathNotFound)?;
            let static_source = pconf.run_on_init.is_some();
            self.spawn_actor(name.to_string(), conf_name, pconf, static_source);
        }
        Ok(&self.actors[name])
    }

    async fn handle_request(&mut self, req: ManagerRequest) {
        match req {
            ManagerRequest::GetPathConf { name, role, creds, reply } => {
                let _ = reply.send(self.get_path_conf(&name, role, &creds).await);
            }
            ManagerRequest::AttachPublisher { name, ident, creds, reply } => {
                match self.ensure_actor(&name) {
                    Ok(entry) => {
                        // Relay the caller's reply channel; the actor
                        // answers directly.
                        forward(
                            &entry.handle,
                            PathRequest::PublisherAnnounce { ident, creds, reply },
                        )
                        .await;
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            ManagerRequest::AttachReader { name, ident, creds, reply } => {
                match self.ensure_actor(&name) {
                    Ok(entry) => {
                        forward(&entry.handle, PathRequest::ReaderAdd { ident, creds, reply })
                            .await;
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            ManagerRequest::Describe { name, reply } => {
                match self.actors.get(&name) {
                    Some(entry) => {
                        forward(&entry.handle, PathRequest::Describe { reply: wrap_ok(reply) })
                            .await;
                    }
                    None => {
                        // No actor: the path may still be configured.
                        let _ = reply.send(match self.conf.resolve(&name) {
                            Some(_) => Ok(PathDescription {
                                ready: false,
                                tracks: None,
                            }),
                            None => Err(RelayError::PathNotFound),
                        });
                    }
                }
            }
            ManagerRequest::ApiPathsList { reply } => {
                let mut out = Vec::with_capacity(self.actors.len());
                for entry in self.actors.values() {
                    if let Ok(info) = entry.handle.api_info().await {
                        out.push(info);
                    }
                }
                out.sort_by(|a, b| a.name.cmp(&b.name));
                let _ = reply.send(out);
            }
            ManagerRequest::ApiKick { id, reply } => {
                let mut result = Err(RelayError::PathNotFound);
                for entry in self.actors.values() {
                    if entry.handle.api_kick(id).await.is_ok() {
                        result = Ok(());
                        break;
                    }
                }
                let _ = reply.send(result);
            }
            ManagerRequest::ConfPathAdd { name, conf, reply } => {
                let _ = reply.send(self.conf_path_add(name, *conf).await);
            }
            ManagerRequest::ConfPathEdit { name, conf, reply } => {
                let _ = reply.send(self.conf_path_edit(name, *conf).await);
            }
            ManagerRequest::ConfPathRemove { name, reply } => {
                let _ = reply.send(self.conf_path_remove(name).await);
            }
            ManagerRequest::Reload { conf, reply } => {
                let _ = reply.send(self.apply_conf(*conf).await);
            }
        }
    }

    async fn get_path_conf(
        &self,
        name: &str,
        role: Role,
        creds: &Credentials,
    ) -> Result<PathConf> {
        validate_path_name(name).map_err(|_| RelayError::PathNotFound)?;
        let (_, pconf, _) = self.conf.resolve(name).ok_or(RelayError::PathNotFound)?;
        authorize(name, pconf, role, creds, self.hook.as_ref()).await?;
        Ok(pconf.clone())
    }

    async fn conf_path_add(
        &mut self,
        name: String,
        pconf: PathConf,
    ) -> std::result::Result<(), String> {
        if self.conf.paths.contains_key(&name) {
            return Err(format!("path '{name}' already exists"));
        }
        pconf.validate(&name)?;
        let mut next = self.conf.clone();
        next.paths.insert(name, pconf);
        self.apply_conf(next).await
    }

    async fn conf_path_edit(
        &mut self,
        name: String,
        pconf: PathConf,
    ) -> std::result::Result<(), String> {
        if !self.conf.paths.contains_key(&name) {
            return Err(format!("path '{name}' not found"));
        }
        pconf.validate(&name)?;
        let mut next = self.conf.clone();
        next.paths.insert(name, pconf);
        self.apply_conf(next).await
    }

    async fn conf_path_remove(&mut self, name: String) -> std::result::Result<(), String> {
        if !self.conf.paths.contains_key(&name) {
            return Err(format!("path '{name}' not found"));
        }
        let mut next = self.conf.clone();
        next.paths.shift_remove(&name);
        self.apply_conf(next).await
    }

    /// Diff the live actors against `next` and restart only what changed.
    async fn apply_conf(&mut self, next: Conf) -> std::result::Result<(), String> {
        if next == self.conf {
            tracing::debug!("Reload: configuration unchanged");
            return Ok(());
        }
        next.validate()?;

        let mut to_close: Vec<String> = Vec::new();
        let mut to_apply: Vec<(String, PathConf)> = Vec::new();

        for (name, entry) in &self.actors {
            match next.resolve(name) {
                None => to_close.push(name.clone()),
                Some((key, pconf, _)) => {
                    let old = self.conf.paths.get(&entry.conf_name);
                    if key != entry.conf_name || old.is_none() {
                        to_close.push(name.clone());
                    } else if let Some(old) = old {
                        if old == pconf {
                            continue;
                        }
                        if old.hot_applicable(pconf) {
                            to_apply.push((name.clone(), pconf.clone()));
                        } else {
                            to_close.push(name.clone());
                        }
                    }
                }
            }
        }

        for name in to_close {
            if let Some(entry) = self.actors.remove(&name) {
                tracing::info!(path = %name, "Reload: path restarted or removed");
                close_actor(&entry.handle).await;
            }
        }
        for (name, pconf) in to_apply {
            if let Some(entry) = self.actors.get(&name) {
                entry.handle.conf_apply(pconf).await;
            }
        }

        self.conf = next;
        self.spawn_static_paths_missing();
        Ok(())
    }

    fn spawn_static_paths_missing(&mut self) {
        let missing: Vec<String> = self
            .conf
            .paths
            .iter()
            .filter(|(name, pc)| {
                !crate::conf::is_template(name)
                    && pc.run_on_init.is_some()
                    && !self.actors.contains_key(*name)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in missing {
            let pconf = self.conf.paths[&name].clone();
            self.spawn_actor(name.clone(), name, pconf, true);
        }
    }

    /// Collect dynamically-spawned actors with nothing attached. Runs
    /// inline in the manager loop, so no attach can race the removal.
    async fn sweep_idle(&mut self) {
        let candidates: Vec<String> = self
            .actors
            .iter()
            .filter(|(_, e)| !e.static_source)
            .map(|(n, _)| n.clone())
            .collect();
        for name in candidates {
            let idle = match self.actors.get(&name) {
                Some(entry) => entry.handle.is_idle().await.unwrap_or(true),
                None => continue,
            };
            if idle {
                if let Some(entry) = self.actors.remove(&name) {
                    tracing::debug!(path = %name, "Idle path collected");
                    close_actor(&entry.handle).await;
                }
            }
        }
    }
}

async fn forward(handle: &PathHandle, req: PathRequest) {
    handle.send_raw(req).await;
}

/// Adapt an infallible actor reply into the fallible manager envelope.
fn wrap_ok<T: Send + 'static>(reply: oneshot::Sender<Result<T>>) -> oneshot::Sender<T> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Ok(v) = rx.await {
            let _ = reply.send(Ok(v));
        } else {
            let _ = reply.send(Err(RelayError::Terminated));
        }
    });
    tx
}

async fn close_actor(handle: &PathHandle) {
    handle.close().await;
}
