//! Session Manager - activates and deactivates introspection sessions
//!
//! The SessionManager is responsible for:
//! - Rejecting a second session on the same (instance, drive, target)
//! - Walking a session from port allocation to a persisted entity
//! - Unwinding everything a failed activation acquired
//! - Stopping live exports on deactivation and instance teardown

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::state::{Session, SessionKey, SessionState};
use crate::compute::Instance;
use crate::config::IntrospectionConfig;
use crate::context::RequestContext;
use crate::error::{IntrospectionError, Result};
use crate::export::{BlockExportController, QueueStore};
use crate::hypervisor::HypervisorDriver;
use crate::metrics::{ACTIVATIONS_TOTAL, ACTIVATION_DURATION, ACTIVE_SESSIONS, STAGE_FAILURES};
use crate::net::{PortAllocator, ReadinessProbe};
use crate::store::{EntityRepository, IntrospectedEntity};
use crate::tools::CrawlPipeline;

/// Point-in-time view of a live session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub entity_id: i64,
    pub key: SessionKey,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub queue_index: Option<u32>,
    pub age: Duration,
}

type PendingMap = StdMutex<HashMap<u64, (SessionKey, CancellationToken)>>;

/// Removes a key from the in-flight set when the activation ends, however it ends
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    claim: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.claim);
        }
    }
}

pub struct SessionManager {
    port_range: (u16, u16),
    ports: PortAllocator,
    probe: ReadinessProbe,
    exports: BlockExportController,
    pipeline: CrawlPipeline,
    repository: EntityRepository,
    enforce_unique: bool,
    /// Activations still running, by claim number
    pending: PendingMap,
    next_claim: AtomicU64,
    /// Persisted sessions with a live export, by entity id
    live: Mutex<HashMap<i64, Session>>,
}

impl SessionManager {
    pub fn new(
        config: &IntrospectionConfig,
        driver: Arc<dyn HypervisorDriver>,
        repository: EntityRepository,
    ) -> Self {
        let host = config.ports.bind_host.clone();
        Self {
            port_range: (config.ports.low, config.ports.high),
            ports: PortAllocator::from_config(&config.ports),
            probe: ReadinessProbe::from_config(host.clone(), &config.probe),
            exports: BlockExportController::new(driver, host.clone(), &config.export),
            pipeline: CrawlPipeline::new(host, &config.crawl),
            repository,
            enforce_unique: config.enforce_unique_sessions,
            pending: StdMutex::new(HashMap::new()),
            next_claim: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the queue reset backend
    pub fn with_queue_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.exports = self.exports.with_queue_store(store);
        self
    }

    pub fn driver(&self) -> &Arc<dyn HypervisorDriver> {
        self.exports.driver()
    }

    pub fn repository(&self) -> &EntityRepository {
        &self.repository
    }

    /// Run the full pipeline for `drive_id` of `instance` and persist the result
    ///
    /// On success the export stays live until `deactivate`. On failure
    /// everything acquired so far is released before the error is returned.
    ///
    /// # Errors
    /// * `Conflict` - same (instance, drive, target) active or starting
    /// * `NotFound` - the instance's domain is unknown to the hypervisor
    /// * any stage error (`PortExhausted`, `Timeout`, `ExternalToolFailure`, ...)
    pub async fn activate(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        drive_id: &str,
        target: &str,
    ) -> Result<IntrospectedEntity> {
        let span = tracing::info_span!(
            "activate",
            trace_id = %ctx.trace_id,
            instance_id = %instance.uuid,
            drive_id,
            target
        );
        self.activate_inner(instance, SessionKey::new(&instance.uuid, drive_id, target))
            .instrument(span)
            .await
    }

    async fn activate_inner(&self, instance: &Instance, key: SessionKey) -> Result<IntrospectedEntity> {
        let started = Instant::now();

        let (claim, cancel) = match self.claim(&key) {
            Ok(claimed) => claimed,
            Err(e) => {
                ACTIVATIONS_TOTAL.with_label_values(&["conflict"]).inc();
                tracing::warn!(error = %e, "activation rejected");
                return Err(e);
            }
        };
        let _claim = PendingGuard {
            pending: &self.pending,
            claim,
        };

        let mut session = Session::new(key, cancel);
        match self.run(&mut session, instance).await {
            Ok(entity) => {
                let elapsed = started.elapsed();
                let port = session.port;
                let entity = self.admit(session, entity).await?;
                ACTIVATIONS_TOTAL.with_label_values(&["persisted"]).inc();
                ACTIVATION_DURATION.observe(elapsed.as_secs_f64());
                tracing::info!(
                    entity_id = ?entity.id,
                    port = ?port,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "introspection active"
                );
                Ok(entity)
            }
            Err(e) => {
                let stage = session.status().as_str();
                ACTIVATIONS_TOTAL.with_label_values(&["failed"]).inc();
                STAGE_FAILURES.with_label_values(&[stage, e.kind()]).inc();
                tracing::error!(stage, error = %e, "activation failed, unwinding");
                session.mark_failed(e.to_string());
                self.stop_session(session).await;
                Err(e)
            }
        }
    }

    /// Make a persisted session live, unless it was cancelled on the way
    ///
    /// The cancel check and the insert happen under the `live` lock, so a
    /// teardown either sees the session or the session sees the teardown.
    async fn admit(&self, session: Session, entity: IntrospectedEntity) -> Result<IntrospectedEntity> {
        let Some(id) = entity.id else {
            return Ok(entity);
        };

        let mut live = self.live.lock().await;
        if session.cancel.is_cancelled() {
            drop(live);
            ACTIVATIONS_TOTAL.with_label_values(&["failed"]).inc();
            tracing::warn!(entity_id = id, "session cancelled before going live, unwinding");
            self.stop_session(session).await;
            if let Err(e) = self.repository.delete_by_id(id) {
                tracing::warn!(entity_id = id, error = %e, "failed to delete cancelled entity");
            }
            return Err(IntrospectionError::Cancelled(format!(
                "introspected entity {} cancelled before going live",
                id
            )));
        }

        live.insert(id, session);
        ACTIVE_SESSIONS.inc();
        Ok(entity)
    }

    /// Reserve `key` for a new activation
    fn claim(&self, key: &SessionKey) -> Result<(u64, CancellationToken)> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| IntrospectionError::Store("session table poisoned".into()))?;

        if self.enforce_unique {
            if pending.values().any(|(k, _)| k == key) {
                return Err(key.conflict());
            }
            let persisted = self.repository.list_by_instance(&key.instance_id, false)?;
            if persisted
                .iter()
                .any(|e| e.matches(&key.instance_id, &key.drive_id, &key.target))
            {
                return Err(key.conflict());
            }
        }

        let claim = self.next_claim.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        pending.insert(claim, (key.clone(), cancel.clone()));
        Ok((claim, cancel))
    }

    async fn run(&self, session: &mut Session, instance: &Instance) -> Result<IntrospectedEntity> {
        let domain = self.driver().lookup_domain(&instance.domain_name).await?;
        session.domain = Some(domain.clone());

        let (low, high) = self.port_range;
        let port = self.ports.allocate(low, high).await?;
        session.port = Some(port);
        session.advance(SessionState::PortAllocated)?;

        let queue = self.exports.reserve_queue()?;
        if let Err(e) = self.exports.reset_queue(&queue).await {
            tracing::warn!(queue_index = queue.index(), error = %e, "queue reset failed");
        }
        let export = self.exports.start_export(&session.key.drive_id, port, queue).await?;
        let queue_index = export.queue_index();
        session.export = Some(export);
        session.advance(SessionState::ExportStarted)?;

        // The hypervisor connects to the export when the mirror starts
        self.probe.wait_listening(port, &session.cancel).await?;
        self.exports
            .mirror_drive(&domain, &session.key.drive_id, port)
            .await?;
        session.mirroring = true;
        self.probe.settle(port, &session.cancel).await?;
        session.advance(SessionState::StreamReady)?;

        session.advance(SessionState::Crawling)?;
        let artifact = self
            .pipeline
            .crawl(port, &instance.uuid, &session.cancel)
            .await?;

        session.advance(SessionState::Inferring)?;
        self.pipeline
            .infer(&artifact, &instance.uuid, queue_index, &session.cancel)
            .await?;

        let entity = self.repository.create(IntrospectedEntity::draft(
            &session.key.instance_id,
            &session.key.drive_id,
            &session.key.target,
        ))?;
        session.entity_id = entity.id;
        session.advance(SessionState::Persisted)?;
        Ok(entity)
    }

    /// Cancel running work, stop the mirror, stop the export
    ///
    /// Also the unwind path of a failed activation. Every step is best
    /// effort; failures are logged and the rest still runs.
    async fn stop_session(&self, mut session: Session) {
        session.cancel.cancel();

        if session.mirroring {
            if let Some(domain) = &session.domain {
                if let Err(e) = self.exports.cancel_mirror(domain, &session.key.drive_id).await {
                    tracing::warn!(domain = %domain.name, error = %e, "failed to cancel mirror");
                }
            }
        }

        if let Some(export) = session.export.take() {
            export.stop(self.exports.stop_grace()).await;
        }
    }

    /// Stop the session behind `entity_id` and delete the entity
    ///
    /// # Errors
    /// * `NotFound` - no such entity, or it belongs to another instance
    pub async fn deactivate(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        entity_id: i64,
    ) -> Result<()> {
        let span = tracing::info_span!(
            "deactivate",
            trace_id = %ctx.trace_id,
            instance_id = %instance.uuid,
            entity_id
        );
        async {
            let entity = self.repository.get_by_id(entity_id)?;
            if entity.instance_id != instance.uuid {
                return Err(IntrospectionError::NotFound(format!(
                    "introspected entity {} on instance {}",
                    entity_id, instance.uuid
                )));
            }

            let session = self.live.lock().await.remove(&entity_id);
            match session {
                Some(session) => {
                    self.stop_session(session).await;
                    ACTIVE_SESSIONS.dec();
                }
                None => tracing::warn!("no live session for entity, deleting record only"),
            }

            self.repository.delete_by_id(entity_id)?;
            tracing::info!("introspection deactivated");
            Ok::<(), IntrospectionError>(())
        }
        .instrument(span)
        .await
    }

    /// Stop every session of `instance` and delete its entities
    ///
    /// Activations still running for the instance are cancelled; they
    /// unwind on their own and persist nothing.
    pub async fn teardown_instance(&self, ctx: &RequestContext, instance: &Instance) -> Result<()> {
        let span = tracing::info_span!(
            "teardown_instance",
            trace_id = %ctx.trace_id,
            instance_id = %instance.uuid
        );
        async {
            let cancelled = self.cancel_pending(|key| key.instance_id == instance.uuid);

            let sessions: Vec<Session> = {
                let mut live = self.live.lock().await;
                let ids: Vec<i64> = live
                    .iter()
                    .filter(|(_, s)| s.key.instance_id == instance.uuid)
                    .map(|(id, _)| *id)
                    .collect();
                ids.into_iter().filter_map(|id| live.remove(&id)).collect()
            };
            let stopped = sessions.len();
            for session in sessions {
                self.stop_session(session).await;
                ACTIVE_SESSIONS.dec();
            }

            self.repository.delete_by_instance(&instance.uuid)?;
            tracing::info!(cancelled, stopped, "instance introspection torn down");
            Ok::<(), IntrospectionError>(())
        }
        .instrument(span)
        .await
    }

    /// Cancel in-flight activations and stop every live export
    ///
    /// Entities stay persisted; only the processes go away.
    pub async fn shutdown(&self) {
        let cancelled = self.cancel_pending(|_| true);
        let sessions: Vec<Session> = self.live.lock().await.drain().map(|(_, s)| s).collect();
        let stopped = sessions.len();
        for session in sessions {
            self.stop_session(session).await;
            ACTIVE_SESSIONS.dec();
        }
        tracing::info!(cancelled, stopped, "session manager shut down");
    }

    fn cancel_pending(&self, pred: impl Fn(&SessionKey) -> bool) -> usize {
        match self.pending.lock() {
            Ok(pending) => pending
                .values()
                .filter(|(key, _)| pred(key))
                .map(|(_, cancel)| cancel.cancel())
                .count(),
            Err(_) => 0,
        }
    }

    /// Number of activations currently running
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub async fn active_count(&self) -> usize {
        self.live.lock().await.len()
    }

    pub async fn sessions(&self) -> Vec<SessionSummary> {
        let live = self.live.lock().await;
        let mut out: Vec<SessionSummary> = live
            .iter()
            .map(|(id, s)| SessionSummary {
                entity_id: *id,
                key: s.key.clone(),
                port: s.port,
                pid: s.export.as_ref().and_then(|e| e.pid()),
                queue_index: s.export.as_ref().map(|e| e.queue_index()),
                age: s.age(),
            })
            .collect();
        out.sort_by_key(|s| s.entity_id);
        out
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("port_range", &self.port_range)
            .field("enforce_unique", &self.enforce_unique)
            .finish_non_exhaustive()
    }
}
