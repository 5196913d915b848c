//! The gateway: wiring for the protocol engine.
//!
//! A [`Gateway`] owns its key pair, the session store, the ledger adapters,
//! the counterpart transport, the audit logger and the rollback coordinator.
//! Client-role operations live in `client.rs`, server-role handlers in
//! `server.rs`; both go through the helpers here for context, delivery,
//! auditing and failure escalation.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use hermes_crypto::GatewayKeyPair;
use hermes_store::{
    AuditLogger, HttpRemoteLog, LogRepository, MemoryRepository, RedbRepository, RemoteLogSink,
    SessionRepository, SessionStore,
};
use hermes_types::{
    DltSystem, GatewayConfig, GatewayError, GatewayId, LogStatus, Message, MessageType, Result, SessionData,
    SessionId, SessionState,
};
use parking_lot::Mutex;
use tracing::{Span, debug, error, info, info_span, warn};

use crate::phases::{PhaseContext, checks, control};
use crate::retry::deliver_with_retry;
use crate::rollback::RollbackCoordinator;
use crate::{CounterpartTransport, HttpTransport, LedgerAdapter, LedgerRegistry};

/// File name of the embedded store inside `data_dir`.
const STORE_FILE: &str = "hermes.redb";

/// Result of a client-role send.
#[derive(Debug, Clone)]
pub enum PhaseOutcome {
    /// The message was delivered and the answer accepted; carries the
    /// session state afterwards.
    Completed(SessionState),
    /// `remote = false`: the signed request, for the caller to deliver.
    Built(Message),
}

pub struct Gateway {
    pub(crate) config: GatewayConfig,
    pub(crate) key: Arc<GatewayKeyPair>,
    pub(crate) id: GatewayId,
    pub(crate) supported: Vec<DltSystem>,
    pub(crate) store: Arc<SessionStore>,
    pub(crate) ledgers: Arc<LedgerRegistry>,
    pub(crate) transport: Arc<dyn CounterpartTransport>,
    pub(crate) audit: Arc<AuditLogger>,
    pub(crate) rollback: RollbackCoordinator,
    /// Rollback requests built under a session lock, sent once it is released.
    pub(crate) rollback_notices: Mutex<HashMap<SessionId, RollbackNotice>>,
    pub(crate) span: Span,
}

pub(crate) struct RollbackNotice {
    session: SessionData,
    request: Message,
}

/// Assembles a [`Gateway`]. Every configured ledger needs an adapter.
pub struct GatewayBuilder {
    config: GatewayConfig,
    key: GatewayKeyPair,
    ledgers: LedgerRegistry,
    transport: Option<Arc<dyn CounterpartTransport>>,
    sessions: Option<Arc<dyn SessionRepository>>,
    logs: Option<Arc<dyn LogRepository>>,
    remote_log: Option<Arc<dyn RemoteLogSink>>,
}

impl GatewayBuilder {
    #[must_use]
    pub fn ledger(mut self, adapter: Arc<dyn LedgerAdapter>) -> Self {
        self.ledgers.register(adapter);
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn CounterpartTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use `repo` for both sessions and audit entries instead of the one
    /// implied by `data_dir`.
    #[must_use]
    pub fn repository<R>(mut self, repo: Arc<R>) -> Self
    where
        R: SessionRepository + LogRepository + 'static,
    {
        self.sessions = Some(repo.clone() as Arc<dyn SessionRepository>);
        self.logs = Some(repo as Arc<dyn LogRepository>);
        self
    }

    #[must_use]
    pub fn remote_log(mut self, sink: Arc<dyn RemoteLogSink>) -> Self {
        self.remote_log = Some(sink);
        self
    }

    pub fn build(self) -> Result<Gateway> {
        self.config.validate()?;
        let supported = self.config.supported_dlts();
        for dlt in &supported {
            if !self.ledgers.contains(*dlt) {
                return Err(GatewayError::Configuration(format!(
                    "ledger {dlt} is configured but no adapter was registered"
                )));
            }
        }

        let (sessions, logs) = match (self.sessions, self.logs) {
            (Some(sessions), Some(logs)) => (sessions, logs),
            _ => match &self.config.data_dir {
                Some(dir) => {
                    let repo = Arc::new(RedbRepository::open(Path::new(dir).join(STORE_FILE))?);
                    (repo.clone() as Arc<dyn SessionRepository>, repo as Arc<dyn LogRepository>)
                }
                None => {
                    let repo = Arc::new(MemoryRepository::new());
                    (repo.clone() as Arc<dyn SessionRepository>, repo as Arc<dyn LogRepository>)
                }
            },
        };
        let remote_log = self.remote_log.or_else(|| {
            self.config
                .remote_log_url
                .as_ref()
                .map(|url| Arc::new(HttpRemoteLog::new(url.clone())) as Arc<dyn RemoteLogSink>)
        });

        let key = Arc::new(self.key);
        let id = GatewayId(key.public_key());
        let span = info_span!("gateway", name = %self.config.name, id = %id.short());
        let store = Arc::new(SessionStore::new(sessions, span.clone()));
        let ledgers = Arc::new(self.ledgers);
        let audit = Arc::new(AuditLogger::new(logs, key.clone(), remote_log, span.clone()));
        let rollback = RollbackCoordinator::new(store.clone(), ledgers.clone(), audit.clone(), span.clone());
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new()) as Arc<dyn CounterpartTransport>);

        info!(parent: &span, base_path = %self.config.base_path, ledgers = ?supported, "Gateway ready");
        Ok(Gateway {
            config: self.config,
            key,
            id,
            supported,
            store,
            ledgers,
            transport,
            audit,
            rollback,
            rollback_notices: Mutex::new(HashMap::new()),
            span,
        })
    }
}

impl Gateway {
    #[must_use]
    pub fn builder(config: GatewayConfig, key: GatewayKeyPair) -> GatewayBuilder {
        GatewayBuilder {
            config,
            key,
            ledgers: LedgerRegistry::new(),
            transport: None,
            sessions: None,
            logs: None,
            remote_log: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> GatewayId {
        self.id
    }

    #[must_use]
    pub fn base_path(&self) -> &str {
        &self.config.base_path
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Load a session without taking its lock.
    pub async fn session(&self, id: &SessionId) -> Result<SessionData> {
        self.store.get(id).await
    }

    pub(crate) fn ctx(&self) -> PhaseContext<'_> {
        PhaseContext::new(&self.key, &self.supported)
    }

    pub(crate) fn ledger_for(&self, session: &SessionData) -> Result<Arc<dyn LedgerAdapter>> {
        self.ledgers.get(session.local_dlt()?)
    }

    /// Send `message` to the session's counterpart under its retry policy.
    pub(crate) async fn deliver(&self, session: &SessionData, message: &Message) -> Result<Message> {
        deliver_with_retry(
            self.transport.as_ref(),
            session.counterpart_base_path()?,
            message,
            &session.retry,
            &self.span,
        )
        .await
    }

    /// Audit a transition. Failures are reported and never block progress.
    pub(crate) async fn audit_transition(
        &self,
        session: &SessionData,
        phase: &str,
        status: LogStatus,
        operation: impl fmt::Display,
    ) {
        if let Err(err) = self
            .audit
            .log_transition(session, phase, status, &operation.to_string())
            .await
        {
            error!(parent: &self.span, session = %session.id, phase, error = %err, "Audit log write failed");
        }
    }

    pub(crate) async fn audit_proof(&self, session: &SessionData, phase: &str, operation: &str, proof: &str) {
        if let Err(err) = self.audit.log_proof(session.id, phase, operation, proof).await {
            error!(parent: &self.span, session = %session.id, phase, error = %err, "Audit proof write failed");
        }
    }

    /// Report a rejected inbound message. Signature failures are security
    /// events and are logged apart from ordinary validation failures.
    pub(crate) fn log_rejection(&self, message: &Message, err: &GatewayError) {
        match err {
            GatewayError::SignatureVerification { signer, .. } => warn!(
                parent: &self.span,
                security = true,
                session = %message.session_id,
                message_type = %message.message_type,
                signer = %signer,
                "Signature verification failed"
            ),
            _ => debug!(
                parent: &self.span,
                session = %message.session_id,
                message_type = %message.message_type,
                seq = message.sequence_number,
                error = %err,
                "Message rejected"
            ),
        }
    }

    /// Resolve a session that cannot make forward progress: roll back what
    /// was done (or mark it failed if nothing was), then tell the
    /// counterpart. The caller must hold the session lock.
    pub(crate) async fn escalate(&self, session: SessionData, err: &GatewayError) -> Result<SessionData> {
        let mut session = session;
        warn!(
            parent: &self.span,
            session = %session.id,
            state = %session.state,
            step = session.step,
            kind = %err.kind(),
            error = %err,
            "Session cannot continue"
        );
        session.record_error(err);
        self.resolve(session, &err.to_string()).await
    }

    /// Run the coordinator and queue a rollback request for the
    /// counterpart. The caller sends it with [`Self::send_rollback_notice`]
    /// after releasing the session lock.
    pub(crate) async fn resolve(&self, session: SessionData, reason: &str) -> Result<SessionData> {
        let mut session = session;
        if session.is_terminal() {
            self.store.save(&mut session).await?;
            return Ok(session);
        }
        self.rollback.run(&mut session, reason).await?;
        self.queue_rollback_notice(&session, reason);
        Ok(session)
    }

    fn queue_rollback_notice(&self, session: &SessionData, reason: &str) {
        if session.chain().len() < 2 {
            // The counterpart never accepted anything for this session.
            return;
        }
        match control::rollback_request(session, reason, &self.ctx()) {
            Ok(request) => {
                let notice = RollbackNotice {
                    session: session.clone(),
                    request,
                };
                self.rollback_notices.lock().insert(session.id, notice);
            }
            Err(err) => warn!(parent: &self.span, session = %session.id, error = %err, "Rollback request not built"),
        }
    }

    /// Run `op` under the lock for `id`, then send any rollback notice it
    /// queued.
    pub(crate) async fn with_session_lock<T, F, Fut>(&self, id: SessionId, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let outcome = {
            let _guard = self.store.lock(id).await;
            op().await
        };
        self.send_rollback_notice(id).await;
        outcome
    }

    /// Tell the counterpart to roll back its side. Best effort. Must not be
    /// called with the session lock held: the counterpart may be waiting
    /// on us for the same session.
    pub(crate) async fn send_rollback_notice(&self, id: SessionId) {
        let Some(notice) = self.rollback_notices.lock().remove(&id) else {
            return;
        };
        let RollbackNotice { session, request } = notice;
        let outcome = async {
            let ack = self.deliver(&session, &request).await?;
            checks::check_control(&session, &ack, MessageType::RollbackAck)?;
            Ok::<_, GatewayError>(ack.rollback_ack()?.clone())
        }
        .await;
        match outcome {
            Ok(ack) => info!(
                parent: &self.span,
                session = %session.id,
                counterpart_state = %ack.state,
                compensated = ack.compensated.len(),
                "Counterpart acknowledged rollback"
            ),
            Err(err) => warn!(
                parent: &self.span,
                session = %session.id,
                error = %err,
                "Rollback notification failed"
            ),
        }
    }
}
