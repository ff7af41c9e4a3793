use super::ports::AddressPlan;
use super::state::{SessionAddrs, SessionState, SessionStatus, StopReason};
use crate::db::models::stream_models::StreamRecord;
use crate::engine::{Engine, EngineFactory, EngineKind, SessionEngines};
use crate::error::Error;
use crate::registry::StreamRegistry;
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

/// Final result of a session task, reported back to the orchestrator
#[derive(Debug)]
pub struct SessionOutcome {
    pub stream_id: i64,
    pub reason: StopReason,
}

struct SessionEntry {
    routing_hash: String,
    state: SessionState,
    addrs: Option<SessionAddrs>,
    cancel: CancellationToken,
}

/// Session orchestrator: sole owner of every session's lifecycle.
///
/// Sessions run as independent tasks and report how they ended over a
/// channel; a failing session never takes down its siblings.
pub struct Orchestrator {
    factory: Arc<dyn EngineFactory>,
    plan: Arc<dyn AddressPlan>,
    cancel: CancellationToken,
    sessions: HashMap<i64, SessionEntry>,
    outcomes_tx: mpsc::UnboundedSender<SessionOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<SessionOutcome>,
    status_tx: watch::Sender<Vec<SessionStatus>>,
}

impl Orchestrator {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        plan: Arc<dyn AddressPlan>,
        cancel: CancellationToken,
    ) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(Vec::new());

        Self {
            factory,
            plan,
            cancel,
            sessions: HashMap::new(),
            outcomes_tx,
            outcomes_rx,
            status_tx,
        }
    }

    /// Receiver of status snapshots, updated on every state change
    pub fn subscribe(&self) -> watch::Receiver<Vec<SessionStatus>> {
        self.status_tx.subscribe()
    }

    pub fn state(&self, stream_id: i64) -> Option<SessionState> {
        self.sessions.get(&stream_id).map(|s| s.state.clone())
    }

    pub fn snapshot(&self) -> Vec<SessionStatus> {
        let mut statuses: Vec<SessionStatus> = self
            .sessions
            .iter()
            .map(|(id, entry)| SessionStatus {
                stream_id: *id,
                routing_hash: entry.routing_hash.clone(),
                state: entry.state.clone(),
                addrs: entry.addrs,
            })
            .collect();
        statuses.sort_by_key(|s| s.stream_id);
        statuses
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.snapshot());
    }

    fn set_state(&mut self, stream_id: i64, state: SessionState) {
        if let Some(entry) = self.sessions.get_mut(&stream_id) {
            debug!("Session {} {} -> {}", entry.routing_hash, entry.state, state);
            entry.state = state;
        }
        self.publish_status();
    }

    /// Start one session per record. Failures stay confined to their session.
    pub async fn start_all(&mut self, records: &[StreamRecord]) {
        for record in records {
            self.start(record).await;
        }
        let running = self.sessions.values().filter(|s| s.state.is_running()).count();
        info!("{} of {} sessions running", running, records.len());
    }

    /// Start the session for `record` unless one already exists for its id
    pub async fn start(&mut self, record: &StreamRecord) {
        if self.sessions.contains_key(&record.id) {
            return;
        }

        self.sessions.insert(
            record.id,
            SessionEntry {
                routing_hash: record.routing_hash.clone(),
                state: SessionState::Unstarted,
                addrs: None,
                cancel: self.cancel.child_token(),
            },
        );
        self.set_state(record.id, SessionState::Starting);

        let bound = match self.plan.addresses(record) {
            Ok(addrs) => {
                if let Some(entry) = self.sessions.get_mut(&record.id) {
                    entry.addrs = Some(addrs);
                }
                bind_listeners(addrs).await
            }
            Err(e) => Err(e),
        };

        let (ingest_listener, packaging_listener) = match bound {
            Ok(listeners) => listeners,
            Err(e) => {
                error!("Session {} could not start: {}", record.routing_hash, e);
                self.set_state(
                    record.id,
                    SessionState::stopped(StopReason::BindFailure(e.to_string())),
                );
                return;
            }
        };

        let engines = self.factory.build(record);
        let cancel = match self.sessions.get(&record.id) {
            Some(entry) => entry.cancel.clone(),
            None => return,
        };

        spawn_session(
            record.id,
            record.routing_hash.clone(),
            engines,
            (ingest_listener, packaging_listener),
            cancel,
            self.outcomes_tx.clone(),
        );

        info!("Session {} running", record.routing_hash);
        self.set_state(record.id, SessionState::Running);
    }

    /// Wait for the next session to finish and record its outcome
    pub async fn next_outcome(&mut self) -> Option<i64> {
        let outcome = self.outcomes_rx.recv().await?;
        Some(self.record_outcome(outcome))
    }

    fn record_outcome(&mut self, outcome: SessionOutcome) -> i64 {
        match &outcome.reason {
            StopReason::Fault(e) => error!("Session {} failed: {}", outcome.stream_id, e),
            StopReason::Cancelled => info!("Session {} cancelled", outcome.stream_id),
            reason => warn!("Session {} stopped: {:?}", outcome.stream_id, reason),
        }
        self.set_state(outcome.stream_id, SessionState::stopped(outcome.reason));
        outcome.stream_id
    }

    /// Bring sessions in line with the registry: start new streams, cancel
    /// sessions of deleted streams. Stopped sessions are not restarted.
    pub async fn reconcile(&mut self, records: &[StreamRecord]) {
        let live_ids: HashSet<i64> = records.iter().map(|r| r.id).collect();

        let removed: Vec<i64> = self
            .sessions
            .keys()
            .filter(|id| !live_ids.contains(id))
            .copied()
            .collect();
        for id in removed {
            let stopped = match self.sessions.get(&id) {
                Some(entry) if entry.state.is_stopped() => true,
                Some(entry) => {
                    info!("Stream {} was deleted, cancelling its session", entry.routing_hash);
                    entry.cancel.cancel();
                    false
                }
                None => continue,
            };
            if stopped {
                self.sessions.remove(&id);
                self.publish_status();
            }
        }

        for record in records {
            if !self.sessions.contains_key(&record.id) {
                info!("New stream {} found, starting session", record.routing_hash);
                self.start(record).await;
            }
        }
    }

    /// Drive the orchestrator until the root token is cancelled. With a
    /// non-zero interval the registry is polled for added and removed streams.
    pub async fn run(mut self, registry: StreamRegistry, reconcile_interval: Option<Duration>) {
        match registry.list().await {
            Ok(records) => self.start_all(&records).await,
            Err(e) => error!("Failed to read streams at startup: {}", e),
        }

        let mut ticker = reconcile_interval.map(tokio::time::interval);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                outcome = self.outcomes_rx.recv() => {
                    if let Some(outcome) = outcome {
                        self.record_outcome(outcome);
                    }
                }
                _ = tick(&mut ticker) => {
                    match registry.list().await {
                        Ok(records) => self.reconcile(&records).await,
                        Err(e) => error!("Reconciliation skipped: {}", e),
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Cancel every session and wait for the running ones to report back
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();

        let mut pending = self
            .sessions
            .values()
            .filter(|s| !s.state.is_stopped())
            .count();
        info!("Stopping {} sessions", pending);

        while pending > 0 {
            match self.outcomes_rx.recv().await {
                Some(outcome) => {
                    self.record_outcome(outcome);
                    pending -= 1;
                }
                None => break,
            }
        }
    }
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn bind_listeners(addrs: SessionAddrs) -> Result<(TcpListener, TcpListener), Error> {
    let ingest = TcpListener::bind(addrs.ingest)
        .await
        .map_err(|e| Error::Bind(format!("ingest listener on {}: {}", addrs.ingest, e)))?;
    let packaging = TcpListener::bind(addrs.packaging)
        .await
        .map_err(|e| Error::Bind(format!("packaging listener on {}: {}", addrs.packaging, e)))?;
    Ok((ingest, packaging))
}

fn spawn_engine(
    engine: Box<dyn Engine>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> (EngineKind, JoinHandle<Result<(), Error>>) {
    let kind = engine.kind();
    (kind, tokio::spawn(async move { engine.serve(listener, cancel).await }))
}

fn stop_reason(
    kind: EngineKind,
    result: Result<Result<(), Error>, JoinError>,
    cancel: &CancellationToken,
) -> StopReason {
    match result {
        Ok(Ok(())) if cancel.is_cancelled() => StopReason::Cancelled,
        Ok(Ok(())) => StopReason::Completed,
        Ok(Err(e)) => StopReason::Fault(format!("{} engine: {}", kind, e)),
        Err(e) if e.is_panic() => StopReason::Fault(format!("{} engine panicked", kind)),
        Err(e) => StopReason::Fault(format!("{} engine task failed: {}", kind, e)),
    }
}

/// Supervise both accept loops of one session. Whichever ends first ends the
/// session; the other is cancelled and awaited so its socket is released.
fn spawn_session(
    stream_id: i64,
    routing_hash: String,
    engines: SessionEngines,
    listeners: (TcpListener, TcpListener),
    cancel: CancellationToken,
    outcomes: mpsc::UnboundedSender<SessionOutcome>,
) {
    let (ingest_listener, packaging_listener) = listeners;
    let (ingest_kind, mut ingest) = spawn_engine(engines.ingest, ingest_listener, cancel.clone());
    let (packaging_kind, mut packaging) =
        spawn_engine(engines.packaging, packaging_listener, cancel.clone());

    tokio::spawn(async move {
        let (reason, other, other_kind) = tokio::select! {
            result = &mut ingest => (stop_reason(ingest_kind, result, &cancel), packaging, packaging_kind),
            result = &mut packaging => (stop_reason(packaging_kind, result, &cancel), ingest, ingest_kind),
        };

        cancel.cancel();
        if let StopReason::Fault(e) = stop_reason(other_kind, other.await, &cancel) {
            warn!("Session {} also lost its {}", routing_hash, e);
        }

        let _ = outcomes.send(SessionOutcome { stream_id, reason });
    });
}
