//! Workers: one authenticated HTTP/2 session each
//!
//! A worker is a single task that owns its session and its pending table and
//! reacts to one stream of events: caller submissions, stream completions,
//! keep-alive pings, deadline expiry and transport closure. Callers talk to it
//! only through a [`WorkerHandle`].
//!
//! # Lifecycle
//!
//! `Connected <-> Reconnecting -> Terminated`
//!
//! - [`start`] returns a handle only once the first session is up, so a
//!   handle is never observed before `Connected`.
//! - Startup failures (TLS alerts, bad TLS options, unreachable peer) are
//!   returned from [`start`] and no task is spawned.
//! - On connection loss every pending request fails with `connection_lost`,
//!   then up to `reconnect_attempts` reconnections are tried. Running out of
//!   attempts terminates the worker; its pool replaces it.
//! - Requests are accepted only while `Connected`; otherwise `not_ready`.

mod exchange;
mod pending;
mod session;

use crate::config::{ConnectionConfig, Scheme};
use crate::error::{PushError, StartupError};
use crate::request::{Request, RequestId, SendMode, SendOutcome};
use crate::tls;
use exchange::Event;
use h2::Ping;
use pending::{Pending, PendingTable, Reply};
use rustls::ClientConfig;
use session::Session;
use std::fmt;
use std::future::{poll_fn, Future};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const MAILBOX_CAPACITY: usize = 1024;
const MAX_BACKOFF_FACTOR: u32 = 8;

/// Observable worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Connected,
    Reconnecting,
    Terminated,
}

impl WorkerStatus {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerStatus::Connected => "connected",
            WorkerStatus::Reconnecting => "reconnecting",
            WorkerStatus::Terminated => "terminated",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a worker task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Asked to stop
    Shutdown,

    /// Every reconnection attempt failed
    ReconnectExhausted {
        attempts: u32,
        last_error: Option<String>,
    },

    /// The task died unexpectedly
    Panicked(String),
}

impl WorkerExit {
    /// Whether the owning pool should start a replacement
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WorkerExit::Shutdown)
    }
}

/// State the worker publishes; written only by the worker task
#[derive(Debug)]
struct Shared {
    in_flight: AtomicUsize,
    reconnect_count: AtomicU32,
    last_ping_ack: Mutex<Option<Instant>>,
}

impl Shared {
    fn record_ping_ack(&self) {
        if let Ok(mut last) = self.last_ping_ack.lock() {
            *last = Some(Instant::now());
        }
    }
}

#[derive(Debug)]
struct Submit {
    id: RequestId,
    request: Request,
    deadline: Instant,
    reply: Reply,
    accepted: oneshot::Sender<Result<(), PushError>>,
}

#[derive(Debug)]
enum Command {
    Submit(Submit),
    Shutdown,
}

/// Cheap, clonable handle to a running worker
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: usize,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<WorkerStatus>,
    shared: Arc<Shared>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == WorkerStatus::Connected
    }

    /// Requests currently awaiting an outcome
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Relaxed)
    }

    /// Failed reconnection attempts since the last successful connection
    pub fn reconnect_count(&self) -> u32 {
        self.shared.reconnect_count.load(Ordering::Relaxed)
    }

    pub fn last_ping_ack(&self) -> Option<Instant> {
        self.shared.last_ping_ack.lock().ok().and_then(|last| *last)
    }

    /// Wait until the worker reports `status`
    ///
    /// Returns false if the worker went away first.
    pub async fn wait_for_status(&self, status: WorkerStatus) -> bool {
        let mut rx = self.status.clone();
        let reached = rx.wait_for(|current| *current == status).await.is_ok();
        reached
    }

    /// Submit a request
    ///
    /// `Sync` waits for the outcome, which is never later than `timeout`.
    /// `Async` returns [`SendOutcome::Accepted`] as soon as the worker has
    /// registered the request; the outcome is delivered on the channel
    /// exactly once, whether it is a response, a timeout or a connection loss.
    pub async fn send(
        &self,
        request: Request,
        mode: SendMode,
        timeout: Duration,
    ) -> Result<SendOutcome, PushError> {
        self.send_until(request, mode, Instant::now() + timeout).await
    }

    /// Like [`send`](Self::send), against an absolute deadline
    ///
    /// A response that completes at or after `deadline` is reported as
    /// `request_timeout`.
    pub async fn send_until(
        &self,
        request: Request,
        mode: SendMode,
        deadline: Instant,
    ) -> Result<SendOutcome, PushError> {
        let id = RequestId::next();

        match mode {
            SendMode::Sync => {
                let (reply_tx, reply_rx) = oneshot::channel();
                let outcome = tokio::time::timeout_at(deadline, async {
                    self.submit(id, request, deadline, Reply::Sync(reply_tx))
                        .await?;
                    reply_rx.await.unwrap_or(Err(PushError::ConnectionLost))
                })
                .await;

                match outcome {
                    Ok(result) => result.map(SendOutcome::Completed),
                    Err(_) => Err(PushError::RequestTimeout),
                }
            }
            SendMode::Async(tx) => {
                self.submit(id, request, deadline, Reply::Async(tx)).await?;
                Ok(SendOutcome::Accepted(id))
            }
        }
    }

    async fn submit(
        &self,
        id: RequestId,
        request: Request,
        deadline: Instant,
        reply: Reply,
    ) -> Result<(), PushError> {
        if !self.is_connected() {
            return Err(PushError::NotReady);
        }

        let (accepted_tx, accepted_rx) = oneshot::channel();
        self.commands
            .send(Command::Submit(Submit {
                id,
                request,
                deadline,
                reply,
                accepted: accepted_tx,
            }))
            .await
            .map_err(|_| PushError::NotReady)?;

        accepted_rx.await.unwrap_or(Err(PushError::NotReady))
    }

    /// Ask the worker to stop; pending requests fail with `connection_lost`
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

/// Start a worker: connect, then spawn its event loop
///
/// Fails without spawning anything if the first session cannot be
/// established.
pub async fn start(
    id: usize,
    pool: &str,
    config: Arc<ConnectionConfig>,
) -> Result<(WorkerHandle, JoinHandle<WorkerExit>), StartupError> {
    config.validate()?;

    let tls_config = match config.scheme {
        Scheme::Https => Some(tls::client_config(
            &config.tls_options,
            &config.authentication,
        )?),
        Scheme::Http => None,
    };

    debug!(pool = %pool, worker = id, addr = %config.authority(), "Starting worker");
    let session = session::establish(&config, tls_config.as_ref()).await?;

    let (commands_tx, commands_rx) = mpsc::channel(MAILBOX_CAPACITY);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(WorkerStatus::Connected);
    let shared = Arc::new(Shared {
        in_flight: AtomicUsize::new(0),
        reconnect_count: AtomicU32::new(0),
        last_ping_ack: Mutex::new(Some(Instant::now())),
    });

    info!(pool = %pool, worker = id, addr = %config.authority(), "Worker connected");

    let worker = Worker {
        id,
        pool: pool.to_string(),
        config,
        tls_config,
        commands: commands_rx,
        events_tx,
        events: events_rx,
        pending: PendingTable::default(),
        status: status_tx,
        shared: Arc::clone(&shared),
    };

    let handle = WorkerHandle {
        id,
        commands: commands_tx,
        status: status_rx,
        shared,
    };

    let task = tokio::spawn(worker.run(session));
    Ok((handle, task))
}

/// Why `serve` returned
enum Stop {
    Shutdown,
    Lost(String),
}

struct Worker {
    id: usize,
    pool: String,
    config: Arc<ConnectionConfig>,
    tls_config: Option<Arc<ClientConfig>>,
    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::UnboundedSender<Event>,
    events: mpsc::UnboundedReceiver<Event>,
    pending: PendingTable,
    status: watch::Sender<WorkerStatus>,
    shared: Arc<Shared>,
}

impl Worker {
    async fn run(mut self, session: Session) -> WorkerExit {
        // Exactly one session is alive at a time; replacing it drops the old one
        let mut session = session;

        loop {
            let stop = self.serve(&mut session).await;
            let cause = match stop {
                Stop::Shutdown => {
                    drop(session);
                    return self.terminate(WorkerExit::Shutdown);
                }
                Stop::Lost(cause) => cause,
            };

            drop(session);
            warn!(
                pool = %self.pool,
                worker = self.id,
                pending = self.pending.len(),
                cause = %cause,
                "Connection lost"
            );
            self.fail_all(PushError::ConnectionLost);
            self.set_status(WorkerStatus::Reconnecting);

            session = match self.reconnect().await {
                Ok(session) => session,
                Err(exit) => return self.terminate(exit),
            };
        }
    }

    /// Steady state: runs until the connection is lost or shutdown is requested
    async fn serve(&mut self, session: &mut Session) -> Stop {
        let interval = self.config.ping_interval;
        let mut ping_timer = tokio::time::interval_at(Instant::now() + interval, interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut awaiting_pong = false;

        loop {
            // Far enough out to never fire when nothing is pending
            let next_deadline = self
                .pending
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Submit(submit)) => self.submit(session, submit),
                    Some(Command::Shutdown) | None => return Stop::Shutdown,
                },
                Some(event) = self.events.recv() => {
                    if let Some(cause) = self.on_event(event, session.driver.is_finished()) {
                        return Stop::Lost(cause);
                    }
                }
                _ = ping_timer.tick() => {
                    if awaiting_pong {
                        return Stop::Lost("ping not acknowledged within one interval".to_string());
                    }
                    if let Err(e) = session.ping_pong.send_ping(Ping::opaque()) {
                        return Stop::Lost(format!("ping failed: {}", e));
                    }
                    awaiting_pong = true;
                }
                pong = poll_fn(|cx| session.ping_pong.poll_pong(cx)), if awaiting_pong => match pong {
                    Ok(_) => {
                        awaiting_pong = false;
                        self.shared.record_ping_ack();
                    }
                    Err(e) => return Stop::Lost(format!("ping failed: {}", e)),
                },
                closed = &mut session.driver => {
                    return Stop::Lost(match closed {
                        Ok(Ok(())) => "connection closed by peer".to_string(),
                        Ok(Err(e)) => e.to_string(),
                        Err(e) => format!("connection task failed: {}", e),
                    });
                }
                _ = tokio::time::sleep_until(next_deadline) => self.expire(Instant::now()),
            }
        }
    }

    fn submit(&mut self, session: &Session, submit: Submit) {
        let Submit {
            id,
            request,
            deadline,
            reply,
            accepted,
        } = submit;

        let head = self
            .config
            .authentication
            .resolve_header()
            .and_then(|auth| request.to_http(&self.config, auth));
        let head = match head {
            Ok(head) => head,
            Err(e) => {
                debug!(pool = %self.pool, worker = self.id, request = %id, error = %e, "Request rejected");
                let _ = accepted.send(Err(e));
                return;
            }
        };

        let exchange = exchange::spawn(
            id,
            session.send_request.clone(),
            head,
            request.body,
            self.events_tx.clone(),
        );
        self.pending
            .insert(id, Pending::new(reply, deadline, Some(exchange)));
        self.publish_in_flight();

        debug!(pool = %self.pool, worker = self.id, request = %id, path = %request.path, "Request submitted");
        let _ = accepted.send(Ok(()));
    }

    /// Returns a cause when the event shows the connection is gone
    fn on_event(&mut self, event: Event, session_closed: bool) -> Option<String> {
        match event {
            Event::Opened { id, stream_id } => {
                if self.pending.set_stream_id(id, stream_id) {
                    debug!(worker = self.id, request = %id, stream_id, "Stream opened");
                }
                None
            }
            Event::Finished { id, result } => {
                let Some(entry) = self.pending.remove(id) else {
                    debug!(worker = self.id, request = %id, "Discarding outcome of resolved request");
                    return None;
                };
                self.publish_in_flight();

                match result {
                    Ok(response) if Instant::now() < entry.deadline => {
                        entry.resolve(id, Ok(response));
                        None
                    }
                    Ok(_) => {
                        entry.resolve(id, Err(PushError::RequestTimeout));
                        None
                    }
                    Err(e) => {
                        let (push_error, connection_gone) = match exchange::classify(&e) {
                            (_, true) => (PushError::ConnectionLost, true),
                            (_, false) if session_closed => (PushError::ConnectionLost, true),
                            classified => classified,
                        };
                        debug!(worker = self.id, request = %id, stream_id = ?entry.stream_id, error = %e, "Exchange failed");
                        entry.resolve(id, Err(push_error));
                        connection_gone.then(|| e.to_string())
                    }
                }
            }
        }
    }

    fn expire(&mut self, now: Instant) {
        let expired = self.pending.take_expired(now);
        if expired.is_empty() {
            return;
        }
        debug!(pool = %self.pool, worker = self.id, count = expired.len(), "Requests timed out");
        for (id, entry) in expired {
            entry.resolve(id, Err(PushError::RequestTimeout));
        }
        self.publish_in_flight();
    }

    fn fail_all(&mut self, error: PushError) {
        if self.pending.is_empty() {
            return;
        }
        for (id, entry) in self.pending.drain() {
            entry.resolve(id, Err(error.clone()));
        }
        self.publish_in_flight();
    }

    /// Bounded reconnection; `Err` means the worker must terminate
    async fn reconnect(&mut self) -> Result<Session, WorkerExit> {
        let attempts = self.config.reconnect_attempts;
        let mut delay = self.config.reconnect_backoff;
        let max_delay = self.config.reconnect_backoff * MAX_BACKOFF_FACTOR;
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                self.while_reconnecting(tokio::time::sleep(delay))
                    .await
                    .ok_or(WorkerExit::Shutdown)?;
                delay = (delay * 2).min(max_delay);
            }

            let config = Arc::clone(&self.config);
            let tls_config = self.tls_config.clone();
            let connect = async move { session::establish(&config, tls_config.as_ref()).await };

            match self.while_reconnecting(connect).await {
                Some(Ok(session)) => {
                    self.shared.reconnect_count.store(0, Ordering::Relaxed);
                    self.shared.record_ping_ack();
                    self.set_status(WorkerStatus::Connected);
                    info!(pool = %self.pool, worker = self.id, attempt, "Worker reconnected");
                    return Ok(session);
                }
                Some(Err(e)) => {
                    self.shared.reconnect_count.store(attempt, Ordering::Relaxed);
                    warn!(
                        pool = %self.pool,
                        worker = self.id,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                    last_error = Some(e.to_string());
                }
                None => return Err(WorkerExit::Shutdown),
            }
        }

        Err(WorkerExit::ReconnectExhausted {
            attempts,
            last_error,
        })
    }

    /// Drive `fut` while answering submissions with `not_ready`
    ///
    /// Returns `None` if shutdown was requested meanwhile.
    async fn while_reconnecting<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                output = &mut fut => return Some(output),
                command = self.commands.recv() => match command {
                    Some(Command::Submit(submit)) => {
                        let _ = submit.accepted.send(Err(PushError::NotReady));
                    }
                    Some(Command::Shutdown) | None => return None,
                },
            }
        }
    }

    fn terminate(mut self, exit: WorkerExit) -> WorkerExit {
        self.fail_all(PushError::ConnectionLost);
        self.set_status(WorkerStatus::Terminated);

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Submit(submit) = command {
                let _ = submit.accepted.send(Err(PushError::NotReady));
            }
        }

        match &exit {
            WorkerExit::Shutdown => {
                info!(pool = %self.pool, worker = self.id, "Worker stopped")
            }
            other => {
                error!(pool = %self.pool, worker = self.id, exit = ?other, "Worker terminated")
            }
        }
        exit
    }

    fn set_status(&self, status: WorkerStatus) {
        self.status.send_replace(status);
    }

    fn publish_in_flight(&self) {
        self.shared
            .in_flight
            .store(self.pending.len(), Ordering::Relaxed);
    }
}
