//! Collaboration session: one surface, one reconciler, at most one transport.
//!
//! ```text
//!   transport tasks ──callbacks──► inbox (mpsc) ──┐
//!   rewrite task ─────────────────► inbox ────────┤
//!   typing / failover / seed / heartbeat timers ──┼──► Session::step ──► Reconciler
//!   status watch ─────────────────────────────────┘          │
//!                                                            ▼
//!                                          Outbox ──► current transport
//! ```
//!
//! Callbacks only forward into the inbox; every state change happens inside
//! [`Session::step`] or [`Session::edit`], so the document and presence
//! registry have a single owner. `step` is cancel-safe.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};

use crate::config::CollabConfig;
use crate::document::{Delta, DocumentStore};
use crate::failover::{FailoverMonitor, FailoverState, TransportFactory};
use crate::presence::{PresenceFields, PresenceRegistry, PresenceUpdate};
use crate::protocol::PeerInfo;
use crate::reconciler::{Outbox, Reconciler, ReconcilerConfig, Surface};
use crate::rewrite::{self, RewriteError, RewriteService, StyleTag};
use crate::storage::TextCache;
use crate::transport::{
    PeerEvent, TransportCallbacks, TransportError, TransportKind, TransportStatus,
};

/// How often stale presence entries are swept.
const EXPIRY_TICK: Duration = Duration::from_secs(1);

/// Timings and identity of the editor a session serves.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub style: StyleTag,
    pub app_namespace: String,
    pub typing_debounce: Duration,
    pub presence_grace: Duration,
    pub presence_heartbeat: Duration,
    pub seed_delay: Duration,
    pub failover_deadline: Duration,
    /// Skip the mesh (pre-flight verdict)
    pub restricted: bool,
}

impl SessionConfig {
    pub fn new(style: StyleTag, config: &CollabConfig, restricted: bool) -> Self {
        Self {
            style,
            app_namespace: config.app_namespace.clone(),
            typing_debounce: config.typing_debounce(),
            presence_grace: config.presence_grace(),
            presence_heartbeat: config.presence_heartbeat(),
            seed_delay: config.seed_delay(),
            failover_deadline: config.failover_deadline(),
            restricted,
        }
    }

    pub fn cache_key(&self) -> String {
        self.style.cache_key(&self.app_namespace)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(StyleTag::Happy, &CollabConfig::default(), false)
    }
}

/// What the UI shows about the session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    /// `None` in solo mode
    pub connection: Option<TransportStatus>,
    pub transport: Option<TransportKind>,
    pub failover: Option<FailoverState>,
    /// Display names of live peers
    pub collaborators: Vec<String>,
    pub someone_typing: bool,
    pub warning: Option<String>,
}

enum Inbound {
    Delta(Delta),
    Presence(PresenceUpdate),
    Peer(PeerEvent),
    Rewritten {
        request: String,
        result: Result<String, RewriteError>,
    },
}

enum Wake {
    Inbound(Inbound),
    Status(TransportStatus),
    StatusClosed,
    Typing,
    Failover,
    Seed,
    Heartbeat,
    Expiry,
}

pub struct Session<S: Surface> {
    surface: S,
    reconciler: Reconciler,
    monitor: Option<FailoverMonitor>,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    inbox_tx: mpsc::UnboundedSender<Inbound>,
    status: Option<watch::Receiver<TransportStatus>>,
    rewriter: Arc<dyn RewriteService>,
    rewrite_pending: bool,
    config: SessionConfig,
    seed_at: Option<Instant>,
    next_heartbeat: Instant,
    next_expiry: Instant,
}

impl<S: Surface> Session<S> {
    /// Local-only editing: the cache is loaded into the surface, nothing is
    /// replicated.
    pub fn solo(
        mut surface: S,
        peer: PeerInfo,
        cache: Box<dyn TextCache>,
        rewriter: Arc<dyn RewriteService>,
        config: SessionConfig,
    ) -> Self {
        let mut reconciler = Reconciler::new(
            DocumentStore::new(peer.replica_id),
            cache,
            None,
            reconciler_config(&config),
        );
        reconciler.seed_from_cache(&mut surface);
        log::info!("Session: solo editing ({})", config.style);

        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let now = Instant::now();
        Self {
            surface,
            reconciler,
            monitor: None,
            inbox,
            inbox_tx,
            status: None,
            rewriter,
            rewrite_pending: false,
            seed_at: None,
            next_heartbeat: now + config.presence_heartbeat,
            next_expiry: now + EXPIRY_TICK,
            config,
        }
    }

    /// Join a room through `transports`, mesh first. Must be called inside a
    /// tokio runtime.
    pub fn collaborative(
        surface: S,
        peer: PeerInfo,
        cache: Box<dyn TextCache>,
        rewriter: Arc<dyn RewriteService>,
        transports: Box<dyn TransportFactory>,
        config: SessionConfig,
    ) -> Result<Self, TransportError> {
        let mut presence = PresenceRegistry::new(peer.replica_id, peer.name.clone(), peer.color)
            .with_grace(config.presence_grace);
        presence.set_local(PresenceFields::default().cursor(Some(surface.caret())));

        let reconciler = Reconciler::new(
            DocumentStore::new(peer.replica_id),
            cache,
            Some(presence),
            reconciler_config(&config),
        );

        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let mut monitor = FailoverMonitor::new(
            transports,
            forwarding_callbacks(&inbox_tx),
            config.failover_deadline,
        );
        monitor.start(config.restricted)?;
        log::info!(
            "Session: {} joined as {} ({:?})",
            peer.name,
            peer.replica_id,
            monitor.state()
        );

        let now = Instant::now();
        let mut session = Self {
            surface,
            reconciler,
            monitor: Some(monitor),
            inbox,
            inbox_tx,
            status: None,
            rewriter,
            rewrite_pending: false,
            seed_at: Some(now + config.seed_delay),
            next_heartbeat: now + config.presence_heartbeat,
            next_expiry: now + EXPIRY_TICK,
            config,
        };
        session.watch_current_transport();
        Ok(session)
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn text(&self) -> String {
        self.surface.text()
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn style(&self) -> StyleTag {
        self.config.style
    }

    /// Change the surface as the local user and replicate the result.
    pub fn edit<F>(&mut self, change: F)
    where
        F: FnOnce(&mut S),
    {
        change(&mut self.surface);
        let outbox = self
            .reconciler
            .handle_local_edit(&mut self.surface, Instant::now());
        self.send(outbox);
    }

    /// Submit the `/rewrite` line, if any. Returns false when there is
    /// nothing to rewrite or a rewrite is already running.
    pub fn request_rewrite(&mut self) -> bool {
        if self.rewrite_pending {
            return false;
        }
        let Some(request) = rewrite::find_rewrite_request(&self.surface.text()) else {
            return false;
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("Session: no runtime for the rewrite service, using the local rewrite");
            self.finish_rewrite(&request, Err(RewriteError::Http("no async runtime".into())));
            return true;
        };

        self.rewrite_pending = true;
        let service = self.rewriter.clone();
        let inbox = self.inbox_tx.clone();
        let style = self.config.style;
        runtime.spawn(async move {
            let result = service.rewrite(&request, style).await;
            let _ = inbox.send(Inbound::Rewritten { request, result });
        });
        true
    }

    pub fn rewrite_pending(&self) -> bool {
        self.rewrite_pending
    }

    /// Wait for the next event and handle it.
    pub async fn step(&mut self) {
        let typing = self.reconciler.typing_deadline();
        let failover = self.monitor.as_ref().and_then(FailoverMonitor::deadline);
        let seed = self.seed_at;
        let collaborative = self.monitor.is_some();
        let heartbeat = self.next_heartbeat;
        let expiry = self.next_expiry;

        let wake = tokio::select! {
            Some(inbound) = self.inbox.recv() => Wake::Inbound(inbound),
            status = status_changed(&mut self.status) => match status {
                Some(status) => Wake::Status(status),
                None => Wake::StatusClosed,
            },
            _ = sleep_opt(typing) => Wake::Typing,
            _ = sleep_opt(failover) => Wake::Failover,
            _ = sleep_opt(seed) => Wake::Seed,
            _ = sleep_until(heartbeat), if collaborative => Wake::Heartbeat,
            _ = sleep_until(expiry), if collaborative => Wake::Expiry,
        };
        self.handle(wake, Instant::now());
    }

    /// Step until `period` has elapsed.
    pub async fn run_for(&mut self, period: Duration) {
        let until = Instant::now() + period;
        while tokio::time::timeout_at(until, self.step()).await.is_ok() {}
    }

    /// Step until `done` holds or `period` elapses. Returns whether `done`
    /// held.
    pub async fn run_until<F>(&mut self, period: Duration, mut done: F) -> bool
    where
        F: FnMut(&Self) -> bool,
    {
        let until = Instant::now() + period;
        loop {
            if done(self) {
                return true;
            }
            if tokio::time::timeout_at(until, self.step()).await.is_err() {
                return done(self);
            }
        }
    }

    pub fn status(&self) -> SessionStatus {
        let presence = self.reconciler.presence();
        SessionStatus {
            connection: self
                .monitor
                .as_ref()
                .map(|m| m.transport().map_or(TransportStatus::Disconnected, |t| t.status())),
            transport: self.monitor.as_ref().and_then(FailoverMonitor::kind),
            failover: self.monitor.as_ref().map(FailoverMonitor::state),
            collaborators: presence.map(PresenceRegistry::collaborators).unwrap_or_default(),
            someone_typing: presence.is_some_and(PresenceRegistry::anyone_typing),
            warning: self.reconciler.warning().map(str::to_string),
        }
    }

    pub fn dismiss_warning(&mut self) {
        self.reconciler.dismiss_warning();
    }

    /// End the session and hand the surface back.
    pub fn shutdown(self) -> S {
        let Self {
            surface,
            mut reconciler,
            monitor,
            mut inbox,
            ..
        } = self;

        let mut monitor = monitor;
        if let Some(monitor) = monitor.as_mut() {
            monitor.detach();
        }
        inbox.close();

        if let Some(mut monitor) = monitor {
            if let (Some(presence), Some(transport)) =
                (reconciler.presence_mut(), monitor.transport())
            {
                transport.broadcast_presence(&presence.leave());
            }
            monitor.shutdown();
        }

        reconciler.clear_presence();
        drop(reconciler);
        log::info!("Session: closed");
        surface
    }

    fn handle(&mut self, wake: Wake, now: Instant) {
        match wake {
            Wake::Inbound(inbound) => self.handle_inbound(inbound, now),
            Wake::Status(status) => self.on_status(status),
            Wake::StatusClosed => self.status = None,
            Wake::Typing => {
                let outbox = self.reconciler.poll_typing(now);
                self.send(outbox);
            }
            Wake::Failover => {
                if let Some(monitor) = self.monitor.as_mut() {
                    if let Err(e) = monitor.poll(now) {
                        log::warn!("Session: relay could not start: {e}");
                    }
                }
                self.watch_current_transport();
            }
            Wake::Seed => self.seed(),
            Wake::Heartbeat => {
                self.next_heartbeat = now + self.config.presence_heartbeat;
                let update = self
                    .reconciler
                    .presence_mut()
                    .map(PresenceRegistry::refresh_local);
                if let Some(update) = update {
                    self.send_presence(&update);
                }
            }
            Wake::Expiry => {
                self.next_expiry = now + EXPIRY_TICK;
                if let Some(presence) = self.reconciler.presence_mut() {
                    for replica in presence.expire(now) {
                        log::debug!("Session: presence of {replica} expired");
                    }
                }
            }
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound, now: Instant) {
        match inbound {
            Inbound::Delta(delta) => {
                // Malformed deltas are logged by the reconciler and dropped;
                // a commit made on the way still goes out.
                match self
                    .reconciler
                    .handle_remote_delta(&mut self.surface, &delta, now)
                {
                    Ok(outbox) => self.send(outbox),
                    Err(rejected) => self.send(rejected.pending),
                }
            }
            Inbound::Presence(update) => {
                self.reconciler.handle_remote_presence(&update);
            }
            Inbound::Peer(PeerEvent::Joined(info)) => {
                log::info!("Session: {} ({}) joined", info.name, info.replica_id);
                self.announce();
            }
            Inbound::Peer(PeerEvent::Left(replica)) => {
                log::info!("Session: {replica} left");
                if let Some(presence) = self.reconciler.presence_mut() {
                    presence.remove(replica);
                }
            }
            Inbound::Peer(PeerEvent::StateReceived) => self.seed(),
            Inbound::Rewritten { request, result } => {
                self.rewrite_pending = false;
                self.finish_rewrite(&request, result);
            }
        }
    }

    fn on_status(&mut self, status: TransportStatus) {
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.on_status(status);
        }
        if status == TransportStatus::Connected {
            self.announce();
        }
    }

    fn seed(&mut self) {
        self.seed_at = None;
        let outbox = self.reconciler.seed_from_cache(&mut self.surface);
        self.send(outbox);
    }

    fn finish_rewrite(&mut self, request: &str, result: Result<String, RewriteError>) {
        let rewritten = match result {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Session: rewrite service failed, using the local rewrite: {e}");
                self.reconciler
                    .set_warning(format!("Rewrite service unavailable ({e}). Used the built-in rewrite instead."));
                rewrite::fallback_rewrite(request, self.config.style)
            }
        };
        let outbox = self
            .reconciler
            .apply_rewrite(&mut self.surface, &rewritten, Instant::now());
        self.send(outbox);
    }

    /// Full state and presence, for a fresh link or a new peer.
    fn announce(&mut self) {
        let mut outbox = Outbox::default();
        if !self.reconciler.document().is_empty() {
            outbox.push_delta(self.reconciler.document().full_state());
        }
        if let Some(presence) = self.reconciler.presence_mut() {
            outbox.presence.push(presence.refresh_local());
        }
        self.send(outbox);
    }

    /// Re-acquire the status watch after the transport may have changed.
    fn watch_current_transport(&mut self) {
        let Some(transport) = self.monitor.as_ref().and_then(FailoverMonitor::transport) else {
            self.status = None;
            return;
        };
        let mut watch = transport.watch_status();
        let current = *watch.borrow_and_update();
        self.status = Some(watch);
        self.on_status(current);
    }

    fn send(&self, outbox: Outbox) {
        let Some(transport) = self.monitor.as_ref().and_then(FailoverMonitor::transport) else {
            return;
        };
        for delta in outbox.deltas.iter().filter(|delta| !delta.is_empty()) {
            transport.broadcast_delta(delta);
        }
        for update in &outbox.presence {
            transport.broadcast_presence(update);
        }
    }

    fn send_presence(&self, update: &PresenceUpdate) {
        if let Some(transport) = self.monitor.as_ref().and_then(FailoverMonitor::transport) {
            transport.broadcast_presence(update);
        }
    }
}

fn reconciler_config(config: &SessionConfig) -> ReconcilerConfig {
    ReconcilerConfig {
        cache_key: config.cache_key(),
        placeholder: config.style.placeholder().to_string(),
        typing_debounce: config.typing_debounce,
    }
}

fn forwarding_callbacks(inbox: &mpsc::UnboundedSender<Inbound>) -> TransportCallbacks {
    let deltas = inbox.clone();
    let presence = inbox.clone();
    let peers = inbox.clone();
    TransportCallbacks {
        delta: Arc::new(move |delta: &Delta| {
            let _ = deltas.send(Inbound::Delta(delta.clone()));
        }),
        presence: Arc::new(move |update: &PresenceUpdate| {
            let _ = presence.send(Inbound::Presence(update.clone()));
        }),
        peer: Arc::new(move |event: &PeerEvent| {
            let _ = peers.send(Inbound::Peer(event.clone()));
        }),
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn status_changed(
    watch: &mut Option<watch::Receiver<TransportStatus>>,
) -> Option<TransportStatus> {
    let Some(watch) = watch.as_mut() else {
        return pending().await;
    };
    match watch.changed().await {
        Ok(()) => Some(*watch.borrow_and_update()),
        Err(_) => None,
    }
}
