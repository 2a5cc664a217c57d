//! Failover monitor: peer mesh first, relay when the mesh cannot be reached.
//!
//! ```text
//!            start(restricted = true)
//!   Idle ──────────────────────────────────► RelayOnly
//!    │
//!    │ start(restricted = false)
//!    ▼
//!   ProbingMesh ── mesh Connected before deadline ──► Healthy
//!    │
//!    │ deadline
//!    ▼
//!   TimedOut   (mesh disconnected once, relay constructed once,
//!               callbacks re-attached, relay connected)
//! ```
//!
//! The monitor owns at most one transport at a time: the mesh is torn down
//! before the relay is built. Everything after the first transition out of
//! `ProbingMesh` is a no-op, so a mesh success that arrives after the
//! deadline changes nothing.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::protocol::PeerInfo;
use crate::storage::{probe_storage, PROBE_BYTES};
use crate::subscription::Subscription;
use crate::transport::{
    LoopbackHub, MeshConfig, MeshTransport, RelayConfig, RelayTransport, Transport,
    TransportCallbacks, TransportError, TransportKind, TransportStatus,
};

/// Default time the mesh gets to become usable.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    Idle,
    ProbingMesh,
    Healthy,
    TimedOut,
    RelayOnly,
}

/// Builds the two transport variants on demand.
pub trait TransportFactory: Send {
    fn mesh(&mut self) -> Box<dyn Transport>;
    fn relay(&mut self) -> Box<dyn Transport>;
}

/// Production factory: WebSocket mesh and relay for one channel.
pub struct NetworkTransports {
    pub peer: PeerInfo,
    pub channel: String,
    pub mesh: MeshConfig,
    pub relay: RelayConfig,
}

impl TransportFactory for NetworkTransports {
    fn mesh(&mut self) -> Box<dyn Transport> {
        Box::new(MeshTransport::new(
            self.peer.clone(),
            self.channel.clone(),
            self.mesh.clone(),
        ))
    }

    fn relay(&mut self) -> Box<dyn Transport> {
        Box::new(RelayTransport::new(
            self.peer.clone(),
            self.channel.clone(),
            self.relay.clone(),
        ))
    }
}

/// In-process factory: the "mesh" and the "relay" are two loopback hubs.
/// Counts constructions so callers can check the exactly-once guarantees.
pub struct LoopbackTransports {
    pub peer: PeerInfo,
    pub channel: String,
    pub mesh_hub: LoopbackHub,
    pub relay_hub: LoopbackHub,
    pub meshes_built: Arc<AtomicUsize>,
    pub relays_built: Arc<AtomicUsize>,
}

impl LoopbackTransports {
    pub fn new(
        peer: PeerInfo,
        channel: impl Into<String>,
        mesh_hub: LoopbackHub,
        relay_hub: LoopbackHub,
    ) -> Self {
        Self {
            peer,
            channel: channel.into(),
            mesh_hub,
            relay_hub,
            meshes_built: Arc::new(AtomicUsize::new(0)),
            relays_built: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl TransportFactory for LoopbackTransports {
    fn mesh(&mut self) -> Box<dyn Transport> {
        self.meshes_built.fetch_add(1, Ordering::SeqCst);
        Box::new(self.mesh_hub.transport(self.peer.clone(), self.channel.clone()))
    }

    fn relay(&mut self) -> Box<dyn Transport> {
        self.relays_built.fetch_add(1, Ordering::SeqCst);
        Box::new(self.relay_hub.transport(self.peer.clone(), self.channel.clone()))
    }
}

/// Pre-flight check: should the mesh be skipped altogether?
///
/// True when `force_relay` is set, or when the cache directory cannot be
/// created or cannot hold a small probe payload (a sign of a locked-down
/// host where direct peer links rarely work either).
pub fn preflight_restricted(force_relay: bool, cache_dir: Option<&Path>) -> bool {
    if force_relay {
        log::info!("Failover: relay forced by configuration");
        return true;
    }
    match cache_dir {
        Some(dir) => probe_storage(dir, PROBE_BYTES).is_restricted(),
        None => false,
    }
}

/// Drives the mesh → relay fallback for one session.
pub struct FailoverMonitor {
    factory: Box<dyn TransportFactory>,
    callbacks: TransportCallbacks,
    deadline_after: Duration,
    state: FailoverState,
    transport: Option<Box<dyn Transport>>,
    subscriptions: Vec<Subscription>,
    deadline: Option<Instant>,
}

impl FailoverMonitor {
    pub fn new(
        factory: Box<dyn TransportFactory>,
        callbacks: TransportCallbacks,
        deadline_after: Duration,
    ) -> Self {
        Self {
            factory,
            callbacks,
            deadline_after,
            state: FailoverState::Idle,
            transport: None,
            subscriptions: Vec::new(),
            deadline: None,
        }
    }

    pub fn state(&self) -> FailoverState {
        self.state
    }

    /// Current transport, if any.
    pub fn transport(&self) -> Option<&dyn Transport> {
        self.transport.as_deref()
    }

    pub fn kind(&self) -> Option<TransportKind> {
        self.transport.as_ref().map(|t| t.kind())
    }

    /// When the mesh probe gives up, while probing.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Begin. Only the first call has an effect.
    pub fn start(&mut self, restricted: bool) -> Result<(), TransportError> {
        if self.state != FailoverState::Idle {
            return Ok(());
        }

        if restricted {
            log::info!("Failover: restricted environment, connecting relay directly");
            self.state = FailoverState::RelayOnly;
            return self.install_relay();
        }

        self.state = FailoverState::ProbingMesh;
        let mut mesh = self.factory.mesh();
        self.subscriptions = self.callbacks.attach(mesh.as_ref());
        let connected = mesh.connect();
        self.transport = Some(mesh);

        if let Err(e) = connected {
            log::warn!("Failover: mesh could not start: {e}");
            return self.on_deadline();
        }
        self.deadline = Some(Instant::now() + self.deadline_after);
        log::info!("Failover: probing mesh for {:?}", self.deadline_after);

        // A transport may already be usable on return (in-process hubs).
        let status = self.transport.as_ref().map(|t| t.status());
        if let Some(status) = status {
            self.on_status(status);
        }
        Ok(())
    }

    /// Feed a status change of the current transport.
    pub fn on_status(&mut self, status: TransportStatus) {
        if self.state == FailoverState::ProbingMesh && status == TransportStatus::Connected {
            log::info!("Failover: mesh healthy");
            self.state = FailoverState::Healthy;
            self.deadline = None;
        }
    }

    /// The probe deadline passed. Switches to the relay if still probing.
    pub fn on_deadline(&mut self) -> Result<(), TransportError> {
        if self.state != FailoverState::ProbingMesh {
            return Ok(());
        }
        log::warn!("Failover: mesh not usable in time, falling back to relay");
        self.state = FailoverState::TimedOut;
        self.deadline = None;

        self.subscriptions.clear();
        if let Some(mut mesh) = self.transport.take() {
            mesh.disconnect();
        }
        self.install_relay()
    }

    /// Fire the deadline if `now` is past it.
    pub fn poll(&mut self, now: Instant) -> Result<(), TransportError> {
        match self.deadline {
            Some(deadline) if now >= deadline => self.on_deadline(),
            _ => Ok(()),
        }
    }

    /// Wait until the monitor leaves `ProbingMesh`.
    pub async fn settle(&mut self) -> Result<FailoverState, TransportError> {
        while self.state == FailoverState::ProbingMesh {
            let (Some(deadline), Some(transport)) = (self.deadline, self.transport.as_ref()) else {
                break;
            };
            let mut status = transport.watch_status();
            let current = *status.borrow_and_update();
            self.on_status(current);
            if self.state != FailoverState::ProbingMesh {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => self.on_deadline()?,
                changed = status.changed() => match changed {
                    Ok(()) => {
                        let current = *status.borrow();
                        self.on_status(current);
                    }
                    Err(_) => {
                        tokio::time::sleep_until(deadline).await;
                        self.on_deadline()?;
                    }
                },
            }
        }
        Ok(self.state)
    }

    /// Stop delivering callbacks. The transport stays connected.
    pub fn detach(&mut self) {
        self.subscriptions.clear();
    }

    /// Detach and disconnect the current transport.
    pub fn shutdown(&mut self) {
        self.detach();
        self.deadline = None;
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect();
        }
    }

    fn install_relay(&mut self) -> Result<(), TransportError> {
        let mut relay = self.factory.relay();
        self.subscriptions = self.callbacks.attach(relay.as_ref());
        let connected = relay.connect();
        self.transport = Some(relay);
        connected
    }
}

impl Drop for FailoverMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
