//! Tunnel orchestration.
//!
//! A [`TunnelSession`] composes a routing service and a forwarding process
//! into one logical VPN connection: it coordinates startup ordering, reacts
//! to network changes and power transitions, and emits a single ordered
//! status stream. Sessions are self-contained; nothing is shared across
//! instances.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, info, warn};

use outway_core::{Error, Result, TransportConfig, TunnelStatus};

use crate::connectivity;
use crate::events::{EVENT_CHANNEL_CAPACITY, PowerEvent, StatusEvent};
use crate::process::ProcessError;
use crate::routing::{RoutingEvent, RoutingService};

/// Contract between the orchestrator and the forwarding process
/// controller. See [`crate::tun2socks::Tun2socksController`] for the
/// production implementation.
pub trait Forwarder: Send + Sync {
    /// Launch the forwarding process and wait for it to become ready.
    fn start(
        &self,
        config: &TransportConfig,
        udp_enabled: bool,
    ) -> impl Future<Output = std::result::Result<(), ProcessError>> + Send;

    /// Stop the forwarding process, suppressing auto-restart.
    fn stop(&self) -> impl Future<Output = std::result::Result<(), ProcessError>> + Send;

    /// Probe the proxy: `Ok(true)` full support, `Ok(false)` TCP only,
    /// `Err` when the proxy is unreachable.
    fn check_udp(&self, config: &TransportConfig) -> impl Future<Output = Result<bool>> + Send;
}

/// Platform behavior injected at construction instead of OS-string
/// branching inside the orchestrator.
#[derive(Debug, Clone)]
pub struct PlatformCapabilities {
    /// Whether the OS delivers suspend/resume events the session must
    /// react to (Windows behavior in the original client).
    pub supports_suspend_resume: bool,
    /// Name of the TUN device the forwarding process captures.
    pub tun_device_name: String,
}

impl Default for PlatformCapabilities {
    fn default() -> Self {
        Self {
            supports_suspend_resume: cfg!(windows),
            tun_device_name: "outway-tun0".to_string(),
        }
    }
}

/// Internal lifecycle phase. Only the four public [`TunnelStatus`] values
/// are ever broadcast; the extra phases make illegal transitions defined
/// behavior instead of accidents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Idle,
    Connecting,
    Connected,
    Suspended,
    Reconnecting,
    Disconnecting,
    Disconnected,
}

struct SessionInner<R, F> {
    id: String,
    routing: R,
    forwarder: F,
    capabilities: PlatformCapabilities,
    phase: Mutex<SessionPhase>,
    /// Transport config with the proxy host replaced by its resolved IP.
    resolved_config: Mutex<Option<TransportConfig>>,
    udp_enabled: AtomicBool,
    /// One-way latch: once set, `disconnect()` is a no-op.
    disconnected: AtomicBool,
    /// Flipped to `true` exactly once, after both helpers were stopped.
    stopped_tx: watch::Sender<bool>,
    status_tx: broadcast::Sender<StatusEvent>,
    /// Power transitions from platform glue; taken by the event loop.
    power_rx: Mutex<Option<broadcast::Receiver<PowerEvent>>>,
}

/// One logical VPN connection. Cheaply cloneable; all clones share the
/// same session state.
pub struct TunnelSession<R, F> {
    inner: Arc<SessionInner<R, F>>,
}

impl<R, F> Clone for TunnelSession<R, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, F> TunnelSession<R, F>
where
    R: RoutingService + Send + Sync + 'static,
    F: Forwarder + Send + Sync + 'static,
{
    /// Create a session with a fresh random id.
    pub fn new(routing: R, forwarder: F, capabilities: PlatformCapabilities) -> Self {
        Self::with_id(
            uuid::Uuid::new_v4().to_string(),
            routing,
            forwarder,
            capabilities,
        )
    }

    /// Create a session with a caller-provided id (e.g. the persisted one).
    pub fn with_id(
        id: String,
        routing: R,
        forwarder: F,
        capabilities: PlatformCapabilities,
    ) -> Self {
        let (stopped_tx, _) = watch::channel(false);
        let (status_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SessionInner {
                id,
                routing,
                forwarder,
                capabilities,
                phase: Mutex::new(SessionPhase::Idle),
                resolved_config: Mutex::new(None),
                udp_enabled: AtomicBool::new(true),
                disconnected: AtomicBool::new(false),
                stopped_tx,
                status_tx,
                power_rx: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Whether the forwarding process currently runs with UDP enabled.
    pub fn udp_enabled(&self) -> bool {
        self.inner.udp_enabled.load(Ordering::SeqCst)
    }

    /// Seed the UDP flag (e.g. from persisted state) before an
    /// auto-reconnect, where the pre-connect probe is skipped.
    pub fn set_udp_enabled(&self, enabled: bool) {
        self.inner.udp_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Attach the source of OS power transitions. Must be called before
    /// `connect` to take effect; ignored entirely when the platform does
    /// not deliver suspend/resume.
    pub async fn attach_power_events(&self, rx: broadcast::Receiver<PowerEvent>) {
        *self.inner.power_rx.lock().await = Some(rx);
    }

    /// Subscribe to status transitions. Events arrive in the order the
    /// transitions occurred.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.status_tx.subscribe()
    }

    /// Resolves once both helpers have been stopped, however the session
    /// ended.
    pub async fn wait_until_stopped(&self) {
        let mut rx = self.inner.stopped_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Establish the tunnel.
    ///
    /// On a manual connect the proxy is probed first: TCP unreachability
    /// aborts, a UDP-only failure falls back to DNS-over-TCP. On an
    /// auto-reconnect at startup the probe is skipped and the tunnel is
    /// assumed connected so no traffic leaks while connectivity settles.
    /// Routing and forwarding start concurrently; `Connected` is reported
    /// only after both are up. A failed connect leaves nothing running.
    pub async fn connect(&self, config: &TransportConfig, auto_reconnect: bool) -> Result<()> {
        {
            let mut phase = self.inner.phase.lock().await;
            if *phase != SessionPhase::Idle {
                return Err(Error::InvalidState(format!(
                    "connect is only valid on an idle session (phase {phase:?})"
                )));
            }
            *phase = SessionPhase::Connecting;
        }

        // Subscribe before the helpers start so a daemon event raised
        // during startup is queued for the event loop instead of lost.
        let routing_rx = self.inner.routing.subscribe();

        let result = self.connect_inner(config, auto_reconnect).await;
        match result {
            Ok(()) => {
                // A disconnect() may have completed while the helpers
                // were starting; never report Connected after it did.
                if self.inner.disconnected.load(Ordering::SeqCst) {
                    warn!(tunnel_id = %self.inner.id, "disconnected while connecting, tearing down");
                    if let Err(e) = self.inner.forwarder.stop().await {
                        log_forwarder_stop_error(&e);
                    }
                    if let Err(e) = self.inner.routing.stop().await {
                        warn!(error = %e, "routing teardown after aborted connect");
                    }
                    *self.inner.phase.lock().await = SessionPhase::Disconnected;
                    return Err(Error::InvalidState(
                        "session was disconnected while connecting".to_string(),
                    ));
                }
                *self.inner.phase.lock().await = SessionPhase::Connected;
                self.emit(TunnelStatus::Connected);
                self.spawn_event_loop(routing_rx).await;
                Ok(())
            }
            Err(e) => {
                *self.inner.phase.lock().await = SessionPhase::Idle;
                Err(e)
            }
        }
    }

    async fn connect_inner(&self, config: &TransportConfig, auto_reconnect: bool) -> Result<()> {
        config.validate()?;

        if auto_reconnect {
            debug!(tunnel_id = %self.inner.id, "auto-reconnect: skipping connectivity probe");
        } else {
            let udp_supported = self.inner.forwarder.check_udp(config).await?;
            self.inner
                .udp_enabled
                .store(udp_supported, Ordering::SeqCst);
        }

        let proxy_ip = connectivity::resolve_proxy_host(&config.host, config.port).await?;
        let resolved = config.with_host(proxy_ip.to_string());
        *self.inner.resolved_config.lock().await = Some(resolved.clone());

        let udp_enabled = self.inner.udp_enabled.load(Ordering::SeqCst);
        info!(
            tunnel_id = %self.inner.id,
            proxy_ip = %proxy_ip,
            udp_enabled,
            auto_reconnect,
            "starting tunnel helpers"
        );

        // Both helpers start concurrently; success requires both.
        let (routing_result, forwarder_result) = tokio::join!(
            self.inner.routing.start(),
            self.inner.forwarder.start(&resolved, udp_enabled),
        );

        let routing_started = routing_result.is_ok();
        let error = match (routing_result, forwarder_result) {
            (Ok(()), Ok(())) => return Ok(()),
            (Err(e), _) => e,
            (Ok(()), Err(e)) => e.into(),
        };

        // Tear down whatever half came up before surfacing the error.
        warn!(tunnel_id = %self.inner.id, "tunnel start failed, cleaning up partial state");
        if routing_started {
            if let Err(e) = self.inner.routing.stop().await {
                warn!(error = %e, "routing teardown after failed connect");
            }
        }
        if let Err(e) = self.inner.forwarder.stop().await {
            log_forwarder_stop_error(&e);
        }
        Err(error)
    }

    /// Tear the tunnel down. Idempotent: repeat calls are no-ops.
    ///
    /// The forwarding process stops strictly before the routing daemon so
    /// traffic is never routed into a dead tunnel. The disconnect path
    /// always runs to completion; a non-signal forwarder stop error is
    /// returned only after cleanup finished.
    pub async fn disconnect(&self) -> Result<()> {
        if self.inner.disconnected.swap(true, Ordering::SeqCst) {
            debug!(tunnel_id = %self.inner.id, "disconnect already performed");
            return Ok(());
        }

        // Disconnect from an idle session is defined as a no-op: nothing
        // to stop, but the completion latch still fires.
        if *self.inner.phase.lock().await == SessionPhase::Idle {
            *self.inner.phase.lock().await = SessionPhase::Disconnected;
            self.inner.stopped_tx.send_replace(true);
            return Ok(());
        }

        info!(tunnel_id = %self.inner.id, "disconnecting tunnel");
        *self.inner.phase.lock().await = SessionPhase::Disconnecting;
        self.emit(TunnelStatus::Disconnecting);

        let mut first_error: Option<Error> = None;
        if let Err(e) = self.inner.forwarder.stop().await {
            match e {
                // Terminated by our own stop signal: expected.
                ProcessError::Signal { ref signal } => {
                    debug!(signal, "forwarder stopped by termination signal");
                }
                other => {
                    warn!(error = %other, "forwarder stop failed");
                    first_error = Some(other.into());
                }
            }
        }
        if let Err(e) = self.inner.routing.stop().await {
            // Routing may already be down; never fatal on this path.
            warn!(error = %e, "routing stop failed");
        }

        self.inner.stopped_tx.send_replace(true);
        *self.inner.phase.lock().await = SessionPhase::Disconnected;
        self.emit(TunnelStatus::Disconnected);
        info!(tunnel_id = %self.inner.id, "tunnel disconnected");

        first_error.map_or(Ok(()), Err)
    }

    async fn spawn_event_loop(&self, routing_rx: broadcast::Receiver<RoutingEvent>) {
        let session = self.clone();
        let mut routing_rx = Some(routing_rx);
        let mut power_rx = self.inner.power_rx.lock().await.take();
        if !self.inner.capabilities.supports_suspend_resume {
            power_rx = None;
        }
        tokio::spawn(async move {
            session.run_event_loop(&mut routing_rx, &mut power_rx).await;
        });
    }

    async fn run_event_loop(
        &self,
        routing_rx: &mut Option<broadcast::Receiver<RoutingEvent>>,
        power_rx: &mut Option<broadcast::Receiver<PowerEvent>>,
    ) {
        let mut stopped_rx = self.inner.stopped_tx.subscribe();
        loop {
            tokio::select! {
                changed = stopped_rx.changed() => {
                    if changed.is_err() || *stopped_rx.borrow() {
                        break;
                    }
                }
                event = recv_routing(routing_rx) => match event {
                    RoutingEvent::NetworkChanged(status) => {
                        self.handle_network_change(status).await;
                    }
                    RoutingEvent::Disconnected => {
                        warn!(tunnel_id = %self.inner.id, "routing daemon disconnected unexpectedly");
                        if let Err(e) = self.disconnect().await {
                            warn!(error = %e, "disconnect after daemon loss");
                        }
                        break;
                    }
                },
                event = recv_power(power_rx) => match event {
                    PowerEvent::Suspend => self.handle_suspend().await,
                    PowerEvent::Resume => self.handle_resume().await,
                },
            }
        }
        debug!(tunnel_id = %self.inner.id, "session event loop finished");
    }

    async fn handle_network_change(&self, status: TunnelStatus) {
        if self.inner.disconnected.load(Ordering::SeqCst) {
            return;
        }
        match status {
            TunnelStatus::Reconnecting => {
                info!(tunnel_id = %self.inner.id, "network changed, reconnecting");
                *self.inner.phase.lock().await = SessionPhase::Reconnecting;
                self.emit(TunnelStatus::Reconnecting);
            }
            TunnelStatus::Connected => {
                info!(tunnel_id = %self.inner.id, "network restored");
                *self.inner.phase.lock().await = SessionPhase::Connected;
                // Notify before the probe so the UI is not blocked on it.
                self.emit(TunnelStatus::Connected);
                self.reprobe_udp().await;
            }
            other => debug!(status = %other, "ignoring network change"),
        }
    }

    /// Re-check UDP support and, when it changed, restart the forwarder
    /// with the corrected flag. Deliberately silent: no status events for
    /// the brief restart.
    async fn reprobe_udp(&self) {
        let config = self.inner.resolved_config.lock().await.clone();
        let Some(config) = config else {
            return;
        };
        let was_enabled = self.inner.udp_enabled.load(Ordering::SeqCst);
        let now_enabled = match self.inner.forwarder.check_udp(&config).await {
            Ok(supported) => supported,
            Err(e) => {
                warn!(error = %e, "UDP re-probe failed, keeping current mode");
                return;
            }
        };
        if now_enabled == was_enabled {
            return;
        }
        info!(
            tunnel_id = %self.inner.id,
            udp_enabled = now_enabled,
            "UDP support changed, restarting forwarder"
        );
        self.inner.udp_enabled.store(now_enabled, Ordering::SeqCst);
        if let Err(e) = self.inner.forwarder.stop().await {
            log_forwarder_stop_error(&e);
        }
        if let Err(e) = self.inner.forwarder.start(&config, now_enabled).await {
            warn!(error = %e, "forwarder restart after UDP change failed");
        }
    }

    async fn handle_suspend(&self) {
        if self.inner.disconnected.load(Ordering::SeqCst) {
            return;
        }
        info!(tunnel_id = %self.inner.id, "system suspending, stopping forwarder");
        *self.inner.phase.lock().await = SessionPhase::Suspended;
        self.emit(TunnelStatus::Reconnecting);
        // Routing stays intact across the suspend.
        if let Err(e) = self.inner.forwarder.stop().await {
            log_forwarder_stop_error(&e);
        }
    }

    async fn handle_resume(&self) {
        if self.inner.disconnected.load(Ordering::SeqCst) {
            return;
        }
        if *self.inner.phase.lock().await != SessionPhase::Suspended {
            return;
        }
        info!(tunnel_id = %self.inner.id, "system resumed, relaunching forwarder");
        let config = self.inner.resolved_config.lock().await.clone();
        let Some(config) = config else {
            return;
        };
        let udp_enabled = self.inner.udp_enabled.load(Ordering::SeqCst);
        if let Err(e) = self.inner.forwarder.start(&config, udp_enabled).await {
            warn!(error = %e, "forwarder relaunch after resume failed");
            return;
        }
        self.reprobe_udp().await;
        *self.inner.phase.lock().await = SessionPhase::Connected;
        self.emit(TunnelStatus::Connected);
    }

    fn emit(&self, status: TunnelStatus) {
        debug!(tunnel_id = %self.inner.id, %status, "status transition");
        let _ = self.inner.status_tx.send(StatusEvent {
            tunnel_id: self.inner.id.clone(),
            status,
        });
    }
}

fn log_forwarder_stop_error(e: &ProcessError) {
    match e {
        ProcessError::Signal { signal } => {
            debug!(signal, "forwarder stopped by termination signal");
        }
        other => warn!(error = %other, "forwarder stop failed"),
    }
}

async fn recv_routing(rx: &mut Option<broadcast::Receiver<RoutingEvent>>) -> RoutingEvent {
    loop {
        match rx.as_mut() {
            None => std::future::pending::<()>().await,
            Some(receiver) => match receiver.recv().await {
                Ok(event) => return event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "routing events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => *rx = None,
            },
        }
    }
}

async fn recv_power(rx: &mut Option<broadcast::Receiver<PowerEvent>>) -> PowerEvent {
    loop {
        match rx.as_mut() {
            None => std::future::pending::<()>().await,
            Some(receiver) => match receiver.recv().await {
                Ok(event) => return event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "power events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => *rx = None,
            },
        }
    }
}
