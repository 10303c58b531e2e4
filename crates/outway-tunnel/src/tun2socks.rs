//! Forwarding process controller.
//!
//! Owns the lifecycle of the tun2socks child process: builds its launch
//! arguments from a transport configuration, waits for its ready signal,
//! and relaunches it on unexpected exit until a stop is requested. The
//! same binary also provides the connectivity-check and resource-fetch
//! invocation modes.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Deserialize;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use outway_core::{Error, TransportConfig};

use crate::orchestrator::Forwarder;
use crate::process::{ProcessError, ProcessSupervisor};

/// Exact substring the forwarding process prints once traffic relaying
/// is up.
pub const READY_MARKER: &str = "tun2socks running";

// TUN interface constants shared with the routing service.
const TUN_ADDR: &str = "10.0.85.2";
const TUN_GATEWAY: &str = "10.0.85.1";
const TUN_NETMASK: &str = "255.255.255.0";
const TUN_DNS: &str = "9.9.9.9,149.112.112.112";

/// Controller for one tun2socks process.
pub struct Tun2socksController {
    binary: PathBuf,
    tun_device: String,
    supervisor: Arc<ProcessSupervisor>,
    verbose: AtomicBool,
    /// Set by `stop()`; suppresses the auto-restart loop.
    stop_requested: Arc<AtomicBool>,
    /// Arguments of the current run, reused verbatim on auto-restart.
    current_args: Arc<Mutex<Option<Vec<String>>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Tun2socksController {
    /// Create a controller for the given binary and TUN device name.
    pub fn new(binary: PathBuf, tun_device: String) -> Self {
        let supervisor = Arc::new(ProcessSupervisor::new(binary.clone()));
        Self {
            binary,
            tun_device,
            supervisor,
            verbose: AtomicBool::new(false),
            stop_requested: Arc::new(AtomicBool::new(false)),
            current_args: Arc::new(Mutex::new(None)),
            monitor: Mutex::new(None),
        }
    }

    /// Enable verbose logging in the spawned process and stdout/stderr
    /// passthrough. Must be set before `start` to take effect.
    pub fn set_verbose(&self, enabled: bool) {
        self.verbose.store(enabled, Ordering::Relaxed);
        self.supervisor.set_mirror_output(enabled);
    }

    /// Build the fixed argument set for a tunnel run.
    pub fn build_args(
        &self,
        config: &TransportConfig,
        udp_enabled: bool,
    ) -> outway_core::Result<Vec<String>> {
        let log_level = if self.verbose.load(Ordering::Relaxed) {
            "debug"
        } else {
            "info"
        };
        let mut args = vec![
            "-tunName".to_string(),
            self.tun_device.clone(),
            "-tunAddr".to_string(),
            TUN_ADDR.to_string(),
            "-tunGw".to_string(),
            TUN_GATEWAY.to_string(),
            "-tunMask".to_string(),
            TUN_NETMASK.to_string(),
            "-tunDNS".to_string(),
            TUN_DNS.to_string(),
            "-transport".to_string(),
            config.to_transport_json()?,
            "-logLevel".to_string(),
            log_level.to_string(),
        ];
        if !udp_enabled {
            // Proxy UDP forwarding is unavailable: route DNS over TCP.
            args.push("-dnsFallback".to_string());
        }
        Ok(args)
    }

    /// Fetch a resource body through the proxy binary's `-fetchUrl` mode.
    pub async fn fetch_resource(&self, url: &str) -> outway_core::Result<String> {
        let probe = ProcessSupervisor::new(self.binary.clone());
        let args = vec!["-fetchUrl".to_string(), url.to_string()];
        probe
            .launch(&args, true)
            .await
            .map_err(|e| Error::ForwardingProcess(e.to_string()))
    }

    async fn spawn_monitor(&self, exit: JoinHandle<Result<String, ProcessError>>) {
        let supervisor = Arc::clone(&self.supervisor);
        let stop_requested = Arc::clone(&self.stop_requested);
        let current_args = Arc::clone(&self.current_args);
        let handle = tokio::spawn(async move {
            let mut pending = exit;
            loop {
                let result = match pending.await {
                    Ok(result) => result,
                    Err(_) => break,
                };
                if stop_requested.load(Ordering::SeqCst) {
                    break;
                }
                match result {
                    Ok(_) => warn!("tun2socks exited cleanly while in use, restarting"),
                    Err(ProcessError::ExitCode { code, ref stderr }) => {
                        warn!(code, stderr, "tun2socks crashed, restarting");
                    }
                    Err(ProcessError::Signal { ref signal }) => {
                        warn!(signal, "tun2socks was killed externally, restarting");
                    }
                    Err(e) => {
                        // Launch-level failure: restarting would spin on a
                        // broken binary. Surface the first error and cease.
                        error!(error = %e, "tun2socks relaunch failed, giving up");
                        break;
                    }
                }
                let Some(args) = current_args.lock().await.clone() else {
                    break;
                };
                let sup = Arc::clone(&supervisor);
                pending = tokio::spawn(async move { sup.launch(&args, false).await });
                // A stop that lands before the relaunch claims its slot
                // is latched by the supervisor and terminates the child
                // on spawn; this covers a flag set just before ours.
                if stop_requested.load(Ordering::SeqCst) {
                    if let Err(e) = supervisor.stop().await {
                        warn!(error = %e, "failed to stop relaunched tun2socks");
                    }
                }
            }
            debug!("tun2socks monitor finished");
        });
        if let Some(stale) = self.monitor.lock().await.replace(handle) {
            stale.abort();
        }
    }
}

impl Forwarder for Tun2socksController {
    /// Launch tun2socks and wait for it to become ready.
    ///
    /// Resolves once the ready marker appears on stdout. An exit before
    /// the marker relaunches with the same arguments (unless a stop was
    /// requested, in which case the exit outcome settles the call); only
    /// a launch-level failure propagates and ends the restart loop.
    async fn start(
        &self,
        config: &TransportConfig,
        udp_enabled: bool,
    ) -> Result<(), ProcessError> {
        self.stop_requested.store(false, Ordering::SeqCst);
        let args = self
            .build_args(config, udp_enabled)
            .map_err(|e| ProcessError::SpawnFailed {
                reason: format!("transport serialization: {e}"),
            })?;
        *self.current_args.lock().await = Some(args.clone());
        info!(device = %self.tun_device, udp_enabled, "starting tun2socks");

        let mut attempts: u32 = 0;
        loop {
            let mut lines = self.supervisor.subscribe_lines();
            let supervisor = Arc::clone(&self.supervisor);
            let launch_args = args.clone();
            let mut exit =
                tokio::spawn(async move { supervisor.launch(&launch_args, false).await });

            let ready = wait_for_marker(&mut lines);
            tokio::pin!(ready);

            tokio::select! {
                () = &mut ready => {
                    info!(device = %self.tun_device, "tun2socks signalled ready");
                    self.spawn_monitor(exit).await;
                    return Ok(());
                }
                joined = &mut exit => {
                    let result = match joined {
                        Ok(result) => result,
                        Err(e) => Err(ProcessError::SpawnFailed {
                            reason: format!("launch task failed: {e}"),
                        }),
                    };
                    if self.stop_requested.load(Ordering::SeqCst) {
                        return result.map(|_| ());
                    }
                    match result {
                        Ok(_) | Err(ProcessError::ExitCode { .. } | ProcessError::Signal { .. }) => {
                            attempts += 1;
                            warn!(attempts, "tun2socks exited before signalling ready, restarting");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Request an explicit stop, suppressing auto-restart, then terminate
    /// the process and wait for it to settle.
    async fn stop(&self) -> Result<(), ProcessError> {
        self.stop_requested.store(true, Ordering::SeqCst);
        let result = self.supervisor.stop().await;
        if let Some(monitor) = self.monitor.lock().await.take() {
            let _ = monitor.await;
        }
        result
    }

    /// Probe the proxy via the binary's `-checkConnectivity` mode.
    ///
    /// `Ok(true)` means TCP and UDP both work, `Ok(false)` means the proxy
    /// is reachable but cannot forward UDP, and an error means TCP itself
    /// failed (connection aborted).
    async fn check_udp(&self, config: &TransportConfig) -> outway_core::Result<bool> {
        let transport = config.to_transport_json()?;
        let probe = ProcessSupervisor::new(self.binary.clone());
        let args = vec![
            "-transport".to_string(),
            transport,
            "-checkConnectivity".to_string(),
        ];
        debug!(host = %config.host, "probing proxy connectivity");
        let stdout = match probe.launch(&args, true).await {
            Ok(stdout) => stdout,
            Err(ProcessError::ExitCode { code, stderr }) => {
                return Err(Error::ForwardingProcess(format!(
                    "connectivity check exited with code {code}: {stderr}"
                )));
            }
            Err(e) => return Err(Error::ForwardingProcess(e.to_string())),
        };
        parse_connectivity_report(&stdout)
    }
}

async fn wait_for_marker(lines: &mut broadcast::Receiver<String>) {
    loop {
        match lines.recv().await {
            Ok(line) if line.contains(READY_MARKER) => return,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "dropped tun2socks output lines");
            }
            // Sender gone: never ready; the exit branch decides.
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

/// First stdout line of a connectivity check, ignoring trailing noise.
#[derive(Debug, Deserialize)]
struct ConnectivityReport {
    /// Present when the proxy was unreachable over TCP; carries the
    /// failure message.
    tcp: Option<String>,
    /// Present when only UDP forwarding is unsupported.
    udp: Option<String>,
}

pub(crate) fn parse_connectivity_report(stdout: &str) -> outway_core::Result<bool> {
    let first = stdout.lines().next().unwrap_or("").trim();
    if first.is_empty() {
        return Err(Error::ForwardingProcess(
            "empty connectivity report".to_string(),
        ));
    }
    let report: ConnectivityReport = serde_json::from_str(first)?;
    if let Some(message) = report.tcp {
        return Err(Error::ServerUnreachable(message));
    }
    if let Some(message) = report.udp {
        debug!(message, "proxy cannot forward UDP");
        return Ok(false);
    }
    Ok(true)
}
