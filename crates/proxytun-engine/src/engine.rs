// ============================================
// File: crates/proxytun-engine/src/engine.rs
// ============================================
//! # Tunnel Engine
//!
//! ## Creation Reason
//! Owns one tunnel run: brings the TUN device up, reads packets into the
//! dispatcher, evicts idle flows, and tears everything down on stop or
//! on a fatal device error.
//!
//! ## Main Functionality
//! - `TunnelEngine::start` / `stop` / `wait_stopped`
//! - Read loop with bounded retry of transient device errors
//! - Idle sweeper sending one RST per evicted TCP flow
//!
//! ## Engine Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TunnelEngine                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌────────────┐   ┌────────────┐   ┌──────────────────┐    │
//! │  │ Read Loop  │   │  Sweeper   │   │ Relay tasks (N)  │    │
//! │  │ TUN → disp │   │ idle → RST │   │ one per flow     │    │
//! │  └─────┬──────┘   └─────┬──────┘   └────────▲─────────┘    │
//! │        │                │                   │ mpsc          │
//! │        ▼                ▼                   │               │
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │        PacketDispatcher  ──►  FlowTable             │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! │                                                             │
//! │  root CancellationToken ──► child token per flow           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Stop Sequence
//! 1. Cancel the run token (read loop, sweeper and relays observe it)
//! 2. Wait up to the grace period for tracked tasks
//! 3. Cancel the abort token for stragglers
//! 4. Drain the flow table, bring the device down
//!
//! ## ⚠️ Important Note for Next Developer
//! - `stop` is idempotent and safe to call from any task
//! - The read loop never awaits `stop`: it spawns it, then exits, because
//!   `stop` waits for the read loop
//!
//! ## Last Modified
//! v0.1.0 - Initial engine

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use proxytun_transport::TunDevice;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::handlers::PacketDispatcher;
use crate::relay::{tcp, RelayContext};
use crate::services::{FlowTable, IdleTimeouts, ProxyConnector};

// ============================================
// Constants
// ============================================

/// Read buffer size; covers any IP packet.
pub const MAX_PACKET_SIZE: usize = 65_535;

/// Consecutive transient read errors tolerated before the device is
/// considered dead.
pub const MAX_TRANSIENT_READ_ERRORS: u32 = 64;

// ============================================
// TunnelEngine
// ============================================

struct RunHandle {
    ctx: Arc<RelayContext>,
    tracker: TaskTracker,
    abort: CancellationToken,
    grace: Duration,
    timeouts: IdleTimeouts,
}

struct EngineShared {
    run: tokio::sync::Mutex<Option<RunHandle>>,
    running: watch::Sender<bool>,
    fatal: Mutex<Option<String>>,
    flows: RwLock<Option<Arc<FlowTable>>>,
}

/// Transparent proxy tunnel engine.
///
/// Cheap to clone; clones control the same engine.
#[derive(Clone)]
pub struct TunnelEngine {
    shared: Arc<EngineShared>,
}

impl TunnelEngine {
    /// Creates a stopped engine.
    #[must_use]
    pub fn new() -> Self {
        let (running, _) = watch::channel(false);
        Self {
            shared: Arc::new(EngineShared {
                run: tokio::sync::Mutex::new(None),
                running,
                fatal: Mutex::new(None),
                flows: RwLock::new(None),
            }),
        }
    }

    /// Starts a run on `device`.
    ///
    /// # Errors
    /// - `ConfigInvalid` if `config` fails validation
    /// - `AlreadyRunning` if a run is active
    /// - `Transport` if the device cannot be brought up
    pub async fn start(&self, config: EngineConfig, device: Arc<dyn TunDevice>) -> Result<()> {
        config.validate()?;

        let mut slot = self.shared.run.lock().await;
        if slot.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        device.up().await?;

        let shutdown = CancellationToken::new();
        let flows = Arc::new(FlowTable::new(config.limits.max_flows, shutdown.clone()));
        let ctx = Arc::new(RelayContext::new(
            device,
            ProxyConnector::new(config.proxy.clone()),
            Arc::clone(&flows),
            shutdown,
        ));

        let tracker = TaskTracker::new();
        let abort = CancellationToken::new();
        let dispatcher = PacketDispatcher::new(Arc::clone(&ctx), tracker.clone(), abort.clone());
        let timeouts = config.limits.idle_timeouts();

        *self.shared.fatal.lock() = None;
        *self.shared.flows.write() = Some(flows);

        tracker.spawn(read_loop(self.clone(), dispatcher));
        tracker.spawn(sweep_loop(Arc::clone(&ctx), timeouts, config.limits.sweep_interval()));

        info!(
            device = ctx.device.name(),
            mtu = ctx.device.mtu(),
            proxy = %config.proxy,
            max_flows = config.limits.max_flows,
            "Tunnel engine started"
        );

        *slot = Some(RunHandle {
            ctx,
            tracker,
            abort,
            grace: config.limits.shutdown_grace(),
            timeouts,
        });
        self.shared.running.send_replace(true);
        Ok(())
    }

    /// Stops the current run. Does nothing when not running.
    ///
    /// # Errors
    /// Currently infallible; device teardown failures are logged.
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.shared.run.lock().await;
        let Some(run) = slot.take() else {
            debug!("Stop requested while not running");
            return Ok(());
        };

        info!(flows = run.ctx.flows.len(), "Stopping tunnel engine");
        run.ctx.shutdown.cancel();
        run.tracker.close();

        if tokio::time::timeout(run.grace, run.tracker.wait()).await.is_err() {
            warn!(
                remaining = run.tracker.len(),
                grace = ?run.grace,
                "Relays still running after grace period, aborting"
            );
            run.abort.cancel();
            run.tracker.wait().await;
        }

        let drained = run.ctx.flows.drain();
        if !drained.is_empty() {
            debug!(count = drained.len(), "Drained remaining flows");
        }

        if let Err(e) = run.ctx.device.down().await {
            warn!(error = %e, device = run.ctx.device.name(), "Failed to bring TUN device down");
        }

        *self.shared.flows.write() = None;
        self.shared.running.send_replace(false);
        info!("Tunnel engine stopped");
        Ok(())
    }

    /// Waits until the engine is not running.
    pub async fn wait_stopped(&self) {
        let mut running = self.shared.running.subscribe();
        while *running.borrow_and_update() {
            if running.changed().await.is_err() {
                return;
            }
        }
    }

    /// Whether a run is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.shared.running.borrow()
    }

    /// Number of live flows (zero when stopped).
    #[must_use]
    pub fn flow_count(&self) -> usize {
        self.shared.flows.read().as_ref().map_or(0, |flows| flows.len())
    }

    /// Flow table of the current run.
    #[must_use]
    pub fn flow_table(&self) -> Option<Arc<FlowTable>> {
        self.shared.flows.read().clone()
    }

    /// The error that stopped the last run, if any.
    #[must_use]
    pub fn fatal_error(&self) -> Option<EngineError> {
        self.shared.fatal.lock().clone().map(EngineError::fatal)
    }

    /// Runs one idle sweep as if the clock read `now`.
    ///
    /// Returns the number of evicted flows; zero when not running.
    pub async fn sweep_idle_at(&self, now: Instant) -> usize {
        let slot = self.shared.run.lock().await;
        match slot.as_ref() {
            Some(run) => reap_idle(&run.ctx, now, &run.timeouts).await,
            None => 0,
        }
    }

    fn record_fatal(&self, reason: String) {
        let mut fatal = self.shared.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(reason);
        }
    }
}

impl Default for TunnelEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TunnelEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelEngine")
            .field("running", &self.is_running())
            .field("flows", &self.flow_count())
            .field("fatal", &*self.shared.fatal.lock())
            .finish()
    }
}

// ============================================
// Tasks
// ============================================

async fn read_loop(engine: TunnelEngine, dispatcher: PacketDispatcher) {
    let ctx = Arc::clone(dispatcher.context());
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let mut transient = 0u32;

    loop {
        let result = tokio::select! {
            biased;
            () = ctx.shutdown.cancelled() => break,
            result = ctx.device.read(&mut buf) => result,
        };

        match result {
            Ok(0) => {}
            Ok(n) => {
                transient = 0;
                dispatcher.dispatch(packet_bytes(&buf[..n]));
            }
            Err(e) if e.is_retryable() && transient < MAX_TRANSIENT_READ_ERRORS => {
                transient += 1;
                debug!(error = %e, attempt = transient, "Transient TUN read error");
                tokio::task::yield_now().await;
            }
            Err(e) => {
                error!(error = %e, transient, "TUN read failed, stopping engine");
                engine.record_fatal(format!("TUN read failed: {e}"));
                tokio::spawn(async move {
                    if let Err(e) = engine.stop().await {
                        error!(error = %e, "Stop after fatal error failed");
                    }
                });
                break;
            }
        }
    }

    let stats = dispatcher.stats();
    debug!(
        forwarded = stats.forwarded.load(std::sync::atomic::Ordering::Relaxed),
        dropped = stats.dropped.load(std::sync::atomic::Ordering::Relaxed),
        "Read loop stopped"
    );
}

/// Copies one read out of the reusable buffer. Queued packets own exactly
/// their bytes, never the whole read buffer.
fn packet_bytes(read: &[u8]) -> Bytes {
    Bytes::copy_from_slice(read)
}

async fn sweep_loop(ctx: Arc<RelayContext>, timeouts: IdleTimeouts, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = ctx.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                reap_idle(&ctx, Instant::now(), &timeouts).await;
            }
        }
    }

    debug!("Idle sweeper stopped");
}

/// Evicts idle flows and answers each evicted TCP originator with one RST.
async fn reap_idle(ctx: &RelayContext, now: Instant, timeouts: &IdleTimeouts) -> usize {
    let evicted = ctx.flows.sweep_idle(now, timeouts);
    for flow in &evicted {
        if flow.key().is_tcp() {
            let reset = tcp::reset_segment(flow);
            ctx.write_packet(flow, &reset, 0).await;
        }
    }
    evicted.len()
}

// ============================================
// Tests
// ============================================
