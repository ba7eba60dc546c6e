//! Clock emitter task and its schedule.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chronicle_types::{now_millis, Block};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::{ClockError, Result};

/// Phase boundary kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PotEvent {
    /// Competition opens; the previous round is decided.
    PotStart,
    /// Competition closes; nodes judge what they have seen.
    PotOver,
}

impl PotEvent {
    fn flip(self) -> Self {
        match self {
            Self::PotStart => Self::PotOver,
            Self::PotOver => Self::PotStart,
        }
    }
}

impl std::fmt::Display for PotEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PotStart => write!(f, "PotStart"),
            Self::PotOver => write!(f, "PotOver"),
        }
    }
}

/// One emitted boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PotTick {
    pub event: PotEvent,
    /// Scheduled boundary time (unix ms). Actual delivery may be later.
    pub boundary_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockMode {
    #[default]
    DriftCorrected,
    FreeRunning,
}

/// Clock configuration.
#[derive(Debug, Clone, Copy)]
pub struct ClockConfig {
    pub tick: Duration,
    pub mode: ClockMode,
}

impl ClockConfig {
    pub fn new(tick: Duration, mode: ClockMode) -> Self {
        Self { tick, mode }
    }

    fn tick_ms(&self) -> u64 {
        (self.tick.as_millis() as u64).max(1)
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            mode: ClockMode::DriftCorrected,
        }
    }
}

#[derive(Debug, Default)]
struct Schedule {
    started: bool,
    next: Option<PotEvent>,
    deadline_ms: u64,
    last_emitted_ms: Option<u64>,
    /// Number of PotStart events emitted so far.
    cycle: u64,
    triggered_cycle: Option<u64>,
}

impl Schedule {
    fn advance(&mut self, emitted: PotEvent, tick_ms: u64) {
        if emitted == PotEvent::PotStart {
            self.cycle += 1;
        }
        self.last_emitted_ms = Some(self.deadline_ms);
        self.next = Some(emitted.flip());
        self.deadline_ms += tick_ms;
    }
}

struct Shared {
    schedule: Mutex<Schedule>,
    /// Wakes the emitter after the schedule moved.
    rescheduled: Notify,
}

impl Shared {
    fn schedule(&self) -> MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Grid origin (a PotOver point) implied by an anchor block.
fn grid_origin(anchor: &Block, tick_ms: u64) -> u64 {
    if anchor.is_genesis() {
        anchor.timestamp_ms
    } else {
        anchor.timestamp_ms.saturating_sub(tick_ms)
    }
}

/// The grid point of kind `event` nearest to `around`.
fn nearest_grid_point(origin: u64, event: PotEvent, around: u64, tick_ms: u64) -> u64 {
    let cycle = 2 * tick_ms as i128;
    let base = match event {
        PotEvent::PotOver => origin as i128,
        PotEvent::PotStart => origin as i128 + tick_ms as i128,
    };
    let offset = around as i128 - base;
    let k = (offset + cycle / 2).div_euclid(cycle);
    (base + k * cycle).max(0) as u64
}

/// Emits alternating phase boundaries into a channel.
///
/// Events reach the single receiver of `events` in emission order.
pub struct Clock {
    config: ClockConfig,
    shared: Arc<Shared>,
    events: mpsc::Sender<PotTick>,
    shutdown: watch::Receiver<bool>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Clock {
    /// Create a stopped clock.
    ///
    /// The emitter also exits when `shutdown` turns true.
    pub fn new(
        config: ClockConfig,
        events: mpsc::Sender<PotTick>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            config,
            shared: Arc::new(Shared {
                schedule: Mutex::new(Schedule::default()),
                rescheduled: Notify::new(),
            }),
            events,
            shutdown,
            stop,
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.schedule().started && !*self.stop.borrow()
    }

    /// Start emitting on the grid anchored at `anchor`.
    ///
    /// If the next boundary is less than one tick away, `PotOver` fires
    /// immediately and `PotStart` follows one tick later. Otherwise the
    /// first event is `PotStart` at its grid point.
    pub fn start(&self, anchor: &Block) -> Result<()> {
        let tick_ms = self.config.tick_ms();
        let now = now_millis();
        {
            let mut schedule = self.shared.schedule();
            if schedule.started {
                return Err(ClockError::AlreadyStarted);
            }
            let origin = grid_origin(anchor, tick_ms);
            let elapsed = now.saturating_sub(origin) % (2 * tick_ms);
            if elapsed > tick_ms {
                schedule.next = Some(PotEvent::PotOver);
                schedule.deadline_ms = now;
            } else {
                schedule.next = Some(PotEvent::PotStart);
                schedule.deadline_ms = now + (tick_ms - elapsed);
            }
            schedule.started = true;
            info!(
                anchor_height = anchor.height,
                first = ?schedule.next,
                in_ms = schedule.deadline_ms.saturating_sub(now),
                "Clock started"
            );
        }

        let handle = tokio::spawn(emit_loop(
            Arc::clone(&self.shared),
            self.events.clone(),
            self.stop.subscribe(),
            self.shutdown.clone(),
            tick_ms,
        ));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Re-anchor drift from a newly decided block.
    ///
    /// Returns `Ok(true)` if the schedule was re-aligned, `Ok(false)` if the
    /// clock is free-running or already re-anchored during this cycle.
    pub fn trigger(&self, anchor: &Block) -> Result<bool> {
        let now = now_millis();
        if anchor.timestamp_ms > now {
            return Err(ClockError::FutureAnchor {
                anchor_ms: anchor.timestamp_ms,
                now_ms: now,
            });
        }

        let tick_ms = self.config.tick_ms();
        let mut schedule = self.shared.schedule();
        if !schedule.started {
            return Err(ClockError::NotStarted);
        }
        if self.config.mode == ClockMode::FreeRunning {
            return Ok(false);
        }
        if schedule.triggered_cycle == Some(schedule.cycle) {
            trace!(cycle = schedule.cycle, "Clock already re-anchored this cycle");
            return Ok(false);
        }
        let Some(next) = schedule.next else {
            return Err(ClockError::NotStarted);
        };

        let origin = grid_origin(anchor, tick_ms);
        let mut target = nearest_grid_point(origin, next, schedule.deadline_ms, tick_ms);
        // Never squeeze two boundaries closer than half a tick.
        if let Some(last) = schedule.last_emitted_ms {
            target = target.max(last + tick_ms / 2);
        }

        schedule.triggered_cycle = Some(schedule.cycle);
        if target != schedule.deadline_ms {
            debug!(
                anchor_height = anchor.height,
                shift_ms = target as i128 - schedule.deadline_ms as i128,
                "Clock re-anchored"
            );
            schedule.deadline_ms = target;
            drop(schedule);
            self.shared.rescheduled.notify_one();
        }
        Ok(true)
    }

    /// Stop emission and wait for the emitter task to finish.
    pub async fn close(&self) {
        self.stop.send_replace(true);
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        debug!("Clock closed");
    }
}

async fn emit_loop(
    shared: Arc<Shared>,
    events: mpsc::Sender<PotTick>,
    mut stop: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
    tick_ms: u64,
) {
    loop {
        if *stop.borrow() || *shutdown.borrow() {
            break;
        }
        let (next, deadline) = {
            let schedule = shared.schedule();
            match schedule.next {
                Some(next) => (next, schedule.deadline_ms),
                None => break,
            }
        };

        let wait = deadline.saturating_sub(now_millis());
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(wait)) => {}
            _ = shared.rescheduled.notified() => continue,
            _ = stop.changed() => break,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }
        if now_millis() < deadline {
            continue;
        }

        let tick = {
            let mut schedule = shared.schedule();
            // Moved by a trigger between wake-up and here.
            if schedule.next != Some(next) || schedule.deadline_ms != deadline {
                continue;
            }
            schedule.advance(next, tick_ms);
            PotTick {
                event: next,
                boundary_ms: deadline,
            }
        };

        trace!(event = %tick.event, boundary_ms = tick.boundary_ms, "Clock boundary");
        if events.send(tick).await.is_err() {
            debug!("Clock receiver dropped");
            break;
        }
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.stop.send_replace(true);
        if let Some(handle) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_types::NodeId;

    const TICK_MS: u64 = 40;

    fn setup(mode: ClockMode) -> (Clock, mpsc::Receiver<PotTick>, watch::Sender<bool>) {
        let (tx, rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let clock = Clock::new(
            ClockConfig::new(Duration::from_millis(TICK_MS), mode),
            tx,
            shutdown_rx,
        );
        (clock, rx, shutdown_tx)
    }

    async fn next(rx: &mut mpsc::Receiver<PotTick>) -> PotTick {
        tokio::time::timeout(Duration::from_millis(TICK_MS * 4), rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn free_running_alternates_for_ten_cycles() {
        let (clock, mut rx, _shutdown) = setup(ClockMode::FreeRunning);
        let genesis = Block::genesis(NodeId::derive(b"seed"), now_millis());
        clock.start(&genesis).unwrap();

        let mut ticks = Vec::new();
        let mut arrivals = Vec::new();
        for _ in 0..20 {
            ticks.push(next(&mut rx).await);
            arrivals.push(now_millis());
        }
        clock.close().await;

        assert_eq!(ticks[0].event, PotEvent::PotStart);
        for pair in ticks.windows(2) {
            assert_ne!(pair[0].event, pair[1].event, "events must alternate");
            assert_eq!(pair[1].boundary_ms - pair[0].boundary_ms, TICK_MS);
        }
        for pair in arrivals.windows(2) {
            let gap = pair[1].saturating_sub(pair[0]);
            assert!(gap <= 2 * TICK_MS, "gap {gap}ms exceeds one tick of slack");
        }
    }

    #[tokio::test]
    async fn late_start_fires_pot_over_first() {
        let (clock, mut rx, _shutdown) = setup(ClockMode::FreeRunning);
        // 1.5 ticks into the cycle: the next boundary is half a tick away.
        let genesis = Block::genesis(NodeId::derive(b"seed"), now_millis() - TICK_MS * 3 / 2);
        clock.start(&genesis).unwrap();

        let first = next(&mut rx).await;
        let second = next(&mut rx).await;
        clock.close().await;

        assert_eq!(first.event, PotEvent::PotOver);
        assert_eq!(second.event, PotEvent::PotStart);
        assert_eq!(second.boundary_ms - first.boundary_ms, TICK_MS);
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let (clock, _rx, _shutdown) = setup(ClockMode::FreeRunning);
        let genesis = Block::genesis(NodeId::derive(b"seed"), now_millis());
        clock.start(&genesis).unwrap();
        assert_eq!(clock.start(&genesis), Err(ClockError::AlreadyStarted));
        clock.close().await;
    }

    #[tokio::test]
    async fn trigger_rejects_future_anchor() {
        let (clock, _rx, _shutdown) = setup(ClockMode::DriftCorrected);
        let genesis = Block::genesis(NodeId::derive(b"seed"), now_millis());
        clock.start(&genesis).unwrap();

        let future = genesis.child(NodeId::derive(b"peer"), now_millis() + 60_000, vec![]);
        assert!(matches!(
            clock.trigger(&future),
            Err(ClockError::FutureAnchor { .. })
        ));
        clock.close().await;
    }

    #[tokio::test]
    async fn trigger_before_start_fails() {
        let (clock, _rx, _shutdown) = setup(ClockMode::DriftCorrected);
        let genesis = Block::genesis(NodeId::derive(b"seed"), now_millis());
        assert_eq!(clock.trigger(&genesis), Err(ClockError::NotStarted));
    }

    #[tokio::test]
    async fn trigger_applies_once_per_cycle() {
        let (clock, mut rx, _shutdown) = setup(ClockMode::DriftCorrected);
        let genesis = Block::genesis(NodeId::derive(b"seed"), now_millis());
        clock.start(&genesis).unwrap();

        let start = next(&mut rx).await;
        assert_eq!(start.event, PotEvent::PotStart);

        let block = genesis.child(NodeId::derive(b"peer"), start.boundary_ms, vec![]);
        assert_eq!(clock.trigger(&block), Ok(true));
        assert_eq!(clock.trigger(&block), Ok(false));

        // Same grid: the schedule does not move.
        let over = next(&mut rx).await;
        assert_eq!(over.event, PotEvent::PotOver);
        assert_eq!(over.boundary_ms, start.boundary_ms + TICK_MS);
        clock.close().await;
    }

    #[tokio::test]
    async fn free_running_trigger_is_noop() {
        let (clock, _rx, _shutdown) = setup(ClockMode::FreeRunning);
        let genesis = Block::genesis(NodeId::derive(b"seed"), now_millis());
        clock.start(&genesis).unwrap();
        assert_eq!(clock.trigger(&genesis), Ok(false));
        clock.close().await;
    }

    #[tokio::test]
    async fn shutdown_stops_emission() {
        let (clock, mut rx, shutdown) = setup(ClockMode::FreeRunning);
        let genesis = Block::genesis(NodeId::derive(b"seed"), now_millis());
        clock.start(&genesis).unwrap();
        let _ = next(&mut rx).await;

        shutdown.send_replace(true);
        clock.close().await;
        while rx.try_recv().is_ok() {}
        let late = tokio::time::timeout(Duration::from_millis(TICK_MS * 3), rx.recv()).await;
        assert!(!matches!(late, Ok(Some(_))), "no events after shutdown");
    }

    #[test]
    fn nearest_grid_point_snaps_to_kind() {
        // origin 1000, tick 100: PotOver at 1000 + 200k, PotStart at 1100 + 200k
        assert_eq!(nearest_grid_point(1000, PotEvent::PotOver, 1390, 100), 1400);
        assert_eq!(nearest_grid_point(1000, PotEvent::PotStart, 1390, 100), 1300);
        assert_eq!(nearest_grid_point(1000, PotEvent::PotStart, 1420, 100), 1500);
    }

    #[test]
    fn produced_block_shares_genesis_grid() {
        let genesis = Block::genesis(NodeId::derive(b"seed"), 10_000);
        let block = genesis.child(NodeId::derive(b"peer"), 10_000 + 100 + 4 * 100, vec![]);
        assert_eq!(
            (grid_origin(&genesis, 100) % 200),
            (grid_origin(&block, 100) % 200)
        );
    }
}
