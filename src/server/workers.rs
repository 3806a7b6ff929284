//! The worker pool: spawn, supervise and balance backend worker processes.
//!
//! Every slot is one child process serving tile generation over loopback
//! HTTP. Supervision is an explicit state machine (Starting, Ready,
//! Draining, Exited) with readiness probes and crash respawn under backoff;
//! no signal semantics are relied on beyond kill.

use std::{
    collections::HashMap,
    env,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tokio::{process::Child, process::Command, task::JoinHandle, time::Instant};
use tracing::{debug, error, info, warn};

use crate::{
    config::{Config, WorkerRuntime},
    generate::{GenerateError, GenerateOutcome, TileGenerator},
    tile::TileCoord,
};

/// A slot that has not probed ready within this window is respawned.
const STARTUP_WINDOW: Duration = Duration::from_secs(60);
/// Supervisor pass interval.
const SUPERVISE_INTERVAL: Duration = Duration::from_secs(1);
/// Poll interval while draining a slot during rolling reload.
const DRAIN_POLL: Duration = Duration::from_secs(2);
/// Grace period before terminate_all falls back to kill.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Starting,
    Ready,
    Draining,
    Exited,
}

struct Slot {
    port: u16,
    state: SlotState,
    generation: u64,
    in_flight: Arc<AtomicUsize>,
    child: Option<Child>,
    started_at: Instant,
    spawn_attempts: u32,
    respawn_after: Instant,
}

impl Slot {
    fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }
}

/// Snapshot of one slot for the maintenance surface.
#[derive(Debug, Clone, Serialize)]
pub struct SlotInfo {
    pub pid: Option<u32>,
    pub port: u16,
    pub state: SlotState,
    pub in_flight: usize,
    pub generation: u64,
}

pub struct WorkerPool {
    config: &'static Config,
    client: Client,
    slots: Mutex<Vec<Slot>>,
    reloading: AtomicBool,
    round_robin: AtomicUsize,
}

/// Decrements a slot's in-flight count when the request settles.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Pick the least-loaded candidate, breaking ties round-robin.
/// Candidates are `(index, load)` pairs.
fn pick_slot(candidates: &[(usize, usize)], round_robin: usize) -> Option<usize> {
    let min_load = candidates.iter().map(|(_, load)| *load).min()?;
    let tied: Vec<usize> = candidates
        .iter()
        .filter(|(_, load)| *load == min_load)
        .map(|(index, _)| *index)
        .collect();
    Some(tied[round_robin % tied.len()])
}

/// First port of the range not yet taken by a slot.
fn free_port(range: &crate::config::PortRange, used: &[u16]) -> Option<u16> {
    (range.from..=range.to).find(|port| !used.contains(port))
}

/// Environment handed to every worker child process.
fn worker_env() -> HashMap<&'static str, String> {
    let mut vars = HashMap::new();
    for name in [
        "DBHOST", "DBPORT", "DBNAME", "DBUSER", "DBPASS", "GDAL_HOME", "PROJ_LIB",
    ] {
        if let Ok(value) = env::var(name) {
            vars.insert(name, value);
        }
    }
    vars
}

fn spawn_worker(config: &Config, port: u16) -> std::io::Result<Child> {
    let vars = worker_env();
    match config.worker_runtime {
        WorkerRuntime::Robyn => Command::new("python")
            .envs(vars)
            .arg("app_robyn.py")
            .arg(format!("--log-level={}", config.log_level.as_filter()))
            .arg(format!("--workers={}", config.thread_workers))
            .arg("--processes=1")
            .arg(format!("--port={port}"))
            .kill_on_drop(true)
            .spawn(),
        WorkerRuntime::Granian => Command::new("granian")
            .envs(vars)
            .arg("app_granian:app")
            .arg("--interface=asgi")
            .arg("--workers=1")
            .arg(format!("--runtime-threads={}", config.thread_workers))
            .arg(format!("--blocking-threads={}", config.blocking_threads))
            .arg(format!("--port={port}"))
            .kill_on_drop(true)
            .spawn(),
    }
}

impl WorkerPool {
    pub fn new(config: &'static Config, client: Client) -> Arc<Self> {
        Arc::new(Self {
            config,
            client,
            slots: Mutex::new(Vec::new()),
            reloading: AtomicBool::new(false),
            round_robin: AtomicUsize::new(0),
        })
    }

    /// Spawn the initial `processes_workers` slots. Readiness is established
    /// by the supervisor task.
    pub fn start(&self) {
        let count = self.config.processes_workers;
        info!("Spawning {count} worker processes");
        self.add_workers(count as usize);
    }

    pub fn add_workers(&self, count: usize) {
        let mut slots = self.slots.lock().unwrap();
        for _ in 0..count {
            let used: Vec<u16> = slots.iter().map(|s| s.port).collect();
            let Some(port) = free_port(&self.config.worker_ports, &used) else {
                warn!("No free worker port left in the configured range");
                return;
            };
            match spawn_worker(self.config, port) {
                Ok(child) => {
                    debug!("Spawned worker on port {port} (pid {:?})", child.id());
                    slots.push(Slot {
                        port,
                        state: SlotState::Starting,
                        generation: 0,
                        in_flight: Arc::new(AtomicUsize::new(0)),
                        child: Some(child),
                        started_at: Instant::now(),
                        spawn_attempts: 0,
                        respawn_after: Instant::now(),
                    });
                }
                Err(e) => error!("Failed to spawn worker on port {port}: {e}"),
            }
        }
    }

    pub fn info(&self) -> Vec<SlotInfo> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .map(|slot| SlotInfo {
                pid: slot.pid(),
                port: slot.port,
                state: slot.state,
                in_flight: slot.in_flight.load(Ordering::SeqCst),
                generation: slot.generation,
            })
            .collect()
    }

    pub fn ready_count(&self) -> usize {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.state == SlotState::Ready)
            .count()
    }

    /// Stop every slot: drain briefly, then kill whatever is left.
    pub async fn terminate_all(&self) {
        info!("Terminating all workers");
        {
            let mut slots = self.slots.lock().unwrap();
            for slot in slots.iter_mut() {
                slot.state = SlotState::Draining;
            }
        }

        let deadline = Instant::now() + TERMINATE_GRACE;
        loop {
            let in_flight: usize = {
                let slots = self.slots.lock().unwrap();
                slots
                    .iter()
                    .map(|s| s.in_flight.load(Ordering::SeqCst))
                    .sum()
            };
            if in_flight == 0 || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let children: Vec<Child> = {
            let mut slots = self.slots.lock().unwrap();
            slots
                .iter_mut()
                .filter_map(|slot| {
                    slot.state = SlotState::Exited;
                    slot.child.take()
                })
                .collect()
        };
        for mut child in children {
            if let Err(e) = child.kill().await {
                warn!("Error killing worker: {e}");
            }
        }
        self.slots.lock().unwrap().clear();
    }

    /// Roll every slot: drain, replace, wait ready, one slot at a time.
    /// Returns false when a reload is already in progress (rejected, not
    /// coalesced).
    pub async fn reload_all(&self) -> bool {
        if self.reloading.swap(true, Ordering::SeqCst) {
            warn!("Reload requested while a reload is in progress; rejected");
            return false;
        }
        info!("Rolling reload of all workers");

        let count = self.slots.lock().unwrap().len();
        let drain_budget = Duration::from_secs(
            60 * self.config.reload_repeat_minutes * self.config.reload_repeat_attempts,
        );

        for index in 0..count {
            let Some((port, in_flight)) = ({
                let mut slots = self.slots.lock().unwrap();
                slots.get_mut(index).map(|slot| {
                    slot.state = SlotState::Draining;
                    (slot.port, slot.in_flight.clone())
                })
            }) else {
                continue;
            };

            let deadline = Instant::now() + drain_budget;
            let mut drained = true;
            while in_flight.load(Ordering::SeqCst) > 0 {
                if Instant::now() >= deadline {
                    drained = false;
                    break;
                }
                tokio::time::sleep(DRAIN_POLL).await;
            }

            if !drained {
                error!("Worker on port {port} did not drain in time; its reload is aborted");
                let mut slots = self.slots.lock().unwrap();
                if let Some(slot) = slots.get_mut(index) {
                    slot.state = SlotState::Ready;
                }
                continue;
            }

            let old_child = {
                let mut slots = self.slots.lock().unwrap();
                slots.get_mut(index).and_then(|slot| {
                    slot.state = SlotState::Exited;
                    slot.child.take()
                })
            };
            if let Some(mut child) = old_child {
                if let Err(e) = child.kill().await {
                    warn!("Error killing worker on port {port}: {e}");
                }
            }

            match spawn_worker(self.config, port) {
                Ok(child) => {
                    let mut slots = self.slots.lock().unwrap();
                    if let Some(slot) = slots.get_mut(index) {
                        debug!("Respawned worker on port {port} (pid {:?})", child.id());
                        slot.child = Some(child);
                        slot.state = SlotState::Starting;
                        slot.generation += 1;
                        slot.started_at = Instant::now();
                        slot.spawn_attempts = 0;
                    }
                }
                Err(e) => {
                    error!("Failed to respawn worker on port {port}: {e}");
                    continue;
                }
            }

            // Wait for the replacement before touching the next slot so the
            // pool never loses more than one worker of capacity.
            let ready_deadline = Instant::now() + STARTUP_WINDOW;
            loop {
                let state = self
                    .slots
                    .lock()
                    .unwrap()
                    .get(index)
                    .map(|slot| slot.state);
                match state {
                    Some(SlotState::Ready) | None => break,
                    _ if Instant::now() >= ready_deadline => {
                        warn!("Replacement worker on port {port} is slow to become ready");
                        break;
                    }
                    _ => tokio::time::sleep(Duration::from_millis(500)).await,
                }
            }
        }

        self.reloading.store(false, Ordering::SeqCst);
        info!("Rolling reload finished");
        true
    }

    /// Run the supervisor: probe Starting slots for readiness, respawn
    /// crashed or stuck children under backoff.
    pub fn supervise(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.supervise_pass().await;
                tokio::time::sleep(SUPERVISE_INTERVAL).await;
            }
        })
    }

    async fn supervise_pass(&self) {
        // Snapshot outside the probe round trips; the generation check below
        // discards stale observations.
        let snapshot: Vec<(usize, u16, u64, SlotState)> = {
            let mut slots = self.slots.lock().unwrap();
            for slot in slots.iter_mut() {
                let exited = slot
                    .child
                    .as_mut()
                    .map(|child| matches!(child.try_wait(), Ok(Some(_))))
                    .unwrap_or(false);
                if exited && slot.state != SlotState::Exited {
                    error!("Worker on port {} exited unexpectedly", slot.port);
                    slot.state = SlotState::Exited;
                    slot.child = None;
                    let backoff = Duration::from_secs(1u64 << slot.spawn_attempts.min(6));
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
                    slot.respawn_after = Instant::now() + backoff + jitter;
                    slot.spawn_attempts += 1;
                }
            }
            slots
                .iter()
                .map(|slot| (slot.port, slot.generation, slot.state))
                .enumerate()
                .map(|(index, (port, generation, state))| (index, port, generation, state))
                .collect()
        };

        for (index, port, generation, state) in snapshot {
            match state {
                SlotState::Starting => self.probe_slot(index, port, generation).await,
                SlotState::Exited => self.try_respawn(index, port),
                SlotState::Ready | SlotState::Draining => {}
            }
        }
    }

    async fn probe_slot(&self, index: usize, port: u16, generation: u64) {
        let url = format!("http://127.0.0.1:{port}/health");
        let healthy = match self
            .client
            .get(url)
            .timeout(Duration::from_millis(900))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        };

        let mut slots = self.slots.lock().unwrap();
        let Some(slot) = slots.get_mut(index) else {
            return;
        };
        if slot.generation != generation || slot.state != SlotState::Starting {
            return;
        }
        if healthy {
            info!("Worker on port {port} is ready (generation {generation})");
            slot.state = SlotState::Ready;
            slot.spawn_attempts = 0;
        } else if slot.started_at.elapsed() > STARTUP_WINDOW {
            warn!("Worker on port {port} missed its startup window; respawning");
            slot.state = SlotState::Exited;
            slot.child = None;
            let backoff = Duration::from_secs(1u64 << slot.spawn_attempts.min(6));
            slot.respawn_after = Instant::now() + backoff;
            slot.spawn_attempts += 1;
        }
    }

    fn try_respawn(&self, index: usize, port: u16) {
        let mut slots = self.slots.lock().unwrap();
        let Some(slot) = slots.get_mut(index) else {
            return;
        };
        if slot.state != SlotState::Exited || Instant::now() < slot.respawn_after {
            return;
        }
        match spawn_worker(self.config, port) {
            Ok(child) => {
                debug!("Respawned worker on port {port} (pid {:?})", child.id());
                slot.child = Some(child);
                slot.state = SlotState::Starting;
                slot.started_at = Instant::now();
            }
            Err(e) => {
                error!("Failed to respawn worker on port {port}: {e}");
                slot.respawn_after = Instant::now() + Duration::from_secs(5);
            }
        }
    }

    /// Forward a pyramid build to one worker. All pyramid work goes through a
    /// single worker so only one process controls the build's fan-out.
    pub async fn pyramid(&self, datasource_id: &str) -> Result<(), GenerateError> {
        let Some((port, in_flight)) = self.pick_ready() else {
            return Err(GenerateError::Unavailable);
        };
        let _guard = InFlightGuard::acquire(&in_flight);
        let url = format!("http://127.0.0.1:{port}/api/pyramid");
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "datasource_id": datasource_id }))
            .send()
            .await
            .map_err(|e| GenerateError::Transport(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(GenerateError::Backend(format!(
                "worker answered {}",
                response.status()
            )))
        }
    }

    fn pick_ready(&self) -> Option<(u16, Arc<AtomicUsize>)> {
        let slots = self.slots.lock().unwrap();
        let candidates: Vec<(usize, usize)> = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state == SlotState::Ready)
            .map(|(index, slot)| (index, slot.in_flight.load(Ordering::SeqCst)))
            .collect();
        let round_robin = self.round_robin.fetch_add(1, Ordering::SeqCst);
        let index = pick_slot(&candidates, round_robin)?;
        let slot = &slots[index];
        Some((slot.port, slot.in_flight.clone()))
    }
}

#[async_trait]
impl TileGenerator for WorkerPool {
    async fn generate(&self, coord: &TileCoord) -> Result<GenerateOutcome, GenerateError> {
        let Some((port, in_flight)) = self.pick_ready() else {
            return Err(GenerateError::Unavailable);
        };
        let _guard = InFlightGuard::acquire(&in_flight);

        let url = format!("http://127.0.0.1:{port}{}", coord.uri_path());
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(self.config.timeout_worker_response))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GenerateError::Timeout
                } else {
                    GenerateError::Transport(e.to_string())
                }
            })?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(GenerateOutcome::Empty),
            status if status.is_success() => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| GenerateError::Transport(e.to_string()))?;
                if bytes.is_empty() {
                    Ok(GenerateOutcome::Empty)
                } else {
                    Ok(GenerateOutcome::Present(bytes))
                }
            }
            status => Err(GenerateError::Backend(format!("worker answered {status}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;

    #[test]
    fn least_in_flight_wins() {
        let candidates = vec![(0, 3), (1, 1), (2, 2)];
        assert_eq!(pick_slot(&candidates, 0), Some(1));
        assert_eq!(pick_slot(&candidates, 17), Some(1));
    }

    #[test]
    fn ties_break_round_robin() {
        let candidates = vec![(0, 1), (1, 1), (2, 5)];
        assert_eq!(pick_slot(&candidates, 0), Some(0));
        assert_eq!(pick_slot(&candidates, 1), Some(1));
        assert_eq!(pick_slot(&candidates, 2), Some(0));
    }

    #[test]
    fn no_candidates_means_no_slot() {
        assert_eq!(pick_slot(&[], 0), None);
    }

    #[test]
    fn free_port_skips_used_ports() {
        let range = PortRange {
            from: 8100,
            to: 8102,
        };
        assert_eq!(free_port(&range, &[]), Some(8100));
        assert_eq!(free_port(&range, &[8100]), Some(8101));
        assert_eq!(free_port(&range, &[8100, 8101, 8102]), None);
    }

    #[test]
    fn in_flight_guard_balances() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let _a = InFlightGuard::acquire(&counter);
            let _b = InFlightGuard::acquire(&counter);
            assert_eq!(counter.load(Ordering::SeqCst), 2);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn slot_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&SlotState::Draining).unwrap(),
            "\"draining\""
        );
    }
}
