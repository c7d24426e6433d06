use crossbeam::channel::{unbounded, Sender};
use dashmap::DashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fanout_types::{Payload, RequestId, ServiceId, WorkResult};

use crate::config::Config;
use crate::registry::Registry;
use crate::services::SharedService;
use crate::subsystems::gc::{self, GcEvent};
use crate::subsystems::pool::{panic_message, Pool};
use crate::subsystems::supervisor;

pub const STOPPED_TIMEOUTS_MESSAGE: &str = "Service stopped due to too many timeouts.";
pub const STOPPED_STARTUP_MESSAGE: &str = "Service stopped due to startup timeout.";

/// The engine-level tuning knobs, split out of [`Config`] so tests can
/// run the supervision machinery on millisecond cadences that the
/// user-facing config validation would refuse.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub terminator_idle_cycle: Duration,
    pub th_proc_response_time: Duration,
    pub max_service_run_time: Duration,
    pub service_start_timeout: Duration,
    pub service_shutdown_timeout: Duration,
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            terminator_idle_cycle: config.terminator_idle_cycle(),
            th_proc_response_time: config.th_proc_response_time(),
            max_service_run_time: config.max_service_run_time(),
            service_start_timeout: config.service_start_timeout(),
            service_shutdown_timeout: config.service_shutdown_timeout(),
        }
    }
}

/// Bookkeeping for one in-flight request.
pub struct PendingEntry {
    pub payload: Payload,
    pub submitted_at: Instant,
}

/// Per-service map of request id to the original payload. The dispatcher
/// inserts on submission, the garbage collector removes on completion or
/// after `max_service_run_time`, and the supervisor reads it to recover
/// work from retired workers.
pub type Ledger = DashMap<u32, PendingEntry>;

/// Owns one worker pool per service plus the supervisor and garbage
/// collector threads. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Engine {
    pools: Arc<Vec<Pool>>,
    ledgers: Arc<Vec<Ledger>>,
    counter: Arc<AtomicU32>,
    running: Arc<AtomicBool>,
    helpers_running: Arc<AtomicBool>,
    gc_tx: Sender<GcEvent>,
    pub settings: EngineSettings,
}

impl Engine {
    /// Builds the pools and launches the supervisor and garbage
    /// collector. Services are not started; call [`Engine::start_services`].
    pub fn new(registry: &Registry, settings: EngineSettings) -> Self {
        let (gc_tx, gc_rx) = unbounded();

        let pools: Vec<Pool> = registry
            .iter()
            .map(|registered| {
                Pool::new(
                    registered.descriptor.clone(),
                    registered.service.clone(),
                    gc_tx.clone(),
                )
            })
            .collect();
        let ledgers: Vec<Ledger> = registry.iter().map(|_| Ledger::new()).collect();

        let engine = Self {
            pools: Arc::new(pools),
            ledgers: Arc::new(ledgers),
            counter: Arc::new(AtomicU32::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            helpers_running: Arc::new(AtomicBool::new(true)),
            gc_tx,
            settings,
        };

        std::thread::Builder::new()
            .name("gc".to_string())
            .spawn({
                let engine = engine.clone();
                move || gc::run(engine, gc_rx)
            })
            .expect("failed to spawn garbage collector thread");

        std::thread::Builder::new()
            .name("terminator".to_string())
            .spawn({
                let engine = engine.clone();
                move || supervisor::run(engine)
            })
            .expect("failed to spawn terminator thread");

        engine
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn helpers_running(&self) -> bool {
        self.helpers_running.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub(crate) fn pool(&self, id: ServiceId) -> &Pool {
        &self.pools[id.index()]
    }

    pub(crate) fn pools(&self) -> &[Pool] {
        &self.pools
    }

    pub(crate) fn ledger(&self, id: ServiceId) -> &Ledger {
        &self.ledgers[id.index()]
    }

    /// Start every service: raise the pool flags, spawn workers, run the
    /// `start` hooks. Idempotent; returns false when already running.
    pub fn start_services(&self) -> bool {
        if self.running() {
            return false;
        }
        tracing::debug!("Engine: starting services");

        for pool in self.pools.iter() {
            pool.set_running(true);
            pool.spawn_workers();

            if !run_hook(
                pool.service.clone(),
                Hook::Start,
                self.settings.service_start_timeout,
                &pool.descriptor.name,
            ) {
                tracing::error!(
                    "Engine: service: {} startup failed. Service will not run.",
                    pool.descriptor.name
                );
                self.stop_service(pool.descriptor.id, true, STOPPED_STARTUP_MESSAGE);
            }
        }
        self.running.store(true, Ordering::SeqCst);

        let running: Vec<&str> = self
            .pools
            .iter()
            .filter(|pool| pool.running())
            .map(|pool| pool.descriptor.name.as_str())
            .collect();
        tracing::info!("Engine: running services ({}): {:?}", running.len(), running);
        true
    }

    /// Stop every service. Idempotent; returns false when already stopped.
    pub fn stop_services(&self) -> bool {
        if !self.running() {
            return false;
        }
        tracing::debug!("Engine: stopping services");
        self.running.store(false, Ordering::SeqCst);

        for pool in self.pools.iter() {
            self.stop_service(pool.descriptor.id, false, "");
        }
        tracing::info!("Engine: services stopped");
        true
    }

    pub fn restart_services(&self) -> bool {
        self.stop_services();
        self.start_services();
        true
    }

    /// Final teardown: stop services and retire the helper threads. The
    /// engine cannot be started again afterwards.
    pub fn shutdown(&self) {
        self.stop_services();
        self.helpers_running.store(false, Ordering::SeqCst);
        // unblock the collector so it notices the lowered flag
        let _ = self.gc_tx.send(GcEvent::Wake);
        tracing::debug!("Engine: shutdown complete");
    }

    /// Cooperative stop of one service, then retirement of whatever did
    /// not react in time. Recovered in-flight requests go back onto the
    /// input queue under their original ids; when `start_dummy` is set,
    /// dummy workers take over the queues with the canned `message`.
    pub(crate) fn stop_service(&self, id: ServiceId, start_dummy: bool, message: &str) {
        let pool = self.pool(id);
        pool.set_running(false);
        pool.send_sentinels(pool.descriptor.workers() as usize + 1);

        // grace window for workers to see the flag and exit
        std::thread::sleep(self.settings.th_proc_response_time);
        let recovered = pool.retire_all();

        if !run_hook(
            pool.service.clone(),
            Hook::Shutdown,
            self.settings.service_shutdown_timeout,
            &pool.descriptor.name,
        ) {
            tracing::error!("Engine: service: {} shutdown failed", pool.descriptor.name);
        }

        if !recovered.is_empty() {
            tracing::debug!(
                "Engine: service: {}, recovered request ids: {:?}",
                pool.descriptor.name,
                recovered
            );
        }
        for raw in recovered {
            self.resubmit(id, raw);
        }

        if start_dummy {
            pool.start_dummies(message, self.running.clone());
        }
    }

    /// Re-enqueues a recovered request under its original id.
    pub(crate) fn resubmit(&self, id: ServiceId, raw: u32) {
        let Some(request_id) = RequestId::new(raw) else {
            return;
        };
        match self.ledger(id).get(&raw) {
            Some(entry) => {
                tracing::debug!("Engine: rerunning request_id: {} of service: {}", raw, id);
                self.pool(id).submit(request_id, entry.payload.clone());
            }
            None => {
                tracing::error!(
                    "Engine: request_id: {} of service: {} is lost, no pending entry to recover",
                    raw,
                    id
                );
            }
        }
    }

    /// Wrapping non-zero request id counter, shared by all services.
    pub fn next_request_id(&self) -> RequestId {
        let previous = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(if current == u32::MAX { 1 } else { current + 1 })
            })
            .expect("fetch_update closure never returns None");
        let raw = if previous == u32::MAX { 1 } else { previous + 1 };
        RequestId::new(raw).expect("request ids are never zero")
    }

    /// Assigns an id, records the pending entry and enqueues the work.
    /// Empty batch payloads are not submitted at all.
    pub fn submit(&self, id: ServiceId, payload: Payload) -> Option<RequestId> {
        if payload.is_empty() {
            return None;
        }
        let request_id = self.next_request_id();
        self.ledger(id).insert(
            request_id.raw(),
            PendingEntry {
                payload: payload.clone(),
                submitted_at: Instant::now(),
            },
        );
        self.pool(id).submit(request_id, payload);
        tracing::debug!(
            "Engine: running service: {} with request_id: {}",
            self.pool(id).descriptor.name,
            request_id
        );
        Some(request_id)
    }

    pub fn is_pending(&self, id: ServiceId, request_id: RequestId) -> bool {
        self.ledger(id).contains_key(&request_id.raw())
    }

    pub fn pending_len(&self, id: ServiceId) -> usize {
        self.ledger(id).len()
    }

    /// Blocking receive from the service output channel with a timeout.
    pub fn recv_result(&self, id: ServiceId, timeout: Duration) -> Option<WorkResult> {
        self.pool(id).output().recv_timeout(timeout).ok()
    }

    pub fn gc_done(&self, id: ServiceId, request_id: RequestId) {
        let _ = self.gc_tx.send(GcEvent::Done(id, request_id));
    }

    pub fn input_len(&self, id: ServiceId) -> usize {
        self.pool(id).input_len()
    }

    pub fn output_len(&self, id: ServiceId) -> usize {
        self.pool(id).output_len()
    }

    pub fn service_running(&self, id: ServiceId) -> bool {
        self.pool(id).running()
    }

    pub fn running_flags(&self) -> Vec<bool> {
        self.pools.iter().map(|pool| pool.running()).collect()
    }
}

enum Hook {
    Start,
    Shutdown,
}

/// Runs a lifecycle hook on a helper thread with a deadline, so a
/// misbehaving plugin cannot wedge the engine. A hook that misses its
/// deadline is abandoned, not awaited.
fn run_hook(service: SharedService, hook: Hook, timeout: Duration, name: &str) -> bool {
    let (tx, rx) = crossbeam::channel::bounded(1);
    let label = match hook {
        Hook::Start => "start",
        Hook::Shutdown => "shutdown",
    };

    std::thread::Builder::new()
        .name(format!("{}_{}", name, label))
        .spawn(move || {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| match hook {
                Hook::Start => service.start(),
                Hook::Shutdown => service.shutdown(),
            }));
            let _ = tx.send(match outcome {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(err.to_string()),
                Err(panic) => Err(panic_message(panic)),
            });
        })
        .expect("failed to spawn hook thread");

    match rx.recv_timeout(timeout) {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            tracing::error!(
                "Engine: service: {} {}() method raised exception: {}",
                name,
                label,
                err
            );
            false
        }
        Err(_) => {
            tracing::error!(
                "Engine: service: {} {}() method took more than {:?}",
                name,
                label,
                timeout
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_skip_zero_on_wrap() {
        let engine_counter = AtomicU32::new(u32::MAX - 1);
        // mimic the wrap logic directly
        let next = |counter: &AtomicU32| {
            let previous = counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                    Some(if current == u32::MAX { 1 } else { current + 1 })
                })
                .unwrap();
            if previous == u32::MAX {
                1
            } else {
                previous + 1
            }
        };
        assert_eq!(next(&engine_counter), u32::MAX);
        assert_eq!(next(&engine_counter), 1);
        assert_eq!(next(&engine_counter), 2);
    }
}
