//! Garbage collector for pending-request bookkeeping. Consumes
//! completion events from the workers; when the feed goes quiet it
//! sweeps the ledgers for requests nobody will ever answer.

use crossbeam::channel::{Receiver, RecvTimeoutError};
use std::time::Duration;

use fanout_types::{RequestId, ServiceId};

use crate::subsystems::engine::Engine;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcEvent {
    /// A worker finished this request; drop it from the ledger.
    Done(ServiceId, RequestId),
    /// No-op used to unblock the collector, e.g. at shutdown.
    Wake,
}

pub(crate) fn run(engine: Engine, events: Receiver<GcEvent>) {
    tracing::debug!("Garbage collector: started");

    // the sweep cadence never stretches past 90s even for very patient
    // max_service_run_time settings
    let cycle = engine
        .settings
        .max_service_run_time
        .min(Duration::from_secs(90));

    while engine.helpers_running() {
        match events.recv_timeout(cycle) {
            Ok(GcEvent::Done(service_id, request_id)) => {
                tracing::debug!(
                    "Garbage collector: removing finished request_id: {} of service: {}",
                    request_id,
                    service_id
                );
                if engine
                    .ledger(service_id)
                    .remove(&request_id.raw())
                    .is_none()
                {
                    // processed but never picked up, or already swept
                    tracing::warn!(
                        "Garbage collector: no pending entry for request_id: {} of service: {}. Ignoring.",
                        request_id,
                        service_id
                    );
                }
            }
            Ok(GcEvent::Wake) => continue,
            Err(RecvTimeoutError::Timeout) => sweep(&engine),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!("Garbage collector: died");
}

/// Deletes entries that have been pending longer than
/// `max_service_run_time` and are not held by any worker. Timing is
/// best-effort; worker supervision is the service `timeout`, not this.
fn sweep(engine: &Engine) {
    let max_age = engine.settings.max_service_run_time;

    for pool in engine.pools() {
        let id = pool.descriptor.id;
        let ledger = engine.ledger(id);

        let expired: Vec<u32> = ledger
            .iter()
            .filter(|entry| entry.value().submitted_at.elapsed() > max_age)
            .map(|entry| *entry.key())
            .filter(|raw| {
                RequestId::new(*raw)
                    .map(|request_id| !pool.holds(request_id))
                    .unwrap_or(true)
            })
            .collect();

        for raw in expired {
            ledger.remove(&raw);
            tracing::warn!(
                "Garbage collector: request with ID: {} was deleted because its processing took too long. It was triggered by setting: 'max_service_run_time'={:?}.",
                raw,
                max_age
            );
        }
    }
}
