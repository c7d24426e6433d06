//! The terminator: a single control loop that watches worker liveness
//! cells, restarts workers stuck inside a service `run` and stops a
//! service altogether once it burned through its `max_timeouts` budget.

use std::time::Duration;

use fanout_types::Payload;

use crate::subsystems::engine::{Engine, STOPPED_TIMEOUTS_MESSAGE};

pub(crate) fn run(engine: Engine) {
    // delay so the services have a chance to start first
    std::thread::sleep(engine.settings.th_proc_response_time);

    if engine
        .pools()
        .iter()
        .all(|pool| pool.descriptor.timeout == 0)
    {
        tracing::debug!("Terminator: did not start because every service has timeout 0");
        return;
    }

    // per-service, per-worker-slot stall counters
    let mut counters: Vec<Vec<u32>> = engine
        .pools()
        .iter()
        .map(|pool| vec![0; pool.descriptor.workers() as usize])
        .collect();

    tracing::debug!("Terminator: started");
    while engine.helpers_running() {
        let mut no_respond = false;

        for (index, pool) in engine.pools().iter().enumerate() {
            let descriptor = &pool.descriptor;
            if descriptor.timeout == 0 || !pool.running() {
                continue;
            }
            let mut stop_service = false;

            for (slot, cell) in pool.cells().into_iter().enumerate() {
                if cell.alive() {
                    // worker heartbeated since the last cycle
                    counters[index][slot] = 0;
                    cell.clear_alive();
                    continue;
                }
                if cell.awaiting() {
                    // blocked on the input channel, not a stall
                    counters[index][slot] = 0;
                    continue;
                }
                no_respond = true;
                counters[index][slot] += 1;
                if counters[index][slot] < descriptor.timeout {
                    continue;
                }

                // batch payloads get a proportionally larger budget
                let raw = cell.current();
                match engine.ledger(descriptor.id).get(&raw) {
                    Some(entry) => {
                        if let Payload::Many(list) = &entry.payload {
                            if (counters[index][slot] as u64)
                                < u64::from(descriptor.timeout) * list.len() as u64
                            {
                                continue;
                            }
                        }
                    }
                    None => {
                        tracing::warn!(
                            "Terminator: no pending entry for request_id: {} of service: {} worker: {}-{}",
                            raw,
                            descriptor.name,
                            index,
                            slot
                        );
                        // proceed with the restart either way
                    }
                }

                let stalls = pool.bump_timeout_count();
                if descriptor.max_timeouts != 0 && stalls >= descriptor.max_timeouts {
                    stop_service = true;
                    break;
                }
                tracing::warn!(
                    "Terminator: restarting service: {} worker: {}-{}, due to not responding for {} cycles",
                    descriptor.name,
                    index,
                    slot,
                    counters[index][slot]
                );
                let recovered = pool.restart_worker(slot);
                if recovered != 0 {
                    engine.resubmit(descriptor.id, recovered);
                }
                counters[index][slot] = 0;
            }

            if stop_service {
                tracing::error!(
                    "Terminator: stopping service {} due to too many timeouts. Starting dummy service.",
                    descriptor.name
                );
                engine.stop_service(descriptor.id, true, STOPPED_TIMEOUTS_MESSAGE);
                counters[index].iter_mut().for_each(|c| *c = 0);
            }
        }

        if no_respond {
            // tight loop while triaging stuck workers
            std::thread::sleep(Duration::from_secs(1));
        } else {
            std::thread::sleep(engine.settings.terminator_idle_cycle);
        }
    }
    tracing::debug!("Terminator: died");
}
