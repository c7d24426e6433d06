use crossbeam::channel::{unbounded, Receiver, Sender};
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use fanout_types::{Output, Payload, RequestId, ServiceDescriptor, WorkItem, WorkResult};

use crate::services::SharedService;
use crate::subsystems::gc::GcEvent;

/// Liveness state shared between one worker thread and the supervisor.
///
/// The worker raises `alive` at the top of every loop iteration and the
/// supervisor lowers it again, so a worker stuck inside `run` shows up as
/// a flag that stays down. `awaiting` is raised while the worker is
/// blocked on the input channel, which exempts it from stall counting.
/// `current` holds the request id being processed (0 = none) and is the
/// value the supervisor recovers when it retires the worker.
pub struct WorkerCell {
    alive: AtomicBool,
    awaiting: AtomicBool,
    current: AtomicU32,
    retired: AtomicBool,
}

impl WorkerCell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            alive: AtomicBool::new(false),
            awaiting: AtomicBool::new(false),
            current: AtomicU32::new(0),
            retired: AtomicBool::new(false),
        })
    }

    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn clear_alive(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn set_awaiting(&self, awaiting: bool) {
        self.awaiting.store(awaiting, Ordering::SeqCst);
    }

    pub fn awaiting(&self) -> bool {
        self.awaiting.load(Ordering::SeqCst)
    }

    pub fn set_current(&self, raw: u32) {
        self.current.store(raw, Ordering::SeqCst);
    }

    pub fn current(&self) -> u32 {
        self.current.load(Ordering::SeqCst)
    }

    /// Reads and clears `current` in one step so a recovered request id
    /// cannot be recovered twice.
    pub fn take_current(&self) -> u32 {
        self.current.swap(0, Ordering::SeqCst)
    }

    /// A retired worker must not publish anything: its in-flight request
    /// has already been handed to a replacement.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub fn retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}

/// One service's pool: the shared input/output channels plus the liveness
/// cells of its workers. All workers run as OS threads of this process;
/// the `processes` count of the descriptor contributes extra threads
/// since compiled-in services share the address space either way.
pub struct Pool {
    pub descriptor: ServiceDescriptor,
    pub service: SharedService,
    input_tx: Sender<WorkItem>,
    input_rx: Receiver<WorkItem>,
    output_tx: Sender<WorkResult>,
    output_rx: Receiver<WorkResult>,
    running: Arc<AtomicBool>,
    cells: Mutex<Vec<Arc<WorkerCell>>>,
    timeout_count: AtomicU32,
    gc_tx: Sender<GcEvent>,
}

impl Pool {
    pub fn new(descriptor: ServiceDescriptor, service: SharedService, gc_tx: Sender<GcEvent>) -> Self {
        let (input_tx, input_rx) = unbounded();
        let (output_tx, output_rx) = unbounded();
        Self {
            descriptor,
            service,
            input_tx,
            input_rx,
            output_tx,
            output_rx,
            running: Arc::new(AtomicBool::new(false)),
            cells: Mutex::new(Vec::new()),
            timeout_count: AtomicU32::new(0),
            gc_tx,
        }
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn submit(&self, id: RequestId, payload: Payload) {
        // send only fails when every receiver is gone, i.e. at teardown
        let _ = self.input_tx.send(Some((id, payload)));
    }

    /// Wake-up sentinels make blocked workers re-check the running flag.
    pub fn send_sentinels(&self, count: usize) {
        for _ in 0..count {
            let _ = self.input_tx.send(None);
        }
    }

    pub fn output(&self) -> &Receiver<WorkResult> {
        &self.output_rx
    }

    pub fn input_len(&self) -> usize {
        self.input_rx.len()
    }

    pub fn output_len(&self) -> usize {
        self.output_rx.len()
    }

    pub fn cells(&self) -> Vec<Arc<WorkerCell>> {
        self.cells.lock().unwrap().clone()
    }

    /// Whether any worker currently processes this request id. The
    /// garbage collector uses this to avoid reclaiming live work.
    pub fn holds(&self, id: RequestId) -> bool {
        self.cells
            .lock()
            .unwrap()
            .iter()
            .any(|cell| cell.current() == id.raw())
    }

    pub fn timeout_count(&self) -> u32 {
        self.timeout_count.load(Ordering::SeqCst)
    }

    pub fn bump_timeout_count(&self) -> u32 {
        self.timeout_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Spawns the full complement of workers on fresh cells.
    pub fn spawn_workers(&self) {
        let count = self.descriptor.workers() as usize;
        let mut cells = Vec::with_capacity(count);
        for slot in 0..count {
            let cell = WorkerCell::new();
            cells.push(cell.clone());
            self.spawn_worker(slot, cell);
        }
        *self.cells.lock().unwrap() = cells;
    }

    /// Retires the worker at `slot`, installs a fresh cell with a new
    /// worker thread and returns the recovered request id (0 = none).
    pub fn restart_worker(&self, slot: usize) -> u32 {
        let fresh = WorkerCell::new();
        let recovered = {
            let mut cells = self.cells.lock().unwrap();
            let old = std::mem::replace(&mut cells[slot], fresh.clone());
            old.retire();
            old.take_current()
        };
        self.spawn_worker(slot, fresh);
        recovered
    }

    /// Retires every worker and collects their in-flight request ids.
    /// Used on service stop; the engine re-enqueues the recovered work.
    pub fn retire_all(&self) -> Vec<u32> {
        let cells = self.cells.lock().unwrap();
        let mut recovered = Vec::new();
        for cell in cells.iter() {
            cell.retire();
            let raw = cell.take_current();
            if raw != 0 {
                recovered.push(raw);
            }
        }
        recovered
    }

    fn spawn_worker(&self, slot: usize, cell: Arc<WorkerCell>) {
        let ctx = WorkerContext {
            service: self.service.clone(),
            descriptor: self.descriptor.clone(),
            running: self.running.clone(),
            cell,
            input: self.input_rx.clone(),
            output: self.output_tx.clone(),
            gc: self.gc_tx.clone(),
        };
        let name = format!("{}-{}", self.descriptor.id, slot);
        std::thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(ctx))
            .expect("failed to spawn worker thread");
    }

    /// Dummy workers answer every queued request with a canned message,
    /// preserving request-id correlation, so callers of a stopped service
    /// are not left waiting. They live until the manager-level running
    /// flag goes down.
    pub fn start_dummies(&self, message: &str, manager_running: Arc<AtomicBool>) {
        let count = self.descriptor.workers() as usize;
        for slot in 0..count {
            let ctx = DummyContext {
                service_id: self.descriptor.id,
                message: message.to_string(),
                running: manager_running.clone(),
                input: self.input_rx.clone(),
                output: self.output_tx.clone(),
                gc: self.gc_tx.clone(),
            };
            let name = format!("{}-{}_dummy", self.descriptor.id, slot);
            std::thread::Builder::new()
                .name(name)
                .spawn(move || dummy_loop(ctx))
                .expect("failed to spawn dummy worker thread");
        }
    }
}

struct WorkerContext {
    service: SharedService,
    descriptor: ServiceDescriptor,
    running: Arc<AtomicBool>,
    cell: Arc<WorkerCell>,
    input: Receiver<WorkItem>,
    output: Sender<WorkResult>,
    gc: Sender<GcEvent>,
}

fn worker_loop(ctx: WorkerContext) {
    let name = &ctx.descriptor.name;
    tracing::debug!("Worker ({}): started", name);
    while ctx.running.load(Ordering::SeqCst) && !ctx.cell.retired() {
        ctx.cell.mark_alive();

        ctx.cell.set_awaiting(true);
        let item = match ctx.input.recv() {
            Ok(item) => item,
            // channel gone, the whole engine is being torn down
            Err(_) => break,
        };
        let (id, payload) = match item {
            Some(work) => work,
            // sentinel: loop around and re-check the running flag
            None => continue,
        };
        ctx.cell.set_current(id.raw());
        ctx.cell.set_awaiting(false);

        let output = execute(&ctx.service, ctx.descriptor.allow_batch, name, &payload);

        if ctx.cell.retired() {
            // the supervisor handed this request to a replacement worker,
            // a second response under the same id must not go out
            tracing::debug!("Worker ({}): retired during run, output discarded", name);
            break;
        }
        if !ctx.running.load(Ordering::SeqCst) {
            // service stopped while the run method was executing
            if ctx.output.send((id, output)).is_ok() {
                ctx.cell.take_current();
                let _ = ctx.gc.send(GcEvent::Done(ctx.descriptor.id, id));
                tracing::error!(
                    "Worker ({}): stopped during running, output processed anyway",
                    name
                );
            } else {
                tracing::error!("Worker ({}): stopped during running, output is lost", name);
            }
            break;
        }

        let _ = ctx.output.send((id, output));
        ctx.cell.take_current();
        let _ = ctx.gc.send(GcEvent::Done(ctx.descriptor.id, id));
        tracing::debug!("Worker ({}): request_id: {} processed", name, id);
    }
    tracing::debug!("Worker ({}): died", name);
}

struct DummyContext {
    service_id: fanout_types::ServiceId,
    message: String,
    running: Arc<AtomicBool>,
    input: Receiver<WorkItem>,
    output: Sender<WorkResult>,
    gc: Sender<GcEvent>,
}

fn dummy_loop(ctx: DummyContext) {
    tracing::debug!("Dummy worker (service_id: {}): started", ctx.service_id);
    while ctx.running.load(Ordering::SeqCst) {
        let item = match ctx.input.recv() {
            Ok(item) => item,
            Err(_) => break,
        };
        let (id, payload) = match item {
            Some(work) => work,
            None => continue,
        };
        let canned = json!({ "server": ctx.message });
        let output = match &payload {
            Payload::One(_) => Output::One(canned),
            Payload::Many(list) => Output::Many(vec![canned; list.len()]),
        };
        let _ = ctx.output.send((id, output));
        let _ = ctx.gc.send(GcEvent::Done(ctx.service_id, id));
        tracing::debug!(
            "Dummy worker (service_id: {}): request_id: {} answered",
            ctx.service_id,
            id
        );
    }
    tracing::debug!("Dummy worker (service_id: {}): died", ctx.service_id);
}

/// Runs the service over the payload, converting returned errors and
/// panics into the uniform exception result, replicated per element for
/// batch payloads.
fn execute(service: &SharedService, allow_batch: bool, name: &str, payload: &Payload) -> Output {
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| run_payload(service, allow_batch, payload)));
    match outcome {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            tracing::error!("Worker ({}): Service raised exception: {}", name, err);
            exception_output(payload, &err.to_string())
        }
        Err(panic) => {
            let msg = panic_message(panic);
            tracing::error!("Worker ({}): Service raised exception: {}", name, msg);
            exception_output(payload, &msg)
        }
    }
}

fn run_payload(
    service: &SharedService,
    allow_batch: bool,
    payload: &Payload,
) -> Result<Output, crate::services::ServiceError> {
    match payload {
        Payload::One(request) => Ok(Output::One(service.run(request)?)),
        Payload::Many(requests) => {
            let outputs = if allow_batch {
                service.run_list(requests)?
            } else {
                requests
                    .iter()
                    .map(|request| service.run(request))
                    .collect::<Result<Vec<_>, _>>()?
            };
            if outputs.len() != requests.len() {
                return Err(crate::services::ServiceError::runtime(
                    "Length of input does not equal length of output. Output discarded.",
                ));
            }
            Ok(Output::Many(outputs))
        }
    }
}

fn exception_output(payload: &Payload, msg: &str) -> Output {
    let error: Value = json!({ "server": "Service raised exception", "exception": msg });
    match payload {
        Payload::One(_) => Output::One(error),
        Payload::Many(list) => Output::Many(vec![error; list.len()]),
    }
}

pub(crate) fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "service panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{Service, ServiceError, ServiceResult};
    use fanout_types::{ServiceId, ServiceSpec};

    struct Flaky;

    impl Service for Flaky {
        fn spec(&self) -> ServiceSpec {
            ServiceSpec {
                name: "flaky".into(),
                ..ServiceSpec::default()
            }
        }

        fn run(&self, request: &str) -> ServiceResult<Value> {
            match request {
                "fail" => Err(ServiceError::runtime("boom")),
                "panic" => panic!("worker must survive this"),
                other => Ok(json!({ "ok": other })),
            }
        }
    }

    fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor {
            id: ServiceId::new(0),
            name: "flaky".into(),
            description: String::new(),
            threads: 1,
            processes: 0,
            timeout: 0,
            max_timeouts: 0,
            groups: vec![],
            allow_batch: false,
        }
    }

    fn pool() -> (Pool, Receiver<GcEvent>) {
        let (gc_tx, gc_rx) = unbounded();
        let pool = Pool::new(descriptor(), Arc::new(Flaky), gc_tx);
        pool.set_running(true);
        pool.spawn_workers();
        (pool, gc_rx)
    }

    fn recv(pool: &Pool) -> WorkResult {
        pool.output()
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("worker should reply")
    }

    #[test]
    fn worker_round_trips_and_notifies_gc() {
        let (pool, gc_rx) = pool();
        let id = RequestId::new(1).unwrap();
        pool.submit(id, Payload::One("hello".into()));

        let (got_id, output) = recv(&pool);
        assert_eq!(got_id, id);
        assert_eq!(output, Output::One(json!({"ok": "hello"})));
        match gc_rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap() {
            GcEvent::Done(sid, rid) => {
                assert_eq!(sid, ServiceId::new(0));
                assert_eq!(rid, id);
            }
            other => panic!("unexpected gc event: {:?}", other),
        }

        pool.set_running(false);
        pool.send_sentinels(2);
    }

    #[test]
    fn errors_and_panics_become_exception_results() {
        let (pool, _gc_rx) = pool();

        pool.submit(RequestId::new(1).unwrap(), Payload::One("fail".into()));
        let (_, output) = recv(&pool);
        assert_eq!(
            output,
            Output::One(json!({"server": "Service raised exception", "exception": "boom"}))
        );

        // the same worker keeps serving after a panic
        pool.submit(RequestId::new(2).unwrap(), Payload::One("panic".into()));
        let (_, output) = recv(&pool);
        assert_eq!(
            output,
            Output::One(
                json!({"server": "Service raised exception", "exception": "worker must survive this"})
            )
        );

        pool.submit(RequestId::new(3).unwrap(), Payload::One("good".into()));
        let (_, output) = recv(&pool);
        assert_eq!(output, Output::One(json!({"ok": "good"})));

        pool.set_running(false);
        pool.send_sentinels(2);
    }

    #[test]
    fn batch_errors_replicate_per_element() {
        let (pool, _gc_rx) = pool();
        pool.submit(
            RequestId::new(1).unwrap(),
            Payload::Many(vec!["a".into(), "fail".into(), "b".into()]),
        );
        let (_, output) = recv(&pool);
        match output {
            Output::Many(values) => {
                assert_eq!(values.len(), 3);
                assert!(values
                    .iter()
                    .all(|v| v["server"] == json!("Service raised exception")));
            }
            other => panic!("expected batch output, got {:?}", other),
        }

        pool.set_running(false);
        pool.send_sentinels(2);
    }

    #[test]
    fn dummy_workers_answer_with_canned_message() {
        let (gc_tx, _gc_rx) = unbounded();
        let pool = Pool::new(descriptor(), Arc::new(Flaky), gc_tx);
        let manager_running = Arc::new(AtomicBool::new(true));
        pool.start_dummies("Service stopped due to too many timeouts.", manager_running.clone());

        let id = RequestId::new(9).unwrap();
        pool.submit(id, Payload::Many(vec!["a".into(), "b".into()]));
        let (got_id, output) = recv(&pool);
        assert_eq!(got_id, id);
        assert_eq!(
            output,
            Output::Many(vec![
                json!({"server": "Service stopped due to too many timeouts."});
                2
            ])
        );

        manager_running.store(false, Ordering::SeqCst);
        pool.send_sentinels(2);
    }
}
