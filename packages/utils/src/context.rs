use std::sync::Arc;

use tokio::runtime::Runtime;
use tokio::sync::watch;

/// The shared tokio runtime plus the process-wide shutdown flag.
///
/// The flag lives in a watch channel: `kill` flips it exactly once and
/// any number of observers (the http server's graceful shutdown, tests)
/// can either read it or await the flip. Flipping with `send_replace`
/// means killing works even before anyone subscribed.
#[derive(Clone)]
pub struct AppContext {
    pub rt: Arc<Runtime>,
    kill_tx: watch::Sender<bool>,
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AppContext {
    pub fn new() -> Self {
        let rt = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .expect("failed to build the tokio runtime"),
        );
        let (kill_tx, _) = watch::channel(false);

        Self { rt, kill_tx }
    }

    /// A receiver whose `wait_for(|killed| *killed)` resolves once the
    /// shutdown flag is raised.
    pub fn kill_receiver(&self) -> watch::Receiver<bool> {
        self.kill_tx.subscribe()
    }

    /// Raises the shutdown flag. Called from the ctrl-c handler and
    /// from tests; safe to call more than once.
    pub fn kill(&self) {
        self.kill_tx.send_replace(true);
    }

    pub fn killed(&self) -> bool {
        *self.kill_tx.borrow()
    }
}
