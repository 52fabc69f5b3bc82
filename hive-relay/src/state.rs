use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Sending half of the cooperative stop signal, held by `main`.
#[derive(Debug)]
pub struct StopTrigger(watch::Sender<bool>);

/// Receiving half, cloned into every long-running task.
/// Tasks only look at it between iterations, never mid-iteration.
#[derive(Debug, Clone)]
pub struct StopSignal(watch::Receiver<bool>);

pub fn stop_channel() -> (StopTrigger, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopTrigger(tx), StopSignal(rx))
}

impl StopTrigger {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once a stop was requested. A dropped trigger counts as a stop.
    pub async fn stopped(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}
