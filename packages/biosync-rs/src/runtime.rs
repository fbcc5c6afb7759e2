// Process-wide shutdown flag and cooperative producer supervision.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info};

/// Shared stop flag polled by every worker between iterations. Cloning
/// shares the flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A supervised producer thread.
pub struct Producer {
    pub name: String,
    handle: JoinHandle<()>,
}

impl Producer {
    pub fn new(name: impl Into<String>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) {
        if self.handle.join().is_err() {
            error!(producer = %self.name, "producer thread panicked");
        }
    }
}

/// Wait until every producer has finished or shutdown is requested. Polls
/// with short sleeps so signals stay responsive; never blocks indefinitely.
pub fn wait_for_producers(producers: &[Producer], shutdown: &ShutdownFlag) {
    loop {
        if shutdown.is_set() {
            return;
        }
        if producers.iter().all(Producer::is_finished) {
            return;
        }
        std::thread::sleep(Duration::from_millis(200));
    }
}

/// Request shutdown and join every producer.
pub fn stop_producers(producers: Vec<Producer>, shutdown: &ShutdownFlag) {
    shutdown.request();
    for producer in producers {
        let name = producer.name.clone();
        producer.join();
        info!(producer = %name, "producer stopped");
    }
}
