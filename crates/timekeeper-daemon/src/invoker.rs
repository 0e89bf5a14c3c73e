use std::sync::atomic::{AtomicU64, Ordering};

use timekeeper_timers::{TimedObjectInvoker, Timer};
use tracing::info;

/// Timed object whose timeout callback only logs the firing.
pub struct LogInvoker {
    id: String,
    fired: AtomicU64,
}

impl LogInvoker {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fired: AtomicU64::new(0),
        }
    }
}

impl TimedObjectInvoker for LogInvoker {
    fn timed_object_id(&self) -> &str {
        &self.id
    }

    fn call_timeout(&self, timer: &Timer) -> anyhow::Result<()> {
        let count = self.fired.fetch_add(1, Ordering::Relaxed) + 1;
        let method = timer
            .timeout_method()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "timeout".to_string());
        info!(
            timed_object = %self.id,
            timer_id = %timer.id(),
            %method,
            info = ?timer.info(),
            count,
            "timer fired"
        );
        Ok(())
    }
}
