use crate::timer::Timer;

/// Bridge to the component whose timeout callbacks the timers drive.
///
/// Called only from the execution pool, never from the clock thread.
pub trait TimedObjectInvoker: Send + Sync {
    /// Identifier of the timed object; partitions persisted timers.
    fn timed_object_id(&self) -> &str;

    /// Run the timeout callback for `timer`. Auto timers carry the target
    /// method in [`Timer::timeout_method`].
    fn call_timeout(&self, timer: &Timer) -> anyhow::Result<()>;
}

/// Who is calling into the timer service right now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    /// Owner instance key of the invoking component instance, if keyed.
    pub primary_key: Option<String>,
    /// True while a lifecycle callback (construction, destruction, …) runs.
    pub lifecycle_callback: bool,
}

pub trait InvocationContext: Send + Sync {
    fn current(&self) -> CallContext;
}

/// Context for callers outside any component invocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInvocationContext;

impl InvocationContext for NoInvocationContext {
    fn current(&self) -> CallContext {
        CallContext::default()
    }
}
