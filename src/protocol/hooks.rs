use crate::error::FlowError;

/// Optional diagnostics sink for signals that arrive after a terminal or
/// after cancellation. If absent, such signals are discarded
/// silently - this is expected, routine behavior, not a defect, so the
/// default no-op implementation logs nothing above `trace` level.
pub trait DropHook<T>: Send + Sync {
    fn on_dropped_next(&self, _value: &T) {}
    fn on_dropped_error(&self, _cause: &FlowError) {}
}

/// The default hook: discards everything.
pub struct NoopHook;

impl<T> DropHook<T> for NoopHook {}
