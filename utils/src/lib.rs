use std::time::{SystemTime, UNIX_EPOCH};

pub mod poll;

pub use poll::{cancel_after, poll_until, sleep_or_cancel, PollOutcome, PollPolicy};

pub trait OptionInspectNone<T> {
    fn inspect_none(self, inspector_function: impl FnOnce()) -> Self;
}

impl<T> OptionInspectNone<T> for Option<T> {
    fn inspect_none(self, inspector_function: impl FnOnce()) -> Self {
        if self.is_none() {
            inspector_function();
        }
        self
    }
}

/// Creation time of records persisted before the field existed.
pub fn default_creation_time() -> SystemTime {
    UNIX_EPOCH
}
