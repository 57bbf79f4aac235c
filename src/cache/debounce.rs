//! Suppression of repeated `initialize` calls for the same context.

use std::collections::HashMap;
use std::sync::Mutex;

use time::{Duration, OffsetDateTime};

use crate::domain::types::ContextName;

use super::lock;

const SOURCE: &str = "cache::debounce";

pub struct DebounceGuard {
    window: Duration,
    last_calls: Mutex<HashMap<ContextName, OffsetDateTime>>,
}

impl DebounceGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// True iff the last admitted call for `context` is less than one window old.
    pub fn should_suppress(&self, context: ContextName, now: OffsetDateTime) -> bool {
        self.within_window(
            &lock::lock(&self.last_calls, SOURCE, "should_suppress"),
            context,
            now,
        )
    }

    /// Check and stamp in one critical section. Forced calls are always
    /// admitted. Returns whether the call may proceed.
    pub fn try_admit(&self, context: ContextName, now: OffsetDateTime, force: bool) -> bool {
        let mut last_calls = lock::lock(&self.last_calls, SOURCE, "try_admit");
        if !force && self.within_window(&last_calls, context, now) {
            return false;
        }
        last_calls.insert(context, now);
        true
    }

    pub fn clear(&self) {
        lock::lock(&self.last_calls, SOURCE, "clear").clear();
    }

    fn within_window(
        &self,
        last_calls: &HashMap<ContextName, OffsetDateTime>,
        context: ContextName,
        now: OffsetDateTime,
    ) -> bool {
        last_calls
            .get(&context)
            .is_some_and(|last| now - *last < self.window)
    }
}
