//! A future/promise with at-most-one resolution and multi-waiter read,
//! implemented as a latch plus a value cell guarded by a mutex.

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::context::{ContextError, RequestContext};

pub struct SingleShot<T: Clone> {
    notify: Notify,
    value: Mutex<Option<T>>,
}

impl<T: Clone> Default for SingleShot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> SingleShot<T> {
    pub fn new() -> Self {
        Self {
            notify: Notify::new(),
            value: Mutex::new(None),
        }
    }

    /// Resolves the holder, waking every current and future waiter. Callers
    /// are expected to invoke this at most once; a second call silently
    /// overwrites the value (no sandbox or transition ever calls it twice).
    pub fn resolve(&self, value: T) {
        *self.value.lock() = Some(value);
        self.notify.notify_waiters();
    }

    pub fn peek(&self) -> Option<T> {
        self.value.lock().clone()
    }

    /// Blocks until resolved or `ctx` is canceled/expired. Uses the
    /// subscribe-then-check pattern to avoid the classic missed-wakeup race
    /// between `peek` and `notified()`.
    pub async fn wait(&self, ctx: &RequestContext) -> Result<T, ContextError> {
        loop {
            let notified = self.notify.notified();
            if let Some(value) = self.peek() {
                return Ok(value);
            }
            ctx.run(notified).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn multiple_waiters_observe_the_same_resolution() {
        let slot: Arc<SingleShot<i32>> = Arc::new(SingleShot::new());
        let ctx = RequestContext::background();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let slot = slot.clone();
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move { slot.wait(&ctx).await }));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        slot.resolve(7);

        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 7);
        }
    }

    #[tokio::test]
    async fn late_subscriber_sees_cached_value() {
        let slot: SingleShot<&'static str> = SingleShot::new();
        slot.resolve("done");
        let ctx = RequestContext::background();
        assert_eq!(slot.wait(&ctx).await.unwrap(), "done");
    }
}
