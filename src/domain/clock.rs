use std::sync::Arc;

use chrono::Utc;

/// Source of "now" for the scheduling core.
///
/// Every time-dependent decision (bucket truncation, horizon advancement,
/// dispatch eligibility, urgency tie-breaks) goes through this trait so tests
/// can pin the clock to a fixed instant.
pub trait SystemClock: std::fmt::Debug + Send + Sync {
    fn now_millis(&self) -> i64;
    fn clone_box(&self) -> SharedClock;
}

#[derive(Debug)]
pub struct SharedClock(pub Arc<dyn SystemClock>);

impl Clone for SharedClock {
    fn clone(&self) -> Self {
        self.0.clone_box()
    }
}

impl std::ops::Deref for SharedClock {
    type Target = dyn SystemClock;
    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

/// Wall clock backed by the system time.
#[derive(Debug, Clone)]
pub struct WallClock;

impl SystemClock for WallClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn clone_box(&self) -> SharedClock {
        SharedClock(Arc::new(self.clone()))
    }
}

impl WallClock {
    pub fn shared() -> SharedClock {
        SharedClock(Arc::new(WallClock))
    }
}
