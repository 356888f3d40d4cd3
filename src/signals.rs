use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::debug;

use crate::system::evented::Evented;

// -----------------------------------------------------------------------------
//     - Shutdown -
//     Cancellation token threaded into `Reactor::run_until`. Each reactor
//     running under the token registers its wake channel so `cancel` can
//     knock it out of `epoll_wait`.
// -----------------------------------------------------------------------------
#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    wakers: Mutex<Vec<Weak<Evented>>>,
}

#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!("shutdown requested");
        let wakers = match self.inner.wakers.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };

        for waker in wakers.iter().filter_map(Weak::upgrade) {
            let _ = waker.poke();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn attach(&self, waker: &Arc<Evented>) {
        let mut wakers = match self.inner.wakers.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };

        wakers.retain(|w| w.strong_count() > 0);
        if !wakers.iter().any(|w| w.ptr_eq(&Arc::downgrade(waker))) {
            wakers.push(Arc::downgrade(waker));
        }
    }
}
