// Copyright 2025 Anapaya Systems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! Common types shared by the path subsystem.

use std::{
    future::Future,
    sync::{Arc, RwLock, Weak},
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// A list of subscribers held as weak references.
///
/// The list does not keep subscribers alive. Dead entries are cleaned up on registration.
/// Notification order is registration order.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use scion_pan::types::Subscribers;
///
/// trait EventReceiver: Send + Sync {
///     fn on_event(&self, data: &str);
/// }
///
/// struct MyReceiver;
/// impl EventReceiver for MyReceiver {
///     fn on_event(&self, data: &str) {
///         println!("Received: {}", data);
///     }
/// }
///
/// let subscribers: Subscribers<dyn EventReceiver> = Subscribers::new();
/// let receiver: Arc<dyn EventReceiver> = Arc::new(MyReceiver);
///
/// subscribers.register(receiver.clone());
/// subscribers.for_each(|r| r.on_event("hello"));
///
/// subscribers.unregister(&receiver);
/// assert!(subscribers.is_empty());
/// ```
pub struct Subscribers<T: ?Sized + Send + Sync + 'static> {
    receivers: Arc<RwLock<Vec<Weak<T>>>>,
}

impl<T: ?Sized + Send + Sync + 'static> Clone for Subscribers<T> {
    fn clone(&self) -> Self {
        Self {
            receivers: Arc::clone(&self.receivers),
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> Subscribers<T> {
    /// Creates a new empty set of subscribers.
    pub fn new() -> Self {
        Self {
            receivers: Arc::new(RwLock::new(vec![])),
        }
    }

    /// Register a subscriber. The subscriber is held as a weak reference
    /// and will be automatically removed when dropped.
    pub fn register(&self, subscriber: Arc<T>) {
        let weak = Arc::downgrade(&subscriber);
        let mut receivers = self.receivers.write().expect("lock poisoned");
        receivers.retain(|r| r.strong_count() > 0);
        receivers.push(weak);
    }

    /// Removes a subscriber, compared by identity.
    pub fn unregister(&self, subscriber: &Arc<T>) {
        let mut receivers = self.receivers.write().expect("lock poisoned");
        receivers.retain(|r| {
            r.strong_count() > 0 && !std::ptr::addr_eq(r.as_ptr(), Arc::as_ptr(subscriber))
        });
    }

    /// Returns true if no live subscriber is registered.
    pub fn is_empty(&self) -> bool {
        let receivers = self.receivers.read().expect("lock poisoned");
        receivers.iter().all(|r| r.strong_count() == 0)
    }

    /// Execute a closure for each live subscriber.
    ///
    /// The subscribers are collected before the closure runs, so the closure may register
    /// or unregister subscribers.
    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        let live: Vec<Arc<T>> = {
            let receivers = self.receivers.read().expect("lock poisoned");
            receivers.iter().filter_map(Weak::upgrade).collect()
        };
        for receiver in live {
            f(&*receiver);
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns a background task. The task is cancelled when the guard is dropped.
pub(crate) struct TaskGuard {
    _task: JoinHandle<()>,
    cancel_token: CancellationToken,
}

impl TaskGuard {
    /// Spawns the task returned by `task` on the current runtime, in the current span.
    ///
    /// The task is expected to exit once the passed token is cancelled.
    pub(crate) fn spawn<F, Fut>(task: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel_token = CancellationToken::new();
        let task = task(cancel_token.clone());
        TaskGuard {
            _task: tokio::spawn(task.in_current_span()),
            cancel_token,
        }
    }

    /// Cancels the task without waiting for it to exit.
    pub(crate) fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    trait Receiver: Send + Sync {
        fn receive(&self, n: u32);
    }

    struct Recording(u32, Arc<Mutex<Vec<(u32, u32)>>>);

    impl Receiver for Recording {
        fn receive(&self, n: u32) {
            self.1.lock().unwrap().push((self.0, n));
        }
    }

    #[test]
    fn should_notify_in_registration_order() {
        let log = Arc::new(Mutex::new(vec![]));
        let subscribers: Subscribers<dyn Receiver> = Subscribers::new();
        let a: Arc<dyn Receiver> = Arc::new(Recording(1, log.clone()));
        let b: Arc<dyn Receiver> = Arc::new(Recording(2, log.clone()));
        subscribers.register(a.clone());
        subscribers.register(b.clone());

        subscribers.for_each(|r| r.receive(7));

        assert_eq!(*log.lock().unwrap(), vec![(1, 7), (2, 7)]);
    }

    #[test]
    fn should_skip_dropped_and_unregistered_subscribers() {
        let log = Arc::new(Mutex::new(vec![]));
        let subscribers: Subscribers<dyn Receiver> = Subscribers::new();
        let a: Arc<dyn Receiver> = Arc::new(Recording(1, log.clone()));
        let b: Arc<dyn Receiver> = Arc::new(Recording(2, log.clone()));
        let c: Arc<dyn Receiver> = Arc::new(Recording(3, log.clone()));
        subscribers.register(a.clone());
        subscribers.register(b.clone());
        subscribers.register(c.clone());

        drop(a);
        subscribers.unregister(&c);
        subscribers.for_each(|r| r.receive(1));

        assert_eq!(*log.lock().unwrap(), vec![(2, 1)]);
        assert!(!subscribers.is_empty());
        drop(b);
        assert!(subscribers.is_empty());
    }
}
