use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use sync_core::{
    EventSink, PushTransport, ResourceScope, ScopeToken, ScopedSignal, SignalReceiver,
    SignalSender,
};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing;

use crate::stream::{ChangeStream, StreamAction, StreamPhase};

/// Single queue every subscription of one service reports into.
pub struct SignalQueue {
    tx: SignalSender,
    rx: AsyncMutex<SignalReceiver>,
}

impl Default for SignalQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: AsyncMutex::new(rx),
        }
    }

    pub fn sink(&self, token: ScopeToken) -> EventSink {
        EventSink::new(token, self.tx.clone())
    }

    /// Waits for the next signal. Cancel safe.
    pub async fn next_signal(&self) -> Option<ScopedSignal> {
        self.rx.lock().await.recv().await
    }

    /// Returns a queued signal without waiting, or `None` when the queue is
    /// empty or another task is currently receiving.
    pub fn try_next(&self) -> Option<ScopedSignal> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

/// The push channels a service keeps open, keyed by what they serve.
///
/// At most one stream exists per key; opening a key that is already opening
/// or open does nothing.
pub struct StreamRegistry<K> {
    transport: Arc<dyn PushTransport>,
    queue: SignalQueue,
    streams: Mutex<HashMap<K, ChangeStream>>,
    degraded_after: u32,
}

impl<K> StreamRegistry<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send,
{
    pub fn new(transport: Arc<dyn PushTransport>, degraded_after: u32) -> Self {
        Self {
            transport,
            queue: SignalQueue::new(),
            streams: Mutex::new(HashMap::new()),
            degraded_after,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, ChangeStream>> {
        self.streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Opens `scope` under `key`. Returns the token of the new attempt, or
    /// `None` when the key is already opening or open for that scope.
    pub async fn open(&self, key: K, scope: ResourceScope) -> Option<ScopeToken> {
        let (token, replaced) = {
            let mut streams = self.lock();
            let mut replaced = None;
            if let Some(existing) = streams.get_mut(&key) {
                if existing.scope() != &scope {
                    replaced = existing.close();
                    *existing = ChangeStream::new(scope.clone(), self.degraded_after);
                }
            }
            let stream = streams
                .entry(key.clone())
                .or_insert_with(|| ChangeStream::new(scope.clone(), self.degraded_after));
            match stream.begin_open() {
                Some(token) => (token, replaced),
                None => {
                    tracing::debug!("{} is already {}", scope, stream.phase());
                    return None;
                }
            }
        };

        if let Some(handle) = replaced {
            self.release(handle).await;
        }
        self.subscribe(&key, &scope, token).await;
        Some(token)
    }

    async fn subscribe(&self, key: &K, scope: &ResourceScope, token: ScopeToken) {
        match self.transport.subscribe(scope, self.queue.sink(token)).await {
            Ok(handle) => {
                let attached = self
                    .lock()
                    .get_mut(key)
                    .map(|stream| stream.attach(token, handle))
                    .unwrap_or(false);
                if !attached {
                    tracing::debug!("Subscription to {} finished after its scope closed", scope);
                    self.release(handle).await;
                }
            }
            Err(e) => {
                if let Some(stream) = self.lock().get_mut(key) {
                    stream.open_failed(token, &e);
                }
            }
        }
    }

    async fn release(&self, handle: sync_core::SubscriptionHandle) {
        if let Err(e) = self.transport.unsubscribe(handle).await {
            tracing::warn!("Failed to release subscription {:?}: {}", handle, e);
        }
    }

    /// Closes and forgets the stream under `key`. Closing an unknown key is a
    /// no-op.
    pub async fn close(&self, key: &K) -> bool {
        let handle = match self.lock().remove(key) {
            Some(mut stream) => stream.close(),
            None => return false,
        };
        if let Some(handle) = handle {
            self.release(handle).await;
        }
        true
    }

    pub async fn close_all(&self) {
        let handles: Vec<_> = self
            .lock()
            .drain()
            .filter_map(|(_, mut stream)| stream.close())
            .collect();
        for handle in handles {
            self.release(handle).await;
        }
    }

    /// Replaces the subscription of every errored stream. Returns how many
    /// were reopened.
    pub async fn reopen_errored(&self) -> usize {
        let attempts: Vec<_> = {
            let mut streams = self.lock();
            streams
                .iter_mut()
                .filter(|(_, stream)| stream.phase() == StreamPhase::Errored)
                .filter_map(|(key, stream)| {
                    let old = stream.close();
                    stream
                        .begin_open()
                        .map(|token| (key.clone(), stream.scope().clone(), token, old))
                })
                .collect()
        };

        let count = attempts.len();
        for (key, scope, token, old) in attempts {
            if let Some(handle) = old {
                self.release(handle).await;
            }
            self.subscribe(&key, &scope, token).await;
        }
        count
    }

    /// Applies a signal to the stream it belongs to. `None` when no current
    /// attempt carries the signal's token.
    pub fn route(&self, signal: ScopedSignal) -> Option<(K, Vec<StreamAction>)> {
        let mut streams = self.lock();
        let Some((key, stream)) = streams
            .iter_mut()
            .find(|(_, stream)| stream.token() == Some(signal.token))
        else {
            tracing::debug!("Discarding {:?} for closed scope {}", signal.signal, signal.token);
            return None;
        };
        let actions = stream.on_signal(signal.token, signal.signal);
        Some((key.clone(), actions))
    }

    pub fn phase(&self, key: &K) -> StreamPhase {
        self.lock()
            .get(key)
            .map(ChangeStream::phase)
            .unwrap_or(StreamPhase::Closed)
    }

    pub fn token(&self, key: &K) -> Option<ScopeToken> {
        self.lock().get(key).and_then(ChangeStream::token)
    }

    pub fn is_degraded(&self) -> bool {
        self.lock().values().any(ChangeStream::is_degraded)
    }

    pub fn keys(&self) -> Vec<K> {
        self.lock().keys().cloned().collect()
    }

    pub async fn next_signal(&self) -> Option<ScopedSignal> {
        self.queue.next_signal().await
    }

    pub fn try_next(&self) -> Option<ScopedSignal> {
        self.queue.try_next()
    }
}
