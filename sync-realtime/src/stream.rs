use std::fmt;
use sync_core::{ChannelError, ChannelSignal, ResourceScope, RowEvent, ScopeToken, SubscriptionHandle};
use tracing;

/// Lifecycle of one push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Closed,
    Opening,
    Open,
    Errored,
}

impl fmt::Display for StreamPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamPhase::Closed => "closed",
            StreamPhase::Opening => "opening",
            StreamPhase::Open => "open",
            StreamPhase::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// What the owner of a stream has to do after a signal was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamAction {
    /// The channel reached `Open`. `resync` is set when it had been open
    /// before, so events may have been missed while it was down.
    Opened { resync: bool },
    Deliver(RowEvent),
    Dropped { degraded: bool },
}

/// Subscriber state machine for one scope.
///
/// Every open attempt gets a fresh [`ScopeToken`]; signals carrying any other
/// token are ignored, which is how late acknowledgements and events of an
/// abandoned attempt are discarded.
#[derive(Debug)]
pub struct ChangeStream {
    scope: ResourceScope,
    phase: StreamPhase,
    token: Option<ScopeToken>,
    handle: Option<SubscriptionHandle>,
    has_opened: bool,
    consecutive_failures: u32,
    degraded_after: u32,
}

impl ChangeStream {
    pub fn new(scope: ResourceScope, degraded_after: u32) -> Self {
        Self {
            scope,
            phase: StreamPhase::Closed,
            token: None,
            handle: None,
            has_opened: false,
            consecutive_failures: 0,
            degraded_after: degraded_after.max(1),
        }
    }

    pub fn scope(&self) -> &ResourceScope {
        &self.scope
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn token(&self) -> Option<ScopeToken> {
        self.token
    }

    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures >= self.degraded_after
    }

    /// Moves to `Opening` under a fresh token. Returns `None` when an attempt
    /// is already opening or open for this scope.
    pub fn begin_open(&mut self) -> Option<ScopeToken> {
        match self.phase {
            StreamPhase::Opening | StreamPhase::Open => None,
            StreamPhase::Closed | StreamPhase::Errored => {
                let token = ScopeToken::next();
                self.token = Some(token);
                self.handle = None;
                self.phase = StreamPhase::Opening;
                tracing::debug!("Opening {} under {}", self.scope, token);
                Some(token)
            }
        }
    }

    /// Records the transport handle of the attempt started under `token`.
    /// Returns false when that attempt is no longer current.
    pub fn attach(&mut self, token: ScopeToken, handle: SubscriptionHandle) -> bool {
        if self.token != Some(token) {
            return false;
        }
        self.handle = Some(handle);
        true
    }

    /// The transport refused the subscription.
    pub fn open_failed(&mut self, token: ScopeToken, error: &ChannelError) -> Option<StreamAction> {
        if self.token != Some(token) {
            return None;
        }
        self.phase = StreamPhase::Errored;
        self.consecutive_failures += 1;
        tracing::warn!("Subscription to {} failed: {}", self.scope, error);
        Some(StreamAction::Dropped {
            degraded: self.is_degraded(),
        })
    }

    pub fn on_signal(&mut self, token: ScopeToken, signal: ChannelSignal) -> Vec<StreamAction> {
        if self.token != Some(token) {
            tracing::debug!("Discarding signal for {} from stale attempt {}", self.scope, token);
            return Vec::new();
        }

        match signal {
            ChannelSignal::Subscribed => match self.phase {
                StreamPhase::Opening | StreamPhase::Errored => vec![self.mark_open()],
                StreamPhase::Open | StreamPhase::Closed => Vec::new(),
            },
            ChannelSignal::Change(event) => match self.phase {
                StreamPhase::Open => vec![StreamAction::Deliver(event)],
                // Events only flow on an acknowledged channel.
                StreamPhase::Opening | StreamPhase::Errored => {
                    vec![self.mark_open(), StreamAction::Deliver(event)]
                }
                StreamPhase::Closed => Vec::new(),
            },
            ChannelSignal::Reconnecting => {
                if matches!(self.phase, StreamPhase::Open | StreamPhase::Errored) {
                    self.phase = StreamPhase::Opening;
                }
                Vec::new()
            }
            ChannelSignal::Dropped { reason } => {
                if self.phase == StreamPhase::Closed {
                    return Vec::new();
                }
                self.phase = StreamPhase::Errored;
                self.consecutive_failures += 1;
                tracing::warn!(
                    "Channel {} dropped ({} in a row): {}",
                    self.scope,
                    self.consecutive_failures,
                    reason
                );
                vec![StreamAction::Dropped {
                    degraded: self.is_degraded(),
                }]
            }
        }
    }

    /// Idempotent. Returns the handle the transport must release, if any.
    pub fn close(&mut self) -> Option<SubscriptionHandle> {
        if self.phase != StreamPhase::Closed {
            tracing::debug!("Closing {}", self.scope);
        }
        self.phase = StreamPhase::Closed;
        self.token = None;
        self.handle.take()
    }

    fn mark_open(&mut self) -> StreamAction {
        let resync = self.has_opened;
        self.phase = StreamPhase::Open;
        self.has_opened = true;
        self.consecutive_failures = 0;
        tracing::info!("Channel {} open{}", self.scope, if resync { " again" } else { "" });
        StreamAction::Opened { resync }
    }
}
