//! Lifecycle Coordinator
//!
//! Single authority for extension state and event ordering.
//!
//! ```text
//! producers (watcher, webviews, host) --emit_event--> FIFO queue
//!                                                        |
//!                                              one drain at a time
//!                                                        v
//!                         transition (table) -> hook -> listeners
//!                                                        |
//!                                 listeners may emit again (queued, not nested)
//! ```
//!
//! # Ordering
//!
//! Events are handled strictly in queue order. An `emit_event` made from
//! inside a handler or listener only appends to the queue; the outer drain
//! picks it up, so a handler for event E always observes the state as it
//! was right after E's own transition.
//!
//! A failing hook or listener does not roll the transition back. The first
//! failure is returned from the `emit_event` call that drained it.
//!
//! While a reload waits for pending operations the drain is parked. Emits
//! from other tasks then only enqueue, so an operation that emits cannot
//! block the reload it is holding up.

mod event;
mod state;


pub use event::{EventType, LifecycleEvent};
pub use state::{
    ExtensionState, StateTransition, TRANSITIONS, TransitionHook, find_transition,
    is_valid_transition,
};

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::ReloadSection;
use crate::core::{BoxFuture, PendingSet};
use crate::logger::Logger;
use crate::{debug, log, warn};

/// Window used by the reload rate limit.
const RELOAD_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: ExtensionState,
        to: ExtensionState,
    },

    #[error("reload limit exceeded ({max} per minute)")]
    ReloadLimitExceeded { max: u32 },

    #[error("handler for `{event}` failed")]
    Handler {
        event: EventType,
        #[source]
        source: anyhow::Error,
    },
}

/// A passive subscriber to one event type.
pub type Listener =
    Arc<dyn Fn(LifecycleEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Handle for removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

tokio::task_local! {
    /// Address of the coordinator whose drain the current task is running
    static DRAINING: usize;
}

struct EventQueue {
    events: VecDeque<(u64, LifecycleEvent)>,
    next_seq: u64,
    draining: bool,
    /// Drain is blocked on pending operations
    parked: bool,
}

impl EventQueue {
    fn push(&mut self, event: LifecycleEvent) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.push_back((seq, event));
        seq
    }

    /// Whether event `seq` has not been picked up by a drain yet.
    fn holds(&self, seq: u64) -> bool {
        self.events.front().is_some_and(|(front, _)| *front <= seq)
    }
}

/// Published to waiters outside the drain.
#[derive(Debug, Clone, Copy, Default)]
struct DrainSignal {
    /// Bumped every time a drain finishes or is abandoned
    epoch: u64,
    parked: bool,
}

enum Turn {
    Done,
    Drain,
    Wait(u64),
}

/// Owns the state machine and the serialized event queue.
pub struct Coordinator {
    state: Mutex<ExtensionState>,
    queue: Mutex<EventQueue>,
    drained: watch::Sender<DrainSignal>,
    listeners: RwLock<FxHashMap<EventType, Vec<(ListenerId, Listener)>>>,
    next_listener: AtomicU64,
    pending: PendingSet<u64>,
    next_operation: AtomicU64,
    reload: ReloadSection,
    reload_history: Mutex<VecDeque<Instant>>,
    logger: Logger,
}

impl Coordinator {
    pub fn new(reload: ReloadSection, logger: Logger) -> Self {
        Self {
            state: Mutex::new(ExtensionState::Initializing),
            queue: Mutex::new(EventQueue {
                events: VecDeque::new(),
                next_seq: 0,
                draining: false,
                parked: false,
            }),
            drained: watch::Sender::new(DrainSignal::default()),
            listeners: RwLock::new(FxHashMap::default()),
            next_listener: AtomicU64::new(0),
            pending: PendingSet::new(),
            next_operation: AtomicU64::new(0),
            reload,
            reload_history: Mutex::new(VecDeque::new()),
            logger,
        }
    }

    // =========================================================================
    // State observers
    // =========================================================================

    pub fn state(&self) -> ExtensionState {
        *self.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ExtensionState::Ready
    }

    pub fn is_reloading(&self) -> bool {
        self.state() == ExtensionState::Reloading
    }

    pub fn is_busy(&self) -> bool {
        self.state() == ExtensionState::Busy
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state() == ExtensionState::ShuttingDown
    }

    /// Explicit transition request, validated against the table.
    ///
    /// Fails without touching state if the table has no such edge.
    pub fn transition_to(&self, target: ExtensionState) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        let from = *state;
        if !is_valid_transition(from, target) {
            return Err(LifecycleError::InvalidTransition { from, to: target });
        }
        *state = target;
        log!(self.logger, "lifecycle"; "{} -> {}", from, target);
        Ok(())
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Subscribe to `kind`. Listeners run in registration order.
    pub fn on<F, Fut>(&self, kind: EventType, listener: F) -> ListenerId
    where
        F: Fn(LifecycleEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let listener: Listener = Arc::new(move |event| listener(event).boxed());
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push((id, listener));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        for entries in listeners.values_mut() {
            if let Some(pos) = entries.iter().position(|(lid, _)| *lid == id) {
                entries.remove(pos);
                return true;
            }
        }
        false
    }

    // =========================================================================
    // Event queue
    // =========================================================================

    /// Queue an event and wait until it has been handled.
    ///
    /// Called from inside a handler or listener, this only enqueues and
    /// returns; the running drain handles the event after the current one.
    /// The same holds while a reload is parked on pending operations.
    /// If the drain ahead of us is abandoned, this call drains instead.
    pub async fn emit_event(
        &self,
        kind: EventType,
        payload: Option<serde_json::Value>,
        source: Option<&str>,
    ) -> Result<(), LifecycleError> {
        let event = LifecycleEvent::new(kind, payload, source);

        if self.in_own_drain() {
            debug!(self.logger, "lifecycle"; "queued {} (re-entrant)", kind);
            self.queue.lock().push(event);
            return Ok(());
        }

        let seq = self.queue.lock().push(event);
        let mut rx = self.drained.subscribe();
        loop {
            let turn = {
                let mut queue = self.queue.lock();
                if !queue.holds(seq) {
                    Turn::Done
                } else if queue.parked {
                    debug!(self.logger, "lifecycle"; "queued {} behind parked reload", kind);
                    Turn::Done
                } else if queue.draining {
                    Turn::Wait(self.drained.borrow().epoch)
                } else {
                    queue.draining = true;
                    Turn::Drain
                }
            };

            match turn {
                Turn::Done => return Ok(()),
                Turn::Drain => return DRAINING.scope(self.address(), self.drain()).await,
                Turn::Wait(epoch) => {
                    debug!(self.logger, "lifecycle"; "queued {} behind running drain", kind);
                    if rx
                        .wait_for(|signal| signal.epoch > epoch || signal.parked)
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Append without draining. Only used by transition hooks, which always
    /// run inside a drain.
    fn enqueue(&self, kind: EventType) {
        let event = LifecycleEvent::new(kind, None, Some("coordinator"));
        self.queue.lock().push(event);
    }

    fn set_parked(&self, parked: bool) {
        let mut queue = self.queue.lock();
        queue.parked = parked;
        self.drained.send_modify(|signal| signal.parked = parked);
    }

    async fn drain(&self) -> Result<(), LifecycleError> {
        let mut guard = DrainGuard {
            coordinator: self,
            finished: false,
        };
        let mut first_error = None;

        loop {
            let next = {
                let mut queue = self.queue.lock();
                let next = queue.events.pop_front();
                if next.is_none() {
                    queue.draining = false;
                    self.drained.send_modify(|signal| signal.epoch += 1);
                    guard.finished = true;
                }
                next
            };
            let Some((_, event)) = next else { break };

            if let Err(e) = self.handle_event(event).await {
                match &e {
                    LifecycleError::Handler { source, .. } => {
                        warn!(self.logger, "lifecycle"; "{}: {:#}", e, source)
                    }
                    _ => warn!(self.logger, "lifecycle"; "{}", e),
                }
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn handle_event(&self, event: LifecycleEvent) -> Result<(), LifecycleError> {
        let current = self.state();
        match find_transition(current, event.kind) {
            Some(transition) => {
                self.apply(transition)?;
                if let Some(hook) = transition.hook {
                    self.run_hook(hook)
                        .await
                        .map_err(|source| LifecycleError::Handler {
                            event: event.kind,
                            source,
                        })?;
                }
            }
            None => {
                debug!(self.logger, "lifecycle"; "{} in {}: no transition", event.kind, current);
            }
        }
        self.notify_listeners(event).await
    }

    fn apply(&self, transition: &StateTransition) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        let from = *state;
        if from != transition.from || !is_valid_transition(from, transition.to) {
            return Err(LifecycleError::InvalidTransition {
                from,
                to: transition.to,
            });
        }
        *state = transition.to;
        log!(self.logger, "lifecycle"; "{} -> {} ({})", from, transition.to, transition.trigger);
        Ok(())
    }

    async fn run_hook(&self, hook: TransitionHook) -> anyhow::Result<()> {
        match hook {
            TransitionHook::BeginReload => {
                if !self.pending.is_empty() {
                    log!(self.logger, "lifecycle"; "waiting for {} pending operation(s) before reload", self.pending.len());
                    self.set_parked(true);
                    self.wait_for_pending_operations().await;
                    self.set_parked(false);
                }
                self.enqueue(EventType::StateSaving);
                self.enqueue(EventType::ReloadStarted);
            }
            TransitionHook::CompleteReload => {
                self.enqueue(EventType::StateLoading);
            }
        }
        Ok(())
    }

    async fn notify_listeners(&self, event: LifecycleEvent) -> Result<(), LifecycleError> {
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .get(&event.kind)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        let mut first_error = None;
        for listener in listeners {
            if let Err(source) = listener(event.clone()).await {
                first_error.get_or_insert(LifecycleError::Handler {
                    event: event.kind,
                    source,
                });
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn in_own_drain(&self) -> bool {
        DRAINING
            .try_with(|addr| *addr == self.address())
            .unwrap_or(false)
    }

    fn address(&self) -> usize {
        self as *const Self as usize
    }

    // =========================================================================
    // Pending operations
    // =========================================================================

    /// Run `operation` while tracking it as pending.
    ///
    /// The entry is removed when the operation settles, whatever its
    /// outcome. Reloads wait for all tracked operations first.
    pub async fn execute_operation<F, T>(&self, label: &str, operation: F) -> T
    where
        F: Future<Output = T>,
    {
        let id = self.next_operation.fetch_add(1, Ordering::Relaxed);
        let _guard = self.pending.try_insert(id, label);
        debug!(self.logger, "lifecycle"; "operation `{}` started ({} pending)", label, self.pending.len());
        let output = operation.await;
        debug!(self.logger, "lifecycle"; "operation `{}` settled", label);
        output
    }

    /// Resolve once every tracked operation has settled.
    pub async fn wait_for_pending_operations(&self) {
        self.pending.wait_empty().await;
    }

    /// Labels of operations currently in flight.
    pub fn pending_operations(&self) -> Vec<String> {
        self.pending.labels()
    }

    // =========================================================================
    // Reload
    // =========================================================================

    /// Run a full reload cycle, honoring the `[reload]` limits.
    ///
    /// Returns `Ok(false)` when the request was absorbed by the debounce
    /// window. A failing listener does not stop the cycle; its error is
    /// returned once the reload has completed.
    pub async fn request_reload(&self, reason: &str) -> Result<bool, LifecycleError> {
        {
            let mut history = self.reload_history.lock();
            let now = Instant::now();

            if let Some(last) = history.back()
                && now.duration_since(*last) < self.reload.debounce()
            {
                debug!(self.logger, "lifecycle"; "reload `{}` debounced", reason);
                return Ok(false);
            }

            while history
                .front()
                .is_some_and(|at| now.duration_since(*at) >= RELOAD_WINDOW)
            {
                history.pop_front();
            }
            if history.len() >= self.reload.max_per_minute as usize {
                warn!(self.logger, "lifecycle"; "reload `{}` refused: limit reached", reason);
                return Err(LifecycleError::ReloadLimitExceeded {
                    max: self.reload.max_per_minute,
                });
            }
            history.push_back(now);
        }

        log!(self.logger, "lifecycle"; "reload requested: {}", reason);
        let requested = self
            .emit_event(
                EventType::ReloadRequested,
                Some(serde_json::json!({ "reason": reason })),
                Some("coordinator"),
            )
            .await;
        // Complete even if a listener failed, or the state stays RELOADING
        tokio::time::sleep(self.reload.delay()).await;
        let completed = self
            .emit_event(EventType::ReloadCompleted, None, Some("coordinator"))
            .await;
        requested.and(completed).map(|_| true)
    }
}

/// Releases the draining flag if a drain is cancelled half-way. A waiter
/// or the next `emit_event` then drains the leftover events.
struct DrainGuard<'a> {
    coordinator: &'a Coordinator,
    finished: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut queue = self.coordinator.queue.lock();
        queue.draining = false;
        queue.parked = false;
        self.coordinator.drained.send_modify(|signal| {
            signal.epoch += 1;
            signal.parked = false;
        });
    }
}
