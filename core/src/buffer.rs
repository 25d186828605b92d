//! Time/size-windowed smoothing between the normalizer and the event sink.
//!
//! Providers emit output in many tiny writes; forwarding each one causes
//! visible jitter downstream. The buffer coalesces writes under three
//! knobs: a debounce that restarts on every write, a hard ceiling on how
//! long any byte may sit unflushed, and a minimum flush size that may
//! defer one debounce-worth of extra accumulation.
//!
//! All state lives behind one mutex and a single scheduler task computes
//! the next deadline from it. Emissions happen under the lock, so the
//! relative order of increments (and of a final `force_flush`) is fixed.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use relay_protocol::BufferedIncrement;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio::time::sleep_until;
use tracing::trace;

#[derive(Debug, Clone, Copy)]
pub struct BufferParams {
    /// Debounce window restarted by every write.
    pub partial_delay: Duration,
    /// Upper bound on how long the oldest unflushed byte may wait.
    pub max_wait_time: Duration,
    /// Flushes smaller than this defer once, hoping for more data.
    pub min_buffer_size: usize,
}

impl Default for BufferParams {
    fn default() -> Self {
        Self {
            partial_delay: Duration::from_millis(150),
            max_wait_time: Duration::from_secs(1),
            min_buffer_size: 50,
        }
    }
}

type EmitFn = dyn Fn(BufferedIncrement) + Send + Sync;

struct BufferState {
    accumulator: String,
    /// When the oldest unflushed byte arrived. Cleared on flush.
    pending_since: Option<Instant>,
    /// When the newest byte arrived; drives the debounce.
    last_data_at: Option<Instant>,
    deferred_once: bool,
    disposed: bool,
}

pub struct ResponseBuffer {
    params: BufferParams,
    state: Arc<Mutex<BufferState>>,
    notify: Arc<Notify>,
    emit: Arc<EmitFn>,
}

impl ResponseBuffer {
    pub fn new<F>(params: BufferParams, emit: F) -> Self
    where
        F: Fn(BufferedIncrement) + Send + Sync + 'static,
    {
        let state = Arc::new(Mutex::new(BufferState {
            accumulator: String::new(),
            pending_since: None,
            last_data_at: None,
            deferred_once: false,
            disposed: false,
        }));
        let notify = Arc::new(Notify::new());
        let emit: Arc<EmitFn> = Arc::new(emit);

        let buffer = Self {
            params,
            state,
            notify,
            emit,
        };
        buffer.spawn_scheduler();
        buffer
    }

    fn spawn_scheduler(&self) {
        let params = self.params;
        let state = Arc::clone(&self.state);
        let notify = Arc::clone(&self.notify);
        let emit = Arc::clone(&self.emit);
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let guard = lock(&state);
                    if guard.disposed {
                        break;
                    }
                    compute_deadline(&guard, &params)
                };
                match deadline {
                    Some(at) => {
                        tokio::select! {
                            _ = notify.notified() => {}
                            _ = sleep_until(at) => {
                                on_deadline(&state, &params, &emit);
                            }
                        }
                    }
                    None => notify.notified().await,
                }
            }
        });
    }

    /// Append normalized text. Restarts the debounce; the ceiling keeps
    /// counting from the oldest unflushed byte.
    pub fn process_data(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut guard = lock(&self.state);
        if guard.disposed {
            return;
        }
        let now = Instant::now();
        guard.accumulator.push_str(text);
        guard.last_data_at = Some(now);
        if guard.pending_since.is_none() {
            guard.pending_since = Some(now);
        }
        drop(guard);
        self.notify.notify_one();
    }

    /// Emit whatever remains as the final increment. The final increment
    /// is always emitted, even when empty, so downstream always sees a
    /// terminal marker for the turn's streamed content.
    pub fn force_flush(&self) {
        let mut guard = lock(&self.state);
        if guard.disposed {
            return;
        }
        let text = std::mem::take(&mut guard.accumulator);
        guard.pending_since = None;
        guard.last_data_at = None;
        guard.deferred_once = false;
        (self.emit)(BufferedIncrement {
            text,
            is_final: true,
        });
    }

    /// Stop the scheduler and refuse further data. Idempotent.
    pub fn dispose(&self) {
        let mut guard = lock(&self.state);
        if guard.disposed {
            return;
        }
        guard.disposed = true;
        guard.accumulator.clear();
        drop(guard);
        self.notify.notify_one();
    }
}

fn lock<'a>(state: &'a Arc<Mutex<BufferState>>) -> std::sync::MutexGuard<'a, BufferState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn compute_deadline(state: &BufferState, params: &BufferParams) -> Option<Instant> {
    let pending = state.pending_since?;
    let debounce = state.last_data_at.map(|at| at + params.partial_delay);
    let ceiling = pending + params.max_wait_time;
    Some(debounce.map_or(ceiling, |d| d.min(ceiling)))
}

fn on_deadline(state: &Arc<Mutex<BufferState>>, params: &BufferParams, emit: &Arc<EmitFn>) {
    let mut guard = lock(state);
    if guard.disposed || guard.accumulator.is_empty() {
        guard.pending_since = None;
        guard.last_data_at = None;
        return;
    }
    let now = Instant::now();
    let ceiling_hit = guard
        .pending_since
        .is_some_and(|since| now >= since + params.max_wait_time);
    if !ceiling_hit && guard.accumulator.len() < params.min_buffer_size && !guard.deferred_once {
        trace!(
            size = guard.accumulator.len(),
            "deferring below-minimum flush"
        );
        guard.deferred_once = true;
        guard.last_data_at = Some(now);
        return;
    }
    let text = std::mem::take(&mut guard.accumulator);
    guard.pending_since = None;
    guard.last_data_at = None;
    guard.deferred_once = false;
    emit(BufferedIncrement {
        text,
        is_final: false,
    });
}
