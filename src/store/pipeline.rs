use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::CombError;
use crate::metrics::StoreMetrics;
use crate::store::flush::WorkerJob;
use crate::store::records::{MessageKey, MessageRecord, QueueKey};
use crate::store::uow::{Uow, UowId, UowListener, UowPhase, UowResult};

/// Events processed in FIFO order on the coordinator thread. The three
/// pending maps are touched nowhere else.
pub(crate) enum PipelineEvent {
    Submit(Arc<Uow>),
    FlushMessage(MessageKey, UowListener),
    LoadMessage(MessageKey, Sender<Option<MessageRecord>>),
    WorkerDone {
        uows: Vec<Arc<Uow>>,
        error: Option<Arc<CombError>>,
    },
    Shutdown(Sender<()>),
}

struct DelayedUow {
    uow: Arc<Uow>,
    /// `Some` while waiting out the flush delay; `None` once queued.
    deadline: Option<Instant>,
}

struct EnqueueOwner {
    uow: Arc<Uow>,
    message_key: MessageKey,
}

pub(crate) fn spawn(
    events: Receiver<PipelineEvent>,
    worker: Sender<WorkerJob>,
    flush_delay_ms: i64,
    metrics: Arc<StoreMetrics>,
) -> JoinHandle<()> {
    let flush_delay = u64::try_from(flush_delay_ms)
        .ok()
        .map(Duration::from_millis);
    thread::spawn(move || {
        Coordinator {
            events,
            worker,
            flush_delay,
            pending_stores: HashMap::new(),
            pending_enqueues: HashMap::new(),
            delayed: HashMap::new(),
            flush_queue: Vec::new(),
            in_flight: 0,
            shutdown: None,
            metrics,
        }
        .run()
    })
}

struct Coordinator {
    events: Receiver<PipelineEvent>,
    worker: Sender<WorkerJob>,
    /// `None` disables delaying: every UOW flushes on submission.
    flush_delay: Option<Duration>,
    pending_stores: HashMap<MessageKey, Arc<Uow>>,
    pending_enqueues: HashMap<(QueueKey, u64), EnqueueOwner>,
    delayed: HashMap<UowId, DelayedUow>,
    flush_queue: Vec<UowId>,
    in_flight: usize,
    shutdown: Option<Sender<()>>,
    metrics: Arc<StoreMetrics>,
}

impl Coordinator {
    fn run(mut self) {
        loop {
            let event = match self.next_deadline() {
                None => match self.events.recv() {
                    Ok(event) => Some(event),
                    Err(_) => break,
                },
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    match self.events.recv_timeout(timeout) {
                        Ok(event) => Some(event),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            };
            if let Some(event) = event {
                self.handle(event);
                while let Ok(more) = self.events.try_recv() {
                    self.handle(more);
                }
            }
            self.queue_due_flushes();
            self.dispatch();
            if self.shutdown.is_some()
                && self.delayed.is_empty()
                && self.flush_queue.is_empty()
                && self.in_flight == 0
            {
                if let Some(ack) = self.shutdown.take() {
                    let _ = ack.send(());
                }
                break;
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed
            .values()
            .filter_map(|entry| entry.deadline)
            .min()
    }

    fn handle(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::Submit(uow) => self.handle_submit(uow),
            PipelineEvent::FlushMessage(key, listener) => self.handle_flush_message(key, listener),
            PipelineEvent::LoadMessage(key, reply) => {
                let found = self.pending_stores.get(&key).and_then(|uow| {
                    uow.state
                        .lock()
                        .actions
                        .get(&key)
                        .and_then(|action| action.record.clone())
                });
                let _ = reply.send(found);
            }
            PipelineEvent::WorkerDone { uows, error } => self.handle_worker_done(uows, error),
            PipelineEvent::Shutdown(ack) => {
                debug!(
                    delayed = self.delayed.len(),
                    in_flight = self.in_flight,
                    "pipeline draining"
                );
                self.shutdown = Some(ack);
                let ids: Vec<UowId> = self.delayed.keys().copied().collect();
                for id in ids {
                    self.queue_flush(id);
                }
            }
        }
    }

    /// Coordinator-side drain of one submitted UOW: match its dequeues
    /// against unflushed prior enqueues, register what survives, then
    /// delay or flush.
    fn handle_submit(&mut self, uow: Arc<Uow>) {
        self.metrics.record_uow_submitted();
        let id = uow.id;
        self.delayed.insert(
            id,
            DelayedUow {
                uow: Arc::clone(&uow),
                deadline: None,
            },
        );

        let dequeue_keys: Vec<(MessageKey, QueueKey, u64)> = {
            let state = uow.state.lock();
            state
                .actions
                .iter()
                .flat_map(|(message_key, action)| {
                    action
                        .dequeues
                        .iter()
                        .map(move |entry| (*message_key, entry.queue_key, entry.queue_seq))
                })
                .collect()
        };
        for (message_key, queue_key, queue_seq) in dequeue_keys {
            self.try_cancel_pair(&uow, message_key, queue_key, queue_seq);
        }

        let delayable = {
            let mut state = uow.state.lock();
            if state.actions.is_empty() {
                drop(state);
                self.cancel_uow(&uow);
                return;
            }
            state.phase = UowPhase::Delayed;
            for (key, action) in state.actions.iter() {
                if action.record.is_some() {
                    self.pending_stores.insert(*key, Arc::clone(&uow));
                }
                for entry in &action.enqueues {
                    self.pending_enqueues.insert(
                        (entry.queue_key, entry.queue_seq),
                        EnqueueOwner {
                            uow: Arc::clone(&uow),
                            message_key: *key,
                        },
                    );
                }
            }
            !state.disable_delay && state.delayable_actions > 0 && self.flush_delay.is_some()
        };

        if delayable && self.shutdown.is_none() {
            let delay = match self.flush_delay {
                Some(delay) => delay,
                None => return,
            };
            if let Some(entry) = self.delayed.get_mut(&id) {
                entry.deadline = Some(Instant::now() + delay);
            }
            debug!(uow = id, delay_ms = delay.as_millis() as u64, "UOW delayed");
        } else {
            self.queue_flush(id);
        }
    }

    /// Cancels a matched enqueue/dequeue pair so that neither side reaches
    /// disk. The prior UOW must not already be flushing.
    fn try_cancel_pair(
        &mut self,
        current: &Arc<Uow>,
        message_key: MessageKey,
        queue_key: QueueKey,
        queue_seq: u64,
    ) {
        let pair = (queue_key, queue_seq);
        let Some(owner) = self.pending_enqueues.get(&pair) else {
            return;
        };
        let prior = Arc::clone(&owner.uow);
        let prior_key = owner.message_key;
        if Arc::ptr_eq(&prior, current) {
            return;
        }

        let mut cancel_prior = false;
        let mut flush_prior = false;
        {
            let mut state = prior.state.lock();
            if matches!(
                state.phase,
                UowPhase::Flushing | UowPhase::Flushed | UowPhase::Canceled
            ) {
                return;
            }
            let Some(action) = state.actions.get_mut(&prior_key) else {
                return;
            };
            let Some(pos) = action
                .enqueues
                .iter()
                .position(|e| e.queue_key == queue_key && e.queue_seq == queue_seq)
            else {
                return;
            };
            action.enqueues.remove(pos);
            let mut delayable_dec = 1;
            let mut elided = false;
            if action.enqueues.is_empty() && action.record.is_some() {
                // The record has no queue left to be consumed from.
                action.record = None;
                delayable_dec += 1;
                elided = true;
            }
            let action_is_empty = action.is_empty();
            state.delayable_actions -= delayable_dec;
            if elided {
                self.pending_stores.remove(&prior_key);
                self.metrics.record_record_elided();
            }
            if action_is_empty {
                state.actions.remove(&prior_key);
            }
            if state.actions.is_empty() {
                cancel_prior = true;
            } else if !(!state.disable_delay
                && state.delayable_actions > 0
                && self.flush_delay.is_some())
            {
                flush_prior = true;
            }
        }
        self.pending_enqueues.remove(&pair);
        self.metrics.record_enqueue_canceled();
        debug!(
            queue = queue_key.0,
            seq = queue_seq,
            prior = prior.id,
            current = current.id,
            "canceled enqueue/dequeue pair"
        );

        if cancel_prior {
            self.cancel_uow(&prior);
        } else if flush_prior {
            self.queue_flush(prior.id);
        }

        let mut state = current.state.lock();
        if let Some(action) = state.actions.get_mut(&message_key) {
            if let Some(pos) = action
                .dequeues
                .iter()
                .position(|e| e.queue_key == queue_key && e.queue_seq == queue_seq)
            {
                action.dequeues.remove(pos);
            }
            if action.is_empty() {
                state.actions.remove(&message_key);
            }
        }
    }

    /// Retires a UOW whose actions all canceled. Listeners observe the
    /// same `Ok` they would on a successful flush.
    fn cancel_uow(&mut self, uow: &Arc<Uow>) {
        self.delayed.remove(&uow.id);
        self.flush_queue.retain(|id| *id != uow.id);
        let listeners = {
            let mut state = uow.state.lock();
            state.phase = UowPhase::Canceled;
            std::mem::take(&mut state.listeners)
        };
        self.metrics.record_uow_canceled();
        debug!(uow = uow.id, "UOW canceled");
        for listener in listeners {
            listener(Ok(()));
        }
    }

    fn handle_flush_message(&mut self, key: MessageKey, listener: UowListener) {
        match self.pending_stores.get(&key) {
            Some(uow) => {
                let id = uow.id;
                uow.state.lock().listeners.push(listener);
                self.queue_flush(id);
            }
            // Not in flight: already durable (or unknown), complete now.
            None => listener(Ok(())),
        }
    }

    fn handle_worker_done(&mut self, uows: Vec<Arc<Uow>>, error: Option<Arc<CombError>>) {
        self.in_flight -= 1;
        if let Some(err) = &error {
            warn!(uows = uows.len(), error = %err, "flush batch failed");
            self.metrics.record_flush_failure();
        }
        let result: UowResult = match &error {
            Some(err) => Err(Arc::clone(err)),
            None => Ok(()),
        };
        for uow in uows {
            let listeners = {
                let mut state = uow.state.lock();
                state.phase = UowPhase::Flushed;
                for (key, action) in state.actions.iter() {
                    if action.record.is_some() {
                        if let Some(owner) = self.pending_stores.get(key) {
                            if Arc::ptr_eq(owner, &uow) {
                                self.pending_stores.remove(key);
                            }
                        }
                    }
                    for entry in &action.enqueues {
                        let pair = (entry.queue_key, entry.queue_seq);
                        if let Some(owner) = self.pending_enqueues.get(&pair) {
                            if Arc::ptr_eq(&owner.uow, &uow) {
                                self.pending_enqueues.remove(&pair);
                            }
                        }
                    }
                }
                std::mem::take(&mut state.listeners)
            };
            if error.is_none() {
                self.metrics.record_uow_flushed();
            }
            for listener in listeners {
                listener(result.clone());
            }
        }
    }

    /// Marks a delayed UOW for the next flush batch.
    fn queue_flush(&mut self, id: UowId) {
        if let Some(entry) = self.delayed.get_mut(&id) {
            entry.deadline = None;
            if !self.flush_queue.contains(&id) {
                self.flush_queue.push(id);
            }
        }
    }

    fn queue_due_flushes(&mut self) {
        let now = Instant::now();
        let due: Vec<UowId> = self
            .delayed
            .iter()
            .filter(|(_, entry)| entry.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            self.queue_flush(id);
        }
    }

    /// Drains the flush queue into one batch for the worker. Canceled
    /// UOWs may already be gone; survivors are marked flushing, after
    /// which cancellation is refused.
    fn dispatch(&mut self) {
        if self.flush_queue.is_empty() {
            return;
        }
        let ids = std::mem::take(&mut self.flush_queue);
        let mut batch = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(entry) = self.delayed.remove(&id) else {
                continue;
            };
            let mut state = entry.uow.state.lock();
            if state.phase == UowPhase::Canceled {
                continue;
            }
            state.phase = UowPhase::Flushing;
            drop(state);
            batch.push(entry.uow);
        }
        if batch.is_empty() {
            return;
        }
        self.metrics.record_flush_batch();
        debug!(uows = batch.len(), "dispatching flush batch");
        self.in_flight += 1;
        if self.worker.send(WorkerJob::Store(batch)).is_err() {
            warn!("flush worker is unavailable");
            self.in_flight -= 1;
        }
    }
}
