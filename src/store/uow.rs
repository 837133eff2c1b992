use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::CombError;
use crate::store::pipeline::PipelineEvent;
use crate::store::records::{MessageKey, MessageRecord, QueueEntryRecord};

pub type UowId = u64;

/// Outcome delivered to completion listeners. Cancellation and a
/// successful flush both deliver `Ok(())`; a flush failure carries the
/// error.
pub type UowResult = std::result::Result<(), Arc<CombError>>;

pub type UowListener = Box<dyn FnOnce(UowResult) + Send>;

/// Lifecycle of a unit of work.
///
/// `Building → Submitted → (Canceled | Delayed → Flushing → Flushed)`.
/// A delayed UOW may still cancel; a flushing one may not.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UowPhase {
    Building,
    Submitted,
    Delayed,
    Flushing,
    Flushed,
    Canceled,
}

/// Everything the store knows about one message inside a UOW: at most one
/// record plus the ordered enqueues and dequeues referencing it.
#[derive(Clone, Debug, Default)]
pub(crate) struct MessageAction {
    pub record: Option<MessageRecord>,
    pub enqueues: Vec<QueueEntryRecord>,
    pub dequeues: Vec<QueueEntryRecord>,
}

impl MessageAction {
    /// An action is empty iff it carries no record and both entry lists
    /// are empty.
    pub fn is_empty(&self) -> bool {
        self.record.is_none() && self.enqueues.is_empty() && self.dequeues.is_empty()
    }
}

pub(crate) struct UowState {
    pub phase: UowPhase,
    pub actions: BTreeMap<MessageKey, MessageAction>,
    pub listeners: Vec<UowListener>,
    pub disable_delay: bool,
    pub delayable_actions: i64,
}

/// A broker-level batch of message and queue actions.
///
/// The submitting thread owns the state before dispose, the coordinator
/// after; the mutex serializes that handover.
pub(crate) struct Uow {
    pub id: UowId,
    pub state: Mutex<UowState>,
}

impl Uow {
    pub fn new(id: UowId) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(UowState {
                phase: UowPhase::Building,
                actions: BTreeMap::new(),
                listeners: Vec::new(),
                disable_delay: false,
                delayable_actions: 0,
            }),
        })
    }
}

/// Caller-side handle to a unit of work.
///
/// Dropping the handle disposes the UOW: it is handed to the pipeline
/// coordinator, which may delay, cancel, or flush it. `complete` is the
/// eager form of the same handover.
pub struct StoreUow {
    uow: Arc<Uow>,
    events: Sender<PipelineEvent>,
    next_message_key: Arc<AtomicU64>,
    submitted: bool,
}

impl StoreUow {
    pub(crate) fn new(
        id: UowId,
        events: Sender<PipelineEvent>,
        next_message_key: Arc<AtomicU64>,
    ) -> Self {
        Self {
            uow: Uow::new(id),
            events,
            next_message_key,
            submitted: false,
        }
    }

    pub fn id(&self) -> UowId {
        self.uow.id
    }

    /// Stages a message record, assigning it the next message key.
    pub fn store(&self, record: MessageRecord) -> MessageKey {
        let key = MessageKey(self.next_message_key.fetch_add(1, Ordering::SeqCst) + 1);
        let mut state = self.uow.state.lock();
        state.actions.entry(key).or_default().record = Some(record);
        state.delayable_actions += 1;
        key
    }

    /// Stages an enqueue of a previously stored message.
    pub fn enqueue(&self, entry: QueueEntryRecord) {
        let mut state = self.uow.state.lock();
        state
            .actions
            .entry(entry.message_key)
            .or_default()
            .enqueues
            .push(entry);
        state.delayable_actions += 1;
    }

    /// Stages a dequeue. Dequeues do not count toward delayability; a UOW
    /// of pure dequeues flushes immediately.
    pub fn dequeue(&self, entry: QueueEntryRecord) {
        let mut state = self.uow.state.lock();
        state
            .actions
            .entry(entry.message_key)
            .or_default()
            .dequeues
            .push(entry);
    }

    /// Registers a callback invoked exactly once when the UOW is durably
    /// stored or canceled.
    pub fn on_complete(&self, listener: impl FnOnce(UowResult) + Send + 'static) {
        self.uow.state.lock().listeners.push(Box::new(listener));
    }

    /// Asks the pipeline to skip the flush delay for this UOW.
    pub fn complete_asap(&self) {
        self.uow.state.lock().disable_delay = true;
    }

    /// Disposes the UOW, handing it to the coordinator.
    pub fn complete(mut self) {
        self.submit();
    }

    fn submit(&mut self) {
        if self.submitted {
            return;
        }
        self.submitted = true;
        self.uow.state.lock().phase = UowPhase::Submitted;
        if self
            .events
            .send(PipelineEvent::Submit(Arc::clone(&self.uow)))
            .is_err()
        {
            warn!(uow = self.uow.id, "store closed before UOW submission");
            let listeners = std::mem::take(&mut self.uow.state.lock().listeners);
            let error = Arc::new(CombError::Invalid("store is closed"));
            for listener in listeners {
                listener(Err(Arc::clone(&error)));
            }
        }
    }
}

impl Drop for StoreUow {
    fn drop(&mut self) {
        self.submit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::records::QueueKey;

    fn entry(queue: u64, seq: u64, message: u64) -> QueueEntryRecord {
        QueueEntryRecord {
            queue_key: QueueKey(queue),
            queue_seq: seq,
            message_key: MessageKey(message),
            size: 0,
        }
    }

    #[test]
    fn action_is_empty_only_without_record_and_entries() {
        let mut action = MessageAction::default();
        assert!(action.is_empty());

        action.record = Some(MessageRecord {
            message_id: "m".into(),
            payload: Vec::new(),
        });
        assert!(!action.is_empty());

        action.record = None;
        action.enqueues.push(entry(1, 1, 1));
        assert!(!action.is_empty());

        // An action holding only dequeues is not empty either.
        action.enqueues.clear();
        action.dequeues.push(entry(1, 1, 1));
        assert!(!action.is_empty());
    }

    #[test]
    fn staged_actions_count_delayables() {
        let (events, _rx) = std::sync::mpsc::channel();
        let counter = Arc::new(AtomicU64::new(10));
        let uow = StoreUow::new(1, events, counter);

        let key = uow.store(MessageRecord {
            message_id: "m-11".into(),
            payload: b"hello".to_vec(),
        });
        assert_eq!(key, MessageKey(11));
        uow.enqueue(entry(1, 1, key.0));
        uow.dequeue(entry(2, 9, key.0));

        let state = uow.uow.state.lock();
        assert_eq!(state.delayable_actions, 2);
        let action = state.actions.get(&key).unwrap();
        assert!(action.record.is_some());
        assert_eq!(action.enqueues.len(), 1);
        assert_eq!(action.dequeues.len(), 1);
    }
}
