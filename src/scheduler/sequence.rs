//! Ordered task storage: sequences and their sort keys.
//!
//! A [`Sequence`] is a FIFO of task slots guaranteed to execute in order on
//! at most one thread at a time. While a worker runs a task, the executed
//! slot stays in the sequence; it is popped only afterwards. Posts that land
//! in the meantime therefore observe a non-empty sequence and do not try to
//! schedule it a second time.

use super::task::Task;
use super::task_traits::{TaskPriority, TaskTraits};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// Identifier of a sequence, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SequenceToken(u64);

impl SequenceToken {
    /// Allocates a fresh token.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value of the token.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Ordering key of a sequence in the shared priority queue.
///
/// A greater key schedules sooner: higher priority first, then older front
/// task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceSortKey {
    priority: TaskPriority,
    next_task_sequenced_time: Instant,
}

impl SequenceSortKey {
    /// Creates a sort key.
    pub fn new(priority: TaskPriority, next_task_sequenced_time: Instant) -> Self {
        Self {
            priority,
            next_task_sequenced_time,
        }
    }

    /// Highest priority among queued tasks.
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    /// Sequenced time of the front task.
    pub fn next_task_sequenced_time(&self) -> Instant {
        self.next_task_sequenced_time
    }
}

impl PartialOrd for SequenceSortKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SequenceSortKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority.cmp(&other.priority).then_with(|| {
            // Older front task wins within equal priority.
            other
                .next_task_sequenced_time
                .cmp(&self.next_task_sequenced_time)
        })
    }
}

struct SequenceState {
    // `None` marks the slot whose task is currently being run.
    slots: VecDeque<Option<Task>>,
    num_tasks_per_priority: [usize; 3],
}

/// A FIFO of task slots with an embedded traits field.
pub struct Sequence {
    token: SequenceToken,
    traits: TaskTraits,
    state: Mutex<SequenceState>,
}

impl Sequence {
    /// Creates an empty sequence carrying `traits`.
    pub fn new(traits: TaskTraits) -> Self {
        Self {
            token: SequenceToken::next(),
            traits,
            state: Mutex::new(SequenceState {
                slots: VecDeque::new(),
                num_tasks_per_priority: [0; 3],
            }),
        }
    }

    /// The sequence's token.
    pub fn token(&self) -> SequenceToken {
        self.token
    }

    /// The traits the sequence was created with.
    pub fn traits(&self) -> TaskTraits {
        self.traits
    }

    /// Acquires exclusive access to the sequence.
    ///
    /// Exactly one transaction may be live for a sequence at a time;
    /// acquiring one blocks while another is active.
    pub fn begin_transaction(&self) -> SequenceTransaction<'_> {
        SequenceTransaction {
            state: self.state.lock().unwrap(),
        }
    }
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequence")
            .field("token", &self.token)
            .field("traits", &self.traits)
            .finish()
    }
}

/// Scoped exclusive-access handle over a [`Sequence`].
pub struct SequenceTransaction<'a> {
    state: MutexGuard<'a, SequenceState>,
}

impl SequenceTransaction<'_> {
    /// Appends `task` to the back of the sequence and returns whether the
    /// sequence was empty before the push. Callers use the return value to
    /// decide whether the sequence must be (re)scheduled.
    pub fn push_task(&mut self, mut task: Task) -> bool {
        let was_empty = self.state.slots.is_empty();
        task.set_sequenced_time(Instant::now());
        self.state.num_tasks_per_priority[task.traits().priority().index()] += 1;
        self.state.slots.push_back(Some(task));
        was_empty
    }

    /// Moves the front task out for execution. The emptied slot stays until
    /// [`SequenceTransaction::pop_front_slot`].
    ///
    /// Panics if the sequence is empty or the front task was already taken.
    pub fn take_front_task(&mut self) -> Task {
        let slot = self
            .state
            .slots
            .front_mut()
            .expect("take_front_task on empty sequence");
        let task = slot.take().expect("front task already taken");
        self.state.num_tasks_per_priority[task.traits().priority().index()] -= 1;
        task
    }

    /// Removes the front slot after its task ran (or was skipped). Returns
    /// whether the sequence is empty afterwards.
    pub fn pop_front_slot(&mut self) -> bool {
        let slot = self
            .state
            .slots
            .pop_front()
            .expect("pop_front_slot on empty sequence");
        debug_assert!(slot.is_none(), "pop_front_slot before take_front_task");
        self.state.slots.is_empty()
    }

    /// Whether the sequence holds no slots at all.
    pub fn is_empty(&self) -> bool {
        self.state.slots.is_empty()
    }

    /// Number of slots, including a slot whose task is mid-run.
    pub fn len(&self) -> usize {
        self.state.slots.len()
    }

    /// Computes the sort key from the current contents.
    ///
    /// Must not be called on an empty sequence or while the front task is
    /// taken out for execution.
    pub fn sort_key(&self) -> SequenceSortKey {
        let priority = TaskPriority::ALL
            .iter()
            .rev()
            .find(|p| self.state.num_tasks_per_priority[p.index()] > 0)
            .copied()
            .expect("sort_key on sequence with no queued tasks");
        let front = self
            .state
            .slots
            .front()
            .and_then(|slot| slot.as_ref())
            .expect("sort_key while front task is running");
        SequenceSortKey::new(
            priority,
            front.sequenced_time().expect("front task never sequenced"),
        )
    }

    /// Drains every remaining task, returning how many were dropped. Used at
    /// teardown to break task -> runner reference cycles.
    pub fn clear(&mut self) -> usize {
        let dropped = self
            .state
            .slots
            .iter()
            .filter(|slot| slot.is_some())
            .count();
        self.state.slots.clear();
        self.state.num_tasks_per_priority = [0; 3];
        dropped
    }
}
