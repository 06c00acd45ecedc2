//! The virtual-time task queue.
//!
//! Every suspension in the simulator is a [`ScheduledTask`] in a min-heap
//! ordered by `(time, sequence)`. The sequence number is assigned at
//! insertion, giving strict FIFO dispatch among tasks due at the same
//! virtual time. Priority is carried but never used for ordering; it only
//! feeds yielding decisions and observability.

use std::{cmp::Ordering, collections::BinaryHeap, time::Duration};

use crate::fault::KillType;
use crate::net::ConnectionId;
use crate::process::ProcessId;

/// Advisory task priority.
///
/// The integer values are stable and span `[MIN, MAX]`; scheduling order
/// is governed solely by time and sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskPriority {
    /// Lowest accepted priority.
    Min = 1_000,
    /// Disk write completions.
    DiskWrite = 5_000,
    /// Disk read completions.
    DiskRead = 5_010,
    /// Default for yields.
    DefaultYield = 7_000,
    /// Default for delays.
    DefaultDelay = 7_010,
    /// Incoming-connection handling.
    AcceptSocket = 8_950,
    /// Highest accepted priority.
    Max = 10_500,
}

/// What happens when a task is dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPayload {
    /// Deliver a completion signal to a waiting future.
    Wake {
        /// Identifier the waiting future polls on.
        task_id: u64,
    },
    /// Begin the reboot sequence on the owning process.
    Reboot {
        /// The kill type carried by the shutdown signal.
        kill_type: KillType,
    },
    /// Connection sender pump: publish written bytes as sent.
    SenderRun {
        /// Receiving endpoint of the transfer.
        conn: ConnectionId,
    },
    /// Connection receiver pump: bytes in flight toward the owner.
    ReceiverTransit {
        /// Receiving endpoint of the transfer.
        conn: ConnectionId,
        /// Byte position that will become visible on delivery.
        pos: u64,
    },
    /// Connection receiver pump: commit delivery on the owner.
    ReceiverDeliver {
        /// Receiving endpoint of the transfer.
        conn: ConnectionId,
        /// Byte position that becomes visible.
        pos: u64,
    },
    /// Offer an accepted endpoint to the owning process's listener.
    IncomingConnection {
        /// The accept-side endpoint.
        conn: ConnectionId,
    },
    /// Leak watchdog for an endpoint whose peer closed.
    LeakCheck {
        /// The surviving endpoint.
        conn: ConnectionId,
    },
}

/// A task scheduled for execution at a specific virtual time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTask {
    time: Duration,
    seq: u64,
    priority: TaskPriority,
    owner: ProcessId,
    payload: TaskPayload,
}

impl ScheduledTask {
    /// Creates a new scheduled task.
    pub fn new(
        time: Duration,
        seq: u64,
        priority: TaskPriority,
        owner: ProcessId,
        payload: TaskPayload,
    ) -> Self {
        Self {
            time,
            seq,
            priority,
            owner,
            payload,
        }
    }

    /// Scheduled execution time.
    pub fn time(&self) -> Duration {
        self.time
    }

    /// Insertion sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Advisory priority.
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    /// The process this task is bound to.
    pub fn owner(&self) -> ProcessId {
        self.owner
    }

    /// The payload, by reference.
    pub fn payload(&self) -> &TaskPayload {
        &self.payload
    }

    /// Consume the task and return its payload.
    pub fn into_payload(self) -> TaskPayload {
        self.payload
    }
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max heap; reverse so the earliest time pops
        // first, with sequence numbers breaking ties.
        match other.time.cmp(&self.time) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

/// Min-heap of scheduled tasks.
#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<ScheduledTask>,
}

impl TaskQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a task.
    pub fn schedule(&mut self, task: ScheduledTask) {
        self.heap.push(task);
    }

    /// Remove and return the earliest task.
    pub fn pop_earliest(&mut self) -> Option<ScheduledTask> {
        self.heap.pop()
    }

    /// Peek at the earliest task.
    pub fn peek_earliest(&self) -> Option<&ScheduledTask> {
        self.heap.peek()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.heap.len()
    }
}
