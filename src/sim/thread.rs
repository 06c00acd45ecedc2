//! Real OS threads for blocking native calls.
//!
//! External threads execute outside virtual time. The only ordered point
//! is their completion: a [`ThreadSignal`] posted from the thread re-enters
//! the task queue as a task bound to the process that spawned the thread,
//! so the waiting [`ThreadFuture`] resumes in the right execution context.

use std::future::Future;
use std::pin::Pin;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use crate::error::{SimulationError, SimulationResult};
use crate::events::TaskPriority;
use crate::process::ProcessId;
use crate::sim::WeakSimWorld;

/// Value cell shared between the external thread and the simulation.
#[derive(Debug)]
pub(crate) enum ThreadCell<T> {
    Empty,
    Value(T),
    Broken,
}

/// Completion message posted from an external thread back to the run loop.
#[derive(Debug)]
pub(crate) struct ExternalWake {
    pub(crate) process: ProcessId,
    pub(crate) priority: TaskPriority,
    pub(crate) task_id: u64,
}

/// Send half of a main-thread completion, held by an external thread.
///
/// Dropping the signal without sending resolves the waiting future with
/// [`SimulationError::BrokenPromise`].
pub struct ThreadSignal<T> {
    cell: Arc<Mutex<ThreadCell<T>>>,
    tx: Sender<ExternalWake>,
    process: ProcessId,
    priority: TaskPriority,
    task_id: u64,
    sent: bool,
}

impl<T> ThreadSignal<T> {
    pub(crate) fn new(
        cell: Arc<Mutex<ThreadCell<T>>>,
        tx: Sender<ExternalWake>,
        process: ProcessId,
        priority: TaskPriority,
        task_id: u64,
    ) -> Self {
        Self {
            cell,
            tx,
            process,
            priority,
            task_id,
            sent: false,
        }
    }

    /// Deliver the thread's result to the simulation.
    pub fn send(mut self, value: T) {
        if let Ok(mut cell) = self.cell.lock() {
            *cell = ThreadCell::Value(value);
        }
        self.post();
    }

    fn post(&mut self) {
        self.sent = true;
        // The run loop may already be gone; a dead channel just means the
        // completion is unobservable.
        let _ = self.tx.send(ExternalWake {
            process: self.process,
            priority: self.priority,
            task_id: self.task_id,
        });
    }
}

impl<T> Drop for ThreadSignal<T> {
    fn drop(&mut self) {
        if !self.sent {
            if let Ok(mut cell) = self.cell.lock() {
                *cell = ThreadCell::Broken;
            }
            self.post();
        }
    }
}

/// Simulation-side future for an external thread's result.
pub struct ThreadFuture<T> {
    sim: WeakSimWorld,
    cell: Arc<Mutex<ThreadCell<T>>>,
    task_id: u64,
    completed: bool,
}

impl<T> ThreadFuture<T> {
    pub(crate) fn new(
        sim: WeakSimWorld,
        cell: Arc<Mutex<ThreadCell<T>>>,
        task_id: u64,
    ) -> Self {
        Self {
            sim,
            cell,
            task_id,
            completed: false,
        }
    }
}

impl<T> Future for ThreadFuture<T> {
    type Output = SimulationResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.completed {
            return Poll::Ready(Err(SimulationError::BrokenPromise));
        }

        let sim = match this.sim.upgrade() {
            Ok(sim) => sim,
            Err(e) => return Poll::Ready(Err(e)),
        };

        if sim.take_task_awake(this.task_id) {
            this.completed = true;
            let mut cell = this
                .cell
                .lock()
                .map_err(|_| SimulationError::InvalidState("thread cell poisoned".to_string()))?;
            match std::mem::replace(&mut *cell, ThreadCell::Empty) {
                ThreadCell::Value(v) => Poll::Ready(Ok(v)),
                ThreadCell::Empty | ThreadCell::Broken => {
                    Poll::Ready(Err(SimulationError::BrokenPromise))
                }
            }
        } else {
            sim.register_task_waker(this.task_id, cx.waker().clone());
            Poll::Pending
        }
    }
}
