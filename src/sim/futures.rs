//! Futures that suspend on the virtual-time task queue.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::SimulationResult;
use crate::fault::KillType;
use crate::process::SharedShutdown;
use crate::sim::WeakSimWorld;

/// Completes when the task scheduled for it is dispatched.
///
/// If the owning process fails before dispatch, the task is silently
/// dropped and this future never completes.
pub struct TaskFuture {
    sim: WeakSimWorld,
    task_id: u64,
    completed: bool,
}

impl TaskFuture {
    pub(crate) fn new(sim: WeakSimWorld, task_id: u64) -> Self {
        Self {
            sim,
            task_id,
            completed: false,
        }
    }
}

impl Future for TaskFuture {
    type Output = SimulationResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.completed {
            return Poll::Ready(Ok(()));
        }

        let sim = match self.sim.upgrade() {
            Ok(sim) => sim,
            Err(e) => return Poll::Ready(Err(e)),
        };

        if sim.take_task_awake(self.task_id) {
            self.completed = true;
            Poll::Ready(Ok(()))
        } else {
            sim.register_task_waker(self.task_id, cx.waker().clone());
            Poll::Pending
        }
    }
}

/// A future that never completes.
///
/// Used where the simulator intentionally drops a continuation (failed
/// process, vanished connect peer).
pub struct Never;

impl Future for Never {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        Poll::Pending
    }
}

/// A future that never completes.
pub fn never() -> Never {
    Never
}

/// Result of [`SimWorld::yield_now`](crate::sim::SimWorld::yield_now):
/// either an immediate return or a real suspension.
pub enum YieldFuture {
    /// No yield point; completes on first poll.
    Ready,
    /// A true yield point, backed by a short delay.
    Suspend(TaskFuture),
}

impl Future for YieldFuture {
    type Output = SimulationResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut() {
            YieldFuture::Ready => Poll::Ready(Ok(())),
            YieldFuture::Suspend(task) => Pin::new(task).poll(cx),
        }
    }
}

/// Resolves with the kill type once the owning process's shutdown signal
/// fires.
pub struct ShutdownFuture {
    state: SharedShutdown,
}

impl ShutdownFuture {
    pub(crate) fn new(state: SharedShutdown) -> Self {
        Self { state }
    }
}

impl Future for ShutdownFuture {
    type Output = SimulationResult<KillType>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.borrow_mut();
        if let Some(kt) = state.kill_type {
            return Poll::Ready(Ok(kt));
        }
        state.wakers.push(cx.waker().clone());
        Poll::Pending
    }
}
