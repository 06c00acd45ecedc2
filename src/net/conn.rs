//! Connection and listener handles.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::address::{NetworkAddress, UID};
use crate::error::{SimulationError, SimulationResult};
use crate::process::ProcessId;
use crate::sim::WeakSimWorld;

use super::ConnectionId;

/// One endpoint of a simulated connection.
///
/// Handles must be closed explicitly; an endpoint whose peer closed and
/// that is not closed within the watchdog window is reported as leaked.
pub struct SimConnection {
    sim: WeakSimWorld,
    id: ConnectionId,
}

impl SimConnection {
    pub(crate) fn new(sim: WeakSimWorld, id: ConnectionId) -> Self {
        Self { sim, id }
    }

    /// Read as many bytes as available into `buf`; returns the count,
    /// possibly zero. A zero return with [`is_peer_gone`] set means
    /// end-of-stream.
    ///
    /// May fail with [`SimulationError::ConnectionFailed`] from random
    /// connection-failure injection.
    ///
    /// [`is_peer_gone`]: SimConnection::is_peer_gone
    pub fn read(&self, buf: &mut [u8]) -> SimulationResult<usize> {
        let sim = self.sim.upgrade()?;
        let mut inner = sim.inner_mut();
        super::read_from(&mut inner, self.id, buf)
    }

    /// Write up to `limit` bytes of `data` toward the peer, bounded by
    /// the peer's in-flight window. Returns the number of bytes accepted
    /// (zero when flow control is closed).
    pub fn write(&self, data: &[u8], limit: usize) -> SimulationResult<usize> {
        let sim = self.sim.upgrade()?;
        let mut inner = sim.inner_mut();
        super::write_to(&mut inner, self.id, data, limit)
    }

    /// Completes when bytes are readable or the peer is gone.
    pub fn on_readable(&self) -> ReadableFuture {
        ReadableFuture {
            sim: self.sim.clone(),
            id: self.id,
        }
    }

    /// Completes when the peer's in-flight window has room (or the peer
    /// is gone, in which case writes become no-ops).
    ///
    /// The window-opening wakeup happens in the peer's context, so the
    /// future re-binds to the owning process before completing.
    pub fn on_writable(&self) -> WritableFuture {
        WritableFuture {
            sim: self.sim.clone(),
            id: self.id,
            rebind: None,
        }
    }

    /// Close this endpoint. Idempotent.
    pub fn close(&self) {
        if let Ok(sim) = self.sim.upgrade() {
            let mut inner = sim.inner_mut();
            super::close_by_caller(&mut inner, self.id);
        }
    }

    /// The remote address as seen by this endpoint. For accepted
    /// connections this is a synthesized ephemeral address.
    pub fn peer_address(&self) -> SimulationResult<NetworkAddress> {
        let sim = self.sim.upgrade()?;
        let inner = sim.inner_mut();
        inner
            .connections
            .get(&self.id)
            .map(|c| c.peer_address)
            .ok_or(SimulationError::ConnectionFailed)
    }

    /// Debug identifier of this endpoint.
    pub fn debug_id(&self) -> SimulationResult<UID> {
        let sim = self.sim.upgrade()?;
        let inner = sim.inner_mut();
        inner
            .connections
            .get(&self.id)
            .map(|c| c.dbgid)
            .ok_or(SimulationError::ConnectionFailed)
    }

    /// Whether the peer endpoint is gone (closed, reaped, or on a failed
    /// process).
    pub fn is_peer_gone(&self) -> bool {
        match self.sim.upgrade() {
            Ok(sim) => {
                let inner = sim.inner_mut();
                super::is_peer_gone(&inner, self.id)
            }
            Err(_) => true,
        }
    }

    /// Bytes delivered but not yet read.
    pub fn bytes_available(&self) -> u64 {
        match self.sim.upgrade() {
            Ok(sim) => {
                let inner = sim.inner_mut();
                inner
                    .connections
                    .get(&self.id)
                    .map(|c| c.received_bytes - c.read_bytes)
                    .unwrap_or(0)
            }
            Err(_) => 0,
        }
    }
}

impl std::fmt::Debug for SimConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimConnection").field("id", &self.id.0).finish()
    }
}

/// Future for [`SimConnection::on_readable`].
pub struct ReadableFuture {
    sim: WeakSimWorld,
    id: ConnectionId,
}

impl Future for ReadableFuture {
    type Output = SimulationResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let sim = match self.sim.upgrade() {
            Ok(sim) => sim,
            Err(e) => return Poll::Ready(Err(e)),
        };
        let mut inner = sim.inner_mut();

        let Some(c) = inner.connections.get(&self.id) else {
            return Poll::Ready(Err(SimulationError::ConnectionFailed));
        };
        if c.received_bytes > c.read_bytes {
            // Data became visible; roll the failure dice like any other
            // wakeup from the receive path.
            return match super::roll_random_close(&mut inner, self.id) {
                Ok(()) => Poll::Ready(Ok(())),
                Err(e) => Poll::Ready(Err(e)),
            };
        }
        // End-of-stream: the peer is gone and nothing more is in flight
        // toward us. In-flight bytes from a closed (but not failed) peer
        // still get delivered first.
        if c.closed
            || (c.written_bytes == c.received_bytes && super::is_peer_gone(&inner, self.id))
        {
            return Poll::Ready(Ok(()));
        }
        inner
            .read_wakers
            .entry(self.id)
            .or_default()
            .push(cx.waker().clone());
        Poll::Pending
    }
}

/// Future for [`SimConnection::on_writable`].
pub struct WritableFuture {
    sim: WeakSimWorld,
    id: ConnectionId,
    /// Pending zero-delay context switch back to the owning process.
    rebind: Option<u64>,
}

impl Future for WritableFuture {
    type Output = SimulationResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let sim = match this.sim.upgrade() {
            Ok(sim) => sim,
            Err(e) => return Poll::Ready(Err(e)),
        };

        if let Some(task_id) = this.rebind {
            if sim.take_task_awake(task_id) {
                return Poll::Ready(Ok(()));
            }
            sim.register_task_waker(task_id, cx.waker().clone());
            return Poll::Pending;
        }

        let mut inner = sim.inner_mut();
        let Some(c) = inner.connections.get(&this.id) else {
            return Poll::Ready(Err(SimulationError::ConnectionFailed));
        };
        let owner = c.owner;
        let Some(peer_id) = c.peer else {
            // Writes to a vanished peer complete (and are discarded).
            return Poll::Ready(Ok(()));
        };
        let writable = inner
            .connections
            .get(&peer_id)
            .map(|peer| peer.available_send_window() > 0)
            .unwrap_or(true);

        if writable {
            if inner.current_process == owner {
                return Poll::Ready(Ok(()));
            }
            // The window opened in the peer's context; switch back before
            // letting the writer proceed.
            let task_id = inner.alloc_task_id();
            inner.schedule(
                crate::events::TaskPayload::Wake { task_id },
                std::time::Duration::ZERO,
                crate::events::TaskPriority::DefaultDelay,
                owner,
            );
            this.rebind = Some(task_id);
            drop(inner);
            sim.register_task_waker(task_id, cx.waker().clone());
            return Poll::Pending;
        }

        // Woken when the peer's received position advances.
        inner
            .write_wakers
            .entry(peer_id)
            .or_default()
            .push(cx.waker().clone());
        Poll::Pending
    }
}

/// Per-process inbound-connection queue.
pub struct SimListener {
    sim: WeakSimWorld,
    process: ProcessId,
}

impl SimListener {
    pub(crate) fn new(sim: WeakSimWorld, process: ProcessId) -> Self {
        Self { sim, process }
    }

    /// Accept the next inbound connection.
    pub fn accept(&self) -> AcceptFuture {
        AcceptFuture {
            sim: self.sim.clone(),
            process: self.process,
        }
    }

    /// The address this listener is bound to.
    pub fn local_address(&self) -> SimulationResult<NetworkAddress> {
        let sim = self.sim.upgrade()?;
        let inner = sim.inner_mut();
        Ok(inner.process(self.process).address)
    }
}

/// Future for [`SimListener::accept`].
pub struct AcceptFuture {
    sim: WeakSimWorld,
    process: ProcessId,
}

impl Future for AcceptFuture {
    type Output = SimulationResult<SimConnection>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let sim = match self.sim.upgrade() {
            Ok(sim) => sim,
            Err(e) => return Poll::Ready(Err(e)),
        };
        let mut inner = sim.inner_mut();

        if let Some(id) = inner.process_mut(self.process).listener_queue.pop_front() {
            if let Some(c) = inner.connections.get_mut(&id) {
                c.opened = true;
            }
            return Poll::Ready(Ok(SimConnection::new(self.sim.clone(), id)));
        }
        inner
            .accept_wakers
            .entry(self.process)
            .or_default()
            .push(cx.waker().clone());
        Poll::Pending
    }
}
