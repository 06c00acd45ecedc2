//! The in-memory connection graph.
//!
//! A connection is a pair of endpoints. Each endpoint owns the receive
//! side of one direction: its counters track bytes flowing *toward* it
//! (`written` by the peer, then `sent`, then `received`, then `read` by
//! the owner), with `read ≤ received ≤ sent ≤ written` at all times.
//! Propagation from `written` to `received` is performed by two pump task
//! chains per endpoint that model sender flush and in-flight transit with
//! per-pair latency and clogging.

pub mod clog;
mod conn;

pub use clog::ClogMode;
pub use conn::{AcceptFuture, ReadableFuture, SimConnection, SimListener, WritableFuture};

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::address::{NetworkAddress, UID};
use crate::error::{SimulationError, SimulationResult};
use crate::events::{TaskPayload, TaskPriority};
use crate::process::ProcessId;
use crate::rng::{random_unique_id, sim_random01, sim_random_range};
use crate::sim::{SimInner, SimWorld, dur};

/// Handle to one endpoint of a connection pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

/// Virtual time a peer may outlive a closed endpoint before the leak
/// watchdog fires.
const LEAK_WATCHDOG: Duration = Duration::from_secs(20);

pub(crate) struct ConnectionState {
    pub(crate) id: ConnectionId,
    pub(crate) owner: ProcessId,
    pub(crate) owner_ip: Ipv4Addr,
    pub(crate) peer: Option<ConnectionId>,
    pub(crate) peer_process: ProcessId,
    pub(crate) peer_ip: Ipv4Addr,
    pub(crate) dbgid: UID,
    pub(crate) peer_id: UID,
    /// What the owner sees as the remote address. For accepted
    /// connections this is a synthesized ephemeral address, not one that
    /// can be connected to.
    pub(crate) peer_address: NetworkAddress,

    /// Bytes written by the peer but not yet read; the window
    /// `received - read` at the front is readable now.
    pub(crate) recv_buf: VecDeque<u8>,
    pub(crate) read_bytes: u64,
    pub(crate) received_bytes: u64,
    pub(crate) sent_bytes: u64,
    pub(crate) written_bytes: u64,
    pub(crate) send_buf_size: u64,

    pub(crate) opened: bool,
    pub(crate) closed: bool,
    pub(crate) closed_by_caller: bool,
    pub(crate) sender_scheduled: bool,
    pub(crate) receiver_active: bool,
    pub(crate) leak_armed: bool,
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("id", &self.id)
            .field("read", &self.read_bytes)
            .field("received", &self.received_bytes)
            .field("sent", &self.sent_bytes)
            .field("written", &self.written_bytes)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ConnectionState {
    /// Free space in the in-flight window toward this endpoint.
    pub(crate) fn available_send_window(&self) -> u64 {
        let in_flight = self.written_bytes - self.received_bytes;
        debug_assert!(in_flight <= self.send_buf_size, "send window overrun");
        self.send_buf_size.saturating_sub(in_flight)
    }

    fn check_counters(&self) {
        debug_assert!(self.read_bytes <= self.received_bytes);
        debug_assert!(self.received_bytes <= self.sent_bytes);
        debug_assert!(self.sent_bytes <= self.written_bytes);
        debug_assert_eq!(
            self.recv_buf.len() as u64,
            self.written_bytes - self.read_bytes
        );
    }
}

/// Whether `conn`'s peer endpoint is unusable: absent, closed, or owned
/// by a failed process.
pub(crate) fn is_peer_gone(inner: &SimInner, conn: ConnectionId) -> bool {
    let Some(c) = inner.connections.get(&conn) else {
        return true;
    };
    let Some(peer_id) = c.peer else {
        return true;
    };
    let peer_closed = inner
        .connections
        .get(&peer_id)
        .is_none_or(|p| p.closed);
    peer_closed
        || inner
            .processes
            .get(&c.peer_process)
            .is_none_or(|p| p.failed)
}

/// Create a connected endpoint pair. `local` owns the outgoing endpoint,
/// `target` the accept-side endpoint. Returns `(outgoing, incoming)`.
pub(crate) fn create_pair(
    inner: &mut SimInner,
    local: ProcessId,
    target: ProcessId,
    to_addr: NetworkAddress,
) -> (ConnectionId, ConnectionId) {
    let my_id = ConnectionId(inner.next_connection_id);
    inner.next_connection_id += 1;
    let peer_id = ConnectionId(inner.next_connection_id);
    inner.next_connection_id += 1;

    let local_ip = inner.process(local).address.ip;
    let target_ip = inner.process(target).address.ip;
    let my_dbgid = random_unique_id();
    let peer_dbgid = random_unique_id();

    // Each direction gets a permanent latency and a send buffer sized
    // from it at first contact.
    let max_clog = inner.knobs.max_clogging_latency;
    let my_latency = inner
        .clogging
        .pair_latency_or_init(target_ip, local_ip, max_clog);
    let my_buf = (sim_random_range(0u64..5_000_000) as f64).max(25e6 * (my_latency + 0.002)) as u64;
    let peer_latency = inner
        .clogging
        .pair_latency_or_init(local_ip, target_ip, max_clog);
    let peer_buf =
        (sim_random_range(0u64..5_000_000) as f64).max(25e6 * (peer_latency + 0.002)) as u64;
    tracing::debug!(
        send_buf = my_buf,
        latency = my_latency,
        "connection pair created"
    );

    // The accept side observes an ephemeral NAT-style address near the
    // connecting host.
    let synth = NetworkAddress::from_raw_ip(
        u32::from(local_ip).wrapping_add(sim_random_range(0u32..256)),
        sim_random_range(40_000u32..60_000) as u16,
    );

    inner.connections.insert(
        my_id,
        ConnectionState {
            id: my_id,
            owner: local,
            owner_ip: local_ip,
            peer: Some(peer_id),
            peer_process: target,
            peer_ip: target_ip,
            dbgid: my_dbgid,
            peer_id: peer_dbgid,
            peer_address: to_addr,
            recv_buf: VecDeque::new(),
            read_bytes: 0,
            received_bytes: 0,
            sent_bytes: 0,
            written_bytes: 0,
            send_buf_size: my_buf,
            opened: false,
            closed: false,
            closed_by_caller: false,
            sender_scheduled: false,
            receiver_active: false,
            leak_armed: false,
        },
    );
    inner.connections.insert(
        peer_id,
        ConnectionState {
            id: peer_id,
            owner: target,
            owner_ip: target_ip,
            peer: Some(my_id),
            peer_process: local,
            peer_ip: local_ip,
            dbgid: peer_dbgid,
            peer_id: my_dbgid,
            peer_address: synth,
            recv_buf: VecDeque::new(),
            read_bytes: 0,
            received_bytes: 0,
            sent_bytes: 0,
            written_bytes: 0,
            send_buf_size: peer_buf,
            opened: false,
            closed: false,
            closed_by_caller: false,
            sender_scheduled: false,
            receiver_active: false,
            leak_armed: false,
        },
    );

    (my_id, peer_id)
}

/// Read from `conn`'s receive buffer into `buf`. Returns bytes moved
/// (possibly zero).
pub(crate) fn read_from(
    inner: &mut SimInner,
    conn: ConnectionId,
    buf: &mut [u8],
) -> SimulationResult<usize> {
    roll_random_close(inner, conn)?;
    let Some(c) = inner.connections.get_mut(&conn) else {
        return Err(SimulationError::ConnectionFailed);
    };
    let avail = (c.received_bytes - c.read_bytes) as usize;
    let n = buf.len().min(avail);
    for slot in buf.iter_mut().take(n) {
        *slot = c.recv_buf.pop_front().ok_or(SimulationError::InvalidState(
            "receive buffer underrun".to_string(),
        ))?;
    }
    c.read_bytes += n as u64;
    c.check_counters();
    Ok(n)
}

/// Write up to `limit` bytes of `data` toward `conn`'s peer. Returns the
/// number of bytes accepted by the peer's in-flight window.
pub(crate) fn write_to(
    inner: &mut SimInner,
    conn: ConnectionId,
    data: &[u8],
    limit: usize,
) -> SimulationResult<usize> {
    assert!(limit > 0, "write limit must be positive");
    roll_random_close(inner, conn)?;
    let Some(c) = inner.connections.get(&conn) else {
        return Err(SimulationError::ConnectionFailed);
    };

    let mut to_send = data.len().min(limit);
    if crate::buggify!() {
        to_send = to_send.min(sim_random_range(0usize..1000));
    }

    let Some(peer_id) = c.peer else {
        // Peer already torn down: pretend the bytes went out.
        return Ok(to_send);
    };
    let Some(peer) = inner.connections.get_mut(&peer_id) else {
        return Ok(to_send);
    };

    to_send = to_send.min(peer.available_send_window() as usize);
    peer.recv_buf.extend(&data[..to_send]);
    peer.written_bytes += to_send as u64;
    peer.check_counters();

    if to_send > 0 {
        ensure_sender(inner, peer_id);
    }
    Ok(to_send)
}

/// Schedule the sender pump for an endpoint whose `written` advanced.
/// Runs in the writing process's context.
fn ensure_sender(inner: &mut SimInner, conn: ConnectionId) {
    let Some(c) = inner.connections.get_mut(&conn) else {
        return;
    };
    if c.sender_scheduled || c.sent_bytes == c.written_bytes {
        return;
    }
    c.sender_scheduled = true;
    let owner = c.peer_process;
    let d = dur(0.002 * sim_random01());
    inner.schedule(
        TaskPayload::SenderRun { conn },
        d,
        TaskPriority::DefaultDelay,
        owner,
    );
}

/// Sender pump: publish written bytes as sent, then hand off to the
/// receiver pump.
pub(crate) fn sender_run(inner: &mut SimInner, conn: ConnectionId) {
    let Some(c) = inner.connections.get_mut(&conn) else {
        return;
    };
    c.sender_scheduled = false;
    c.sent_bytes = c.written_bytes;
    c.check_counters();
    maybe_start_receiver(inner, conn);
}

/// Start the receiver pump if bytes are in flight and it is idle.
fn maybe_start_receiver(inner: &mut SimInner, conn: ConnectionId) {
    let (owner_ip, peer_ip, peer_process, pos) = {
        let Some(c) = inner.connections.get_mut(&conn) else {
            return;
        };
        if c.receiver_active || c.sent_bytes == c.received_bytes {
            return;
        }
        c.receiver_active = true;
        // Partial delivery: sometimes surface only a prefix of what was
        // sent, forcing readers to handle short reads.
        let pos = if sim_random01() < 0.5 {
            c.sent_bytes
        } else {
            sim_random_range(c.received_bytes + 1..c.sent_bytes + 1)
        };
        (c.owner_ip, c.peer_ip, c.peer_process, pos)
    };

    let now = inner.now.as_secs_f64();
    let send_delay = inner.clogging.send_delay(
        now,
        &inner.knobs,
        inner.speed_up_simulation,
        owner_ip,
        peer_ip,
    );
    inner.schedule(
        TaskPayload::ReceiverTransit { conn, pos },
        dur(send_delay),
        TaskPriority::DefaultDelay,
        peer_process,
    );
}

/// Receiver pump, transit leg: the bytes leave the sending interface.
pub(crate) fn receiver_transit(inner: &mut SimInner, conn: ConnectionId, pos: u64) {
    let Some(c) = inner.connections.get(&conn) else {
        return;
    };
    let (owner, owner_ip, peer_ip) = (c.owner, c.owner_ip, c.peer_ip);
    let now = inner.now.as_secs_f64();
    let recv_delay = inner.clogging.recv_delay(
        now,
        &inner.knobs,
        inner.speed_up_simulation,
        owner_ip,
        peer_ip,
    );
    inner.schedule(
        TaskPayload::ReceiverDeliver { conn, pos },
        dur(recv_delay),
        TaskPriority::DefaultDelay,
        owner,
    );
}

/// Receiver pump, delivery leg: commit the new received position and wake
/// readers and flow-controlled writers.
pub(crate) fn receiver_deliver(inner: &mut SimInner, conn: ConnectionId, pos: u64) {
    {
        let Some(c) = inner.connections.get_mut(&conn) else {
            return;
        };
        debug_assert!(pos >= c.received_bytes && pos <= c.sent_bytes);
        c.received_bytes = pos;
        c.receiver_active = false;
        c.check_counters();
    }
    wake_connection(inner, conn);
    maybe_start_receiver(inner, conn);
}

/// Wake readers of `conn` and writers blocked on its window.
pub(crate) fn wake_connection(inner: &mut SimInner, conn: ConnectionId) {
    if let Some(wakers) = inner.read_wakers.remove(&conn) {
        for waker in wakers {
            waker.wake();
        }
    }
    if let Some(wakers) = inner.write_wakers.remove(&conn) {
        for waker in wakers {
            waker.wake();
        }
    }
}

/// Random connection failure, rolled on every read and write.
pub(crate) fn roll_random_close(inner: &mut SimInner, conn: ConnectionId) -> SimulationResult<()> {
    if !inner.enable_connection_failures {
        return Ok(());
    }
    if sim_random01() >= 0.00001 {
        return Ok(());
    }
    let a = sim_random01();
    let b = sim_random01();
    let (dbgid, my_addr, peer_addr, peer) = match inner.connections.get(&conn) {
        Some(c) => (
            c.dbgid,
            inner.process(c.owner).address,
            c.peer_address,
            c.peer,
        ),
        None => return Ok(()),
    };
    tracing::warn!(
        conn = %dbgid,
        my_addr = %my_addr,
        peer_addr = %peer_addr,
        send_closed = a > 0.33,
        recv_closed = a < 0.66,
        explicit = b < 0.3,
        "simulated connection failure"
    );
    // The ranges overlap so both ends can die in one roll.
    if a < 0.66 {
        if let Some(peer_id) = peer {
            close_internal(inner, peer_id);
        }
    }
    if a > 0.33 {
        close_internal(inner, conn);
    }
    if b < 0.3 {
        return Err(SimulationError::ConnectionFailed);
    }
    Ok(())
}

/// Close an endpoint without caller involvement: sever the peer link and
/// arm the peer's leak watchdog.
pub(crate) fn close_internal(inner: &mut SimInner, conn: ConnectionId) {
    let peer = {
        let Some(c) = inner.connections.get_mut(&conn) else {
            return;
        };
        if c.closed {
            return;
        }
        c.closed = true;
        c.leak_armed = false;
        c.peer.take()
    };

    if let Some(peer_id) = peer {
        let arm = inner
            .connections
            .get_mut(&peer_id)
            .map(|p| {
                let newly_armed = !p.leak_armed && !p.closed;
                if newly_armed {
                    p.leak_armed = true;
                }
                (newly_armed, p.owner)
            });
        if let Some((true, peer_owner)) = arm {
            inner.schedule(
                TaskPayload::LeakCheck { conn: peer_id },
                LEAK_WATCHDOG,
                TaskPriority::DefaultDelay,
                peer_owner,
            );
        }
        // The peer can now observe end-of-stream.
        wake_connection(inner, peer_id);
    }
    wake_connection(inner, conn);
    maybe_reap_pair(inner, conn, peer);
}

/// Caller-initiated close.
pub(crate) fn close_by_caller(inner: &mut SimInner, conn: ConnectionId) {
    if let Some(c) = inner.connections.get_mut(&conn) {
        c.closed_by_caller = true;
    }
    close_internal(inner, conn);
}

/// Drop the pair's state once both endpoints are closed.
fn maybe_reap_pair(inner: &mut SimInner, conn: ConnectionId, peer: Option<ConnectionId>) {
    let peer_closed = peer
        .map(|p| inner.connections.get(&p).is_none_or(|c| c.closed))
        .unwrap_or(true);
    if peer_closed {
        inner.connections.remove(&conn);
        if let Some(p) = peer {
            inner.connections.remove(&p);
        }
    }
}

/// Leak watchdog: fires if the surviving endpoint has not been closed by
/// its caller within the grace window.
pub(crate) fn leak_check(inner: &mut SimInner, conn: ConnectionId) {
    let Some(c) = inner.connections.get(&conn) else {
        return;
    };
    if !c.leak_armed || c.closed_by_caller {
        return;
    }
    tracing::error!(
        error = %SimulationError::ConnectionLeaked,
        conn = %c.dbgid,
        peer_addr = %c.peer_address,
        peer = %c.peer_id,
        opened = c.opened,
        "leaked connection"
    );
    inner.leaked_connections += 1;
}

/// Incoming-connection delivery on the listening process.
pub(crate) fn incoming_connection(inner: &mut SimInner, owner: ProcessId, conn: ConnectionId) {
    if is_peer_gone(inner, conn) && sim_random01() < 0.5 {
        tracing::debug!("incoming connection dropped; peer gone");
        return;
    }
    if let Some(c) = inner.connections.get(&conn) {
        tracing::debug!(conn = %c.dbgid, "incoming connection");
    }
    inner.process_mut(owner).listener_queue.push_back(conn);
    if let Some(wakers) = inner.accept_wakers.remove(&owner) {
        for waker in wakers {
            waker.wake();
        }
    }
}

impl SimWorld {
    /// Open a connection to `to`, polling until the address registers.
    ///
    /// Models NAT/ephemeral-port visibility on the accept side and drops
    /// half of the connects whose peer vanished mid-handshake — those
    /// never resolve.
    pub async fn connect(&self, to: NetworkAddress) -> SimulationResult<SimConnection> {
        assert!(!to.tls, "TLS endpoints are not simulated");

        // Connects may race process creation; poll until it exists.
        while self.get_process_by_address(to).is_none() {
            self.delay(dur(0.1 * sim_random01()), TaskPriority::DefaultDelay)
                .await?;
        }

        let (my_id, connect_delay) = {
            let mut inner = self.inner_mut();
            let local = inner.current_process;
            let target = *inner
                .address_map
                .get(&to.normalized())
                .expect("connect target vanished from address map");
            let (my_id, peer_id) = create_pair(&mut inner, local, target, to);
            let incoming_delay = dur(0.5 * sim_random01());
            let connect_delay = dur(0.5 * sim_random01());
            inner.schedule(
                TaskPayload::IncomingConnection { conn: peer_id },
                incoming_delay,
                TaskPriority::AcceptSocket,
                target,
            );
            (my_id, connect_delay)
        };

        self.delay(connect_delay, TaskPriority::DefaultDelay).await?;

        let peer_gone = is_peer_gone(&self.inner_mut(), my_id);
        if peer_gone && sim_random01() < 0.5 {
            tracing::debug!("connect dropped; peer gone before open");
            crate::sim::futures::never().await;
            unreachable!("never() resolved");
        }

        if let Some(c) = self.inner_mut().connections.get_mut(&my_id) {
            c.opened = true;
        }
        Ok(SimConnection::new(self.downgrade(), my_id))
    }

    /// The current process's listener.
    ///
    /// # Panics
    ///
    /// Panics unless `addr` is the current process's own address.
    pub fn listen(&self, addr: NetworkAddress) -> SimListener {
        assert!(!addr.tls, "TLS endpoints are not simulated");
        let inner = self.inner_mut();
        let process = inner.current_process;
        assert_eq!(
            inner.process(process).address,
            addr.normalized(),
            "listen address must match the current process"
        );
        SimListener::new(self.downgrade(), process)
    }

    // ------------------------------------------------------------------
    // Clogging controls
    // ------------------------------------------------------------------

    /// Clog the send leg of traffic originating at `ip` for `seconds`.
    pub fn clog_send_for(&self, ip: Ipv4Addr, seconds: f64) {
        let mut inner = self.inner_mut();
        let now = inner.now.as_secs_f64();
        inner.clogging.clog_send_for(ip, now, seconds);
    }

    /// Clog the receive leg of traffic originating at `ip` for `seconds`.
    pub fn clog_recv_for(&self, ip: Ipv4Addr, seconds: f64) {
        let mut inner = self.inner_mut();
        let now = inner.now.as_secs_f64();
        inner.clogging.clog_recv_for(ip, now, seconds);
    }

    /// Clog deliveries into `from` that originate at `to` for `seconds`.
    pub fn clog_pair(&self, from: Ipv4Addr, to: Ipv4Addr, seconds: f64) {
        let mut inner = self.inner_mut();
        let now = inner.now.as_secs_f64();
        inner.clogging.clog_pair_for(from, to, now, seconds);
    }

    /// Clog an interface in the given mode.
    pub fn clog_interface(&self, ip: Ipv4Addr, seconds: f64, mode: ClogMode) {
        let mode = match mode {
            ClogMode::Default => {
                let a = sim_random01();
                if a < 0.3 {
                    ClogMode::Send
                } else if a < 0.6 {
                    ClogMode::Receive
                } else {
                    ClogMode::All
                }
            }
            other => other,
        };
        tracing::info!(ip = %ip, seconds, mode = ?mode, "clog interface");
        if matches!(mode, ClogMode::Send | ClogMode::All) {
            self.clog_send_for(ip, seconds);
        }
        if matches!(mode, ClogMode::Receive | ClogMode::All) {
            self.clog_recv_for(ip, seconds);
        }
    }

    /// The permanent baseline latency for `(from, to)`, if drawn.
    pub fn pair_latency(&self, from: Ipv4Addr, to: Ipv4Addr) -> Option<f64> {
        self.inner_mut().clogging.pair_latency(from, to)
    }

    /// Sample the transit-leg delay a delivery into `from` originating at
    /// `to` would experience now. Draws from the simulation RNG.
    pub fn send_delay_seconds(&self, from: Ipv4Addr, to: Ipv4Addr) -> f64 {
        let inner = self.inner_mut();
        let now = inner.now.as_secs_f64();
        inner
            .clogging
            .send_delay(now, &inner.knobs, inner.speed_up_simulation, from, to)
    }

    /// Sample the delivery-leg delay a delivery into `from` originating at
    /// `to` would experience now. Draws from the simulation RNG.
    pub fn recv_delay_seconds(&self, from: Ipv4Addr, to: Ipv4Addr) -> f64 {
        let inner = self.inner_mut();
        let now = inner.now.as_secs_f64();
        inner
            .clogging
            .recv_delay(now, &inner.knobs, inner.speed_up_simulation, from, to)
    }
}
