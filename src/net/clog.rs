//! Clogging: bounded send/receive delay windows and permanent per-pair
//! latency.
//!
//! Delay queries follow the receiver-pump call convention: `from` is the
//! interface the bytes are being delivered to, `to` is the interface they
//! originated from. Interface clogs key off the originating side; pair
//! clogs and the permanent pair latency key off the ordered `(from, to)`
//! pair.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::knobs::Knobs;
use crate::rng::sim_random01;

/// Which direction(s) of an interface to clog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClogMode {
    /// Clog the send leg.
    Send,
    /// Clog the receive leg.
    Receive,
    /// Clog both legs.
    All,
    /// Pick randomly: Send (p=0.3), Receive (p=0.3), otherwise All.
    Default,
}

/// Clog windows and pair latencies, all in seconds of virtual time.
#[derive(Debug, Default)]
pub(crate) struct CloggingTable {
    send_until: HashMap<Ipv4Addr, f64>,
    recv_until: HashMap<Ipv4Addr, f64>,
    pair_until: HashMap<(Ipv4Addr, Ipv4Addr), f64>,
    pair_latency: HashMap<(Ipv4Addr, Ipv4Addr), f64>,
}

impl CloggingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn clog_send_for(&mut self, ip: Ipv4Addr, now: f64, seconds: f64) {
        let until = self.send_until.entry(ip).or_insert(0.0);
        *until = until.max(now + seconds);
    }

    pub(crate) fn clog_recv_for(&mut self, ip: Ipv4Addr, now: f64, seconds: f64) {
        let until = self.recv_until.entry(ip).or_insert(0.0);
        *until = until.max(now + seconds);
    }

    pub(crate) fn clog_pair_for(&mut self, from: Ipv4Addr, to: Ipv4Addr, now: f64, seconds: f64) {
        let until = self.pair_until.entry((from, to)).or_insert(0.0);
        *until = until.max(now + seconds);
    }

    /// The permanent baseline latency for `(from, to)`, drawing it on
    /// first observation.
    pub(crate) fn pair_latency_or_init(
        &mut self,
        from: Ipv4Addr,
        to: Ipv4Addr,
        max_clogging_latency: f64,
    ) -> f64 {
        *self
            .pair_latency
            .entry((from, to))
            .or_insert_with(|| max_clogging_latency * sim_random01())
    }

    /// The permanent pair latency, if one has been drawn.
    pub(crate) fn pair_latency(&self, from: Ipv4Addr, to: Ipv4Addr) -> Option<f64> {
        self.pair_latency.get(&(from, to)).copied()
    }

    /// Half of a one-way latency sample: a fast path with probability
    /// 0.999 and a long tail otherwise.
    fn half_latency(knobs: &Knobs) -> f64 {
        let a = sim_random01();
        const P_FAST: f64 = 0.999;
        if a <= P_FAST {
            let a = a / P_FAST;
            0.5 * (knobs.min_network_latency * (1.0 - a) + knobs.fast_network_latency / P_FAST * a)
        } else {
            let a = (a - P_FAST) / (1.0 - P_FAST);
            0.5 * (knobs.min_network_latency * (1.0 - a) + knobs.slow_network_latency * a)
        }
    }

    /// Delay for the transit leg of a delivery toward `from`, originating
    /// at `to`.
    pub(crate) fn send_delay(
        &self,
        now: f64,
        knobs: &Knobs,
        speed_up: bool,
        _from: Ipv4Addr,
        to: Ipv4Addr,
    ) -> f64 {
        let mut t = now + Self::half_latency(knobs);
        if !speed_up {
            if let Some(&until) = self.send_until.get(&to) {
                t = t.max(until);
            }
        }
        t - now
    }

    /// Delay for the delivery leg of a delivery toward `from`, originating
    /// at `to`. Adds the permanent pair latency plus any active pair and
    /// receive clog windows.
    pub(crate) fn recv_delay(
        &self,
        now: f64,
        knobs: &Knobs,
        speed_up: bool,
        from: Ipv4Addr,
        to: Ipv4Addr,
    ) -> f64 {
        let mut t = now + Self::half_latency(knobs);
        if !speed_up {
            if let Some(&latency) = self.pair_latency.get(&(from, to)) {
                t += latency;
            }
            if let Some(&until) = self.pair_until.get(&(from, to)) {
                t = t.max(until);
            }
            if let Some(&until) = self.recv_until.get(&to) {
                t = t.max(until);
            }
        }
        t - now
    }
}
