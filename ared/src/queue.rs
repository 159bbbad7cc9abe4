// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! The bounded packet buffer orchestrating estimator, decider and
//! controller.

use std::collections::VecDeque;
use std::time::Instant;

use crate::adaptive::Ared;
use crate::ewma::QueueAvg;
use crate::red::Decision;
use crate::red::Red;
use crate::red::RedParams;
use crate::red::Verdict;
use crate::Config;

/// A packet moving through the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Size on the wire, in bytes.
    pub size: usize,

    /// Whether the transport negotiated ECN for this packet.
    pub ecn_capable: bool,

    /// Set when early detection marked the packet instead of dropping it.
    pub marked: bool,
}

impl Packet {
    pub fn new(size: usize, ecn_capable: bool) -> Packet {
        Packet {
            size,

            ecn_capable,

            marked: false,
        }
    }
}

/// Outcome of an enqueue attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueued {
    /// The packet was buffered, possibly ECN-marked.
    Accepted,

    /// The buffer had no room; the rejection bypassed early detection.
    RejectedFull,

    /// Early detection rejected the packet.
    RejectedByRed,
}

/// Decision counters for one queue instance.
///
/// Monotonically increasing for the lifetime of the queue; a fresh queue
/// starts from zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Packets dropped by the probabilistic early decision.
    pub unforced_drop: u64,

    /// Packets ECN-marked by the probabilistic early decision.
    pub unforced_mark: u64,

    /// Packets dropped because the average occupancy exceeded the forced
    /// limit.
    pub forced_drop: u64,

    /// Packets ECN-marked in the forced region in place of a hard drop.
    pub forced_mark: u64,

    /// Packets rejected because the buffer was full, before early detection
    /// was consulted.
    pub queue_full_drop: u64,

    /// Packets accepted into the buffer.
    pub rx_packets: u64,

    /// Packets handed back out of the buffer.
    pub tx_packets: u64,
}

impl Stats {
    /// Every early action taken, dropped or marked, forced or not.
    pub fn early_actions(&self) -> u64 {
        self.unforced_drop +
            self.unforced_mark +
            self.forced_drop +
            self.forced_mark
    }
}

/// A bounded FIFO governed by Adaptive RED.
///
/// One queue owns one estimator, one decider and, in adaptive mode, one
/// controller. All operations take the caller's clock and must be delivered
/// in non-decreasing time order; the queue itself never blocks and performs
/// no I/O.
pub struct AqmQueue {
    pkts: VecDeque<Packet>,

    capacity: usize,

    avg: QueueAvg,

    red: Red,

    ared: Option<Ared>,

    // Service rate in mean-sized packets per second.
    ptc: f64,

    stats: Stats,
}

impl AqmQueue {
    /// Builds a queue from the given configuration.
    ///
    /// Fails with [`InvalidConfiguration`] on a violated threshold ordering,
    /// an out-of-range probability or weight, or a zero capacity.
    ///
    /// [`InvalidConfiguration`]: crate::Error::InvalidConfiguration
    pub fn new(config: &Config) -> crate::Result<AqmQueue> {
        if config.capacity == 0 {
            return Err(crate::Error::InvalidConfiguration);
        }

        let ptc =
            config.link_rate as f64 / (8.0 * config.mean_pkt_size as f64);

        let weight = if config.queue_weight == 0.0 {
            QueueAvg::derived_weight(ptc)
        } else {
            config.queue_weight
        };

        let avg = QueueAvg::new(weight, ptc)?;

        let params = RedParams::new(
            config.min_th,
            config.max_th,
            config.max_p,
            config.gentle,
            config.use_ecn,
            config.hard_drop,
            config.wait,
            config.byte_mode,
            config.mean_pkt_size,
        )?;

        let red = Red::new(params, config.seed);

        let ared = config
            .adaptive
            .then(|| Ared::new(config.adjust_interval, config.target_delay));

        Ok(AqmQueue {
            pkts: VecDeque::with_capacity(config.capacity),

            capacity: config.capacity,

            avg,

            red,

            ared,

            ptc,

            stats: Stats::default(),
        })
    }

    /// Offers one packet to the queue.
    ///
    /// The capacity check comes first and is independent of early
    /// detection: RED only ever judges packets that would fit. Marked
    /// packets are still buffered, with their CE codepoint set.
    pub fn enqueue(&mut self, pkt: Packet, now: Instant) -> Enqueued {
        if self.pkts.len() + 1 > self.capacity {
            self.stats.queue_full_drop += 1;

            trace!(
                "queue full drop qlen={} capacity={}",
                self.pkts.len(),
                self.capacity
            );

            return Enqueued::RejectedFull;
        }

        let avg = self.avg.update(self.pkts.len(), now);

        let decision = self.red.decide(avg, pkt.size, pkt.ecn_capable);

        match decision {
            Decision::Pass => (),

            Decision::Unforced(Verdict::Drop) =>
                self.stats.unforced_drop += 1,

            Decision::Unforced(Verdict::Mark) =>
                self.stats.unforced_mark += 1,

            Decision::Forced(Verdict::Drop) => self.stats.forced_drop += 1,

            Decision::Forced(Verdict::Mark) => self.stats.forced_mark += 1,

            Decision::Unforced(Verdict::Enqueue) |
            Decision::Forced(Verdict::Enqueue) => unreachable!(),
        }

        match decision.verdict() {
            Verdict::Enqueue => {
                self.pkts.push_back(pkt);
                self.stats.rx_packets += 1;

                Enqueued::Accepted
            },

            Verdict::Mark => {
                let mut pkt = pkt;
                pkt.marked = true;

                self.pkts.push_back(pkt);
                self.stats.rx_packets += 1;

                Enqueued::Accepted
            },

            Verdict::Drop => {
                trace!("early drop avg={avg:.3} qlen={}", self.pkts.len());

                Enqueued::RejectedByRed
            },
        }
    }

    /// Hands out the head packet, if any.
    ///
    /// When the buffer drains empty the estimator is told the idle period
    /// started at `now`.
    pub fn dequeue(&mut self, now: Instant) -> Option<Packet> {
        let pkt = self.pkts.pop_front()?;

        self.stats.tx_packets += 1;

        if self.pkts.is_empty() {
            self.avg.enter_idle(now);
        }

        Some(pkt)
    }

    /// Runs one adaptive controller step, if adaptive mode is on.
    ///
    /// Wired to an external periodic timer; the controller itself enforces
    /// its adjustment interval.
    pub fn adapt(&mut self, now: Instant) {
        if let Some(ared) = &mut self.ared {
            ared.tick(self.avg.value(), now, &mut self.red.params, self.ptc);
        }
    }

    /// Read-only snapshot of the decision counters.
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Instantaneous occupancy, in packets.
    pub fn len(&self) -> usize {
        self.pkts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pkts.is_empty()
    }

    /// The smoothed average occupancy.
    pub fn avg(&self) -> f64 {
        self.avg.value()
    }

    /// The decider's current maximum mark probability.
    pub fn cur_max_p(&self) -> f64 {
        self.red.params().cur_max_p()
    }
}
