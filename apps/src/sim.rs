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

//! Discrete-event transport and link collaborator.
//!
//! The queue under test only decides enqueue/mark/drop; everything that
//! surrounds it in a real network is played by this module: two saturated
//! window-clocked sources, the bottleneck link serializing packets out of
//! the queue, the ack path feeding congestion signals back, the periodic
//! controller timer and the counter sampler. Events run on a single virtual
//! clock in strictly non-decreasing time order, so the queue sees exactly
//! the call pattern it is specified for.

use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::VecDeque;
use std::time::Duration;
use std::time::Instant;

use ared::AqmQueue;
use ared::Enqueued;
use ared::Packet;
use ared::Stats;

use crate::scenario::ScenarioConfig;

/// When the sources start transmitting.
pub const CLIENT_START: Duration = Duration::from_millis(1500);

/// When the sources stop transmitting.
pub const CLIENT_STOP: Duration = Duration::from_secs(5);

/// When the run ends, after the queue drained its backlog.
pub const SINK_STOP: Duration = Duration::from_secs(10);

/// How often the decision counters are sampled.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

const INITIAL_CWND: f64 = 4.0;

const MIN_CWND: f64 = 2.0;

// Limited slow start: cap on the congestion window growth per RTT, in
// packets.
const SS_GROWTH_CAP: f64 = 6.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Ev {
    /// A source may transmit its next packet.
    Send(usize),

    /// The bottleneck finished serializing the packet in flight.
    LinkFree,

    /// An ack, possibly carrying a congestion mark, reached its source.
    Ack {
        src: usize,
        sent_at: Duration,
        marked: bool,
    },

    /// A source noticed one of its packets was dropped.
    Loss(usize),

    /// The periodic controller timer fired.
    Adapt,

    /// The periodic counter sampler fired.
    Sample,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Event {
    at: Duration,

    seq: u64,

    ev: Ev,
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A saturated window-clocked source.
///
/// NewReno in spirit: slow start with a limited-slow-start growth cap,
/// `1/cwnd` growth in congestion avoidance, and at most one halving per
/// RTT. The source always has data to send, so its rate is whatever the
/// window and the access link allow.
struct Source {
    cwnd: f64,

    ssthresh: f64,

    in_flight: usize,

    // Serialization time of one packet on the access link.
    send_gap: Duration,

    // Round-trip propagation, without queueing.
    rtt_base: Duration,

    srtt: Duration,

    // Next time a halving is allowed; one congestion response per RTT.
    recover_at: Duration,

    next_send: Duration,

    // Whether a Send event for this source is already on the heap.
    send_queued: bool,
}

impl Source {
    fn new(send_gap: Duration, rtt_base: Duration) -> Source {
        Source {
            cwnd: INITIAL_CWND,

            ssthresh: f64::MAX,

            in_flight: 0,

            send_gap,

            rtt_base,

            srtt: rtt_base,

            recover_at: Duration::ZERO,

            next_send: CLIENT_START,

            send_queued: false,
        }
    }

    fn can_send(&self) -> bool {
        (self.in_flight as f64) < self.cwnd
    }
}

/// Everything a finished run produced.
pub struct SimOutput {
    /// Final decision counters of the queue under test.
    pub stats: Stats,

    /// Packets the sources offered to the queue.
    pub offered: u64,

    /// Occupancy left in the queue when the run ended.
    pub final_qlen: usize,

    /// Sampled `(seconds, occupancy)` series.
    pub qlen_series: Vec<(f64, u64)>,

    /// Sampled `(seconds, unforced drop count)` series.
    pub drop_series: Vec<(f64, u64)>,

    /// Sampled `(seconds, unforced mark count)` series.
    pub mark_series: Vec<(f64, u64)>,

    /// `(seconds, old, new)` congestion window changes, informational only.
    pub cwnd_series: Vec<(f64, u64, u64)>,
}

/// The event loop driving one scenario run.
pub struct Sim {
    queue: AqmQueue,

    heap: BinaryHeap<Reverse<Event>>,

    seq: u64,

    now: Duration,

    // Base instant the virtual clock is anchored to.
    start: Instant,

    sources: Vec<Source>,

    // (source, send time) for every packet sitting in the queue, in queue
    // order.
    transit: VecDeque<(usize, Duration)>,

    link_busy: bool,

    bottleneck_rate: u64,

    pkt_size: usize,

    use_ecn: bool,

    adjust_interval: Duration,

    offered: u64,

    qlen_series: Vec<(f64, u64)>,

    drop_series: Vec<(f64, u64)>,

    mark_series: Vec<(f64, u64)>,

    cwnd_series: Vec<(f64, u64, u64)>,
}

impl Sim {
    /// Wires a fresh queue into the scenario's topology.
    pub fn new(
        queue: AqmQueue, cfg: &ScenarioConfig, adjust_interval: Duration,
    ) -> Sim {
        let pkt_size = cfg.mean_pkt_size;

        let send_gap =
            Duration::from_secs_f64(pkt_size as f64 * 8.0 / cfg.access_rate as f64);

        let sources = (0..2)
            .map(|i| {
                let rtt_base = 2 * (cfg.access_delay[i] +
                    cfg.bottleneck_delay +
                    cfg.egress_delay[i]);

                Source::new(send_gap, rtt_base)
            })
            .collect();

        Sim {
            queue,

            heap: BinaryHeap::new(),

            seq: 0,

            now: Duration::ZERO,

            start: Instant::now(),

            sources,

            transit: VecDeque::new(),

            link_busy: false,

            bottleneck_rate: cfg.bottleneck_rate,

            pkt_size,

            use_ecn: cfg.use_ecn,

            adjust_interval,

            offered: 0,

            qlen_series: Vec::new(),

            drop_series: Vec::new(),

            mark_series: Vec::new(),

            cwnd_series: Vec::new(),
        }
    }

    /// Runs the scenario to its sink stop time and returns what happened.
    pub fn run(mut self) -> SimOutput {
        self.push(Duration::ZERO, Ev::Sample);
        self.push(Duration::ZERO, Ev::Adapt);

        for i in 0..self.sources.len() {
            self.sources[i].send_queued = true;
            self.push(CLIENT_START, Ev::Send(i));
        }

        while let Some(Reverse(ev)) = self.heap.pop() {
            if ev.at > SINK_STOP {
                break;
            }

            self.now = ev.at;

            match ev.ev {
                Ev::Send(src) => self.on_send(src),

                Ev::LinkFree => self.on_link_free(),

                Ev::Ack {
                    src,
                    sent_at,
                    marked,
                } => self.on_ack(src, sent_at, marked),

                Ev::Loss(src) => self.on_congestion(src),

                Ev::Adapt => self.on_adapt(),

                Ev::Sample => self.on_sample(),
            }
        }

        SimOutput {
            stats: self.queue.stats(),
            offered: self.offered,
            final_qlen: self.queue.len(),
            qlen_series: self.qlen_series,
            drop_series: self.drop_series,
            mark_series: self.mark_series,
            cwnd_series: self.cwnd_series,
        }
    }

    fn push(&mut self, at: Duration, ev: Ev) {
        self.seq += 1;

        self.heap.push(Reverse(Event {
            at,
            seq: self.seq,
            ev,
        }));
    }

    fn wall(&self) -> Instant {
        self.start + self.now
    }

    fn on_send(&mut self, src: usize) {
        if self.now >= CLIENT_STOP {
            self.sources[src].send_queued = false;
            return;
        }

        if !self.sources[src].can_send() {
            // Window-limited; an ack will requeue us.
            self.sources[src].send_queued = false;
            return;
        }

        self.offered += 1;

        let pkt = Packet::new(self.pkt_size, self.use_ecn);
        let now = self.wall();

        match self.queue.enqueue(pkt, now) {
            Enqueued::Accepted => {
                self.sources[src].in_flight += 1;
                self.transit.push_back((src, self.now));

                if !self.link_busy {
                    self.start_tx();
                }
            },

            Enqueued::RejectedFull | Enqueued::RejectedByRed => {
                // The source learns of the loss roughly one RTT later.
                let detect = self.now + self.sources[src].srtt;
                self.push(detect, Ev::Loss(src));
            },
        }

        let at = self.now + self.sources[src].send_gap;
        self.sources[src].next_send = at;
        self.push(at, Ev::Send(src));
    }

    fn start_tx(&mut self) {
        let now = self.wall();

        if let Some(pkt) = self.queue.dequeue(now) {
            let (src, sent_at) = self.transit.pop_front().unwrap();

            self.link_busy = true;

            let ser = Duration::from_secs_f64(
                pkt.size as f64 * 8.0 / self.bottleneck_rate as f64,
            );

            let done = self.now + ser;

            self.push(done, Ev::LinkFree);

            // Residual propagation to the sink plus the return path.
            let rtt_tail = self.sources[src].rtt_base;

            self.push(done + rtt_tail, Ev::Ack {
                src,
                sent_at,
                marked: pkt.marked,
            });
        }
    }

    fn on_link_free(&mut self) {
        self.link_busy = false;

        if !self.queue.is_empty() {
            self.start_tx();
        }
    }

    fn on_ack(&mut self, src: usize, sent_at: Duration, marked: bool) {
        let sample = self.now - sent_at;

        {
            let s = &mut self.sources[src];

            s.in_flight = s.in_flight.saturating_sub(1);

            s.srtt = s.srtt.mul_f64(7.0 / 8.0) + sample.mul_f64(1.0 / 8.0);
        }

        if marked {
            self.on_congestion(src);
        } else {
            let s = &mut self.sources[src];

            if s.cwnd < s.ssthresh {
                // Limited slow start: exponential growth early, capped to a
                // fixed number of packets per RTT once the window is large.
                s.cwnd += (SS_GROWTH_CAP / s.cwnd).min(1.0);
            } else {
                s.cwnd += 1.0 / s.cwnd;
            }
        }

        self.wake(src);
    }

    fn on_congestion(&mut self, src: usize) {
        let now = self.now;

        let s = &mut self.sources[src];

        if now >= s.recover_at {
            let old = s.cwnd;

            s.ssthresh = (s.cwnd / 2.0).max(MIN_CWND);
            s.cwnd = s.ssthresh;
            s.recover_at = now + s.srtt;

            trace!(
                "source {src} cwnd {:.1} -> {:.1} at {:?}",
                old,
                s.cwnd,
                now
            );

            self.cwnd_series.push((
                now.as_secs_f64(),
                old.round() as u64,
                s.cwnd.round() as u64,
            ));
        }

        self.wake(src);
    }

    fn wake(&mut self, src: usize) {
        if self.now >= CLIENT_STOP {
            return;
        }

        let at = {
            let s = &self.sources[src];

            if s.send_queued || !s.can_send() {
                return;
            }

            s.next_send.max(self.now)
        };

        self.sources[src].send_queued = true;
        self.push(at, Ev::Send(src));
    }

    fn on_adapt(&mut self) {
        let now = self.wall();
        self.queue.adapt(now);

        let next = self.now + self.adjust_interval;

        if next <= SINK_STOP {
            self.push(next, Ev::Adapt);
        }
    }

    fn on_sample(&mut self) {
        let t = self.now.as_secs_f64();
        let stats = self.queue.stats();

        self.qlen_series.push((t, self.queue.len() as u64));
        self.drop_series.push((t, stats.unforced_drop));
        self.mark_series.push((t, stats.unforced_mark));

        let next = self.now + SAMPLE_INTERVAL;

        if next <= SINK_STOP {
            self.push(next, Ev::Sample);
        }
    }
}
