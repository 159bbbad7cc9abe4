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

//! Adaptive RED active queue management.
//!
//! [ared] implements the Random Early Detection queue discipline with the
//! "gentle" and adaptive extensions, as described in:
//!
//! <https://www.icir.org/floyd/papers/adaptiveRed.pdf>
//!
//! The crate provides the queue-side decision logic only: an EWMA occupancy
//! estimator, the randomized drop/mark decider, the periodic controller that
//! retunes the maximum mark probability, and a bounded packet buffer tying
//! them together. The application is responsible for providing the event
//! clock driving arrivals, departures and the controller timer.
//!
//! [ared]: https://www.icir.org/floyd/red.html
//!
//! ## Usage
//!
//! A queue is built from a [`Config`] describing the bottleneck link and the
//! RED parameter set:
//!
//! ```
//! use std::time::Instant;
//!
//! let mut config = ared::Config::new();
//! config.set_capacity(25);
//! config.set_thresholds(5.0, 15.0)?;
//! config.set_adaptive(true);
//!
//! let mut queue = ared::AqmQueue::new(&config)?;
//!
//! let now = Instant::now();
//! match queue.enqueue(ared::Packet::new(1000, false), now) {
//!     ared::Enqueued::Accepted => (),
//!     ared::Enqueued::RejectedFull | ared::Enqueued::RejectedByRed => (),
//! }
//!
//! let _pkt = queue.dequeue(now);
//! # Ok::<(), ared::Error>(())
//! ```
//!
//! Every operation takes the current time as an explicit argument, so the
//! caller's clock can be real or simulated. Calls for one queue instance must
//! be delivered in non-decreasing time order.

#[macro_use]
extern crate log;

use std::time::Duration;

/// The default buffer capacity, in packets.
pub const DEFAULT_CAPACITY: usize = 1000;

/// The default EWMA weight of the occupancy estimator.
pub const DEFAULT_QUEUE_WEIGHT: f64 = 0.002;

/// The default lower RED threshold, in packets of average occupancy.
pub const DEFAULT_MIN_TH: f64 = 5.0;

/// The default upper RED threshold, in packets of average occupancy.
pub const DEFAULT_MAX_TH: f64 = 15.0;

/// The default value of the interval between adaptive adjustments.
pub const DEFAULT_ADJUST_INTERVAL: Duration = Duration::from_millis(500);

const DEFAULT_MEAN_PKT_SIZE: usize = 1000;

// Default LInterm, yielding an initial mark probability of 0.02.
const DEFAULT_L_INTERM: f64 = 50.0;

const DEFAULT_LINK_RATE: u64 = 1_500_000;

/// A specialized [`Result`] type for quick returns.
///
/// [`Result`]: https://doc.rust-lang.org/std/result/enum.Result.html
pub type Result<T> = std::result::Result<T, Error>;

/// An ARED error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A configured parameter is out of its documented range, or the
    /// threshold ordering is violated.
    InvalidConfiguration,

    /// The requested validation scenario does not exist.
    ///
    /// The rejected scenario id is provided as associated data.
    UnknownScenario(u32),

    /// A scenario run completed but one of its expected invariants did not
    /// hold.
    ///
    /// The failing check and the observed counters are provided as
    /// associated data.
    InvariantViolation(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// Stores configuration shared between queue instances.
///
/// Defaults follow the classic RED validation setup: a 1000 packet buffer,
/// gentle mode on, a queue weight of 0.002 and thresholds of 5/15 packets.
pub struct Config {
    capacity: usize,

    min_th: f64,
    max_th: f64,

    max_p: f64,

    queue_weight: f64,

    mean_pkt_size: usize,

    gentle: bool,

    wait: bool,

    byte_mode: bool,

    use_ecn: bool,

    hard_drop: bool,

    adaptive: bool,

    adjust_interval: Duration,

    target_delay: Option<Duration>,

    link_rate: u64,

    seed: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}

impl Config {
    /// Creates a config object with the documented defaults.
    pub fn new() -> Config {
        Config {
            capacity: DEFAULT_CAPACITY,
            min_th: DEFAULT_MIN_TH,
            max_th: DEFAULT_MAX_TH,
            max_p: 1.0 / DEFAULT_L_INTERM,
            queue_weight: DEFAULT_QUEUE_WEIGHT,
            mean_pkt_size: DEFAULT_MEAN_PKT_SIZE,
            gentle: true,
            wait: true,
            byte_mode: false,
            use_ecn: false,
            hard_drop: true,
            adaptive: false,
            adjust_interval: DEFAULT_ADJUST_INTERVAL,
            target_delay: None,
            link_rate: DEFAULT_LINK_RATE,
            seed: 0,
        }
    }

    /// Sets the buffer capacity, in packets.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    /// Sets the lower and upper average-occupancy thresholds.
    ///
    /// Returns [`Error::InvalidConfiguration`] unless `min_th < max_th`.
    pub fn set_thresholds(&mut self, min_th: f64, max_th: f64) -> Result<()> {
        if !(min_th >= 0.0 && min_th < max_th) {
            return Err(Error::InvalidConfiguration);
        }

        self.min_th = min_th;
        self.max_th = max_th;

        Ok(())
    }

    /// Sets the initial maximum mark probability.
    ///
    /// Returns [`Error::InvalidConfiguration`] unless the value is in
    /// `(0, 1]`.
    pub fn set_max_p(&mut self, max_p: f64) -> Result<()> {
        if !(max_p > 0.0 && max_p <= 1.0) {
            return Err(Error::InvalidConfiguration);
        }

        self.max_p = max_p;

        Ok(())
    }

    /// Sets the initial maximum mark probability as `1 / l_interm`.
    ///
    /// `l_interm` is the classic RED knob for the packet interval between
    /// marks when the average occupancy sits halfway between the thresholds.
    pub fn set_l_interm(&mut self, l_interm: f64) -> Result<()> {
        if l_interm < 1.0 {
            return Err(Error::InvalidConfiguration);
        }

        self.set_max_p(1.0 / l_interm)
    }

    /// Sets the EWMA weight of the occupancy estimator.
    ///
    /// A value of zero derives the weight from the link rate as
    /// `1 - exp(-1 / ptc)`, with `ptc` the link capacity in mean-sized
    /// packets per second. Returns [`Error::InvalidConfiguration`] for
    /// values outside `[0, 1]`.
    pub fn set_queue_weight(&mut self, weight: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&weight) {
            return Err(Error::InvalidConfiguration);
        }

        self.queue_weight = weight;

        Ok(())
    }

    /// Sets the mean packet size, in bytes, used for rate derivations and
    /// byte-mode probability scaling.
    pub fn set_mean_pkt_size(&mut self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidConfiguration);
        }

        self.mean_pkt_size = size;

        Ok(())
    }

    /// Configures gentle mode, extending the drop ramp above the upper
    /// threshold instead of hard-dropping at it.
    pub fn set_gentle(&mut self, v: bool) {
        self.gentle = v;
    }

    /// Configures the wait rule spacing out consecutive marks.
    pub fn set_wait(&mut self, v: bool) {
        self.wait = v;
    }

    /// Configures byte-mode probability scaling, weighting the mark
    /// probability by packet size relative to the mean.
    pub fn set_byte_mode(&mut self, v: bool) {
        self.byte_mode = v;
    }

    /// Configures ECN marking of early-detected packets instead of dropping
    /// them.
    pub fn set_use_ecn(&mut self, v: bool) {
        self.use_ecn = v;
    }

    /// Configures whether forced actions drop even ECN-capable packets.
    pub fn set_hard_drop(&mut self, v: bool) {
        self.hard_drop = v;
    }

    /// Enables the adaptive controller retuning the maximum mark
    /// probability.
    pub fn set_adaptive(&mut self, v: bool) {
        self.adaptive = v;
    }

    /// Sets the interval between adaptive adjustments.
    pub fn set_adjust_interval(&mut self, interval: Duration) {
        self.adjust_interval = interval;
    }

    /// Sets the target queueing delay the adaptive controller derives its
    /// thresholds from, replacing the fixed threshold configuration.
    pub fn set_target_delay(&mut self, delay: Option<Duration>) {
        self.target_delay = delay;
    }

    /// Sets the bottleneck link rate, in bits per second, used to derive the
    /// queue service rate.
    pub fn set_link_rate(&mut self, bps: u64) -> Result<()> {
        if bps == 0 {
            return Err(Error::InvalidConfiguration);
        }

        self.link_rate = bps;

        Ok(())
    }

    /// Seeds the decider's random sampler, making runs reproducible.
    pub fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
    }
}

pub use crate::adaptive::Ared;
pub use crate::ewma::QueueAvg;
pub use crate::queue::AqmQueue;
pub use crate::queue::Enqueued;
pub use crate::queue::Packet;
pub use crate::queue::Stats;
pub use crate::red::Decision;
pub use crate::red::Red;
pub use crate::red::RedParams;
pub use crate::red::Verdict;

mod adaptive;
mod ewma;
mod queue;
mod red;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = Config::new();

        assert_eq!(config.capacity, DEFAULT_CAPACITY);
        assert_eq!(config.min_th, 5.0);
        assert_eq!(config.max_th, 15.0);
        assert_eq!(config.queue_weight, 0.002);
        assert!(config.gentle);
        assert!(!config.use_ecn);
        assert!(!config.adaptive);
    }

    #[test]
    fn config_threshold_ordering() {
        let mut config = Config::new();

        assert_eq!(
            config.set_thresholds(15.0, 15.0),
            Err(Error::InvalidConfiguration)
        );

        assert_eq!(
            config.set_thresholds(20.0, 15.0),
            Err(Error::InvalidConfiguration)
        );

        assert_eq!(config.set_thresholds(5.0, 15.0), Ok(()));
    }

    #[test]
    fn config_probability_range() {
        let mut config = Config::new();

        assert_eq!(config.set_max_p(0.0), Err(Error::InvalidConfiguration));
        assert_eq!(config.set_max_p(1.1), Err(Error::InvalidConfiguration));
        assert_eq!(config.set_max_p(1.0), Ok(()));

        assert_eq!(config.set_l_interm(0.5), Err(Error::InvalidConfiguration));
        assert_eq!(config.set_l_interm(10.0), Ok(()));
        assert!((config.max_p - 0.1).abs() < f64::EPSILON);
    }
}
