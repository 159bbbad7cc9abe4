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

//! Smoothed queue occupancy estimation.
//!
//! RED decisions are taken against an exponentially weighted moving average
//! of the instantaneous queue length rather than the length itself, so that
//! short bursts pass through unmarked. The estimator also compensates for
//! idle periods: while the queue is empty no packet events arrive to age the
//! average, so on the first arrival after an idle interval the average is
//! decayed as if mean-sized packets had kept departing at the link rate.

use std::time::Instant;

/// Estimator of the time-averaged queue occupancy.
pub struct QueueAvg {
    avg: f64,

    weight: f64,

    // Link capacity in mean-sized packets per second.
    ptc: f64,

    idle_since: Option<Instant>,
}

impl QueueAvg {
    /// Creates an estimator with the given EWMA weight and service rate.
    ///
    /// `ptc` is the link capacity in mean-sized packets per second. The
    /// weight must lie in `(0, 1]`.
    pub fn new(weight: f64, ptc: f64) -> crate::Result<QueueAvg> {
        if !(weight > 0.0 && weight <= 1.0) || ptc <= 0.0 {
            return Err(crate::Error::InvalidConfiguration);
        }

        Ok(QueueAvg {
            avg: 0.0,

            weight,

            ptc,

            idle_since: None,
        })
    }

    /// Derives the EWMA weight from the service rate, as `1 - exp(-1/ptc)`.
    ///
    /// This is the automatic setting used when no explicit weight is
    /// configured: one mean-sized packet time constitutes one smoothing
    /// step.
    pub fn derived_weight(ptc: f64) -> f64 {
        1.0 - (-1.0 / ptc).exp()
    }

    /// Folds the instantaneous occupancy observed at `now` into the average
    /// and returns the updated value.
    ///
    /// Called on every packet arrival while the queue is being used. If the
    /// queue went idle since the previous event, the average is first
    /// decayed by `(1 - weight)^m`, with `m` the whole number of mean-sized
    /// packets the link would have drained over the idle interval.
    pub fn update(&mut self, occupancy: usize, now: Instant) -> f64 {
        if let Some(idle_start) = self.idle_since.take() {
            let idle = now.duration_since(idle_start).as_secs_f64();
            let m = (self.ptc * idle) as i32;

            if m > 0 {
                self.avg *= (1.0 - self.weight).powi(m);
            }
        }

        self.avg += self.weight * (occupancy as f64 - self.avg);

        // Floating point rounding may push the decayed average marginally
        // below zero.
        if self.avg < 0.0 {
            self.avg = 0.0;
        }

        self.avg
    }

    /// Records the start of an idle period.
    ///
    /// Called when the queue drains empty. A later `update` applies the
    /// idle compensation exactly once for the interval.
    pub fn enter_idle(&mut self, now: Instant) {
        if self.idle_since.is_none() {
            self.idle_since = Some(now);
        }
    }

    /// Returns the current average without folding in a new sample.
    pub fn value(&self) -> f64 {
        self.avg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    #[test]
    fn weight_out_of_range() {
        assert!(QueueAvg::new(0.0, 100.0).is_err());
        assert!(QueueAvg::new(1.5, 100.0).is_err());
        assert!(QueueAvg::new(-0.1, 100.0).is_err());
        assert!(QueueAvg::new(0.002, 0.0).is_err());

        assert!(QueueAvg::new(1.0, 100.0).is_ok());
    }

    #[test]
    fn tracks_constant_occupancy() {
        let mut avg = QueueAvg::new(0.1, 100.0).unwrap();
        let now = Instant::now();

        for i in 0..200 {
            avg.update(10, now + Duration::from_millis(i));
        }

        assert!((avg.value() - 10.0).abs() < 1e-6);
    }

    #[test]
    fn idle_decay() {
        let weight = 0.002;
        let ptc = 100.0;

        let mut avg = QueueAvg::new(weight, ptc).unwrap();
        let now = Instant::now();

        // Pin the average near 10 packets.
        for i in 0..10_000 {
            avg.update(10, now + Duration::from_millis(i));
        }

        let before = avg.value();

        // One second idle at 100 packets per second drains 100 virtual
        // packets.
        let idle_start = now + Duration::from_secs(10);
        avg.enter_idle(idle_start);

        let after = avg.update(0, idle_start + Duration::from_secs(1));

        let decayed = before * (1.0 - weight).powi(100);
        let expected = decayed + weight * (0.0 - decayed);

        assert!((after - expected).abs() < 1e-6);
    }

    #[test]
    fn zero_elapsed_idle_is_a_noop() {
        let mut with_idle = QueueAvg::new(0.1, 100.0).unwrap();
        let mut without_idle = QueueAvg::new(0.1, 100.0).unwrap();
        let now = Instant::now();

        for i in 0..50 {
            with_idle.update(5, now + Duration::from_millis(i));
            without_idle.update(5, now + Duration::from_millis(i));
        }

        let later = now + Duration::from_millis(50);

        // Idle-to-busy with zero elapsed time must not decay the average.
        with_idle.enter_idle(later);

        assert_eq!(with_idle.update(5, later), without_idle.update(5, later));
    }

    #[test]
    fn repeated_idle_marks_keep_first_start() {
        let mut avg = QueueAvg::new(0.002, 100.0).unwrap();
        let now = Instant::now();

        for i in 0..1000 {
            avg.update(10, now + Duration::from_millis(i));
        }

        let before = avg.value();

        let idle_start = now + Duration::from_secs(1);
        avg.enter_idle(idle_start);

        // A spurious second mark later in the idle period must not shorten
        // the compensated interval.
        avg.enter_idle(idle_start + Duration::from_millis(500));

        let after = avg.update(0, idle_start + Duration::from_secs(1));

        let decayed = before * (1.0 - 0.002f64).powi(100);
        let expected = decayed + 0.002 * (0.0 - decayed);

        assert!((after - expected).abs() < 1e-6);
    }

    #[test]
    fn never_negative() {
        let mut avg = QueueAvg::new(1.0, 100.0).unwrap();
        let now = Instant::now();

        avg.update(3, now);
        avg.enter_idle(now);

        let v = avg.update(0, now + Duration::from_secs(60));

        assert!(v >= 0.0);
    }

    #[test]
    fn derived_weight_matches_link() {
        // 1.5Mbps at 1000 byte packets is 187.5 packets per second.
        let w = QueueAvg::derived_weight(187.5);

        assert!((w - (1.0 - (-1.0f64 / 187.5).exp())).abs() < 1e-12);
        assert!(w > 0.0 && w < 1.0);
    }
}
