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

//! Adaptive retuning of the maximum mark probability.
//!
//! Plain RED needs its maximum mark probability tuned to the traffic mix to
//! keep the average occupancy between the thresholds. The adaptive variant
//! closes the loop instead: on a fixed interval the controller compares the
//! smoothed occupancy against the thresholds and nudges the probability up
//! when the queue runs too full, down when it runs too empty. Increase is
//! fast and decrease slow, both multiplicative, and the probability is kept
//! inside a fixed band so one controller step can never destabilize the
//! decider.

use std::time::Duration;
use std::time::Instant;

use crate::red::RedParams;

/// Multiplier applied when the average sits above the upper threshold.
const INCREASE: f64 = 1.05;

/// Multiplier applied when the average sits below the lower threshold.
const DECREASE: f64 = 0.83;

/// The band the controller keeps the maximum mark probability in.
const MIN_MAX_P: f64 = 0.01;

const MAX_MAX_P: f64 = 1.0;

// Floor for auto-derived thresholds, in packets.
const MIN_DERIVED_TH: f64 = 5.0;

/// The controller retuning a decider's maximum mark probability.
pub struct Ared {
    interval: Duration,

    target_delay: Option<Duration>,

    last_adjust: Option<Instant>,
}

impl Ared {
    pub fn new(interval: Duration, target_delay: Option<Duration>) -> Ared {
        Ared {
            interval,

            target_delay,

            last_adjust: None,
        }
    }

    /// Runs one controller step against the decider's parameter set.
    ///
    /// Invoked by an external timer; calls arriving before `interval` has
    /// elapsed since the last adjustment are no-ops, so the timer cadence
    /// does not need to match the interval exactly.
    ///
    /// `ptc` is the queue service rate in mean-sized packets per second,
    /// used to place the thresholds when a target delay is configured.
    pub fn tick(
        &mut self, avg: f64, now: Instant, params: &mut RedParams, ptc: f64,
    ) {
        if let Some(last) = self.last_adjust {
            if now.duration_since(last) < self.interval {
                return;
            }
        }

        self.last_adjust = Some(now);

        if let Some(delay) = self.target_delay {
            // Place the thresholds for the configured queueing delay at the
            // current service rate.
            let target_queue = delay.as_secs_f64() * ptc;

            let min_th = (target_queue / 2.0).max(MIN_DERIVED_TH);

            params.min_th = min_th;
            params.max_th = 3.0 * min_th;
        }

        let max_p = params.cur_max_p;

        if avg > params.max_th {
            params.cur_max_p = (max_p * INCREASE).min(MAX_MAX_P);
        } else if avg < params.min_th && max_p > MIN_MAX_P {
            params.cur_max_p = (max_p * DECREASE).max(MIN_MAX_P);
        }

        if params.cur_max_p != max_p {
            trace!(
                "ared adjust avg={avg:.3} max_p {max_p:.4} -> {:.4}",
                params.cur_max_p
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RedParams {
        RedParams::new(5.0, 15.0, 0.1, true, false, true, true, false, 1000)
            .unwrap()
    }

    #[test]
    fn increase_when_above_max() {
        let mut ared = Ared::new(Duration::from_millis(500), None);
        let mut params = params();

        ared.tick(20.0, Instant::now(), &mut params, 187.5);

        assert!((params.cur_max_p() - 0.105).abs() < 1e-9);
    }

    #[test]
    fn decrease_when_below_min() {
        let mut ared = Ared::new(Duration::from_millis(500), None);
        let mut params = params();

        ared.tick(2.0, Instant::now(), &mut params, 187.5);

        assert!((params.cur_max_p() - 0.083).abs() < 1e-9);
    }

    #[test]
    fn no_change_between_thresholds() {
        let mut ared = Ared::new(Duration::from_millis(500), None);
        let mut params = params();

        ared.tick(10.0, Instant::now(), &mut params, 187.5);

        assert_eq!(params.cur_max_p(), 0.1);
    }

    #[test]
    fn interval_gates_adjustments() {
        let mut ared = Ared::new(Duration::from_millis(500), None);
        let mut params = params();
        let now = Instant::now();

        ared.tick(20.0, now, &mut params, 187.5);

        let once = params.cur_max_p();

        // Too early, must be a no-op.
        ared.tick(20.0, now + Duration::from_millis(100), &mut params, 187.5);

        assert_eq!(params.cur_max_p(), once);

        ared.tick(20.0, now + Duration::from_millis(500), &mut params, 187.5);

        assert!(params.cur_max_p() > once);
    }

    #[test]
    fn probability_stays_bounded() {
        let mut ared = Ared::new(Duration::from_millis(500), None);
        let mut params = params();
        let mut now = Instant::now();

        // Drive the probability into the ceiling.
        for _ in 0..200 {
            ared.tick(1000.0, now, &mut params, 187.5);
            now += Duration::from_millis(500);
        }

        assert_eq!(params.cur_max_p(), 1.0);

        // And down into the floor.
        for _ in 0..200 {
            ared.tick(0.0, now, &mut params, 187.5);
            now += Duration::from_millis(500);
        }

        assert_eq!(params.cur_max_p(), 0.01);
    }

    #[test]
    fn target_delay_places_thresholds() {
        let mut ared = Ared::new(
            Duration::from_millis(500),
            Some(Duration::from_millis(200)),
        );
        let mut params = params();

        // 15Mbps at 1000 byte packets serves 1875 packets per second, so a
        // 200ms target is 375 packets of queue.
        ared.tick(0.0, Instant::now(), &mut params, 1875.0);

        assert!((params.min_th() - 187.5).abs() < 1e-9);
        assert!((params.max_th() - 562.5).abs() < 1e-9);
    }

    #[test]
    fn target_delay_floor() {
        let mut ared = Ared::new(
            Duration::from_millis(500),
            Some(Duration::from_millis(1)),
        );
        let mut params = params();

        // Tiny delay targets clamp to the minimum threshold placement.
        ared.tick(0.0, Instant::now(), &mut params, 187.5);

        assert!((params.min_th() - 5.0).abs() < 1e-9);
        assert!((params.max_th() - 15.0).abs() < 1e-9);
    }
}
