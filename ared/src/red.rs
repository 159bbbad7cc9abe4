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

//! Random Early Detection drop/mark decisions.
//!
//! This implementation follows the classic design:
//!
//! <https://www.icir.org/floyd/papers/early.twocolumn.pdf>
//!
//! with the "gentle" ramp extension above the upper threshold. The decision
//! is a pure function of the smoothed average occupancy, the parameter set
//! and one uniform random sample; it never blocks and performs no I/O.

use rand::rngs::SmallRng;
use rand::Rng;
use rand::SeedableRng;

/// Verdict for one arriving packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Accept the packet unchanged.
    Enqueue,

    /// Accept the packet with its ECN CE codepoint set.
    Mark,

    /// Reject the packet.
    Drop,
}

/// Whether an action was taken probabilistically or because the average
/// exceeded the hard limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Accept without any action.
    Pass,

    /// Probabilistic early action.
    Unforced(Verdict),

    /// The average occupancy is beyond the forced-action limit.
    Forced(Verdict),
}

impl Decision {
    /// The verdict to act on, regardless of how it was reached.
    pub fn verdict(self) -> Verdict {
        match self {
            Decision::Pass => Verdict::Enqueue,
            Decision::Unforced(v) => v,
            Decision::Forced(v) => v,
        }
    }
}

/// The RED parameter set.
///
/// All fields are fixed at construction except the current maximum mark
/// probability and the thresholds, which the adaptive controller retunes.
pub struct RedParams {
    pub(crate) min_th: f64,

    pub(crate) max_th: f64,

    pub(crate) cur_max_p: f64,

    gentle: bool,

    use_ecn: bool,

    hard_drop: bool,

    wait: bool,

    byte_mode: bool,

    mean_pkt_size: usize,
}

impl RedParams {
    /// Validates and builds a parameter set.
    ///
    /// Requires `0 <= min_th < max_th` and a maximum mark probability in
    /// `(0, 1]`. The threshold check here is what makes the ramp division
    /// safe at decision time.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        min_th: f64, max_th: f64, max_p: f64, gentle: bool, use_ecn: bool,
        hard_drop: bool, wait: bool, byte_mode: bool, mean_pkt_size: usize,
    ) -> crate::Result<RedParams> {
        if !(min_th >= 0.0 && min_th < max_th) {
            return Err(crate::Error::InvalidConfiguration);
        }

        if !(max_p > 0.0 && max_p <= 1.0) || mean_pkt_size == 0 {
            return Err(crate::Error::InvalidConfiguration);
        }

        Ok(RedParams {
            min_th,

            max_th,

            cur_max_p: max_p,

            gentle,

            use_ecn,

            hard_drop,

            wait,

            byte_mode,

            mean_pkt_size,
        })
    }

    /// The lower average-occupancy threshold.
    pub fn min_th(&self) -> f64 {
        self.min_th
    }

    /// The upper average-occupancy threshold.
    pub fn max_th(&self) -> f64 {
        self.max_th
    }

    /// The current maximum mark probability.
    pub fn cur_max_p(&self) -> f64 {
        self.cur_max_p
    }

    /// The average occupancy beyond which every packet is acted on.
    fn forced_limit(&self) -> f64 {
        if self.gentle {
            2.0 * self.max_th
        } else {
            self.max_th
        }
    }
}

/// The drop/mark decider.
pub struct Red {
    pub(crate) params: RedParams,

    // Packets accepted since the last action while the average sat above
    // the lower threshold, -1 while below it.
    count: i64,

    count_bytes: usize,

    rng: SmallRng,
}

impl Red {
    pub fn new(params: RedParams, seed: u64) -> Red {
        Red {
            params,

            count: -1,

            count_bytes: 0,

            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn params(&self) -> &RedParams {
        &self.params
    }

    /// Decides the fate of one arriving packet given the current average
    /// occupancy.
    ///
    /// Exactly one uniform sample is drawn per probabilistic decision. The
    /// count since the last action resets on every `Mark` or `Drop`.
    pub fn decide(
        &mut self, avg: f64, pkt_size: usize, ecn_capable: bool,
    ) -> Decision {
        let params = &self.params;

        if avg < params.min_th {
            self.count = -1;
            self.count_bytes = 0;

            return Decision::Pass;
        }

        if avg >= params.forced_limit() {
            self.count = 0;
            self.count_bytes = 0;

            return Decision::Forced(self.forced_verdict(ecn_capable));
        }

        // First packet after the average crossed the lower threshold is
        // always accepted, seeding the count.
        if self.count < 0 {
            self.count = 1;
            self.count_bytes = pkt_size;

            return Decision::Pass;
        }

        self.count += 1;
        self.count_bytes += pkt_size;

        let p = self.ramp_probability(avg);
        let p = self.corrected_probability(p, pkt_size);

        if self.rng.gen::<f64>() < p {
            self.count = 0;
            self.count_bytes = 0;

            let verdict = if params.use_ecn && ecn_capable {
                Verdict::Mark
            } else {
                Verdict::Drop
            };

            return Decision::Unforced(verdict);
        }

        Decision::Pass
    }

    fn forced_verdict(&self, ecn_capable: bool) -> Verdict {
        if self.params.use_ecn && ecn_capable && !self.params.hard_drop {
            Verdict::Mark
        } else {
            Verdict::Drop
        }
    }

    /// The raw mark probability for the given average occupancy, before the
    /// count correction.
    ///
    /// Linear from 0 to the current maximum over `[min_th, max_th)`, and in
    /// gentle mode from there to 1 over `[max_th, 2 * max_th)`.
    pub(crate) fn ramp_probability(&self, avg: f64) -> f64 {
        let params = &self.params;

        if avg < params.min_th {
            return 0.0;
        }

        if avg >= params.forced_limit() {
            return 1.0;
        }

        if avg >= params.max_th {
            // Gentle region.
            let p = params.cur_max_p +
                (1.0 - params.cur_max_p) * (avg - params.max_th) /
                    params.max_th;

            return p.min(1.0);
        }

        params.cur_max_p * (avg - params.min_th) /
            (params.max_th - params.min_th)
    }

    /// Scales the raw probability up the longer it has been since the last
    /// action, so marks spread out instead of clustering.
    ///
    /// With the wait rule the first `1/p` packets after an action are
    /// exempt, which spaces marks at least one interval apart.
    pub(crate) fn corrected_probability(
        &self, p: f64, pkt_size: usize,
    ) -> f64 {
        let params = &self.params;

        let count = if params.byte_mode {
            self.count_bytes as f64 / params.mean_pkt_size as f64
        } else {
            self.count as f64
        };

        let mut p = if params.wait {
            if count * p < 1.0 {
                0.0
            } else if count * p < 2.0 {
                p / (2.0 - count * p)
            } else {
                1.0
            }
        } else if count * p < 1.0 {
            p / (1.0 - count * p)
        } else {
            1.0
        };

        if params.byte_mode && p < 1.0 {
            p = p * pkt_size as f64 / params.mean_pkt_size as f64;
        }

        p.min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(
        gentle: bool, use_ecn: bool, hard_drop: bool, wait: bool,
    ) -> RedParams {
        RedParams::new(
            5.0, 15.0, 0.1, gentle, use_ecn, hard_drop, wait, false, 1000,
        )
        .unwrap()
    }

    #[test]
    fn invalid_params() {
        assert!(RedParams::new(
            15.0, 15.0, 0.1, true, false, true, true, false, 1000
        )
        .is_err());

        assert!(RedParams::new(
            20.0, 15.0, 0.1, true, false, true, true, false, 1000
        )
        .is_err());

        assert!(RedParams::new(
            5.0, 15.0, 0.0, true, false, true, true, false, 1000
        )
        .is_err());

        assert!(RedParams::new(
            5.0, 15.0, 1.5, true, false, true, true, false, 1000
        )
        .is_err());

        assert!(RedParams::new(
            5.0, 15.0, 0.1, true, false, true, true, false, 0
        )
        .is_err());
    }

    #[test]
    fn below_min_always_passes() {
        let mut red = Red::new(params(true, false, true, false), 42);

        for avg in [0.0, 1.0, 2.5, 4.999] {
            for _ in 0..100 {
                assert_eq!(red.decide(avg, 1000, false), Decision::Pass);
            }
        }
    }

    #[test]
    fn forced_beyond_limit() {
        let mut red = Red::new(params(false, false, true, false), 42);

        // Non-gentle forces at the upper threshold.
        assert_eq!(
            red.decide(15.0, 1000, false),
            Decision::Forced(Verdict::Drop)
        );

        let mut red = Red::new(params(true, false, true, false), 42);

        // Gentle forces only at twice the upper threshold.
        assert_eq!(
            red.decide(30.0, 1000, false),
            Decision::Forced(Verdict::Drop)
        );

        for _ in 0..100 {
            assert_ne!(
                red.decide(29.9, 1000, false),
                Decision::Forced(Verdict::Drop)
            );
        }
    }

    #[test]
    fn ramp_probability_bounds() {
        let red = Red::new(params(true, false, true, false), 42);

        let mut avg = 5.0;
        while avg < 15.0 {
            let p = red.ramp_probability(avg);

            assert!(p >= 0.0);
            assert!(p <= 0.1);

            avg += 0.01;
        }

        // Gentle region ramps from the current maximum to 1.
        let mut avg = 15.0;
        while avg < 30.0 {
            let p = red.ramp_probability(avg);

            assert!(p >= 0.1);
            assert!(p <= 1.0);

            avg += 0.01;
        }

        assert_eq!(red.ramp_probability(30.0), 1.0);
        assert_eq!(red.ramp_probability(4.0), 0.0);
    }

    #[test]
    fn corrected_probability_never_exceeds_one() {
        let mut red = Red::new(params(true, false, true, false), 42);

        // Grow the count without triggering resets by keeping the raw
        // probability at zero.
        red.count = 10_000;

        for p in [0.0, 0.01, 0.1, 0.5, 1.0] {
            assert!(red.corrected_probability(p, 1000) <= 1.0);
        }
    }

    #[test]
    fn wait_rule_spaces_actions() {
        let red = Red::new(params(true, false, true, true), 42);

        // count * p below one is exempt under the wait rule.
        assert_eq!(red.corrected_probability(0.1, 1000), 0.0);
    }

    #[test]
    fn count_correction_makes_action_certain() {
        let mut red = Red::new(params(true, false, true, false), 42);

        // Average pinned just below the upper threshold: raw probability is
        // near the maximum, so a certain action follows within a handful of
        // packets.
        let avg = 14.999;

        let mut seen_action = false;

        for _ in 0..100 {
            match red.decide(avg, 1000, false) {
                Decision::Unforced(Verdict::Drop) => {
                    seen_action = true;
                    break;
                },

                Decision::Pass => (),

                d => panic!("unexpected decision {d:?}"),
            }
        }

        assert!(seen_action);
    }

    #[test]
    fn ecn_marks_instead_of_drops() {
        let mut red = Red::new(params(true, true, true, false), 42);

        let mut seen_mark = false;

        for _ in 0..100 {
            match red.decide(14.999, 1000, true) {
                Decision::Unforced(v) => {
                    assert_eq!(v, Verdict::Mark);
                    seen_mark = true;
                },

                Decision::Pass => (),

                d => panic!("unexpected decision {d:?}"),
            }
        }

        assert!(seen_mark);

        // A non ECN-capable packet is dropped even with marking enabled.
        let mut red = Red::new(params(true, true, true, false), 42);

        for _ in 0..100 {
            if let Decision::Unforced(v) = red.decide(14.999, 1000, false) {
                assert_eq!(v, Verdict::Drop);
            }
        }
    }

    #[test]
    fn hard_drop_overrides_forced_mark() {
        let mut red = Red::new(params(true, true, true, false), 42);

        assert_eq!(
            red.decide(30.0, 1000, true),
            Decision::Forced(Verdict::Drop)
        );

        let mut red = Red::new(params(true, true, false, false), 42);

        assert_eq!(
            red.decide(30.0, 1000, true),
            Decision::Forced(Verdict::Mark)
        );
    }

    #[test]
    fn count_resets_on_action() {
        let mut red = Red::new(params(true, false, true, false), 42);

        loop {
            if let Decision::Unforced(..) = red.decide(14.999, 1000, false) {
                break;
            }
        }

        assert_eq!(red.count, 0);
        assert_eq!(red.count_bytes, 0);

        // Dropping back below the lower threshold rewinds the crossing
        // state.
        red.decide(1.0, 1000, false);

        assert_eq!(red.count, -1);
    }

    #[test]
    fn byte_mode_scales_by_size() {
        let params = RedParams::new(
            5.0, 15.0, 0.1, true, false, true, false, true, 1000,
        )
        .unwrap();

        let mut red = Red::new(params, 42);
        red.count = 1;
        red.count_bytes = 1000;

        let small = red.corrected_probability(0.05, 500);
        let large = red.corrected_probability(0.05, 2000);

        assert!(small < large);
    }
}
