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

//! The validation scenario table and its pass/fail checks.
//!
//! Scenario ids and expectations follow the classic ns-2 adaptive RED test
//! suite; the queue-related subset is reproduced here. Each run gets a
//! fresh queue, drives it through the simulated topology, and is evaluated
//! against the counters its configuration must produce. A failing check is
//! a regression signal, not a recoverable condition.

use std::fs::File;
use std::io;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use ared::AqmQueue;
use ared::Error;
use ared::Stats;

use crate::sim::Sim;
use crate::sim::SimOutput;

/// The scenario ids the harness supports.
pub const SUPPORTED_SCENARIOS: &[u32] = &[2, 4, 10, 11, 12, 14];

/// One entry of the validation table.
///
/// Read-only once a run begins.
#[derive(Clone, Copy, Debug)]
pub struct ScenarioConfig {
    pub id: u32,

    pub name: &'static str,

    /// Bottleneck link rate, in bits per second.
    pub bottleneck_rate: u64,

    pub bottleneck_delay: Duration,

    /// Access link rate shared by both sources, in bits per second.
    pub access_rate: u64,

    /// One-way access propagation per source.
    pub access_delay: [Duration; 2],

    /// One-way sink-side propagation per source.
    pub egress_delay: [Duration; 2],

    /// Queue capacity, in packets.
    pub capacity: usize,

    pub mean_pkt_size: usize,

    /// Initial mark probability is `1 / l_interm`.
    pub l_interm: f64,

    pub use_ecn: bool,

    pub hard_drop: bool,

    pub target_delay: Option<Duration>,

    /// Whether the buffer is small enough that tail drops must occur.
    pub expect_queue_full: bool,

    pub seed: u64,
}

/// Resolves a scenario id.
///
/// An unsupported id is a hard configuration error.
pub fn lookup(id: u32) -> ared::Result<ScenarioConfig> {
    let base = ScenarioConfig {
        id,

        name: "",

        bottleneck_rate: 1_500_000,

        bottleneck_delay: Duration::from_millis(20),

        access_rate: 10_000_000,

        access_delay: [Duration::from_millis(2), Duration::from_millis(3)],

        egress_delay: [Duration::from_millis(4), Duration::from_millis(5)],

        capacity: 25,

        mean_pkt_size: 1000,

        l_interm: 10.0,

        use_ecn: false,

        hard_drop: true,

        target_delay: None,

        expect_queue_full: true,

        seed: u64::from(id),
    };

    let fastlink = ScenarioConfig {
        bottleneck_rate: 15_000_000,

        access_rate: 100_000_000,

        capacity: 1000,

        expect_queue_full: false,

        ..base
    };

    match id {
        // Small buffer on a slow bottleneck: both early and tail drops.
        2 => Ok(ScenarioConfig {
            name: "red1Adapt",
            ..base
        }),

        4 => Ok(ScenarioConfig {
            name: "red1AdaptEcn",
            use_ecn: true,
            ..base
        }),

        // Large buffer on a fast bottleneck: early action only, the buffer
        // must never fill.
        10 => Ok(ScenarioConfig {
            name: "fastlinkAllAdapt",
            ..fastlink
        }),

        11 => Ok(ScenarioConfig {
            name: "fastlinkAllAdaptEcn",
            use_ecn: true,
            hard_drop: false,
            ..fastlink
        }),

        12 => Ok(ScenarioConfig {
            name: "fastlinkAllAdapt1",
            target_delay: Some(Duration::from_millis(200)),
            ..fastlink
        }),

        // Long-delay slow bottleneck with a mid-sized buffer.
        14 => Ok(ScenarioConfig {
            name: "longlinkAdapt",
            bottleneck_delay: Duration::from_millis(100),
            access_delay: [Duration::ZERO, Duration::from_millis(1)],
            egress_delay: [
                Duration::from_millis(2),
                Duration::from_millis(3),
            ],
            capacity: 100,
            expect_queue_full: false,
            ..base
        }),

        id => Err(Error::UnknownScenario(id)),
    }
}

/// What one evaluated scenario run produced.
pub struct Report {
    pub stats: Stats,

    pub offered: u64,

    pub final_qlen: usize,

    pub qlen_series: Vec<(f64, u64)>,

    pub drop_series: Vec<(f64, u64)>,

    pub mark_series: Vec<(f64, u64)>,

    pub cwnd_series: Vec<(f64, u64, u64)>,
}

/// Runs one scenario to completion and evaluates its invariants.
///
/// The queue, estimator, decider and controller are built fresh for the
/// run; nothing survives into the next scenario.
pub fn run(
    cfg: &ScenarioConfig, adjust_interval: Duration,
) -> ared::Result<Report> {
    debug!("scenario {} ({}): configuring", cfg.id, cfg.name);

    let mut config = ared::Config::new();

    config.set_capacity(cfg.capacity);
    config.set_link_rate(cfg.bottleneck_rate)?;
    config.set_mean_pkt_size(cfg.mean_pkt_size)?;
    config.set_l_interm(cfg.l_interm)?;
    config.set_adaptive(true);
    config.set_adjust_interval(adjust_interval);
    config.set_use_ecn(cfg.use_ecn);
    config.set_hard_drop(cfg.hard_drop);
    config.set_target_delay(cfg.target_delay);
    config.set_seed(cfg.seed);

    let queue = AqmQueue::new(&config)?;

    debug!("scenario {} ({}): running", cfg.id, cfg.name);

    // The sim covers both the active phase and the drain tail; sources stop
    // well before the sink does.
    let output = Sim::new(queue, cfg, adjust_interval).run();

    debug!("scenario {} ({}): evaluating", cfg.id, cfg.name);

    evaluate(cfg, &output)?;

    info!(
        "scenario {} ({}): pass, {:?}",
        cfg.id, cfg.name, output.stats
    );

    Ok(Report {
        stats: output.stats,
        offered: output.offered,
        final_qlen: output.final_qlen,
        qlen_series: output.qlen_series,
        drop_series: output.drop_series,
        mark_series: output.mark_series,
        cwnd_series: output.cwnd_series,
    })
}

fn violation(check: &str, out: &SimOutput) -> Error {
    Error::InvariantViolation(format!(
        "{check}; offered={} final_qlen={} counters={:?}",
        out.offered, out.final_qlen, out.stats
    ))
}

fn evaluate(cfg: &ScenarioConfig, out: &SimOutput) -> ared::Result<()> {
    let st = &out.stats;

    if st.unforced_drop + st.unforced_mark == 0 {
        return Err(violation(
            "expected some unforced drops or marks, observed none",
            out,
        ));
    }

    if cfg.expect_queue_full && st.queue_full_drop == 0 {
        return Err(violation(
            "expected some drops due to queue full, observed none",
            out,
        ));
    }

    if !cfg.expect_queue_full && st.queue_full_drop != 0 {
        return Err(violation(
            "expected zero drops due to queue full",
            out,
        ));
    }

    if cfg.use_ecn && st.unforced_mark == 0 {
        return Err(violation(
            "expected some unforced marks with ECN enabled",
            out,
        ));
    }

    if cfg.use_ecn && !cfg.hard_drop && st.forced_drop != 0 {
        return Err(violation(
            "expected zero forced drops with ECN and no hard drop",
            out,
        ));
    }

    // Every offered packet is either rejected or accepted, and every
    // accepted packet either left the queue or is still in it.
    let rejected = st.queue_full_drop + st.unforced_drop + st.forced_drop;

    if st.rx_packets + rejected != out.offered {
        return Err(violation("offered packets are not all accounted for", out));
    }

    if st.rx_packets != st.tx_packets + out.final_qlen as u64 {
        return Err(violation("accepted packets are not all accounted for", out));
    }

    Ok(())
}

fn write_points(path: &Path, points: &[(f64, u64)]) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);

    for (t, v) in points {
        writeln!(out, "{t:.3} {v}")?;
    }

    out.flush()
}

/// Writes the run's series as gnuplot data under `dir`, one file per
/// series, rows in increasing time order.
pub fn write_series(report: &Report, dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;

    write_points(&dir.join("ared-qlen.plotme"), &report.qlen_series)?;
    write_points(
        &dir.join("ared-proactive-drops.plotme"),
        &report.drop_series,
    )?;
    write_points(
        &dir.join("ared-proactive-marks.plotme"),
        &report.mark_series,
    )?;

    let mut out =
        BufWriter::new(File::create(dir.join("ared-cwnd.plotme"))?);

    for (t, old, new) in &report.cwnd_series {
        writeln!(out, "{t:.3} {old} {new}")?;
    }

    out.flush()
}
