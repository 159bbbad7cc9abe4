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

#[macro_use]
extern crate log;

use std::path::Path;
use std::time::Duration;

use ared_apps::args::Args;
use ared_apps::args::ValidateArgs;
use ared_apps::args::VALIDATE_USAGE;
use ared_apps::scenario;

fn main() {
    env_logger::builder().format_timestamp_nanos().init();

    let docopt = docopt::Docopt::new(VALIDATE_USAGE).unwrap();
    let args = ValidateArgs::with_docopt(&docopt);

    if args.list {
        for id in scenario::SUPPORTED_SCENARIOS {
            let cfg = scenario::lookup(*id).unwrap();
            println!("{id:>3}  {}", cfg.name);
        }

        return;
    }

    let cfg = match scenario::lookup(args.scenario) {
        Ok(v) => v,

        Err(e) => {
            eprintln!(
                "invalid scenario {}: {e}; supported scenarios are {:?}",
                args.scenario,
                scenario::SUPPORTED_SCENARIOS
            );

            std::process::exit(1);
        },
    };

    info!(
        "running scenario {} ({}) with a {}s adjustment interval",
        cfg.id, cfg.name, args.interval
    );

    let interval = Duration::from_secs_f64(args.interval);

    let report = match scenario::run(&cfg, interval) {
        Ok(v) => v,

        Err(e) => {
            eprintln!("scenario {} ({}) failed: {e}", cfg.id, cfg.name);

            std::process::exit(1);
        },
    };

    let st = report.stats;

    println!("*** ARED stats from the bottleneck queue ***");
    println!("offered packets:  {}", report.offered);
    println!("unforced drops:   {}", st.unforced_drop);
    println!("unforced marks:   {}", st.unforced_mark);
    println!("forced drops:     {}", st.forced_drop);
    println!("forced marks:     {}", st.forced_mark);
    println!("queue full drops: {}", st.queue_full_drop);
    println!("rx packets:       {}", st.rx_packets);
    println!("tx packets:       {}", st.tx_packets);

    if args.write_plots {
        let dir = Path::new(&args.out);

        if let Err(e) = scenario::write_series(&report, dir) {
            eprintln!("failed to write series to {}: {e}", dir.display());

            std::process::exit(1);
        }

        info!("series written under {}", dir.display());
    }
}
