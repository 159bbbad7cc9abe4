// Copyright (C) 2020, Cloudflare, Inc.
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

//! Command-line argument parsing.

pub trait Args {
    fn with_docopt(docopt: &docopt::Docopt) -> Self;
}

pub const VALIDATE_USAGE: &str = "Usage:
  ared-validate [options]
  ared-validate -h | --help

Options:
  --scenario ID       Validation scenario to run [default: 2].
  --interval SECS     Seconds between adaptive adjustments [default: 0.5].
  --write-plots       Write gnuplot series under the output directory.
  --out DIR           Directory for the series files [default: plots].
  --list              List the supported scenarios and exit.
  -h --help           Show this screen.
";

/// Arguments of the `ared-validate` binary.
pub struct ValidateArgs {
    pub scenario: u32,
    pub interval: f64,
    pub write_plots: bool,
    pub out: String,
    pub list: bool,
}

impl Args for ValidateArgs {
    fn with_docopt(docopt: &docopt::Docopt) -> Self {
        let args = docopt.parse().unwrap_or_else(|e| e.exit());

        let scenario = args.get_str("--scenario");
        let scenario = scenario.parse::<u32>().unwrap_or_else(|_| {
            panic!("--scenario must be a number, got {scenario:?}")
        });

        let interval = args.get_str("--interval");
        let interval = interval.parse::<f64>().unwrap_or_else(|_| {
            panic!("--interval must be seconds, got {interval:?}")
        });

        let write_plots = args.get_bool("--write-plots");

        let out = args.get_str("--out").to_string();

        let list = args.get_bool("--list");

        ValidateArgs {
            scenario,
            interval,
            write_plots,
            out,
            list,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let docopt = docopt::Docopt::new(VALIDATE_USAGE)
            .unwrap()
            .argv(["ared-validate"]);

        let args = ValidateArgs::with_docopt(&docopt);

        assert_eq!(args.scenario, 2);
        assert_eq!(args.interval, 0.5);
        assert!(!args.write_plots);
        assert_eq!(args.out, "plots");
        assert!(!args.list);
    }

    #[test]
    fn overrides() {
        let docopt = docopt::Docopt::new(VALIDATE_USAGE).unwrap().argv([
            "ared-validate",
            "--scenario",
            "11",
            "--interval",
            "0.1",
            "--write-plots",
            "--out",
            "/tmp/ared",
        ]);

        let args = ValidateArgs::with_docopt(&docopt);

        assert_eq!(args.scenario, 11);
        assert_eq!(args.interval, 0.1);
        assert!(args.write_plots);
        assert_eq!(args.out, "/tmp/ared");
    }
}
