//! CLI flags, parsed with `clap`'s derive API.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "loadforge", version, about = "Synthetic multi-axis workload generator")]
pub struct Cli {
    /// Append engine logging to this file, in addition to stderr.
    #[arg(short = 'l', long = "log")]
    pub logfile: Option<PathBuf>,

    /// Load calibration constants from this file instead of measuring them.
    #[arg(short = 'r', long = "load-calib")]
    pub load_calib: Option<PathBuf>,

    /// Save measured calibration constants to this file.
    #[arg(short = 's', long = "save-calib")]
    pub save_calib: Option<PathBuf>,

    /// Read commands from this trace file instead of stdin.
    #[arg(short = 't', long = "trace-file")]
    pub trace_file: Option<PathBuf>,

    /// Debug verbosity, 0 (quiet) through 7 (trace).
    #[arg(short = 'd', long = "debug", default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=7))]
    pub debug: u8,

    /// Whether the trace file's lines carry a leading `<time-seconds>` column.
    #[arg(short = 'T', long = "timestamps", value_enum, default_value_t = YesNo::No)]
    pub timestamps: YesNo,

    /// Measure (and, with -s, persist) calibration constants instead of
    /// loading them.
    #[arg(short = 'b', long = "bench-calib")]
    pub bench_calib: bool,

    /// Number of calibration trials to run when calibrating.
    #[arg(long = "calib-trials", default_value_t = 10)]
    pub calib_trials: u32,

    /// Log every lock acquire/release to make ordering violations easy to
    /// spot (very chatty; debug builds only in practice).
    #[arg(short = 'S', long = "debug-locks")]
    pub debug_locks: bool,

    /// Exit immediately after calibration completes, without running the
    /// engine.
    #[arg(short = 'q', long = "calib-only")]
    pub calib_only: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum YesNo {
    Y,
    N,
}

impl YesNo {
    pub fn as_bool(self) -> bool {
        matches!(self, YesNo::Y)
    }
}

impl std::fmt::Display for YesNo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            YesNo::Y => write!(f, "y"),
            YesNo::N => write!(f, "n"),
        }
    }
}

/// Maps `-d` to a `tracing` level filter, the way the daemon crate derives
/// its `EnvFilter` default from a verbosity count.
pub fn level_for_debug(debug: u8) -> tracing::Level {
    match debug {
        0 => tracing::Level::ERROR,
        1 => tracing::Level::WARN,
        2..=3 => tracing::Level::INFO,
        4..=5 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn debug_level_maps_monotonically() {
        assert_eq!(level_for_debug(0), tracing::Level::ERROR);
        assert_eq!(level_for_debug(7), tracing::Level::TRACE);
    }

    #[test]
    fn yes_no_as_bool() {
        assert!(YesNo::Y.as_bool());
        assert!(!YesNo::N.as_bool());
    }
}
