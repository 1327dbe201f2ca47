//! CPU kernel: burn `units` work-units in a tight loop. This is the same
//! loop shape the calibrator measures `second_count` with, so the requested
//! load percentage maps directly onto calibrated units per epoch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{EpochResult, Kernel};

pub struct CpuKernel {
    total_done: u64,
}

impl CpuKernel {
    pub fn new() -> Self {
        CpuKernel { total_done: 0 }
    }

    pub fn total_done(&self) -> u64 {
        self.total_done
    }
}

impl Default for CpuKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel for CpuKernel {
    fn run_epoch(&mut self, units: u64, exiting: &AtomicBool) -> EpochResult {
        let counter = AtomicU64::new(0);
        let mut done = 0u64;
        // Chunk the loop so `exiting` is observed at a fine enough grain to
        // honor cancellation inside a single epoch, without paying an
        // atomic-load per increment.
        const CHUNK: u64 = 4096;
        while done < units {
            if exiting.load(Ordering::Relaxed) {
                break;
            }
            let this_chunk = CHUNK.min(units - done);
            for _ in 0..this_chunk {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            done += this_chunk;
        }
        self.total_done += done;
        EpochResult {
            done,
            stalled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_epoch_completes_requested_units_when_not_exiting() {
        let mut k = CpuKernel::new();
        let exiting = AtomicBool::new(false);
        let r = k.run_epoch(10_000, &exiting);
        assert_eq!(r.done, 10_000);
        assert!(!r.stalled);
        assert_eq!(k.total_done(), 10_000);
    }

    #[test]
    fn run_epoch_stops_early_once_exiting_is_set() {
        let mut k = CpuKernel::new();
        let exiting = AtomicBool::new(true);
        let r = k.run_epoch(10_000, &exiting);
        assert_eq!(r.done, 0);
    }
}
