//! Memory kernel: strided walk of a working set with periodic random jumps.

use std::sync::atomic::{AtomicBool, Ordering};

use rand::Rng;
use rand_pcg::Pcg64;

use super::{EpochResult, Kernel};

pub struct MemKernel {
    working_set: Vec<u8>,
    blksize: u64,
    stride: u64,
    nwblks: u64,
    cursor: u64,
    since_jump: u64,
    rng: Pcg64,
}

impl MemKernel {
    pub fn new(working_ram: u64, blksize: u64, stride: u64, seed: u64) -> Self {
        let blksize = blksize.max(1);
        let nwblks = (working_ram / blksize).max(1);
        MemKernel {
            working_set: vec![0u8; (nwblks * blksize) as usize],
            blksize,
            stride: stride.max(1),
            nwblks,
            cursor: 0,
            since_jump: 0,
            rng: Pcg64::new(seed as u128, 0xa02bdbf7bb3c0a7),
        }
    }
}

impl Kernel for MemKernel {
    fn run_epoch(&mut self, units: u64, exiting: &AtomicBool) -> EpochResult {
        let mut done = 0u64;
        for _ in 0..units {
            if exiting.load(Ordering::Relaxed) {
                break;
            }
            if self.since_jump >= self.stride {
                self.cursor = self.rng.random_range(0..self.nwblks);
                self.since_jump = 0;
            } else {
                self.cursor = (self.cursor + 1) % self.nwblks;
                self.since_jump += 1;
            }
            let offset = (self.cursor * self.blksize) as usize;
            self.working_set[offset] = self.working_set[offset].wrapping_add(1);
            done += 1;
        }
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
    fn run_epoch_touches_requested_units() {
        let mut k = MemKernel::new(64 * 1024, 4096, 4, 1);
        let exiting = AtomicBool::new(false);
        let r = k.run_epoch(100, &exiting);
        assert_eq!(r.done, 100);
    }

    #[test]
    fn cursor_stays_within_bounds() {
        let mut k = MemKernel::new(8192, 4096, 1, 42);
        let exiting = AtomicBool::new(false);
        k.run_epoch(1000, &exiting);
        assert!(k.cursor < k.nwblks);
    }
}
