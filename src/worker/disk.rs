//! Disk kernel: randomized single-block read/write/seek mix against a
//! regular file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::Rng;
use rand_pcg::Pcg64;

use crate::error::{EngineError, Result};
use crate::registry::{CreateMode, IO_READ, IO_SEEK, IO_WRITE};

use super::{EpochResult, Kernel};

/// No more than this many consecutive seeks before a kernel reports a
/// stall, bounding pathological "all-seek" mixes the way `MAX_RECV_TRIES`
/// bounds the network kernel's wrong-peer retries (see DESIGN.md).
pub const MAX_CONSECUTIVE_SEEKS: u32 = 8;

pub struct DiskKernel {
    file: File,
    blksize: u64,
    nblks: u64,
    mix: (u32, u32, u32),
    sync_every: u64,
    since_sync: u64,
    consecutive_seeks: u32,
    counters: [u64; 3],
    rng: Pcg64,
}

impl DiskKernel {
    pub fn open(
        path: &Path,
        mode: CreateMode,
        blksize: u64,
        nblks: u64,
        mix: (u32, u32, u32),
        sync_every: u64,
        seed: u64,
    ) -> Result<Self> {
        let blksize = blksize.max(1);
        let nblks = nblks.max(1);
        if path.is_dir() {
            return Err(EngineError::Validation(format!(
                "disk worker path {} is not a regular file",
                path.display()
            )));
        }
        let mut opts = OpenOptions::new();
        opts.read(true).write(true);
        match mode {
            CreateMode::ReadOnly => {
                opts.write(false);
                if !path.exists() {
                    return Err(EngineError::Validation(format!(
                        "disk worker file {} does not exist (mode=readonly)",
                        path.display()
                    )));
                }
            }
            CreateMode::CreateIfAbsent => {
                opts.create(true);
            }
            CreateMode::Overwrite => {
                opts.create(true).truncate(false);
            }
        }
        let file = opts.open(path)?;
        if !matches!(mode, CreateMode::ReadOnly) {
            file.set_len(blksize * nblks)?;
        }
        Ok(DiskKernel {
            file,
            blksize,
            nblks,
            mix,
            sync_every: sync_every.max(1),
            since_sync: 0,
            consecutive_seeks: 0,
            counters: [0; 3],
            rng: Pcg64::new(seed as u128, 0xa02bdbf7bb3c0a7),
        })
    }

    pub fn counters(&self) -> [u64; 3] {
        self.counters
    }

    fn draw_kind(&mut self) -> usize {
        let (r, w, s) = self.mix;
        let total = (r + w + s).max(1);
        let pick = self.rng.random_range(0..total);
        if pick < r {
            IO_READ
        } else if pick < r + w {
            IO_WRITE
        } else {
            IO_SEEK
        }
    }

    fn random_block(&mut self) -> u64 {
        self.rng.random_range(0..self.nblks)
    }
}

impl Kernel for DiskKernel {
    fn run_epoch(&mut self, units: u64, exiting: &AtomicBool) -> EpochResult {
        let mut done = 0u64;
        let mut stalled = false;
        let mut buf = vec![0u8; self.blksize as usize];
        for _ in 0..units {
            if exiting.load(Ordering::Relaxed) {
                break;
            }
            let kind = self.draw_kind();
            let block = self.random_block();
            let offset = block * self.blksize;
            let result = match kind {
                IO_READ => {
                    self.consecutive_seeks = 0;
                    self.file
                        .seek(SeekFrom::Start(offset))
                        .and_then(|_| self.file.read_exact(&mut buf))
                }
                IO_WRITE => {
                    self.consecutive_seeks = 0;
                    self.file
                        .seek(SeekFrom::Start(offset))
                        .and_then(|_| self.file.write_all(&buf))
                }
                _ => {
                    self.consecutive_seeks += 1;
                    self.file.seek(SeekFrom::Start(offset)).map(|_| ())
                }
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "disk kernel I/O error");
                break;
            }
            self.counters[kind] += 1;
            done += 1;
            self.since_sync += 1;
            if self.since_sync >= self.sync_every {
                let _ = self.file.sync_data();
                self.since_sync = 0;
            }
            if self.consecutive_seeks > MAX_CONSECUTIVE_SEEKS {
                stalled = true;
                break;
            }
        }
        EpochResult { done, stalled }
    }

    fn teardown(&mut self) {
        let _ = self.file.sync_all();
    }
}
