//! The shared epoch loop every worker thread runs, regardless of class.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::after::AfterTable;
use crate::link::LinkTable;
use crate::registry::{Phase, Registry, WorkerKind, WorkerRef, EPOCH, EPOCHS_PER_SEC};
use crate::reaper::ReaperQueue;

use super::Kernel;

/// Shared context every worker thread needs, bundled so `master` can spawn
/// threads with a single cheap `Arc` clone each.
#[derive(Clone)]
pub struct EngineCtx {
    pub registry: std::sync::Arc<Registry>,
    pub link: std::sync::Arc<LinkTable>,
    pub after: std::sync::Arc<AfterTable>,
    pub reaper: std::sync::Arc<ReaperQueue>,
}

struct RateParams {
    blocks_per_epoch: f64,
    unit_size: u64,
    target_total: Option<u64>,
}

fn compute_rate_params(kind: &WorkerKind, second_count: u64) -> RateParams {
    match kind {
        WorkerKind::Cpu(o) => RateParams {
            blocks_per_epoch: second_count as f64 * o.percent_cpu as f64
                / (100.0 * EPOCHS_PER_SEC as f64),
            unit_size: 1,
            target_total: None,
        },
        WorkerKind::Mem(o) => RateParams {
            blocks_per_epoch: o.iorate as f64 / o.blksize.max(1) as f64 / EPOCHS_PER_SEC as f64,
            unit_size: o.blksize.max(1),
            target_total: None,
        },
        WorkerKind::Disk(o) => RateParams {
            blocks_per_epoch: o.iorate as f64 / o.blksize.max(1) as f64 / EPOCHS_PER_SEC as f64,
            unit_size: o.blksize.max(1),
            target_total: None,
        },
        WorkerKind::Net(o) => RateParams {
            blocks_per_epoch: o.iorate as f64 / o.pktsize.max(1) as f64 / EPOCHS_PER_SEC as f64,
            unit_size: o.pktsize.max(1),
            target_total: None,
        },
    }
}

/// Runs the full register -> reload -> main-loop -> teardown lifecycle for
/// one worker. `kernel` is already opened (file/socket acquired) by the
/// caller before the thread is spawned, since opening can fail and
/// validation failures should be rejected before any thread exists.
pub fn run_worker(ctx: EngineCtx, wref: WorkerRef, second_count: u64, mut kernel: Box<dyn Kernel>) {
    let (class, idx) = wref;
    let table = ctx.registry.table(class);
    let (exit_flag, starts_linkwait, was_pending) = {
        let mut slot = table.slots[idx as usize].lock();
        let Some(w) = slot.as_mut() else {
            tracing::warn!(?class, idx, "worker thread started for an empty slot");
            return;
        };
        let starts_linkwait = w.shared.flags.linkwait && !w.shared.flags.exiting;
        let target = if starts_linkwait { Phase::LinkWait } else { Phase::Running };
        if let Err(e) = w.shared.transition(target) {
            tracing::warn!(error = %e, "worker register transition rejected");
        }
        let was_pending = w.shared.flags.pending;
        w.shared.flags.running = !starts_linkwait;
        w.shared.flags.pending = false;
        w.shared.start_time.get_or_insert_with(Utc::now);
        (w.shared.exit_flag.clone(), starts_linkwait, was_pending)
    };
    {
        let mut stats = ctx.registry.stats.lock();
        if was_pending {
            stats.workers_pending = stats.workers_pending.saturating_sub(1);
        }
        if !starts_linkwait {
            stats.workers_running += 1;
        }
    }

    // Step 2: link-start wait. A worker that isn't the head of its ring
    // registers into `LinkWait` above and only moves to `Running` once the
    // hand-off token actually reaches it here.
    if starts_linkwait {
        loop {
            let needs_wait = {
                let slot = table.slots[idx as usize].lock();
                slot.as_ref()
                    .map(|w| w.shared.flags.linkwait && !w.shared.flags.exiting)
                    .unwrap_or(false)
            };
            if !needs_wait {
                break;
            }
            let mut guard = table.slots[idx as usize].lock();
            while guard
                .as_ref()
                .map(|w| w.shared.flags.linkwait && !w.shared.flags.exiting)
                .unwrap_or(false)
            {
                table.slots[idx as usize].wait(&mut guard);
            }
        }

        let mut slot = table.slots[idx as usize].lock();
        if let Some(w) = slot.as_mut() {
            if let Err(e) = w.shared.transition(Phase::Running) {
                tracing::warn!(error = %e, "worker link-wait->running transition rejected");
            }
            w.shared.flags.running = true;
        }
        drop(slot);
        let mut stats = ctx.registry.stats.lock();
        stats.workers_running += 1;
    }

    let mut total_done: u64 = 0;
    let mut curr_residual: f64 = 0.0;
    let mut link_epochs_remaining: f64 = 0.0;
    let mut rate: RateParams;
    let start = Instant::now();
    let mut next_deadline = start;
    let mut exec_time: Option<Duration> = None;
    let mut target_total: Option<u64> = None;

    // Step 3: reload (also the `restart` label workers jump back to when
    // `dirty` is set).
    loop {
        {
            let mut slot = table.slots[idx as usize].lock();
            let Some(w) = slot.as_mut() else { break };
            w.shared.mod_time = Utc::now();
            w.shared.flags.dirty = false;
            rate = compute_rate_params(&w.kind, second_count);
            exec_time = w.shared.exec_time;
            target_total = w.shared.max_work.map(|m| {
                if matches!(w.kind, WorkerKind::Cpu(_)) {
                    m
                } else {
                    m / rate.unit_size.max(1)
                }
            });
            if w.shared.link_work > 0 && rate.blocks_per_epoch > 0.0 {
                link_epochs_remaining =
                    w.shared.link_work as f64 / (rate.blocks_per_epoch * rate.unit_size as f64);
            }
        }
        next_deadline = Instant::now();

        // Step 4: main loop until exiting.
        loop {
            if exit_flag.load(Ordering::Relaxed) {
                break;
            }
            next_deadline += EPOCH;

            curr_residual += rate.blocks_per_epoch;
            let units = curr_residual.floor().max(0.0) as u64;
            curr_residual -= units as f64;

            let result = kernel.run_epoch(units, &exit_flag);
            total_done += result.done;

            let is_linked = {
                let slot = table.slots[idx as usize].lock();
                slot.as_ref().map(|w| w.shared.flags.linked).unwrap_or(false)
            };
            let mut link_wait_time = Duration::ZERO;
            if is_linked && link_epochs_remaining > 0.0 {
                link_epochs_remaining -= 1.0;
                if link_epochs_remaining <= 0.0 {
                    link_wait_time = ctx.link.hand_off(&ctx.registry, wref);
                    let slot = table.slots[idx as usize].lock();
                    if let Some(w) = slot.as_ref() {
                        link_epochs_remaining = w.shared.link_work as f64
                            / (rate.blocks_per_epoch * rate.unit_size as f64).max(1e-9);
                    }
                }
            }
            // Link waits are not billed as missed deadlines.
            next_deadline += link_wait_time;

            let elapsed_exceeded = exec_time.is_some_and(|d| start.elapsed() >= d);
            let work_exhausted = target_total.is_some_and(|t| total_done >= t) || result.stalled;
            if elapsed_exceeded || work_exhausted {
                let mut slot = table.slots[idx as usize].lock();
                if let Some(w) = slot.as_mut() {
                    w.shared.flags.exiting = true;
                }
                exit_flag.store(true, Ordering::Relaxed);
            }

            let now = Instant::now();
            let delta = next_deadline.saturating_duration_since(now);
            let missed = now > next_deadline;
            {
                let mut slot = table.slots[idx as usize].lock();
                if let Some(w) = slot.as_mut() {
                    w.shared.stats.total_deadlines += 1;
                    if missed {
                        let over = now.duration_since(next_deadline);
                        w.shared.stats.missed_deadlines += 1;
                        w.shared.stats.missed_usecs += over.as_micros() as u64;
                    }
                }
            }
            if !missed && delta > Duration::from_millis(15) {
                std::thread::sleep(delta);
            }

            let dirty = {
                let slot = table.slots[idx as usize].lock();
                slot.as_ref().map(|w| w.shared.flags.dirty).unwrap_or(false)
            };
            if exit_flag.load(Ordering::Relaxed) {
                break;
            }
            if dirty {
                break; // re-enter the reload loop
            }
        }

        if exit_flag.load(Ordering::Relaxed) {
            break;
        }
    }

    // Step 5: teardown.
    kernel.teardown();
    teardown_worker(&ctx, wref);
}

/// Cleans up a worker slot whose kernel never finished opening (e.g. a TCP
/// net worker whose accept failed or was cut short by shutdown), so it
/// doesn't linger in `Pending` forever. Never having run, it skips the
/// running-stats and link/after teardown steps `teardown_worker` does.
pub fn abandon_unopened_worker(ctx: &EngineCtx, wref: WorkerRef) {
    let (class, idx) = wref;
    let table = ctx.registry.table(class);
    let was_pending = {
        let mut slot = table.slots[idx as usize].lock();
        let Some(w) = slot.as_mut() else { return };
        let _ = w.shared.transition(Phase::Exiting);
        w.shared.flags.pending
    };
    if was_pending {
        let mut stats = ctx.registry.stats.lock();
        stats.workers_pending = stats.workers_pending.saturating_sub(1);
    }
    ctx.reaper.enqueue_reaped(wref);
}

fn teardown_worker(ctx: &EngineCtx, wref: WorkerRef) {
    let (class, idx) = wref;
    let table = ctx.registry.table(class);

    let label = {
        let mut slot = table.slots[idx as usize].lock();
        let Some(w) = slot.as_mut() else { return };
        let _ = w.shared.transition(Phase::Exiting);
        w.shared.flags.running = false;
        w.shared.label.clone()
    };

    if { table.slots[idx as usize].lock().as_ref().map(|w| w.shared.flags.linked).unwrap_or(false) } {
        ctx.link.remove_member(&ctx.registry, wref);
    }

    ctx.after.on_leader_exit(&ctx.registry, &label);

    {
        let mut stats = ctx.registry.stats.lock();
        stats.workers_running = stats.workers_running.saturating_sub(1);
        stats.workers_reaped += 1;
    }

    ctx.reaper.enqueue_reaped(wref);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BurnKernel, CpuOpts};

    #[test]
    fn cpu_rate_params_scale_with_percent() {
        let kind = WorkerKind::Cpu(CpuOpts {
            percent_cpu: 50,
            burn_kernel: BurnKernel::Burn1,
            total_work: 0,
        });
        let rate = compute_rate_params(&kind, 1_000_000);
        // 1_000_000 * 0.5 / 20 = 25_000 units/epoch
        assert!((rate.blocks_per_epoch - 25_000.0).abs() < 1e-6);
    }
}
