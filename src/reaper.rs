//! Reaper: joins terminated worker threads and recycles their slot back to
//! `Empty` so a later insert can reuse it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_queue::SegQueue;

use crate::lockmgr::{LockId, Tracked};
use crate::registry::{Phase, Registry, WorkerRef};

pub struct ReaperQueue {
    finished: SegQueue<WorkerRef>,
    handles: Tracked<HashMap<WorkerRef, JoinHandle<()>>>,
}

impl ReaperQueue {
    pub fn new() -> Self {
        ReaperQueue {
            finished: SegQueue::new(),
            handles: Tracked::new(LockId::Reaper, HashMap::new()),
        }
    }

    /// Recorded by whoever spawns a worker thread, so the reaper can later
    /// join it without the worker needing a handle to itself.
    pub fn register_handle(&self, wref: WorkerRef, handle: JoinHandle<()>) {
        self.handles.lock().insert(wref, handle);
    }

    /// Called from inside a worker's own teardown step, once it has nothing
    /// left to do but terminate.
    pub fn enqueue_reaped(&self, wref: WorkerRef) {
        self.finished.push(wref);
    }

    /// Joins and recycles one finished worker, if any are queued. Returns
    /// whether it did anything, so callers can drain the queue in a tight
    /// loop before sleeping again.
    pub fn reap_one(&self, registry: &Registry) -> bool {
        let Some(wref) = self.finished.pop() else {
            return false;
        };
        if let Some(handle) = self.handles.lock().remove(&wref) {
            if let Err(e) = handle.join() {
                tracing::warn!(?wref, "worker thread panicked: {e:?}");
            }
        }

        let (class, idx) = wref;
        let table = registry.table(class);
        let label = {
            let mut slot = table.slots[idx as usize].lock();
            let Some(w) = slot.as_mut() else {
                return true;
            };
            let _ = w.shared.transition(Phase::Reaped);
            let _ = w.shared.transition(Phase::Empty);
            let label = w.shared.label.clone();
            *slot = None;
            label
        };
        {
            let mut cm = table.class_lock.lock();
            cm.used_count = cm.used_count.saturating_sub(1);
        }
        {
            let mut stats = registry.stats.lock();
            stats.labels.remove(&label);
        }
        true
    }

    /// Background loop: drain the finished queue, then sleep until woken by
    /// the next `enqueue_reaped` or the poll interval elapses.
    pub fn run_loop(&self, registry: Arc<Registry>, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Relaxed) {
            while self.reap_one(&registry) {}
            std::thread::sleep(Duration::from_millis(100));
        }
        while self.reap_one(&registry) {}
    }
}

impl Default for ReaperQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BurnKernel, Class, CpuOpts, SharedOpts, Worker, WorkerFlags, WorkerKind, WorkerStats};
    use arrayvec::ArrayVec;
    use std::sync::atomic::AtomicBool as AB;

    #[test]
    fn reap_one_recycles_an_empty_slot() {
        let registry = Registry::new();
        let reaper = ReaperQueue::new();
        let table = registry.table(Class::Cpu);
        let idx = {
            let _g = table.class_lock.lock();
            table.find_free_slot().unwrap()
        };
        *table.slots[idx as usize].lock() = Some(Worker {
            shared: SharedOpts {
                wid: 1,
                label: "c1".to_string(),
                class: Class::Cpu,
                index: idx,
                start_time: None,
                mod_time: chrono::Utc::now(),
                exec_time: None,
                max_work: None,
                after: ArrayVec::new(),
                link_work: 0,
                prev: None,
                next: None,
                phase: Phase::Exiting,
                flags: WorkerFlags {
                    used: true,
                    ..Default::default()
                },
                stats: WorkerStats::default(),
                exit_flag: Arc::new(AB::new(false)),
            },
            kind: WorkerKind::Cpu(CpuOpts {
                percent_cpu: 10,
                burn_kernel: BurnKernel::Burn1,
                total_work: 0,
            }),
        });
        registry.stats.lock().labels.insert("c1".to_string());

        assert!(!reaper.reap_one(&registry));
        reaper.enqueue_reaped((Class::Cpu, idx));
        assert!(reaper.reap_one(&registry));
        assert!(table.slots[idx as usize].lock().is_none());
        assert!(!registry.stats.lock().labels.contains("c1"));
    }
}
