//! The after-dependency manager: lets a worker declare up to
//! [`crate::registry::MAX_AFTERS`] predecessor labels it must wait on before
//! it is allowed to start running.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crossbeam_queue::SegQueue;

use crate::error::{EngineError, Result};
use crate::lockmgr::{LockId, Tracked};
use crate::registry::{Phase, Registry, WorkerRef};

#[derive(Default)]
struct AfterState {
    /// How many unresolved-but-still-live predecessors a waiter has left.
    remaining: HashMap<WorkerRef, u32>,
    /// Predecessor label -> waiters that named it in their `after` list.
    pending_by_label: HashMap<String, Vec<WorkerRef>>,
    /// Labels currently counted in `workers_leading`, so a leader named by
    /// several followers is only counted once.
    leading_labels: HashSet<String>,
}

pub struct AfterTable {
    state: Tracked<AfterState>,
    /// Notify-only condvar the master loop blocks on between command-queue
    /// checks, so a dependency becoming ready wakes it promptly instead of
    /// waiting out a full poll interval.
    waiting: Tracked<()>,
    ready: SegQueue<WorkerRef>,
    /// Wakes the master loop the moment a waiter becomes ready, set once the
    /// mailbox exists (main.rs wires it in after both are constructed).
    /// Without it, ready waiters still get picked up by the master loop's
    /// poll fallback, just up to its interval late.
    notify: OnceLock<Arc<dyn Fn() + Send + Sync>>,
}

impl AfterTable {
    pub fn new() -> Self {
        AfterTable {
            state: Tracked::new(LockId::After, AfterState::default()),
            waiting: Tracked::new(LockId::Waiting, ()),
            ready: SegQueue::new(),
            notify: OnceLock::new(),
        }
    }

    pub fn set_notifier(&self, notify: Arc<dyn Fn() + Send + Sync>) {
        let _ = self.notify.set(notify);
    }

    /// Registers `wref`'s dependency on each label in `afters`. Duplicates
    /// are collapsed; a label naming `wref` itself is rejected; a label that
    /// does not currently resolve to a live worker is silently dropped (its
    /// predecessor may already have finished). Returns `true` if at least
    /// one dependency resolved and is still live, meaning the caller must
    /// leave the worker in `Waiting` rather than advancing it to `Pending`.
    pub fn register(
        &self,
        registry: &Registry,
        wref: WorkerRef,
        own_label: &str,
        afters: &[String],
    ) -> Result<bool> {
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        for label in afters {
            if label == own_label {
                return Err(EngineError::Usage(format!(
                    "worker {own_label} cannot list itself in its own after set"
                )));
            }
            if !seen.insert(label.clone()) {
                continue;
            }
            if registry.find_by_label(label).is_some() {
                resolved.push(label.clone());
            }
        }
        if resolved.is_empty() {
            return Ok(false);
        }

        let mut state = self.state.lock();
        state.remaining.insert(wref, resolved.len() as u32);
        for label in resolved {
            state
                .pending_by_label
                .entry(label.clone())
                .or_default()
                .push(wref);
            if state.leading_labels.insert(label.clone()) {
                if let Some(leader) = registry.find_by_label(&label) {
                    let (lclass, lidx) = leader;
                    let table = registry.table(lclass);
                    if let Some(w) = table.slots[lidx as usize].lock().as_mut() {
                        w.shared.flags.leading = true;
                    }
                }
                registry.stats.lock().workers_leading += 1;
            }
        }
        Ok(true)
    }

    /// Called from a worker's teardown step with its own label. Resolves
    /// every waiter that was blocked on this label; waiters whose last
    /// predecessor just cleared move to `Pending` and are queued for the
    /// master loop to spawn.
    pub fn on_leader_exit(&self, registry: &Registry, label: &str) {
        let ready_now = {
            let mut state = self.state.lock();
            let waiters = state.pending_by_label.remove(label).unwrap_or_default();
            let mut ready_now = Vec::new();
            for waiter in waiters {
                if let Some(count) = state.remaining.get_mut(&waiter) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        state.remaining.remove(&waiter);
                        ready_now.push(waiter);
                    }
                }
            }
            if state.leading_labels.remove(label) {
                let mut stats = registry.stats.lock();
                stats.workers_leading = stats.workers_leading.saturating_sub(1);
            }
            ready_now
        };
        let mut newly_pending = 0u64;
        for wref in ready_now {
            let (class, idx) = wref;
            let table = registry.table(class);
            let mut slot = table.slots[idx as usize].lock();
            if let Some(w) = slot.as_mut() {
                if w.shared.transition(Phase::Pending).is_ok() {
                    w.shared.flags.waiting = false;
                    w.shared.flags.pending = true;
                    newly_pending += 1;
                    self.ready.push(wref);
                }
            }
        }
        if newly_pending > 0 {
            registry.stats.lock().workers_pending += newly_pending;
            if let Some(notify) = self.notify.get() {
                notify();
            }
        }
        self.waiting.notify_all();
    }

    /// Drains every worker that became ready since the last call. The
    /// master loop spawns a thread for each one returned.
    pub fn drain_ready(&self) -> Vec<WorkerRef> {
        let mut out = Vec::new();
        while let Some(wref) = self.ready.pop() {
            out.push(wref);
        }
        out
    }

    /// Blocks up to `timeout` for a dependency to resolve. Returns `true` if
    /// it timed out without anything becoming ready.
    pub fn wait_for_ready(&self, timeout: Duration) -> bool {
        let mut guard = self.waiting.lock();
        self.waiting.wait_for(&mut guard, timeout)
    }
}

impl Default for AfterTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BurnKernel, Class, CpuOpts, SharedOpts, Worker, WorkerFlags, WorkerKind, WorkerStats};
    use arrayvec::ArrayVec;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn place(registry: &Registry, label: &str, phase: Phase) -> WorkerRef {
        let table = registry.table(Class::Cpu);
        let idx = {
            let _g = table.class_lock.lock();
            table.find_free_slot().unwrap()
        };
        *table.slots[idx as usize].lock() = Some(Worker {
            shared: SharedOpts {
                wid: idx as u64,
                label: label.to_string(),
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
                phase,
                flags: WorkerFlags {
                    used: true,
                    ..Default::default()
                },
                stats: WorkerStats::default(),
                exit_flag: Arc::new(AtomicBool::new(false)),
            },
            kind: WorkerKind::Cpu(CpuOpts {
                percent_cpu: 10,
                burn_kernel: BurnKernel::Burn1,
                total_work: 0,
            }),
        });
        registry.stats.lock().labels.insert(label.to_string());
        (Class::Cpu, idx)
    }

    #[test]
    fn no_afters_is_immediately_ready() {
        let registry = Registry::new();
        let after = AfterTable::new();
        let w = place(&registry, "w1", Phase::Parsed);
        assert!(!after.register(&registry, w, "w1", &[]).unwrap());
    }

    #[test]
    fn unresolved_after_label_is_silently_dropped() {
        let registry = Registry::new();
        let after = AfterTable::new();
        let w = place(&registry, "w1", Phase::Parsed);
        let must_wait = after
            .register(&registry, w, "w1", &["ghost".to_string()])
            .unwrap();
        assert!(!must_wait);
    }

    #[test]
    fn self_reference_is_rejected() {
        let registry = Registry::new();
        let after = AfterTable::new();
        let w = place(&registry, "w1", Phase::Parsed);
        let err = after.register(&registry, w, "w1", &["w1".to_string()]);
        assert!(err.is_err());
    }

    #[test]
    fn waiter_becomes_ready_once_its_predecessor_exits() {
        let registry = Registry::new();
        let after = AfterTable::new();
        let leader = place(&registry, "leader", Phase::Pending);
        let waiter = place(&registry, "waiter", Phase::Waiting);
        {
            let table = registry.table(waiter.0);
            let mut slot = table.slots[waiter.1 as usize].lock();
            slot.as_mut().unwrap().shared.flags.waiting = true;
        }
        let must_wait = after
            .register(&registry, waiter, "waiter", &["leader".to_string()])
            .unwrap();
        assert!(must_wait);
        assert_eq!(registry.stats.lock().workers_leading, 1);
        assert!(after.drain_ready().is_empty());

        after.on_leader_exit(&registry, "leader");
        let ready = after.drain_ready();
        assert_eq!(ready, vec![waiter]);
        assert_eq!(registry.stats.lock().workers_leading, 0);
        let _ = leader;
    }
}
