//! The link graph: named rings of workers that hand a single execution
//! token around in ring order, so their combined throughput sums to one
//! shared rate instead of each running independently.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;

use crate::error::{EngineError, Result};
use crate::lockmgr::{sorted_positions, LockId, Tracked};
use crate::registry::{Class, Phase, Registry, WorkerRef, MAX_LINKLEN, MAX_LINKS};

struct LinkRecord {
    members: ArrayVec<WorkerRef, MAX_LINKLEN>,
    started: bool,
}

#[derive(Default)]
struct LinkState {
    links: Vec<Option<LinkRecord>>,
}

pub struct LinkTable {
    state: Tracked<LinkState>,
}

impl LinkTable {
    pub fn new() -> Self {
        let mut links = Vec::with_capacity(MAX_LINKS);
        links.resize_with(MAX_LINKS, || None);
        LinkTable {
            state: Tracked::new(LockId::Link, LinkState { links }),
        }
    }

    /// Validates and installs a new ring: every `(wref, quantum)` pair must
    /// name a distinct, used, not-pending, not-running, not-already-linked
    /// slot. On success the slots' `prev`/`next` are stitched into a ring
    /// and `link_work` set to each member's quantum.
    pub fn insert(&self, registry: &Registry, members: &[(WorkerRef, u64)]) -> Result<u8> {
        if members.is_empty() || members.len() > MAX_LINKLEN {
            return Err(EngineError::Usage(format!(
                "link must have 1..={MAX_LINKLEN} members"
            )));
        }
        let mut seen = HashSet::new();
        for (wref, _) in members {
            if !seen.insert(*wref) {
                return Err(EngineError::Usage(format!(
                    "link member {:?} listed more than once",
                    wref
                )));
            }
        }

        // Link lock first (lowest position of the three kinds this op
        // touches), then the four class locks, then the per-slot locks in
        // sorted order.
        let mut state = self.state.lock();

        let mut classes: Vec<Class> = members.iter().map(|(w, _)| w.0).collect();
        classes.sort_by_key(|c| c.ordinal());
        classes.dedup();
        let _class_guards: Vec<_> = classes
            .iter()
            .map(|&c| registry.table(c).class_lock.lock())
            .collect();

        let order = sorted_positions(members.iter().map(|(w, _)| *w).collect());
        let mut validated = Vec::new();
        for wref in &order {
            let (class, idx) = *wref;
            let slot = registry.table(class).slots[idx as usize].lock();
            let w = slot
                .as_ref()
                .ok_or_else(|| EngineError::NotFound(format!("{:?}", wref)))?;
            if !w.shared.flags.used
                || w.shared.flags.pending
                || w.shared.flags.running
                || w.shared.flags.linked
            {
                return Err(EngineError::Validation(format!(
                    "worker {} is not eligible to join a link",
                    w.shared.label
                )));
            }
            validated.push(slot);
        }
        while let Some(g) = validated.pop() {
            drop(g);
        }

        let link_id = {
            let id = state
                .links
                .iter()
                .position(Option::is_none)
                .ok_or(EngineError::LinkExhausted)?;
            let mut record = LinkRecord {
                members: ArrayVec::new(),
                started: false,
            };
            for (wref, _) in members {
                let _ = record.members.try_push(*wref);
            }
            state.links[id] = Some(record);
            id as u8
        };

        let n = members.len();
        for (i, (wref, quantum)) in members.iter().enumerate() {
            let (class, idx) = *wref;
            let prev = members[(i + n - 1) % n].0;
            let next = members[(i + 1) % n].0;
            let mut slot = registry.table(class).slots[idx as usize].lock();
            if let Some(w) = slot.as_mut() {
                w.shared.flags.linked = true;
                w.shared.link_work = *quantum;
                w.shared.prev = if n > 1 { Some(prev) } else { None };
                w.shared.next = if n > 1 { Some(next) } else { None };
            }
        }

        Ok(link_id)
    }

    /// Tags every non-first member `linkwait`, every member `pending`, and
    /// returns the member list in **reverse** order: the caller (the
    /// master) must spawn threads in that order so the last member is
    /// already waiting before the first member can possibly hand off to
    /// it.
    pub fn start(&self, registry: &Registry, link_id: u8) -> Result<Vec<WorkerRef>> {
        let members = {
            let mut state = self.state.lock();
            let link = state
                .links
                .get_mut(link_id as usize)
                .and_then(|l| l.as_mut())
                .ok_or_else(|| EngineError::NotFound(format!("link {link_id}")))?;
            if link.started {
                return Err(EngineError::Usage(format!("link {link_id} already started")));
            }
            link.started = true;
            link.members.clone()
        };

        for (i, wref) in members.iter().enumerate() {
            let (class, idx) = *wref;
            let mut slot = registry.table(class).slots[idx as usize].lock();
            if let Some(w) = slot.as_mut() {
                let _ = w.shared.transition(Phase::Pending);
                w.shared.flags.pending = true;
                w.shared.flags.linkwait = i != 0;
            }
        }
        registry.stats.lock().workers_pending += members.len() as u64;
        Ok(members.into_iter().rev().collect())
    }

    /// Runs the hand-off protocol on behalf of `wref`, which has just
    /// exhausted its quantum: locate `next`, set `self.linkwait = true` /
    /// `next.linkwait = false`, wake `next`, then block until this worker's
    /// own `linkwait` clears (or it is asked to exit). Returns the time
    /// spent waiting, which the caller must not bill as a missed deadline.
    pub fn hand_off(&self, registry: &Registry, wref: WorkerRef) -> Duration {
        let started_at = Instant::now();
        // Link lock guards the ring linkage even though prev/next live in
        // the per-slot structs, per the global lock order.
        let _link_guard = self.state.lock();

        let (class, idx) = wref;
        let next = {
            let slot = registry.table(class).slots[idx as usize].lock();
            slot.as_ref().and_then(|w| w.shared.next)
        };
        let Some(next) = next else {
            // Ring has collapsed to a single member (or we were just
            // removed); nothing to hand off to.
            return Duration::ZERO;
        };

        if next == wref {
            return started_at.elapsed();
        }

        {
            let pair = sorted_positions(vec![wref, next]);
            let mut guards: Vec<_> = pair
                .iter()
                .map(|&(c, i)| registry.table(c).slots[i as usize].lock())
                .collect();
            for (g, &(c, i)) in guards.iter_mut().zip(pair.iter()) {
                if let Some(w) = g.as_mut() {
                    if (c, i) == wref {
                        w.shared.flags.linkwait = true;
                    } else {
                        w.shared.flags.linkwait = false;
                    }
                }
            }
            while let Some(g) = guards.pop() {
                drop(g);
            }
        }
        let (nclass, nidx) = next;
        registry.table(nclass).slots[nidx as usize].notify_all();
        drop(_link_guard);

        let table = registry.table(class);
        loop {
            let mut guard = table.slots[idx as usize].lock();
            let done = guard
                .as_ref()
                .map(|w| !w.shared.flags.linkwait || w.shared.flags.exiting)
                .unwrap_or(true);
            if done {
                break;
            }
            table.slots[idx as usize].wait_for(&mut guard, Duration::from_millis(100));
        }
        started_at.elapsed()
    }

    /// Splices a worker out of its ring. If the ring shrinks to one member,
    /// that member's `prev`/`next` are cleared and its `linkwait` too; if
    /// it empties entirely, the link record is deleted.
    pub fn remove_member(&self, registry: &Registry, wref: WorkerRef) {
        // Link lock first, then slot locks, to respect the global order
        // (prev/next logically belong to the ring even though they're
        // stored in the per-slot struct).
        let mut state = self.state.lock();
        let (prev, next) = {
            let slot = registry.table(wref.0).slots[wref.1 as usize].lock();
            match slot.as_ref() {
                Some(w) => (w.shared.prev, w.shared.next),
                None => return,
            }
        };

        let Some((id, record)) = state
            .links
            .iter_mut()
            .enumerate()
            .find(|(_, l)| l.as_ref().is_some_and(|r| r.members.contains(&wref)))
        else {
            return;
        };
        let record = record.as_mut().unwrap();
        let pos = record.members.iter().position(|&m| m == wref).unwrap();
        record.members.remove(pos);

        if record.members.len() <= 1 {
            if let Some(&only) = record.members.first() {
                let (oc, oi) = only;
                let mut slot = registry.table(oc).slots[oi as usize].lock();
                if let Some(w) = slot.as_mut() {
                    w.shared.prev = None;
                    w.shared.next = None;
                    w.shared.flags.linkwait = false;
                }
                registry.table(oc).slots[oi as usize].notify_all();
            }
            if record.members.is_empty() {
                state.links[id] = None;
            }
        } else if let (Some(prev), Some(next)) = (prev, next) {
            let mut pslot = registry.table(prev.0).slots[prev.1 as usize].lock();
            if let Some(w) = pslot.as_mut() {
                w.shared.next = Some(next);
            }
            drop(pslot);
            let mut nslot = registry.table(next.0).slots[next.1 as usize].lock();
            if let Some(w) = nslot.as_mut() {
                w.shared.prev = Some(prev);
                w.shared.flags.linkwait = false;
            }
            registry.table(next.0).slots[next.1 as usize].notify_all();
        }

        let (wclass, widx) = wref;
        let mut wslot = registry.table(wclass).slots[widx as usize].lock();
        if let Some(w) = wslot.as_mut() {
            w.shared.flags.linked = false;
            w.shared.prev = None;
            w.shared.next = None;
        }
    }

    /// Requests every member of a ring to exit, in reverse member order.
    pub fn kill(&self, registry: &Registry, link_id: u8) -> Result<()> {
        let members = {
            let mut state = self.state.lock();
            let link = state
                .links
                .get_mut(link_id as usize)
                .and_then(|l| l.take())
                .ok_or_else(|| EngineError::NotFound(format!("link {link_id}")))?;
            link.members
        };
        for (class, idx) in members.into_iter().rev() {
            let table = registry.table(class);
            let mut slot = table.slots[idx as usize].lock();
            if let Some(w) = slot.as_mut() {
                w.shared.flags.exiting = true;
                w.shared
                    .exit_flag
                    .store(true, std::sync::atomic::Ordering::Relaxed);
            }
            table.slots[idx as usize].notify_all();
        }
        Ok(())
    }
}

impl Default for LinkTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BurnKernel, Class, CpuOpts, Phase, SharedOpts, Worker, WorkerFlags, WorkerKind, WorkerStats};
    use arrayvec::ArrayVec as AV;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn place(registry: &Registry, label: &str) -> WorkerRef {
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
                after: AV::new(),
                link_work: 0,
                prev: None,
                next: None,
                phase: Phase::Parsed,
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
        (Class::Cpu, idx)
    }

    #[test]
    fn insert_forms_a_ring_and_start_tags_linkwait() {
        let registry = Registry::new();
        let links = LinkTable::new();
        let a = place(&registry, "a");
        let b = place(&registry, "b");
        let id = links.insert(&registry, &[(a, 100), (b, 200)]).unwrap();

        {
            let slot = registry.table(a.0).slots[a.1 as usize].lock();
            let w = slot.as_ref().unwrap();
            assert_eq!(w.shared.next, Some(b));
            assert_eq!(w.shared.prev, Some(b));
            assert!(w.shared.flags.linked);
            assert_eq!(w.shared.link_work, 100);
        }

        let spawn_order = links.start(&registry, id).unwrap();
        assert_eq!(spawn_order, vec![b, a]);
        let a_linkwait = registry.table(a.0).slots[a.1 as usize]
            .lock()
            .as_ref()
            .unwrap()
            .shared
            .flags
            .linkwait;
        let b_linkwait = registry.table(b.0).slots[b.1 as usize]
            .lock()
            .as_ref()
            .unwrap()
            .shared
            .flags
            .linkwait;
        assert!(!a_linkwait);
        assert!(b_linkwait);
    }

    #[test]
    fn duplicate_member_is_rejected() {
        let registry = Registry::new();
        let links = LinkTable::new();
        let a = place(&registry, "a");
        let err = links.insert(&registry, &[(a, 10), (a, 20)]);
        assert!(err.is_err());
    }

    #[test]
    fn hand_off_wakes_the_ring_neighbor() {
        let registry = Arc::new(Registry::new());
        let links = Arc::new(LinkTable::new());
        let a = place(&registry, "a");
        let b = place(&registry, "b");
        let id = links.insert(&registry, &[(a, 10), (b, 10)]).unwrap();
        links.start(&registry, id).unwrap();

        let (registry2, links2) = (registry.clone(), links.clone());
        let handle = std::thread::spawn(move || {
            // b plays along: once woken, it hands straight back to a.
            links2.hand_off(&registry2, b);
        });
        links.hand_off(&registry, a);
        handle.join().unwrap();
    }

    #[test]
    fn remove_member_collapses_ring_to_singleton() {
        let registry = Registry::new();
        let links = LinkTable::new();
        let a = place(&registry, "a");
        let b = place(&registry, "b");
        let id = links.insert(&registry, &[(a, 10), (b, 10)]).unwrap();
        links.start(&registry, id).unwrap();
        links.remove_member(&registry, a);
        let slot = registry.table(b.0).slots[b.1 as usize].lock();
        let w = slot.as_ref().unwrap();
        assert_eq!(w.shared.prev, None);
        assert_eq!(w.shared.next, None);
        assert!(!w.shared.flags.linkwait);
    }
}
