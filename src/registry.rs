//! Worker classes, shared worker state, and the four fixed-capacity
//! registry tables.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use arrayvec::ArrayVec;
use chrono::{DateTime, Utc};

use crate::error::{EngineError, Result};
use crate::lockmgr::{LockId, Tracked};

pub const CLASS_CAPACITY: usize = 32;
pub const MAX_AFTERS: usize = 8;
pub const MAX_LINKLEN: usize = 16;
pub const MAX_LINKS: usize = 16;
pub const EPOCHS_PER_SEC: u64 = 20;
pub const EPOCH: Duration = Duration::from_millis(50);

/// Disk I/O bookkeeping indices, matching the original `C_IOREAD/WRITE/SEEK`.
pub const IO_READ: usize = 0;
pub const IO_WRITE: usize = 1;
pub const IO_SEEK: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Class {
    Cpu,
    Mem,
    Disk,
    Net,
}

impl Class {
    pub const ALL: [Class; 4] = [Class::Cpu, Class::Mem, Class::Disk, Class::Net];

    pub fn ordinal(self) -> usize {
        match self {
            Class::Cpu => 0,
            Class::Mem => 1,
            Class::Disk => 2,
            Class::Net => 3,
        }
    }

    pub fn short_name(self) -> &'static str {
        match self {
            Class::Cpu => "cpu",
            Class::Mem => "mem",
            Class::Disk => "disk",
            Class::Net => "net",
        }
    }

    pub fn parse(s: &str) -> Option<Class> {
        match s {
            "cpu" => Some(Class::Cpu),
            "mem" => Some(Class::Mem),
            "disk" => Some(Class::Disk),
            "net" => Some(Class::Net),
            _ => None,
        }
    }
}

impl std::fmt::Display for Class {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

/// A worker reference: which class table and which slot index.
pub type WorkerRef = (Class, u8);

/// Lifecycle phases. Distinct from the fine-grained boolean flags in
/// [`WorkerFlags`]: `Phase` is the coarse state-machine position, the flags
/// are per-epoch bookkeeping consulted by the runtime loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Empty,
    Parsed,
    Pending,
    Waiting,
    LinkWait,
    Running,
    Exiting,
    Reaped,
}

impl Phase {
    /// An explicit allow-list of legal transitions, not an "anything goes"
    /// setter.
    pub fn is_valid_transition(from: Phase, to: Phase) -> bool {
        use Phase::*;
        matches!(
            (from, to),
            (Empty, Parsed)
                | (Parsed, Pending)
                | (Parsed, Waiting)
                | (Waiting, Pending)
                | (Pending, Running)
                | (Pending, LinkWait)
                | (LinkWait, Running)
                | (Running, Exiting)
                | (Pending, Exiting)
                | (Waiting, Exiting)
                | (LinkWait, Exiting)
                | (Exiting, Reaped)
                | (Reaped, Empty)
        )
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WorkerFlags {
    pub used: bool,
    pub pending: bool,
    pub waiting: bool,
    pub linked: bool,
    pub leading: bool,
    pub running: bool,
    pub linkwait: bool,
    pub dirty: bool,
    pub mwait: bool,
    pub exiting: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WorkerStats {
    pub missed_deadlines: u64,
    pub missed_usecs: u64,
    pub total_deadlines: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BurnKernel {
    Burn1,
    Burn2,
    Burn3,
}

#[derive(Clone, Debug)]
pub struct CpuOpts {
    pub percent_cpu: u8,
    pub burn_kernel: BurnKernel,
    pub total_work: u64,
}

#[derive(Clone, Debug)]
pub struct MemOpts {
    pub total_ram: u64,
    pub working_ram: u64,
    pub blksize: u64,
    pub iorate: u64,
    pub stride: u64,
    pub ntblks: u64,
    pub nwblks: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    ReadOnly,
    CreateIfAbsent,
    Overwrite,
}

#[derive(Clone, Debug)]
pub struct DiskOpts {
    pub path: PathBuf,
    pub blksize: u64,
    pub nblks: u64,
    pub mode: CreateMode,
    pub iorate: u64,
    pub sync_every: u64,
    /// (reads, writes, seeks) mix weights.
    pub mix: (u32, u32, u32),
    pub counters: [u64; 3],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetMode {
    Read,
    Write,
}

#[derive(Clone, Debug)]
pub struct NetOpts {
    pub addr: IpAddr,
    pub port: u16,
    pub proto: Proto,
    pub mode: NetMode,
    pub pktsize: u64,
    pub iorate: u64,
    pub bytes: u64,
    pub usecs: u64,
}

#[derive(Clone, Debug)]
pub enum WorkerKind {
    Cpu(CpuOpts),
    Mem(MemOpts),
    Disk(DiskOpts),
    Net(NetOpts),
}

/// Fields every worker carries, regardless of class.
#[derive(Clone, Debug)]
pub struct SharedOpts {
    pub wid: u64,
    pub label: String,
    pub class: Class,
    pub index: u8,
    pub start_time: Option<DateTime<Utc>>,
    pub mod_time: DateTime<Utc>,
    pub exec_time: Option<Duration>,
    pub max_work: Option<u64>,
    pub after: ArrayVec<String, MAX_AFTERS>,
    pub link_work: u64,
    pub prev: Option<WorkerRef>,
    pub next: Option<WorkerRef>,
    pub phase: Phase,
    pub flags: WorkerFlags,
    pub stats: WorkerStats,
    /// Universal cancellation flag: set it and signal the slot's condvar to
    /// request exit, from any thread, without holding the slot lock for the
    /// duration of a blocking kernel call.
    pub exit_flag: Arc<AtomicBool>,
}

impl SharedOpts {
    pub fn transition(&mut self, to: Phase) -> Result<()> {
        if !Phase::is_valid_transition(self.phase, to) {
            return Err(EngineError::Usage(format!(
                "invalid phase transition {:?} -> {:?} for worker {}",
                self.phase, to, self.label
            )));
        }
        self.phase = to;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct Worker {
    pub shared: SharedOpts,
    pub kind: WorkerKind,
}

/// Per-class metadata guarded by the class lock: a free-slot scan hint and a
/// count used by `info`'s snapshot rendering.
#[derive(Default)]
pub struct ClassMeta {
    pub used_count: usize,
}

pub struct ClassTable {
    pub class: Class,
    pub class_lock: Tracked<ClassMeta>,
    pub slots: [Tracked<Option<Worker>>; CLASS_CAPACITY],
}

impl ClassTable {
    fn new(class: Class) -> Self {
        ClassTable {
            class,
            class_lock: Tracked::new(LockId::ClassLock(class), ClassMeta::default()),
            slots: std::array::from_fn(|i| {
                Tracked::new(LockId::Slot(class, i as u8), None)
            }),
        }
    }

    /// Find the first unused slot. Caller must hold `class_lock`.
    pub fn find_free_slot(&self) -> Option<u8> {
        for (i, slot) in self.slots.iter().enumerate() {
            let g = slot.lock();
            if g.is_none() {
                return Some(i as u8);
            }
        }
        None
    }

    pub fn find_by_label(&self, label: &str) -> Option<u8> {
        for (i, slot) in self.slots.iter().enumerate() {
            let g = slot.lock();
            if let Some(w) = g.as_ref() {
                if w.shared.label == label {
                    return Some(i as u8);
                }
            }
        }
        None
    }
}

/// Global label set and engine-wide stats, guarded by the stats lock and
/// updated by every lifecycle transition.
#[derive(Default)]
pub struct Stats {
    pub labels: HashSet<String>,
    pub workers_pending: u64,
    pub workers_running: u64,
    pub workers_reaped: u64,
    pub workers_spawned: u64,
    pub workers_leading: u64,
    pub next_wid: u64,
}

pub struct Registry {
    pub cpu: ClassTable,
    pub mem: ClassTable,
    pub disk: ClassTable,
    pub net: ClassTable,
    pub stats: Tracked<Stats>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            cpu: ClassTable::new(Class::Cpu),
            mem: ClassTable::new(Class::Mem),
            disk: ClassTable::new(Class::Disk),
            net: ClassTable::new(Class::Net),
            stats: Tracked::new(LockId::Stats, Stats::default()),
        }
    }

    pub fn table(&self, class: Class) -> &ClassTable {
        match class {
            Class::Cpu => &self.cpu,
            Class::Mem => &self.mem,
            Class::Disk => &self.disk,
            Class::Net => &self.net,
        }
    }

    /// Look up a label across all four classes. Must be called while
    /// holding the stats lock (the label set lives there), so no class/slot
    /// locks are taken here — routes label lookups through the cheaper
    /// stats-lock-guarded set instead of scanning all four class tables.
    pub fn label_exists(&self, label: &str) -> bool {
        self.stats.lock().labels.contains(label)
    }

    /// Resolve a label to its `(class, index)` by scanning the class
    /// tables. Used only off the hot insert path (command dispatch,
    /// `after`/`link` resolution).
    pub fn find_by_label(&self, label: &str) -> Option<WorkerRef> {
        for class in Class::ALL {
            let table = self.table(class);
            let _g = table.class_lock.lock();
            if let Some(idx) = table.find_by_label(label) {
                return Some((class, idx));
            }
        }
        None
    }

    pub fn auto_label(class: Class, wid: u64) -> String {
        format!("{}{}", class.short_name(), wid)
    }

    pub fn next_wid(&self) -> u64 {
        let mut stats = self.stats.lock();
        stats.next_wid += 1;
        stats.next_wid
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_worker(class: Class, wid: u64, label: &str) -> Worker {
        Worker {
            shared: SharedOpts {
                wid,
                label: label.to_string(),
                class,
                index: 0,
                start_time: None,
                mod_time: Utc::now(),
                exec_time: None,
                max_work: None,
                after: ArrayVec::new(),
                link_work: 0,
                prev: None,
                next: None,
                phase: Phase::Parsed,
                flags: WorkerFlags {
                    used: true,
                    pending: true,
                    ..Default::default()
                },
                stats: WorkerStats::default(),
                exit_flag: Arc::new(AtomicBool::new(false)),
            },
            kind: WorkerKind::Cpu(CpuOpts {
                percent_cpu: 50,
                burn_kernel: BurnKernel::Burn1,
                total_work: 0,
            }),
        }
    }

    #[test]
    fn label_uniqueness_across_classes() {
        let reg = Registry::new();
        {
            let mut stats = reg.stats.lock();
            stats.labels.insert("c1".to_string());
        }
        assert!(reg.label_exists("c1"));
        assert!(!reg.label_exists("c2"));
    }

    #[test]
    fn insert_and_find_by_label_in_class_table() {
        let reg = Registry::new();
        let idx = {
            let _g = reg.cpu.class_lock.lock();
            reg.cpu.find_free_slot().expect("free slot")
        };
        *reg.cpu.slots[idx as usize].lock() = Some(fresh_worker(Class::Cpu, 1, "c1"));
        let found = {
            let _g = reg.cpu.class_lock.lock();
            reg.cpu.find_by_label("c1")
        };
        assert_eq!(found, Some(idx));
    }

    #[test]
    fn phase_transitions_follow_the_allow_list() {
        assert!(Phase::is_valid_transition(Phase::Empty, Phase::Parsed));
        assert!(Phase::is_valid_transition(Phase::Parsed, Phase::Pending));
        assert!(Phase::is_valid_transition(Phase::Pending, Phase::Running));
        assert!(Phase::is_valid_transition(Phase::Running, Phase::Exiting));
        assert!(Phase::is_valid_transition(Phase::Exiting, Phase::Reaped));
        assert!(Phase::is_valid_transition(Phase::Reaped, Phase::Empty));
        assert!(!Phase::is_valid_transition(Phase::Empty, Phase::Running));
        assert!(!Phase::is_valid_transition(Phase::Reaped, Phase::Running));
    }

    #[test]
    fn reap_sets_slot_back_to_empty() {
        let reg = Registry::new();
        let idx = {
            let _g = reg.cpu.class_lock.lock();
            reg.cpu.find_free_slot().expect("free slot")
        };
        *reg.cpu.slots[idx as usize].lock() = Some(fresh_worker(Class::Cpu, 1, "c1"));
        // Reap: clear the slot.
        *reg.cpu.slots[idx as usize].lock() = None;
        assert!(reg.cpu.slots[idx as usize].lock().is_none());
    }

    #[test]
    fn auto_label_uses_class_and_wid() {
        assert_eq!(Registry::auto_label(Class::Mem, 7), "mem7");
    }
}
