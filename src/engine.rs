//! Wires the registry, lock manager, link graph, after-dependency manager,
//! reaper, and calibrator into one engine object that `master` and `main`
//! drive: a single wiring point rather than scattering `Arc` clones through
//! every entry point.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::JoinHandle;
use std::time::Duration;

use arrayvec::ArrayVec;
use chrono::Utc;

use crate::after::AfterTable;
use crate::calibrator::Calibration;
use crate::command::{Attrs, Command, LinkOp, WctlOp};
use crate::error::{EngineError, Result};
use crate::link::LinkTable;
use crate::reaper::ReaperQueue;
use crate::registry::{
    Class, CpuOpts, CreateMode, DiskOpts, MemOpts, NetMode, NetOpts, Phase, Proto, Registry,
    SharedOpts, Worker, WorkerFlags, WorkerKind, WorkerRef, MAX_AFTERS,
};
use crate::worker::cpu::CpuKernel;
use crate::worker::disk::DiskKernel;
use crate::worker::mem::MemKernel;
use crate::worker::net::NetKernel;
use crate::worker::runtime::{abandon_unopened_worker, run_worker, EngineCtx};
use crate::worker::Kernel;

/// Labels seen in a `link queue` command but not yet named by a `link
/// start`; kept separate from `LinkTable`'s own bookkeeping so `del` can
/// remove a not-yet-started link by label.
struct LinkLabels {
    by_label: HashMap<String, u8>,
}

pub struct Engine {
    pub registry: Arc<Registry>,
    pub link: Arc<LinkTable>,
    pub after: Arc<AfterTable>,
    pub reaper: Arc<ReaperQueue>,
    pub calibration: Calibration,
    link_labels: StdMutex<LinkLabels>,
    shutdown: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(calibration: Calibration) -> Self {
        Engine {
            registry: Arc::new(Registry::new()),
            link: Arc::new(LinkTable::new()),
            after: Arc::new(AfterTable::new()),
            reaper: Arc::new(ReaperQueue::new()),
            calibration,
            link_labels: StdMutex::new(LinkLabels {
                by_label: HashMap::new(),
            }),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ctx(&self) -> EngineCtx {
        EngineCtx {
            registry: self.registry.clone(),
            link: self.link.clone(),
            after: self.after.clone(),
            reaper: self.reaper.clone(),
        }
    }

    /// Runs one command to completion, returning a response string for
    /// commands that produce one (`info`, `helo`).
    pub fn dispatch(&self, cmd: Command) -> Result<String> {
        match cmd {
            Command::Wctl { op, class, attrs } => self.dispatch_wctl(op, class, attrs).map(|_| String::new()),
            Command::Link { op, label, members } => {
                self.dispatch_link(op, &label, members).map(|_| String::new())
            }
            Command::Info {
                class,
                worker,
                detail,
            } => Ok(self.render_info(class, worker.as_deref(), detail)),
            Command::Wait { class, time } => {
                let outstanding = self.wait(class, time);
                Ok(format!("outstanding={outstanding}"))
            }
            Command::Helo => Ok("ok".to_string()),
            Command::Quit => {
                self.shutdown.store(true, Ordering::Relaxed);
                Ok(String::new())
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    // ---- wctl --------------------------------------------------------

    fn dispatch_wctl(&self, op: WctlOp, class: Class, attrs: Attrs) -> Result<()> {
        match op {
            WctlOp::Add => self.insert_worker(class, attrs, true),
            WctlOp::Queue => self.insert_worker(class, attrs, false),
            WctlOp::Start => self.start_queued(class, attrs.require("label").ok().map(str::to_string)),
            WctlOp::Mod => self.mod_worker(class, attrs),
            WctlOp::Del => self.del_worker(class, attrs),
        }
    }

    fn parse_kind(class: Class, attrs: &Attrs) -> Result<WorkerKind> {
        Ok(match class {
            Class::Cpu => {
                let percent_cpu: u8 = attrs
                    .get("load")
                    .ok_or_else(|| EngineError::Usage("cpu: missing load".to_string()))?
                    .parse()
                    .map_err(|_| EngineError::Usage("cpu: load is not an integer".to_string()))?;
                if !(1..=100).contains(&percent_cpu) {
                    return Err(EngineError::Validation("cpu: load must be 1..=100".to_string()));
                }
                WorkerKind::Cpu(CpuOpts {
                    percent_cpu,
                    burn_kernel: crate::registry::BurnKernel::Burn1,
                    total_work: attrs.get_size("work")?.unwrap_or(0),
                })
            }
            Class::Mem => {
                let total_ram = attrs.require_size("total")?;
                let iorate = attrs.require_size("iorate")?;
                let working_ram = attrs.get_size("wset")?.unwrap_or(total_ram);
                if working_ram > total_ram {
                    return Err(EngineError::Validation("mem: wset must be <= total".to_string()));
                }
                let blksize = attrs.get_size("blksize")?.unwrap_or(4096);
                let stride = attrs.get_u64("stride")?.unwrap_or(1).max(1);
                WorkerKind::Mem(MemOpts {
                    total_ram,
                    working_ram,
                    blksize,
                    iorate,
                    stride,
                    ntblks: total_ram / blksize.max(1),
                    nwblks: working_ram / blksize.max(1),
                })
            }
            Class::Disk => {
                let path = PathBuf::from(attrs.require("file")?);
                let blksize = attrs.require_size("blksize")?;
                let iorate = attrs.require_size("iorate")?;
                let mix = parse_iomix(attrs.require("iomix")?)?;
                let nblks = attrs.get_size("nblks")?.unwrap_or(1024);
                let sync_every = attrs.get_u64("sync")?.unwrap_or(64);
                let mode = match attrs.get_u64("mode")?.unwrap_or(1) {
                    0 => CreateMode::ReadOnly,
                    1 => CreateMode::CreateIfAbsent,
                    2 => CreateMode::Overwrite,
                    other => {
                        return Err(EngineError::Usage(format!("disk: invalid mode {other}")))
                    }
                };
                if !path.exists() && mode == CreateMode::ReadOnly {
                    return Err(EngineError::Validation(format!(
                        "disk: {} does not exist (mode=readonly)",
                        path.display()
                    )));
                }
                WorkerKind::Disk(DiskOpts {
                    path,
                    blksize,
                    nblks,
                    mode,
                    iorate,
                    sync_every,
                    mix,
                    counters: [0; 3],
                })
            }
            Class::Net => {
                let port: u16 = attrs
                    .require("port")?
                    .parse()
                    .map_err(|_| EngineError::Usage("net: invalid port".to_string()))?;
                let pktsize = attrs.require_size("pktsize")?;
                if pktsize == 0 {
                    return Err(EngineError::Validation("net: pktsize must be > 0".to_string()));
                }
                let iorate = attrs.require_size("iorate")?;
                let addr: IpAddr = crate::command::parse_net_addr(attrs)?;
                let proto = match attrs.get("proto").unwrap_or("tcp") {
                    "tcp" => Proto::Tcp,
                    "udp" => Proto::Udp,
                    other => return Err(EngineError::Usage(format!("net: unknown proto {other}"))),
                };
                let mode = match attrs.get("mode").unwrap_or("r") {
                    "r" => NetMode::Read,
                    "w" => NetMode::Write,
                    other => return Err(EngineError::Usage(format!("net: unknown mode {other}"))),
                };
                if port <= 1024 && !running_as_root() {
                    return Err(EngineError::Validation(
                        "net: port <= 1024 requires root".to_string(),
                    ));
                }
                WorkerKind::Net(NetOpts {
                    addr,
                    port,
                    proto,
                    mode,
                    pktsize,
                    iorate,
                    bytes: 0,
                    usecs: 0,
                })
            }
        })
    }

    fn insert_worker(&self, class: Class, attrs: Attrs, start_now: bool) -> Result<()> {
        let kind = Self::parse_kind(class, &attrs)?;
        let exec_time = attrs
            .get_u64("etime")?
            .filter(|&v| v != 0)
            .map(Duration::from_secs);
        let max_work = attrs.get_size("work")?.filter(|&v| v != 0);
        let mut after: ArrayVec<String, MAX_AFTERS> = ArrayVec::new();
        for label in &attrs.after {
            if after.len() == MAX_AFTERS {
                return Err(EngineError::Usage(format!("at most {MAX_AFTERS} after labels")));
            }
            let _ = after.try_push(label.clone());
        }

        if let Some(l) = attrs.get("label") {
            if self.registry.label_exists(l) {
                return Err(EngineError::Usage(format!("label {l} already in use")));
            }
        }

        let table = self.registry.table(class);
        let idx = {
            let mut cm = table.class_lock.lock();
            let idx = table
                .find_free_slot()
                .ok_or(EngineError::SlotExhausted(class))?;
            cm.used_count += 1;
            idx
        };
        let wid = self.registry.next_wid();
        let label = match attrs.get("label") {
            Some(l) => l.to_string(),
            None => Registry::auto_label(class, wid),
        };

        let wref: WorkerRef = (class, idx);
        let after_labels = after.clone();

        // The slot must be populated before `after.register` can run: a
        // leader exiting concurrently resolves waiters by looking theirs up
        // by `wref` and writing into their slot, which would silently no-op
        // against an empty one.
        {
            let mut slot = table.slots[idx as usize].lock();
            *slot = Some(Worker {
                shared: SharedOpts {
                    wid,
                    label: label.clone(),
                    class,
                    index: idx,
                    start_time: None,
                    mod_time: Utc::now(),
                    exec_time,
                    max_work,
                    after,
                    link_work: 0,
                    prev: None,
                    next: None,
                    phase: Phase::Parsed,
                    flags: WorkerFlags {
                        used: true,
                        ..Default::default()
                    },
                    stats: Default::default(),
                    exit_flag: Arc::new(AtomicBool::new(false)),
                },
                kind,
            });
        }
        {
            let mut stats = self.registry.stats.lock();
            stats.labels.insert(label.clone());
            stats.workers_spawned += 1;
        }

        let must_wait = match self.after.register(&self.registry, wref, &label, &after_labels) {
            Ok(must_wait) => must_wait,
            Err(e) => {
                let mut slot = table.slots[idx as usize].lock();
                *slot = None;
                drop(slot);
                let mut cm = table.class_lock.lock();
                cm.used_count = cm.used_count.saturating_sub(1);
                drop(cm);
                let mut stats = self.registry.stats.lock();
                stats.labels.remove(&label);
                stats.workers_spawned = stats.workers_spawned.saturating_sub(1);
                return Err(e);
            }
        };
        if must_wait {
            let mut slot = table.slots[idx as usize].lock();
            if let Some(w) = slot.as_mut() {
                w.shared.flags.waiting = true;
                let _ = w.shared.transition(Phase::Waiting);
            }
            return Ok(());
        }

        {
            let mut slot = table.slots[idx as usize].lock();
            if let Some(w) = slot.as_mut() {
                let _ = w.shared.transition(Phase::Pending);
                w.shared.flags.pending = true;
            }
        }
        self.registry.stats.lock().workers_pending += 1;
        if start_now {
            self.spawn_worker(wref)?;
        }
        Ok(())
    }

    fn start_queued(&self, class: Class, label: Option<String>) -> Result<()> {
        let label = label.ok_or_else(|| EngineError::Usage("start: missing label".to_string()))?;
        let wref = self
            .registry
            .find_by_label(&label)
            .filter(|(c, _)| *c == class)
            .ok_or_else(|| EngineError::NotFound(label.clone()))?;
        self.spawn_worker(wref)
    }

    /// Spawns the OS thread for a `Pending` worker. Every kind except a TCP
    /// net worker opens its kernel here, before the thread exists, so a
    /// validation/open failure never leaves a half-started thread behind. A
    /// TCP net worker only binds here (fast, synchronous); the blocking
    /// accept for its peer happens inside the spawned thread instead, so a
    /// worker with no connecting peer yet cannot stall the caller (usually
    /// the master thread processing the command queue).
    pub fn spawn_worker(&self, wref: WorkerRef) -> Result<()> {
        let (class, idx) = wref;
        let table = self.registry.table(class);
        let (kind, exit_flag) = {
            let slot = table.slots[idx as usize].lock();
            let w = slot
                .as_ref()
                .ok_or_else(|| EngineError::NotFound(format!("{:?}", wref)))?;
            (w.kind.clone(), w.shared.exit_flag.clone())
        };

        let ctx = self.ctx();
        let second_count = self.calibration.second_count.max(1);

        if let WorkerKind::Net(o) = &kind {
            if o.proto == Proto::Tcp {
                let listener = NetKernel::bind_tcp(o.addr, o.port)?;
                let o = o.clone();
                let handle: JoinHandle<()> = std::thread::Builder::new()
                    .name(format!("{}-{}", class.short_name(), idx))
                    .spawn(move || {
                        match NetKernel::from_listener(&listener, o.mode, o.pktsize, &exit_flag) {
                            Ok(kernel) => run_worker(ctx, wref, second_count, Box::new(kernel)),
                            Err(e) => {
                                tracing::warn!(?wref, error = %e, "net worker failed to accept a peer");
                                abandon_unopened_worker(&ctx, wref);
                            }
                        }
                    })
                    .map_err(|e| EngineError::Lock(e.to_string()))?;
                self.reaper.register_handle(wref, handle);
                return Ok(());
            }
        }

        let kernel: Box<dyn Kernel> = match kind {
            WorkerKind::Cpu(_) => Box::new(CpuKernel::new()),
            WorkerKind::Mem(o) => Box::new(MemKernel::new(o.working_ram, o.blksize, o.stride, wid_seed(wref))),
            WorkerKind::Disk(o) => Box::new(DiskKernel::open(
                &o.path,
                o.mode,
                o.blksize,
                o.nblks,
                o.mix,
                o.sync_every,
                wid_seed(wref),
            )?),
            WorkerKind::Net(o) => Box::new(NetKernel::open(
                o.proto,
                o.addr,
                o.port,
                o.mode,
                o.pktsize,
                &exit_flag,
            )?),
        };

        let handle: JoinHandle<()> = std::thread::Builder::new()
            .name(format!("{}-{}", class.short_name(), idx))
            .spawn(move || run_worker(ctx, wref, second_count, kernel))
            .map_err(|e| EngineError::Lock(e.to_string()))?;
        self.reaper.register_handle(wref, handle);
        Ok(())
    }

    fn mod_worker(&self, class: Class, attrs: Attrs) -> Result<()> {
        let label = attrs.require("label")?.to_string();
        let wref = self
            .registry
            .find_by_label(&label)
            .filter(|(c, _)| *c == class)
            .ok_or_else(|| EngineError::NotFound(label))?;
        let table = self.registry.table(class);
        let mut slot = table.slots[wref.1 as usize].lock();
        let Some(w) = slot.as_mut() else {
            return Err(EngineError::NotFound(format!("{:?}", wref)));
        };
        // Validate a staged copy before committing, for every class, so a
        // bad mod never lands on the live worker.
        let mut staged = w.kind.clone();
        apply_mod_attrs(&mut staged, &attrs)?;
        w.kind = staged;
        if let Some(v) = attrs.get_u64("etime")? {
            w.shared.exec_time = if v == 0 { None } else { Some(Duration::from_secs(v)) };
        }
        if let Some(v) = attrs.get_size("work")? {
            w.shared.max_work = if v == 0 { None } else { Some(v) };
        }
        w.shared.flags.dirty = true;
        Ok(())
    }

    fn del_worker(&self, class: Class, attrs: Attrs) -> Result<()> {
        let label = attrs.require("label")?.to_string();
        let wref = self
            .registry
            .find_by_label(&label)
            .filter(|(c, _)| *c == class)
            .ok_or_else(|| EngineError::NotFound(label))?;
        let table = self.registry.table(class);
        let mut slot = table.slots[wref.1 as usize].lock();
        if let Some(w) = slot.as_mut() {
            w.shared.flags.exiting = true;
            w.shared.exit_flag.store(true, Ordering::Relaxed);
        }
        table.slots[wref.1 as usize].notify_all();
        Ok(())
    }

    // ---- link ----------------------------------------------------------

    fn dispatch_link(
        &self,
        op: LinkOp,
        label: &str,
        members: Vec<crate::command::LinkMember>,
    ) -> Result<()> {
        match op {
            LinkOp::Queue => {
                let mut resolved = Vec::with_capacity(members.len());
                for m in members {
                    let wref = self
                        .registry
                        .find_by_label(&m.label)
                        .ok_or_else(|| EngineError::NotFound(m.label.clone()))?;
                    resolved.push((wref, m.quantum));
                }
                let id = self.link.insert(&self.registry, &resolved)?;
                self.link_labels
                    .lock()
                    .unwrap()
                    .by_label
                    .insert(label.to_string(), id);
                Ok(())
            }
            LinkOp::Start => {
                let id = self.link_id(label)?;
                let order = self.link.start(&self.registry, id)?;
                for wref in order {
                    self.spawn_worker(wref)?;
                }
                Ok(())
            }
            LinkOp::Del => {
                let id = self.link_id(label)?;
                self.link.kill(&self.registry, id)?;
                self.link_labels.lock().unwrap().by_label.remove(label);
                Ok(())
            }
        }
    }

    fn link_id(&self, label: &str) -> Result<u8> {
        self.link_labels
            .lock()
            .unwrap()
            .by_label
            .get(label)
            .copied()
            .ok_or_else(|| EngineError::NotFound(format!("link {label}")))
    }

    // ---- info / wait -----------------------------------------------------

    fn render_info(&self, class: Option<Class>, worker: Option<&str>, detail: bool) -> String {
        let mut out = String::new();
        let stats = self.registry.stats.lock();
        let _ = writeln!(
            out,
            "pending={} running={} reaped={} spawned={} leading={}",
            stats.workers_pending, stats.workers_running, stats.workers_reaped,
            stats.workers_spawned, stats.workers_leading
        );
        drop(stats);
        let classes: Vec<Class> = class.map(|c| vec![c]).unwrap_or_else(|| Class::ALL.to_vec());
        for c in classes {
            let table = self.registry.table(c);
            for (i, slot) in table.slots.iter().enumerate() {
                let guard = slot.lock();
                let Some(w) = guard.as_ref() else { continue };
                if let Some(want) = worker {
                    if w.shared.label != want {
                        continue;
                    }
                }
                let _ = write!(out, "{} idx={} phase={:?}", w.shared.label, i, w.shared.phase);
                if detail {
                    let _ = write!(
                        out,
                        " missed={} total={}",
                        w.shared.stats.missed_deadlines, w.shared.stats.total_deadlines
                    );
                }
                let _ = writeln!(out);
            }
        }
        out
    }

    /// Tags every matching worker `mwait`, then blocks until they have all
    /// exited or `time` seconds elapse. Returns how many tagged workers were
    /// still outstanding when it returned: 0 if every one of them exited,
    /// otherwise the count still running when the deadline fired.
    fn wait(&self, class: Option<Class>, time: Option<f64>) -> usize {
        let classes: Vec<Class> = class.map(|c| vec![c]).unwrap_or_else(|| Class::ALL.to_vec());
        let deadline = time.map(|s| std::time::Instant::now() + Duration::from_secs_f64(s));
        for c in &classes {
            let table = self.registry.table(*c);
            for slot in table.slots.iter() {
                let mut g = slot.lock();
                if let Some(w) = g.as_mut() {
                    w.shared.flags.mwait = true;
                }
            }
        }
        loop {
            let mut outstanding = 0usize;
            for c in &classes {
                let table = self.registry.table(*c);
                for slot in table.slots.iter() {
                    let g = slot.lock();
                    if let Some(w) = g.as_ref() {
                        if w.shared.flags.mwait && w.shared.flags.used {
                            outstanding += 1;
                        }
                    }
                }
            }
            if outstanding == 0 {
                return 0;
            }
            if let Some(d) = deadline {
                if std::time::Instant::now() >= d {
                    return outstanding;
                }
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

fn wid_seed(wref: WorkerRef) -> u64 {
    let (class, idx) = wref;
    (class.ordinal() as u64) << 8 | idx as u64
}

fn running_as_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

fn parse_iomix(raw: &str) -> Result<(u32, u32, u32)> {
    let parts: Vec<&str> = raw.split('/').collect();
    if parts.len() != 3 {
        return Err(EngineError::Usage(format!(
            "iomix must be R/W/S, got {raw:?}"
        )));
    }
    let parse = |s: &str| {
        s.parse::<u32>()
            .map_err(|_| EngineError::Usage(format!("invalid iomix component {s:?}")))
    };
    Ok((parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
}

/// Applies `mod`-able attributes to a staged copy of a worker's
/// class-specific options. Only fields that make sense to change live are
/// touched; the rest of the original record is preserved.
fn apply_mod_attrs(kind: &mut WorkerKind, attrs: &Attrs) -> Result<()> {
    match kind {
        WorkerKind::Cpu(o) => {
            if let Some(load) = attrs.get("load") {
                let v: u8 = load
                    .parse()
                    .map_err(|_| EngineError::Usage("cpu: load is not an integer".to_string()))?;
                if !(1..=100).contains(&v) {
                    return Err(EngineError::Validation("cpu: load must be 1..=100".to_string()));
                }
                o.percent_cpu = v;
            }
        }
        WorkerKind::Mem(o) => {
            if let Some(iorate) = attrs.get_size("iorate")? {
                o.iorate = iorate;
            }
            if let Some(stride) = attrs.get_u64("stride")? {
                o.stride = stride.max(1);
            }
        }
        WorkerKind::Disk(o) => {
            if let Some(iorate) = attrs.get_size("iorate")? {
                o.iorate = iorate;
            }
            if let Some(raw) = attrs.get("iomix") {
                o.mix = parse_iomix(raw)?;
            }
        }
        WorkerKind::Net(o) => {
            if let Some(iorate) = attrs.get_size("iorate")? {
                o.iorate = iorate;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_cpu_worker_without_afters_goes_straight_to_pending() {
        let engine = Engine::new(Calibration {
            second_count: 1_000_000,
            prng_count: 1_000_000,
        });
        let cmd = Command::parse("wctl queue cpu load=10,label=c1").unwrap();
        engine.dispatch(cmd).unwrap();
        let wref = engine.registry.find_by_label("c1").unwrap();
        let table = engine.registry.table(wref.0);
        let phase = table.slots[wref.1 as usize].lock().as_ref().unwrap().shared.phase;
        assert_eq!(phase, Phase::Pending);
    }

    #[test]
    fn duplicate_label_is_rejected() {
        let engine = Engine::new(Calibration {
            second_count: 1,
            prng_count: 1,
        });
        engine
            .dispatch(Command::parse("wctl queue cpu load=10,label=c1").unwrap())
            .unwrap();
        let err = engine.dispatch(Command::parse("wctl queue cpu load=10,label=c1").unwrap());
        assert!(err.is_err());
    }

    #[test]
    fn info_renders_a_summary_line() {
        let engine = Engine::new(Calibration {
            second_count: 1,
            prng_count: 1,
        });
        engine
            .dispatch(Command::parse("wctl queue cpu load=10,label=c1").unwrap())
            .unwrap();
        let out = engine.dispatch(Command::parse("info").unwrap()).unwrap();
        assert!(out.contains("c1"));
    }

    #[test]
    fn helo_replies_ok() {
        let engine = Engine::new(Calibration::default());
        assert_eq!(engine.dispatch(Command::Helo).unwrap(), "ok");
    }
}
