// Process Management
//
// Implements the process control block (PCB) and the process table that
// owns every PCB in the system. The table is an arena indexed by PID, so
// parent/child links are plain integer references rather than pointers.
//
// Key responsibilities:
// - Define process identity, lifecycle states and priority classes
// - Build processes: address space, stack and heap regions, initial context
// - Retire processes in two steps: terminate (zombie) and destroy (free)
// - Keep the family tree consistent when processes die
//
// Process model:
// - PID 0 is the kernel/idle PCB; it is created with the table and can be
//   neither terminated nor destroyed
// - PIDs live in [1, max_processes) and are probed from a rotating cursor,
//   so a PID is reused only once its previous holder was destroyed
// - Lifecycle: Created -> Ready -> Running -> {Blocked, Sleeping} -> ...
//   -> Zombie -> destroyed (Terminated is the state of a PCB being torn down)
//
// Resource ownership:
// - Each process owns one address space and two VMM regions (stack, heap)
// - `create` unwinds every partial allocation on failure; callers never see
//   a half-built PCB
// - Only `destroy` releases those resources, and only for a zombie
//
// Scheduling data:
// - `SchedStats` carries the accounting every strategy reads: runtime in
//   ticks, weighted virtual runtime, wait bookkeeping, optional deadline
//   and the nice weight derived from the priority
//
// Correctness notes:
// - PCBs are boxed so their `CpuContext` keeps a stable address while the
//   table grows or shrinks around it; context switches rely on this

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::config::{KernelConfig, PROCESS_NAME_MAX};
use crate::context::CpuContext;
use crate::error::{KernelError, KernelResult};
use crate::ipc::Message;
use crate::mm::addrspace::AddressSpace;
use crate::mm::paging::PageFlags;
use crate::mm::MemoryManager;
use crate::{log_debug, log_info, log_warn};

const LOG_ORIGIN: &str = "process";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32);

impl Pid {
    pub const IDLE: Pid = Pid(0);

    pub const fn from_raw(value: u32) -> Self {
        Pid(value)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub const fn is_idle(&self) -> bool {
        self.0 == 0
    }

    const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Ready,
    Running,
    Blocked,
    Sleeping,
    Zombie,
    Terminated,
}

impl ProcessState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Created => "CREATED",
            ProcessState::Ready => "READY",
            ProcessState::Running => "RUNNING",
            ProcessState::Blocked => "BLOCKED",
            ProcessState::Sleeping => "SLEEPING",
            ProcessState::Zombie => "ZOMBIE",
            ProcessState::Terminated => "TERMINATED",
        }
    }

    pub const fn is_alive(&self) -> bool {
        !matches!(self, ProcessState::Zombie | ProcessState::Terminated)
    }
}

pub const PRIORITY_CLASSES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    Idle = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Realtime = 4,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl TryFrom<u8> for Priority {
    type Error = KernelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::Idle),
            1 => Ok(Priority::Low),
            2 => Ok(Priority::Normal),
            3 => Ok(Priority::High),
            4 => Ok(Priority::Realtime),
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

/// Nice value -20..=19 to load weight, index `nice + 20`.
pub const NICE_TO_WEIGHT: [u64; 40] = [
    88761, 71755, 56483, 46273, 36291, 29154, 23254, 18705, 14949, 11916, 9548, 7620, 6100, 4904,
    3906, 3121, 2501, 1991, 1586, 1277, 1024, 820, 655, 526, 423, 335, 272, 215, 172, 137, 110, 87,
    70, 56, 45, 36, 29, 23, 18, 15,
];

pub const NICE_0_WEIGHT: u64 = 1024;

impl Priority {
    pub const fn class(&self) -> usize {
        *self as usize
    }

    pub const fn nice(&self) -> i8 {
        match self {
            Priority::Realtime => -20,
            Priority::High => -10,
            Priority::Normal => 0,
            Priority::Low => 10,
            Priority::Idle => 19,
        }
    }

    pub const fn weight(&self) -> u64 {
        NICE_TO_WEIGHT[(self.nice() as i32 + 20) as usize]
    }

    /// Per-class multiplier of the adaptive score.
    pub const fn class_weight(&self) -> u64 {
        match self {
            Priority::Realtime => 88761,
            Priority::High => 29154,
            Priority::Normal => 1024,
            Priority::Low => 335,
            Priority::Idle => 15,
        }
    }

    pub const fn is_realtime_class(&self) -> bool {
        matches!(self, Priority::Realtime | Priority::High)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Priority::Idle => "IDLE",
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Realtime => "REALTIME",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedStats {
    /// Ticks spent running.
    pub runtime: u64,
    /// Weighted runtime in nanoseconds.
    pub vruntime: u64,
    /// Scheduler clock at the last dispatch.
    pub last_run: u64,
    /// Scheduler clock at the last enqueue.
    pub ready_since: u64,
    pub total_wait: u64,
    /// Absolute deadline on the scheduler clock; 0 means none.
    pub deadline: u64,
    pub nice: i8,
    pub weight: u64,
    pub context_switches: u64,
    pub preemptions: u64,
    pub wakeups: u64,
}

impl SchedStats {
    fn for_priority(priority: Priority) -> Self {
        Self {
            nice: priority.nice(),
            weight: priority.weight(),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct Process {
    pub pid: Pid,
    pub ppid: Pid,
    pub name: String,
    pub state: ProcessState,
    pub priority: Priority,
    pub context: CpuContext,
    pub address_space: Option<AddressSpace>,
    pub stack_base: usize,
    pub stack_size: usize,
    pub heap_base: usize,
    pub heap_size: usize,
    pub time_slice: u64,
    pub sched: SchedStats,
    pub mailbox: VecDeque<Message>,
    pub children: Vec<Pid>,
    pub cpu: Option<usize>,
    pub sleep_until: u64,
    pub creation_tick: u64,
    pub exit_code: i32,
}

impl Process {
    fn idle(time_slice: u64) -> Self {
        Self {
            pid: Pid::IDLE,
            ppid: Pid::IDLE,
            name: String::from("idle"),
            state: ProcessState::Running,
            priority: Priority::Idle,
            context: CpuContext::zero(),
            address_space: None,
            stack_base: 0,
            stack_size: 0,
            heap_base: 0,
            heap_size: 0,
            time_slice,
            sched: SchedStats::for_priority(Priority::Idle),
            mailbox: VecDeque::new(),
            children: Vec::new(),
            cpu: None,
            sleep_until: 0,
            creation_tick: 0,
            exit_code: 0,
        }
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
        self.sched.nice = priority.nice();
        self.sched.weight = priority.weight();
    }

    pub fn stack_top(&self) -> usize {
        self.stack_base + self.stack_size
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            ppid: self.ppid,
            name: self.name.clone(),
            state: self.state,
            priority: self.priority,
            cpu: self.cpu,
            root: self.address_space.as_ref().map_or(0, AddressSpace::root),
            stack_base: self.stack_base,
            heap_base: self.heap_base,
            sched: self.sched,
            mailbox_len: self.mailbox.len(),
            children: self.children.len(),
            exit_code: self.exit_code,
        }
    }
}

/// Point-in-time copy of a PCB for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub ppid: Pid,
    pub name: String,
    pub state: ProcessState,
    pub priority: Priority,
    pub cpu: Option<usize>,
    pub root: usize,
    pub stack_base: usize,
    pub heap_base: usize,
    pub sched: SchedStats,
    pub mailbox_len: usize,
    pub children: usize,
    pub exit_code: i32,
}

pub struct ProcessTable {
    slots: Vec<Option<Box<Process>>>,
    next_pid: usize,
    active: usize,
    total_created: u64,
    stack_size: usize,
    heap_size: usize,
    time_slice: u64,
}

impl ProcessTable {
    pub fn new(config: &KernelConfig) -> Self {
        let mut slots = Vec::with_capacity(config.max_processes);
        slots.resize_with(config.max_processes, || None);
        slots[0] = Some(Box::new(Process::idle(config.time_slice)));

        Self {
            slots,
            next_pid: 1,
            active: 0,
            total_created: 0,
            stack_size: config.stack_size,
            heap_size: config.heap_size,
            time_slice: config.time_slice,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Live user processes (zombies included, the idle PCB excluded).
    pub fn active(&self) -> usize {
        self.active
    }

    pub fn total_created(&self) -> u64 {
        self.total_created
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.slots.get(pid.index())?.as_deref()
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.slots.get_mut(pid.index())?.as_deref_mut()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.get(pid).is_some()
    }

    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.slots
            .iter()
            .flatten()
            .map(|p| p.pid)
            .filter(|pid| !pid.is_idle())
    }

    fn probe_pid(&mut self) -> KernelResult<Pid> {
        let capacity = self.slots.len();
        for _ in 0..capacity {
            let candidate = self.next_pid;
            self.next_pid += 1;
            if self.next_pid >= capacity {
                self.next_pid = 1;
            }
            if candidate != 0 && self.slots[candidate].is_none() {
                return Ok(Pid(candidate as u32));
            }
        }
        Err(KernelError::ResourceExhausted)
    }

    /// Builds a new READY process. Nothing is allocated unless every
    /// argument is valid, and a failure part-way releases what was taken.
    pub fn create(
        &mut self,
        mm: &mut MemoryManager,
        name: &str,
        entry: u64,
        priority: u8,
        parent: Pid,
        now: u64,
    ) -> KernelResult<Pid> {
        if entry == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let priority = Priority::try_from(priority)?;
        let pid = self.probe_pid()?;

        let space = mm.create_address_space()?;

        let stack_base = match mm.vmm_alloc(self.stack_size, PageFlags::kernel_rw_nx()) {
            Ok(base) => base,
            Err(err) => {
                let _ = mm.destroy_address_space(space);
                return Err(err);
            }
        };

        let heap_base = match mm.vmm_alloc(self.heap_size, PageFlags::kernel_rw_nx()) {
            Ok(base) => base,
            Err(err) => {
                let _ = mm.vmm_free(stack_base);
                let _ = mm.destroy_address_space(space);
                return Err(err);
            }
        };

        let parent = if self.get(parent).is_some_and(|p| p.state.is_alive()) {
            parent
        } else {
            Pid::IDLE
        };

        let stack_top = stack_base + self.stack_size;
        let context = CpuContext::new(entry, (stack_top - 16) as u64, space.root() as u64);
        let mut truncated = String::new();
        truncated.extend(name.chars().take(PROCESS_NAME_MAX));

        let process = Process {
            pid,
            ppid: parent,
            name: truncated,
            state: ProcessState::Ready,
            priority,
            context,
            address_space: Some(space),
            stack_base,
            stack_size: self.stack_size,
            heap_base,
            heap_size: self.heap_size,
            time_slice: self.time_slice,
            sched: SchedStats::for_priority(priority),
            mailbox: VecDeque::new(),
            children: Vec::new(),
            cpu: None,
            sleep_until: 0,
            creation_tick: now,
            exit_code: 0,
        };

        self.slots[pid.index()] = Some(Box::new(process));
        if let Some(p) = self.get_mut(parent) {
            p.children.push(pid);
        }
        self.active += 1;
        self.total_created += 1;

        log_info!(
            LOG_ORIGIN,
            "Created process {} '{}' (priority={}, entry={:#x}, parent={})",
            pid,
            name,
            priority.as_str(),
            entry,
            parent
        );
        Ok(pid)
    }

    /// Turns `pid` into a zombie. Returns the parent if it is blocked and
    /// should be woken; nothing is freed here.
    pub fn terminate(&mut self, pid: Pid, exit_code: i32) -> KernelResult<Option<Pid>> {
        if pid.is_idle() {
            return Err(KernelError::InvalidArgument);
        }
        let process = self.get_mut(pid).ok_or(KernelError::NoSuchProcess)?;
        if !process.state.is_alive() {
            return Err(KernelError::NoSuchProcess);
        }

        process.state = ProcessState::Zombie;
        process.exit_code = exit_code;
        let parent = process.ppid;
        log_debug!(LOG_ORIGIN, "Process {} exited with code {}", pid, exit_code);

        let wake = self
            .get(parent)
            .filter(|p| !p.pid.is_idle() && p.state == ProcessState::Blocked)
            .map(|p| p.pid);
        Ok(wake)
    }

    /// Frees everything a zombie still owns and removes its PCB. The caller
    /// guarantees the process is in no scheduler queue.
    pub fn destroy(&mut self, mm: &mut MemoryManager, pid: Pid) -> KernelResult<()> {
        if pid.is_idle() {
            return Err(KernelError::InvalidArgument);
        }
        match self.get(pid) {
            None => return Err(KernelError::NoSuchProcess),
            Some(p) if p.state != ProcessState::Zombie => {
                return Err(KernelError::InvalidArgument)
            }
            Some(_) => {}
        }

        let Some(mut process) = self.slots[pid.index()].take() else {
            return Err(KernelError::NoSuchProcess);
        };
        process.state = ProcessState::Terminated;

        if let Err(err) = mm.vmm_free(process.stack_base) {
            log_warn!(LOG_ORIGIN, "Process {} stack release failed: {}", pid, err);
        }
        if let Err(err) = mm.vmm_free(process.heap_base) {
            log_warn!(LOG_ORIGIN, "Process {} heap release failed: {}", pid, err);
        }
        if let Some(space) = process.address_space.take() {
            if let Err(err) = mm.destroy_address_space(space) {
                log_warn!(LOG_ORIGIN, "Process {} address space release failed: {}", pid, err);
            }
        }

        if let Some(parent) = self.get_mut(process.ppid) {
            parent.children.retain(|&c| c != pid);
        }
        for &child in &process.children {
            if let Some(c) = self.get_mut(child) {
                c.ppid = Pid::IDLE;
            }
        }
        if let Some(idle) = self.get_mut(Pid::IDLE) {
            idle.children.extend(process.children.iter().copied());
        }

        self.active -= 1;
        log_debug!(LOG_ORIGIN, "Destroyed process {} '{}'", pid, process.name);
        Ok(())
    }

    pub fn zombies(&self) -> Vec<Pid> {
        self.slots
            .iter()
            .flatten()
            .filter(|p| p.state == ProcessState::Zombie)
            .map(|p| p.pid)
            .collect()
    }

    pub fn count_in_state(&self, state: ProcessState) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|p| !p.pid.is_idle() && p.state == state)
            .count()
    }
}
