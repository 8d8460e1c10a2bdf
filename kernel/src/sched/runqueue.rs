// Per-CPU Run Queue
//
// One run queue per CPU holds that CPU's ready processes, its sleepers and
// the identity of whatever it is running. All accounting that happens on
// a timer tick (runtime, virtual runtime, slice usage, wakeups) lives here.
//
// Layout:
// - Five FIFO lists, one per priority class, of (sequence, pid) entries
// - The sequence number is a per-queue counter stamped at enqueue time; it
//   gives every strategy the same FIFO tie-breaker
// - A sleeper list checked on each tick
// - `current` is Pid::IDLE whenever the CPU runs its idle context
//
// Context storage:
// - `idle_context` holds the registers of the CPU's own idle/boot flow
// - `discard_context` receives the registers of a process that is switched
//   away from as a zombie; its PCB may be freed before the switch lands
//
// Correctness notes:
// - The run queue never holds the process table lock; callers pass the
//   table in, already locked, in the order process table -> run queue
// - A pid is never queued twice; `push` ignores a pid already present
// - Entries without a PCB are purged by `pick_next`

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::context::CpuContext;
use crate::process::{Pid, Priority, ProcessState, ProcessTable, NICE_0_WEIGHT, PRIORITY_CLASSES};

use super::policy::{self, Candidate, SchedAlgorithm};
use super::ContextSwitch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    seq: u64,
    pid: Pid,
}

pub struct RunQueue {
    cpu: usize,
    classes: [VecDeque<Entry>; PRIORITY_CLASSES],
    sleeping: Vec<Pid>,
    current: Pid,
    idle_context: CpuContext,
    discard_context: CpuContext,
    pub(super) algorithm: SchedAlgorithm,
    clock: u64,
    slice_used: u64,
    next_seq: u64,
    switches: u64,
    idle_ticks: u64,
}

impl RunQueue {
    pub fn new(cpu: usize, algorithm: SchedAlgorithm) -> Self {
        Self {
            cpu,
            classes: [(); PRIORITY_CLASSES].map(|_| VecDeque::new()),
            sleeping: Vec::new(),
            current: Pid::IDLE,
            idle_context: CpuContext::zero(),
            discard_context: CpuContext::zero(),
            algorithm,
            clock: 0,
            slice_used: 0,
            next_seq: 0,
            switches: 0,
            idle_ticks: 0,
        }
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub fn current(&self) -> Pid {
        self.current
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn switches(&self) -> u64 {
        self.switches
    }

    pub fn idle_ticks(&self) -> u64 {
        self.idle_ticks
    }

    pub fn ready_count(&self) -> usize {
        self.classes.iter().map(VecDeque::len).sum()
    }

    pub fn sleeping_count(&self) -> usize {
        self.sleeping.len()
    }

    /// Ready processes plus the running one, used for placement.
    pub fn load(&self) -> usize {
        self.ready_count() + usize::from(!self.current.is_idle())
    }

    pub fn is_queued(&self, pid: Pid) -> bool {
        self.classes.iter().flatten().any(|e| e.pid == pid)
    }

    /// True if the pid is ready, sleeping or running here.
    pub fn holds(&self, pid: Pid) -> bool {
        self.current == pid || self.is_queued(pid) || self.sleeping.contains(&pid)
    }

    pub fn push(&mut self, pid: Pid, priority: Priority) {
        if self.is_queued(pid) {
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.classes[priority.class()].push_back(Entry { seq, pid });
    }

    /// Drops `pid` from the ready lists and the sleeper list.
    pub fn remove(&mut self, pid: Pid) -> bool {
        let mut found = false;
        for class in self.classes.iter_mut() {
            let before = class.len();
            class.retain(|e| e.pid != pid);
            found |= class.len() != before;
        }
        let before = self.sleeping.len();
        self.sleeping.retain(|&p| p != pid);
        found | (self.sleeping.len() != before)
    }

    pub fn add_sleeper(&mut self, pid: Pid) {
        if !self.sleeping.contains(&pid) {
            self.sleeping.push(pid);
        }
    }

    /// Removes and returns the next process under the active strategy.
    /// Entries whose PCB no longer exists are dropped on the way.
    pub fn pick_next(&mut self, table: &ProcessTable) -> Option<Pid> {
        for class in self.classes.iter_mut() {
            class.retain(|e| table.contains(e.pid));
        }

        let candidates = self.classes.iter().flatten().filter_map(|entry| {
            let p = table.get(entry.pid)?;
            Some(Candidate {
                pid: entry.pid,
                priority: p.priority,
                seq: entry.seq,
                runtime: p.sched.runtime,
                vruntime: p.sched.vruntime,
                last_run: p.sched.last_run,
                deadline: p.sched.deadline,
            })
        });
        let chosen = policy::select(self.algorithm, candidates, self.clock)?;

        for class in self.classes.iter_mut() {
            if let Some(pos) = class.iter().position(|e| e.seq == chosen.seq) {
                class.remove(pos);
                break;
            }
        }
        Some(chosen.pid)
    }

    /// Puts the running process back on the ready lists.
    fn requeue_current(&mut self, table: &mut ProcessTable) {
        let current = self.current;
        if current.is_idle() {
            return;
        }
        let clock = self.clock;
        if let Some(p) = table.get_mut(current) {
            if p.state == ProcessState::Running {
                p.state = ProcessState::Ready;
                p.sched.ready_since = clock;
                let priority = p.priority;
                self.push(current, priority);
            }
        }
    }

    /// Picks a successor for the current process and switches to it, or to
    /// the idle context when nothing is ready. The current process must
    /// already be requeued or parked by the caller.
    pub fn schedule(&mut self, table: &mut ProcessTable) -> Option<ContextSwitch> {
        let next = self.pick_next(table).unwrap_or(Pid::IDLE);
        self.switch_to(table, next)
    }

    fn switch_to(&mut self, table: &mut ProcessTable, next: Pid) -> Option<ContextSwitch> {
        let prev = self.current;
        let clock = self.clock;
        self.slice_used = 0;

        if prev == next {
            if let Some(p) = table.get_mut(next).filter(|_| !next.is_idle()) {
                p.state = ProcessState::Running;
                p.sched.last_run = clock;
            }
            return None;
        }

        let from_ctx: *mut CpuContext = if prev.is_idle() {
            &mut self.idle_context as *mut CpuContext
        } else {
            match table.get_mut(prev) {
                Some(p) if p.state.is_alive() => {
                    p.sched.context_switches += 1;
                    &mut p.context as *mut CpuContext
                }
                _ => &mut self.discard_context as *mut CpuContext,
            }
        };

        let to_ctx: *const CpuContext = if next.is_idle() {
            &self.idle_context as *const CpuContext
        } else {
            match table.get_mut(next) {
                Some(p) => {
                    p.state = ProcessState::Running;
                    p.cpu = Some(self.cpu);
                    p.sched.context_switches += 1;
                    p.sched.total_wait += clock.saturating_sub(p.sched.ready_since);
                    p.sched.last_run = clock;
                    &p.context as *const CpuContext
                }
                None => &self.idle_context as *const CpuContext,
            }
        };

        if let Some(idle) = table.get_mut(Pid::IDLE) {
            if prev.is_idle() || next.is_idle() {
                idle.sched.context_switches += 1;
            }
        }

        self.current = next;
        self.switches += 1;
        Some(ContextSwitch {
            cpu: self.cpu,
            from: prev,
            to: next,
            from_ctx,
            to_ctx,
        })
    }

    pub fn yield_current(&mut self, table: &mut ProcessTable) -> Option<ContextSwitch> {
        self.requeue_current(table);
        self.schedule(table)
    }

    /// Consumes one tick of the current slice and rotates when it runs out.
    /// An idle CPU picks up work as soon as any is ready, and a current
    /// process that stopped running (terminated from elsewhere) is replaced.
    pub fn preempt(&mut self, table: &mut ProcessTable) -> Option<ContextSwitch> {
        let current = self.current;
        if current.is_idle() {
            if self.ready_count() == 0 {
                return None;
            }
            return self.schedule(table);
        }

        let Some(p) = table.get_mut(current) else {
            return self.schedule(table);
        };
        if p.state != ProcessState::Running {
            return self.schedule(table);
        }

        self.slice_used += 1;
        if self.slice_used < p.time_slice {
            return None;
        }
        p.sched.preemptions += 1;
        self.yield_current(table)
    }

    /// Advances the clock by one tick of `tick_ns` nanoseconds: charges the
    /// running process, wakes every sleeper whose deadline has passed, then
    /// preempts.
    pub fn tick(&mut self, table: &mut ProcessTable, tick_ns: u64) -> Option<ContextSwitch> {
        self.clock += 1;
        let clock = self.clock;

        let current = self.current;
        if current.is_idle() {
            self.idle_ticks += 1;
        } else if let Some(p) = table.get_mut(current) {
            if p.state == ProcessState::Running {
                p.sched.runtime += 1;
                let weight = p.sched.weight.max(1);
                p.sched.vruntime += tick_ns * NICE_0_WEIGHT / weight;
            }
        }

        let mut i = 0;
        while i < self.sleeping.len() {
            let pid = self.sleeping[i];
            match table.get_mut(pid) {
                Some(p) if p.state == ProcessState::Sleeping => {
                    if p.sleep_until <= clock {
                        self.sleeping.swap_remove(i);
                        p.state = ProcessState::Ready;
                        p.sched.ready_since = clock;
                        p.sched.wakeups += 1;
                        let priority = p.priority;
                        self.push(pid, priority);
                        continue;
                    }
                }
                // Woken or retired by someone else.
                _ => {
                    self.sleeping.swap_remove(i);
                    continue;
                }
            }
            i += 1;
        }

        self.preempt(table)
    }

    pub fn sleep_current(&mut self, table: &mut ProcessTable, ticks: u64) -> Option<ContextSwitch> {
        let current = self.current;
        let clock = self.clock;
        if current.is_idle() {
            return None;
        }
        let p = table.get_mut(current)?;
        p.state = ProcessState::Sleeping;
        p.sleep_until = clock + ticks;
        self.add_sleeper(current);
        self.schedule(table)
    }

    pub fn block_current(&mut self, table: &mut ProcessTable) -> Option<ContextSwitch> {
        let current = self.current;
        if current.is_idle() {
            return None;
        }
        let p = table.get_mut(current)?;
        p.state = ProcessState::Blocked;
        self.schedule(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::mm::testing::{memory_manager, SimulatedRam};
    use crate::mm::MemoryManager;

    const ENTRY: u64 = 0x40_0000;

    struct Fixture {
        _ram: SimulatedRam,
        mm: MemoryManager,
        table: ProcessTable,
        rq: RunQueue,
    }

    impl Fixture {
        fn new() -> Self {
            let config = KernelConfig::default();
            let ram = SimulatedRam::with_frames(1024);
            let mm = memory_manager(&ram, &config);
            Self {
                _ram: ram,
                mm,
                table: ProcessTable::new(&config),
                rq: RunQueue::new(0, SchedAlgorithm::RoundRobin),
            }
        }

        fn spawn(&mut self) -> Pid {
            let pid = self
                .table
                .create(&mut self.mm, "rq", ENTRY, Priority::Normal as u8, Pid::IDLE, 0)
                .unwrap();
            self.rq.push(pid, Priority::Normal);
            pid
        }

        fn switches(&self, pid: Pid) -> u64 {
            self.table.get(pid).unwrap().sched.context_switches
        }
    }

    #[test]
    fn switch_counts_both_sides() {
        let mut f = Fixture::new();
        let a = f.spawn();
        let b = f.spawn();

        let sw = f.rq.yield_current(&mut f.table).unwrap();
        assert_eq!((sw.from, sw.to), (Pid::IDLE, a));
        let idle_before = f.switches(Pid::IDLE);
        let (a_before, b_before) = (f.switches(a), f.switches(b));

        let sw = f.rq.yield_current(&mut f.table).unwrap();
        assert_eq!((sw.from, sw.to), (a, b));
        assert_eq!(f.switches(a), a_before + 1);
        assert_eq!(f.switches(b), b_before + 1);
        assert_eq!(f.switches(Pid::IDLE), idle_before);
        assert!(core::ptr::eq(sw.from_ctx, &f.table.get(a).unwrap().context));
        assert!(core::ptr::eq(sw.to_ctx, &f.table.get(b).unwrap().context));
        assert_eq!(f.rq.switches(), 2);
    }

    #[test]
    fn switch_to_idle_counts_idle_pcb() {
        let mut f = Fixture::new();
        let a = f.spawn();
        f.rq.yield_current(&mut f.table).unwrap();
        let (a_before, idle_before) = (f.switches(a), f.switches(Pid::IDLE));

        let sw = f.rq.block_current(&mut f.table).unwrap();
        assert_eq!((sw.from, sw.to), (a, Pid::IDLE));
        assert_eq!(f.switches(a), a_before + 1);
        assert_eq!(f.switches(Pid::IDLE), idle_before + 1);
        assert!(core::ptr::eq(sw.to_ctx, &f.rq.idle_context));
        assert!(f.rq.current().is_idle());
    }

    #[test]
    fn zombie_registers_go_to_discard_context() {
        let mut f = Fixture::new();
        let a = f.spawn();
        let b = f.spawn();
        f.rq.yield_current(&mut f.table).unwrap();
        assert_eq!(f.rq.current(), a);

        f.table.terminate(a, 3).unwrap();
        let saved = f.table.get(a).unwrap().context;
        let a_before = f.switches(a);

        let sw = f.rq.schedule(&mut f.table).unwrap();
        assert_eq!((sw.from, sw.to), (a, b));
        assert!(core::ptr::eq(sw.from_ctx, &f.rq.discard_context));
        let zombie = f.table.get(a).unwrap();
        assert_eq!(zombie.state, ProcessState::Zombie);
        assert_eq!(zombie.context, saved);
        assert_eq!(zombie.sched.context_switches, a_before);
    }

    #[test]
    fn entries_without_pcb_are_purged() {
        let mut f = Fixture::new();
        f.rq.push(Pid::from_raw(77), Priority::High);
        let a = f.spawn();
        f.rq.push(Pid::from_raw(78), Priority::Low);
        assert_eq!(f.rq.ready_count(), 3);

        assert_eq!(f.rq.pick_next(&f.table), Some(a));
        assert_eq!(f.rq.ready_count(), 0);
        assert_eq!(f.rq.load(), 0);
        assert_eq!(f.rq.pick_next(&f.table), None);
    }
}
