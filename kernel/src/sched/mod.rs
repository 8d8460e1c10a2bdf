// Process Scheduler
//
// Multi-CPU preemptive scheduler with pluggable selection strategies.
// Each CPU owns a `RunQueue` behind its own spin lock; the process table is
// passed in by the caller, already locked.
//
// Key responsibilities:
// - Place processes on CPUs (least-loaded CPU on first enqueue)
// - Drive time slices, virtual runtime and sleeper wakeups from the tick
// - Produce context switches for yield, sleep, block and preemption
//
// Design principles:
// - Bookkeeping and the register switch are separate steps: every
//   operation returns an optional `ContextSwitch`, which the caller performs
//   after releasing its locks but before re-enabling interrupts
// - Strategies live in `policy` and only compare snapshots
// - One strategy is active at a time and applies to every CPU
//
// Implementation details:
// - Tick length is 1e9 / timer_hz ns; a process of weight w gains
//   tick_ns * 1024 / w of virtual runtime per tick it runs
// - Sleep durations are rounded down to whole ticks (ms * hz / 1000)
//
// Correctness and safety notes:
// - Lock order is process table, then run queue; run queues are never
//   nested except for the brief load scan in `least_loaded_cpu`, which
//   holds one at a time
// - `ContextSwitch` carries raw pointers into boxed PCBs and per-CPU
//   contexts; it is only valid until the process table changes again, so
//   it must be performed immediately

pub mod policy;
pub mod runqueue;

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};

use crate::arch;
use crate::config::KernelConfig;
use crate::context::CpuContext;
use crate::error::{KernelError, KernelResult};
use crate::process::{Pid, ProcessState, ProcessTable};
use crate::timer;
use crate::{log_debug, log_info};

pub use policy::SchedAlgorithm;
use runqueue::RunQueue;

const LOG_ORIGIN: &str = "sched";

/// A pending register switch on one CPU.
#[derive(Debug)]
pub struct ContextSwitch {
    pub cpu: usize,
    pub from: Pid,
    pub to: Pid,
    from_ctx: *mut CpuContext,
    to_ctx: *const CpuContext,
}

impl ContextSwitch {
    /// Saves the running registers and resumes the target. Returns when the
    /// `from` side is scheduled again.
    pub fn perform(self) {
        log_debug!(LOG_ORIGIN, "cpu{}: switch {} -> {}", self.cpu, self.from, self.to);
        arch::without_interrupts(|| {
            // SAFETY: both pointers were taken from live PCBs or per-CPU
            // contexts while the locks were held, and nothing has run since
            // that could free them.
            unsafe { arch::switch_context(self.from_ctx, self.to_ctx) }
        });
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStats {
    pub current: u32,
    pub ready: usize,
    pub sleeping: usize,
    pub switches: u64,
    pub idle_ticks: u64,
    pub clock: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    pub algorithm: SchedAlgorithm,
    pub context_switches: u64,
    pub ticks: u64,
    pub cpus: Vec<CpuStats>,
}

pub struct Scheduler {
    run_queues: Vec<Mutex<RunQueue>>,
    context_switches: AtomicU64,
    ticks: AtomicU64,
    tick_ns: u64,
    timer_hz: u64,
}

impl Scheduler {
    pub fn new(config: &KernelConfig) -> Self {
        let run_queues = (0..config.cpu_count.max(1))
            .map(|cpu| Mutex::new(RunQueue::new(cpu, config.algorithm)))
            .collect();
        let timer_hz = config.timer_hz.max(1);

        log_info!(
            LOG_ORIGIN,
            "Scheduler ready: {} CPUs, {} at {} Hz",
            config.cpu_count,
            config.algorithm.as_str(),
            timer_hz
        );

        Self {
            run_queues,
            context_switches: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            tick_ns: 1_000_000_000 / timer_hz,
            timer_hz,
        }
    }

    pub fn cpu_count(&self) -> usize {
        self.run_queues.len()
    }

    fn queue(&self, cpu: usize) -> KernelResult<MutexGuard<'_, RunQueue>> {
        self.run_queues
            .get(cpu)
            .map(Mutex::lock)
            .ok_or(KernelError::InvalidArgument)
    }

    fn count(&self, switch: Option<ContextSwitch>) -> Option<ContextSwitch> {
        if switch.is_some() {
            self.context_switches.fetch_add(1, Ordering::Relaxed);
        }
        switch
    }

    pub fn least_loaded_cpu(&self) -> usize {
        self.run_queues
            .iter()
            .enumerate()
            .min_by_key(|(_, rq)| rq.lock().load())
            .map_or(0, |(cpu, _)| cpu)
    }

    pub fn current(&self, cpu: usize) -> Pid {
        self.queue(cpu).map_or(Pid::IDLE, |rq| rq.current())
    }

    pub fn algorithm(&self) -> SchedAlgorithm {
        self.run_queues
            .first()
            .map_or(SchedAlgorithm::default(), |rq| rq.lock().algorithm)
    }

    pub fn set_algorithm(&self, algorithm: SchedAlgorithm) {
        for rq in &self.run_queues {
            rq.lock().algorithm = algorithm;
        }
        log_info!(LOG_ORIGIN, "Scheduling algorithm set to {}", algorithm.as_str());
    }

    /// True while `pid` is ready, sleeping or running on any CPU.
    pub fn holds(&self, pid: Pid) -> bool {
        self.run_queues.iter().any(|rq| rq.lock().holds(pid))
    }

    /// Makes `pid` READY on its CPU, choosing the least-loaded CPU for a
    /// process that has never run.
    pub fn enqueue(&self, table: &mut ProcessTable, pid: Pid) -> KernelResult<()> {
        if pid.is_idle() {
            return Err(KernelError::InvalidArgument);
        }
        let assigned = table.get(pid).ok_or(KernelError::NoSuchProcess)?.cpu;
        let cpu = match assigned {
            Some(cpu) => cpu,
            None => self.least_loaded_cpu(),
        };
        let mut rq = self.queue(cpu)?;

        let p = table.get_mut(pid).ok_or(KernelError::NoSuchProcess)?;
        if !p.state.is_alive() {
            return Err(KernelError::InvalidArgument);
        }
        if rq.current() == pid && p.state == ProcessState::Running {
            return Ok(());
        }
        p.cpu = Some(cpu);
        p.state = ProcessState::Ready;
        p.sched.ready_since = rq.clock();
        let priority = p.priority;
        rq.push(pid, priority);
        Ok(())
    }

    /// Takes `pid` off its CPU's ready and sleeper lists. Returns whether it
    /// was found there.
    pub fn dequeue(&self, table: &ProcessTable, pid: Pid) -> KernelResult<bool> {
        let p = table.get(pid).ok_or(KernelError::NoSuchProcess)?;
        match p.cpu {
            Some(cpu) => Ok(self.queue(cpu)?.remove(pid)),
            None => Ok(false),
        }
    }

    /// Moves a BLOCKED or SLEEPING process back to READY. Other states are
    /// left alone.
    pub fn wake(&self, table: &mut ProcessTable, pid: Pid) -> KernelResult<bool> {
        let state = table.get(pid).ok_or(KernelError::NoSuchProcess)?.state;
        if !matches!(state, ProcessState::Blocked | ProcessState::Sleeping) {
            return Ok(false);
        }
        self.dequeue(table, pid)?;
        self.enqueue(table, pid)?;
        if let Some(p) = table.get_mut(pid) {
            p.sched.wakeups += 1;
        }
        Ok(true)
    }

    /// Retires `pid` from scheduling after it became a zombie. If it is the
    /// current process of `cpu` a switch away is returned; a process running
    /// on another CPU is replaced on that CPU's next tick.
    pub fn remove(
        &self,
        cpu: usize,
        table: &mut ProcessTable,
        pid: Pid,
    ) -> KernelResult<Option<ContextSwitch>> {
        let home = table.get(pid).ok_or(KernelError::NoSuchProcess)?.cpu;
        let Some(home) = home else {
            return Ok(None);
        };
        let mut rq = self.queue(home)?;
        rq.remove(pid);
        if home == cpu && rq.current() == pid {
            return Ok(self.count(rq.schedule(table)));
        }
        Ok(None)
    }

    /// Removes and returns the next process of `cpu` without switching.
    pub fn pick_next(&self, cpu: usize, table: &ProcessTable) -> KernelResult<Option<Pid>> {
        Ok(self.queue(cpu)?.pick_next(table))
    }

    pub fn yield_current(
        &self,
        cpu: usize,
        table: &mut ProcessTable,
    ) -> KernelResult<Option<ContextSwitch>> {
        let mut rq = self.queue(cpu)?;
        Ok(self.count(rq.yield_current(table)))
    }

    pub fn preempt(
        &self,
        cpu: usize,
        table: &mut ProcessTable,
    ) -> KernelResult<Option<ContextSwitch>> {
        let mut rq = self.queue(cpu)?;
        Ok(self.count(rq.preempt(table)))
    }

    /// One timer tick on `cpu`.
    pub fn tick(&self, cpu: usize, table: &mut ProcessTable) -> KernelResult<Option<ContextSwitch>> {
        let mut rq = self.queue(cpu)?;
        self.ticks.fetch_add(1, Ordering::Relaxed);
        Ok(self.count(rq.tick(table, self.tick_ns)))
    }

    pub fn sleep_current(
        &self,
        cpu: usize,
        table: &mut ProcessTable,
        ms: u64,
    ) -> KernelResult<Option<ContextSwitch>> {
        let mut rq = self.queue(cpu)?;
        if rq.current().is_idle() {
            return Err(KernelError::InvalidArgument);
        }
        let ticks = timer::ms_to_ticks(ms, self.timer_hz);
        Ok(self.count(rq.sleep_current(table, ticks)))
    }

    pub fn block_current(
        &self,
        cpu: usize,
        table: &mut ProcessTable,
    ) -> KernelResult<Option<ContextSwitch>> {
        let mut rq = self.queue(cpu)?;
        if rq.current().is_idle() {
            return Err(KernelError::InvalidArgument);
        }
        Ok(self.count(rq.block_current(table)))
    }

    /// Scheduler clock of `cpu`, in ticks.
    pub fn clock(&self, cpu: usize) -> u64 {
        self.queue(cpu).map_or(0, |rq| rq.clock())
    }

    pub fn stats(&self) -> SchedulerStats {
        let cpus = self
            .run_queues
            .iter()
            .map(|rq| {
                let rq = rq.lock();
                CpuStats {
                    current: rq.current().raw(),
                    ready: rq.ready_count(),
                    sleeping: rq.sleeping_count(),
                    switches: rq.switches(),
                    idle_ticks: rq.idle_ticks(),
                    clock: rq.clock(),
                }
            })
            .collect();

        SchedulerStats {
            algorithm: self.algorithm(),
            context_switches: self.context_switches.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            cpus,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testing::{memory_manager, SimulatedRam};
    use crate::mm::MemoryManager;
    use crate::process::Priority;

    const ENTRY: u64 = 0x20_0000;

    struct Fixture {
        _ram: SimulatedRam,
        mm: MemoryManager,
        table: ProcessTable,
        sched: Scheduler,
    }

    impl Fixture {
        fn new(config: KernelConfig) -> Self {
            let ram = SimulatedRam::with_frames(2048);
            let mm = memory_manager(&ram, &config);
            Self {
                _ram: ram,
                mm,
                table: ProcessTable::new(&config),
                sched: Scheduler::new(&config),
            }
        }

        fn spawn(&mut self, priority: Priority) -> Pid {
            let pid = self
                .table
                .create(&mut self.mm, "test", ENTRY, priority as u8, Pid::IDLE, 0)
                .unwrap();
            self.sched.enqueue(&mut self.table, pid).unwrap();
            pid
        }

        fn tick(&mut self) {
            let _ = self.sched.tick(0, &mut self.table).unwrap();
        }

        fn current(&self) -> Pid {
            self.sched.current(0)
        }

        fn runtime(&self, pid: Pid) -> u64 {
            self.table.get(pid).unwrap().sched.runtime
        }
    }

    #[test]
    fn round_robin_runs_each_process_once_per_round() {
        let mut f = Fixture::new(KernelConfig::default());
        let pids: Vec<Pid> = (0..4).map(|_| f.spawn(Priority::Normal)).collect();

        let mut seen = Vec::new();
        for _ in 0..pids.len() {
            f.sched.yield_current(0, &mut f.table).unwrap();
            seen.push(f.current());
        }
        assert_eq!(seen, pids);

        // Next round starts over in the same order.
        f.sched.yield_current(0, &mut f.table).unwrap();
        assert_eq!(f.current(), pids[0]);
    }

    #[test]
    fn pick_next_without_requeue_drains_once_each() {
        let mut f = Fixture::new(KernelConfig::default());
        let mut pids: Vec<Pid> = (0..3).map(|_| f.spawn(Priority::Normal)).collect();

        let mut picked: Vec<Pid> = (0..3)
            .map(|_| f.sched.pick_next(0, &f.table).unwrap().unwrap())
            .collect();
        picked.sort();
        pids.sort();
        assert_eq!(picked, pids);
        assert_eq!(f.sched.pick_next(0, &f.table).unwrap(), None);
    }

    #[test]
    fn time_slice_rotates_equal_processes() {
        let config = KernelConfig::default().with_time_slice(2);
        let mut f = Fixture::new(config);
        let a = f.spawn(Priority::Normal);
        let b = f.spawn(Priority::Normal);

        f.tick();
        assert_eq!(f.current(), a);
        f.tick();
        assert_eq!(f.current(), a);
        f.tick();
        assert_eq!(f.current(), b);
        assert_eq!(f.table.get(a).unwrap().sched.preemptions, 1);
        assert_eq!(f.table.get(a).unwrap().state, ProcessState::Ready);
    }

    #[test]
    fn weighted_fair_shares_cpu_by_weight() {
        let config = KernelConfig::default()
            .with_algorithm(SchedAlgorithm::WeightedFair)
            .with_time_slice(1);
        let mut f = Fixture::new(config);
        let high = f.spawn(Priority::High);
        let low = f.spawn(Priority::Low);

        for _ in 0..5000 {
            f.tick();
        }

        let expected = Priority::High.weight() as f64 / Priority::Low.weight() as f64;
        let ratio = f.runtime(high) as f64 / f.runtime(low) as f64;
        assert!(
            (ratio - expected).abs() / expected < 0.15,
            "ratio {} expected {}",
            ratio,
            expected
        );
    }

    #[test]
    fn strict_priority_starves_lower_classes() {
        let config = KernelConfig::default()
            .with_algorithm(SchedAlgorithm::StrictPriority)
            .with_time_slice(1);
        let mut f = Fixture::new(config);
        let normal = f.spawn(Priority::Normal);
        let low = f.spawn(Priority::Low);
        let high = f.spawn(Priority::High);

        for _ in 0..200 {
            f.tick();
            assert_eq!(f.current(), high);
        }
        assert_eq!(f.runtime(normal), 0);
        assert_eq!(f.runtime(low), 0);
    }

    #[test]
    fn edf_runs_earliest_deadline() {
        let config = KernelConfig::default().with_algorithm(SchedAlgorithm::EarliestDeadlineFirst);
        let mut f = Fixture::new(config);
        let late = f.spawn(Priority::Realtime);
        let early = f.spawn(Priority::High);
        f.table.get_mut(late).unwrap().sched.deadline = 500;
        f.table.get_mut(early).unwrap().sched.deadline = 50;

        f.tick();
        assert_eq!(f.current(), early);
    }

    #[test]
    fn sleep_wakes_exactly_once_after_duration() {
        let mut f = Fixture::new(KernelConfig::default());
        let pid = f.spawn(Priority::Normal);
        f.tick();
        assert_eq!(f.current(), pid);

        // 100 ms at 100 Hz is ten ticks.
        f.sched.sleep_current(0, &mut f.table, 100).unwrap();
        assert_eq!(f.table.get(pid).unwrap().state, ProcessState::Sleeping);
        assert!(f.current().is_idle());

        for _ in 0..9 {
            f.tick();
            assert_eq!(f.table.get(pid).unwrap().state, ProcessState::Sleeping);
        }
        f.tick();
        assert_eq!(f.table.get(pid).unwrap().state, ProcessState::Running);
        assert_eq!(f.table.get(pid).unwrap().sched.wakeups, 1);

        for _ in 0..30 {
            f.tick();
        }
        assert_eq!(f.table.get(pid).unwrap().sched.wakeups, 1);
    }

    #[test]
    fn block_and_wake() {
        let mut f = Fixture::new(KernelConfig::default());
        let pid = f.spawn(Priority::Normal);
        f.tick();

        f.sched.block_current(0, &mut f.table).unwrap();
        assert_eq!(f.table.get(pid).unwrap().state, ProcessState::Blocked);
        for _ in 0..5 {
            f.tick();
        }
        assert!(f.current().is_idle());

        assert!(f.sched.wake(&mut f.table, pid).unwrap());
        assert!(!f.sched.wake(&mut f.table, pid).unwrap());
        f.tick();
        assert_eq!(f.current(), pid);
    }

    #[test]
    fn idle_cpu_cannot_sleep_or_block() {
        let mut f = Fixture::new(KernelConfig::default());
        assert_eq!(
            f.sched.sleep_current(0, &mut f.table, 10).unwrap_err(),
            KernelError::InvalidArgument
        );
        assert_eq!(
            f.sched.block_current(0, &mut f.table).unwrap_err(),
            KernelError::InvalidArgument
        );
        assert!(f.sched.tick(7, &mut f.table).is_err());
    }

    #[test]
    fn removing_the_current_process_switches_away() {
        let mut f = Fixture::new(KernelConfig::default());
        let a = f.spawn(Priority::Normal);
        let b = f.spawn(Priority::Normal);
        f.tick();
        assert_eq!(f.current(), a);

        f.table.terminate(a, 0).unwrap();
        let switch = f.sched.remove(0, &mut f.table, a).unwrap().unwrap();
        assert_eq!((switch.from, switch.to), (a, b));
        assert!(!f.sched.holds(a));
    }

    #[test]
    fn placement_balances_cpus() {
        let mut f = Fixture::new(KernelConfig::default().with_cpus(2));
        let a = f.spawn(Priority::Normal);
        let b = f.spawn(Priority::Normal);
        assert_eq!(f.table.get(a).unwrap().cpu, Some(0));
        assert_eq!(f.table.get(b).unwrap().cpu, Some(1));

        let _ = f.sched.tick(1, &mut f.table).unwrap();
        assert_eq!(f.sched.current(1), b);
        assert_eq!(f.sched.stats().cpus.len(), 2);
    }
}
