// System Context
//
// Owns every piece of mutable kernel state behind explicit locks and is
// the single entry point for process-level operations. One `System` is
// built at initialization and passed by reference from then on.
//
// Key responsibilities:
// - Hold the memory manager, the process table and the scheduler
// - Combine process-table and scheduler steps into whole operations
//   (spawn, terminate, sleep, send, ...)
// - Perform context switches once the bookkeeping is done
//
// Locking:
// - Lock order is process table first, then either a run queue or the
//   memory manager; a run queue and the memory manager are never held
//   together
// - Every operation runs with interrupts disabled so the timer tick cannot
//   re-enter a held lock on the same CPU
// - A context switch computed under the locks is performed after they are
//   dropped, still with interrupts disabled
//
// Correctness notes:
// - Destroying a process is refused while any CPU still holds it (ready,
//   sleeping or running); `reap_zombies` simply retries later
// - CPU indices come from the caller (the interrupt or syscall entry of
//   that CPU); an unknown index is rejected

use alloc::vec::Vec;
use spin::Mutex;

use crate::arch;
use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::ipc::{self, IpcStats};
use crate::mm::{MemoryManager, MemoryStats};
use crate::process::{Pid, Priority, ProcessInfo, ProcessState, ProcessTable};
use crate::sched::{ContextSwitch, SchedAlgorithm, Scheduler, SchedulerStats};
use crate::syscall::{SyscallCounters, SyscallStats};
use crate::timer;
use crate::{log_debug, log_info};

const LOG_ORIGIN: &str = "system";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessCounts {
    pub total_created: u64,
    pub active: usize,
    pub ready: usize,
    pub running: usize,
    pub blocked: usize,
    pub sleeping: usize,
    pub zombie: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemStats {
    pub memory: MemoryStats,
    pub scheduler: SchedulerStats,
    pub processes: ProcessCounts,
    pub ipc: IpcStats,
    pub syscalls: SyscallStats,
}

pub struct System {
    config: KernelConfig,
    memory: Mutex<MemoryManager>,
    processes: Mutex<ProcessTable>,
    scheduler: Scheduler,
    syscalls: SyscallCounters,
}

impl System {
    pub fn new(memory: MemoryManager, config: KernelConfig) -> KernelResult<Self> {
        config.validate()?;
        let processes = ProcessTable::new(&config);
        let scheduler = Scheduler::new(&config);

        log_info!(
            LOG_ORIGIN,
            "System ready: {} CPUs, {} process slots",
            config.cpu_count,
            config.max_processes
        );

        Ok(Self {
            config,
            memory: Mutex::new(memory),
            processes: Mutex::new(processes),
            scheduler,
            syscalls: SyscallCounters::new(),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn memory(&self) -> &Mutex<MemoryManager> {
        &self.memory
    }

    pub(crate) fn syscall_counters(&self) -> &SyscallCounters {
        &self.syscalls
    }

    /// Runs `f` on the locked process table with interrupts disabled, then
    /// performs the switch it produced, if any.
    fn run<R>(
        &self,
        f: impl FnOnce(&mut ProcessTable) -> KernelResult<(R, Option<ContextSwitch>)>,
    ) -> KernelResult<R> {
        arch::without_interrupts(|| {
            let (value, switch) = {
                let mut table = self.processes.lock();
                f(&mut table)?
            };
            if let Some(switch) = switch {
                switch.perform();
            }
            Ok(value)
        })
    }

    /// Creates a process as a child of whatever `cpu` is running and makes
    /// it READY on the least-loaded CPU.
    pub fn spawn(&self, cpu: usize, name: &str, entry: u64, priority: u8) -> KernelResult<Pid> {
        if cpu >= self.scheduler.cpu_count() {
            return Err(KernelError::InvalidArgument);
        }
        self.run(|table| {
            let parent = self.scheduler.current(cpu);
            let now = self.scheduler.clock(cpu);
            let pid = {
                let mut memory = self.memory.lock();
                table.create(&mut memory, name, entry, priority, parent, now)?
            };
            self.scheduler.enqueue(table, pid)?;
            Ok((pid, None))
        })
    }

    /// Turns `pid` into a zombie and takes it out of scheduling. When `pid`
    /// is running on `cpu` this switches away and does not return until
    /// `cpu` schedules the old context again.
    pub fn terminate(&self, cpu: usize, pid: Pid, exit_code: i32) -> KernelResult<()> {
        self.run(|table| {
            let parent = table.terminate(pid, exit_code)?;
            if let Some(parent) = parent {
                self.scheduler.wake(table, parent)?;
            }
            let switch = self.scheduler.remove(cpu, table, pid)?;
            log_info!(LOG_ORIGIN, "Process {} terminated (code {})", pid, exit_code);
            Ok(((), switch))
        })
    }

    pub fn destroy(&self, pid: Pid) -> KernelResult<()> {
        self.run(|table| {
            if self.scheduler.holds(pid) {
                return Err(KernelError::InvalidArgument);
            }
            let mut memory = self.memory.lock();
            table.destroy(&mut memory, pid)?;
            Ok(((), None))
        })
    }

    /// Destroys every zombie no CPU still holds. Returns how many went.
    pub fn reap_zombies(&self) -> usize {
        let reaped = self.run(|table| {
            let mut reaped = 0;
            for pid in table.zombies() {
                if self.scheduler.holds(pid) {
                    continue;
                }
                let mut memory = self.memory.lock();
                if table.destroy(&mut memory, pid).is_ok() {
                    reaped += 1;
                }
            }
            Ok((reaped, None))
        });
        let reaped = reaped.unwrap_or(0);
        if reaped > 0 {
            log_debug!(LOG_ORIGIN, "Reaped {} zombies", reaped);
        }
        reaped
    }

    /// Timer interrupt entry for `cpu`. CPU 0 also advances the global
    /// tick counter.
    pub fn timer_tick(&self, cpu: usize) -> KernelResult<()> {
        if cpu == 0 {
            timer::advance();
        }
        self.run(|table| Ok(((), self.scheduler.tick(cpu, table)?)))
    }

    pub fn yield_now(&self, cpu: usize) -> KernelResult<()> {
        self.run(|table| Ok(((), self.scheduler.yield_current(cpu, table)?)))
    }

    pub fn sleep(&self, cpu: usize, ms: u64) -> KernelResult<()> {
        self.run(|table| Ok(((), self.scheduler.sleep_current(cpu, table, ms)?)))
    }

    pub fn block_current(&self, cpu: usize) -> KernelResult<()> {
        self.run(|table| Ok(((), self.scheduler.block_current(cpu, table)?)))
    }

    /// Makes a BLOCKED or SLEEPING process READY. Returns false if it was
    /// in neither state.
    pub fn wake(&self, pid: Pid) -> KernelResult<bool> {
        self.run(|table| Ok((self.scheduler.wake(table, pid)?, None)))
    }

    pub fn current(&self, cpu: usize) -> Pid {
        self.scheduler.current(cpu)
    }

    pub fn parent_of(&self, pid: Pid) -> KernelResult<Pid> {
        self.run(|table| {
            let p = table.get(pid).ok_or(KernelError::NoSuchProcess)?;
            Ok((p.ppid, None))
        })
    }

    /// Changes the class of `pid`, moving it between ready lists if it is
    /// queued.
    pub fn set_priority(&self, pid: Pid, priority: u8) -> KernelResult<()> {
        let priority = Priority::try_from(priority)?;
        self.run(|table| {
            if pid.is_idle() {
                return Err(KernelError::InvalidArgument);
            }
            let p = table.get(pid).ok_or(KernelError::NoSuchProcess)?;
            if !p.state.is_alive() {
                return Err(KernelError::NoSuchProcess);
            }
            let was_ready = p.state == ProcessState::Ready && self.scheduler.dequeue(table, pid)?;
            if let Some(p) = table.get_mut(pid) {
                p.set_priority(priority);
            }
            if was_ready {
                self.scheduler.enqueue(table, pid)?;
            }
            Ok(((), None))
        })
    }

    /// Sets a deadline `ticks` from now on the process's CPU clock; 0 clears
    /// it.
    pub fn set_deadline(&self, pid: Pid, ticks: u64) -> KernelResult<()> {
        self.run(|table| {
            if pid.is_idle() {
                return Err(KernelError::InvalidArgument);
            }
            let p = table.get(pid).ok_or(KernelError::NoSuchProcess)?;
            if !p.state.is_alive() {
                return Err(KernelError::NoSuchProcess);
            }
            let cpu = p.cpu.unwrap_or(0);
            let deadline = match ticks {
                0 => 0,
                t => self.scheduler.clock(cpu).saturating_add(t),
            };
            if let Some(p) = table.get_mut(pid) {
                p.sched.deadline = deadline;
            }
            Ok(((), None))
        })
    }

    pub fn set_algorithm(&self, algorithm: SchedAlgorithm) {
        self.scheduler.set_algorithm(algorithm);
    }

    /// Copies `data` into `dest`'s mailbox, waking it if it was blocked.
    pub fn send(&self, cpu: usize, dest: Pid, data: &[u8]) -> KernelResult<()> {
        self.run(|table| {
            let sender = self.scheduler.current(cpu);
            let now = self.scheduler.clock(cpu);
            if ipc::send(table, sender, dest, data, now)? {
                self.scheduler.wake(table, dest)?;
            }
            Ok(((), None))
        })
    }

    /// Takes the oldest message addressed to the process running on `cpu`.
    pub fn receive(&self, cpu: usize, buf: &mut [u8]) -> KernelResult<(Pid, usize)> {
        self.run(|table| {
            let receiver = self.scheduler.current(cpu);
            Ok((ipc::receive(table, receiver, buf)?, None))
        })
    }

    pub fn process_info(&self, pid: Pid) -> KernelResult<ProcessInfo> {
        self.run(|table| {
            let p = table.get(pid).ok_or(KernelError::NoSuchProcess)?;
            Ok((p.info(), None))
        })
    }

    pub fn processes(&self) -> Vec<ProcessInfo> {
        self.run(|table| {
            let infos = table
                .pids()
                .filter_map(|pid| table.get(pid).map(|p| p.info()))
                .collect();
            Ok((infos, None))
        })
        .unwrap_or_default()
    }

    /// Logs one line per process.
    pub fn dump(&self) {
        for info in self.processes() {
            log_info!(
                LOG_ORIGIN,
                "pid={} ppid={} name={} state={} prio={} cpu={:?} runtime={} vruntime={} switches={} mailbox={}",
                info.pid,
                info.ppid,
                info.name,
                info.state.as_str(),
                info.priority.as_str(),
                info.cpu,
                info.sched.runtime,
                info.sched.vruntime,
                info.sched.context_switches,
                info.mailbox_len
            );
        }
    }

    pub fn stats(&self) -> SystemStats {
        let processes = arch::without_interrupts(|| {
            let table = self.processes.lock();
            ProcessCounts {
                total_created: table.total_created(),
                active: table.active(),
                ready: table.count_in_state(ProcessState::Ready),
                running: table.count_in_state(ProcessState::Running),
                blocked: table.count_in_state(ProcessState::Blocked),
                sleeping: table.count_in_state(ProcessState::Sleeping),
                zombie: table.count_in_state(ProcessState::Zombie),
            }
        });
        let memory = arch::without_interrupts(|| self.memory.lock().stats());

        SystemStats {
            memory,
            scheduler: self.scheduler.stats(),
            processes,
            ipc: ipc::stats(),
            syscalls: self.syscalls.snapshot(),
        }
    }
}
