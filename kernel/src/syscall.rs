// System Call Layer
//
// Numeric system call interface over the system context. Every call is a
// number plus up to six register-sized arguments and returns a signed
// 64-bit value: non-negative on success, a negative error code otherwise.
//
// Dispatch model:
// - A single `match` routes each number to a small handler
// - Handlers return `KernelResult<i64>` and errors are folded into codes
//   at one place (`KernelError::errno`)
// - Unknown numbers, and the reserved process-image calls (fork, exec,
//   wait), return ENOSYS
//
// Argument conventions:
// - exit(code), kill(pid), sleep(ms), yield(), getpid(), getppid()
// - send(dest, buf, len)
// - recv(buf, len, sender_out) where `sender_out` may be 0
// - spawn(name, name_len, entry, priority)
//
// Correctness and safety notes:
// - Processes run in kernel mode in an address space that maps the whole
//   kernel half, so argument pointers are dereferenced directly; a null
//   buffer is rejected with EFAULT before any access
// - Payload lengths are checked against MAX_MESSAGE_SIZE before a slice is
//   formed over the caller's buffer

use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::{MAX_MESSAGE_SIZE, PROCESS_NAME_MAX};
use crate::error::{KernelError, KernelResult};
use crate::process::Pid;
use crate::system::System;
use crate::{log_debug, log_warn};

pub const SYS_EXIT: u64 = 0;
pub const SYS_FORK: u64 = 5;
pub const SYS_EXEC: u64 = 6;
pub const SYS_WAIT: u64 = 7;
pub const SYS_KILL: u64 = 8;
pub const SYS_SLEEP: u64 = 9;
pub const SYS_YIELD: u64 = 10;
pub const SYS_GETPID: u64 = 11;
pub const SYS_GETPPID: u64 = 12;
pub const SYS_SEND: u64 = 31;
pub const SYS_RECV: u64 = 32;
pub const SYS_SPAWN: u64 = 33;

/// Exit code recorded for a process ended by `kill`.
pub const KILLED_EXIT_CODE: i32 = -9;

const LOG_ORIGIN: &str = "syscall";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallStats {
    pub calls: u64,
    pub errors: u64,
    pub unimplemented: u64,
}

pub struct SyscallCounters {
    calls: AtomicU64,
    errors: AtomicU64,
    unimplemented: AtomicU64,
}

impl SyscallCounters {
    pub const fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            unimplemented: AtomicU64::new(0),
        }
    }

    fn record(&self, result: &KernelResult<i64>) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(_) => {}
            Err(KernelError::Unimplemented) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.unimplemented.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn snapshot(&self) -> SyscallStats {
        SyscallStats {
            calls: self.calls.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            unimplemented: self.unimplemented.load(Ordering::Relaxed),
        }
    }
}

impl Default for SyscallCounters {
    fn default() -> Self {
        Self::new()
    }
}

pub fn dispatch(system: &System, cpu: usize, number: u64, args: [u64; 6]) -> i64 {
    log_debug!(
        LOG_ORIGIN,
        "cpu{}: num={} args=({:#x}, {:#x}, {:#x}, {:#x})",
        cpu,
        number,
        args[0],
        args[1],
        args[2],
        args[3]
    );

    let result = match number {
        SYS_EXIT => sys_exit(system, cpu, args[0]),
        SYS_FORK | SYS_EXEC | SYS_WAIT => Err(KernelError::Unimplemented),
        SYS_KILL => sys_kill(system, cpu, args[0]),
        SYS_SLEEP => system.sleep(cpu, args[0]).map(|_| 0),
        SYS_YIELD => system.yield_now(cpu).map(|_| 0),
        SYS_GETPID => Ok(system.current(cpu).raw() as i64),
        SYS_GETPPID => system.parent_of(system.current(cpu)).map(|p| p.raw() as i64),
        SYS_SEND => sys_send(system, cpu, args[0], args[1] as *const u8, args[2] as usize),
        SYS_RECV => sys_recv(
            system,
            cpu,
            args[0] as *mut u8,
            args[1] as usize,
            args[2] as *mut u32,
        ),
        SYS_SPAWN => sys_spawn(
            system,
            cpu,
            args[0] as *const u8,
            args[1] as usize,
            args[2],
            args[3],
        ),
        _ => {
            log_warn!(LOG_ORIGIN, "Unknown syscall number: {}", number);
            Err(KernelError::Unimplemented)
        }
    };

    system.syscall_counters().record(&result);
    match result {
        Ok(value) => value,
        Err(err) => err.errno(),
    }
}

fn sys_exit(system: &System, cpu: usize, code: u64) -> KernelResult<i64> {
    let current = system.current(cpu);
    if current.is_idle() {
        return Err(KernelError::InvalidArgument);
    }
    system.terminate(cpu, current, code as i32)?;
    Ok(0)
}

fn sys_kill(system: &System, cpu: usize, pid: u64) -> KernelResult<i64> {
    let pid = u32::try_from(pid).map_err(|_| KernelError::NoSuchProcess)?;
    system.terminate(cpu, Pid::from_raw(pid), KILLED_EXIT_CODE)?;
    Ok(0)
}

fn sys_send(system: &System, cpu: usize, dest: u64, buf: *const u8, len: usize) -> KernelResult<i64> {
    if buf.is_null() {
        return Err(KernelError::BadAddress);
    }
    if len > MAX_MESSAGE_SIZE {
        return Err(KernelError::InvalidArgument);
    }
    let dest = u32::try_from(dest).map_err(|_| KernelError::NoSuchProcess)?;
    // SAFETY: non-null and at most MAX_MESSAGE_SIZE bytes of the caller's
    // own buffer, which is mapped in the active address space.
    let data = unsafe { core::slice::from_raw_parts(buf, len) };
    system.send(cpu, Pid::from_raw(dest), data)?;
    Ok(0)
}

fn sys_recv(
    system: &System,
    cpu: usize,
    buf: *mut u8,
    len: usize,
    sender_out: *mut u32,
) -> KernelResult<i64> {
    if buf.is_null() {
        return Err(KernelError::BadAddress);
    }
    let len = len.min(MAX_MESSAGE_SIZE);
    // SAFETY: non-null caller buffer of at least `len` bytes; no message is
    // longer than MAX_MESSAGE_SIZE so nothing past that is touched.
    let out = unsafe { core::slice::from_raw_parts_mut(buf, len) };
    let (sender, copied) = system.receive(cpu, out)?;
    if !sender_out.is_null() {
        // SAFETY: optional out-parameter supplied by the caller.
        unsafe { sender_out.write_unaligned(sender.raw()) };
    }
    Ok(copied as i64)
}

fn sys_spawn(
    system: &System,
    cpu: usize,
    name: *const u8,
    name_len: usize,
    entry: u64,
    priority: u64,
) -> KernelResult<i64> {
    if name.is_null() && name_len != 0 {
        return Err(KernelError::BadAddress);
    }
    let priority = u8::try_from(priority).map_err(|_| KernelError::InvalidArgument)?;

    let name = if name_len == 0 {
        "process"
    } else {
        let len = name_len.min(PROCESS_NAME_MAX);
        // SAFETY: non-null, and only the first PROCESS_NAME_MAX bytes are
        // read.
        let bytes = unsafe { core::slice::from_raw_parts(name, len) };
        core::str::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument)?
    };

    let pid = system.spawn(cpu, name, entry, priority)?;
    Ok(pid.raw() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::error::{EAGAIN, EFAULT, EINVAL, ENOSYS, ESRCH};
    use crate::mm::testing::{memory_manager, SimulatedRam};
    use crate::process::ProcessState;

    const ENTRY: u64 = 0x40_0000;

    fn system(ram: &SimulatedRam) -> System {
        let config = KernelConfig::default();
        System::new(memory_manager(ram, &config), config).unwrap()
    }

    fn spawn(system: &System, name: &str) -> i64 {
        dispatch(
            system,
            0,
            SYS_SPAWN,
            [name.as_ptr() as u64, name.len() as u64, ENTRY, 2, 0, 0],
        )
    }

    #[test]
    fn unknown_and_reserved_numbers_are_enosys() {
        let ram = SimulatedRam::with_frames(512);
        let system = system(&ram);
        for number in [SYS_FORK, SYS_EXEC, SYS_WAIT, 1, 99, u64::MAX] {
            assert_eq!(dispatch(&system, 0, number, [0; 6]), ENOSYS);
        }
        assert_eq!(system.stats().syscalls.unimplemented, 6);
    }

    #[test]
    fn spawn_and_identity_calls() {
        let ram = SimulatedRam::with_frames(1024);
        let system = system(&ram);

        let pid = spawn(&system, "child");
        assert_eq!(pid, 1);
        assert_eq!(dispatch(&system, 0, SYS_GETPID, [0; 6]), 0);

        assert_eq!(dispatch(&system, 0, SYS_YIELD, [0; 6]), 0);
        assert_eq!(dispatch(&system, 0, SYS_GETPID, [0; 6]), 1);
        assert_eq!(dispatch(&system, 0, SYS_GETPPID, [0; 6]), 0);

        assert_eq!(
            dispatch(&system, 0, SYS_SPAWN, [0, 0, ENTRY, 9, 0, 0]),
            EINVAL
        );
        assert_eq!(
            dispatch(&system, 0, SYS_SPAWN, [0, 4, ENTRY, 2, 0, 0]),
            EFAULT
        );
    }

    #[test]
    fn send_and_receive_through_syscalls() {
        let ram = SimulatedRam::with_frames(1024);
        let system = system(&ram);
        let receiver = spawn(&system, "receiver");
        let sender = spawn(&system, "sender");

        // Run the sender.
        dispatch(&system, 0, SYS_YIELD, [0; 6]);
        dispatch(&system, 0, SYS_YIELD, [0; 6]);
        assert_eq!(system.current(0).raw() as i64, sender);

        let payload = b"ping";
        let send = [receiver as u64, payload.as_ptr() as u64, payload.len() as u64, 0, 0, 0];
        assert_eq!(dispatch(&system, 0, SYS_SEND, send), 0);
        assert_eq!(
            dispatch(&system, 0, SYS_SEND, [receiver as u64, 0, 4, 0, 0, 0]),
            EFAULT
        );
        assert_eq!(
            dispatch(&system, 0, SYS_SEND, [999, payload.as_ptr() as u64, 4, 0, 0, 0]),
            ESRCH
        );

        // Back to the receiver.
        dispatch(&system, 0, SYS_YIELD, [0; 6]);
        assert_eq!(system.current(0).raw() as i64, receiver);

        let mut buf = [0u8; 16];
        let mut from = 0u32;
        let recv = [buf.as_mut_ptr() as u64, buf.len() as u64, &mut from as *mut u32 as u64, 0, 0, 0];
        assert_eq!(dispatch(&system, 0, SYS_RECV, recv), 4);
        assert_eq!(&buf[..4], payload);
        assert_eq!(from as i64, sender);
        assert_eq!(dispatch(&system, 0, SYS_RECV, recv), EAGAIN);
        assert_eq!(dispatch(&system, 0, SYS_RECV, [0, 16, 0, 0, 0, 0]), EFAULT);
    }

    #[test]
    fn exit_and_kill() {
        let ram = SimulatedRam::with_frames(1024);
        let system = system(&ram);
        assert_eq!(dispatch(&system, 0, SYS_EXIT, [0; 6]), EINVAL);

        let a = spawn(&system, "a");
        let b = spawn(&system, "b");
        dispatch(&system, 0, SYS_YIELD, [0; 6]);
        assert_eq!(system.current(0).raw() as i64, a);

        assert_eq!(dispatch(&system, 0, SYS_KILL, [b as u64, 0, 0, 0, 0, 0]), 0);
        let info = system.process_info(Pid::from_raw(b as u32)).unwrap();
        assert_eq!(info.state, ProcessState::Zombie);
        assert_eq!(info.exit_code, KILLED_EXIT_CODE);

        assert_eq!(dispatch(&system, 0, SYS_EXIT, [3, 0, 0, 0, 0, 0]), 0);
        assert!(system.current(0).is_idle());
        assert_eq!(system.reap_zombies(), 2);
        assert_eq!(dispatch(&system, 0, SYS_KILL, [b as u64, 0, 0, 0, 0, 0]), ESRCH);
    }

    #[test]
    fn sleep_syscall_parks_the_caller() {
        let ram = SimulatedRam::with_frames(1024);
        let system = system(&ram);
        let pid = spawn(&system, "sleeper");
        dispatch(&system, 0, SYS_YIELD, [0; 6]);

        assert_eq!(dispatch(&system, 0, SYS_SLEEP, [50, 0, 0, 0, 0, 0]), 0);
        let info = system.process_info(Pid::from_raw(pid as u32)).unwrap();
        assert_eq!(info.state, ProcessState::Sleeping);
        assert_eq!(dispatch(&system, 0, SYS_SLEEP, [50, 0, 0, 0, 0, 0]), EINVAL);
    }
}
