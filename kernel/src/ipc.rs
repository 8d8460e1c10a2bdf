// Inter-Process Communication (IPC)
//
// Mailbox message passing between processes. Every PCB carries one FIFO
// mailbox; a send copies the payload into a kernel-owned message and a
// receive copies it back out.
//
// Message model:
// - A message records its sender, a payload of at most MAX_MESSAGE_SIZE
//   bytes and the tick at which it was sent
// - Mailboxes are bounded by MAX_QUEUE_DEPTH; a full mailbox rejects the
//   send rather than growing
//
// Blocking:
// - Receive never blocks here; an empty mailbox yields NoMessage and the
//   caller decides whether to block
// - Send reports whether the receiver was BLOCKED so the caller can wake it
//   through the scheduler
//
// Correctness notes:
// - All checks happen before anything is queued, so a failed send leaves
//   the receiver untouched
// - Payloads longer than the receive buffer are truncated to the buffer

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::MAX_MESSAGE_SIZE;
use crate::error::{KernelError, KernelResult};
use crate::process::{Pid, ProcessState, ProcessTable};
use crate::{log_debug, log_warn};

pub const MAX_QUEUE_DEPTH: usize = 64;

const LOG_ORIGIN: &str = "ipc";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: Pid,
    pub payload: Vec<u8>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpcStats {
    pub sent: u64,
    pub received: u64,
    pub rejected: u64,
    pub bytes: u64,
}

static SENT: AtomicU64 = AtomicU64::new(0);
static RECEIVED: AtomicU64 = AtomicU64::new(0);
static REJECTED: AtomicU64 = AtomicU64::new(0);
static BYTES: AtomicU64 = AtomicU64::new(0);

fn reject(err: KernelError) -> KernelError {
    REJECTED.fetch_add(1, Ordering::Relaxed);
    err
}

/// Queues a copy of `data` in `dest`'s mailbox. Returns true when `dest`
/// was blocked and should be woken.
pub fn send(
    table: &mut ProcessTable,
    sender: Pid,
    dest: Pid,
    data: &[u8],
    now: u64,
) -> KernelResult<bool> {
    if data.len() > MAX_MESSAGE_SIZE {
        log_warn!(
            LOG_ORIGIN,
            "send rejected: payload too large (len={}, max={})",
            data.len(),
            MAX_MESSAGE_SIZE
        );
        return Err(reject(KernelError::InvalidArgument));
    }
    if dest.is_idle() {
        return Err(reject(KernelError::InvalidArgument));
    }

    let receiver = table
        .get_mut(dest)
        .filter(|p| p.state.is_alive())
        .ok_or_else(|| reject(KernelError::NoSuchProcess))?;
    if receiver.mailbox.len() >= MAX_QUEUE_DEPTH {
        return Err(reject(KernelError::ResourceExhausted));
    }

    receiver.mailbox.push_back(Message {
        sender,
        payload: data.to_vec(),
        timestamp: now,
    });
    let was_blocked = receiver.state == ProcessState::Blocked;

    SENT.fetch_add(1, Ordering::Relaxed);
    BYTES.fetch_add(data.len() as u64, Ordering::Relaxed);
    log_debug!(LOG_ORIGIN, "{} -> {}: {} bytes", sender, dest, data.len());
    Ok(was_blocked)
}

/// Pops the oldest message of `receiver` into `buf`. Returns the sender and
/// the number of bytes copied.
pub fn receive(table: &mut ProcessTable, receiver: Pid, buf: &mut [u8]) -> KernelResult<(Pid, usize)> {
    let process = table.get_mut(receiver).ok_or(KernelError::NoSuchProcess)?;
    let message = process.mailbox.pop_front().ok_or(KernelError::NoMessage)?;

    let len = message.payload.len().min(buf.len());
    buf[..len].copy_from_slice(&message.payload[..len]);

    RECEIVED.fetch_add(1, Ordering::Relaxed);
    Ok((message.sender, len))
}

pub fn pending(table: &ProcessTable, pid: Pid) -> usize {
    table.get(pid).map_or(0, |p| p.mailbox.len())
}

pub fn stats() -> IpcStats {
    IpcStats {
        sent: SENT.load(Ordering::Relaxed),
        received: RECEIVED.load(Ordering::Relaxed),
        rejected: REJECTED.load(Ordering::Relaxed),
        bytes: BYTES.load(Ordering::Relaxed),
    }
}
