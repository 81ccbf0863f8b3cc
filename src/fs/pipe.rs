//! Kernel-resident anonymous pipe (§3): a 4 KiB circular byte buffer shared
//! by reference-counted read/write endpoints. A reader blocked on an empty
//! pipe (§5 suspension points) is parked the same way
//! `drivers::console::read_line_blocking` parks a blocked console reader:
//! a waiter list woken by `scheduler::unblock` from the write side.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::process::Pid;
use crate::sync::IrqSpinLock;

const PIPE_BUFFER_SIZE: usize = 4096;

pub struct PipeInner {
    buffer: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    readers: usize,
    writers: usize,
    waiters: Vec<Pid>,
}

impl PipeInner {
    pub fn new() -> Arc<IrqSpinLock<Self>> {
        Arc::new(IrqSpinLock::new(PipeInner {
            buffer: vec![0; PIPE_BUFFER_SIZE],
            read_pos: 0,
            write_pos: 0,
            readers: 0,
            writers: 0,
            waiters: Vec::new(),
        }))
    }

    pub fn add_reader(&mut self) {
        self.readers += 1;
    }

    pub fn add_writer(&mut self) {
        self.writers += 1;
    }

    pub fn drop_reader(&mut self) {
        if self.readers > 0 {
            self.readers -= 1;
        }
    }

    /// The last writer closing must wake any reader blocked waiting for more
    /// bytes, so it can observe EOF (§5 "a reader blocked on a pipe whose
    /// sole writer exits receives EOF") instead of blocking forever.
    pub fn drop_writer(&mut self) {
        if self.writers > 0 {
            self.writers -= 1;
        }
        if self.writers == 0 {
            self.wake_waiters();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    pub fn is_full(&self) -> bool {
        (self.write_pos + 1) % PIPE_BUFFER_SIZE == self.read_pos
    }

    pub fn active_writers(&self) -> usize {
        self.writers
    }

    pub fn active_readers(&self) -> usize {
        self.readers
    }

    fn register_waiter(&mut self, pid: Pid) {
        self.waiters.push(pid);
    }

    fn wake_waiters(&mut self) {
        let waiters = core::mem::take(&mut self.waiters);
        for pid in waiters {
            crate::scheduler::unblock(pid);
        }
    }

    /// Read up to `buf.len()` bytes. Returns the number of bytes read.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut bytes_read = 0;
        while bytes_read < buf.len() && !self.is_empty() {
            buf[bytes_read] = self.buffer[self.read_pos];
            self.read_pos = (self.read_pos + 1) % PIPE_BUFFER_SIZE;
            bytes_read += 1;
        }
        bytes_read
    }

    /// Write up to `buf.len()` bytes, waking any blocked reader. Returns the
    /// number of bytes written.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let mut bytes_written = 0;
        while bytes_written < buf.len() && !self.is_full() {
            self.buffer[self.write_pos] = buf[bytes_written];
            self.write_pos = (self.write_pos + 1) % PIPE_BUFFER_SIZE;
            bytes_written += 1;
        }
        if bytes_written > 0 {
            self.wake_waiters();
        }
        bytes_written
    }
}

/// Block until the pipe has data or every writer has closed (EOF), then
/// drain up to `buf.len()` bytes. Mirrors `read_line_blocking`'s
/// lock/check/register-waiter/block shape exactly.
pub fn read_blocking(inner: &Arc<IrqSpinLock<PipeInner>>, buf: &mut [u8]) -> usize {
    loop {
        {
            let mut pipe = inner.lock();
            if !pipe.is_empty() || pipe.active_writers() == 0 {
                return pipe.read(buf);
            }
            pipe.register_waiter(crate::scheduler::current_pid());
        }
        crate::scheduler::block_current();
    }
}
