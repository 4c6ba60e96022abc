//! Anonymous (POSIX) pipes.
//!
//! Each pipe has a 4 KiB ring buffer, separate read/write reference
//! counts, and two embedded wait headers: readers subscribe to one,
//! writers to the other. All blocking goes through the poll protocol;
//! this module is the reference consumer of `WaitHeader::notify`.
//!
//! Lifetime contract for the header pointers captured out of the table
//! lock: a caller doing I/O holds an open end, and a pipe is destroyed
//! only when both reference counts reach zero, so the headers outlive
//! every in-flight subscription.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::{MAX_PIPES, PIPE_BUF_SIZE};
use crate::error::{KernelError, Result};
use crate::poll::{PollEvents, WaitDescriptor, WaitHeader, WaitOutcome};
use crate::sync::spinlock::Spinlock;

struct Pipe {
    id: u32,
    buffer: VecDeque<u8>,
    /// Open read-end references.
    read_refs: u32,
    /// Open write-end references.
    write_refs: u32,
    /// Notified READABLE on data arrival, HANGUP on writer close.
    readers: WaitHeader,
    /// Notified WRITABLE on space, ERROR on reader close.
    writers: WaitHeader,
}

static PIPES: Spinlock<[Option<Box<Pipe>>; MAX_PIPES]> = Spinlock::new([const { None }; MAX_PIPES]);
static NEXT_PIPE_ID: AtomicU32 = AtomicU32::new(1);

fn find<'a>(table: &'a mut [Option<Box<Pipe>>; MAX_PIPES], id: u32) -> Option<&'a mut Pipe> {
    table
        .iter_mut()
        .find_map(|slot| slot.as_mut().filter(|p| p.id == id).map(|p| &mut **p))
}

/// Create a pipe with one read and one write reference.
pub fn create() -> Result<u32> {
    let id = NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed);
    let pipe = Box::new(Pipe {
        id,
        buffer: VecDeque::with_capacity(PIPE_BUF_SIZE),
        read_refs: 1,
        write_refs: 1,
        readers: WaitHeader::new(),
        writers: WaitHeader::new(),
    });
    let mut table = PIPES.lock();
    for slot in table.iter_mut() {
        if slot.is_none() {
            *slot = Some(pipe);
            return Ok(id);
        }
    }
    Err(KernelError::Exhausted)
}

/// Add a read-end reference (fork/dup).
pub fn incref_read(id: u32) {
    let mut table = PIPES.lock();
    if let Some(pipe) = find(&mut table, id) {
        pipe.read_refs += 1;
    }
}

/// Add a write-end reference (fork/dup).
pub fn incref_write(id: u32) {
    let mut table = PIPES.lock();
    if let Some(pipe) = find(&mut table, id) {
        pipe.write_refs += 1;
    }
}

/// Drop a read-end reference. The last one flags ERROR to blocked
/// writers (they will see EPIPE); the pipe dies when both sides are gone.
pub fn decref_read(id: u32) {
    let mut table = PIPES.lock();
    let slot = table
        .iter_mut()
        .find(|s| s.as_ref().map_or(false, |p| p.id == id));
    if let Some(slot) = slot {
        let pipe = slot.as_mut().expect("slot matched by id");
        pipe.read_refs = pipe.read_refs.saturating_sub(1);
        if pipe.read_refs == 0 {
            // Notify under the table lock: the pipe may be destroyed the
            // moment we release it.
            pipe.writers.notify(PollEvents::ERROR);
        }
        if pipe.read_refs == 0 && pipe.write_refs == 0 {
            *slot = None;
        }
    }
}

/// Drop a write-end reference. The last one flags HANGUP to blocked
/// readers (they will see EOF).
pub fn decref_write(id: u32) {
    let mut table = PIPES.lock();
    let slot = table
        .iter_mut()
        .find(|s| s.as_ref().map_or(false, |p| p.id == id));
    if let Some(slot) = slot {
        let pipe = slot.as_mut().expect("slot matched by id");
        pipe.write_refs = pipe.write_refs.saturating_sub(1);
        if pipe.write_refs == 0 {
            pipe.readers.notify(PollEvents::HANGUP);
        }
        if pipe.read_refs == 0 && pipe.write_refs == 0 {
            *slot = None;
        }
    }
}

enum ReadStep {
    Data(usize, *const WaitHeader),
    Eof,
    Block(*const WaitHeader),
}

/// Read up to `buf.len()` bytes. Blocks while the pipe is empty and
/// writers remain; `Ok(0)` is EOF.
pub fn read(id: u32, buf: &mut [u8]) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    loop {
        let step = {
            let mut table = PIPES.lock();
            let pipe = find(&mut table, id).ok_or(KernelError::NotFound)?;
            if !pipe.buffer.is_empty() {
                let n = buf.len().min(pipe.buffer.len());
                for b in buf[..n].iter_mut() {
                    *b = pipe.buffer.pop_front().expect("length checked above");
                }
                ReadStep::Data(n, &pipe.writers as *const WaitHeader)
            } else if pipe.write_refs == 0 {
                ReadStep::Eof
            } else {
                ReadStep::Block(&pipe.readers as *const WaitHeader)
            }
        };

        match step {
            ReadStep::Data(n, writers) => {
                // We freed buffer space; wake writers outside the lock.
                // SAFETY: see the module contract; we hold a read end.
                unsafe { &*writers }.notify(PollEvents::WRITABLE);
                return Ok(n);
            }
            ReadStep::Eof => return Ok(0),
            ReadStep::Block(readers) => {
                let mut d = WaitDescriptor::new(1)?;
                // SAFETY: see the module contract; we hold a read end.
                d.watch(0, unsafe { &*readers }, PollEvents::READABLE)?;
                // Re-check after subscribing: a write landing in between
                // notified an empty header.
                let ready = {
                    let mut table = PIPES.lock();
                    match find(&mut table, id) {
                        Some(p) => !p.buffer.is_empty() || p.write_refs == 0,
                        None => true,
                    }
                };
                let outcome = if ready { None } else { Some(d.wait(0)) };
                d.leave();
                if let Some(WaitOutcome::Interrupted) = outcome {
                    return Err(KernelError::Interrupted);
                }
            }
        }
    }
}

enum WriteStep {
    Wrote(*const WaitHeader),
    NoReaders,
    Block(*const WaitHeader),
}

/// Write all of `data`, blocking while the buffer is full and readers
/// remain. `BrokenPipe` if the read side is gone before the first byte.
pub fn write(id: u32, data: &[u8]) -> Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    let mut written = 0usize;
    loop {
        let step = {
            let mut table = PIPES.lock();
            let pipe = find(&mut table, id).ok_or(KernelError::NotFound)?;
            if pipe.read_refs == 0 {
                WriteStep::NoReaders
            } else {
                let space = PIPE_BUF_SIZE.saturating_sub(pipe.buffer.len());
                if space > 0 {
                    let n = (data.len() - written).min(space);
                    for &b in &data[written..written + n] {
                        pipe.buffer.push_back(b);
                    }
                    written += n;
                    WriteStep::Wrote(&pipe.readers as *const WaitHeader)
                } else {
                    WriteStep::Block(&pipe.writers as *const WaitHeader)
                }
            }
        };

        match step {
            WriteStep::NoReaders => {
                return if written > 0 {
                    Ok(written)
                } else {
                    Err(KernelError::BrokenPipe)
                };
            }
            WriteStep::Wrote(readers) => {
                // SAFETY: see the module contract; we hold a write end.
                unsafe { &*readers }.notify(PollEvents::READABLE);
                if written == data.len() {
                    return Ok(written);
                }
            }
            WriteStep::Block(writers) => {
                let mut d = WaitDescriptor::new(1)?;
                // SAFETY: see the module contract; we hold a write end.
                d.watch(0, unsafe { &*writers }, PollEvents::WRITABLE)?;
                let ready = {
                    let mut table = PIPES.lock();
                    match find(&mut table, id) {
                        Some(p) => p.buffer.len() < PIPE_BUF_SIZE || p.read_refs == 0,
                        None => true,
                    }
                };
                let outcome = if ready { None } else { Some(d.wait(0)) };
                d.leave();
                if let Some(WaitOutcome::Interrupted) = outcome {
                    return Err(KernelError::Interrupted);
                }
            }
        }
    }
}

/// Bytes currently buffered (non-blocking; 0 if the pipe is gone).
pub fn bytes_available(id: u32) -> usize {
    let mut table = PIPES.lock();
    find(&mut table, id).map_or(0, |p| p.buffer.len())
}

/// Current readiness of the read end, the pipe's poll hook.
pub fn poll_read_events(id: u32) -> PollEvents {
    let mut table = PIPES.lock();
    match find(&mut table, id) {
        Some(p) => {
            let mut ev = PollEvents::empty();
            if !p.buffer.is_empty() {
                ev |= PollEvents::READABLE;
            }
            if p.write_refs == 0 {
                ev |= PollEvents::HANGUP;
            }
            ev
        }
        None => PollEvents::ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::scheduler::{join, spawn};
    use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn write_then_read_roundtrip() {
        let id = create().unwrap();
        assert_eq!(write(id, b"hello"), Ok(5));
        assert_eq!(bytes_available(id), 5);
        let mut buf = [0u8; 16];
        assert_eq!(read(id, &mut buf), Ok(5));
        assert_eq!(&buf[..5], b"hello");
        decref_read(id);
        decref_write(id);
    }

    static BLOCKED_PIPE: AtomicU32 = AtomicU32::new(0);
    static BLOCKED_GOT: AtomicUsize = AtomicUsize::new(0);

    fn blocked_reader(_: usize) {
        let id = BLOCKED_PIPE.load(Ordering::SeqCst);
        let mut buf = [0u8; 8];
        let n = read(id, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        BLOCKED_GOT.store(n, Ordering::SeqCst);
    }

    #[test]
    fn empty_pipe_blocks_reader_until_write() {
        let id = create().unwrap();
        BLOCKED_PIPE.store(id, Ordering::SeqCst);
        let tid = spawn(blocked_reader, 0, 40, "reader");
        // Give the reader a moment to park on the empty pipe.
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(write(id, b"ping"), Ok(4));
        assert_eq!(join(tid), Some(0));
        assert_eq!(BLOCKED_GOT.load(Ordering::SeqCst), 4);
        decref_read(id);
        decref_write(id);
    }

    static EOF_PIPE: AtomicU32 = AtomicU32::new(0);
    static EOF_RESULT: AtomicUsize = AtomicUsize::new(usize::MAX);

    fn eof_reader(_: usize) {
        let id = EOF_PIPE.load(Ordering::SeqCst);
        let mut buf = [0u8; 8];
        EOF_RESULT.store(read(id, &mut buf).unwrap(), Ordering::SeqCst);
    }

    #[test]
    fn writer_close_wakes_reader_with_eof() {
        let id = create().unwrap();
        EOF_PIPE.store(id, Ordering::SeqCst);
        let tid = spawn(eof_reader, 0, 40, "eof-reader");
        std::thread::sleep(Duration::from_millis(5));
        decref_write(id);
        assert_eq!(join(tid), Some(0));
        assert_eq!(EOF_RESULT.load(Ordering::SeqCst), 0);
        assert!(poll_read_events(id).contains(PollEvents::HANGUP));
        decref_read(id);
    }

    #[test]
    fn write_without_readers_is_broken_pipe() {
        let id = create().unwrap();
        decref_read(id);
        assert_eq!(write(id, b"x"), Err(KernelError::BrokenPipe));
        decref_write(id);
    }

    static FULL_PIPE: AtomicU32 = AtomicU32::new(0);

    fn draining_reader(_: usize) {
        let id = FULL_PIPE.load(Ordering::SeqCst);
        let mut total = 0;
        let mut buf = [0u8; 1024];
        while total < PIPE_BUF_SIZE + 16 {
            total += read(id, &mut buf).unwrap();
        }
    }

    #[test]
    fn full_pipe_blocks_writer_until_drained() {
        let id = create().unwrap();
        FULL_PIPE.store(id, Ordering::SeqCst);
        // Fill to capacity, then write more than fits; the tail blocks
        // until the reader drains.
        let chunk = [0xA5u8; PIPE_BUF_SIZE];
        assert_eq!(write(id, &chunk), Ok(PIPE_BUF_SIZE));
        let tid = spawn(draining_reader, 0, 40, "drain");
        assert_eq!(write(id, &[1u8; 16]), Ok(16));
        assert_eq!(join(tid), Some(0));
        wait_until(|| bytes_available(id) == 0);
        decref_read(id);
        decref_write(id);
    }
}
