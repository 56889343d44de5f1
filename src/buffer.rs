//! Capacity-bounded byte buffers.
//!
//! [`RingBuffer`] is the plain ring: fixed capacity, filled from a reader and
//! drained into a writer. [`Buffer`] is the shared handle the socket wrappers
//! hold. Two connections of one proxied session hold clones of the same two
//! `Buffer`s with their roles swapped, so the bytes one side reads are the
//! bytes the other side writes ("buffer aliasing"); no relay copy is made.
//!
//! A `Buffer` notifies its [`BufferWatcher`]s on edges: when it goes from
//! empty to non-empty (`readable_et`) and from full to non-full
//! (`writable_et`). Connections use those edges to re-add write and read
//! interest on their event loop.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use crate::util::lock;

/// Outcome of [`RingBuffer::store_from`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stored {
    /// Bytes moved from the reader into the buffer.
    pub bytes: usize,
    /// The reader reported end of stream.
    pub eof: bool,
}

/// A fixed-capacity ring of bytes.
#[derive(Debug)]
pub struct RingBuffer {
    data: Box<[u8]>,
    start: usize,
    len: usize,
    closed: bool,
}

impl RingBuffer {
    pub fn allocate(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            len: 0,
            closed: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Space left for input. A closed buffer accepts nothing.
    pub fn free(&self) -> usize {
        if self.closed {
            0
        } else {
            self.data.len() - self.len
        }
    }

    pub fn used(&self) -> usize {
        self.len
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Forbid further input. Existing content can still be drained.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Release the backing storage. Idempotent.
    pub fn clean(&mut self) {
        self.data = Box::default();
        self.start = 0;
        self.len = 0;
    }

    /// Read from `reader` until the buffer is full, the reader would block,
    /// or the reader reports end of stream.
    pub fn store_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Stored> {
        let mut stored = Stored::default();
        while self.free() > 0 {
            let cap = self.data.len();
            let tail = (self.start + self.len) % cap;
            // free space is [tail, cap) until the content wraps, then [tail, start)
            let end = if self.start + self.len < cap { cap } else { self.start };
            match reader.read(&mut self.data[tail..end]) {
                Ok(0) => {
                    stored.eof = true;
                    break;
                }
                Ok(n) => {
                    self.len += n;
                    stored.bytes += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(stored)
    }

    /// Write buffered bytes into `writer` until the buffer is empty or the
    /// writer would block. Returns the number of bytes written.
    pub fn write_to<W: Write + ?Sized>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut written = 0;
        while self.len > 0 {
            let cap = self.data.len();
            let end = (self.start + self.len).min(cap);
            match writer.write(&self.data[self.start..end]) {
                Ok(0) => break,
                Ok(n) => {
                    self.consume(n);
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    /// Copy as much of `bytes` as fits. Returns the number of bytes stored.
    pub fn store(&mut self, bytes: &[u8]) -> usize {
        let mut reader = bytes;
        match self.store_from(&mut reader) {
            Ok(stored) => stored.bytes,
            Err(_) => 0,
        }
    }

    /// Move up to `out.len()` buffered bytes into `out`.
    pub fn fetch(&mut self, out: &mut [u8]) -> usize {
        let mut writer = io::Cursor::new(out);
        self.write_to(&mut writer).unwrap_or(0)
    }

    fn consume(&mut self, n: usize) {
        self.len -= n;
        self.start = if self.len == 0 { 0 } else { (self.start + n) % self.data.len() };
    }
}

/// Edge notifications from a shared [`Buffer`].
pub trait BufferWatcher: Send + Sync {
    /// The buffer went from empty to holding bytes.
    fn readable_et(&self) {}
    /// The buffer went from full to having free space.
    fn writable_et(&self) {}
}

struct Shared {
    ring: Mutex<RingBuffer>,
    watchers: Mutex<Vec<Arc<dyn BufferWatcher>>>,
}

/// A cloneable handle to a [`RingBuffer`] shared between connections.
///
/// Watchers are notified after the ring's lock has been released, so a
/// watcher may inspect the buffer again.
#[derive(Clone)]
pub struct Buffer {
    shared: Arc<Shared>,
}

impl Buffer {
    pub fn allocate(capacity: usize) -> Self {
        Self::from(RingBuffer::allocate(capacity))
    }

    pub fn capacity(&self) -> usize {
        lock(&self.shared.ring).capacity()
    }

    pub fn free(&self) -> usize {
        lock(&self.shared.ring).free()
    }

    pub fn used(&self) -> usize {
        lock(&self.shared.ring).used()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.ring).is_closed()
    }

    pub fn close(&self) {
        lock(&self.shared.ring).close();
    }

    pub fn clean(&self) {
        lock(&self.shared.ring).clean();
    }

    pub fn add_watcher(&self, watcher: Arc<dyn BufferWatcher>) {
        lock(&self.shared.watchers).push(watcher);
    }

    /// Whether two handles refer to the same underlying ring.
    pub fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn store_from<R: Read + ?Sized>(&self, reader: &mut R) -> io::Result<Stored> {
        self.mutate(|ring| ring.store_from(reader))
    }

    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> io::Result<usize> {
        self.mutate(|ring| ring.write_to(writer))
    }

    pub fn store(&self, bytes: &[u8]) -> usize {
        self.mutate(|ring| ring.store(bytes))
    }

    pub fn fetch(&self, out: &mut [u8]) -> usize {
        self.mutate(|ring| ring.fetch(out))
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut RingBuffer) -> T) -> T {
        let (result, became_readable, became_writable) = {
            let mut ring = lock(&self.shared.ring);
            let used_before = ring.used();
            let free_before = ring.free();
            let result = f(&mut ring);
            (
                result,
                used_before == 0 && ring.used() > 0,
                free_before == 0 && ring.free() > 0,
            )
        };
        if became_readable || became_writable {
            let watchers = lock(&self.shared.watchers).clone();
            for watcher in watchers {
                if became_readable {
                    watcher.readable_et();
                }
                if became_writable {
                    watcher.writable_et();
                }
            }
        }
        result
    }
}

impl From<RingBuffer> for Buffer {
    fn from(ring: RingBuffer) -> Self {
        Self {
            shared: Arc::new(Shared {
                ring: Mutex::new(ring),
                watchers: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = lock(&self.shared.ring);
        f.debug_struct("Buffer")
            .field("capacity", &ring.capacity())
            .field("used", &ring.used())
            .field("closed", &ring.is_closed())
            .finish()
    }
}
