//! Bounded event dispatch queue and its resource pools.
//!
//! Event cells and receive buffers are independent exhaustible resources.
//! Both are handed out as leases ([`CellPermit`], [`RecvBuffer`]) that
//! release in `Drop` and fire the manager's resource-available hook, so a
//! resource can never be freed twice or leak past its event.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use super::{Event, ResourceFreed};
use crate::error::{Error, ResourceKind, Result};

pub(crate) type ResourceHook = Arc<dyn Fn(ResourceFreed) + Send + Sync>;

/// Bounded counter for event cells.
pub(crate) struct CellPool {
    used: AtomicUsize,
    capacity: usize,
    high_water: AtomicUsize,
    hook: Mutex<Option<ResourceHook>>,
}

impl CellPool {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            used: AtomicUsize::new(0),
            capacity,
            high_water: AtomicUsize::new(0),
            hook: Mutex::new(None),
        })
    }

    fn try_reserve(self: &Arc<Self>) -> Result<CellPermit> {
        let reserved = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                if used < self.capacity {
                    Some(used + 1)
                } else {
                    None
                }
            });
        match reserved {
            Ok(prev) => {
                self.high_water.fetch_max(prev + 1, Ordering::Relaxed);
                Ok(CellPermit {
                    pool: self.clone(),
                })
            }
            Err(_) => Err(Error::OutOfResources(ResourceKind::EventQueue)),
        }
    }

    fn release(&self) {
        self.used.fetch_sub(1, Ordering::SeqCst);
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(ResourceFreed::QueueCellFreed);
        }
    }

    pub(crate) fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.used() < self.capacity
    }

    pub(crate) fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }
}

/// Lease on one event cell; releasing it wakes the OOR machinery.
pub struct CellPermit {
    pool: Arc<CellPool>,
}

impl Drop for CellPermit {
    fn drop(&mut self) {
        self.pool.release();
    }
}

/// Bounded pool of fixed-size receive buffers.
pub(crate) struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    outstanding: AtomicUsize,
    capacity: usize,
    buffer_size: usize,
    high_water: AtomicUsize,
    hook: Mutex<Option<ResourceHook>>,
}

impl BufferPool {
    fn new(capacity: usize, buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            capacity,
            buffer_size,
            high_water: AtomicUsize::new(0),
            hook: Mutex::new(None),
        })
    }

    fn try_reserve(self: &Arc<Self>) -> Result<RecvBuffer> {
        let reserved = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                if used < self.capacity {
                    Some(used + 1)
                } else {
                    None
                }
            });
        if reserved.is_err() {
            return Err(Error::OutOfResources(ResourceKind::ReceiveBuffers));
        }
        self.high_water
            .fetch_max(self.outstanding.load(Ordering::SeqCst), Ordering::Relaxed);

        // Reuse a returned buffer if one is available; buffers are created
        // lazily up to the pool capacity.
        let buf = self.free.lock().pop().unwrap_or_else(|| {
            let mut b = BytesMut::with_capacity(self.buffer_size);
            b.resize(self.buffer_size, 0);
            b
        });
        Ok(RecvBuffer {
            buf: Some(buf),
            len: 0,
            pool: self.clone(),
        })
    }

    fn release(&self, mut buf: BytesMut) {
        buf.resize(self.buffer_size, 0);
        self.free.lock().push(buf);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(ResourceFreed::ReadBufferFreed);
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.outstanding() < self.capacity
    }

    pub(crate) fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }
}

/// Lease on one pooled receive buffer.
///
/// Socket tasks write into the full slice and then record the received
/// length with [`set_len`](RecvBuffer::set_len); consumers read
/// [`data`](RecvBuffer::data). The buffer returns to the pool on drop.
pub struct RecvBuffer {
    buf: Option<BytesMut>,
    len: usize,
    pool: Arc<BufferPool>,
}

impl RecvBuffer {
    /// Received bytes
    pub fn data(&self) -> &[u8] {
        &self.buf.as_ref().expect("buffer leased")[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Full writable slice, sized to the pool's buffer size
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_mut().expect("buffer leased")
    }

    /// Capacity of the underlying buffer
    pub(crate) fn buffer_size(&self) -> usize {
        self.pool.buffer_size
    }

    pub(crate) fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.pool.buffer_size);
        self.len = len;
    }
}

impl Drop for RecvBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

/// An event plus the cell it occupies; dropping it frees the cell.
pub struct QueuedEvent {
    pub event: Event,
    // Dropped after `event`, so an attached receive buffer is released
    // before the cell.
    _cell: CellPermit,
}

struct QueueInner {
    tx: Mutex<Option<mpsc::UnboundedSender<QueuedEvent>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedEvent>>,
    cells: Arc<CellPool>,
    buffers: Arc<BufferPool>,
}

/// The dispatch queue between socket tasks and the worker pool.
///
/// The channel itself is unbounded; the cell pool is what bounds it, so
/// capacity is released when the consuming worker drops the event, not
/// when the event is merely received.
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<QueueInner>,
}

impl EventQueue {
    pub fn new(event_capacity: usize, buffer_capacity: usize, buffer_size: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(QueueInner {
                tx: Mutex::new(Some(tx)),
                rx: tokio::sync::Mutex::new(rx),
                cells: CellPool::new(event_capacity),
                buffers: BufferPool::new(buffer_capacity, buffer_size),
            }),
        }
    }

    /// Reserve one event cell, or fail with `OutOfResources`
    pub fn reserve_cell(&self) -> Result<CellPermit> {
        self.inner.cells.try_reserve()
    }

    /// Reserve one receive buffer, or fail with `OutOfResources`
    pub fn reserve_recv_buffer(&self) -> Result<RecvBuffer> {
        self.inner.buffers.try_reserve()
    }

    /// Enqueue an event. Non-blocking; this is the only call the socket
    /// side ever makes into the queue.
    pub fn tail(&self, event: Event, cell: CellPermit) -> Result<()> {
        let tx = self.inner.tx.lock().clone();
        match tx {
            Some(tx) => {
                trace!("tail event {:?}", event);
                tx.send(QueuedEvent { event, _cell: cell })
                    .map_err(|_| Error::IllegalAction("event queue closed"))
            }
            None => Err(Error::IllegalAction("event queue closed")),
        }
    }

    /// Re-enqueue a popped event without re-allocating its cell.
    pub(crate) fn retail(&self, event: QueuedEvent) -> Result<()> {
        let tx = self.inner.tx.lock().clone();
        match tx {
            Some(tx) => tx
                .send(event)
                .map_err(|_| Error::IllegalAction("event queue closed")),
            None => Err(Error::IllegalAction("event queue closed")),
        }
    }

    /// Await the next event. Returns `None` once the queue is closed and
    /// drained; each worker task loops on this.
    pub async fn pop(&self) -> Option<QueuedEvent> {
        let mut rx = self.inner.rx.lock().await;
        rx.recv().await
    }

    /// Close the queue; workers drain what is buffered and then exit.
    pub fn close(&self) {
        self.inner.tx.lock().take();
    }

    pub(crate) fn set_resource_hook(&self, hook: ResourceHook) {
        *self.inner.cells.hook.lock() = Some(hook.clone());
        *self.inner.buffers.hook.lock() = Some(hook);
    }

    pub(crate) fn cells(&self) -> &CellPool {
        &self.inner.cells
    }

    pub(crate) fn buffers(&self) -> &BufferPool {
        &self.inner.buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_pool_exhaustion_and_recovery() {
        let queue = EventQueue::new(2, 2, 128);

        let a = queue.reserve_cell().unwrap();
        let _b = queue.reserve_cell().unwrap();
        // Pool of two is now exhausted
        assert!(matches!(
            queue.reserve_cell(),
            Err(Error::OutOfResources(ResourceKind::EventQueue))
        ));

        // Freeing one in-flight cell makes the next reservation succeed
        drop(a);
        let c = queue.reserve_cell();
        assert!(c.is_ok());
        assert_eq!(queue.cells().used(), 2);
        assert_eq!(queue.cells().high_water(), 2);
    }

    #[test]
    fn test_buffer_pool_reuse() {
        let queue = EventQueue::new(4, 1, 64);

        let mut buf = queue.reserve_recv_buffer().unwrap();
        buf.as_mut_slice()[..5].copy_from_slice(b"hello");
        buf.set_len(5);
        assert_eq!(buf.data(), b"hello");

        assert!(queue.reserve_recv_buffer().is_err());
        drop(buf);

        // Returned buffer is reused and fully writable again
        let buf = queue.reserve_recv_buffer().unwrap();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.buffer_size(), 64);
        assert_eq!(queue.buffers().outstanding(), 1);
    }

    #[tokio::test]
    async fn test_tail_pop_fifo() {
        let queue = EventQueue::new(8, 8, 64);
        let recorder = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

        struct Step(std::sync::Arc<std::sync::atomic::AtomicUsize>);
        impl crate::events::ObjectEventHandler for Step {
            fn on_object_event(&self, param1: u32, _param2: u32) {
                // Events must arrive in tail order
                let seen = self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                assert_eq!(seen as u32, param1);
            }
        }

        for i in 0..3u32 {
            let cell = queue.reserve_cell().unwrap();
            let ev = crate::events::ObjectEvent::new(std::sync::Arc::new(Step(recorder.clone())), i, 0);
            queue.tail(Event::Object(ev), cell).unwrap();
        }
        for _ in 0..3 {
            let popped = queue.pop().await.unwrap();
            if let Event::Object(ev) = &popped.event {
                ev.invoke();
            }
        }
        assert_eq!(recorder.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = EventQueue::new(4, 4, 64);
        let cell = queue.reserve_cell().unwrap();
        let ev = crate::events::ObjectEvent::new(
            std::sync::Arc::new(NopHandler),
            0,
            0,
        );
        queue.tail(Event::Object(ev), cell).unwrap();
        queue.close();

        // Buffered event still delivered, then the queue reports closed
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
        assert!(queue.reserve_cell().is_ok());
        let cell = queue.reserve_cell().unwrap();
        let ev = crate::events::ObjectEvent::new(std::sync::Arc::new(NopHandler), 0, 0);
        assert!(queue.tail(Event::Object(ev), cell).is_err());
    }

    struct NopHandler;
    impl crate::events::ObjectEventHandler for NopHandler {
        fn on_object_event(&self, _param1: u32, _param2: u32) {}
    }
}
