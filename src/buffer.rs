//! Acquisition buffer pool.
//!
//! The driver fills caller-owned buffers during acquisition; this module
//! owns those buffers. Slots are allocated with the 8-byte alignment the
//! transfer path requires, lent to the driver by `queue_all`, and come back
//! through `wait_filled`. Structural mutation (allocate, release) is
//! serialized by a pool-level lock; the blocking wait itself runs without
//! the lock so a concurrent flush or stop stays possible.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use crate::driver::{DeviceHandle, Driver, WaitOutcome};
use crate::error::{AndorError, CamResult};
use crate::log::CameraLog;

/// Alignment the driver requires for zero-copy transfer.
const BUFFER_ALIGN: usize = 8;

/// Default ceiling on the number of slots.
pub const DEFAULT_MAX_BUFFERS: usize = 32;

struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBuf {
    fn alloc(size: usize) -> CamResult<Self> {
        let layout = Layout::from_size_align(size, BUFFER_ALIGN)
            .map_err(|e| AndorError::Allocation(e.to_string()))?;
        // Zeroed so a short driver write never exposes stale bytes.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| AndorError::Allocation(format!("allocation of {size} bytes failed")))?;
        Ok(Self { ptr, layout })
    }

    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// The raw pointer is only ever dereferenced by the driver or through
// FilledBuffer; the pool lock serializes all bookkeeping.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

struct BufferSlot {
    buf: AlignedBuf,
    size: usize,
    queued: bool,
}

struct PoolInner {
    slots: Vec<BufferSlot>,
    per_buffer_bytes: usize,
}

/// Pool of aligned buffers lent to the driver during acquisition.
pub struct BufferPool {
    driver: Arc<dyn Driver>,
    log: CameraLog,
    inner: Mutex<PoolInner>,
    max_buffers: usize,
}

/// One buffer returned filled by the driver.
///
/// Borrows the pool, so the memory cannot be released while the view is
/// alive. Hand it back with [`BufferPool::requeue`] to continue streaming.
pub struct FilledBuffer<'a> {
    pool: &'a BufferPool,
    ptr: *mut u8,
    len: usize,
    size: usize,
}

impl<'a> FilledBuffer<'a> {
    /// Valid bytes written by the driver.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// Number of valid bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the driver wrote no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl BufferPool {
    /// Empty pool using the default slot ceiling.
    pub fn new(driver: Arc<dyn Driver>, log: CameraLog) -> Self {
        Self {
            driver,
            log,
            inner: Mutex::new(PoolInner {
                slots: Vec::new(),
                per_buffer_bytes: 0,
            }),
            max_buffers: DEFAULT_MAX_BUFFERS,
        }
    }

    /// Set the slot ceiling. Takes effect on the next `allocate`.
    pub fn set_max_buffers(&mut self, max: usize) {
        self.max_buffers = max;
    }

    /// Configured slot ceiling.
    pub fn max_buffers(&self) -> usize {
        self.max_buffers
    }

    /// Number of slots currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.slots.len()).unwrap_or(0)
    }

    /// True when no slots are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-slot size of the current allocation, zero when empty.
    pub fn per_buffer_bytes(&self) -> usize {
        self.inner.lock().map(|i| i.per_buffer_bytes).unwrap_or(0)
    }

    /// Slot start addresses, for callers that track identity.
    pub fn slot_addresses(&self) -> Vec<usize> {
        self.inner
            .lock()
            .map(|i| i.slots.iter().map(|s| s.buf.as_ptr() as usize).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> CamResult<std::sync::MutexGuard<'_, PoolInner>> {
        self.inner
            .lock()
            .map_err(|_| AndorError::Allocation("buffer pool lock poisoned".into()))
    }

    /// Bring the pool to `requested_count` slots of `per_buffer_bytes`
    /// each, capped at the configured maximum.
    ///
    /// Same shape as the current allocation is a no-op. A count change at
    /// the same size touches only the slots it adds; a smaller request
    /// keeps the surplus, queued state intact. A size change reallocates
    /// every slot. A request of zero slots is an error.
    ///
    /// Slots above the configured maximum are released, unqueued ones
    /// only; a buffer lent to the driver stays until flushed.
    pub fn allocate(&mut self, requested_count: usize, per_buffer_bytes: usize) -> CamResult<()> {
        if requested_count == 0 {
            return Err(AndorError::Allocation("requested zero buffers".into()));
        }
        if per_buffer_bytes == 0 {
            return Err(AndorError::Allocation("requested zero-byte buffers".into()));
        }
        let effective = requested_count.min(self.max_buffers);
        let mut inner = self.lock()?;

        if inner.per_buffer_bytes != per_buffer_bytes {
            inner.slots.clear();
            inner.per_buffer_bytes = per_buffer_bytes;
        }
        let mut i = inner.slots.len();
        while i > 0 && inner.slots.len() > self.max_buffers {
            i -= 1;
            if !inner.slots[i].queued {
                inner.slots.remove(i);
            }
        }
        while inner.slots.len() < effective {
            let buf = AlignedBuf::alloc(per_buffer_bytes)?;
            inner.slots.push(BufferSlot {
                buf,
                size: per_buffer_bytes,
                queued: false,
            });
        }
        self.log.info(&format!(
            "buffer pool at {} slot(s) of {} byte(s)",
            inner.slots.len(),
            per_buffer_bytes
        ));
        Ok(())
    }

    /// Hand every unqueued slot to the driver.
    ///
    /// A queuing failure for one slot fails the whole call; slots queued
    /// before the failure stay lent out.
    pub fn queue_all(&self, handle: DeviceHandle) -> CamResult<()> {
        let mut inner = self.lock()?;
        for slot in inner.slots.iter_mut().filter(|s| !s.queued) {
            match self.driver.queue_buffer(handle, slot.buf.as_ptr(), slot.size) {
                Ok(()) => slot.queued = true,
                Err(AndorError::Sdk { code, .. }) => {
                    let call = format!(
                        "AT_QueueBuffer({handle}, {:p}, {})",
                        slot.buf.as_ptr(),
                        slot.size
                    );
                    let err = AndorError::sdk(code, call);
                    self.log.error(&err.to_string());
                    return Err(err);
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    /// Block up to `timeout_ms` for the driver to return one filled
    /// buffer. `None` means the timeout expired; no slot is consumed.
    pub fn wait_filled(&self, handle: DeviceHandle, timeout_ms: u32) -> CamResult<Option<FilledBuffer<'_>>> {
        // Deliberately not holding the pool lock across the blocking call.
        match self.driver.wait_buffer(handle, timeout_ms)? {
            WaitOutcome::TimedOut => Ok(None),
            WaitOutcome::Filled { ptr, len } => {
                let mut inner = self.lock()?;
                let size = match inner
                    .slots
                    .iter_mut()
                    .find(|s| s.buf.as_ptr() == ptr)
                {
                    Some(slot) => {
                        slot.queued = false;
                        slot.size
                    }
                    None => {
                        // The driver returned a buffer this pool never
                        // queued; surface it anyway with its reported length.
                        self.log
                            .error(&format!("AT_WaitBuffer({handle}) returned unknown buffer {ptr:p}"));
                        len
                    }
                };
                Ok(Some(FilledBuffer {
                    pool: self,
                    ptr,
                    len,
                    size,
                }))
            }
        }
    }

    /// Return a filled buffer to the driver's queue.
    pub fn requeue(&self, handle: DeviceHandle, filled: FilledBuffer<'_>) -> CamResult<()> {
        debug_assert!(std::ptr::eq(filled.pool, self));
        self.driver.queue_buffer(handle, filled.ptr, filled.size)?;
        let mut inner = self.lock()?;
        if let Some(slot) = inner.slots.iter_mut().find(|s| s.buf.as_ptr() == filled.ptr) {
            slot.queued = true;
        }
        Ok(())
    }

    /// Ask the driver to return every outstanding buffer unfilled.
    pub fn flush(&self, handle: DeviceHandle) -> CamResult<()> {
        self.driver.flush(handle)?;
        let mut inner = self.lock()?;
        for slot in inner.slots.iter_mut() {
            slot.queued = false;
        }
        Ok(())
    }

    /// Flush outstanding buffers and release the pool's memory.
    ///
    /// Safe no-op when nothing was ever allocated. A flush failure is
    /// logged; the memory is released regardless.
    pub fn flush_and_release(&mut self, handle: Option<DeviceHandle>) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.slots.is_empty() {
            return;
        }
        if let Some(handle) = handle {
            if let Err(err) = self.driver.flush(handle) {
                self.log
                    .error(&format!("AT_Flush({handle}) during release: {err}"));
            }
        }
        inner.slots.clear();
        inner.per_buffer_bytes = 0;
        self.log.info("buffer pool released");
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::mock::MockDriver;

    fn pool_with_device() -> (Arc<MockDriver>, DeviceHandle, BufferPool) {
        let driver = Arc::new(MockDriver::new());
        let handle = driver.open(0).unwrap();
        let pool = BufferPool::new(driver.clone(), CameraLog::new());
        (driver, handle, pool)
    }

    #[test]
    fn zero_requests_fail() {
        let (_d, _h, mut pool) = pool_with_device();
        assert!(matches!(
            pool.allocate(0, 1024),
            Err(AndorError::Allocation(_))
        ));
        assert!(matches!(
            pool.allocate(4, 0),
            Err(AndorError::Allocation(_))
        ));
        assert!(pool.is_empty());
    }

    #[test]
    fn requests_above_the_ceiling_are_truncated() {
        let (_d, _h, mut pool) = pool_with_device();
        pool.set_max_buffers(4);
        pool.allocate(100, 512).unwrap();
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn lowering_the_ceiling_trims_surplus_slots() {
        let (_d, _h, mut pool) = pool_with_device();
        pool.allocate(5, 1024).unwrap();
        let before = pool.slot_addresses();
        pool.set_max_buffers(2);
        pool.allocate(5, 1024).unwrap();
        assert_eq!(pool.len(), 2);
        assert!(pool.len() <= pool.max_buffers());
        assert_eq!(pool.slot_addresses(), &before[..2]);
    }

    #[test]
    fn queued_slots_survive_a_lowered_ceiling() {
        let (_d, handle, mut pool) = pool_with_device();
        pool.allocate(3, 1024).unwrap();
        pool.queue_all(handle).unwrap();
        pool.set_max_buffers(1);
        pool.allocate(1, 1024).unwrap();
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn identical_allocate_is_a_no_op() {
        let (_d, _h, mut pool) = pool_with_device();
        pool.allocate(3, 1024).unwrap();
        let before = pool.slot_addresses();
        pool.allocate(3, 1024).unwrap();
        assert_eq!(pool.slot_addresses(), before);
    }

    #[test]
    fn growing_keeps_existing_slots() {
        let (_d, _h, mut pool) = pool_with_device();
        pool.allocate(2, 1024).unwrap();
        let before = pool.slot_addresses();
        pool.allocate(5, 1024).unwrap();
        assert_eq!(pool.len(), 5);
        assert_eq!(&pool.slot_addresses()[..2], &before[..]);
    }

    #[test]
    fn size_change_reallocates_every_slot() {
        let (_d, _h, mut pool) = pool_with_device();
        pool.allocate(3, 1024).unwrap();
        pool.allocate(3, 2048).unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.per_buffer_bytes(), 2048);
    }

    #[test]
    fn slots_are_eight_byte_aligned() {
        let (_d, _h, mut pool) = pool_with_device();
        pool.allocate(4, 100).unwrap();
        assert!(pool.slot_addresses().iter().all(|a| a % 8 == 0));
    }

    #[test]
    fn queue_wait_roundtrip_returns_filled_data() {
        let (driver, handle, mut pool) = pool_with_device();
        pool.allocate(2, 256).unwrap();
        pool.queue_all(handle).unwrap();
        driver.issue_command(handle, "AcquisitionStart").unwrap();

        let filled = pool.wait_filled(handle, 1000).unwrap().expect("a frame");
        assert_eq!(filled.len(), 256);
        pool.requeue(handle, filled).unwrap();

        driver.issue_command(handle, "AcquisitionStop").unwrap();
    }

    #[test]
    fn wait_without_acquisition_times_out_as_none() {
        let (_driver, handle, mut pool) = pool_with_device();
        pool.allocate(1, 128).unwrap();
        pool.queue_all(handle).unwrap();
        assert!(pool.wait_filled(handle, 10).unwrap().is_none());
    }

    #[test]
    fn release_when_never_allocated_is_a_no_op() {
        let (_d, handle, mut pool) = pool_with_device();
        pool.flush_and_release(Some(handle));
        assert!(pool.is_empty());
    }
}
