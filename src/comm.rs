//! Communication abstraction for serial, intra-process, and MPI execution.
//!
//! The refinement driver needs three things from its communicator: a rank
//! prefix sum for global vertex numbering, an all-reduce for propagation
//! termination detection, and point-to-point exchange for halo updates.
//!
//! Wire conventions: integer payloads are little-endian fixed width and cast
//! with `bytemuck`; receivers truncate to their posted buffer length.
//!
//! Backends:
//! - [`NoComm`]: single-rank no-op, for serial runs and unit tests.
//! - [`RayonComm`]: shared-memory mailbox, one thread per rank, for
//!   multi-rank tests inside one process.
//! - `MpiComm` (behind the `mpi-support` feature): delegates to `rsmpi`.

use once_cell::sync::Lazy;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::RefineError;

/// Message tags reserved by the refinement driver.
pub(crate) mod tags {
    /// Halo ghost-value exchange.
    pub const HALO: u16 = 1;
    /// Rank prefix-sum ring.
    pub const SCAN: u16 = 2;
    /// All-reduce, accumulation leg.
    pub const REDUCE_UP: u16 = 3;
    /// All-reduce, broadcast leg.
    pub const REDUCE_DOWN: u16 = 4;
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Non-blocking communication interface plus the two collectives the
/// refinement driver relies on.
pub trait Communicator: Send + Sync {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// Rank of this process (0..size-1).
    fn rank(&self) -> usize;
    /// Total number of ranks.
    fn size(&self) -> usize;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u16, len: usize) -> Self::RecvHandle;

    /// Inclusive prefix sum over ranks: rank r receives `sum(values[0..=r])`.
    fn scan_sum(&self, value: u64) -> Result<u64, RefineError>;

    /// Global sum, result available on every rank.
    fn allreduce_sum(&self, value: i64) -> Result<i64, RefineError>;

    /// Synchronization barrier (default: no-op for non-MPI comms).
    fn barrier(&self) {}
}

fn decode_u64(bytes: &[u8]) -> Result<u64, RefineError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| RefineError::Communicator(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_le_bytes(arr))
}

// --- NoComm: compile-time no-op for single-rank runs ---

/// Single-rank communicator; every collective is the identity.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _len: usize) {}

    fn scan_sum(&self, value: u64) -> Result<u64, RefineError> {
        Ok(value)
    }

    fn allreduce_sum(&self, value: i64) -> Result<i64, RefineError> {
        Ok(value)
    }
}

// --- RayonComm: intra-process, one thread per rank ---

type Key = (usize, usize, u16); // (src, dst, tag)

#[derive(Default)]
struct Slot {
    q: VecDeque<Vec<u8>>,
}

struct Mailbox {
    map: Mutex<HashMap<Key, Arc<(Mutex<Slot>, Condvar)>>>,
}

static MAILBOX: Lazy<Mailbox> = Lazy::new(|| Mailbox {
    map: Mutex::new(HashMap::new()),
});

fn mailbox_entry(key: Key) -> Arc<(Mutex<Slot>, Condvar)> {
    let mut g = MAILBOX.map.lock().expect("MAILBOX poisoned");
    g.entry(key)
        .or_insert_with(|| Arc::new((Mutex::new(Slot::default()), Condvar::new())))
        .clone()
}

pub struct LocalSendHandle;

impl Wait for LocalSendHandle {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

pub struct LocalRecvHandle {
    cell: Arc<(Mutex<Slot>, Condvar)>,
    want_len: usize,
}

impl Wait for LocalRecvHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let (lock, cv) = &*self.cell;
        let mut slot = lock.lock().expect("Slot poisoned");
        while slot.q.is_empty() {
            slot = cv.wait(slot).expect("Condvar poisoned");
        }
        let mut msg = slot.q.pop_front().expect("q non-empty");
        msg.truncate(self.want_len.min(msg.len()));
        Some(msg)
    }
}

/// Shared-memory communicator where each participating thread plays one rank.
///
/// All instances in a process share one mailbox; concurrent communicator
/// groups must use distinct `tag_shift` values to keep their traffic apart.
/// `barrier` is a no-op: the collectives are themselves synchronizing.
#[derive(Clone, Debug)]
pub struct RayonComm {
    rank: usize,
    size: usize,
    tag_shift: u16,
}

impl RayonComm {
    pub fn new(rank: usize, size: usize) -> Self {
        Self::with_tag_shift(rank, size, 0)
    }

    /// Communicator group isolated from others by a tag offset.
    pub fn with_tag_shift(rank: usize, size: usize, tag_shift: u16) -> Self {
        Self {
            rank,
            size,
            tag_shift,
        }
    }

    fn shifted(&self, tag: u16) -> u16 {
        tag.wrapping_add(self.tag_shift)
    }

    fn send_u64(&self, peer: usize, tag: u16, value: u64) {
        let _ = self.isend(peer, tag, &value.to_le_bytes()).wait();
    }

    fn recv_u64(&self, peer: usize, tag: u16) -> Result<u64, RefineError> {
        let bytes = self
            .irecv(peer, tag, 8)
            .wait()
            .ok_or_else(|| RefineError::Communicator("empty collective message".into()))?;
        decode_u64(&bytes)
    }
}

impl Communicator for RayonComm {
    type SendHandle = LocalSendHandle;
    type RecvHandle = LocalRecvHandle;

    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        let key = (self.rank, peer, self.shifted(tag));
        let entry = mailbox_entry(key);
        let (lock, cv) = &*entry;
        {
            let mut slot = lock.lock().expect("Slot poisoned");
            slot.q.push_back(buf.to_vec());
        }
        cv.notify_all();
        LocalSendHandle
    }

    fn irecv(&self, peer: usize, tag: u16, len: usize) -> Self::RecvHandle {
        let key = (peer, self.rank, self.shifted(tag));
        LocalRecvHandle {
            cell: mailbox_entry(key),
            want_len: len,
        }
    }

    fn scan_sum(&self, value: u64) -> Result<u64, RefineError> {
        let mut acc = value;
        if self.rank > 0 {
            acc = acc.wrapping_add(self.recv_u64(self.rank - 1, tags::SCAN)?);
        }
        if self.rank + 1 < self.size {
            self.send_u64(self.rank + 1, tags::SCAN, acc);
        }
        Ok(acc)
    }

    fn allreduce_sum(&self, value: i64) -> Result<i64, RefineError> {
        // Accumulate up the rank ring, then broadcast the total back down.
        let mut acc = value;
        if self.rank > 0 {
            acc = acc.wrapping_add(self.recv_u64(self.rank - 1, tags::REDUCE_UP)? as i64);
        }
        let total = if self.rank + 1 < self.size {
            self.send_u64(self.rank + 1, tags::REDUCE_UP, acc as u64);
            self.recv_u64(self.rank + 1, tags::REDUCE_DOWN)? as i64
        } else {
            acc
        };
        if self.rank > 0 {
            self.send_u64(self.rank - 1, tags::REDUCE_DOWN, total as u64);
        }
        Ok(total)
    }
}

// --- MPI backend ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::collective::{CommunicatorCollectives, SystemOperation};
    use mpi::environment::Universe;
    use mpi::point_to_point::{Destination, Source};
    use mpi::request::{Request, StaticScope};
    use mpi::topology::{Communicator as _, SimpleCommunicator};
    use std::mem::ManuallyDrop;

    type ByteRequest = Request<'static, [u8], StaticScope>;

    /// Heap buffer registered with an immediate MPI operation. The slice
    /// handed to MPI must stay valid until the request completes, so the
    /// buffer is leaked at construction and reclaimed exactly once, either
    /// through [`TransferBuf::reclaim`] or on drop.
    struct TransferBuf(*mut [u8]);

    unsafe impl Send for TransferBuf {}

    impl TransferBuf {
        fn new(data: Vec<u8>) -> Self {
            Self(Box::into_raw(data.into_boxed_slice()))
        }

        /// # Safety
        /// The returned slice aliases the buffer. It must not be used after
        /// `self` is reclaimed or dropped.
        unsafe fn registered(&self) -> &'static [u8] {
            &*self.0
        }

        /// # Safety
        /// As for [`TransferBuf::registered`], and no other view of the
        /// buffer may exist while this one is live.
        unsafe fn registered_mut(&mut self) -> &'static mut [u8] {
            &mut *self.0
        }

        fn reclaim(self) -> Vec<u8> {
            let this = ManuallyDrop::new(self);
            Vec::from(unsafe { Box::from_raw(this.0) })
        }
    }

    impl Drop for TransferBuf {
        fn drop(&mut self) {
            drop(unsafe { Box::from_raw(self.0) });
        }
    }

    /// Finish an outstanding request. Handles call this before their buffer
    /// is freed, so an unwaited handle blocks in `Drop` rather than freeing
    /// memory MPI may still touch.
    fn complete(req: &mut Option<ByteRequest>) {
        if let Some(req) = req.take() {
            let _ = req.wait();
        }
    }

    /// MPI communicator over `MPI_COMM_WORLD`. Holds the universe so the
    /// environment is finalised when the last handle goes away.
    pub struct MpiComm {
        _universe: Universe,
        world: SimpleCommunicator,
    }

    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    impl Default for MpiComm {
        fn default() -> Self {
            let universe = mpi::initialize().expect("MPI is already initialized");
            let world = universe.world();
            Self {
                _universe: universe,
                world,
            }
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn rank(&self) -> usize {
            self.world.rank() as usize
        }

        fn size(&self) -> usize {
            self.world.size() as usize
        }

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
            let transfer = TransferBuf::new(buf.to_vec());
            let req = self.world.process_at_rank(peer as i32).immediate_send_with_tag(
                StaticScope,
                unsafe { transfer.registered() },
                tag as i32,
            );
            MpiSendHandle {
                req: Some(req),
                _buf: transfer,
            }
        }

        fn irecv(&self, peer: usize, tag: u16, len: usize) -> Self::RecvHandle {
            let mut transfer = TransferBuf::new(vec![0u8; len]);
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(
                    StaticScope,
                    unsafe { transfer.registered_mut() },
                    tag as i32,
                );
            MpiRecvHandle {
                req: Some(req),
                buf: Some(transfer),
                len,
            }
        }

        fn scan_sum(&self, value: u64) -> Result<u64, RefineError> {
            let mut out = 0u64;
            self.world.scan_into(&value, &mut out, SystemOperation::sum());
            Ok(out)
        }

        fn allreduce_sum(&self, value: i64) -> Result<i64, RefineError> {
            let mut out = 0i64;
            self.world
                .all_reduce_into(&value, &mut out, SystemOperation::sum());
            Ok(out)
        }

        fn barrier(&self) {
            self.world.barrier();
        }
    }

    pub struct MpiSendHandle {
        req: Option<ByteRequest>,
        _buf: TransferBuf,
    }

    impl Wait for MpiSendHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            complete(&mut self.req);
            None
        }
    }

    impl Drop for MpiSendHandle {
        fn drop(&mut self) {
            complete(&mut self.req);
        }
    }

    pub struct MpiRecvHandle {
        req: Option<ByteRequest>,
        buf: Option<TransferBuf>,
        len: usize,
    }

    impl Wait for MpiRecvHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            complete(&mut self.req);
            let mut data = self.buf.take()?.reclaim();
            data.truncate(self.len);
            Some(data)
        }
    }

    impl Drop for MpiRecvHandle {
        fn drop(&mut self) {
            complete(&mut self.req);
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
