//! Fixed-count packet buffer pools with typed per-buffer metadata.
//!
//! Two pools of identical element size carry TX and RX traffic; a small
//! scratch pool holds plaintext or ciphertext across a single AEAD call.
//! Allocation is non-blocking by contract for interrupt-context producers
//! (`try_alloc`), with bounded async waits for task-context callers.
//!
//! A buffer has exactly one owner at any instant: dropping it returns the
//! slot to its pool and wakes one waiter.

use crate::error::PacketError;
use crate::transport::InterfaceHandle;
use crate::types::{Auth, Destination, InterfaceAddress, InterfaceId, PacketType, Wait};
use bytes::BytesMut;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::{self, Instant};

/// Completion callback attached to a TX buffer, invoked exactly once by
/// `notify_tx_result` with the transport's send outcome.
pub type TxDone = Box<dyn FnOnce(&Result<(), PacketError>) + Send>;

/// Metadata attached to every receive buffer.
#[derive(Default)]
pub struct RxMeta {
    /// Handle of the transport that produced the buffer.
    pub interface: Option<InterfaceHandle>,
    pub interface_id: InterfaceId,
    pub address: InterfaceAddress,
    /// Signed link quality in dBm, 0 for wired transports.
    pub rssi: i8,
    // Fields below are populated by the codec after decryption.
    pub packet_type: PacketType,
    pub flags: u16,
    pub auth: Auth,
    pub sequence: u16,
    pub key_identifier: u32,
    pub gps_time: u32,
    pub device_id: u64,
}

/// Metadata attached to every transmit buffer.
#[derive(Default)]
pub struct TxMeta {
    pub packet_type: PacketType,
    pub flags: u16,
    pub auth: Auth,
    pub destination: Destination,
    /// Optional completion callback, run once the transport finishes.
    pub tx_done: Option<TxDone>,
    /// Filled in by the codec after framing.
    pub sequence: u16,
}

/// Direction-dependent metadata region of a packet buffer.
pub enum PacketMeta {
    Rx(RxMeta),
    Tx(TxMeta),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Tx,
    Rx,
}

struct PoolShared {
    kind: PoolKind,
    elem_size: usize,
    free: Mutex<Vec<usize>>,
    notify: Notify,
    capacity: usize,
    /// Fewest simultaneously-free buffers ever observed.
    low_water: AtomicUsize,
}

/// A fixed-count pool of packet buffers.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub fn new(kind: PoolKind, count: usize, elem_size: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                kind,
                elem_size,
                free: Mutex::new((0..count).collect()),
                notify: Notify::new(),
                capacity: count,
                low_water: AtomicUsize::new(count),
            }),
        }
    }

    /// Allocate without blocking. Safe to call from any context.
    pub fn try_alloc(&self) -> Option<PacketBuf> {
        let slot = {
            let mut free = self.shared.free.lock().unwrap();
            let slot = free.pop()?;
            let remaining = free.len();
            self.shared.low_water.fetch_min(remaining, Ordering::Relaxed);
            slot
        };
        let meta = match self.shared.kind {
            PoolKind::Rx => PacketMeta::Rx(RxMeta::default()),
            PoolKind::Tx => PacketMeta::Tx(TxMeta::default()),
        };
        Some(PacketBuf {
            data: BytesMut::with_capacity(self.shared.elem_size),
            meta,
            slot,
            limit: self.shared.elem_size,
            shared: self.shared.clone(),
        })
    }

    /// Allocate, waiting up to `wait` for a buffer to be freed.
    ///
    /// Returns `None` on exhaustion; pool exhaustion is a normal,
    /// non-fatal outcome and callers drop or retry.
    pub async fn alloc(&self, wait: Wait) -> Option<PacketBuf> {
        if let Some(buf) = self.try_alloc() {
            return Some(buf);
        }
        match wait {
            Wait::NoWait => None,
            Wait::Forever => loop {
                self.shared.notify.notified().await;
                if let Some(buf) = self.try_alloc() {
                    return Some(buf);
                }
            },
            Wait::For(d) => {
                let deadline = Instant::now() + d;
                loop {
                    let notified = self.shared.notify.notified();
                    if time::timeout_at(deadline, notified).await.is_err() {
                        return self.try_alloc();
                    }
                    if let Some(buf) = self.try_alloc() {
                        return Some(buf);
                    }
                }
            }
        }
    }

    /// Number of buffers currently free.
    pub fn free_count(&self) -> usize {
        self.shared.free.lock().unwrap().len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Fewest free buffers observed since construction.
    pub fn low_water(&self) -> usize {
        self.shared.low_water.load(Ordering::Relaxed)
    }

    pub fn elem_size(&self) -> usize {
        self.shared.elem_size
    }
}

/// A pooled packet buffer: payload bytes plus direction-typed metadata.
pub struct PacketBuf {
    data: BytesMut,
    meta: PacketMeta,
    slot: usize,
    limit: usize,
    shared: Arc<PoolShared>,
}

impl PacketBuf {
    pub fn data(&self) -> &BytesMut {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }

    /// Pool slot index; keys the TX side-table.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn meta(&self) -> &PacketMeta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut PacketMeta {
        &mut self.meta
    }

    /// RX metadata. Panics on a TX buffer; direction is fixed at the pool.
    pub fn rx(&self) -> &RxMeta {
        match &self.meta {
            PacketMeta::Rx(m) => m,
            PacketMeta::Tx(_) => panic!("TX buffer has no RX metadata"),
        }
    }

    pub fn rx_mut(&mut self) -> &mut RxMeta {
        match &mut self.meta {
            PacketMeta::Rx(m) => m,
            PacketMeta::Tx(_) => panic!("TX buffer has no RX metadata"),
        }
    }

    /// TX metadata. Panics on an RX buffer.
    pub fn tx(&self) -> &TxMeta {
        match &self.meta {
            PacketMeta::Tx(m) => m,
            PacketMeta::Rx(_) => panic!("RX buffer has no TX metadata"),
        }
    }

    pub fn tx_mut(&mut self) -> &mut TxMeta {
        match &mut self.meta {
            PacketMeta::Tx(m) => m,
            PacketMeta::Rx(_) => panic!("RX buffer has no TX metadata"),
        }
    }

    pub fn is_tx(&self) -> bool {
        matches!(self.meta, PacketMeta::Tx(_))
    }

    /// Writable bytes remaining before the current limit.
    pub fn tailroom(&self) -> usize {
        self.limit.saturating_sub(self.data.len())
    }

    /// Shrink the usable capacity, reserving tail bytes for a footer.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.min(self.shared.elem_size);
    }

    /// Restore the nominal pool element capacity.
    pub fn reset_limit(&mut self) {
        self.limit = self.shared.elem_size;
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Drop for PacketBuf {
    fn drop(&mut self) {
        let mut free = self.shared.free.lock().unwrap();
        free.push(self.slot);
        drop(free);
        self.shared.notify.notify_one();
    }
}

struct ScratchShared {
    free: Mutex<Vec<BytesMut>>,
    notify: Notify,
}

/// Pool of encryption scratch buffers.
///
/// Claimed with an infinite wait; callers hold the guard only across a
/// single encrypt or decrypt call.
#[derive(Clone)]
pub struct ScratchPool {
    shared: Arc<ScratchShared>,
}

impl ScratchPool {
    /// `count` is 1, or 2 when the RX and TX pipelines are split.
    pub fn new(count: usize, elem_size: usize) -> Self {
        Self {
            shared: Arc::new(ScratchShared {
                free: Mutex::new((0..count).map(|_| BytesMut::with_capacity(elem_size)).collect()),
                notify: Notify::new(),
            }),
        }
    }

    pub async fn claim(&self) -> ScratchGuard {
        loop {
            {
                let mut free = self.shared.free.lock().unwrap();
                if let Some(buf) = free.pop() {
                    return ScratchGuard {
                        buf: Some(buf),
                        shared: self.shared.clone(),
                    };
                }
            }
            self.shared.notify.notified().await;
        }
    }
}

/// Exclusive hold on one scratch buffer; cleared and returned on drop.
pub struct ScratchGuard {
    buf: Option<BytesMut>,
    shared: Arc<ScratchShared>,
}

impl Deref for ScratchGuard {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("scratch taken")
    }
}

impl DerefMut for ScratchGuard {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("scratch taken")
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            buf.clear();
            let mut free = self.shared.free.lock().unwrap();
            free.push(buf);
            drop(free);
            self.shared.notify.notify_one();
        }
    }
}
