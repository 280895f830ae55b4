use std::{
    alloc::Layout,
    ptr::NonNull,
    sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
};

use crate::RingError;

/// Fixed size of one ring node, power of two.
pub const NODE_SIZE: usize = 128;
const NODE_SIZE_LOG2: usize = NODE_SIZE.trailing_zeros() as usize;

/// The channel head occupies the first 4 KiB of the region; the rest
/// is `node_heads[N]` followed by `node_data[N]`.
const CHANNEL_HEAD_SIZE: usize = 4096;
const HEAD_ALIGN: usize = 64;

const NODE_HEAD_SIZE: usize = std::mem::size_of::<NodeHead>();
const BLOCK_HEAD_SIZE: usize = std::mem::size_of::<BlockHead>();

const FLAG_WRITTEN: u32 = 0x0000_0001;
const FLAG_START_NODE: u32 = 0x0000_0002;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RingConf {
    /// Nodes kept free as a guard band between writers and the reader.
    /// Zero picks a default of 1% of the ring.
    pub protect_node_count: usize,
    /// Alternative way to express the guard band, in bytes.
    pub protect_memory_size: usize,
    /// How long the reader waits on an unfinished write before it
    /// discards the slot.
    pub write_timeout_ms: u64,
}

impl Default for RingConf {
    fn default() -> Self {
        Self { protect_node_count: 0, protect_memory_size: 0, write_timeout_ms: 8 }
    }
}

/// Corruption/recovery counters, maintained by the consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    pub block_bad_count: usize,
    pub block_timeout_count: usize,
    pub node_bad_count: usize,
}

#[repr(C, align(64))]
struct ChannelHead {
    node_size: usize,
    node_size_log2: usize,
    node_count: usize,

    // [read_cur, write_cur) are the claimed nodes; write_cur always
    // points at a free node, so one node of slack separates full from
    // empty.
    read_cur: AtomicUsize,
    write_cur: AtomicUsize,

    // Consumer-owned: when it first observed an unfinished write.
    first_failed_writing_time: AtomicU64,

    operation_seq: AtomicU32,

    conf: RingConf,

    block_bad_count: AtomicUsize,
    block_timeout_count: AtomicUsize,
    node_bad_count: AtomicUsize,
}

#[repr(C)]
struct NodeHead {
    flag: AtomicU32,
    seq: AtomicU32,
}

/// Prefix of a message in its first node's data area.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct BlockHead {
    buffer_size: u64,
    fast_check: u64,
}

/// DJB-style polynomial over word chunks. Corruption detection under
/// torn writes, not adversarial integrity.
fn fast_check(data: &[u8]) -> u64 {
    const SEED: u64 = 0x1505_1505_1505_1505;
    const PAD: u32 = 40;

    let mut ret = SEED;
    let mut chunks = data.chunks_exact(8);
    for c in &mut chunks {
        let word = u64::from_ne_bytes(c.try_into().expect("8-byte chunk"));
        ret = (ret << PAD).wrapping_add(ret).wrapping_add(word);
    }

    let mut tail = [0u8; 8];
    tail[..chunks.remainder().len()].copy_from_slice(chunks.remainder());
    (ret << PAD).wrapping_add(ret).wrapping_add(u64::from_ne_bytes(tail))
}

/// Non-owning view of a ring channel laid out over a fixed region.
///
/// Any number of writers may `send` concurrently from any process
/// mapping the region; exactly one consumer per channel may `recv`.
/// Writers that crash mid-write are salvaged by the consumer via the
/// WRITTEN-flag-last discipline, the per-write sequence stamps and the
/// write timeout.
#[derive(Clone, Copy, Debug)]
pub struct RingChannel {
    head: NonNull<ChannelHead>,
}

unsafe impl Send for RingChannel {}
unsafe impl Sync for RingChannel {}

impl RingChannel {
    /// Lay out a fresh channel over `len` bytes at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes, aligned
    /// to 64, and must stay mapped for the lifetime of every view.
    pub unsafe fn init(ptr: *mut u8, len: usize, conf: Option<RingConf>) -> Result<Self, RingError> {
        if ptr.is_null() || ptr as usize % HEAD_ALIGN != 0 {
            return Err(RingError::Params);
        }
        if len < CHANNEL_HEAD_SIZE + NODE_SIZE + NODE_HEAD_SIZE {
            return Err(RingError::SizeTooSmall);
        }

        unsafe {
            std::ptr::write_bytes(ptr, 0, len);

            let head = &mut *ptr.cast::<ChannelHead>();
            head.node_size = NODE_SIZE;
            head.node_size_log2 = NODE_SIZE_LOG2;
            head.node_count = (len - CHANNEL_HEAD_SIZE) / (NODE_SIZE + NODE_HEAD_SIZE);
            head.conf = default_conf(conf, head.node_count);
        }

        Ok(Self { head: NonNull::new(ptr.cast()).expect("checked non-null") })
    }

    /// Attach to a channel another mapping already initialized.
    ///
    /// # Safety
    /// Same region contract as [`init`](Self::init).
    pub unsafe fn attach(ptr: *mut u8, len: usize) -> Result<Self, RingError> {
        if ptr.is_null() || ptr as usize % HEAD_ALIGN != 0 {
            return Err(RingError::Params);
        }
        if len < CHANNEL_HEAD_SIZE + NODE_SIZE + NODE_HEAD_SIZE {
            return Err(RingError::SizeTooSmall);
        }

        let chan = Self { head: NonNull::new(ptr.cast()).expect("checked non-null") };
        let head = chan.head();
        let occupied = head
            .node_count
            .checked_mul(NODE_HEAD_SIZE + head.node_size)
            .and_then(|n| n.checked_add(CHANNEL_HEAD_SIZE));
        if head.node_count == 0
            || !head.node_size.is_power_of_two()
            || head.node_size != 1 << head.node_size_log2
            || occupied.is_none_or(|n| n > len)
        {
            return Err(RingError::Params);
        }

        Ok(chan)
    }

    #[inline]
    fn head(&self) -> &ChannelHead {
        unsafe { self.head.as_ref() }
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.head.as_ptr().cast()
    }

    #[inline]
    fn node_head(&self, idx: usize) -> &NodeHead {
        debug_assert!(idx < self.head().node_count);
        unsafe { &*self.base().add(CHANNEL_HEAD_SIZE + idx * NODE_HEAD_SIZE).cast::<NodeHead>() }
    }

    #[inline]
    fn data_ptr(&self, idx: usize) -> *mut u8 {
        let head = self.head();
        debug_assert!(idx < head.node_count);
        unsafe {
            self.base()
                .add(CHANNEL_HEAD_SIZE + head.node_count * NODE_HEAD_SIZE + idx * head.node_size)
        }
    }

    #[inline]
    fn calc_node_count(&self, len: usize) -> usize {
        (len + BLOCK_HEAD_SIZE + NODE_SIZE - 1) >> self.head().node_size_log2
    }

    fn fetch_operation_seq(&self) -> u32 {
        let head = self.head();
        let mut cur = head.operation_seq.load(Ordering::Relaxed);
        loop {
            // zero means "unclaimed node", skip it on wrap
            let next = if cur.wrapping_add(1) == 0 { 1 } else { cur.wrapping_add(1) };
            match head.operation_seq.compare_exchange_weak(
                cur,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => cur = observed,
            }
        }
    }

    unsafe fn write_block_head(&self, idx: usize, value: BlockHead) {
        unsafe { self.data_ptr(idx).cast::<BlockHead>().write(value) }
    }

    unsafe fn read_block_head(&self, idx: usize) -> BlockHead {
        unsafe { self.data_ptr(idx).cast::<BlockHead>().read() }
    }

    unsafe fn copy_in(&self, start: usize, data: &[u8]) {
        let head = self.head();
        let to_end = (head.node_count - start) * head.node_size - BLOCK_HEAD_SIZE;
        let dst = unsafe { self.data_ptr(start).add(BLOCK_HEAD_SIZE) };
        unsafe {
            if data.len() <= to_end {
                std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
            } else {
                std::ptr::copy_nonoverlapping(data.as_ptr(), dst, to_end);
                std::ptr::copy_nonoverlapping(
                    data.as_ptr().add(to_end),
                    self.data_ptr(0),
                    data.len() - to_end,
                );
            }
        }
    }

    unsafe fn copy_out(&self, start: usize, out: &mut [u8]) {
        let head = self.head();
        let to_end = (head.node_count - start) * head.node_size - BLOCK_HEAD_SIZE;
        let src = unsafe { self.data_ptr(start).add(BLOCK_HEAD_SIZE) };
        unsafe {
            if out.len() <= to_end {
                std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len());
            } else {
                std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), to_end);
                std::ptr::copy_nonoverlapping(
                    self.data_ptr(0),
                    out.as_mut_ptr().add(to_end),
                    out.len() - to_end,
                );
            }
        }
    }

    /// Write one message. May be called concurrently from any thread of
    /// any process mapping the region; conflicts are detected through
    /// the sequence stamps rather than locks.
    pub fn send(&self, data: &[u8]) -> Result<(), RingError> {
        if data.is_empty() {
            return Ok(());
        }

        let head = self.head();
        let needed = self.calc_node_count(data.len());
        if needed >= head.node_count - head.conf.protect_node_count {
            return Err(RingError::BuffLimit { need: data.len() });
        }

        let seq = self.fetch_operation_seq();

        // claim [write_cur, write_cur + needed) by CAS
        let mut write_cur = head.write_cur.load(Ordering::Acquire);
        let new_write_cur = loop {
            let read_cur = head.read_cur.load(Ordering::Acquire);
            let available = ((read_cur + head.node_count - write_cur - 1) % head.node_count)
                .saturating_sub(head.conf.protect_node_count);
            if needed > available {
                return Err(RingError::BuffLimit { need: data.len() });
            }

            let next = (write_cur + needed) % head.node_count;
            match head.write_cur.compare_exchange_weak(
                write_cur,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break next,
                Err(observed) => write_cur = observed,
            }
        };

        unsafe { self.write_block_head(write_cur, BlockHead { buffer_size: 0, fast_check: 0 }) };

        let first = self.node_head(write_cur);
        first.flag.store(FLAG_START_NODE, Ordering::Relaxed);
        first.seq.store(seq, Ordering::Relaxed);

        let mut idx = (write_cur + 1) % head.node_count;
        while idx != new_write_cur {
            let node = self.node_head(idx);
            // a non-zero stamp here means another write raced onto our claim
            if node.seq.load(Ordering::Relaxed) != 0 {
                node.flag.fetch_or(FLAG_WRITTEN, Ordering::Relaxed);
                return Err(RingError::BadBlockWriteSeqId);
            }
            node.flag.store(0, Ordering::Relaxed);
            node.seq.store(seq, Ordering::Relaxed);
            idx = (idx + 1) % head.node_count;
        }

        unsafe {
            self.copy_in(write_cur, data);
            self.write_block_head(
                write_cur,
                BlockHead { buffer_size: data.len() as u64, fast_check: fast_check(data) },
            );
        }

        // commit point: a reader that sees WRITTEN also sees the payload
        first.flag.fetch_or(FLAG_WRITTEN, Ordering::Release);

        if first.seq.load(Ordering::Relaxed) != seq {
            return Err(RingError::BadBlockWriteSeqId);
        }

        Ok(())
    }

    /// Read the next message into `out`. Single consumer only.
    ///
    /// `now_ms` drives the write-timeout salvage; callers pass their
    /// own monotonic millisecond clock.
    pub fn recv(&self, out: &mut [u8], now_ms: u64) -> Result<usize, RingError> {
        let head = self.head();
        let mut sticky: Option<RingError> = None;

        let ori_read_cur = head.read_cur.load(Ordering::Acquire);
        let write_cur = head.write_cur.load(Ordering::Acquire);
        let mut read_begin = ori_read_cur;
        let mut read_end;
        let mut block = BlockHead { buffer_size: 0, fast_check: 0 };

        loop {
            read_end = read_begin;
            if read_begin == write_cur {
                sticky.get_or_insert(RingError::NoData);
                break;
            }

            let node = self.node_head(read_begin);
            let flag = node.flag.load(Ordering::Acquire);

            if flag & FLAG_START_NODE == 0 {
                read_begin = (read_begin + 1) % head.node_count;
                head.node_bad_count.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            if flag & FLAG_WRITTEN == 0 {
                let first_failed = head.first_failed_writing_time.load(Ordering::Relaxed);
                if first_failed == 0 {
                    head.first_failed_writing_time.store(now_ms.max(1), Ordering::Relaxed);
                    sticky.get_or_insert(RingError::NoData);
                    break;
                }
                if now_ms.abs_diff(first_failed) > head.conf.write_timeout_ms {
                    // the writer is gone, discard its slot
                    read_begin = (read_begin + 1) % head.node_count;
                    head.block_bad_count.fetch_add(1, Ordering::Relaxed);
                    head.block_timeout_count.fetch_add(1, Ordering::Relaxed);
                    head.node_bad_count.fetch_add(1, Ordering::Relaxed);
                    head.first_failed_writing_time.store(0, Ordering::Relaxed);
                    sticky.get_or_insert(RingError::NodeTimeout);
                    continue;
                }
                sticky.get_or_insert(RingError::NoData);
                break;
            }

            block = unsafe { self.read_block_head(read_begin) };
            let size = block.buffer_size as usize;
            let area = head.node_count * head.node_size;
            if size == 0 || size >= area - head.conf.protect_memory_size {
                sticky.get_or_insert(RingError::BadBlockBuffSize);
                read_begin = (read_begin + 1) % head.node_count;
                head.node_bad_count.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            if size > out.len() {
                sticky.get_or_insert(RingError::BuffLimit { need: size });
                break;
            }

            // release the claim while verifying it is whole
            let check_seq = node.seq.load(Ordering::Relaxed);
            while read_end != write_cur {
                let this = self.node_head(read_end);
                if this.seq.load(Ordering::Relaxed) != check_seq {
                    break;
                }
                this.seq.store(0, Ordering::Relaxed);
                this.flag.store(0, Ordering::Relaxed);
                read_end = (read_end + 1) % head.node_count;
            }

            let nodes = (read_end + head.node_count - read_begin) % head.node_count;
            if self.calc_node_count(size) != nodes {
                sticky.get_or_insert(RingError::BadBlockNodeNum);
                read_begin = (read_begin + 1) % head.node_count;
                head.node_bad_count.fetch_add(1, Ordering::Relaxed);
                head.block_bad_count.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            break;
        }

        let size = block.buffer_size as usize;
        if sticky.is_none() {
            head.first_failed_writing_time.store(0, Ordering::Relaxed);
            unsafe { self.copy_out(read_begin, &mut out[..size]) };
            if fast_check(&out[..size]) != block.fast_check {
                sticky = Some(RingError::BadBlockFastCheck);
            }
        }

        // wipe the headers of any nodes skipped over
        if ori_read_cur != read_begin {
            let mut idx = ori_read_cur;
            while idx != read_begin {
                let node = self.node_head(idx);
                node.flag.store(0, Ordering::Relaxed);
                node.seq.store(0, Ordering::Relaxed);
                idx = (idx + 1) % head.node_count;
            }
        }

        head.read_cur.store(read_end, Ordering::Release);

        match sticky {
            None => Ok(size),
            Some(err) => Err(err),
        }
    }

    pub fn stats(&self) -> RingStats {
        let head = self.head();
        RingStats {
            block_bad_count: head.block_bad_count.load(Ordering::Relaxed),
            block_timeout_count: head.block_timeout_count.load(Ordering::Relaxed),
            node_bad_count: head.node_bad_count.load(Ordering::Relaxed),
        }
    }

    pub fn node_count(&self) -> usize {
        self.head().node_count
    }

    pub fn node_size(&self) -> usize {
        self.head().node_size
    }

    pub fn conf(&self) -> RingConf {
        self.head().conf
    }
}

fn default_conf(conf: Option<RingConf>, node_count: usize) -> RingConf {
    let mut conf = conf.unwrap_or_default();

    if conf.protect_node_count == 0 && conf.protect_memory_size > 0 {
        conf.protect_node_count = conf.protect_memory_size.div_ceil(NODE_SIZE);
    } else if conf.protect_node_count == 0 {
        conf.protect_node_count = node_count / 100;
    }
    conf.protect_node_count = conf.protect_node_count.min(node_count);
    conf.protect_memory_size = conf.protect_node_count * NODE_SIZE;
    if conf.write_timeout_ms == 0 {
        conf.write_timeout_ms = RingConf::default().write_timeout_ms;
    }

    conf
}

/// Ring channel over process-private memory, for in-process (`mem://`)
/// transports. The listening side owns the region through this type;
/// senders attach views with [`RingChannel::attach`].
#[derive(Debug)]
pub struct MemRing {
    ptr: NonNull<u8>,
    len: usize,
    chan: RingChannel,
}

unsafe impl Send for MemRing {}

impl MemRing {
    pub fn create(len: usize, conf: Option<RingConf>) -> Result<Self, RingError> {
        let layout =
            Layout::from_size_align(len, HEAD_ALIGN).map_err(|_| RingError::SizeTooSmall)?;
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            std::alloc::handle_alloc_error(layout);
        };

        match unsafe { RingChannel::init(ptr.as_ptr(), len, conf) } {
            Ok(chan) => Ok(Self { ptr, len, chan }),
            Err(err) => {
                unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
                Err(err)
            }
        }
    }

    /// Address senders use to attach, advertised as `mem://<hex>`.
    pub fn base_addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn channel(&self) -> RingChannel {
        self.chan
    }
}

impl Drop for MemRing {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len, HEAD_ALIGN).expect("validated in create");
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGION: usize = CHANNEL_HEAD_SIZE + 64 * (NODE_SIZE + NODE_HEAD_SIZE);

    fn payload(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn head_fits_in_reserved_area() {
        assert!(std::mem::size_of::<ChannelHead>() <= CHANNEL_HEAD_SIZE);
        assert_eq!(std::mem::size_of::<NodeHead>(), 8);
        assert_eq!(std::mem::size_of::<BlockHead>(), 16);
    }

    #[test]
    fn init_computes_node_count() {
        let ring = MemRing::create(REGION, None).unwrap();
        assert_eq!(ring.channel().node_count(), 64);
        assert_eq!(ring.channel().node_size(), NODE_SIZE);

        // 1% guard on a 64-node ring rounds to zero nodes
        assert_eq!(ring.channel().conf().protect_node_count, 0);
    }

    #[test]
    fn too_small_region_rejected() {
        assert_eq!(MemRing::create(128, None).unwrap_err(), RingError::SizeTooSmall);
    }

    #[test]
    fn attach_validates_head() {
        let ring = MemRing::create(REGION, None).unwrap();
        let view =
            unsafe { RingChannel::attach(ring.ptr.as_ptr(), ring.len()) }.expect("valid attach");
        assert_eq!(view.node_count(), 64);

        let layout = Layout::from_size_align(REGION, HEAD_ALIGN).unwrap();
        let junk = unsafe { std::alloc::alloc_zeroed(layout) };
        assert_eq!(
            unsafe { RingChannel::attach(junk, REGION) }.unwrap_err(),
            RingError::Params,
            "zeroed head has node_count 0"
        );
        unsafe { std::alloc::dealloc(junk, layout) };
    }

    #[test]
    fn send_recv_in_order() {
        let ring = MemRing::create(REGION, None).unwrap();
        let chan = ring.channel();

        for seed in 0..8u8 {
            chan.send(&payload(seed, 50 + seed as usize * 37)).unwrap();
        }

        let mut out = vec![0u8; 1024];
        for seed in 0..8u8 {
            let n = chan.recv(&mut out, 1).unwrap();
            assert_eq!(&out[..n], &payload(seed, 50 + seed as usize * 37));
        }
        assert_eq!(chan.recv(&mut out, 1).unwrap_err(), RingError::NoData);
        assert_eq!(chan.stats(), RingStats::default());
    }

    #[test]
    fn empty_send_is_noop() {
        let ring = MemRing::create(REGION, None).unwrap();
        ring.channel().send(&[]).unwrap();
        let mut out = [0u8; 16];
        assert_eq!(ring.channel().recv(&mut out, 1).unwrap_err(), RingError::NoData);
    }

    #[test]
    fn oversized_send_rejected() {
        let ring = MemRing::create(REGION, None).unwrap();
        let big = vec![0u8; 64 * NODE_SIZE];
        assert!(matches!(ring.channel().send(&big), Err(RingError::BuffLimit { .. })));
    }

    #[test]
    fn ring_full_and_drain() {
        let ring = MemRing::create(REGION, None).unwrap();
        let chan = ring.channel();
        let msg = payload(7, 4 * NODE_SIZE);

        let mut sent = 0usize;
        loop {
            match chan.send(&msg) {
                Ok(()) => sent += 1,
                Err(RingError::BuffLimit { .. }) => break,
                Err(other) => panic!("unexpected {other}"),
            }
        }
        assert!(sent > 0);

        let mut out = vec![0u8; msg.len()];
        for _ in 0..sent {
            let n = chan.recv(&mut out, 1).unwrap();
            assert_eq!(&out[..n], &msg[..]);
        }
        assert_eq!(chan.recv(&mut out, 1).unwrap_err(), RingError::NoData);

        // space is reusable after draining
        chan.send(&msg).unwrap();
        assert_eq!(chan.recv(&mut out, 1).unwrap(), msg.len());
    }

    #[test]
    fn wrap_around_payloads_survive() {
        let ring = MemRing::create(REGION, None).unwrap();
        let chan = ring.channel();
        let mut out = vec![0u8; 8 * NODE_SIZE];

        // uneven sizes force claims across the data area boundary
        for round in 0..200u32 {
            let len = 1 + ((round as usize * 97) % (5 * NODE_SIZE));
            let msg = payload(round as u8, len);
            chan.send(&msg).unwrap();
            let n = chan.recv(&mut out, 1).unwrap();
            assert_eq!(&out[..n], &msg[..], "round {round}");
        }
        assert_eq!(chan.stats(), RingStats::default());
    }

    #[test]
    fn recv_buffer_too_small_reports_need() {
        let ring = MemRing::create(REGION, None).unwrap();
        let chan = ring.channel();
        let msg = payload(3, 300);
        chan.send(&msg).unwrap();

        let mut small = [0u8; 64];
        assert_eq!(
            chan.recv(&mut small, 1).unwrap_err(),
            RingError::BuffLimit { need: 300 },
            "must not consume the message"
        );

        let mut big = vec![0u8; 512];
        let n = chan.recv(&mut big, 1).unwrap();
        assert_eq!(&big[..n], &msg[..]);
    }

    #[test]
    fn unfinished_write_salvaged_after_timeout() {
        let ring = MemRing::create(REGION, None).unwrap();
        let chan = ring.channel();
        let head = chan.head();
        let timeout = head.conf.write_timeout_ms;

        // forge a claim whose writer died before setting WRITTEN
        head.write_cur.store(2, Ordering::Release);
        let node = chan.node_head(0);
        node.flag.store(FLAG_START_NODE, Ordering::Relaxed);
        node.seq.store(9, Ordering::Relaxed);
        chan.node_head(1).seq.store(9, Ordering::Relaxed);

        let mut out = [0u8; 256];
        assert_eq!(chan.recv(&mut out, 100).unwrap_err(), RingError::NoData);
        assert_eq!(chan.recv(&mut out, 100 + timeout).unwrap_err(), RingError::NoData);
        assert_eq!(chan.recv(&mut out, 101 + timeout).unwrap_err(), RingError::NodeTimeout);
        assert_eq!(chan.stats().block_timeout_count, 1);

        // the channel keeps working afterwards
        let msg = payload(1, 40);
        chan.send(&msg).unwrap();
        loop {
            match chan.recv(&mut out, 102 + timeout) {
                Ok(n) => {
                    assert_eq!(&out[..n], &msg[..]);
                    break;
                }
                Err(RingError::NodeTimeout | RingError::NoData) => continue,
                Err(other) => panic!("unexpected {other}"),
            }
        }
    }

    #[test]
    fn corrupted_payload_detected() {
        let ring = MemRing::create(REGION, None).unwrap();
        let chan = ring.channel();
        let msg = payload(5, 200);
        chan.send(&msg).unwrap();

        // flip one payload byte behind the writer's back
        unsafe {
            let p = chan.data_ptr(0).add(BLOCK_HEAD_SIZE + 17);
            p.write(p.read() ^ 0xff);
        }

        let mut out = [0u8; 512];
        assert_eq!(chan.recv(&mut out, 1).unwrap_err(), RingError::BadBlockFastCheck);
        assert_eq!(chan.recv(&mut out, 2).unwrap_err(), RingError::NoData, "slot discarded");
    }

    #[test]
    fn fast_check_distinguishes_lengths_and_bytes() {
        assert_eq!(fast_check(b"hello world"), fast_check(b"hello world"));
        assert_ne!(fast_check(b"hello world"), fast_check(b"hello worle"));
        assert_ne!(fast_check(&[0u8; 8]), fast_check(&[0u8; 16]));
    }
}
