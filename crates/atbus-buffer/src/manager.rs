use std::collections::VecDeque;

use crate::{BufferBlock, BufferError};

/// Byte and block accounting, shared by both manager modes.
#[derive(Debug, Default, Clone, Copy)]
pub struct Limit {
    pub cost_number: usize,
    pub cost_size: usize,
    pub limit_number: usize,
    pub limit_size: usize,
}

/// Descriptor of one block placed inside the static arena.
#[derive(Debug, Clone, Copy)]
struct BlockDesc {
    offset: usize,
    len: usize,
    used: usize,
}

impl BlockDesc {
    #[inline]
    fn remaining(&self) -> usize {
        self.len - self.used
    }
}

/// Circular arena plus a parallel descriptor ring.
///
/// `index[head..tail)` (circular) is the live range; one index slot is
/// always kept empty so full and empty are distinguishable.
#[derive(Debug)]
struct StaticArena {
    arena: Box<[u8]>,
    index: Box<[Option<BlockDesc>]>,
    head: usize,
    tail: usize,
}

#[derive(Debug)]
enum Backend {
    Dynamic(VecDeque<BufferBlock>),
    Static(StaticArena),
}

/// Double-ended queue of byte blocks with two allocation modes.
///
/// *Dynamic* mode allocates one block per push. *Static* mode carves
/// blocks out of a single contiguous arena, first-fit against the live
/// span, so pushed slices never move until popped. Byte and block
/// limits are enforced before any allocation.
#[derive(Debug)]
pub struct BufferManager {
    backend: Backend,
    limit: Limit,
}

#[inline]
fn padded(s: usize) -> usize {
    const ALIGN: usize = std::mem::size_of::<usize>();
    s.div_ceil(ALIGN) * ALIGN
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferManager {
    pub fn new() -> Self {
        Self { backend: Backend::Dynamic(VecDeque::new()), limit: Limit::default() }
    }

    pub fn limit(&self) -> &Limit {
        &self.limit
    }

    /// Set byte/block limits. Only allowed in dynamic mode; static mode
    /// fixes its limits in [`set_mode`](Self::set_mode).
    pub fn set_limit(&mut self, max_size: usize, max_number: usize) -> bool {
        if matches!(self.backend, Backend::Static(_)) {
            return false;
        }
        self.limit.limit_size = max_size;
        self.limit.limit_number = max_number;
        true
    }

    /// Switch to static mode with `max_size` arena bytes and at most
    /// `max_number` live blocks. Discards any buffered data. A zero
    /// `max_size` or `max_number` switches back to dynamic mode.
    pub fn set_mode(&mut self, max_size: usize, max_number: usize) {
        self.reset();

        if max_size != 0 && max_number > 0 {
            self.backend = Backend::Static(StaticArena {
                arena: vec![0u8; padded(max_size)].into_boxed_slice(),
                // one slot kept empty as the full/empty separator
                index: vec![None; max_number + 1].into_boxed_slice(),
                head: 0,
                tail: 0,
            });
            self.limit.limit_size = max_size;
            self.limit.limit_number = max_number;
        }
    }

    /// Back to an empty dynamic manager with no limits.
    pub fn reset(&mut self) {
        self.backend = Backend::Dynamic(VecDeque::new());
        self.limit = Limit::default();
    }

    pub fn is_empty(&self) -> bool {
        match &self.backend {
            Backend::Dynamic(q) => q.is_empty(),
            Backend::Static(s) => s.head == s.tail,
        }
    }

    /// Unconsumed bytes of the front block plus its consumed count.
    pub fn front(&self) -> Result<(&[u8], usize), BufferError> {
        match &self.backend {
            Backend::Dynamic(q) => {
                let b = q.front().ok_or(BufferError::NoData)?;
                Ok((b.data(), b.used()))
            }
            Backend::Static(s) => {
                let d = s.front().ok_or(BufferError::NoData)?;
                Ok((&s.arena[d.offset + d.used..d.offset + d.len], d.used))
            }
        }
    }

    /// The whole front block, consumed cursor ignored.
    pub fn front_block(&self) -> Result<&[u8], BufferError> {
        match &self.backend {
            Backend::Dynamic(q) => Ok(q.front().ok_or(BufferError::NoData)?.raw()),
            Backend::Static(s) => {
                let d = s.front().ok_or(BufferError::NoData)?;
                Ok(&s.arena[d.offset..d.offset + d.len])
            }
        }
    }

    /// Unconsumed bytes of the back block plus its consumed count.
    pub fn back(&self) -> Result<(&[u8], usize), BufferError> {
        match &self.backend {
            Backend::Dynamic(q) => {
                let b = q.back().ok_or(BufferError::NoData)?;
                Ok((b.data(), b.used()))
            }
            Backend::Static(s) => {
                let d = s.back().ok_or(BufferError::NoData)?;
                Ok((&s.arena[d.offset + d.used..d.offset + d.len], d.used))
            }
        }
    }

    pub fn back_mut(&mut self) -> Result<(&mut [u8], usize), BufferError> {
        match &mut self.backend {
            Backend::Dynamic(q) => {
                let b = q.back_mut().ok_or(BufferError::NoData)?;
                let used = b.used();
                Ok((b.data_mut(), used))
            }
            Backend::Static(s) => {
                let d = s.back().ok_or(BufferError::NoData)?;
                Ok((&mut s.arena[d.offset + d.used..d.offset + d.len], d.used))
            }
        }
    }

    /// Append a block of `size` bytes and return its writable body.
    pub fn push_back(&mut self, size: usize) -> Result<&mut [u8], BufferError> {
        self.check_push(size)?;

        match &mut self.backend {
            Backend::Dynamic(q) => {
                q.push_back(BufferBlock::with_capacity(size));
                self.limit.cost_number += 1;
                self.limit.cost_size += size;
                Ok(q.back_mut().expect("just pushed").data_mut())
            }
            Backend::Static(s) => {
                let d = s.place_back(size)?;
                self.limit.cost_number += 1;
                self.limit.cost_size += size;
                Ok(&mut s.arena[d.offset..d.offset + d.len])
            }
        }
    }

    /// Prepend a block of `size` bytes and return its writable body.
    pub fn push_front(&mut self, size: usize) -> Result<&mut [u8], BufferError> {
        self.check_push(size)?;

        match &mut self.backend {
            Backend::Dynamic(q) => {
                q.push_front(BufferBlock::with_capacity(size));
                self.limit.cost_number += 1;
                self.limit.cost_size += size;
                Ok(q.front_mut().expect("just pushed").data_mut())
            }
            Backend::Static(s) => {
                let d = s.place_front(size)?;
                self.limit.cost_number += 1;
                self.limit.cost_size += size;
                Ok(&mut s.arena[d.offset..d.offset + d.len])
            }
        }
    }

    /// Consume up to `size` bytes of the front block. When the block is
    /// fully consumed and `free_block` is set, its slot is released.
    pub fn pop_front(&mut self, size: usize, free_block: bool) -> Result<(), BufferError> {
        if self.is_empty() {
            return Err(BufferError::NoData);
        }

        let step = match &mut self.backend {
            Backend::Dynamic(q) => {
                let b = q.front_mut().expect("not empty");
                let step = b.pop(size);
                if b.size() == 0 && free_block {
                    q.pop_front();
                    self.limit.cost_number = self.limit.cost_number.saturating_sub(1);
                }
                step
            }
            Backend::Static(s) => {
                let cap = s.index.len();
                let d = s.index[s.head].as_mut().expect("live head slot");
                let step = size.min(d.remaining());
                d.used += step;
                if d.remaining() == 0 && free_block {
                    s.index[s.head] = None;
                    s.head = (s.head + 1) % cap;
                    self.limit.cost_number = self.limit.cost_number.saturating_sub(1);
                }
                step
            }
        };

        self.settle_after_pop(step);
        Ok(())
    }

    /// Consume up to `size` bytes of the back block, mirroring
    /// [`pop_front`](Self::pop_front).
    pub fn pop_back(&mut self, size: usize, free_block: bool) -> Result<(), BufferError> {
        if self.is_empty() {
            return Err(BufferError::NoData);
        }

        let step = match &mut self.backend {
            Backend::Dynamic(q) => {
                let b = q.back_mut().expect("not empty");
                let step = b.pop(size);
                if b.size() == 0 && free_block {
                    q.pop_back();
                    self.limit.cost_number = self.limit.cost_number.saturating_sub(1);
                }
                step
            }
            Backend::Static(s) => {
                let cap = s.index.len();
                let last = (s.tail + cap - 1) % cap;
                let d = s.index[last].as_mut().expect("live tail slot");
                let step = size.min(d.remaining());
                d.used += step;
                if d.remaining() == 0 && free_block {
                    s.index[last] = None;
                    s.tail = last;
                    self.limit.cost_number = self.limit.cost_number.saturating_sub(1);
                }
                step
            }
        };

        self.settle_after_pop(step);
        Ok(())
    }

    fn check_push(&self, size: usize) -> Result<(), BufferError> {
        if size == 0 {
            return Err(BufferError::Params);
        }
        if self.limit.limit_number > 0 && self.limit.cost_number >= self.limit.limit_number {
            return Err(BufferError::BuffLimit);
        }
        if self.limit.limit_size > 0 && self.limit.cost_size + size > self.limit.limit_size {
            return Err(BufferError::BuffLimit);
        }
        Ok(())
    }

    fn settle_after_pop(&mut self, step: usize) {
        if self.is_empty() {
            if let Backend::Static(s) = &mut self.backend {
                s.head = 0;
                s.tail = 0;
            }
            self.limit.cost_size = 0;
            self.limit.cost_number = 0;
        } else {
            self.limit.cost_size -= step.min(self.limit.cost_size);
        }
    }
}

impl StaticArena {
    fn front(&self) -> Option<BlockDesc> {
        if self.head == self.tail { None } else { self.index[self.head] }
    }

    fn back(&self) -> Option<BlockDesc> {
        if self.head == self.tail {
            None
        } else {
            self.index[(self.tail + self.index.len() - 1) % self.index.len()]
        }
    }

    /// The live span as `(start, end, wrapped)` where `end` is the
    /// first byte past the last block.
    fn span(&self) -> (usize, usize, bool) {
        let first = self.front().expect("span of empty arena");
        let last = self.back().expect("span of empty arena");
        let end = last.offset + padded(last.len);
        (first.offset, end, last.offset < first.offset)
    }

    fn place_back(&mut self, size: usize) -> Result<BlockDesc, BufferError> {
        let cap = self.index.len();
        if (self.tail + 1) % cap == self.head {
            return Err(BufferError::BuffLimit);
        }

        let fs = padded(size);
        let offset = if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
            if fs > self.arena.len() {
                return Err(BufferError::BuffLimit);
            }
            0
        } else {
            let (start, end, wrapped) = self.span();
            if wrapped {
                if start - end < fs {
                    return Err(BufferError::BuffLimit);
                }
                end
            } else if self.arena.len() - end >= fs {
                end
            } else if start >= fs {
                0
            } else {
                return Err(BufferError::BuffLimit);
            }
        };

        let desc = BlockDesc { offset, len: size, used: 0 };
        self.index[self.tail] = Some(desc);
        self.tail = (self.tail + 1) % cap;
        Ok(desc)
    }

    fn place_front(&mut self, size: usize) -> Result<BlockDesc, BufferError> {
        let cap = self.index.len();
        if (self.tail + 1) % cap == self.head {
            return Err(BufferError::BuffLimit);
        }

        let fs = padded(size);
        let offset = if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
            if fs > self.arena.len() {
                return Err(BufferError::BuffLimit);
            }
            0
        } else {
            let (start, end, wrapped) = self.span();
            if wrapped {
                if start - end < fs {
                    return Err(BufferError::BuffLimit);
                }
                start - fs
            } else if start >= fs {
                start - fs
            } else if self.arena.len() - end >= fs {
                self.arena.len() - fs
            } else {
                return Err(BufferError::BuffLimit);
            }
        };

        let desc = BlockDesc { offset, len: size, used: 0 };
        self.head = (self.head + cap - 1) % cap;
        self.index[self.head] = Some(desc);
        Ok(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(buf: &mut [u8], tag: u8) {
        buf.fill(tag);
    }

    #[test]
    fn dynamic_push_pop_fifo() {
        let mut m = BufferManager::new();
        assert!(m.is_empty());
        assert_eq!(m.front().unwrap_err(), BufferError::NoData);

        fill(m.push_back(4).unwrap(), 1);
        fill(m.push_back(8).unwrap(), 2);
        assert_eq!(m.limit().cost_number, 2);
        assert_eq!(m.limit().cost_size, 12);

        let (data, used) = m.front().unwrap();
        assert_eq!(used, 0);
        assert_eq!(data, &[1, 1, 1, 1]);

        m.pop_front(4, true).unwrap();
        assert_eq!(m.limit().cost_number, 1);
        assert_eq!(m.front().unwrap().0, &[2; 8]);

        m.pop_front(8, true).unwrap();
        assert!(m.is_empty());
        assert_eq!(m.limit().cost_size, 0);
        assert_eq!(m.limit().cost_number, 0);
    }

    #[test]
    fn dynamic_limits() {
        let mut m = BufferManager::new();
        assert!(m.set_limit(16, 2));

        m.push_back(8).unwrap();
        m.push_back(8).unwrap();
        assert_eq!(m.push_back(1).unwrap_err(), BufferError::BuffLimit);
        // limit failure must not mutate accounting
        assert_eq!(m.limit().cost_number, 2);
        assert_eq!(m.limit().cost_size, 16);

        m.pop_front(8, true).unwrap();
        m.push_back(4).unwrap();
        assert_eq!(m.push_back(8).unwrap_err(), BufferError::BuffLimit);
    }

    #[test]
    fn dynamic_push_front_lifo() {
        let mut m = BufferManager::new();
        fill(m.push_back(4).unwrap(), 1);
        fill(m.push_front(4).unwrap(), 2);
        assert_eq!(m.front().unwrap().0, &[2; 4]);
        assert_eq!(m.back().unwrap().0, &[1; 4]);

        m.pop_back(4, true).unwrap();
        assert_eq!(m.front().unwrap().0, &[2; 4]);
    }

    #[test]
    fn static_cost_accounting() {
        let mut m = BufferManager::new();
        m.set_mode(256, 4);
        assert!(!m.set_limit(1, 1), "set_limit is dynamic-only");

        fill(m.push_back(32).unwrap(), 1);
        fill(m.push_back(64).unwrap(), 2);
        fill(m.push_back(16).unwrap(), 3);
        fill(m.push_back(8).unwrap(), 4);
        assert_eq!(m.limit().cost_size, 120);
        assert_eq!(m.limit().cost_number, 4);

        assert_eq!(m.push_back(8).unwrap_err(), BufferError::BuffLimit, "block count at limit");

        m.pop_front(32, true).unwrap();
        assert_eq!(m.limit().cost_size, 88);
        assert_eq!(m.limit().cost_number, 3);

        // live blocks keep their contents across later pushes
        fill(m.push_back(40).unwrap(), 5);
        assert_eq!(m.front().unwrap().0, &[2; 64]);
        assert_eq!(m.back().unwrap().0, &[5; 40]);

        m.pop_front(64, true).unwrap();
        m.pop_front(16, true).unwrap();
        m.pop_front(8, true).unwrap();
        m.pop_front(40, true).unwrap();
        assert!(m.is_empty());
        assert_eq!(m.limit().cost_size, 0);
        assert_eq!(m.limit().cost_number, 0);
    }

    #[test]
    fn static_head_tail_reset_on_empty() {
        let mut m = BufferManager::new();
        m.set_mode(128, 4);

        let first_ptr = m.push_back(16).unwrap().as_ptr();
        m.push_back(16).unwrap();
        m.pop_front(16, true).unwrap();
        m.pop_front(16, true).unwrap();
        assert!(m.is_empty());

        // after the live range empties, placement restarts at the arena base
        let again = m.push_back(24).unwrap().as_ptr();
        assert_eq!(first_ptr, again);
    }

    #[test]
    fn static_wrap_around() {
        let mut m = BufferManager::new();
        m.set_mode(64, 4);

        fill(m.push_back(32).unwrap(), 1);
        fill(m.push_back(24).unwrap(), 2);
        // no room at the end and none at the front
        assert_eq!(m.push_back(32).unwrap_err(), BufferError::BuffLimit);

        m.pop_front(32, true).unwrap();
        // fits only by wrapping to the arena base
        fill(m.push_back(32).unwrap(), 3);
        assert_eq!(m.front().unwrap().0, &[2; 24]);

        // gap is now zero
        assert_eq!(m.push_back(8).unwrap_err(), BufferError::BuffLimit);

        m.pop_front(24, true).unwrap();
        assert_eq!(m.front().unwrap().0, &[3; 32]);
        m.pop_front(32, true).unwrap();
        assert!(m.is_empty());
    }

    #[test]
    fn static_push_front_placement() {
        let mut m = BufferManager::new();
        m.set_mode(64, 4);

        fill(m.push_back(16).unwrap(), 1);
        // no gap before the head block: push_front wraps to the arena end
        fill(m.push_front(16).unwrap(), 2);
        fill(m.push_front(16).unwrap(), 3);
        assert_eq!(m.front().unwrap().0, &[3; 16]);

        m.pop_front(16, true).unwrap();
        assert_eq!(m.front().unwrap().0, &[2; 16]);
        m.pop_front(16, true).unwrap();
        assert_eq!(m.front().unwrap().0, &[1; 16]);
    }

    #[test]
    fn partial_pop_keeps_block() {
        let mut m = BufferManager::new();
        m.set_mode(128, 4);

        let body = m.push_back(16).unwrap();
        body.copy_from_slice(&(0..16u8).collect::<Vec<_>>());

        m.pop_front(6, true).unwrap();
        let (data, used) = m.front().unwrap();
        assert_eq!(used, 6);
        assert_eq!(data, &[6, 7, 8, 9, 10, 11, 12, 13, 14, 15]);
        assert_eq!(m.limit().cost_size, 10);

        // fully consumed but retained while free_block is off
        m.pop_front(100, false).unwrap();
        assert!(!m.is_empty());
        assert_eq!(m.front().unwrap().0.len(), 0);
        assert_eq!(m.front_block().unwrap().len(), 16);

        m.pop_front(0, true).unwrap();
        assert!(m.is_empty());
    }

    #[test]
    fn back_fill_cursor() {
        // receive-side usage: push a block, then advance the cursor as
        // bytes land in it
        let mut m = BufferManager::new();
        m.push_back(10).unwrap();

        let (writable, filled) = m.back_mut().unwrap();
        assert_eq!(filled, 0);
        writable[..4].fill(9);
        m.pop_back(4, false).unwrap();

        let (writable, filled) = m.back_mut().unwrap();
        assert_eq!(filled, 4);
        assert_eq!(writable.len(), 6);
        writable.fill(9);
        m.pop_back(6, false).unwrap();

        let (rest, filled) = m.back().unwrap();
        assert!(rest.is_empty());
        assert_eq!(filled, 10);
        assert_eq!(m.front_block().unwrap(), &[9; 10]);
    }
}
