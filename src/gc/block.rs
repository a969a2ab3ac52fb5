//! Aligned cell blocks.
//!
//! Every block is `BLOCK_SIZE` bytes and `BLOCK_SIZE` aligned, so the block
//! of any interior address is `addr & BLOCK_MASK`. A block starts with a
//! self-describing header (live and mark bitmaps, free list, owner) followed
//! by a fixed array of equally sized slots. Free slots form an intrusive
//! singly linked list through their first word.

use std::alloc::{self, Layout};
use std::mem::{ManuallyDrop, align_of, needs_drop, offset_of, size_of};
use std::ptr::{self, NonNull};

use rustc_hash::FxHashSet;

use crate::cell::{NumberCell, ObjectCell};

pub const BLOCK_SIZE: usize = 64 * 1024;
pub const BLOCK_OFFSET_MASK: usize = BLOCK_SIZE - 1;
pub const BLOCK_MASK: usize = !BLOCK_OFFSET_MASK;

const BITMAP_WORDS: usize = 128;
const MAX_CELLS_PER_BLOCK: usize = BITMAP_WORDS * 64;

const NO_FREE_CELL: u32 = u32::MAX;

/// Which pool a block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HeapType {
    Primary,
    Number,
}

// ============================================================================
// CellBitmap - one bit per slot
// ============================================================================

#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct CellBitmap {
    bits: [u64; BITMAP_WORDS],
}

impl CellBitmap {
    const EMPTY: CellBitmap = CellBitmap {
        bits: [0; BITMAP_WORDS],
    };

    #[inline]
    fn set(&mut self, index: usize) {
        debug_assert!(index < MAX_CELLS_PER_BLOCK);
        if let Some(word) = self.bits.get_mut(index >> 6) {
            *word |= 1 << (index & 63);
        }
    }

    #[inline]
    fn unset(&mut self, index: usize) {
        if let Some(word) = self.bits.get_mut(index >> 6) {
            *word &= !(1 << (index & 63));
        }
    }

    #[inline]
    fn get(&self, index: usize) -> bool {
        self.bits
            .get(index >> 6)
            .is_some_and(|word| word & (1 << (index & 63)) != 0)
    }

    #[inline]
    fn clear(&mut self) {
        self.bits = [0; BITMAP_WORDS];
    }

    /// Indices set in `self` but not in `marked`.
    fn iter_unmarked<'a>(&'a self, marked: &'a CellBitmap) -> UnmarkedIter<'a> {
        UnmarkedIter {
            live: self,
            marked,
            current_word: 0,
            current_bits: self.word(0) & !marked.word(0),
            base_index: 0,
        }
    }

    #[inline]
    fn word(&self, index: usize) -> u64 {
        self.bits.get(index).copied().unwrap_or(0)
    }
}

/// Iterator over live-but-unmarked slots.
struct UnmarkedIter<'a> {
    live: &'a CellBitmap,
    marked: &'a CellBitmap,
    current_word: usize,
    current_bits: u64,
    base_index: usize,
}

impl Iterator for UnmarkedIter<'_> {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        loop {
            if self.current_bits != 0 {
                let bit_pos = self.current_bits.trailing_zeros() as usize;
                self.current_bits &= self.current_bits - 1;
                return Some(self.base_index + bit_pos);
            }
            self.current_word += 1;
            if self.current_word >= BITMAP_WORDS {
                return None;
            }
            self.base_index = self.current_word << 6;
            self.current_bits =
                self.live.word(self.current_word) & !self.marked.word(self.current_word);
        }
    }
}

// ============================================================================
// Block layout
// ============================================================================

#[repr(C)]
pub(crate) struct BlockHeader {
    live: CellBitmap,
    marked: CellBitmap,
    used_cells: usize,
    free_list: u32,
    heap_id: u32,
    pool: HeapType,
}

#[repr(C)]
pub(crate) union Slot<C> {
    // Accessed through pointer casts to `C` at offset 0.
    #[allow(dead_code)]
    cell: ManuallyDrop<C>,
    next_free: u32,
}

#[repr(C, align(65536))]
pub(crate) struct Block<C, const N: usize> {
    header: BlockHeader,
    pub(crate) slots: [Slot<C>; N],
}

const fn cells_per_block<C>() -> usize {
    let n = (BLOCK_SIZE - size_of::<BlockHeader>()) / size_of::<Slot<C>>();
    if n > MAX_CELLS_PER_BLOCK {
        MAX_CELLS_PER_BLOCK
    } else {
        n
    }
}

pub(crate) const PRIMARY_CELLS_PER_BLOCK: usize = cells_per_block::<ObjectCell>();
pub(crate) const NUMBER_CELLS_PER_BLOCK: usize = cells_per_block::<NumberCell>();

pub(crate) type PrimaryBlock = Block<ObjectCell, PRIMARY_CELLS_PER_BLOCK>;
pub(crate) type NumberBlock = Block<NumberCell, NUMBER_CELLS_PER_BLOCK>;

/// Slot size of the primary pool.
pub const CELL_SIZE: usize = size_of::<Slot<ObjectCell>>();
/// Slot size of the number pool.
pub const SMALL_CELL_SIZE: usize = size_of::<Slot<NumberCell>>();

const _: () = assert!(size_of::<PrimaryBlock>() == BLOCK_SIZE);
const _: () = assert!(size_of::<NumberBlock>() == BLOCK_SIZE);
// Cell addresses must keep the low two tag bits clear.
const _: () = assert!(offset_of!(PrimaryBlock, slots) % 4 == 0);
const _: () = assert!(offset_of!(NumberBlock, slots) % 4 == 0);
const _: () = assert!(CELL_SIZE % 4 == 0 && SMALL_CELL_SIZE % 4 == 0);

// ============================================================================
// CollectorHeap - one pool of blocks
// ============================================================================

/// Outcome of sweeping one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SweepResult {
    pub freed: usize,
    pub released_blocks: usize,
}

pub(crate) struct CollectorHeap<C, const N: usize> {
    blocks: Vec<NonNull<Block<C, N>>>,
    /// Base addresses of `blocks`, for conservative lookups.
    block_set: FxHashSet<usize>,
    first_block_with_possible_space: usize,
    live_objects: usize,
    live_at_last_collect: usize,
    pool: HeapType,
    heap_id: u32,
    /// Persistent sweep buffer, reused between cycles.
    sweep_buffer: Vec<usize>,
}

impl<C, const N: usize> CollectorHeap<C, N> {
    const SLOTS_OFFSET: usize = size_of::<BlockHeader>().next_multiple_of(align_of::<Slot<C>>());
    const SLOT_SIZE: usize = size_of::<Slot<C>>();

    pub(crate) fn new(pool: HeapType, heap_id: u32) -> Self {
        Self {
            blocks: Vec::new(),
            block_set: FxHashSet::default(),
            first_block_with_possible_space: 0,
            live_objects: 0,
            live_at_last_collect: 0,
            pool,
            heap_id,
            sweep_buffer: Vec::new(),
        }
    }

    fn layout() -> Layout {
        Layout::new::<Block<C, N>>()
    }

    pub(crate) fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.blocks.len() * N
    }

    pub(crate) fn live_objects(&self) -> usize {
        self.live_objects
    }

    pub(crate) fn live_at_last_collect(&self) -> usize {
        self.live_at_last_collect
    }

    /// Cells allocated since the last sweep.
    pub(crate) fn new_objects(&self) -> usize {
        self.live_objects.saturating_sub(self.live_at_last_collect)
    }

    /// Add an empty block to the pool and return its base address.
    pub(crate) fn grow(&mut self) -> usize {
        let layout = Self::layout();
        // SAFETY: the layout is BLOCK_SIZE bytes, never zero sized.
        let raw = unsafe { alloc::alloc(layout) } as *mut Block<C, N>;
        let Some(block) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout)
        };
        // SAFETY: `raw` is a fresh allocation of the right layout. Only the
        // header and the free-list words are initialised; cell bodies are
        // written on allocation and tracked by the live bitmap.
        unsafe {
            (&raw mut (*raw).header).write(BlockHeader {
                live: CellBitmap::EMPTY,
                marked: CellBitmap::EMPTY,
                used_cells: 0,
                free_list: if N > 0 { 0 } else { NO_FREE_CELL },
                heap_id: self.heap_id,
                pool: self.pool,
            });
            let slots = (&raw mut (*raw).slots) as *mut Slot<C>;
            for i in 0..N {
                let next_free = if i + 1 < N {
                    (i + 1) as u32
                } else {
                    NO_FREE_CELL
                };
                slots.add(i).write(Slot { next_free });
            }
        }
        let base = raw as usize;
        self.blocks.push(block);
        self.block_set.insert(base);
        log::debug!(
            "{:?} pool grew to {} blocks ({} cells each)",
            self.pool,
            self.blocks.len(),
            N
        );
        base
    }

    #[inline]
    fn slot_ptr(block: NonNull<Block<C, N>>, index: usize) -> *mut Slot<C> {
        debug_assert!(index < N);
        // SAFETY: index < N keeps the pointer inside the slot array.
        unsafe { ((&raw mut (*block.as_ptr()).slots) as *mut Slot<C>).add(index) }
    }

    /// Pop a free slot, marking it live. The body is uninitialised and must
    /// be written by the caller before the next collection.
    pub(crate) fn take_free_slot(&mut self) -> Option<NonNull<C>> {
        while let Some(&block) = self.blocks.get(self.first_block_with_possible_space) {
            // SAFETY: blocks stay allocated while they are in `self.blocks`.
            let header = unsafe { &mut (*block.as_ptr()).header };
            if header.free_list != NO_FREE_CELL {
                let index = header.free_list as usize;
                let slot = Self::slot_ptr(block, index);
                // SAFETY: a slot on the free list holds its `next_free` link.
                header.free_list = unsafe { (*slot).next_free };
                header.live.set(index);
                header.used_cells += 1;
                self.live_objects += 1;
                return NonNull::new(slot as *mut C);
            }
            self.first_block_with_possible_space += 1;
        }
        None
    }

    /// Block and slot index of `addr` if it is the exact start of a slot in
    /// one of this pool's blocks.
    #[inline]
    fn locate(&self, addr: usize) -> Option<(NonNull<Block<C, N>>, usize)> {
        let base = addr & BLOCK_MASK;
        if !self.block_set.contains(&base) {
            return None;
        }
        let delta = (addr & BLOCK_OFFSET_MASK).checked_sub(Self::SLOTS_OFFSET)?;
        if delta % Self::SLOT_SIZE != 0 {
            return None;
        }
        let index = delta / Self::SLOT_SIZE;
        if index >= N {
            return None;
        }
        let block = NonNull::new(base as *mut Block<C, N>)?;
        Some((block, index))
    }

    #[inline]
    fn header(&self, block: NonNull<Block<C, N>>) -> &BlockHeader {
        // SAFETY: `block` came from `locate`, so it is one of ours.
        let header = unsafe { &(*block.as_ptr()).header };
        debug_assert_eq!(header.heap_id, self.heap_id);
        debug_assert_eq!(header.pool, self.pool);
        header
    }

    /// The live cell starting at `addr`, if any.
    pub(crate) fn cell_at(&self, addr: usize) -> Option<NonNull<C>> {
        let (block, index) = self.locate(addr)?;
        if self.header(block).live.get(index) {
            NonNull::new(addr as *mut C)
        } else {
            None
        }
    }

    /// Set the mark bit of the live cell at `addr`. Returns the cell only if
    /// it was not already marked.
    pub(crate) fn mark(&mut self, addr: usize) -> Option<NonNull<C>> {
        let (block, index) = self.locate(addr)?;
        // SAFETY: `block` is one of ours and no other reference to its
        // header is live.
        let header = unsafe { &mut (*block.as_ptr()).header };
        if !header.live.get(index) || header.marked.get(index) {
            return None;
        }
        header.marked.set(index);
        NonNull::new(addr as *mut C)
    }

    pub(crate) fn is_marked(&self, addr: usize) -> bool {
        self.locate(addr)
            .is_some_and(|(block, index)| self.header(block).marked.get(index))
    }

    pub(crate) fn clear_marks(&mut self) {
        for block in &self.blocks {
            // SAFETY: blocks stay allocated while they are in `self.blocks`.
            unsafe { (*block.as_ptr()).header.marked.clear() };
        }
    }

    /// Visit every live cell.
    pub(crate) fn for_each_live(&self, mut f: impl FnMut(&C)) {
        for &block in &self.blocks {
            // SAFETY: live slots hold initialised cells.
            let header = unsafe { &(*block.as_ptr()).header };
            for index in header.live.iter_unmarked(&CellBitmap::EMPTY) {
                let slot = Self::slot_ptr(block, index);
                f(unsafe { &*(slot as *const C) });
            }
        }
    }

    /// Free every live, unmarked cell. Cells that need dropping are moved out
    /// and handed to `finalize`; trivially destructible cells are simply
    /// relinked. Empty blocks beyond `spare_empty_blocks` are released.
    pub(crate) fn sweep(
        &mut self,
        spare_empty_blocks: usize,
        mut finalize: impl FnMut(C),
    ) -> SweepResult {
        let mut result = SweepResult::default();
        let mut dead = std::mem::take(&mut self.sweep_buffer);

        for &block in &self.blocks {
            dead.clear();
            // SAFETY: blocks stay allocated while they are in `self.blocks`.
            let header = unsafe { &mut (*block.as_ptr()).header };
            dead.extend(header.live.iter_unmarked(&header.marked));
            for &index in &dead {
                let slot = Self::slot_ptr(block, index);
                if needs_drop::<C>() {
                    // SAFETY: the slot is live, so its body is initialised;
                    // it is overwritten by the free-list link just below.
                    finalize(unsafe { ptr::read(slot as *const C) });
                }
                // SAFETY: the body has been moved out or needs no drop.
                unsafe { (*slot).next_free = header.free_list };
                header.free_list = index as u32;
                header.live.unset(index);
                header.used_cells -= 1;
                result.freed += 1;
            }
        }
        dead.clear();
        self.sweep_buffer = dead;

        let mut empty_seen = 0;
        let mut i = 0;
        while let Some(&block) = self.blocks.get(i) {
            // SAFETY: as above.
            let used = unsafe { (*block.as_ptr()).header.used_cells };
            if used == 0 {
                empty_seen += 1;
                if empty_seen > spare_empty_blocks {
                    self.release_block(i);
                    result.released_blocks += 1;
                    continue;
                }
            }
            i += 1;
        }
        if result.released_blocks > 0 {
            log::debug!(
                "{:?} pool released {} empty blocks, {} remain",
                self.pool,
                result.released_blocks,
                self.blocks.len()
            );
        }

        self.live_objects -= result.freed;
        self.live_at_last_collect = self.live_objects;
        self.first_block_with_possible_space = 0;
        result
    }

    fn release_block(&mut self, index: usize) {
        if index >= self.blocks.len() {
            return;
        }
        let block = self.blocks.swap_remove(index);
        self.block_set.remove(&(block.as_ptr() as usize));
        // SAFETY: the block is empty and was allocated with this layout.
        unsafe { alloc::dealloc(block.as_ptr() as *mut u8, Self::layout()) };
    }
}

impl<C, const N: usize> Drop for CollectorHeap<C, N> {
    fn drop(&mut self) {
        for &block in &self.blocks {
            if needs_drop::<C>() {
                // SAFETY: live slots hold initialised cells, dropped once.
                let header = unsafe { &(*block.as_ptr()).header };
                for index in header.live.iter_unmarked(&CellBitmap::EMPTY) {
                    let slot = Self::slot_ptr(block, index);
                    unsafe { ptr::drop_in_place(slot as *mut C) };
                }
            }
            // SAFETY: allocated in `grow` with this layout.
            unsafe { alloc::dealloc(block.as_ptr() as *mut u8, Self::layout()) };
        }
    }
}

pub(crate) type PrimaryHeap = CollectorHeap<ObjectCell, PRIMARY_CELLS_PER_BLOCK>;
pub(crate) type NumberHeap = CollectorHeap<NumberCell, NUMBER_CELLS_PER_BLOCK>;
