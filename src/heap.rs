//! The heap: region ownership, the allocator and the mutator-facing API.
//!
//! A heap owns a fixed-size zeroed region, the allocation bitmap covering it,
//! a bump cursor and the current fill direction. Allocation is a free-region
//! search over the bitmap: the first run of clear units large enough for
//! header plus payload is claimed, the header is written, the payload zeroed
//! and the run marked. When an allocation would push usage past the
//! collection threshold, or no run fits, a collection runs first; if space is
//! still missing afterwards the allocation fails.
//!
//! The first heap created while the process-wide slot is empty becomes the
//! [`default_heap`]; dropping that heap clears the slot again.

use core::ptr::{self, NonNull};
use std::alloc::{self, handle_alloc_error};

use log::debug;

use crate::bitmap::{AllocMap, Direction, UNIT};
use crate::header::{Header, Tag, HEADER_SIZE};
use crate::layout::{self, Encoding};
use crate::ptr_set::PtrSet;
use crate::stack;

/// Region sizes round up to this many bytes (one bitmap byte's span).
pub const REGION_ALIGN: usize = 64;

/// Round `value` up to a multiple of `to` (a power of two).
pub(crate) const fn align_up(value: usize, to: usize) -> usize {
    (value + to - 1) & !(to - 1)
}

/// Round a requested byte count up to a whole unit, refusing requests close
/// enough to `usize::MAX` that the rounding itself would wrap.
fn checked_align_up(value: usize) -> Option<usize> {
    Some(value.checked_add(UNIT - 1)? / UNIT * UNIT)
}

/// A mark-compact garbage-collected heap for a conservatively rooted,
/// single-threaded mutator.
///
/// Allocations are served from a fixed region created up front. The mutator
/// requests typed allocations via [`alloc_struct`](Self::alloc_struct) (the
/// layout descriptor records where pointers live) or untyped byte buffers via
/// [`alloc_raw`](Self::alloc_raw). Collection relocates live allocations
/// towards one edge of the region and rewrites pointers stored inside heap
/// objects; pointers held on the mutator's stack are never rewritten, so
/// a mutator that keeps raw pointers across an allocating call must either
/// create the heap in unsafe-stack mode (stack-reachable objects are then
/// pinned) or re-derive its pointers afterwards.
///
/// Dropping the heap releases the region; `drop(heap)` is the `delete`
/// operation of the mutator API.
pub struct Heap {
    /// Start of the owned region.
    region: NonNull<u8>,
    /// Region size in bytes, a multiple of [`REGION_ALIGN`].
    pub(crate) size: usize,
    /// Liveness bitmap covering the region.
    pub(crate) map: AllocMap,
    /// Last placement point of the free-region search.
    pub(crate) cursor: usize,
    /// Edge fresh allocations are taken from; flipped after each collection.
    pub(crate) dir: Direction,
    /// Usage fraction in (0, 1] at which an allocation triggers a collection.
    threshold: f64,
    /// Whether stack slots may hold values that must not be overwritten.
    /// When set, objects directly reachable from the stack are pinned.
    pub(crate) unsafe_stack: bool,
    /// Sum of live payload bytes, maintained by alloc and collect.
    pub(crate) used: usize,
}

/// The process-wide default-heap slot. Only the address is shared; the heap
/// behind it is single-threaded.
struct DefaultSlot(Option<NonNull<Heap>>);

// SAFETY: the slot stores a bare address. All operations on the heap it
// names happen on the thread owning that heap.
unsafe impl Send for DefaultSlot {}

static DEFAULT_HEAP: spin::Mutex<DefaultSlot> = spin::Mutex::new(DefaultSlot(None));

/// The designated process-wide heap, if one is currently alive.
///
/// The slot is claimed by the first [`Heap::new`] while it is empty and
/// cleared when that heap is dropped; heaps created in between do not
/// disturb it.
pub fn default_heap() -> Option<NonNull<Heap>> {
    DEFAULT_HEAP.lock().0
}

impl Heap {
    /// Create a heap with (at least) `bytes` of region, rounded up to
    /// [`REGION_ALIGN`]. The region starts zeroed.
    ///
    /// `unsafe_stack` selects whether stack slots are treated as unsafe to
    /// overwrite (see the type-level docs); `threshold` is the usage
    /// fraction at which an allocation triggers a collection first.
    ///
    /// # Panics
    /// Panics if `threshold` is outside `(0, 1]`.
    pub fn new(bytes: usize, unsafe_stack: bool, threshold: f64) -> Box<Self> {
        assert!(
            threshold > 0.0 && threshold <= 1.0,
            "collection threshold must lie in (0, 1]"
        );
        let size = match bytes.max(REGION_ALIGN).checked_add(REGION_ALIGN - 1) {
            Some(padded) => padded / REGION_ALIGN * REGION_ALIGN,
            None => panic!("requested region size overflows"),
        };

        let region_layout = match alloc::Layout::from_size_align(size, REGION_ALIGN) {
            Ok(layout) => layout,
            Err(_) => panic!("requested region size is not allocatable"),
        };
        // SAFETY: `region_layout` has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(region_layout) };
        let Some(region) = NonNull::new(raw) else {
            handle_alloc_error(region_layout);
        };

        let heap = Box::new(Self {
            region,
            size,
            map: AllocMap::new(size),
            cursor: 0,
            dir: Direction::Ascending,
            threshold,
            unsafe_stack,
            used: 0,
        });

        let mut slot = DEFAULT_HEAP.lock();
        if slot.0.is_none() {
            slot.0 = Some(NonNull::from(&*heap));
        }
        drop(slot);

        debug!(
            "heap created: region {:#x}..{:#x}, threshold {threshold}, unsafe_stack {unsafe_stack}",
            heap.base(),
            heap.limit()
        );
        heap
    }

    /// Allocate a typed object described by a layout descriptor.
    ///
    /// The payload is zeroed and its address 8-aligned. Returns `None` when
    /// the descriptor is invalid or no space is left even after a collection.
    pub fn alloc_struct(&mut self, descriptor: &str) -> Option<NonNull<u8>> {
        let desc = descriptor.as_bytes();
        let encoding = layout::encode(desc).ok()?;
        let size = layout::size_from_str(desc).ok()?;

        let payload = checked_align_up(usize::try_from(size).ok()?.max(1))?;
        let total = payload.checked_add(HEADER_SIZE)?;
        if total > self.size {
            return None;
        }

        match encoding {
            Encoding::Size(_) => {
                self.maybe_collect_for(total);
                let at = self.place_or_collect(total)?;
                // SAFETY: `at` addresses a free run of `total` bytes.
                Some(unsafe { self.commit(at, Header::raw_size(payload as u64), payload) })
            }
            Encoding::PtrMap(bits) => {
                self.maybe_collect_for(total);
                let at = self.place_or_collect(total)?;
                // SAFETY: `at` addresses a free run of `total` bytes.
                Some(unsafe { self.commit(at, Header::ptr_map(bits), payload) })
            }
            Encoding::External => {
                // The descriptor itself goes onto the heap as a raw
                // allocation. Any collection must happen before the copy is
                // written: a cycle in between would move the copy while only
                // this frame still refers to it.
                let copy_payload = align_up(desc.len() + 1, UNIT);
                let copy_total = copy_payload + HEADER_SIZE;
                let combined = total.checked_add(copy_total)?;
                if combined > self.size {
                    return None;
                }
                if self.threshold_hit(combined)
                    || self.map.first_fit(combined, self.dir).is_none()
                {
                    self.collect();
                }

                let copy_at = self.try_place(copy_total)?;
                // SAFETY: `copy_at` addresses a free run of `copy_total` bytes.
                let copy = unsafe {
                    self.commit(copy_at, Header::raw_size(copy_payload as u64), copy_payload)
                };
                // SAFETY: the copy's payload holds `desc.len() + 1` zeroed
                // bytes, so the text fits and stays NUL-terminated.
                unsafe {
                    ptr::copy_nonoverlapping(desc.as_ptr(), copy.as_ptr(), desc.len());
                }

                let at = self.try_place(total)?;
                // SAFETY: `at` addresses a free run of `total` bytes.
                Some(unsafe {
                    self.commit(at, Header::external(copy.as_ptr() as usize), payload)
                })
            }
        }
    }

    /// Allocate `bytes` of untyped memory. The payload is zeroed, 8-aligned
    /// and never traced for pointers. Zero-byte requests still occupy one
    /// unit so the allocation has a scannable footprint.
    pub fn alloc_raw(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        let payload = checked_align_up(bytes.max(1))?;
        let total = payload.checked_add(HEADER_SIZE)?;
        if total > self.size {
            return None;
        }

        self.maybe_collect_for(total);
        let at = self.place_or_collect(total)?;
        // SAFETY: `at` addresses a free run of `total` bytes.
        Some(unsafe { self.commit(at, Header::raw_size(payload as u64), payload) })
    }

    /// Bytes currently used by live payloads (headers excluded).
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes not covered by any allocation, derived from the bitmap.
    pub fn available(&self) -> usize {
        (self.map.units() - self.map.count_set()) * UNIT
    }

    /// Tear the heap down, first overwriting every stack slot that points
    /// into its region with `poison`, so dangling references left behind by
    /// the mutator are recognizable instead of silently reading freed memory.
    pub fn delete_with_poison(this: Box<Self>, poison: usize) {
        let spill = stack::spill_registers();
        let bounds = stack::current_bounds();
        let base = this.base();
        let limit = this.limit();

        let mut addr = align_up(bounds.low, core::mem::size_of::<usize>());
        while addr + core::mem::size_of::<usize>() <= bounds.high {
            // SAFETY: `addr` lies inside this thread's mapped stack.
            let value = unsafe { ptr::read_volatile(addr as *const usize) };
            if value > base && value < limit {
                // SAFETY: the slot was just read; its value dangles once the
                // region is gone, so overwriting it cannot break live state.
                unsafe { ptr::write_volatile(addr as *mut usize, poison) };
            }
            addr += core::mem::size_of::<usize>();
        }
        std::hint::black_box(&spill);
        drop(this);
    }

    // --- region geometry -------------------------------------------------

    /// First address of the region.
    pub(crate) fn base(&self) -> usize {
        self.region.as_ptr() as usize
    }

    /// One past the last address of the region.
    pub(crate) fn limit(&self) -> usize {
        self.base() + self.size
    }

    /// Byte offset of `addr` from the region start.
    pub(crate) fn offset_of(&self, addr: usize) -> usize {
        debug_assert!(addr >= self.base() && addr <= self.limit());
        addr - self.base()
    }

    /// Absolute address of the byte at region offset `offset`.
    pub(crate) fn address_at(&self, offset: usize) -> usize {
        debug_assert!(offset <= self.size);
        self.base() + offset
    }

    /// Whether `addr` could be a payload address at all: 8-aligned and far
    /// enough inside the region to have a header before it. This is the only
    /// validation applied to pointers read out of typed heap slots.
    pub(crate) fn in_region_payload(&self, addr: usize) -> bool {
        addr % UNIT == 0 && addr >= self.base() + HEADER_SIZE && addr < self.limit()
    }

    /// Whether `addr` is admissible as a root or trace target: an in-region,
    /// bitmap-live payload address whose header word decodes to a live
    /// variant describing an allocation that fits where it claims to sit.
    ///
    /// The check is conservative by nature: a stack value pointing into the
    /// middle of an allocation can pass it if the bytes before it happen to
    /// decode as a plausible header. That is inherent to scanning untyped
    /// stacks and bounded by the validation here.
    pub(crate) fn is_payload_candidate(&self, addr: usize) -> bool {
        if !self.in_region_payload(addr) {
            return false;
        }
        let offset = self.offset_of(addr);
        if !self.map.is_set(offset) || !self.map.is_set(offset - HEADER_SIZE) {
            return false;
        }

        // SAFETY: `addr - 8` is inside the region.
        let header = unsafe { Header::read(addr) };
        if header.bits() == 0 {
            return false;
        }
        let payload = match header.tag() {
            Tag::Forwarding => return false,
            Tag::RawSize => header.size() as usize,
            Tag::PtrMap => layout::size_from_map(header.map_bits()) as usize,
            Tag::External => {
                let desc = header.address();
                if !self.in_region_payload(desc) {
                    return false;
                }
                // SAFETY: `desc` is in-region; the read stops at the region end.
                let Some(bytes) = (unsafe { self.descriptor_at(desc) }) else {
                    return false;
                };
                match layout::size_from_str(bytes) {
                    Ok(size) => size as usize,
                    Err(_) => return false,
                }
            }
        };
        // The allocation's extent is [offset - 8, offset + payload).
        offset + align_up(payload.max(1), UNIT) <= self.size
    }

    // --- header dispatch over region memory ------------------------------

    /// Payload size in bytes of the allocation at `payload`, per its header.
    ///
    /// # Safety
    /// `payload` must address a live allocation of this heap (its header is
    /// read, and an external descriptor is followed).
    ///
    /// # Panics
    /// Panics on a forwarding header or a corrupt descriptor; both mean the
    /// collector's invariants were broken.
    pub(crate) unsafe fn alloc_size_at(&self, payload: usize) -> usize {
        // SAFETY: per this function's contract the header is readable.
        let header = unsafe { Header::read(payload) };
        match header.tag() {
            Tag::RawSize => header.size() as usize,
            Tag::PtrMap => layout::size_from_map(header.map_bits()) as usize,
            Tag::External => {
                // SAFETY: live external headers point at in-region descriptors.
                let bytes = unsafe { self.descriptor_at(header.address()) };
                let Some(bytes) = bytes else {
                    panic!("external descriptor is not NUL-terminated inside the region");
                };
                match layout::size_from_str(bytes) {
                    Ok(size) => size as usize,
                    Err(_) => panic!("corrupt layout descriptor behind a live header"),
                }
            }
            Tag::Forwarding => panic!("forwarding header reached as a live allocation"),
        }
    }

    /// Addresses of the pointer slots inside the allocation at `payload`,
    /// in ascending order.
    ///
    /// # Safety
    /// Same contract as [`alloc_size_at`](Self::alloc_size_at).
    pub(crate) unsafe fn pointer_slots_at(&self, payload: usize) -> PtrSet {
        // SAFETY: per this function's contract the header is readable.
        let header = unsafe { Header::read(payload) };
        let offsets = match header.tag() {
            Tag::PtrMap => layout::offsets_from_map(header.map_bits()),
            Tag::External => {
                // SAFETY: live external headers point at in-region descriptors.
                let bytes = unsafe { self.descriptor_at(header.address()) };
                let Some(bytes) = bytes else {
                    panic!("external descriptor is not NUL-terminated inside the region");
                };
                match layout::offsets_from_str(bytes) {
                    Ok(offsets) => offsets,
                    Err(_) => panic!("corrupt layout descriptor behind a live header"),
                }
            }
            Tag::RawSize | Tag::Forwarding => Vec::new(),
        };

        let mut slots = PtrSet::new();
        for offset in offsets {
            slots.insert(payload + offset as usize);
        }
        slots
    }

    /// The NUL-terminated descriptor text stored at `addr`, without the NUL.
    /// Returns `None` when no terminator exists before the region end.
    ///
    /// # Safety
    /// `addr` must lie inside the region.
    unsafe fn descriptor_at(&self, addr: usize) -> Option<&[u8]> {
        let limit = self.limit();
        let mut end = addr;
        // SAFETY: every address read is below the region limit.
        while end < limit && unsafe { ptr::read(end as *const u8) } != 0 {
            end += 1;
        }
        if end == limit {
            return None;
        }
        // SAFETY: [addr, end) was just verified to be in-region text.
        Some(unsafe { core::slice::from_raw_parts(addr as *const u8, end - addr) })
    }

    // --- free-region protocol --------------------------------------------

    /// Whether usage after adding `total` more bytes reaches the threshold.
    fn threshold_hit(&self, total: usize) -> bool {
        (self.used + total) as f64 / self.size as f64 >= self.threshold
    }

    /// Collect when the threshold would be reached by this request.
    fn maybe_collect_for(&mut self, total: usize) {
        if self.threshold_hit(total) {
            self.collect();
        }
    }

    /// Claim the first free run of `total` bytes in the current direction,
    /// repositioning the bump cursor. Does not mark the bitmap.
    pub(crate) fn try_place(&mut self, total: usize) -> Option<usize> {
        let at = self.map.first_fit(total, self.dir)?;
        self.cursor = match self.dir {
            Direction::Ascending => at + total,
            Direction::Descending => at,
        };
        Some(at)
    }

    /// Like [`try_place`](Self::try_place), but runs one collection when no
    /// run fits and retries once.
    fn place_or_collect(&mut self, total: usize) -> Option<usize> {
        if let Some(at) = self.try_place(total) {
            return Some(at);
        }
        self.collect();
        self.try_place(total)
    }

    /// Write an allocation at region offset `at`: header first, then a
    /// zeroed payload; mark the bitmap and account the payload.
    ///
    /// # Safety
    /// `[at, at + 8 + payload_size)` must be a free in-region run.
    unsafe fn commit(&mut self, at: usize, header: Header, payload_size: usize) -> NonNull<u8> {
        let payload_addr = self.address_at(at) + HEADER_SIZE;
        // SAFETY: the run is in-region per this function's contract.
        unsafe {
            Header::write(payload_addr, header);
            ptr::write_bytes(payload_addr as *mut u8, 0, payload_size);
        }
        self.map.mark_range(at, HEADER_SIZE + payload_size);
        self.used += payload_size;

        // SAFETY: region-interior addresses are never null.
        unsafe { NonNull::new_unchecked(payload_addr as *mut u8) }
    }

    /// Reverse the fill direction and reset the cursor to the new edge.
    /// Invoked by the collector between cycles, so compacted content packs
    /// against one edge while fresh allocations consume the other.
    pub(crate) fn flip_direction(&mut self) {
        self.dir = self.dir.flipped();
        self.cursor = match self.dir {
            Direction::Ascending => 0,
            Direction::Descending => self.size,
        };
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut slot = DEFAULT_HEAP.lock();
        if slot.0.map_or(false, |default| ptr::eq(default.as_ptr(), self)) {
            slot.0 = None;
        }
        drop(slot);

        debug!("heap deleted: region {:#x}..{:#x}", self.base(), self.limit());
        // SAFETY: the region was allocated in `new` with exactly this layout
        // and is not referenced past this point.
        unsafe {
            alloc::dealloc(
                self.region.as_ptr(),
                alloc::Layout::from_size_align_unchecked(self.size, REGION_ALIGN),
            );
        }
    }
}
