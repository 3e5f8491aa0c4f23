//! The collector: root discovery, trace, compact, rewrite, reclaim.
//!
//! A collection runs synchronously on the mutator's thread, inside an
//! allocating call or an explicit [`Heap::collect`]. The phases, in order:
//!
//! 1. **Root discovery** — every word-aligned value in the stack interval
//!    that passes the payload-candidate check becomes a root.
//! 2. **Trace** — the ordered live set is built from the roots by following
//!    the pointer slots each header describes; external layout descriptors
//!    are live objects in their own right.
//! 3. **Compact** — the bitmap is rebuilt from scratch. Under an unsafe
//!    stack, root footprints are re-marked first so those objects stay put.
//!    Everything else is relocated to the first fitting run in the current
//!    fill direction; a moved object's origin header becomes a forwarding
//!    word whose bitmap unit survives as a tombstone.
//! 4. **Rewrite** — the object graph is walked once from the roots; every
//!    interior pointer whose target forwards is replaced with the new
//!    address. Stack slots are never rewritten.
//! 5. **Reclaim** — free-standing tombstone units are cleared, leaving the
//!    bitmap describing exactly the compacted live set.
//!
//! The fill direction flips at the end of each cycle.

use log::{debug, trace};

use crate::bitmap::{Direction, UNIT};
use crate::header::{Header, Tag, HEADER_SIZE};
use crate::heap::{align_up, Heap};
use crate::ptr_set::PtrSet;
use crate::stack::{self, StackBounds};

impl Heap {
    /// Run one collection cycle and return the number of payload bytes
    /// reclaimed.
    pub fn collect(&mut self) -> usize {
        let mode = self.unsafe_stack;
        self.collect_with(mode)
    }

    /// Run one collection cycle with the stack-safety flag overridden for
    /// this cycle only.
    pub fn collect_with(&mut self, unsafe_stack: bool) -> usize {
        let spill = stack::spill_registers();
        let bounds = stack::current_bounds();

        let roots = self.find_roots(&bounds);
        let live = self.trace(&roots);
        trace!(
            "collection: {} roots, {} live objects, {} bytes used, cursor at {}",
            roots.len(),
            live.len(),
            self.used,
            self.cursor
        );

        let (reclaimed, tombstones) = self.compact(&roots, &live, unsafe_stack);
        self.rewrite(&roots);
        self.reclaim(&tombstones);
        self.flip_direction();

        std::hint::black_box(&spill);
        debug!(
            "collection reclaimed {reclaimed} bytes; {} objects live, {} bytes used",
            live.len(),
            self.used
        );
        reclaimed
    }

    /// Scan the stack interval for values that qualify as live payload
    /// addresses and collect them as roots. Duplicates are absorbed by the
    /// set.
    fn find_roots(&self, bounds: &StackBounds) -> PtrSet {
        let word = core::mem::size_of::<usize>();
        let mut roots = PtrSet::new();
        let mut addr = align_up(bounds.low, word);
        while addr + word <= bounds.high {
            // SAFETY: `addr` lies inside this thread's mapped stack.
            let value = unsafe { core::ptr::read_volatile(addr as *const usize) };
            if self.is_payload_candidate(value) {
                roots.insert(value);
            }
            addr += word;
        }
        if roots.is_empty() {
            trace!("stack scan found no roots");
        }
        roots
    }

    /// Compute the ordered set of live allocations reachable from the roots.
    /// Insertion into the set doubles as the visited check, which terminates
    /// traversal of cyclic graphs.
    fn trace(&self, roots: &PtrSet) -> PtrSet {
        let mut live = PtrSet::new();
        let mut pending = roots.clone();
        while let Some(object) = pending.pop_min() {
            if !live.insert(object) {
                continue;
            }

            // SAFETY: `object` passed the candidate check against the
            // current bitmap, so its header is readable and live.
            let header = unsafe { Header::read(object) };
            if header.tag() == Tag::External && self.is_payload_candidate(header.address()) {
                // The descriptor allocation is itself live.
                pending.insert(header.address());
            }

            // SAFETY: as above; slot addresses lie inside the allocation.
            let slots = unsafe { self.pointer_slots_at(object) };
            for slot in slots.iter() {
                // SAFETY: `slot` is payload memory of a live allocation.
                let value = unsafe { core::ptr::read(slot as *const usize) };
                if self.is_payload_candidate(value) && !live.contains(value) {
                    pending.insert(value);
                }
            }
        }
        live
    }

    /// Rebuild the bitmap with every live allocation packed against the
    /// current fill edge. Returns the payload bytes reclaimed and the region
    /// offsets of the forwarding tombstones that stand on otherwise-free
    /// units.
    fn compact(
        &mut self,
        roots: &PtrSet,
        live: &PtrSet,
        unsafe_stack: bool,
    ) -> (usize, Vec<usize>) {
        let old_used = self.used;
        self.map.clear_all();
        self.used = 0;
        self.cursor = match self.dir {
            Direction::Ascending => 0,
            Direction::Descending => self.size,
        };
        let mut tombstones = Vec::new();

        if unsafe_stack {
            // Objects directly reachable from the stack must keep their
            // addresses: re-mark their footprints before anything moves.
            for index in 0..roots.len() {
                let root = match roots.nth(index) {
                    Some(root) => root,
                    None => break,
                };
                // SAFETY: every root passed the candidate check.
                let payload = align_up(unsafe { self.alloc_size_at(root) }.max(1), UNIT);
                let origin = self.offset_of(root) - HEADER_SIZE;
                self.map.mark_range(origin, HEADER_SIZE + payload);
                self.used += payload;
            }
        }

        // Relocate in fill order so a destination can never cross an
        // allocation that has not been processed yet.
        for index in 0..live.len() {
            let position = match self.dir {
                Direction::Ascending => index,
                Direction::Descending => live.len() - 1 - index,
            };
            let object = match live.nth(position) {
                Some(object) => object,
                None => break,
            };
            if unsafe_stack && roots.contains(object) {
                continue;
            }
            self.relocate(object, &mut tombstones);
        }

        (old_used.saturating_sub(self.used), tombstones)
    }

    /// Move one live allocation to the first fitting run, or re-mark it in
    /// place when it already sits there.
    fn relocate(&mut self, object: usize, tombstones: &mut Vec<usize>) {
        // SAFETY: `object` is live; its header precedes it.
        let mut header = unsafe { Header::read(object) };

        // If this object's layout descriptor was moved earlier in this pass,
        // re-anchor the header before the descriptor's old bytes can be
        // overwritten by a later move.
        if header.tag() == Tag::External {
            let descriptor = header.address();
            if self.in_region_payload(descriptor) {
                // SAFETY: the descriptor address was validated during trace.
                let descriptor_header = unsafe { Header::read(descriptor) };
                if descriptor_header.tag() == Tag::Forwarding {
                    header = Header::external(descriptor_header.address());
                    // SAFETY: rewriting this object's own header word.
                    unsafe { Header::write(object, header) };
                }
            }
        }

        // SAFETY: the header is live and its descriptor, if any, intact.
        let payload = align_up(unsafe { self.alloc_size_at(object) }.max(1), UNIT);
        let total = HEADER_SIZE + payload;
        let origin = self.offset_of(object) - HEADER_SIZE;

        let Some(destination) = self.try_place(total) else {
            // The live set genuinely does not fit: the heap is full.
            panic!("heap exhausted during collection: no destination for {total} bytes");
        };

        if destination == origin {
            self.map.mark_range(destination, total);
            self.used += payload;
            return;
        }

        self.map.mark_range(destination, total);
        self.map.mark(origin);
        let destination_addr = self.address_at(destination);
        // SAFETY: source and destination extents both lie inside the region;
        // `copy` tolerates the self-overlap of short moves.
        unsafe {
            core::ptr::copy(
                self.address_at(origin) as *const u8,
                destination_addr as *mut u8,
                total,
            );
            Header::write(object, Header::forwarding(destination_addr + HEADER_SIZE));
        }
        self.used += payload;

        // A tombstone inside the destination extent is now part of the moved
        // object's bytes; its unit must stay marked. Only free-standing
        // tombstones may be cleared during reclaim.
        if origin >= destination + total || origin < destination {
            tombstones.push(origin);
        }
    }

    /// Walk the object graph once from the roots and replace every interior
    /// pointer whose target carries a forwarding header with the new
    /// address. Stack slots are left untouched in both stack-safety modes;
    /// under an unsafe stack the roots did not move, and under a safe stack
    /// the mutator re-derives its pointers.
    fn rewrite(&mut self, roots: &PtrSet) {
        let mut visited = PtrSet::new();
        let mut work: Vec<usize> = Vec::new();

        for root in roots.iter() {
            // SAFETY: the root's origin header survives until reclaim, so a
            // moved root can be followed to its new address here.
            let header = unsafe { Header::read(root) };
            work.push(if header.tag() == Tag::Forwarding {
                header.address()
            } else {
                root
            });
        }

        while let Some(object) = work.pop() {
            if !visited.insert(object) {
                continue;
            }

            // SAFETY: `object` is a live allocation at its final address.
            let header = unsafe { Header::read(object) };
            if header.tag() == Tag::External {
                let descriptor = header.address();
                if self.in_region_payload(descriptor) {
                    // SAFETY: descriptor addresses stay readable all cycle.
                    let descriptor_header = unsafe { Header::read(descriptor) };
                    if descriptor_header.tag() == Tag::Forwarding {
                        // SAFETY: updating this object's own header word.
                        unsafe {
                            Header::write(
                                object,
                                Header::external(descriptor_header.address()),
                            );
                        }
                    }
                }
            }

            // SAFETY: the header (re-anchored above if needed) describes the
            // object's pointer slots.
            let slots = unsafe { self.pointer_slots_at(object) };
            for slot in slots.iter() {
                // SAFETY: `slot` is payload memory of a live allocation.
                let mut value = unsafe { core::ptr::read(slot as *const usize) };
                if !self.in_region_payload(value) {
                    continue;
                }
                // SAFETY: `value` addresses heap memory with a header word
                // before it (possibly a tombstone of this cycle).
                let target_header = unsafe { Header::read(value) };
                if target_header.tag() == Tag::Forwarding {
                    value = target_header.address();
                    // SAFETY: writing back into the slot just read.
                    unsafe { core::ptr::write(slot as *mut usize, value) };
                }
                work.push(value);
            }
        }
    }

    /// Clear the bitmap units of the free-standing forwarding tombstones.
    /// Afterwards the bitmap reflects exactly the compacted live set.
    fn reclaim(&mut self, tombstones: &[usize]) {
        for &offset in tombstones {
            self.map.clear(offset);
        }
    }
}
