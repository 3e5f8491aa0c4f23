//! Mark-compact garbage-collected heap for conservatively rooted programs
//!
//! This crate provides a [`Heap`]: a fixed-size memory region with a precise,
//! moving, mark-compact collector on top. A program requests typed
//! allocations (described by a layout descriptor string such as `"i**"`) or
//! raw byte buffers, and never frees anything: when usage crosses the
//! configured threshold, or free space runs out, the collector traces the
//! live objects from the program's call stack and registers, slides them
//! towards one edge of the region, rewrites the pointers stored inside heap
//! objects and reclaims the rest.
//!
//! # Usage
//! ```no_run
//! use compactgc::Heap;
//!
//! // 64 KiB region, unsafe stack (stack-reachable objects are pinned),
//! // collect when usage would reach 75%.
//! let mut heap = Heap::new(64 * 1024, true, 0.75);
//!
//! // A pair of ints and a pointer to a raw buffer:
//! let node = heap.alloc_struct("2i*").expect("out of memory");
//! let data = heap.alloc_raw(256).expect("out of memory");
//! unsafe {
//!     // The pointer field sits after the two (padded) ints.
//!     *(node.as_ptr().add(8) as *mut *mut u8) = data.as_ptr();
//! }
//!
//! let reclaimed = heap.collect();
//! println!("collected {reclaimed} bytes");
//! drop(heap); // releases the region
//! ```
//!
//! # Memory layout
//! Every allocation is a single 8-byte header followed by its payload,
//! 8-aligned and a multiple of 8 bytes long:
//!
//! ```text
//! region:  hhhh hhhh pppp pppp pppp pppp hhhh hhhh pppp pppp 0000 0000 ...
//!          ^-------- ^-----------------  ^-------- ^-------- free
//!          header    payload (16 B)      header    payload
//! ```
//!
//! The header's two low bits select how the payload's pointers are found: an
//! inline 31-slot pointer map, a plain size for pointer-free payloads, or
//! the address of a descriptor string copied onto the heap when the map
//! would overflow. During a collection a fourth variant appears transiently:
//! the old header of a moved object becomes a forwarding word carrying the
//! new address, which is how incoming pointers get rewritten.
//!
//! An allocation bitmap with one bit per 8-byte unit backs both the
//! allocator (first-fit search for a free run, alternating the fill
//! direction each cycle) and the collector (liveness, pinning, tombstones).
//!
//! # Stack safety
//! The collector scans the stack conservatively: any word-aligned value that
//! looks like a live payload address is a root. What it may *not* do is
//! rewrite those stack words, since an integer is indistinguishable from a
//! pointer. Created with `unsafe_stack = true`, the heap pins every
//! stack-reachable object during collection, so existing raw pointers stay
//! valid; interior objects only reachable through heap-resident (typed)
//! pointers are still moved and rewired. With `unsafe_stack = false` nothing
//! is pinned and the mutator must not rely on stack-held addresses across an
//! allocating call.

#![warn(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

mod bitmap;
mod collect;
mod header;
mod heap;
mod layout;
mod ptr_set;
mod stack;

pub use heap::{default_heap, Heap};
