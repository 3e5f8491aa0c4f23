//! The 8-byte metadata word preceding every allocation.
//!
//! The two least-significant bits are a tag selecting among four variants;
//! the remaining 62 bits are the variant's payload:
//!
//! ```text
//! bits 1..0  tag
//! bits 63..2 payload
//!   tag 00: address of an external layout descriptor (8-aligned, so the
//!           low bits of the address are free to hold the tag)
//!   tag 01: forwarding address of a relocated allocation
//!   tag 10: payload size in bytes, shifted left by 2
//!   tag 11: inline pointer map of 31 two-bit slots, first field topmost
//! ```
//!
//! The forwarding variant only ever exists transiently inside a collection
//! cycle: the compacting pass turns the origin header of a moved allocation
//! into a forwarding word so incoming pointers can be rewritten, and the
//! reclaim pass retires it.

/// Size of a header in bytes; the payload follows immediately after.
pub const HEADER_SIZE: usize = 8;

/// The variant selected by a header's low two bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// Address of a layout descriptor allocated elsewhere in the heap.
    External,
    /// New address of the relocated allocation.
    Forwarding,
    /// Byte size of a payload containing no pointers.
    RawSize,
    /// Inline pointer map.
    PtrMap,
}

/// A header word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Header(u64);

impl Header {
    /// Header for a pointer-free payload of `size` bytes.
    pub fn raw_size(size: u64) -> Self {
        debug_assert!(size < 1 << 62, "size does not fit the header payload");
        Self(size << 2 | 0b10)
    }

    /// Header carrying a 62-bit inline pointer map.
    pub fn ptr_map(map: u64) -> Self {
        debug_assert!(map < 1 << 62, "map does not fit the header payload");
        Self(map << 2 | 0b11)
    }

    /// Header referring to a layout descriptor stored at `addr`.
    pub fn external(addr: usize) -> Self {
        debug_assert!(addr % HEADER_SIZE == 0, "descriptor address must be 8-aligned");
        Self(addr as u64)
    }

    /// Forwarding header carrying the allocation's new payload address.
    pub fn forwarding(addr: usize) -> Self {
        debug_assert!(addr % HEADER_SIZE == 0, "forwarding address must be 8-aligned");
        Self(addr as u64 | 0b01)
    }

    /// Reinterpret a raw 64-bit word as a header.
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// The raw 64-bit word.
    pub fn bits(self) -> u64 {
        self.0
    }

    /// The variant encoded in the low two bits.
    pub fn tag(self) -> Tag {
        match self.0 & 0b11 {
            0b00 => Tag::External,
            0b01 => Tag::Forwarding,
            0b10 => Tag::RawSize,
            _ => Tag::PtrMap,
        }
    }

    /// Payload size of a [`Tag::RawSize`] header.
    pub fn size(self) -> u64 {
        debug_assert_eq!(self.tag(), Tag::RawSize);
        self.0 >> 2
    }

    /// The 62-bit map of a [`Tag::PtrMap`] header.
    pub fn map_bits(self) -> u64 {
        debug_assert_eq!(self.tag(), Tag::PtrMap);
        self.0 >> 2
    }

    /// The address carried by an external or forwarding header.
    pub fn address(self) -> usize {
        debug_assert!(matches!(self.tag(), Tag::External | Tag::Forwarding));
        (self.0 & !0b11) as usize
    }

    /// Read the header preceding the payload at `payload`.
    ///
    /// # Safety
    /// `payload - 8` must be readable and hold a header word.
    pub unsafe fn read(payload: usize) -> Self {
        // SAFETY: the caller guarantees the word before `payload` is a header.
        Self::from_bits(unsafe { core::ptr::read((payload - HEADER_SIZE) as *const u64) })
    }

    /// Overwrite the header preceding the payload at `payload`.
    ///
    /// # Safety
    /// `payload - 8` must be writable and belong to this allocation.
    pub unsafe fn write(payload: usize, header: Self) {
        // SAFETY: the caller guarantees the word before `payload` is this
        // allocation's header.
        unsafe { core::ptr::write((payload - HEADER_SIZE) as *mut u64, header.0) };
    }

}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.tag() {
            Tag::External => write!(f, "Header::External({:#x})", self.address()),
            Tag::Forwarding => write!(f, "Header::Forwarding({:#x})", self.address()),
            Tag::RawSize => write!(f, "Header::RawSize({})", self.size()),
            Tag::PtrMap => write!(f, "Header::PtrMap({:#x})", self.map_bits()),
        }
    }
}
