//! Layout descriptors and their compact header encodings.
//!
//! A layout descriptor is the user-facing text form `"cildf*"` with optional
//! decimal repetition prefixes: `c`har (1 byte), `i`nt (4), `l`ong (8),
//! `f`loat (4), `d`ouble (8) and `*` for a pointer (8). `"3i"` is `"iii"`,
//! and a bare trailing number counts chars, so `"32"` describes 32 raw bytes.
//! Fields pad to their own natural alignment and the total size rounds up to
//! the alignment of the largest field, exactly like a C struct of those
//! members.
//!
//! Two header encodings are produced from a descriptor:
//!
//! * a plain **size** for layouts without pointers, and
//! * a **pointer map** of up to 31 two-bit slots describing where the
//!   pointers sit inside the payload.
//!
//! A map slot is `01` for a 4-byte non-pointer word, `10` for an 8-byte
//! non-pointer word, `11` for a pointer and `00` for end-of-map. Slots are
//! emitted most-significant-first, so the first field of the layout occupies
//! the topmost slot. Descriptors whose map would need more than 31 slots
//! fall back to an external copy of the descriptor text (see the heap).

/// Number of two-bit slots available in an inline pointer map.
pub const MAP_SLOTS: usize = 31;

const SLOT_FOUR: u8 = 0b01;
const SLOT_EIGHT: u8 = 0b10;
const SLOT_PTR: u8 = 0b11;

/// Why a descriptor could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    /// The descriptor contains a byte outside the grammar.
    InvalidChar(u8),
    /// A size or repetition count does not fit the encoding.
    SizeOverflow,
}

/// Compact representation of a descriptor, as it will live in a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// No pointers: only the payload size needs recording.
    Size(u64),
    /// The 62-bit inline pointer map (tag bits excluded).
    PtrMap(u64),
    /// The map would overflow; the descriptor text itself must be kept.
    External,
}

/// One field kind of the descriptor grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Char,
    Int,
    Long,
    Float,
    Double,
    Ptr,
}

impl Field {
    /// Field size in bytes; the natural alignment is the same value.
    fn size(self) -> u64 {
        match self {
            Self::Char => 1,
            Self::Int | Self::Float => 4,
            Self::Long | Self::Double | Self::Ptr => 8,
        }
    }
}

/// Round `value` up to a multiple of `to`.
fn pad_to(value: u64, to: u64) -> Result<u64, LayoutError> {
    let rem = value % to;
    if rem == 0 {
        Ok(value)
    } else {
        value
            .checked_add(to - rem)
            .ok_or(LayoutError::SizeOverflow)
    }
}

/// Walk the descriptor, invoking `visit` once per field with its repetition
/// count. A bare trailing number is reported as that many chars. The walk
/// stops at the first NUL byte or the end of the slice.
fn walk(
    desc: &[u8],
    mut visit: impl FnMut(Field, u64) -> Result<(), LayoutError>,
) -> Result<(), LayoutError> {
    let mut repeats: u64 = 0;
    for &byte in desc {
        let field = match byte {
            0 => break,
            b'0'..=b'9' => {
                repeats = repeats
                    .checked_mul(10)
                    .and_then(|r| r.checked_add(u64::from(byte - b'0')))
                    .ok_or(LayoutError::SizeOverflow)?;
                continue;
            }
            b'c' => Field::Char,
            b'i' => Field::Int,
            b'l' => Field::Long,
            b'f' => Field::Float,
            b'd' => Field::Double,
            b'*' => Field::Ptr,
            other => return Err(LayoutError::InvalidChar(other)),
        };
        visit(field, repeats.max(1))?;
        repeats = 0;
    }
    if repeats > 0 {
        visit(Field::Char, repeats)?;
    }
    Ok(())
}

/// Total payload size in bytes of the struct a descriptor describes,
/// including interior padding and the trailing padding to the largest
/// field's alignment.
pub fn size_from_str(desc: &[u8]) -> Result<u64, LayoutError> {
    let mut size: u64 = 0;
    let mut largest: u64 = 1;
    walk(desc, |field, repeats| {
        let each = field.size();
        let padded = pad_to(size, each)?;
        let run = repeats
            .checked_mul(each)
            .ok_or(LayoutError::SizeOverflow)?;
        size = padded.checked_add(run).ok_or(LayoutError::SizeOverflow)?;
        largest = largest.max(each);
        Ok(())
    })?;
    pad_to(size, largest)
}

/// Translate a descriptor into its header encoding.
///
/// Pointerless descriptors become [`Encoding::Size`]; descriptors with
/// pointers become an inline map unless more than [`MAP_SLOTS`] slots would
/// be needed, in which case [`Encoding::External`] is reported and the caller
/// keeps the descriptor text instead.
pub fn encode(desc: &[u8]) -> Result<Encoding, LayoutError> {
    let size = size_from_str(desc)?;

    let has_pointer = desc.iter().take_while(|&&b| b != 0).any(|&b| b == b'*');
    if !has_pointer {
        return if size < 1 << 62 {
            Ok(Encoding::Size(size))
        } else {
            Err(LayoutError::SizeOverflow)
        };
    }

    // Emission buffer; one spare slot so overflow is detectable without
    // letting a huge descriptor grow the buffer unboundedly.
    let mut slots: Vec<u8> = Vec::with_capacity(MAP_SLOTS + 1);
    let mut pending: u64 = 0;
    walk(desc, |field, repeats| {
        if field == Field::Ptr {
            flush_pending(&mut slots, &mut pending);
            for _ in 0..repeats.min(MAP_SLOTS as u64 + 1) {
                push_slot(&mut slots, SLOT_PTR);
            }
            Ok(())
        } else {
            let each = field.size();
            let padded = pad_to(pending, each)?;
            let run = repeats
                .checked_mul(each)
                .ok_or(LayoutError::SizeOverflow)?;
            pending = padded.checked_add(run).ok_or(LayoutError::SizeOverflow)?;
            Ok(())
        }
    })?;
    flush_pending(&mut slots, &mut pending);

    if slots.len() > MAP_SLOTS {
        return Ok(Encoding::External);
    }

    let mut bits: u64 = 0;
    for (index, &code) in slots.iter().enumerate() {
        bits |= u64::from(code) << (2 * (MAP_SLOTS - 1 - index));
    }
    Ok(Encoding::PtrMap(bits))
}

/// Emit the pending non-pointer bytes as map slots: 8-byte runs first, then
/// at most one trailing 4-byte slot. The pending count rounds up to 4; the
/// 8-alignment a following pointer needs is implied by the pointer slot
/// itself during size computation.
fn flush_pending(slots: &mut Vec<u8>, pending: &mut u64) {
    let mut bytes = (*pending).saturating_add(3) / 4 * 4;
    *pending = 0;
    while bytes >= 8 {
        push_slot(slots, SLOT_EIGHT);
        bytes -= 8;
        if slots.len() > MAP_SLOTS {
            return; // already overflowed; the count is all that matters now
        }
    }
    if bytes == 4 {
        push_slot(slots, SLOT_FOUR);
    }
}

fn push_slot(slots: &mut Vec<u8>, code: u8) {
    if slots.len() <= MAP_SLOTS {
        slots.push(code);
    }
}

/// Payload size described by a 62-bit pointer map (tag bits excluded).
pub fn size_from_map(bits: u64) -> u64 {
    let mut size: u64 = 0;
    let mut largest: u64 = 4;
    for slot in (0..MAP_SLOTS).rev() {
        match (bits >> (2 * slot)) & 0b11 {
            0 => break,
            1 => size = size + pad_gap(size, 4) + 4,
            _ => {
                size = size + pad_gap(size, 8) + 8;
                largest = 8;
            }
        }
    }
    size + pad_gap(size, largest)
}

/// Byte offsets of the pointer fields described by a map, ascending.
pub fn offsets_from_map(bits: u64) -> Vec<u64> {
    let mut offsets = Vec::new();
    let mut size: u64 = 0;
    for slot in (0..MAP_SLOTS).rev() {
        match (bits >> (2 * slot)) & 0b11 {
            0 => break,
            1 => size = size + pad_gap(size, 4) + 4,
            2 => size = size + pad_gap(size, 8) + 8,
            _ => {
                size = size + pad_gap(size, 8) + 8;
                offsets.push(size - 8);
            }
        }
    }
    offsets
}

/// Byte offsets of the pointer fields of a descriptor, ascending.
pub fn offsets_from_str(desc: &[u8]) -> Result<Vec<u64>, LayoutError> {
    let mut offsets = Vec::new();
    let mut size: u64 = 0;
    walk(desc, |field, repeats| {
        let each = field.size();
        if field == Field::Ptr {
            for _ in 0..repeats {
                size = pad_to(size, 8)?.checked_add(8).ok_or(LayoutError::SizeOverflow)?;
                offsets.push(size - 8);
            }
        } else {
            let run = repeats
                .checked_mul(each)
                .ok_or(LayoutError::SizeOverflow)?;
            size = pad_to(size, each)?
                .checked_add(run)
                .ok_or(LayoutError::SizeOverflow)?;
        }
        Ok(())
    })?;
    Ok(offsets)
}

/// Padding needed to bring `size` up to a multiple of `to` (both small).
fn pad_gap(size: u64, to: u64) -> u64 {
    (to - size % to) % to
}

#[cfg(test)]
mod tests {
    use super::{encode, offsets_from_map, offsets_from_str, size_from_map, size_from_str};
    use super::{Encoding, LayoutError, MAP_SLOTS};

    #[test]
    fn sizes_of_simple_descriptors() {
        assert_eq!(size_from_str(b""), Ok(0));
        assert_eq!(size_from_str(b"c"), Ok(1));
        assert_eq!(size_from_str(b"i"), Ok(4));
        assert_eq!(size_from_str(b"l"), Ok(8));
        assert_eq!(size_from_str(b"*"), Ok(8));
        assert_eq!(size_from_str(b"ci"), Ok(8));
        assert_eq!(size_from_str(b"i**"), Ok(24));
        assert_eq!(size_from_str(b"cd2i*c"), Ok(40));
    }

    #[test]
    fn repetition_prefix_equals_spelled_out_form() {
        assert_eq!(size_from_str(b"3i"), size_from_str(b"iii"));
        assert_eq!(size_from_str(b"2d"), Ok(16));
        assert_eq!(size_from_str(b"12c"), Ok(12));
    }

    #[test]
    fn bare_number_counts_chars() {
        assert_eq!(size_from_str(b"32"), Ok(32));
        assert_eq!(size_from_str(b"3"), Ok(3));
        // An int and three trailing chars, rounded up to the int's alignment.
        assert_eq!(size_from_str(b"i3"), Ok(8));
    }

    #[test]
    fn nul_terminates_parsing() {
        assert_eq!(size_from_str(b"2i\0*x!"), Ok(8));
        assert_eq!(encode(b"i*\0junk"), encode(b"i*"));
        assert_eq!(size_from_str(b"\0"), Ok(0));
    }

    #[test]
    fn zero_repeat_behaves_like_one() {
        assert_eq!(size_from_str(b"0i"), Ok(4));
        assert_eq!(size_from_str(b"00d"), Ok(8));
    }

    #[test]
    fn invalid_character_is_rejected() {
        assert_eq!(size_from_str(b"ix"), Err(LayoutError::InvalidChar(b'x')));
        assert_eq!(size_from_str(b"2q"), Err(LayoutError::InvalidChar(b'q')));
        assert_eq!(encode(b" "), Err(LayoutError::InvalidChar(b' ')));
    }

    #[test]
    fn oversized_counts_are_rejected() {
        // 2^64 does not fit a repetition counter.
        assert_eq!(
            size_from_str(b"18446744073709551616"),
            Err(LayoutError::SizeOverflow)
        );
        assert_eq!(
            size_from_str(b"9999999999999999999d"),
            Err(LayoutError::SizeOverflow)
        );
    }

    #[test]
    fn pointerless_descriptors_encode_as_size() {
        assert_eq!(encode(b""), Ok(Encoding::Size(0)));
        assert_eq!(encode(b"32"), Ok(Encoding::Size(32)));
        assert_eq!(encode(b"2li"), Ok(Encoding::Size(24)));
    }

    #[test]
    fn map_bits_are_packed_most_significant_first() {
        // "i*": a 4-byte slot (01) in the top slot, a pointer (11) below it.
        let Ok(Encoding::PtrMap(bits)) = encode(b"i*") else {
            panic!("expected an inline map");
        };
        assert_eq!(bits, (0b01 << 60) | (0b11 << 58));
    }

    #[test]
    fn thirty_one_pointers_fit_inline() {
        let Ok(Encoding::PtrMap(bits)) = encode(b"31*") else {
            panic!("expected an inline map");
        };
        let offsets = offsets_from_map(bits);
        assert_eq!(offsets.len(), MAP_SLOTS);
        assert_eq!(offsets.first(), Some(&0));
        assert_eq!(offsets.last(), Some(&240));
        assert_eq!(size_from_map(bits), 248);
    }

    #[test]
    fn thirty_two_pointers_overflow_to_external() {
        assert_eq!(encode(b"32*"), Ok(Encoding::External));
        assert_eq!(encode(b"50*"), Ok(Encoding::External));
        // 30 pointers plus 22 chars need 33 slots.
        assert_eq!(
            encode(b"30*cccccccccccccccccccccc"),
            Ok(Encoding::External)
        );
    }

    #[test]
    fn map_and_string_sizes_agree() {
        for desc in [
            &b"*"[..],
            b"i*",
            b"c*",
            b"2*c",
            b"cd2i*c",
            b"8c*",
            b"*i",
            b"3l2*",
            b"ci*c*",
            b"31*",
        ] {
            match encode(desc).unwrap() {
                Encoding::PtrMap(bits) => {
                    assert_eq!(
                        size_from_map(bits),
                        size_from_str(desc).unwrap(),
                        "size mismatch for {:?}",
                        core::str::from_utf8(desc).unwrap()
                    );
                }
                other => panic!("expected a map for {desc:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn map_and_string_pointer_offsets_agree() {
        for desc in [&b"*"[..], b"i*", b"c*", b"2*c", b"cd2i*c", b"8c*", b"ci*c*"] {
            let Encoding::PtrMap(bits) = encode(desc).unwrap() else {
                panic!("expected a map");
            };
            assert_eq!(
                offsets_from_map(bits),
                offsets_from_str(desc).unwrap(),
                "offset mismatch for {:?}",
                core::str::from_utf8(desc).unwrap()
            );
        }
    }

    #[test]
    fn pointer_offsets_respect_alignment_padding() {
        // The pointer of "cd2i*c" sits at offset 24: char, padding to 8,
        // double, two ints, then the 8-aligned pointer.
        assert_eq!(offsets_from_str(b"cd2i*c").unwrap(), vec![24]);
        // A char before a pointer pads to the pointer's alignment.
        assert_eq!(offsets_from_str(b"c*").unwrap(), vec![8]);
        assert_eq!(offsets_from_str(b"2*c").unwrap(), vec![0, 8]);
    }
}
