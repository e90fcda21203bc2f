//! Fragmented ("large") value codec: values that do not fit in a leaf are
//! split across direct pages, or — once there are too many for an inline
//! pointer list — a small tree of indirection pages (§4.7).
//!
//! Deletion does not free pages synchronously. The descriptor bytes are
//! staged in the fragmented-trash index (a plain [`crate::Tree`] over
//! [`fathom_common::FRAGMENTED_TRASH_INDEX_ID`]) so that a transaction
//! rollback can reinsert the exact same descriptor into the original leaf
//! without re-reading any data pages; only after the owning transaction
//! commits are the referenced pages actually freed.

use fathom_common::{PageId, Result};
use fathom_pagestore::PageDevice;

use crate::free::Pager;

/// Set when the leaf bytes are a fragment descriptor rather than a raw
/// inline value.
const FLAG_FRAGMENTED: u8 = 0b1000;
/// Full-length field width: set = 4-byte `u32`, clear = 2-byte `u16`.
const FLAG_FF: u8 = 0b0001;
/// An inline prefix (2-byte length + bytes) follows the length field.
const FLAG_I: u8 = 0b0010;
/// Pointer section is a single 48-bit root of an indirection tree rather
/// than a flat list of direct data-page ids.
const FLAG_P: u8 = 0b0100;

/// Bytes of a fragmented value's leading edge kept inline in the
/// descriptor, so a short prefix never costs a whole data page.
const INLINE_PREFIX_CAP: usize = 32;

/// A value too large to fit inline: an optional inline prefix, a full
/// length, and either a flat list of data-page ids or a single pointer into
/// one level of indirection pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentDescriptor {
    pub full_len: u64,
    pub prefix: Vec<u8>,
    pub pointers: Vec<PageId>,
    pub indirect: bool,
}

fn fanout(page_size: usize) -> usize {
    page_size / 6
}

pub fn should_fragment(value_len: usize, page_size: usize) -> bool {
    value_len > page_size / 2
}

/// Encode `value` into the bytes that belong in the leaf entry: either the
/// literal value (unfragmented) or a fragment descriptor, writing
/// data/indirection pages through `pager`/`device` as a side effect.
pub fn encode_value(pager: &mut dyn Pager, device: &PageDevice, value: &[u8]) -> Result<Vec<u8>> {
    let page_size = device.page_size();
    if !should_fragment(value.len(), page_size) {
        let mut out = Vec::with_capacity(value.len() + 1);
        out.push(0);
        out.extend_from_slice(value);
        return Ok(out);
    }

    let prefix_len = value.len().min(INLINE_PREFIX_CAP);
    let prefix = &value[..prefix_len];
    let remainder = &value[prefix_len..];

    let mut data_pages = Vec::new();
    for chunk in remainder.chunks(page_size) {
        let id = pager.alloc();
        let mut buf = vec![0u8; page_size];
        buf[..chunk.len()].copy_from_slice(chunk);
        device.write(id, &buf)?;
        data_pages.push(id);
    }

    let direct_limit = fanout(page_size);
    let (indirect, pointers) = if data_pages.len() <= direct_limit {
        (false, data_pages)
    } else {
        let root = build_indirect_tree(pager, device, &data_pages)?;
        (true, vec![root])
    };

    Ok(encode_descriptor(value.len() as u64, prefix, indirect, &pointers))
}

fn encode_descriptor(full_len: u64, prefix: &[u8], indirect: bool, pointers: &[PageId]) -> Vec<u8> {
    let wide = full_len > u16::MAX as u64;
    let mut header = FLAG_FRAGMENTED;
    if wide {
        header |= FLAG_FF;
    }
    if !prefix.is_empty() {
        header |= FLAG_I;
    }
    if indirect {
        header |= FLAG_P;
    }

    let mut out = Vec::with_capacity(1 + 4 + 2 + prefix.len() + pointers.len() * 6);
    out.push(header);
    if wide {
        out.extend_from_slice(&(full_len as u32).to_le_bytes());
    } else {
        out.extend_from_slice(&(full_len as u16).to_le_bytes());
    }
    if !prefix.is_empty() {
        out.extend_from_slice(&(prefix.len() as u16).to_le_bytes());
        out.extend_from_slice(prefix);
    }
    for ptr in pointers {
        push_ptr48(&mut out, *ptr);
    }
    out
}

fn push_ptr48(out: &mut Vec<u8>, id: PageId) {
    out.extend_from_slice(&id.to_le_bytes()[..6]);
}

fn read_ptr48(bytes: &[u8]) -> PageId {
    let mut buf = [0u8; 8];
    buf[..6].copy_from_slice(&bytes[..6]);
    u64::from_le_bytes(buf)
}

/// Build one or more levels of indirection pages above `data_pages`,
/// grouping `fanout` 48-bit pointers per page and recursing upward until a
/// single root page remains.
fn build_indirect_tree(pager: &mut dyn Pager, device: &PageDevice, data_pages: &[PageId]) -> Result<PageId> {
    let page_size = device.page_size();
    let width = fanout(page_size);
    let mut level: Vec<PageId> = data_pages.to_vec();

    while level.len() > 1 {
        let mut next = Vec::new();
        for group in level.chunks(width) {
            let id = pager.alloc();
            let mut buf = vec![0u8; page_size];
            let mut out = Vec::with_capacity(group.len() * 6);
            for child in group {
                push_ptr48(&mut out, *child);
            }
            buf[..out.len()].copy_from_slice(&out);
            device.write(id, &buf)?;
            next.push(id);
        }
        level = next;
    }
    Ok(level[0])
}

/// Read the indirection page at `id` back into its child pointer list.
fn read_indirect_page(device: &PageDevice, id: PageId, expected_children: usize) -> Result<Vec<PageId>> {
    let buf = device.read(id)?;
    let mut out = Vec::with_capacity(expected_children);
    for i in 0..expected_children {
        let off = i * 6;
        out.push(read_ptr48(&buf[off..off + 6]));
    }
    Ok(out)
}

/// Decode a leaf entry's value bytes, following any fragment pointers.
pub fn decode_value(device: &PageDevice, bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes[0] & FLAG_FRAGMENTED == 0 {
        return Ok(bytes[1..].to_vec());
    }

    let desc = parse_descriptor(bytes);
    let remaining_len = desc.full_len as usize - desc.prefix.len();
    let data = if desc.indirect {
        let page_size = device.page_size();
        let total_data_pages = remaining_len.div_ceil(page_size);
        let leaves = collect_leaves(device, desc.pointers[0], total_data_pages, fanout(page_size))?;
        read_direct(device, remaining_len, &leaves)?
    } else {
        read_direct(device, remaining_len, &desc.pointers)?
    };

    let mut out = desc.prefix;
    out.extend_from_slice(&data);
    Ok(out)
}

fn collect_leaves(device: &PageDevice, root: PageId, total_leaves: usize, width: usize) -> Result<Vec<PageId>> {
    // Determine how many levels of indirection sit above the data pages by
    // growing the expected fanout until it covers `total_leaves`.
    let mut covered = width;
    let mut depth = 1;
    while covered < total_leaves {
        covered *= width;
        depth += 1;
    }

    let mut current = vec![root];
    for d in (0..depth - 1).rev() {
        let mut next = Vec::new();
        for (i, page) in current.iter().enumerate() {
            let children_here = if d == 0 {
                width.min(total_leaves - i * width)
            } else {
                width
            };
            let children = read_indirect_page(device, *page, children_here.min(width))?;
            next.extend(children);
        }
        current = next;
    }
    current.truncate(total_leaves);
    Ok(current)
}

fn read_direct(device: &PageDevice, total_len: usize, pointers: &[PageId]) -> Result<Vec<u8>> {
    let page_size = device.page_size();
    let mut out = Vec::with_capacity(total_len);
    let mut remaining = total_len;
    for id in pointers {
        let take = remaining.min(page_size);
        let buf = device.read(*id)?;
        out.extend_from_slice(&buf[..take]);
        remaining -= take;
    }
    Ok(out)
}

fn parse_descriptor(bytes: &[u8]) -> FragmentDescriptor {
    let header = bytes[0];
    let wide = header & FLAG_FF != 0;
    let has_prefix = header & FLAG_I != 0;
    let indirect = header & FLAG_P != 0;

    let mut i = 1;
    let full_len = if wide {
        let v = u32::from_le_bytes(bytes[i..i + 4].try_into().unwrap()) as u64;
        i += 4;
        v
    } else {
        let v = u16::from_le_bytes(bytes[i..i + 2].try_into().unwrap()) as u64;
        i += 2;
        v
    };

    let prefix = if has_prefix {
        let plen = u16::from_le_bytes(bytes[i..i + 2].try_into().unwrap()) as usize;
        i += 2;
        let p = bytes[i..i + plen].to_vec();
        i += plen;
        p
    } else {
        Vec::new()
    };

    let mut pointers = Vec::new();
    while i + 6 <= bytes.len() {
        pointers.push(read_ptr48(&bytes[i..i + 6]));
        i += 6;
    }

    FragmentDescriptor {
        full_len,
        prefix,
        pointers,
        indirect,
    }
}

pub fn is_fragmented(bytes: &[u8]) -> bool {
    !bytes.is_empty() && bytes[0] & FLAG_FRAGMENTED != 0
}

/// Actually free every page referenced by a fragment descriptor. Only
/// called once the deleting transaction has committed — before that, the
/// descriptor sits in the trash index so rollback can resurrect it.
pub fn free_fragment_pages(pager: &mut dyn Pager, device: &PageDevice, bytes: &[u8]) -> Result<()> {
    if !is_fragmented(bytes) {
        return Ok(());
    }
    let desc = parse_descriptor(bytes);
    if desc.indirect {
        let page_size = device.page_size();
        let remaining_len = desc.full_len as usize - desc.prefix.len();
        let total_data_pages = remaining_len.div_ceil(page_size);
        let leaves = collect_leaves(device, desc.pointers[0], total_data_pages, fanout(page_size))?;
        for id in leaves {
            pager.delete(id);
        }
        pager.delete(desc.pointers[0]);
    } else {
        for id in desc.pointers {
            pager.delete(id);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::free::VecPager;
    use tempfile::tempdir;

    fn setup(page_size: usize) -> (tempfile::TempDir, PageDevice, VecPager) {
        let dir = tempdir().unwrap();
        let (device, _header) = PageDevice::open(&dir.path().join("f.db"), page_size).unwrap();
        (dir, device, VecPager::new())
    }

    #[test]
    fn small_value_stays_inline() {
        let (_dir, device, mut pager) = setup(512);
        let bytes = encode_value(&mut pager, &device, b"short").unwrap();
        assert!(!is_fragmented(&bytes));
        assert_eq!(decode_value(&device, &bytes).unwrap(), b"short");
    }

    #[test]
    fn large_value_round_trips_through_direct_pages() {
        let (_dir, device, mut pager) = setup(512);
        let value: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        let bytes = encode_value(&mut pager, &device, &value).unwrap();
        assert!(is_fragmented(&bytes));
        assert_eq!(bytes[0] & FLAG_P, 0);
        assert_ne!(bytes[0] & FLAG_I, 0);
        let decoded = decode_value(&device, &bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn huge_value_round_trips_through_indirection() {
        let (_dir, device, mut pager) = setup(128);
        // fanout at page_size=128 is 21 direct 48-bit pointers; force
        // indirection with a value that needs more data pages than that.
        let value: Vec<u8> = (0..5000u32).map(|i| (i % 200) as u8).collect();
        let bytes = encode_value(&mut pager, &device, &value).unwrap();
        assert!(is_fragmented(&bytes));
        assert_ne!(bytes[0] & FLAG_P, 0);
        let decoded = decode_value(&device, &bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn full_length_field_widens_past_u16() {
        let (_dir, device, mut pager) = setup(512);
        let value: Vec<u8> = vec![9u8; 70_000];
        let bytes = encode_value(&mut pager, &device, &value).unwrap();
        assert_ne!(bytes[0] & FLAG_FF, 0);
        let decoded = decode_value(&device, &bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn freeing_releases_every_referenced_page() {
        let (_dir, device, mut pager) = setup(512);
        let value: Vec<u8> = vec![7u8; 4000];
        let bytes = encode_value(&mut pager, &device, &value).unwrap();
        let before = pager.deleted_count();
        free_fragment_pages(&mut pager, &device, &bytes).unwrap();
        assert!(pager.deleted_count() > before);
    }
}
