//! C5 — small-data area: packed inline-attribute records in an inode's
//! trailing bytes (§4.5).

use crate::error::{Error, Result};
use crate::layout::{FILE_NAME_NAME, FILE_NAME_TYPE};

const RECORD_HEADER_SIZE: usize = 8;

/// One decoded record: type code, raw name bytes (including any NUL the
/// caller packed in — comparisons are the caller's job, see
/// [`crate::btree`]'s NUL-insensitive string ordering), and data bytes.
pub struct Record<'a> {
    pub type_code: u32,
    pub name: &'a [u8],
    pub data: &'a [u8],
    offset: usize,
    total_len: usize,
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn record_len(name_size: u16, data_size: u16) -> usize {
    RECORD_HEADER_SIZE + align4(name_size as usize) + align4(data_size as usize)
}

fn read_header(buf: &[u8], offset: usize) -> Option<(u32, u16, u16)> {
    if offset + RECORD_HEADER_SIZE > buf.len() {
        return None;
    }
    let type_code = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
    let name_size = u16::from_le_bytes(buf[offset + 4..offset + 6].try_into().unwrap());
    let data_size = u16::from_le_bytes(buf[offset + 6..offset + 8].try_into().unwrap());
    Some((type_code, name_size, data_size))
}

/// Iterates records from the start of `buf`, stopping at the terminating
/// all-zero record or the end of the buffer.
pub fn iter(buf: &[u8]) -> impl Iterator<Item = Record<'_>> {
    let mut offset = 0usize;
    std::iter::from_fn(move || {
        let (type_code, name_size, data_size) = read_header(buf, offset)?;
        if type_code == 0 && name_size == 0 && data_size == 0 {
            return None;
        }
        let total_len = record_len(name_size, data_size);
        if offset + total_len > buf.len() {
            return None;
        }
        let name_start = offset + RECORD_HEADER_SIZE;
        let data_start = name_start + align4(name_size as usize);
        let record = Record {
            type_code,
            name: &buf[name_start..name_start + name_size as usize],
            data: &buf[data_start..data_start + data_size as usize],
            offset,
            total_len,
        };
        offset += total_len;
        Some(record)
    })
}

/// Byte offset of the terminating all-zero record (i.e. the first free byte).
pub fn end_offset(buf: &[u8]) -> usize {
    iter(buf).last().map(|r| r.offset + r.total_len).unwrap_or(0)
}

pub fn find<'a>(buf: &'a [u8], name: &[u8]) -> Option<Record<'a>> {
    iter(buf).find(|r| r.name == name)
}

/// Inserts or overwrites `name`'s record, shifting later records right if
/// it doesn't already exist, or if it exists but no longer fits in place
/// (§4.5 `add`). Fails with `BufferOverflow` if there isn't room; the
/// filename record calls this with an already-reduced buffer after
/// `make_space_for_small_data` has promoted other records out.
pub fn add(buf: &mut [u8], name: &[u8], type_code: u32, data: &[u8]) -> Result<()> {
    let new_len = record_len(name.len() as u16, data.len() as u16);
    let end = end_offset(buf);

    if let Some(existing) = find(buf, name) {
        let old_start = existing.offset;
        let old_len = existing.total_len;
        if new_len == old_len {
            write_record(&mut buf[old_start..old_start + old_len], type_code, name, data);
            return Ok(());
        }
        // Remove the old record in place, then fall through to append.
        buf.copy_within(old_start + old_len..end, old_start);
        zero(&mut buf[end - old_len..end]);
        let shrunk_end = end - old_len;
        return insert_at_end(buf, shrunk_end, name, type_code, data, new_len);
    }

    insert_at_end(buf, end, name, type_code, data, new_len)
}

fn insert_at_end(buf: &mut [u8], end: usize, name: &[u8], type_code: u32, data: &[u8], new_len: usize) -> Result<()> {
    if end + new_len + RECORD_HEADER_SIZE > buf.len() {
        return Err(Error::BufferOverflow);
    }
    write_record(&mut buf[end..end + new_len], type_code, name, data);
    let zero_end = (end + new_len + RECORD_HEADER_SIZE).min(buf.len());
    zero(&mut buf[end + new_len..zero_end]);
    Ok(())
}

fn write_record(slot: &mut [u8], type_code: u32, name: &[u8], data: &[u8]) {
    slot[0..4].copy_from_slice(&type_code.to_le_bytes());
    slot[4..6].copy_from_slice(&(name.len() as u16).to_le_bytes());
    slot[6..8].copy_from_slice(&(data.len() as u16).to_le_bytes());
    let name_start = RECORD_HEADER_SIZE;
    let name_aligned = align4(name.len());
    slot[name_start..name_start + name.len()].copy_from_slice(name);
    for b in &mut slot[name_start + name.len()..name_start + name_aligned] {
        *b = 0;
    }
    let data_start = name_start + name_aligned;
    let data_aligned = align4(data.len());
    slot[data_start..data_start + data.len()].copy_from_slice(data);
    for b in &mut slot[data_start + data.len()..data_start + data_aligned] {
        *b = 0;
    }
}

fn zero(slice: &mut [u8]) {
    for b in slice {
        *b = 0;
    }
}

/// Shifts every record after `name`'s left over it, zeroing the freed
/// trailer (§4.5 `remove`).
pub fn remove(buf: &mut [u8], name: &[u8]) -> Result<()> {
    let Some(existing) = find(buf, name) else {
        return Err(Error::EntryNotFound);
    };
    let start = existing.offset;
    let len = existing.total_len;
    let end = end_offset(buf);
    buf.copy_within(start + len..end, start);
    zero(&mut buf[end - len..end]);
    Ok(())
}

/// Convenience accessor for the well-known filename record (§4.5).
pub fn file_name<'a>(buf: &'a [u8]) -> Option<&'a [u8]> {
    iter(buf).find(|r| r.type_code == FILE_NAME_TYPE && r.name == [FILE_NAME_NAME]).map(|r| r.data)
}

pub fn set_file_name(buf: &mut [u8], name: &[u8]) -> Result<()> {
    add(buf, &[FILE_NAME_NAME], FILE_NAME_TYPE, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_find_remove_round_trip() {
        let mut buf = vec![0u8; 256];
        add(&mut buf, b"color", 1, b"blue").unwrap();
        add(&mut buf, b"size", 2, b"large").unwrap();
        assert_eq!(find(&buf, b"color").unwrap().data, b"blue");
        assert_eq!(find(&buf, b"size").unwrap().data, b"large");

        add(&mut buf, b"color", 1, b"red-ish").unwrap();
        assert_eq!(find(&buf, b"color").unwrap().data, b"red-ish");
        assert_eq!(find(&buf, b"size").unwrap().data, b"large");

        remove(&mut buf, b"color").unwrap();
        assert!(find(&buf, b"color").is_none());
        assert_eq!(find(&buf, b"size").unwrap().data, b"large");
    }

    #[test]
    fn overflow_is_rejected() {
        let mut buf = vec![0u8; 16];
        assert!(add(&mut buf, b"toolong", 1, b"data-that-does-not-fit").is_err());
    }

    #[test]
    fn file_name_record_round_trips() {
        let mut buf = vec![0u8; 256];
        set_file_name(&mut buf, b"hello.txt").unwrap();
        assert_eq!(file_name(&buf), Some(&b"hello.txt"[..]));
    }
}
