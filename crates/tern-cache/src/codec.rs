//! Hand-rolled little-endian codec for on-disk cache entries.
//!
//! Layout, in order: magic sentinel, key, etag (empty string when absent),
//! server date, last-modified, hard TTL, soft TTL, response headers, and the
//! body as the remainder of the file. Strings are a `u64` length followed by
//! UTF-8 bytes. A read that hits end-of-file mid-field is a fault, never a
//! sentinel value.

use std::io::{self, Read, Write};

use rustc_hash::FxHashMap;

use crate::entry::{CacheEntry, CacheHeader};
use crate::Error;

/// Sentinel marking a file as a cache entry; bumped on layout changes.
const MAGIC: u32 = 0x7465_726E;

/// Upper bound on a length-prefixed field, to reject corrupt prefixes before
/// they turn into absurd allocations.
const MAX_FIELD_LEN: u64 = 16 * 1024 * 1024;

/// Upper bound on the stored header count.
const MAX_HEADER_COUNT: u32 = 4_096;

/// Exact on-disk size of an entry, header and body, as [`write_header`]
/// would produce it. Used to size eviction before the file is written.
pub(crate) fn encoded_len(key: &str, entry: &CacheEntry) -> u64 {
    let string_len = |s: &str| 8 + s.len() as u64;
    let headers_len: u64 = entry
        .response_headers
        .iter()
        .map(|(name, value)| string_len(name) + string_len(value))
        .sum();
    4 // magic
        + string_len(key)
        + string_len(entry.etag.as_deref().unwrap_or(""))
        + 4 * 8 // server_date, last_modified, ttl, soft_ttl
        + 4 // header count
        + headers_len
        + entry.data.len() as u64
}

pub(crate) fn write_header<W: Write>(writer: &mut W, key: &str, entry: &CacheEntry) -> io::Result<()> {
    write_u32(writer, MAGIC)?;
    write_string(writer, key)?;
    write_string(writer, entry.etag.as_deref().unwrap_or(""))?;
    write_u64(writer, entry.server_date as u64)?;
    write_u64(writer, entry.last_modified as u64)?;
    write_u64(writer, entry.ttl as u64)?;
    write_u64(writer, entry.soft_ttl as u64)?;
    write_u32(writer, entry.response_headers.len() as u32)?;
    for (name, value) in &entry.response_headers {
        write_string(writer, name)?;
        write_string(writer, value)?;
    }
    Ok(())
}

/// Read the metadata portion of an entry, leaving the reader positioned at
/// the first body byte. The returned header has `size` zeroed; the caller
/// fills it in from the file length.
pub(crate) fn read_header<R: Read>(reader: &mut R) -> Result<CacheHeader, Error> {
    let magic = read_u32(reader)?;
    if magic != MAGIC {
        return Err(Error::BadMagic(magic));
    }
    let key = read_string(reader)?;
    let etag = read_string(reader)?;
    let etag = if etag.is_empty() { None } else { Some(etag) };
    let server_date = read_u64(reader)? as i64;
    let last_modified = read_u64(reader)? as i64;
    let ttl = read_u64(reader)? as i64;
    let soft_ttl = read_u64(reader)? as i64;
    let header_count = read_u32(reader)?;
    if header_count > MAX_HEADER_COUNT {
        return Err(Error::FieldTooLarge(u64::from(header_count)));
    }
    let mut response_headers =
        FxHashMap::with_capacity_and_hasher(header_count as usize, Default::default());
    for _ in 0..header_count {
        let name = read_string(reader)?;
        let value = read_string(reader)?;
        response_headers.insert(name, value);
    }
    Ok(CacheHeader {
        key,
        size: 0,
        etag,
        server_date,
        last_modified,
        ttl,
        soft_ttl,
        response_headers,
    })
}

fn write_u32<W: Write>(writer: &mut W, value: u32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn write_u64<W: Write>(writer: &mut W, value: u64) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn write_string<W: Write>(writer: &mut W, value: &str) -> io::Result<()> {
    write_u64(writer, value.len() as u64)?;
    writer.write_all(value.as_bytes())
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, Error> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).map_err(truncated)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, Error> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf).map_err(truncated)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_string<R: Read>(reader: &mut R) -> Result<String, Error> {
    let len = read_u64(reader)?;
    if len > MAX_FIELD_LEN {
        return Err(Error::FieldTooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).map_err(truncated)?;
    Ok(String::from_utf8(buf)?)
}

/// `read_exact` reports a short read as `UnexpectedEof`; everything else is
/// an ordinary I/O fault.
fn truncated(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        Error::UnexpectedEof
    } else {
        Error::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn sample_entry() -> CacheEntry {
        let mut response_headers = FxHashMap::default();
        response_headers.insert("Content-Type".to_string(), "text/plain".to_string());
        response_headers.insert("X-Served-By".to_string(), "origin-3".to_string());
        CacheEntry {
            data: b"hello".to_vec(),
            etag: Some("\"v1\"".to_string()),
            server_date: 1_700_000_000_000,
            last_modified: 1_690_000_000_000,
            ttl: 1_700_000_060_000,
            soft_ttl: 1_700_000_030_000,
            response_headers,
        }
    }

    #[test]
    fn header_round_trip() {
        let entry = sample_entry();
        let mut buf = Vec::new();
        write_header(&mut buf, "GET:http://example.com/a", &entry).unwrap();

        let header = read_header(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(header.key, "GET:http://example.com/a");
        assert_eq!(header.etag.as_deref(), Some("\"v1\""));
        assert_eq!(header.server_date, entry.server_date);
        assert_eq!(header.last_modified, entry.last_modified);
        assert_eq!(header.ttl, entry.ttl);
        assert_eq!(header.soft_ttl, entry.soft_ttl);
        assert_eq!(header.response_headers, entry.response_headers);
    }

    #[test]
    fn encoded_len_matches_written_bytes() {
        let entry = sample_entry();
        let mut buf = Vec::new();
        write_header(&mut buf, "some-key", &entry).unwrap();
        buf.extend_from_slice(&entry.data);
        assert_eq!(encoded_len("some-key", &entry), buf.len() as u64);
    }

    #[test]
    fn empty_etag_reads_back_as_absent() {
        let entry = CacheEntry::default();
        let mut buf = Vec::new();
        write_header(&mut buf, "k", &entry).unwrap();
        let header = read_header(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(header.etag, None);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = Vec::new();
        write_header(&mut buf, "k", &CacheEntry::default()).unwrap();
        buf[0] ^= 0xff;
        assert!(matches!(
            read_header(&mut Cursor::new(&buf)),
            Err(Error::BadMagic(_))
        ));
    }

    #[test]
    fn truncation_is_a_fault_not_a_sentinel() {
        let mut buf = Vec::new();
        write_header(&mut buf, "k", &sample_entry()).unwrap();
        for len in [0, 3, buf.len() / 2, buf.len() - 1] {
            assert!(
                read_header(&mut Cursor::new(&buf[..len])).is_err(),
                "prefix of {len} bytes parsed"
            );
        }
    }

    #[test]
    fn implausible_length_prefix_is_rejected() {
        let mut buf = Vec::new();
        write_u32(&mut buf, MAGIC).unwrap();
        write_u64(&mut buf, u64::MAX).unwrap();
        assert!(matches!(
            read_header(&mut Cursor::new(&buf)),
            Err(Error::FieldTooLarge(_))
        ));
    }
}
