//! Pax extended-header payloads: `len key=value\n` records where `len` is
//! the decimal length of the whole record, its own digits included.

use std::collections::BTreeMap;

use super::entry::{SparseSegment, TarEntry};
use crate::{Error, Result};

pub(crate) fn parse(payload: &[u8]) -> Result<BTreeMap<String, String>> {
    let mut records = BTreeMap::new();
    let mut rest = payload;
    while !rest.is_empty() {
        let space = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| Error::invalid("pax record missing length delimiter"))?;
        let len: usize = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::invalid("pax record length is not a number"))?;
        if len <= space + 1 || len > rest.len() {
            return Err(Error::invalid("pax record length out of range"));
        }
        let body = &rest[space + 1..len];
        let body = body
            .strip_suffix(b"\n")
            .ok_or_else(|| Error::invalid("pax record missing newline"))?;
        let eq = body
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| Error::invalid("pax record missing '='"))?;
        let key = String::from_utf8_lossy(&body[..eq]).into_owned();
        let value = String::from_utf8_lossy(&body[eq + 1..]).into_owned();
        // An empty value deletes a previously-set key, per POSIX.
        if value.is_empty() {
            records.remove(&key);
        } else {
            records.insert(key, value);
        }
        rest = &rest[len..];
    }
    Ok(records)
}

pub(crate) fn serialize(records: &BTreeMap<String, String>) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in records {
        let body_len = key.len() + value.len() + 3; // space, '=', newline
        // The length field counts its own digits, so grow until stable.
        let mut len = body_len + 1;
        while len != body_len + len.to_string().len() {
            len = body_len + len.to_string().len();
        }
        out.extend_from_slice(len.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(key.as_bytes());
        out.push(b'=');
        out.extend_from_slice(value.as_bytes());
        out.push(b'\n');
    }
    out
}

/// Applies pax attributes to an entry. Sparse-map keys are handled by the
/// reader since the 1.0 layout also changes the payload shape.
pub(crate) fn apply(entry: &mut TarEntry, records: &BTreeMap<String, String>) -> Result<()> {
    for (key, value) in records {
        match key.as_str() {
            "path" => entry.name = value.clone(),
            "linkpath" => entry.link_name = value.clone(),
            "size" => {
                entry.size = value
                    .parse()
                    .map_err(|_| Error::invalid("pax size is not a number"))?;
            }
            "uid" => {
                entry.uid = value
                    .parse()
                    .map_err(|_| Error::invalid("pax uid is not a number"))?;
            }
            "gid" => {
                entry.gid = value
                    .parse()
                    .map_err(|_| Error::invalid("pax gid is not a number"))?;
            }
            "mtime" => {
                // Sub-second precision truncates to the entry's granularity.
                let seconds = value.split('.').next().unwrap_or(value);
                entry.mtime = seconds
                    .parse()
                    .map_err(|_| Error::invalid("pax mtime is not a number"))?;
            }
            "uname" => entry.uname = value.clone(),
            "gname" => entry.gname = value.clone(),
            "SCHILY.devmajor" => {
                entry.dev_major = value
                    .parse()
                    .map_err(|_| Error::invalid("pax devmajor is not a number"))?;
            }
            "SCHILY.devminor" => {
                entry.dev_minor = value
                    .parse()
                    .map_err(|_| Error::invalid("pax devminor is not a number"))?;
            }
            _ => {}
        }
    }
    entry.pax_headers.extend(
        records
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    Ok(())
}

/// Parses the GNU pax-0.1 sparse map: a comma list of offset,size pairs.
pub(crate) fn parse_sparse_map_01(map: &str) -> Result<Vec<SparseSegment>> {
    let numbers: Vec<u64> = map
        .split(',')
        .map(|n| n.parse::<u64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| Error::invalid("GNU.sparse.map is not a number list"))?;
    if numbers.len() % 2 != 0 {
        return Err(Error::invalid("GNU.sparse.map has a dangling offset"));
    }
    Ok(numbers
        .chunks(2)
        .map(|pair| SparseSegment {
            offset: pair[0],
            num_bytes: pair[1],
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut records = BTreeMap::new();
        records.insert("path".to_string(), "very/long/päth.txt".to_string());
        records.insert("mtime".to_string(), "1592224240.5".to_string());
        let bytes = serialize(&records);
        assert_eq!(parse(&bytes).unwrap(), records);
    }

    #[test]
    fn record_length_counts_itself() {
        let mut records = BTreeMap::new();
        records.insert("a".to_string(), "b".to_string());
        // "6 a=b\n" is six bytes including the length digit.
        assert_eq!(serialize(&records), b"6 a=b\n");
    }

    #[test]
    fn applies_overrides() {
        let mut records = BTreeMap::new();
        records.insert("path".to_string(), "renamed".to_string());
        records.insert("size".to_string(), "12345".to_string());
        records.insert("mtime".to_string(), "99.25".to_string());
        let mut entry = TarEntry::new_file("orig", 1);
        apply(&mut entry, &records).unwrap();
        assert_eq!(entry.name, "renamed");
        assert_eq!(entry.size, 12345);
        assert_eq!(entry.mtime, 99);
    }

    #[test]
    fn empty_value_deletes_key() {
        let payload = b"11 key=val\n7 key=\n";
        assert!(parse(payload).unwrap().is_empty());
    }

    #[test]
    fn sparse_map_parse() {
        let segments = parse_sparse_map_01("0,512,4096,100").unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].offset, 4096);
        assert_eq!(segments[1].num_bytes, 100);
        assert!(parse_sparse_map_01("1,2,3").is_err());
    }

    #[test]
    fn malformed_records_rejected() {
        assert!(parse(b"notanumber key=value\n").is_err());
        assert!(parse(b"9 key-value\n").is_err());
        assert!(parse(b"999 key=value\n").is_err());
    }
}
