//! Tar helpers for volume stream payloads.
//!
//! Volume streams carry tar archives. These helpers work on fully buffered
//! archives, which is enough for single-file reads like image metadata.

use std::collections::BTreeMap;
use std::io::{self, Read};
use tar::{Archive, Builder, EntryType, Header};

/// Build a tar archive from `path -> content` pairs.
pub fn pack(entries: &BTreeMap<String, Vec<u8>>) -> io::Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    for (path, content) in entries {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, content.as_slice())?;
    }
    builder.into_inner()
}

/// Read every regular file of a tar archive.
pub fn unpack(data: &[u8]) -> io::Result<BTreeMap<String, Vec<u8>>> {
    let mut archive = Archive::new(data);
    let mut out = BTreeMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        let mut content = Vec::new();
        entry.read_to_end(&mut content)?;
        out.insert(path, content);
    }
    Ok(out)
}

/// Content of the first regular file in a tar archive.
pub fn first_entry(data: &[u8]) -> io::Result<Option<Vec<u8>>> {
    let mut archive = Archive::new(data);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let mut content = Vec::new();
        entry.read_to_end(&mut content)?;
        return Ok(Some(content));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_and_unpack_files() {
        let mut files = BTreeMap::new();
        files.insert("metadata.json".to_string(), b"{}".to_vec());
        files.insert("rootfs/bin/sh".to_string(), b"#!".to_vec());

        let tarball = pack(&files).unwrap();
        assert_eq!(unpack(&tarball).unwrap(), files);
    }

    #[test]
    fn test_first_entry() {
        let mut files = BTreeMap::new();
        files.insert("only".to_string(), b"content".to_vec());
        let tarball = pack(&files).unwrap();
        assert_eq!(first_entry(&tarball).unwrap(), Some(b"content".to_vec()));

        let empty = pack(&BTreeMap::new()).unwrap();
        assert_eq!(first_entry(&empty).unwrap(), None);
    }
}
