//! Unix `ar` archive reader (C2) and a minimal BSD-flavour writer (§4.8).
//!
//! Header layout and the `#1/<N>` BSD extended-name convention follow
//! `ae4e7bfa_rust-lang-ar_archive_writer__src-archive_writer.rs`'s
//! `print_bsd_member_header`. Member filtering (skip `__`-prefixed
//! special entries, skip anything not ending in `.o`) and the
//! materialize-then-parse loop follow `20559be7_..._archive.rs`'s
//! `load_archive_elf64`.

use crate::context::LinkerContext;
use crate::error::{LinkError, LinkErrors};
use crate::object::model::ArchiveEntry;
use crate::object::reader::read_object_bytes;
use std::path::Path;

const ARCHIVE_SIGNATURE: &[u8; 8] = b"!<arch>\n";
const HEADER_SIZE: usize = 60;
const HEADER_END: &[u8; 2] = b"`\n";

fn archive_err(path: &str, message: impl Into<String>) -> LinkError {
    LinkError::Archive {
        file: path.to_string(),
        message: message.into(),
    }
}

/// Parse every `ar` header/body pair in `data` into [`ArchiveEntry`]
/// values, resolving BSD extended (`#1/N`) names. Does not filter by
/// name or extension; that's [`extract`]'s job.
fn parse_entries(path: &str, data: &[u8]) -> Result<Vec<ArchiveEntry>, LinkError> {
    if data.len() < 8 || &data[0..8] != ARCHIVE_SIGNATURE {
        return Err(archive_err(path, "missing '!<arch>\\n' signature"));
    }
    let mut entries = Vec::new();
    let mut offset = 8usize;
    while offset + HEADER_SIZE <= data.len() {
        let header = &data[offset..offset + HEADER_SIZE];
        if &header[58..60] != HEADER_END {
            return Err(archive_err(path, format!("bad member header at offset {offset}")));
        }
        let raw_name = std::str::from_utf8(&header[0..16])
            .map_err(|_| archive_err(path, "non-UTF8 member name"))?
            .trim_end()
            .to_string();
        let size_str = std::str::from_utf8(&header[48..58])
            .map_err(|_| archive_err(path, "non-UTF8 member size"))?
            .trim_end();
        let size: usize = size_str
            .parse()
            .map_err(|_| archive_err(path, format!("invalid member size '{size_str}'")))?;

        let body_start = offset + HEADER_SIZE;
        let body_end = body_start
            .checked_add(size)
            .filter(|&e| e <= data.len())
            .ok_or_else(|| archive_err(path, "truncated archive member"))?;
        let body = &data[body_start..body_end];

        let (name, bytes) = if let Some(name_len) = raw_name.strip_prefix("#1/") {
            let name_len: usize = name_len
                .parse()
                .map_err(|_| archive_err(path, format!("invalid BSD name length '{raw_name}'")))?;
            if name_len > body.len() {
                return Err(archive_err(path, "BSD extended name longer than member data"));
            }
            let name = String::from_utf8_lossy(&body[..name_len])
                .trim_end_matches('\0')
                .to_string();
            (name, body[name_len..].to_vec())
        } else {
            (raw_name, body.to_vec())
        };

        entries.push(ArchiveEntry {
            name,
            size: bytes.len() as u64,
            bytes,
        });

        // Entries are padded to an even byte count.
        let padded_size = size + (size % 2);
        offset = body_start + padded_size;
    }
    Ok(entries)
}

/// Iterate a Unix `ar` archive's entries, parse each accepted `.o` member
/// through the object reader, and append it to `ctx`. Returns the number
/// of objects extracted (spec §4.2).
pub fn extract(archive_path: &Path, ctx: &mut LinkerContext) -> Result<usize, LinkErrors> {
    let path_str = archive_path.display().to_string();
    let data = std::fs::read(archive_path).map_err(|source| {
        LinkErrors::from(LinkError::Io {
            file: path_str.clone(),
            source,
        })
    })?;

    let entries = parse_entries(&path_str, &data).map_err(LinkErrors::from)?;

    let mut errors = LinkErrors::new();
    let mut extracted = 0;
    for entry in entries {
        if entry.name.starts_with("__") {
            continue;
        }
        if !entry.name.ends_with(".o") {
            continue;
        }
        let member_name = format!("{path_str}({})", entry.name);
        match read_object_bytes(&member_name, &entry.bytes) {
            Ok(object) => {
                ctx.add_object(object);
                extracted += 1;
            }
            Err(err) => errors.push(err),
        }
    }
    errors.into_result()?;
    Ok(extracted)
}

/// Emit a minimal BSD-flavour `ar` archive containing `entries`
/// (name, body) pairs. The inverse of [`extract`]'s parsing, used by
/// tests to build a runtime archive without shelling out to `ar` (§4.8).
pub fn write_archive(entries: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(ARCHIVE_SIGNATURE);
    for (name, body) in entries {
        let (header_name, data): (String, Vec<u8>) = if name.len() > 16 {
            let mut d = name.as_bytes().to_vec();
            d.push(0);
            let padded = d.len() + (d.len() % 2);
            d.resize(padded, 0);
            d.extend_from_slice(body);
            (format!("#1/{}", name.len() + 1), d)
        } else {
            (name.clone(), body.clone())
        };

        let mut header = vec![b' '; HEADER_SIZE];
        write_field(&mut header, 0, 16, &header_name);
        write_field(&mut header, 16, 12, "0");
        write_field(&mut header, 28, 6, "0");
        write_field(&mut header, 34, 6, "0");
        write_field(&mut header, 40, 8, "644");
        write_field(&mut header, 48, 10, &data.len().to_string());
        header[58] = b'`';
        header[59] = b'\n';

        out.extend_from_slice(&header);
        out.extend_from_slice(&data);
        if data.len() % 2 != 0 {
            out.push(b'\n');
        }
    }
    out
}

fn write_field(header: &mut [u8], offset: usize, width: usize, value: &str) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(width);
    header[offset..offset + n].copy_from_slice(&bytes[..n]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_short_and_long_names() {
        let archive = write_archive(&[
            ("a.o".to_string(), vec![1, 2, 3]),
            (
                "a_very_long_member_name_that_exceeds_sixteen_bytes.o".to_string(),
                vec![4, 5, 6, 7],
            ),
        ]);
        let entries = parse_entries("test.a", &archive).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.o");
        assert_eq!(entries[0].bytes, vec![1, 2, 3]);
        assert_eq!(
            entries[1].name,
            "a_very_long_member_name_that_exceeds_sixteen_bytes.o"
        );
        assert_eq!(entries[1].bytes, vec![4, 5, 6, 7]);
    }

    #[test]
    fn rejects_bad_signature() {
        let err = parse_entries("bad.a", b"not an archive").unwrap_err();
        assert!(matches!(err, LinkError::Archive { .. }));
    }

    #[test]
    fn odd_sized_members_are_padded() {
        let archive = write_archive(&[("odd.o".to_string(), vec![1, 2, 3])]);
        // signature (8) + header (60) + 3 data bytes + 1 pad byte = 72
        assert_eq!(archive.len(), 8 + HEADER_SIZE + 4);
    }
}
