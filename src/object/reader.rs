//! Magic-byte dispatch to the ELF or Mach-O parser (C1 driver).
//!
//! Grounded on `20559be7_..._archive.rs`'s `load_file_elf64`, which
//! sniffs a handful of magic bytes before deciding how to parse a file.

use super::elf::{self, ELF_MAGIC};
use super::macho::{self, MH_CIGAM_64, MH_MAGIC_64};
use super::model::Object;
use crate::error::{LinkError, Result};
use std::fs;
use std::path::Path;

/// Read and parse a relocatable object file, dispatching on its magic
/// bytes (spec §4.1).
pub fn read_object(path: &Path) -> Result<Object> {
    let filename = path.display().to_string();
    let bytes = fs::read(path).map_err(|source| LinkError::Io {
        file: filename.clone(),
        source,
    })?;
    read_object_bytes(&filename, &bytes)
}

/// Parse a relocatable object already resident in memory (used for
/// archive members, which are materialized into a buffer before parsing
/// per spec §4.2).
pub fn read_object_bytes(filename: &str, bytes: &[u8]) -> Result<Object> {
    if bytes.len() < 4 {
        return Err(LinkError::UnsupportedFormat {
            file: filename.to_string(),
            message: "file too short to contain a format magic number".into(),
        });
    }
    let magic = &bytes[0..4];
    if magic == ELF_MAGIC {
        elf::parse_elf_object(filename, bytes)
    } else {
        let magic_u32 = u32::from_le_bytes(magic.try_into().unwrap());
        if magic_u32 == MH_MAGIC_64 || magic_u32 == MH_CIGAM_64 {
            macho::parse_macho_object(filename, bytes)
        } else {
            Err(LinkError::UnsupportedFormat {
                file: filename.to_string(),
                message: format!("unrecognized magic bytes {magic:02x?}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_files() {
        let err = read_object_bytes("t.o", &[0, 1]).unwrap_err();
        assert!(matches!(err, LinkError::UnsupportedFormat { .. }));
    }

    #[test]
    fn rejects_unknown_magic() {
        let err = read_object_bytes("t.o", b"\x00\x00\x00\x00garbage").unwrap_err();
        assert!(matches!(err, LinkError::UnsupportedFormat { .. }));
    }

    #[test]
    fn dispatches_elf_magic() {
        // A too-short-but-magic-matching buffer should fail inside the ELF
        // parser (Parse), not be rejected as an unsupported format.
        let err = read_object_bytes("t.o", &ELF_MAGIC).unwrap_err();
        assert!(matches!(err, LinkError::Parse { .. }));
    }
}
