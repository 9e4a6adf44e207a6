//! Mach-O 64 relocatable object reader (C1, Mach-O half).
//!
//! Struct field layouts follow `/usr/include/mach-o/{loader,reloc}.h`, as
//! laid out by `2d424410_phooq-smolvm__crates-smolvm-pack-src-macho.rs`'s
//! `read`/`write` struct pairs, and load-command iteration follows
//! `4478c241_impiaaa-touchHLE__src-mach_o.rs`'s per-command match loop.
//! Relocation bitfields are unpacked manually with shifts and masks
//! rather than relying on host-native bitfield layout (spec §4.1, §9).

use super::model::{
    Object, PlatformFormat, Relocation, RelocationKind, Section, SectionFlags, SectionType,
    Symbol, SymbolBinding, SymbolType,
};
use crate::error::{LinkError, Result};

pub const MH_MAGIC_64: u32 = 0xfeed_facf;
pub const MH_CIGAM_64: u32 = 0xcffa_edfe;

pub const CPU_TYPE_ARM64: i32 = 0x0100_000c;
pub const CPU_SUBTYPE_ARM64_ALL: i32 = 0;

pub const MH_OBJECT: u32 = 0x1;

const LC_SEGMENT_64: u32 = 0x19;
const LC_SYMTAB: u32 = 0x2;

const SEG_CMD_SIZE: usize = 72;
const SECTION_SIZE: usize = 80;
const SYMTAB_CMD_SIZE: usize = 24;
const NLIST_SIZE: usize = 16;
const RELOC_INFO_SIZE: usize = 8;

pub const ARM64_RELOC_UNSIGNED: u32 = 0;
pub const ARM64_RELOC_BRANCH26: u32 = 2;
pub const ARM64_RELOC_PAGE21: u32 = 3;
pub const ARM64_RELOC_PAGEOFF12: u32 = 4;
pub const ARM64_RELOC_ADDEND: u32 = 10;

fn u32_at(b: &[u8], off: usize) -> Result<u32> {
    let bytes: [u8; 4] = b
        .get(off..off + 4)
        .ok_or_else(|| malformed("truncated u32 field"))?
        .try_into()
        .unwrap();
    Ok(u32::from_le_bytes(bytes))
}

fn i32_at(b: &[u8], off: usize) -> Result<i32> {
    Ok(u32_at(b, off)? as i32)
}

fn u64_at(b: &[u8], off: usize) -> Result<u64> {
    let bytes: [u8; 8] = b
        .get(off..off + 8)
        .ok_or_else(|| malformed("truncated u64 field"))?
        .try_into()
        .unwrap();
    Ok(u64::from_le_bytes(bytes))
}

fn malformed(message: impl Into<String>) -> LinkError {
    LinkError::Parse {
        file: String::new(),
        message: message.into(),
    }
}

fn cstr16(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn classify_section(segname: &str, sectname: &str) -> SectionType {
    match (segname, sectname) {
        ("__TEXT", "__text") => SectionType::Text,
        ("__TEXT", "__const") | ("__TEXT", "__cstring") => SectionType::Rodata,
        (_, "__rodata") => SectionType::Rodata,
        ("__DATA", "__data") => SectionType::Data,
        ("__DATA", "__bss") => SectionType::Bss,
        _ => SectionType::Unknown,
    }
}

/// Unpacked `relocation_info` (spec §4.1: "do not rely on host-native
/// bitfield layout").
struct RawReloc {
    address: i32,
    symbolnum: u32,
    is_extern: bool,
    r_type: u32,
}

fn unpack_relocation_info(entry: &[u8]) -> Result<RawReloc> {
    let address = i32_at(entry, 0)?;
    let word = u32_at(entry, 4)?;
    Ok(RawReloc {
        address,
        symbolnum: word & 0x00ff_ffff,
        // bit 24 = pcrel, bits 25:26 = length: not needed, the unified
        // RelocationKind already implies patch width and PC-relativity.
        is_extern: (word >> 27) & 0x1 != 0,
        r_type: (word >> 28) & 0xf,
    })
}

/// Parse a Mach-O 64 relocatable (`MH_OBJECT`) ARM64 object from `bytes`,
/// already known (by its caller) to start with `MH_MAGIC_64`.
pub fn parse_macho_object(filename: &str, bytes: &[u8]) -> Result<Object> {
    let file_err = |message: String| LinkError::Parse {
        file: filename.to_string(),
        message,
    };

    if bytes.len() < 32 {
        return Err(file_err("file shorter than mach_header_64".into()));
    }
    let magic = u32_at(bytes, 0)?;
    if magic != MH_MAGIC_64 {
        if magic == MH_CIGAM_64 {
            return Err(file_err("big-endian Mach-O objects are not supported".into()));
        }
        return Err(file_err("not a 64-bit Mach-O object".into()));
    }
    let cputype = i32_at(bytes, 4)?;
    if cputype != CPU_TYPE_ARM64 {
        return Err(file_err("only ARM64 Mach-O objects are supported".into()));
    }
    let ncmds = u32_at(bytes, 16)? as usize;
    let sizeofcmds = u32_at(bytes, 20)? as usize;

    let mut object = Object::new(filename, PlatformFormat::MachO);

    struct RawSection {
        segname: String,
        sectname: String,
        addr: u64,
        size: u64,
        offset: u32,
        align: u32,
        reloff: u32,
        nreloc: u32,
    }
    let mut raw_sections: Vec<RawSection> = Vec::new();
    // Mach-O symbol table, deferred until we know every section so that
    // `n_sect` (1-based, across all segments in command order) resolves.
    let mut symtab: Option<(u32, u32, u32, u32)> = None;

    let mut cmd_off = 32usize;
    let cmds_end = 32 + sizeofcmds;
    if cmds_end > bytes.len() {
        return Err(file_err("load commands extend past end of file".into()));
    }
    for _ in 0..ncmds {
        let cmd_hdr = bytes
            .get(cmd_off..cmd_off + 8)
            .ok_or_else(|| file_err("truncated load command".into()))?;
        let cmd = u32_at(cmd_hdr, 0)?;
        let cmdsize = u32_at(cmd_hdr, 4)? as usize;
        if cmdsize < 8 || cmd_off + cmdsize > bytes.len() {
            return Err(file_err("load command size out of bounds".into()));
        }
        match cmd {
            LC_SEGMENT_64 => {
                let seg = bytes
                    .get(cmd_off..cmd_off + SEG_CMD_SIZE)
                    .ok_or_else(|| file_err("truncated segment_command_64".into()))?;
                let nsects = u32_at(seg, 64)?;
                let mut soff = cmd_off + SEG_CMD_SIZE;
                for _ in 0..nsects {
                    let sec = bytes
                        .get(soff..soff + SECTION_SIZE)
                        .ok_or_else(|| file_err("truncated section_64".into()))?;
                    raw_sections.push(RawSection {
                        sectname: cstr16(&sec[0..16]),
                        segname: cstr16(&sec[16..32]),
                        addr: u64_at(sec, 32)?,
                        size: u64_at(sec, 40)?,
                        offset: u32_at(sec, 48)?,
                        align: u32_at(sec, 52)?,
                        reloff: u32_at(sec, 56)?,
                        nreloc: u32_at(sec, 60)?,
                    });
                    soff += SECTION_SIZE;
                }
            }
            LC_SYMTAB => {
                let s = bytes
                    .get(cmd_off..cmd_off + SYMTAB_CMD_SIZE)
                    .ok_or_else(|| file_err("truncated symtab_command".into()))?;
                symtab = Some((
                    u32_at(s, 8)?,  // symoff
                    u32_at(s, 12)?, // nsyms
                    u32_at(s, 16)?, // stroff
                    u32_at(s, 20)?, // strsize
                ));
            }
            _ => {}
        }
        cmd_off += cmdsize;
    }

    // section_map[i] = index into unified `object.sections`, 1-based
    // n_sect values index into `raw_sections` as `n_sect - 1`.
    let mut section_map: Vec<Option<usize>> = vec![None; raw_sections.len()];
    for (i, sec) in raw_sections.iter().enumerate() {
        let ty = classify_section(&sec.segname, &sec.sectname);
        if matches!(ty, SectionType::Unknown) {
            continue;
        }
        let alignment = 1u64 << sec.align;
        if !alignment.is_power_of_two() {
            return Err(file_err(format!(
                "section {} alignment {alignment} is not a power of two",
                sec.sectname
            )));
        }
        let is_bss = matches!(ty, SectionType::Bss);
        let section_bytes = if is_bss {
            None
        } else {
            Some(
                bytes
                    .get(sec.offset as usize..(sec.offset as usize + sec.size as usize))
                    .ok_or_else(|| file_err(format!("section {} data out of bounds", sec.sectname)))?
                    .to_vec(),
            )
        };
        let mut flags = SectionFlags::READ;
        if sec.segname == "__DATA" {
            flags |= SectionFlags::WRITE;
        }
        if sec.segname == "__TEXT" && sec.sectname == "__text" {
            flags |= SectionFlags::EXECUTE;
        }
        section_map[i] = Some(object.sections.len());
        object.sections.push(Section {
            name: sec.sectname.clone(),
            r#type: ty,
            bytes: section_bytes,
            size: sec.size,
            alignment,
            flags,
            vaddr: 0,
            object_index: 0,
        });
    }

    if let Some((symoff, nsyms, stroff, strsize)) = symtab {
        let strtab = bytes
            .get(stroff as usize..(stroff as usize + strsize as usize))
            .ok_or_else(|| file_err("string table out of bounds".into()))?;
        for i in 0..nsyms as usize {
            let off = symoff as usize + i * NLIST_SIZE;
            let entry = bytes
                .get(off..off + NLIST_SIZE)
                .ok_or_else(|| file_err("truncated nlist_64 entry".into()))?;
            let n_strx = u32_at(entry, 0)?;
            let n_type = entry[4];
            let n_sect = entry[5];
            let n_value = u64_at(entry, 8)?;

            const N_STAB: u8 = 0xe0;
            const N_EXT: u8 = 0x01;

            if n_type & N_STAB != 0 {
                continue; // debug symbol, not part of the linker's model
            }

            let mut name = cstr_at(strtab, n_strx as usize);
            // Mach-O convention: strip the leading underscore from
            // external names on read; the writer restores it (spec §4.1,
            // §6).
            if let Some(stripped) = name.strip_prefix('_') {
                name = stripped.to_string();
            }

            let is_defined = n_sect != 0;
            let section_index = if is_defined {
                section_map.get(n_sect as usize - 1).copied().flatten()
            } else {
                None
            };
            let binding = if n_type & N_EXT == 0 {
                SymbolBinding::Local
            } else if n_desc_is_weak(entry) {
                SymbolBinding::Weak
            } else {
                SymbolBinding::Global
            };

            object.symbols.push(Symbol {
                name,
                r#type: SymbolType::NoType,
                binding,
                section_index,
                value: n_value,
                size: 0,
                final_address: 0,
                is_defined,
                defining_object: None,
            });
        }
    }

    // Relocations live per-section.
    for (i, sec) in raw_sections.iter().enumerate() {
        let Some(target_section) = section_map[i] else {
            continue;
        };
        if sec.nreloc == 0 {
            continue;
        }
        let table = bytes
            .get(sec.reloff as usize..(sec.reloff as usize + sec.nreloc as usize * RELOC_INFO_SIZE))
            .ok_or_else(|| file_err("relocation table out of bounds".into()))?;

        // ARM64_RELOC_ADDEND is a modifier carrying the addend for the
        // *next* relocation in stream order (spec §4.1, §9 note 3).
        let mut pending_addend: i64 = 0;
        for chunk in table.chunks(RELOC_INFO_SIZE) {
            let raw = unpack_relocation_info(chunk)?;
            if raw.r_type == ARM64_RELOC_ADDEND {
                // The addend is packed into the symbolnum bitfield (bits
                // 0-23 of the second word) for this relocation type, not
                // the address field (sign-extended 24-bit value).
                pending_addend = sign_extend(raw.symbolnum as i64, 24);
                continue;
            }
            let kind = match raw.r_type {
                ARM64_RELOC_UNSIGNED => RelocationKind::Arm64Abs64,
                ARM64_RELOC_BRANCH26 => RelocationKind::Arm64Call26,
                ARM64_RELOC_PAGE21 => RelocationKind::Arm64AdrPrelPgHi21,
                ARM64_RELOC_PAGEOFF12 => RelocationKind::Arm64AddAbsLo12Nc,
                _ => {
                    pending_addend = 0;
                    continue;
                }
            };
            let symbol_index = if raw.is_extern {
                Some(raw.symbolnum as usize)
            } else {
                None
            };
            object.relocations.push(Relocation {
                offset: raw.address as u64,
                kind,
                symbol_index,
                addend: pending_addend,
                section_index: target_section,
                object_index: 0,
            });
            pending_addend = 0;
        }
    }

    Ok(object)
}

fn sign_extend(value: i64, bits: u32) -> i64 {
    let shift = 64 - bits;
    (value << shift) >> shift
}

fn cstr_at(table: &[u8], offset: usize) -> String {
    let end = table
        .get(offset..)
        .and_then(|s| s.iter().position(|&b| b == 0))
        .map(|p| offset + p)
        .unwrap_or(table.len());
    String::from_utf8_lossy(table.get(offset..end).unwrap_or(&[])).into_owned()
}

/// `n_desc` bit 5 (`N_WEAK_DEF`, value 0x0080) marks a weakly-bound
/// definition.
fn n_desc_is_weak(entry: &[u8]) -> bool {
    const N_WEAK_DEF: u16 = 0x0080;
    let n_desc = u16::from_le_bytes([entry[6], entry[7]]);
    n_desc & N_WEAK_DEF != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::model::SymbolBinding;

    fn push_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    fn push_i32(buf: &mut Vec<u8>, v: i32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    fn push_u64(buf: &mut Vec<u8>, v: u64) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    fn push_u16(buf: &mut Vec<u8>, v: u16) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    fn push_name16(buf: &mut Vec<u8>, name: &str) {
        let mut arr = [0u8; 16];
        arr[..name.len()].copy_from_slice(name.as_bytes());
        buf.extend_from_slice(&arr);
    }

    /// Builds a minimal `MH_OBJECT` ARM64 Mach-O with one `__TEXT,__text`
    /// section, one external defined symbol `_target`, and an
    /// `ARM64_RELOC_ADDEND` immediately followed by an `ARM64_RELOC_PAGE21`
    /// against that symbol — the pairing whose addend source this module's
    /// parser must get right.
    fn build_macho_object() -> Vec<u8> {
        let mut buf = Vec::new();
        push_u32(&mut buf, MH_MAGIC_64);
        push_u32(&mut buf, CPU_TYPE_ARM64 as u32);
        push_u32(&mut buf, CPU_SUBTYPE_ARM64_ALL as u32);
        push_u32(&mut buf, MH_OBJECT);
        push_u32(&mut buf, 2); // ncmds
        push_u32(
            &mut buf,
            (SEG_CMD_SIZE + SECTION_SIZE + SYMTAB_CMD_SIZE) as u32,
        );
        push_u32(&mut buf, 0); // flags
        push_u32(&mut buf, 0); // reserved

        let text_size = 16u64;
        let text_offset = 32 + SEG_CMD_SIZE + SECTION_SIZE + SYMTAB_CMD_SIZE;
        let symoff = text_offset + text_size as usize;
        let nsyms = 1u32;
        let stroff = symoff + nsyms as usize * NLIST_SIZE;
        let strtab_bytes: &[u8] = b"\0_target\0";
        let reloff = stroff + strtab_bytes.len();

        // LC_SEGMENT_64 __TEXT, one section
        push_u32(&mut buf, LC_SEGMENT_64);
        push_u32(&mut buf, (SEG_CMD_SIZE + SECTION_SIZE) as u32);
        push_name16(&mut buf, "__TEXT");
        push_u64(&mut buf, 0); // vmaddr
        push_u64(&mut buf, 0); // vmsize
        push_u64(&mut buf, 0); // fileoff
        push_u64(&mut buf, 0); // filesize
        push_u32(&mut buf, 7); // maxprot
        push_u32(&mut buf, 7); // initprot
        push_u32(&mut buf, 1); // nsects
        push_u32(&mut buf, 0); // flags

        // section_64 __text
        push_name16(&mut buf, "__text");
        push_name16(&mut buf, "__TEXT");
        push_u64(&mut buf, 0); // addr
        push_u64(&mut buf, text_size); // size
        push_u32(&mut buf, text_offset as u32);
        push_u32(&mut buf, 2); // align = 1<<2 = 4
        push_u32(&mut buf, reloff as u32);
        push_u32(&mut buf, 2); // nreloc
        push_u32(&mut buf, 0); // flags
        push_u32(&mut buf, 0); // reserved1
        push_u32(&mut buf, 0); // reserved2
        push_u32(&mut buf, 0); // reserved3

        // LC_SYMTAB
        push_u32(&mut buf, LC_SYMTAB);
        push_u32(&mut buf, SYMTAB_CMD_SIZE as u32);
        push_u32(&mut buf, symoff as u32);
        push_u32(&mut buf, nsyms);
        push_u32(&mut buf, stroff as u32);
        push_u32(&mut buf, strtab_bytes.len() as u32);

        assert_eq!(buf.len(), text_offset);
        buf.extend_from_slice(&[0u8; 16]); // __text bytes (content irrelevant)

        // nlist_64 for `_target`: external, defined in section 1, at 0x1000
        push_u32(&mut buf, 1); // n_strx -> strtab[1] == "_target"
        buf.push(0x01); // n_type = N_EXT
        buf.push(1); // n_sect
        push_u16(&mut buf, 0); // n_desc
        push_u64(&mut buf, 0x1000); // n_value

        buf.extend_from_slice(strtab_bytes);

        // ARM64_RELOC_ADDEND: 24-bit addend (5) packed into symbolnum, not
        // r_address.
        push_i32(&mut buf, 0); // r_address
        push_u32(&mut buf, 5 | (ARM64_RELOC_ADDEND << 28));

        // ARM64_RELOC_PAGE21 against symbol 0 (extern), consuming the
        // pending addend recorded above.
        push_i32(&mut buf, 0); // r_address (patch offset 0)
        push_u32(&mut buf, (1 << 27) | (ARM64_RELOC_PAGE21 << 28));

        buf
    }

    #[test]
    fn addend_modifier_attaches_to_next_relocation() {
        let bytes = build_macho_object();
        let object = parse_macho_object("a.o", &bytes).expect("valid object");

        assert_eq!(object.sections.len(), 1);
        assert_eq!(object.sections[0].r#type, SectionType::Text);

        assert_eq!(object.symbols.len(), 1);
        assert_eq!(object.symbols[0].name, "target");
        assert!(object.symbols[0].is_defined);
        assert_eq!(object.symbols[0].binding, SymbolBinding::Global);
        assert_eq!(object.symbols[0].value, 0x1000);

        assert_eq!(object.relocations.len(), 1);
        let reloc = &object.relocations[0];
        assert_eq!(reloc.kind, RelocationKind::Arm64AdrPrelPgHi21);
        assert_eq!(reloc.symbol_index, Some(0));
        assert_eq!(reloc.offset, 0);
        assert_eq!(
            reloc.addend, 5,
            "ARM64_RELOC_ADDEND's 24-bit addend is packed into symbolnum, not r_address"
        );
    }

    #[test]
    fn rejects_non_arm64_cpu_type() {
        let mut bytes = build_macho_object();
        bytes[4..8].copy_from_slice(&0i32.to_le_bytes());
        let err = parse_macho_object("bad.o", &bytes).unwrap_err();
        assert!(matches!(err, LinkError::Parse { .. }));
    }
}
