//! ELF-64 relocatable object reader (C1, ELF half).
//!
//! Parses `ET_REL` System V ABI objects into the unified model. Constants
//! and struct field layouts below follow the System V ABI and the
//! `b247e928_dj707chen-claudes-c-compiler` x86-64 linker's ELF parsing
//! module, which enumerates the same constant set.

use super::model::{
    Object, PlatformFormat, Relocation, RelocationKind, Section, SectionFlags, SectionType,
    Symbol, SymbolBinding, SymbolType,
};
use crate::error::{LinkError, Result};

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;
const RELA_SIZE: usize = 24;

const SHT_NULL: u32 = 0;
const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_RELA: u32 = 4;
const SHT_NOBITS: u32 = 8;

const SHF_WRITE: u64 = 0x1;
const SHF_ALLOC: u64 = 0x2;
const SHF_EXECINSTR: u64 = 0x4;

const SHN_UNDEF: u16 = 0;

const STB_LOCAL: u8 = 0;
const STB_GLOBAL: u8 = 1;
const STB_WEAK: u8 = 2;

const STT_NOTYPE: u8 = 0;
const STT_OBJECT: u8 = 1;
const STT_FUNC: u8 = 2;
const STT_SECTION: u8 = 3;

pub const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;

pub const R_X86_64_64: u32 = 1;
pub const R_X86_64_PC32: u32 = 2;
pub const R_X86_64_PLT32: u32 = 4;
pub const R_X86_64_GOTPCREL: u32 = 9;
pub const R_AARCH64_ABS64: u32 = 257;
pub const R_AARCH64_CALL26: u32 = 283;
pub const R_AARCH64_JUMP26: u32 = 282;
pub const R_AARCH64_ADR_PREL_PG_HI21: u32 = 275;
pub const R_AARCH64_ADD_ABS_LO12_NC: u32 = 277;

fn u16_at(b: &[u8], off: usize) -> Result<u16> {
    let bytes: [u8; 2] = b
        .get(off..off + 2)
        .ok_or_else(|| malformed("truncated u16 field"))?
        .try_into()
        .unwrap();
    Ok(u16::from_le_bytes(bytes))
}

fn u32_at(b: &[u8], off: usize) -> Result<u32> {
    let bytes: [u8; 4] = b
        .get(off..off + 4)
        .ok_or_else(|| malformed("truncated u32 field"))?
        .try_into()
        .unwrap();
    Ok(u32::from_le_bytes(bytes))
}

fn u64_at(b: &[u8], off: usize) -> Result<u64> {
    let bytes: [u8; 8] = b
        .get(off..off + 8)
        .ok_or_else(|| malformed("truncated u64 field"))?
        .try_into()
        .unwrap();
    Ok(u64::from_le_bytes(bytes))
}

fn i64_at(b: &[u8], off: usize) -> Result<i64> {
    Ok(u64_at(b, off)? as i64)
}

fn malformed(message: impl Into<String>) -> LinkError {
    LinkError::Parse {
        file: String::new(),
        message: message.into(),
    }
}

fn cstr_at(table: &[u8], offset: usize) -> String {
    let end = table[offset..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| offset + p)
        .unwrap_or(table.len());
    String::from_utf8_lossy(&table[offset..end]).into_owned()
}

fn classify_section(name: &str) -> SectionType {
    if name == ".text" || name.starts_with(".text.") {
        SectionType::Text
    } else if name == ".data" || name.starts_with(".data.") {
        SectionType::Data
    } else if name == ".bss" || name.starts_with(".bss.") {
        SectionType::Bss
    } else if name == ".rodata" || name == ".rdata" || name.starts_with(".rodata.") {
        SectionType::Rodata
    } else {
        SectionType::Unknown
    }
}

fn map_reloc_kind(machine: u16, r_type: u32) -> Option<RelocationKind> {
    match machine {
        EM_X86_64 => match r_type {
            R_X86_64_64 => Some(RelocationKind::X64_64),
            R_X86_64_PC32 => Some(RelocationKind::X64_PC32),
            R_X86_64_PLT32 => Some(RelocationKind::X64_PLT32),
            R_X86_64_GOTPCREL => Some(RelocationKind::X64_GOTPCREL),
            _ => None,
        },
        EM_AARCH64 => match r_type {
            R_AARCH64_ABS64 => Some(RelocationKind::Arm64Abs64),
            R_AARCH64_CALL26 => Some(RelocationKind::Arm64Call26),
            R_AARCH64_JUMP26 => Some(RelocationKind::Arm64Jump26),
            R_AARCH64_ADR_PREL_PG_HI21 => Some(RelocationKind::Arm64AdrPrelPgHi21),
            R_AARCH64_ADD_ABS_LO12_NC => Some(RelocationKind::Arm64AddAbsLo12Nc),
            _ => None,
        },
        _ => None,
    }
}

/// Parse an ELF-64 `ET_REL` object from `bytes`, already known (by its
/// caller) to start with the ELF magic.
pub fn parse_elf_object(filename: &str, bytes: &[u8]) -> Result<Object> {
    let file_err = |message: String| LinkError::Parse {
        file: filename.to_string(),
        message,
    };

    if bytes.len() < EHDR_SIZE {
        return Err(file_err("file shorter than ELF header".into()));
    }
    if bytes[EI_CLASS] != ELFCLASS64 {
        return Err(file_err("not a 64-bit ELF object".into()));
    }
    if bytes[EI_DATA] != ELFDATA2LSB {
        return Err(file_err("not a little-endian ELF object".into()));
    }

    let e_machine = u16_at(bytes, 18).map_err(|_| file_err("truncated e_machine".into()))?;
    let e_shoff = u64_at(bytes, 40).map_err(|_| file_err("truncated e_shoff".into()))? as usize;
    let e_shentsize =
        u16_at(bytes, 58).map_err(|_| file_err("truncated e_shentsize".into()))? as usize;
    let e_shnum = u16_at(bytes, 60).map_err(|_| file_err("truncated e_shnum".into()))? as usize;
    let e_shstrndx =
        u16_at(bytes, 62).map_err(|_| file_err("truncated e_shstrndx".into()))? as usize;

    if e_shentsize != 0 && e_shentsize != SHDR_SIZE {
        return Err(file_err("unexpected section header entry size".into()));
    }

    let section_header = |idx: usize| -> Result<&[u8]> {
        let start = e_shoff + idx * SHDR_SIZE;
        bytes
            .get(start..start + SHDR_SIZE)
            .ok_or_else(|| file_err(format!("section header {idx} out of bounds")))
    };

    if e_shnum > 0 {
        let _ = section_header(e_shnum - 1)?;
    }

    // Raw header fields for every section, gathered before we need any
    // string-table lookups.
    struct RawShdr {
        name_off: u32,
        sh_type: u32,
        flags: u64,
        size: u64,
        offset: u64,
        link: u32,
        info: u32,
        addralign: u64,
        entsize: u64,
    }

    let mut raw_shdrs = Vec::with_capacity(e_shnum);
    for i in 0..e_shnum {
        let sh = section_header(i)?;
        raw_shdrs.push(RawShdr {
            name_off: u32_at(sh, 0)?,
            sh_type: u32_at(sh, 4)?,
            flags: u64_at(sh, 8)?,
            size: u64_at(sh, 32)?,
            offset: u64_at(sh, 24)?,
            link: u32_at(sh, 40)?,
            info: u32_at(sh, 44)?,
            addralign: u64_at(sh, 48)?,
            entsize: u64_at(sh, 56)?,
        });
    }

    let shstrtab: &[u8] = if e_shstrndx < raw_shdrs.len() {
        let sh = &raw_shdrs[e_shstrndx];
        bytes
            .get(sh.offset as usize..(sh.offset + sh.size) as usize)
            .ok_or_else(|| file_err("section header string table out of bounds".into()))?
    } else {
        &[]
    };

    let mut object = Object::new(filename, PlatformFormat::Elf);
    // Maps an ELF section-header index to our unified `sections` index,
    // for symbol/relocation cross-referencing. `None` for non-loadable or
    // symbol/string/relocation table sections that never become a Section.
    let mut section_map: Vec<Option<usize>> = vec![None; raw_shdrs.len()];
    let mut symtab_idx: Option<usize> = None;
    let mut rela_shdrs: Vec<usize> = Vec::new();

    for (i, sh) in raw_shdrs.iter().enumerate() {
        match sh.sh_type {
            SHT_NULL => {}
            SHT_SYMTAB => symtab_idx = Some(i),
            SHT_STRTAB => {}
            SHT_RELA => rela_shdrs.push(i),
            SHT_PROGBITS | SHT_NOBITS => {
                let name = cstr_at(shstrtab, sh.name_off as usize);
                let ty = classify_section(&name);
                let alignment = sh.addralign.max(1);
                if !alignment.is_power_of_two() {
                    return Err(file_err(format!(
                        "section {name} alignment {alignment} is not a power of two"
                    )));
                }
                let bytes_in_section = if sh.sh_type == SHT_NOBITS {
                    None
                } else {
                    Some(
                        bytes
                            .get(sh.offset as usize..(sh.offset + sh.size) as usize)
                            .ok_or_else(|| file_err(format!("section {name} data out of bounds")))?
                            .to_vec(),
                    )
                };
                let mut flags = SectionFlags::READ;
                if sh.flags & SHF_WRITE != 0 {
                    flags |= SectionFlags::WRITE;
                }
                if sh.flags & SHF_EXECINSTR != 0 {
                    flags |= SectionFlags::EXECUTE;
                }
                if sh.flags & SHF_ALLOC == 0 {
                    // Not part of the runtime image (e.g. `.comment`).
                    continue;
                }
                section_map[i] = Some(object.sections.len());
                object.sections.push(Section {
                    name,
                    r#type: ty,
                    bytes: bytes_in_section,
                    size: sh.size,
                    alignment,
                    flags,
                    vaddr: 0,
                    object_index: 0,
                });
            }
            _ => {}
        }
    }

    if let Some(symtab) = symtab_idx {
        let sh = &raw_shdrs[symtab];
        let strtab_sh = &raw_shdrs[sh.link as usize];
        let strtab = bytes
            .get(strtab_sh.offset as usize..(strtab_sh.offset + strtab_sh.size) as usize)
            .ok_or_else(|| file_err("symbol string table out of bounds".into()))?;
        let table = bytes
            .get(sh.offset as usize..(sh.offset + sh.size) as usize)
            .ok_or_else(|| file_err("symbol table out of bounds".into()))?;
        if sh.entsize != 0 && sh.entsize as usize != SYM_SIZE {
            return Err(file_err("unexpected symbol entry size".into()));
        }
        let count = table.len() / SYM_SIZE;
        for i in 0..count {
            let s = &table[i * SYM_SIZE..(i + 1) * SYM_SIZE];
            let name_off = u32_at(s, 0)?;
            let info = s[4];
            let shndx = u16_at(s, 6)?;
            let value = u64_at(s, 8)?;
            let size = u64_at(s, 16)?;
            let binding = match info >> 4 {
                STB_LOCAL => SymbolBinding::Local,
                STB_GLOBAL => SymbolBinding::Global,
                STB_WEAK => SymbolBinding::Weak,
                _ => SymbolBinding::Local,
            };
            let sym_type = match info & 0xf {
                STT_FUNC => SymbolType::Func,
                STT_OBJECT => SymbolType::Object,
                STT_SECTION => SymbolType::Section,
                _ => SymbolType::NoType,
            };
            let name = cstr_at(strtab, name_off as usize);
            let is_defined = shndx != SHN_UNDEF;
            let section_index = if is_defined {
                section_map.get(shndx as usize).copied().flatten()
            } else {
                None
            };
            object.symbols.push(Symbol {
                name,
                r#type: sym_type,
                binding,
                section_index,
                value,
                size,
                final_address: 0,
                is_defined,
                defining_object: None,
            });
        }
    }

    for &rela_idx in &rela_shdrs {
        let sh = &raw_shdrs[rela_idx];
        let Some(target_section) = section_map.get(sh.info as usize).copied().flatten() else {
            continue;
        };
        let table = bytes
            .get(sh.offset as usize..(sh.offset + sh.size) as usize)
            .ok_or_else(|| file_err("relocation table out of bounds".into()))?;
        if sh.entsize != 0 && sh.entsize as usize != RELA_SIZE {
            return Err(file_err("unexpected relocation entry size".into()));
        }
        let count = table.len() / RELA_SIZE;
        for i in 0..count {
            let r = &table[i * RELA_SIZE..(i + 1) * RELA_SIZE];
            let r_offset = u64_at(r, 0)?;
            let r_info = u64_at(r, 8)?;
            let r_addend = i64_at(r, 16)?;
            let sym_idx = (r_info >> 32) as u32;
            let r_type = (r_info & 0xffff_ffff) as u32;
            let Some(kind) = map_reloc_kind(e_machine, r_type) else {
                continue;
            };
            object.relocations.push(Relocation {
                offset: r_offset,
                kind,
                symbol_index: Some(sym_idx as usize),
                addend: r_addend,
                section_index: target_section,
                object_index: 0,
            });
        }
    }

    Ok(object)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_u16(buf: &mut Vec<u8>, v: u16) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    fn push_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    fn push_u64(buf: &mut Vec<u8>, v: u64) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    fn push_i64(buf: &mut Vec<u8>, v: i64) {
        buf.extend_from_slice(&(v as u64).to_le_bytes());
    }
    fn put_u16(buf: &mut [u8], off: usize, v: u16) {
        buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }
    fn put_u32(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// A null-terminated string table and the offset of each entry within it.
    fn cstr_table(names: &[&str]) -> (Vec<u8>, Vec<u32>) {
        let mut table = vec![0u8];
        let mut offsets = Vec::new();
        for name in names {
            offsets.push(table.len() as u32);
            table.extend_from_slice(name.as_bytes());
            table.push(0);
        }
        (table, offsets)
    }

    /// Builds a minimal `ET_REL` ELF-64 x86-64 object with one `.text`
    /// section, a defined global `main` and an undefined global `helper`,
    /// and one `R_X86_64_PLT32` relocation against `helper`.
    fn build_elf_object() -> Vec<u8> {
        let mut buf = vec![0u8; EHDR_SIZE];
        buf[0..4].copy_from_slice(&ELF_MAGIC);
        buf[EI_CLASS] = ELFCLASS64;
        buf[EI_DATA] = ELFDATA2LSB;
        put_u16(&mut buf, 16, 1); // e_type = ET_REL
        put_u16(&mut buf, 18, EM_X86_64);
        put_u32(&mut buf, 20, 1); // e_version
        put_u16(&mut buf, 52, EHDR_SIZE as u16);
        put_u16(&mut buf, 58, SHDR_SIZE as u16);
        put_u16(&mut buf, 60, 6); // e_shnum
        put_u16(&mut buf, 62, 5); // e_shstrndx

        let text_off = buf.len();
        let text_bytes: &[u8] = &[0x48, 0xC7, 0xC0, 0x2A, 0x00, 0x00, 0x00, 0xC3];
        buf.extend_from_slice(text_bytes);

        let (strtab, str_offsets) = cstr_table(&["main", "helper"]);
        let strtab_off = buf.len();
        buf.extend_from_slice(&strtab);

        let symtab_off = buf.len();
        buf.extend_from_slice(&[0u8; SYM_SIZE]); // null symbol
        push_u32(&mut buf, str_offsets[0]);
        buf.push((STB_GLOBAL << 4) | STT_FUNC);
        buf.push(0);
        push_u16(&mut buf, 1); // st_shndx = .text (raw shdr index 1)
        push_u64(&mut buf, 0);
        push_u64(&mut buf, text_bytes.len() as u64);
        push_u32(&mut buf, str_offsets[1]);
        buf.push((STB_GLOBAL << 4) | STT_NOTYPE);
        buf.push(0);
        push_u16(&mut buf, SHN_UNDEF);
        push_u64(&mut buf, 0);
        push_u64(&mut buf, 0);

        let rela_off = buf.len();
        push_u64(&mut buf, 4); // r_offset
        let sym_idx: u64 = 2; // helper
        push_u64(&mut buf, (sym_idx << 32) | R_X86_64_PLT32 as u64);
        push_i64(&mut buf, -4);

        let (shstrtab, sh_off) =
            cstr_table(&[".text", ".symtab", ".strtab", ".rela.text", ".shstrtab"]);
        let shstrtab_off = buf.len();
        buf.extend_from_slice(&shstrtab);

        let shoff = buf.len();

        buf.extend_from_slice(&[0u8; SHDR_SIZE]); // NULL section

        // .text
        push_u32(&mut buf, sh_off[0]);
        push_u32(&mut buf, SHT_PROGBITS);
        push_u64(&mut buf, SHF_ALLOC | SHF_EXECINSTR);
        push_u64(&mut buf, 0);
        push_u64(&mut buf, text_off as u64);
        push_u64(&mut buf, text_bytes.len() as u64);
        push_u32(&mut buf, 0);
        push_u32(&mut buf, 0);
        push_u64(&mut buf, 16);
        push_u64(&mut buf, 0);

        // .symtab
        push_u32(&mut buf, sh_off[1]);
        push_u32(&mut buf, SHT_SYMTAB);
        push_u64(&mut buf, 0);
        push_u64(&mut buf, 0);
        push_u64(&mut buf, symtab_off as u64);
        push_u64(&mut buf, (3 * SYM_SIZE) as u64);
        push_u32(&mut buf, 3); // link -> .strtab
        push_u32(&mut buf, 0);
        push_u64(&mut buf, 8);
        push_u64(&mut buf, SYM_SIZE as u64);

        // .strtab
        push_u32(&mut buf, sh_off[2]);
        push_u32(&mut buf, SHT_STRTAB);
        push_u64(&mut buf, 0);
        push_u64(&mut buf, 0);
        push_u64(&mut buf, strtab_off as u64);
        push_u64(&mut buf, strtab.len() as u64);
        push_u32(&mut buf, 0);
        push_u32(&mut buf, 0);
        push_u64(&mut buf, 1);
        push_u64(&mut buf, 0);

        // .rela.text
        push_u32(&mut buf, sh_off[3]);
        push_u32(&mut buf, SHT_RELA);
        push_u64(&mut buf, 0);
        push_u64(&mut buf, 0);
        push_u64(&mut buf, rela_off as u64);
        push_u64(&mut buf, RELA_SIZE as u64);
        push_u32(&mut buf, 2); // link -> .symtab
        push_u32(&mut buf, 1); // info -> .text
        push_u64(&mut buf, 8);
        push_u64(&mut buf, RELA_SIZE as u64);

        // .shstrtab
        push_u32(&mut buf, sh_off[4]);
        push_u32(&mut buf, SHT_STRTAB);
        push_u64(&mut buf, 0);
        push_u64(&mut buf, 0);
        push_u64(&mut buf, shstrtab_off as u64);
        push_u64(&mut buf, shstrtab.len() as u64);
        push_u32(&mut buf, 0);
        push_u32(&mut buf, 0);
        push_u64(&mut buf, 1);
        push_u64(&mut buf, 0);

        buf[40..48].copy_from_slice(&(shoff as u64).to_le_bytes());
        buf
    }

    #[test]
    fn parses_sections_symbols_and_relocations() {
        let bytes = build_elf_object();
        let object = parse_elf_object("a.o", &bytes).expect("valid object");

        assert_eq!(object.sections.len(), 1);
        assert_eq!(object.sections[0].name, ".text");
        assert_eq!(object.sections[0].r#type, SectionType::Text);
        assert_eq!(
            object.sections[0].bytes.as_deref(),
            Some(&[0x48, 0xC7, 0xC0, 0x2A, 0x00, 0x00, 0x00, 0xC3][..])
        );
        assert!(object.sections[0].flags.contains(SectionFlags::EXECUTE));

        assert_eq!(object.symbols.len(), 3);
        let main = &object.symbols[1];
        assert_eq!(main.name, "main");
        assert!(main.is_defined);
        assert_eq!(main.binding, SymbolBinding::Global);
        assert_eq!(main.section_index, Some(0));
        let helper = &object.symbols[2];
        assert_eq!(helper.name, "helper");
        assert!(!helper.is_defined);

        assert_eq!(object.relocations.len(), 1);
        let reloc = &object.relocations[0];
        assert_eq!(reloc.offset, 4);
        assert_eq!(reloc.kind, RelocationKind::X64_PLT32);
        assert_eq!(reloc.symbol_index, Some(2));
        assert_eq!(reloc.addend, -4);
        assert_eq!(reloc.section_index, 0);
    }

    #[test]
    fn rejects_non_64_bit_class() {
        let mut bytes = build_elf_object();
        bytes[EI_CLASS] = 1; // ELFCLASS32
        let err = parse_elf_object("bad.o", &bytes).unwrap_err();
        assert!(matches!(err, LinkError::Parse { .. }));
    }
}
