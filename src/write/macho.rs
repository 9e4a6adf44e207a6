//! Mach-O 64 `MH_EXECUTE` emission (C6, spec §4.6.2). Load-command
//! ordering and struct layouts follow `/usr/include/mach-o/loader.h`, the
//! same reference the reader in [`crate::object::macho`] parses against.

use crate::context::LinkerContext;
use crate::error::Result;
use crate::object::model::{DefiningObject, SectionType};
use tracing::warn;

const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_EXECUTE: u32 = 0x2;
const MH_PIE: u32 = 0x0020_0000;
const MH_DYLDLINK: u32 = 0x4;
const MH_TWOLEVEL: u32 = 0x80;

const CPU_TYPE_ARM64: i32 = 0x0100_000c;
const CPU_SUBTYPE_ARM64_ALL: i32 = 0;

const LC_SEGMENT_64: u32 = 0x19;
const LC_SYMTAB: u32 = 0x2;
const LC_DYSYMTAB: u32 = 0xb;
const LC_LOAD_DYLINKER: u32 = 0xe;
const LC_UUID: u32 = 0x1b;
const LC_BUILD_VERSION: u32 = 0x32;
const LC_REQ_DYLD: u32 = 0x8000_0000;
const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;
const LC_LOAD_DYLIB: u32 = 0xc;

const VM_PROT_NONE: u32 = 0;
const VM_PROT_READ: u32 = 1;
const VM_PROT_WRITE: u32 = 2;
const VM_PROT_EXECUTE: u32 = 4;

const PLATFORM_MACOS: u32 = 1;
const PAGEZERO_SIZE: u64 = 0x1_0000_0000;

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

fn pad_cstr16(name: &str) -> [u8; 16] {
    let mut buf = [0u8; 16];
    let bytes = name.as_bytes();
    let n = bytes.len().min(16);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

fn push_segment_64(
    out: &mut Vec<u8>,
    segname: &str,
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    maxprot: u32,
    initprot: u32,
    sections: &[SectionDesc],
) {
    let cmdsize = 72 + 80 * sections.len() as u32;
    out.extend_from_slice(&LC_SEGMENT_64.to_le_bytes());
    out.extend_from_slice(&cmdsize.to_le_bytes());
    out.extend_from_slice(&pad_cstr16(segname));
    out.extend_from_slice(&vmaddr.to_le_bytes());
    out.extend_from_slice(&vmsize.to_le_bytes());
    out.extend_from_slice(&fileoff.to_le_bytes());
    out.extend_from_slice(&filesize.to_le_bytes());
    out.extend_from_slice(&maxprot.to_le_bytes());
    out.extend_from_slice(&initprot.to_le_bytes());
    out.extend_from_slice(&(sections.len() as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // flags
    for s in sections {
        out.extend_from_slice(&pad_cstr16(s.sectname));
        out.extend_from_slice(&pad_cstr16(segname));
        out.extend_from_slice(&s.addr.to_le_bytes());
        out.extend_from_slice(&s.size.to_le_bytes());
        out.extend_from_slice(&(s.offset as u32).to_le_bytes());
        out.extend_from_slice(&s.align.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // reloff
        out.extend_from_slice(&0u32.to_le_bytes()); // nreloc
        out.extend_from_slice(&s.flags.to_le_bytes());
        out.extend_from_slice(&[0u8; 12]); // reserved1/2/3
    }
}

struct SectionDesc<'a> {
    sectname: &'a str,
    addr: u64,
    size: u64,
    offset: u64,
    align: u32,
    flags: u32,
}

const S_ZEROFILL: u32 = 0x1;

/// Resolve `name` through the global symbol index (spec §4.3 Phase 1
/// weak/global precedence) rather than the first matching defined symbol
/// in object-add order, so a shadowed weak definition never wins over the
/// definition that actually resolved every reference to `name`.
fn find_symbol_address(ctx: &LinkerContext, name: &str) -> Option<u64> {
    match ctx.global_symbol_index.get(name)?.defining_object {
        DefiningObject::Object(obj_idx) => ctx.objects[obj_idx]
            .symbols
            .iter()
            .find(|s| s.name == name && s.is_defined)
            .map(|s| s.final_address),
        DefiningObject::RuntimeSatisfied => None,
    }
}

/// Build the executable bytes into `ctx.executable_bytes` and set
/// `ctx.entry_point`, per the load-command sequence enumerated in spec
/// §4.6.2. If `_main` is missing, warn loudly and default the entry
/// point to the text segment base rather than failing (spec §9 note 2:
/// preserve the source's behavior here, not silently "fix" it).
pub fn write_macho_executable(ctx: &mut LinkerContext) -> Result<()> {
    let text = ctx.merged_sections.iter().find(|s| s.r#type == SectionType::Text);
    let rodata = ctx.merged_sections.iter().find(|s| s.r#type == SectionType::Rodata);
    let data = ctx.merged_sections.iter().find(|s| s.r#type == SectionType::Data);
    let bss = ctx.merged_sections.iter().find(|s| s.r#type == SectionType::Bss);

    let text_vaddr = text.map(|s| s.vaddr).unwrap_or(ctx.base_address + ctx.target.page_size());

    ctx.entry_point = match find_symbol_address(ctx, "main") {
        Some(addr) => addr,
        None => {
            warn!(
                "Mach-O entry symbol `_main` not found; defaulting entry_point to text segment base {:#x}",
                text_vaddr
            );
            text_vaddr
        }
    };

    // --- File layout ---
    let dylinker_name = "/usr/lib/dyld\0";
    let dylinker_name_padded = align_up(dylinker_name.len() as u64, 8) as usize;
    let dylinker_cmdsize = 12 + dylinker_name_padded as u32;

    let dylib_name = "/usr/lib/libSystem.B.dylib\0";
    let dylib_name_padded = align_up(dylib_name.len() as u64, 8) as usize;
    let dylib_cmdsize = 24 + dylib_name_padded as u32;

    let text_sections: Vec<SectionDesc> = [
        text.map(|s| ("__text", s, true)),
        rodata.map(|s| ("__const", s, false)),
    ]
    .into_iter()
    .flatten()
    .map(|(name, s, exec)| SectionDesc {
        sectname: name,
        addr: s.vaddr,
        size: s.size,
        offset: 0, // filled in after file offsets are known
        align: s.alignment.trailing_zeros(),
        flags: if exec { 0x8000_0400 } else { 0 },
    })
    .collect();

    let data_sections_meta: Vec<(&str, Option<&crate::object::model::MergedSection>, bool)> =
        vec![("__data", data, false), ("__bss", bss, true)];

    let text_cmdsize = 72 + 80 * text_sections.len() as u32;
    let data_section_count = data_sections_meta.iter().filter(|(_, s, _)| s.is_some()).count();
    let data_cmdsize = 72 + 80 * data_section_count as u32;

    let header_size = 32u64;
    let sizeofcmds = 72 // __PAGEZERO
        + text_cmdsize as u64
        + data_cmdsize as u64
        + 72 // __LINKEDIT
        + 8  // LC_DYLD_INFO_ONLY (dyld_info_command minus the trailing fields we zero — kept at command-header-only size for this toy emitter)
        + 24 // symtab
        + 80 // dysymtab
        + dylinker_cmdsize as u64
        + 24 // uuid
        + 24 // build_version (no tools)
        + 24 // LC_MAIN
        + dylib_cmdsize as u64;
    let ncmds = 12u32;

    let header_region = header_size + sizeofcmds;
    let text_file_start = header_region;
    let text_bytes: Vec<u8> = text.map(|s| s.bytes.clone()).unwrap_or_default();
    let rodata_bytes: Vec<u8> = rodata.map(|s| s.bytes.clone()).unwrap_or_default();
    let text_file_end = text_file_start + text_bytes.len() as u64 + rodata_bytes.len() as u64;

    let data_file_start = text_file_end;
    let data_bytes: Vec<u8> = data.map(|s| s.bytes.clone()).unwrap_or_default();
    let data_file_end = data_file_start + data_bytes.len() as u64;

    // Symbol table + string table, in __LINKEDIT.
    let mut strtab = vec![0u8]; // index 0 is the empty string
    let mut nlist_entries = Vec::new();
    for object in &ctx.objects {
        for symbol in &object.symbols {
            if !symbol.is_defined || !matches!(symbol.binding, crate::object::model::SymbolBinding::Global) {
                continue;
            }
            let emitted_name = format!("_{}", symbol.name);
            let str_off = strtab.len() as u32;
            strtab.extend_from_slice(emitted_name.as_bytes());
            strtab.push(0);
            nlist_entries.push((str_off, symbol.final_address));
        }
    }
    let symtab_off = data_file_end;
    let nsyms = nlist_entries.len() as u32;
    let symtab_bytes_len = nlist_entries.len() as u64 * 16;
    let strtab_off = symtab_off + symtab_bytes_len;
    let strtab_len = strtab.len() as u64;

    let linkedit_fileoff = symtab_off;
    let linkedit_filesize = symtab_bytes_len + strtab_len;
    let linkedit_vmsize = align_up(linkedit_filesize, ctx.target.page_size());

    let text_vmsize = align_up(text_file_end, ctx.target.page_size());
    let data_vaddr = data.map(|s| s.vaddr).unwrap_or(text_vaddr + text_vmsize);
    let data_vmsize = {
        let data_size = data.map(|s| s.size).unwrap_or(0);
        let bss_size = bss.map(|s| s.size).unwrap_or(0);
        align_up(data_size + bss_size, ctx.target.page_size())
    };
    let linkedit_vaddr = align_up(data_vaddr + data_vmsize, ctx.target.page_size());

    // --- Emit ---
    let mut out = Vec::new();
    out.extend_from_slice(&MH_MAGIC_64.to_le_bytes());
    out.extend_from_slice(&CPU_TYPE_ARM64.to_le_bytes());
    out.extend_from_slice(&CPU_SUBTYPE_ARM64_ALL.to_le_bytes());
    out.extend_from_slice(&MH_EXECUTE.to_le_bytes());
    out.extend_from_slice(&ncmds.to_le_bytes());
    out.extend_from_slice(&(sizeofcmds as u32).to_le_bytes());
    out.extend_from_slice(&(MH_DYLDLINK | MH_TWOLEVEL | MH_PIE).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // reserved

    // __PAGEZERO
    push_segment_64(
        &mut out,
        "__PAGEZERO",
        0,
        PAGEZERO_SIZE,
        0,
        0,
        VM_PROT_NONE,
        VM_PROT_NONE,
        &[],
    );

    let text_sections_with_offsets: Vec<SectionDesc> = {
        let mut offset = text_file_start;
        let mut v = Vec::new();
        if let Some(s) = text {
            v.push(SectionDesc {
                sectname: "__text",
                addr: s.vaddr,
                size: s.size,
                offset,
                align: s.alignment.trailing_zeros(),
                flags: 0x8000_0400,
            });
            offset += s.size;
        }
        if let Some(s) = rodata {
            v.push(SectionDesc {
                sectname: "__const",
                addr: s.vaddr,
                size: s.size,
                offset,
                align: s.alignment.trailing_zeros(),
                flags: 0,
            });
        }
        v
    };
    push_segment_64(
        &mut out,
        "__TEXT",
        text_vaddr,
        text_vmsize,
        text_file_start,
        text_file_end,
        VM_PROT_READ | VM_PROT_WRITE | VM_PROT_EXECUTE,
        VM_PROT_READ | VM_PROT_EXECUTE,
        &text_sections_with_offsets,
    );

    let data_sections_with_offsets: Vec<SectionDesc> = {
        let mut v = Vec::new();
        if let Some(s) = data {
            v.push(SectionDesc {
                sectname: "__data",
                addr: s.vaddr,
                size: s.size,
                offset: data_file_start,
                align: s.alignment.trailing_zeros(),
                flags: 0,
            });
        }
        if let Some(s) = bss {
            v.push(SectionDesc {
                sectname: "__bss",
                addr: s.vaddr,
                size: s.size,
                offset: 0,
                align: s.alignment.trailing_zeros(),
                flags: S_ZEROFILL,
            });
        }
        v
    };
    push_segment_64(
        &mut out,
        "__DATA",
        data_vaddr,
        data_vmsize,
        data_file_start,
        data_bytes.len() as u64,
        VM_PROT_READ | VM_PROT_WRITE,
        VM_PROT_READ | VM_PROT_WRITE,
        &data_sections_with_offsets,
    );

    push_segment_64(
        &mut out,
        "__LINKEDIT",
        linkedit_vaddr,
        linkedit_vmsize,
        linkedit_fileoff,
        linkedit_filesize,
        VM_PROT_READ,
        VM_PROT_READ,
        &[],
    );

    // LC_DYLD_INFO_ONLY: every offset/size zero (no bind/rebase info emitted).
    out.extend_from_slice(&LC_DYLD_INFO_ONLY.to_le_bytes());
    out.extend_from_slice(&8u32.to_le_bytes());

    // LC_SYMTAB
    out.extend_from_slice(&LC_SYMTAB.to_le_bytes());
    out.extend_from_slice(&24u32.to_le_bytes());
    out.extend_from_slice(&(symtab_off as u32).to_le_bytes());
    out.extend_from_slice(&nsyms.to_le_bytes());
    out.extend_from_slice(&(strtab_off as u32).to_le_bytes());
    out.extend_from_slice(&(strtab_len as u32).to_le_bytes());

    // LC_DYSYMTAB: only the counts this linker actually produces are
    // meaningful (a flat, fully-local symbol table); index-category
    // fields that describe import/export boundaries are zeroed.
    out.extend_from_slice(&LC_DYSYMTAB.to_le_bytes());
    out.extend_from_slice(&80u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // ilocalsym
    out.extend_from_slice(&nsyms.to_le_bytes()); // nlocalsym
    out.extend_from_slice(&[0u8; 72]);

    // LC_LOAD_DYLINKER
    out.extend_from_slice(&LC_LOAD_DYLINKER.to_le_bytes());
    out.extend_from_slice(&dylinker_cmdsize.to_le_bytes());
    out.extend_from_slice(&12u32.to_le_bytes()); // name offset
    out.extend_from_slice(dylinker_name.as_bytes());
    out.resize(out.len() + (dylinker_name_padded - dylinker_name.len()), 0);

    // LC_UUID — deterministic, derived from the entry point rather than
    // a random generator (scripts in this pipeline cannot call one).
    out.extend_from_slice(&LC_UUID.to_le_bytes());
    out.extend_from_slice(&24u32.to_le_bytes());
    let mut uuid = [0u8; 16];
    uuid[0..8].copy_from_slice(&ctx.entry_point.to_le_bytes());
    uuid[8..16].copy_from_slice(&ctx.total_size.to_le_bytes());
    out.extend_from_slice(&uuid);

    // LC_BUILD_VERSION (macos, no tool entries)
    out.extend_from_slice(&LC_BUILD_VERSION.to_le_bytes());
    out.extend_from_slice(&24u32.to_le_bytes());
    out.extend_from_slice(&PLATFORM_MACOS.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // minos
    out.extend_from_slice(&0u32.to_le_bytes()); // sdk
    out.extend_from_slice(&0u32.to_le_bytes()); // ntools

    // LC_MAIN
    out.extend_from_slice(&LC_MAIN.to_le_bytes());
    out.extend_from_slice(&24u32.to_le_bytes());
    let entryoff = ctx.entry_point - text_vaddr;
    out.extend_from_slice(&entryoff.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes()); // stacksize (0 = default)

    // LC_LOAD_DYLIB
    out.extend_from_slice(&LC_LOAD_DYLIB.to_le_bytes());
    out.extend_from_slice(&dylib_cmdsize.to_le_bytes());
    out.extend_from_slice(&24u32.to_le_bytes()); // name offset
    out.extend_from_slice(&0u32.to_le_bytes()); // timestamp
    out.extend_from_slice(&0x0001_0000u32.to_le_bytes()); // current_version
    out.extend_from_slice(&0x0001_0000u32.to_le_bytes()); // compatibility_version
    out.extend_from_slice(dylib_name.as_bytes());
    out.resize(out.len() + (dylib_name_padded - dylib_name.len()), 0);

    debug_assert_eq!(out.len() as u64, header_region);

    out.extend_from_slice(&text_bytes);
    out.extend_from_slice(&rodata_bytes);
    out.extend_from_slice(&data_bytes);
    for (str_off, address) in &nlist_entries {
        out.extend_from_slice(&str_off.to_le_bytes());
        out.push(0x0f); // n_type: N_SECT | N_EXT
        out.push(1); // n_sect
        out.extend_from_slice(&0u16.to_le_bytes()); // n_desc
        out.extend_from_slice(&address.to_le_bytes());
    }
    out.extend_from_slice(&strtab);

    ctx.executable_bytes = out;
    Ok(())
}
