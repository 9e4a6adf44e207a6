//! ELF-64 `ET_EXEC` executable emission (C6, spec §4.6.1), grounded on
//! the same `b247e928_..._x86-linker-elf.rs` header-layout knowledge the
//! reader uses, run in reverse.

use crate::context::LinkerContext;
use crate::error::{LinkError, Result};
use crate::object::elf::{EM_AARCH64, EM_X86_64};
use crate::object::model::{DefiningObject, SectionType};
use crate::target::Arch;

const ET_EXEC: u16 = 2;
const EV_CURRENT: u32 = 1;
const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

const EHDR_SIZE: u64 = 64;
const PHDR_SIZE: u64 = 56;

/// x86-64 `_start`: `xor rbp, rbp; call main; mov edi, eax; mov eax, 60; syscall`.
fn x86_64_prelude(main_offset_from_next_instr: i32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(17);
    bytes.extend_from_slice(&[0x48, 0x31, 0xED]); // xor rbp, rbp
    bytes.push(0xE8); // call rel32
    bytes.extend_from_slice(&main_offset_from_next_instr.to_le_bytes());
    bytes.extend_from_slice(&[0x89, 0xC7]); // mov edi, eax
    bytes.extend_from_slice(&[0xB8, 60, 0, 0, 0]); // mov eax, 60
    bytes.extend_from_slice(&[0x0F, 0x05]); // syscall
    debug_assert_eq!(bytes.len(), 17);
    bytes
}

/// ARM64 `_start`: `mov x29, #0; bl main; mov x8, #93; svc #0`.
fn arm64_prelude(main_branch_imm26: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(16);
    bytes.extend_from_slice(&0xD280001Du32.to_le_bytes()); // mov x29, #0
    let bl = 0x9400_0000u32 | (main_branch_imm26 & 0x03FF_FFFF);
    bytes.extend_from_slice(&bl.to_le_bytes());
    bytes.extend_from_slice(&0xD2800BA8u32.to_le_bytes()); // mov x8, #93
    bytes.extend_from_slice(&0xD4000001u32.to_le_bytes()); // svc #0
    debug_assert_eq!(bytes.len(), 16);
    bytes
}

fn prelude_len(arch: Arch) -> u64 {
    match arch {
        Arch::X86_64 => 17,
        Arch::Arm64 => 16,
    }
}

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
/// `ctx.entry_point`. The prelude is prepended ahead of the merged text
/// bytes rather than patched into them, so every other section's vaddr
/// (already finalised by C4) is left untouched; only the text segment's
/// own base shifts down by the prelude length, which the layout phase
/// has already reserved room for inside the first page. Rodata is folded
/// into this same R+X segment, since only two PT_LOAD entries are ever
/// emitted.
pub fn write_elf_executable(ctx: &mut LinkerContext) -> Result<()> {
    let machine = match ctx.target.arch {
        Arch::X86_64 => EM_X86_64,
        Arch::Arm64 => EM_AARCH64,
    };

    let main_address = find_symbol_address(ctx, "main").ok_or_else(|| LinkError::UndefinedSymbol {
        symbol: "main".to_string(),
    })?;

    let text = ctx
        .merged_sections
        .iter()
        .find(|s| s.r#type == SectionType::Text);
    let text_vaddr = text.map(|s| s.vaddr).unwrap_or(ctx.base_address + ctx.target.page_size());
    let prelude_vaddr = text_vaddr;
    ctx.entry_point = prelude_vaddr;

    let prelude = match ctx.target.arch {
        Arch::X86_64 => {
            let next_instr = prelude_vaddr + 3 + 5; // 3-byte xor, then call's 5-byte encoding
            let rel = main_address as i64 - next_instr as i64;
            if rel < i32::MIN as i64 || rel > i32::MAX as i64 {
                return Err(LinkError::RangeOverflow {
                    symbol: "main".to_string(),
                    detail: rel,
                });
            }
            x86_64_prelude(rel as i32)
        }
        Arch::Arm64 => {
            let pc = prelude_vaddr + 4; // bl is the second instruction
            let rel = main_address as i64 - pc as i64;
            if rel % 4 != 0 {
                return Err(LinkError::Misalignment {
                    symbol: "main".to_string(),
                    detail: rel as u64,
                });
            }
            if !(-(1i64 << 27)..(1i64 << 27)).contains(&rel) {
                return Err(LinkError::RangeOverflow {
                    symbol: "main".to_string(),
                    detail: rel,
                });
            }
            arm64_prelude(((rel >> 2) as u32) & 0x03FF_FFFF)
        }
    };

    let text_bytes: Vec<u8> = text.map(|s| s.bytes.clone()).unwrap_or_default();
    let mut text_image = prelude;
    text_image.extend_from_slice(&text_bytes);

    // No PT_LOAD covers Rodata on its own (spec §4.6.1 emits only the two
    // segments below), so fold it into the R+X text segment the way
    // write/macho.rs packs rodata into __TEXT's __const section. C4
    // page-aligned rodata's vaddr independently of text's, so the file
    // image needs zero padding to keep a single PT_LOAD's linear
    // `p_vaddr + i` byte-to-address mapping consistent with that vaddr.
    let rodata = ctx
        .merged_sections
        .iter()
        .find(|s| s.r#type == SectionType::Rodata);
    if let Some(rodata) = rodata {
        let gap = rodata.vaddr.saturating_sub(text_vaddr + text_image.len() as u64);
        text_image.resize(text_image.len() + gap as usize, 0);
        text_image.extend_from_slice(&rodata.bytes);
    }

    let rw_sections: Vec<_> = ctx
        .merged_sections
        .iter()
        .filter(|s| matches!(s.r#type, SectionType::Data | SectionType::Bss))
        .collect();
    let data_vaddr = rw_sections.first().map(|s| s.vaddr).unwrap_or(0);
    let data_file_bytes: Vec<u8> = rw_sections
        .iter()
        .filter(|s| s.r#type == SectionType::Data)
        .flat_map(|s| s.bytes.clone())
        .collect();
    let rw_memsz: u64 = rw_sections
        .iter()
        .map(|s| (s.vaddr - data_vaddr) + s.size)
        .max()
        .unwrap_or(0);

    let phdr_count: u16 = 2;
    let header_region = EHDR_SIZE + phdr_count as u64 * PHDR_SIZE;

    let mut out = Vec::new();
    out.resize(header_region as usize, 0);

    let text_foff = header_region;
    out.extend_from_slice(&text_image);
    let after_text = out.len() as u64;
    let data_foff = after_text;
    out.extend_from_slice(&data_file_bytes);

    // e_ident
    out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    out[4] = 2; // ELFCLASS64
    out[5] = 1; // ELFDATA2LSB
    out[6] = 1; // EI_VERSION
    // e_type, e_machine
    out[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
    out[18..20].copy_from_slice(&machine.to_le_bytes());
    out[20..24].copy_from_slice(&EV_CURRENT.to_le_bytes());
    out[24..32].copy_from_slice(&ctx.entry_point.to_le_bytes());
    out[32..40].copy_from_slice(&EHDR_SIZE.to_le_bytes()); // e_phoff
    out[40..48].copy_from_slice(&0u64.to_le_bytes()); // e_shoff
    out[48..52].copy_from_slice(&0u32.to_le_bytes()); // e_flags
    out[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    out[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    out[56..58].copy_from_slice(&phdr_count.to_le_bytes());
    out[58..64].copy_from_slice(&[0u8; 6]); // shentsize/shnum/shstrndx unused

    // p_align = 1 sidesteps the file-offset/vaddr congruence the kernel
    // loader otherwise enforces for page-aligned segments: the layout
    // phase already assigned vaddrs on page boundaries relative to
    // base_address, not relative to this file's own byte offsets.
    write_phdr(
        &mut out,
        EHDR_SIZE as usize,
        PT_LOAD,
        PF_R | PF_X,
        text_foff,
        prelude_vaddr,
        text_image.len() as u64,
        text_image.len() as u64,
        1,
    );
    write_phdr(
        &mut out,
        (EHDR_SIZE + PHDR_SIZE) as usize,
        PT_LOAD,
        PF_R | PF_W,
        data_foff,
        if data_vaddr == 0 { prelude_vaddr } else { data_vaddr },
        data_file_bytes.len() as u64,
        rw_memsz.max(data_file_bytes.len() as u64),
        1,
    );

    ctx.executable_bytes = out;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn write_phdr(
    out: &mut [u8],
    at: usize,
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    align: u64,
) {
    out[at..at + 4].copy_from_slice(&p_type.to_le_bytes());
    out[at + 4..at + 8].copy_from_slice(&p_flags.to_le_bytes());
    out[at + 8..at + 16].copy_from_slice(&p_offset.to_le_bytes());
    out[at + 16..at + 24].copy_from_slice(&p_vaddr.to_le_bytes());
    out[at + 24..at + 32].copy_from_slice(&p_vaddr.to_le_bytes()); // p_paddr
    out[at + 32..at + 40].copy_from_slice(&p_filesz.to_le_bytes());
    out[at + 40..at + 48].copy_from_slice(&p_memsz.to_le_bytes());
    out[at + 48..at + 56].copy_from_slice(&align.to_le_bytes());
}
