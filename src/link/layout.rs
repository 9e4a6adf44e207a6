//! Section merging and virtual address assignment (C4, spec §4.4).
//!
//! Sections are merged by [`SectionType`], not by name, in the fixed
//! order Text -> Rodata -> Data -> Bss. Page alignment on every merged
//! section's `vaddr` lets the writer assign one RWX permission per
//! segment; the permission-bit constants this implies
//! (`PF_X`/`PF_W`/`PF_R`) are the same ones
//! `b247e928_..._x86-linker-elf.rs` defines for its own program headers.

use crate::context::LinkerContext;
use crate::object::model::{Contribution, MergedSection, SectionFlags, SectionType};

fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Build one [`MergedSection`] per [`SectionType`] with at least one
/// contributor, honoring object-addition order and per-contribution
/// alignment (spec §4.4 "Policy").
fn merge_sections_of_type(ctx: &LinkerContext, ty: SectionType) -> Option<MergedSection> {
    let mut buffer: Vec<u8> = Vec::new();
    let mut contributions = Vec::new();
    let mut alignment: u64 = 1;
    let mut flags = SectionFlags::empty();
    let mut name = None;

    for (obj_idx, object) in ctx.objects.iter().enumerate() {
        for (sec_idx, section) in object.sections.iter().enumerate() {
            if section.r#type != ty {
                continue;
            }
            alignment = alignment.max(section.alignment);
            flags |= section.flags;
            if name.is_none() {
                name = Some(section.name.clone());
            }

            let padded_len = align_up(buffer.len() as u64, section.alignment) as usize;
            buffer.resize(padded_len, 0);
            let offset_in_merged = buffer.len() as u64;

            match &section.bytes {
                Some(bytes) => buffer.extend_from_slice(bytes),
                None => buffer.resize(buffer.len() + section.size as usize, 0),
            }

            contributions.push(Contribution {
                source_object: obj_idx,
                source_section: sec_idx,
                offset_in_merged,
                size: section.size,
            });
        }
    }

    if contributions.is_empty() {
        return None;
    }

    Some(MergedSection {
        name: name.unwrap_or_else(|| default_name_for(ty)),
        r#type: ty,
        size: buffer.len() as u64,
        bytes: buffer,
        alignment,
        vaddr: 0,
        flags,
        contributions,
    })
}

fn default_name_for(ty: SectionType) -> String {
    match ty {
        SectionType::Text => ".text".to_string(),
        SectionType::Rodata => ".rodata".to_string(),
        SectionType::Data => ".data".to_string(),
        SectionType::Bss => ".bss".to_string(),
        SectionType::Unknown => ".unknown".to_string(),
    }
}

/// Merge every object's sections and assign page-aligned virtual
/// addresses, starting one page above `ctx.base_address` (spec §4.4
/// "Placement": "the first page reserved").
pub fn merge_and_place(ctx: &mut LinkerContext) {
    let page_size = ctx.target.page_size();
    let mut cursor = ctx.base_address + page_size;

    let mut merged = Vec::new();
    for ty in crate::object::model::SECTION_MERGE_ORDER {
        if let Some(section) = merge_sections_of_type(ctx, ty) {
            merged.push(section);
        }
    }

    for section in &mut merged {
        let align = page_size.max(section.alignment);
        section.vaddr = align_up(cursor, align);
        cursor = section.vaddr + section.size;
    }

    ctx.total_size = if let Some(last) = merged.last() {
        last.vaddr + last.size - ctx.base_address
    } else {
        0
    };
    ctx.merged_sections = merged;
}

/// Recompute every defined symbol's `final_address` against the just-built
/// layout (spec §4.3 "Address finalisation").
pub fn compute_addresses(ctx: &mut LinkerContext) {
    // Snapshot (merged_section_index, offset_in_merged) for every
    // (object, section) pair so symbols can look themselves up in O(1)
    // instead of re-scanning every merged section per symbol.
    let mut offsets: Vec<Vec<Option<(usize, u64)>>> = ctx
        .objects
        .iter()
        .map(|o| vec![None; o.sections.len()])
        .collect();
    for (merged_idx, merged) in ctx.merged_sections.iter().enumerate() {
        for c in &merged.contributions {
            offsets[c.source_object][c.source_section] = Some((merged_idx, c.offset_in_merged));
        }
    }

    for (obj_idx, object) in ctx.objects.iter_mut().enumerate() {
        for symbol in &mut object.symbols {
            if !symbol.is_defined {
                continue;
            }
            let Some(sec_idx) = symbol.section_index else {
                continue;
            };
            if let Some((merged_idx, offset)) = offsets[obj_idx][sec_idx] {
                let merged = &ctx.merged_sections[merged_idx];
                symbol.final_address = merged.vaddr + offset + symbol.value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::model::{Object, PlatformFormat, Section};
    use crate::target::{Arch, Os, Target};

    fn target() -> Target {
        Target {
            arch: Arch::X86_64,
            os: Os::Linux,
        }
    }

    fn text_section(bytes: Vec<u8>, alignment: u64) -> Section {
        Section {
            name: ".text".to_string(),
            r#type: SectionType::Text,
            size: bytes.len() as u64,
            bytes: Some(bytes),
            alignment,
            flags: SectionFlags::READ | SectionFlags::EXECUTE,
            vaddr: 0,
            object_index: 0,
        }
    }

    #[test]
    fn merged_section_is_page_aligned_and_starts_past_first_page() {
        let mut ctx = LinkerContext::new(target());
        let mut obj = Object::new("a.o", PlatformFormat::Elf);
        obj.sections.push(text_section(vec![0x90; 8], 16));
        ctx.add_object(obj);

        merge_and_place(&mut ctx);
        let text = &ctx.merged_sections[0];
        assert_eq!(text.vaddr % ctx.target.page_size(), 0);
        assert_eq!(text.vaddr, ctx.base_address + ctx.target.page_size());
    }

    #[test]
    fn contributions_are_concatenated_in_object_order() {
        let mut ctx = LinkerContext::new(target());
        let mut a = Object::new("a.o", PlatformFormat::Elf);
        a.sections.push(text_section(vec![1, 2, 3], 4));
        let mut b = Object::new("b.o", PlatformFormat::Elf);
        b.sections.push(text_section(vec![4, 5], 4));
        ctx.add_object(a);
        ctx.add_object(b);

        merge_and_place(&mut ctx);
        let text = &ctx.merged_sections[0];
        assert_eq!(&text.bytes[0..3], &[1, 2, 3]);
        assert_eq!(&text.bytes[4..6], &[4, 5]); // padded to 4-byte alignment
    }

    #[test]
    fn text_precedes_data_and_bss_has_no_file_bytes() {
        let mut ctx = LinkerContext::new(target());
        let mut obj = Object::new("a.o", PlatformFormat::Elf);
        obj.sections.push(text_section(vec![0x90; 4], 4));
        obj.sections.push(Section {
            name: ".bss".to_string(),
            r#type: SectionType::Bss,
            size: 16,
            bytes: None,
            alignment: 8,
            flags: SectionFlags::READ | SectionFlags::WRITE,
            vaddr: 0,
            object_index: 0,
        });
        ctx.add_object(obj);

        merge_and_place(&mut ctx);
        let text_vaddr = ctx.merged_sections[0].vaddr;
        let bss = &ctx.merged_sections[1];
        assert!(text_vaddr < bss.vaddr);
        assert_eq!(bss.file_size(), 0);
        assert_eq!(bss.size, 16);
    }
}
