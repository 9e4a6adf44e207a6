//! Relocation application (C5, spec §4.5): walk every relocation in
//! every object and patch the already-merged section bytes in place.
//!
//! `X64_GOTPCREL` has no GOT synthesis to resolve against (spec §1
//! non-goals exclude GOT/PLT stub synthesis beyond a direct call), so it
//! is treated identically to `X64_PC32` — the symbol's real final address
//! is patched directly rather than through an indirection cell.

use crate::context::LinkerContext;
use crate::error::{LinkError, LinkErrors};
use crate::link::patch;
use crate::object::model::{DefiningObject, RelocationKind};

fn page(addr: u64) -> u64 {
    addr & !0xFFF
}

/// Resolve `symbol_index` (within `object_index`) to its final address.
/// A symbol whose `defining_object` is `RuntimeSatisfied` was accepted by
/// C3 Phase 2's predicate fallback without ever being backed by a real
/// archive member, so it has no final address to patch against here;
/// the caller turns that into an `UndefinedSymbol` error rather than
/// leaving the instruction bytes unpatched.
fn resolve_symbol_address(ctx: &LinkerContext, object_index: usize, symbol_index: usize) -> Option<u64> {
    let symbol = &ctx.objects[object_index].symbols[symbol_index];
    match symbol.defining_object {
        Some(DefiningObject::Object(obj_idx)) => {
            let defining_symbol = ctx.objects[obj_idx]
                .symbols
                .iter()
                .find(|s| s.name == symbol.name && s.is_defined)?;
            Some(defining_symbol.final_address)
        }
        Some(DefiningObject::RuntimeSatisfied) => None,
        None => None,
    }
}

/// Find the merged-section byte offset that `(object_index, section_index,
/// offset)` maps to, via that merged section's contribution list.
fn merged_location(
    ctx: &LinkerContext,
    object_index: usize,
    section_index: usize,
    offset: u64,
) -> Option<(usize, u64)> {
    for (merged_idx, merged) in ctx.merged_sections.iter().enumerate() {
        for c in &merged.contributions {
            if c.source_object == object_index && c.source_section == section_index {
                return Some((merged_idx, c.offset_in_merged + offset));
            }
        }
    }
    None
}

pub fn apply_relocations(ctx: &mut LinkerContext) -> LinkErrors {
    let mut errors = LinkErrors::new();

    let relocations: Vec<_> = ctx
        .objects
        .iter()
        .flat_map(|o| o.relocations.iter().cloned())
        .collect();

    for reloc in relocations {
        if matches!(reloc.kind, RelocationKind::None) {
            continue;
        }

        let symbol_name = reloc
            .symbol_index
            .map(|i| ctx.objects[reloc.object_index].symbols[i].name.clone())
            .unwrap_or_else(|| format!("<section {}>", reloc.section_index));

        let s = match reloc.symbol_index {
            Some(sym_idx) => match resolve_symbol_address(ctx, reloc.object_index, sym_idx) {
                Some(addr) => addr,
                None => {
                    errors.push(LinkError::UndefinedSymbol {
                        symbol: symbol_name,
                    });
                    continue;
                }
            },
            None => 0,
        };

        let Some((merged_idx, merged_offset)) =
            merged_location(ctx, reloc.object_index, reloc.section_index, reloc.offset)
        else {
            continue;
        };

        let p = ctx.merged_sections[merged_idx].vaddr + merged_offset;
        let a = reloc.addend;
        let offset = merged_offset as usize;
        let bytes = &mut ctx.merged_sections[merged_idx].bytes;

        let result = match reloc.kind {
            RelocationKind::X64_64 | RelocationKind::Arm64Abs64 => {
                patch::patch_u64_le(bytes, offset, s.wrapping_add(a as u64), &symbol_name)
            }
            RelocationKind::X64_PC32
            | RelocationKind::X64_PLT32
            | RelocationKind::X64_GOTPCREL => {
                let value = (s as i64).wrapping_add(a).wrapping_sub(p as i64);
                patch::patch_i32_le(bytes, offset, value, &symbol_name)
            }
            RelocationKind::Arm64Call26 | RelocationKind::Arm64Jump26 => {
                let value = (s as i64).wrapping_add(a).wrapping_sub(p as i64);
                patch::patch_arm64_branch26(bytes, offset, value, &symbol_name)
            }
            RelocationKind::Arm64AdrPrelPgHi21 => {
                let target_page = page(s.wrapping_add(a as u64));
                let pc_page = page(p);
                let value = (target_page as i64 - pc_page as i64) >> 12;
                patch::patch_arm64_adr_page21(bytes, offset, value, &symbol_name)
            }
            RelocationKind::Arm64AddAbsLo12Nc => {
                let value = s.wrapping_add(a as u64) & 0xFFF;
                patch::patch_arm64_add_lo12(bytes, offset, value, &symbol_name)
            }
            RelocationKind::Relative => {
                patch::patch_u64_le(bytes, offset, ctx.base_address.wrapping_add(a as u64), &symbol_name)
            }
            RelocationKind::None => unreachable!("filtered above"),
        };

        if let Err(err) = result {
            errors.push(err);
        }
    }

    errors
}
