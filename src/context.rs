//! The central aggregate threaded through every phase (spec §3's
//! `LinkerContext`). Owns every parsed object, the merged sections built
//! from them, and the final executable bytes — a tree-shaped ownership
//! graph with no back pointers (spec §9).

use crate::link::fnv_table::FnvTable;
use crate::object::model::{DefiningObject, MergedSection, Object, SymbolBinding};
use crate::target::Target;

/// One entry in the global symbol table: which object defines the name,
/// and at what binding strength, established during C3 Phase 1.
#[derive(Debug, Clone, Copy)]
pub struct GlobalSymbolEntry {
    pub defining_object: DefiningObject,
    pub binding: SymbolBinding,
}

pub struct LinkerContext {
    pub objects: Vec<Object>,
    pub global_symbol_index: FnvTable<GlobalSymbolEntry>,
    pub merged_sections: Vec<MergedSection>,
    pub target: Target,
    pub base_address: u64,
    pub total_size: u64,
    pub entry_point: u64,
    pub executable_bytes: Vec<u8>,
}

impl LinkerContext {
    pub fn new(target: Target) -> Self {
        let base_address = target.base_address();
        Self {
            objects: Vec::new(),
            global_symbol_index: FnvTable::new(),
            merged_sections: Vec::new(),
            target,
            base_address,
            total_size: 0,
            entry_point: 0,
            executable_bytes: Vec::new(),
        }
    }

    /// Append a parsed object, returning its index. Objects are
    /// append-only during C1/C2 (spec §3 lifecycle).
    pub fn add_object(&mut self, mut object: Object) -> usize {
        let index = self.objects.len();
        for section in &mut object.sections {
            section.object_index = index;
        }
        for reloc in &mut object.relocations {
            reloc.object_index = index;
        }
        self.objects.push(object);
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{Arch, Os};

    #[test]
    fn new_context_seeds_base_address_from_target() {
        let ctx = LinkerContext::new(Target {
            arch: Arch::X86_64,
            os: Os::Linux,
        });
        assert_eq!(ctx.base_address, 0x0040_0000);
        assert!(ctx.objects.is_empty());
    }
}
