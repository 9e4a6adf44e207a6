//! Two-phase symbol resolution (C3): collect every defined symbol into
//! the context's global hash table honoring weak/global precedence, then
//! resolve every undefined reference against that table or the runtime
//! predicate (spec §4.3).
//!
//! The incremental "does this object resolve something we still need"
//! shape is grounded on `20559be7_..._archive.rs`'s
//! `register_symbols_elf64`/`resolve_archive_members` archive-pulling
//! loop, though here resolution runs in the two flat passes spec §4.3
//! prescribes rather than an archive fixpoint loop (the fixpoint lives
//! in archive extraction itself, before Phase 2 runs).

use crate::context::{GlobalSymbolEntry, LinkerContext};
use crate::error::{LinkError, LinkErrors};
use crate::object::model::{DefiningObject, SymbolBinding};

/// Runtime operator and native-call symbol names the linker treats as
/// satisfied without resolving them against any parsed object, as a
/// fallback for callers that never linked in the runtime archive
/// (spec §4.3 Phase 2).
const RUNTIME_OPERATOR_NAMES: &[&str] = &[
    "sox_add", "sox_sub", "sox_mul", "sox_div", "sox_neg", "sox_eq", "sox_ne", "sox_lt",
    "sox_le", "sox_gt", "sox_ge", "sox_not",
];

pub fn is_runtime_symbol(name: &str) -> bool {
    name.starts_with("sox_native_")
        || name.starts_with("sox_runtime_")
        || RUNTIME_OPERATOR_NAMES.contains(&name)
}

/// Phase 1: collect every defined symbol across every object currently in
/// `ctx` into the global index, applying weak/global precedence. Returns
/// accumulated `DuplicateDefinition` errors; does not abort early.
fn collect_defined_symbols(ctx: &mut LinkerContext) -> LinkErrors {
    let mut errors = LinkErrors::new();
    for obj_idx in 0..ctx.objects.len() {
        let symbol_count = ctx.objects[obj_idx].symbols.len();
        for sym_idx in 0..symbol_count {
            let (is_defined, binding, name) = {
                let sym = &ctx.objects[obj_idx].symbols[sym_idx];
                (sym.is_defined, sym.binding, sym.name.clone())
            };
            if !is_defined || name.is_empty() {
                continue;
            }
            // Every defined symbol self-references its own object, even
            // locals that never enter the global index (spec §3
            // invariant: `is_defined` implies `defining_object >= 0`).
            ctx.objects[obj_idx].symbols[sym_idx].defining_object =
                Some(DefiningObject::Object(obj_idx));

            if matches!(binding, SymbolBinding::Local) {
                continue;
            }

            match ctx.global_symbol_index.get(&name).copied() {
                None => {
                    ctx.global_symbol_index.insert(
                        name,
                        GlobalSymbolEntry {
                            defining_object: DefiningObject::Object(obj_idx),
                            binding,
                        },
                    );
                }
                Some(existing) => match (existing.binding, binding) {
                    (SymbolBinding::Global, SymbolBinding::Global) => {
                        errors.push(LinkError::DuplicateDefinition { symbol: name });
                    }
                    (SymbolBinding::Weak, SymbolBinding::Global) => {
                        ctx.global_symbol_index.insert(
                            name,
                            GlobalSymbolEntry {
                                defining_object: DefiningObject::Object(obj_idx),
                                binding,
                            },
                        );
                    }
                    (SymbolBinding::Global, SymbolBinding::Weak) => {
                        // global wins; new weak definition is ignored.
                    }
                    (SymbolBinding::Weak, SymbolBinding::Weak) => {
                        // first writer wins.
                    }
                    _ => unreachable!("locals are never inserted into the global index"),
                },
            }
        }
    }
    errors
}

/// Phase 2: resolve every undefined symbol against the global index, then
/// the runtime predicate. Accumulates `UndefinedSymbol` errors.
fn resolve_undefined_symbols(ctx: &mut LinkerContext) -> LinkErrors {
    let mut errors = LinkErrors::new();
    for obj_idx in 0..ctx.objects.len() {
        let symbol_count = ctx.objects[obj_idx].symbols.len();
        for sym_idx in 0..symbol_count {
            let sym = &ctx.objects[obj_idx].symbols[sym_idx];
            if sym.is_defined {
                continue;
            }
            let name = sym.name.clone();
            if let Some(entry) = ctx.global_symbol_index.get(&name) {
                ctx.objects[obj_idx].symbols[sym_idx].defining_object = Some(entry.defining_object);
            } else if is_runtime_symbol(&name) {
                ctx.objects[obj_idx].symbols[sym_idx].defining_object =
                    Some(DefiningObject::RuntimeSatisfied);
            } else {
                errors.push(LinkError::UndefinedSymbol { symbol: name });
            }
        }
    }
    errors
}

/// Run both resolution phases against every object currently in `ctx`.
/// Callers must have already folded in any runtime archive objects
/// (spec §4.3: "Runtime archive objects are added to the context before
/// Phase 2 so runtime-satisfied symbols resolve normally during the
/// archive pass").
pub fn resolve(ctx: &mut LinkerContext) -> Result<(), LinkErrors> {
    let mut errors = collect_defined_symbols(ctx);
    errors.extend(resolve_undefined_symbols(ctx).0);
    errors.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::model::{Object, PlatformFormat, Symbol, SymbolType};
    use crate::target::{Arch, Os, Target};

    fn target() -> Target {
        Target {
            arch: Arch::X86_64,
            os: Os::Linux,
        }
    }

    fn defined_symbol(name: &str, binding: SymbolBinding) -> Symbol {
        Symbol {
            name: name.to_string(),
            r#type: SymbolType::Func,
            binding,
            section_index: Some(0),
            value: 0,
            size: 0,
            final_address: 0,
            is_defined: true,
            defining_object: None,
        }
    }

    fn undefined_symbol(name: &str) -> Symbol {
        Symbol {
            name: name.to_string(),
            r#type: SymbolType::Func,
            binding: SymbolBinding::Global,
            section_index: None,
            value: 0,
            size: 0,
            final_address: 0,
            is_defined: false,
            defining_object: None,
        }
    }

    #[test]
    fn resolves_global_to_global_reference() {
        let mut ctx = LinkerContext::new(target());
        let mut a = Object::new("a.o", PlatformFormat::Elf);
        a.symbols.push(defined_symbol("main", SymbolBinding::Global));
        a.symbols.push(undefined_symbol("helper"));
        let mut b = Object::new("b.o", PlatformFormat::Elf);
        b.symbols.push(defined_symbol("helper", SymbolBinding::Global));
        ctx.add_object(a);
        ctx.add_object(b);

        resolve(&mut ctx).unwrap();
        let helper = &ctx.objects[0].symbols[1];
        assert_eq!(helper.defining_object, Some(DefiningObject::Object(1)));
    }

    #[test]
    fn duplicate_global_definitions_error() {
        let mut ctx = LinkerContext::new(target());
        let mut a = Object::new("a.o", PlatformFormat::Elf);
        a.symbols.push(defined_symbol("dup", SymbolBinding::Global));
        let mut b = Object::new("b.o", PlatformFormat::Elf);
        b.symbols.push(defined_symbol("dup", SymbolBinding::Global));
        ctx.add_object(a);
        ctx.add_object(b);

        let err = resolve(&mut ctx).unwrap_err();
        assert_eq!(err.0.len(), 1);
        assert!(matches!(&err.0[0], LinkError::DuplicateDefinition { symbol } if symbol == "dup"));
    }

    #[test]
    fn global_wins_over_weak() {
        let mut ctx = LinkerContext::new(target());
        let mut a = Object::new("a.o", PlatformFormat::Elf);
        a.symbols.push(defined_symbol("sym", SymbolBinding::Weak));
        let mut b = Object::new("b.o", PlatformFormat::Elf);
        b.symbols.push(defined_symbol("sym", SymbolBinding::Global));
        ctx.add_object(a);
        ctx.add_object(b);

        resolve(&mut ctx).unwrap();
        let entry = ctx.global_symbol_index.get("sym").unwrap();
        assert_eq!(entry.defining_object, DefiningObject::Object(1));
    }

    #[test]
    fn runtime_predicate_satisfies_undefined_native_calls() {
        let mut ctx = LinkerContext::new(target());
        let mut a = Object::new("a.o", PlatformFormat::Elf);
        a.symbols.push(undefined_symbol("sox_native_print"));
        ctx.add_object(a);

        resolve(&mut ctx).unwrap();
        assert_eq!(
            ctx.objects[0].symbols[0].defining_object,
            Some(DefiningObject::RuntimeSatisfied)
        );
    }

    #[test]
    fn unresolved_symbol_is_an_error() {
        let mut ctx = LinkerContext::new(target());
        let mut a = Object::new("a.o", PlatformFormat::Elf);
        a.symbols.push(undefined_symbol("totally_unknown"));
        ctx.add_object(a);

        let err = resolve(&mut ctx).unwrap_err();
        assert!(matches!(&err.0[0], LinkError::UndefinedSymbol { symbol } if symbol == "totally_unknown"));
    }
}
