//! The unified in-memory object model (spec §3) that both the ELF and
//! Mach-O readers parse into, and that the layout/relocation/writer
//! phases consume. Every cross-object reference is an index into a
//! vector owned by the [`crate::context::LinkerContext`] — no back
//! pointers, no pointer graphs (spec §9).

use bitflags::bitflags;
use num_derive::{FromPrimitive, ToPrimitive};

/// Which object container format a parsed [`Object`] originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformFormat {
    Elf,
    MachO,
    /// Reserved: recognized only by name, never implemented. Any attempt
    /// to read PE/COFF bytes fails with `UnsupportedFormat`.
    Pe,
}

bitflags! {
    /// Read/write/execute permissions carried by a section and, after
    /// merging, by the segment it belongs to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u8 {
        const READ    = 0b001;
        const WRITE   = 0b010;
        const EXECUTE = 0b100;
    }
}

/// Coarse section classification, independent of the source format's
/// section-name conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SectionType {
    /// Executable code (`.text` / `__text`).
    Text,
    /// Initialized, writable data (`.data` / `__data`).
    Data,
    /// Uninitialized, writable data with no backing file bytes
    /// (`.bss` / `__bss`).
    Bss,
    /// Read-only constant data (`.rodata`, `.rdata` / `__const`,
    /// `__cstring`, `__rodata`).
    Rodata,
    /// Anything not classified above. Carried through parsing but never
    /// merged or placed by [`crate::link::layout`].
    Unknown,
}

/// The deterministic merge order used by [`crate::link::layout`].
pub const SECTION_MERGE_ORDER: [SectionType; 4] = [
    SectionType::Text,
    SectionType::Rodata,
    SectionType::Data,
    SectionType::Bss,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum SymbolType {
    NoType = 0,
    Func = 1,
    Object = 2,
    Section = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolBinding {
    Local,
    Global,
    Weak,
}

/// The closed set of relocation kinds spanning both supported ISAs
/// (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocationKind {
    X64_64,
    X64_PC32,
    X64_PLT32,
    X64_GOTPCREL,
    Arm64Abs64,
    Arm64Call26,
    Arm64Jump26,
    Arm64AdrPrelPgHi21,
    Arm64AddAbsLo12Nc,
    Relative,
    None,
}

/// A section as parsed from one object, before merging.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub r#type: SectionType,
    /// `None` for Bss sections: no backing bytes in the file.
    pub bytes: Option<Vec<u8>>,
    pub size: u64,
    /// A power of two, >= 1.
    pub alignment: u64,
    pub flags: SectionFlags,
    /// Filled in during C4 layout; meaningless before that phase.
    pub vaddr: u64,
    pub object_index: usize,
}

impl Section {
    pub fn is_bss(&self) -> bool {
        matches!(self.r#type, SectionType::Bss)
    }
}

/// A symbol as parsed from one object's symbol table.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub r#type: SymbolType,
    pub binding: SymbolBinding,
    /// Index into the owning object's `sections`. `None` if undefined.
    pub section_index: Option<usize>,
    /// Offset within `section_index`'s bytes.
    pub value: u64,
    pub size: u64,
    /// Filled in by `compute_addresses` after C4 layout.
    pub final_address: u64,
    pub is_defined: bool,
    /// `None` = undefined. `Some(DefiningObject::RuntimeSatisfied)` = the
    /// runtime-predicate sentinel (spec §4.3 Phase 2, value -2).
    /// `Some(DefiningObject::Object(i))` = defined in object `i`.
    pub defining_object: Option<DefiningObject>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefiningObject {
    Object(usize),
    RuntimeSatisfied,
}

impl Symbol {
    pub fn is_undefined(&self) -> bool {
        !self.is_defined
    }
}

/// A relocation record as parsed from one object.
#[derive(Debug, Clone)]
pub struct Relocation {
    /// Offset within `section_index`'s bytes, at which the patch is applied.
    pub offset: u64,
    pub kind: RelocationKind,
    /// Index into the owning object's `symbols`. `None` = section-relative.
    pub symbol_index: Option<usize>,
    pub addend: i64,
    pub section_index: usize,
    pub object_index: usize,
}

/// One parsed relocatable object file (or archive member).
#[derive(Debug, Clone)]
pub struct Object {
    pub filename: String,
    pub format: PlatformFormat,
    pub sections: Vec<Section>,
    pub symbols: Vec<Symbol>,
    pub relocations: Vec<Relocation>,
}

impl Object {
    pub fn new(filename: impl Into<String>, format: PlatformFormat) -> Self {
        Self {
            filename: filename.into(),
            format,
            sections: Vec::new(),
            symbols: Vec::new(),
            relocations: Vec::new(),
        }
    }

    /// Find a section by its unified classification. Objects produced by
    /// a real compiler backend have at most one section per type; this
    /// returns the first match, which is all the parsers ever need.
    pub fn section_of_type(&self, ty: SectionType) -> Option<&Section> {
        self.sections.iter().find(|s| s.r#type == ty)
    }
}

/// One member of a Unix `ar` archive, after header decoding.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
    pub bytes: Vec<u8>,
}

/// A single contribution of one object's section data into a
/// [`MergedSection`]'s buffer.
#[derive(Debug, Clone, Copy)]
pub struct Contribution {
    pub source_object: usize,
    pub source_section: usize,
    pub offset_in_merged: u64,
    pub size: u64,
}

/// A section after C4 merging: owns one contiguous buffer built from
/// every contributing object's section of the same [`SectionType`].
#[derive(Debug, Clone)]
pub struct MergedSection {
    pub name: String,
    pub r#type: SectionType,
    /// Zero-initialised placeholder for Bss; otherwise concatenated
    /// contributor bytes.
    pub bytes: Vec<u8>,
    pub size: u64,
    pub alignment: u64,
    pub vaddr: u64,
    pub flags: SectionFlags,
    pub contributions: Vec<Contribution>,
}

impl MergedSection {
    pub fn file_size(&self) -> u64 {
        if matches!(self.r#type, SectionType::Bss) {
            0
        } else {
            self.size
        }
    }
}
