//! Unified object model (C1's output type) and the ELF/Mach-O readers
//! that populate it.

pub mod elf;
pub mod macho;
pub mod model;
pub mod reader;

pub use model::*;
