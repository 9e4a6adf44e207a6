//! `sox-linker`: a static linker for the sox toolchain, producing ELF-64
//! and Mach-O 64 executables from relocatable object files and a runtime
//! archive (see the crate's design notes for the full pipeline).

pub mod archive;
pub mod cli;
pub mod context;
pub mod driver;
pub mod error;
pub mod link;
pub mod object;
pub mod target;
pub mod write;
