pub mod elf;
pub mod macho;
