pub mod fnv_table;
pub mod layout;
pub mod patch;
pub mod relocate;
pub mod symbols;
