//! Output side of the driver: compiled bytecode, listings and run results.
pub mod bin;
pub mod json;
pub mod listing;
