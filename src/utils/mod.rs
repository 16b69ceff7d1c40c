// file: src/utils/mod.rs
// version: 2.0.0
// guid: b29ca0ef-2709-415d-b957-4afea518b983

//! Utility modules for system operations

pub mod system;

pub use system::SystemUtils;
