//! Gameplay-script virtual machine.
//!
//! Register-based bytecode interpreter for compiled scripts: typed register
//! banks, a native/script call boundary, managed-object write barriers and
//! abort diagnostics with per-frame attribution.

pub mod types;
pub mod utils;
pub mod virtual_machine;
