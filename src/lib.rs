//! JIT-link core for COFF/AArch64 objects.
//!
//! This library turns a relocatable COFF/AArch64 object into an in-memory
//! link graph and, once addresses are assigned, patches every relocation
//! site in place. It is organized into several modules:
//! - `config`: CLI configuration.
//! - `arch`: AArch64 fixup engine and relocation-kind registry.
//! - `coff`: Graph builder for the COFF container.
//! - `graph`: Link-graph data model (blocks, symbols, edges).
//! - `linker`: Minimal in-process driver (layout, resolve, fixup).

pub mod arch;
pub mod coff;
pub mod config;
pub mod graph;
pub mod linker;
pub mod utils;
