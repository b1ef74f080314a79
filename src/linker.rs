//! Minimal in-process link driver.
//!
//! Drives one graph through the two-phase protocol the fixup engine
//! requires: layout and symbol resolution first, byte patching second.
//! The production driver (allocation, cross-object resolution, publication
//! to executable memory) lives outside this crate; this one is enough for
//! the CLI and for end-to-end tests.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;

use crate::arch::aarch64::{self, EdgeKind, FixupBases};
use crate::graph::{BlockId, Edge, LinkGraph, SymbolValue};
use crate::utils::align_up;

pub struct Linker {
    graph: LinkGraph,
    image_base: u64,
}

impl Linker {
    pub fn new(graph: LinkGraph, image_base: u64) -> Self {
        Self { graph, image_base }
    }

    /// Assigns every block a runtime address with a bump allocator starting
    /// at `base`, honoring each block's alignment.
    pub fn layout(&mut self, base: u64) -> Result<()> {
        let mut current = base;
        let ids: Vec<BlockId> = self.graph.blocks().map(|(id, _)| id).collect();
        for id in ids {
            let block = self.graph.block(id);
            current = align_up(current, block.alignment);
            tracing::debug!(
                "block {} ({} bytes) at 0x{:x}",
                block.name,
                block.content.len(),
                current
            );
            let size = block.content.len() as u64;
            self.graph.set_block_address(id, current);
            current += size;
        }
        Ok(())
    }

    /// Resolves imported symbols from a name-to-address map. All imports
    /// must resolve; the error lists every missing name.
    pub fn resolve(&mut self, definitions: &HashMap<String, u64>) -> Result<()> {
        let mut pending = Vec::new();
        let mut missing = Vec::new();
        for (id, sym) in self.graph.symbols() {
            if sym.is_defined() {
                continue;
            }
            if let SymbolValue::External { address: Some(_) } = sym.value {
                continue;
            }
            match definitions.get(sym.display_name()) {
                Some(&addr) => pending.push((id, addr)),
                None => missing.push(sym.display_name().to_string()),
            }
        }
        if !missing.is_empty() {
            return Err(anyhow!(
                "unresolved external symbols: {}",
                missing.join(", ")
            ));
        }
        for (id, addr) in pending {
            self.graph.resolve_external(id, addr)?;
        }
        Ok(())
    }

    /// Applies every edge of every block, in record order per block. Must
    /// run after `layout` and `resolve`; an unresolved target or a missing
    /// block address fails the object.
    pub fn apply_fixups(&mut self) -> Result<()> {
        let ids: Vec<BlockId> = self.graph.blocks().map(|(id, _)| id).collect();
        for id in ids {
            let edges = self.graph.block(id).edges.clone();
            for edge in edges {
                apply_edge(&mut self.graph, id, edge, self.image_base).with_context(|| {
                    format!(
                        "{}: fixup {} at {}+0x{:x}",
                        self.graph.name,
                        aarch64::edge_kind_name(edge.kind),
                        self.graph.block(id).name,
                        edge.offset
                    )
                })?;
            }
        }
        Ok(())
    }

    pub fn graph(&self) -> &LinkGraph {
        &self.graph
    }

    pub fn into_graph(self) -> LinkGraph {
        self.graph
    }
}

/// Applies a single edge to its source block.
///
/// This is the per-edge entry point a driver uses when it shards fixup
/// application by block: edges touching different blocks are independent.
pub fn apply_edge(graph: &mut LinkGraph, block: BlockId, edge: Edge, image_base: u64) -> Result<()> {
    let s = graph.symbol_address(edge.target)?;
    let p = graph.block(block).address()? + edge.offset;
    let bases = FixupBases {
        // Only section-relative fixups need the target's section base.
        section: if edge.kind == EdgeKind::Secrel32 {
            graph.section_base(edge.target)?
        } else {
            0
        },
        image: image_base,
    };
    tracing::trace!(
        "apply {} at 0x{:x}: S=0x{:x} A={}",
        aarch64::edge_kind_name(edge.kind),
        p,
        s,
        edge.addend
    );
    let content = &mut graph.block_mut(block).content;
    aarch64::apply_fixup(edge.kind, edge.offset, p, s, edge.addend, bases, content)
}
