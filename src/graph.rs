//! Link-graph data model.
//!
//! A `LinkGraph` is the in-memory representation of one relocatable object:
//! one `Block` per input section, one `Symbol` per symbol-table entry, and
//! one `Edge` per relocation record. The graph is built once, addresses are
//! assigned by the driver, and the fixup engine then patches block bytes in
//! place.

use anyhow::{anyhow, Result};

use crate::arch::aarch64::EdgeKind;

/// Handle to a `Block` inside its owning `LinkGraph`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub usize);

/// Handle to a `Symbol` inside its owning `LinkGraph`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(pub usize);

/// A typed relocation from a fixup site inside a source block to a target
/// symbol. Created by the graph builder and never mutated afterwards.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    /// Encoding rule to apply at the fixup site.
    pub kind: EdgeKind,
    /// Offset of the fixup site within the source block.
    pub offset: u64,
    /// Symbol whose resolved address feeds the encoding.
    pub target: SymbolId,
    /// Byte addend applied to the target address before encoding.
    pub addend: i64,
}

/// An exclusively-owned, contiguous byte range for one input section.
///
/// Content starts as a copy of the section's raw bytes (zero-filled for
/// uninitialized-data sections) and is mutated in place by the fixup engine,
/// once per edge.
#[derive(Debug)]
pub struct Block {
    /// Section name, kept for diagnostics.
    pub name: String,
    pub content: Vec<u8>,
    /// Required alignment (power of two).
    pub alignment: u64,
    /// Runtime address; `None` until the driver finalizes layout.
    pub address: Option<u64>,
    /// Outgoing edges, in on-disk relocation-record order.
    pub edges: Vec<Edge>,
}

impl Block {
    /// The finalized address, or an error if layout has not run yet.
    pub fn address(&self) -> Result<u64> {
        self.address
            .ok_or_else(|| anyhow!("block {} has no address assigned yet", self.name))
    }
}

/// Symbol visibility as seen by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Visible only within this object.
    Local,
    /// Defined here and visible to other objects.
    Exported,
    /// Referenced here, defined elsewhere; resolved by the driver.
    Imported,
}

/// Where a symbol's address comes from.
#[derive(Debug, Clone, Copy)]
pub enum SymbolValue {
    /// Anchored inside a block of this graph.
    Defined { block: BlockId, offset: u64 },
    /// Fixed address, independent of layout.
    Absolute { value: u64 },
    /// External reference; address assigned by the driver during resolution.
    External { address: Option<u64> },
}

/// A named or anonymous reference to an offset within a block, or an
/// unresolved external reference. Symbols never own their block.
#[derive(Debug)]
pub struct Symbol {
    pub name: Option<String>,
    pub scope: Scope,
    pub value: SymbolValue,
}

impl Symbol {
    pub fn is_defined(&self) -> bool {
        !matches!(self.value, SymbolValue::External { .. })
    }

    /// Display name for diagnostics.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<anonymous>")
    }
}

/// The addressable graph for one object: blocks, symbols and edges.
#[derive(Debug)]
pub struct LinkGraph {
    /// Identifier of the originating object, for diagnostics.
    pub name: String,
    blocks: Vec<Block>,
    symbols: Vec<Symbol>,
}

impl LinkGraph {
    pub fn new(name: String) -> Self {
        Self {
            name,
            blocks: Vec::new(),
            symbols: Vec::new(),
        }
    }

    pub fn add_block(&mut self, name: String, content: Vec<u8>, alignment: u64) -> BlockId {
        self.blocks.push(Block {
            name,
            content,
            alignment: alignment.max(1),
            address: None,
            edges: Vec::new(),
        });
        BlockId(self.blocks.len() - 1)
    }

    pub fn add_symbol(&mut self, name: Option<String>, scope: Scope, value: SymbolValue) -> SymbolId {
        self.symbols.push(Symbol { name, scope, value });
        SymbolId(self.symbols.len() - 1)
    }

    /// Appends an edge to its source block, rejecting fixup sites outside
    /// the block's byte range.
    pub fn add_edge(&mut self, block: BlockId, edge: Edge) -> Result<()> {
        let b = &mut self.blocks[block.0];
        if edge.offset >= b.content.len() as u64 {
            return Err(anyhow!(
                "fixup offset 0x{:x} out of range for block {} (size 0x{:x})",
                edge.offset,
                b.name,
                b.content.len()
            ));
        }
        b.edges.push(edge);
        Ok(())
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0]
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0]
    }

    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &Block)> {
        self.blocks.iter().enumerate().map(|(i, b)| (BlockId(i), b))
    }

    pub fn symbols(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> {
        self.symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (SymbolId(i), s))
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Assigns the runtime address of a block during layout.
    pub fn set_block_address(&mut self, id: BlockId, address: u64) {
        self.blocks[id.0].address = Some(address);
    }

    /// Assigns the resolved address of an external symbol.
    pub fn resolve_external(&mut self, id: SymbolId, address: u64) -> Result<()> {
        let sym = &mut self.symbols[id.0];
        match sym.value {
            SymbolValue::External { .. } => {
                sym.value = SymbolValue::External {
                    address: Some(address),
                };
                Ok(())
            }
            _ => Err(anyhow!(
                "symbol {} is not external and cannot be resolved",
                sym.display_name()
            )),
        }
    }

    /// Resolved runtime address of a symbol. Fails if layout has not run or
    /// an external symbol is still unresolved.
    pub fn symbol_address(&self, id: SymbolId) -> Result<u64> {
        let sym = &self.symbols[id.0];
        match sym.value {
            SymbolValue::Defined { block, offset } => {
                Ok(self.block(block).address()? + offset)
            }
            SymbolValue::Absolute { value } => Ok(value),
            SymbolValue::External { address } => address.ok_or_else(|| {
                anyhow!("unresolved external symbol {}", sym.display_name())
            }),
        }
    }

    /// Base address of the section containing a symbol's definition, used by
    /// section-relative fixups. Absolute and external symbols have no
    /// containing section.
    pub fn section_base(&self, id: SymbolId) -> Result<u64> {
        let sym = &self.symbols[id.0];
        match sym.value {
            SymbolValue::Defined { block, .. } => self.block(block).address(),
            _ => Err(anyhow!(
                "symbol {} has no containing section",
                sym.display_name()
            )),
        }
    }
}
