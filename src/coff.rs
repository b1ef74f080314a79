//! COFF link-graph builder.
//!
//! Walks a parsed COFF/AArch64 object and produces a `LinkGraph`: one block
//! per section, one symbol per symbol-table entry, one edge per relocation
//! record. Relocation type codes are mapped through a fixed table; a code
//! outside the table fails the whole build. No bytes are mutated here.

use anyhow::{anyhow, Context, Result};
use object::read::{Object, ObjectSection, ObjectSymbol, RelocationTarget, SectionIndex, SymbolIndex};
use object::{pe, RelocationFlags, SectionKind, SymbolKind};
use std::collections::HashMap;

use crate::arch;
use crate::arch::aarch64::{self, EdgeKind};
use crate::graph::{BlockId, Edge, LinkGraph, Scope, SymbolId, SymbolValue};

/// Maps an on-disk `IMAGE_REL_ARM64_*` type code to an edge kind.
///
/// Codes with no entry (including `ABSOLUTE`, the split-SECREL debug forms,
/// `TOKEN` and `SECTION`) are decode errors, never silently dropped edges.
fn edge_kind_for_type(typ: u16) -> Result<EdgeKind> {
    match typ {
        pe::IMAGE_REL_ARM64_ADDR64 => Ok(EdgeKind::Pointer64),
        pe::IMAGE_REL_ARM64_ADDR32 => Ok(EdgeKind::Pointer32),
        pe::IMAGE_REL_ARM64_ADDR32NB => Ok(EdgeKind::ImageRel32),
        pe::IMAGE_REL_ARM64_SECREL => Ok(EdgeKind::Secrel32),
        pe::IMAGE_REL_ARM64_REL32 => Ok(EdgeKind::Delta32),
        pe::IMAGE_REL_ARM64_REL21 => Ok(EdgeKind::Adr21),
        pe::IMAGE_REL_ARM64_PAGEBASE_REL21 => Ok(EdgeKind::Page21),
        pe::IMAGE_REL_ARM64_PAGEOFFSET_12A => Ok(EdgeKind::PageOffset12),
        pe::IMAGE_REL_ARM64_PAGEOFFSET_12L => Ok(EdgeKind::PageOffset12),
        pe::IMAGE_REL_ARM64_BRANCH26 => Ok(EdgeKind::Branch26),
        pe::IMAGE_REL_ARM64_BRANCH19 => Ok(EdgeKind::CondBranch19),
        pe::IMAGE_REL_ARM64_BRANCH14 => Ok(EdgeKind::TestBranch14),
        _ => Err(anyhow!("unrecognized ARM64 relocation type code 0x{:x}", typ)),
    }
}

/// Builds the link graph for one COFF/AArch64 object.
///
/// `name` identifies the object in diagnostics. Any malformed record fails
/// the whole build; the caller discards partial results.
pub fn build_graph(name: &str, obj: &object::File) -> Result<LinkGraph> {
    arch::check_target(obj.format(), obj.architecture(), obj.is_little_endian())
        .with_context(|| format!("{}: not a linkable COFF/AArch64 object", name))?;

    tracing::debug!("building link graph for {}", name);
    let mut graph = LinkGraph::new(name.to_string());

    // Sections become blocks. Uninitialized-data sections carry no bytes in
    // the container and get a zero-filled placeholder of the declared size.
    let mut section_blocks: HashMap<SectionIndex, BlockId> = HashMap::new();
    for section in obj.sections() {
        let section_name = section.name().unwrap_or("<unnamed>").to_string();
        let content = if section.kind() == SectionKind::UninitializedData {
            vec![0u8; section.size() as usize]
        } else {
            section
                .data()
                .with_context(|| format!("{}: unreadable section {}", name, section_name))?
                .to_vec()
        };
        let block = graph.add_block(section_name, content, section.align());
        section_blocks.insert(section.index(), block);
    }

    // Symbol-table entries become symbols. Debug and file entries carry no
    // address and are skipped; relocations never reference them.
    let mut symbol_map: HashMap<SymbolIndex, SymbolId> = HashMap::new();
    for sym in obj.symbols() {
        if matches!(sym.kind(), SymbolKind::File) {
            continue;
        }
        let sym_name = match sym.name() {
            Ok("") | Err(_) => None,
            Ok(n) => Some(n.to_string()),
        };

        let (scope, value) = if sym.is_undefined() {
            (Scope::Imported, SymbolValue::External { address: None })
        } else if let Some(section_index) = sym.section_index() {
            let block = *section_blocks.get(&section_index).ok_or_else(|| {
                anyhow!(
                    "{}: symbol {} references unknown section {}",
                    name,
                    sym_name.as_deref().unwrap_or("<anonymous>"),
                    section_index.0
                )
            })?;
            let scope = if sym.is_global() { Scope::Exported } else { Scope::Local };
            (scope, SymbolValue::Defined { block, offset: sym.address() })
        } else {
            // COFF absolute symbols are layout-independent constants.
            (Scope::Local, SymbolValue::Absolute { value: sym.address() })
        };

        let id = graph.add_symbol(sym_name, scope, value);
        symbol_map.insert(sym.index(), id);
    }

    // Relocation records become edges, preserving on-disk order within each
    // section for deterministic diagnostics.
    for section in obj.sections() {
        let block = section_blocks[&section.index()];
        for (offset, reloc) in section.relocations() {
            let typ = match reloc.flags() {
                RelocationFlags::Coff { typ } => typ,
                flags => {
                    return Err(anyhow!(
                        "{}: unexpected relocation flags {:?} in section {}",
                        name,
                        flags,
                        graph.block(block).name
                    ))
                }
            };
            let kind = edge_kind_for_type(typ).with_context(|| {
                format!(
                    "{}: bad relocation at offset 0x{:x} in section {}",
                    name,
                    offset,
                    graph.block(block).name
                )
            })?;

            let target = match reloc.target() {
                RelocationTarget::Symbol(index) => *symbol_map.get(&index).ok_or_else(|| {
                    anyhow!(
                        "{}: relocation at offset 0x{:x} in section {} references \
                         out-of-range symbol index {}",
                        name,
                        offset,
                        graph.block(block).name,
                        index.0
                    )
                })?,
                other => {
                    return Err(anyhow!(
                        "{}: unsupported relocation target {:?} in section {}",
                        name,
                        other,
                        graph.block(block).name
                    ))
                }
            };

            // COFF addends live at the fixup site itself.
            let addend = aarch64::extract_addend(kind, &graph.block(block).content, offset)
                .with_context(|| {
                    format!(
                        "{}: relocation at offset 0x{:x} in section {}",
                        name,
                        offset,
                        graph.block(block).name
                    )
                })?;

            tracing::trace!(
                "edge {} at {}+0x{:x}, target {}, addend {}",
                aarch64::edge_kind_name(kind),
                graph.block(block).name,
                offset,
                graph.symbol(target).display_name(),
                addend
            );
            graph.add_edge(block, Edge { kind, offset, target, addend })?;
        }
    }

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::write;
    use object::{Architecture, BinaryFormat, Endianness};

    /// Builds a small COFF/AArch64 object in memory: a `.text` section with
    /// `bl; adrp; add; ret` referencing an external `callee` and a local
    /// `value` in `.data`, plus a `.bss`-style section.
    fn sample_object() -> Vec<u8> {
        let mut obj = write::Object::new(
            BinaryFormat::Coff,
            Architecture::Aarch64,
            Endianness::Little,
        );

        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        let code: Vec<u8> = [
            0x9400_0000u32, // bl callee
            0x9000_0000,    // adrp x0, value
            0x9100_0000,    // add x0, x0, :lo12:value
            0xd65f_03c0,    // ret
        ]
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect();
        obj.set_section_data(text, code, 4);

        let data = obj.add_section(Vec::new(), b".data".to_vec(), SectionKind::Data);
        obj.set_section_data(data, vec![0u8; 8], 8);

        let bss = obj.add_section(Vec::new(), b".bss".to_vec(), SectionKind::UninitializedData);
        obj.append_section_bss(bss, 16, 8);

        let callee = obj.add_symbol(write::Symbol {
            name: b"callee".to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Text,
            scope: object::SymbolScope::Unknown,
            weak: false,
            section: write::SymbolSection::Undefined,
            flags: object::SymbolFlags::None,
        });
        let value = obj.add_symbol(write::Symbol {
            name: b"value".to_vec(),
            value: 0,
            size: 8,
            kind: SymbolKind::Data,
            scope: object::SymbolScope::Linkage,
            weak: false,
            section: write::SymbolSection::Section(data),
            flags: object::SymbolFlags::None,
        });

        for (offset, typ, symbol) in [
            (0u64, pe::IMAGE_REL_ARM64_BRANCH26, callee),
            (4, pe::IMAGE_REL_ARM64_PAGEBASE_REL21, value),
            (8, pe::IMAGE_REL_ARM64_PAGEOFFSET_12A, value),
        ] {
            obj.add_relocation(
                text,
                write::Relocation {
                    offset,
                    symbol,
                    addend: 0,
                    flags: RelocationFlags::Coff { typ },
                },
            )
            .unwrap();
        }

        obj.write().unwrap()
    }

    #[test]
    fn builds_blocks_symbols_and_edges() {
        let bytes = sample_object();
        let file = object::File::parse(&*bytes).unwrap();
        let graph = build_graph("sample.obj", &file).unwrap();

        let text = graph
            .blocks()
            .find(|(_, b)| b.name == ".text")
            .map(|(id, _)| id)
            .unwrap();
        let edges = &graph.block(text).edges;
        assert_eq!(edges.len(), 3);

        // Record order and table mapping are preserved verbatim.
        assert_eq!(edges[0].kind, EdgeKind::Branch26);
        assert_eq!(edges[0].offset, 0);
        assert_eq!(edges[0].addend, 0);
        assert_eq!(edges[1].kind, EdgeKind::Page21);
        assert_eq!(edges[1].offset, 4);
        assert_eq!(edges[2].kind, EdgeKind::PageOffset12);
        assert_eq!(edges[2].offset, 8);

        // The external callee is imported and unresolved.
        let callee = graph
            .symbols()
            .find(|(_, s)| s.name.as_deref() == Some("callee"))
            .map(|(id, s)| {
                assert_eq!(s.scope, Scope::Imported);
                id
            })
            .unwrap();
        assert!(graph.symbol_address(callee).is_err());
        assert_eq!(edges[0].target, callee);
    }

    #[test]
    fn bss_sections_get_zero_filled_blocks() {
        let bytes = sample_object();
        let file = object::File::parse(&*bytes).unwrap();
        let graph = build_graph("sample.obj", &file).unwrap();
        let (_, bss) = graph.blocks().find(|(_, b)| b.name == ".bss").unwrap();
        assert_eq!(bss.content, vec![0u8; 16]);
        assert_eq!(bss.alignment, 8);
    }

    #[test]
    fn unknown_type_code_fails_the_whole_build() {
        let mut obj = write::Object::new(
            BinaryFormat::Coff,
            Architecture::Aarch64,
            Endianness::Little,
        );
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.set_section_data(text, vec![0u8; 8], 4);
        let sym = obj.add_symbol(write::Symbol {
            name: b"x".to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Data,
            scope: object::SymbolScope::Unknown,
            weak: false,
            section: write::SymbolSection::Undefined,
            flags: object::SymbolFlags::None,
        });
        obj.add_relocation(
            text,
            write::Relocation {
                offset: 0,
                symbol: sym,
                addend: 0,
                flags: RelocationFlags::Coff { typ: 0xff },
            },
        )
        .unwrap();
        let bytes = obj.write().unwrap();

        let file = object::File::parse(&*bytes).unwrap();
        let err = build_graph("bad.obj", &file).unwrap_err();
        assert!(format!("{:#}", err).contains("unrecognized ARM64 relocation type code 0xff"));
    }

    #[test]
    fn wrong_architecture_is_rejected() {
        let mut obj = write::Object::new(
            BinaryFormat::Coff,
            Architecture::X86_64,
            Endianness::Little,
        );
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.set_section_data(text, vec![0u8; 4], 4);
        let bytes = obj.write().unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        assert!(build_graph("wrong.obj", &file).is_err());
    }

    #[test]
    fn inline_addend_is_extracted_from_data_fields() {
        let mut obj = write::Object::new(
            BinaryFormat::Coff,
            Architecture::Aarch64,
            Endianness::Little,
        );
        let data = obj.add_section(Vec::new(), b".data".to_vec(), SectionKind::Data);
        let mut content = vec![0u8; 8];
        content[..8].copy_from_slice(&0x20u64.to_le_bytes());
        obj.set_section_data(data, content, 8);
        let sym = obj.add_symbol(write::Symbol {
            name: b"base".to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Data,
            scope: object::SymbolScope::Linkage,
            weak: false,
            section: write::SymbolSection::Section(data),
            flags: object::SymbolFlags::None,
        });
        obj.add_relocation(
            data,
            write::Relocation {
                offset: 0,
                symbol: sym,
                addend: 0,
                flags: RelocationFlags::Coff {
                    typ: pe::IMAGE_REL_ARM64_ADDR64,
                },
            },
        )
        .unwrap();
        let bytes = obj.write().unwrap();

        let file = object::File::parse(&*bytes).unwrap();
        let graph = build_graph("addend.obj", &file).unwrap();
        let (_, block) = graph.blocks().find(|(_, b)| b.name == ".data").unwrap();
        assert_eq!(block.edges[0].addend, 0x20);
    }
}
