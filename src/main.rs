//! Entry point for the coffjit demo driver.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Map the input object into memory and parse it.
//! 3. Build the link graph, lay out blocks, resolve imports, apply fixups.
//! 4. Print a per-block summary of the finalized graph.
//!
//! Error handling is done via `anyhow`.

use anyhow::{Context, Result};
use clap::Parser;
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;

use coffjit::coff;
use coffjit::config::{parse_address, Config};
use coffjit::graph::Scope;
use coffjit::linker::Linker;

fn main() -> Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut defines = HashMap::new();
    for def in &config.defines {
        let (name, addr) = def
            .split_once('=')
            .with_context(|| format!("bad --define {}, expected NAME=ADDR", def))?;
        let addr = parse_address(addr).map_err(|e| anyhow::anyhow!(e))?;
        defines.insert(name.to_string(), addr);
    }

    let file = File::open(&config.input)
        .with_context(|| format!("failed to open {}", config.input.display()))?;
    let mmap = unsafe { Mmap::map(&file)? };
    let obj = object::File::parse(&*mmap).context("failed to parse object file")?;

    let name = config.input.display().to_string();
    let graph = coff::build_graph(&name, &obj)?;

    let image_base = config.image_base.unwrap_or(config.base_addr);
    let mut linker = Linker::new(graph, image_base);
    linker.layout(config.base_addr)?;
    linker.resolve(&defines)?;
    linker.apply_fixups()?;

    let graph = linker.into_graph();
    println!("{}: {} blocks finalized", graph.name, graph.num_blocks());
    for (_, block) in graph.blocks() {
        println!(
            "  {:<12} 0x{:08x}  {:6} bytes  {:3} edges  align {}",
            block.name,
            block.address.unwrap_or(0),
            block.content.len(),
            block.edges.len(),
            block.alignment
        );
    }
    let exports = graph
        .symbols()
        .filter(|(_, s)| s.scope == Scope::Exported)
        .count();
    println!("  {} exported symbols", exports);
    Ok(())
}
