//! Configuration module.
//!
//! This module defines the command-line interface (CLI) for the demo driver
//! using `clap`: the input object, link addresses and import definitions.

use clap::Parser;
use std::path::PathBuf;

/// A JIT-link demo driver for COFF/AArch64 relocatable objects.
///
/// Builds the link graph for one object, lays its blocks out at the given
/// base address, resolves imports from `--define` and applies every fixup,
/// then prints a per-block summary. Nothing is written to disk.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Input COFF/AArch64 object file
    pub input: PathBuf,

    /// Address at which block layout starts
    #[arg(long, default_value_t = 0x40_0000, value_parser = parse_address)]
    pub base_addr: u64,

    /// Image base used by image-relative fixups (defaults to the layout base)
    #[arg(long, value_parser = parse_address)]
    pub image_base: Option<u64>,

    /// Define an imported symbol, as NAME=ADDR (repeatable)
    #[arg(long = "define", value_name = "NAME=ADDR")]
    pub defines: Vec<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,
}

/// Parses a decimal or `0x`-prefixed hexadecimal address.
pub fn parse_address(s: &str) -> Result<u64, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|_| format!("invalid address: {}", s))
}
