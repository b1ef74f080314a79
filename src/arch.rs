//! Architecture backends.
//!
//! The fixup engine is container-agnostic at the instruction-encoding level:
//! the AArch64 module knows how to splice immediates into instruction words
//! but nothing about COFF. The backend is selected once per object, when the
//! target of the input is validated; per-edge dispatch is a plain match on
//! the edge kind.

use anyhow::{bail, Result};
use object::Architecture as ObjArch;
use object::BinaryFormat;

pub mod aarch64;

/// Validates that an input object is the one container/architecture pair
/// this crate supports: little-endian AArch64 in a COFF container.
pub fn check_target(
    format: BinaryFormat,
    architecture: ObjArch,
    is_little_endian: bool,
) -> Result<()> {
    if format != BinaryFormat::Coff {
        bail!(
            "unsupported container format {:?}: only COFF is supported",
            format
        );
    }
    if architecture != ObjArch::Aarch64 {
        bail!(
            "unsupported architecture {:?}: only AArch64 is supported",
            architecture
        );
    }
    if !is_little_endian {
        bail!("big-endian objects are not supported");
    }
    Ok(())
}
