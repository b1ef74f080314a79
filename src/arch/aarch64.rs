//! AArch64 fixup engine and relocation-kind registry.
//!
//! `EdgeKind` is the closed set of relocation kinds the graph builder can
//! produce and `apply_fixup` can consume. Each encoder follows the same
//! discipline: load the existing word, clear exactly the bits owned by the
//! immediate field, OR in the new value, store back. Opcode and unrelated
//! operand bits are never touched.

use anyhow::{anyhow, bail, Result};

/// Page granule used by ADRP/page-offset addressing.
pub const PAGE_SIZE: u64 = 0x1000;

/// Relocation kinds understood by the fixup engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// 64-bit absolute address.
    Pointer64,
    /// 32-bit absolute address; errors if the value does not fit.
    Pointer32,
    /// 32-bit delta from the byte following the field.
    Delta32,
    /// 32-bit offset from the base of the target's section.
    Secrel32,
    /// 32-bit offset from the image base.
    ImageRel32,
    /// ADR 21-bit PC-relative byte displacement.
    Adr21,
    /// ADRP 21-bit PC-relative page delta, split across immhi/immlo.
    Page21,
    /// Low 12 bits of the target address, for add/sub or load/store
    /// immediates (scaled by the access size for loads/stores).
    PageOffset12,
    /// B / BL 26-bit scaled branch displacement.
    Branch26,
    /// B.cond / CBZ / CBNZ 19-bit scaled branch displacement.
    CondBranch19,
    /// TBZ / TBNZ 14-bit scaled branch displacement.
    TestBranch14,
}

/// Stable human-readable name of an edge kind, for diagnostics only.
pub fn edge_kind_name(kind: EdgeKind) -> &'static str {
    match kind {
        EdgeKind::Pointer64 => "Pointer64",
        EdgeKind::Pointer32 => "Pointer32",
        EdgeKind::Delta32 => "Delta32",
        EdgeKind::Secrel32 => "Secrel32",
        EdgeKind::ImageRel32 => "ImageRel32",
        EdgeKind::Adr21 => "Adr21",
        EdgeKind::Page21 => "Page21",
        EdgeKind::PageOffset12 => "PageOffset12",
        EdgeKind::Branch26 => "Branch26",
        EdgeKind::CondBranch19 => "CondBranch19",
        EdgeKind::TestBranch14 => "TestBranch14",
    }
}

/// Base addresses needed by the section- and image-relative kinds.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixupBases {
    /// Base address of the target symbol's section.
    pub section: u64,
    /// Image base of the current link.
    pub image: u64,
}

/// Checked byte range of a `width`-byte field at `offset`. Overflow-safe for
/// any offset a caller can pass.
fn field_range(len: usize, offset: u64, width: usize) -> Result<std::ops::Range<usize>> {
    let start = usize::try_from(offset).ok();
    match start.and_then(|s| s.checked_add(width)) {
        Some(end) if end <= len => Ok(start.unwrap_or_default()..end),
        _ => Err(anyhow!(
            "fixup site 0x{:x} out of bounds (block size 0x{:x})",
            offset,
            len
        )),
    }
}

fn read32(data: &[u8], offset: u64) -> Result<u32> {
    let range = field_range(data.len(), offset, 4)?;
    Ok(u32::from_le_bytes(data[range].try_into().unwrap()))
}

fn write32(data: &mut [u8], offset: u64, value: u32) -> Result<()> {
    let range = field_range(data.len(), offset, 4)?;
    data[range].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn read64(data: &[u8], offset: u64) -> Result<u64> {
    let range = field_range(data.len(), offset, 8)?;
    Ok(u64::from_le_bytes(data[range].try_into().unwrap()))
}

fn write64(data: &mut [u8], offset: u64, value: u64) -> Result<()> {
    let range = field_range(data.len(), offset, 8)?;
    data[range].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn fits_signed(value: i64, bits: u32) -> bool {
    value >= -(1i64 << (bits - 1)) && value < (1i64 << (bits - 1))
}

fn sign_extend(value: u64, bits: u32) -> i64 {
    ((value << (64 - bits)) as i64) >> (64 - bits)
}

fn page(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

fn is_adr(inst: u32) -> bool {
    inst & 0x9f00_0000 == 0x1000_0000
}

fn is_adrp(inst: u32) -> bool {
    inst & 0x9f00_0000 == 0x9000_0000
}

fn is_addsub_imm(inst: u32) -> bool {
    inst & 0x1f00_0000 == 0x1100_0000
}

fn is_ldst_uimm12(inst: u32) -> bool {
    inst & 0x3b00_0000 == 0x3900_0000
}

fn is_branch26(inst: u32) -> bool {
    inst & 0x7c00_0000 == 0x1400_0000
}

fn is_cond_branch19(inst: u32) -> bool {
    // B.cond, or CBZ/CBNZ
    (inst & 0xff00_0010) == 0x5400_0000 || (inst & 0x7e00_0000) == 0x3400_0000
}

fn is_test_branch14(inst: u32) -> bool {
    inst & 0x7e00_0000 == 0x3600_0000
}

/// Access-size shift of a load/store unsigned-immediate instruction.
fn ldst_scale(inst: u32) -> u32 {
    let size = inst >> 30;
    // 128-bit SIMD forms encode size=00 with V=1 and opc<1>=1.
    if size == 0 && inst & 0x0480_0000 == 0x0480_0000 {
        4
    } else {
        size
    }
}

/// Splices a 21-bit immediate into the immhi/immlo fields shared by ADR and
/// ADRP, preserving every other bit.
fn splice_adr_imm(inst: u32, imm: i64) -> u32 {
    let imm = imm as u32;
    let immlo = (imm & 0x3) << 29;
    let immhi = ((imm >> 2) & 0x7_ffff) << 5;
    (inst & !((0x3 << 29) | (0x7_ffff << 5))) | immlo | immhi
}

/// Extracts the implicit addend stored at a fixup site, in bytes.
///
/// COFF relocation records carry no addend field; compilers store it inline
/// in the data field or instruction immediate that the fixup later
/// overwrites. Instruction immediates are scaled back to byte units.
pub fn extract_addend(kind: EdgeKind, data: &[u8], offset: u64) -> Result<i64> {
    match kind {
        EdgeKind::Pointer64 => Ok(read64(data, offset)? as i64),
        EdgeKind::Pointer32 | EdgeKind::Delta32 | EdgeKind::Secrel32 | EdgeKind::ImageRel32 => {
            Ok(read32(data, offset)? as i32 as i64)
        }
        EdgeKind::Adr21 | EdgeKind::Page21 => {
            let inst = read32(data, offset)?;
            let imm = ((inst >> 29) & 0x3) as u64 | ((((inst >> 5) & 0x7_ffff) as u64) << 2);
            let imm = sign_extend(imm, 21);
            if kind == EdgeKind::Page21 {
                Ok(imm * PAGE_SIZE as i64)
            } else {
                Ok(imm)
            }
        }
        EdgeKind::PageOffset12 => {
            let inst = read32(data, offset)?;
            let imm12 = ((inst >> 10) & 0xfff) as i64;
            let shift = if is_ldst_uimm12(inst) { ldst_scale(inst) } else { 0 };
            Ok(imm12 << shift)
        }
        EdgeKind::Branch26 => {
            let inst = read32(data, offset)?;
            Ok(sign_extend((inst & 0x03ff_ffff) as u64, 26) * 4)
        }
        EdgeKind::CondBranch19 => {
            let inst = read32(data, offset)?;
            Ok(sign_extend(((inst >> 5) & 0x7_ffff) as u64, 19) * 4)
        }
        EdgeKind::TestBranch14 => {
            let inst = read32(data, offset)?;
            Ok(sign_extend(((inst >> 5) & 0x3fff) as u64, 14) * 4)
        }
    }
}

/// Applies one relocation edge to a block's bytes.
///
/// # Arguments
/// * `kind` - encoding rule for this edge.
/// * `offset` - fixup site within `data`.
/// * `p` - runtime address of the fixup site (P).
/// * `s` - resolved address of the target symbol (S).
/// * `a` - edge addend (A).
/// * `bases` - section/image bases for the relative 32-bit kinds.
/// * `data` - the source block's content, mutated in place.
///
/// On success exactly one field of `data` is rewritten. Out-of-bounds sites,
/// values that do not fit their field, misaligned branch targets and an
/// unexpected instruction class at the site each fail with a distinct error.
pub fn apply_fixup(
    kind: EdgeKind,
    offset: u64,
    p: u64,
    s: u64,
    a: i64,
    bases: FixupBases,
    data: &mut [u8],
) -> Result<()> {
    let target = (s as i64).wrapping_add(a) as u64;
    match kind {
        EdgeKind::Pointer64 => write64(data, offset, target),
        EdgeKind::Pointer32 => {
            if target > u32::MAX as u64 {
                return Err(anyhow!(
                    "Pointer32 overflow at 0x{:x}: value 0x{:x} does not fit in 32 bits",
                    p,
                    target
                ));
            }
            write32(data, offset, target as u32)
        }
        EdgeKind::Delta32 => {
            // COFF REL32 is relative to the byte following the field.
            let delta = (target as i64).wrapping_sub(p as i64 + 4);
            if !fits_signed(delta, 32) {
                return Err(anyhow!(
                    "Delta32 overflow at 0x{:x}: delta 0x{:x} exceeds 32-bit signed range",
                    p,
                    delta
                ));
            }
            write32(data, offset, delta as u32)
        }
        EdgeKind::Secrel32 => {
            let rel = (target as i64).wrapping_sub(bases.section as i64);
            if rel < 0 || rel > u32::MAX as i64 {
                return Err(anyhow!(
                    "Secrel32 overflow at 0x{:x}: offset 0x{:x} from section base 0x{:x}",
                    p,
                    rel,
                    bases.section
                ));
            }
            write32(data, offset, rel as u32)
        }
        EdgeKind::ImageRel32 => {
            let rel = (target as i64).wrapping_sub(bases.image as i64);
            if rel < 0 || rel > u32::MAX as i64 {
                return Err(anyhow!(
                    "ImageRel32 overflow at 0x{:x}: offset 0x{:x} from image base 0x{:x}",
                    p,
                    rel,
                    bases.image
                ));
            }
            write32(data, offset, rel as u32)
        }
        EdgeKind::Adr21 => {
            let inst = read32(data, offset)?;
            if !is_adr(inst) {
                return Err(anyhow!(
                    "Adr21 fixup at 0x{:x} is not an ADR instruction (word 0x{:08x})",
                    p,
                    inst
                ));
            }
            let delta = (target as i64).wrapping_sub(p as i64);
            if !fits_signed(delta, 21) {
                return Err(anyhow!(
                    "Adr21 overflow at 0x{:x}: delta 0x{:x} exceeds +-1MiB",
                    p,
                    delta
                ));
            }
            write32(data, offset, splice_adr_imm(inst, delta))
        }
        EdgeKind::Page21 => {
            let inst = read32(data, offset)?;
            if !is_adrp(inst) {
                return Err(anyhow!(
                    "Page21 fixup at 0x{:x} is not an ADRP instruction (word 0x{:08x})",
                    p,
                    inst
                ));
            }
            let delta = (page(target) as i64).wrapping_sub(page(p) as i64);
            let pages = delta >> 12;
            if !fits_signed(pages, 21) {
                return Err(anyhow!(
                    "Page21 overflow at 0x{:x}: page delta 0x{:x} exceeds +-4GiB",
                    p,
                    delta
                ));
            }
            write32(data, offset, splice_adr_imm(inst, pages))
        }
        EdgeKind::PageOffset12 => {
            let inst = read32(data, offset)?;
            let shift = if is_addsub_imm(inst) {
                0
            } else if is_ldst_uimm12(inst) {
                ldst_scale(inst)
            } else {
                return Err(anyhow!(
                    "PageOffset12 fixup at 0x{:x} is neither an add/sub nor a \
                     load/store immediate (word 0x{:08x})",
                    p,
                    inst
                ));
            };
            let low = target & (PAGE_SIZE - 1);
            if low & ((1u64 << shift) - 1) != 0 {
                return Err(anyhow!(
                    "PageOffset12 at 0x{:x}: offset 0x{:x} is not aligned to the \
                     {}-byte access size",
                    p,
                    low,
                    1u64 << shift
                ));
            }
            let imm12 = (low >> shift) as u32;
            write32(data, offset, (inst & !(0xfff << 10)) | (imm12 << 10))
        }
        EdgeKind::Branch26 => {
            let inst = read32(data, offset)?;
            if !is_branch26(inst) {
                return Err(anyhow!(
                    "Branch26 fixup at 0x{:x} is not a B/BL instruction (word 0x{:08x})",
                    p,
                    inst
                ));
            }
            let delta = branch_delta(target, p, 28)?;
            let imm26 = ((delta >> 2) as u32) & 0x03ff_ffff;
            write32(data, offset, (inst & !0x03ff_ffff) | imm26)
        }
        EdgeKind::CondBranch19 => {
            let inst = read32(data, offset)?;
            if !is_cond_branch19(inst) {
                return Err(anyhow!(
                    "CondBranch19 fixup at 0x{:x} is not a B.cond/CBZ/CBNZ \
                     instruction (word 0x{:08x})",
                    p,
                    inst
                ));
            }
            let delta = branch_delta(target, p, 21)?;
            let imm19 = (((delta >> 2) as u32) & 0x7_ffff) << 5;
            write32(data, offset, (inst & !(0x7_ffff << 5)) | imm19)
        }
        EdgeKind::TestBranch14 => {
            let inst = read32(data, offset)?;
            if !is_test_branch14(inst) {
                return Err(anyhow!(
                    "TestBranch14 fixup at 0x{:x} is not a TBZ/TBNZ instruction \
                     (word 0x{:08x})",
                    p,
                    inst
                ));
            }
            let delta = branch_delta(target, p, 16)?;
            let imm14 = (((delta >> 2) as u32) & 0x3fff) << 5;
            write32(data, offset, (inst & !(0x3fff << 5)) | imm14)
        }
    }
}

/// Checked branch displacement: must be instruction-aligned and fit the
/// signed `bits`-wide byte range of the branch class.
fn branch_delta(target: u64, p: u64, bits: u32) -> Result<i64> {
    let delta = (target as i64).wrapping_sub(p as i64);
    if delta & 0x3 != 0 {
        bail!(
            "misaligned branch target: delta 0x{:x} from 0x{:x} is not 4-byte aligned",
            delta,
            p
        );
    }
    if !fits_signed(delta, bits) {
        bail!(
            "branch displacement 0x{:x} from 0x{:x} exceeds the signed {}-bit range",
            delta,
            p,
            bits
        );
    }
    Ok(delta)
}
