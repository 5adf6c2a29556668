use super::symbol::SymbolId;

/// Remaining-bytes count for a displacement that ends the instruction
pub const DEFAULT_REMAINING_BYTES: usize = 4;

/// One fragment of a symbol's code.
///
/// Elements are encoded left to right. Only lengths and offsets matter to the
/// encoder; the bytes themselves are never interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeElement {
    /// Literal bytes
    Bytes(Vec<u8>),
    /// Hex text such as `"48 C1 E8 30"`, parsed at encoding time. No wildcards.
    Hex(String),
    /// 4-byte displacement to `target`, computed as
    /// `target - (field address + remaining)`
    Relative { target: SymbolId, remaining: usize },
    /// `target`'s address as a little-endian value of `width` bytes (2, 4 or 8)
    Absolute { target: SymbolId, width: usize },
    /// Binds a label to the current offset; emits nothing
    Label(SymbolId),
    /// Filler bytes
    Pad(usize),
}

pub fn db(value: u8) -> CodeElement {
    CodeElement::Bytes(vec![value])
}

pub fn dw(value: u16) -> CodeElement {
    CodeElement::Bytes(value.to_le_bytes().to_vec())
}

pub fn dd(value: u32) -> CodeElement {
    CodeElement::Bytes(value.to_le_bytes().to_vec())
}

pub fn dq(value: u64) -> CodeElement {
    CodeElement::Bytes(value.to_le_bytes().to_vec())
}

pub fn bytes(values: &[u8]) -> CodeElement {
    CodeElement::Bytes(values.to_vec())
}

/// 32-bit values, little-endian, back to back
pub fn dds(values: &[u32]) -> CodeElement {
    CodeElement::Bytes(values.iter().flat_map(|v| v.to_le_bytes()).collect())
}

/// 64-bit values, little-endian, back to back
pub fn dqs(values: &[u64]) -> CodeElement {
    CodeElement::Bytes(values.iter().flat_map(|v| v.to_le_bytes()).collect())
}

pub fn hex(text: &str) -> CodeElement {
    CodeElement::Hex(text.to_string())
}

/// Displacement to `target` in an instruction that ends right after it.
pub fn rip(target: SymbolId) -> CodeElement {
    rip_with(target, DEFAULT_REMAINING_BYTES)
}

/// Displacement to `target` followed by more instruction bytes.
///
/// `remaining` counts from the start of the displacement to the end of the
/// instruction, the 4 displacement bytes included: `mov dword [rip+x], imm32`
/// is `hex("C7 05"), rip_with(x, 8), dd(imm)`.
pub fn rip_with(target: SymbolId, remaining: usize) -> CodeElement {
    CodeElement::Relative { target, remaining }
}

pub fn abs(target: SymbolId, width: usize) -> CodeElement {
    CodeElement::Absolute { target, width }
}

pub fn put_label(label: SymbolId) -> CodeElement {
    CodeElement::Label(label)
}

pub fn nop(count: usize) -> CodeElement {
    CodeElement::Pad(count)
}
