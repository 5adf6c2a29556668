//! Code element encoding.

use super::element::CodeElement;
use super::symbol::SymbolId;
use crate::error::{Error, Result};

const DISPLACEMENT_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// `target - (owner + offset + remaining)` as a signed 32-bit value
    Relative { remaining: usize },
    /// `target` as an unsigned value of `width` bytes
    Absolute { width: usize },
}

impl ReferenceKind {
    pub fn width(self) -> usize {
        match self {
            ReferenceKind::Relative { .. } => DISPLACEMENT_SIZE,
            ReferenceKind::Absolute { width } => width,
        }
    }
}

/// A placeholder in an owner's buffer waiting for `target`'s address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingReference {
    pub offset: usize,
    pub target: SymbolId,
    pub kind: ReferenceKind,
}

#[derive(Debug, Default)]
pub(crate) struct Encoded {
    pub bytes: Vec<u8>,
    pub references: Vec<PendingReference>,
    /// Labels placed by the elements, with their offsets
    pub labels: Vec<(SymbolId, usize)>,
}

/// Encode `elements` as if appended to a buffer already `start` bytes long.
pub(crate) fn encode(elements: &[CodeElement], start: usize, pad_byte: u8) -> Result<Encoded> {
    let mut encoded = Encoded::default();

    for element in elements {
        let offset = start + encoded.bytes.len();
        match element {
            CodeElement::Bytes(values) => encoded.bytes.extend_from_slice(values),
            CodeElement::Hex(text) => encoded.bytes.extend(parse_hex(text)?),
            CodeElement::Relative { target, remaining } => {
                encoded.references.push(PendingReference {
                    offset,
                    target: *target,
                    kind: ReferenceKind::Relative {
                        remaining: *remaining,
                    },
                });
                encoded.bytes.extend_from_slice(&[0; DISPLACEMENT_SIZE]);
            }
            CodeElement::Absolute { target, width } => {
                if !matches!(width, 2 | 4 | 8) {
                    return Err(Error::InvalidWidth(*width));
                }
                encoded.references.push(PendingReference {
                    offset,
                    target: *target,
                    kind: ReferenceKind::Absolute { width: *width },
                });
                encoded.bytes.resize(encoded.bytes.len() + width, 0);
            }
            CodeElement::Label(label) => encoded.labels.push((*label, offset)),
            CodeElement::Pad(count) => encoded
                .bytes
                .resize(encoded.bytes.len() + count, pad_byte),
        }
    }
    Ok(encoded)
}

/// Parse hex text; whitespace is ignored, digits must pair up.
pub(crate) fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let invalid = |message: &str| Error::InvalidHexLiteral {
        literal: text.to_string(),
        message: message.to_string(),
    };

    let digits: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(invalid("odd number of hex digits"));
    }
    digits
        .chunks_exact(2)
        .map(|pair| {
            let high = hex_value(pair[0]).ok_or_else(|| invalid("not a hex digit"))?;
            let low = hex_value(pair[1]).ok_or_else(|| invalid("not a hex digit"))?;
            Ok(high << 4 | low)
        })
        .collect()
}

fn hex_value(digit: u8) -> Option<u8> {
    (digit as char).to_digit(16).map(|v| v as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::element::{abs, db, dd, dq, dw, hex, nop, put_label, rip, rip_with};

    #[test]
    fn test_constants_are_little_endian() {
        let encoded = encode(&[db(0x01), dw(0x0302), dd(0x07060504), dq(0x0F0E0D0C0B0A0908)], 0, 0x90).unwrap();
        assert_eq!(encoded.bytes, (1..=15).collect::<Vec<u8>>());
        assert!(encoded.references.is_empty());
    }

    #[test]
    fn test_reference_offsets_are_recorded_before_placeholders() {
        let target = SymbolId(3);
        let encoded = encode(
            &[db(0xE9), rip(target), hex("48 B8"), abs(target, 8), hex("C7 05"), rip_with(target, 8), dd(1)],
            0,
            0x90,
        )
        .unwrap();

        assert_eq!(encoded.bytes.len(), 1 + 4 + 2 + 8 + 2 + 4 + 4);
        assert_eq!(
            encoded.references,
            vec![
                PendingReference { offset: 1, target, kind: ReferenceKind::Relative { remaining: 4 } },
                PendingReference { offset: 7, target, kind: ReferenceKind::Absolute { width: 8 } },
                PendingReference { offset: 17, target, kind: ReferenceKind::Relative { remaining: 8 } },
            ]
        );
        assert_eq!(&encoded.bytes[1..5], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_labels_and_padding() {
        let label = SymbolId(1);
        let encoded = encode(&[nop(3), put_label(label), db(0xC3)], 10, 0xCC).unwrap();
        assert_eq!(encoded.bytes, vec![0xCC, 0xCC, 0xCC, 0xC3]);
        assert_eq!(encoded.labels, vec![(label, 13)]);
    }

    #[test]
    fn test_start_offset_shifts_references() {
        let encoded = encode(&[db(0xE8), rip(SymbolId(0))], 5, 0x90).unwrap();
        assert_eq!(encoded.references[0].offset, 6);
    }

    #[test]
    fn test_invalid_absolute_width() {
        let err = encode(&[abs(SymbolId(0), 3)], 0, 0x90).unwrap_err();
        assert!(matches!(err, Error::InvalidWidth(3)));
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("48 c1 E8 30").unwrap(), vec![0x48, 0xC1, 0xE8, 0x30]);
        assert_eq!(parse_hex("0F1F 00").unwrap(), vec![0x0F, 0x1F, 0x00]);
        assert!(parse_hex("").unwrap().is_empty());
        assert!(matches!(parse_hex("48 C"), Err(Error::InvalidHexLiteral { .. })));
        assert!(matches!(parse_hex("48 ??"), Err(Error::InvalidHexLiteral { .. })));
    }
}
