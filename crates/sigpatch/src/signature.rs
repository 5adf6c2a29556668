//! Byte signatures with wildcards, and JSON files of named signatures.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::scanner::ScanOptions;

/// One position of a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    Byte(u8),
    Wildcard,
}

impl Token {
    pub fn matches(self, byte: u8) -> bool {
        match self {
            Token::Byte(value) => value == byte,
            Token::Wildcard => true,
        }
    }
}

/// A compiled byte pattern, matched contiguously.
///
/// The text form is whitespace-separated tokens: two hex digits for a
/// required byte, `?` or `??` for any byte. Parsing is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Signature {
    tokens: Vec<Token>,
}

impl Signature {
    pub fn parse(text: &str) -> Result<Self> {
        let tokens = text
            .split_whitespace()
            .enumerate()
            .map(|(position, token)| parse_token(token, position))
            .collect::<Result<Vec<_>>>()?;

        if tokens.is_empty() {
            return Err(Error::EmptySignature);
        }
        Ok(Self { tokens })
    }

    /// Signature matching exactly `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            tokens: bytes.iter().map(|&b| Token::Byte(b)).collect(),
        }
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Check the signature against the start of `bytes`.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        bytes.len() >= self.tokens.len()
            && self
                .tokens
                .iter()
                .zip(bytes)
                .all(|(token, &byte)| token.matches(byte))
    }

    /// First required byte and its index, used to skip ahead with memchr.
    pub fn anchor(&self) -> Option<(usize, u8)> {
        self.tokens.iter().enumerate().find_map(|(i, t)| match t {
            Token::Byte(b) => Some((i, *b)),
            Token::Wildcard => None,
        })
    }
}

fn parse_token(token: &str, position: usize) -> Result<Token> {
    if token == "?" || token == "??" {
        return Ok(Token::Wildcard);
    }

    let invalid = || Error::InvalidSignature {
        token: token.to_string(),
        position,
    };
    if token.len() != 2 || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    u8::from_str_radix(token, 16)
        .map(Token::Byte)
        .map_err(|_| invalid())
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self
            .tokens
            .iter()
            .map(|t| match t {
                Token::Byte(value) => format!("{:02X}", value),
                Token::Wildcard => "??".to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ");
        f.write_str(&text)
    }
}

impl FromStr for Signature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Signature {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Signature> for String {
    fn from(signature: Signature) -> Self {
        signature.to_string()
    }
}

/// A named location with one signature per known build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub name: String,
    /// Tried in order; the first that matches wins
    pub candidates: Vec<Signature>,
    #[serde(default)]
    pub all_sections: bool,
    #[serde(default)]
    pub require_unique: bool,
}

impl SignatureEntry {
    pub fn options(&self) -> ScanOptions {
        ScanOptions {
            all_sections: self.all_sections,
            require_unique: self.require_unique,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureSet {
    #[serde(default)]
    pub version: String,
    pub entries: Vec<SignatureEntry>,
}

impl SignatureSet {
    /// Look up an entry by name, ignoring ASCII case
    pub fn entry(&self, name: &str) -> Option<&SignatureEntry> {
        self.entries
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)?;
        let set = serde_json::from_str(&content)?;
        Ok(set)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content)?;
        info!(
            "Saved {} signature entries to {}",
            self.entries.len(),
            path.as_ref().display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_wildcards() {
        let sig = Signature::parse("48 8d 0D ?? ? ?? ??").unwrap();
        assert_eq!(sig.len(), 7);
        assert_eq!(sig.tokens()[0], Token::Byte(0x48));
        assert_eq!(sig.tokens()[1], Token::Byte(0x8D));
        assert_eq!(sig.tokens()[4], Token::Wildcard);
        assert_eq!(sig.to_string(), "48 8D 0D ?? ?? ?? ??");
    }

    #[test]
    fn test_parse_rejects_malformed_tokens() {
        for (text, bad, position) in [
            ("48 8G", "8G", 1),
            ("4 8D", "4", 0),
            ("48 8D0D", "8D0D", 1),
            ("48 ???", "???", 1),
        ] {
            match Signature::parse(text) {
                Err(Error::InvalidSignature { token, position: p }) => {
                    assert_eq!(token, bad);
                    assert_eq!(p, position);
                }
                other => panic!("expected InvalidSignature for {text:?}, got {other:?}"),
            }
        }
        assert!(matches!(Signature::parse("  \t"), Err(Error::EmptySignature)));
    }

    #[test]
    fn test_matches_and_anchor() {
        let sig: Signature = "?? 41 ?? 84".parse().unwrap();
        assert!(sig.matches(&[0x8B, 0x41, 0x2C, 0x84, 0xC0]));
        assert!(sig.matches(&[0x00, 0x41, 0xFF, 0x84]));
        assert!(!sig.matches(&[0x8B, 0x41, 0x2C]));
        assert!(!sig.matches(&[0x8B, 0x42, 0x2C, 0x84]));
        assert_eq!(sig.anchor(), Some((1, 0x41)));
        assert_eq!(Signature::parse("?? ??").unwrap().anchor(), None);
    }

    #[test]
    fn test_signature_set_json() {
        let json = r#"{
            "version": "2024-01",
            "entries": [
                { "name": "PlayerHealth", "candidates": ["8B 41 2C 84 C0", "8b 41 ?? 84"], "require_unique": true }
            ]
        }"#;
        let set: SignatureSet = serde_json::from_str(json).unwrap();
        let entry = set.entry("playerhealth").unwrap();
        assert_eq!(entry.candidates.len(), 2);
        assert_eq!(entry.candidates[1].to_string(), "8B 41 ?? 84");
        assert!(entry.options().require_unique);
        assert!(!entry.options().all_sections);
        assert!(set.entry("missing").is_none());

        let bad = r#"{ "entries": [ { "name": "x", "candidates": ["ZZ"] } ] }"#;
        assert!(serde_json::from_str::<SignatureSet>(bad).is_err());
    }

    #[test]
    fn test_signature_set_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signatures.json");
        let set = SignatureSet {
            version: "1".to_string(),
            entries: vec![SignatureEntry {
                name: "cave".to_string(),
                candidates: vec![Signature::from_bytes(&[0xE9, 0x00])],
                all_sections: true,
                require_unique: false,
            }],
        };
        set.save(&path).unwrap();
        assert_eq!(SignatureSet::load(&path).unwrap(), set);
    }
}
