use std::fmt;

use super::encoder::PendingReference;

/// Handle to a symbol inside one [`PatchContext`](super::PatchContext).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub(crate) usize);

impl SymbolId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolKind {
    /// Code at a fixed address in the target. `original` holds the bytes
    /// found there on the first install.
    Static {
        address: Option<u64>,
        original: Option<Vec<u8>>,
    },
    /// Code or data in scratch memory obtained near `preferred`.
    Allocated {
        size: usize,
        preferred: u64,
        allocation: Option<u64>,
    },
    /// A position inside another symbol's buffer.
    Label {
        owner: Option<SymbolId>,
        offset: usize,
    },
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub(crate) name: String,
    pub(crate) kind: SymbolKind,
    pub(crate) address: Option<u64>,
    pub(crate) buffer: Vec<u8>,
    pub(crate) references: Vec<PendingReference>,
    /// Address known and every reference written into the buffer
    pub(crate) finalized: bool,
}

impl Symbol {
    pub(crate) fn new(name: &str, kind: SymbolKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            address: None,
            buffer: Vec::new(),
            references: Vec::new(),
            finalized: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &SymbolKind {
        &self.kind
    }

    /// Resolved address, once addresses have been resolved
    pub fn address(&self) -> Option<u64> {
        self.address
    }

    /// Current buffer: placeholders until references are resolved
    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn references(&self) -> &[PendingReference] {
        &self.references
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn is_label(&self) -> bool {
        matches!(self.kind, SymbolKind::Label { .. })
    }

    /// Whether the symbol carries code to install
    pub(crate) fn has_code(&self) -> bool {
        !self.is_label() && !self.buffer.is_empty()
    }
}
