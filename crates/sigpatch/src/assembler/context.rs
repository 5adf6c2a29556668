//! Symbol table and resolution pipeline.

use tracing::{debug, error, warn};

use super::element::CodeElement;
use super::encoder::{PendingReference, ReferenceKind, encode};
use super::symbol::{Symbol, SymbolId, SymbolKind};
use crate::config::EngineConfig;
use crate::cursor::Cursor;
use crate::error::{Error, Result, Unresolved};
use crate::memory::ProcessMemory;

/// The symbols of one patch and the pipeline that turns them into bytes.
///
/// Symbols are declared and given code first. [`PatchContext::resolve`] then
/// runs three phases, each over every symbol before the next starts:
///
/// 1. [`allocate`](PatchContext::allocate) scratch memory for allocated symbols
/// 2. [`resolve_addresses`](PatchContext::resolve_addresses) of every symbol
/// 3. [`resolve_references`](PatchContext::resolve_references) into the buffers
///
/// A symbol is finalized when it has an address and every reference in its
/// buffer was written. Only finalized symbols are ever installed.
pub struct PatchContext<'h, M: ?Sized> {
    pub(super) host: &'h M,
    pub(super) config: EngineConfig,
    pub(super) symbols: Vec<Symbol>,
    pub(super) unresolved: Vec<Unresolved>,
    pub(super) active: bool,
}

impl<'h, M: ProcessMemory + ?Sized> PatchContext<'h, M> {
    pub fn new(host: &'h M) -> Self {
        Self::with_config(host, EngineConfig::default())
    }

    pub fn with_config(host: &'h M, config: EngineConfig) -> Self {
        Self {
            host,
            config,
            symbols: Vec::new(),
            unresolved: Vec::new(),
            active: false,
        }
    }

    pub fn host(&self) -> &'h M {
        self.host
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn push(&mut self, name: &str, kind: SymbolKind) -> SymbolId {
        let id = SymbolId(self.symbols.len());
        self.symbols.push(Symbol::new(name, kind));
        id
    }

    /// Declare code at a fixed address.
    pub fn define(&mut self, name: &str, address: u64) -> SymbolId {
        self.push(
            name,
            SymbolKind::Static {
                address: Some(address),
                original: None,
            },
        )
    }

    /// Declare code at a scanned address. A not-found cursor leaves the symbol
    /// without an address, which fails every symbol depending on it.
    pub fn define_at(&mut self, name: &str, cursor: Cursor) -> SymbolId {
        self.push(
            name,
            SymbolKind::Static {
                address: cursor.as_address(),
                original: None,
            },
        )
    }

    /// Declare scratch memory of `size` bytes, placed within reach of
    /// `preferred` (zero for anywhere).
    pub fn alloc(&mut self, name: &str, size: usize, preferred: u64) -> SymbolId {
        self.push(
            name,
            SymbolKind::Allocated {
                size,
                preferred,
                allocation: None,
            },
        )
    }

    /// Declare a label, placed later with [`put_label`](super::put_label).
    pub fn label(&mut self, name: &str) -> SymbolId {
        self.push(
            name,
            SymbolKind::Label {
                owner: None,
                offset: 0,
            },
        )
    }

    /// Replace a symbol's code.
    pub fn set(&mut self, symbol: SymbolId, elements: &[CodeElement]) -> Result<()> {
        self.assign(symbol, elements, false)
    }

    /// Extend a symbol's code.
    pub fn append(&mut self, symbol: SymbolId, elements: &[CodeElement]) -> Result<()> {
        self.assign(symbol, elements, true)
    }

    fn assign(&mut self, symbol: SymbolId, elements: &[CodeElement], append: bool) -> Result<()> {
        let owner = self.get(symbol)?;
        if owner.is_label() {
            return Err(Error::NotWritable(owner.name.clone()));
        }
        let start = if append { owner.buffer.len() } else { 0 };
        let encoded = encode(elements, start, self.config.pad_byte)?;

        for reference in &encoded.references {
            self.get(reference.target)?;
        }
        for (label, _) in &encoded.labels {
            let placed = self.get(*label)?;
            if !placed.is_label() {
                return Err(Error::NotALabel(placed.name.clone()));
            }
        }

        if !append {
            for other in &mut self.symbols {
                if let SymbolKind::Label { owner, .. } = &mut other.kind
                    && *owner == Some(symbol)
                {
                    *owner = None;
                }
            }
            let target = &mut self.symbols[symbol.0];
            target.buffer.clear();
            target.references.clear();
        }

        let target = &mut self.symbols[symbol.0];
        target.buffer.extend_from_slice(&encoded.bytes);
        target.references.extend(encoded.references);
        for (label, offset) in encoded.labels {
            self.symbols[label.0].kind = SymbolKind::Label {
                owner: Some(symbol),
                offset,
            };
        }
        Ok(())
    }

    /// Run the three resolution phases.
    pub fn resolve(&mut self) -> Result<()> {
        self.allocate();
        self.resolve_addresses();
        self.resolve_references()
    }

    /// Phase 1: obtain memory for every allocated symbol. A failure leaves
    /// that symbol without an address and does not stop the others.
    pub fn allocate(&mut self) {
        let host = self.host;
        let reach = self.config.max_relative_distance;

        for symbol in &mut self.symbols {
            if let SymbolKind::Allocated {
                size,
                preferred,
                allocation,
            } = &mut symbol.kind
                && allocation.is_none()
            {
                let request = (*size).max(symbol.buffer.len());
                match host.allocate_near(request, *preferred, reach) {
                    Ok(address) => {
                        debug!(
                            "Allocated '{}': {} bytes at {:#x}",
                            symbol.name, request, address
                        );
                        *allocation = Some(address);
                    }
                    Err(e) => warn!("Failed to allocate '{}': {}", symbol.name, e),
                }
            }
        }
    }

    /// Phase 2: give every symbol its address. Labels resolve to their
    /// owner's address plus their offset.
    pub fn resolve_addresses(&mut self) {
        for symbol in &mut self.symbols {
            symbol.address = match &symbol.kind {
                SymbolKind::Static { address, .. } => *address,
                SymbolKind::Allocated { allocation, .. } => *allocation,
                SymbolKind::Label { .. } => None,
            };
        }

        for index in 0..self.symbols.len() {
            if let SymbolKind::Label {
                owner: Some(owner),
                offset,
            } = self.symbols[index].kind
            {
                self.symbols[index].address =
                    self.symbols[owner.0].address.map(|a| a + offset as u64);
            }
        }
    }

    /// Phase 3: write every pending reference into its owner's buffer.
    ///
    /// Fails with the list of symbols that could not be finalized: references
    /// to symbols without an address, values that do not fit their field, and
    /// symbols with code but no address. A symbol referencing code that is not
    /// finalized is not finalized either, so no jump into missing code is
    /// ever installed.
    pub fn resolve_references(&mut self) -> Result<()> {
        let addresses: Vec<Option<u64>> = self.symbols.iter().map(|s| s.address).collect();
        let names: Vec<String> = self.symbols.iter().map(|s| s.name.clone()).collect();
        let mut unresolved = Vec::new();

        for (index, symbol) in self.symbols.iter_mut().enumerate() {
            let Some(owner_address) = addresses[index] else {
                symbol.finalized = false;
                if symbol.has_code() {
                    unresolved.push(Unresolved {
                        owner: names[index].clone(),
                        target: names[index].clone(),
                    });
                }
                continue;
            };

            let mut complete = true;
            for reference in &symbol.references {
                let target = reference.target.0;
                let value = addresses[target]
                    .ok_or_else(|| Error::UnresolvedReference {
                        owner: names[index].clone(),
                        target: names[target].clone(),
                    })
                    .and_then(|target_address| {
                        reference_bytes(owner_address, reference, target_address, &names[index], &names[target])
                    });

                match value {
                    Ok(bytes) => symbol.buffer[reference.offset..reference.offset + bytes.len()]
                        .copy_from_slice(&bytes),
                    Err(e) => {
                        error!("{}", e);
                        complete = false;
                        unresolved.push(Unresolved {
                            owner: names[index].clone(),
                            target: names[target].clone(),
                        });
                    }
                }
            }
            symbol.finalized = complete;
        }

        self.spread_unfinalized(&names, &mut unresolved);
        self.unresolved = unresolved;
        if self.unresolved.is_empty() {
            Ok(())
        } else {
            Err(Error::UnresolvedReferences(self.unresolved.clone()))
        }
    }

    /// Unfinalize every symbol that references code which will not be
    /// installed, directly or through a label, until nothing changes.
    fn spread_unfinalized(&mut self, names: &[String], unresolved: &mut Vec<Unresolved>) {
        loop {
            let mut changed = false;
            for index in 0..self.symbols.len() {
                if !self.symbols[index].finalized {
                    continue;
                }
                let blocked = self.symbols[index]
                    .references
                    .iter()
                    .map(|reference| reference.target.0)
                    .find(|&target| !self.target_installable(target));

                if let Some(target) = blocked {
                    warn!(
                        "'{}' depends on '{}', which cannot be installed",
                        names[index], names[target]
                    );
                    self.symbols[index].finalized = false;
                    unresolved.push(Unresolved {
                        owner: names[index].clone(),
                        target: names[target].clone(),
                    });
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn target_installable(&self, target: usize) -> bool {
        let symbol = &self.symbols[target];
        match symbol.kind {
            SymbolKind::Label {
                owner: Some(owner), ..
            } => self.symbols[owner.0].finalized,
            _ => !symbol.has_code() || symbol.finalized,
        }
    }

    pub fn symbol(&self, id: SymbolId) -> Option<&Symbol> {
        self.symbols.get(id.0)
    }

    pub fn symbols(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> {
        self.symbols
            .iter()
            .enumerate()
            .map(|(index, symbol)| (SymbolId(index), symbol))
    }

    /// Find a symbol by name. Names are not unique; the last declared wins.
    pub fn symbol_by_name(&self, name: &str) -> Option<SymbolId> {
        self.symbols
            .iter()
            .rposition(|s| s.name == name)
            .map(SymbolId)
    }

    pub fn address_of(&self, id: SymbolId) -> Option<u64> {
        self.symbol(id).and_then(Symbol::address)
    }

    /// The symbol's current buffer as uppercase hex, space separated.
    pub fn result_bytes_string(&self, id: SymbolId) -> Result<String> {
        let symbol = self.get(id)?;
        Ok(symbol
            .buffer
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" "))
    }

    /// What the last resolution could not finalize
    pub fn unresolved(&self) -> &[Unresolved] {
        &self.unresolved
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub(super) fn get(&self, id: SymbolId) -> Result<&Symbol> {
        self.symbols.get(id.0).ok_or(Error::UnknownSymbol(id.0))
    }
}

fn reference_bytes(
    owner_address: u64,
    reference: &PendingReference,
    target_address: u64,
    owner: &str,
    target: &str,
) -> Result<Vec<u8>> {
    match reference.kind {
        ReferenceKind::Relative { remaining } => {
            let next = owner_address as i128 + reference.offset as i128 + remaining as i128;
            let value = target_address as i128 - next;
            i32::try_from(value)
                .map(|displacement| displacement.to_le_bytes().to_vec())
                .map_err(|_| Error::DisplacementOutOfRange {
                    owner: owner.to_string(),
                    target: target.to_string(),
                    value: value as i64,
                })
        }
        ReferenceKind::Absolute { width } => {
            let out_of_range = || Error::AbsoluteOutOfRange {
                target: target.to_string(),
                value: target_address,
                width,
            };
            match width {
                2 => u16::try_from(target_address)
                    .map(|v| v.to_le_bytes().to_vec())
                    .map_err(|_| out_of_range()),
                4 => u32::try_from(target_address)
                    .map(|v| v.to_le_bytes().to_vec())
                    .map_err(|_| out_of_range()),
                8 => Ok(target_address.to_le_bytes().to_vec()),
                other => Err(Error::InvalidWidth(other)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::assembler::element::{abs, bytes, db, dd, dq, hex, nop, put_label, rip, rip_with};
    use crate::memory::{BufferMemory, Protection};

    const CODE: u64 = 0x14000_1000;

    fn host() -> BufferMemory {
        let memory = BufferMemory::new();
        memory
            .map(CODE, vec![0x90; 0x100], Protection::READ_EXECUTE)
            .unwrap();
        memory
    }

    #[test]
    fn test_relative_reference_formula() {
        let memory = host();
        let mut ctx = PatchContext::new(&memory);
        let site = ctx.define("site", CODE + 0x10);
        let target = ctx.define("target", CODE - 0x500);
        ctx.set(site, &[hex("C7 05"), rip_with(target, 8), dd(0x2D68_1820)])
            .unwrap();
        ctx.resolve().unwrap();

        let bytes = ctx.symbol(site).unwrap().bytes();
        let expected = (CODE - 0x500) as i64 - (CODE + 0x10 + 2 + 8) as i64;
        assert_eq!(&bytes[2..6], &(expected as i32).to_le_bytes());
        assert_eq!(&bytes[6..], &0x2D68_1820u32.to_le_bytes());
    }

    #[test]
    fn test_jump_to_allocated_cave() {
        let memory = host();
        let mut ctx = PatchContext::new(&memory);
        let jmp = ctx.define("jmp", CODE);
        let cave = ctx.alloc("cave", 16, CODE);
        ctx.set(jmp, &[db(0xE9), rip(cave)]).unwrap();
        ctx.resolve().unwrap();

        let cave_address = ctx.address_of(cave).unwrap();
        let displacement = i32::from_le_bytes(ctx.symbol(jmp).unwrap().bytes()[1..5].try_into().unwrap());
        assert_eq!(displacement as i64, cave_address as i64 - (CODE as i64 + 5));
        assert!(ctx.symbol(jmp).unwrap().is_finalized());
    }

    #[test]
    fn test_labels_resolve_to_owner_plus_offset() {
        let memory = host();
        let mut ctx = PatchContext::new(&memory);
        let cave = ctx.alloc("cave", 32, CODE);
        let back = ctx.label("back");
        let site = ctx.define("site", CODE);
        ctx.set(site, &[db(0xE9), rip(cave), put_label(back)]).unwrap();
        ctx.set(cave, &[nop(2), db(0xE9), rip(back)]).unwrap();
        ctx.resolve().unwrap();

        assert_eq!(ctx.address_of(back), Some(CODE + 5));
        let cave_address = ctx.address_of(cave).unwrap();
        let bytes = ctx.symbol(cave).unwrap().bytes();
        let displacement = i32::from_le_bytes(bytes[3..7].try_into().unwrap());
        assert_eq!(displacement as i64, (CODE + 5) as i64 - (cave_address + 7) as i64);
    }

    #[test]
    fn test_append_extends_offsets() {
        let memory = host();
        let mut ctx = PatchContext::new(&memory);
        let site = ctx.define("site", CODE);
        let flag = ctx.define("flag", 0x1234_5678);
        let end = ctx.label("end");
        ctx.set(site, &[hex("48 B8")]).unwrap();
        ctx.append(site, &[abs(flag, 8), put_label(end)]).unwrap();
        ctx.resolve().unwrap();

        assert_eq!(ctx.symbol(site).unwrap().references()[0].offset, 2);
        assert_eq!(
            ctx.result_bytes_string(site).unwrap(),
            "48 B8 78 56 34 12 00 00 00 00"
        );
        assert_eq!(ctx.address_of(end), Some(CODE + 10));
    }

    #[test]
    fn test_set_replaces_code_and_unbinds_labels() {
        let memory = host();
        let mut ctx = PatchContext::new(&memory);
        let site = ctx.define("site", CODE);
        let inner = ctx.label("inner");
        ctx.set(site, &[db(1), put_label(inner), db(2)]).unwrap();
        ctx.set(site, &[dq(0)]).unwrap();
        ctx.resolve_addresses();

        assert_eq!(ctx.symbol(site).unwrap().bytes().len(), 8);
        assert_eq!(ctx.address_of(inner), None);
    }

    #[test]
    fn test_symbol_kind_misuse() {
        let memory = host();
        let mut ctx = PatchContext::new(&memory);
        let site = ctx.define("site", CODE);
        let label = ctx.label("label");

        assert!(matches!(ctx.set(label, &[db(0x90)]), Err(Error::NotWritable(_))));
        assert!(matches!(ctx.set(site, &[put_label(site)]), Err(Error::NotALabel(_))));
        assert!(matches!(
            ctx.set(site, &[rip(SymbolId(99))]),
            Err(Error::UnknownSymbol(99))
        ));
        assert!(matches!(
            ctx.set(site, &[hex("4")]),
            Err(Error::InvalidHexLiteral { .. })
        ));
        // failed assignments leave the buffer untouched
        assert!(ctx.symbol(site).unwrap().bytes().is_empty());
    }

    #[test]
    fn test_allocation_failure_is_isolated() {
        let memory = host();
        memory.set_fail_allocations(true);
        let mut ctx = PatchContext::new(&memory);
        let jmp = ctx.define("jmp", CODE);
        let cave = ctx.alloc("cave", 16, CODE);
        let other = ctx.define("other", CODE + 0x20);
        let helper = ctx.define("helper", CODE + 0x80);
        ctx.set(jmp, &[db(0xE9), rip(cave)]).unwrap();
        ctx.set(cave, &[db(0xC3)]).unwrap();
        ctx.set(other, &[db(0xE8), rip(helper)]).unwrap();

        let err = ctx.resolve().unwrap_err();
        assert!(err.is_unresolved());
        assert_eq!(ctx.address_of(cave), None);
        assert!(!ctx.symbol(jmp).unwrap().is_finalized());
        assert!(ctx.symbol(other).unwrap().is_finalized());
        assert_eq!(
            ctx.unresolved(),
            &[
                Unresolved { owner: "jmp".to_string(), target: "cave".to_string() },
                Unresolved { owner: "cave".to_string(), target: "cave".to_string() },
            ]
        );
    }

    #[test]
    fn test_dependents_of_unfinalized_code_are_not_finalized() {
        let memory = host();
        let mut ctx = PatchContext::new(&memory);
        let jmp = ctx.define("jmp", CODE);
        let cave = ctx.alloc("cave", 16, CODE);
        let missing = ctx.define_at("missing", Cursor::NOT_FOUND);
        let back = ctx.label("back");
        let hook = ctx.define("hook", CODE + 0x40);
        ctx.set(jmp, &[db(0xE9), rip(cave)]).unwrap();
        ctx.set(cave, &[db(0xE9), rip(missing), put_label(back)]).unwrap();
        ctx.set(hook, &[db(0xE9), rip(back)]).unwrap();

        assert!(ctx.resolve().is_err());
        assert!(ctx.address_of(cave).is_some());
        assert!(!ctx.symbol(cave).unwrap().is_finalized());
        assert!(!ctx.symbol(jmp).unwrap().is_finalized());
        assert!(!ctx.symbol(hook).unwrap().is_finalized());
        assert_eq!(
            ctx.unresolved(),
            &[
                Unresolved { owner: "cave".to_string(), target: "missing".to_string() },
                Unresolved { owner: "jmp".to_string(), target: "cave".to_string() },
                Unresolved { owner: "hook".to_string(), target: "back".to_string() },
            ]
        );
    }

    #[test]
    fn test_dependents_spread_through_chains() {
        let memory = host();
        let mut ctx = PatchContext::new(&memory);
        let first = ctx.define("first", CODE);
        let second = ctx.define("second", CODE + 0x10);
        let third = ctx.define("third", CODE + 0x20);
        let far = ctx.define("far", 0x7FF0_0000_0000);
        ctx.set(first, &[db(0xE9), rip(second)]).unwrap();
        ctx.set(second, &[db(0xE9), rip(third)]).unwrap();
        ctx.set(third, &[db(0xE9), rip(far)]).unwrap();

        assert!(ctx.resolve().is_err());
        for id in [first, second, third] {
            assert!(!ctx.symbol(id).unwrap().is_finalized());
        }
        assert_eq!(ctx.unresolved().len(), 3);
    }

    #[test]
    fn test_out_of_range_values() {
        let memory = host();
        let mut ctx = PatchContext::new(&memory);
        let site = ctx.define("site", CODE);
        let far = ctx.define("far", 0x7FF0_0000_0000);
        ctx.set(site, &[db(0xE9), rip(far)]).unwrap();
        let narrow = ctx.define("narrow", CODE + 0x40);
        ctx.set(narrow, &[abs(far, 4)]).unwrap();

        assert!(ctx.resolve().is_err());
        assert!(!ctx.symbol(site).unwrap().is_finalized());
        assert!(!ctx.symbol(narrow).unwrap().is_finalized());
        assert_eq!(ctx.unresolved().len(), 2);
    }

    #[test]
    fn test_symbol_by_name_last_wins() {
        let memory = host();
        let mut ctx = PatchContext::new(&memory);
        ctx.define("dup", CODE);
        let second = ctx.define("dup", CODE + 1);
        assert_eq!(ctx.symbol_by_name("dup"), Some(second));
        assert_eq!(ctx.symbol_by_name("none"), None);
    }

    #[test]
    fn test_define_at_not_found_cursor() {
        let memory = host();
        let mut ctx = PatchContext::new(&memory);
        let site = ctx.define_at("site", Cursor::NOT_FOUND);
        ctx.set(site, &[db(0xC3)]).unwrap();
        assert!(ctx.resolve().is_err());
        assert_eq!(ctx.unresolved()[0].to_string(), "'site' (no address)");
    }

    #[test]
    fn test_pad_uses_configured_byte() {
        let memory = host();
        let config = EngineConfig::builder().pad_byte(0xCC).build();
        let mut ctx = PatchContext::with_config(&memory, config);
        let site = ctx.define("site", CODE);
        ctx.set(site, &[nop(2)]).unwrap();
        assert_eq!(ctx.result_bytes_string(site).unwrap(), "CC CC");
    }

    fn displacement_near_limits() -> impl Strategy<Value = i64> {
        prop_oneof![
            any::<i32>().prop_map(i64::from),
            (i32::MIN as i64 - 16)..=(i32::MIN as i64 + 16),
            (i32::MAX as i64 - 16)..=(i32::MAX as i64 + 16),
        ]
    }

    proptest! {
        #[test]
        fn test_relative_reference_matches_formula(
            site_address in 0x1_0000_0000u64..0x7FFF_0000_0000,
            prefix in 0usize..32,
            remaining in 4usize..16,
            delta in displacement_near_limits(),
        ) {
            let memory = BufferMemory::new();
            let mut ctx = PatchContext::new(&memory);
            let next = site_address + prefix as u64 + remaining as u64;
            let site = ctx.define("site", site_address);
            let target = ctx.define("target", (next as i64 + delta) as u64);
            ctx.set(site, &[bytes(&vec![0x90; prefix]), rip_with(target, remaining)]).unwrap();
            let resolved = ctx.resolve();

            let symbol = ctx.symbol(site).unwrap();
            match i32::try_from(delta) {
                Ok(displacement) => {
                    prop_assert!(resolved.is_ok());
                    prop_assert!(symbol.is_finalized());
                    prop_assert_eq!(&symbol.bytes()[prefix..prefix + 4], &displacement.to_le_bytes()[..]);
                }
                Err(_) => {
                    prop_assert!(resolved.is_err());
                    prop_assert!(!symbol.is_finalized());
                    prop_assert_eq!(
                        ctx.unresolved(),
                        &[Unresolved { owner: "site".to_string(), target: "target".to_string() }][..]
                    );
                }
            }
        }
    }
}
