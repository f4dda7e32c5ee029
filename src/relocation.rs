//! Cubin-id keyed symbol relocation
//!
//! Maps a vendor cubin id to its load-module id and relocated symbol
//! vector, and composes normalized ips from (cubin id, function index,
//! pc offset) triples. Descriptors live for the process lifetime: module
//! unload does not evict, because activity records for a kernel routinely
//! arrive after its module is gone.

use std::sync::Arc;

use crate::concurrent_map::SplayMap;
use crate::cubin_symbols::SymbolVector;
use crate::ip::{LoadModuleId, NormalizedIp};

/// Immutable identity of one loaded cubin.
#[derive(Debug)]
pub struct CubinDescriptor {
    pub cubin_id: u32,
    pub lm_id: LoadModuleId,
    pub symbols: SymbolVector,
}

/// cubin-id → descriptor map.
pub struct RelocationMap {
    map: SplayMap<u32, Arc<CubinDescriptor>>,
}

impl RelocationMap {
    pub fn new() -> Self {
        RelocationMap {
            map: SplayMap::new(),
        }
    }

    /// Register a cubin's symbols. Re-registering an id keeps the first
    /// descriptor; the driver reuses module ids only for identical reloads.
    pub fn register(&self, cubin_id: u32, lm_id: LoadModuleId, symbols: SymbolVector) {
        self.map.get_or_insert_with(cubin_id, || {
            Arc::new(CubinDescriptor {
                cubin_id,
                lm_id,
                symbols,
            })
        });
    }

    pub fn lookup(&self, cubin_id: u32) -> Option<Arc<CubinDescriptor>> {
        self.map.get(&cubin_id)
    }

    /// Compose the normalized ip of `function_index + offset` inside a
    /// cubin. An unknown cubin yields the null ip; the function index is
    /// trusted (the vendor validated it) and an out-of-range index resolves
    /// through the symbol vector's zero entry.
    pub fn transform(&self, cubin_id: u32, function_index: u32, offset: u64) -> NormalizedIp {
        match self.map.get(&cubin_id) {
            Some(descriptor) => NormalizedIp::new(
                descriptor.lm_id,
                descriptor.symbols.pc(function_index) + offset,
            ),
            None => NormalizedIp::null(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for RelocationMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) fn test_symbols(pcs: &[u64]) -> SymbolVector {
    SymbolVector::for_tests(pcs.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_known_cubin() {
        let map = RelocationMap::new();
        map.register(7, 3, test_symbols(&[0, 0x100, 0x400]));

        assert_eq!(map.transform(7, 1, 0), NormalizedIp::new(3, 0x100));
        assert_eq!(map.transform(7, 2, 0x40), NormalizedIp::new(3, 0x440));
    }

    #[test]
    fn test_transform_unknown_cubin_is_null() {
        let map = RelocationMap::new();
        assert_eq!(map.transform(99, 0, 0x10), NormalizedIp::null());
    }

    #[test]
    fn test_transform_is_deterministic() {
        let map = RelocationMap::new();
        map.register(7, 3, test_symbols(&[0x100]));
        let a = map.transform(7, 0, 0);
        let b = map.transform(7, 0, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_reregistration_is_noop() {
        let map = RelocationMap::new();
        map.register(7, 3, test_symbols(&[0x100]));
        map.register(7, 9, test_symbols(&[0x999]));
        assert_eq!(map.transform(7, 0, 0), NormalizedIp::new(3, 0x100));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_out_of_range_function_index() {
        let map = RelocationMap::new();
        map.register(7, 3, test_symbols(&[0x100]));
        // zero entry: offset-only ip in the right module
        assert_eq!(map.transform(7, 5, 0x20), NormalizedIp::new(3, 0x20));
    }
}
