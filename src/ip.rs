//! Normalized instruction pointers for device code
//!
//! Every device symbol, once relocated, is expressed as a
//! (load-module id, offset) pair instead of an absolute address. The pair is
//! stable across runs because load-module ids are assigned from the
//! content-addressed cubin file name, not from where the driver happened to
//! map the image.

use serde::{Deserialize, Serialize};

/// Identifier of a load module registered with the embedding tool.
pub type LoadModuleId = u16;

/// A (load-module id, offset) pair naming one device instruction.
///
/// Immutable once produced. The all-zero value is the "unknown" ip used when
/// a cubin or symbol cannot be resolved; consumers treat it as
/// unattributable rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NormalizedIp {
    /// Load module the instruction belongs to
    pub lm_id: LoadModuleId,
    /// Byte offset of the instruction within the module image
    pub offset: u64,
}

impl NormalizedIp {
    /// Create a normalized ip
    pub fn new(lm_id: LoadModuleId, offset: u64) -> Self {
        NormalizedIp { lm_id, offset }
    }

    /// The "unknown" ip produced when resolution fails
    pub fn null() -> Self {
        NormalizedIp::default()
    }

    /// True when this ip refers to a registered module
    pub fn is_resolved(&self) -> bool {
        self.lm_id != 0 || self.offset != 0
    }

    /// Return a copy advanced by an instruction offset within the function
    pub fn with_pc_offset(self, pc_offset: u64) -> Self {
        NormalizedIp {
            lm_id: self.lm_id,
            offset: self.offset + pc_offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_ip_is_unresolved() {
        let ip = NormalizedIp::null();
        assert!(!ip.is_resolved());
        assert_eq!(ip.lm_id, 0);
        assert_eq!(ip.offset, 0);
    }

    #[test]
    fn test_pc_offset_composition() {
        let base = NormalizedIp::new(3, 0x400);
        let ip = base.with_pc_offset(0x40);
        assert_eq!(ip, NormalizedIp::new(3, 0x440));
        // base is unchanged
        assert_eq!(base.offset, 0x400);
    }

    #[test]
    fn test_resolved_with_zero_offset() {
        // Module id alone is enough to count as resolved (function at
        // section offset 0 in module 1 is legitimate)
        assert!(NormalizedIp::new(1, 0).is_resolved());
    }

    #[test]
    fn test_serde_round_trip() {
        let ip = NormalizedIp::new(7, 0x1234);
        let json = serde_json::to_string(&ip).unwrap();
        let back: NormalizedIp = serde_json::from_str(&json).unwrap();
        assert_eq!(ip, back);
    }
}
