//! Per-device property cache
//!
//! Occupancy and SM-efficiency analyses need hardware limits (threads,
//! registers and shared memory per SM, clock rate). Properties are queried
//! from the vendor exactly once, the first time a kernel is seen on a
//! device, and cached for the process lifetime.

use serde::{Deserialize, Serialize};

use crate::concurrent_map::SplayMap;
use crate::vendor::VendorResult;

/// Hardware limits of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProperties {
    pub num_threads_per_warp: u32,
    pub sm_count: u32,
    pub sm_threads: u32,
    pub sm_registers: u32,
    pub sm_shared_memory: u32,
    pub sm_blocks: u32,
    /// Core clock in kHz, as the vendor reports it
    pub sm_clock_rate_khz: u64,
}

impl DeviceProperties {
    /// Core clock in cycles per nanosecond.
    pub fn clock_per_ns(&self) -> f64 {
        self.sm_clock_rate_khz as f64 / 1_000_000.0
    }
}

/// Device-id keyed property cache.
pub struct DeviceMap {
    map: SplayMap<u32, DeviceProperties>,
}

impl DeviceMap {
    pub fn new() -> Self {
        DeviceMap {
            map: SplayMap::new(),
        }
    }

    pub fn get(&self, device_id: u32) -> Option<DeviceProperties> {
        self.map.get(&device_id)
    }

    /// Return the cached properties, querying `query` once on first sight
    /// of the device. A failed query is not cached; the next activity on
    /// the device retries. The query runs outside the map lock; when two
    /// completion threads race the same first sight, the first insert wins
    /// and both observe it.
    pub fn get_or_query(
        &self,
        device_id: u32,
        query: impl FnOnce() -> VendorResult<DeviceProperties>,
    ) -> Option<DeviceProperties> {
        if let Some(properties) = self.map.get(&device_id) {
            return Some(properties);
        }
        match query() {
            Ok(properties) => Some(self.map.get_or_insert_with(device_id, || properties)),
            Err(err) => {
                tracing::warn!(device_id, detail = %err.detail, "device property query failed");
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) fn test_properties() -> DeviceProperties {
    // Volta-class limits
    DeviceProperties {
        num_threads_per_warp: 32,
        sm_count: 80,
        sm_threads: 2048,
        sm_registers: 65536,
        sm_shared_memory: 98304,
        sm_blocks: 32,
        sm_clock_rate_khz: 1_530_000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vendor::VendorError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_query_runs_once() {
        let map = DeviceMap::new();
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let props = map.get_or_query(0, || {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok(test_properties())
            });
            assert_eq!(props, Some(test_properties()));
        }
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_failed_query_is_retried() {
        let map = DeviceMap::new();
        let failed = map.get_or_query(1, || {
            Err(VendorError {
                function: "device_properties",
                detail: "device lost".into(),
            })
        });
        assert!(failed.is_none());
        assert!(map.get(1).is_none());

        let ok = map.get_or_query(1, || Ok(test_properties()));
        assert!(ok.is_some());
    }

    #[test]
    fn test_devices_are_independent() {
        let map = DeviceMap::new();
        let mut gpu1 = test_properties();
        gpu1.sm_count = 40;
        map.get_or_query(0, || Ok(test_properties()));
        map.get_or_query(1, || Ok(gpu1));
        assert_eq!(map.get(0).map(|p| p.sm_count), Some(80));
        assert_eq!(map.get(1).map(|p| p.sm_count), Some(40));
    }
}
