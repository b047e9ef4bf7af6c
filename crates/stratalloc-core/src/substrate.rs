//! The shared substrate: the region allocator plus ownership of the
//! virtual-memory mappings backing it.
//!
//! Two mappings are made at startup and freed when the last reference
//! (process allocator or parked thread allocator) drops: the regions area
//! (reserve-only; chunks are committed as they first circulate) and the
//! handles area (committed and zero-filled up front; a zeroed handle word
//! is a valid free header).

#![allow(unsafe_code)]

use std::ops::Deref;

use crate::config::AllocatorConfig;
use crate::error::ConfigError;
use crate::region::{RegionAllocator, RegionPools, RegionSpecs};
use crate::vmem;

pub struct Substrate {
    allocator: RegionAllocator,
    regions_base: *mut u8,
    regions_mapped: usize,
    handles_base: *mut u8,
    handles_mapped: usize,
}

// SAFETY: the raw bases are owned mappings freed only on drop; the
// RegionAllocator inside is already Sync.
unsafe impl Send for Substrate {}
unsafe impl Sync for Substrate {}

impl Substrate {
    /// Reserves the address range described by `config` and builds the
    /// region allocator over it. `config` must be pre-validated.
    pub fn reserve(config: &AllocatorConfig) -> Result<Substrate, ConfigError> {
        let specs = RegionSpecs::new(
            &config.region_sizes_log2,
            &config.region_chunk_sizes_log2,
            config.control_block_size,
        );
        let pools = RegionPools::new(&specs, config.contention_split);

        let alignment = specs.max_chunk_alignment().max(vmem::page_size() as u64) as usize;
        let regions_size = specs.total_regions_size() as usize;
        let regions_mapped = crate::util::align_up(regions_size as u64, alignment as u64) as usize;
        let regions_base = vmem::alloc_aligned(regions_size, vmem::RESERVE, alignment);
        if regions_base.is_null() {
            return Err(ConfigError::ReservationFailed(vmem::last_error()));
        }

        let handles_mapped = specs.total_handles_size() as usize;
        let handles_base = vmem::alloc(handles_mapped, vmem::RESERVE_COMMIT);
        if handles_base.is_null() {
            let err = vmem::last_error();
            vmem::free(regions_base, regions_mapped);
            return Err(ConfigError::ReservationFailed(err));
        }

        log::debug!(
            "substrate reserved: {} regions, {} MiB address space, {} handles",
            specs.num_regions(),
            specs.total_regions_size() >> 20,
            specs.num_handles(),
        );

        // SAFETY: both mappings cover exactly what the specs require and
        // live until this Substrate drops; the handles area is committed
        // and zeroed by the OS.
        let allocator =
            unsafe { RegionAllocator::new(specs, pools, regions_base, handles_base, true) };
        Ok(Substrate {
            allocator,
            regions_base,
            regions_mapped,
            handles_base,
            handles_mapped,
        })
    }
}

impl Deref for Substrate {
    type Target = RegionAllocator;

    fn deref(&self) -> &RegionAllocator {
        &self.allocator
    }
}

impl Drop for Substrate {
    fn drop(&mut self) {
        vmem::free(self.regions_base, self.regions_mapped);
        vmem::free(self.handles_base, self.handles_mapped);
    }
}
