//! Bundles the three collaborators every adapter needs: the immutable
//! geometry table, the allocator, and the device handle used for erase
//! ioctls. Mirrors the original's single `nvm` object, split along the
//! lines the Design Notes call for (geometry is a read-only table; the
//! allocator is its own synchronized component).

use crate::allocator::{AllocPolicy, Allocator};
use crate::error::Result;
use crate::geometry::{DeviceGeometrySource, Geometry};

pub struct NvmApi {
    pub geometry: Geometry,
    pub allocator: Allocator,
    pub device: Box<dyn DeviceGeometrySource>,
}

impl NvmApi {
    pub fn open(device: Box<dyn DeviceGeometrySource>, policy: AllocPolicy) -> Result<Self> {
        let geometry = Geometry::open(device.as_ref())?;
        let allocator = Allocator::new(&geometry, policy);
        Ok(NvmApi {
            geometry,
            allocator,
            device,
        })
    }
}
