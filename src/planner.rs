//! GPU block sizing.
//!
//! cupSODA runs one simulation per GPU thread. Each thread keeps its state
//! vector (one float per species plus time) in shared memory, which caps the
//! threads a block can hold. The planner turns that limit into a block count.

use log::debug;

/// Threads per block cupSODA is tuned for.
pub const DEFAULT_THREADS_PER_BLOCK: usize = 32;

const BYTES_PER_FLOAT: usize = 4;

/// Per-block limits of a GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub shared_memory_per_block: usize,
    pub max_threads_per_block: usize,
}

/// Source of device limits.
pub trait DeviceQuery {
    /// Limits of GPU `gpu`, or `None` when they cannot be queried.
    fn limits(&self, gpu: usize) -> Option<DeviceLimits>;
}

/// Device query used without GPU introspection; plans with the default block size.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticDevice;

impl DeviceQuery for StaticDevice {
    fn limits(&self, _gpu: usize) -> Option<DeviceLimits> {
        None
    }
}

/// Device query backed by the CUDA driver API.
#[cfg(feature = "cuda")]
#[derive(Debug, Clone, Copy, Default)]
pub struct CudaDevice;

#[cfg(feature = "cuda")]
impl DeviceQuery for CudaDevice {
    fn limits(&self, gpu: usize) -> Option<DeviceLimits> {
        use cudarc::driver::{sys::CUdevice_attribute, CudaContext};

        let ctx = match CudaContext::new(gpu) {
            Ok(ctx) => ctx,
            Err(e) => {
                log::warn!("Could not open CUDA device {gpu}, using default block size: {e:?}");
                return None;
            }
        };
        let shared = ctx
            .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK)
            .ok()?;
        let threads = ctx
            .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)
            .ok()?;
        Some(DeviceLimits {
            shared_memory_per_block: usize::try_from(shared).ok()?,
            max_threads_per_block: usize::try_from(threads).ok()?,
        })
    }
}

/// The device query compiled into this build.
pub fn default_device() -> Box<dyn DeviceQuery> {
    #[cfg(feature = "cuda")]
    {
        Box::new(CudaDevice)
    }
    #[cfg(not(feature = "cuda"))]
    {
        Box::new(StaticDevice)
    }
}

/// Threads per block for a network with `n_species` species.
pub fn threads_per_block(n_species: usize, limits: Option<DeviceLimits>) -> usize {
    let threads = match limits {
        None => DEFAULT_THREADS_PER_BLOCK,
        Some(limits) => {
            let memory_per_thread = (n_species + 1) * BYTES_PER_FLOAT;
            let fit = limits.shared_memory_per_block / memory_per_thread;
            fit.min(limits.max_threads_per_block)
                .min(DEFAULT_THREADS_PER_BLOCK)
        }
    };
    threads.max(1)
}

/// Number of GPU blocks to launch for `n_sims` simulations.
///
/// An explicit `n_blocks` is returned unchanged. Otherwise the block count is
/// `ceil(n_sims / threads_per_block)`.
pub fn plan_blocks(
    n_sims: usize,
    n_species: usize,
    n_blocks: Option<usize>,
    gpu: usize,
    device: &dyn DeviceQuery,
) -> usize {
    if let Some(n_blocks) = n_blocks {
        return n_blocks;
    }
    let threads = threads_per_block(n_species, device.limits(gpu));
    let blocks = n_sims.div_ceil(threads);
    debug!("Planned {blocks} blocks of {threads} threads for {n_sims} simulations");
    blocks
}
