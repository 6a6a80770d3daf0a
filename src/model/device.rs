//! Compute device selection

use anyhow::{anyhow, Result};
use tch::Device;

/// Parse `auto`, `cpu`, `cuda` or `cuda:N` into a device.
///
/// `auto` picks the first CUDA device when one is available.
pub fn resolve_device(spec: &str) -> Result<Device> {
    let spec = spec.trim().to_ascii_lowercase();
    let device = match spec.as_str() {
        "auto" => Device::cuda_if_available(),
        "cpu" => Device::Cpu,
        "cuda" | "gpu" => require_cuda(0)?,
        other => match other.strip_prefix("cuda:") {
            Some(index) => {
                let index: usize = index
                    .parse()
                    .map_err(|_| anyhow!("Invalid CUDA device index in '{}'", other))?;
                require_cuda(index)?
            }
            None => return Err(anyhow!("Unknown device '{}'", other)),
        },
    };

    if device == Device::Cpu {
        configure_cpu_threads();
    }
    tracing::info!("Using device {:?}", device);
    Ok(device)
}

fn require_cuda(index: usize) -> Result<Device> {
    let available = tch::Cuda::device_count() as usize;
    if index >= available {
        return Err(anyhow!(
            "CUDA device {} requested but {} device(s) available",
            index,
            available
        ));
    }
    Ok(Device::Cuda(index))
}

/// Use every physical core for CPU kernels
pub fn configure_cpu_threads() {
    let threads = num_cpus::get_physical().max(1);
    tch::set_num_threads(threads as i32);
    tracing::debug!("CPU kernels use {} threads", threads);
}
