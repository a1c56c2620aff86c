//! Compute device selection.
//!
//! The training entry points are generic over the burn backend; this module
//! only decides whether the accelerated backend or the CPU fallback is used.
//! Both paths run the same code.

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Device type for backend selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Device {
    /// CPU backend
    Cpu,
    /// GPU backend (when available)
    Gpu(usize),
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "CPU"),
            Device::Gpu(id) => write!(f, "GPU:{}", id),
        }
    }
}

static BACKEND_INFO: OnceLock<String> = OnceLock::new();

/// Picks the device a run executes on.
///
/// `accelerated_build` tells whether the binary was compiled with a GPU
/// backend. Without one, or without a detected GPU, the CPU path is used.
pub fn resolve_device(requested: Device, gpu_detected: bool, accelerated_build: bool) -> Device {
    match requested {
        Device::Cpu => Device::Cpu,
        Device::Gpu(id) if gpu_detected && accelerated_build => Device::Gpu(id),
        Device::Gpu(_) => Device::Cpu,
    }
}

/// Selects the best device for this machine and logs the decision
pub fn select_best_device(accelerated_build: bool) -> Device {
    let detected = is_gpu_available();
    let device = resolve_device(Device::Gpu(0), detected, accelerated_build);

    match (device, detected) {
        (Device::Gpu(id), _) => info!("GPU {id} detected, using accelerated backend"),
        (Device::Cpu, true) => {
            warn!("GPU detected but binary built without an accelerated backend, using CPU")
        }
        (Device::Cpu, false) => info!("No GPU detected, using CPU backend"),
    }

    let _ = BACKEND_INFO.set(format!("Using device: {device}"));
    device
}

/// Check if any GPU acceleration is available
pub fn is_gpu_available() -> bool {
    has_nvidia_gpu() || has_amd_gpu()
}

/// Get information about the selected backend
pub fn backend_info() -> String {
    BACKEND_INFO
        .get()
        .cloned()
        .unwrap_or_else(|| "Backend not initialized".to_string())
}

fn has_nvidia_gpu() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new("/proc/driver/nvidia/version").exists()
            || std::path::Path::new("/dev/nvidia0").exists()
    }

    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("nvidia-smi.exe")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        false
    }
}

fn has_amd_gpu() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new("/sys/module/amdgpu").exists()
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}
