use std::{fmt, str::FromStr};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use log::{info, warn};

use crate::TrainingError;

/// Device identifier accepted by `runtime.device`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    /// Metal, then CUDA, then CPU. `CANDLE_FORCE_CPU` pins the CPU.
    Auto,
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl FromStr for DeviceSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = match value.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|err| format!("invalid device ordinal in '{}': {}", s, err))?;
                (kind.to_string(), ordinal)
            }
            None => (value.clone(), 0),
        };
        match kind.as_str() {
            "auto" if !value.contains(':') => Ok(DeviceSpec::Auto),
            "cpu" if !value.contains(':') => Ok(DeviceSpec::Cpu),
            "cuda" | "gpu" => Ok(DeviceSpec::Cuda(ordinal)),
            "metal" | "mps" => Ok(DeviceSpec::Metal(ordinal)),
            _ => Err(format!(
                "unsupported device '{}' (expected auto, cpu, cuda[:N] or metal[:N])",
                s
            )),
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Auto => f.write_str("auto"),
            DeviceSpec::Cpu => f.write_str("cpu"),
            DeviceSpec::Cuda(ordinal) => write!(f, "cuda:{}", ordinal),
            DeviceSpec::Metal(ordinal) => write!(f, "metal:{}", ordinal),
        }
    }
}

/// Resolves `spec` to a live device. Explicit accelerators that fail to
/// initialise are an error; `auto` falls back to the CPU.
pub fn select_device(spec: DeviceSpec) -> Result<Device, TrainingError> {
    let device = match spec {
        DeviceSpec::Cpu => Device::Cpu,
        DeviceSpec::Cuda(ordinal) => Device::new_cuda(ordinal).map_err(|err| {
            TrainingError::unsupported(format!("cuda:{} is not usable: {}", ordinal, err))
        })?,
        DeviceSpec::Metal(ordinal) => Device::new_metal(ordinal).map_err(|err| {
            TrainingError::unsupported(format!("metal:{} is not usable: {}", ordinal, err))
        })?,
        DeviceSpec::Auto => auto_device(),
    };
    info!(
        "device selected: is_cuda={} is_metal={} is_cpu={}",
        device.is_cuda(),
        device.is_metal(),
        device.is_cpu()
    );
    Ok(device)
}

fn auto_device() -> Device {
    if std::env::var("CANDLE_FORCE_CPU").is_ok() {
        info!("CANDLE_FORCE_CPU set, using CPU backend");
        return Device::Cpu;
    }

    let cuda_available = cuda_is_available();
    let metal_available = metal_is_available();
    info!(
        "device detection: cuda_available={} metal_available={}",
        cuda_available, metal_available
    );

    if metal_available {
        match Device::new_metal(0) {
            Ok(device) => return device,
            Err(err) => warn!("failed to initialize metal device, falling back: {}", err),
        }
    }
    if cuda_available {
        match Device::new_cuda(0) {
            Ok(device) => return device,
            Err(err) => warn!("cuda reported available but initialization failed: {}", err),
        }
    }
    info!("no GPU backend available; using CPU");
    Device::Cpu
}
