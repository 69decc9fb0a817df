use crate::error::Result;
use std::path::Path;
use tch::Device;

// A simple wrapper around File::open adding details about the
// problematic file.
pub(crate) fn file_open<P: AsRef<Path>>(path: P) -> Result<std::fs::File> {
    std::fs::File::open(path.as_ref()).map_err(|e| {
        let context = format!("error opening {:?}: {e}", path.as_ref().to_string_lossy());
        std::io::Error::new(e.kind(), context).into()
    })
}

/// Picks a device for each of the networks (`backbone`, `vae`,
/// `feature_extractor`), keeping the ones listed in `cpu` on the CPU. `all`
/// puts everything on the CPU.
#[derive(Debug, Clone)]
pub struct DeviceSetup {
    accelerator_device: Device,
    cpu: Vec<String>,
}

impl DeviceSetup {
    pub fn new(cpu: Vec<String>) -> Self {
        let accelerator_device =
            if tch::utils::has_mps() { Device::Mps } else { Device::cuda_if_available() };
        Self { accelerator_device, cpu }
    }

    pub fn get(&self, name: &str) -> Device {
        if self.cpu.iter().any(|c| c == "all" || c == name) {
            Device::Cpu
        } else {
            self.accelerator_device
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_overrides() {
        let setup = DeviceSetup::new(vec!["vae".to_string()]);
        assert_eq!(setup.get("vae"), Device::Cpu);
        let setup = DeviceSetup::new(vec!["all".to_string()]);
        assert_eq!(setup.get("backbone"), Device::Cpu);
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = file_open("/nonexistent/frames.json").unwrap_err();
        assert!(err.to_string().contains("frames.json"));
    }
}
