use std::path::PathBuf;

/// Default install location of the vendor single-op library.
pub const VENDOR_LIBRARY_PATH: &str = "/vendor/lib64/libai_single_op.so";

/// Runtime configuration of the accelerator backend.
#[derive(Debug, Clone)]
pub struct SopConfig {
    /// Driver libraries tried in order; the first that loads wins.
    pub library_paths: Vec<PathBuf>,
    /// Alignment applied to a tensor's byte size before checking whether an
    /// existing memory object can be reused.
    pub alignment: usize,
    /// When false the backend never loads the driver and every operator falls
    /// back to the generic backend.
    pub enabled: bool,
}

impl Default for SopConfig {
    fn default() -> Self {
        Self {
            library_paths: vec![
                PathBuf::from(VENDOR_LIBRARY_PATH),
                PathBuf::from("libai_single_op.so"),
            ],
            alignment: 32,
            enabled: true,
        }
    }
}

impl SopConfig {
    /// Defaults overridden by `IR_SOP_LIBRARY` (driver path) and
    /// `IR_SOP_DISABLE` (`1` or `true` turns acceleration off).
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var("IR_SOP_LIBRARY").ok(),
            std::env::var("IR_SOP_DISABLE").ok(),
        )
    }

    fn from_vars(library: Option<String>, disable: Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(path) = library.filter(|p| !p.is_empty()) {
            config.library_paths = vec![PathBuf::from(path)];
        }
        if let Some(flag) = disable {
            let flag = flag.trim().to_ascii_lowercase();
            if flag == "1" || flag == "true" {
                config.enabled = false;
            }
        }
        config
    }

    /// Configuration that never touches a driver.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}
