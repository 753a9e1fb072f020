//! Standard locations for spindle configuration files

use std::path::PathBuf;

/// Directory holding spindle configuration
///
/// Returns: `~/.config/spindle` (platform config dir), or `./spindle` when the
/// platform reports none.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("spindle")
}

/// Default dispatcher config file: `{config_dir}/dispatcher.yaml`
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("dispatcher.yaml")
}
