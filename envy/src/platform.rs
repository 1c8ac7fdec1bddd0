use std::collections::BTreeMap;

use once_cell::sync::Lazy;

/// Host facts surfaced to recipe callbacks.
///
/// Recipes read these through the template values and the run environment as
/// `ENVY_PLATFORM`, `ENVY_ARCH`, `ENVY_PLATFORM_ARCH` and `ENVY_EXE_EXT`.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub platform: &'static str,
    pub arch: &'static str,
    pub platform_arch: String,
    pub exe_ext: &'static str,
}

pub fn host() -> &'static HostInfo {
    static HOST: Lazy<HostInfo> = Lazy::new(|| HostInfo {
        platform: std::env::consts::OS,
        arch: std::env::consts::ARCH,
        platform_arch: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        exe_ext: std::env::consts::EXE_SUFFIX,
    });
    &HOST
}

impl HostInfo {
    /// The four `ENVY_*` variables, as template values and run environment.
    pub fn vars(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("ENVY_PLATFORM".to_string(), self.platform.to_string()),
            ("ENVY_ARCH".to_string(), self.arch.to_string()),
            ("ENVY_PLATFORM_ARCH".to_string(), self.platform_arch.clone()),
            ("ENVY_EXE_EXT".to_string(), self.exe_ext.to_string()),
        ])
    }
}
