use anyhow::{bail, Context};
use corespace::{Architecture, SpaceDescriptor};
use serde::Serialize;

/// Parse an `--arch` value, defaulting to the host architecture.
pub fn parse_arch(arch: Option<&str>) -> anyhow::Result<Architecture> {
    match arch {
        None => Ok(Architecture::host()),
        Some(name) => name.parse::<Architecture>().with_context(|| {
            format!("unknown architecture: {name} (expected x86, x86_64, aarch64, ppc, sparc or hppa)")
        }),
    }
}

/// Parse an address given as hex (`0x...`) or decimal.
pub fn parse_address(value: &str) -> anyhow::Result<usize> {
    let cleaned = value.replace('_', "");
    let parsed = match cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => cleaned.parse::<usize>(),
    };

    match parsed {
        Ok(address) => Ok(address),
        Err(_) => bail!("invalid address: {value}"),
    }
}

/// One space, ready for display.
#[derive(Debug, Serialize)]
pub struct SpaceRow {
    pub space: String,
    pub base: String,
    pub end: String,
    pub size: usize,
    pub protection: String,
}

impl From<&SpaceDescriptor> for SpaceRow {
    fn from(space: &SpaceDescriptor) -> Self {
        SpaceRow {
            space: space.id.to_string(),
            base: format!("{:#010x}", space.base),
            end: format!("{:#010x}", space.end()),
            size: space.size,
            protection: space.protection.to_string(),
        }
    }
}

/// Human-readable size: whole megabytes where possible, otherwise kilobytes.
pub fn format_size(size: usize) -> String {
    if size >= 1 << 20 {
        format!("{} MB", size >> 20)
    } else {
        format!("{} KB", size >> 10)
    }
}
