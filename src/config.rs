//! Runtime configuration types.

use std::path::Path;

use serde::{Deserialize, Deserializer};

use crate::error::{Result, RuntimeError};
use crate::isa::InstructionSet;

const KB: usize = 1024;
const MB: usize = KB * 1024;
const GB: usize = MB * 1024;

/// Heap sizes are whole kilobytes.
pub const HEAP_SIZE_DIVISOR: usize = KB;

/// GC mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GcMode {
    /// Stop-the-world GC
    #[default]
    Stw,
    /// Mark concurrently with the mutators, pausing only for root scans
    Concurrent,
}

/// Output format for runtime statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatsFormat {
    #[default]
    Human,
    Json,
}

/// Runtime configuration for the VM
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Instruction set compiled code is generated for
    pub isa: InstructionSet,
    pub gc_mode: GcMode,
    /// Whether GC is enabled (default: true)
    pub gc_enabled: bool,
    pub gc_stats: bool,
    /// Bytes allocated since the last collection that trigger the next one
    #[serde(deserialize_with = "deserialize_memory_size")]
    pub gc_threshold: usize,
    /// Hard limit on heap size in bytes (None = unlimited)
    #[serde(deserialize_with = "deserialize_optional_memory_size")]
    pub heap_limit: Option<usize>,
    /// Maximum number of managed frames per thread
    pub max_stack_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            isa: InstructionSet::runtime(),
            gc_mode: GcMode::Stw,
            gc_enabled: true,
            gc_stats: false,
            gc_threshold: MB,
            heap_limit: None,
            max_stack_depth: 1024,
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: RuntimeConfig = toml::from_str(text).map_err(|e| RuntimeError::Parse {
            what: "runtime config".to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| RuntimeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_stack_depth == 0 {
            return Err(RuntimeError::InvalidConfig(
                "max_stack_depth must be at least 1".to_string(),
            ));
        }
        if self.gc_threshold == 0 {
            return Err(RuntimeError::InvalidConfig(
                "gc_threshold must be non-zero".to_string(),
            ));
        }
        if let Some(limit) = self
            .heap_limit
            .filter(|&limit| limit == 0 || limit % HEAP_SIZE_DIVISOR != 0)
        {
            return Err(RuntimeError::InvalidConfig(format!(
                "heap_limit {} is not a non-zero multiple of {}",
                limit, HEAP_SIZE_DIVISOR
            )));
        }
        Ok(())
    }
}

/// Parse a memory size such as `512`, `64k`, `16M` or `2g`.
///
/// The result must be a multiple of `div`. Returns `None` for malformed
/// input. A bare number that overflows reads as `usize::MAX`, which only
/// passes a divisor of 1; a suffixed one saturates to the largest 1 KiB
/// multiple.
pub fn parse_memory_option(s: &str, div: usize) -> Option<usize> {
    let digits_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if digits_end == 0 {
        return None;
    }
    let mut value: usize = s[..digits_end].parse().unwrap_or(usize::MAX);

    let suffix = &s[digits_end..];
    if !suffix.is_empty() {
        let multiplier = match suffix {
            "k" | "K" => KB,
            "m" | "M" => MB,
            "g" | "G" => GB,
            _ => return None,
        };
        value = value
            .checked_mul(multiplier)
            .unwrap_or(usize::MAX & !(KB - 1));
    }

    if div == 0 || value % div != 0 {
        return None;
    }
    Some(value)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MemorySize {
    Bytes(usize),
    Text(String),
}

impl MemorySize {
    fn into_bytes<E: serde::de::Error>(self) -> std::result::Result<usize, E> {
        match self {
            MemorySize::Bytes(n) => Ok(n),
            MemorySize::Text(s) => parse_memory_option(&s, 1)
                .ok_or_else(|| E::custom(format!("invalid memory size `{}`", s))),
        }
    }
}

fn deserialize_memory_size<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    MemorySize::deserialize(deserializer)?.into_bytes()
}

fn deserialize_optional_memory_size<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<MemorySize>::deserialize(deserializer)?
        .map(MemorySize::into_bytes)
        .transpose()
}
