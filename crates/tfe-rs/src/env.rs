use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

static TFE_ASYNC: OnceLock<bool> = OnceLock::new();
static TFE_PLACEMENT_POLICY: OnceLock<Option<String>> = OnceLock::new();
static TFE_XLA_DUMP_DIR: OnceLock<Option<PathBuf>> = OnceLock::new();
static TFE_XLA_DUMP_SNAPSHOTS: OnceLock<bool> = OnceLock::new();
static TFE_COMPILE_CACHE_CAPACITY: OnceLock<usize> = OnceLock::new();
static TFE_PASS_STATS: OnceLock<bool> = OnceLock::new();

const DEFAULT_COMPILE_CACHE_CAPACITY: usize = 64;

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn bool_flag(cell: &OnceLock<bool>, name: &str) -> bool {
    *cell.get_or_init(|| match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

/// Default async mode for contexts that do not set it explicitly.
pub(crate) fn async_default() -> bool {
    bool_flag(&TFE_ASYNC, "TFE_ASYNC")
}

/// Raw placement policy name from `TFE_PLACEMENT_POLICY`, if set.
pub(crate) fn placement_policy_name() -> Option<&'static str> {
    TFE_PLACEMENT_POLICY
        .get_or_init(|| match env::var("TFE_PLACEMENT_POLICY") {
            Ok(value) if !value.trim().is_empty() => Some(value.trim().to_ascii_lowercase()),
            _ => None,
        })
        .as_deref()
}

pub(crate) fn xla_dump_dir() -> Option<&'static PathBuf> {
    TFE_XLA_DUMP_DIR
        .get_or_init(|| match env::var("TFE_XLA_DUMP_DIR") {
            Ok(value) if !value.trim().is_empty() => Some(PathBuf::from(value.trim())),
            _ => None,
        })
        .as_ref()
}

pub(crate) fn xla_dump_snapshots() -> bool {
    bool_flag(&TFE_XLA_DUMP_SNAPSHOTS, "TFE_XLA_DUMP_SNAPSHOTS")
}

pub(crate) fn compile_cache_capacity() -> usize {
    *TFE_COMPILE_CACHE_CAPACITY.get_or_init(|| {
        env::var("TFE_COMPILE_CACHE_CAPACITY")
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_COMPILE_CACHE_CAPACITY)
    })
}

pub(crate) fn pass_stats_enabled() -> bool {
    bool_flag(&TFE_PASS_STATS, "TFE_PASS_STATS")
}
