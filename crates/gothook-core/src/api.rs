//! Process-wide hook engine
//!
//! One engine per process, created on first use from the configuration named by
//! `GOTHOOK_CONFIG` (defaults otherwise). Everything here forwards to that engine; code
//! that wants its own instance should build a [`HookEngine`] directly.

use crate::engine::HookEngine;
use crate::rules::{HookRegistration, OriginalSink};
use gothook_common::{Address, HookConfig, PatchRecord, RefreshMode, RefreshReport, Result};
use once_cell::sync::Lazy;
use tracing::warn;

static ENGINE: Lazy<HookEngine> = Lazy::new(|| {
    let config = HookConfig::from_env().unwrap_or_else(|e| {
        warn!(target: "gothook::api", "ignoring configuration: {}", e);
        HookConfig::default()
    });
    HookEngine::with_config(config)
});

/// The process-wide engine
pub fn engine() -> &'static HookEngine {
    &ENGINE
}

pub fn register(pattern: &str, symbol: &str, replacement: Address) -> Result<HookRegistration> {
    ENGINE.register(pattern, symbol, replacement)
}

pub fn register_with_sink(
    pattern: &str,
    symbol: &str,
    replacement: Address,
    sink: OriginalSink,
) -> Result<HookRegistration> {
    ENGINE.register_rule(pattern, Some(symbol), replacement, Some(sink))
}

pub fn ignore(pattern: &str, symbol: Option<&str>) -> Result<()> {
    ENGINE.ignore(pattern, symbol)
}

pub fn refresh(is_async: bool) -> Result<()> {
    ENGINE.refresh(RefreshMode::from_async_flag(is_async))
}

pub fn refresh_now() -> Result<RefreshReport> {
    ENGINE.refresh_now()
}

pub fn clear() {
    ENGINE.clear()
}

pub fn set_debug(enabled: bool) {
    ENGINE.set_debug(enabled)
}

pub fn set_fault_protection(enabled: bool) {
    ENGINE.set_fault_protection(enabled)
}

pub fn patches() -> Vec<PatchRecord> {
    ENGINE.patches()
}
