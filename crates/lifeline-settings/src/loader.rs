//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`LifelineSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `LIFELINE_*` environment variable overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use lifeline_core::RiskLevel;
use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::LifelineSettings;

/// Resolve the path to the settings file (`~/.lifeline/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".lifeline").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<LifelineSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a value that fails
/// [`validate`] is an error.
pub fn load_settings_from_path(path: &Path) -> Result<LifelineSettings> {
    let mut settings = read_file_layer(path)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

fn read_file_layer(path: &Path) -> Result<LifelineSettings> {
    let defaults = serde_json::to_value(LifelineSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid or out-of-range values are logged and ignored.
pub fn apply_env_overrides(settings: &mut LifelineSettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_u16("LIFELINE_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_string("LIFELINE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u64("LIFELINE_HEARTBEAT_INTERVAL_MS", 1_000, 600_000) {
        settings.server.heartbeat_interval_ms = v;
    }

    // ── Classifier ──────────────────────────────────────────────────
    if let Some(v) = read_env_bool("LIFELINE_CLASSIFIER_ENABLED") {
        settings.classifier.enabled = v;
    }
    if let Some(v) = read_env_string("LIFELINE_CLASSIFIER_URL") {
        settings.classifier.base_url = v;
    }
    if let Some(v) = read_env_string("LIFELINE_CLASSIFIER_MODEL") {
        settings.classifier.model = v;
    }
    if let Some(v) = read_env_u64("LIFELINE_CLASSIFIER_TIMEOUT_MS", 50, 60_000) {
        settings.classifier.timeout_ms = v;
    }
    if let Some(v) = read_env_usize("LIFELINE_CONTEXT_WINDOW", 0, 50) {
        settings.classifier.context_window = v;
    }

    // ── Detection ───────────────────────────────────────────────────
    if let Some(v) = read_env_string("LIFELINE_ESCALATION_THRESHOLD") {
        match v.parse::<RiskLevel>() {
            Ok(level) => settings.detection.escalation_threshold = level,
            Err(e) => tracing::warn!(key = "LIFELINE_ESCALATION_THRESHOLD", error = %e, "ignoring"),
        }
    }

    // ── Delivery ────────────────────────────────────────────────────
    if let Some(v) = read_env_usize("LIFELINE_DELIVERY_QUEUE", 1, 1_000_000) {
        settings.delivery.queue_size = v;
    }
    if let Some(v) = read_env_u64("LIFELINE_DELIVERY_RETRIES", 0, 20) {
        settings.delivery.max_retries = v as u32;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("LIFELINE_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

/// Reject settings the engine cannot run with.
pub fn validate(settings: &LifelineSettings) -> Result<()> {
    let d = &settings.detection;
    for (name, value) in [
        ("detection.keywordConfidence", d.keyword_confidence),
        ("detection.keywordConfidenceStep", d.keyword_confidence_step),
        ("detection.patternConfidence", d.pattern_confidence),
        ("detection.agreementBonus", d.agreement_bonus),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(SettingsError::InvalidValue(format!("{name} must be within [0, 1], got {value}")));
        }
    }
    if d.escalation_threshold == RiskLevel::None {
        return Err(SettingsError::InvalidValue(
            "detection.escalationThreshold cannot be none".into(),
        ));
    }
    for (tier, list) in d.keywords.iter() {
        if list.iter().any(|t| t.trim().is_empty()) {
            return Err(SettingsError::InvalidValue(format!("empty keyword in tier {tier}")));
        }
    }
    for rule in &d.patterns {
        if rule.id.trim().is_empty() {
            return Err(SettingsError::InvalidValue("pattern with empty id".into()));
        }
        if rule.tier == RiskLevel::None {
            return Err(SettingsError::InvalidValue(format!("pattern {} has tier none", rule.id)));
        }
    }

    let c = &settings.classifier;
    if c.enabled && c.base_url.trim().is_empty() {
        return Err(SettingsError::InvalidValue("classifier.baseUrl is required when enabled".into()));
    }
    if c.timeout_ms == 0 {
        return Err(SettingsError::InvalidValue("classifier.timeoutMs must be positive".into()));
    }
    if c.breaker_threshold == 0 {
        return Err(SettingsError::InvalidValue("classifier.breakerThreshold must be positive".into()));
    }

    if settings.delivery.queue_size == 0 {
        return Err(SettingsError::InvalidValue("delivery.queueSize must be positive".into()));
    }
    if settings.delivery.base_delay_ms > settings.delivery.max_delay_ms {
        return Err(SettingsError::InvalidValue(
            "delivery.baseDelayMs exceeds delivery.maxDelayMs".into(),
        ));
    }
    if settings.engine.mailbox_size == 0 {
        return Err(SettingsError::InvalidValue("engine.mailboxSize must be positive".into()));
    }
    Ok(())
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}
