//! Reading the settings file and applying environment overrides.
//!
//! [`load_settings_from_path`] serializes the defaults to JSON, merges the
//! file over them with [`merge_layers`], deserializes, applies `TETHER_*`
//! variables and validates. A missing file is not an error.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::TetherSettings;

/// Env var naming an explicit settings file.
pub const SETTINGS_PATH_ENV: &str = "TETHER_SETTINGS";

/// Where the settings file lives.
///
/// `$TETHER_SETTINGS` when set, else `~/.tether/settings.json`, else
/// `.tether/settings.json` relative to the working directory.
pub fn settings_path() -> PathBuf {
    if let Some(explicit) = std::env::var_os(SETTINGS_PATH_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(explicit);
    }
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".tether")
        .join("settings.json")
}

/// [`load_settings_from_path`] on [`settings_path`].
pub fn load_settings() -> Result<TetherSettings> {
    load_settings_from_path(&settings_path())
}

/// Defaults, then the file at `path`, then the process environment.
///
/// Unreadable or malformed files and failed validation are errors.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Defaults with the file at `path` merged over them. No env, no validation.
pub fn load_file_layer(path: &Path) -> Result<TetherSettings> {
    let base = serde_json::to_value(TetherSettings::default())?;
    if !path.exists() {
        debug!(path = %path.display(), "no settings file");
        return Ok(serde_json::from_value(base)?);
    }

    debug!(path = %path.display(), "reading settings file");
    let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let overlay: Value = serde_json::from_str(&text)?;
    Ok(serde_json::from_value(merge_layers(base, overlay))?)
}

/// Merge `overlay` into `base`.
///
/// Objects merge per key, recursively. Any other overlay value replaces the
/// base value, except `null`, which leaves the base untouched.
pub fn merge_layers(base: Value, overlay: Value) -> Value {
    let (mut into, from) = match (base, overlay) {
        (Value::Object(into), Value::Object(from)) => (into, from),
        (_, overlay) => return overlay,
    };
    for (key, value) in from {
        if value.is_null() {
            continue;
        }
        let merged = match into.remove(&key) {
            Some(existing) => merge_layers(existing, value),
            None => value,
        };
        let _ = into.insert(key, merged);
    }
    Value::Object(into)
}

/// Apply `TETHER_*` variables from the process environment.
pub fn apply_env_overrides(settings: &mut TetherSettings) {
    apply_overrides_with(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Blank values are skipped. Unparseable or out-of-range values are logged
/// and skipped, leaving the earlier layer's value.
pub fn apply_overrides_with<F>(settings: &mut TetherSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = Overrides { lookup };
    let conn = &mut settings.connection;
    env.number("TETHER_HEARTBEAT_CADENCE_MS", 1_000..=3_600_000, &mut conn.heartbeat_cadence_ms);
    env.number("TETHER_POLL_INTERVAL_MS", 10..=60_000, &mut conn.poll_interval_ms);
    env.flag("TETHER_PROCESS_CANCEL_ERRORS", &mut conn.process_cancel_errors);
    if let Some(list) = env.raw("TETHER_MIDDLEWARE") {
        conn.middleware = parse_list(&list);
    }

    let server = &mut settings.server;
    if let Some(host) = env.raw("TETHER_HOST") {
        server.host = host;
    }
    env.number("TETHER_PORT", 0..=u16::MAX, &mut server.port);
    env.number("TETHER_SEND_QUEUE", 1..=65_536, &mut server.send_queue);

    if let Some(level) = env.raw("TETHER_LOG_LEVEL") {
        settings.logging.level = level;
    }
}

/// `true/yes/on/1` or `false/no/off/0`, any case.
pub fn parse_flag(val: &str) -> Option<bool> {
    let val = val.trim();
    if ["true", "yes", "on", "1"].iter().any(|t| val.eq_ignore_ascii_case(t)) {
        Some(true)
    } else if ["false", "no", "off", "0"].iter().any(|f| val.eq_ignore_ascii_case(f)) {
        Some(false)
    } else {
        None
    }
}

/// Parse a number and keep it only if it falls inside `range`.
pub fn parse_in_range<T>(val: &str, range: &RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    val.trim().parse().ok().filter(|n| range.contains(n))
}

/// Comma-separated identifiers; blanks dropped.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

struct Overrides<F> {
    lookup: F,
}

impl<F> Overrides<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn flag(&self, name: &str, slot: &mut bool) {
        let Some(val) = self.raw(name) else { return };
        match parse_flag(&val) {
            Some(flag) => *slot = flag,
            None => warn!(var = name, value = %val, "ignoring non-boolean override"),
        }
    }

    fn number<T>(&self, name: &str, range: RangeInclusive<T>, slot: &mut T)
    where
        T: FromStr + PartialOrd + std::fmt::Display,
    {
        let Some(val) = self.raw(name) else { return };
        match parse_in_range(&val, &range) {
            Some(n) => *slot = n,
            None => warn!(
                var = name,
                value = %val,
                min = %range.start(),
                max = %range.end(),
                "ignoring out-of-range override"
            ),
        }
    }
}
