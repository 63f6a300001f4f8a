//! Configuration loading and environment parsing.

use serde_json::Value;
use std::fs;
use std::path::Path;

use super::Config;

/// Load configuration with the following precedence (highest first):
/// 1) `COHORT_CONFIG_JSON` env var containing raw JSON
/// 2) File pointed to by `COHORT_CONFIG_PATH`
/// 3) `config.json` in the current working directory
/// 4) Defaults compiled into the binary
///
/// Individual fields can additionally be overridden by environment variables
/// with the `COHORT__` prefix using `__` as a nested separator, e.g.
/// `COHORT__PORT=8090` or `COHORT__SERVER__SESSION_SECRET=...`.
///
/// Errors while reading or parsing any source are printed to stderr and that
/// source is skipped; `load()` always returns a usable `Config`. Callers who
/// need hard failure validate the experiment tree themselves.
#[must_use]
pub fn load() -> Config {
    use std::env;
    use std::path::PathBuf;

    let defaults = Config::default();
    let mut merged =
        serde_json::to_value(&defaults).unwrap_or_else(|_| Value::Object(serde_json::Map::new()));

    // 1) Inline JSON via env var
    if let Ok(json) = env::var("COHORT_CONFIG_JSON") {
        if let Some(value) = parse_json_document(&json, "COHORT_CONFIG_JSON") {
            merge_values(&mut merged, value);
        }
    }

    // 2) Explicit path via env var
    if let Ok(path) = env::var("COHORT_CONFIG_PATH") {
        merge_file_source(&mut merged, &PathBuf::from(path));
    }

    // 3) config.json in CWD
    merge_file_source(&mut merged, &PathBuf::from("config.json"));

    // Environment overrides with prefix COHORT and nested separator __
    apply_env_overrides(&mut merged);

    match serde_json::from_value::<Config>(merged) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to deserialize config; using defaults: {e}");
            defaults
        }
    }
}

fn parse_json_document(raw: &str, label: &str) -> Option<Value> {
    if raw.trim().is_empty() {
        return None;
    }

    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(err) => {
            eprintln!("Failed to parse config from {label}: {err}");
            None
        }
    }
}

fn merge_file_source(target: &mut Value, path: &Path) {
    if path.as_os_str().is_empty() || !path.exists() {
        return;
    }

    match fs::read_to_string(path) {
        Ok(contents) => {
            if let Some(value) = parse_json_document(&contents, &format!("file {}", path.display()))
            {
                merge_values(target, value);
            }
        }
        Err(err) => {
            eprintln!("Failed to read config from {}: {}", path.display(), err);
        }
    }
}

fn merge_values(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target_map), Value::Object(source_map)) => {
            for (key, value) in source_map {
                match target_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        target_map.insert(key, value);
                    }
                }
            }
        }
        (target_slot, source_value) => {
            *target_slot = source_value;
        }
    }
}

fn apply_env_overrides(root: &mut Value) {
    for (key, raw_value) in std::env::vars() {
        let Some(stripped) = key.strip_prefix("COHORT__") else {
            continue;
        };

        let segments: Vec<String> = stripped
            .split("__")
            .filter(|segment| !segment.is_empty())
            .map(str::to_ascii_lowercase)
            .collect();

        if segments.is_empty() {
            continue;
        }

        set_nested_value(root, &segments, parse_scalar(raw_value.trim()));
    }
}

fn parse_scalar(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::String(String::new());
    }

    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn set_nested_value(target: &mut Value, segments: &[String], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *target = value;
        return;
    };

    let map = ensure_object(target);
    if rest.is_empty() {
        map.insert(head.clone(), value);
        return;
    }

    let entry = map
        .entry(head.clone())
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    set_nested_value(entry, rest, value);
}

fn ensure_object(value: &mut Value) -> &mut serde_json::Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(serde_json::Map::new());
    }

    match value.as_object_mut() {
        Some(map) => map,
        // Unreachable: the branch above coerced `value` into an object.
        None => unreachable!("value was coerced into an object"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_prefers_source_scalars() {
        let mut target = serde_json::json!({"port": 8090, "server": {"grace_secs": 15}});
        let source = serde_json::json!({"server": {"grace_secs": 30}});
        merge_values(&mut target, source);
        assert_eq!(target["port"], 8090);
        assert_eq!(target["server"]["grace_secs"], 30);
    }

    #[test]
    fn nested_env_segments_set_deep_values() {
        let mut root = serde_json::json!({});
        set_nested_value(
            &mut root,
            &["server".into(), "session_secret".into()],
            Value::String("hunter2".into()),
        );
        assert_eq!(root["server"]["session_secret"], "hunter2");
    }

    #[test]
    fn scalars_parse_as_json_first() {
        assert_eq!(parse_scalar("8090"), Value::from(8090));
        assert_eq!(parse_scalar("true"), Value::from(true));
        assert_eq!(parse_scalar("plain-string"), Value::from("plain-string"));
    }
}
