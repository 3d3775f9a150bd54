//! Configuration loading from `~/.strata/config.toml` with defaults.
//!
//! Supports config includes: the `include` field specifies additional TOML files
//! to load and deep-merge before the root config (root overrides includes).
//! `STRATA_*` environment variables are applied last.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use strata_types::config::SubstrateConfig;
use tracing::{info, warn};

/// Maximum include nesting depth.
const MAX_INCLUDE_DEPTH: u32 = 10;

/// Load substrate configuration from a TOML file, with defaults, then apply
/// environment overrides.
pub fn load_config(path: Option<&Path>) -> SubstrateConfig {
    let mut config = load_file(path);
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config
}

fn load_file(path: Option<&Path>) -> SubstrateConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return SubstrateConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to read config file, using defaults");
            return SubstrateConfig::default();
        }
    };
    let mut root_value = match toml::from_str::<toml::Value>(&contents) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to parse config, using defaults");
            return SubstrateConfig::default();
        }
    };

    let config_dir = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let mut visited = HashSet::new();
    visited.insert(std::fs::canonicalize(&config_path).unwrap_or_else(|_| config_path.clone()));

    if let Err(e) = resolve_config_includes(&mut root_value, &config_dir, &mut visited, 0) {
        warn!(error = %e, "Config include resolution failed, using defaults");
        return SubstrateConfig::default();
    }
    if let toml::Value::Table(ref mut tbl) = root_value {
        tbl.remove("include");
    }

    match root_value.try_into::<SubstrateConfig>() {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to deserialize merged config, using defaults");
            SubstrateConfig::default()
        }
    }
}

/// Deep-merge included files under `root_value`; the root wins.
///
/// Rejects absolute paths, `..` components, escapes from the config
/// directory, and circular references.
fn resolve_config_includes(
    root_value: &mut toml::Value,
    config_dir: &Path,
    visited: &mut HashSet<PathBuf>,
    depth: u32,
) -> Result<(), String> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(format!(
            "Config include depth exceeded maximum of {MAX_INCLUDE_DEPTH}"
        ));
    }

    let includes: Vec<String> = match root_value {
        toml::Value::Table(tbl) => match tbl.get("include") {
            Some(toml::Value::Array(arr)) => arr
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => return Ok(()),
        },
        _ => return Ok(()),
    };
    if includes.is_empty() {
        return Ok(());
    }

    let canonical_dir = std::fs::canonicalize(config_dir)
        .map_err(|e| format!("Config dir cannot be canonicalized: {e}"))?;
    let mut merged_base = toml::Value::Table(toml::map::Map::new());

    for include in &includes {
        let include_path = Path::new(include);
        if include_path.is_absolute() {
            return Err(format!("Config include rejects absolute path: {include}"));
        }
        if include_path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(format!("Config include rejects path traversal: {include}"));
        }

        let canonical = std::fs::canonicalize(config_dir.join(include_path))
            .map_err(|e| format!("Config include '{include}' cannot be resolved: {e}"))?;
        if !canonical.starts_with(&canonical_dir) {
            return Err(format!("Config include '{include}' escapes config directory"));
        }
        if !visited.insert(canonical.clone()) {
            return Err(format!("Circular config include detected: {include}"));
        }

        info!(include = %include, "Loading config include");
        let contents = std::fs::read_to_string(&canonical)
            .map_err(|e| format!("Failed to read config include '{include}': {e}"))?;
        let mut include_value: toml::Value = toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config include '{include}': {e}"))?;

        let include_dir = canonical.parent().unwrap_or(config_dir).to_path_buf();
        resolve_config_includes(&mut include_value, &include_dir, visited, depth + 1)?;
        if let toml::Value::Table(ref mut tbl) = include_value {
            tbl.remove("include");
        }
        deep_merge_toml(&mut merged_base, &include_value);
    }

    let mut root_without_include = root_value.clone();
    if let toml::Value::Table(ref mut tbl) = root_without_include {
        tbl.remove("include");
    }
    deep_merge_toml(&mut merged_base, &root_without_include);
    *root_value = merged_base;
    Ok(())
}

/// Deep-merge two TOML values. `overlay` values override `base` values.
/// For tables, recursively merge. For everything else, overlay wins.
pub fn deep_merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, overlay_val) in overlay_tbl {
                if let Some(base_val) = base_tbl.get_mut(key) {
                    deep_merge_toml(base_val, overlay_val);
                } else {
                    base_tbl.insert(key.clone(), overlay_val.clone());
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

/// Apply `STRATA_*` overrides read through `lookup`.
///
/// Unparseable numeric values are logged and ignored.
pub fn apply_env_overrides(config: &mut SubstrateConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("STRATA_DATABASE_URL") {
        config.database_url = v;
    }
    if let Some(v) = lookup("STRATA_EMBEDDING_PROVIDER") {
        config.embedding.provider = v;
    }
    if let Some(v) = lookup("STRATA_EMBEDDING_MODEL") {
        config.embedding.model = v;
    }
    if let Some(v) = parse_env(&lookup, "STRATA_POOL_MAX_CONNECTIONS") {
        config.pool.max_connections = v;
    }
    if let Some(v) = parse_env(&lookup, "STRATA_POOL_MIN_CONNECTIONS") {
        config.pool.min_connections = v;
    }
    if let Some(v) = lookup("STRATA_API_LISTEN") {
        config.api_listen = v;
    }
    if let Some(v) = lookup("STRATA_LOG_LEVEL") {
        config.log_level = v;
    }
}

fn parse_env<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    strata_home().join("config.toml")
}

/// Get the default Strata home directory.
pub fn strata_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".strata")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn write(path: &Path, lines: &[&str]) {
        let mut f = std::fs::File::create(path).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
    }

    #[test]
    fn test_load_config_missing_file() {
        let config = load_file(Some(Path::new("/nonexistent/config.toml")));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.api_listen, "127.0.0.1:4300");
    }

    #[test]
    fn test_sections_parse() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("config.toml");
        write(
            &root,
            &[
                "database_url = \":memory:\"",
                "[pool]",
                "max_connections = 4",
                "[housekeeping]",
                "batch_size = 50",
            ],
        );
        let config = load_file(Some(&root));
        assert_eq!(config.database_url, ":memory:");
        assert_eq!(config.pool.max_connections, 4);
        assert_eq!(config.pool.min_connections, 1);
        assert_eq!(config.housekeeping.batch_size, 50);
    }

    #[test]
    fn test_deep_merge_nested_tables() {
        let mut base: toml::Value = toml::from_str(
            r#"
            [embedding]
            provider = "openai"
            timeout_ms = 1000
        "#,
        )
        .unwrap();
        let overlay: toml::Value = toml::from_str(
            r#"
            [embedding]
            timeout_ms = 2500
        "#,
        )
        .unwrap();
        deep_merge_toml(&mut base, &overlay);
        let emb = base["embedding"].as_table().unwrap();
        assert_eq!(emb["provider"].as_str(), Some("openai"));
        assert_eq!(emb["timeout_ms"].as_integer(), Some(2500));
    }

    #[test]
    fn test_basic_include() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("base.toml"),
            &["log_level = \"debug\"", "api_listen = \"0.0.0.0:9999\""],
        );
        let root = dir.path().join("config.toml");
        write(&root, &["include = [\"base.toml\"]", "log_level = \"warn\""]);

        let config = load_file(Some(&root));
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.api_listen, "0.0.0.0:9999");
    }

    #[test]
    fn test_nested_include() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("grandchild.toml"), &["api_rate_limit = 7"]);
        write(
            &dir.path().join("child.toml"),
            &["include = [\"grandchild.toml\"]", "log_level = \"debug\""],
        );
        let root = dir.path().join("config.toml");
        write(&root, &["include = [\"child.toml\"]", "log_level = \"info\""]);

        let config = load_file(Some(&root));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.api_rate_limit, 7);
    }

    #[test]
    fn test_circular_include_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.toml");
        write(&a, &["include = [\"b.toml\"]", "log_level = \"trace\""]);
        write(&dir.path().join("b.toml"), &["include = [\"a.toml\"]"]);

        let config = load_file(Some(&a));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_path_traversal_and_absolute_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("config.toml");
        write(&root, &["include = [\"../etc/passwd\"]", "log_level = \"trace\""]);
        assert_eq!(load_file(Some(&root)).log_level, "info");

        write(&root, &["include = [\"/etc/shadow\"]", "log_level = \"trace\""]);
        assert_eq!(load_file(Some(&root)).log_level, "info");
    }

    #[test]
    fn test_max_depth_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..13 {
            let path = dir.path().join(format!("level{i}.toml"));
            let next = format!("include = [\"level{}.toml\"]", i + 1);
            if i < 12 {
                write(&path, &[next.as_str(), "log_level = \"trace\""]);
            } else {
                write(&path, &["log_level = \"trace\""]);
            }
        }
        let config = load_file(Some(&dir.path().join("level0.toml")));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_invalid_toml_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("config.toml");
        write(&root, &["log_level = "]);
        assert_eq!(load_file(Some(&root)).log_level, "info");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("STRATA_DATABASE_URL", ":memory:"),
            ("STRATA_EMBEDDING_PROVIDER", "ollama"),
            ("STRATA_EMBEDDING_MODEL", "nomic-embed-text"),
            ("STRATA_POOL_MAX_CONNECTIONS", "16"),
            ("STRATA_POOL_MIN_CONNECTIONS", "lots"),
            ("STRATA_API_LISTEN", "0.0.0.0:8080"),
            ("STRATA_LOG_LEVEL", "debug"),
        ]);
        let mut config = SubstrateConfig::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.database_url, ":memory:");
        assert_eq!(config.embedding.provider, "ollama");
        assert_eq!(config.embedding.model, "nomic-embed-text");
        assert_eq!(config.pool.max_connections, 16);
        assert_eq!(config.pool.min_connections, 1);
        assert_eq!(config.api_listen, "0.0.0.0:8080");
        assert_eq!(config.log_level, "debug");
    }
}
