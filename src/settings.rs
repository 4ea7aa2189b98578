//! The Datasette settings file (`config.txt` in the deployment package).
//!
//! One `name:value` pair per line. Datasette's settings each have a fixed
//! type, and we check values against that up front so that a typo fails the
//! deployment at start-up rather than surfacing as odd behavior later.

use once_cell::sync::Lazy;
use std::{collections::BTreeMap, collections::HashMap, fmt, fs, io::ErrorKind, path::Path};

use crate::error::ConfigError;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SettingKind {
    Bool,
    Int,
    Str,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bool(b) => write!(f, "{b}"),
            SettingValue::Int(i) => write!(f, "{i}"),
            SettingValue::Str(s) => f.write_str(s),
        }
    }
}

/// Every setting that the hosted app understands, and its type.
pub static SETTINGS_SCHEMA: Lazy<HashMap<&'static str, SettingKind>> = Lazy::new(|| {
    use SettingKind::*;

    [
        ("default_page_size", Int),
        ("max_returned_rows", Int),
        ("num_sql_threads", Int),
        ("sql_time_limit_ms", Int),
        ("default_facet_size", Int),
        ("facet_time_limit_ms", Int),
        ("facet_suggest_time_limit_ms", Int),
        ("hash_urls", Bool),
        ("allow_facet", Bool),
        ("allow_download", Bool),
        ("suggest_facets", Bool),
        ("default_cache_ttl", Int),
        ("default_cache_ttl_hashed", Int),
        ("cache_size_kb", Int),
        ("allow_csv_stream", Bool),
        ("max_csv_mb", Int),
        ("truncate_cells_html", Int),
        ("force_https_urls", Bool),
        ("template_debug", Bool),
        ("base_url", Str),
    ]
    .into_iter()
    .collect()
});

/// Validated settings, keyed by name. Sorted so that the command line we
/// build from them is deterministic.
pub type Settings = BTreeMap<String, SettingValue>;

/// Interpret a boolean the way Datasette does.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Some(true),
        "off" | "false" | "0" => Some(false),
        _ => None,
    }
}

pub fn parse_settings(text: &str) -> Result<Settings, ConfigError> {
    let mut settings = Settings::new();

    // Only the line as a whole is trimmed: a blank line has no separator,
    // and `name :value` names a setting that doesn't exist.
    for line in text.lines() {
        let line = line.trim();

        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| ConfigError::MissingSeparator {
                line: line.to_owned(),
            })?;

        let kind = SETTINGS_SCHEMA
            .get(key)
            .ok_or_else(|| ConfigError::UnknownSetting(key.to_owned()))?;

        let value = match kind {
            SettingKind::Bool => {
                SettingValue::Bool(parse_bool(value).ok_or_else(|| ConfigError::InvalidBool {
                    key: key.to_owned(),
                    value: value.to_owned(),
                })?)
            }

            SettingKind::Int => {
                SettingValue::Int(value.trim().parse().map_err(|e| ConfigError::InvalidInt {
                    key: key.to_owned(),
                    value: value.to_owned(),
                    source: e,
                })?)
            }

            SettingKind::Str => SettingValue::Str(value.to_owned()),
        };

        settings.insert(key.to_owned(), value);
    }

    Ok(settings)
}

/// Load the settings file, if present. A missing file means no settings.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    match fs::read_to_string(path) {
        Ok(text) => parse_settings(&text),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Settings::new()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_owned(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_values() {
        let s = parse_settings(
            "sql_time_limit_ms: 3500\nallow_download:off\nbase_url:/data/\nhash_urls:TRUE\n",
        )
        .unwrap();

        assert_eq!(s["sql_time_limit_ms"], SettingValue::Int(3500));
        assert_eq!(s["allow_download"], SettingValue::Bool(false));
        assert_eq!(s["base_url"], SettingValue::Str("/data/".to_owned()));
        assert_eq!(s["hash_urls"], SettingValue::Bool(true));
        assert_eq!(s.len(), 4);
    }

    #[test]
    fn splits_at_first_colon() {
        let s = parse_settings("base_url:http://x/").unwrap();
        assert_eq!(s["base_url"].to_string(), "http://x/");
    }

    #[test]
    fn missing_separator_is_fatal() {
        let e = parse_settings("max_returned_rows 10").unwrap_err();
        assert!(matches!(e, ConfigError::MissingSeparator { .. }));
        assert_eq!(e.to_string(), "\"max_returned_rows 10\" should be name:value");
    }

    #[test]
    fn blank_line_is_fatal() {
        let e = parse_settings("max_returned_rows:10\n\nallow_download:off\n").unwrap_err();
        assert!(matches!(e, ConfigError::MissingSeparator { ref line } if line.is_empty()));

        let e = parse_settings("max_returned_rows:10\n   \n").unwrap_err();
        assert!(matches!(e, ConfigError::MissingSeparator { .. }));
    }

    #[test]
    fn key_is_not_trimmed() {
        let e = parse_settings("max_returned_rows :10\n").unwrap_err();
        assert!(matches!(e, ConfigError::UnknownSetting(ref k) if k == "max_returned_rows "));
    }

    #[test]
    fn unknown_key_is_fatal() {
        let e = parse_settings("max_returned_rows:10\nwat:1").unwrap_err();
        assert!(matches!(e, ConfigError::UnknownSetting(ref k) if k == "wat"));
    }

    #[test]
    fn bad_values_are_fatal() {
        assert!(matches!(
            parse_settings("hash_urls:maybe").unwrap_err(),
            ConfigError::InvalidBool { .. }
        ));
        assert!(matches!(
            parse_settings("max_csv_mb:lots").unwrap_err(),
            ConfigError::InvalidInt { .. }
        ));
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_settings(&dir.path().join("config.txt")).unwrap();
        assert!(s.is_empty());
    }

    #[test]
    fn display_for_command_line() {
        assert_eq!(SettingValue::Bool(true).to_string(), "true");
        assert_eq!(SettingValue::Int(-3).to_string(), "-3");
    }
}
