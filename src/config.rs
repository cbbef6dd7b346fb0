//! Configuration loader for `xpuSetting.conf` (spec.md §6's persistent
//! files table): an INI-like `[section]\nkey = value` format, values typed
//! by parse (bool/int/float/string/list) into a small Rust enum, including
//! a proper list parser.

use crate::error::PipelineError;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    List(Vec<String>),
}

impl ConfigValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigValue::Integer(i) => Some(*i),
            ConfigValue::Float(f) => Some(*f as i64),
            ConfigValue::Boolean(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(f) => Some(*f),
            ConfigValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            ConfigValue::List(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::String(s) => write!(f, "\"{s}\""),
            ConfigValue::Integer(i) => write!(f, "{i}"),
            ConfigValue::Float(v) => write!(f, "{v}"),
            ConfigValue::Boolean(b) => write!(f, "{}", if *b { "true" } else { "false" }),
            ConfigValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{item}\"")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Flat `section.key -> value` map, one section per `[section]` header;
/// keys outside any section are stored bare (no leading dot).
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: BTreeMap<String, ConfigValue>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    pub fn get_or(&self, key: &str, default: ConfigValue) -> ConfigValue {
        self.values.get(key).cloned().unwrap_or(default)
    }

    pub fn set(&mut self, key: impl Into<String>, value: ConfigValue) {
        self.values.insert(key.into(), value);
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    /// Parses `xpuSetting.conf`-style text (spec.md §6): `#`/`;` comments,
    /// `[section]` headers, `key = value` pairs. Unrecognized lines are
    /// skipped rather than treated as fatal.
    pub fn parse(text: &str) -> Self {
        let mut config = Config::new();
        let mut section = String::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                section = line[1..line.len() - 1].trim().to_string();
                continue;
            }
            let Some(eq_pos) = line.find('=') else {
                continue;
            };
            let key = line[..eq_pos].trim();
            let mut value = line[eq_pos + 1..].trim();
            if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
                value = &value[1..value.len() - 1];
            }
            let full_key = if section.is_empty() {
                key.to_string()
            } else {
                format!("{section}.{key}")
            };
            config.set(full_key, parse_value(value));
        }
        config
    }

    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = fs::read_to_string(path)
            .map_err(|e| PipelineError::FileNotFound(format!("{}: {e}", path.display())))?;
        Ok(Self::parse(&text))
    }

    /// Serializes back to `[section]\nkey = value` text, atomically
    /// written via `<path>.tmp` + rename (spec.md §5's cache/queue
    /// atomic-rename discipline applied uniformly to config as well).
    pub fn save(&self, path: &Path) -> Result<(), PipelineError> {
        let mut sections: BTreeMap<String, Vec<(&str, &ConfigValue)>> = BTreeMap::new();
        for (full_key, value) in &self.values {
            let (section, key) = match full_key.split_once('.') {
                Some((s, k)) => (s.to_string(), k),
                None => (String::new(), full_key.as_str()),
            };
            sections.entry(section).or_default().push((key, value));
        }

        let mut out = String::new();
        for (section, entries) in &sections {
            if !section.is_empty() {
                out.push('[');
                out.push_str(section);
                out.push_str("]\n");
            }
            for (key, value) in entries {
                out.push_str(key);
                out.push_str(" = ");
                out.push_str(&value.to_string());
                out.push('\n');
            }
            out.push('\n');
        }

        let tmp = path.with_extension("conf.tmp");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| PipelineError::FileWriteError(e.to_string()))?;
        }
        fs::write(&tmp, out).map_err(|e| PipelineError::FileWriteError(e.to_string()))?;
        fs::rename(&tmp, path).map_err(|e| PipelineError::FileWriteError(e.to_string()))?;
        Ok(())
    }
}

fn parse_value(raw: &str) -> ConfigValue {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" => return ConfigValue::Boolean(true),
        "false" | "no" | "off" => return ConfigValue::Boolean(false),
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return ConfigValue::Integer(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return ConfigValue::Float(f);
    }
    if raw.starts_with('[') && raw.ends_with(']') {
        let inner = &raw[1..raw.len() - 1];
        let items = if inner.trim().is_empty() {
            Vec::new()
        } else {
            inner
                .split(',')
                .map(|s| s.trim().trim_matches('"').to_string())
                .collect()
        };
        return ConfigValue::List(items);
    }
    ConfigValue::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_typed_scalar_values() {
        let config = Config::parse(
            "[audio]\nsample_rate = 48000\nvolume = 0.8\nexclusive = true\nname = \"My Device\"\n",
        );
        assert_eq!(config.get("audio.sample_rate").unwrap().as_int(), Some(48_000));
        assert!((config.get("audio.volume").unwrap().as_float().unwrap() - 0.8).abs() < 1e-9);
        assert_eq!(config.get("audio.exclusive").unwrap().as_bool(), Some(true));
        assert_eq!(config.get("audio.name").unwrap().as_str(), Some("My Device"));
    }

    #[test]
    fn parses_string_list() {
        let config = Config::parse("[queue]\ntags = [\"a\", \"b\", \"c\"]\n");
        let list = config.get("queue.tags").unwrap().as_list().unwrap();
        assert_eq!(list, &["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let config = Config::parse("# comment\n; also comment\n\n[section]\nkey = 1\n");
        assert_eq!(config.get("section.key").unwrap().as_int(), Some(1));
    }

    #[test]
    fn keys_outside_any_section_are_bare() {
        let config = Config::parse("toplevel = 5\n");
        assert_eq!(config.get("toplevel").unwrap().as_int(), Some(5));
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("xpuSetting.conf");
        let mut config = Config::new();
        config.set("audio.sample_rate", ConfigValue::Integer(44_100));
        config.set("audio.exclusive", ConfigValue::Boolean(false));
        config.save(&path).unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.get("audio.sample_rate").unwrap().as_int(), Some(44_100));
        assert_eq!(reloaded.get("audio.exclusive").unwrap().as_bool(), Some(false));
    }
}
