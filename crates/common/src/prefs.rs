//! Typed preference store
//!
//! The host-side configuration each party reads by key. Stored on disk as
//! TOML; nested tables are flattened into dotted keys, so
//! `[steeplechase] is_initiator = true` and
//! `"steeplechase.is_initiator" = true` are the same preference.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};

/// A single preference value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrefValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<bool> for PrefValue {
    fn from(v: bool) -> Self {
        PrefValue::Bool(v)
    }
}

impl From<i64> for PrefValue {
    fn from(v: i64) -> Self {
        PrefValue::Int(v)
    }
}

impl From<&str> for PrefValue {
    fn from(v: &str) -> Self {
        PrefValue::Str(v.to_string())
    }
}

impl From<String> for PrefValue {
    fn from(v: String) -> Self {
        PrefValue::Str(v)
    }
}

/// Flat key/value preference store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Prefs {
    values: BTreeMap<String, PrefValue>,
}

impl Prefs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse preferences from a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let table: toml::Table = content.parse()?;
        let mut prefs = Self::new();
        flatten_into(&mut prefs.values, None, table)?;
        Ok(prefs)
    }

    /// Load preferences from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Pref(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Serialize to TOML with one dotted key per line
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(&self.values).map_err(|e| Error::Pref(e.to_string()))
    }

    /// Save preferences to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<PrefValue>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Overlay `other` on top of `self`; keys in `other` win
    pub fn merge(&mut self, other: Prefs) {
        self.values.extend(other.values);
    }

    /// Replace `placeholder` with `value` inside every string preference
    pub fn interpolate(&mut self, placeholder: &str, value: &str) {
        for pref in self.values.values_mut() {
            if let PrefValue::Str(s) = pref {
                if s.contains(placeholder) {
                    *s = s.replace(placeholder, value);
                }
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&PrefValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn bool_pref(&self, key: &str) -> Result<bool> {
        match self.values.get(key) {
            Some(PrefValue::Bool(v)) => Ok(*v),
            Some(other) => Err(Error::Pref(format!("{} is not a bool: {:?}", key, other))),
            None => Err(missing(key)),
        }
    }

    pub fn int_pref(&self, key: &str) -> Result<i64> {
        match self.values.get(key) {
            Some(PrefValue::Int(v)) => Ok(*v),
            Some(other) => Err(Error::Pref(format!("{} is not an integer: {:?}", key, other))),
            None => Err(missing(key)),
        }
    }

    pub fn char_pref(&self, key: &str) -> Result<String> {
        self.opt_char_pref(key)?.ok_or_else(|| missing(key))
    }

    /// A string preference that may be absent
    pub fn opt_char_pref(&self, key: &str) -> Result<Option<String>> {
        match self.values.get(key) {
            Some(PrefValue::Str(v)) => Ok(Some(v.clone())),
            Some(other) => Err(Error::Pref(format!("{} is not a string: {:?}", key, other))),
            None => Ok(None),
        }
    }
}

fn missing(key: &str) -> Error {
    Error::Pref(format!("missing preference {}", key))
}

fn flatten_into(
    out: &mut BTreeMap<String, PrefValue>,
    prefix: Option<&str>,
    table: toml::Table,
) -> Result<()> {
    for (key, value) in table {
        let key = match prefix {
            Some(prefix) => format!("{}.{}", prefix, key),
            None => key,
        };
        let value = match value {
            toml::Value::Table(inner) => {
                flatten_into(out, Some(&key), inner)?;
                continue;
            }
            toml::Value::Boolean(v) => PrefValue::Bool(v),
            toml::Value::Integer(v) => PrefValue::Int(v),
            toml::Value::String(v) => PrefValue::Str(v),
            other => {
                return Err(Error::Pref(format!(
                    "{} has unsupported type {}",
                    key,
                    other.type_str()
                )))
            }
        };
        out.insert(key, value);
    }
    Ok(())
}
