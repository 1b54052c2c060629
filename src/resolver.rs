//! Macro Resolver - fixpoint text substitution
//!
//! Four independent namespaces: prompt triggers (`@hero`), config shortcuts
//! (`#wan_i2v`), pose shortcuts (`#armsup`) and wildcards (`$sky`, `$sky[2]`).
//! Keys are literal substrings, applied in table order and repeated until a
//! pass changes nothing.

use rand::Rng;
use regex::{Captures, Regex};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

static WILDCARD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\$[a-zA-Z0-9_]+)(\[\d+\])?").expect("static pattern"));

pub const DEFAULT_MAX_PASSES: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Macro expansion did not converge after {passes} passes (cyclic table?)")]
    DidNotConverge { passes: usize },
}

/// Ordered key -> value table. Order matters when keys overlap
/// (`@hero` vs `@heroine`), so it is kept as written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MacroTable {
    entries: Vec<(String, String)>,
}

impl MacroTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Replacing keeps the original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys whose value contains the key itself. These never reach a fixpoint.
    pub fn self_referential_keys(&self) -> Vec<&str> {
        self.iter()
            .filter(|(k, v)| !k.is_empty() && v.contains(k))
            .map(|(k, _)| k)
            .collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MacroTable {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut table = MacroTable::new();
        for (k, v) in iter {
            table.insert(k, v);
        }
        table
    }
}

impl Serialize for MacroTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for MacroTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TableVisitor;

        impl<'de> Visitor<'de> for TableVisitor {
            type Value = MacroTable;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of macro names to text")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<MacroTable, A::Error> {
                let mut table = MacroTable::new();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    table.insert(k, v);
                }
                Ok(table)
            }
        }

        deserializer.deserialize_map(TableVisitor)
    }
}

/// The four namespaces, loaded before a run and read-only during it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MacroTables {
    #[serde(default)]
    pub prompt_triggers: MacroTable,
    #[serde(default)]
    pub config_shortcuts: MacroTable,
    #[serde(default, rename = "poseJSONShortcuts")]
    pub pose_shortcuts: MacroTable,
    #[serde(default)]
    pub wildcard_shortcuts: MacroTable,
}

/// Resolves text against a set of tables. `max_passes: None` repeats until
/// stable with no bound.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'t> {
    tables: &'t MacroTables,
    max_passes: Option<usize>,
}

impl<'t> Resolver<'t> {
    pub fn new(tables: &'t MacroTables) -> Self {
        Self {
            tables,
            max_passes: Some(DEFAULT_MAX_PASSES),
        }
    }

    pub fn with_max_passes(mut self, max_passes: Option<usize>) -> Self {
        self.max_passes = max_passes;
        self
    }

    pub fn tables(&self) -> &MacroTables {
        self.tables
    }

    pub fn triggers(&self, text: &str) -> Result<String, ResolveError> {
        substitute(text, &self.tables.prompt_triggers, self.max_passes)
    }

    pub fn config(&self, text: &str) -> Result<String, ResolveError> {
        substitute(text, &self.tables.config_shortcuts, self.max_passes)
    }

    pub fn pose(&self, text: &str) -> Result<String, ResolveError> {
        substitute(text, &self.tables.pose_shortcuts, self.max_passes)
    }

    /// Config shortcuts applied to every string inside a `config` or
    /// `inpaintTools` payload. Keys are left alone.
    pub fn config_fields(&self, fields: &Map<String, Value>) -> Result<Map<String, Value>, ResolveError> {
        let mut resolved = Map::new();
        for (key, value) in fields {
            resolved.insert(key.clone(), map_strings(value, &|text| self.config(text))?);
        }
        Ok(resolved)
    }

    /// Pose shortcuts applied to every string inside a `poseJSON` payload.
    pub fn pose_fields(&self, pose: &Value) -> Result<Value, ResolveError> {
        map_strings(pose, &|text| self.pose(text))
    }

    pub fn wildcards<R: Rng + ?Sized>(&self, text: &str, rng: &mut R) -> Result<String, ResolveError> {
        expand_wildcards(text, &self.tables.wildcard_shortcuts, rng, self.max_passes)
    }

    /// Prompt text: triggers, then wildcards, until neither changes the text.
    /// A wildcard option may itself hold triggers or further wildcards.
    pub fn prompt<R: Rng + ?Sized>(&self, text: &str, rng: &mut R) -> Result<String, ResolveError> {
        let mut current = text.to_string();
        let mut passes = 0;
        loop {
            let next = self.wildcards(&self.triggers(&current)?, rng)?;
            if next == current {
                return Ok(next);
            }
            current = next;
            passes += 1;
            check_passes(passes, self.max_passes)?;
        }
    }
}

type StringResolver<'a> = dyn Fn(&str) -> Result<String, ResolveError> + 'a;

/// Rebuild `value` with every string leaf passed through `resolve`.
fn map_strings(value: &Value, resolve: &StringResolver<'_>) -> Result<Value, ResolveError> {
    let mapped = match value {
        Value::String(text) => Value::String(resolve(text)?),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(map_strings(item, resolve)?);
            }
            Value::Array(out)
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, child) in map {
                out.insert(key.clone(), map_strings(child, resolve)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    };
    Ok(mapped)
}

fn check_passes(passes: usize, max_passes: Option<usize>) -> Result<(), ResolveError> {
    match max_passes {
        Some(max) if passes >= max => Err(ResolveError::DidNotConverge { passes }),
        _ => Ok(()),
    }
}

/// Replace every key with its value, pass after pass, until a full pass over
/// the table leaves the text unchanged.
pub fn substitute(text: &str, table: &MacroTable, max_passes: Option<usize>) -> Result<String, ResolveError> {
    let mut current = text.to_string();
    let mut passes = 0;
    loop {
        let mut next = current.clone();
        for (key, value) in table.iter() {
            if key.is_empty() {
                continue;
            }
            if next.contains(key) {
                next = next.replace(key, value);
            }
        }
        if next == current {
            return Ok(current);
        }
        current = next;
        passes += 1;
        check_passes(passes, max_passes)?;
    }
}

/// Options of a wildcard value: pipe-delimited, trimmed, blanks dropped.
pub fn wildcard_options(value: &str) -> Vec<&str> {
    value
        .split('|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn pick_option<R: Rng + ?Sized>(caps: &Captures<'_>, table: &MacroTable, rng: &mut R) -> Option<String> {
    let options = wildcard_options(table.get(&caps[1])?);
    if options.is_empty() {
        return None;
    }

    match caps.get(2) {
        Some(index) => {
            let digits = index.as_str().trim_start_matches('[').trim_end_matches(']');
            let n: usize = digits.parse().ok()?;
            n.checked_sub(1)
                .and_then(|i| options.get(i))
                .map(|s| s.to_string())
        }
        None => Some(options[rng.gen_range(0..options.len())].to_string()),
    }
}

/// Expand `$name` to a uniformly chosen option and `$name[N]` to the N-th
/// (1-based). Unknown names, empty option lists and out-of-range indices stay
/// verbatim.
pub fn expand_wildcards<R: Rng + ?Sized>(
    text: &str,
    table: &MacroTable,
    rng: &mut R,
    max_passes: Option<usize>,
) -> Result<String, ResolveError> {
    let mut current = text.to_string();
    let mut passes = 0;
    loop {
        let next = WILDCARD_RE
            .replace_all(&current, |caps: &Captures<'_>| {
                pick_option(caps, table, rng).unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned();
        if next == current {
            return Ok(current);
        }
        current = next;
        passes += 1;
        check_passes(passes, max_passes)?;
    }
}
