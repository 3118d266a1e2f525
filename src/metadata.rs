//! Raw spec normalization.
//!
//! Scraped product pages carry free-form key/value spec tables like
//! `"Memory >> RAM": "16 GB"`. A configuration-driven alias table maps the
//! labels this system cares about onto typed fields (`ram_gb: 16`); values
//! that fail to parse are preserved verbatim under `unparsed` so a human can
//! review them instead of the data silently vanishing.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

/// Strategy describing how to interpret a raw spec value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldStrategy {
    /// Leading integer, unit suffix ignored ("16 GB" → 16).
    Integer,
    /// Leading decimal number, comma decimal separators accepted.
    Decimal,
    /// Yes/no style flags.
    Boolean,
    /// Trimmed free text, kept as-is.
    Text,
}

#[derive(Debug, Clone)]
pub struct FieldAlias {
    pub field: &'static str,
    pub strategy: FieldStrategy,
}

impl FieldAlias {
    pub const fn new(field: &'static str, strategy: FieldStrategy) -> Self {
        Self { field, strategy }
    }
}

/// Configuration-driven mapper translating raw spec tables into typed fields.
#[derive(Debug, Default, Clone)]
pub struct SpecMapper {
    aliases: HashMap<String, FieldAlias>,
}

/// Outcome of one normalization pass: the typed fields plus everything that
/// failed to parse, raw value preserved for review.
#[derive(Debug, Default, PartialEq)]
pub struct NormalizedSpecs {
    pub typed: Map<String, Value>,
    pub unparsed: Map<String, Value>,
}

impl NormalizedSpecs {
    pub fn into_value(self) -> Value {
        let mut out = self.typed;
        if !self.unparsed.is_empty() {
            out.insert("unparsed".into(), Value::Object(self.unparsed));
        }
        Value::Object(out)
    }
}

impl SpecMapper {
    /// Mapper seeded with the labels common across the tracked shops.
    pub fn with_defaults() -> Self {
        Self::default()
            .register("ram", FieldAlias::new("ram_gb", FieldStrategy::Integer))
            .register("memory", FieldAlias::new("ram_gb", FieldStrategy::Integer))
            .register("storage", FieldAlias::new("storage_gb", FieldStrategy::Integer))
            .register("ssd", FieldAlias::new("storage_gb", FieldStrategy::Integer))
            .register(
                "screen size",
                FieldAlias::new("screen_inches", FieldStrategy::Decimal),
            )
            .register(
                "display",
                FieldAlias::new("screen_inches", FieldStrategy::Decimal),
            )
            .register("weight", FieldAlias::new("weight_kg", FieldStrategy::Decimal))
            .register(
                "bluetooth",
                FieldAlias::new("bluetooth", FieldStrategy::Boolean),
            )
            .register("color", FieldAlias::new("color", FieldStrategy::Text))
            .register("colour", FieldAlias::new("color", FieldStrategy::Text))
            .register(
                "processor",
                FieldAlias::new("processor", FieldStrategy::Text),
            )
    }

    /// Register or override an alias for a raw spec label.
    pub fn register(mut self, raw_label: impl Into<String>, alias: FieldAlias) -> Self {
        self.aliases
            .insert(raw_label.into().trim().to_ascii_lowercase(), alias);
        self
    }

    /// Normalize one raw spec table. Unknown labels and unparseable values
    /// both land in `unparsed` with the original key and value.
    pub fn normalize(&self, raw: &Map<String, Value>) -> NormalizedSpecs {
        let mut out = NormalizedSpecs::default();
        for (raw_key, raw_value) in raw {
            let label = spec_label(raw_key);
            let Some(alias) = self.aliases.get(&label) else {
                out.unparsed.insert(raw_key.clone(), raw_value.clone());
                continue;
            };
            match parse_value(raw_value, alias.strategy) {
                Some(v) => {
                    out.typed.insert(alias.field.to_string(), v);
                }
                None => {
                    out.unparsed.insert(raw_key.clone(), raw_value.clone());
                }
            }
        }
        out
    }
}

/// The label a shop shows is the last `>>`-separated segment of the raw key.
fn spec_label(raw_key: &str) -> String {
    raw_key
        .rsplit(">>")
        .next()
        .unwrap_or(raw_key)
        .trim()
        .to_ascii_lowercase()
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d+(?:[.,]\d+)?").unwrap())
}

fn parse_value(value: &Value, strategy: FieldStrategy) -> Option<Value> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        return None;
    }
    match strategy {
        FieldStrategy::Integer => {
            let m = number_re().find(&text)?;
            let normalized = m.as_str().replace(',', ".");
            let parsed: f64 = normalized.parse().ok()?;
            if parsed.fract() != 0.0 {
                return None;
            }
            Some(Value::from(parsed as i64))
        }
        FieldStrategy::Decimal => {
            let m = number_re().find(&text)?;
            let parsed: f64 = m.as_str().replace(',', ".").parse().ok()?;
            Some(Value::from(parsed))
        }
        FieldStrategy::Boolean => match text.to_ascii_lowercase().as_str() {
            "yes" | "true" | "1" | "y" => Some(Value::from(true)),
            "no" | "false" | "0" | "n" | "-" => Some(Value::from(false)),
            _ => None,
        },
        FieldStrategy::Text => Some(Value::from(text)),
    }
}
