//! The readings surface: latest known value of every named point.
//!
//! Several producers write into it (register polling, analog and digital
//! input sampling) and several consumers read from it (report publishing,
//! automation rules). Values are overwritten in place, last write wins, and no
//! history is kept.
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Placeholder used in reports for points without a reading yet.
pub const NO_VALUE_READING: &str = "No value reading";

/// Producer namespace of a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// Register nodes of field devices.
    Field,
    /// Analog input channels.
    Analog,
    /// Digital input pins.
    Digital,
}

impl Source {
    /// Lookup order used when a point is resolved without a namespace.
    pub const RESOLUTION_ORDER: [Source; 3] = [Source::Field, Source::Analog, Source::Digital];
}

/// Shared handle to the readings surface, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Readings {
    points: Arc<RwLock<HashMap<Source, HashMap<String, Value>>>>,
}

impl Readings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, source: Source, name: impl Into<String>, value: Value) {
        let mut points = self.points.write().unwrap_or_else(|e| e.into_inner());
        points.entry(source).or_default().insert(name.into(), value);
    }

    pub fn get(&self, source: Source, name: &str) -> Option<Value> {
        let points = self.points.read().unwrap_or_else(|e| e.into_inner());
        points.get(&source).and_then(|p| p.get(name)).cloned()
    }

    /// Resolves a point across namespaces, first match wins.
    pub fn resolve(&self, name: &str) -> Option<Value> {
        self.resolve_in(&Source::RESOLUTION_ORDER, name)
    }

    pub fn resolve_in(&self, sources: &[Source], name: &str) -> Option<Value> {
        sources.iter().find_map(|source| self.get(*source, name))
    }

    /// Copy of all readings of one namespace.
    pub fn snapshot(&self, source: Source) -> HashMap<String, Value> {
        let points = self.points.read().unwrap_or_else(|e| e.into_inner());
        points.get(&source).cloned().unwrap_or_default()
    }

    /// Builds a report object from a key to point-name template.
    pub fn render<'a>(
        &self,
        sources: &[Source],
        template: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Value {
        let object: Map<String, Value> = template
            .into_iter()
            .map(|(key, point)| {
                let value = self
                    .resolve_in(sources, point)
                    .unwrap_or_else(|| Value::String(NO_VALUE_READING.to_string()));
                (key.clone(), value)
            })
            .collect();
        Value::Object(object)
    }
}

/// Numeric view of a reading; booleans count as 0/1.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        Value::Array(items) if items.len() == 1 => as_number(&items[0]),
        _ => None,
    }
}
