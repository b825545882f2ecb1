//! Source maps between generated listing lines and workflow source.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// One `(generated line, source line, source column)` triple. All 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMapping {
    pub generated_line: usize,
    pub source_line: usize,
    pub source_column: usize,
    /// Set when the line comes from an imported file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// A resolved position in a workflow source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePosition {
    pub file: String,
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMap {
    /// Identity of the generated unit, e.g. `<weave:review.wv:1a2b3c4d>`
    pub generated_file: String,
    /// Name of the workflow source the unit was compiled from
    pub source_file: String,
    pub mappings: Vec<SourceMapping>,
}

impl SourceMap {
    pub fn new(generated_file: impl Into<String>, source_file: impl Into<String>) -> Self {
        Self {
            generated_file: generated_file.into(),
            source_file: source_file.into(),
            mappings: Vec::new(),
        }
    }

    /// Append a mapping. Generated lines must be pushed in increasing order.
    pub fn push(&mut self, generated_line: usize, source_line: usize, source_column: usize) {
        self.push_mapping(SourceMapping {
            generated_line,
            source_line,
            source_column,
            file: None,
        });
    }

    /// Append a mapping into another source file (an import).
    pub fn push_from(
        &mut self,
        file: impl Into<String>,
        generated_line: usize,
        source_line: usize,
        source_column: usize,
    ) {
        let file = file.into();
        let file = (file != self.source_file).then_some(file);
        self.push_mapping(SourceMapping {
            generated_line,
            source_line,
            source_column,
            file,
        });
    }

    fn push_mapping(&mut self, mapping: SourceMapping) {
        debug_assert!(self
            .mappings
            .last()
            .map_or(true, |m| m.generated_line <= mapping.generated_line));
        self.mappings.push(mapping);
    }

    /// Source position for a generated line: the closest mapping at or before it.
    pub fn lookup(&self, generated_line: usize) -> Option<SourcePosition> {
        let idx = self
            .mappings
            .partition_point(|m| m.generated_line <= generated_line);
        let mapping = self.mappings.get(idx.checked_sub(1)?)?;
        Some(SourcePosition {
            file: mapping.file.clone().unwrap_or_else(|| self.source_file.clone()),
            line: mapping.source_line,
            column: mapping.source_column,
        })
    }

    /// Generated lines produced from a given source line.
    pub fn generated_lines_for(&self, source_line: usize) -> Vec<usize> {
        self.mappings
            .iter()
            .filter(|m| m.source_line == source_line)
            .map(|m| m.generated_line)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

/// Registry of source maps keyed by generated-file identity.
///
/// Created once per process (or per test) and handed to both the compiler,
/// which registers maps, and the runtime, which resolves error positions.
#[derive(Debug, Default)]
pub struct SourceMapRegistry {
    maps: RwLock<HashMap<String, Arc<SourceMap>>>,
}

impl SourceMapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, map: Arc<SourceMap>) {
        let mut maps = self.maps.write().unwrap_or_else(PoisonError::into_inner);
        maps.insert(map.generated_file.clone(), map);
    }

    pub fn get(&self, generated_file: &str) -> Option<Arc<SourceMap>> {
        let maps = self.maps.read().unwrap_or_else(PoisonError::into_inner);
        maps.get(generated_file).cloned()
    }

    /// Translate a generated position back to the workflow source.
    pub fn resolve(&self, generated_file: &str, generated_line: usize) -> Option<SourcePosition> {
        self.get(generated_file)?.lookup(generated_line)
    }

    pub fn remove(&self, generated_file: &str) -> Option<Arc<SourceMap>> {
        let mut maps = self.maps.write().unwrap_or_else(PoisonError::into_inner);
        maps.remove(generated_file)
    }

    pub fn len(&self) -> usize {
        self.maps.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SourceMap {
        let mut map = SourceMap::new("<weave:a.wv:0000>", "a.wv");
        map.push(2, 5, 1);
        map.push(3, 6, 5);
        map.push(6, 9, 5);
        map
    }

    #[test]
    fn lookup_uses_closest_preceding_mapping() {
        let map = sample();
        assert_eq!(map.lookup(1), None);
        assert_eq!(map.lookup(3).map(|p| p.line), Some(6));
        assert_eq!(map.lookup(5).map(|p| p.line), Some(6));
        assert_eq!(map.lookup(40).map(|p| p.to_string()), Some("a.wv:9:5".to_string()));
    }

    #[test]
    fn imported_lines_resolve_to_their_file() {
        let mut map = SourceMap::new("<weave:a.wv:0000>", "a.wv");
        map.push_from("shared.wv", 1, 2, 1);
        map.push_from("a.wv", 2, 7, 1);
        assert_eq!(map.lookup(1).map(|p| p.file), Some("shared.wv".to_string()));
        assert_eq!(map.lookup(2).map(|p| p.to_string()), Some("a.wv:7:1".to_string()));
    }

    #[test]
    fn reverse_lookup() {
        let map = sample();
        assert_eq!(map.generated_lines_for(9), vec![6]);
        assert!(map.generated_lines_for(7).is_empty());
    }

    #[test]
    fn registry_resolves_by_identity() {
        let registry = SourceMapRegistry::new();
        registry.register(Arc::new(sample()));
        assert_eq!(registry.len(), 1);
        let pos = registry.resolve("<weave:a.wv:0000>", 2);
        assert_eq!(pos.map(|p| (p.line, p.column)), Some((5, 1)));
        assert!(registry.resolve("<weave:other>", 2).is_none());
    }
}
