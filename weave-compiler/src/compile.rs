//! Compiler orchestrator and compiled-unit cache.
//!
//! [`Compiler::compile`] runs every phase in order and stops at the first one
//! that fails: parse (syntax errors), import resolution plus semantic analysis
//! (batched diagnostics), code generation and assembly. Successful results are
//! cached under a SHA-256 of the source text, so compiling the same text again
//! returns the very same [`CompiledWorkflow`], whatever file name it is given.
//! The shared unit keeps the source map of the first compilation.
//!
//! Cached units also remember a hash of every imported file. A hit whose
//! imports changed on disk, or whose imports resolve to other files under the
//! new name, is recompiled.

use crate::ast::{Item, SourceUnit};
use crate::codegen::{self, CodegenConfig};
use crate::parser;
use crate::semantic::{self, SemanticError};
use crate::transform;
use lru::LruCache;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use weave_core::{
    AssemblyError, CompiledWorkflow, Diagnostic, SourceMapRegistry, UnitStats,
};

pub const DEFAULT_CACHE_CAPACITY: usize = 64;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum CompileError {
    /// Lexing, indentation or parsing failed
    #[error("{0}")]
    Syntax(Diagnostic),

    /// Semantic analysis reported at least one error; warnings are included
    #[error("{} error(s) found", .0.iter().filter(|d| d.is_error()).count())]
    Semantic(Vec<Diagnostic>),

    /// The generated listing did not assemble
    #[error("failed to assemble generated code: {0}")]
    Assembly(#[from] AssemblyError),
}

impl CompileError {
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        match self {
            CompileError::Syntax(diagnostic) => vec![diagnostic.clone()],
            CompileError::Semantic(diagnostics) => diagnostics.clone(),
            CompileError::Assembly(_) => Vec::new(),
        }
    }

    pub fn is_syntax(&self) -> bool {
        matches!(self, CompileError::Syntax(_))
    }
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Maximum number of compiled units kept in the cache
    pub cache_capacity: usize,
    /// Emit `# file:line` comments in generated listings
    pub source_comments: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            source_comments: true,
        }
    }
}

impl CompilerConfig {
    /// Defaults overridden by `WEAVE_CACHE_CAPACITY` and `WEAVE_SOURCE_COMMENTS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(capacity) = std::env::var("WEAVE_CACHE_CAPACITY")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            config.cache_capacity = capacity;
        }
        if let Ok(value) = std::env::var("WEAVE_SOURCE_COMMENTS") {
            config.source_comments = !matches!(value.trim(), "0" | "false" | "no" | "off");
        }
        config
    }
}

// =============================================================================
// Import resolution
// =============================================================================

/// Loads imported sources.
pub trait SourceResolver: Send + Sync {
    /// Name of the file `path` refers to when imported from `from`.
    fn join(&self, from: &str, path: &str) -> String {
        match Path::new(from).parent() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                dir.join(path).to_string_lossy().into_owned()
            }
            _ => path.to_string(),
        }
    }

    fn load(&self, name: &str) -> std::io::Result<String>;
}

/// Reads imports from the file system, relative to the importing file.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsResolver;

impl SourceResolver for FsResolver {
    fn load(&self, name: &str) -> std::io::Result<String> {
        std::fs::read_to_string(name)
    }
}

/// In-memory file set, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryResolver {
    files: RwLock<HashMap<String, String>>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, source: impl Into<String>) {
        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        files.insert(name.into(), source.into());
    }
}

impl SourceResolver for MemoryResolver {
    fn load(&self, name: &str) -> std::io::Result<String> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        files.get(name).cloned().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("no such file '{}'", name))
        })
    }
}

// =============================================================================
// Cache
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Debug)]
struct CacheEntry {
    unit: Arc<CompiledWorkflow>,
    /// File name of the compilation that filled the entry
    name: String,
    /// Import paths as written in the root file
    import_paths: Vec<String>,
    /// `(file name, content hash)` of every import
    imports: Vec<(String, String)>,
}

type Cell = Arc<OnceCell<CacheEntry>>;

/// SHA-256 of a source text, hex encoded.
pub fn source_hash(source: &str) -> String {
    format!("{:x}", Sha256::digest(source.as_bytes()))
}

/// Identity of the generated unit: `<weave:NAME:HASH8>`.
pub fn generated_file_id(name: &str, hash: &str) -> String {
    format!("<weave:{}:{}>", name, hash.get(..8).unwrap_or(hash))
}

// =============================================================================
// Front end
// =============================================================================

/// Parse and transform one file.
pub fn parse_unit(source: &str, name: &str) -> Result<SourceUnit, CompileError> {
    let tree = parser::parse(source)
        .map_err(|err| CompileError::Syntax(err.to_diagnostic(name, source)))?;
    transform::transform(&tree, source, name)
        .map_err(|err| CompileError::Syntax(err.to_diagnostic(name)))
}

/// A root unit with its transitive imports, in preorder.
#[derive(Debug)]
struct Loaded {
    root: SourceUnit,
    imports: Vec<SourceUnit>,
    fingerprints: Vec<(String, String)>,
    diagnostics: Vec<Diagnostic>,
}

struct ImportLoader<'r> {
    resolver: &'r dyn SourceResolver,
    seen: HashSet<String>,
    chain: Vec<String>,
    imports: Vec<SourceUnit>,
    fingerprints: Vec<(String, String)>,
    diagnostics: Vec<Diagnostic>,
}

impl<'r> ImportLoader<'r> {
    fn visit(&mut self, unit: &SourceUnit) -> Result<(), CompileError> {
        for item in &unit.items {
            let Item::Import(decl) = item else {
                continue;
            };
            let name = self.resolver.join(&unit.name, &decl.path.node);

            if self.chain.contains(&name) {
                let mut chain = self.chain.clone();
                chain.push(name);
                let error = SemanticError::CircularImport {
                    chain,
                    span: decl.path.span,
                };
                self.diagnostics.push(error.to_diagnostic(&unit.name));
                continue;
            }
            if !self.seen.insert(name.clone()) {
                continue;
            }

            let source = match self.resolver.load(&name) {
                Ok(source) => source,
                Err(err) => {
                    debug!(file = %name, error = %err, "import not loaded");
                    let error = SemanticError::ImportNotFound {
                        path: decl.path.node.clone(),
                        span: decl.path.span,
                    };
                    self.diagnostics.push(error.to_diagnostic(&unit.name));
                    continue;
                }
            };
            self.fingerprints.push((name.clone(), source_hash(&source)));
            let imported = parse_unit(&source, &name)?;

            let slot = self.imports.len();
            self.chain.push(name);
            self.visit(&imported)?;
            self.chain.pop();
            self.imports.insert(slot, imported);
        }
        Ok(())
    }
}

// =============================================================================
// Compiler
// =============================================================================

/// Compiles workflow sources and caches the results.
///
/// One compiler is usually created per process and shared; it is `Sync`.
/// The source map registry is injected so the runtime can resolve generated
/// positions of every unit this compiler produced.
pub struct Compiler {
    config: CompilerConfig,
    resolver: Arc<dyn SourceResolver>,
    registry: Arc<SourceMapRegistry>,
    cache: RwLock<LruCache<String, Cell>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(CompilerConfig::default())
    }
}

impl Compiler {
    pub fn new(config: CompilerConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            resolver: Arc::new(FsResolver),
            registry: Arc::new(SourceMapRegistry::new()),
            cache: RwLock::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn SourceResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_registry(mut self, registry: Arc<SourceMapRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SourceMapRegistry> {
        &self.registry
    }

    pub fn cache_stats(&self) -> CacheStats {
        let entries = self.cache.read().unwrap_or_else(PoisonError::into_inner).len();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
        }
    }

    pub fn clear_cache(&self) {
        self.cache.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Compile `source` (named `name`) into an executable unit.
    #[instrument(skip(self, source), fields(len = source.len()))]
    pub fn compile(&self, source: &str, name: &str) -> Result<Arc<CompiledWorkflow>, CompileError> {
        let key = source_hash(source);

        let cell = self.cell(&key, false);
        if let Some(entry) = cell.get() {
            if self.is_fresh(entry, name) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %&key[..12], "compile cache hit");
                return Ok(entry.unit.clone());
            }
            info!(file = name, "cached imports are stale, recompiling");
            let cell = self.cell(&key, true);
            return self.fill(&cell, source, name, &key);
        }
        self.fill(&cell, source, name, &key)
    }

    /// Parse and analyze only. Returns every diagnostic, warnings included.
    pub fn validate(&self, source: &str, name: &str) -> Vec<Diagnostic> {
        let loaded = match self.load(source, name) {
            Ok(loaded) => loaded,
            Err(err) => return err.diagnostics(),
        };
        let analysis = semantic::analyze(&loaded.root, &loaded.imports);
        let mut diagnostics = loaded.diagnostics;
        diagnostics.extend(analysis.diagnostics);
        order_diagnostics(&mut diagnostics, name);
        diagnostics
    }

    /// Per-key cell; `replace` swaps in a fresh one for stale entries.
    fn cell(&self, key: &str, replace: bool) -> Cell {
        if !replace {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(cell) = cache.peek(key) {
                return cell.clone();
            }
        }
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if replace {
            let cell: Cell = Arc::new(OnceCell::new());
            cache.put(key.to_string(), cell.clone());
            return cell;
        }
        cache
            .get_or_insert(key.to_string(), || Arc::new(OnceCell::new()))
            .clone()
    }

    fn fill(
        &self,
        cell: &Cell,
        source: &str,
        name: &str,
        key: &str,
    ) -> Result<Arc<CompiledWorkflow>, CompileError> {
        let mut compiled = false;
        let entry = cell.get_or_try_init(|| {
            compiled = true;
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.compile_uncached(source, name, key)
        })?;
        if !compiled {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(entry.unit.clone())
    }

    fn is_fresh(&self, entry: &CacheEntry, name: &str) -> bool {
        let same_imports = entry.name == name
            || entry.import_paths.iter().all(|path| {
                self.resolver.join(&entry.name, path) == self.resolver.join(name, path)
            });
        same_imports
            && entry.imports.iter().all(|(name, hash)| {
            self.resolver
                .load(name)
                .is_ok_and(|source| source_hash(&source) == *hash)
        })
    }

    fn load(&self, source: &str, name: &str) -> Result<Loaded, CompileError> {
        let root = parse_unit(source, name)?;
        let mut loader = ImportLoader {
            resolver: self.resolver.as_ref(),
            seen: HashSet::from([name.to_string()]),
            chain: vec![name.to_string()],
            imports: Vec::new(),
            fingerprints: Vec::new(),
            diagnostics: Vec::new(),
        };
        loader.visit(&root)?;
        Ok(Loaded {
            root,
            imports: loader.imports,
            fingerprints: loader.fingerprints,
            diagnostics: loader.diagnostics,
        })
    }

    fn compile_uncached(&self, source: &str, name: &str, key: &str) -> Result<CacheEntry, CompileError> {
        let loaded = self.load(source, name)?;
        let analysis = semantic::analyze(&loaded.root, &loaded.imports);

        let mut diagnostics = loaded.diagnostics.clone();
        diagnostics.extend(analysis.diagnostics.iter().cloned());
        if diagnostics.iter().any(Diagnostic::is_error) {
            order_diagnostics(&mut diagnostics, name);
            return Err(CompileError::Semantic(diagnostics));
        }
        for warning in &diagnostics {
            warn!(code = %warning.code, file = %warning.file, line = warning.line, "{}", warning.message);
        }

        let units: Vec<&SourceUnit> = std::iter::once(&loaded.root)
            .chain(loaded.imports.iter())
            .collect();
        let file_id = generated_file_id(name, key);
        let config = CodegenConfig {
            source_comments: self.config.source_comments,
        };
        let generated = codegen::generate(&analysis, &units, &file_id, &config);

        let source_map = Arc::new(generated.source_map);
        let unit = CompiledWorkflow::assemble(key, generated.listing, source_map.clone())?;
        self.registry.register(source_map);
        info!(file = name, id = %file_id, imports = loaded.imports.len(), "compiled workflow");

        let import_paths = loaded
            .root
            .items
            .iter()
            .filter_map(|item| match item {
                Item::Import(decl) => Some(decl.path.node.clone()),
                _ => None,
            })
            .collect();
        Ok(CacheEntry {
            unit: Arc::new(unit),
            name: name.to_string(),
            import_paths,
            imports: loaded.fingerprints,
        })
    }
}

/// Root-file diagnostics first, each file in position order.
fn order_diagnostics(diagnostics: &mut [Diagnostic], root: &str) {
    weave_core::sort_diagnostics(diagnostics);
    diagnostics.sort_by_key(|d| d.file != root);
}

/// Definition counts of a single file, without resolving imports.
pub fn file_stats(source: &str) -> Result<UnitStats, CompileError> {
    let unit = parse_unit(source, "<stats>")?;
    let mut stats = UnitStats::default();
    for item in &unit.items {
        match item {
            Item::Model(_) => stats.models += 1,
            Item::Agent(_) => stats.agents += 1,
            Item::Flow(_) => stats.flows += 1,
            Item::Handler(_) => stats.handlers += 1,
            _ => {}
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_core::DiagnosticCode;

    const SOURCE: &str = r#"model main = "anthropic/claude"
prompt greet: "Hello $input"
agent:
    instruction greet
flow main:
    $reply = run agent default with $input
    return $reply
"#;

    fn compiler_with(files: &[(&str, &str)]) -> (Compiler, Arc<MemoryResolver>) {
        let resolver = Arc::new(MemoryResolver::new());
        for (name, source) in files {
            resolver.insert(*name, *source);
        }
        let compiler = Compiler::default().with_resolver(resolver.clone());
        (compiler, resolver)
    }

    #[test]
    fn second_compile_is_a_cache_hit() {
        let compiler = Compiler::default();
        let first = compiler.compile(SOURCE, "main.wv").unwrap();
        let second = compiler.compile(SOURCE, "main.wv").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.source_map, second.source_map);
        assert_eq!(
            compiler.cache_stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                entries: 1
            }
        );
    }

    #[test]
    fn file_name_does_not_split_the_cache() {
        let compiler = Compiler::default();
        let first = compiler.compile(SOURCE, "a.wv").unwrap();
        let second = compiler.compile(SOURCE, "b.wv").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.file_id, first.file_id);
        assert_eq!(compiler.cache_stats().hits, 1);
        assert_eq!(compiler.cache_stats().entries, 1);
    }

    #[test]
    fn renamed_file_with_other_imports_recompiles() {
        let (compiler, _) = compiler_with(&[
            ("one/lib.wv", "prompt greet: \"one\"\n"),
            ("two/lib.wv", "prompt greet: \"two\"\n"),
        ]);
        let source = "import \"lib.wv\"\nagent:\n    instruction greet\n";
        let first = compiler.compile(source, "one/main.wv").unwrap();
        let second = compiler.compile(source, "two/main.wv").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.prompts["greet"].template, "one");
        assert_eq!(second.prompts["greet"].template, "two");
    }

    #[test]
    fn changed_source_is_a_miss() {
        let compiler = Compiler::default();
        let first = compiler.compile(SOURCE, "main.wv").unwrap();
        let edited = format!("{SOURCE}\n# trailing comment\n");
        let second = compiler.compile(&edited, "main.wv").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(first.file_id, second.file_id);
        assert_eq!(compiler.cache_stats().misses, 2);
    }

    #[test]
    fn failures_are_not_cached() {
        let compiler = Compiler::default();
        let broken = "flow main:\n    return $missing\n";
        assert!(matches!(compiler.compile(broken, "a.wv"), Err(CompileError::Semantic(_))));
        assert!(matches!(compiler.compile(broken, "a.wv"), Err(CompileError::Semantic(_))));
        assert_eq!(compiler.cache_stats().misses, 2);
    }

    #[test]
    fn syntax_and_semantic_errors_are_distinct() {
        let compiler = Compiler::default();
        let err = compiler.compile("flow main\n", "a.wv").unwrap_err();
        assert!(err.is_syntax());
        assert_eq!(err.diagnostics()[0].code, DiagnosticCode::E0007);

        let err = compiler
            .compile("agent:\n    instruction nope\n", "a.wv")
            .unwrap_err();
        assert!(!err.is_syntax());
        assert_eq!(err.to_string(), "1 error(s) found");
    }

    #[test]
    fn registers_source_maps() {
        let compiler = Compiler::default();
        let unit = compiler.compile(SOURCE, "main.wv").unwrap();
        let position = compiler.registry().resolve(&unit.file_id, 9).unwrap();
        assert_eq!((position.file.as_str(), position.line), ("main.wv", 6));
        assert!(unit.file_id.starts_with("<weave:main.wv:"));
    }

    #[test]
    fn imports_join_the_symbol_table() {
        let (compiler, _) = compiler_with(&[(
            "lib/shared.wv",
            "prompt greet: \"hi\"\nmodel main = \"x\"\n",
        )]);
        let source = "import \"shared.wv\"\nagent:\n    instruction greet\n";
        let unit = compiler.compile(source, "lib/main.wv").unwrap();
        assert!(unit.prompts.contains_key("greet"));
        let line = unit
            .listing
            .render(true)
            .lines()
            .position(|l| l.starts_with("prompt greet"))
            .unwrap();
        let position = unit.source_position(line + 1).unwrap();
        assert_eq!(position.file, "lib/shared.wv");
    }

    #[test]
    fn missing_and_circular_imports() {
        let (compiler, _) = compiler_with(&[
            ("a.wv", "import \"b.wv\"\n"),
            ("b.wv", "import \"a.wv\"\n"),
        ]);
        let diagnostics = compiler.validate("import \"a.wv\"\nimport \"gone.wv\"\n", "main.wv");
        let codes: Vec<_> = diagnostics.iter().map(|d| (d.code, d.file.as_str())).collect();
        assert_eq!(
            codes,
            vec![(DiagnosticCode::E0005, "main.wv"), (DiagnosticCode::E0006, "b.wv")]
        );
        assert_eq!(
            diagnostics[1].message,
            "circular import: main.wv -> a.wv -> b.wv -> a.wv"
        );
    }

    #[test]
    fn changed_import_invalidates_cache() {
        let (compiler, files) = compiler_with(&[("lib.wv", "prompt greet: \"v1\"\n")]);
        let source = "import \"lib.wv\"\nagent:\n    instruction greet\n";
        let first = compiler.compile(source, "main.wv").unwrap();
        files.insert("lib.wv", "prompt greet: \"v2\"\n");
        let second = compiler.compile(source, "main.wv").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.prompts["greet"].template, "v2");
    }

    #[test]
    fn validate_reports_warnings_without_failing() {
        let source = "prompt p: \"x\"\nagent a:\n    instruction p\n    delegate b\n    use b\nagent b:\n    instruction p\n";
        let compiler = Compiler::default();
        let diagnostics = compiler.validate(source, "a.wv");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code, DiagnosticCode::W0002);
        assert!(compiler.compile(source, "a.wv").is_ok());
    }

    #[test]
    fn counts_definitions() {
        let stats = file_stats(SOURCE).unwrap();
        assert_eq!(
            stats,
            UnitStats {
                models: 1,
                agents: 1,
                flows: 1,
                handlers: 0
            }
        );
    }

    #[test]
    fn generated_ids_are_short() {
        let hash = source_hash("");
        assert_eq!(hash.len(), 64);
        assert_eq!(generated_file_id("a.wv", &hash), format!("<weave:a.wv:{}>", &hash[..8]));
    }
}
