//! Deterministic identities for cached units.
//!
//! A unit is first hashed by content: its normalized source plus the hashes
//! of every free variable it closes over, resolved recursively. When any
//! dependency is impure, the unit falls back to an execution-path hash built
//! from the operations observed during a real run.

use std::collections::BTreeSet;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest as _, Sha256};

use crate::error::{Error, Result};
use crate::graph::VarName;

/// A SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Digest of a byte string.
    pub fn of(bytes: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes.as_ref());
        Self(hasher.finalize().into())
    }

    /// Digest of a JSON value.
    ///
    /// Object keys serialize in sorted order, so equal values always hash equally.
    pub fn of_value(value: &Value) -> Self {
        Self::of(value.to_string())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({}…)", &self.to_hex()[..12])
    }
}

/// Incremental digest over tagged, length-prefixed fields.
pub(crate) struct DigestBuilder(Sha256);

impl DigestBuilder {
    pub(crate) fn new(domain: &str) -> Self {
        let mut builder = Self(Sha256::new());
        builder.field("domain", domain.as_bytes());
        builder
    }

    pub(crate) fn field(&mut self, tag: &str, bytes: impl AsRef<[u8]>) -> &mut Self {
        let bytes = bytes.as_ref();
        self.0.update((tag.len() as u64).to_le_bytes());
        self.0.update(tag.as_bytes());
        self.0.update((bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }

    pub(crate) fn finish(self) -> Digest {
        Digest(self.0.finalize().into())
    }
}

/// Identity of a unit of cached work.
///
/// An entry is valid only for the exact variant and digest that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "digest", rename_all = "snake_case")]
pub enum HashStrategy {
    /// Derived purely from source and pure inputs.
    ContentAddressed(Digest),
    /// Derived from the operations observed during one execution.
    ExecutionPath(Digest),
}

impl HashStrategy {
    pub fn digest(&self) -> Digest {
        match self {
            HashStrategy::ContentAddressed(d) | HashStrategy::ExecutionPath(d) => *d,
        }
    }

    pub fn is_content_addressed(&self) -> bool {
        matches!(self, HashStrategy::ContentAddressed(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HashStrategy::ContentAddressed(_) => "content_addressed",
            HashStrategy::ExecutionPath(_) => "execution_path",
        }
    }
}

impl std::fmt::Display for HashStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.digest())
    }
}

/// A module imported by a unit.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModuleRef {
    /// Canonical module name (not the local alias).
    pub name: String,
    /// Local alias the unit uses, if different.
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Where the module was loaded from (path or URL).
    #[serde(default)]
    pub origin: Option<String>,
    /// Modules this module imports in turn.
    #[serde(default)]
    pub imports: Vec<ModuleRef>,
}

impl ModuleRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn importing(mut self, module: ModuleRef) -> Self {
        self.imports.push(module);
        self
    }
}

/// A callable or expression whose results may be cached.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheUnit {
    pub name: String,
    pub source: String,
    /// Statically-resolvable free variables the unit closes over.
    pub free_vars: BTreeSet<VarName>,
    /// Modules the unit uses directly.
    pub modules: Vec<ModuleRef>,
}

impl CacheUnit {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            ..Self::default()
        }
    }

    pub fn closing_over<I>(mut self, names: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<VarName>,
    {
        self.free_vars.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn using(mut self, module: ModuleRef) -> Self {
        self.modules.push(module);
        self
    }

    /// Structural identity: normalized source, free-variable names and modules.
    ///
    /// The name is not part of it, so wrappers that reuse the wrapped
    /// function's name stay distinct from it.
    pub fn identity(&self) -> Digest {
        let mut builder = DigestBuilder::new("unit");
        builder.field("source", self.normalized_source());
        for name in &self.free_vars {
            builder.field("var", name.as_bytes());
        }
        for module in &self.modules {
            builder.field("module", serde_json::to_vec(module).unwrap_or_default());
        }
        builder.finish()
    }

    /// Source with line endings unified, trailing whitespace and blank lines removed.
    pub fn normalized_source(&self) -> String {
        self.source
            .replace("\r\n", "\n")
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// What a free variable resolves to.
#[derive(Debug, Clone)]
pub enum Resolved {
    /// A plain, hashable value.
    Value(Value),
    /// Another cacheable unit (hashed recursively).
    Unit(Arc<CacheUnit>),
    /// An imported module.
    Module(ModuleRef),
    /// Mutable external state, an unhashable object, or anything else whose
    /// identity is unstable across calls.
    Impure { reason: String },
}

/// Name resolution and tracing capability supplied by the caller.
pub trait UnitEnvironment {
    /// Resolve a free variable; `None` means unbound.
    fn resolve(&self, name: &str) -> Option<Resolved>;

    /// The operations `unit` performed in a run this environment observed.
    ///
    /// Returning `None` means no trace is available, so [`CacheEngine::identify`]
    /// reports an impure unit as uncacheable.
    ///
    /// [`CacheEngine::identify`]: super::CacheEngine::identify
    fn trace(&self, _unit: &CacheUnit) -> Option<ExecutionTrace> {
        None
    }

    /// Whether a recorded operation would observe the same thing now.
    ///
    /// A recorded execution path is reused only when every one of its
    /// operations still holds. The default trusts nothing.
    fn still_holds(&self, _op: &TraceOp) -> bool {
        false
    }
}

/// One operation observed while running a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TraceOp {
    Import { module: String, version: Option<String> },
    Call { unit: String, args: Digest, result: Digest },
    Read { name: VarName, value: Digest },
}

/// The literal sequence of operations performed by one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    ops: Vec<TraceOp>,
}

impl ExecutionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_import(&mut self, module: &ModuleRef) {
        self.ops.push(TraceOp::Import {
            module: module.name.clone(),
            version: module.version.clone(),
        });
    }

    pub fn record_call(&mut self, unit: impl Into<String>, args: &Value, result: &Value) {
        self.ops.push(TraceOp::Call {
            unit: unit.into(),
            args: Digest::of_value(args),
            result: Digest::of_value(result),
        });
    }

    pub fn record_read(&mut self, name: impl Into<VarName>, value: &Value) {
        self.ops.push(TraceOp::Read {
            name: name.into(),
            value: Digest::of_value(value),
        });
    }

    pub fn ops(&self) -> &[TraceOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn digest(&self) -> Digest {
        let mut builder = DigestBuilder::new("trace");
        for op in &self.ops {
            let encoded = serde_json::to_vec(op).unwrap_or_default();
            builder.field("op", encoded);
        }
        builder.finish()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Purity {
    Pure(Digest),
    Impure(String),
}

/// Execution-path identity of `unit` for one recorded run.
pub(crate) fn execution_path(unit: &CacheUnit, trace: &ExecutionTrace) -> HashStrategy {
    let mut builder = DigestBuilder::new("execution_path");
    builder
        .field("source", unit.normalized_source())
        .field("trace", trace.digest().as_bytes());
    HashStrategy::ExecutionPath(builder.finish())
}

/// Recursive content hasher with cycle and memo tracking.
pub(crate) struct UnitHasher<'a> {
    env: &'a dyn UnitEnvironment,
    pinned: bool,
    visiting: FxHashSet<Digest>,
    memo: FxHashMap<Digest, Purity>,
}

impl<'a> UnitHasher<'a> {
    pub(crate) fn new(env: &'a dyn UnitEnvironment, pinned: bool) -> Self {
        Self {
            env,
            pinned,
            visiting: FxHashSet::default(),
            memo: FxHashMap::default(),
        }
    }

    /// Effective strategy for `unit`.
    pub(crate) fn identify(&mut self, unit: &CacheUnit) -> Result<HashStrategy> {
        match self.purity(unit)? {
            Purity::Pure(digest) => Ok(HashStrategy::ContentAddressed(digest)),
            Purity::Impure(reason) => {
                let Some(trace) = self.env.trace(unit) else {
                    return Err(Error::Uncacheable {
                        unit: unit.name.clone(),
                        reason,
                    });
                };
                Ok(execution_path(unit, &trace))
            }
        }
    }

    /// Content digest of `unit`, or why it has none.
    pub(crate) fn purity(&mut self, unit: &CacheUnit) -> Result<Purity> {
        let key = unit.identity();
        if self.visiting.contains(&key) {
            // Mutual recursion: the enclosing frame already hashes this unit.
            return Ok(Purity::Pure(Digest::of(format!("recursive:{}", key))));
        }
        if let Some(known) = self.memo.get(&key) {
            return Ok(known.clone());
        }

        self.visiting.insert(key);
        let outcome = self.content_uncached(unit);
        self.visiting.remove(&key);

        let outcome = outcome?;
        self.memo.insert(key, outcome.clone());
        Ok(outcome)
    }

    fn content_uncached(&mut self, unit: &CacheUnit) -> Result<Purity> {
        let mut builder = DigestBuilder::new("content");
        builder.field("source", unit.normalized_source());

        let mut seen_modules = FxHashSet::default();
        for module in &unit.modules {
            let digest = self.module(module, &mut seen_modules)?;
            builder.field("module", digest.as_bytes());
        }

        for name in &unit.free_vars {
            builder.field("var", name.as_bytes());
            match self.env.resolve(name) {
                None => {
                    builder.field("unbound", b"");
                }
                Some(Resolved::Value(value)) => {
                    builder.field("value", Digest::of_value(&value).as_bytes());
                }
                Some(Resolved::Module(module)) => {
                    let digest = self.module(&module, &mut FxHashSet::default())?;
                    builder.field("module", digest.as_bytes());
                }
                Some(Resolved::Unit(inner)) => match self.purity(&inner)? {
                    Purity::Pure(digest) => {
                        builder.field("unit", digest.as_bytes());
                    }
                    Purity::Impure(reason) => {
                        return Ok(Purity::Impure(format!(
                            "'{}' wraps impure '{}': {}",
                            unit.name, inner.name, reason
                        )));
                    }
                },
                Some(Resolved::Impure { reason }) => {
                    return Ok(Purity::Impure(format!("'{}' is impure: {}", name, reason)));
                }
            }
        }

        Ok(Purity::Pure(builder.finish()))
    }

    /// Digest of a module and everything it transitively imports.
    ///
    /// Aliases never contribute; with pinning enabled the version (or origin)
    /// of every module is included.
    fn module(&self, module: &ModuleRef, seen: &mut FxHashSet<String>) -> Result<Digest> {
        let mut builder = DigestBuilder::new("module");
        builder.field("name", module.name.as_bytes());

        if self.pinned {
            let identity = module
                .version
                .as_deref()
                .or(module.origin.as_deref())
                .ok_or_else(|| Error::UnknownModuleForPinning {
                    module: module.name.clone(),
                })?;
            builder.field("identity", identity.as_bytes());

            if seen.insert(module.name.clone()) {
                for import in &module.imports {
                    let digest = self.module(import, seen)?;
                    builder.field("import", digest.as_bytes());
                }
            }
        }

        Ok(builder.finish())
    }
}
