//! Hierarchical configuration tree with provenance markers.
//!
//! Every configurable key in a host resolves through a [`ConfigTree`] node.
//! Resolution merges three sources, in priority order: a value already
//! resolved for this key (idempotent cache), an external override seeded
//! from the parsed settings file, and the default supplied by the caller.
//! Alongside the resolved value the tree records *provenance markers* —
//! the external override (`config`), the default actually used, an `about`
//! string and a `classification` — so the effective configuration can be
//! introspected and printed without a generic map interface.
//!
//! The tree is deliberately not iterable as a dictionary: values may only be
//! read through [`ConfigTree::get`], which keeps the set of recognized keys
//! closed (a key nobody asks for is simply inert data).
//!
//! Two shape rules:
//!
//! - A node is either a *tree* node (has children) or a *value* node (has
//!   markers). Mixing the two is a data-shape anomaly from untrusted config
//!   input and is logged as a warning, never a crash.
//! - Asking for the same key twice with different defaults is a programmer
//!   error and fails fast with
//!   [`HostError::ConfigInconsistency`](crate::error::HostError): defaults
//!   must be a pure function of the code, not of call order.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, warn};

use crate::cell::{Validation, Validator};
use crate::error::{AppResult, HostError};

/// The marker kinds recorded at each value node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// The resolved, effective value.
    Value,
    /// The external override read from the settings file, if any.
    Config,
    /// The default the resolving call supplied.
    Default,
    /// Human-readable description of the key.
    About,
    /// Free-form classification tag (e.g. "expert", "plumbing").
    Classification,
}

#[derive(Default)]
struct ConfigNode {
    children: BTreeMap<String, ConfigNode>,
    config: Option<Value>,
    default: Option<Value>,
    value: Option<Value>,
    about: Option<Value>,
    classification: Option<Value>,
}

impl ConfigNode {
    fn is_value_node(&self) -> bool {
        self.config.is_some()
            || self.default.is_some()
            || self.value.is_some()
            || self.about.is_some()
            || self.classification.is_some()
    }

    fn marker(&self, kind: Marker) -> Option<&Value> {
        match kind {
            Marker::Value => self.value.as_ref(),
            Marker::Config => self.config.as_ref(),
            Marker::Default => self.default.as_ref(),
            Marker::About => self.about.as_ref(),
            Marker::Classification => self.classification.as_ref(),
        }
    }

    fn export(&self, kind: Marker) -> Value {
        if self.children.is_empty() {
            return self.marker(kind).cloned().unwrap_or(Value::Null);
        }
        let mut map = serde_json::Map::new();
        for (name, child) in &self.children {
            let exported = child.export(kind);
            if !exported.is_null() {
                map.insert(name.clone(), exported);
            }
        }
        Value::Object(map)
    }

    fn seed_external(&mut self, data: Value, path: &str) {
        match data {
            Value::Object(map) => {
                if self.is_value_node() {
                    warn!(path, "external config turns a value node into a tree node");
                }
                for (name, child_data) in map {
                    let child_path = format!("{path}/{name}");
                    self.children
                        .entry(name)
                        .or_default()
                        .seed_external(child_data, &child_path);
                }
            }
            leaf => {
                if !self.children.is_empty() {
                    warn!(path, "external config puts a value on a tree node");
                }
                self.config = Some(leaf);
            }
        }
    }
}

/// Optional arguments to [`ConfigTree::get`].
#[derive(Default)]
pub struct GetOpts {
    about: Option<String>,
    classification: Option<String>,
    validator: Option<Validator<Value>>,
}

impl GetOpts {
    /// Attach an `about` description to the key.
    pub fn about(mut self, about: impl Into<String>) -> Self {
        self.about = Some(about.into());
        self
    }

    /// Attach a classification tag to the key.
    pub fn classification(mut self, classification: impl Into<String>) -> Self {
        self.classification = Some(classification.into());
        self
    }

    /// Run external overrides through `validator` before accepting them.
    pub fn validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> Validation<Value> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }
}

/// Handle onto one point in the hierarchical configuration.
///
/// Handles are cheap to clone; they share the tree and differ only in the
/// path they address. Child nodes are created lazily on first descent or
/// resolution and persist for the process lifetime.
#[derive(Clone)]
pub struct ConfigTree {
    root: Arc<Mutex<ConfigNode>>,
    path: Vec<String>,
}

impl Default for ConfigTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigTree {
    /// Create an empty tree rooted at the top.
    pub fn new() -> Self {
        Self {
            root: Arc::new(Mutex::new(ConfigNode::default())),
            path: Vec::new(),
        }
    }

    /// Slash-joined path of this handle (empty string at the root).
    pub fn path(&self) -> String {
        self.path.join("/")
    }

    /// Return the child subtree handle for `name`, creating the node if
    /// absent. Logs a warning when the target already holds value markers.
    pub fn descend(&self, name: impl Into<String>) -> ConfigTree {
        let name = name.into();
        {
            let mut root = self.root.lock();
            let node = descend_mut(&mut root, &self.path);
            let child = node.children.entry(name.clone()).or_default();
            if child.is_value_node() {
                warn!(
                    path = %format!("{}/{name}", self.path()),
                    "descending into a node that already holds value markers"
                );
            }
        }
        let mut path = self.path.clone();
        path.push(name);
        ConfigTree {
            root: Arc::clone(&self.root),
            path,
        }
    }

    /// Seed external override markers from a parsed settings mapping. Must
    /// run before any `get` call that should observe the overrides.
    pub fn load_external(&self, nested: Value) {
        let mut root = self.root.lock();
        let node = descend_mut(&mut root, &self.path);
        node.seed_external(nested, &self.path.join("/"));
    }

    /// Resolve one key at this node.
    ///
    /// Priority: already-resolved cache (idempotent, validator not re-run),
    /// then external override (validated), then `default`. The default and
    /// the about/classification metadata are recorded as markers. A repeat
    /// call with a different default is fatal.
    pub fn get(&self, key: &str, default: impl Into<Value>, opts: GetOpts) -> AppResult<Value> {
        let default = default.into();
        let key_path = format!("{}/{key}", self.path());

        let override_value = {
            let mut root = self.root.lock();
            let parent = descend_mut(&mut root, &self.path);
            let node = parent.children.entry(key.to_owned()).or_default();

            if !node.children.is_empty() {
                warn!(path = %key_path, "resolving a value on a node that has children");
            }

            if let Some(resolved) = &node.value {
                if node.default.as_ref() != Some(&default) {
                    return Err(HostError::ConfigInconsistency {
                        path: key_path,
                        previous: node.default.clone().unwrap_or(Value::Null),
                        requested: default,
                    });
                }
                return Ok(resolved.clone());
            }
            node.config.clone()
        };

        // The validator runs with the root lock released so it may re-enter
        // the tree (resolving one key against another is legitimate).
        let resolved = match override_value {
            Some(override_value) => match opts.validator.as_ref().map(|v| v(&override_value)) {
                None | Some(Validation::Accept) => override_value,
                Some(Validation::Coerce(adjusted)) => {
                    warn!(
                        path = %key_path,
                        raw = %override_value,
                        coerced = %adjusted,
                        "external config override was coerced by its validator"
                    );
                    adjusted
                }
                Some(Validation::Reject(reason)) => {
                    // Untrusted config input must not crash the server.
                    error!(
                        path = %key_path,
                        raw = %override_value,
                        reason,
                        "external config override rejected, falling back to default"
                    );
                    default.clone()
                }
            },
            None => default.clone(),
        };

        let mut root = self.root.lock();
        let parent = descend_mut(&mut root, &self.path);
        let node = parent.children.entry(key.to_owned()).or_default();

        // Another caller may have resolved the key while the validator ran;
        // the first resolution wins and the usual consistency rule applies.
        if let Some(already) = &node.value {
            if node.default.as_ref() != Some(&default) {
                return Err(HostError::ConfigInconsistency {
                    path: key_path,
                    previous: node.default.clone().unwrap_or(Value::Null),
                    requested: default,
                });
            }
            return Ok(already.clone());
        }

        node.default = Some(default);
        node.value = Some(resolved.clone());
        if let Some(about) = opts.about {
            node.about = Some(Value::String(about));
        }
        if let Some(classification) = opts.classification {
            node.classification = Some(Value::String(classification));
        }
        Ok(resolved)
    }

    /// Resolve a key as `f64`.
    pub fn get_f64(&self, key: &str, default: f64, opts: GetOpts) -> AppResult<f64> {
        let value = self.get(key, default, opts)?;
        value.as_f64().ok_or_else(|| HostError::ConfigTypeMismatch {
            path: format!("{}/{key}", self.path()),
            expected: "number",
            value,
        })
    }

    /// Resolve a key as `i64`.
    pub fn get_i64(&self, key: &str, default: i64, opts: GetOpts) -> AppResult<i64> {
        let value = self.get(key, default, opts)?;
        value.as_i64().ok_or_else(|| HostError::ConfigTypeMismatch {
            path: format!("{}/{key}", self.path()),
            expected: "integer",
            value,
        })
    }

    /// Resolve a key as `bool`.
    pub fn get_bool(&self, key: &str, default: bool, opts: GetOpts) -> AppResult<bool> {
        let value = self.get(key, default, opts)?;
        value.as_bool().ok_or_else(|| HostError::ConfigTypeMismatch {
            path: format!("{}/{key}", self.path()),
            expected: "boolean",
            value,
        })
    }

    /// Resolve a key as `String`.
    pub fn get_str(&self, key: &str, default: &str, opts: GetOpts) -> AppResult<String> {
        let value = self.get(key, default, opts)?;
        match value {
            Value::String(s) => Ok(s),
            other => Err(HostError::ConfigTypeMismatch {
                path: format!("{}/{key}", self.path()),
                expected: "string",
                value: other,
            }),
        }
    }

    /// Walk the whole subtree under this handle and produce a nested mapping
    /// of one marker kind, for configuration introspection and printing.
    pub fn export_all(&self, kind: Marker) -> Value {
        let mut root = self.root.lock();
        descend_mut(&mut root, &self.path).export(kind)
    }
}

fn descend_mut<'a>(root: &'a mut ConfigNode, path: &[String]) -> &'a mut ConfigNode {
    let mut node = root;
    for part in path {
        node = node.children.entry(part.clone()).or_default();
    }
    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_used_when_no_override() {
        let tree = ConfigTree::new();
        let v = tree.get("x", 5, GetOpts::default()).unwrap();
        assert_eq!(v, json!(5));
    }

    #[test]
    fn repeat_get_is_idempotent_and_skips_validator() {
        let tree = ConfigTree::new();
        let calls = Arc::new(std::sync::atomic::AtomicU64::new(0));

        let opts = |calls: Arc<std::sync::atomic::AtomicU64>| {
            GetOpts::default().validator(move |_v: &Value| {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Validation::Accept
            })
        };

        tree.load_external(json!({ "x": 7 }));
        assert_eq!(tree.get("x", 5, opts(calls.clone())).unwrap(), json!(7));
        assert_eq!(tree.get("x", 5, opts(calls.clone())).unwrap(), json!(7));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn differing_default_is_fatal() {
        let tree = ConfigTree::new();
        tree.get("x", 5, GetOpts::default()).unwrap();
        match tree.get("x", 6, GetOpts::default()) {
            Err(HostError::ConfigInconsistency { .. }) => {}
            other => panic!("expected inconsistency error, got {other:?}"),
        }
    }

    #[test]
    fn override_wins_over_default() {
        let tree = ConfigTree::new();
        tree.load_external(json!({ "laser": { "power": 42.0 } }));
        let laser = tree.descend("laser");
        assert_eq!(laser.get_f64("power", 10.0, GetOpts::default()).unwrap(), 42.0);
        // A key without an override resolves to its default.
        assert_eq!(laser.get_f64("rate", 1.0, GetOpts::default()).unwrap(), 1.0);
    }

    #[test]
    fn coercing_validator_adjusts_override() {
        let tree = ConfigTree::new();
        tree.load_external(json!({ "rate": 500.0 }));
        let v = tree
            .get_f64(
                "rate",
                1.0,
                GetOpts::default().validator(|v: &Value| {
                    match v.as_f64() {
                        Some(f) if f > 100.0 => Validation::Coerce(json!(100.0)),
                        _ => Validation::Accept,
                    }
                }),
            )
            .unwrap();
        assert_eq!(v, 100.0);
    }

    #[test]
    fn validator_may_resolve_another_key() {
        // A validator checking one key against another re-enters the tree;
        // it must not deadlock against the resolution that invoked it.
        let tree = ConfigTree::new();
        tree.load_external(json!({ "power": 150.0 }));

        let tree_clone = tree.clone();
        let v = tree
            .get_f64(
                "power",
                1.0,
                GetOpts::default().validator(move |v: &Value| {
                    let hilim = tree_clone
                        .get_f64("hilim", 100.0, GetOpts::default())
                        .unwrap();
                    match v.as_f64() {
                        Some(f) if f > hilim => Validation::Coerce(json!(hilim)),
                        _ => Validation::Accept,
                    }
                }),
            )
            .unwrap();
        assert_eq!(v, 100.0);
        assert_eq!(
            tree.get_f64("hilim", 100.0, GetOpts::default()).unwrap(),
            100.0
        );
    }

    #[test]
    fn rejected_override_falls_back_to_default() {
        let tree = ConfigTree::new();
        tree.load_external(json!({ "mode": "bogus" }));
        let v = tree
            .get_str(
                "mode",
                "auto",
                GetOpts::default().validator(|v: &Value| match v.as_str() {
                    Some("auto") | Some("manual") => Validation::Accept,
                    _ => Validation::Reject("unknown mode".into()),
                }),
            )
            .unwrap();
        assert_eq!(v, "auto");
    }

    #[test]
    fn export_reflects_markers() {
        let tree = ConfigTree::new();
        tree.load_external(json!({ "laser": { "power": 42.0 } }));
        let laser = tree.descend("laser");
        laser
            .get("power", 10.0, GetOpts::default().about("output power"))
            .unwrap();
        laser.get("rate", 1.0, GetOpts::default()).unwrap();

        assert_eq!(
            tree.export_all(Marker::Value),
            json!({ "laser": { "power": 42.0, "rate": 1.0 } })
        );
        assert_eq!(
            tree.export_all(Marker::Default),
            json!({ "laser": { "power": 10.0, "rate": 1.0 } })
        );
        assert_eq!(
            tree.export_all(Marker::Config),
            json!({ "laser": { "power": 42.0 } })
        );
        assert_eq!(
            tree.export_all(Marker::About),
            json!({ "laser": { "power": "output power" } })
        );
    }

    #[test]
    fn descend_creates_and_shares() {
        let tree = ConfigTree::new();
        let a = tree.descend("instruments").descend("laser");
        let b = tree.descend("instruments").descend("laser");
        a.get("power", 1.0, GetOpts::default()).unwrap();
        // Same underlying node: the recorded default is visible through b.
        assert_eq!(b.get("power", 1.0, GetOpts::default()).unwrap(), json!(1.0));
        assert!(b.get("power", 2.0, GetOpts::default()).is_err());
    }

    #[test]
    fn type_mismatch_is_reported() {
        let tree = ConfigTree::new();
        tree.load_external(json!({ "x": "not a number" }));
        match tree.get_f64("x", 5.0, GetOpts::default()) {
            Err(HostError::ConfigTypeMismatch { expected, .. }) => {
                assert_eq!(expected, "number");
            }
            other => panic!("expected type mismatch, got {other:?}"),
        }
    }
}
