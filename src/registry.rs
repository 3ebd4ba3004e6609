//! Channel registry: binds cells to externally visible named channels.
//!
//! Registration merges three sources of channel attributes, in rising
//! priority: the cell's own declared defaults ([`CellDefaults`]), explicit
//! code-time overrides in the [`ChannelSpec`], and per-field config-tree
//! overrides (a site's settings file beats both). Config-tree fields are
//! filtered by the channel's scalar kind — enum-only fields don't apply to
//! floats and vice versa.
//!
//! The registry's product is the record set a wire-protocol server
//! consumes: [`ChannelRegistry::build_snapshot`] resolves prefix-list names
//! into flat channel-name strings via a supplied naming function and hands
//! out [`ChannelRecord`]s, each exposing a value accessor, a
//! `write(raw) -> accepted|coerced|rejected` entry point that calls the
//! owning cell's `put`, and static metadata. The server is expected to call
//! `write` under the reactor's execution mutex when the call does not
//! already originate on the reactor thread.
//!
//! Persistence is driven through the reactor: `start_autosave` installs a
//! periodic task that hands the full `(name, persist, persist_read_only,
//! value)` entry list to the configured [`PersistSink`]; a write to a record
//! carrying an urgent window notifies the sink immediately instead of
//! waiting for the next cadence.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cell::{Cell, CellDefaults, WriteOutcome};
use crate::configtree::{ConfigTree, GetOpts};
use crate::error::{AppResult, HostError};
use crate::reactor::{Reactor, Schedule};

/// Scalar type of a channel's externally visible value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarKind {
    /// 64-bit float.
    Float,
    /// 64-bit signed integer.
    Int,
    /// Free-form string.
    Str,
    /// Single character.
    Char,
    /// One of a fixed set of named states.
    Enum,
}

impl ScalarKind {
    /// Static name, for error messages and metadata export.
    pub fn as_str(self) -> &'static str {
        match self {
            ScalarKind::Float => "float",
            ScalarKind::Int => "int",
            ScalarKind::Str => "string",
            ScalarKind::Char => "char",
            ScalarKind::Enum => "enum",
        }
    }

    fn is_numeric(self) -> bool {
        matches!(self, ScalarKind::Float | ScalarKind::Int)
    }
}

/// A channel's intended read/write role. Drives the default persistence
/// flags for any attribute the registration does not set explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interaction {
    /// Value the host computes and publishes; never written from outside.
    Report,
    /// Value owned by an external device; recorded but not restored.
    External,
    /// Host-internal state that should survive a restart.
    Internal,
    /// Operator-adjustable setting; persisted and writable.
    Setting,
    /// Momentary trigger; never persisted.
    Command,
}

impl Interaction {
    /// Default `(persist, persist_read_only)` flags for this kind.
    fn default_persist(self) -> (bool, bool) {
        match self {
            Interaction::Setting | Interaction::Internal => (true, false),
            Interaction::External => (true, true),
            Interaction::Report | Interaction::Command => (false, true),
        }
    }
}

/// Per-type default record shape: each concrete cell type contributes its
/// declared attribute defaults to the registration merge.
pub trait DefaultsProvider {
    /// The cell's declared default channel attributes.
    fn channel_defaults(&self) -> CellDefaults;
}

/// JSON-erased view of a typed cell, consumed by the registry and the
/// protocol server.
pub trait ChannelCell: DefaultsProvider + Send + Sync {
    /// The scalar kind this cell's native type maps to.
    fn native_kind(&self) -> ScalarKind;
    /// Cell name (for diagnostics; the channel name is assigned at
    /// registration).
    fn cell_name(&self) -> &str;
    /// Current value as JSON.
    fn value_json(&self) -> Value;
    /// Validated write through the owning cell's `put`.
    fn write_json(&self, raw: Value) -> WriteOutcome<Value>;
}

macro_rules! impl_channel_cell {
    ($ty:ty, $kind:expr, $expected:literal, $from_json:expr, $to_json:expr) => {
        impl DefaultsProvider for Cell<$ty> {
            fn channel_defaults(&self) -> CellDefaults {
                self.defaults().clone()
            }
        }

        impl ChannelCell for Cell<$ty> {
            fn native_kind(&self) -> ScalarKind {
                $kind
            }

            fn cell_name(&self) -> &str {
                self.name()
            }

            fn value_json(&self) -> Value {
                let to_json: fn(&$ty) -> Value = $to_json;
                to_json(&self.value())
            }

            fn write_json(&self, raw: Value) -> WriteOutcome<Value> {
                let from_json: fn(&Value) -> Option<$ty> = $from_json;
                let Some(typed) = from_json(&raw) else {
                    return WriteOutcome::Rejected(format!(
                        "expected {} for '{}', got {raw}",
                        $expected,
                        self.name()
                    ));
                };
                match self.put(typed) {
                    WriteOutcome::Accepted => WriteOutcome::Accepted,
                    WriteOutcome::Coerced(v) => {
                        let to_json: fn(&$ty) -> Value = $to_json;
                        WriteOutcome::Coerced(to_json(&v))
                    }
                    WriteOutcome::Rejected(reason) => WriteOutcome::Rejected(reason),
                }
            }
        }
    };
}

impl_channel_cell!(f64, ScalarKind::Float, "a number", |v| v.as_f64(), |v| {
    json!(v)
});
impl_channel_cell!(i64, ScalarKind::Int, "an integer", |v| v.as_i64(), |v| {
    json!(v)
});
impl_channel_cell!(
    String,
    ScalarKind::Str,
    "a string",
    |v| v.as_str().map(str::to_owned),
    |v| Value::String(v.clone())
);
impl_channel_cell!(
    char,
    ScalarKind::Char,
    "a single character",
    |v| {
        let mut chars = v.as_str()?.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Some(c),
            _ => None,
        }
    },
    |v| Value::String(v.to_string())
);

/// Code-time registration attributes for one channel.
#[derive(Default)]
pub struct ChannelSpec {
    /// The channel's read/write role.
    pub interaction: Option<Interaction>,
    /// Explicit scalar kind; defaults to the cell's native kind.
    pub kind: Option<ScalarKind>,
    /// Enum state labels (required when `kind` is `Enum`).
    pub states: Option<Vec<String>>,
    /// Lower numeric limit override.
    pub lolim: Option<f64>,
    /// Upper numeric limit override.
    pub hilim: Option<f64>,
    /// Units override.
    pub units: Option<String>,
    /// Persist flag override; derived from the interaction when absent.
    pub persist: Option<bool>,
    /// Persist-read-only flag override; derived when absent.
    pub persist_read_only: Option<bool>,
    /// Urgent-persist window in seconds: a stored write notifies the
    /// persist sink immediately, requesting a snapshot within this window.
    pub urgent_window: Option<f64>,
}

impl ChannelSpec {
    /// Spec for a channel with the given interaction kind.
    pub fn new(interaction: Interaction) -> Self {
        Self {
            interaction: Some(interaction),
            ..Self::default()
        }
    }

    /// Override the scalar kind (e.g. `Enum` for a string-backed cell).
    pub fn kind(mut self, kind: ScalarKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Enum state labels.
    pub fn states(mut self, states: Vec<String>) -> Self {
        self.states = Some(states);
        self
    }

    /// Numeric limits.
    pub fn limits(mut self, lolim: f64, hilim: f64) -> Self {
        self.lolim = Some(lolim);
        self.hilim = Some(hilim);
        self
    }

    /// Units label.
    pub fn units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    /// Explicit persistence flags.
    pub fn persistence(mut self, persist: bool, read_only: bool) -> Self {
        self.persist = Some(persist);
        self.persist_read_only = Some(read_only);
        self
    }

    /// Urgent-persist window in seconds.
    pub fn urgent_window(mut self, secs: f64) -> Self {
        self.urgent_window = Some(secs);
        self
    }
}

/// Static metadata of a registered channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelMeta {
    /// Prefix chain plus resolved channel name.
    pub name_parts: Vec<String>,
    /// Scalar kind.
    pub kind: ScalarKind,
    /// Interaction kind.
    pub interaction: Interaction,
    /// Lower numeric limit, if any.
    pub lolim: Option<f64>,
    /// Upper numeric limit, if any.
    pub hilim: Option<f64>,
    /// Units label, if any.
    pub units: Option<String>,
    /// Enum state labels, if any.
    pub states: Option<Vec<String>>,
    /// Whether the channel's value is written to snapshots.
    pub persist: bool,
    /// Whether a persisted value is recorded but never restored.
    pub persist_read_only: bool,
    /// Urgent-persist window in seconds, if any.
    pub urgent_window: Option<f64>,
}

/// One `(channel, value)` line handed to the persist subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistEntry {
    /// Flat channel name.
    pub name: String,
    /// Persist flag.
    pub persist: bool,
    /// Persist-read-only flag.
    pub persist_read_only: bool,
    /// Current value.
    pub value: Value,
}

/// Consumer of periodic and urgent snapshots (external collaborator; the
/// file format lives on its side of the boundary).
pub trait PersistSink: Send + Sync {
    /// Periodic cadence: the complete entry list.
    fn persist_all(&self, entries: Vec<PersistEntry>);
    /// A write to an urgent channel happened; snapshot within `window_secs`.
    fn persist_urgent(&self, entry: PersistEntry, window_secs: f64);
}

/// One named, externally visible channel, as consumed by the protocol
/// server. Immutable after creation except through the owning cell.
#[derive(Clone)]
pub struct ChannelRecord {
    name: String,
    cell: Arc<dyn ChannelCell>,
    meta: Arc<ChannelMeta>,
    sink: Option<Arc<dyn PersistSink>>,
}

impl ChannelRecord {
    /// Flat channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Static metadata.
    pub fn meta(&self) -> &ChannelMeta {
        &self.meta
    }

    /// Current value.
    pub fn value(&self) -> Value {
        self.cell.value_json()
    }

    /// External write entry point: validated through the owning cell's
    /// `put`. A stored write on an urgent channel notifies the persist sink
    /// immediately with the requested window.
    pub fn write(&self, raw: Value) -> WriteOutcome<Value> {
        let outcome = self.cell.write_json(raw);
        if outcome.is_stored() {
            if let (Some(sink), Some(window)) = (&self.sink, self.meta.urgent_window) {
                sink.persist_urgent(
                    PersistEntry {
                        name: self.name.clone(),
                        persist: self.meta.persist,
                        persist_read_only: self.meta.persist_read_only,
                        value: self.cell.value_json(),
                    },
                    window,
                );
            }
        }
        outcome
    }
}

struct Registered {
    cell: Arc<dyn ChannelCell>,
    meta: Arc<ChannelMeta>,
}

#[derive(Default)]
struct RegistryInner {
    channels: Vec<Registered>,
    sink: Option<Arc<dyn PersistSink>>,
}

/// Registry binding cells to externally visible channel names.
///
/// Cheap to clone (shared interior); all mutation is expected on the
/// reactor thread.
#[derive(Clone)]
pub struct ChannelRegistry {
    config: ConfigTree,
    inner: Arc<Mutex<RegistryInner>>,
}

impl ChannelRegistry {
    /// Create a registry resolving per-field overrides under `config`.
    pub fn new(config: ConfigTree) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(RegistryInner::default())),
        }
    }

    /// Install the persist sink consulted by autosave and urgent writes.
    pub fn set_persist_sink(&self, sink: Arc<dyn PersistSink>) {
        self.inner.lock().sink = Some(sink);
    }

    /// Register `cell` under `prefix` + `name`.
    ///
    /// The effective name is config-overridable (key `name` on the
    /// channel's config node), as is every attribute applicable to the
    /// channel's scalar kind. Registering the same cell twice, or resolving
    /// to an already-taken name, is an error.
    pub fn register(
        &self,
        cell: Arc<dyn ChannelCell>,
        name: &str,
        prefix: &[String],
        spec: ChannelSpec,
    ) -> AppResult<Vec<String>> {
        let kind = spec.kind.unwrap_or_else(|| cell.native_kind());
        let interaction = spec.interaction.unwrap_or(Interaction::Report);

        // Attribute/kind sanity before any config access.
        if !kind.is_numeric() && (spec.lolim.is_some() || spec.hilim.is_some()) {
            return Err(HostError::AttributeKindMismatch {
                name: name.to_owned(),
                attribute: "limits",
                kind: kind.as_str(),
            });
        }
        if kind != ScalarKind::Enum && spec.states.is_some() {
            return Err(HostError::AttributeKindMismatch {
                name: name.to_owned(),
                attribute: "states",
                kind: kind.as_str(),
            });
        }

        // Channel's own config node: prefix chain, then the code-time name.
        let mut node = self.config.clone();
        for part in prefix {
            node = node.descend(part.clone());
        }
        let node = node.descend(name);

        let resolved_name =
            node.get_str("name", name, GetOpts::default().about("channel name override"))?;
        let mut name_parts: Vec<String> = prefix.to_vec();
        name_parts.push(resolved_name);

        let defaults = cell.channel_defaults();

        // Merge: code-time spec beats cell defaults; config override beats
        // both. Only fields applicable to the scalar kind are resolved, so
        // the config format stays closed per kind.
        let mut lolim = None;
        let mut hilim = None;
        let mut units = None;
        let mut states = None;
        if kind.is_numeric() {
            lolim = resolve_opt_f64(&node, "lolim", spec.lolim.or(defaults.lolim))?;
            hilim = resolve_opt_f64(&node, "hilim", spec.hilim.or(defaults.hilim))?;
            units = resolve_opt_str(&node, "units", spec.units.or(defaults.units))?;
        }
        if kind == ScalarKind::Enum {
            states = resolve_opt_states(&node, spec.states.or(defaults.states))?;
            if states.is_none() {
                return Err(HostError::MissingEnumStates(name.to_owned()));
            }
        }

        let (persist_default, read_only_default) = interaction.default_persist();
        let persist = node.get_bool(
            "persist",
            spec.persist.unwrap_or(persist_default),
            GetOpts::default().about("write this channel to snapshots"),
        )?;
        let persist_read_only = node.get_bool(
            "persist_read_only",
            spec.persist_read_only.unwrap_or(read_only_default),
            GetOpts::default().about("record but never restore"),
        )?;

        let meta = Arc::new(ChannelMeta {
            name_parts: name_parts.clone(),
            kind,
            interaction,
            lolim,
            hilim,
            units,
            states,
            persist,
            persist_read_only,
            urgent_window: spec.urgent_window,
        });

        let mut inner = self.inner.lock();
        for existing in &inner.channels {
            if same_cell(&existing.cell, &cell) {
                return Err(HostError::DuplicateCell {
                    existing: existing.meta.name_parts.join("/"),
                    requested: name_parts.join("/"),
                });
            }
            if existing.meta.name_parts == name_parts {
                return Err(HostError::DuplicateChannel(name_parts.join("/")));
            }
        }

        debug!(
            channel = %name_parts.join("/"),
            kind = kind.as_str(),
            "registered channel"
        );
        inner.channels.push(Registered { cell, meta });
        Ok(name_parts)
    }

    /// Number of registered channels.
    pub fn len(&self) -> usize {
        self.inner.lock().channels.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().channels.is_empty()
    }

    /// Produce the complete name → record mapping for the protocol server,
    /// flattening prefix-list names through `naming`.
    pub fn build_snapshot<F>(&self, naming: F) -> AppResult<HashMap<String, ChannelRecord>>
    where
        F: Fn(&[String]) -> String,
    {
        let inner = self.inner.lock();
        let mut records = HashMap::with_capacity(inner.channels.len());
        for registered in &inner.channels {
            let name = naming(&registered.meta.name_parts);
            let record = ChannelRecord {
                name: name.clone(),
                cell: Arc::clone(&registered.cell),
                meta: Arc::clone(&registered.meta),
                sink: inner.sink.clone(),
            };
            if records.insert(name.clone(), record).is_some() {
                return Err(HostError::DuplicateChannel(name));
            }
        }
        Ok(records)
    }

    /// Current persist entries for every channel (the sink filters on the
    /// flags). Names are slash-joined.
    pub fn persist_entries(&self) -> Vec<PersistEntry> {
        let inner = self.inner.lock();
        inner
            .channels
            .iter()
            .map(|registered| PersistEntry {
                name: registered.meta.name_parts.join("/"),
                persist: registered.meta.persist,
                persist_read_only: registered.meta.persist_read_only,
                value: registered.cell.value_json(),
            })
            .collect()
    }

    /// Hand the full entry list to the persist sink now.
    pub fn persist_now(&self) {
        let sink = self.inner.lock().sink.clone();
        if let Some(sink) = sink {
            sink.persist_all(self.persist_entries());
        }
    }

    /// Schedule the periodic persist flush on the reactor.
    pub fn start_autosave(&self, reactor: &Reactor, period: f64, skip_fraction: f64) {
        let registry = self.clone();
        reactor.schedule(
            "registry/autosave",
            Schedule::every(period).skip(skip_fraction, || {
                warn!("autosave cadence overloaded, skipped one period");
            }),
            move || registry.persist_now(),
        );
    }
}

fn same_cell(a: &Arc<dyn ChannelCell>, b: &Arc<dyn ChannelCell>) -> bool {
    // Compare allocation addresses; the vtable half of the fat pointer is
    // irrelevant here.
    std::ptr::eq(
        Arc::as_ptr(a) as *const u8,
        Arc::as_ptr(b) as *const u8,
    )
}

fn resolve_opt_f64(node: &ConfigTree, key: &str, default: Option<f64>) -> AppResult<Option<f64>> {
    let resolved = node.get(key, default.map_or(Value::Null, |v| json!(v)), GetOpts::default())?;
    match resolved {
        Value::Null => Ok(None),
        other => other
            .as_f64()
            .map(Some)
            .ok_or_else(|| HostError::ConfigTypeMismatch {
                path: format!("{}/{key}", node.path()),
                expected: "number",
                value: other,
            }),
    }
}

fn resolve_opt_str(
    node: &ConfigTree,
    key: &str,
    default: Option<String>,
) -> AppResult<Option<String>> {
    let resolved = node.get(
        key,
        default.map_or(Value::Null, Value::String),
        GetOpts::default(),
    )?;
    match resolved {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        other => Err(HostError::ConfigTypeMismatch {
            path: format!("{}/{key}", node.path()),
            expected: "string",
            value: other,
        }),
    }
}

fn resolve_opt_states(
    node: &ConfigTree,
    default: Option<Vec<String>>,
) -> AppResult<Option<Vec<String>>> {
    let resolved = node.get(
        "states",
        default.map_or(Value::Null, |states| json!(states)),
        GetOpts::default(),
    )?;
    match resolved {
        Value::Null => Ok(None),
        other => serde_json::from_value::<Vec<String>>(other.clone())
            .map(Some)
            .map_err(|_| HostError::ConfigTypeMismatch {
                path: format!("{}/states", node.path()),
                expected: "array of strings",
                value: other,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn float_cell(name: &str) -> Arc<Cell<f64>> {
        Arc::new(Cell::new(name, 1.0).with_limits(0.0, 10.0).with_units("mW"))
    }

    #[test]
    fn interaction_kinds_derive_persistence() {
        assert_eq!(Interaction::Setting.default_persist(), (true, false));
        assert_eq!(Interaction::Internal.default_persist(), (true, false));
        assert_eq!(Interaction::External.default_persist(), (true, true));
        assert_eq!(Interaction::Report.default_persist(), (false, true));
        assert_eq!(Interaction::Command.default_persist(), (false, true));
    }

    #[test]
    fn register_merges_cell_defaults() {
        let registry = ChannelRegistry::new(ConfigTree::new());
        let cell = float_cell("power");
        registry
            .register(
                cell,
                "power",
                &["laser".into()],
                ChannelSpec::new(Interaction::Setting),
            )
            .unwrap();

        let records = registry.build_snapshot(|parts| parts.join(":")).unwrap();
        let record = &records["laser:power"];
        assert_eq!(record.meta().kind, ScalarKind::Float);
        assert_eq!(record.meta().lolim, Some(0.0));
        assert_eq!(record.meta().hilim, Some(10.0));
        assert_eq!(record.meta().units.as_deref(), Some("mW"));
        assert!(record.meta().persist);
        assert!(!record.meta().persist_read_only);
    }

    #[test]
    fn code_time_overrides_beat_cell_defaults() {
        let registry = ChannelRegistry::new(ConfigTree::new());
        let cell = float_cell("power");
        registry
            .register(
                cell,
                "power",
                &[],
                ChannelSpec::new(Interaction::Setting).limits(-1.0, 1.0),
            )
            .unwrap();
        let records = registry.build_snapshot(|parts| parts.join(":")).unwrap();
        assert_eq!(records["power"].meta().lolim, Some(-1.0));
        assert_eq!(records["power"].meta().hilim, Some(1.0));
    }

    #[test]
    fn config_overrides_beat_everything() {
        let config = ConfigTree::new();
        config.load_external(serde_json::json!({
            "laser": { "power": { "hilim": 5.0, "name": "output_power" } }
        }));
        let registry = ChannelRegistry::new(config);
        registry
            .register(
                float_cell("power"),
                "power",
                &["laser".into()],
                ChannelSpec::new(Interaction::Setting),
            )
            .unwrap();
        let records = registry.build_snapshot(|parts| parts.join(":")).unwrap();
        let record = &records["laser:output_power"];
        assert_eq!(record.meta().hilim, Some(5.0));
        assert_eq!(record.meta().lolim, Some(0.0));
    }

    #[test]
    fn duplicate_cell_is_rejected() {
        let registry = ChannelRegistry::new(ConfigTree::new());
        let cell = float_cell("power");
        registry
            .register(
                cell.clone(),
                "N",
                &[],
                ChannelSpec::new(Interaction::Setting),
            )
            .unwrap();
        match registry.register(cell, "M", &[], ChannelSpec::new(Interaction::Setting)) {
            Err(HostError::DuplicateCell { .. }) => {}
            other => panic!("expected duplicate-cell error, got {other:?}"),
        }
    }

    #[test]
    fn enum_requires_states() {
        let registry = ChannelRegistry::new(ConfigTree::new());
        let cell: Arc<dyn ChannelCell> = Arc::new(Cell::new("mode", "auto".to_string()));
        match registry.register(
            cell,
            "mode",
            &[],
            ChannelSpec::new(Interaction::Setting).kind(ScalarKind::Enum),
        ) {
            Err(HostError::MissingEnumStates(_)) => {}
            other => panic!("expected missing-states error, got {other:?}"),
        }
    }

    #[test]
    fn enum_states_come_from_cell_declaration() {
        let registry = ChannelRegistry::new(ConfigTree::new());
        let cell: Arc<dyn ChannelCell> = Arc::new(
            Cell::new("shutter", "closed".to_string())
                .with_states(vec!["closed".into(), "open".into()]),
        );
        registry
            .register(
                cell,
                "shutter",
                &[],
                ChannelSpec::new(Interaction::Setting).kind(ScalarKind::Enum),
            )
            .unwrap();
        let records = registry.build_snapshot(|parts| parts.join(":")).unwrap();
        assert_eq!(
            records["shutter"].meta().states.as_deref(),
            Some(&["closed".to_string(), "open".to_string()][..])
        );
    }

    #[test]
    fn limits_on_string_channel_are_rejected() {
        let registry = ChannelRegistry::new(ConfigTree::new());
        let cell: Arc<dyn ChannelCell> = Arc::new(Cell::new("label", String::new()));
        match registry.register(
            cell,
            "label",
            &[],
            ChannelSpec::new(Interaction::Report).limits(0.0, 1.0),
        ) {
            Err(HostError::AttributeKindMismatch { attribute, .. }) => {
                assert_eq!(attribute, "limits");
            }
            other => panic!("expected attribute mismatch, got {other:?}"),
        }
    }

    #[test]
    fn record_write_goes_through_the_cell_validator() {
        let registry = ChannelRegistry::new(ConfigTree::new());
        let cell = float_cell("power");
        registry
            .register(
                cell.clone(),
                "power",
                &[],
                ChannelSpec::new(Interaction::Setting),
            )
            .unwrap();
        let records = registry.build_snapshot(|parts| parts.join(":")).unwrap();
        let record = &records["power"];

        assert_eq!(record.write(json!(3.0)), WriteOutcome::Accepted);
        assert_eq!(record.write(json!(99.0)), WriteOutcome::Coerced(json!(10.0)));
        assert!(matches!(
            record.write(json!("nan?")),
            WriteOutcome::Rejected(_)
        ));
        assert_eq!(cell.value(), 10.0);
    }

    #[derive(Default)]
    struct RecordingSink {
        all: PlMutex<Vec<Vec<PersistEntry>>>,
        urgent: PlMutex<Vec<(PersistEntry, f64)>>,
    }

    impl PersistSink for RecordingSink {
        fn persist_all(&self, entries: Vec<PersistEntry>) {
            self.all.lock().push(entries);
        }
        fn persist_urgent(&self, entry: PersistEntry, window_secs: f64) {
            self.urgent.lock().push((entry, window_secs));
        }
    }

    #[test]
    fn urgent_write_notifies_sink_immediately() {
        let registry = ChannelRegistry::new(ConfigTree::new());
        let sink = Arc::new(RecordingSink::default());
        registry.set_persist_sink(sink.clone());
        registry
            .register(
                float_cell("power"),
                "power",
                &[],
                ChannelSpec::new(Interaction::Setting).urgent_window(2.0),
            )
            .unwrap();
        let records = registry.build_snapshot(|parts| parts.join(":")).unwrap();

        records["power"].write(json!(4.0));
        let urgent = sink.urgent.lock();
        assert_eq!(urgent.len(), 1);
        assert_eq!(urgent[0].0.value, json!(4.0));
        assert_eq!(urgent[0].1, 2.0);
    }

    #[test]
    fn rejected_write_does_not_notify_sink() {
        let registry = ChannelRegistry::new(ConfigTree::new());
        let sink = Arc::new(RecordingSink::default());
        registry.set_persist_sink(sink.clone());
        let cell: Arc<dyn ChannelCell> = Arc::new(
            Cell::new("mode", "auto".to_string())
                .with_states(vec!["auto".into(), "manual".into()]),
        );
        registry
            .register(
                cell,
                "mode",
                &[],
                ChannelSpec::new(Interaction::Setting)
                    .kind(ScalarKind::Enum)
                    .urgent_window(1.0),
            )
            .unwrap();
        let records = registry.build_snapshot(|parts| parts.join(":")).unwrap();

        assert!(matches!(
            records["mode"].write(json!("bogus")),
            WriteOutcome::Rejected(_)
        ));
        assert!(sink.urgent.lock().is_empty());
    }

    #[test]
    fn persist_entries_carry_flags_and_values() {
        let registry = ChannelRegistry::new(ConfigTree::new());
        registry
            .register(
                float_cell("power"),
                "power",
                &["laser".into()],
                ChannelSpec::new(Interaction::Setting),
            )
            .unwrap();
        registry
            .register(
                Arc::new(Cell::new("fire", 0i64)),
                "fire",
                &["laser".into()],
                ChannelSpec::new(Interaction::Command),
            )
            .unwrap();

        let entries = registry.persist_entries();
        assert_eq!(entries.len(), 2);
        let power = entries.iter().find(|e| e.name == "laser/power").unwrap();
        assert!(power.persist);
        assert_eq!(power.value, json!(1.0));
        let fire = entries.iter().find(|e| e.name == "laser/fire").unwrap();
        assert!(!fire.persist);
    }
}
