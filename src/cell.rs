//! Cell<T> - validated reactive value holder
//!
//! The live state of every channel in a host lives in a [`Cell`]: a single
//! typed value guarded by a validator, with subscriber fan-out on every
//! accepted write. Device drivers, the protocol server and internal logic
//! all observe the same cell, so a write from any of them propagates to the
//! others automatically.
//!
//! Validation is a ternary outcome rather than pass/fail: a validator can
//! accept a raw value unchanged, *coerce* it to the nearest acceptable value
//! (e.g. clamping to a range), or reject it outright. The outcome is
//! returned to the writer as a [`WriteOutcome`] value, not raised as an
//! error, because coerced and rejected writes are part of normal operation.
//!
//! Subscribers are registered under an optional key. A writer that is itself
//! a subscriber of its own effect (the classic device-echo path: driver
//! writes the cell, cell notifies the driver, driver writes the device,
//! device echoes back...) breaks the loop with [`Cell::put_excluding`],
//! which suppresses the one subscriber registered under the writer's key.
//!
//! # Example
//!
//! ```rust,ignore
//! let power = Cell::new("power_mw", 10.0).with_limits(0.0, 100.0);
//!
//! power.register(Some("gui"), false, |v| update_widget(*v));
//!
//! match power.put(150.0) {
//!     WriteOutcome::Coerced(v) => println!("clamped to {v}"),
//!     outcome => println!("{outcome:?}"),
//! }
//! ```

use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;

/// Result of running a validator against a raw value.
pub enum Validation<T> {
    /// The raw value is acceptable as-is.
    Accept,
    /// The raw value was adjusted to the nearest acceptable value.
    Coerce(T),
    /// The raw value is unacceptable; the cell must not change.
    Reject(String),
}

/// Outcome of a [`Cell::put`] call, reported to the writer.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome<T> {
    /// Stored unchanged; subscribers notified.
    Accepted,
    /// Stored after coercion; carries the value actually stored.
    /// Subscribers were notified with the coerced value.
    Coerced(T),
    /// Refused; the cell is unchanged and no subscriber fired.
    Rejected(String),
}

impl<T> WriteOutcome<T> {
    /// True for `Accepted` and `Coerced` (the cell changed).
    pub fn is_stored(&self) -> bool {
        !matches!(self, WriteOutcome::Rejected(_))
    }
}

/// Validator function type: inspects a raw value, never mutates the cell.
pub type Validator<T> = Arc<dyn Fn(&T) -> Validation<T> + Send + Sync>;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Metadata describing a cell (for records and logs).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CellMetadata {
    /// Cell name (unique within its owning component).
    pub name: String,
    /// Human-readable description.
    pub description: Option<String>,
}

/// Default channel attributes a cell declares for registration-time merging.
///
/// These are the cell's own contribution to the three-way attribute merge
/// performed by the channel registry (cell defaults, code-time overrides,
/// config-tree overrides).
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CellDefaults {
    /// Physical units (e.g. "mW", "Hz", "mm").
    pub units: Option<String>,
    /// Lower numeric limit.
    pub lolim: Option<f64>,
    /// Upper numeric limit.
    pub hilim: Option<f64>,
    /// Enumerated state labels.
    pub states: Option<Vec<String>>,
}

struct Subscriber<T> {
    key: Option<String>,
    callback: Callback<T>,
}

struct CellState<T> {
    value: T,
    subscribers: Vec<Subscriber<T>>,
}

/// A validated, observable value with keyed subscriber fan-out.
///
/// All mutation is expected to happen on the reactor thread (or under the
/// reactor's execution mutex); the internal lock exists so foreign-thread
/// readers and the marshaled writes stay memory-safe, not to provide an
/// ordering discipline of its own.
pub struct Cell<T>
where
    T: Clone + Send + 'static,
{
    meta: CellMetadata,
    defaults: CellDefaults,
    validator: Option<Validator<T>>,
    state: Mutex<CellState<T>>,
}

impl<T: Clone + Send + Debug + 'static> Debug for Cell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("meta", &self.meta)
            .field("value", &self.state.lock().value)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

impl<T> Cell<T>
where
    T: Clone + Send + 'static,
{
    /// Create a new cell with an initial value.
    pub fn new(name: impl Into<String>, initial: T) -> Self {
        Self {
            meta: CellMetadata {
                name: name.into(),
                description: None,
            },
            defaults: CellDefaults::default(),
            validator: None,
            state: Mutex::new(CellState {
                value: initial,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Add a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.meta.description = Some(description.into());
        self
    }

    /// Declare default units for registration-time merging.
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.defaults.units = Some(units.into());
        self
    }

    /// Install a custom validator.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&T) -> Validation<T> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Cell name.
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Cell metadata.
    pub fn metadata(&self) -> &CellMetadata {
        &self.meta
    }

    /// The cell's declared default channel attributes.
    pub fn defaults(&self) -> &CellDefaults {
        &self.defaults
    }

    /// Current value (clone).
    pub fn value(&self) -> T {
        self.state.lock().value.clone()
    }

    /// Validated write: store and notify on accept/coerce, refuse on reject.
    pub fn put(&self, raw: T) -> WriteOutcome<T> {
        self.put_impl(raw, None)
    }

    /// Validated write that never notifies the subscriber registered under
    /// `exclude`. This is the loop-prevention entry point for writers that
    /// subscribe to their own effect.
    pub fn put_excluding(&self, raw: T, exclude: &str) -> WriteOutcome<T> {
        self.put_impl(raw, Some(exclude))
    }

    /// Trusted write: bypasses the validator and always notifies.
    pub fn assign(&self, value: T) {
        self.store_and_notify(value, None);
    }

    /// Add a subscriber. If `call_immediate` is set, the callback is invoked
    /// synchronously with the current value before this returns.
    pub fn register<F>(&self, key: Option<&str>, call_immediate: bool, callback: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let callback: Callback<T> = Arc::new(callback);
        let current = {
            let mut state = self.state.lock();
            state.subscribers.push(Subscriber {
                key: key.map(str::to_owned),
                callback: Arc::clone(&callback),
            });
            call_immediate.then(|| state.value.clone())
        };
        if let Some(value) = current {
            callback(&value);
        }
    }

    /// Remove all subscribers registered under `key`.
    pub fn unregister(&self, key: &str) {
        self.state
            .lock()
            .subscribers
            .retain(|s| s.key.as_deref() != Some(key));
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    fn put_impl(&self, raw: T, exclude: Option<&str>) -> WriteOutcome<T> {
        match self.validator.as_ref().map(|v| v(&raw)) {
            None | Some(Validation::Accept) => {
                self.store_and_notify(raw, exclude);
                WriteOutcome::Accepted
            }
            Some(Validation::Coerce(adjusted)) => {
                self.store_and_notify(adjusted.clone(), exclude);
                WriteOutcome::Coerced(adjusted)
            }
            Some(Validation::Reject(reason)) => WriteOutcome::Rejected(reason),
        }
    }

    /// Store `value` and fan out to subscribers. Callbacks run outside the
    /// internal lock so they may re-enter the cell or post reactor work.
    fn store_and_notify(&self, value: T, exclude: Option<&str>) {
        let callbacks: Vec<Callback<T>> = {
            let mut state = self.state.lock();
            state.value = value.clone();
            state
                .subscribers
                .iter()
                .filter(|s| match (exclude, s.key.as_deref()) {
                    (Some(excluded), Some(key)) => key != excluded,
                    _ => true,
                })
                .map(|s| Arc::clone(&s.callback))
                .collect()
        };
        for callback in callbacks {
            callback(&value);
        }
    }
}

impl<T> Cell<T>
where
    T: Clone + Send + Sync + PartialOrd + Debug + 'static,
{
    /// Install a clamping validator: out-of-range values are coerced to the
    /// nearest bound rather than rejected.
    pub fn with_clamp(mut self, min: T, max: T) -> Self {
        self.validator = Some(clamp(min, max));
        self
    }
}

impl Cell<f64> {
    /// Clamping validator plus declared `lolim`/`hilim` defaults.
    pub fn with_limits(self, min: f64, max: f64) -> Self {
        let mut cell = self.with_clamp(min, max);
        cell.defaults.lolim = Some(min);
        cell.defaults.hilim = Some(max);
        cell
    }
}

impl Cell<i64> {
    /// Clamping validator plus declared `lolim`/`hilim` defaults.
    pub fn with_limits(self, min: i64, max: i64) -> Self {
        let mut cell = self.with_clamp(min, max);
        cell.defaults.lolim = Some(min as f64);
        cell.defaults.hilim = Some(max as f64);
        cell
    }
}

impl Cell<String> {
    /// Restrict the cell to a fixed set of state labels and declare them as
    /// the cell's default enum states.
    pub fn with_states(mut self, states: Vec<String>) -> Self {
        self.defaults.states = Some(states.clone());
        self.validator = Some(choices(states));
        self
    }
}

/// Clamping validator: values outside `[min, max]` are coerced to the bound.
pub fn clamp<T>(min: T, max: T) -> Validator<T>
where
    T: Clone + Send + Sync + PartialOrd + Debug + 'static,
{
    Arc::new(move |value: &T| {
        if *value < min {
            Validation::Coerce(min.clone())
        } else if *value > max {
            Validation::Coerce(max.clone())
        } else {
            Validation::Accept
        }
    })
}

/// Choice validator: values outside the allowed set are rejected.
pub fn choices<T>(allowed: Vec<T>) -> Validator<T>
where
    T: Clone + Send + Sync + PartialEq + Debug + 'static,
{
    Arc::new(move |value: &T| {
        if allowed.iter().any(|c| c == value) {
            Validation::Accept
        } else {
            Validation::Reject(format!("{value:?} is not an allowed choice"))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn put_accepts_and_notifies() {
        let cell = Cell::new("test", 1.0);
        let hits = Arc::new(AtomicU64::new(0));
        let hits_clone = hits.clone();
        cell.register(None, false, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(cell.put(2.0), WriteOutcome::Accepted);
        assert_eq!(cell.value(), 2.0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clamping_validator_coerces() {
        let cell = Cell::new("gain", 5.0).with_limits(0.0, 10.0);

        assert_eq!(cell.put(15.0), WriteOutcome::Coerced(10.0));
        assert_eq!(cell.value(), 10.0);

        assert_eq!(cell.put(-3.0), WriteOutcome::Coerced(0.0));
        assert_eq!(cell.value(), 0.0);

        assert_eq!(cell.put(7.0), WriteOutcome::Accepted);
        assert_eq!(cell.value(), 7.0);
    }

    #[test]
    fn coerced_write_notifies_with_coerced_value() {
        let cell = Cell::new("gain", 5.0).with_limits(0.0, 10.0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        cell.register(None, false, move |v| seen_clone.lock().push(*v));

        cell.put(99.0);
        assert_eq!(*seen.lock(), vec![10.0]);
    }

    #[test]
    fn rejecting_validator_leaves_cell_unchanged() {
        let cell = Cell::new("mode", "auto".to_string())
            .with_states(vec!["auto".into(), "manual".into()]);
        let hits = Arc::new(AtomicU64::new(0));
        let hits_clone = hits.clone();
        cell.register(None, false, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        match cell.put("bogus".to_string()) {
            WriteOutcome::Rejected(_) => {}
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(cell.value(), "auto");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn exclusion_key_suppresses_only_that_subscriber() {
        let cell = Cell::new("echo", 0i64);
        let excluded = Arc::new(AtomicU64::new(0));
        let other = Arc::new(AtomicU64::new(0));
        let e = excluded.clone();
        let o = other.clone();
        cell.register(Some("driver"), false, move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });
        cell.register(Some("gui"), false, move |_| {
            o.fetch_add(1, Ordering::SeqCst);
        });

        cell.put_excluding(1, "driver");
        assert_eq!(excluded.load(Ordering::SeqCst), 0);
        assert_eq!(other.load(Ordering::SeqCst), 1);

        cell.put(2);
        assert_eq!(excluded.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn assign_bypasses_validator() {
        let cell = Cell::new("gain", 5.0).with_limits(0.0, 10.0);
        cell.assign(50.0);
        assert_eq!(cell.value(), 50.0);
    }

    #[test]
    fn register_call_immediate_fires_synchronously() {
        let cell = Cell::new("t", 42i64);
        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = seen.clone();
        cell.register(Some("k"), true, move |v| {
            seen_clone.store(*v as u64, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn unregister_removes_by_key() {
        let cell = Cell::new("t", 0i64);
        cell.register(Some("a"), false, |_| {});
        cell.register(Some("a"), false, |_| {});
        cell.register(Some("b"), false, |_| {});
        assert_eq!(cell.subscriber_count(), 3);

        cell.unregister("a");
        assert_eq!(cell.subscriber_count(), 1);
    }

    #[test]
    fn declared_defaults_carry_limits_and_states() {
        let power = Cell::new("power", 1.0).with_limits(0.0, 100.0).with_units("mW");
        assert_eq!(power.defaults().lolim, Some(0.0));
        assert_eq!(power.defaults().hilim, Some(100.0));
        assert_eq!(power.defaults().units.as_deref(), Some("mW"));

        let shutter = Cell::new("shutter", "closed".to_string())
            .with_states(vec!["closed".into(), "open".into()]);
        assert_eq!(
            shutter.defaults().states.as_deref(),
            Some(&["closed".to_string(), "open".to_string()][..])
        );
    }

    #[test]
    fn subscriber_may_reenter_cell() {
        // Fan-out runs outside the lock, so a subscriber reading the cell
        // back must not deadlock.
        let cell = Arc::new(Cell::new("t", 0i64));
        let cell_clone = cell.clone();
        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = seen.clone();
        cell.register(Some("reader"), false, move |_| {
            seen_clone.store(cell_clone.value() as u64, Ordering::SeqCst);
        });
        cell.put(7);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }
}
