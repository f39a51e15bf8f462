//! Observable Parameters
//!
//! Reactive values built on `tokio::sync::watch` for multi-subscriber change
//! notification. Device mirrors (streak mode, MCP gain, binning, ...) are
//! exposed as observables so that UIs, metadata trackers and cross-device
//! links (time range -> trigger delay) can follow them without polling.
//!
//! # Features
//!
//! - Type-safe observable values with automatic change notifications
//! - Optional validation constraints (range, choices, custom)
//! - Introspectable constraints recorded in [`ObservableMetadata`]
//! - Constraints that can be replaced at runtime, since the allowed ranges and
//!   choices of most RemoteEx parameters are only known after querying the device
//! - Type-erased access through [`ParameterBase`] and [`ParameterSet`]
//!
//! # Example
//!
//! ```rust,ignore
//! let gain = Observable::new("mcp_gain", 0_i64)
//!     .with_range_introspectable(0, 63);
//!
//! let mut rx = gain.subscribe();
//! tokio::spawn(async move {
//!     while rx.changed().await.is_ok() {
//!         println!("gain is now {}", *rx.borrow());
//!     }
//! });
//!
//! gain.set(12)?;
//! ```

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::sync::Arc;
use tokio::sync::watch;

// =============================================================================
// Type Aliases
// =============================================================================

/// Validator callback type.
pub type Validator<T> = Arc<dyn Fn(&T) -> Result<()> + Send + Sync>;

// =============================================================================
// Shared State
// =============================================================================

/// Metadata and validator shared by every clone of an [`Observable`].
///
/// `parking_lot::RwLock` keeps metadata reads synchronous, matching `get()`.
struct ObservableSharedState<T> {
    metadata: ObservableMetadata,
    validator: Option<Validator<T>>,
}

// =============================================================================
// ParameterBase Trait - Generic Parameter Access
// =============================================================================

/// Type-erased access to a parameter.
pub trait ParameterBase: Send + Sync {
    /// Parameter name
    fn name(&self) -> String;

    /// Current value as JSON
    fn get_json(&self) -> Result<serde_json::Value>;

    /// Set the value from JSON
    fn set_json(&self, value: serde_json::Value) -> Result<()>;

    /// Snapshot of the parameter metadata.
    fn metadata(&self) -> ObservableMetadata;

    /// Whether anyone is subscribed to changes
    fn has_subscribers(&self) -> bool;

    /// Number of active subscribers
    fn subscriber_count(&self) -> usize;
}

/// [`ParameterBase`] plus `Any` for downcasting to the concrete type.
pub trait ParameterAny: ParameterBase {
    /// `&dyn Any` view for downcasting
    fn as_any(&self) -> &dyn Any;

    /// Type name of the value (e.g. "f64", "bool")
    fn type_name(&self) -> &'static str;

    /// Value as f64, if that is the value type
    fn value_as_f64(&self) -> Option<f64>;

    /// Value as bool, if that is the value type
    fn value_as_bool(&self) -> Option<bool>;

    /// Value as String, if that is the value type
    fn value_as_string(&self) -> Option<String>;

    /// Value as i64, if that is the value type
    fn value_as_i64(&self) -> Option<i64>;
}

// =============================================================================
// Observable<T>
// =============================================================================

/// A thread-safe, observable value with change notifications.
///
/// Clones share the same watch channel and the same metadata, so a constraint
/// update made by a driver after querying the device is seen by every holder.
pub struct Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    sender: watch::Sender<T>,
    shared: Arc<RwLock<ObservableSharedState<T>>>,
}

impl<T: Clone + Send + Sync + 'static> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.read();
        f.debug_struct("Observable")
            .field("metadata", &shared.metadata)
            .field("has_validator", &shared.validator.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            shared: self.shared.clone(),
        }
    }
}

/// Descriptive and constraint metadata for an observable.
///
/// `dtype`, `min_value`, `max_value` and `enum_values` are filled in by the
/// `*_introspectable` constructors and by `update_range` / `update_choices`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservableMetadata {
    /// Parameter name (unique within a device).
    pub name: String,

    /// Human-readable description.
    pub description: Option<String>,

    /// Physical units (e.g. "s", "Hz").
    pub units: Option<String>,

    /// Read-only parameters reject `set()`.
    pub read_only: bool,

    /// Value type hint: `"float"`, `"int"`, `"bool"`, `"string"` or `"enum"`.
    ///
    /// Empty when unknown.
    #[serde(default)]
    pub dtype: String,

    /// Inclusive lower bound, if the parameter is range-constrained.
    ///
    /// Stored as `f64` for both integer and float parameters.
    #[serde(default)]
    pub min_value: Option<f64>,

    /// Inclusive upper bound, if the parameter is range-constrained.
    #[serde(default)]
    pub max_value: Option<f64>,

    /// Allowed values rendered with `Display`, if the parameter is choice-constrained.
    #[serde(default)]
    pub enum_values: Vec<String>,
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new observable with an initial value.
    pub fn new(name: impl Into<String>, initial_value: T) -> Self {
        let (sender, _) = watch::channel(initial_value);
        Self {
            sender,
            shared: Arc::new(RwLock::new(ObservableSharedState {
                metadata: ObservableMetadata {
                    name: name.into(),
                    ..ObservableMetadata::default()
                },
                validator: None,
            })),
        }
    }

    /// Add a description.
    pub fn with_description(self, description: impl Into<String>) -> Self {
        self.shared.write().metadata.description = Some(description.into());
        self
    }

    /// Add units.
    pub fn with_units(self, units: impl Into<String>) -> Self {
        self.shared.write().metadata.units = Some(units.into());
        self
    }

    /// Mark as read-only.
    pub fn read_only(self) -> Self {
        self.shared.write().metadata.read_only = true;
        self
    }

    /// Install a custom validator, replacing any existing one.
    pub fn with_validator<F>(self, validator: F) -> Self
    where
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        self.shared.write().validator = Some(Arc::new(validator));
        self
    }

    /// Current value (clone).
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Parameter name.
    pub fn name(&self) -> String {
        self.shared.read().metadata.name.clone()
    }

    /// Metadata snapshot.
    pub fn metadata(&self) -> ObservableMetadata {
        self.shared.read().metadata.clone()
    }

    /// Modify metadata in place; visible to all clones.
    pub fn update_metadata<F>(&self, f: F)
    where
        F: FnOnce(&mut ObservableMetadata),
    {
        let mut guard = self.shared.write();
        f(&mut guard.metadata);
    }

    /// Validate a value without setting it.
    ///
    /// Fails if the observable is read-only or the validator rejects the value.
    pub fn validate(&self, value: &T) -> Result<()> {
        let guard = self.shared.read();
        if guard.metadata.read_only {
            return Err(anyhow!("Parameter '{}' is read-only", guard.metadata.name));
        }

        if let Some(validator) = &guard.validator {
            validator(value)?;
        }

        Ok(())
    }

    /// Validate and set a new value, notifying all subscribers.
    pub fn set(&self, value: T) -> Result<()> {
        self.validate(&value)?;
        self.sender.send_replace(value);
        Ok(())
    }

    /// Set without validation. Used when the device is the source of truth.
    pub(crate) fn set_unchecked(&self, value: T) {
        self.sender.send_replace(value);
    }

    /// Subscribe to value changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }

    /// Whether anyone is subscribed.
    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    /// Replace the value without validation, notifying subscribers only if it differs.
    ///
    /// Returns `true` when the stored value changed.
    pub(crate) fn set_if_changed(&self, value: T) -> bool {
        self.sender.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + Serialize + for<'de> Deserialize<'de> + 'static,
{
    /// Current value as JSON
    pub fn get_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self.get())
            .map_err(|e| anyhow!("Failed to serialize parameter '{}': {}", self.name(), e))
    }

    /// Set the value from JSON
    pub fn set_json(&self, json_value: serde_json::Value) -> Result<()> {
        let value: T = serde_json::from_value(json_value).map_err(|e| {
            anyhow!(
                "Failed to deserialize parameter '{}': {}. Expected type: {}",
                self.name(),
                e,
                std::any::type_name::<T>()
            )
        })?;
        self.set(value)
    }
}

impl<T> ParameterBase for Observable<T>
where
    T: Clone + Send + Sync + Serialize + for<'de> Deserialize<'de> + 'static,
{
    fn name(&self) -> String {
        Observable::name(self)
    }

    fn get_json(&self) -> Result<serde_json::Value> {
        Observable::get_json(self)
    }

    fn set_json(&self, value: serde_json::Value) -> Result<()> {
        Observable::set_json(self, value)
    }

    fn metadata(&self) -> ObservableMetadata {
        Observable::metadata(self)
    }

    fn has_subscribers(&self) -> bool {
        Observable::has_subscribers(self)
    }

    fn subscriber_count(&self) -> usize {
        Observable::subscriber_count(self)
    }
}

/// Downcast a cloned value to a concrete primitive.
pub(crate) fn value_as<T: Any + Clone, V: Any + Clone>(value: &T) -> Option<V> {
    (value as &dyn Any).downcast_ref::<V>().cloned()
}

impl<T> ParameterAny for Observable<T>
where
    T: Clone + Send + Sync + Serialize + for<'de> Deserialize<'de> + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn value_as_f64(&self) -> Option<f64> {
        value_as(&self.get())
    }

    fn value_as_bool(&self) -> Option<bool> {
        value_as(&self.get())
    }

    fn value_as_string(&self) -> Option<String> {
        value_as(&self.get())
    }

    fn value_as_i64(&self) -> Option<i64> {
        value_as(&self.get())
    }
}

// =============================================================================
// Constraint Extensions
// =============================================================================

fn range_validator<T>(min: T, max: T) -> Validator<T>
where
    T: PartialOrd + Debug + Send + Sync + 'static,
{
    Arc::new(move |value: &T| {
        if value < &min || value > &max {
            Err(anyhow!("Value {:?} out of range [{:?}, {:?}]", value, min, max))
        } else {
            Ok(())
        }
    })
}

fn choice_validator<T>(choices: Vec<T>) -> Validator<T>
where
    T: PartialEq + Debug + Send + Sync + 'static,
{
    Arc::new(move |value: &T| {
        if choices.iter().any(|c| c == value) {
            Ok(())
        } else {
            Err(anyhow!("Value {:?} not in choices {:?}", value, choices))
        }
    })
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + PartialOrd + Debug + 'static,
{
    /// Add min/max validation without recording the bounds in metadata.
    pub fn with_range(self, min: T, max: T) -> Self {
        self.shared.write().validator = Some(range_validator(min, max));
        self
    }
}

impl Observable<f64> {
    /// Range validation with bounds recorded in metadata (`dtype = "float"`).
    ///
    /// Non-finite values are always rejected. Bounds that are not finite or
    /// not ordered are ignored with a warning and leave the observable
    /// unconstrained.
    pub fn with_range_introspectable(self, min: f64, max: f64) -> Self {
        self.update_range(min, max);
        self
    }

    /// Replace the range constraint at runtime.
    pub fn update_range(&self, min: f64, max: f64) {
        if !(min.is_finite() && max.is_finite()) || min > max {
            tracing::warn!(
                parameter = %self.name(),
                min,
                max,
                "Ignoring invalid range constraint"
            );
            return;
        }

        let mut guard = self.shared.write();
        guard.metadata.min_value = Some(min);
        guard.metadata.max_value = Some(max);
        guard.metadata.dtype = "float".to_string();
        guard.validator = Some(Arc::new(move |value: &f64| {
            if !value.is_finite() {
                return Err(anyhow!("Value must be finite, got {:?}", value));
            }
            if *value < min || *value > max {
                Err(anyhow!("Value {:?} out of range [{:?}, {:?}]", value, min, max))
            } else {
                Ok(())
            }
        }));
    }

    /// Current `(min, max)` bounds, if range-constrained.
    pub fn range(&self) -> Option<(f64, f64)> {
        let guard = self.shared.read();
        guard.metadata.min_value.zip(guard.metadata.max_value)
    }
}

impl Observable<i64> {
    /// Range validation with bounds recorded in metadata (`dtype = "int"`).
    ///
    /// Unordered bounds are ignored with a warning.
    pub fn with_range_introspectable(self, min: i64, max: i64) -> Self {
        self.update_range(min, max);
        self
    }

    /// Replace the range constraint at runtime.
    pub fn update_range(&self, min: i64, max: i64) {
        if min > max {
            tracing::warn!(
                parameter = %self.name(),
                min,
                max,
                "Ignoring invalid range constraint"
            );
            return;
        }

        let mut guard = self.shared.write();
        guard.metadata.min_value = Some(min as f64);
        guard.metadata.max_value = Some(max as f64);
        guard.metadata.dtype = "int".to_string();
        guard.validator = Some(range_validator(min, max));
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + PartialEq + Display + Debug + 'static,
{
    /// Choice validation with the choices recorded in metadata (`dtype = "enum"`).
    pub fn with_choices_introspectable(self, choices: Vec<T>) -> Self {
        self.update_choices(choices);
        self
    }

    /// Replace the allowed choices at runtime.
    ///
    /// The current value is left untouched even if it is no longer a choice.
    pub fn update_choices(&self, choices: Vec<T>) {
        let mut guard = self.shared.write();
        guard.metadata.enum_values = choices.iter().map(ToString::to_string).collect();
        guard.metadata.dtype = "enum".to_string();
        guard.validator = Some(choice_validator(choices));
    }
}

// =============================================================================
// ParameterSet - Collection of Observables
// =============================================================================

/// Named collection of parameters, keyed and iterated in name order.
#[derive(Default)]
pub struct ParameterSet {
    parameters: BTreeMap<String, Box<dyn ParameterAny>>,
}

impl std::fmt::Debug for ParameterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterSet")
            .field("names", &self.names())
            .finish()
    }
}

impl ParameterSet {
    /// Create a new empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter. A parameter with the same name is replaced.
    pub fn register<P>(&mut self, parameter: P)
    where
        P: ParameterAny + 'static,
    {
        let name = parameter.name();
        self.parameters.insert(name, Box::new(parameter));
    }

    /// Get a parameter by name with its concrete type.
    pub fn get_typed<P>(&self, name: &str) -> Option<&P>
    where
        P: ParameterAny + 'static,
    {
        self.parameters
            .get(name)
            .and_then(|p| p.as_any().downcast_ref::<P>())
    }

    /// Get a parameter by name as a trait object.
    pub fn get(&self, name: &str) -> Option<&dyn ParameterBase> {
        self.parameters
            .get(name)
            .map(|p| p.as_ref() as &dyn ParameterBase)
    }

    /// Iterate over `(name, parameter)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &dyn ParameterBase)> {
        self.parameters
            .iter()
            .map(|(name, param)| (name.as_str(), param.as_ref() as &dyn ParameterBase))
    }

    /// All parameter names.
    pub fn names(&self) -> Vec<&str> {
        self.parameters.keys().map(String::as_str).collect()
    }

    /// Number of registered parameters.
    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// JSON snapshot of every value. Parameters that fail to serialize are skipped.
    pub fn snapshot(&self) -> BTreeMap<String, serde_json::Value> {
        self.parameters
            .iter()
            .filter_map(|(name, param)| param.get_json().ok().map(|v| (name.clone(), v)))
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_observable_basic() {
        let obs = Observable::new("mcp_gain", 0_i64);
        assert_eq!(obs.get(), 0);
        assert_eq!(obs.name(), "mcp_gain");

        obs.set(12).unwrap();
        assert_eq!(obs.get(), 12);
    }

    #[test]
    fn test_observable_read_only() {
        let obs = Observable::new("trigger_rate", 1000.0).read_only();

        assert!(obs.set(10.0).is_err());
        assert_eq!(obs.get(), 1000.0);
    }

    #[test]
    fn test_range_introspectable_records_bounds() {
        let obs = Observable::new("trigger_delay", 0.0).with_range_introspectable(0.0, 1e-3);
        let meta = obs.metadata();
        assert_eq!(meta.dtype, "float");
        assert_eq!(meta.min_value, Some(0.0));
        assert_eq!(meta.max_value, Some(1e-3));
        assert_eq!(obs.range(), Some((0.0, 1e-3)));

        assert!(obs.set(5e-4).is_ok());
        assert!(obs.set(2e-3).is_err());
        assert!(obs.set(f64::NAN).is_err());
    }

    #[test]
    fn test_invalid_range_is_ignored() {
        let obs = Observable::new("delay", 0.0).with_range_introspectable(1.0, 0.0);
        assert_eq!(obs.range(), None);
        assert!(obs.set(42.0).is_ok());
    }

    #[test]
    fn test_update_range_visible_to_clones() {
        let obs = Observable::new("mcp_gain", 0_i64);
        let clone = obs.clone();
        obs.update_range(0, 63);

        assert_eq!(clone.metadata().max_value, Some(63.0));
        assert!(clone.set(64).is_err());
        assert!(clone.set(63).is_ok());
    }

    #[test]
    fn test_choices_introspectable_uses_display() {
        let obs = Observable::new("time_range", 1e-9).with_choices_introspectable(vec![1e-9, 2e-9]);
        let meta = obs.metadata();
        assert_eq!(meta.dtype, "enum");
        assert_eq!(meta.enum_values, vec!["0.000000001", "0.000000002"]);
        assert!(obs.set(2e-9).is_ok());
        assert!(obs.set(3e-9).is_err());
    }

    #[tokio::test]
    async fn test_set_if_changed_notifies_only_on_change() {
        let obs = Observable::new("streak_mode", false);
        let mut rx = obs.subscribe();

        assert!(!obs.set_if_changed(false));
        assert!(!rx.has_changed().unwrap());

        assert!(obs.set_if_changed(true));
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[test]
    fn test_observable_json_type_mismatch() {
        let obs = Observable::new("exposure_time", 0.1);

        let result = obs.set_json(serde_json::json!("not a number"));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("deserialize"));
    }

    #[test]
    fn test_parameter_set_generic_access() {
        let mut params = ParameterSet::new();

        params.register(Observable::new("trigger_rate", 1000.0).with_units("Hz"));
        params.register(Observable::new("streak_mode", true));
        params.register(Observable::new("mcp_gain", 3_i64));

        assert_eq!(params.len(), 3);
        assert_eq!(params.names(), vec!["mcp_gain", "streak_mode", "trigger_rate"]);
        assert!(params.get_typed::<Observable<f64>>("trigger_rate").is_some());
        assert!(params.get_typed::<Observable<i64>>("trigger_rate").is_none());

        let rate = params.get("trigger_rate").unwrap();
        assert_eq!(rate.metadata().units.as_deref(), Some("Hz"));
        rate.set_json(serde_json::json!(500.0)).unwrap();

        let snapshot = params.snapshot();
        assert_eq!(snapshot["trigger_rate"], serde_json::json!(500.0));
        assert_eq!(snapshot["mcp_gain"], serde_json::json!(3));
    }

    #[test]
    fn test_value_accessors() {
        let gain = Observable::new("mcp_gain", 7_i64);
        let param: &dyn ParameterAny = &gain;
        assert_eq!(param.value_as_i64(), Some(7));
        assert_eq!(param.value_as_f64(), None);
        assert_eq!(param.value_as_bool(), None);
        assert_eq!(param.value_as_string(), None);
    }
}
