//! `Parameter<T>` - device-backed observable values
//!
//! A `Parameter<T>` composes an [`Observable<T>`] with optional hardware
//! callbacks:
//!
//! - a writer, invoked by [`Parameter::set`] before the local value changes,
//! - a reader, invoked by [`Parameter::read_from_hardware`] and
//!   [`Parameter::refresh_from_hardware`] to bring the mirror in line with the
//!   device.
//!
//! # Data Flow
//!
//! ```text
//! caller: param.set(value)
//!         │
//!         ▼
//!   1. validate (read-only, range, choices)
//!         │ fails here if invalid, nothing is sent
//!         ▼
//!   2. hardware writer (if connected)
//!         │ fails here if the device rejects it, value unchanged
//!         ▼
//!   3. store value, notify watch subscribers
//!         ▼
//!   4. change listeners
//! ```
//!
//! Polling loops use `refresh_from_hardware`, which stores the value read
//! from the device without validation and notifies only when it differs from
//! the current one.

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt::{Debug, Display};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

use crate::error::DaqError;
use crate::observable::{
    value_as, Observable, ObservableMetadata, ParameterAny, ParameterBase,
};

type HardwareWriter<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<(), DaqError>> + Send + Sync>;
type HardwareReader<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, DaqError>> + Send + Sync>;
type ChangeListener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Typed parameter with hardware synchronization.
///
/// ```text
/// Parameter<T>
///   ├─ inner: Observable<T>        (subscriptions, validation, metadata)
///   ├─ hardware_writer: Option<F>  (writes to device)
///   ├─ hardware_reader: Option<F>  (reads from device)
///   └─ change_listeners: Vec<F>    (side effects, e.g. metadata tracking)
/// ```
///
/// Clones share value, metadata and listeners. Hardware callbacks are copied
/// at clone time, so connect them before handing clones out.
#[derive(Clone)]
pub struct Parameter<T>
where
    T: Clone + Send + Sync + PartialEq + Debug + 'static,
{
    inner: Observable<T>,
    hardware_writer: Option<HardwareWriter<T>>,
    hardware_reader: Option<HardwareReader<T>>,
    change_listeners: Arc<RwLock<Vec<ChangeListener<T>>>>,
}

impl<T> Debug for Parameter<T>
where
    T: Clone + Send + Sync + PartialEq + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.name())
            .field("value", &self.get())
            .field("has_writer", &self.hardware_writer.is_some())
            .field("has_reader", &self.hardware_reader.is_some())
            .finish()
    }
}

impl<T> Parameter<T>
where
    T: Clone + Send + Sync + PartialEq + Debug + 'static,
{
    /// Create new parameter with initial value
    pub fn new(name: impl Into<String>, initial: T) -> Self {
        Self {
            inner: Observable::new(name, initial),
            hardware_writer: None,
            hardware_reader: None,
            change_listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Set parameter description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.inner = self.inner.with_description(description);
        self
    }

    /// Set parameter unit
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.inner = self.inner.with_units(unit);
        self
    }

    /// Set custom validation function
    pub fn with_validator(
        mut self,
        validator: impl Fn(&T) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.inner = self.inner.with_validator(validator);
        self
    }

    /// Make parameter read-only
    pub fn read_only(mut self) -> Self {
        self.inner = self.inner.read_only();
        self
    }

    /// Connect hardware write function
    ///
    /// After this, `set()` writes to the device before updating the local
    /// value. If the write fails, the value is left unchanged.
    pub fn connect_to_hardware_write(
        &mut self,
        writer: impl Fn(T) -> BoxFuture<'static, Result<(), DaqError>> + Send + Sync + 'static,
    ) {
        self.hardware_writer = Some(Arc::new(writer));
    }

    /// Connect hardware read function
    pub fn connect_to_hardware_read(
        &mut self,
        reader: impl Fn() -> BoxFuture<'static, Result<T, DaqError>> + Send + Sync + 'static,
    ) {
        self.hardware_reader = Some(Arc::new(reader));
    }

    /// Connect both hardware read and write functions
    pub fn connect_to_hardware(
        &mut self,
        writer: impl Fn(T) -> BoxFuture<'static, Result<(), DaqError>> + Send + Sync + 'static,
        reader: impl Fn() -> BoxFuture<'static, Result<T, DaqError>> + Send + Sync + 'static,
    ) {
        self.connect_to_hardware_write(writer);
        self.connect_to_hardware_read(reader);
    }

    /// Add change listener (called after every accepted change)
    pub async fn add_change_listener(&self, listener: impl Fn(&T) + Send + Sync + 'static) {
        let mut listeners = self.change_listeners.write().await;
        listeners.push(Arc::new(listener));
    }

    /// Get current value
    pub fn get(&self) -> T {
        self.inner.get()
    }

    /// Validate, write to hardware if connected, store and notify.
    ///
    /// Validation happens before the hardware write so an invalid value never
    /// reaches the device.
    pub async fn set(&self, value: T) -> Result<()> {
        self.inner.validate(&value)?;

        if let Some(writer) = &self.hardware_writer {
            writer(value.clone()).await?;
        }

        self.inner.set_unchecked(value.clone());
        self.notify_listeners(&value).await;

        Ok(())
    }

    /// Read the device value and store it unconditionally.
    ///
    /// No validation: the device is the source of truth.
    pub async fn read_from_hardware(&self) -> Result<()> {
        let value = self.fetch_from_hardware().await?;
        self.inner.set_unchecked(value.clone());
        self.notify_listeners(&value).await;
        Ok(())
    }

    /// Read the device value and store it only if it differs from the mirror.
    ///
    /// Subscribers and listeners are notified only on change. Returns `true`
    /// when the value changed.
    pub async fn refresh_from_hardware(&self) -> Result<bool> {
        let value = self.fetch_from_hardware().await?;
        let changed = self.inner.set_if_changed(value.clone());
        if changed {
            self.notify_listeners(&value).await;
        }
        Ok(changed)
    }

    /// Store a value the driver already knows is current, without validation
    /// and without a hardware write. Notifies only on change.
    pub async fn update_from_device(&self, value: T) -> bool {
        let changed = self.inner.set_if_changed(value.clone());
        if changed {
            self.notify_listeners(&value).await;
        }
        changed
    }

    async fn fetch_from_hardware(&self) -> Result<T> {
        let reader = self
            .hardware_reader
            .as_ref()
            .ok_or(DaqError::ParameterNoHardwareReader)?;
        Ok(reader().await?)
    }

    async fn notify_listeners(&self, value: &T) {
        let listeners = self.change_listeners.read().await;
        for listener in listeners.iter() {
            listener(value);
        }
    }

    /// Subscribe to value changes
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.inner.subscribe()
    }

    /// Parameter name
    pub fn name(&self) -> String {
        self.inner.name()
    }

    /// Parameter description
    pub fn description(&self) -> Option<String> {
        self.inner.metadata().description
    }

    /// Unit of measurement
    pub fn unit(&self) -> Option<String> {
        self.inner.metadata().units
    }

    /// Metadata snapshot
    pub fn metadata(&self) -> ObservableMetadata {
        self.inner.metadata()
    }

    /// Underlying observable
    pub fn inner(&self) -> &Observable<T> {
        &self.inner
    }
}

impl<T> Parameter<T>
where
    T: Clone + Send + Sync + PartialEq + PartialOrd + Debug + 'static,
{
    /// Set range constraint (validation only)
    pub fn with_range(mut self, min: T, max: T) -> Self {
        self.inner = self.inner.with_range(min, max);
        self
    }
}

impl Parameter<f64> {
    /// Introspectable range constraint
    pub fn with_range_introspectable(mut self, min: f64, max: f64) -> Self {
        self.inner = self.inner.with_range_introspectable(min, max);
        self
    }

    /// Replace the range constraint at runtime
    pub fn update_range(&self, min: f64, max: f64) {
        self.inner.update_range(min, max);
    }

    /// Current range, if constrained
    pub fn range(&self) -> Option<(f64, f64)> {
        self.inner.range()
    }
}

impl Parameter<i64> {
    /// Introspectable range constraint
    pub fn with_range_introspectable(mut self, min: i64, max: i64) -> Self {
        self.inner = self.inner.with_range_introspectable(min, max);
        self
    }

    /// Replace the range constraint at runtime
    pub fn update_range(&self, min: i64, max: i64) {
        self.inner.update_range(min, max);
    }
}

impl<T> Parameter<T>
where
    T: Clone + Send + Sync + PartialEq + Display + Debug + 'static,
{
    /// Discrete choice constraint, recorded in metadata
    pub fn with_choices(mut self, choices: Vec<T>) -> Self {
        self.inner = self.inner.with_choices_introspectable(choices);
        self
    }

    /// Replace the allowed choices at runtime
    pub fn update_choices(&self, choices: Vec<T>) {
        self.inner.update_choices(choices);
    }

    /// Allowed choices as displayed strings
    pub fn choices(&self) -> Vec<String> {
        self.inner.metadata().enum_values
    }
}

// =============================================================================
// Type-erased access
// =============================================================================

impl<T> ParameterBase for Parameter<T>
where
    T: Clone + Send + Sync + PartialEq + Debug + Serialize + for<'de> Deserialize<'de> + 'static,
{
    fn name(&self) -> String {
        self.inner.name()
    }

    fn get_json(&self) -> Result<serde_json::Value> {
        self.inner.get_json()
    }

    /// Synchronous JSON write. Hardware-backed parameters must be set through
    /// the async [`Parameter::set`], so this is rejected for them.
    fn set_json(&self, value: serde_json::Value) -> Result<()> {
        if self.hardware_writer.is_some() {
            return Err(anyhow!(
                "Parameter '{}' is hardware-backed; use the async setter",
                self.name()
            ));
        }
        self.inner.set_json(value)
    }

    fn metadata(&self) -> ObservableMetadata {
        self.inner.metadata()
    }

    fn has_subscribers(&self) -> bool {
        self.inner.has_subscribers()
    }

    fn subscriber_count(&self) -> usize {
        self.inner.subscriber_count()
    }
}

impl<T> ParameterAny for Parameter<T>
where
    T: Clone + Send + Sync + PartialEq + Debug + Serialize + for<'de> Deserialize<'de> + 'static,
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
