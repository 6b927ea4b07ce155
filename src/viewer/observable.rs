//! Observable Parameters
//!
//! Reactive viewer settings using `tokio::sync::watch` for multi-subscriber
//! notifications. Every parameter carries the metadata a host needs to
//! render it (title, kind, units, visibility, allowed values) and can be read
//! or written generically as JSON through [`ParameterBase`].
//!
//! # Example
//!
//! ```rust
//! use basler_daq::viewer::observable::{Observable, ParamKind};
//!
//! let exposure = Observable::new("exposure_time", 1.0)
//!     .with_title("Exposure Time (ms)")
//!     .with_kind(ParamKind::Float)
//!     .with_range(0.01, 10_000.0);
//!
//! let rx = exposure.subscribe();
//! exposure.set(20.0).unwrap();
//! assert_eq!(*rx.borrow(), 20.0);
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::watch;

/// Base trait for all parameters, providing type-erased access to common operations.
pub trait ParameterBase: Send + Sync {
    /// Parameter name
    fn name(&self) -> &str;

    /// Current value as JSON
    fn get_json(&self) -> Result<serde_json::Value>;

    /// Set the value from JSON
    fn set_json(&self, value: serde_json::Value) -> Result<()>;

    /// Parameter metadata
    fn metadata(&self) -> &ObservableMetadata;
}

/// Widget kind a host uses to present the parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    /// Free text.
    Str,
    /// Integer number.
    Int,
    /// Floating point number.
    Float,
    /// Checkbox.
    Bool,
    /// Push button that resets itself once handled.
    BoolPush,
    /// One of `limits`.
    List,
}

/// Metadata for an observable parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservableMetadata {
    /// Parameter name (unique within the settings tree)
    pub name: String,
    /// Human-readable title
    pub title: String,
    /// Enclosing group, e.g. `timing_opts`
    pub group: Option<String>,
    /// Physical units (e.g. "ms", "um")
    pub units: Option<String>,
    /// Widget kind
    pub kind: ParamKind,
    /// Whether the host may write this parameter
    pub read_only: bool,
    /// Whether the host should display this parameter
    pub visible: bool,
    /// Allowed values of a [`ParamKind::List`] parameter
    pub limits: Vec<serde_json::Value>,
}

impl ObservableMetadata {
    /// Path in the settings tree, `group/name` or `name`.
    pub fn path(&self) -> String {
        match &self.group {
            Some(group) => format!("{}/{}", group, self.name),
            None => self.name.clone(),
        }
    }
}

/// A thread-safe, observable value with change notifications.
pub struct Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    sender: watch::Sender<T>,
    metadata: ObservableMetadata,
    validator: Option<Arc<dyn Fn(&T) -> Result<()> + Send + Sync>>,
}

impl<T: Clone + Send + Sync + 'static> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("metadata", &self.metadata)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new observable with an initial value. The title defaults to the name.
    pub fn new(name: impl Into<String>, initial_value: T) -> Self {
        let (sender, _) = watch::channel(initial_value);
        let name = name.into();
        Self {
            sender,
            metadata: ObservableMetadata {
                title: name.clone(),
                name,
                group: None,
                units: None,
                kind: ParamKind::Str,
                read_only: false,
                visible: true,
                limits: Vec::new(),
            },
            validator: None,
        }
    }

    /// Set the display title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.metadata.title = title.into();
        self
    }

    /// Place the parameter in a group.
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.metadata.group = Some(group.into());
        self
    }

    /// Add units to this observable.
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.metadata.units = Some(units.into());
        self
    }

    /// Set the widget kind.
    pub fn with_kind(mut self, kind: ParamKind) -> Self {
        self.metadata.kind = kind;
        self
    }

    /// Mark this observable as read-only.
    pub fn read_only(mut self) -> Self {
        self.metadata.read_only = true;
        self
    }

    /// Start hidden.
    pub fn hidden(mut self) -> Self {
        self.metadata.visible = false;
        self
    }

    /// Add a custom validator function.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Get the current value (clone).
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Get the parameter name.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Get the metadata.
    pub fn metadata(&self) -> &ObservableMetadata {
        &self.metadata
    }

    /// Show or hide the parameter.
    pub fn set_visible(&mut self, visible: bool) {
        self.metadata.visible = visible;
    }

    /// Change the display title.
    pub fn set_title(&mut self, title: impl Into<String>) {
        self.metadata.title = title.into();
    }

    /// Change the widget kind.
    pub fn set_kind(&mut self, kind: ParamKind) {
        self.metadata.kind = kind;
    }

    /// Set a new value, notifying all subscribers.
    ///
    /// Returns error if:
    /// - Parameter is read-only
    /// - Validation fails
    pub fn set(&self, value: T) -> Result<()> {
        if self.metadata.read_only {
            return Err(anyhow!("Parameter '{}' is read-only", self.metadata.name));
        }

        if let Some(validator) = &self.validator {
            validator(&value)?;
        }

        self.sender.send_replace(value);
        Ok(())
    }

    /// Set value bypassing read-only and validation, for values the viewer reports.
    pub(crate) fn set_unchecked(&self, value: T) {
        self.sender.send_replace(value);
    }

    /// Subscribe to value changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + Serialize + for<'de> Deserialize<'de> + 'static,
{
    /// Allowed values, turning this into a [`ParamKind::List`] parameter.
    pub fn with_limits(mut self, limits: &[T]) -> Self {
        self.set_limits(limits);
        self.metadata.kind = ParamKind::List;
        self
    }

    /// Replace the allowed values.
    pub fn set_limits(&mut self, limits: &[T]) {
        self.metadata.limits = limits
            .iter()
            .filter_map(|v| serde_json::to_value(v).ok())
            .collect();
    }

    /// Get the current value as JSON
    pub fn get_json(&self) -> Result<serde_json::Value> {
        let value = self.get();
        serde_json::to_value(&value).map_err(|e| {
            anyhow!(
                "Failed to serialize parameter '{}': {}",
                self.metadata.name,
                e
            )
        })
    }

    /// Set the value from JSON
    pub fn set_json(&self, json_value: serde_json::Value) -> Result<()> {
        if self.metadata.kind == ParamKind::List
            && !self.metadata.limits.is_empty()
            && !self.metadata.limits.contains(&json_value)
        {
            return Err(anyhow!(
                "Value {} is not one of the choices of '{}'",
                json_value,
                self.metadata.name
            ));
        }
        let value: T = serde_json::from_value(json_value).map_err(|e| {
            anyhow!(
                "Failed to deserialize parameter '{}': {}. Expected type: {}",
                self.metadata.name,
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
    fn name(&self) -> &str {
        &self.metadata.name
    }

    fn get_json(&self) -> Result<serde_json::Value> {
        Observable::get_json(self)
    }

    fn set_json(&self, value: serde_json::Value) -> Result<()> {
        Observable::set_json(self, value)
    }

    fn metadata(&self) -> &ObservableMetadata {
        &self.metadata
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + PartialOrd + Debug + 'static,
{
    /// Add min/max range validation.
    pub fn with_range(mut self, min: T, max: T) -> Self {
        self.validator = Some(Arc::new(move |value: &T| {
            if value < &min || value > &max {
                Err(anyhow!(
                    "Value {:?} out of range [{:?}, {:?}]",
                    value,
                    min,
                    max
                ))
            } else {
                Ok(())
            }
        }));
        self
    }
}
