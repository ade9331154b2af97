//! Side work that must never fail a task.
//!
//! [`Warnings::attempt`] runs a fallible step and turns its error into a
//! warning string, so callers cannot accidentally propagate it with `?`.

use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Warnings(Vec<String>);

impl Warnings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, warning: impl Into<String>) {
        self.0.push(warning.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }

    /// Runs `op`; on error records `"<what>: <error>"` and yields `None`.
    pub fn attempt<T>(&mut self, what: &str, op: impl FnOnce() -> Result<T>) -> Option<T> {
        match op() {
            Ok(v) => Some(v),
            Err(err) => {
                log::warn!("{what}: {err}");
                self.push(format!("{what}: {err}"));
                None
            }
        }
    }
}

/// Like [`Warnings::attempt`] for steps with nowhere to record a warning;
/// the failure is only logged.
pub fn log_on_error<T>(what: &str, op: impl FnOnce() -> Result<T>) -> Option<T> {
    match op() {
        Ok(v) => Some(v),
        Err(err) => {
            log::warn!("{what}: {err}");
            None
        }
    }
}
