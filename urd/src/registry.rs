//! The exported metric set
//!
//! Every sample urd collects lands here, keyed by family name and label
//! tuple. Series are created on first write and never removed. The registry
//! wraps a [`metrics::Recorder`] rather than the process-wide recorder so that
//! the collection cycle is handed its sink explicitly: in production this is
//! the Prometheus recorder backing the scrape endpoint, in tests a
//! `DebuggingRecorder`.
//!
//! Writes through the recorder are atomic per series, concurrent writers need
//! no further coordination.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use metrics::{Key, KeyName, Label, Level, Metadata, Recorder, SharedString};
use rustc_hash::FxHashMap;
use tracing::trace;

static METADATA: Metadata<'static> =
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()));

/// Errors produced by [`Registry`]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
pub enum Error {
    /// Counters only move forward by whole amounts; the sample can't be added.
    #[error("sample {0} cannot be added to a counter")]
    InvalidCounterSample(f64),
    /// The sample is NaN.
    #[error("sample is NaN")]
    NotANumber,
}

/// The kind of a metric family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Monotonic, whole-number counter.
    Counter,
    /// Last-value gauge.
    Gauge,
    /// Distribution of observed samples.
    Histogram,
}

/// A named, described metric family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Family {
    /// Exposed metric name.
    pub name: &'static str,
    /// HELP text.
    pub help: &'static str,
}

/// Handle onto the exported metric set, cheap to clone.
#[derive(Clone)]
pub struct Registry {
    recorder: Arc<dyn Recorder + Send + Sync>,
    /// Fractional part of counter samples not yet added, per series.
    remainders: Arc<Mutex<FxHashMap<Key, f64>>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl Registry {
    /// Create a new [`Registry`] writing through `recorder`.
    #[must_use]
    pub fn new<R>(recorder: R) -> Self
    where
        R: Recorder + Send + Sync + 'static,
    {
        Self {
            recorder: Arc::new(recorder),
            remainders: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    /// Publish the HELP text of `family`, a family of `kind` metrics.
    pub fn describe(&self, kind: Kind, family: Family) {
        let name = KeyName::from(family.name);
        let help = SharedString::from(family.help);
        match kind {
            Kind::Counter => self.recorder.describe_counter(name, None, help),
            Kind::Gauge => self.recorder.describe_gauge(name, None, help),
            Kind::Histogram => self.recorder.describe_histogram(name, None, help),
        }
    }

    /// Add `value` to the counter identified by `family` and `labels`.
    ///
    /// Counters move by whole amounts. The fractional part of a sample is
    /// carried per series and added once the carried parts sum to a whole
    /// number, so no part of a sample is lost.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCounterSample`] if the sample is NaN, negative
    /// or beyond `u64::MAX`. The counter is left untouched.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn add_to_counter(
        &self,
        family: &'static str,
        labels: Vec<Label>,
        value: f64,
    ) -> Result<(), Error> {
        if value.is_nan() || value < 0.0 || value >= u64::MAX as f64 {
            return Err(Error::InvalidCounterSample(value));
        }
        let key = Key::from_parts(family, labels);
        let whole = {
            let mut remainders = self
                .remainders
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let total = remainders.get(&key).copied().unwrap_or(0.0) + value;
            if total >= u64::MAX as f64 {
                return Err(Error::InvalidCounterSample(value));
            }
            let whole = total.trunc();
            let carried = total - whole;
            if carried > 0.0 {
                trace!("{family}: carrying {carried} to the next sample");
            }
            remainders.insert(key.clone(), carried);
            whole
        };
        // Guarded by the range check above.
        self.recorder
            .register_counter(&key, &METADATA)
            .increment(whole as u64);
        Ok(())
    }

    /// Overwrite the gauge identified by `family` and `labels` with `value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotANumber`] if the sample is NaN.
    pub fn set_gauge(
        &self,
        family: &'static str,
        labels: Vec<Label>,
        value: f64,
    ) -> Result<(), Error> {
        if value.is_nan() {
            return Err(Error::NotANumber);
        }
        let key = Key::from_parts(family, labels);
        self.recorder.register_gauge(&key, &METADATA).set(value);
        Ok(())
    }

    /// Record `value` into the histogram identified by `family` and `labels`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotANumber`] if the sample is NaN.
    pub fn observe_histogram(
        &self,
        family: &'static str,
        labels: Vec<Label>,
        value: f64,
    ) -> Result<(), Error> {
        if value.is_nan() {
            return Err(Error::NotANumber);
        }
        let key = Key::from_parts(family, labels);
        self.recorder
            .register_histogram(&key, &METADATA)
            .record(value);
        Ok(())
    }
}
