//! Stream filters.
//!
//! A filter transforms a byte stream on its way from an exporter to the
//! storage writer. Filters are declared once in configuration, referenced by
//! name from device options, and may be shared by several devices at once;
//! each [`start`](Filter::start) call works on its own stream pair.

pub mod regexp;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ConfigError, Options};
use crate::exporter::ByteStream;
use crate::pipe::PipeWriter;

/// An immutable stream transformer.
pub trait Filter: Send + Sync {
    /// Launch the transformation: consume `src` to end-of-stream and close
    /// `dst` when done, carrying any read error into the close. `start`
    /// itself must not block on I/O.
    fn start(&self, dst: PipeWriter, src: ByteStream);
}

impl std::fmt::Debug for dyn Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Filter")
    }
}

/// Filter driver constructor.
pub type NewFilterFn = fn(&Options) -> Result<Arc<dyn Filter>, ConfigError>;

/// Name-keyed filter driver lookup. Populated once at startup; read-only
/// thereafter.
pub struct FilterRegistry {
    drivers: HashMap<String, NewFilterFn>,
}

impl FilterRegistry {
    /// An empty registry with no drivers.
    pub fn empty() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, driver: NewFilterFn) {
        self.drivers.insert(name.into(), driver);
    }

    pub fn create(&self, name: &str, options: &Options) -> Result<Arc<dyn Filter>, ConfigError> {
        match self.drivers.get(name) {
            Some(driver) => driver(options),
            None => Err(ConfigError::UnknownFilter(name.to_string())),
        }
    }
}

impl Default for FilterRegistry {
    /// The built-in driver set.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("regexp", regexp::new_regexp);
        registry
    }
}
