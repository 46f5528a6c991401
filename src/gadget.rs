//! Pluggable gadgets driven by tracers.
//!
//! A gadget is started against an existing tracer: it receives the tracer's
//! filter map pin and publishes its output on the tracer's stream.
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::container::Selector;
use crate::tracer::GadgetStream;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("gadget `{0}` is already registered")]
    Duplicate(String),
    #[error("unknown gadget `{0}`")]
    Unknown(String),
    #[error("gadget `{name}` failed to start: {reason}")]
    Start { name: String, reason: String },
    #[error("a gadget is already running for tracer `{0}`")]
    AlreadyRunning(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Everything a gadget needs to run for one tracer.
#[derive(Debug, Clone)]
pub struct GadgetContext {
    pub tracer_id: String,
    pub selector: Selector,
    /// Pin of the tracer's `mntnsset` map, to be reused by the gadget's BPF programs.
    pub filter_pin: PathBuf,
    pub node: String,
    pub parameters: BTreeMap<String, String>,
    pub stream: Arc<GadgetStream>,
}

pub trait Gadget: Send + Sync + fmt::Debug {
    fn start(&mut self, ctx: GadgetContext) -> Result<()>;

    fn stop(&mut self);
}

pub type GadgetFactory = Arc<dyn Fn() -> Box<dyn Gadget> + Send + Sync>;

/// Named gadget factories.
#[derive(Default, Clone)]
pub struct GadgetRegistry {
    factories: BTreeMap<String, (String, GadgetFactory)>,
}

impl fmt::Debug for GadgetRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

impl GadgetRegistry {
    pub fn register<F>(&mut self, name: &str, description: &str, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn Gadget> + Send + Sync + 'static,
    {
        if self.factories.contains_key(name) {
            return Err(Error::Duplicate(name.to_owned()));
        }
        self.factories.insert(
            name.to_owned(),
            (description.to_owned(), Arc::new(factory)),
        );
        Ok(())
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn Gadget>> {
        self.factories
            .get(name)
            .map(|(_, factory)| factory())
            .ok_or_else(|| Error::Unknown(name.to_owned()))
    }

    /// Names and descriptions, ordered by name.
    pub fn list(&self) -> Vec<(String, String)> {
        self.factories
            .iter()
            .map(|(name, (description, _))| (name.clone(), description.clone()))
            .collect()
    }
}
