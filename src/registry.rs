//! Process-wide module registration.
//!
//! A module binary registers its factory exactly once during bootstrap; the
//! runtime then pulls it from here. A second registration attempt is
//! rejected rather than silently replacing the first.

use once_cell::sync::OnceCell;
use thiserror::Error;

use crate::runtime::Module;

pub type ModuleFactory = fn() -> Box<dyn Module>;

static FACTORY: OnceCell<ModuleFactory> = OnceCell::new();

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a module factory is already registered")]
    AlreadyRegistered,
}

/// Install the process-wide module factory. Callable exactly once.
pub fn register_module(factory: ModuleFactory) -> Result<(), RegistryError> {
    FACTORY.set(factory).map_err(|_| RegistryError::AlreadyRegistered)
}

pub fn registered_factory() -> Option<ModuleFactory> {
    FACTORY.get().copied()
}
