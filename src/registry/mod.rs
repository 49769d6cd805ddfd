//! Entity registry and startup bootstrap

mod bootstrap;
#[allow(clippy::module_inception)]
mod registry;

pub use bootstrap::{load_bootstrap, parse_bootstrap, EntitySpec};
pub use registry::{Registry, RegistrySnapshot};
