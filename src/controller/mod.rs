pub mod jobset;

use crate::jobframework::{IntegrationRegistry, RegistryError};

/// Registers every integration this binary ships with.
pub fn register_integrations(registry: &mut IntegrationRegistry) -> Result<(), RegistryError> {
    jobset::register(registry)?;
    Ok(())
}
