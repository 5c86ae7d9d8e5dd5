//! Narrow traits through which the subsystem consumes engine services.
//!
//! All of these are mock-friendly seams: the engine provides production
//! implementations (distributed lock manager, OS liveness probe, metadata
//! formats) and the tests provide local doubles.

use std::sync::Arc;

use monsnap_error::Result;

use crate::format::Format;
use crate::ids::RelationId;

/// Blocking-notification callback fired by the lock manager on a holder when
/// another actor requests an incompatible mode.
///
/// Handlers must be short, idempotent and absorb their own errors; they run
/// on a lock-manager-supplied thread.
pub type AstCallback = Arc<dyn Fn() + Send + Sync>;

/// Lock compatibility mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Opaque handle to a granted lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockHandle(pub u64);

/// The engine's distributed lock manager, reduced to what the monitor
/// coordination protocol needs.
pub trait LockManager: Send + Sync {
    /// Acquire `name` in `mode`.
    ///
    /// With `wait`, blocks until granted or the engine's wait limit expires
    /// (`MonError::LockTimeout`). A registered `ast` fires when a later
    /// actor requests an incompatible mode while this grant is held.
    fn acquire(
        &self,
        name: &str,
        mode: LockMode,
        wait: bool,
        ast: Option<AstCallback>,
    ) -> Result<LockHandle>;

    /// Release a previously granted handle. Unknown handles are a no-op.
    fn release(&self, handle: LockHandle);
}

/// Liveness oracle for contributing processes.
pub trait ProcessOracle: Send + Sync {
    /// Whether `pid` is a live process on this host.
    fn is_process_alive(&self, pid: u32) -> bool;
}

/// Source of row formats for the virtual monitoring relations.
pub trait FormatRegistry: Send + Sync {
    /// The engine's current format for `relation`.
    fn format_for(&self, relation: RelationId) -> Format;
}

/// Format registry rendering the engine's built-in metadata layouts.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemFormatRegistry;

impl FormatRegistry for SystemFormatRegistry {
    fn format_for(&self, relation: RelationId) -> Format {
        crate::format::system_format(relation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_registry_serves_every_relation() {
        let registry = SystemFormatRegistry;
        for rel in RelationId::ALL {
            assert_eq!(registry.format_for(rel).relation(), rel);
        }
    }

    #[test]
    fn lock_manager_is_object_safe() {
        fn _accepts_dyn(_m: &dyn LockManager) {}
        fn _accepts_oracle(_o: &dyn ProcessOracle) {}
        fn _accepts_registry(_r: &dyn FormatRegistry) {}
    }
}
