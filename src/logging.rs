//! Structured logging bootstrap (spec.md §6.2 ambient logging).
//!
//! An idempotent library entry point guarded by a `OnceCell`, rather than a
//! binary's one-shot `main`, since [`crate::Registry::load`] may be called
//! more than once per process (e.g. once per test).

use once_cell::sync::OnceCell;

static INIT: OnceCell<()> = OnceCell::new();

/// Install a global `tracing` subscriber on first call; a no-op thereafter.
pub fn init_tracing() {
    INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(true)
            .with_level(true)
            .try_init();
    });
}
