pub mod manager;
pub mod recorder;

pub use manager::{START_MS, TestManager};
pub use recorder::EventRecorder;

/// Install a `tracing` subscriber honoring `RUST_LOG`. Safe to call from
/// every test; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
