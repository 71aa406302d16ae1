//! Tokio runtime shared by the object_store bridge

use std::sync::{Arc, OnceLock};
use tokio::runtime::Runtime;

/// Get or create the process-wide runtime that drives object_store futures
///
/// Pool workers call `block_on` on it; they are plain OS threads, never
/// runtime threads, so blocking here is allowed.
pub(crate) fn shared_runtime() -> std::io::Result<Arc<Runtime>> {
    static RUNTIME: OnceLock<Arc<Runtime>> = OnceLock::new();

    if let Some(runtime) = RUNTIME.get() {
        return Ok(runtime.clone());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .thread_name("flux-stream-io")
        .build()?;

    // A racing initializer may have won; its runtime is the one everyone shares.
    Ok(RUNTIME.get_or_init(|| Arc::new(runtime)).clone())
}
