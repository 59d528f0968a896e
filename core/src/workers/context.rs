// Dedicated execution contexts for worker placement
use crate::lifetime::Lifetime;
use crate::Result;
use tokio::runtime::{Builder, Handle};
use tracing::debug;

/// Starts a single-threaded runtime on its own OS thread and returns its
/// handle. The thread exits when `lifetime` ends.
pub fn dedicated_context(name: &str, lifetime: &Lifetime) -> Result<Handle> {
    let runtime = Builder::new_current_thread().enable_all().build()?;
    let handle = runtime.handle().clone();
    let token = lifetime.token();
    let thread_name = name.to_string();

    std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            runtime.block_on(token.cancelled());
            debug!(target: "workers", context = %thread_name, "execution context stopped");
        })?;

    Ok(handle)
}
