use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique snapshot path under the system temp dir.
pub fn scratch_path(tag: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!(
        "sushi_supply_{tag}_{}_{seq}.json",
        std::process::id()
    ))
}
