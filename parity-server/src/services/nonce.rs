use chrono::Utc;
use rand::{RngCore, rngs::OsRng};
use tracing::warn;
use uuid::Uuid;

const NONCE_BYTES: usize = 32;

/// Generate a per-task nonce: 32 random bytes, hex encoded. If the system RNG
/// fails the server keeps accepting tasks with a time-based token instead of
/// refusing work.
pub fn generate() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => hex::encode(bytes),
        Err(e) => {
            warn!("System RNG unavailable, falling back to time-based nonce: {e}");
            let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
            format!("{nanos}-{}", Uuid::new_v4())
        }
    }
}

/// The nonce appearing in the runner's output is the proof that the submitted
/// command actually ran.
pub fn verify(nonce: &str, output: &str) -> bool {
    !nonce.is_empty() && !output.is_empty() && output.contains(nonce)
}
