use std::hash::Hasher;
use twox_hash::XxHash32;

/// Computes the 32-bit visitor fingerprint for an (IP, User-Agent) pair.
///
/// Uses xxHash32, a fast non-cryptographic hash. The result is stable for the same
/// pair across days, so "unique visitor" means "distinct IP+UA pair observed".
/// Neither input is stored; collisions and shared NAT addresses are accepted.
pub fn fingerprint(ip: &str, user_agent: &str) -> u32 {
    let mut hasher = XxHash32::with_seed(0);
    hasher.write(ip.as_bytes());
    hasher.write(b"|");
    hasher.write(user_agent.as_bytes());
    // XxHash32 yields its 32-bit digest widened to u64
    u32::try_from(hasher.finish() & u64::from(u32::MAX)).unwrap_or_default()
}
