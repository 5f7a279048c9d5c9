//! Stable keys for routers, services, and middlewares in a snapshot.
//!
//! A fingerprint is the lowercase hex encoding of a truncated SHA-256 over
//! the qualified identity of a service port (optionally scoped by an access
//! target). Truncation keeps the keys readable on the mesh-node API;
//! collisions are detected at build time rather than silently overwritten.

use sha2::{Digest, Sha256};

/// Number of hex digits kept from the digest.
const DIGEST_LEN: usize = 10;

/// Keys a router/service pair for a user service port.
pub fn service_key(name: &str, namespace: &str, port: u16) -> String {
    digest(&format!("{}.{}.{}", name, namespace, port))
}

/// Keys a router/service pair for a user service port scoped by an access
/// target.
pub fn target_key(
    name: &str,
    namespace: &str,
    port: u16,
    target_name: &str,
    target_namespace: &str,
) -> String {
    digest(&format!(
        "{}.{}.{}.{}.{}",
        name, namespace, port, target_name, target_namespace
    ))
}

fn digest(input: &str) -> String {
    let hash = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(DIGEST_LEN);
    for byte in hash.iter() {
        out.push_str(&format!("{:02x}", byte));
        if out.len() >= DIGEST_LEN {
            break;
        }
    }
    out.truncate(DIGEST_LEN);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_stable() {
        assert_eq!(
            service_key("demo", "default", 80),
            service_key("demo", "default", 80)
        );
        assert_eq!(
            target_key("demo", "default", 80, "tt", "default"),
            target_key("demo", "default", 80, "tt", "default")
        );
    }

    #[test]
    fn keys_are_lowercase_hex() {
        let key = service_key("demo", "default", 80);
        assert_eq!(key.len(), 10);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn identity_distinguishes_keys() {
        let base = service_key("demo", "default", 80);
        assert_ne!(base, service_key("demo", "default", 81));
        assert_ne!(base, service_key("demo", "other", 80));
        assert_ne!(base, service_key("demo2", "default", 80));
        assert_ne!(base, target_key("demo", "default", 80, "tt", "default"));
    }
}
