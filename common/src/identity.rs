//! Deterministic identity derivation for VM instances.
//!
//! The controller and the node daemon must agree on the VM id, TAP device
//! name, and guest MAC for a given runner name, so retries and status
//! lookups converge on the same instance. Everything here is a pure
//! function of its input.

use macaddr::MacAddr6;
use sha2::{Digest, Sha256};

/// Linux IFNAMSIZ minus the trailing NUL.
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

const VM_ID_PREFIX_LEN: usize = 6;

/// Derive the VM id for a runner name.
///
/// Format: up to 6 sanitized characters of the runner name, a dash, and the
/// first 8 hex chars of SHA-256 over the full name. At most 15 characters,
/// so the id itself is usable where interface-name limits apply.
pub fn vm_id(runner_name: &str) -> String {
    let digest = Sha256::digest(runner_name.as_bytes());
    let hash = hex::encode(&digest[..4]);

    let prefix: String = runner_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .take(VM_ID_PREFIX_LEN)
        .collect();

    if prefix.is_empty() {
        format!("vm-{hash}")
    } else {
        format!("{prefix}-{hash}")
    }
}

/// Derive the host TAP device name for a VM id.
///
/// Format: "tap" + first 8 hex chars of SHA-256 over the VM id
/// (11 chars, well within the 15-char interface-name limit).
pub fn tap_name(vm_id: &str) -> String {
    let digest = Sha256::digest(vm_id.as_bytes());
    format!("tap{}", hex::encode(&digest[..4]))
}

/// Derive a locally-administered unicast guest MAC for a VM id.
pub fn guest_mac(vm_id: &str) -> MacAddr6 {
    let digest = Sha256::digest(vm_id.as_bytes());
    // 0x06: locally administered, unicast.
    MacAddr6::new(0x06, digest[0], digest[1], digest[2], digest[3], digest[4])
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn vm_id_is_deterministic() {
        assert_eq!(vm_id("acme-1700000000-ab12c"), vm_id("acme-1700000000-ab12c"));
        assert_ne!(vm_id("runner-a"), vm_id("runner-b"));
    }

    #[test]
    fn vm_id_fits_interface_name_limit() {
        for name in [
            "r",
            "a-very-long-runner-deployment-name-1700000000-ab12c",
            "UPPER.case_name",
            "---",
        ] {
            let id = vm_id(name);
            assert!(id.len() <= MAX_INTERFACE_NAME_LEN, "{id} too long");
        }
    }

    #[test]
    fn vm_id_handles_names_with_no_usable_characters() {
        let id = vm_id("---");
        assert!(id.starts_with("vm-"));
    }

    #[test]
    fn tap_name_fits_interface_name_limit() {
        let tap = tap_name(&vm_id("some-runner-name"));
        assert_eq!(tap.len(), 11);
        assert!(tap.starts_with("tap"));
    }

    #[test]
    fn tap_names_do_not_collide_for_distinct_runner_names() {
        let mut seen = HashSet::new();
        for i in 0..2000 {
            for base in ["ci", "build", "deploy-prod", "x"] {
                let tap = tap_name(&vm_id(&format!("{base}-{i}-runner")));
                assert!(seen.insert(tap.clone()), "collision on {tap}");
            }
        }
    }

    #[test]
    fn guest_mac_is_locally_administered_unicast() {
        let mac = guest_mac(&vm_id("runner"));
        let first = mac.as_bytes()[0];
        assert_eq!(first & 0x02, 0x02, "locally administered bit");
        assert_eq!(first & 0x01, 0x00, "unicast bit");
    }
}
