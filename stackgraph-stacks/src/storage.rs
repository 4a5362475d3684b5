//! Volume / claim binding checks
//!
//! A claim binds to a volume when both name the same storage class, share an
//! access mode, and the claim's request fits in the volume's capacity. The
//! local volumes used here carry a required node affinity, so every pod that
//! mounts the claim is scheduled onto that single node: losing the node means
//! losing the workload until it comes back.

use crate::error::StorageError;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};

const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Parse a Kubernetes quantity (`10Gi`, `500M`, `1.5Ti`, `100m`, `1e3`)
/// into whole bytes. Fractional results round up, as the API server does.
pub fn parse_quantity(quantity: &str) -> Result<u64, StorageError> {
    let quantity = quantity.trim();
    let invalid = || StorageError::InvalidQuantity(quantity.to_string());

    let split = quantity
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);

    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if fraction.contains('.') {
        return Err(invalid());
    }
    let digits: u128 = format!("{}{}", whole, fraction).parse().map_err(|_| invalid())?;
    let scale = u32::try_from(fraction.len()).map_err(|_| invalid())?;

    // (binary power of 1024, decimal exponent)
    let (binary, exponent): (u32, i32) = match suffix {
        "" => (0, 0),
        "Ki" => (1, 0),
        "Mi" => (2, 0),
        "Gi" => (3, 0),
        "Ti" => (4, 0),
        "Pi" => (5, 0),
        "Ei" => (6, 0),
        "m" => (0, -3),
        "k" => (0, 3),
        "M" => (0, 6),
        "G" => (0, 9),
        "T" => (0, 12),
        "P" => (0, 15),
        "E" => (0, 18),
        _ => match suffix.strip_prefix(['e', 'E']) {
            Some(exponent) => (0, exponent.parse().map_err(|_| invalid())?),
            None => return Err(invalid()),
        },
    };

    let pow10 = |exp: u32| 10u128.checked_pow(exp).ok_or_else(invalid);
    let mut numerator = digits
        .checked_mul(1024u128.pow(binary))
        .ok_or_else(invalid)?;
    let mut denominator = pow10(scale)?;
    if exponent >= 0 {
        numerator = numerator
            .checked_mul(pow10(exponent.unsigned_abs())?)
            .ok_or_else(invalid)?;
    } else {
        denominator = denominator
            .checked_mul(pow10(exponent.unsigned_abs())?)
            .ok_or_else(invalid)?;
    }

    u64::try_from(numerator.div_ceil(denominator)).map_err(|_| invalid())
}

/// Result of a successful binding check
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub storage_class: String,
    pub access_modes: Vec<String>,
    pub requested_bytes: u64,
    pub capacity_bytes: u64,
    /// Nodes the volume (and every pod using the claim) is pinned to
    pub pinned_nodes: Vec<String>,
}

/// Verify the claim can bind to the volume
pub fn check_binding(
    volume: &PersistentVolume,
    claim: &PersistentVolumeClaim,
) -> Result<Binding, StorageError> {
    let volume_name = volume.metadata.name.clone().unwrap_or_default();
    let claim_name = claim.metadata.name.clone().unwrap_or_default();
    let pv_spec = volume.spec.as_ref().ok_or_else(|| missing(&volume_name, "spec"))?;
    let pvc_spec = claim.spec.as_ref().ok_or_else(|| missing(&claim_name, "spec"))?;

    let volume_class = pv_spec.storage_class_name.clone().unwrap_or_default();
    let claim_class = pvc_spec.storage_class_name.clone().unwrap_or_default();
    if volume_class != claim_class {
        return Err(StorageError::StorageClassMismatch {
            volume: volume_class,
            claim: claim_class,
        });
    }

    let volume_modes = pv_spec.access_modes.clone().unwrap_or_default();
    let claim_modes = pvc_spec.access_modes.clone().unwrap_or_default();
    let shared: Vec<String> = claim_modes
        .iter()
        .filter(|mode| volume_modes.contains(mode))
        .cloned()
        .collect();
    if shared.is_empty() {
        return Err(StorageError::AccessModeMismatch {
            volume: volume_modes,
            claim: claim_modes,
        });
    }

    let capacity = pv_spec
        .capacity
        .as_ref()
        .and_then(|capacity| capacity.get("storage"))
        .ok_or_else(|| missing(&volume_name, "capacity.storage"))?;
    let requested = pvc_spec
        .resources
        .as_ref()
        .and_then(|resources| resources.requests.as_ref())
        .and_then(|requests| requests.get("storage"))
        .ok_or_else(|| missing(&claim_name, "resources.requests.storage"))?;
    let capacity_bytes = parse_quantity(&capacity.0)?;
    let requested_bytes = parse_quantity(&requested.0)?;
    if requested_bytes > capacity_bytes {
        return Err(StorageError::InsufficientCapacity {
            requested: requested.0.clone(),
            capacity: capacity.0.clone(),
        });
    }

    if let Some(claim_ref) = &pv_spec.claim_ref {
        let expected = format!(
            "{}/{}",
            claim_ref.namespace.clone().unwrap_or_default(),
            claim_ref.name.clone().unwrap_or_default()
        );
        let actual = format!(
            "{}/{}",
            claim.metadata.namespace.clone().unwrap_or_default(),
            claim_name
        );
        if expected != actual {
            return Err(StorageError::ClaimRefMismatch { expected, actual });
        }
    }

    Ok(Binding {
        storage_class: volume_class,
        access_modes: shared,
        requested_bytes,
        capacity_bytes,
        pinned_nodes: pinned_nodes(volume)?,
    })
}

/// Hostnames named by the volume's required node affinity
pub fn pinned_nodes(volume: &PersistentVolume) -> Result<Vec<String>, StorageError> {
    let nodes: Vec<String> = volume
        .spec
        .as_ref()
        .and_then(|spec| spec.node_affinity.as_ref())
        .and_then(|affinity| affinity.required.as_ref())
        .map(|selector| {
            selector
                .node_selector_terms
                .iter()
                .flat_map(|term| term.match_expressions.iter().flatten())
                .filter(|expr| expr.key == HOSTNAME_LABEL && expr.operator == "In")
                .flat_map(|expr| expr.values.iter().flatten().cloned())
                .collect()
        })
        .unwrap_or_default();

    if nodes.is_empty() {
        return Err(StorageError::MissingNodeAffinity);
    }
    Ok(nodes)
}

fn missing(object: &str, field: &'static str) -> StorageError {
    StorageError::MissingField {
        object: object.to_string(),
        field,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn volume(capacity: &str, class: &str) -> PersistentVolume {
        serde_json::from_value(json!({
            "metadata": {"name": "jenkins-pv-volume"},
            "spec": {
                "storageClassName": class,
                "claimRef": {"name": "jenkins-pv-claim", "namespace": "jenkins"},
                "capacity": {"storage": capacity},
                "accessModes": ["ReadWriteOnce"],
                "local": {"path": "/mnt"},
                "nodeAffinity": {"required": {"nodeSelectorTerms": [{
                    "matchExpressions": [{
                        "key": "kubernetes.io/hostname",
                        "operator": "In",
                        "values": ["docker-desktop"]
                    }]
                }]}}
            }
        }))
        .unwrap()
    }

    fn claim(request: &str, modes: &[&str]) -> PersistentVolumeClaim {
        serde_json::from_value(json!({
            "metadata": {"name": "jenkins-pv-claim", "namespace": "jenkins"},
            "spec": {
                "storageClassName": "local-storage",
                "accessModes": modes,
                "resources": {"requests": {"storage": request}}
            }
        }))
        .unwrap()
    }

    #[test]
    fn parses_binary_and_decimal_suffixes() {
        assert_eq!(parse_quantity("1Gi").unwrap(), 1_073_741_824);
        assert_eq!(parse_quantity("10Gi").unwrap(), 10 * 1_073_741_824);
        assert_eq!(parse_quantity("500M").unwrap(), 500_000_000);
        assert_eq!(parse_quantity("1.5Ki").unwrap(), 1536);
        assert_eq!(parse_quantity("2048").unwrap(), 2048);
        assert!(parse_quantity("10GB").is_err());
        assert!(parse_quantity("Gi").is_err());
        assert!(parse_quantity("1.2.3").is_err());
    }

    #[test]
    fn parses_milli_and_exponent_forms() {
        assert_eq!(parse_quantity("1500m").unwrap(), 2);
        assert_eq!(parse_quantity("2000m").unwrap(), 2);
        assert_eq!(parse_quantity("1e3").unwrap(), 1000);
        assert_eq!(parse_quantity("12E6").unwrap(), 12_000_000);
        assert_eq!(parse_quantity("5e-1").unwrap(), 1);
    }

    #[test]
    fn large_quantities_stay_exact() {
        assert_eq!(parse_quantity("8Ei").unwrap() - 1, (1u64 << 63) - 1);
        assert_eq!(parse_quantity("9007199254740993").unwrap(), 9_007_199_254_740_993);
        assert!(parse_quantity("16Ei").is_err());
    }

    #[test]
    fn small_claim_binds_to_large_volume() {
        let binding = check_binding(&volume("10Gi", "local-storage"), &claim("1Gi", &["ReadWriteOnce"])).unwrap();
        assert!(binding.requested_bytes <= binding.capacity_bytes);
        assert_eq!(binding.storage_class, "local-storage");
        assert_eq!(binding.pinned_nodes, vec!["docker-desktop".to_string()]);
    }

    #[test]
    fn claim_equal_to_capacity_binds() {
        assert!(check_binding(&volume("10Gi", "local-storage"), &claim("10Gi", &["ReadWriteOnce"])).is_ok());
    }

    #[test]
    fn oversized_claim_is_rejected() {
        let err = check_binding(&volume("10Gi", "local-storage"), &claim("11Gi", &["ReadWriteOnce"])).unwrap_err();
        assert!(matches!(err, StorageError::InsufficientCapacity { .. }));
    }

    #[test]
    fn class_and_access_mode_must_match() {
        let err = check_binding(&volume("10Gi", "standard"), &claim("1Gi", &["ReadWriteOnce"])).unwrap_err();
        assert!(matches!(err, StorageError::StorageClassMismatch { .. }));

        let err = check_binding(&volume("10Gi", "local-storage"), &claim("1Gi", &["ReadWriteMany"])).unwrap_err();
        assert!(matches!(err, StorageError::AccessModeMismatch { .. }));
    }

    #[test]
    fn claim_ref_must_name_the_claim() {
        let mut other = claim("1Gi", &["ReadWriteOnce"]);
        other.metadata.namespace = Some("default".to_string());
        let err = check_binding(&volume("10Gi", "local-storage"), &other).unwrap_err();
        assert_eq!(
            err,
            StorageError::ClaimRefMismatch {
                expected: "jenkins/jenkins-pv-claim".to_string(),
                actual: "default/jenkins-pv-claim".to_string(),
            }
        );
    }

    #[test]
    fn unpinned_volume_is_reported() {
        let mut pv = volume("10Gi", "local-storage");
        pv.spec.as_mut().unwrap().node_affinity = None;
        assert_eq!(pinned_nodes(&pv), Err(StorageError::MissingNodeAffinity));
    }
}
