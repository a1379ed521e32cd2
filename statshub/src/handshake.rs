//! Handshake state machine.
//!
//! A new connection is `Connected` until the hub's Identify frame goes
//! out, then `AwaitingIdentity` until exactly one inbound message decides
//! its fate: `Authenticated` (registered in the registry) or `Rejected`
//! (closed with the matching protocol code). The decision logic lives
//! here as a pure function over the registry; the hub commits the
//! side effects (fleet-size adoption, registration, timer arming,
//! membership broadcast) only on success.

use crate::auth::Authenticator;
use crate::protocol::{ClientOpCode, CloseCode, Envelope, IdentityPayload};
use crate::registry::ClusterRegistry;

/// Successful handshake decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub index: u16,
    /// Fleet size in force after this admission. Equals the declared
    /// count when this is the first member of an empty registry.
    pub fleet_size: u16,
    pub user: String,
}

/// Evaluate the one permitted pre-auth message against the registry.
///
/// Enforced in order: the message must be a decodable Identity envelope
/// (`InvalidOpcode`), the token must authenticate
/// (`AuthenticationFailed`), the declared fleet size must match the
/// established one unless the registry is empty (`InvalidClusterCount`),
/// the declared index must be in range (`InvalidCluster`) and
/// unoccupied (`AlreadyAuthenticated`).
pub fn admit(
    registry: &ClusterRegistry,
    auth: &dyn Authenticator,
    envelope: &Envelope,
) -> Result<Admission, CloseCode> {
    if envelope.op != ClientOpCode::Identity {
        return Err(CloseCode::InvalidOpcode);
    }
    let identity: IdentityPayload = envelope.payload(CloseCode::InvalidOpcode)?;
    if identity.token.is_empty() {
        return Err(CloseCode::InvalidOpcode);
    }

    let user = match auth.authenticate(&identity.token) {
        Ok(Some(user)) => user,
        // A rejected or malformed token both fail the handshake.
        Ok(None) | Err(_) => return Err(CloseCode::AuthenticationFailed),
    };

    let fleet_size = if registry.is_empty() {
        identity.clusters
    } else {
        let established = registry.fleet_size().unwrap_or(identity.clusters);
        if identity.clusters != established {
            return Err(CloseCode::InvalidClusterCount);
        }
        established
    };

    if identity.cluster >= fleet_size {
        return Err(CloseCode::InvalidCluster);
    }
    if registry.contains(identity.cluster) {
        return Err(CloseCode::AlreadyAuthenticated);
    }

    Ok(Admission {
        index: identity.cluster,
        fleet_size,
        user,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuthenticator;
    use crate::protocol::Outbound;
    use crate::registry::ClusterConnection;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn auth() -> StaticAuthenticator {
        let mut users = HashMap::new();
        users.insert("grafana".to_string(), "s3cret".to_string());
        StaticAuthenticator::new(users)
    }

    fn identity_envelope(token: &str, clusters: u16, cluster: u16) -> Envelope {
        Envelope::decode(
            &json!({"op": 1, "d": {"token": token, "clusters": clusters, "cluster": cluster}})
                .to_string(),
        )
        .unwrap()
    }

    fn occupied_registry(
        fleet_size: u16,
        indices: &[u16],
    ) -> (ClusterRegistry, Vec<mpsc::UnboundedReceiver<Outbound>>) {
        let mut registry = ClusterRegistry::new();
        registry.adopt_fleet_size(fleet_size);
        let mut rxs = Vec::new();
        for &index in indices {
            let (tx, rx) = mpsc::unbounded_channel();
            rxs.push(rx);
            registry.insert(ClusterConnection::new(index, "grafana".to_string(), tx));
        }
        (registry, rxs)
    }

    #[test]
    fn test_first_member_adopts_fleet_size() {
        let auth = auth();
        let token = auth.generate_token("grafana").unwrap();
        let registry = ClusterRegistry::new();

        let admission = admit(&registry, &auth, &identity_envelope(&token, 3, 0)).unwrap();
        assert_eq!(
            admission,
            Admission {
                index: 0,
                fleet_size: 3,
                user: "grafana".to_string(),
            }
        );
    }

    #[test]
    fn test_fleet_size_disagreement_rejected() {
        let auth = auth();
        let token = auth.generate_token("grafana").unwrap();
        let (registry, _rxs) = occupied_registry(3, &[0]);

        let err = admit(&registry, &auth, &identity_envelope(&token, 4, 1)).unwrap_err();
        assert_eq!(err, CloseCode::InvalidClusterCount);
    }

    #[test]
    fn test_index_out_of_range_rejected() {
        let auth = auth();
        let token = auth.generate_token("grafana").unwrap();
        let registry = ClusterRegistry::new();

        let err = admit(&registry, &auth, &identity_envelope(&token, 3, 3)).unwrap_err();
        assert_eq!(err, CloseCode::InvalidCluster);
    }

    #[test]
    fn test_occupied_slot_rejected() {
        let auth = auth();
        let token = auth.generate_token("grafana").unwrap();
        let (registry, _rxs) = occupied_registry(3, &[1]);

        let err = admit(&registry, &auth, &identity_envelope(&token, 3, 1)).unwrap_err();
        assert_eq!(err, CloseCode::AlreadyAuthenticated);
    }

    #[test]
    fn test_bad_and_malformed_tokens_rejected() {
        let auth = auth();
        let registry = ClusterRegistry::new();

        let bad = identity_envelope("Z2hvc3Q=.Z2hvc3Q=", 3, 0);
        assert_eq!(
            admit(&registry, &auth, &bad).unwrap_err(),
            CloseCode::AuthenticationFailed
        );

        let malformed = identity_envelope("no-dots-here", 3, 0);
        assert_eq!(
            admit(&registry, &auth, &malformed).unwrap_err(),
            CloseCode::AuthenticationFailed
        );
    }

    #[test]
    fn test_non_identity_first_message_rejected() {
        let auth = auth();
        let registry = ClusterRegistry::new();
        let heartbeat = Envelope::decode(r#"{"op": 0}"#).unwrap();
        assert_eq!(
            admit(&registry, &auth, &heartbeat).unwrap_err(),
            CloseCode::InvalidOpcode
        );
    }

    #[test]
    fn test_missing_payload_rejected() {
        let auth = auth();
        let registry = ClusterRegistry::new();
        let envelope = Envelope::decode(r#"{"op": 1}"#).unwrap();
        assert_eq!(
            admit(&registry, &auth, &envelope).unwrap_err(),
            CloseCode::InvalidOpcode
        );
    }

    #[test]
    fn test_empty_registry_after_departures_readopts() {
        let auth = auth();
        let token = auth.generate_token("grafana").unwrap();
        let (mut registry, _rxs) = occupied_registry(3, &[0]);
        registry.remove(0);

        let admission = admit(&registry, &auth, &identity_envelope(&token, 5, 4)).unwrap();
        assert_eq!(admission.fleet_size, 5);
    }
}
