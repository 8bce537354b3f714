//! Peer identity assignment
//!
//! A connecting client either presents a previously issued identifier in its `peerid`
//! cookie, which is reused unchanged, or receives a freshly minted one together with a
//! `Set-Cookie` value for the handshake response. A `peerid` cookie is never overwritten:
//! an unusable one gets a session-only identifier.

use uuid::Uuid;

use crate::config::PEER_ID_COOKIE;
use crate::protocol::PeerId;

/// Longest token value accepted from a client
const MAX_TOKEN_LEN: usize = 64;

/// Outcome of resolving a connection's identity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// Identifier for this connection
    pub peer_id: PeerId,
    /// `Set-Cookie` header value, present only when the id was newly minted
    pub set_cookie: Option<String>,
}

/// Resolve the identity for a handshake carrying the given `Cookie` header
pub fn resolve(cookie_header: Option<&str>) -> ResolvedIdentity {
    match cookie_header.and_then(cookie_token) {
        Some(token) if is_valid_token(token) => ResolvedIdentity {
            peer_id: PeerId::from(token),
            set_cookie: None,
        },
        Some(_) => ResolvedIdentity {
            peer_id: generate_peer_id(),
            set_cookie: None,
        },
        None => {
            let peer_id = generate_peer_id();
            let set_cookie = Some(set_cookie_value(&peer_id));
            ResolvedIdentity { peer_id, set_cookie }
        }
    }
}

/// Mint a new identifier: a random v4 UUID in 8-4-4-4-12 form
pub fn generate_peer_id() -> PeerId {
    PeerId::new(Uuid::new_v4().to_string())
}

/// Extract the identifier from a `Cookie` header, if a usable one is present
pub fn peer_id_from_cookie(header: &str) -> Option<PeerId> {
    cookie_token(header)
        .filter(|value| is_valid_token(value))
        .map(PeerId::from)
}

fn cookie_token(header: &str) -> Option<&str> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == PEER_ID_COOKIE)
        .map(|(_, value)| value.trim())
}

/// `Set-Cookie` value persisting `peer_id` on the client
pub fn set_cookie_value(peer_id: &PeerId) -> String {
    format!("{}={}; SameSite=Strict; Secure", PEER_ID_COOKIE, peer_id)
}

fn is_valid_token(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_TOKEN_LEN
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_id_format() {
        for _ in 0..100 {
            let id = generate_peer_id();
            let groups: Vec<&str> = id.as_str().split('-').collect();

            assert_eq!(
                groups.iter().map(|g| g.len()).collect::<Vec<_>>(),
                vec![8, 4, 4, 4, 12]
            );
            assert!(id
                .as_str()
                .chars()
                .all(|c| c == '-' || c.is_ascii_hexdigit()));
            assert!(groups[2].starts_with('4'));
            assert!(matches!(groups[3].chars().next(), Some('8' | '9' | 'a' | 'b')));
        }
    }

    #[test]
    fn test_generated_ids_differ() {
        assert_ne!(generate_peer_id(), generate_peer_id());
    }

    #[test]
    fn test_existing_cookie_is_reused() {
        let resolved = resolve(Some("theme=dark; peerid=0f3c2a1b-1111-4222-8333-444455556666"));
        assert_eq!(
            resolved.peer_id.as_str(),
            "0f3c2a1b-1111-4222-8333-444455556666"
        );
        assert!(resolved.set_cookie.is_none());
    }

    #[test]
    fn test_missing_cookie_mints_and_persists() {
        let resolved = resolve(None);
        let cookie = resolved.set_cookie.expect("new id must be persisted");
        assert!(cookie.starts_with(&format!("peerid={};", resolved.peer_id)));
        assert!(cookie.contains("SameSite=Strict"));
        assert!(cookie.contains("Secure"));

        let other = resolve(Some("theme=dark"));
        assert!(other.set_cookie.is_some());
    }

    #[test]
    fn test_unusable_cookie_is_ignored() {
        assert!(peer_id_from_cookie("peerid=").is_none());
        assert!(peer_id_from_cookie("peerid=<script>").is_none());
        assert!(peer_id_from_cookie(&format!("peerid={}", "a".repeat(65))).is_none());
        assert!(peer_id_from_cookie("xpeerid=abc").is_none());
    }

    #[test]
    fn test_unusable_cookie_is_not_overwritten() {
        let resolved = resolve(Some("theme=dark; peerid=<script>"));
        assert!(resolved.set_cookie.is_none());
        assert_eq!(resolved.peer_id.as_str().len(), 36);
        assert_ne!(resolved.peer_id.as_str(), "<script>");

        let empty = resolve(Some("peerid="));
        assert!(empty.set_cookie.is_none());
        assert!(!empty.peer_id.as_str().is_empty());
    }
}
