//! Stage 1 of backend selection (§4.D): session affinity short-circuit.
//!
//! The affinity map is purely in-memory, owned by one
//! [`crate::services::service_instance::ServiceInstance`] alongside its
//! `ServiceConfig`, and rebuilt empty on cold start (§5 "Shared resource
//! discipline") — it is never part of the persisted `ServiceConfig`
//! itself. The session key is always an opaque, server-generated value
//! for the `cookie` affinity type; a client cookie value is looked up
//! against the map, never decoded into a backend id.

use std::collections::HashMap;

use uuid::Uuid;

use crate::models::backend::{now_ms, TimestampMs};
use crate::models::service::{AffinityType, SessionAffinity};

#[derive(Debug, Clone)]
pub struct AffinityEntry {
    pub pool_id: String,
    pub backend_id: String,
    pub expires_at: TimestampMs,
}

/// `sessionKey -> (poolId, backendId, expiresAt)`, per §3.
#[derive(Debug, Default)]
pub struct AffinityMap {
    entries: HashMap<String, AffinityEntry>,
}

impl AffinityMap {
    /// Returns the entry for `key` if present and unexpired, dropping it
    /// (lazy expiry, per §3 lifecycle) if its TTL has passed.
    pub fn get_live(&mut self, key: &str, now: TimestampMs) -> Option<AffinityEntry> {
        match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    pub fn insert(&mut self, key: String, pool_id: String, backend_id: String, ttl_ms: u64, now: TimestampMs) {
        self.entries.insert(
            key,
            AffinityEntry {
                pool_id,
                backend_id,
                expires_at: now + ttl_ms,
            },
        );
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// The inputs Stage 1 needs from the inbound request; left generic over
/// the HTTP framework so the selection logic stays frame-work agnostic.
#[derive(Debug, Clone, Copy, Default)]
pub struct AffinitySources<'a> {
    pub cookie: Option<&'a str>,
    pub header: Option<&'a str>,
    pub client_ip: Option<&'a str>,
}

/// A resolved session key plus whether it was newly minted (meaning the
/// caller must write it back to the client as a `Set-Cookie`, since
/// nothing in the request carried it).
#[derive(Debug, Clone)]
pub struct SessionKey {
    pub value: String,
    pub freshly_generated: bool,
}

/// Derives the session key for `affinity`'s configured type from the
/// request. `cookie` affinity mints a fresh opaque key when the client
/// sent none; `ip_cookie` and `header` never mint — their key is
/// whatever the request already carries, or no affinity applies.
pub fn resolve_session_key(affinity: &SessionAffinity, sources: &AffinitySources) -> Option<SessionKey> {
    match affinity.affinity_type {
        AffinityType::Cookie => Some(match sources.cookie {
            Some(value) if !value.is_empty() => SessionKey {
                value: value.to_string(),
                freshly_generated: false,
            },
            _ => SessionKey {
                value: Uuid::new_v4().to_string(),
                freshly_generated: true,
            },
        }),
        AffinityType::IpCookie => sources.client_ip.map(|ip| SessionKey {
            value: ip.to_string(),
            freshly_generated: false,
        }),
        AffinityType::Header => sources.header.map(|value| SessionKey {
            value: value.to_string(),
            freshly_generated: false,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn affinity(kind: AffinityType) -> SessionAffinity {
        SessionAffinity {
            affinity_type: kind,
            name: "aff".to_string(),
            ttl_ms: 1000,
            update_on_revival: false,
        }
    }

    #[test]
    fn cookie_affinity_reuses_existing_value() {
        let sources = AffinitySources { cookie: Some("existing-key"), ..Default::default() };
        let key = resolve_session_key(&affinity(AffinityType::Cookie), &sources).unwrap();
        assert_eq!(key.value, "existing-key");
        assert!(!key.freshly_generated);
    }

    #[test]
    fn cookie_affinity_mints_opaque_key_when_absent() {
        let sources = AffinitySources::default();
        let key = resolve_session_key(&affinity(AffinityType::Cookie), &sources).unwrap();
        assert!(key.freshly_generated);
        assert!(!key.value.is_empty());
    }

    #[test]
    fn header_affinity_is_none_without_the_header() {
        let sources = AffinitySources::default();
        assert!(resolve_session_key(&affinity(AffinityType::Header), &sources).is_none());
    }

    #[test]
    fn map_expires_entries_lazily() {
        let mut map = AffinityMap::default();
        map.insert("k".to_string(), "p1".to_string(), "b1".to_string(), 10, 0);
        assert!(map.get_live("k", 5).is_some());
        assert!(map.get_live("k", 20).is_none());
        assert_eq!(map.len(), 0);
    }
}
