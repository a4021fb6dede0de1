//! Key layout
//!
//! Peers live at `/<namespace>/<peer-id>` with the raw address as value.

/// Prefix covering every peer of a namespace, including the trailing slash.
pub fn namespace_prefix(namespace: &str) -> String {
    format!("/{}/", namespace)
}

/// Key under which a peer registers itself.
pub fn peer_key(namespace: &str, peer_id: &str) -> String {
    format!("/{}/{}", namespace, peer_id)
}

/// Extract the peer id from a key, if the key belongs to `prefix`.
pub fn peer_id_from_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix).filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(namespace_prefix("orders"), "/orders/");
        assert_eq!(peer_key("orders", "node-1"), "/orders/node-1");
    }

    #[test]
    fn test_peer_id_from_key() {
        let prefix = namespace_prefix("orders");
        assert_eq!(peer_id_from_key(&prefix, "/orders/node-1"), Some("node-1"));
        assert_eq!(peer_id_from_key(&prefix, "/orders/"), None);
        assert_eq!(peer_id_from_key(&prefix, "/orders-v2/node-1"), None);
        assert_eq!(peer_id_from_key(&prefix, "/billing/node-1"), None);
    }
}
