//! Gossipsub router configuration.

use base64::{Engine as _, engine::general_purpose::URL_SAFE};
use libp2p::gossipsub::{self, ConfigBuilderError, MessageId, ValidationMode};
use sha2::{Digest, Sha256};

/// Content-addressed message identity: `base64url(sha256(data))`.
///
/// The id depends only on the payload bytes, so the same message relayed
/// by different peers collapses to one identity in the router's duplicate
/// cache. Full padded encoding, no truncation.
pub fn message_id(data: &[u8]) -> String {
    URL_SAFE.encode(Sha256::digest(data))
}

/// [`message_id`] in the shape the router wants.
fn gossip_message_id(message: &gossipsub::Message) -> MessageId {
    MessageId::from(message_id(&message.data))
}

/// Router configuration for the target networks.
///
/// Message signing and strict signature verification are both off: the
/// crawled networks do not sign at the pubsub layer, and a verifying
/// router would drop every message.
pub fn gossipsub_config() -> Result<gossipsub::Config, ConfigBuilderError> {
    gossipsub::ConfigBuilder::default()
        .validation_mode(ValidationMode::Anonymous)
        .message_id_fn(gossip_message_id)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_depends_only_on_data() {
        let a = message_id(b"same payload");
        let b = message_id(b"same payload");
        let c = message_id(b"other payload");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn message_id_is_padded_base64url_of_sha256() {
        // sha256 of the empty string, base64url with padding.
        assert_eq!(message_id(b""), "47DEQpj8HBSa-_TImW-5JCeuQeRkm5NMpJWZG3hSuFU=");
        // 32 bytes of digest always encode to 44 characters.
        assert_eq!(message_id(b"x").len(), 44);
    }

    #[test]
    fn config_builds() {
        assert!(gossipsub_config().is_ok());
    }
}
