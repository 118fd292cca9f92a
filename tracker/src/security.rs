use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

// Sync messages are authenticated with HMAC-SHA256 over the exact JSON body,
// keyed by a secret shared between the tracker instances.

pub fn sign(secret: &str, message: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

// Constant-time verification; a forged or tampered body must not be
// distinguishable by timing.
pub fn verify(secret: &str, message: &[u8], signature_hex: &str) -> bool {
    let signature = match hex::decode(signature_hex) {
        Ok(signature) => signature,
        Err(_) => return false,
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(message);
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_round_trip() {
        let body = br#"{"from_node_id":"n1"}"#;
        let sig = sign("secret", body);
        assert_eq!(sig.len(), 64);
        assert!(verify("secret", body, &sig));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let sig = sign("secret", b"payload");
        assert!(!verify("secret", b"payload2", &sig));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let sig = sign("secret", b"payload");
        assert!(!verify("other", b"payload", &sig));
    }

    #[test]
    fn test_garbage_signature_rejected() {
        assert!(!verify("secret", b"payload", "not hex"));
        assert!(!verify("secret", b"payload", ""));
    }
}
