use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Lowercase-hex `HMAC_SHA256(secret, body)` — signs the exact bytes sent
/// on the wire, no timestamp prefix (the receiver has nothing else to
/// recompute the signature against).
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a signature against the body under the given secret, in
/// constant time. This is the helper the engine exposes to receivers
/// implementing the verifier-side recipe in the wire contract.
pub fn verify(secret: &str, body: &[u8], signature: &str) -> bool {
    let expected = sign(secret, body);
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

/// Generates a new secret with at least 128 bits of entropy, hex-encoded.
pub fn generate_secret() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let secret = "whsec_test_secret";
        let body = br#"{"id":"x1"}"#;

        let sig = sign(secret, body);
        assert!(verify(secret, body, &sig));
        assert!(!verify("wrong_secret", body, &sig));
        assert!(!verify(secret, b"different body", &sig));
    }

    #[test]
    fn signature_matches_spec_recipe() {
        // hex(HMAC_SHA256(secret, raw_request_body)) == header
        let secret = "s3cr3t";
        let body = br#"{"id":"x1"}"#;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let expected = hex::encode(mac.finalize().into_bytes());
        assert_eq!(sign(secret, body), expected);
    }

    #[test]
    fn generated_secret_has_enough_entropy() {
        let secret = generate_secret();
        // 32 bytes hex-encoded -> 64 hex chars -> 256 bits, well above the 128-bit floor.
        assert_eq!(secret.len(), 64);
        assert_ne!(generate_secret(), generate_secret());
    }
}
