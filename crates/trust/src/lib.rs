//! Controller trust verification.
//!
//! Before any policy sync or data upload the agent proves it is talking to
//! the real controller: the controller answers a handshake with a fresh
//! nonce, a timestamp, and an RSA SHA-256 signature over
//! `"{nonce}:{timestamp}"`, and we check that signature against the public
//! key pinned at pairing time. A bounded timestamp window rejects replays.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::sha2::Sha256;
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};

use pw_domain::{Error, Result, VerifyDenied};

/// Replay window: challenges older than this are rejected. The bound is
/// inclusive (an exactly 30s-old timestamp still verifies).
pub const MAX_CHALLENGE_AGE_MS: i64 = 30_000;

/// Minimum decoded nonce length in bytes.
pub const MIN_NONCE_BYTES: usize = 32;

/// How long one successful verification remains valid before the next sync
/// requires a fresh handshake.
pub const VERIFICATION_VALIDITY_SECS: i64 = 24 * 60 * 60;

/// The controller's answer to `GET /api/agent/handshake`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakePayload {
    /// Base64 of at least 32 random bytes, fresh per handshake.
    pub nonce: String,
    /// Controller clock, epoch milliseconds.
    pub timestamp: i64,
    /// Base64 PKCS#1 v1.5 RSA-SHA256 signature over `"{nonce}:{timestamp}"`.
    pub signature: String,
    pub version: String,
}

/// Verifies handshake payloads against the pinned controller key.
pub struct TrustVerifier {
    key: VerifyingKey<Sha256>,
}

impl TrustVerifier {
    /// Build a verifier from the pinned PEM public key. Accepts both
    /// SubjectPublicKeyInfo (`BEGIN PUBLIC KEY`) and PKCS#1
    /// (`BEGIN RSA PUBLIC KEY`) encodings.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|e| Error::Config(format!("pinned public key is not a valid RSA PEM: {e}")))?;
        Ok(Self {
            key: VerifyingKey::<Sha256>::new(key),
        })
    }

    /// Build from an optional configured key, failing with
    /// `ParentUnverified(NoPinnedKey)` when none is provisioned.
    pub fn from_config(pinned: Option<&str>) -> Result<Self> {
        match pinned {
            Some(pem) if !pem.trim().is_empty() => Self::from_pem(pem),
            _ => Err(Error::ParentUnverified(VerifyDenied::NoPinnedKey)),
        }
    }

    /// Verify a handshake payload at local time `now_ms`.
    ///
    /// Never mutates any state: a failed verification leaves policies and
    /// queues untouched by construction.
    pub fn verify(&self, payload: &HandshakePayload, now_ms: i64) -> Result<()> {
        let nonce_bytes = BASE64
            .decode(&payload.nonce)
            .map_err(|_| Error::ParentUnverified(VerifyDenied::MalformedResponse))?;
        if nonce_bytes.len() < MIN_NONCE_BYTES {
            return Err(Error::ParentUnverified(VerifyDenied::MalformedResponse));
        }

        let age_ms = now_ms - payload.timestamp;
        if age_ms < 0 {
            return Err(Error::ParentUnverified(VerifyDenied::ClockSkew));
        }
        if age_ms > MAX_CHALLENGE_AGE_MS {
            return Err(Error::ParentUnverified(VerifyDenied::StaleChallenge));
        }

        let sig_bytes = BASE64
            .decode(&payload.signature)
            .map_err(|_| Error::ParentUnverified(VerifyDenied::MalformedResponse))?;
        let signature = Signature::try_from(sig_bytes.as_slice())
            .map_err(|_| Error::ParentUnverified(VerifyDenied::MalformedResponse))?;

        let challenge = format!("{}:{}", payload.nonce, payload.timestamp);
        self.key
            .verify(challenge.as_bytes(), &signature)
            .map_err(|_| Error::ParentUnverified(VerifyDenied::SignatureMismatch))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1v15::SigningKey;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::signature::{SignatureEncoding, Signer};
    use rsa::RsaPrivateKey;

    fn keypair() -> (SigningKey<Sha256>, String) {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let pem = private
            .to_public_key()
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();
        (SigningKey::<Sha256>::new(private), pem)
    }

    fn signed_payload(signer: &SigningKey<Sha256>, timestamp: i64) -> HandshakePayload {
        let nonce = BASE64.encode([7u8; 32]);
        let challenge = format!("{nonce}:{timestamp}");
        let signature = BASE64.encode(signer.sign(challenge.as_bytes()).to_bytes());
        HandshakePayload {
            nonce,
            timestamp,
            signature,
            version: "1.0.0".into(),
        }
    }

    #[test]
    fn valid_handshake_verifies() {
        let (signer, pem) = keypair();
        let verifier = TrustVerifier::from_pem(&pem).unwrap();
        let now = 1_700_000_000_000;
        let payload = signed_payload(&signer, now - 5_000);
        verifier.verify(&payload, now).unwrap();
    }

    #[test]
    fn age_window_boundary_is_inclusive() {
        let (signer, pem) = keypair();
        let verifier = TrustVerifier::from_pem(&pem).unwrap();
        let now = 1_700_000_000_000;

        let at_limit = signed_payload(&signer, now - MAX_CHALLENGE_AGE_MS);
        verifier.verify(&at_limit, now).unwrap();

        let past_limit = signed_payload(&signer, now - MAX_CHALLENGE_AGE_MS - 1);
        match verifier.verify(&past_limit, now) {
            Err(Error::ParentUnverified(VerifyDenied::StaleChallenge)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn future_timestamp_is_clock_skew() {
        let (signer, pem) = keypair();
        let verifier = TrustVerifier::from_pem(&pem).unwrap();
        let now = 1_700_000_000_000;
        let payload = signed_payload(&signer, now + 1);
        match verifier.verify(&payload, now) {
            Err(Error::ParentUnverified(VerifyDenied::ClockSkew)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn replayed_handshake_goes_stale() {
        let (signer, pem) = keypair();
        let verifier = TrustVerifier::from_pem(&pem).unwrap();
        let t0 = 1_700_000_000_000;
        let payload = signed_payload(&signer, t0);
        verifier.verify(&payload, t0 + 1_000).unwrap();
        // Captured and replayed 60s later: rejected, nothing mutated.
        match verifier.verify(&payload, t0 + 60_000) {
            Err(Error::ParentUnverified(VerifyDenied::StaleChallenge)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn wrong_key_is_signature_mismatch() {
        let (signer_b, _) = keypair();
        let (_, pem_a) = keypair();
        let verifier = TrustVerifier::from_pem(&pem_a).unwrap();
        let now = 1_700_000_000_000;
        // Signed by K_B, verified against pinned K_A.
        let payload = signed_payload(&signer_b, now - 1_000);
        match verifier.verify(&payload, now) {
            Err(Error::ParentUnverified(VerifyDenied::SignatureMismatch)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn short_nonce_is_malformed() {
        let (signer, pem) = keypair();
        let verifier = TrustVerifier::from_pem(&pem).unwrap();
        let now = 1_700_000_000_000;
        let mut payload = signed_payload(&signer, now);
        payload.nonce = BASE64.encode([1u8; 8]);
        match verifier.verify(&payload, now) {
            Err(Error::ParentUnverified(VerifyDenied::MalformedResponse)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn missing_key_is_no_pinned_key() {
        match TrustVerifier::from_config(None) {
            Err(Error::ParentUnverified(VerifyDenied::NoPinnedKey)) => {}
            other => panic!("unexpected: {:?}", other.err()),
        }
        match TrustVerifier::from_config(Some("  ")) {
            Err(Error::ParentUnverified(VerifyDenied::NoPinnedKey)) => {}
            other => panic!("unexpected: {:?}", other.err()),
        }
    }

    #[test]
    fn garbage_signature_is_malformed() {
        let (signer, pem) = keypair();
        let verifier = TrustVerifier::from_pem(&pem).unwrap();
        let now = 1_700_000_000_000;
        let mut payload = signed_payload(&signer, now);
        payload.signature = "!!not-base64!!".into();
        match verifier.verify(&payload, now) {
            Err(Error::ParentUnverified(VerifyDenied::MalformedResponse)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
