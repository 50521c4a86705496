//! Authentication utilities

use ed25519_dalek::{Signature, VerifyingKey};

/// Domain separator prefixed to every connection challenge
pub const CHALLENGE_CONTEXT: &[u8] = b"Cipherpost-auth-v1";

/// The exact bytes a client signs to answer `nonce`
pub fn challenge_message(nonce: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(CHALLENGE_CONTEXT.len() + nonce.len());
    message.extend_from_slice(CHALLENGE_CONTEXT);
    message.extend_from_slice(nonce);
    message
}

/// Verify a challenge signature
///
/// Used for WebSocket authentication. The client must sign
/// a server-provided challenge with their Ed25519 identity key.
pub fn verify_challenge(pubkey_bytes: &[u8], signature_bytes: &[u8], challenge: &[u8]) -> bool {
    let Ok(pubkey_array) = <[u8; 32]>::try_from(pubkey_bytes) else {
        return false;
    };
    let Ok(pubkey) = VerifyingKey::from_bytes(&pubkey_array) else {
        return false;
    };
    let Ok(sig_array) = <[u8; 64]>::try_from(signature_bytes) else {
        return false;
    };

    let signature = Signature::from_bytes(&sig_array);
    pubkey.verify_strict(challenge, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    #[test]
    fn accepts_signature_over_context_and_nonce() {
        let key = SigningKey::generate(&mut OsRng);
        let nonce = [7u8; 32];
        let signature = key.sign(&challenge_message(&nonce));

        assert!(verify_challenge(
            key.verifying_key().as_bytes(),
            &signature.to_bytes(),
            &challenge_message(&nonce),
        ));
    }

    #[test]
    fn rejects_bare_nonce_and_malformed_input() {
        let key = SigningKey::generate(&mut OsRng);
        let nonce = [9u8; 32];
        let bare = key.sign(&nonce);

        assert!(!verify_challenge(
            key.verifying_key().as_bytes(),
            &bare.to_bytes(),
            &challenge_message(&nonce),
        ));
        assert!(!verify_challenge(&[1, 2, 3], &bare.to_bytes(), &nonce));
        assert!(!verify_challenge(key.verifying_key().as_bytes(), &[0u8; 10], &nonce));
    }
}
