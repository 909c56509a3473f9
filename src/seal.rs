//! Actions-secret sealing.
//!
//! GitHub stores repository secrets encrypted with libsodium's sealed-box
//! construction and validates the format server-side, so this must match it
//! byte for byte: an ephemeral X25519 keypair, a 24-byte nonce derived as
//! BLAKE2b-192(ephemeral_pk || recipient_pk), a Curve25519-XSalsa20-Poly1305
//! box, and base64(ephemeral_pk || ciphertext) as the wire form.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::Aead;
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use rand_core::OsRng;

use crate::errors::SealError;

const PUBLIC_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

/// Seal `plaintext` for the repository whose Actions public key is
/// `recipient_key_base64` (as returned by GitHub's public-key endpoint).
/// Returns the base64 `encrypted_value` to PUT back to GitHub.
pub fn seal(plaintext: &[u8], recipient_key_base64: &str) -> Result<String, SealError> {
    let recipient = decode_public_key(recipient_key_base64)?;
    let ephemeral = SecretKey::generate(&mut OsRng);
    let sealed = seal_with_ephemeral(plaintext, &recipient, &ephemeral)?;
    Ok(BASE64.encode(sealed))
}

/// The sealed-box construction with the ephemeral key supplied by the
/// caller. Split out so tests can run it deterministically; `seal` is the
/// fresh-key entry point.
pub fn seal_with_ephemeral(
    plaintext: &[u8],
    recipient: &PublicKey,
    ephemeral: &SecretKey,
) -> Result<Vec<u8>, SealError> {
    let ephemeral_pk = ephemeral.public_key();
    let nonce = sealed_box_nonce(&ephemeral_pk, recipient);

    let ciphertext = SalsaBox::new(recipient, ephemeral)
        .encrypt(GenericArray::from_slice(&nonce), plaintext)
        .map_err(|_| SealError::Encryption)?;

    let mut sealed = Vec::with_capacity(PUBLIC_KEY_LEN + ciphertext.len());
    sealed.extend_from_slice(ephemeral_pk.as_bytes());
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Nonce = BLAKE2b-192 over the two public keys, ephemeral first. Both
/// sides can recompute it, which is what lets the box travel without one.
fn sealed_box_nonce(ephemeral_pk: &PublicKey, recipient_pk: &PublicKey) -> [u8; NONCE_LEN] {
    let mut hasher = Blake2bVar::new(NONCE_LEN).expect("24 is a valid blake2b output length");
    hasher.update(ephemeral_pk.as_bytes());
    hasher.update(recipient_pk.as_bytes());
    let mut nonce = [0u8; NONCE_LEN];
    hasher
        .finalize_variable(&mut nonce)
        .expect("output buffer matches configured length");
    nonce
}

fn decode_public_key(key_base64: &str) -> Result<PublicKey, SealError> {
    let bytes = BASE64
        .decode(key_base64)
        .map_err(SealError::InvalidKeyEncoding)?;
    let bytes: [u8; PUBLIC_KEY_LEN] =
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| SealError::InvalidKeyLength {
                expected: PUBLIC_KEY_LEN,
                actual: bytes.len(),
            })?;
    Ok(PublicKey::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Recipient-side opening, used only to verify what we seal.
    fn open(sealed: &[u8], recipient: &SecretKey) -> Option<Vec<u8>> {
        if sealed.len() < PUBLIC_KEY_LEN {
            return None;
        }
        let mut pk_bytes = [0u8; PUBLIC_KEY_LEN];
        pk_bytes.copy_from_slice(&sealed[..PUBLIC_KEY_LEN]);
        let ephemeral_pk = PublicKey::from(pk_bytes);
        let nonce = sealed_box_nonce(&ephemeral_pk, &recipient.public_key());
        SalsaBox::new(&ephemeral_pk, recipient)
            .decrypt(GenericArray::from_slice(&nonce), &sealed[PUBLIC_KEY_LEN..])
            .ok()
    }

    fn recipient_keypair() -> (SecretKey, String) {
        let secret = SecretKey::generate(&mut OsRng);
        let public_b64 = BASE64.encode(secret.public_key().as_bytes());
        (secret, public_b64)
    }

    #[test]
    fn test_sealed_value_decrypts_to_plaintext() {
        let (secret, public_b64) = recipient_keypair();

        let sealed_b64 = seal(b"hunter2", &public_b64).unwrap();
        let sealed = BASE64.decode(sealed_b64).unwrap();

        assert_eq!(open(&sealed, &secret).unwrap(), b"hunter2");
    }

    #[test]
    fn test_sealing_twice_differs_but_opens_identically() {
        let (secret, public_b64) = recipient_keypair();

        let first = seal(b"same plaintext", &public_b64).unwrap();
        let second = seal(b"same plaintext", &public_b64).unwrap();

        // Fresh ephemeral key per call means distinct ciphertexts.
        assert_ne!(first, second);
        for sealed_b64 in [first, second] {
            let sealed = BASE64.decode(sealed_b64).unwrap();
            assert_eq!(open(&sealed, &secret).unwrap(), b"same plaintext");
        }
    }

    #[test]
    fn test_sealed_length_is_plaintext_plus_overhead() {
        let (_, public_b64) = recipient_keypair();
        let sealed = BASE64.decode(seal(b"0123456789", &public_b64).unwrap()).unwrap();
        // ephemeral pk (32) + poly1305 tag (16) + plaintext
        assert_eq!(sealed.len(), 32 + 16 + 10);
    }

    #[test]
    fn test_deterministic_with_injected_ephemeral_key() {
        let recipient = SecretKey::from([7u8; 32]);
        let ephemeral = SecretKey::from([9u8; 32]);

        let first =
            seal_with_ephemeral(b"payload", &recipient.public_key(), &ephemeral).unwrap();
        let second =
            seal_with_ephemeral(b"payload", &recipient.public_key(), &ephemeral).unwrap();

        assert_eq!(first, second);
        assert_eq!(open(&first, &recipient).unwrap(), b"payload");
    }

    #[test]
    fn test_nonce_depends_on_both_keys() {
        let a = SecretKey::from([1u8; 32]).public_key();
        let b = SecretKey::from([2u8; 32]).public_key();

        assert_ne!(sealed_box_nonce(&a, &b), sealed_box_nonce(&b, &a));
        assert_eq!(sealed_box_nonce(&a, &b), sealed_box_nonce(&a, &b));
    }

    #[test]
    fn test_rejects_malformed_recipient_key() {
        assert!(matches!(
            seal(b"x", "not base64!!!"),
            Err(SealError::InvalidKeyEncoding(_))
        ));
        let short = BASE64.encode([0u8; 16]);
        assert!(matches!(
            seal(b"x", &short),
            Err(SealError::InvalidKeyLength {
                expected: 32,
                actual: 16
            })
        ));
    }
}
