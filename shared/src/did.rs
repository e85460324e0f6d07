//! `did:key` codec.
//!
//! A `did:key` identifier is self-certifying: the public key is the identifier.
//! Layout after the `did:key:` prefix is a multibase string (`z` = base58btc)
//! wrapping `varint(multicodec) || raw public key`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DID_SCHEME: &str = "did";
pub const KEY_METHOD: &str = "key";

/// Multibase prefix for base58btc.
const BASE58BTC_PREFIX: char = 'z';

/// Multicodec code for an Ed25519 public key.
pub const ED25519_PUB_CODEC: u64 = 0xed;
pub const ED25519_PUBKEY_LEN: usize = 32;

/// A u64 LEB128 varint never needs more than ten bytes.
const MAX_VARINT_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DidError {
    #[error("identifier does not start with `did:<method>:`")]
    InvalidPrefix,
    #[error("unsupported DID method `{0}`")]
    UnsupportedMethod(String),
    #[error("method-specific id is not base58btc multibase")]
    NotBase58Btc,
    #[error("multicodec varint would overflow u64")]
    VarintWouldOverflow,
    #[error("multicodec varint is truncated")]
    TruncatedVarint,
    #[error("unsupported public key multicodec {0:#x}")]
    UnsupportedPubkeyType(u64),
    #[error("public key has {0} bytes, expected {expected}", expected = ED25519_PUBKEY_LEN)]
    WrongPubkeyLen(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    Ed25519VerificationKey2018,
    Ed25519VerificationKey2020,
    JsonWebKey2020,
    Other(String),
}

/// Public half of a JSON Web Key. `x` holds the decoded key bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyMaterial {
    Raw(Vec<u8>),
    Jwk(Jwk),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationMethod {
    /// Fragment naming this key within its document, without the leading `#`.
    pub fragment: String,
    pub key_type: KeyType,
    pub material: KeyMaterial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidDocument {
    pub id: String,
    pub verification_methods: Vec<VerificationMethod>,
}

/// Splits `did:<method>:<id>` into method and method-specific id.
pub fn parse_did(did: &str) -> Result<(&str, &str), DidError> {
    let rest = did
        .strip_prefix(DID_SCHEME)
        .and_then(|rest| rest.strip_prefix(':'))
        .ok_or(DidError::InvalidPrefix)?;
    let (method, id) = rest.split_once(':').ok_or(DidError::InvalidPrefix)?;
    if method.is_empty() || id.is_empty() {
        return Err(DidError::InvalidPrefix);
    }
    Ok((method, id))
}

pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Decodes an unsigned LEB128 varint, returning the value and bytes consumed.
pub fn decode_varint(bytes: &[u8]) -> Result<(u64, usize), DidError> {
    let mut value: u64 = 0;
    for (index, byte) in bytes.iter().enumerate() {
        if index >= MAX_VARINT_LEN || (index == MAX_VARINT_LEN - 1 && *byte > 0x01) {
            return Err(DidError::VarintWouldOverflow);
        }
        value |= u64::from(byte & 0x7f) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok((value, index + 1));
        }
    }
    Err(DidError::TruncatedVarint)
}

/// Encodes an Ed25519 public key as a `did:key` identifier.
pub fn encode_pubkey_as_did(pubkey: &[u8; ED25519_PUBKEY_LEN]) -> String {
    let mut bytes = Vec::with_capacity(2 + ED25519_PUBKEY_LEN);
    encode_varint(ED25519_PUB_CODEC, &mut bytes);
    bytes.extend_from_slice(pubkey);
    format!(
        "{}:{}:{}{}",
        DID_SCHEME,
        KEY_METHOD,
        BASE58BTC_PREFIX,
        bs58::encode(bytes).into_string()
    )
}

/// Extracts the raw Ed25519 public key from a `did:key` identifier.
pub fn decode_did_key(did: &str) -> Result<[u8; ED25519_PUBKEY_LEN], DidError> {
    let (method, id) = parse_did(did)?;
    if method != KEY_METHOD {
        return Err(DidError::UnsupportedMethod(method.to_string()));
    }
    decode_multibase_key(id)
}

fn decode_multibase_key(multibase: &str) -> Result<[u8; ED25519_PUBKEY_LEN], DidError> {
    let encoded = multibase
        .strip_prefix(BASE58BTC_PREFIX)
        .ok_or(DidError::NotBase58Btc)?;
    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|_| DidError::NotBase58Btc)?;

    let (codec, consumed) = decode_varint(&bytes)?;
    if codec != ED25519_PUB_CODEC {
        return Err(DidError::UnsupportedPubkeyType(codec));
    }

    let key = &bytes[consumed..];
    key.try_into()
        .map_err(|_| DidError::WrongPubkeyLen(key.len()))
}

/// Resolves a `did:key` identifier to its one-key document. The key's fragment
/// is the multibase string itself, as `did:key` documents name it.
pub fn resolve_did_key(did: &str) -> Result<DidDocument, DidError> {
    let key = decode_did_key(did)?;
    let (_, multibase) = parse_did(did)?;
    Ok(DidDocument {
        id: did.to_string(),
        verification_methods: vec![VerificationMethod {
            fragment: multibase.to_string(),
            key_type: KeyType::Ed25519VerificationKey2018,
            material: KeyMaterial::Raw(key.to_vec()),
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn multibase_of(bytes: &[u8]) -> String {
        format!("did:key:z{}", bs58::encode(bytes).into_string())
    }

    #[test]
    fn test_encode_then_resolve_returns_original_key() {
        for _ in 0..32 {
            let signing_key = SigningKey::generate(&mut OsRng);
            let pubkey = signing_key.verifying_key().to_bytes();

            let did = encode_pubkey_as_did(&pubkey);
            let document = resolve_did_key(&did).unwrap();

            assert_eq!(document.id, did);
            assert_eq!(document.verification_methods.len(), 1);
            match &document.verification_methods[0].material {
                KeyMaterial::Raw(bytes) => assert_eq!(bytes.as_slice(), &pubkey),
                other => panic!("unexpected key material {:?}", other),
            }
        }
    }

    #[test]
    fn test_ed25519_did_has_well_known_prefix() {
        let did = encode_pubkey_as_did(&[7u8; 32]);
        assert!(did.starts_with("did:key:z6Mk"), "got {}", did);
    }

    #[test]
    fn test_fragment_is_multibase_id() {
        let did = encode_pubkey_as_did(&[9u8; 32]);
        let document = resolve_did_key(&did).unwrap();
        assert_eq!(
            format!("did:key:{}", document.verification_methods[0].fragment),
            did
        );
    }

    #[test]
    fn test_invalid_prefix() {
        assert_eq!(resolve_did_key("dod:key:z6Mk"), Err(DidError::InvalidPrefix));
        assert_eq!(resolve_did_key("did:key"), Err(DidError::InvalidPrefix));
        assert_eq!(resolve_did_key(""), Err(DidError::InvalidPrefix));
        assert_eq!(resolve_did_key("did::abc"), Err(DidError::InvalidPrefix));
    }

    #[test]
    fn test_unsupported_method() {
        assert_eq!(
            resolve_did_key("did:web:example.com"),
            Err(DidError::UnsupportedMethod("web".to_string()))
        );
    }

    #[test]
    fn test_not_base58btc() {
        assert_eq!(resolve_did_key("did:key:f0123"), Err(DidError::NotBase58Btc));
        // 0, O, I and l are outside the base58 alphabet.
        assert_eq!(resolve_did_key("did:key:z0OIl"), Err(DidError::NotBase58Btc));
    }

    #[test]
    fn test_unsupported_pubkey_type() {
        let mut bytes = Vec::new();
        encode_varint(0xe7, &mut bytes);
        bytes.extend_from_slice(&[2u8; 33]);
        assert_eq!(
            resolve_did_key(&multibase_of(&bytes)),
            Err(DidError::UnsupportedPubkeyType(0xe7))
        );
    }

    #[test]
    fn test_wrong_pubkey_len() {
        let mut bytes = Vec::new();
        encode_varint(ED25519_PUB_CODEC, &mut bytes);
        bytes.extend_from_slice(&[1u8; 31]);
        assert_eq!(
            resolve_did_key(&multibase_of(&bytes)),
            Err(DidError::WrongPubkeyLen(31))
        );
    }

    #[test]
    fn test_varint_overflow_and_truncation() {
        assert_eq!(decode_varint(&[0xff; 11]), Err(DidError::VarintWouldOverflow));
        assert_eq!(
            decode_varint(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x02]),
            Err(DidError::VarintWouldOverflow)
        );
        assert_eq!(decode_varint(&[0x80]), Err(DidError::TruncatedVarint));
        assert_eq!(decode_varint(&[]), Err(DidError::TruncatedVarint));
    }

    #[test]
    fn test_varint_roundtrip_boundaries() {
        for value in [0u64, 1, 0x7f, 0x80, 0xed, 0x3fff, 0x4000, u64::MAX] {
            let mut bytes = Vec::new();
            encode_varint(value, &mut bytes);
            assert_eq!(decode_varint(&bytes), Ok((value, bytes.len())));
        }
        let mut ed = Vec::new();
        encode_varint(ED25519_PUB_CODEC, &mut ed);
        assert_eq!(ed, vec![0xed, 0x01]);
    }
}
