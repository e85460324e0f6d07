//! DID challenge/response verification.
//!
//! The engine is stateless: it issues nonces and verifies signatures over
//! them. Single use of a nonce is enforced by whoever holds the challenge
//! (see [`super::pending`]).
//!
//! Verification is strict Ed25519 over the raw nonce bytes, no prefix or
//! domain separator.

use ed25519_dalek::{Signature, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use shared::did::{self, DidDocument, DidError, KeyMaterial, KeyType, VerificationMethod};
use shared::NONCE_LEN;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("identity did not resolve: {0}")]
    Resolve(#[from] DidError),
    #[error("no key named `{0}` in the document")]
    NoSuchFragment(String),
    #[error("key fragment is empty or names more than one key")]
    AmbiguousFragment,
    #[error("key type {0:?} has no supported signature algorithm")]
    UnsupportedSignatureAlgorithm(KeyType),
    #[error("public key bytes are not a valid key")]
    InvalidPublicKey,
    #[error("signature does not verify")]
    InvalidSignature,
    #[error("identity resolution timed out")]
    ResolutionTimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub identity: String,
    pub nonce: [u8; NONCE_LEN],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub signature: Vec<u8>,
    /// Empty means "the only key".
    pub key_fragment: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Ed25519,
}

#[derive(Debug, Clone)]
pub struct DidAuthEngine {
    resolve_timeout: Duration,
}

impl DidAuthEngine {
    pub fn new(resolve_timeout: Duration) -> Self {
        Self { resolve_timeout }
    }

    pub fn make_challenge(&self, identity: &str) -> Challenge {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        Challenge {
            identity: identity.to_string(),
            nonce,
        }
    }

    /// Resolves `did` to its document. Only `did:key` is supported today and
    /// needs no I/O; other methods will fetch, hence the timeout.
    pub async fn resolve(&self, did: &str) -> Result<DidDocument, VerifyError> {
        let resolution = async { resolve_method(did) };
        tokio::time::timeout(self.resolve_timeout, resolution)
            .await
            .map_err(|_| VerifyError::ResolutionTimedOut)?
            .map_err(VerifyError::from)
    }

    pub async fn verify_response(
        &self,
        response: &Response,
        challenge: &Challenge,
    ) -> Result<(), VerifyError> {
        let document = self.resolve(&challenge.identity).await?;
        verify_with_document(&document, response, challenge)
    }
}

fn resolve_method(identity: &str) -> Result<DidDocument, DidError> {
    let (method, _) = did::parse_did(identity)?;
    match method {
        did::KEY_METHOD => did::resolve_did_key(identity),
        other => Err(DidError::UnsupportedMethod(other.to_string())),
    }
}

pub fn verify_with_document(
    document: &DidDocument,
    response: &Response,
    challenge: &Challenge,
) -> Result<(), VerifyError> {
    let method = select_key(document, &response.key_fragment)?;
    match algorithm_for(method)? {
        SignatureAlgorithm::Ed25519 => {
            verify_ed25519(key_bytes(&method.material), &challenge.nonce, &response.signature)
        }
    }
}

/// Picks the verification method a response names. A one-key document
/// answers for any fragment.
pub fn select_key<'a>(
    document: &'a DidDocument,
    fragment: &str,
) -> Result<&'a VerificationMethod, VerifyError> {
    if let [only] = document.verification_methods.as_slice() {
        return Ok(only);
    }

    // Accept `#frag` and `did:...#frag` as well as a bare fragment.
    let fragment = fragment.rsplit('#').next().unwrap_or(fragment);
    if fragment.is_empty() {
        return Err(VerifyError::AmbiguousFragment);
    }

    let mut matches = document
        .verification_methods
        .iter()
        .filter(|method| method.fragment == fragment);
    match (matches.next(), matches.next()) {
        (Some(method), None) => Ok(method),
        (Some(_), Some(_)) => Err(VerifyError::AmbiguousFragment),
        (None, _) => Err(VerifyError::NoSuchFragment(fragment.to_string())),
    }
}

pub fn algorithm_for(method: &VerificationMethod) -> Result<SignatureAlgorithm, VerifyError> {
    match (&method.key_type, &method.material) {
        (KeyType::Ed25519VerificationKey2018 | KeyType::Ed25519VerificationKey2020, _) => {
            Ok(SignatureAlgorithm::Ed25519)
        }
        (KeyType::JsonWebKey2020, KeyMaterial::Jwk(jwk))
            if jwk.kty == "OKP" && jwk.crv == "Ed25519" =>
        {
            Ok(SignatureAlgorithm::Ed25519)
        }
        (key_type, _) => Err(VerifyError::UnsupportedSignatureAlgorithm(key_type.clone())),
    }
}

fn key_bytes(material: &KeyMaterial) -> &[u8] {
    match material {
        KeyMaterial::Raw(bytes) => bytes,
        KeyMaterial::Jwk(jwk) => &jwk.x,
    }
}

fn verify_ed25519(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), VerifyError> {
    let public_key: &[u8; 32] = public_key
        .try_into()
        .map_err(|_| VerifyError::InvalidPublicKey)?;
    let key = VerifyingKey::from_bytes(public_key).map_err(|_| VerifyError::InvalidPublicKey)?;
    let signature = Signature::from_slice(signature).map_err(|_| VerifyError::InvalidSignature)?;
    key.verify_strict(message, &signature)
        .map_err(|_| VerifyError::InvalidSignature)
}
