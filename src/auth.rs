//! Ownership tokens stand in for accounts: whoever holds the plaintext issued
//! at creation may manage the poll. Only a SHA-256 digest is stored.

use rand::rngs::OsRng;
use rand::Rng;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::AppError;
use crate::store::{PollStore, StoreError};

pub const TOKEN_LENGTH: usize = 26;

/// RFC 4648 base32 alphabet. 26 symbols carry 130 bits.
const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

#[derive(Debug, Clone)]
pub struct Token {
    pub plaintext: String,
    pub digest: Vec<u8>,
}

impl Token {
    pub fn generate() -> Self {
        let mut rng = OsRng;
        let plaintext: String = (0..TOKEN_LENGTH)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        let digest = digest(&plaintext);
        Token { plaintext, digest }
    }
}

pub fn digest(plaintext: &str) -> Vec<u8> {
    Sha256::digest(plaintext.as_bytes()).to_vec()
}

pub fn is_well_formed(plaintext: &str) -> bool {
    plaintext.len() == TOKEN_LENGTH && plaintext.bytes().all(|b| ALPHABET.contains(&b))
}

/// Resolves a bearer credential to the poll it was issued for. A malformed
/// credential and an unknown one are indistinguishable to the caller.
pub async fn resolve(store: &dyn PollStore, credential: &str) -> Result<Uuid, AppError> {
    if !is_well_formed(credential) {
        return Err(AppError::Unauthorized);
    }

    match store.resolve_token(&digest(credential)).await {
        Ok(poll_id) => Ok(poll_id),
        Err(StoreError::NotFound) => Err(AppError::Unauthorized),
        Err(err) => Err(err.into()),
    }
}

/// The credential resolved, but to a different poll than the one addressed.
pub fn ensure_scope(resolved: Uuid, requested: Uuid) -> Result<(), AppError> {
    if resolved != requested {
        return Err(AppError::WrongPoll);
    }
    Ok(())
}
