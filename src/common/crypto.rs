use std::{
    collections::{BTreeMap, HashMap},
    sync::RwLock,
    thread,
    time::Duration,
};

use ed25519_dalek::{ed25519::{self, signature::Signer}, SigningKey, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::weights::ReplicaId;

pub type Digest = [u8; 64];
pub type MacTag = [u8; 32];

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("no symmetric key established with replica {0}")]
    KeyNotEstablished(ReplicaId),

    #[error("invalid symmetric key for replica {0}")]
    InvalidKey(ReplicaId),
}

pub struct Keypair {
    pubkey: Pubkey,
    dalek_signer: SigningKey,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Pubkey {
    pub key: [u8; 32],
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Signature {
    pub signer: Pubkey,
    pub sig: [u8; 64],
}

impl Keypair {
    pub fn new_pair() -> Self {
        let mut csprng = OsRng;
        Self::from_signer(SigningKey::generate(&mut csprng))
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::from_signer(SigningKey::from_bytes(&seed))
    }

    fn from_signer(dalek_signer: SigningKey) -> Self {
        let pubkey = Pubkey::from(&dalek_signer.verifying_key().to_bytes());
        Keypair {
            pubkey,
            dalek_signer,
        }
    }

    pub fn sign(&self, digest: &Digest) -> Signature {
        let sig = self.dalek_signer.sign(digest).to_bytes();

        Signature {
            signer: self.pubkey.clone(),
            sig,
        }
    }

    pub fn pubkey(&self) -> Pubkey {
        self.pubkey.clone()
    }
}

impl AsRef<[u8]> for Pubkey {
    fn as_ref(&self) -> &[u8] {
        &self.key
    }
}

impl From<&[u8; 32]> for Pubkey {
    fn from(bytes: &[u8; 32]) -> Self {
        Pubkey { key: *bytes }
    }
}

impl Signature {
    pub fn verify(&self, digest: &Digest) -> bool {
        let dalek_sig = ed25519::Signature::from_bytes(&self.sig);
        match VerifyingKey::from_bytes(&self.signer.key) {
            Ok(dalek_pubkey) => dalek_pubkey.verify_strict(digest, &dalek_sig).is_ok(),
            Err(_) => false,
        }
    }
}

/// How ACCEPT proofs are built.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProofScheme {
    #[default]
    Signature,
    MacVector,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Proof {
    Signature(Signature),
    /// One HMAC per destination replica.
    Macs(BTreeMap<ReplicaId, MacTag>),
}

/// Pairwise symmetric keys. Keys appear asynchronously as peers finish
/// their handshake, so lookups may miss during membership changes.
#[derive(Debug, Default)]
pub struct SymmetricKeys {
    keys: RwLock<HashMap<ReplicaId, [u8; 32]>>,
}

impl SymmetricKeys {
    pub fn establish(&self, peer: ReplicaId, key: [u8; 32]) {
        self.keys
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(peer, key);
    }

    pub fn get(&self, peer: ReplicaId) -> Option<[u8; 32]> {
        self.keys
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&peer)
            .copied()
    }
}

pub struct Authenticator {
    me: ReplicaId,
    keypair: Keypair,
    keys: SymmetricKeys,
    scheme: ProofScheme,
    key_retries: u32,
    key_backoff: Duration,
}

impl Authenticator {
    pub fn new(
        me: ReplicaId,
        keypair: Keypair,
        scheme: ProofScheme,
        key_retries: u32,
        key_backoff: Duration,
    ) -> Self {
        Authenticator {
            me,
            keypair,
            keys: SymmetricKeys::default(),
            scheme,
            key_retries,
            key_backoff,
        }
    }

    pub fn me(&self) -> ReplicaId {
        self.me
    }

    pub fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    pub fn keys(&self) -> &SymmetricKeys {
        &self.keys
    }

    pub fn scheme(&self) -> ProofScheme {
        self.scheme
    }

    /// Builds a proof over `digest` for `targets`. May block while waiting
    /// for missing pairwise keys, so call it off the protocol thread.
    pub fn prove(&self, digest: &Digest, targets: &[ReplicaId]) -> Result<Proof, CryptoError> {
        match self.scheme {
            ProofScheme::Signature => Ok(Proof::Signature(self.keypair.sign(digest))),
            ProofScheme::MacVector => {
                let mut macs = BTreeMap::new();
                for &target in targets {
                    macs.insert(target, self.mac_for(target, digest)?);
                }
                Ok(Proof::Macs(macs))
            }
        }
    }

    // Retries with exponential backoff while the key with `peer` is not yet
    // established.
    fn mac_for(&self, peer: ReplicaId, digest: &Digest) -> Result<MacTag, CryptoError> {
        let mut backoff = self.key_backoff;
        for attempt in 0..=self.key_retries {
            if let Some(key) = self.keys.get(peer) {
                return compute_mac(peer, &key, digest);
            }
            if attempt < self.key_retries {
                debug!(peer, attempt, "Symmetric key not established yet, backing off");
                thread::sleep(backoff);
                backoff = backoff.saturating_mul(2);
            }
        }
        Err(CryptoError::KeyNotEstablished(peer))
    }

    /// Checks a proof produced by `sender`, whose public key is `signer`.
    pub fn verify(&self, sender: ReplicaId, signer: &Pubkey, digest: &Digest, proof: &Proof) -> bool {
        match proof {
            Proof::Signature(signature) => signature.signer == *signer && signature.verify(digest),
            Proof::Macs(macs) => {
                let (Some(tag), Some(key)) = (macs.get(&self.me), self.keys.get(sender)) else {
                    return false;
                };
                match HmacSha256::new_from_slice(&key) {
                    Ok(mut mac) => {
                        mac.update(digest);
                        mac.verify_slice(tag).is_ok()
                    }
                    Err(_) => false,
                }
            }
        }
    }
}

fn compute_mac(peer: ReplicaId, key: &[u8; 32], digest: &Digest) -> Result<MacTag, CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| CryptoError::InvalidKey(peer))?;
    mac.update(digest);
    Ok(mac.finalize().into_bytes().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = Keypair::new_pair();
        let digest: Digest = [4; 64];
        let signature = keypair.sign(&digest);

        assert_eq!(signature.signer, keypair.pubkey);
        assert!(signature.verify(&digest));
        assert!(!signature.verify(&[5; 64]));
    }

    #[test]
    fn test_verify_rejects_wrong_signer() {
        let alice = Authenticator::new(0, Keypair::from_seed([1; 32]), ProofScheme::Signature, 0, Duration::ZERO);
        let bob = Keypair::from_seed([2; 32]);
        let digest: Digest = [9; 64];
        let proof = alice.prove(&digest, &[1]).unwrap();

        assert!(alice.verify(0, &alice.pubkey(), &digest, &proof));
        assert!(!alice.verify(0, &bob.pubkey(), &digest, &proof));
    }

    #[test]
    fn test_mac_vector_between_peers() {
        let a = Authenticator::new(0, Keypair::from_seed([1; 32]), ProofScheme::MacVector, 0, Duration::ZERO);
        let b = Authenticator::new(1, Keypair::from_seed([2; 32]), ProofScheme::MacVector, 0, Duration::ZERO);
        a.keys().establish(1, [7; 32]);
        b.keys().establish(0, [7; 32]);

        let digest: Digest = [3; 64];
        let proof = a.prove(&digest, &[1]).unwrap();
        assert!(b.verify(0, &a.pubkey(), &digest, &proof));
        assert!(!b.verify(0, &a.pubkey(), &[4; 64], &proof));
    }

    #[test]
    fn test_mac_without_key_gives_up_after_retries() {
        let a = Authenticator::new(
            0,
            Keypair::from_seed([1; 32]),
            ProofScheme::MacVector,
            2,
            Duration::from_millis(1),
        );
        assert_eq!(a.prove(&[0; 64], &[3]), Err(CryptoError::KeyNotEstablished(3)));
    }
}
