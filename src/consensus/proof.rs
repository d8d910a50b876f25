use std::sync::Arc;

use thiserror::Error;
use tokio::{
    sync::Semaphore,
    task::{JoinError, JoinHandle},
};
use tracing::trace;

use super::message::{ConsensusMessage, Hashable};
use crate::{
    common::crypto::{Authenticator, CryptoError, Pubkey},
    weights::ReplicaId,
};

#[derive(Debug, Error)]
pub enum ProofError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("proof worker failed: {0}")]
    Worker(#[from] JoinError),

    #[error("proof pool is shut down")]
    Closed,
}

/// A message whose proof is being built in the background.
pub type PendingProof = JoinHandle<Result<ConsensusMessage, ProofError>>;

/// Builds proofs on the blocking pool, at most `workers` at a time, so the
/// protocol loop never waits on signing or on a missing MAC key.
#[derive(Clone)]
pub struct ProofPool {
    authenticator: Arc<Authenticator>,
    permits: Arc<Semaphore>,
}

impl ProofPool {
    pub fn new(authenticator: Arc<Authenticator>, workers: usize) -> Self {
        ProofPool {
            authenticator,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub fn authenticator(&self) -> &Arc<Authenticator> {
        &self.authenticator
    }

    /// Attaches a proof for `targets` to `message`. Must be called from
    /// within a tokio runtime.
    pub fn spawn(&self, mut message: ConsensusMessage, targets: Vec<ReplicaId>) -> PendingProof {
        let authenticator = Arc::clone(&self.authenticator);
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.map_err(|_| ProofError::Closed)?;
            let proven = tokio::task::spawn_blocking(move || -> Result<ConsensusMessage, ProofError> {
                let proof = authenticator.prove(&message.hash(), &targets)?;
                trace!(cid = message.cid, kind = ?message.kind, "Built proof");
                message.proof = Some(proof);
                Ok(message)
            })
            .await??;
            Ok::<_, ProofError>(proven)
        })
    }

    /// True if `message` carries a proof that `signer` produced it.
    pub fn verify(&self, message: &ConsensusMessage, signer: &Pubkey) -> bool {
        match &message.proof {
            Some(proof) => self
                .authenticator
                .verify(message.sender, signer, &message.hash(), proof),
            None => false,
        }
    }
}
