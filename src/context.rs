//! Shared crypto context
//!
//! Bundles the validated scheme context with the encoder and evaluator that
//! every bundle-cache rebuild and query evaluation needs. Immutable after
//! construction; clone freely (clones share the underlying context) and
//! pass by reference into `regen_cache`/`evaluate` — bundles never hold a
//! back-pointer to their owner.

#![forbid(unsafe_code)]

use std::sync::Arc;

use crate::ffield::Modulus;
use crate::he::{BatchEncoder, EncryptionParameters, Evaluator, HeContext, HeError};

#[derive(Clone)]
pub struct CryptoContext {
    he: Arc<HeContext>,
    encoder: BatchEncoder,
    evaluator: Evaluator,
}

impl CryptoContext {
    pub fn new(parms: EncryptionParameters) -> Result<Self, HeError> {
        let he = HeContext::new(parms)?;
        let encoder = BatchEncoder::new(he.clone());
        let evaluator = Evaluator::new(he.clone());
        Ok(Self { he, encoder, evaluator })
    }

    #[inline]
    pub fn he(&self) -> &Arc<HeContext> {
        &self.he
    }

    #[inline]
    pub fn encoder(&self) -> &BatchEncoder {
        &self.encoder
    }

    #[inline]
    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    #[inline]
    pub fn plain_modulus(&self) -> Modulus {
        self.he.plain_modulus()
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.he.slot_count()
    }
}

impl std::fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoContext").field("he", self.he.as_ref()).finish()
    }
}
