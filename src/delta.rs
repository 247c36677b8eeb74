//! Signature, delta, and patch over byte buffers
//!
//! Thin adapter over `fast_rsync`. Diff increments are reverse deltas: the
//! signature is taken over the *new* content and the delta reproduces the
//! *old* content, so `patch(new, delta(signature(new), old)) == old`.

use crate::error::{BackstepError, Result};
use fast_rsync::{Signature, SignatureOptions};
use tracing::trace;

/// Block size used for signatures
pub const DEFAULT_BLOCK_SIZE: u32 = 4 * 1024;

const CRYPTO_HASH_SIZE: u32 = 8;

/// Compute the signature of `basis`
pub fn signature(basis: &[u8]) -> Signature {
    signature_with_block_size(basis, DEFAULT_BLOCK_SIZE)
}

/// Compute the signature of `basis` with an explicit block size
pub fn signature_with_block_size(basis: &[u8], block_size: u32) -> Signature {
    Signature::calculate(
        basis,
        SignatureOptions {
            block_size,
            crypto_hash_size: CRYPTO_HASH_SIZE,
        },
    )
}

/// Delta that turns the signed basis into `target`
pub fn delta(basis_signature: &Signature, target: &[u8]) -> Result<Vec<u8>> {
    let indexed = basis_signature.index();
    let mut out = Vec::new();
    fast_rsync::diff(&indexed, target, &mut out)
        .map_err(|e| BackstepError::delta(format!("delta computation failed: {}", e)))?;
    trace!("Delta of {} bytes for {} byte target", out.len(), target.len());
    Ok(out)
}

/// Apply `delta` to `basis`
pub fn patch(basis: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    fast_rsync::apply(basis, delta, &mut out)
        .map_err(|e| BackstepError::delta(format!("patch failed: {}", e)))?;
    Ok(out)
}

/// Reverse delta: applied to `current` it yields `prior`
pub fn reverse_delta(current: &[u8], prior: &[u8]) -> Result<Vec<u8>> {
    delta(&signature(current), prior)
}
