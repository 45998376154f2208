//! Fork resolution.
//!
//! When the registry reports several heads for one agent, every candidate is
//! verified independently. Only verified candidates at the highest verified
//! sequence compete; among them the [`ForkTieBreak`] policy picks the winner,
//! and verified candidates further back are superseded so the lineage never
//! moves backward. Candidates are put into a canonical order first, so the
//! result never depends on the order the registry reported them in.

use std::fmt::Debug;

use revenant_core::{AgentId, EngineError, EngineResult, HeadPointer};

use crate::verifier::{verify_candidates, LineageVerifier, TrustAnchor, Verified};

/// Picks one head among verified fork candidates.
pub trait ForkTieBreak: Send + Sync + Debug {
    /// `candidates` is sorted by `(sequence, self_hash)`.
    fn choose(&self, candidates: &[HeadPointer]) -> Option<HeadPointer>;
}

/// Default policy: the lexicographically smallest `self_hash` wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicographicTieBreak;

impl ForkTieBreak for LexicographicTieBreak {
    fn choose(&self, candidates: &[HeadPointer]) -> Option<HeadPointer> {
        candidates.iter().copied().min_by_key(|c| c.self_hash)
    }
}

/// Result of resolving a fork.
#[derive(Debug, Clone)]
pub struct ForkResolution {
    pub winner: Verified,
    /// Verified candidates that lost the tie-break
    pub discarded: Vec<Verified>,
    /// Verified candidates behind the winning sequence; never merged
    pub superseded: Vec<HeadPointer>,
    /// Candidates that failed verification, with the reason
    pub rejected: Vec<(HeadPointer, EngineError)>,
}

impl ForkResolution {
    pub fn discarded_hashes(&self) -> Vec<revenant_core::ContentHash> {
        self.discarded.iter().map(|v| v.head.self_hash).collect()
    }
}

/// Verify every candidate and choose a winner.
///
/// Fails with the first verification error (in canonical order) if no
/// candidate verifies. Store outages are returned immediately since they say
/// nothing about the candidate itself.
pub async fn resolve_fork(
    verifier: &LineageVerifier,
    tie_break: &dyn ForkTieBreak,
    agent_id: &AgentId,
    candidates: &[HeadPointer],
    anchor: TrustAnchor,
) -> EngineResult<ForkResolution> {
    let mut ordered = candidates.to_vec();
    ordered.sort_by_key(|c| (c.sequence, c.self_hash));
    ordered.dedup();
    if let Err(fork) = verify_candidates(agent_id, &ordered) {
        tracing::info!(agent_id = %agent_id, error = %fork, "Resolving forked head");
    }

    let mut verified = Vec::new();
    let mut rejected = Vec::new();
    for candidate in &ordered {
        match verifier.verify(agent_id, *candidate, anchor).await {
            Ok(v) => verified.push(v),
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                tracing::warn!(
                    agent_id = %agent_id,
                    candidate = %candidate,
                    error = %e,
                    "Fork candidate failed verification"
                );
                rejected.push((*candidate, e));
            }
        }
    }

    if verified.is_empty() {
        return Err(rejected
            .into_iter()
            .next()
            .map(|(_, e)| e)
            .unwrap_or(EngineError::NoLineage {
                agent_id: agent_id.clone(),
            }));
    }

    let top = verified
        .iter()
        .map(|v| v.head.sequence())
        .max()
        .unwrap_or_default();
    let (verified, behind): (Vec<Verified>, Vec<Verified>) =
        verified.into_iter().partition(|v| v.head.sequence() == top);
    let superseded: Vec<HeadPointer> = behind.iter().map(|v| v.head.pointer()).collect();
    if !superseded.is_empty() {
        tracing::warn!(
            agent_id = %agent_id,
            sequence = top,
            superseded = superseded.len(),
            "Ignoring fork candidates behind the newest verified head"
        );
    }

    let pointers: Vec<HeadPointer> = verified.iter().map(|v| v.head.pointer()).collect();
    let chosen = tie_break
        .choose(&pointers)
        .ok_or_else(|| EngineError::InvalidState {
            reason: "tie-break declined every candidate".to_string(),
        })?;

    let (winners, discarded): (Vec<Verified>, Vec<Verified>) = verified
        .into_iter()
        .partition(|v| v.head.pointer() == chosen);
    let winner = winners
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::InvalidState {
            reason: format!("tie-break chose {} which was not a candidate", chosen),
        })?;

    if !discarded.is_empty() || !rejected.is_empty() {
        tracing::info!(
            agent_id = %agent_id,
            winner = %chosen,
            discarded = discarded.len(),
            rejected = rejected.len(),
            "Fork resolved"
        );
    }

    Ok(ForkResolution {
        winner,
        discarded,
        superseded,
        rejected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use revenant_core::compute_content_hash;

    fn pointer(tag: &[u8]) -> HeadPointer {
        HeadPointer {
            sequence: 5,
            self_hash: compute_content_hash(tag),
        }
    }

    #[test]
    fn test_lexicographic_picks_smallest_hash() {
        let a = pointer(b"a");
        let b = pointer(b"b");
        let expected = if a.self_hash < b.self_hash { a } else { b };
        assert_eq!(LexicographicTieBreak.choose(&[a, b]), Some(expected));
        assert_eq!(LexicographicTieBreak.choose(&[b, a]), Some(expected));
        assert_eq!(LexicographicTieBreak.choose(&[]), None);
    }
}
