//! Schulze tallier.
//!
//! A pure function from a candidate set and ranked ballots to the winner
//! set. Ballots map candidates to ranks where smaller is better; candidates
//! a ballot leaves out rank below every candidate it names and tie with
//! each other. Abstentions are dropped by the caller before tallying.
//!
//! Ties between winners are broken by candidate order: the lowest
//! candidate wins and [`TallyResult::tie`] is set.

use std::collections::BTreeMap;

/// One voter's ranks, keyed by candidate.
pub type Ballot<C> = BTreeMap<C, u32>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TallyResult<C> {
    /// Candidates in ascending order; indexes the matrices below.
    pub candidates: Vec<C>,
    /// `pairwise[a][b]`: voters preferring `a` strictly over `b`.
    pub pairwise: Vec<Vec<u32>>,
    /// `strongest[a][b]`: widest-path strength from `a` to `b`.
    pub strongest: Vec<Vec<u32>>,
    /// Every Schulze winner, ascending.
    pub winners: Vec<C>,
    /// The winner chosen after the tie break.
    pub chosen: C,
    pub tie: bool,
}

impl<C: Ord> TallyResult<C> {
    fn index_of(&self, candidate: &C) -> Option<usize> {
        self.candidates.binary_search(candidate).ok()
    }

    /// Voters preferring `a` over `b`. Zero for unknown candidates.
    pub fn preference(&self, a: &C, b: &C) -> u32 {
        match (self.index_of(a), self.index_of(b)) {
            (Some(i), Some(j)) => self.pairwise[i][j],
            _ => 0,
        }
    }
}

/// Run a Schulze election. Returns `None` only when `candidates` is empty.
///
/// Duplicate candidates are collapsed. Ranks for candidates outside the set
/// are ignored, and a ballot naming none of the candidates is skipped.
pub fn schulze<C: Ord + Clone>(candidates: &[C], ballots: &[Ballot<C>]) -> Option<TallyResult<C>> {
    let mut candidates = candidates.to_vec();
    candidates.sort();
    candidates.dedup();
    let n = candidates.len();
    if n == 0 {
        return None;
    }

    let mut pairwise = vec![vec![0u32; n]; n];
    for ballot in ballots {
        let ranks: Vec<Option<u32>> = candidates.iter().map(|c| ballot.get(c).copied()).collect();
        if ranks.iter().all(Option::is_none) {
            continue;
        }
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                let prefers = match (ranks[i], ranks[j]) {
                    (Some(ri), Some(rj)) => ri < rj,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if prefers {
                    pairwise[i][j] += 1;
                }
            }
        }
    }

    let mut strongest = vec![vec![0u32; n]; n];
    for i in 0..n {
        for j in 0..n {
            if i != j && pairwise[i][j] > pairwise[j][i] {
                strongest[i][j] = pairwise[i][j];
            }
        }
    }
    for k in 0..n {
        for i in 0..n {
            if i == k {
                continue;
            }
            for j in 0..n {
                if j == i || j == k {
                    continue;
                }
                let via = strongest[i][k].min(strongest[k][j]);
                if via > strongest[i][j] {
                    strongest[i][j] = via;
                }
            }
        }
    }

    let winners: Vec<C> = (0..n)
        .filter(|&a| (0..n).all(|b| a == b || strongest[a][b] >= strongest[b][a]))
        .map(|a| candidates[a].clone())
        .collect();

    // The Schulze relation always has a maximal element.
    let chosen = winners.first()?.clone();
    let tie = winners.len() > 1;

    Some(TallyResult {
        candidates,
        pairwise,
        strongest,
        winners,
        chosen,
        tie,
    })
}
