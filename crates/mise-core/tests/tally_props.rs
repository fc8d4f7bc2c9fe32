//! Property tests for the Schulze tallier against brute-force checks.

use proptest::prelude::*;

use mise_core::tally::{Ballot, schulze};

const MAX_CANDIDATES: u8 = 5;

/// Candidate count plus ballots, each a rank (or omission) per candidate.
fn election() -> impl Strategy<Value = (u8, Vec<Ballot<u8>>)> {
    (1..=MAX_CANDIDATES).prop_flat_map(|n| {
        let ballot = prop::collection::vec(prop::option::of(0u32..4), usize::from(n)).prop_map(
            |ranks| {
                ranks
                    .into_iter()
                    .enumerate()
                    .filter_map(|(c, r)| r.map(|r| (u8::try_from(c).unwrap(), r)))
                    .collect::<Ballot<u8>>()
            },
        );
        (Just(n), prop::collection::vec(ballot, 0..12))
    })
}

fn prefers(ballot: &Ballot<u8>, a: u8, b: u8) -> bool {
    match (ballot.get(&a), ballot.get(&b)) {
        (Some(ra), Some(rb)) => ra < rb,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

fn pairwise(n: u8, ballots: &[Ballot<u8>]) -> Vec<Vec<u32>> {
    let n = usize::from(n);
    let mut d = vec![vec![0u32; n]; n];
    for ballot in ballots.iter().filter(|b| !b.is_empty()) {
        for a in 0..n {
            for b in 0..n {
                if a != b && prefers(ballot, a as u8, b as u8) {
                    d[a][b] += 1;
                }
            }
        }
    }
    d
}

/// Widest path from `from` to `to` over every simple path.
fn widest(links: &[Vec<u32>], from: usize, to: usize, visited: &mut Vec<bool>) -> u32 {
    if from == to {
        return u32::MAX;
    }
    visited[from] = true;
    let mut best = 0;
    for next in 0..links.len() {
        if visited[next] || links[from][next] == 0 {
            continue;
        }
        let rest = widest(links, next, to, visited);
        best = best.max(links[from][next].min(rest));
    }
    visited[from] = false;
    best
}

fn brute_force_winners(n: u8, ballots: &[Ballot<u8>]) -> Vec<u8> {
    let d = pairwise(n, ballots);
    let n = usize::from(n);
    let links: Vec<Vec<u32>> = (0..n)
        .map(|a| {
            (0..n)
                .map(|b| if a != b && d[a][b] > d[b][a] { d[a][b] } else { 0 })
                .collect()
        })
        .collect();
    let mut p = vec![vec![0u32; n]; n];
    for a in 0..n {
        for b in 0..n {
            if a != b {
                p[a][b] = widest(&links, a, b, &mut vec![false; n]);
            }
        }
    }
    (0..n)
        .filter(|&a| (0..n).all(|b| a == b || p[a][b] >= p[b][a]))
        .map(|a| a as u8)
        .collect()
}

fn condorcet_winner(n: u8, ballots: &[Ballot<u8>]) -> Option<u8> {
    let d = pairwise(n, ballots);
    let n = usize::from(n);
    (0..n)
        .find(|&a| (0..n).all(|b| a == b || d[a][b] > d[b][a]))
        .map(|a| a as u8)
}

fn condorcet_loser(n: u8, ballots: &[Ballot<u8>]) -> Option<u8> {
    let d = pairwise(n, ballots);
    let n = usize::from(n);
    if n < 2 {
        return None;
    }
    (0..n)
        .find(|&a| (0..n).all(|b| a == b || d[a][b] < d[b][a]))
        .map(|a| a as u8)
}

proptest! {
    #[test]
    fn winners_match_brute_force((n, ballots) in election()) {
        let candidates: Vec<u8> = (0..n).collect();
        let result = schulze(&candidates, &ballots).unwrap();
        prop_assert_eq!(&result.winners, &brute_force_winners(n, &ballots));
        prop_assert!(!result.winners.is_empty());
        prop_assert_eq!(result.chosen, result.winners[0]);
        prop_assert_eq!(result.tie, result.winners.len() > 1);
    }

    #[test]
    fn condorcet_winner_always_wins((n, ballots) in election()) {
        let candidates: Vec<u8> = (0..n).collect();
        let result = schulze(&candidates, &ballots).unwrap();
        if let Some(winner) = condorcet_winner(n, &ballots) {
            prop_assert_eq!(&result.winners, &vec![winner]);
            prop_assert!(!result.tie);
        }
        if let Some(loser) = condorcet_loser(n, &ballots) {
            prop_assert!(!result.winners.contains(&loser));
        }
    }

    #[test]
    fn ballot_order_does_not_matter(
        (n, ballots, shuffled) in election().prop_flat_map(|(n, ballots)| {
            let shuffled = Just(ballots.clone()).prop_shuffle();
            (Just(n), Just(ballots), shuffled)
        })
    ) {
        let candidates: Vec<u8> = (0..n).collect();
        let mut reversed = candidates.clone();
        reversed.reverse();
        let a = schulze(&candidates, &ballots).unwrap();
        let b = schulze(&reversed, &shuffled).unwrap();
        prop_assert_eq!(a.winners, b.winners);
        prop_assert_eq!(a.chosen, b.chosen);
        prop_assert_eq!(a.tie, b.tie);
    }
}
