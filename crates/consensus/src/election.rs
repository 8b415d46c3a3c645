//! Reputation-weighted committee election.
//!
//! Candidates are split into a low-reputation tier and a high-reputation tier,
//! each with a fixed number of seats. A tier with more candidates than seats
//! fills them by a weighted draw without replacement; the generator is seeded
//! from the checkpoint block hash so every node elects the same committee.

use crate::rpt::Rpt;
use dposbft_types::Address;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::collections::HashSet;
use tracing::debug;

/// Elect `total_seats` proposers from `rpts`.
///
/// The lowest `low_rpt_count` candidates compete for `low_rpt_seats`; the
/// rest compete for the remaining seats. Returns the low-tier winners
/// followed by the high-tier winners, or nothing when the parameters cannot
/// be satisfied.
pub fn elect(
    rpts: &[Rpt],
    seed: u64,
    total_seats: usize,
    low_rpt_count: usize,
    low_rpt_seats: usize,
) -> Vec<Address> {
    if low_rpt_count > rpts.len() || low_rpt_seats > total_seats || total_seats > rpts.len() {
        return Vec::new();
    }

    let mut sorted = rpts.to_vec();
    sorted.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.address.cmp(&b.address)));

    let high_count = sorted.len() - low_rpt_count;
    let high_seats = total_seats - low_rpt_seats;
    let (high, low) = sorted.split_at(high_count);

    debug!(
        seed,
        total_seats, low_rpt_count, low_rpt_seats, high_count, high_seats, "elect parameters"
    );

    let mut rng = ChaCha20Rng::seed_from_u64(seed);

    let mut elected = if low.len() > low_rpt_seats {
        random_select_by_rpt(low, &mut rng, low_rpt_seats)
    } else {
        low.iter().map(|r| r.address).collect()
    };

    if high.len() > high_seats {
        elected.extend(random_select_by_rpt(high, &mut rng, high_seats));
    } else {
        elected.extend(high.iter().map(|r| r.address));
    }

    elected
}

fn random_select_by_rpt(rpts: &[Rpt], rng: &mut ChaCha20Rng, mut seats: usize) -> Vec<Address> {
    let mut sums = Vec::with_capacity(rpts.len());
    let mut sum: i64 = 0;
    for r in rpts {
        sum += r.score.max(0);
        sums.push(sum);
    }

    let mut result = Vec::with_capacity(seats);
    let mut selected = HashSet::new();
    let weighted: HashSet<usize> = rpts
        .iter()
        .enumerate()
        .filter(|(_, r)| r.score > 0)
        .map(|(i, _)| i)
        .collect();

    while seats > 0 {
        // no weight left to draw from: fill the remaining seats in rank order
        if sum <= 0 || weighted.is_subset(&selected) {
            for (idx, r) in rpts.iter().enumerate() {
                if seats == 0 {
                    break;
                }
                if selected.insert(idx) {
                    result.push(r.address);
                    seats -= 1;
                }
            }
            break;
        }

        let hit = rng.gen_range(0..sum);
        let idx = find_hit(hit, &sums);
        if !selected.insert(idx) {
            continue;
        }
        result.push(rpts[idx].address);
        seats -= 1;
    }
    result
}

fn find_hit(hit: i64, sums: &[i64]) -> usize {
    sums.iter()
        .position(|s| hit <= *s)
        .unwrap_or(sums.len().saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpts(scores: &[i64]) -> Vec<Rpt> {
        scores
            .iter()
            .enumerate()
            .map(|(i, s)| Rpt::new(Address::from_low_u64(i as u64 + 1), *s))
            .collect()
    }

    #[test]
    fn test_find_hit() {
        let sums = vec![10, 30, 60];
        assert_eq!(find_hit(0, &sums), 0);
        assert_eq!(find_hit(10, &sums), 0);
        assert_eq!(find_hit(11, &sums), 1);
        assert_eq!(find_hit(60, &sums), 2);
        assert_eq!(find_hit(99, &sums), 2);
    }

    #[test]
    fn test_invalid_parameters_elect_nobody() {
        let list = rpts(&[10, 20, 30]);
        assert!(elect(&list, 1, 4, 1, 1).is_empty());
        assert!(elect(&list, 1, 2, 4, 1).is_empty());
        assert!(elect(&list, 1, 2, 1, 3).is_empty());
    }

    #[test]
    fn test_small_tiers_are_elected_whole() {
        let list = rpts(&[50, 40, 30, 20]);
        // two low candidates for two low seats, two high for two high seats
        let elected = elect(&list, 9, 4, 2, 2);
        assert_eq!(
            elected,
            vec![
                Address::from_low_u64(3),
                Address::from_low_u64(4),
                Address::from_low_u64(1),
                Address::from_low_u64(2),
            ]
        );
    }

    #[test]
    fn test_election_is_deterministic() {
        let list = rpts(&[100, 90, 80, 70, 60, 50, 40, 30, 20, 10]);
        let a = elect(&list, 42, 4, 5, 2);
        let b = elect(&list, 42, 4, 5, 2);
        assert_eq!(a, b);

        let mut reversed = list.clone();
        reversed.reverse();
        assert_eq!(elect(&reversed, 42, 4, 5, 2), a);
    }

    #[test]
    fn test_tier_quotas() {
        let list = rpts(&[100, 90, 80, 70, 60, 50, 40, 30, 20, 10]);
        let low: HashSet<Address> = list[5..].iter().map(|r| r.address).collect();
        for seed in 0..50 {
            let elected = elect(&list, seed, 4, 5, 2);
            assert_eq!(elected.len(), 4);
            let unique: HashSet<_> = elected.iter().collect();
            assert_eq!(unique.len(), 4);
            assert!(elected[..2].iter().all(|a| low.contains(a)));
            assert!(elected[2..].iter().all(|a| !low.contains(a)));
        }
    }

    #[test]
    fn test_zero_weights_fill_in_order() {
        let list = rpts(&[0, 0, 0]);
        let elected = elect(&list, 3, 2, 0, 0);
        assert_eq!(elected, vec![Address::from_low_u64(1), Address::from_low_u64(2)]);
    }
}
