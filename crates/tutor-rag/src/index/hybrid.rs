use std::collections::HashMap;
use uuid::Uuid;

/// Reciprocal Rank Fusion over any number of ranked lists.
/// rrf_score(chunk) = Σ 1/(k0 + rank) with rank 1-based; a chunk missing
/// from a list contributes nothing for that list. Ordering is
/// deterministic: fused score descending, chunk id as tiebreak.
pub fn reciprocal_rank_fusion(
    ranked_lists: &[Vec<(Uuid, f32)>],
    k0: usize,
    top_k: usize,
) -> Vec<(Uuid, f32)> {
    let mut scores: HashMap<Uuid, f32> = HashMap::new();

    for list in ranked_lists {
        for (rank, (id, _score)) in list.iter().enumerate() {
            let rrf = 1.0 / (k0 as f32 + rank as f32 + 1.0);
            *scores.entry(*id).or_insert(0.0) += rrf;
        }
    }

    let mut fused: Vec<(Uuid, f32)> = scores.into_iter().collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    fused.truncate(top_k);
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn chunk_in_every_list_beats_chunk_in_one() {
        let [a, b, c] = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let lists = vec![
            vec![(a, 0.9), (b, 0.5)],
            vec![(a, 12.0), (c, 3.0)],
            vec![(a, 0.7)],
        ];

        let fused = reciprocal_rank_fusion(&lists, 60, 10);
        assert_eq!(fused[0].0, a);
        assert!(fused[0].1 > fused[1].1);
    }

    #[test]
    fn monotonicity_better_ranks_never_score_lower() {
        // X ranks >= Y in every list, so fused(X) >= fused(Y).
        let [x, y, filler] = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let lists = vec![
            vec![(x, 1.0), (filler, 0.9), (y, 0.8)],
            vec![(x, 5.0), (y, 4.0)],
        ];

        let fused = reciprocal_rank_fusion(&lists, 60, 10);
        let score = |id| fused.iter().find(|(i, _)| *i == id).unwrap().1;
        assert!(score(x) >= score(y));
    }

    #[test]
    fn missing_entries_contribute_zero() {
        let [a, b] = [Uuid::new_v4(), Uuid::new_v4()];
        let lists = vec![vec![(a, 1.0)], vec![(b, 1.0)], Vec::new()];

        let fused = reciprocal_rank_fusion(&lists, 60, 10);
        // Both appear at rank 1 of exactly one list, so scores are equal.
        assert_eq!(fused.len(), 2);
        assert!((fused[0].1 - fused[1].1).abs() < 1e-9);
        assert!((fused[0].1 - 1.0 / 61.0).abs() < 1e-6);
    }

    #[test]
    fn truncates_to_top_k() {
        let many = ids(20);
        let list: Vec<(Uuid, f32)> = many.iter().map(|id| (*id, 1.0)).collect();
        let fused = reciprocal_rank_fusion(&[list], 60, 5);
        assert_eq!(fused.len(), 5);
    }

    #[test]
    fn deterministic_given_identical_inputs() {
        let pool = ids(6);
        let lists: Vec<Vec<(Uuid, f32)>> = vec![
            pool.iter().map(|id| (*id, 0.5)).collect(),
            pool.iter().rev().map(|id| (*id, 0.5)).collect(),
        ];
        let first = reciprocal_rank_fusion(&lists, 60, 6);
        let second = reciprocal_rank_fusion(&lists, 60, 6);
        assert_eq!(first, second);
    }
}
