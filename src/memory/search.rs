//! Rank fusion for multi-source memory search (`spec.md` §4.3 Search
//! algorithm, GLOSSARY "RRF").

use super::types::SourceHit;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub enum FusionMethod {
    /// `fused(id) = Σ 1/(k + rank_i)`, k = 60 by default.
    Rrf { k: f64 },
    /// `Σ min-max-normalized(score_i) × count`.
    CombMnz,
}

impl Default for FusionMethod {
    fn default() -> Self {
        FusionMethod::Rrf { k: 60.0 }
    }
}

/// Fuse ranked hit lists from one or more sources into a single ranking.
/// Source order is irrelevant to the result (§8 round-trip law).
pub fn fuse(sources: &[Vec<SourceHit>], method: FusionMethod) -> Vec<(Uuid, f64)> {
    match method {
        FusionMethod::Rrf { k } => fuse_rrf(sources, k),
        FusionMethod::CombMnz => fuse_comb_mnz(sources),
    }
}

fn fuse_rrf(sources: &[Vec<SourceHit>], k: f64) -> Vec<(Uuid, f64)> {
    let mut scores: HashMap<Uuid, f64> = HashMap::new();
    for source in sources {
        for hit in source {
            *scores.entry(hit.id).or_insert(0.0) += 1.0 / (k + hit.rank as f64);
        }
    }
    sort_desc(scores)
}

fn fuse_comb_mnz(sources: &[Vec<SourceHit>]) -> Vec<(Uuid, f64)> {
    let mut sum: HashMap<Uuid, f64> = HashMap::new();
    let mut count: HashMap<Uuid, usize> = HashMap::new();

    for source in sources {
        if source.is_empty() {
            continue;
        }
        let min = source.iter().map(|h| h.score).fold(f64::INFINITY, f64::min);
        let max = source.iter().map(|h| h.score).fold(f64::NEG_INFINITY, f64::max);
        let range = (max - min).max(f64::EPSILON);

        for hit in source {
            let normalized = (hit.score - min) / range;
            *sum.entry(hit.id).or_insert(0.0) += normalized;
            *count.entry(hit.id).or_insert(0) += 1;
        }
    }

    let scores: HashMap<Uuid, f64> = sum
        .into_iter()
        .map(|(id, s)| (id, s * *count.get(&id).unwrap_or(&1) as f64))
        .collect();
    sort_desc(scores)
}

fn sort_desc(scores: HashMap<Uuid, f64>) -> Vec<(Uuid, f64)> {
    let mut out: Vec<(Uuid, f64)> = scores.into_iter().collect();
    out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: Uuid, rank: usize, score: f64) -> SourceHit {
        SourceHit { id, rank, score }
    }

    #[test]
    fn rrf_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        let source1 = vec![hit(a, 0, 0.9), hit(b, 1, 0.8), hit(c, 2, 0.7)];
        let source2 = vec![hit(c, 0, 0.95), hit(a, 1, 0.6), hit(b, 2, 0.5)];

        let fused_ab = fuse(&[source1.clone(), source2.clone()], FusionMethod::Rrf { k: 60.0 });
        let fused_ba = fuse(&[source2, source1], FusionMethod::Rrf { k: 60.0 });

        let mut x: Vec<_> = fused_ab.iter().map(|(id, s)| (*id, (*s * 1e9) as i64)).collect();
        let mut y: Vec<_> = fused_ba.iter().map(|(id, s)| (*id, (*s * 1e9) as i64)).collect();
        x.sort();
        y.sort();
        assert_eq!(x, y);
    }

    #[test]
    fn fused_scores_sorted_descending() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let source = vec![hit(a, 0, 1.0), hit(b, 1, 0.5)];
        let fused = fuse(&[source], FusionMethod::Rrf { k: 60.0 });
        assert!(fused.windows(2).all(|w| w[0].1 >= w[1].1));
    }

    #[test]
    fn distinct_ids_in_result() {
        let a = Uuid::new_v4();
        let source1 = vec![hit(a, 0, 0.9)];
        let source2 = vec![hit(a, 0, 0.95)];
        let fused = fuse(&[source1, source2], FusionMethod::CombMnz);
        assert_eq!(fused.len(), 1);
    }
}
