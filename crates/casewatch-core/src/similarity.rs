//! Edit-distance similarity and weighted duplicate scoring.
//!
//! # Duplicate score
//!
//! Five factors are compared, each counted only when present on both
//! records:
//!
//! | Factor | Weight | Similarity |
//! |--------|--------|------------|
//! | name | 0.40 | normalized Levenshtein |
//! | case number | 0.25 | exact match (case-insensitive) = 1.0, else 0.0 |
//! | location | 0.20 | city and state compared separately, averaged |
//! | age | 0.10 | `max(0, 1 - |Δage| / 10)` |
//! | date missing | 0.05 | `max(0, 1 - |Δdays| / 365)` |
//!
//! The score is the weighted average over the present factors:
//! `Σ wᵢ·sᵢ / Σ wᵢ`, always in `[0, 1]`. Every factor is symmetric, so
//! `duplicate_score(a, b) == duplicate_score(b, a)`.

use crate::models::CasePayload;

/// Factor weights for [`duplicate_score`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DuplicateWeights {
    pub name: f64,
    pub case_number: f64,
    pub location: f64,
    pub age: f64,
    pub date: f64,
}

impl Default for DuplicateWeights {
    fn default() -> Self {
        Self {
            name: 0.4,
            case_number: 0.25,
            location: 0.2,
            age: 0.1,
            date: 0.05,
        }
    }
}

/// Classic Levenshtein edit distance over Unicode scalar values.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Levenshtein similarity normalized by the longer string's length.
///
/// Inputs are trimmed and lowercased first. Two empty strings are
/// identical (1.0).
pub fn string_similarity(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / longest as f64
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn location_similarity(a: &CasePayload, b: &CasePayload) -> Option<f64> {
    let mut parts = Vec::with_capacity(2);
    if let (Some(x), Some(y)) = (present(&a.city), present(&b.city)) {
        parts.push(string_similarity(x, y));
    }
    if let (Some(x), Some(y)) = (present(&a.state), present(&b.state)) {
        parts.push(string_similarity(x, y));
    }
    if parts.is_empty() {
        // Neither city nor state on both sides; fall back to the composed string.
        if let (Some(x), Some(y)) = (present(&a.location), present(&b.location)) {
            parts.push(string_similarity(x, y));
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.iter().sum::<f64>() / parts.len() as f64)
    }
}

/// Weighted similarity between two payloads using the default weights.
pub fn duplicate_score(a: &CasePayload, b: &CasePayload) -> f64 {
    duplicate_score_with(a, b, &DuplicateWeights::default())
}

/// Weighted similarity between two payloads.
///
/// Returns 0.0 when no factor is present on both sides.
pub fn duplicate_score_with(a: &CasePayload, b: &CasePayload, weights: &DuplicateWeights) -> f64 {
    let mut factors: Vec<(f64, f64)> = Vec::with_capacity(5);

    if let (Some(x), Some(y)) = (present(&a.name), present(&b.name)) {
        factors.push((weights.name, string_similarity(x, y)));
    }
    if let (Some(x), Some(y)) = (present(&a.case_number), present(&b.case_number)) {
        let same = x.eq_ignore_ascii_case(y);
        factors.push((weights.case_number, if same { 1.0 } else { 0.0 }));
    }
    if let Some(sim) = location_similarity(a, b) {
        factors.push((weights.location, sim));
    }
    if let (Some(x), Some(y)) = (a.age, b.age) {
        let delta = f64::from((x - y).abs());
        factors.push((weights.age, (1.0 - delta / 10.0).max(0.0)));
    }
    if let (Some(x), Some(y)) = (a.date_missing, b.date_missing) {
        let days = (x - y).num_days().abs() as f64;
        factors.push((weights.date, (1.0 - days / 365.0).max(0.0)));
    }

    let total_weight: f64 = factors.iter().map(|(w, _)| w).sum();
    if total_weight <= 0.0 {
        return 0.0;
    }
    let weighted: f64 = factors.iter().map(|(w, s)| w * s).sum();
    (weighted / total_weight).clamp(0.0, 1.0)
}
