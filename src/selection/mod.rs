//! Choice of the reference program shown to the hint model.
//!
//! Only enhanced programs already verified as correct are candidates.
//! Plan and debug hints use the candidate structurally closest to the
//! student's program; optimize hints use the fastest one.

pub mod tokens;

pub use tokens::essential_tokens;

use crate::models::{EnhancedProgram, HintType};

/// Levenshtein distance between two token sequences.
pub fn token_edit_distance<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, left) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, right) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(left != right);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

/// The candidate with the smallest token edit distance to `anchor`.
///
/// The first candidate reaching the minimum wins.
pub fn select_by_edit_distance<'a>(
    anchor: &str,
    candidates: &'a [EnhancedProgram],
) -> Option<&'a EnhancedProgram> {
    let anchor_tokens = essential_tokens(anchor);
    let mut best: Option<(&EnhancedProgram, usize)> = None;

    for candidate in candidates {
        let distance =
            token_edit_distance(&anchor_tokens, &essential_tokens(&candidate.enhanced_program));
        if best.map_or(true, |(_, min)| distance < min) {
            best = Some((candidate, distance));
        }
    }

    best.map(|(program, _)| program)
}

/// The candidate with the shortest measured runtime; ties keep input order.
pub fn select_by_run_time(candidates: &[EnhancedProgram]) -> Option<&EnhancedProgram> {
    candidates.iter().min_by(|a, b| {
        let a = a.run_time.unwrap_or(f64::INFINITY);
        let b = b.run_time.unwrap_or(f64::INFINITY);
        a.total_cmp(&b)
    })
}

/// Applies the selection policy of `hint_type` to the correct candidates.
pub fn select_reference_program<'a>(
    hint_type: HintType,
    student_program: &str,
    correct_candidates: &'a [EnhancedProgram],
) -> Option<&'a EnhancedProgram> {
    match hint_type {
        HintType::Plan | HintType::Debug => {
            select_by_edit_distance(student_program, correct_candidates)
        }
        HintType::Optimize => select_by_run_time(correct_candidates),
    }
}
