//! The scoring table.
//!
//! | Dice                    | Points                          |
//! |-------------------------|---------------------------------|
//! | n ≥ 3 ones              | 1000 × 2^(n−3)                  |
//! | n ≥ 3 of face f (f > 1) | f × 100 × 2^(n−3)               |
//! | each remaining one      | 100                             |
//! | each remaining five     | 50                              |
//! | anything else           | 0                               |

use crate::EngineError;
use crate::session::DICE;

/// Scores a set of face values.
pub fn score(faces: &[u8]) -> u32 {
    let mut counts = [0u32; 7];
    for &face in faces {
        if (1..=6).contains(&face) {
            counts[face as usize] += 1;
        }
    }

    let mut points = 0;
    for face in 1..=6u32 {
        let n = counts[face as usize];
        if n >= 3 {
            let base = if face == 1 { 1000 } else { face * 100 };
            points += base << (n - 3);
        } else if face == 1 {
            points += 100 * n;
        } else if face == 5 {
            points += 50 * n;
        }
    }
    points
}

/// Scores the dice at `selection`.
pub fn score_selection(dice: &[u8; DICE], selection: &[usize]) -> u32 {
    let faces: Vec<u8> = selection.iter().filter_map(|&i| dice.get(i).copied()).collect();
    score(&faces)
}

/// Normalizes a selection: indices in range, no duplicates, sorted.
pub fn validate_selection(selection: &[usize]) -> Result<Vec<usize>, EngineError> {
    let mut sorted = selection.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.len() != selection.len() {
        return Err(EngineError::InvalidSelection("duplicate dice index".into()));
    }
    if let Some(&bad) = sorted.iter().find(|&&i| i >= DICE) {
        return Err(EngineError::InvalidSelection(format!(
            "dice index {bad} out of range"
        )));
    }
    Ok(sorted)
}

/// The highest-scoring subset of `dice`.
///
/// Ties prefer fewer dice, then the lexicographically smallest index list,
/// so the result is deterministic.
pub fn best_selection(dice: &[u8; DICE]) -> Vec<usize> {
    let mut best: (u32, Vec<usize>) = (0, Vec::new());
    for mask in 1u32..(1 << DICE) {
        let subset: Vec<usize> = (0..DICE).filter(|i| mask & (1 << i) != 0).collect();
        let points = score_selection(dice, &subset);
        let better = points > best.0
            || (points == best.0
                && points > 0
                && (subset.len() < best.1.len()
                    || (subset.len() == best.1.len() && subset < best.1)));
        if better {
            best = (points, subset);
        }
    }
    best.1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_singles() {
        assert_eq!(score(&[1]), 100);
        assert_eq!(score(&[5]), 50);
        assert_eq!(score(&[1, 5, 2, 3, 4]), 150);
        assert_eq!(score(&[2, 3, 4, 6, 6]), 0);
    }

    #[test]
    fn test_score_three_of_a_kind() {
        assert_eq!(score(&[1, 1, 1]), 1000);
        assert_eq!(score(&[2, 2, 2]), 200);
        assert_eq!(score(&[5, 5, 5]), 500);
        assert_eq!(score(&[6, 6, 6, 1, 5]), 750);
    }

    #[test]
    fn test_score_more_of_a_kind_doubles() {
        assert_eq!(score(&[4, 4, 4, 4]), 800);
        assert_eq!(score(&[4, 4, 4, 4, 4]), 1600);
        assert_eq!(score(&[1, 1, 1, 1, 1]), 4000);
    }

    #[test]
    fn test_score_empty_is_zero() {
        assert_eq!(score(&[]), 0);
    }

    #[test]
    fn test_validate_selection_rejects_duplicates_and_range() {
        assert_eq!(validate_selection(&[3, 0]), Ok(vec![0, 3]));
        assert!(validate_selection(&[1, 1]).is_err());
        assert!(validate_selection(&[5]).is_err());
        assert_eq!(validate_selection(&[]), Ok(vec![]));
    }

    #[test]
    fn test_best_selection_picks_all_scoring_dice() {
        assert_eq!(best_selection(&[1, 2, 5, 3, 4]), vec![0, 2]);
        assert_eq!(best_selection(&[3, 3, 6, 3, 2]), vec![0, 1, 3]);
    }

    #[test]
    fn test_best_selection_nothing_scores_is_empty() {
        assert!(best_selection(&[2, 3, 4, 6, 6]).is_empty());
    }
}
