/// Scoring Functions - Pure Partial-Credit Logic
///
/// **Core Responsibility:**
/// Turn per-case outcome data into a numeric score.
///
/// **Critical Properties:**
/// - Knows nothing about processes, workers or the activity tracker
/// - Pure functions: (outcome data, case bounds) → score
///
/// **Scoring Modes:**
/// - Binary: full weight on success, zero otherwise
/// - Proportional: weight × correctness ratio in [0, 1]
/// - Bounded linear interpolation: credit between a floor and a ceiling,
///   proportional to how close an observed metric is to its target
///
/// **Normalization Rules (output comparison):**
/// - Trailing whitespace per line: ignored
/// - Leading/trailing blank lines: ignored
/// - `\r\n` vs `\n`: ignored
/// - Case sensitivity: YES (exact match required)

use serde::{Deserialize, Serialize};
use std::num::ParseIntError;

/// Full case weight on success, zero otherwise
pub fn binary(passed: bool, weight: f64) -> f64 {
    if passed {
        weight
    } else {
        0.0
    }
}

/// Weight scaled by a correctness ratio computed by the caller.
///
/// The ratio is expected in [0, 1]; values outside are clamped.
pub fn proportional(weight: f64, ratio: f64) -> f64 {
    debug_assert!(!ratio.is_nan(), "correctness ratio must be a number");
    weight * ratio.clamp(0.0, 1.0)
}

/// Bounds for bounded linear interpolation, all in integer-scaled score units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpolationBounds {
    /// Metric value that earns the floor score
    pub base_val: i64,
    /// Metric value that earns the ceiling score
    pub max_val: i64,
    /// Score for merely reaching `base_val`
    pub floor: i64,
    /// The case's full weight, same units as `floor`
    pub ceiling: i64,
}

/// Bounded linear interpolation.
///
/// `score = ceil((ceiling - floor) * (observed - base_val) / (max_val - base_val)) + floor`,
/// clipped to `[floor, ceiling]`. A degenerate range (`base_val == max_val`) or
/// a floor that already reaches the ceiling awards the ceiling outright.
/// When `max_val < base_val` (smaller metric is better) the division runs over
/// the magnitude of the range. Rounds in the candidate's favor.
///
/// `observed` is reported by the submission and may be any `i64`; it is pinned
/// to the metric range first and the product is taken in `u128`.
pub fn interpolate(bounds: &InterpolationBounds, observed: i64) -> i64 {
    let InterpolationBounds {
        base_val,
        max_val,
        floor,
        ceiling,
    } = *bounds;

    if base_val == max_val || floor >= ceiling {
        return ceiling;
    }

    let observed = observed.clamp(base_val.min(max_val), base_val.max(max_val));
    // Progress and span share the sign of the range once observed is pinned
    let span = (i128::from(max_val) - i128::from(base_val)).unsigned_abs();
    let progress = (i128::from(observed) - i128::from(base_val)).unsigned_abs();
    let width = (i128::from(ceiling) - i128::from(floor)).unsigned_abs();

    let raised = i128::from(floor) + (width * progress).div_ceil(span) as i128;
    raised.clamp(i128::from(floor), i128::from(ceiling)) as i64
}

/// Normalize output for comparison: unify line endings, drop trailing
/// whitespace on every line and surrounding blank lines.
pub fn normalize_output(output: &str) -> Vec<&str> {
    let lines: Vec<&str> = output
        .split('\n')
        .map(|line| line.trim_end())
        .collect();

    let start = lines.iter().position(|l| !l.is_empty()).unwrap_or(lines.len());
    let end = lines.iter().rposition(|l| !l.is_empty()).map_or(start, |i| i + 1);
    lines[start..end].to_vec()
}

/// Compare actual against expected output after normalization
pub fn outputs_match(actual: &str, expected: &str) -> bool {
    normalize_output(actual) == normalize_output(expected)
}

/// Fraction of expected items matched position-by-position.
///
/// An empty expectation is fully matched only by an empty answer.
pub fn match_ratio<T: PartialEq>(actual: &[T], expected: &[T]) -> f64 {
    if expected.is_empty() {
        return if actual.is_empty() { 1.0 } else { 0.0 };
    }

    let matched = actual
        .iter()
        .zip(expected.iter())
        .filter(|(a, e)| a == e)
        .count();
    matched as f64 / expected.len() as f64
}

/// Read an integer metric printed on stderr, `idx` lines from the end.
///
/// `Ok(None)` when stderr has too few lines; an error when the line is there
/// but does not hold an integer.
pub fn metric_from_stderr(stderr: &str, idx: usize) -> Result<Option<i64>, ParseIntError> {
    let lines = normalize_output(stderr);
    if lines.len() <= idx {
        return Ok(None);
    }
    lines[lines.len() - 1 - idx].trim().parse().map(Some)
}
