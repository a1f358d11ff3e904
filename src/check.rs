//! CPU reference kernels and output comparison

use serde::Serialize;
use std::fmt;
use std::ops::Range;

/// Elementwise `a + b`, wrapping on overflow like the accelerator
pub fn lmem_loopback_cpu(a: &[i32], b: &[i32]) -> Vec<i32> {
    a.iter().zip(b).map(|(x, y)| x.wrapping_add(*y)).collect()
}

pub fn pass_through_cpu(data: &[f32]) -> Vec<f32> {
    data.to_vec()
}

/// `x * x + x`
pub fn simple_cpu(data: &[f32]) -> Vec<f32> {
    data.iter().map(|x| x * x + x).collect()
}

/// Three-point moving average with two-point averages at both ends
///
/// Inputs shorter than two elements are returned unchanged.
pub fn moving_average_cpu(data: &[f32]) -> Vec<f32> {
    let n = data.len();
    if n < 2 {
        return data.to_vec();
    }
    let mut expected = Vec::with_capacity(n);
    expected.push((data[0] + data[1]) / 2.0);
    for i in 1..n - 1 {
        expected.push((data[i - 1] + data[i] + data[i + 1]) / 3.0);
    }
    expected.push((data[n - 2] + data[n - 1]) / 2.0);
    expected
}

/// `x + y + scalar`, wrapping on overflow
pub fn vector_addition_cpu(x: &[i32], y: &[i32], scalar: i32) -> Vec<i32> {
    x.iter()
        .zip(y)
        .map(|(a, b)| a.wrapping_add(*b).wrapping_add(scalar))
        .collect()
}

/// One element that differs from its reference
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Mismatch<T> {
    pub index: usize,
    pub actual: T,
    pub expected: T,
}

impl<T: fmt::Display> fmt::Display for Mismatch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Output data @ {} = {} (expected {})",
            self.index, self.actual, self.expected
        )
    }
}

/// Result of comparing an output array against its reference
#[derive(Clone, Debug, Serialize)]
pub struct CheckReport<T> {
    /// Number of indices compared
    pub checked: usize,
    pub mismatches: Vec<Mismatch<T>>,
    /// `(actual, expected)` lengths when they differ
    pub length_mismatch: Option<(usize, usize)>,
}

impl<T> CheckReport<T> {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty() && self.length_mismatch.is_none()
    }

    /// Mismatching elements, plus one for a length difference
    pub fn failures(&self) -> usize {
        self.mismatches.len() + usize::from(self.length_mismatch.is_some())
    }

    pub fn first_mismatch(&self) -> Option<&Mismatch<T>> {
        self.mismatches.first()
    }
}

/// Compare every index of `actual` against `expected`
pub fn compare<T: PartialEq + Copy>(actual: &[T], expected: &[T]) -> CheckReport<T> {
    compare_range(actual, expected, 0..actual.len().max(expected.len()))
}

/// Compare only the indices in `range`
///
/// Indices past the shorter array are skipped; a length difference is
/// reported separately.
pub fn compare_range<T: PartialEq + Copy>(
    actual: &[T],
    expected: &[T],
    range: Range<usize>,
) -> CheckReport<T> {
    let length_mismatch = (actual.len() != expected.len()).then(|| (actual.len(), expected.len()));
    let end = range.end.min(actual.len()).min(expected.len());
    let start = range.start.min(end);

    let mismatches: Vec<_> = (start..end)
        .filter(|&i| actual[i] != expected[i])
        .map(|index| Mismatch {
            index,
            actual: actual[index],
            expected: expected[index],
        })
        .collect();

    if let Some(m) = mismatches.first() {
        tracing::debug!("{} mismatches, first at index {}", mismatches.len(), m.index);
    }

    CheckReport {
        checked: end - start,
        mismatches,
        length_mismatch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_kernels() {
        assert_eq!(lmem_loopback_cpu(&[1, 2, i32::MAX], &[3, 4, 1]), vec![4, 6, i32::MIN]);
        assert_eq!(simple_cpu(&[1.0, 2.0, -1.0]), vec![2.0, 6.0, 0.0]);
        assert_eq!(vector_addition_cpu(&[1, 2], &[10, 20], 5), vec![16, 27]);
        assert_eq!(pass_through_cpu(&[0.5, 1.5]), vec![0.5, 1.5]);
    }

    #[test]
    fn test_moving_average_reference() {
        assert_eq!(
            moving_average_cpu(&[3.0, 6.0, 9.0, 12.0]),
            vec![4.5, 6.0, 9.0, 10.5]
        );
        assert_eq!(moving_average_cpu(&[7.0]), vec![7.0]);
        assert_eq!(moving_average_cpu(&[2.0, 4.0]), vec![3.0, 3.0]);
        assert!(moving_average_cpu(&[]).is_empty());
    }

    #[test]
    fn test_injected_mismatch_is_reported() {
        let expected: Vec<i32> = (0..384).collect();
        let mut actual = expected.clone();
        actual[17] = -5;

        let report = compare(&actual, &expected);
        assert!(!report.passed());
        assert_eq!(report.checked, 384);
        assert_eq!(report.failures(), 1);
        assert_eq!(
            report.first_mismatch(),
            Some(&Mismatch {
                index: 17,
                actual: -5,
                expected: 17
            })
        );
        assert_eq!(
            report.mismatches[0].to_string(),
            "Output data @ 17 = -5 (expected 17)"
        );
    }

    #[test]
    fn test_length_mismatch_fails() {
        let report = compare(&[1, 2, 3], &[1, 2]);
        assert!(!report.passed());
        assert_eq!(report.length_mismatch, Some((3, 2)));
        assert!(report.mismatches.is_empty());
        assert_eq!(report.checked, 2);
    }

    #[test]
    fn test_compare_range_ignores_edges() {
        let expected = [1.0f32, 2.0, 3.0, 4.0];
        let actual = [9.0f32, 2.0, 3.0, 9.0];

        assert!(compare_range(&actual, &expected, 1..3).passed());
        assert_eq!(compare(&actual, &expected).failures(), 2);
    }

    #[test]
    fn test_empty_arrays_pass() {
        let report = compare::<i32>(&[], &[]);
        assert!(report.passed());
        assert_eq!(report.checked, 0);
    }
}
