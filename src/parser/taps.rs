//! Tap geometry: pairwise separations, duplicate-tap filtering, and box layout.
//!
//! Mobile clients can register one tap several times. The filter below keeps
//! the first tap plus every later tap that is far enough from some earlier
//! tap in combination order; it is a heuristic, not a clustering.

use crate::constants::parser::DUPLICATE_TAP_FACTOR;
use crate::data::{BoundingBox, ImageDimensions, Mark};

/// Separation between taps `first` and `second` (indices into the tap list).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TapSeparation {
    pub first: usize,
    pub second: usize,
    /// Euclidean distance in image pixels.
    pub distance: f64,
}

/// Euclidean distances for every pair `(i, j)` with `i < j`, in combination order.
pub fn pairwise_separations(marks: &[Mark]) -> Vec<TapSeparation> {
    let mut separations = Vec::with_capacity(marks.len() * marks.len().saturating_sub(1) / 2);
    for (first, a) in marks.iter().enumerate() {
        for (offset, b) in marks[first + 1..].iter().enumerate() {
            separations.push(TapSeparation {
                first,
                second: first + 1 + offset,
                distance: (a.x - b.x).hypot(a.y - b.y),
            });
        }
    }
    separations
}

/// Sorted indices of the taps that survive duplicate filtering.
///
/// With one tap or none every index is kept. Otherwise index 0 is kept and
/// `j` is kept when some pair `(i, j)` is separated by more than
/// `0.75 * (width + height)`.
pub fn unique_tap_indices(marks: &[Mark], width: f64, height: f64) -> Vec<usize> {
    if marks.len() <= 1 {
        return (0..marks.len()).collect();
    }
    let threshold = DUPLICATE_TAP_FACTOR * (width + height);
    let separations = pairwise_separations(marks);
    let mut keep = vec![false; marks.len()];
    keep[separations[0].first] = true;
    for separation in &separations {
        if separation.distance > threshold {
            keep[separation.second] = true;
        }
    }
    keep.iter()
        .enumerate()
        .filter_map(|(idx, kept)| kept.then_some(idx))
        .collect()
}

/// Drop duplicate taps, keeping survivors in their original order.
pub fn filter_duplicate_taps(marks: &[Mark], width: f64, height: f64) -> Vec<Mark> {
    unique_tap_indices(marks, width, height)
        .into_iter()
        .map(|idx| marks[idx].clone())
        .collect()
}

/// Boxes of `width` x `height` centered on each mark.
pub fn boxes_for(
    marks: &[Mark],
    width: f64,
    height: f64,
    image: ImageDimensions,
) -> Vec<BoundingBox> {
    marks
        .iter()
        .map(|mark| BoundingBox::around(mark, width, height, image))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taps(points: &[(f64, f64)]) -> Vec<Mark> {
        points
            .iter()
            .enumerate()
            .map(|(idx, (x, y))| Mark::new(*x, *y, idx.to_string()))
            .collect()
    }

    fn points(marks: &[Mark]) -> Vec<(f64, f64)> {
        marks.iter().map(|mark| (mark.x, mark.y)).collect()
    }

    #[test]
    fn separations_follow_combination_order() {
        let marks = taps(&[(0.0, 0.0), (3.0, 4.0), (6.0, 8.0)]);
        let separations = pairwise_separations(&marks);
        let pairs: Vec<(usize, usize)> = separations
            .iter()
            .map(|sep| (sep.first, sep.second))
            .collect();
        assert_eq!(pairs, vec![(0, 1), (0, 2), (1, 2)]);
        assert_eq!(separations[0].distance, 5.0);
        assert_eq!(separations[1].distance, 10.0);
    }

    #[test]
    fn near_duplicate_tap_is_removed() {
        let marks = taps(&[(0.0, 0.0), (1.0, 1.0), (100.0, 100.0)]);
        let kept = filter_duplicate_taps(&marks, 35.0, 35.0);
        assert_eq!(points(&kept), vec![(0.0, 0.0), (100.0, 100.0)]);
        assert_eq!(kept[1].tool, "2");
    }

    #[test]
    fn single_tap_and_empty_lists_are_untouched() {
        assert!(unique_tap_indices(&[], 35.0, 35.0).is_empty());
        let one = taps(&[(5.0, 5.0)]);
        assert_eq!(unique_tap_indices(&one, 35.0, 35.0), vec![0]);
    }

    #[test]
    fn clustered_taps_collapse_to_the_first() {
        let marks = taps(&[(10.0, 10.0), (12.0, 11.0), (11.0, 13.0)]);
        assert_eq!(unique_tap_indices(&marks, 35.0, 35.0), vec![0]);
    }

    #[test]
    fn later_tap_far_from_any_earlier_tap_is_kept() {
        // Tap 2 repeats tap 1 but is far from tap 0, so it survives.
        let marks = taps(&[(0.0, 0.0), (60.0, 0.0), (61.0, 0.0)]);
        assert_eq!(unique_tap_indices(&marks, 35.0, 35.0), vec![0, 1, 2]);
    }

    #[test]
    fn boxes_are_centered_on_kept_taps() {
        let marks = taps(&[(50.0, 50.0)]);
        let image = ImageDimensions {
            width: 640.0,
            height: 480.0,
        };
        let boxes = boxes_for(&marks, 35.0, 20.0, image);
        assert_eq!(boxes.len(), 1);
        assert_eq!((boxes[0].x, boxes[0].x2), (32.5, 67.5));
        assert_eq!((boxes[0].y, boxes[0].y2), (40.0, 60.0));
        assert_eq!(boxes[0].image_height, 480.0);
    }
}
