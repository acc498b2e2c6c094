//! Plane-level mask algorithms.
//!
//! Every function here reads one label plane (and optionally one raw plane)
//! and returns a freshly staged plane; nothing is written back until the
//! engine commits the result, so a failing edit leaves the volume untouched.

use crate::error::{EngineError, EngineResult};
use crate::volume::Plane;
use cellmask_protocol::Label;
use itertools::Itertools;
use ndarray::{s, Array2, ArrayView2, Zip};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

/// Label used while two ids trade places; never a valid label.
pub const SWAP_SENTINEL: Label = Label::MAX;

/// The id after `max`, refusing to run into the sentinel.
pub fn next_label(max: Label) -> EngineResult<Label> {
    match max.checked_add(1) {
        Some(label) if label < SWAP_SENTINEL => Ok(label),
        _ => Err(EngineError::invalid_input(format!(
            "No label id left above {max}"
        ))),
    }
}

const NEIGHBORS_4: [(isize, isize); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];
const NEIGHBORS_8: [(isize, isize); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Four,
    Eight,
}

impl Connectivity {
    fn offsets(self) -> &'static [(isize, isize)] {
        match self {
            Self::Four => &NEIGHBORS_4,
            Self::Eight => &NEIGHBORS_8,
        }
    }
}

/// Tuning knobs of the watershed split heuristics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitParams {
    pub min_pixels: usize,
    pub dilation_radius: usize,
}

impl Default for SplitParams {
    fn default() -> Self {
        Self {
            min_pixels: 5,
            dilation_radius: 3,
        }
    }
}

/// Axis-aligned box, half-open on the bottom/right edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub top: usize,
    pub left: usize,
    pub bottom: usize,
    pub right: usize,
}

impl BoundingBox {
    /// Normalize two corners given as `(row, col)` pairs.
    pub fn from_corners(a: (usize, usize), b: (usize, usize)) -> Self {
        Self {
            top: a.0.min(b.0),
            bottom: a.0.max(b.0),
            left: a.1.min(b.1),
            right: a.1.max(b.1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.top >= self.bottom || self.left >= self.right
    }

    fn fits(&self, shape: (usize, usize)) -> bool {
        self.bottom <= shape.0 && self.right <= shape.1
    }
}

fn step(point: (usize, usize), offset: (isize, isize), shape: (usize, usize)) -> Option<(usize, usize)> {
    let row = point.0.checked_add_signed(offset.0)?;
    let col = point.1.checked_add_signed(offset.1)?;
    (row < shape.0 && col < shape.1).then_some((row, col))
}

fn check_seed(plane: &ArrayView2<'_, Label>, seed: (usize, usize)) -> EngineResult<Label> {
    plane.get(seed).copied().ok_or_else(|| {
        let (h, w) = plane.dim();
        EngineError::invalid_input(format!(
            "Point (row {}, col {}) is outside the {h}x{w} plane",
            seed.0, seed.1
        ))
    })
}

/// Mask of the connected region sharing the seed's value.
pub fn flood_region(
    plane: ArrayView2<'_, Label>,
    seed: (usize, usize),
    connectivity: Connectivity,
) -> EngineResult<Array2<bool>> {
    let value = check_seed(&plane, seed)?;
    let shape = plane.dim();
    let mut region = Array2::from_elem(shape, false);
    let mut queue = VecDeque::from([seed]);
    region[seed] = true;
    while let Some(point) = queue.pop_front() {
        for offset in connectivity.offsets() {
            if let Some(next) = step(point, *offset, shape) {
                if !region[next] && plane[next] == value {
                    region[next] = true;
                    queue.push_back(next);
                }
            }
        }
    }
    Ok(region)
}

pub fn contains_label(plane: ArrayView2<'_, Label>, label: Label) -> bool {
    plane.iter().any(|&v| v == label)
}

pub fn count_label(plane: ArrayView2<'_, Label>, label: Label) -> usize {
    plane.iter().filter(|&&v| v == label).count()
}

/// Replace every `from` pixel with `to`.
pub fn relabel(plane: ArrayView2<'_, Label>, from: Label, to: Label) -> Plane {
    plane.mapv(|v| if v == from { to } else { v })
}

/// Exchange two labels through a sentinel so neither pass clobbers the other.
pub fn swap_labels(plane: ArrayView2<'_, Label>, a: Label, b: Label) -> EngineResult<Plane> {
    if a == SWAP_SENTINEL || b == SWAP_SENTINEL {
        return Err(EngineError::invalid_input(format!(
            "Label {SWAP_SENTINEL} is reserved"
        )));
    }
    let mut staged = relabel(plane, a, SWAP_SENTINEL);
    staged.mapv_inplace(|v| if v == b { a } else { v });
    staged.mapv_inplace(|v| if v == SWAP_SENTINEL { b } else { v });
    Ok(staged)
}

/// Stamp a circular brush along `trace` (`(row, col)` points).
///
/// Drawing turns `target_value` into `brush_value` under the brush and
/// erasing does the reverse; other labels are never touched. Every trace
/// point must lie inside the plane.
pub fn brush_stroke(
    plane: ArrayView2<'_, Label>,
    trace: &[(usize, usize)],
    target_value: Label,
    brush_value: Label,
    brush_size: usize,
    erase: bool,
) -> EngineResult<Plane> {
    for &point in trace {
        check_seed(&plane, point)?;
    }
    let mut staged = plane.to_owned();
    let candidate = if erase {
        relabel(plane, brush_value, target_value)
    } else {
        relabel(plane, target_value, brush_value)
    };
    let (height, width) = plane.dim();
    // nothing beyond the plane diagonal can be reached anyway
    let radius = brush_size.min(height.max(width) + 1) as isize;
    let radius_sq = radius * radius;
    for &(row, col) in trace {
        let (row, col) = (row as isize, col as isize);
        for r in (row - radius).max(0)..(row + radius + 1).min(height as isize) {
            for c in (col - radius).max(0)..(col + radius + 1).min(width as isize) {
                let (dr, dc) = (r - row, c - col);
                if dr * dr + dc * dc < radius_sq {
                    let idx = (r as usize, c as usize);
                    staged[idx] = candidate[idx];
                }
            }
        }
    }
    Ok(staged)
}

/// Zero every `label` pixel not 8-connected to the seed's component.
pub fn trim_stray(
    plane: ArrayView2<'_, Label>,
    label: Label,
    seed: (usize, usize),
) -> EngineResult<Plane> {
    let value = check_seed(&plane, seed)?;
    if value != label {
        return Err(EngineError::invalid_input(format!(
            "Seed point holds label {value}, not {label}"
        )));
    }
    let keep = flood_region(plane, seed, Connectivity::Eight)?;
    let mut staged = plane.to_owned();
    Zip::from(&mut staged).and(&keep).for_each(|v, &kept| {
        if *v == label && !kept {
            *v = 0;
        }
    });
    Ok(staged)
}

/// Fill the 4-connected background region at the seed with `label`.
pub fn fill_hole(
    plane: ArrayView2<'_, Label>,
    label: Label,
    seed: (usize, usize),
) -> EngineResult<Plane> {
    let value = check_seed(&plane, seed)?;
    if value != 0 {
        return Err(EngineError::invalid_input(format!(
            "Seed point holds label {value}; only background can be filled"
        )));
    }
    let hole = flood_region(plane, seed, Connectivity::Four)?;
    let mut staged = plane.to_owned();
    Zip::from(&mut staged).and(&hole).for_each(|v, &inside| {
        if inside {
            *v = label;
        }
    });
    Ok(staged)
}

/// Give the 8-connected component at the seed the id `new_label`.
pub fn flood_component(
    plane: ArrayView2<'_, Label>,
    seed: (usize, usize),
    new_label: Label,
) -> EngineResult<Plane> {
    let component = flood_region(plane, seed, Connectivity::Eight)?;
    let mut staged = plane.to_owned();
    Zip::from(&mut staged).and(&component).for_each(|v, &inside| {
        if inside {
            *v = new_label;
        }
    });
    Ok(staged)
}

/// Tight box around every pixel equal to `label`, or None when absent.
pub fn bounding_box(plane: ArrayView2<'_, Label>, label: Label) -> Option<BoundingBox> {
    let hits: Vec<(usize, usize)> = plane
        .indexed_iter()
        .filter(|&(_, &v)| v == label)
        .map(|(idx, _)| idx)
        .collect();
    let (top, bottom) = hits.iter().map(|&(row, _)| row).minmax().into_option()?;
    let (left, right) = hits.iter().map(|&(_, col)| col).minmax().into_option()?;
    Some(BoundingBox {
        top,
        left,
        bottom: bottom + 1,
        right: right + 1,
    })
}

/// Linear stretch of the values onto [0, 1]; a flat image maps to zeros.
pub fn rescale_intensity(values: ArrayView2<'_, f32>) -> Array2<f32> {
    let (lo, hi) = min_max(values);
    let span = hi - lo;
    if !span.is_finite() || span <= 0.0 {
        return Array2::zeros(values.dim());
    }
    values.mapv(|v| (v - lo) / span)
}

fn min_max(values: ArrayView2<'_, f32>) -> (f32, f32) {
    values
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

/// Grey dilation with a disk footprint (`dr^2 + dc^2 <= r^2`).
pub fn dilate(plane: ArrayView2<'_, Label>, radius: usize) -> Plane {
    let (height, width) = plane.dim();
    let r = radius as isize;
    let mut footprint = vec![];
    for dr in -r..=r {
        for dc in -r..=r {
            if dr * dr + dc * dc <= r * r {
                footprint.push((dr, dc));
            }
        }
    }
    Array2::from_shape_fn((height, width), |(row, col)| {
        footprint
            .iter()
            .filter_map(|&offset| step((row, col), offset, (height, width)))
            .map(|idx| plane[idx])
            .max()
            .unwrap_or(0)
    })
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    value: f32,
    age: u64,
    point: (usize, usize),
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    // BinaryHeap is a max-heap: lowest value first, then oldest entry
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .value
            .total_cmp(&self.value)
            .then_with(|| other.age.cmp(&self.age))
    }
}

/// Marker-based priority-flood watershed on `surface`, restricted to `mask`.
///
/// `markers` holds the seed labels (0 elsewhere); pixels are claimed by the
/// first basin that reaches them, in order of increasing surface height.
pub fn watershed(
    surface: ArrayView2<'_, f32>,
    markers: ArrayView2<'_, Label>,
    mask: ArrayView2<'_, bool>,
) -> Plane {
    let shape = surface.dim();
    let mut labels = markers.to_owned();
    let mut heap = BinaryHeap::new();
    let mut age = 0u64;
    for ((row, col), &marker) in markers.indexed_iter() {
        if marker != 0 && mask[(row, col)] {
            heap.push(Pending {
                value: surface[(row, col)],
                age,
                point: (row, col),
            });
            age += 1;
        }
    }
    while let Some(Pending { point, .. }) = heap.pop() {
        let label = labels[point];
        for offset in NEIGHBORS_4 {
            if let Some(next) = step(point, offset, shape) {
                if labels[next] == 0 && mask[next] {
                    labels[next] = label;
                    heap.push(Pending {
                        value: surface[next],
                        age,
                        point: next,
                    });
                    age += 1;
                }
            }
        }
    }
    labels
}

/// Split `label` in two with a watershed seeded at `seed_keep` (keeps
/// `label`) and `seed_new` (becomes `new_label`).
pub fn watershed_split(
    plane: ArrayView2<'_, Label>,
    raw: ArrayView2<'_, f32>,
    label: Label,
    new_label: Label,
    seed_keep: (usize, usize),
    seed_new: (usize, usize),
    params: SplitParams,
) -> EngineResult<Plane> {
    if plane.dim() != raw.dim() {
        return Err(EngineError::invalid_input("Raw and label planes differ in shape"));
    }
    let bbox = bounding_box(plane, label).ok_or_else(|| {
        EngineError::invalid_input(format!("Label {label} has no pixels in this frame"))
    })?;
    for seed in [seed_keep, seed_new] {
        let value = check_seed(&plane, seed)?;
        if value != label {
            return Err(EngineError::invalid_input(format!(
                "Seed (row {}, col {}) holds label {value}, not {label}",
                seed.0, seed.1
            )));
        }
    }
    if seed_keep == seed_new {
        return Err(EngineError::invalid_input("Watershed seeds must differ"));
    }

    let window = s![bbox.top..bbox.bottom, bbox.left..bbox.right];
    let sub_ann = plane.slice(window);
    let surface = rescale_intensity(raw.slice(window)).mapv(|v| -v);
    let mask = sub_ann.mapv(|v| v != 0);
    let mut markers = Array2::<Label>::zeros(sub_ann.dim());
    markers[(seed_keep.0 - bbox.top, seed_keep.1 - bbox.left)] = label;
    markers[(seed_new.0 - bbox.top, seed_new.1 - bbox.left)] = new_label;

    let mut ws = watershed(surface.view(), markers.view(), mask.view());

    let new_pixels = Zip::from(&ws)
        .and(&sub_ann)
        .fold(0usize, |acc, &w, &a| acc + usize::from(w == new_label && a == label));
    if new_pixels < params.min_pixels {
        ws = dilate(ws.view(), params.dilation_radius);
    }
    if count_label(ws.view(), label) < params.min_pixels {
        let kept = ws.mapv(|v| if v == label { v } else { 0 });
        let grown = dilate(kept.view(), params.dilation_radius);
        Zip::from(&mut ws).and(&grown).for_each(|w, &g| {
            if g == label {
                *w = g;
            }
        });
    }

    let mut staged = plane.to_owned();
    Zip::from(staged.slice_mut(window))
        .and(&ws)
        .for_each(|v, &w| {
            if *v == label && w == new_label {
                *v = new_label;
            }
        });
    Ok(staged)
}

/// Triangle threshold over a 256-bin histogram of the finite values.
pub fn triangle_threshold(values: ArrayView2<'_, f32>) -> Option<f32> {
    const NBINS: usize = 256;
    let (mut lo, mut hi) = min_max(values);
    if lo > hi {
        return None;
    }
    if lo == hi {
        lo -= 0.5;
        hi += 0.5;
    }
    let bin_width = (hi - lo) / NBINS as f32;
    let mut hist = vec![0usize; NBINS];
    for &v in values.iter().filter(|v| v.is_finite()) {
        let bin = (((v - lo) / bin_width) as usize).min(NBINS - 1);
        hist[bin] += 1;
    }
    let centers: Vec<f32> = (0..NBINS)
        .map(|i| lo + bin_width * (i as f32 + 0.5))
        .collect();

    // first index wins on ties, like argmax
    let mut arg_peak = 0;
    for (i, &count) in hist.iter().enumerate() {
        if count > hist[arg_peak] {
            arg_peak = i;
        }
    }
    let nonzero: Vec<usize> = (0..NBINS).filter(|&i| hist[i] > 0).collect();
    let (mut arg_low, arg_high) = (*nonzero.first()?, *nonzero.last()?);

    let flip = arg_peak - arg_low < arg_high - arg_peak;
    if flip {
        hist.reverse();
        arg_low = NBINS - arg_high - 1;
        arg_peak = NBINS - arg_peak - 1;
    }
    let width = arg_peak - arg_low;
    if width == 0 {
        let level = if flip { NBINS - arg_low - 1 } else { arg_low };
        return Some(centers[level]);
    }
    let peak_height = hist[arg_peak] as f64;
    let norm = (peak_height * peak_height + (width * width) as f64).sqrt();
    let (ph, wd) = (peak_height / norm, width as f64 / norm);
    let mut best = (f64::NEG_INFINITY, 0usize);
    for x in 0..width {
        let length = ph * x as f64 - wd * hist[x + arg_low] as f64;
        if length > best.0 {
            best = (length, x);
        }
    }
    let mut level = best.1 + arg_low;
    if flip {
        level = NBINS - level - 1;
    }
    Some(centers[level])
}

/// Keep 4-connected components of `values > low` that touch `values > high`.
pub fn hysteresis(values: ArrayView2<'_, f32>, low: f32, high: f32) -> Array2<bool> {
    let shape = values.dim();
    let weak = values.mapv(|v| v > low);
    let mut keep = Array2::from_elem(shape, false);
    let mut visited = Array2::from_elem(shape, false);
    for ((row, col), &is_weak) in weak.indexed_iter() {
        if !is_weak || visited[(row, col)] {
            continue;
        }
        let mut component = vec![(row, col)];
        let mut queue = VecDeque::from([(row, col)]);
        let mut strong = false;
        visited[(row, col)] = true;
        while let Some(point) = queue.pop_front() {
            strong |= values[point] > high;
            for offset in NEIGHBORS_4 {
                if let Some(next) = step(point, offset, shape) {
                    if weak[next] && !visited[next] {
                        visited[next] = true;
                        component.push(next);
                        queue.push_back(next);
                    }
                }
            }
        }
        if strong {
            for point in component {
                keep[point] = true;
            }
        }
    }
    keep
}

/// Predict a mask for `label` inside `bbox` from the raw intensities,
/// writing only into background pixels.
pub fn threshold_predict(
    plane: ArrayView2<'_, Label>,
    raw: ArrayView2<'_, f32>,
    bbox: BoundingBox,
    label: Label,
    stringency: f32,
) -> EngineResult<Plane> {
    if bbox.is_empty() {
        return Err(EngineError::invalid_input("Threshold box is empty"));
    }
    if !bbox.fits(plane.dim()) || plane.dim() != raw.dim() {
        let (h, w) = plane.dim();
        return Err(EngineError::invalid_input(format!(
            "Threshold box rows {}..{} cols {}..{} exceeds the {h}x{w} plane",
            bbox.top, bbox.bottom, bbox.left, bbox.right
        )));
    }
    let window = s![bbox.top..bbox.bottom, bbox.left..bbox.right];
    let area = raw.slice(window);
    let low = triangle_threshold(area).ok_or_else(|| {
        EngineError::invalid_input("Threshold box holds no finite intensities")
    })?;
    let predicted = hysteresis(area, low, stringency * low);
    let mut staged = plane.to_owned();
    Zip::from(staged.slice_mut(window))
        .and(&predicted)
        .for_each(|v, &hit| {
            if hit && *v == 0 {
                *v = label;
            }
        });
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn necked_blob() -> Plane {
        array![
            [3, 3, 0, 3, 3],
            [3, 3, 0, 3, 3],
            [3, 3, 3, 3, 3],
            [3, 3, 0, 3, 3],
            [3, 3, 0, 3, 3],
        ]
    }

    #[test]
    fn test_swap_labels_uses_sentinel() {
        let plane = array![[1, 2], [2, 0]];
        let swapped = swap_labels(plane.view(), 1, 2).unwrap();
        assert_eq!(swapped, array![[2, 1], [1, 0]]);
        assert_eq!(swap_labels(swapped.view(), 1, 2).unwrap(), plane);
        assert!(swap_labels(plane.view(), SWAP_SENTINEL, 2).is_err());
    }

    #[test]
    fn test_brush_stroke_huge_radius_covers_plane() {
        let plane = array![[0, 3], [0, 0]];
        let drawn = brush_stroke(plane.view(), &[(0, 0)], 0, 5, usize::MAX, false).unwrap();
        assert_eq!(drawn, array![[5, 3], [5, 5]]);
    }

    #[test]
    fn test_brush_stroke_rejects_points_off_the_plane() {
        let plane = array![[0, 0], [0, 0]];
        assert!(brush_stroke(plane.view(), &[(0, 0), (usize::MAX, 1)], 0, 5, 1, false).is_err());
        assert!(brush_stroke(plane.view(), &[(2, 0)], 0, 5, 1, false).is_err());
    }

    #[test]
    fn test_brush_stroke_only_touches_target() {
        let plane = array![
            [0, 0, 0, 0],
            [0, 7, 0, 0],
            [0, 0, 0, 0],
        ];
        let drawn = brush_stroke(plane.view(), &[(1, 1)], 0, 4, 2, false).unwrap();
        assert_eq!(drawn[(1, 1)], 7);
        assert_eq!(drawn[(0, 1)], 4);
        assert_eq!(drawn[(1, 2)], 4);
        // (2,3): 1 + 4 = 5 >= 4, outside the brush
        assert_eq!(drawn[(2, 3)], 0);
        let erased = brush_stroke(drawn.view(), &[(1, 1)], 0, 4, 2, true).unwrap();
        assert_eq!(erased, plane);
    }

    #[test]
    fn test_trim_stray_keeps_seed_component() {
        let plane = array![[5, 5, 0, 5], [0, 5, 0, 0], [0, 0, 0, 5]];
        let trimmed = trim_stray(plane.view(), 5, (0, 0)).unwrap();
        assert_eq!(trimmed, array![[5, 5, 0, 0], [0, 5, 0, 0], [0, 0, 0, 0]]);
    }

    #[test]
    fn test_trim_stray_follows_diagonals() {
        let plane = array![[5, 0], [0, 5]];
        assert_eq!(trim_stray(plane.view(), 5, (0, 0)).unwrap(), plane);
    }

    #[test]
    fn test_trim_stray_rejects_bad_seed() {
        let plane = array![[5, 0], [0, 5]];
        assert!(trim_stray(plane.view(), 5, (0, 1)).is_err());
        assert!(trim_stray(plane.view(), 5, (4, 4)).is_err());
    }

    #[test]
    fn test_fill_hole_is_four_connected() {
        let plane = array![
            [2, 2, 2, 0],
            [2, 0, 2, 0],
            [2, 2, 0, 2],
        ];
        let filled = fill_hole(plane.view(), 2, (1, 1)).unwrap();
        assert_eq!(filled[(1, 1)], 2);
        assert_eq!(filled[(2, 2)], 0);
        assert_eq!(filled[(0, 3)], 0);
        assert!(fill_hole(plane.view(), 2, (0, 0)).is_err());
    }

    #[test]
    fn test_flood_component_relabels_only_component() {
        let plane = array![[4, 4, 0, 4], [0, 0, 0, 4]];
        let flooded = flood_component(plane.view(), (0, 0), 9).unwrap();
        assert_eq!(flooded, array![[9, 9, 0, 4], [0, 0, 0, 4]]);
    }

    #[test]
    fn test_bounding_box_spans_all_pixels() {
        let plane = array![[0, 1, 0], [0, 0, 0], [1, 0, 0]];
        let bbox = bounding_box(plane.view(), 1).unwrap();
        assert_eq!(
            bbox,
            BoundingBox {
                top: 0,
                left: 0,
                bottom: 3,
                right: 2
            }
        );
        assert!(bounding_box(plane.view(), 2).is_none());
    }

    #[test]
    fn test_dilate_uses_disk() {
        let mut plane = Array2::<Label>::zeros((5, 5));
        plane[(2, 2)] = 1;
        let grown = dilate(plane.view(), 1);
        assert_eq!(count_label(grown.view(), 1), 5);
        assert_eq!(grown[(1, 1)], 0);
    }

    #[test]
    fn test_watershed_split_conserves_pixels() {
        let plane = necked_blob();
        let raw = Array2::<f32>::ones((5, 5));
        let before = count_label(plane.view(), 3);
        let split = watershed_split(
            plane.view(),
            raw.view(),
            3,
            4,
            (2, 0),
            (2, 4),
            SplitParams::default(),
        )
        .unwrap();
        let kept = count_label(split.view(), 3);
        let new = count_label(split.view(), 4);
        assert!(kept > 0 && new > 0);
        assert_eq!(kept + new, before);
        assert_eq!(split[(0, 0)], 3);
        assert_eq!(split[(0, 4)], 4);
    }

    #[test]
    fn test_watershed_split_rejects_degenerate_input() {
        let plane = necked_blob();
        let raw = Array2::<f32>::zeros((5, 5));
        let params = SplitParams::default();
        assert!(watershed_split(plane.view(), raw.view(), 8, 9, (0, 0), (0, 4), params).is_err());
        assert!(watershed_split(plane.view(), raw.view(), 3, 4, (0, 2), (0, 4), params).is_err());
        assert!(watershed_split(plane.view(), raw.view(), 3, 4, (0, 0), (0, 0), params).is_err());
    }

    #[test]
    fn test_triangle_threshold_sits_between_modes() {
        let mut raw = Array2::<f32>::zeros((10, 10));
        for row in 0..3 {
            for col in 0..3 {
                raw[(row, col)] = 100.0;
            }
        }
        let level = triangle_threshold(raw.view()).unwrap();
        assert!(level > 0.0 && level < 100.0);
    }

    #[test]
    fn test_hysteresis_drops_weak_only_components() {
        let values = array![[0.5, 0.5, 0.0, 0.5], [0.0, 2.0, 0.0, 0.5]];
        let mask = hysteresis(values.view(), 0.4, 1.0);
        assert!(mask[(0, 0)] && mask[(1, 1)]);
        assert!(!mask[(0, 3)] && !mask[(1, 3)]);
    }

    #[test]
    fn test_threshold_predict_never_overwrites() {
        let mut raw = Array2::<f32>::zeros((6, 6));
        for row in 1..4 {
            for col in 1..4 {
                raw[(row, col)] = 50.0;
            }
        }
        let mut plane = Array2::<Label>::zeros((6, 6));
        plane[(2, 2)] = 9;
        let bbox = BoundingBox::from_corners((0, 0), (6, 6));
        let staged = threshold_predict(plane.view(), raw.view(), bbox, 5, 1.1).unwrap();
        assert_eq!(staged[(2, 2)], 9);
        assert_eq!(staged[(1, 1)], 5);
        assert_eq!(staged[(5, 5)], 0);
    }

    #[test]
    fn test_threshold_predict_rejects_bad_boxes() {
        let plane = Array2::<Label>::zeros((4, 4));
        let raw = Array2::<f32>::zeros((4, 4));
        let empty = BoundingBox::from_corners((1, 1), (1, 3));
        assert!(threshold_predict(plane.view(), raw.view(), empty, 1, 1.1).is_err());
        let outside = BoundingBox::from_corners((0, 0), (9, 2));
        assert!(threshold_predict(plane.view(), raw.view(), outside, 1, 1.1).is_err());
    }
}
