//! History-independent piece presence estimation.
//! Unlike the change detector, this does not compare against a learned
//! background: it looks for the shape signature of a round piece in the
//! square itself (edge ring, center-vs-border contrast, radial symmetry).
//! A temporal majority vote over the last few frames suppresses single-frame
//! flips from lighting flicker, and a cheap delta check against the last seen
//! image skips squares that have not visibly changed.

use crate::config::Settings;
use crate::grid::SquareImages;
use image::GrayImage;
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use shakmaty::Square;
use std::collections::{HashMap, HashSet, VecDeque};

/// Standard deviation below which a square is too uniform to hold a piece
/// (flat empty square, or a hand covering everything).
const UNIFORMITY_STD: f32 = 15.0;
/// Canny hysteresis thresholds.
const CANNY_LOW: f32 = 30.0;
const CANNY_HIGH: f32 = 80.0;
/// Expected piece-silhouette radius range, as a fraction of the square size.
const RING_MIN_RADIUS: f32 = 0.20;
const RING_MAX_RADIUS: f32 = 0.55;
/// Fraction of edge pixels that must fall inside the expected ring.
const RING_EDGE_FRACTION: f32 = 0.6;
/// Radial symmetry score above which the square reads as a piece.
const SYMMETRY_THRESHOLD: f32 = 0.6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionMethod {
    /// Canny edge pixels concentrated in the expected silhouette ring.
    EdgeRing,
    /// Intensity gap between the square's center and its corners.
    CenterContrast,
    /// Abrupt intensity change across concentric rings.
    RadialSymmetry,
}

#[derive(Clone, Debug)]
pub struct PresenceReport {
    pub has_piece: bool,
    pub confidence: f32,
    pub method: Option<DetectionMethod>,
    pub center_border_diff: f32,
}

impl PresenceReport {
    fn absent() -> Self {
        PresenceReport {
            has_piece: false,
            confidence: 0.0,
            method: None,
            center_border_diff: 0.0,
        }
    }
}

/// Shape-based presence detector with temporal smoothing and delta caching.
pub struct PieceDetector {
    blur_sigma: f32,
    history_size: usize,
    majority: f32,
    change_threshold: f32,
    center_contrast_threshold: f32,
    history: HashMap<Square, VecDeque<bool>>,
    references: HashMap<Square, GrayImage>,
    cached: HashMap<Square, PresenceReport>,
}

impl PieceDetector {
    pub fn new(settings: &Settings) -> Self {
        PieceDetector {
            blur_sigma: settings.blur_sigma,
            history_size: settings.presence_history.max(1),
            majority: settings.presence_majority,
            change_threshold: settings.presence_change_threshold,
            center_contrast_threshold: settings.center_contrast_threshold,
            history: HashMap::new(),
            references: HashMap::new(),
            cached: HashMap::new(),
        }
    }

    fn preprocess(&self, img: &GrayImage) -> GrayImage {
        gaussian_blur_f32(img, self.blur_sigma)
    }

    /// Single-frame presence estimate for one square image. Stateless.
    pub fn detect_piece(&self, img: &GrayImage) -> PresenceReport {
        self.classify(&self.preprocess(img))
    }

    fn classify(&self, gray: &GrayImage) -> PresenceReport {
        if std_dev(gray) < UNIFORMITY_STD {
            return PresenceReport::absent();
        }

        if let Some(confidence) = edge_ring_score(gray) {
            return PresenceReport {
                has_piece: true,
                confidence,
                method: Some(DetectionMethod::EdgeRing),
                center_border_diff: 0.0,
            };
        }

        let diff = center_border_diff(gray);
        if diff > self.center_contrast_threshold {
            return PresenceReport {
                has_piece: true,
                confidence: (diff / 80.0).min(1.0),
                method: Some(DetectionMethod::CenterContrast),
                center_border_diff: diff,
            };
        }

        let symmetry = radial_symmetry(gray);
        if symmetry > SYMMETRY_THRESHOLD {
            return PresenceReport {
                has_piece: true,
                confidence: symmetry.min(1.0),
                method: Some(DetectionMethod::RadialSymmetry),
                center_border_diff: diff,
            };
        }

        PresenceReport {
            center_border_diff: diff,
            ..PresenceReport::absent()
        }
    }

    /// Runs presence detection over a frame.
    ///
    /// `forced` squares are always re-evaluated (the session passes the union
    /// of occupied squares and legal destinations); the rest are re-evaluated
    /// only when they visibly differ from the last reference. Returns the
    /// smoothed per-square reports and the set of visually changed squares.
    pub fn detect_all(
        &mut self,
        squares: &SquareImages,
        forced: Option<&HashSet<Square>>,
    ) -> (HashMap<Square, PresenceReport>, HashSet<Square>) {
        let mut reports = HashMap::with_capacity(squares.len());
        let mut visual_changes = HashSet::new();

        for (&sq, img) in squares {
            let gray = self.preprocess(img);

            // Always computed, even for cached squares: the noise state
            // machine is driven by this set.
            let changed = self.has_changed(sq, &gray);
            if changed {
                visual_changes.insert(sq);
            }

            let should_process = forced.is_some_and(|f| f.contains(&sq))
                || changed
                || !self.cached.contains_key(&sq);

            let raw = if should_process {
                let r = self.classify(&gray);
                self.cached.insert(sq, r.clone());
                r
            } else {
                self.cached[&sq].clone()
            };

            self.push_history(sq, raw.has_piece);
            let stable = self.stable_presence(sq);

            // Only adopt a new visual reference once raw and smoothed agree;
            // a hand mid-pass must not become the reference.
            if should_process && raw.has_piece == stable {
                self.references.insert(sq, gray);
            }

            let mut report = raw;
            report.has_piece = stable;
            reports.insert(sq, report);
        }

        (reports, visual_changes)
    }

    /// Occupancy snapshot: the squares currently judged to hold a piece.
    pub fn occupied_squares(reports: &HashMap<Square, PresenceReport>) -> HashSet<Square> {
        reports
            .iter()
            .filter(|(_, r)| r.has_piece)
            .map(|(&sq, _)| sq)
            .collect()
    }

    /// Forces all visual references to the current frame and clears caches.
    /// Called after a confirmed move.
    pub fn update_references(&mut self, squares: &SquareImages) {
        for (&sq, img) in squares {
            let gray = self.preprocess(img);
            self.references.insert(sq, gray);
        }
        self.cached.clear();
    }

    fn has_changed(&self, sq: Square, gray: &GrayImage) -> bool {
        match self.references.get(&sq) {
            None => true,
            Some(r) if r.dimensions() != gray.dimensions() => true,
            Some(r) => {
                let sum: f32 = r
                    .pixels()
                    .zip(gray.pixels())
                    .map(|(a, b)| (a.0[0] as f32 - b.0[0] as f32).abs())
                    .sum();
                sum / (gray.width() * gray.height()) as f32 > self.change_threshold
            }
        }
    }

    fn push_history(&mut self, sq: Square, has_piece: bool) {
        let history = self.history.entry(sq).or_default();
        history.push_back(has_piece);
        while history.len() > self.history_size {
            history.pop_front();
        }
    }

    fn stable_presence(&self, sq: Square) -> bool {
        let Some(history) = self.history.get(&sq) else {
            return false;
        };
        if history.len() < 3 {
            return history.back().copied().unwrap_or(false);
        }
        let present = history.iter().filter(|&&b| b).count() as f32;
        present / history.len() as f32 >= self.majority
    }
}

fn std_dev(gray: &GrayImage) -> f32 {
    let n = (gray.width() * gray.height()) as f32;
    let mean = gray.pixels().map(|p| p.0[0] as f32).sum::<f32>() / n;
    let var = gray
        .pixels()
        .map(|p| {
            let d = p.0[0] as f32 - mean;
            d * d
        })
        .sum::<f32>()
        / n;
    var.sqrt()
}

/// Looks for a concentration of edge pixels at a plausible silhouette radius.
/// Returns a confidence when found.
fn edge_ring_score(gray: &GrayImage) -> Option<f32> {
    let edges = canny(gray, CANNY_LOW, CANNY_HIGH);
    let (w, h) = edges.dimensions();
    let min_dim = w.min(h) as f32;
    let (cx, cy) = (w as f32 / 2.0, h as f32 / 2.0);
    let (r_min, r_max) = (min_dim * RING_MIN_RADIUS, min_dim * RING_MAX_RADIUS);

    let mut total = 0u32;
    let mut in_ring = 0u32;
    for (x, y, p) in edges.enumerate_pixels() {
        if p.0[0] == 0 {
            continue;
        }
        total += 1;
        let dist = ((x as f32 - cx).powi(2) + (y as f32 - cy).powi(2)).sqrt();
        if (r_min..=r_max).contains(&dist) {
            in_ring += 1;
        }
    }

    // too few edges to call a shape
    if (total as f32) < min_dim {
        return None;
    }
    let fraction = in_ring as f32 / total as f32;
    (fraction > RING_EDGE_FRACTION).then_some(0.6 + 0.4 * fraction)
}

/// Intensity gap between a central disc and the four corner blocks.
/// A piece darkens or brightens the center relative to the board surface.
fn center_border_diff(gray: &GrayImage) -> f32 {
    let (w, h) = gray.dimensions();
    let min_dim = w.min(h);
    let (cx, cy) = (w as i64 / 2, h as i64 / 2);
    let radius = min_dim as i64 / 4;
    let corner = min_dim / 4;

    let mut center_sum = 0.0f32;
    let mut center_n = 0u32;
    let mut border_sum = 0.0f32;
    let mut border_n = 0u32;

    for (x, y, p) in gray.enumerate_pixels() {
        let v = p.0[0] as f32;
        let dx = x as i64 - cx;
        let dy = y as i64 - cy;
        if dx * dx + dy * dy <= radius * radius {
            center_sum += v;
            center_n += 1;
        }
        let in_corner = (x < corner || x >= w - corner) && (y < corner || y >= h - corner);
        if in_corner {
            border_sum += v;
            border_n += 1;
        }
    }

    if center_n == 0 || border_n == 0 {
        return 0.0;
    }
    (center_sum / center_n as f32 - border_sum / border_n as f32).abs()
}

/// Variance of mean intensity across concentric rings, normalized to 0..1.
/// A round piece produces an abrupt jump at its silhouette radius.
fn radial_symmetry(gray: &GrayImage) -> f32 {
    let (w, h) = gray.dimensions();
    let min_dim = w.min(h) as f32;
    let (cx, cy) = (w as f32 / 2.0, h as f32 / 2.0);
    let band = 2.0f32;

    let mut ring_means = Vec::new();
    for frac in [0.15, 0.25, 0.35, 0.45] {
        let r = min_dim * frac;
        let mut sum = 0.0f32;
        let mut n = 0u32;
        for (x, y, p) in gray.enumerate_pixels() {
            let dist = ((x as f32 - cx).powi(2) + (y as f32 - cy).powi(2)).sqrt();
            if (dist - r).abs() <= band {
                sum += p.0[0] as f32;
                n += 1;
            }
        }
        if n > 0 {
            ring_means.push(sum / n as f32);
        }
    }

    if ring_means.len() < 2 {
        return 0.0;
    }
    let mean = ring_means.iter().sum::<f32>() / ring_means.len() as f32;
    let var = ring_means.iter().map(|m| (m - mean).powi(2)).sum::<f32>() / ring_means.len() as f32;
    (var / 500.0).min(1.0)
}
