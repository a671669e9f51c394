//! Per-square change detection with a single-Gaussian background model.
//! Every square tracks a running mean and variance of blurred grayscale
//! intensity per pixel; a square counts as changed when its mean z-score
//! exceeds a configurable threshold. The background is only updated from
//! frames where the square is judged stable, so a piece (or hand) in transit
//! never contaminates the model.

use crate::config::Settings;
use crate::grid::SquareImages;
use image::GrayImage;
use imageproc::filter::gaussian_blur_f32;
use shakmaty::Square;
use std::collections::{HashMap, HashSet};

/// Floor for the variance estimate; z-scores blow up otherwise.
const MIN_VARIANCE: f32 = 1.0;
/// Center-to-border change ratio above which a pattern reads as a round piece
/// silhouette rather than a flat hand or arm.
const CIRCULARITY_RATIO: f32 = 1.2;
/// Minimum changed-pixel percentage for the circularity call to mean anything.
const CIRCULARITY_MIN_PCT: f32 = 30.0;

const PCT_TOTAL: f32 = 80.0;
const PCT_PARTIAL: f32 = 50.0;
const PCT_LIGHT: f32 = 15.0;

/// How completely a square's pixels deviate from the background.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeIntensity {
    /// Below the light threshold; not reported.
    None,
    /// Shadow, or the edge of a hand brushing the square.
    Light,
    /// A moved piece, or an arm passing over.
    Partial,
    /// Near-complete occlusion, a hand covering the square.
    Total,
}

/// Fine-grained change classification for one square.
#[derive(Clone, Debug)]
pub struct ChangeProfile {
    /// Mean z-score over the square.
    pub z_score: f32,
    /// Percentage of pixels whose individual z-score exceeds the threshold.
    pub pct_changed: f32,
    pub intensity: ChangeIntensity,
    /// Change concentrated in the center, consistent with a round piece.
    pub is_circular: bool,
    pub center_ratio: f32,
}

struct GaussianModel {
    width: u32,
    height: u32,
    mean: Vec<f32>,
    variance: Vec<f32>,
}

impl GaussianModel {
    fn seed(blurred: &GrayImage, initial_variance: f32) -> Self {
        let mean: Vec<f32> = blurred.pixels().map(|p| p.0[0] as f32).collect();
        let variance = vec![initial_variance; mean.len()];
        GaussianModel {
            width: blurred.width(),
            height: blurred.height(),
            mean,
            variance,
        }
    }

    fn matches_dims(&self, img: &GrayImage) -> bool {
        self.width == img.width() && self.height == img.height()
    }
}

/// Detects per-square changes relative to a learned background.
/// Owns all per-square state; independent instances never share models, so
/// multiple sessions and tests cannot cross-contaminate.
pub struct ChangeDetector {
    z_threshold: f32,
    alpha: f32,
    initial_variance: f32,
    blur_sigma: f32,
    models: HashMap<Square, GaussianModel>,
    focus: Option<HashSet<Square>>,
    calibrated: bool,
}

impl ChangeDetector {
    pub fn new(settings: &Settings) -> Self {
        ChangeDetector {
            z_threshold: settings.z_threshold,
            alpha: settings.alpha,
            initial_variance: settings.initial_variance.max(MIN_VARIANCE),
            blur_sigma: settings.blur_sigma,
            models: HashMap::new(),
            focus: None,
            calibrated: false,
        }
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    fn preprocess(&self, img: &GrayImage) -> GrayImage {
        gaussian_blur_f32(img, self.blur_sigma)
    }

    /// Seeds the Gaussian model for every square from the current frame.
    pub fn calibrate(&mut self, squares: &SquareImages) {
        self.models.clear();
        for (&sq, img) in squares {
            let blurred = self.preprocess(img);
            self.models
                .insert(sq, GaussianModel::seed(&blurred, self.initial_variance));
        }
        self.calibrated = true;
        eprintln!(
            "[change] Gaussian model calibrated for {} squares",
            self.models.len()
        );
    }

    /// Restricts evaluation to the given squares. `None` scans everything.
    /// Pure performance optimization; detection semantics are unchanged.
    pub fn set_focus(&mut self, focus: Option<HashSet<Square>>) {
        self.focus = focus;
    }

    pub fn focus_count(&self) -> usize {
        self.focus.as_ref().map_or(64, HashSet::len)
    }

    fn squares_to_check<'a>(&'a self, squares: &'a SquareImages) -> Vec<Square> {
        match &self.focus {
            Some(focus) => focus.iter().copied().collect(),
            None => squares.keys().copied().collect(),
        }
    }

    /// Returns the squares judged changed this frame, keyed to their mean
    /// z-score. Stable squares feed the background update as a side effect.
    /// Uncalibrated detectors report nothing.
    pub fn detect_changes(&mut self, squares: &SquareImages) -> HashMap<Square, f32> {
        if !self.calibrated {
            return HashMap::new();
        }

        let mut changed = HashMap::new();
        for sq in self.squares_to_check(squares) {
            let Some(img) = squares.get(&sq) else { continue };
            let blurred = self.preprocess(img);
            let Some(model) = self.models.get_mut(&sq) else { continue };

            if !model.matches_dims(&blurred) {
                // Upstream geometry shifted; re-seed rather than compare garbage.
                *model = GaussianModel::seed(&blurred, self.initial_variance);
                continue;
            }

            let z = mean_z_score(&blurred, model);
            if z > self.z_threshold {
                changed.insert(sq, z);
            } else {
                update_background(&blurred, model, self.alpha);
            }
        }
        changed
    }

    /// Like [`detect_changes`](Self::detect_changes) but classifies each
    /// changed square by intensity bucket and circularity.
    pub fn detect_changes_detailed(&mut self, squares: &SquareImages) -> HashMap<Square, ChangeProfile> {
        if !self.calibrated {
            return HashMap::new();
        }

        let mut detailed = HashMap::new();
        for sq in self.squares_to_check(squares) {
            let Some(img) = squares.get(&sq) else { continue };
            let blurred = self.preprocess(img);
            let Some(model) = self.models.get_mut(&sq) else { continue };

            if !model.matches_dims(&blurred) {
                *model = GaussianModel::seed(&blurred, self.initial_variance);
                continue;
            }

            let profile = change_profile(&blurred, model, self.z_threshold);
            if profile.intensity == ChangeIntensity::None {
                update_background(&blurred, model, self.alpha);
            } else {
                detailed.insert(sq, profile);
            }
        }
        detailed
    }

    /// Resets one square's model to the current image. Used after a confirmed
    /// move so the just-landed piece becomes the new background.
    pub fn update_reference(&mut self, sq: Square, img: &GrayImage) {
        let blurred = self.preprocess(img);
        self.models
            .insert(sq, GaussianModel::seed(&blurred, self.initial_variance));
    }

    pub fn update_all_references(&mut self, squares: &SquareImages) {
        for (&sq, img) in squares {
            self.update_reference(sq, img);
        }
        self.calibrated = true;
    }

    /// Mean background intensity for a square, for diagnostics.
    pub fn mean_intensity(&self, sq: Square) -> Option<f32> {
        self.models
            .get(&sq)
            .map(|m| m.mean.iter().sum::<f32>() / m.mean.len() as f32)
    }
}

fn mean_z_score(blurred: &GrayImage, model: &GaussianModel) -> f32 {
    let mut sum = 0.0f32;
    for (i, p) in blurred.pixels().enumerate() {
        let sigma = model.variance[i].max(MIN_VARIANCE).sqrt();
        sum += (p.0[0] as f32 - model.mean[i]).abs() / sigma;
    }
    sum / model.mean.len() as f32
}

/// Exponential update, applied only when the square matched the background:
/// mean <- (1-a)*mean + a*x, var <- (1-a)*var + a*(x-mean)^2, floored.
fn update_background(blurred: &GrayImage, model: &mut GaussianModel, alpha: f32) {
    for (i, p) in blurred.pixels().enumerate() {
        let x = p.0[0] as f32;
        let diff = x - model.mean[i];
        model.mean[i] = (1.0 - alpha) * model.mean[i] + alpha * x;
        model.variance[i] = ((1.0 - alpha) * model.variance[i] + alpha * diff * diff).max(MIN_VARIANCE);
    }
}

fn change_profile(blurred: &GrayImage, model: &GaussianModel, z_threshold: f32) -> ChangeProfile {
    let (w, h) = (model.width as i64, model.height as i64);
    let (cx, cy) = (w / 2, h / 2);
    let radius = w.min(h) / 4;

    let mut z_sum = 0.0f32;
    let mut changed_count = 0usize;
    let mut center_changed = 0usize;
    let mut center_total = 0usize;
    let mut border_changed = 0usize;
    let mut border_total = 0usize;

    for (i, p) in blurred.pixels().enumerate() {
        let sigma = model.variance[i].max(MIN_VARIANCE).sqrt();
        let z = (p.0[0] as f32 - model.mean[i]).abs() / sigma;
        z_sum += z;
        let is_changed = z > z_threshold;
        if is_changed {
            changed_count += 1;
        }

        let x = i as i64 % w;
        let y = i as i64 / w;
        let in_center = (x - cx).pow(2) + (y - cy).pow(2) <= radius * radius;
        if in_center {
            center_total += 1;
            if is_changed {
                center_changed += 1;
            }
        } else {
            border_total += 1;
            if is_changed {
                border_changed += 1;
            }
        }
    }

    let total = model.mean.len() as f32;
    let pct_changed = changed_count as f32 / total * 100.0;
    let center_pct = if center_total > 0 {
        center_changed as f32 / center_total as f32 * 100.0
    } else {
        0.0
    };
    let border_pct = if border_total > 0 {
        border_changed as f32 / border_total as f32 * 100.0
    } else {
        0.0
    };
    let center_ratio = if border_pct > 0.0 {
        center_pct / border_pct
    } else if center_pct > 0.0 {
        10.0
    } else {
        1.0
    };

    let intensity = if pct_changed >= PCT_TOTAL {
        ChangeIntensity::Total
    } else if pct_changed >= PCT_PARTIAL {
        ChangeIntensity::Partial
    } else if pct_changed >= PCT_LIGHT {
        ChangeIntensity::Light
    } else {
        ChangeIntensity::None
    };

    ChangeProfile {
        z_score: z_sum / total,
        pct_changed,
        intensity,
        is_circular: center_ratio > CIRCULARITY_RATIO && pct_changed > CIRCULARITY_MIN_PCT,
        center_ratio,
    }
}
