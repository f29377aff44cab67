//! Windowed activity classification over accelerometer samples.
//!
//! Each sample becomes a 10-feature row (raw triple, magnitude, rolling mean
//! and standard deviation per axis) appended to a 50-row ring. Once the ring
//! has filled, every sample triggers inference over the whole window,
//! followed by a stability gate that only confirms a label after several
//! consistent, confident frames.

use std::collections::VecDeque;

use crate::types::{AccelSample, ActivityLabel, Classification};
use crate::{KineticError, Result};

/// Rows in the feature window.
pub const WINDOW_SIZE: usize = 50;
/// Features per row: `[ax, ay, az, |a|, mean x/y/z, std x/y/z]`.
pub const NUM_FEATURES: usize = 10;
/// Classes emitted by the activity model.
pub const NUM_CLASSES: usize = 6;

/// Pretrained activity model.
///
/// `input` holds `WINDOW_SIZE * NUM_FEATURES` values, row-major, oldest row
/// first. `output` has one slot per class in [`ActivityLabel::CLASSES`] order.
pub trait InferenceModel: Send {
    fn infer(&mut self, input: &[f32], output: &mut [f32]) -> Result<()>;

    fn num_classes(&self) -> usize {
        NUM_CLASSES
    }
}

impl<F> InferenceModel for F
where
    F: FnMut(&[f32], &mut [f32]) -> Result<()> + Send,
{
    fn infer(&mut self, input: &[f32], output: &mut [f32]) -> Result<()> {
        self(input, output)
    }
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// A repeated label must beat this value to extend its streak.
    pub confidence_threshold: f32,
    /// Consecutive consistent frames required before a label is confirmed.
    pub stability_threshold: u32,
    /// Standard deviation used until a full history is available.
    pub cold_start_std: f32,
    /// Largest absolute feature value after per-window normalisation.
    pub normalization_target: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.2,
            stability_threshold: 3,
            cold_start_std: 0.1,
            normalization_target: 10.0,
        }
    }
}

/// Fixed-size ring of feature rows.
#[derive(Debug, Clone)]
pub struct FeatureWindow {
    rows: Vec<[f32; NUM_FEATURES]>,
    next: usize,
    ready: bool,
}

impl FeatureWindow {
    pub fn new() -> Self {
        Self {
            rows: vec![[0.0; NUM_FEATURES]; WINDOW_SIZE],
            next: 0,
            ready: false,
        }
    }

    /// Overwrite the oldest row. Becomes ready when the ring wraps the first time.
    pub fn push(&mut self, row: [f32; NUM_FEATURES]) {
        self.rows[self.next] = row;
        self.next = (self.next + 1) % WINDOW_SIZE;
        if self.next == 0 {
            self.ready = true;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Rows written so far, saturating at `WINDOW_SIZE`.
    pub fn len(&self) -> usize {
        if self.ready {
            WINDOW_SIZE
        } else {
            self.next
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows oldest first.
    pub fn iter_chronological(&self) -> impl Iterator<Item = &[f32; NUM_FEATURES]> {
        let (newer, older) = self.rows.split_at(self.next);
        let older = if self.ready { older } else { &older[..0] };
        older.iter().chain(newer.iter())
    }

    pub fn max_abs(&self) -> f32 {
        self.iter_chronological()
            .flat_map(|row| row.iter())
            .fold(0.0f32, |acc, v| acc.max(v.abs()))
    }

    /// Write the window into `out`, scaled so the largest magnitude equals
    /// `target`. An all-zero window is copied unscaled.
    pub fn write_normalized(&self, target: f32, out: &mut Vec<f32>) {
        let max = self.max_abs();
        let scale = if max > 0.0 { target / max } else { 1.0 };
        out.clear();
        for row in self.iter_chronological() {
            out.extend(row.iter().map(|v| v * scale));
        }
    }

    pub fn clear(&mut self) {
        self.rows.iter_mut().for_each(|row| *row = [0.0; NUM_FEATURES]);
        self.next = 0;
        self.ready = false;
    }
}

impl Default for FeatureWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts consecutive consistent, confident classifications.
#[derive(Debug, Clone)]
pub struct StabilityTracker {
    last_label: Option<ActivityLabel>,
    consecutive: u32,
    threshold: u32,
    confidence_floor: f32,
}

impl StabilityTracker {
    pub fn new(threshold: u32, confidence_floor: f32) -> Self {
        Self {
            last_label: None,
            consecutive: 0,
            threshold,
            confidence_floor,
        }
    }

    /// Record one candidate; true once the label is confirmed.
    ///
    /// A new label restarts the streak at 1 and is never confirmed on the same
    /// frame. A repeat extends it only above the confidence floor; at or below
    /// the floor the streak drops to 0.
    pub fn observe(&mut self, label: ActivityLabel, confidence: f32) -> bool {
        if self.last_label != Some(label) {
            self.last_label = Some(label);
            self.consecutive = 1;
            log::trace!("New activity candidate {}", label.as_str());
            return false;
        }

        if confidence > self.confidence_floor {
            self.consecutive = self.consecutive.saturating_add(1);
        } else {
            self.consecutive = 0;
            log::trace!("Confidence {:.3} too low, streak reset", confidence);
        }
        self.consecutive >= self.threshold
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn last_label(&self) -> Option<ActivityLabel> {
        self.last_label
    }

    pub fn reset(&mut self) {
        self.last_label = None;
        self.consecutive = 0;
    }
}

pub struct WindowedActivityClassifier {
    config: ClassifierConfig,
    model: Option<Box<dyn InferenceModel>>,
    history: VecDeque<[f32; 3]>,
    window: FeatureWindow,
    tracker: StabilityTracker,
    input: Vec<f32>,
    output: Vec<f32>,
    last_confidence: f32,
}

impl WindowedActivityClassifier {
    /// Build a classifier. Without a model every call reports
    /// [`ActivityLabel::AiNotLoaded`].
    pub fn new(config: ClassifierConfig, model: Option<Box<dyn InferenceModel>>) -> Self {
        let output_len = model.as_ref().map(|m| m.num_classes()).unwrap_or(NUM_CLASSES);
        Self {
            tracker: StabilityTracker::new(config.stability_threshold, config.confidence_threshold),
            config,
            model,
            history: VecDeque::with_capacity(WINDOW_SIZE + 1),
            window: FeatureWindow::new(),
            input: Vec::with_capacity(WINDOW_SIZE * NUM_FEATURES),
            output: vec![0.0; output_len],
            last_confidence: 0.0,
        }
    }

    /// Build a classifier from a fallible model loader. A failed load is
    /// logged once and leaves the classifier permanently unloaded.
    pub fn load<L>(config: ClassifierConfig, loader: L) -> Self
    where
        L: FnOnce() -> Result<Box<dyn InferenceModel>>,
    {
        let model = match loader() {
            Ok(model) => {
                log::info!("Activity model loaded");
                Some(model)
            }
            Err(e) => {
                log::error!("Failed to load activity model: {}", e);
                None
            }
        };
        Self::new(config, model)
    }

    pub fn is_model_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Model value at the winning index of the most recent inference.
    pub fn last_confidence(&self) -> f32 {
        self.last_confidence
    }

    pub fn window_size(&self) -> usize {
        WINDOW_SIZE
    }

    pub fn is_ready(&self) -> bool {
        self.window.is_ready()
    }

    /// Feed one accelerometer sample and classify the current window.
    pub fn push_sample(&mut self, sample: &AccelSample) -> Classification {
        if self.model.is_none() {
            return Classification::sentinel(ActivityLabel::AiNotLoaded);
        }
        if !sample.is_finite() {
            log::warn!(
                "Invalid sensor data: x={}, y={}, z={}",
                sample.ax,
                sample.ay,
                sample.az
            );
            return Classification::sentinel(ActivityLabel::Error);
        }

        let row = self.feature_row(sample);
        self.window.push(row);

        if !self.window.is_ready() {
            return Classification::sentinel(ActivityLabel::CollectingData);
        }

        match self.classify_window() {
            Ok(classification) => classification,
            Err(e) => {
                log::error!("Classification error: {}", e);
                Classification::sentinel(ActivityLabel::Error)
            }
        }
    }

    /// Clear history, window and stability streak. The model is kept.
    pub fn reset(&mut self) {
        self.history.clear();
        self.window.clear();
        self.tracker.reset();
        self.last_confidence = 0.0;
    }

    fn feature_row(&mut self, sample: &AccelSample) -> [f32; NUM_FEATURES] {
        let raw = [sample.ax, sample.ay, sample.az];
        self.history.push_back(raw);
        if self.history.len() > WINDOW_SIZE {
            self.history.pop_front();
        }

        let (means, stds) = if self.history.len() >= WINDOW_SIZE {
            axis_stats(&self.history)
        } else {
            (raw, [self.config.cold_start_std; 3])
        };

        [
            raw[0],
            raw[1],
            raw[2],
            sample.magnitude(),
            means[0],
            means[1],
            means[2],
            stds[0],
            stds[1],
            stds[2],
        ]
    }

    fn classify_window(&mut self) -> Result<Classification> {
        self.window
            .write_normalized(self.config.normalization_target, &mut self.input);

        let model = self.model.as_mut().ok_or(KineticError::ModelNotLoaded)?;
        self.output.iter_mut().for_each(|v| *v = 0.0);
        model.infer(&self.input, &mut self.output)?;

        if self.output.len() != NUM_CLASSES {
            return Err(KineticError::OutputShape {
                expected: NUM_CLASSES,
                got: self.output.len(),
            });
        }
        if self.output.iter().any(|v| !v.is_finite()) {
            log::warn!("Model emitted non-finite scores: {:?}", self.output);
            return Ok(Classification::sentinel(ActivityLabel::Uncertain));
        }

        let (index, confidence) = self
            .output
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, v)| {
                if v > best.1 {
                    (i, v)
                } else {
                    best
                }
            });
        let label = ActivityLabel::from_class_index(index).ok_or(KineticError::OutputShape {
            expected: NUM_CLASSES,
            got: index + 1,
        })?;

        log::debug!(
            "Confidence scores: {:?}, max {:.3} ({})",
            self.output,
            confidence,
            label.as_str()
        );
        self.last_confidence = confidence;

        let label = if self.tracker.observe(label, confidence) {
            label
        } else {
            ActivityLabel::CollectingData
        };
        Ok(Classification { label, confidence })
    }
}

/// Per-axis mean and population standard deviation.
fn axis_stats(history: &VecDeque<[f32; 3]>) -> ([f32; 3], [f32; 3]) {
    let n = history.len() as f64;
    let mut sums = [0.0f64; 3];
    let mut squares = [0.0f64; 3];
    for sample in history {
        for axis in 0..3 {
            let v = sample[axis] as f64;
            sums[axis] += v;
            squares[axis] += v * v;
        }
    }

    let mut means = [0.0f32; 3];
    let mut stds = [0.0f32; 3];
    for axis in 0..3 {
        let mean = sums[axis] / n;
        let variance = (squares[axis] / n - mean * mean).max(0.0);
        means[axis] = mean as f32;
        stds[axis] = variance.sqrt() as f32;
    }
    (means, stds)
}
