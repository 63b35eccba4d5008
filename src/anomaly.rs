//! Unsupervised anomaly detection over (base amount, hour-of-day).
//!
//! The concrete model is an isolation forest: random axis-aligned splits
//! isolate outliers in fewer steps than inliers, and the averaged path
//! length converts to a continuous score where more negative means more
//! anomalous. The model sits behind [`OutlierModel`] so the algorithm can be
//! swapped without touching the pipeline.
//!
//! Retraining runs off the request path and publishes a new model by atomic
//! swap; in-flight scoring calls keep the snapshot they acquired.

use arc_swap::ArcSwapOption;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Scoring interface for an unsupervised outlier model.
///
/// Returns the continuous anomaly score (negative = anomalous) and whether
/// the point falls inside the expected outlier fraction.
pub trait OutlierModel: Send + Sync {
    fn score(&self, amount_base: f64, hour: u32) -> (f64, bool);
}

/// Training parameters for the isolation forest.
#[derive(Debug, Clone)]
pub struct ForestParams {
    pub tree_count: usize,
    pub max_subsample: usize,
    /// Expected fraction of anomalous samples.
    pub contamination: f64,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            tree_count: 200,
            max_subsample: 256,
            contamination: 0.03,
            seed: 42,
        }
    }
}

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Average unsuccessful-search path length in a binary search tree of `n`
/// nodes. Normalizes isolation depths.
fn c_factor(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

enum Node {
    Split {
        dim: usize,
        value: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        size: usize,
    },
}

struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn fit(points: &mut [[f64; 2]], height_limit: usize, rng: &mut StdRng) -> Self {
        let mut nodes = Vec::new();
        Self::build(points, 0, height_limit, rng, &mut nodes);
        Tree { nodes }
    }

    fn build(
        points: &mut [[f64; 2]],
        depth: usize,
        limit: usize,
        rng: &mut StdRng,
        nodes: &mut Vec<Node>,
    ) -> usize {
        if depth >= limit || points.len() <= 1 {
            nodes.push(Node::Leaf { size: points.len() });
            return nodes.len() - 1;
        }

        // Pick a split dimension with spread; fall back to a leaf when the
        // region has collapsed to a single point in both dimensions.
        let first = rng.gen_range(0..2usize);
        let dim = [first, 1 - first]
            .into_iter()
            .find(|&d| range_of(points, d).is_some());
        let Some(dim) = dim else {
            nodes.push(Node::Leaf { size: points.len() });
            return nodes.len() - 1;
        };
        let (min, max) = range_of(points, dim).unwrap_or((0.0, 0.0));
        let value = rng.gen_range(min..max);

        let split = partition(points, dim, value);
        let idx = nodes.len();
        nodes.push(Node::Leaf { size: 0 }); // placeholder, replaced below
        let (lo, hi) = points.split_at_mut(split);
        let left = Self::build(lo, depth + 1, limit, rng, nodes);
        let right = Self::build(hi, depth + 1, limit, rng, nodes);
        nodes[idx] = Node::Split {
            dim,
            value,
            left,
            right,
        };
        idx
    }

    fn path_length(&self, x: &[f64; 2]) -> f64 {
        let mut idx = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { size } => return depth + c_factor(*size),
                Node::Split {
                    dim,
                    value,
                    left,
                    right,
                } => {
                    idx = if x[*dim] < *value { *left } else { *right };
                    depth += 1.0;
                }
            }
        }
    }
}

fn range_of(points: &[[f64; 2]], dim: usize) -> Option<(f64, f64)> {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for p in points {
        min = min.min(p[dim]);
        max = max.max(p[dim]);
    }
    (min < max).then_some((min, max))
}

fn partition(points: &mut [[f64; 2]], dim: usize, value: f64) -> usize {
    let mut i = 0;
    for j in 0..points.len() {
        if points[j][dim] < value {
            points.swap(i, j);
            i += 1;
        }
    }
    i
}

/// Trained isolation forest over (base amount, hour-of-day).
pub struct IsolationForest {
    trees: Vec<Tree>,
    path_norm: f64,
    /// Contamination quantile of the training scores; points scoring below
    /// it are flagged as outliers.
    offset: f64,
}

impl IsolationForest {
    pub fn fit(samples: &[[f64; 2]], params: &ForestParams) -> Self {
        if samples.is_empty() {
            return Self {
                trees: Vec::new(),
                path_norm: 1.0,
                offset: -1.0,
            };
        }

        let mut rng = StdRng::seed_from_u64(params.seed);
        let psi = samples.len().min(params.max_subsample.max(2));
        let height_limit = (psi as f64).log2().ceil() as usize;

        let mut trees = Vec::with_capacity(params.tree_count);
        for _ in 0..params.tree_count {
            let mut subsample: Vec<[f64; 2]> = rand::seq::index::sample(&mut rng, samples.len(), psi)
                .into_iter()
                .map(|i| samples[i])
                .collect();
            trees.push(Tree::fit(&mut subsample, height_limit, &mut rng));
        }

        let mut forest = Self {
            trees,
            path_norm: c_factor(psi),
            offset: 0.0,
        };

        // Calibrate the outlier cutoff so that roughly `contamination` of
        // the training sample scores negative.
        let mut train_scores: Vec<f64> = samples.iter().map(|p| -forest.anomaly_score(p)).collect();
        train_scores.sort_by(|a, b| a.total_cmp(b));
        let cut = ((samples.len() as f64) * params.contamination.clamp(0.0, 0.5)) as usize;
        forest.offset = train_scores[cut.min(samples.len() - 1)];
        forest
    }

    /// Anomaly score in (0, 1]; values near 1 indicate strong anomalies.
    fn anomaly_score(&self, x: &[f64; 2]) -> f64 {
        if self.trees.is_empty() || self.path_norm <= 0.0 {
            return 0.5;
        }
        let mean_path: f64 =
            self.trees.iter().map(|t| t.path_length(x)).sum::<f64>() / self.trees.len() as f64;
        2f64.powf(-mean_path / self.path_norm)
    }

    /// Continuous decision score: negative for outliers, more negative for
    /// stronger anomalies.
    pub fn decision_function(&self, amount_base: f64, hour: u32) -> f64 {
        -self.anomaly_score(&[amount_base, hour as f64]) - self.offset
    }
}

impl OutlierModel for IsolationForest {
    fn score(&self, amount_base: f64, hour: u32) -> (f64, bool) {
        let score = self.decision_function(amount_base, hour);
        (score, score < 0.0)
    }
}

/// Built-in synthetic training sample used for cold-start fallback: a bulk
/// of daytime mid-range amounts plus small high-amount and night-time tails.
pub fn synthetic_training_sample(seed: u64) -> Vec<[f64; 2]> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut samples = Vec::with_capacity(500);

    for _ in 0..400 {
        let amount = (3_000.0 + 800.0 * gauss(&mut rng)).clamp(1.0, 50_000.0);
        let hour = (14.0 + 4.0 * gauss(&mut rng)).clamp(0.0, 23.0).floor();
        samples.push([amount, hour]);
    }
    for _ in 0..50 {
        let amount = (15_000.0 + 5_000.0 * gauss(&mut rng)).clamp(1.0, 50_000.0);
        let hour = rng.gen_range(0..6) as f64;
        samples.push([amount, hour]);
    }
    for _ in 0..50 {
        let amount = (100.0 + 50.0 * gauss(&mut rng)).clamp(1.0, 50_000.0);
        let hour = rng.gen_range(22..24) as f64;
        samples.push([amount, hour]);
    }
    samples
}

/// Box-Muller standard normal draw.
fn gauss(rng: &mut StdRng) -> f64 {
    let u1 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
    let u2 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Process-wide holder for the current outlier model.
///
/// Scoring takes whatever model is published at call start. If nothing has
/// been trained yet, the first scorer fits the built-in fallback sample
/// rather than failing the request.
pub struct AnomalyDetector {
    model: ArcSwapOption<IsolationForest>,
    params: ForestParams,
    train_lock: Mutex<()>,
}

impl AnomalyDetector {
    pub fn new(params: ForestParams) -> Self {
        Self {
            model: ArcSwapOption::empty(),
            params,
            train_lock: Mutex::new(()),
        }
    }

    pub fn is_trained(&self) -> bool {
        self.model.load().is_some()
    }

    /// Score a point against the current model snapshot, self-healing a
    /// cold start by fitting the fallback sample.
    pub fn score(&self, amount_base: f64, hour: u32) -> (f64, bool) {
        if let Some(model) = self.model.load_full() {
            return model.score(amount_base, hour);
        }

        let _guard = self
            .train_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(model) = self.model.load_full() {
            return model.score(amount_base, hour);
        }

        info!("no anomaly model trained, fitting built-in fallback sample");
        let samples = synthetic_training_sample(self.params.seed);
        let model = Arc::new(IsolationForest::fit(&samples, &self.params));
        self.model.store(Some(Arc::clone(&model)));
        model.score(amount_base, hour)
    }

    /// Fit a replacement model and publish it atomically. Callers scoring
    /// against the previous snapshot are unaffected.
    pub fn retrain(&self, samples: &[[f64; 2]]) {
        let _guard = self
            .train_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let model = IsolationForest::fit(samples, &self.params);
        info!(samples = samples.len(), trees = self.params.tree_count, "anomaly model retrained");
        self.model.store(Some(Arc::new(model)));
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(ForestParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_params() -> ForestParams {
        ForestParams {
            tree_count: 100,
            max_subsample: 256,
            contamination: 0.03,
            seed: 42,
        }
    }

    #[test]
    fn test_extreme_point_scores_lower_than_typical() {
        let samples = synthetic_training_sample(42);
        let forest = IsolationForest::fit(&samples, &small_params());

        let typical = forest.decision_function(3_000.0, 14);
        let extreme = forest.decision_function(250_000.0, 3);
        assert!(extreme < typical);
    }

    #[test]
    fn test_typical_point_is_not_outlier() {
        let samples = synthetic_training_sample(42);
        let forest = IsolationForest::fit(&samples, &small_params());
        let (_, flagged) = forest.score(3_000.0, 14);
        assert!(!flagged);
    }

    #[test]
    fn test_far_outlier_is_flagged() {
        let samples = synthetic_training_sample(42);
        let forest = IsolationForest::fit(&samples, &small_params());
        let (score, flagged) = forest.score(250_000.0, 3);
        assert!(flagged);
        assert!(score < 0.0);
    }

    #[test]
    fn test_scoring_is_deterministic_for_fixed_seed() {
        let samples = synthetic_training_sample(7);
        let a = IsolationForest::fit(&samples, &small_params());
        let b = IsolationForest::fit(&samples, &small_params());
        assert_eq!(a.decision_function(9_999.0, 2), b.decision_function(9_999.0, 2));
    }

    #[test]
    fn test_cold_start_self_heals() {
        let detector = AnomalyDetector::new(small_params());
        assert!(!detector.is_trained());

        let (score, _) = detector.score(3_000.0, 14);
        assert!(score.is_finite());
        assert!(detector.is_trained());
    }

    #[test]
    fn test_retrain_swaps_model_snapshot() {
        let detector = AnomalyDetector::new(small_params());
        let before = detector.score(3_000.0, 14);

        // Retrain on a shifted distribution; published model changes.
        let shifted: Vec<[f64; 2]> = synthetic_training_sample(42)
            .into_iter()
            .map(|[amount, hour]| [amount * 10.0, hour])
            .collect();
        detector.retrain(&shifted);

        let after = detector.score(3_000.0, 14);
        assert!(detector.is_trained());
        assert_ne!(before.0, after.0);
    }

    #[test]
    fn test_empty_training_sample_degenerates_safely() {
        let forest = IsolationForest::fit(&[], &small_params());
        let (score, flagged) = forest.score(1_000.0, 12);
        assert!(score.is_finite());
        assert!(!flagged);
    }

    #[test]
    fn test_constant_sample_does_not_panic() {
        let samples = vec![[100.0, 10.0]; 64];
        let forest = IsolationForest::fit(&samples, &small_params());
        let (_, flagged) = forest.score(100.0, 10);
        assert!(!flagged);
    }
}
