//! Tuning profiles and the random-forest parameter predictor
//!
//! A profile pairs a list of candidate parameter points (the tuner's
//! winners on some training machine) with an optional random-forest
//! regressor scoring those candidates for a given problem size. Forests
//! are the flattened-tree encoding the offline tuner exports as JSON:
//! per-node `children_left`/`children_right` indices (−1 marks a leaf),
//! the split `feature` and `threshold`, and a per-node score vector whose
//! length matches the candidate list.
//!
//! Prediction features are the log2-scaled problem sizes. Selection always
//! filters through the validity oracle first, so a profile trained on one
//! device never hands an impossible point to another.

use crate::driver::Device;
use crate::expr::Dtype;
use crate::params::{GemmParameters, Trans};
use crate::validity;
use serde::Deserialize;

/// Errors surfaced while loading or evaluating a profile.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    /// The JSON document failed to parse.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Tree arrays disagree on the node count, or a score vector has the
    /// wrong width.
    #[error("malformed estimator: {0}")]
    Shape(&'static str),
}

#[derive(Debug, Deserialize)]
struct TreeRepr {
    children_left: Vec<i32>,
    children_right: Vec<i32>,
    threshold: Vec<f32>,
    feature: Vec<i32>,
    value: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct ForestRepr {
    estimators: Vec<TreeRepr>,
}

/// One flattened decision tree.
#[derive(Debug)]
pub struct Tree {
    children_left: Vec<i32>,
    children_right: Vec<i32>,
    threshold: Vec<f32>,
    feature: Vec<i32>,
    value: Vec<Vec<f32>>,
    d: usize,
}

impl Tree {
    fn from_repr(repr: TreeRepr) -> Result<Tree, ProfileError> {
        let nodes = repr.children_left.len();
        if repr.children_right.len() != nodes
            || repr.threshold.len() != nodes
            || repr.feature.len() != nodes
            || repr.value.len() != nodes
        {
            return Err(ProfileError::Shape("node arrays disagree on length"));
        }
        let d = repr.value.first().map(Vec::len).unwrap_or(0);
        if repr.value.iter().any(|v| v.len() != d) {
            return Err(ProfileError::Shape("ragged score vectors"));
        }
        Ok(Tree {
            children_left: repr.children_left,
            children_right: repr.children_right,
            threshold: repr.threshold,
            feature: repr.feature,
            value: repr.value,
            d,
        })
    }

    /// Walk from the root to a leaf and return its score vector.
    pub fn predict(&self, x: &[f32]) -> &[f32] {
        let mut node = 0usize;
        while self.children_left[node] >= 0 {
            let f = self.feature[node] as usize;
            let go_left = x.get(f).copied().unwrap_or(0.0) <= self.threshold[node];
            node = if go_left {
                self.children_left[node] as usize
            } else {
                self.children_right[node] as usize
            };
        }
        &self.value[node]
    }

    /// Width of the score vectors.
    pub fn d(&self) -> usize {
        self.d
    }
}

/// An averaged ensemble of flattened trees.
#[derive(Debug)]
pub struct RandomForest {
    estimators: Vec<Tree>,
    d: usize,
}

impl RandomForest {
    /// Load a forest from the tuner's JSON export.
    pub fn from_json(text: &str) -> Result<RandomForest, ProfileError> {
        let repr: ForestRepr = serde_json::from_str(text)?;
        let mut estimators = Vec::with_capacity(repr.estimators.len());
        for tree in repr.estimators {
            estimators.push(Tree::from_repr(tree)?);
        }
        let d = estimators.first().map(Tree::d).unwrap_or(0);
        if estimators.iter().any(|t| t.d() != d) {
            return Err(ProfileError::Shape("estimators disagree on score width"));
        }
        Ok(RandomForest { estimators, d })
    }

    /// Average of the estimators' leaf scores at `x`.
    pub fn predict(&self, x: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0f32; self.d];
        if self.estimators.is_empty() {
            return out;
        }
        for tree in &self.estimators {
            for (acc, v) in out.iter_mut().zip(tree.predict(x)) {
                *acc += v;
            }
        }
        let norm = self.estimators.len() as f32;
        for v in &mut out {
            *v /= norm;
        }
        out
    }

    /// Number of trees.
    pub fn num_estimators(&self) -> usize {
        self.estimators.len()
    }
}

/// Candidate parameter points plus an optional scoring forest.
#[derive(Debug, Default)]
pub struct Profile {
    forest: Option<RandomForest>,
    candidates: Vec<GemmParameters>,
}

impl Profile {
    /// A profile over `candidates` with no scoring model.
    pub fn new(candidates: Vec<GemmParameters>) -> Profile {
        Profile { forest: None, candidates }
    }

    /// Attach a scoring forest. Its score width must match the candidate
    /// count.
    pub fn with_forest(
        candidates: Vec<GemmParameters>,
        forest: RandomForest,
    ) -> Result<Profile, ProfileError> {
        if forest.d != candidates.len() {
            return Err(ProfileError::Shape("score width does not match candidates"));
        }
        Ok(Profile { forest: Some(forest), candidates })
    }

    /// Candidate list.
    pub fn candidates(&self) -> &[GemmParameters] {
        &self.candidates
    }

    /// Pick the best oracle-valid candidate for a `(M, N, K)` problem:
    /// highest forest score, or the first valid candidate without a
    /// forest. `None` when every candidate is invalid on `device`.
    pub fn select(
        &self,
        device: &Device,
        dtype: Dtype,
        a_trans: Trans,
        b_trans: Trans,
        sizes: [usize; 3],
    ) -> Option<GemmParameters> {
        let valid = |p: &GemmParameters| {
            validity::is_invalid(p, device, dtype, a_trans, b_trans) == validity::VALID
        };
        match &self.forest {
            None => self.candidates.iter().find(|p| valid(p)).copied(),
            Some(forest) => {
                let x: Vec<f32> = sizes
                    .iter()
                    .map(|&s| (s.max(1) as f32).log2())
                    .collect();
                let scores = forest.predict(&x);
                let mut best: Option<(f32, GemmParameters)> = None;
                for (score, p) in scores.iter().zip(&self.candidates) {
                    if !valid(p) {
                        continue;
                    }
                    if best.map(|(b, _)| *score > b).unwrap_or(true) {
                        best = Some((*score, *p));
                    }
                }
                best.map(|(_, p)| p)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::FetchingPolicy;

    const FOREST_JSON: &str = r#"{
      "estimators": [
        {
          "children_left": [1, -1, -1],
          "children_right": [2, -1, -1],
          "threshold": [7.0, 0.0, 0.0],
          "feature": [2, -2, -2],
          "value": [[0.0, 0.0], [0.9, 0.1], [0.2, 0.8]]
        },
        {
          "children_left": [-1],
          "children_right": [-1],
          "threshold": [0.0],
          "feature": [-2],
          "value": [[0.5, 0.3]]
        }
      ]
    }"#;

    fn small_candidate() -> GemmParameters {
        GemmParameters::new(
            1,
            8,
            8,
            8,
            1,
            4,
            4,
            4,
            FetchingPolicy::Local,
            FetchingPolicy::Local,
            8,
            8,
        )
    }

    fn big_candidate() -> GemmParameters {
        GemmParameters::new(
            1,
            8,
            64,
            8,
            1,
            4,
            4,
            4,
            FetchingPolicy::Local,
            FetchingPolicy::Local,
            8,
            8,
        )
    }

    #[test]
    fn forest_prediction_averages_estimators() {
        let forest = RandomForest::from_json(FOREST_JSON).unwrap();
        assert_eq!(forest.num_estimators(), 2);
        // Small K routes left in tree 0: avg([0.9,0.1],[0.5,0.3]).
        assert_eq!(forest.predict(&[6.0, 6.0, 6.0]), vec![0.7, 0.2]);
        // Large K routes right: avg([0.2,0.8],[0.5,0.3]).
        let got = forest.predict(&[6.0, 6.0, 10.0]);
        assert!((got[0] - 0.35).abs() < 1e-6);
        assert!((got[1] - 0.55).abs() < 1e-6);
    }

    #[test]
    fn malformed_estimators_are_rejected() {
        let ragged = r#"{"estimators": [{
            "children_left": [-1],
            "children_right": [-1, -1],
            "threshold": [0.0],
            "feature": [-2],
            "value": [[0.5]]
        }]}"#;
        assert!(RandomForest::from_json(ragged).is_err());
        assert!(RandomForest::from_json("not json").is_err());
    }

    #[test]
    fn selection_scores_valid_candidates_only() {
        let device = Device::host();
        let forest = RandomForest::from_json(FOREST_JSON).unwrap();
        let profile =
            Profile::with_forest(vec![small_candidate(), big_candidate()], forest).unwrap();

        // Small K: candidate 0 scores 0.7 and wins.
        let picked = profile
            .select(&device, Dtype::F32, Trans::N, Trans::N, [64, 64, 64])
            .unwrap();
        assert_eq!(picked, small_candidate());

        // Large K favors candidate 1.
        let picked = profile
            .select(&device, Dtype::F32, Trans::N, Trans::N, [64, 64, 1024])
            .unwrap();
        assert_eq!(picked, big_candidate());
    }

    #[test]
    fn forest_free_profile_takes_first_valid() {
        let device = Device::host();
        let mut invalid = small_candidate();
        invalid.simd_width = 3;
        let profile = Profile::new(vec![invalid, big_candidate()]);
        let picked = profile
            .select(&device, Dtype::F32, Trans::N, Trans::N, [32, 32, 32])
            .unwrap();
        assert_eq!(picked, big_candidate());

        let none = Profile::new(vec![invalid]);
        assert!(none
            .select(&device, Dtype::F32, Trans::N, Trans::N, [32, 32, 32])
            .is_none());
    }
}
