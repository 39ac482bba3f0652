/// Represents a feature
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Feature {
    /// Feature ID
    pub feature_id: usize,

    /// Feature value
    pub value: f64,
}

impl Feature {
    /// Creates a new feature with its ID and value
    #[inline(always)]
    pub fn new(feature_id: usize, value: f64) -> Self {
        Self { feature_id, value }
    }
}

/// Sparse feature vector observed at one input position.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeatureVector {
    features: Vec<Feature>,
}

impl FeatureVector {
    /// Creates a feature vector from the given features.
    #[inline(always)]
    pub fn new(features: Vec<Feature>) -> Self {
        Self { features }
    }

    /// Creates a binary feature vector where every listed feature has value 1.
    pub fn binary(feature_ids: &[usize]) -> Self {
        Self {
            features: feature_ids.iter().map(|&id| Feature::new(id, 1.0)).collect(),
        }
    }

    /// Gets the features.
    #[inline(always)]
    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    /// Returns the value of the feature, or 0 if it is absent.
    pub fn value(&self, feature_id: usize) -> f64 {
        self.features
            .iter()
            .filter(|f| f.feature_id == feature_id)
            .map(|f| f.value)
            .sum()
    }

    /// Returns the largest feature ID plus one, i.e. the smallest dimension
    /// that can hold this vector.
    pub fn dimension(&self) -> usize {
        self.features
            .iter()
            .map(|f| f.feature_id + 1)
            .max()
            .unwrap_or(0)
    }

    /// Computes the dot product with `weights`.
    ///
    /// Features outside `weights` are ignored.
    #[inline(always)]
    pub fn dot(&self, weights: &[f64]) -> f64 {
        let mut score = 0.0;
        for feature in &self.features {
            if let Some(&w) = weights.get(feature.feature_id) {
                score += w * feature.value;
            }
        }
        score
    }
}

/// A training instance: one feature vector per input position and the label
/// index expected at each position.
#[derive(Clone, Debug, Default)]
pub struct Instance {
    /// Input sequence.
    pub input: Vec<FeatureVector>,

    /// Output label sequence. Must have the same length as `input`.
    pub output: Vec<usize>,
}

impl Instance {
    /// Creates a new instance.
    #[inline(always)]
    pub fn new(input: Vec<FeatureVector>, output: Vec<usize>) -> Self {
        Self { input, output }
    }

    /// Returns the number of positions.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.input.len()
    }

    /// Returns `true` if the instance has no positions.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }
}
