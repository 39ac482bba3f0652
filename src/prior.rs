use crate::errors::{CrfError, Result};

/// Default variance of the Gaussian prior.
pub const DEFAULT_GAUSSIAN_VARIANCE: f64 = 1.0;

/// Default slope of the hyperbolic prior.
pub const DEFAULT_HYPERBOLIC_SLOPE: f64 = 0.2;

/// Default sharpness of the hyperbolic prior.
pub const DEFAULT_HYPERBOLIC_SHARPNESS: f64 = 10.0;

/// Prior over parameters, added to the objective as a penalty.
#[cfg_attr(docsrs, doc(cfg(feature = "train")))]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Prior {
    /// No penalty.
    None,

    /// Penalty `θ² / (2 variance)`.
    Gaussian {
        /// Variance.
        variance: f64,
    },

    /// Penalty `(slope / sharpness) ln cosh(sharpness θ)`, a smooth
    /// approximation of an L1 penalty with the given slope.
    Hyperbolic {
        /// Asymptotic slope of the penalty.
        slope: f64,
        /// How quickly the penalty approaches its asymptotes.
        sharpness: f64,
    },
}

impl Default for Prior {
    fn default() -> Self {
        Self::Gaussian {
            variance: DEFAULT_GAUSSIAN_VARIANCE,
        }
    }
}

impl Prior {
    /// Creates a Gaussian prior.
    ///
    /// # Errors
    ///
    /// `variance` must be positive.
    pub fn gaussian(variance: f64) -> Result<Self> {
        if !(variance > 0.0) {
            return Err(CrfError::invalid_argument(
                "variance must be greater than 0.0",
            ));
        }
        Ok(Self::Gaussian { variance })
    }

    /// Creates a hyperbolic prior.
    ///
    /// # Errors
    ///
    /// `slope` must be non-negative and `sharpness` positive.
    pub fn hyperbolic(slope: f64, sharpness: f64) -> Result<Self> {
        if !(slope >= 0.0) {
            return Err(CrfError::invalid_argument(
                "slope must be greater than or equal to 0.0",
            ));
        }
        if !(sharpness > 0.0) {
            return Err(CrfError::invalid_argument(
                "sharpness must be greater than 0.0",
            ));
        }
        Ok(Self::Hyperbolic { slope, sharpness })
    }

    /// Penalty of one parameter. Infinite parameters are not penalised.
    #[inline(always)]
    pub fn penalty(&self, theta: f64) -> f64 {
        if !theta.is_finite() {
            return 0.0;
        }
        match *self {
            Self::None => 0.0,
            Self::Gaussian { variance } => theta * theta / (2.0 * variance),
            Self::Hyperbolic { slope, sharpness } => {
                // ln cosh(z) = |z| + ln(1 + exp(-2|z|)) - ln 2, stable for large |z|
                let z = (sharpness * theta).abs();
                slope / sharpness * (z + (-2.0 * z).exp().ln_1p() - core::f64::consts::LN_2)
            }
        }
    }

    /// Derivative of [`Self::penalty()`]. Zero for infinite parameters.
    #[inline(always)]
    pub fn gradient(&self, theta: f64) -> f64 {
        if !theta.is_finite() {
            return 0.0;
        }
        match *self {
            Self::None => 0.0,
            Self::Gaussian { variance } => theta / variance,
            Self::Hyperbolic { slope, sharpness } => slope * (sharpness * theta).tanh(),
        }
    }

    /// Sum of the penalties of every parameter.
    pub fn total_penalty(&self, params: &[f64]) -> f64 {
        params.iter().map(|&p| self.penalty(p)).sum()
    }
}
