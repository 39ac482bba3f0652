#[inline(always)]
pub fn logsumexp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY && b == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if a > b {
        a + (b - a).exp().ln_1p()
    } else {
        b + (a - b).exp().ln_1p()
    }
}

/// Adds two probabilities given as costs (negative log probabilities) and
/// returns the cost of the sum, i.e. `-ln(exp(-a) + exp(-b))`.
///
/// `+∞` is the identity element.
#[inline(always)]
pub fn sum_neg_log_prob(a: f64, b: f64) -> f64 {
    if a == b && a.is_infinite() {
        return a;
    }
    -logsumexp(-a, -b)
}

/// Returns `true` if two costs agree within the relative tolerance used for
/// the forward/backward consistency check.
#[inline(always)]
pub fn costs_agree(a: f64, b: f64) -> bool {
    if a.is_infinite() || b.is_infinite() {
        return a == b;
    }
    (a - b).abs() <= 1e-6 * a.abs().max(b.abs()).max(1.0)
}
