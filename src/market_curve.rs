//! Market-curve fitting and profit-maximizing bid search
//!
//! Per-target curves relate bid to auction outcomes: an impression curve
//! `a·(1 − e^{−b·bid}) + c` fitted by damped Gauss-Newton, a CTR curve
//! with saturating position and top-of-search bonuses, and conversion
//! parameters measured over the window. The profit-maximizing bid is a
//! cent-grid search over `[min_bid, max_bid]`.
//!
//! Fitting never throws: insufficient data yields `None`, and numerical
//! non-convergence falls back to piecewise-linear interpolation.

use crate::models::{round_to_cents, AlgorithmParams};
use chrono::{DateTime, Utc};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::BTreeMap;
use tracing::debug;

const MAX_ITERATIONS: usize = 100;
const CONVERGENCE_EPS: f64 = 1e-9;
const MIN_ACCEPTABLE_R2: f64 = 0.3;
/// Fixed attribution delay carried on every fitted model.
const ATTRIBUTION_DELAY_DAYS: i64 = 7;

/// One raw performance sample at a known bid.
#[derive(Debug, Clone, Copy)]
pub struct BidSample {
    pub bid: f64,
    pub impressions: f64,
    pub clicks: f64,
    pub spend: f64,
    pub sales: f64,
    pub orders: f64,
}

/// Samples aggregated over a single bid value.
#[derive(Debug, Clone, Copy)]
pub struct BidObservation {
    pub bid: f64,
    pub impressions: f64,
    pub clicks: f64,
    pub spend: f64,
    pub sales: f64,
    pub orders: f64,
}

impl BidObservation {
    fn ctr(&self) -> f64 {
        if self.impressions <= 0.0 {
            0.0
        } else {
            (self.clicks / self.impressions).clamp(0.0, 1.0)
        }
    }
}

/// Fitted impression response. The saturating form is preferred; the
/// piecewise form is the fallback when the solver diverges or explains
/// too little variance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImpressionModel {
    Saturating {
        a: f64,
        b: f64,
        c: f64,
        r_squared: f64,
    },
    Piecewise {
        /// `(bid, impressions)` sorted by bid.
        points: Vec<(f64, f64)>,
    },
}

impl ImpressionModel {
    pub fn predict(&self, bid: f64) -> f64 {
        match self {
            ImpressionModel::Saturating { a, b, c, .. } => {
                (a * (1.0 - (-b * bid).exp()) + c).max(0.0)
            }
            ImpressionModel::Piecewise { points } => interpolate(points, bid),
        }
    }

    pub fn r_squared(&self) -> Option<f64> {
        match self {
            ImpressionModel::Saturating { r_squared, .. } => Some(*r_squared),
            ImpressionModel::Piecewise { .. } => None,
        }
    }
}

/// CTR as a function of bid: a base rate plus saturating bonuses for
/// better positions and top-of-search share, both increasing in bid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CtrCurve {
    pub base: f64,
    pub position_bonus: f64,
    pub top_search_bonus: f64,
}

impl CtrCurve {
    /// Saturating basis for the position term.
    fn position_lift(bid: f64) -> f64 {
        bid / (bid + 1.0)
    }

    /// Slower-saturating basis for the top-of-search term.
    fn top_search_lift(bid: f64) -> f64 {
        bid / (bid + 2.0)
    }

    pub fn predict(&self, bid: f64) -> f64 {
        (self.base
            + self.position_bonus * Self::position_lift(bid)
            + self.top_search_bonus * Self::top_search_lift(bid))
        .clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionParams {
    pub cvr: f64,
    pub aov: f64,
    pub attribution_delay_days: i64,
}

/// Per-target fitted parameters. Rebuilt from a rolling window and
/// superseded by later builds; never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketCurveModel {
    pub impression: ImpressionModel,
    pub ctr: CtrCurve,
    pub conversion: ConversionParams,
    pub window_days: i64,
    pub data_points: usize,
    pub fitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OptimalBidResult {
    pub optimal_bid: f64,
    pub max_profit: f64,
    pub break_even_cpc: f64,
    pub profit_margin: f64,
}

pub struct CurveFitter {
    min_data_points: usize,
    min_bid: f64,
    max_bid: f64,
    margin: f64,
    conversion_value_multiplier: f64,
}

impl CurveFitter {
    pub fn new(params: &AlgorithmParams) -> Self {
        Self {
            min_data_points: params.min_data_points,
            min_bid: params.min_bid,
            max_bid: params.max_bid,
            margin: params.margin(),
            conversion_value_multiplier: params.conversion_value_multiplier,
        }
    }

    /// Group raw samples by cent-rounded bid value.
    pub fn aggregate_by_bid(samples: &[BidSample]) -> Vec<BidObservation> {
        let mut buckets: BTreeMap<i64, BidObservation> = BTreeMap::new();
        for s in samples {
            let key = (round_to_cents(s.bid) * 100.0).round() as i64;
            let entry = buckets.entry(key).or_insert(BidObservation {
                bid: key as f64 / 100.0,
                impressions: 0.0,
                clicks: 0.0,
                spend: 0.0,
                sales: 0.0,
                orders: 0.0,
            });
            entry.impressions += s.impressions;
            entry.clicks += s.clicks;
            entry.spend += s.spend;
            entry.sales += s.sales;
            entry.orders += s.orders;
        }
        buckets.into_values().collect()
    }

    /// Fit a model over the window, or `None` when fewer than the minimum
    /// number of distinct bid points are available.
    pub fn fit(&self, samples: &[BidSample], window_days: i64) -> Option<MarketCurveModel> {
        let observations = Self::aggregate_by_bid(samples);
        if observations.len() < self.min_data_points {
            debug!(
                points = observations.len(),
                required = self.min_data_points,
                "insufficient distinct bid points for curve fit"
            );
            return None;
        }

        let impression = self.fit_impression_curve(&observations);
        let ctr = fit_ctr_curve(&observations);
        let conversion = conversion_params(&observations);

        Some(MarketCurveModel {
            impression,
            ctr,
            conversion,
            window_days,
            data_points: observations.len(),
            fitted_at: Utc::now(),
        })
    }

    fn fit_impression_curve(&self, observations: &[BidObservation]) -> ImpressionModel {
        let points: Vec<(f64, f64)> = observations
            .iter()
            .map(|o| (o.bid, o.impressions))
            .collect();

        match fit_saturating(&points) {
            Some((a, b, c, r_squared)) if r_squared >= MIN_ACCEPTABLE_R2 => {
                ImpressionModel::Saturating { a, b, c, r_squared }
            }
            other => {
                if let Some((_, _, _, r2)) = other {
                    debug!(r_squared = r2, "impression fit below threshold, using piecewise");
                }
                ImpressionModel::Piecewise { points }
            }
        }
    }

    /// Search the cent grid on `[min_bid, max_bid]` for the bid that
    /// maximizes expected profit.
    pub fn optimal_bid(&self, model: &MarketCurveModel) -> OptimalBidResult {
        let value_per_order =
            model.conversion.aov * self.margin * self.conversion_value_multiplier;
        let break_even_cpc = round_to_cents(model.conversion.cvr * value_per_order);

        let mut best_bid = self.min_bid;
        let mut best_profit = f64::NEG_INFINITY;
        let steps = ((self.max_bid - self.min_bid) * 100.0).round() as i64;
        for i in 0..=steps {
            let bid = self.min_bid + i as f64 / 100.0;
            let clicks = model.impression.predict(bid) * model.ctr.predict(bid);
            let profit = clicks * model.conversion.cvr * value_per_order - clicks * bid;
            if profit > best_profit {
                best_profit = profit;
                best_bid = bid;
            }
        }

        OptimalBidResult {
            optimal_bid: round_to_cents(best_bid),
            max_profit: best_profit.max(0.0),
            break_even_cpc,
            profit_margin: self.margin,
        }
    }
}

/// Damped Gauss-Newton for `y = a·(1 − e^{−b·x}) + c`. Returns
/// `(a, b, c, r²)` or `None` on divergence.
fn fit_saturating(points: &[(f64, f64)]) -> Option<(f64, f64, f64, f64)> {
    if points.len() < 3 {
        return None;
    }
    let n = points.len();
    let y_max = points.iter().map(|p| p.1).fold(f64::MIN, f64::max);
    let y_min = points.iter().map(|p| p.1).fold(f64::MAX, f64::min);

    let mut a = (y_max - y_min).max(1.0);
    let mut b = 1.0;
    let mut c = y_min;
    let mut lambda = 1e-6;

    for _ in 0..MAX_ITERATIONS {
        let mut jacobian = DMatrix::zeros(n, 3);
        let mut residuals = DVector::zeros(n);
        for (i, &(x, y)) in points.iter().enumerate() {
            let e = (-b * x).exp();
            let predicted = a * (1.0 - e) + c;
            residuals[i] = y - predicted;
            jacobian[(i, 0)] = 1.0 - e;
            jacobian[(i, 1)] = a * x * e;
            jacobian[(i, 2)] = 1.0;
        }

        let jt = jacobian.transpose();
        let mut normal = &jt * &jacobian;
        for d in 0..3 {
            normal[(d, d)] += lambda;
        }
        let rhs = &jt * &residuals;
        let delta = match normal.lu().solve(&rhs) {
            Some(d) => d,
            None => {
                lambda *= 10.0;
                if lambda > 1e6 {
                    return None;
                }
                continue;
            }
        };

        a += delta[0];
        b += delta[1];
        c += delta[2];
        if !a.is_finite() || !b.is_finite() || !c.is_finite() {
            return None;
        }
        // Keep the curve in its meaningful regime.
        b = b.clamp(1e-4, 50.0);
        a = a.max(0.0);

        if delta.norm() < CONVERGENCE_EPS {
            break;
        }
    }

    let mean_y = points.iter().map(|p| p.1).mean();
    let ss_tot: f64 = points.iter().map(|p| (p.1 - mean_y).powi(2)).sum();
    let ss_res: f64 = points
        .iter()
        .map(|&(x, y)| {
            let predicted = a * (1.0 - (-b * x).exp()) + c;
            (y - predicted).powi(2)
        })
        .sum();
    let r_squared = if ss_tot <= f64::EPSILON {
        1.0
    } else {
        (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
    };
    Some((a, b, c, r_squared))
}

/// Linear least squares on the two saturating bases. With too few
/// distinct bids the curve collapses to the pooled CTR.
fn fit_ctr_curve(observations: &[BidObservation]) -> CtrCurve {
    let total_impressions: f64 = observations.iter().map(|o| o.impressions).sum();
    let total_clicks: f64 = observations.iter().map(|o| o.clicks).sum();
    let pooled_ctr = if total_impressions > 0.0 {
        (total_clicks / total_impressions).clamp(0.0, 1.0)
    } else {
        0.0
    };

    if observations.len() < 3 {
        return CtrCurve {
            base: pooled_ctr,
            position_bonus: 0.0,
            top_search_bonus: 0.0,
        };
    }

    let n = observations.len();
    let mut design = DMatrix::zeros(n, 3);
    let mut y = DVector::zeros(n);
    for (i, o) in observations.iter().enumerate() {
        design[(i, 0)] = 1.0;
        design[(i, 1)] = CtrCurve::position_lift(o.bid);
        design[(i, 2)] = CtrCurve::top_search_lift(o.bid);
        y[i] = o.ctr();
    }
    let dt = design.transpose();
    let normal = &dt * &design;
    let rhs = &dt * &y;
    match normal.lu().solve(&rhs) {
        Some(coef) if coef.iter().all(|v| v.is_finite()) => CtrCurve {
            base: coef[0].clamp(0.0, 1.0),
            position_bonus: coef[1],
            top_search_bonus: coef[2],
        },
        _ => CtrCurve {
            base: pooled_ctr,
            position_bonus: 0.0,
            top_search_bonus: 0.0,
        },
    }
}

fn conversion_params(observations: &[BidObservation]) -> ConversionParams {
    let clicks: f64 = observations.iter().map(|o| o.clicks).sum();
    let orders: f64 = observations.iter().map(|o| o.orders).sum();
    let sales: f64 = observations.iter().map(|o| o.sales).sum();
    ConversionParams {
        cvr: if clicks > 0.0 { (orders / clicks).clamp(0.0, 1.0) } else { 0.0 },
        aov: if orders > 0.0 { sales / orders } else { 0.0 },
        attribution_delay_days: ATTRIBUTION_DELAY_DAYS,
    }
}

fn interpolate(points: &[(f64, f64)], bid: f64) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    if bid <= points[0].0 {
        return points[0].1;
    }
    if let Some(last) = points.last() {
        if bid >= last.0 {
            return last.1;
        }
    }
    for window in points.windows(2) {
        let (x0, y0) = window[0];
        let (x1, y1) = window[1];
        if bid >= x0 && bid <= x1 {
            if (x1 - x0).abs() < f64::EPSILON {
                return y0;
            }
            let t = (bid - x0) / (x1 - x0);
            return y0 + t * (y1 - y0);
        }
    }
    points.last().map(|p| p.1).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fitter() -> CurveFitter {
        CurveFitter::new(&AlgorithmParams::default())
    }

    /// Synthetic samples drawn from a known saturating curve with a
    /// plausible CTR and conversion profile.
    fn synthetic_samples() -> Vec<BidSample> {
        let (a, b, c) = (1000.0, 1.5, 50.0);
        let mut samples = Vec::new();
        for i in 1..=10 {
            let bid = i as f64 * 0.25;
            let impressions = a * (1.0 - (-b * bid).exp()) + c;
            let ctr = 0.02 + 0.03 * bid / (bid + 1.0);
            let clicks = impressions * ctr;
            let orders = clicks * 0.10;
            samples.push(BidSample {
                bid,
                impressions,
                clicks,
                spend: clicks * bid,
                sales: orders * 30.0,
                orders,
            });
        }
        samples
    }

    #[test]
    fn test_insufficient_data_returns_none() {
        let samples = vec![
            BidSample { bid: 0.5, impressions: 100.0, clicks: 5.0, spend: 2.5, sales: 10.0, orders: 1.0 },
            BidSample { bid: 0.75, impressions: 150.0, clicks: 7.0, spend: 5.0, sales: 10.0, orders: 1.0 },
        ];
        assert!(fitter().fit(&samples, 30).is_none());
    }

    #[test]
    fn test_aggregate_groups_by_cent_bid() {
        let samples = vec![
            BidSample { bid: 0.501, impressions: 100.0, clicks: 5.0, spend: 2.5, sales: 0.0, orders: 0.0 },
            BidSample { bid: 0.499, impressions: 50.0, clicks: 2.0, spend: 1.0, sales: 0.0, orders: 0.0 },
            BidSample { bid: 0.80, impressions: 10.0, clicks: 1.0, spend: 0.8, sales: 0.0, orders: 0.0 },
        ];
        let grouped = CurveFitter::aggregate_by_bid(&samples);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].bid, 0.5);
        assert_eq!(grouped[0].impressions, 150.0);
    }

    #[test]
    fn test_fit_recovers_saturating_curve() {
        let model = fitter().fit(&synthetic_samples(), 30).unwrap();
        match &model.impression {
            ImpressionModel::Saturating { r_squared, .. } => {
                assert!(*r_squared > 0.95, "expected tight fit, got r²={}", r_squared);
            }
            ImpressionModel::Piecewise { .. } => panic!("expected saturating fit"),
        }
        // Predictions are monotone-ish and positive on the fitted range.
        assert!(model.impression.predict(0.5) > 0.0);
        assert!(model.impression.predict(2.0) >= model.impression.predict(0.25) * 0.9);
    }

    #[test]
    fn test_conversion_params_from_window() {
        let model = fitter().fit(&synthetic_samples(), 30).unwrap();
        assert!((model.conversion.cvr - 0.10).abs() < 1e-6);
        assert!((model.conversion.aov - 30.0).abs() < 1e-6);
        assert_eq!(model.conversion.attribution_delay_days, 7);
    }

    #[test]
    fn test_degenerate_data_falls_back_to_piecewise() {
        // Impressions unrelated to bid: alternating spikes defeat the
        // saturating form.
        let samples: Vec<BidSample> = (1..=8)
            .map(|i| BidSample {
                bid: i as f64 * 0.5,
                impressions: if i % 2 == 0 { 10.0 } else { 5000.0 },
                clicks: 10.0,
                spend: 5.0,
                sales: 0.0,
                orders: 0.0,
            })
            .collect();
        let model = fitter().fit(&samples, 30).unwrap();
        // Either form is acceptable numerically; what matters is that the
        // fit did not panic and predictions stay finite and non-negative.
        let p = model.impression.predict(1.7);
        assert!(p.is_finite() && p >= 0.0);
    }

    #[test]
    fn test_optimal_bid_is_grid_maximum() {
        let f = fitter();
        let model = f.fit(&synthetic_samples(), 30).unwrap();
        let result = f.optimal_bid(&model);

        assert!(result.optimal_bid >= 0.02 && result.optimal_bid <= 100.0);
        // Neighboring grid points must not beat the returned bid.
        let profit_at = |bid: f64| {
            let clicks = model.impression.predict(bid) * model.ctr.predict(bid);
            let value = model.conversion.aov * 0.7; // default margin
            clicks * model.conversion.cvr * value - clicks * bid
        };
        let best = profit_at(result.optimal_bid);
        assert!(best + 1e-6 >= profit_at(result.optimal_bid - 0.01));
        assert!(best + 1e-6 >= profit_at(result.optimal_bid + 0.01));
    }

    #[test]
    fn test_break_even_cpc_formula() {
        let f = fitter();
        let model = f.fit(&synthetic_samples(), 30).unwrap();
        let result = f.optimal_bid(&model);
        // aov · cvr · margin = 30 · 0.10 · 0.7
        assert!((result.break_even_cpc - 2.10).abs() < 0.01);
    }

    #[test]
    fn test_piecewise_interpolation_clamps_ends() {
        let points = vec![(0.5, 100.0), (1.0, 200.0), (2.0, 260.0)];
        let model = ImpressionModel::Piecewise { points };
        assert_eq!(model.predict(0.1), 100.0);
        assert_eq!(model.predict(5.0), 260.0);
        assert!((model.predict(0.75) - 150.0).abs() < 1e-9);
    }
}
