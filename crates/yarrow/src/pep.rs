//! Posterior error probabilities for PSMs.
//!
//! The engine treats the PEP model as an opaque regressor behind the
//! [`PepTrainer`] contract. The built-in implementation estimates
//! P(incorrect | score) from Gaussian kernel densities of the target and
//! decoy score distributions, tabulated over an evenly spaced score grid so
//! per-PSM evaluation is a table lookup.

use rayon::prelude::*;

use crate::psm::PeptideSpectralMatch;

/// Opaque PEP regressor. Implementations write `fdr_info.pep` for every PSM
/// and return a short human-readable metrics summary.
///
/// `search_type` is one of `"standard"`, `"top-down"`, or `"crosslink"`.
pub trait PepTrainer: Send + Sync {
    fn compute_pep_values(&self, psms: &mut [PeptideSpectralMatch], search_type: &str) -> String;
}

/// Floor applied to kernel bandwidths so a degenerate (single-valued) score
/// distribution cannot produce NaN densities
const MIN_BANDWIDTH: f64 = 1e-6;

fn standard_deviation(sample: &[f64]) -> f64 {
    let n = sample.len() as f64;
    let (sum, sum_sq) = sample
        .iter()
        .fold((0.0, 0.0), |(sum, sum_sq), x| (sum + x, sum_sq + x * x));
    (sum_sq / n - (sum / n).powi(2)).max(0.0).sqrt()
}

/// Silverman's rule-of-thumb bandwidth for a Gaussian kernel
fn silverman_bandwidth(sample: &[f64]) -> f64 {
    let n = sample.len() as f64;
    (standard_deviation(sample) * (4.0 / (3.0 * n)).powf(0.2)).max(MIN_BANDWIDTH)
}

/// Gaussian kernel density estimate at `x`
fn kde_density(sample: &[f64], bandwidth: f64, x: f64) -> f64 {
    let kernel_sum = sample
        .iter()
        .map(|s| (-0.5 * ((x - s) / bandwidth).powi(2)).exp())
        .sum::<f64>();
    kernel_sum / (sample.len() as f64 * bandwidth * (2.0 * std::f64::consts::PI).sqrt())
}

/// PEP tabulated over an evenly spaced score grid, linearly interpolated
/// between grid points
struct PepTable {
    values: Vec<f64>,
    lo: f64,
    step: f64,
}

impl PepTable {
    fn fit(scores: &[f64], decoys: &[bool], resolution: usize) -> PepTable {
        let mut target_scores = Vec::new();
        let mut decoy_scores = Vec::new();
        for (score, decoy) in scores.iter().zip(decoys) {
            match decoy {
                true => decoy_scores.push(*score),
                false => target_scores.push(*score),
            }
        }
        // P(decoy), and the mixture densities' bandwidths
        let prior = decoy_scores.len() as f64 / scores.len() as f64;
        let target_bw = silverman_bandwidth(&target_scores);
        let decoy_bw = silverman_bandwidth(&decoy_scores);

        let lo = scores.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let step = (hi - lo) / (resolution - 1) as f64;

        let mut values = (0..resolution)
            .into_par_iter()
            .map(|grid_point| {
                let x = lo + step * grid_point as f64;
                let decoy = prior * kde_density(&decoy_scores, decoy_bw, x);
                let target = (1.0 - prior) * kde_density(&target_scores, target_bw, x);
                match decoy + target > 0.0 {
                    true => decoy / (decoy + target),
                    // Both densities underflowed; fall back to the prior
                    false => prior,
                }
            })
            .collect::<Vec<_>>();

        // A better score can never carry a worse error probability
        let mut worst = 0.0f64;
        for value in values.iter_mut().rev() {
            worst = worst.max(*value);
            *value = worst;
        }

        PepTable { values, lo, step }
    }

    fn lookup(&self, score: f64) -> f64 {
        if self.step <= 0.0 {
            return self.values[0];
        }
        let last = self.values.len() - 1;
        let position = ((score - self.lo) / self.step).clamp(0.0, last as f64);
        let below = position.floor() as usize;
        let above = last.min(below + 1);
        let fraction = position - below as f64;
        self.values[below] * (1.0 - fraction) + self.values[above] * fraction
    }
}

/// Kernel-density PEP model over the best-score distribution
pub struct KdePepTrainer {
    pub bins: usize,
}

impl Default for KdePepTrainer {
    fn default() -> Self {
        Self { bins: 1000 }
    }
}

impl PepTrainer for KdePepTrainer {
    fn compute_pep_values(&self, psms: &mut [PeptideSpectralMatch], search_type: &str) -> String {
        let scores = psms.iter().map(|p| p.best_score).collect::<Vec<_>>();
        let decoys = psms.iter().map(|p| p.contains_decoy()).collect::<Vec<_>>();
        let n_decoy = decoys.iter().filter(|d| **d).count();
        let n_target = decoys.len() - n_decoy;

        if n_decoy < 2 || n_target < 2 {
            log::warn!(
                "not enough targets ({}) or decoys ({}) to fit a PEP model",
                n_target,
                n_decoy
            );
            for psm in psms.iter_mut() {
                psm.fdr_info.get_or_insert_with(Default::default).pep = 0.5;
            }
            return format!(
                "pep model ({}) not fit: {} targets, {} decoys",
                search_type, n_target, n_decoy
            );
        }

        let table = PepTable::fit(&scores, &decoys, self.bins);
        for psm in psms.iter_mut() {
            let pep = table.lookup(psm.best_score).clamp(0.0, 1.0);
            psm.fdr_info.get_or_insert_with(Default::default).pep = pep;
        }
        format!(
            "pep model ({}): kde over {} targets, {} decoys in {} bins",
            search_type, n_target, n_decoy, self.bins
        )
    }
}
