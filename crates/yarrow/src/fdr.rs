//! False discovery rate control by target/decoy competition, stratified per
//! precursor-mass notch, with optional posterior-error-probability q-values.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fnv::{FnvHashMap, FnvHashSet};

use crate::pep::PepTrainer;
use crate::psm::{FdrInfo, PeptideSpectralMatch};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FdrAnalysisType {
    Psm,
    Peptide,
    Crosslink,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Metric {
    Score,
    DeltaScore,
}

pub struct FdrAnalysisResults {
    /// False when cancelled mid-run
    pub complete: bool,
    /// Non-decoy PSMs with q ≤ 0.01
    pub psms_within_1_percent_fdr: usize,
    /// Whether delta score was adopted as the ordering metric
    pub delta_score_used: bool,
    /// PSM counts per unambiguous full sequence at 1% FDR, dataset-wide
    pub sequence_counts: FnvHashMap<String, usize>,
    /// PSM counts per (file, full sequence) at 1% FDR
    pub file_sequence_counts: FnvHashMap<(Arc<str>, String), usize>,
    pub pep_metrics: Option<String>,
}

/// Assigns q-values (global and per-notch) to a PSM set, choosing between
/// score and delta-score orderings, then optionally fits a PEP model and
/// derives PEP-based q-values.
///
/// PSMs are partitioned by protease before counting: targets and decoys are
/// only comparable within one enzymatic context.
pub struct FdrAnalysisEngine<'a> {
    num_notches: usize,
    use_delta_score: bool,
    analysis_type: FdrAnalysisType,
    pep_trainer: Option<&'a dyn PepTrainer>,
    stop_loops: Arc<AtomicBool>,
}

impl<'a> FdrAnalysisEngine<'a> {
    pub fn new(
        num_notches: usize,
        use_delta_score: bool,
        analysis_type: FdrAnalysisType,
    ) -> Self {
        Self {
            num_notches,
            use_delta_score,
            analysis_type,
            pep_trainer: None,
            stop_loops: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_pep_trainer(mut self, trainer: &'a dyn PepTrainer) -> Self {
        self.pep_trainer = Some(trainer);
        self
    }

    pub fn stop_token(&self) -> Arc<AtomicBool> {
        self.stop_loops.clone()
    }

    pub fn run(&self, psms: &mut [PeptideSpectralMatch]) -> FdrAnalysisResults {
        let mut delta_score_used = false;

        // Partition by enzymatic context, in deterministic key order
        let mut groups: FnvHashMap<Arc<str>, Vec<usize>> = FnvHashMap::default();
        for (idx, psm) in psms.iter().enumerate() {
            groups.entry(psm.protease.clone()).or_default().push(idx);
        }
        let mut keys = groups.keys().cloned().collect::<Vec<_>>();
        keys.sort();

        for key in keys {
            if self.stop_loops.load(Ordering::Relaxed) {
                return self.incomplete_results(delta_score_used);
            }
            let group = &groups[&key];

            let metric = if self.use_delta_score {
                let by_score = ordering(psms, group, Metric::Score);
                let by_delta = ordering(psms, group, Metric::DeltaScore);
                let score_passing = count_passing(psms, &deduplicate(psms, &by_score));
                let delta_passing = count_passing(psms, &deduplicate(psms, &by_delta));
                // A tie keeps the plain score ordering
                if delta_passing > score_passing {
                    delta_score_used = true;
                    Metric::DeltaScore
                } else {
                    Metric::Score
                }
            } else {
                Metric::Score
            };

            let order = ordering(psms, group, metric);
            if !self.assign_q_values(psms, &order) {
                return self.incomplete_results(delta_score_used);
            }
        }

        let pep_metrics = self.pep_phase(psms);

        let mut psms_within_1_percent_fdr = 0;
        let mut sequence_counts: FnvHashMap<String, usize> = FnvHashMap::default();
        let mut file_sequence_counts: FnvHashMap<(Arc<str>, String), usize> =
            FnvHashMap::default();
        for psm in psms.iter() {
            let Some(info) = psm.fdr_info else { continue };
            if info.q_value <= 0.01 && !psm.is_decoy() {
                psms_within_1_percent_fdr += 1;
            }
            if info.q_value <= 0.01 && info.q_value_notch <= 0.01 {
                if let Some(sequence) = psm.full_sequence() {
                    *sequence_counts.entry(sequence.clone()).or_default() += 1;
                    *file_sequence_counts
                        .entry((psm.full_file_path.clone(), sequence))
                        .or_default() += 1;
                }
            }
        }

        FdrAnalysisResults {
            complete: true,
            psms_within_1_percent_fdr,
            delta_score_used,
            sequence_counts,
            file_sequence_counts,
            pep_metrics,
        }
    }

    fn incomplete_results(&self, delta_score_used: bool) -> FdrAnalysisResults {
        FdrAnalysisResults {
            complete: false,
            psms_within_1_percent_fdr: 0,
            delta_score_used,
            sequence_counts: FnvHashMap::default(),
            file_sequence_counts: FnvHashMap::default(),
            pep_metrics: None,
        }
    }

    /// Cumulative target/decoy counting along `order`, global and per notch,
    /// followed by worst-to-best monotonization. Returns false if cancelled.
    fn assign_q_values(&self, psms: &mut [PeptideSpectralMatch], order: &[usize]) -> bool {
        let mut cumulative_target = 0.0f64;
        let mut cumulative_decoy = 0.0f64;
        // The last slot collects PSMs with ambiguous notch assignments
        let mut target_notch = vec![0.0f64; self.num_notches + 1];
        let mut decoy_notch = vec![0.0f64; self.num_notches + 1];

        for &idx in order {
            if self.stop_loops.load(Ordering::Relaxed) {
                return false;
            }
            let psm = &psms[idx];
            let notch = psm.notch().unwrap_or(self.num_notches);
            if psm.contains_decoy() {
                // Ambiguous target/decoy PSMs credit a fractional decoy count
                let fraction = decoy_fraction(psm);
                cumulative_decoy += fraction;
                decoy_notch[notch] += fraction;
            } else {
                cumulative_target += 1.0;
                target_notch[notch] += 1.0;
            }

            let q_value = match cumulative_target == 0.0 {
                true => 1.0,
                false => (cumulative_decoy / cumulative_target).min(1.0),
            };
            let q_value_notch = match target_notch[notch] == 0.0 {
                true => 1.0,
                false => (decoy_notch[notch] / target_notch[notch]).min(1.0),
            };

            psms[idx].fdr_info = Some(FdrInfo {
                cumulative_target,
                cumulative_decoy,
                q_value,
                cumulative_target_notch: target_notch[notch],
                cumulative_decoy_notch: decoy_notch[notch],
                q_value_notch,
                pep: 1.0,
                pep_q_value: 1.0,
            });
        }

        // A worse-scoring PSM can never have a better q-value
        let mut q_min = f64::MAX;
        let mut q_notch_min = f64::MAX;
        for &idx in order.iter().rev() {
            let info = psms[idx].fdr_info.as_mut().expect("assigned above");
            q_min = q_min.min(info.q_value);
            info.q_value = q_min;
            q_notch_min = q_notch_min.min(info.q_value_notch);
            info.q_value_notch = q_notch_min;
        }
        true
    }

    fn pep_phase(&self, psms: &mut [PeptideSpectralMatch]) -> Option<String> {
        if !matches!(
            self.analysis_type,
            FdrAnalysisType::Psm | FdrAnalysisType::Crosslink
        ) || psms.len() <= 100
        {
            return None;
        }
        let trainer = self.pep_trainer?;
        let search_type = match self.analysis_type {
            FdrAnalysisType::Crosslink => "crosslink",
            _ if psms.iter().all(|p| &*p.protease == "top-down") => "top-down",
            _ => "standard",
        };
        let metrics = trainer.compute_pep_values(psms, search_type);

        // PEP-based q-value: running mean of PEP in ascending-PEP order
        let mut order = (0..psms.len()).collect::<Vec<_>>();
        order.sort_by(|&a, &b| {
            let pa = psms[a].fdr_info.map(|i| i.pep).unwrap_or(1.0);
            let pb = psms[b].fdr_info.map(|i| i.pep).unwrap_or(1.0);
            pa.total_cmp(&pb)
                .then_with(|| psms[b].best_score.total_cmp(&psms[a].best_score))
                .then_with(|| psms[a].full_file_path.cmp(&psms[b].full_file_path))
                .then_with(|| psms[a].scan_number.cmp(&psms[b].scan_number))
        });
        let mut running_sum = 0.0;
        for (rank, &idx) in order.iter().enumerate() {
            let info = psms[idx].fdr_info.get_or_insert_with(Default::default);
            running_sum += info.pep;
            info.pep_q_value = round6(running_sum / (rank + 1) as f64);
        }
        Some(metrics)
    }
}

fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

/// Fraction of distinct best-matching full sequences whose protein is decoy
fn decoy_fraction(psm: &PeptideSpectralMatch) -> f64 {
    let mut total: FnvHashSet<String> = FnvHashSet::default();
    let mut decoy: FnvHashSet<String> = FnvHashSet::default();
    for best in psm.best_peptides() {
        let sequence = best.peptide.full_sequence();
        if best.peptide.decoy {
            decoy.insert(sequence.clone());
        }
        total.insert(sequence);
    }
    decoy.len() as f64 / total.len() as f64
}

/// Indices sorted descending by the chosen metric; ties break by precursor
/// mass error, then by (file, scan number) for a total order
fn ordering(psms: &[PeptideSpectralMatch], group: &[usize], metric: Metric) -> Vec<usize> {
    let value = |idx: usize| -> f64 {
        match metric {
            Metric::Score => psms[idx].best_score,
            Metric::DeltaScore => psms[idx].delta_score(),
        }
    };
    let mass_error = |idx: usize| -> f64 {
        let psm = &psms[idx];
        (psm.precursor_mass - psm.best_match().peptide.monoisotopic_mass).abs()
    };

    let mut order = group.to_vec();
    order.sort_by(|&a, &b| {
        value(b)
            .total_cmp(&value(a))
            .then_with(|| mass_error(a).total_cmp(&mass_error(b)))
            .then_with(|| psms[a].full_file_path.cmp(&psms[b].full_file_path))
            .then_with(|| psms[a].scan_number.cmp(&psms[b].scan_number))
    });
    order
}

/// Keep the first PSM per (file, scan number, peptide mass)
fn deduplicate(psms: &[PeptideSpectralMatch], order: &[usize]) -> Vec<usize> {
    let mut seen = FnvHashSet::default();
    let mut out = Vec::with_capacity(order.len());
    for &idx in order {
        let psm = &psms[idx];
        let mass = psm
            .peptide_monoisotopic_mass()
            .unwrap_or(psm.best_match().peptide.monoisotopic_mass);
        if seen.insert((psm.full_file_path.clone(), psm.scan_number, mass.to_bits())) {
            out.push(idx);
        }
    }
    out
}

/// Simulate q-value assignment over an ordering and count entries reaching
/// q ≤ 0.01. Used only to pick the ordering metric.
fn count_passing(psms: &[PeptideSpectralMatch], order: &[usize]) -> usize {
    let mut cumulative_target = 0.0f64;
    let mut cumulative_decoy = 0.0f64;
    let mut q_values = Vec::with_capacity(order.len());
    for &idx in order {
        let psm = &psms[idx];
        if psm.contains_decoy() {
            cumulative_decoy += decoy_fraction(psm);
        } else {
            cumulative_target += 1.0;
        }
        q_values.push(match cumulative_target == 0.0 {
            true => 1.0,
            false => (cumulative_decoy / cumulative_target).min(1.0),
        });
    }
    monotonize(&mut q_values);
    q_values.iter().filter(|q| **q <= 0.01).count()
}

/// Replace each value with the minimum of itself and everything after it
pub fn monotonize(q_values: &mut [f64]) {
    let mut q_min = f64::MAX;
    for q in q_values.iter_mut().rev() {
        q_min = q_min.min(*q);
        *q = q_min;
    }
}
