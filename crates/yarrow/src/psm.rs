use std::sync::Arc;

use crate::peptide::Peptide;
use crate::scoring::MatchedFragmentIon;
use crate::spectrum::Ms2Scan;
use crate::SCORE_TOLERANCE;

/// One peptide in a PSM's tied-best set
#[derive(Clone, Debug)]
pub struct BestMatch {
    pub notch: usize,
    pub peptide: Peptide,
    pub matched_ions: Vec<MatchedFragmentIon>,
}

/// FDR statistics, written only after the parallel search phase completes
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct FdrInfo {
    pub cumulative_target: f64,
    pub cumulative_decoy: f64,
    pub q_value: f64,
    pub cumulative_target_notch: f64,
    pub cumulative_decoy_notch: f64,
    pub q_value_notch: f64,
    pub pep: f64,
    pub pep_q_value: f64,
}

/// A peptide-spectrum match: the best-scoring candidate(s) for one scan.
/// Mutated under the per-scan lock during search; read-only afterwards
/// except for `fdr_info`.
#[derive(Clone, Debug)]
pub struct PeptideSpectralMatch {
    pub scan_index: usize,
    pub scan_number: usize,
    pub full_file_path: Arc<str>,
    pub precursor_mass: f64,
    /// FDR partition key: targets and decoys are only comparable within one
    /// enzymatic context
    pub protease: Arc<str>,
    pub best_score: f64,
    pub runner_up_score: f64,
    best_peptides: Vec<BestMatch>,
    pub fdr_info: Option<FdrInfo>,
}

impl PeptideSpectralMatch {
    pub fn new(
        scan: &Ms2Scan,
        full_file_path: Arc<str>,
        protease: Arc<str>,
        score: f64,
        notch: usize,
        peptide: Peptide,
        matched_ions: Vec<MatchedFragmentIon>,
    ) -> Self {
        Self {
            scan_index: scan.scan_index,
            scan_number: scan.scan_number,
            full_file_path,
            precursor_mass: scan.precursor_mass,
            protease,
            best_score: score,
            runner_up_score: 0.0,
            best_peptides: vec![BestMatch {
                notch,
                peptide,
                matched_ions,
            }],
            fdr_info: None,
        }
    }

    /// Fold a new candidate into this match under the score-tie policy
    pub fn add_or_replace(
        &mut self,
        peptide: Peptide,
        score: f64,
        notch: usize,
        report_ambiguity: bool,
        matched_ions: Vec<MatchedFragmentIon>,
    ) {
        if score > self.best_score + SCORE_TOLERANCE {
            self.runner_up_score = self.best_score;
            self.best_score = score;
            self.best_peptides.clear();
            self.best_peptides.push(BestMatch {
                notch,
                peptide,
                matched_ions,
            });
        } else if (score - self.best_score).abs() <= SCORE_TOLERANCE {
            if report_ambiguity {
                self.best_peptides.push(BestMatch {
                    notch,
                    peptide,
                    matched_ions,
                });
            }
        } else {
            self.runner_up_score = self.runner_up_score.max(score);
        }
    }

    pub fn best_peptides(&self) -> &[BestMatch] {
        &self.best_peptides
    }

    /// Canonical representative (first after ambiguity resolution)
    pub fn best_match(&self) -> &BestMatch {
        &self.best_peptides[0]
    }

    /// A PSM reports as decoy only when every tied peptide is decoy
    pub fn is_decoy(&self) -> bool {
        self.best_peptides.iter().all(|b| b.peptide.decoy)
    }

    /// Any tied peptide is decoy: such PSMs credit fractional decoy counts
    /// during FDR estimation
    pub fn contains_decoy(&self) -> bool {
        self.best_peptides.iter().any(|b| b.peptide.decoy)
    }

    pub fn delta_score(&self) -> f64 {
        self.best_score - self.runner_up_score
    }

    /// The match's notch, when all tied peptides agree on one
    pub fn notch(&self) -> Option<usize> {
        let first = self.best_peptides.first()?.notch;
        self.best_peptides
            .iter()
            .all(|b| b.notch == first)
            .then_some(first)
    }

    /// Full (modification-annotated) sequence, when unambiguous
    pub fn full_sequence(&self) -> Option<String> {
        let first = self.best_peptides.first()?.peptide.full_sequence();
        self.best_peptides
            .iter()
            .all(|b| b.peptide.full_sequence() == first)
            .then_some(first)
    }

    /// Theoretical mass of the tied peptides, when they agree
    pub fn peptide_monoisotopic_mass(&self) -> Option<f64> {
        let first = self.best_peptides.first()?.peptide.monoisotopic_mass;
        self.best_peptides
            .iter()
            .all(|b| b.peptide.monoisotopic_mass.to_bits() == first.to_bits())
            .then_some(first)
    }

    /// Order the tied set canonically and drop exact duplicates, so the
    /// reported representative is deterministic regardless of the thread
    /// interleaving that built this match
    pub fn resolve_all_ambiguities(&mut self) {
        self.best_peptides.sort_by(|a, b| {
            a.peptide
                .full_sequence()
                .cmp(&b.peptide.full_sequence())
                .then_with(|| a.notch.cmp(&b.notch))
                .then_with(|| {
                    a.peptide
                        .protein
                        .accession
                        .cmp(&b.peptide.protein.accession)
                })
                .then_with(|| a.peptide.one_based_start.cmp(&b.peptide.one_based_start))
        });
        self.best_peptides.dedup_by(|a, b| {
            a.notch == b.notch
                && a.peptide == b.peptide
                && a.peptide.protein.accession == b.peptide.protein.accession
        });
    }
}
