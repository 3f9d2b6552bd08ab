//! Global PTM discovery: when a confident PSM's precursor mass diverges from
//! its peptide's theoretical mass by an amount matching a known modification
//! (or a sum of two), annotate the protein with candidate localized
//! modifications for a follow-up search.

use std::sync::Arc;

use fnv::{FnvHashMap, FnvHashSet};
use log::debug;

use crate::mass::Tolerance;
use crate::modification::Modification;
use crate::params::EngineError;
use crate::peptide::Peptide;
use crate::psm::PeptideSpectralMatch;

/// Only PSMs at or below this notch q-value seed discovery
const GPTMD_Q_VALUE_CUTOFF: f64 = 0.05;

pub struct GptmdResults {
    /// accession → set of (1-based protein position, modification)
    pub mods: FnvHashMap<Arc<str>, FnvHashSet<(usize, Arc<Modification>)>>,
    pub mods_added: usize,
}

pub struct GptmdEngine<'a> {
    psms: &'a [PeptideSpectralMatch],
    gptmd_modifications: &'a [Arc<Modification>],
    /// Pairs of masses whose sum may jointly explain a residual
    combos: &'a [(f64, f64)],
    file_precursor_tolerances: &'a FnvHashMap<String, Tolerance>,
}

impl<'a> GptmdEngine<'a> {
    pub fn new(
        psms: &'a [PeptideSpectralMatch],
        gptmd_modifications: &'a [Arc<Modification>],
        combos: &'a [(f64, f64)],
        file_precursor_tolerances: &'a FnvHashMap<String, Tolerance>,
    ) -> Self {
        Self {
            psms,
            gptmd_modifications,
            combos,
            file_precursor_tolerances,
        }
    }

    pub fn run(&self) -> Result<GptmdResults, EngineError> {
        let mut mods: FnvHashMap<Arc<str>, FnvHashSet<(usize, Arc<Modification>)>> =
            FnvHashMap::default();
        let mut mods_added = 0;

        let confident = self.psms.iter().filter(|psm| {
            !psm.is_decoy()
                && psm
                    .fdr_info
                    .map(|info| info.q_value_notch <= GPTMD_Q_VALUE_CUTOFF)
                    .unwrap_or(false)
        });

        for psm in confident {
            let tolerance = self
                .file_precursor_tolerances
                .get(psm.full_file_path.as_ref())
                .copied()
                .ok_or_else(|| EngineError::UnknownFile(psm.full_file_path.to_string()))?;

            for best in psm.best_peptides() {
                let peptide = &best.peptide;
                for candidate in possible_mods(
                    psm.precursor_mass,
                    self.gptmd_modifications,
                    self.combos,
                    tolerance,
                    peptide,
                ) {
                    for i in 0..peptide.len() {
                        let protein_position = peptide.one_based_start + i;
                        if candidate.fits(
                            &peptide.protein.sequence,
                            i + 1,
                            peptide.len(),
                            protein_position,
                        ) {
                            let entry = mods
                                .entry(peptide.protein.accession.clone())
                                .or_default();
                            if entry.insert((protein_position, candidate.clone())) {
                                mods_added += 1;
                            }
                        }
                    }
                }
            }
        }

        debug!("gptmd proposed {} localized modifications", mods_added);
        Ok(GptmdResults { mods, mods_added })
    }
}

/// Enumerate modifications that could explain the gap between an observed
/// precursor mass and a peptide's theoretical mass:
///
/// * a single modification,
/// * replacing an existing modification that targets the same residue,
/// * either member of a two-modification combo whose sum matches; the
///   recursion yields each contributing modification separately.
///
/// The stream may contain duplicates; callers deduplicate by set insertion.
pub fn possible_mods(
    total_mass: f64,
    all_mods: &[Arc<Modification>],
    combos: &[(f64, f64)],
    tolerance: Tolerance,
    peptide: &Peptide,
) -> Vec<Arc<Modification>> {
    let mut out = Vec::new();
    for m in all_mods.iter().filter(|m| m.valid) {
        if tolerance.within(total_mass, peptide.monoisotopic_mass + m.monoisotopic_mass) {
            out.push(m.clone());
        }
        for existing in peptide.modifications.values() {
            if existing.motif.anchor_residue() == m.motif.anchor_residue()
                && tolerance.within(
                    total_mass,
                    peptide.monoisotopic_mass + m.monoisotopic_mass
                        - existing.monoisotopic_mass,
                )
            {
                out.push(m.clone());
            }
        }
    }
    for (m1, m2) in combos {
        if tolerance.within(total_mass, peptide.monoisotopic_mass + m1 + m2) {
            out.extend(possible_mods(
                total_mass - m1,
                all_mods,
                combos,
                tolerance,
                peptide,
            ));
            out.extend(possible_mods(
                total_mass - m2,
                all_mods,
                combos,
                tolerance,
                peptide,
            ));
        }
    }
    out
}
