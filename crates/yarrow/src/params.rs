use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::enzyme::{DigestionParams, Protease};
use crate::ion_series::DissociationType;
use crate::mass::Tolerance;
use crate::modification::Modification;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("unknown protease `{0}`")]
    UnknownProtease(String),
    #[error("unknown modification `{0}`")]
    UnknownModification(String),
    #[error("no file-specific parameters registered for `{0}`")]
    UnknownFile(String),
    #[error("invalid residue `{residue}` in protein {accession}")]
    InvalidSequence { accession: String, residue: char },
}

/// Capability for coarse progress reporting. Engines call this at monotonic
/// integer-percent boundaries; implementations must tolerate calls from
/// multiple worker threads.
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: usize, message: &str);
}

/// Discards all progress events
#[derive(Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report(&self, _percent: usize, _message: &str) {}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonParameters {
    pub max_threads_per_file: usize,
    /// PSM candidates scoring below this are never recorded
    pub score_cutoff: f64,
    pub precursor_tolerance: Tolerance,
    pub product_tolerance: Tolerance,
    pub dissociation_type: DissociationType,
    /// Fragment charge states 1..=max are considered during matching
    pub max_fragment_charge: u8,
    /// Record tied peptides on a PSM rather than keeping an arbitrary winner
    pub report_all_ambiguity: bool,
    pub digestion: DigestionParams,
}

impl Default for CommonParameters {
    fn default() -> Self {
        Self {
            max_threads_per_file: 1,
            score_cutoff: 5.0,
            precursor_tolerance: Tolerance::Ppm(-5.0, 5.0),
            product_tolerance: Tolerance::Ppm(-20.0, 20.0),
            dissociation_type: DissociationType::Hcd,
            max_fragment_charge: 3,
            report_all_ambiguity: true,
            digestion: DigestionParams::default(),
        }
    }
}

impl CommonParameters {
    /// Resolve the configured protease against the built-in registry,
    /// failing fast on an unknown name
    pub fn protease(&self) -> Result<Protease, EngineError> {
        Protease::named(&self.digestion.protease)
            .ok_or_else(|| EngineError::UnknownProtease(self.digestion.protease.clone()))
    }
}

/// Per-file overlay on [`CommonParameters`]. Unknown names fail the engine
/// invocation with a domain error; a cooperating task layer may catch and
/// continue with the remaining files.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSpecificParameters {
    pub precursor_tolerance: Option<Tolerance>,
    pub product_tolerance: Option<Tolerance>,
    pub protease: Option<String>,
    pub fixed_mods: Option<Vec<String>>,
    pub variable_mods: Option<Vec<String>>,
}

impl FileSpecificParameters {
    pub fn apply(&self, common: &CommonParameters) -> Result<CommonParameters, EngineError> {
        let mut params = common.clone();
        if let Some(tol) = self.precursor_tolerance {
            params.precursor_tolerance = tol;
        }
        if let Some(tol) = self.product_tolerance {
            params.product_tolerance = tol;
        }
        if let Some(protease) = &self.protease {
            if Protease::named(protease).is_none() {
                return Err(EngineError::UnknownProtease(protease.clone()));
            }
            params.digestion.protease = protease.clone();
        }
        Ok(params)
    }
}

/// Resolve modification names in a per-file overlay against the loaded
/// modification registry
pub fn resolve_mods(
    names: &[String],
    registry: &[Arc<Modification>],
) -> Result<Vec<Arc<Modification>>, EngineError> {
    names
        .iter()
        .map(|name| {
            registry
                .iter()
                .find(|m| &m.id == name)
                .cloned()
                .ok_or_else(|| EngineError::UnknownModification(name.clone()))
        })
        .collect()
}
