use std::sync::Arc;

use crate::mass::monoisotopic;
use crate::params::EngineError;

/// A database entry. Read-only for the duration of a search.
#[derive(Clone, Debug)]
pub struct Protein {
    pub accession: Arc<str>,
    pub sequence: Arc<[u8]>,
    pub is_decoy: bool,
}

impl Protein {
    /// Build a protein, rejecting sequences containing anything other than
    /// upper-case amino acids
    pub fn new(
        accession: impl Into<Arc<str>>,
        sequence: &str,
        is_decoy: bool,
    ) -> Result<Arc<Protein>, EngineError> {
        let accession = accession.into();
        if let Some(residue) = sequence.chars().find(|&c| monoisotopic(c as u8) == 0.0) {
            return Err(EngineError::InvalidSequence {
                accession: accession.to_string(),
                residue,
            });
        }
        Ok(Arc::new(Protein {
            accession,
            sequence: Arc::from(sequence.as_bytes().to_vec().into_boxed_slice()),
            is_decoy,
        }))
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    pub fn sequence_str(&self) -> &str {
        // Validated as ASCII amino acids at construction
        std::str::from_utf8(&self.sequence).unwrap_or_default()
    }
}
