use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::mass::VALID_AA;

/// Where a modification is allowed to sit, relative to the peptide and
/// the parent protein
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LocationRestriction {
    Anywhere,
    NTerminal,
    CTerminal,
    PeptideNTerminal,
    PeptideCTerminal,
}

/// Sequence context around a modified residue. One uppercase letter is the
/// anchor, lowercase letters are flanking context, and `X`/`x` matches any
/// residue.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Motif {
    residues: Box<[u8]>,
    anchor: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvalidMotif {
    Empty,
    NoAnchor(String),
    MultipleAnchors(String),
    InvalidResidue(char),
}

impl FromStr for Motif {
    type Err = InvalidMotif;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(InvalidMotif::Empty);
        }
        let mut anchor = None;
        for (idx, ch) in s.chars().enumerate() {
            if !ch.is_ascii_alphabetic() {
                return Err(InvalidMotif::InvalidResidue(ch));
            }
            let upper = ch.to_ascii_uppercase() as u8;
            if upper != b'X' && !VALID_AA.contains(&upper) {
                return Err(InvalidMotif::InvalidResidue(ch));
            }
            if ch.is_ascii_uppercase() {
                if anchor.replace(idx).is_some() {
                    return Err(InvalidMotif::MultipleAnchors(s.into()));
                }
            }
        }
        match anchor {
            Some(anchor) => Ok(Motif {
                residues: s.to_ascii_uppercase().into_bytes().into_boxed_slice(),
                anchor,
            }),
            None => Err(InvalidMotif::NoAnchor(s.into())),
        }
    }
}

impl Motif {
    /// Index of the uppercase anchor within the motif
    pub fn anchor(&self) -> usize {
        self.anchor
    }

    /// The residue the anchor must match, uppercased. `X` for a wildcard
    pub fn anchor_residue(&self) -> u8 {
        self.residues[self.anchor]
    }

    pub fn residues(&self) -> &[u8] {
        &self.residues
    }

    pub fn len(&self) -> usize {
        self.residues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.residues.is_empty()
    }
}

impl Display for Motif {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (idx, r) in self.residues.iter().enumerate() {
            let ch = if idx == self.anchor {
                (*r as char).to_ascii_uppercase()
            } else {
                (*r as char).to_ascii_lowercase()
            };
            write!(f, "{}", ch)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct Modification {
    /// Human-readable identifier, e.g. "Oxidation"
    pub id: String,
    pub motif: Motif,
    pub monoisotopic_mass: f64,
    pub location_restriction: LocationRestriction,
    /// Curated entries are valid; invalid entries are kept for annotation
    /// but never proposed by discovery
    pub valid: bool,
}

impl Modification {
    pub fn new(
        id: impl Into<String>,
        motif: Motif,
        monoisotopic_mass: f64,
        location_restriction: LocationRestriction,
    ) -> Arc<Self> {
        Arc::new(Modification {
            id: id.into(),
            motif,
            monoisotopic_mass,
            location_restriction,
            valid: true,
        })
    }
}

impl Modification {
    /// Can this modification sit at `protein_position` (1-based) of `protein`,
    /// reached through a peptide covering positions `peptide_position`
    /// (1-based within the peptide) of `peptide_length`?
    ///
    /// The motif is aligned so its anchor lands on `protein_position`; every
    /// motif residue must then match the protein sequence (case-insensitive,
    /// `X` wildcard), and the location restriction must hold.
    pub fn fits(
        &self,
        sequence: &[u8],
        peptide_position: usize,
        peptide_length: usize,
        protein_position: usize,
    ) -> bool {
        let offset = protein_position as isize - self.motif.anchor() as isize - 1;
        for (j, c) in self.motif.residues().iter().enumerate() {
            let p = j as isize + offset;
            if p < 0 || p >= sequence.len() as isize {
                return false;
            }
            if *c != b'X' && !c.eq_ignore_ascii_case(&sequence[p as usize]) {
                return false;
            }
        }
        match self.location_restriction {
            LocationRestriction::Anywhere => true,
            LocationRestriction::NTerminal => protein_position <= 2,
            LocationRestriction::PeptideNTerminal => peptide_position == 1,
            LocationRestriction::PeptideCTerminal => peptide_position == peptide_length,
            LocationRestriction::CTerminal => protein_position == sequence.len(),
        }
    }
}

impl PartialEq for Modification {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.monoisotopic_mass.to_bits() == other.monoisotopic_mass.to_bits()
    }
}

impl Eq for Modification {}

impl std::hash::Hash for Modification {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.monoisotopic_mass.to_bits().hash(state);
    }
}

impl Display for Modification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} on {}", self.id, self.motif)
    }
}

/// Parse `(motif, id)` pairs, dropping entries with malformed motifs.
/// Bad entries are reported and skipped rather than failing the run.
pub fn validate_mods(
    input: impl IntoIterator<Item = (String, String, f64, LocationRestriction)>,
) -> Vec<Arc<Modification>> {
    let mut output = Vec::new();
    for (id, motif, mass, restriction) in input {
        match motif.parse::<Motif>() {
            Ok(motif) => output.push(Modification::new(id, motif, mass, restriction)),
            Err(InvalidMotif::Empty) => {
                log::error!("invalid motif for {}: empty", id)
            }
            Err(InvalidMotif::NoAnchor(s)) => {
                log::error!("invalid motif for {}: no uppercase anchor in `{}`", id, s)
            }
            Err(InvalidMotif::MultipleAnchors(s)) => {
                log::error!("invalid motif for {}: multiple anchors in `{}`", id, s)
            }
            Err(InvalidMotif::InvalidResidue(c)) => {
                log::error!("invalid motif for {}: unrecognized residue ({})", id, c)
            }
        }
    }
    output
}
