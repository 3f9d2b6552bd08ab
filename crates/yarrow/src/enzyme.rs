use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::mass::VALID_AA;

/// Parameters controlling enzymatic digestion. The protease name is also the
/// partition key for FDR analysis: targets and decoys are only ever compared
/// within the same enzymatic context.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DigestionParams {
    pub protease: String,
    /// How many missed cleavages to allow
    pub missed_cleavages: u8,
    /// Minimum peptide length that will be reported (inclusive)
    pub min_len: usize,
    /// Maximum peptide length that will be reported (inclusive)
    pub max_len: usize,
    /// Limit number of variable modifications on a peptide
    pub max_variable_mods: usize,
}

impl Default for DigestionParams {
    fn default() -> Self {
        Self {
            protease: "trypsin".into(),
            missed_cleavages: 2,
            min_len: 7,
            max_len: 50,
            max_variable_mods: 2,
        }
    }
}

/// A named cleavage agent. `None` for the cleavage pattern means the protein
/// is taken whole (intact top-down analysis).
#[derive(Clone, Debug)]
pub struct Protease {
    pub name: String,
    // Regex matching cleavage sites
    regex: Option<Regex>,
    // Skip cleaving if the site is followed by this residue
    pub skip_suffix: Option<char>,
    // Cleave at the C-terminal side of the match?
    pub c_terminal: bool,
}

/// A single enzymatic fragment located within its parent sequence
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DigestSpan {
    /// 0-based inclusive start within the protein
    pub start: usize,
    /// 0-based exclusive end within the protein
    pub end: usize,
    pub missed_cleavages: u8,
}

impl Protease {
    pub fn new(name: impl Into<String>, cleave: &str, skip_suffix: Option<char>) -> Protease {
        assert!(
            cleave.chars().all(|x| VALID_AA.contains(&(x as u8))),
            "protease cleavage sequence contains non-amino acid characters: {}",
            cleave
        );
        Protease {
            name: name.into(),
            regex: match cleave {
                "" => None,
                _ => Some(Regex::new(&format!("[{}]", cleave)).unwrap()),
            },
            skip_suffix,
            c_terminal: true,
        }
    }

    /// Look up one of the built-in cleavage agents by name
    pub fn named(name: &str) -> Option<Protease> {
        match name {
            "trypsin" => Some(Protease::new(name, "KR", Some('P'))),
            "trypsin/P" => Some(Protease::new(name, "KR", None)),
            "lys-c" => Some(Protease::new(name, "K", Some('P'))),
            "arg-c" => Some(Protease::new(name, "R", Some('P'))),
            "chymotrypsin" => Some(Protease::new(name, "FWYL", Some('P'))),
            "top-down" => Some(Protease::new(name, "", None)),
            _ => None,
        }
    }

    /// Core (zero missed-cleavage) fragments of `sequence`, in N→C order
    fn core_fragments(&self, sequence: &str) -> Vec<(usize, usize)> {
        let regex = match &self.regex {
            Some(regex) => regex,
            None => return vec![(0, sequence.len())],
        };
        let mut spans = Vec::new();
        let mut left = 0;
        for mat in regex.find_iter(sequence) {
            let right = match self.c_terminal {
                true => mat.end(),
                false => mat.start(),
            };
            if let Some(skip) = self.skip_suffix {
                if right < sequence.len() && sequence[right..].starts_with(skip) {
                    continue;
                }
            }
            if right > left {
                spans.push((left, right));
            }
            left = right;
        }
        if left < sequence.len() {
            spans.push((left, sequence.len()));
        }
        spans
    }

    /// Produce all digestion spans, including missed-cleavage products,
    /// filtered by the length window
    pub fn digest(&self, sequence: &str, params: &DigestionParams) -> Vec<DigestSpan> {
        let core = self.core_fragments(sequence);
        let mut spans = Vec::new();
        for (idx, &(start, _)) in core.iter().enumerate() {
            for missed in 0..=params.missed_cleavages as usize {
                match core.get(idx + missed) {
                    Some(&(_, end)) => {
                        let len = end - start;
                        if len >= params.min_len && len <= params.max_len {
                            spans.push(DigestSpan {
                                start,
                                end,
                                missed_cleavages: missed as u8,
                            });
                        }
                    }
                    None => break,
                }
            }
        }
        spans
    }
}
