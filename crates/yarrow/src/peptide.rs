use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hasher;
use std::sync::Arc;

use fnv::FnvHasher;
use itertools::Itertools;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::enzyme::{DigestSpan, DigestionParams, Protease};
use crate::ion_series::{DissociationType, IonSeries, Product};
use crate::mass::{monoisotopic, H2O};
use crate::modification::Modification;
use crate::protein::Protein;

/// A located, possibly modified peptide: the substrate for candidate
/// scoring.
///
/// Modifications are keyed by position in the *augmented frame*:
/// N-terminus = 1, residue `i` (0-based) = `i + 2`, C-terminus = `len + 2`.
#[derive(Clone)]
pub struct Peptide {
    pub protein: Arc<Protein>,
    pub decoy: bool,
    /// 1-based start of this peptide within the parent protein
    pub one_based_start: usize,
    pub sequence: Arc<[u8]>,
    pub modifications: BTreeMap<usize, Arc<Modification>>,
    /// Monoisotopic mass, inclusive of all modifications
    pub monoisotopic_mass: f64,
    pub missed_cleavages: u8,
}

impl Peptide {
    /// Build an unmodified peptide from a digestion span
    pub fn unmodified(protein: &Arc<Protein>, span: DigestSpan) -> Peptide {
        let sequence = &protein.sequence[span.start..span.end];
        let mass = sequence.iter().map(|&r| monoisotopic(r)).sum::<f64>() + H2O;
        Peptide {
            protein: protein.clone(),
            decoy: protein.is_decoy,
            one_based_start: span.start + 1,
            sequence: Arc::from(sequence.to_vec().into_boxed_slice()),
            modifications: BTreeMap::new(),
            monoisotopic_mass: mass,
            missed_cleavages: span.missed_cleavages,
        }
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    pub fn nterm_mod_mass(&self) -> f64 {
        self.modifications
            .get(&1)
            .map(|m| m.monoisotopic_mass)
            .unwrap_or_default()
    }

    pub fn cterm_mod_mass(&self) -> f64 {
        self.modifications
            .get(&(self.len() + 2))
            .map(|m| m.monoisotopic_mass)
            .unwrap_or_default()
    }

    /// Residue mass at 0-based `idx`, plus any sidechain modification there
    pub fn residue_and_mod_mass(&self, idx: usize) -> f64 {
        let side = self
            .modifications
            .get(&(idx + 2))
            .map(|m| m.monoisotopic_mass)
            .unwrap_or_default();
        monoisotopic(self.sequence[idx]) + side
    }

    /// Insert a modification if the site is vacant, updating the mass
    fn try_insert_modification(&mut self, position: usize, m: &Arc<Modification>) -> bool {
        if self.modifications.contains_key(&position) {
            return false;
        }
        self.monoisotopic_mass += m.monoisotopic_mass;
        self.modifications.insert(position, m.clone());
        true
    }

    /// Append theoretical products for the given dissociation method
    pub fn fragment(&self, dissociation: DissociationType, products: &mut Vec<Product>) {
        for kind in dissociation.product_kinds() {
            products.extend(IonSeries::new(self, *kind));
        }
    }

    /// Apply fixed modifications, then expand variable-modification
    /// combinations, bounded by `max_variable_mods`
    pub fn apply(
        mut self,
        fixed_mods: &[Arc<Modification>],
        variable_mods: &[Arc<Modification>],
        max_variable_mods: usize,
    ) -> Vec<Peptide> {
        let len = self.len();
        let protein = self.protein.clone();
        for m in fixed_mods {
            for idx in 0..len {
                if m.fits(
                    &protein.sequence,
                    idx + 1,
                    len,
                    self.one_based_start + idx,
                ) {
                    self.try_insert_modification(idx + 2, m);
                }
            }
        }

        if variable_mods.is_empty() {
            return vec![self];
        }

        let mut sites = Vec::new();
        for m in variable_mods {
            for idx in 0..len {
                let occupied = self.modifications.contains_key(&(idx + 2));
                if !occupied
                    && m.fits(
                        &protein.sequence,
                        idx + 1,
                        len,
                        self.one_based_start + idx,
                    )
                {
                    sites.push((idx + 2, m));
                }
            }
        }

        let mut modified = Vec::new();
        modified.push(self.clone());
        for n in 1..=max_variable_mods {
            'next: for combination in sites.iter().combinations(n) {
                // A combination re-using a position is not a valid proteoform
                if combination.iter().map(|(p, _)| p).duplicates().next().is_some() {
                    continue 'next;
                }
                let mut peptide = self.clone();
                for (position, m) in combination {
                    peptide.try_insert_modification(*position, m);
                }
                modified.push(peptide);
            }
        }
        modified
    }

    /// Reverse decoy: all residues except the C-terminal one are reversed,
    /// sidechain modifications travel with their residues, terminal
    /// modifications stay in place.
    pub fn reverse_decoy(&self) -> Peptide {
        let len = self.len();
        let mut sequence = self.sequence.to_vec();
        if len > 2 {
            sequence[..len - 1].reverse();
        }
        let modifications = self
            .modifications
            .iter()
            .map(|(&pos, m)| {
                let new_pos = if pos == 1 || pos == len + 2 || pos == len + 1 {
                    // terminal mods and the fixed C-terminal residue
                    pos
                } else {
                    let idx = pos - 2;
                    (len - 2 - idx) + 2
                };
                (new_pos, m.clone())
            })
            .collect();

        Peptide {
            protein: self.protein.clone(),
            decoy: true,
            one_based_start: self.one_based_start,
            sequence: Arc::from(sequence.into_boxed_slice()),
            modifications,
            monoisotopic_mass: self.monoisotopic_mass,
            missed_cleavages: self.missed_cleavages,
        }
    }

    /// Scrambled decoy: deterministic shuffle of the non-C-terminal residues,
    /// seeded by the target sequence and the attempt counter
    pub fn scrambled_decoy(&self, attempt: u64) -> Peptide {
        let len = self.len();
        let mut hasher = FnvHasher::default();
        hasher.write(&self.sequence);
        hasher.write_u64(attempt);
        let mut rng = StdRng::seed_from_u64(hasher.finish());

        // order[new_idx] = old_idx
        let mut order: Vec<usize> = (0..len.saturating_sub(1)).collect();
        order.shuffle(&mut rng);

        let mut sequence = vec![0u8; len];
        let mut new_of_old = vec![0usize; len];
        for (new_idx, &old_idx) in order.iter().enumerate() {
            sequence[new_idx] = self.sequence[old_idx];
            new_of_old[old_idx] = new_idx;
        }
        if len > 0 {
            sequence[len - 1] = self.sequence[len - 1];
            new_of_old[len - 1] = len - 1;
        }

        let modifications = self
            .modifications
            .iter()
            .map(|(&pos, m)| {
                let new_pos = if pos == 1 || pos == len + 2 {
                    pos
                } else {
                    new_of_old[pos - 2] + 2
                };
                (new_pos, m.clone())
            })
            .collect();

        Peptide {
            protein: self.protein.clone(),
            decoy: true,
            one_based_start: self.one_based_start,
            sequence: Arc::from(sequence.into_boxed_slice()),
            modifications,
            monoisotopic_mass: self.monoisotopic_mass,
            missed_cleavages: self.missed_cleavages,
        }
    }

    pub fn base_sequence_str(&self) -> &str {
        std::str::from_utf8(&self.sequence).unwrap_or_default()
    }

    /// Sequence string with modification masses, e.g. `PEPT[+79.9663]IDEK`
    pub fn full_sequence(&self) -> String {
        self.to_string()
    }
}

/// Fraction of aligned positions at which two equal-length peptides agree on
/// both residue and modification. Used to decide whether a generated decoy is
/// too close to its target.
pub fn sequence_similarity(target: &Peptide, decoy: &Peptide) -> f64 {
    let len = target.len();
    if len == 0 || len != decoy.len() {
        return 0.0;
    }
    let mut matches = 0usize;
    for i in 0..len {
        if target.sequence[i] != decoy.sequence[i] {
            continue;
        }
        let a = target.modifications.get(&(i + 2));
        let b = decoy.modifications.get(&(i + 2));
        match (a, b) {
            (None, _) => matches += 1,
            (Some(a), Some(b)) if a == b => matches += 1,
            _ => {}
        }
    }
    matches as f64 / len as f64
}

/// Digest a protein into candidate peptides with all modification variants
pub fn digest(
    protein: &Arc<Protein>,
    protease: &Protease,
    params: &DigestionParams,
    fixed_mods: &[Arc<Modification>],
    variable_mods: &[Arc<Modification>],
) -> Vec<Peptide> {
    protease
        .digest(protein.sequence_str(), params)
        .into_iter()
        .flat_map(|span| {
            Peptide::unmodified(protein, span).apply(
                fixed_mods,
                variable_mods,
                params.max_variable_mods,
            )
        })
        .collect()
}

impl PartialEq for Peptide {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
            && self.modifications == other.modifications
            && self.decoy == other.decoy
            && self.one_based_start == other.one_based_start
            && self.protein.accession == other.protein.accession
    }
}

impl Debug for Peptide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peptide")
            .field("protein", &self.protein.accession)
            .field("decoy", &self.decoy)
            .field("one_based_start", &self.one_based_start)
            .field("sequence", &self.base_sequence_str())
            .field("full_sequence", &self.full_sequence())
            .field("monoisotopic_mass", &self.monoisotopic_mass)
            .finish()
    }
}

impl std::fmt::Display for Peptide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(m) = self.modifications.get(&1) {
            write!(f, "[{:+}]-", m.monoisotopic_mass)?;
        }
        for (idx, c) in self.sequence.iter().enumerate() {
            write!(f, "{}", *c as char)?;
            if let Some(m) = self.modifications.get(&(idx + 2)) {
                write!(f, "[{:+}]", m.monoisotopic_mass)?;
            }
        }
        if let Some(m) = self.modifications.get(&(self.len() + 2)) {
            write!(f, "-[{:+}]", m.monoisotopic_mass)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::modification::LocationRestriction;

    fn protein(seq: &str) -> Arc<Protein> {
        Protein::new("test", seq, false).unwrap()
    }

    fn tryptic(seq: &str) -> Vec<Peptide> {
        let protein = protein(seq);
        let protease = Protease::named("trypsin").unwrap();
        let params = DigestionParams {
            missed_cleavages: 0,
            min_len: 1,
            max_len: 50,
            ..Default::default()
        };
        digest(&protein, &protease, &params, &[], &[])
    }

    fn oxidation(motif: &str) -> Arc<Modification> {
        Modification::new(
            "Oxidation",
            motif.parse().unwrap(),
            15.9949,
            LocationRestriction::Anywhere,
        )
    }

    #[test]
    fn digestion_locates_peptides() {
        let peptides = tryptic("PEPTIDEKAGAR");
        assert_eq!(peptides.len(), 2);
        assert_eq!(peptides[0].base_sequence_str(), "PEPTIDEK");
        assert_eq!(peptides[0].one_based_start, 1);
        assert_eq!(peptides[1].base_sequence_str(), "AGAR");
        assert_eq!(peptides[1].one_based_start, 9);
    }

    #[test]
    fn monoisotopic_mass() {
        let peptides = tryptic("PEPTIDEK");
        assert!((peptides[0].monoisotopic_mass - 927.45493).abs() < 1e-4);
    }

    #[test]
    fn variable_mod_expansion() {
        let protein = protein("GMMGK");
        let protease = Protease::named("trypsin").unwrap();
        let params = DigestionParams {
            missed_cleavages: 0,
            min_len: 1,
            max_len: 50,
            max_variable_mods: 2,
            ..Default::default()
        };
        let peptides = digest(&protein, &protease, &params, &[], &[oxidation("M")]);
        let sequences = peptides.iter().map(|p| p.to_string()).collect::<Vec<_>>();
        assert_eq!(
            sequences,
            vec![
                "GMMGK",
                "GM[+15.9949]MGK",
                "GMM[+15.9949]GK",
                "GM[+15.9949]M[+15.9949]GK",
            ]
        );
        // Mass reflects the mods
        assert!(
            (peptides[3].monoisotopic_mass - peptides[0].monoisotopic_mass - 2.0 * 15.9949).abs()
                < 1e-6
        );
    }

    #[test]
    fn fixed_mods_block_variable_sites() {
        let protein = protein("GCMGK");
        let protease = Protease::named("trypsin").unwrap();
        let params = DigestionParams {
            missed_cleavages: 0,
            min_len: 1,
            max_len: 50,
            max_variable_mods: 2,
            ..Default::default()
        };
        let carbamidomethyl = Modification::new(
            "Carbamidomethyl",
            "C".parse().unwrap(),
            57.02146,
            LocationRestriction::Anywhere,
        );
        let competing = Modification::new(
            "Trioxidation",
            "C".parse().unwrap(),
            47.9847,
            LocationRestriction::Anywhere,
        );
        let peptides = digest(
            &protein,
            &protease,
            &params,
            &[carbamidomethyl],
            &[competing],
        );
        // The fixed mod occupies C; no variable variant exists
        assert_eq!(peptides.len(), 1);
        assert_eq!(peptides[0].to_string(), "GC[+57.02146]MGK");
    }

    #[test]
    fn reverse_decoy_keeps_cterm() {
        let peptides = tryptic("PEPTIDEK");
        let decoy = peptides[0].reverse_decoy();
        assert!(decoy.decoy);
        assert_eq!(decoy.base_sequence_str(), "EDITPEPK");
        assert!((decoy.monoisotopic_mass - peptides[0].monoisotopic_mass).abs() < 1e-9);
    }

    #[test]
    fn reverse_decoy_moves_mods() {
        let protein = protein("PEPTIDEK");
        let mut target = Peptide::unmodified(
            &protein,
            DigestSpan {
                start: 0,
                end: 8,
                missed_cleavages: 0,
            },
        );
        // E at index 1 → augmented position 3
        assert!(target.try_insert_modification(3, &oxidation("E")));
        let decoy = target.reverse_decoy();
        // EDITPEPK: that E is now at index 5 → augmented position 7
        assert_eq!(decoy.modifications.len(), 1);
        assert!(decoy.modifications.contains_key(&7));
    }

    #[test]
    fn similarity() {
        let peptides = tryptic("PEPTIDEK");
        let target = &peptides[0];
        assert_eq!(sequence_similarity(target, target), 1.0);

        // PEPTIDEK vs EDITPEPK agree only at T and the fixed K
        let decoy = target.reverse_decoy();
        assert!((sequence_similarity(target, &decoy) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn scramble_is_deterministic() {
        let peptides = tryptic("PEPTIDEK");
        let a = peptides[0].scrambled_decoy(0);
        let b = peptides[0].scrambled_decoy(0);
        assert_eq!(a.base_sequence_str(), b.base_sequence_str());
        assert_eq!(
            a.base_sequence_str().as_bytes()[7],
            b'K',
            "C-terminal residue must stay fixed"
        );
        // A different attempt reshuffles
        let c = peptides[0].scrambled_decoy(1);
        assert_eq!(c.base_sequence_str().as_bytes()[7], b'K');
    }

    #[test]
    fn homopolymer_decoy_is_similar() {
        let peptides = tryptic("AAAAAAAK");
        let decoy = peptides[0].reverse_decoy();
        assert_eq!(sequence_similarity(&peptides[0], &decoy), 1.0);
    }
}
