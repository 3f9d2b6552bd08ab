use serde::{Deserialize, Serialize};

use crate::mass::{HYDROGEN, NH3};
use crate::peptide::Peptide;

/// Fragmentation method. `Autodetect` is a configuration sentinel: the
/// effective type is taken from each scan's header at search time.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DissociationType {
    Hcd,
    Cid,
    Etd,
    Autodetect,
}

impl DissociationType {
    /// Which product ion series this method generates
    pub fn product_kinds(self) -> &'static [ProductKind] {
        match self {
            DissociationType::Hcd | DissociationType::Cid => &[ProductKind::B, ProductKind::Y],
            DissociationType::Etd => &[ProductKind::C, ProductKind::Zdot],
            DissociationType::Autodetect => &[],
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ProductKind {
    B,
    Y,
    C,
    Zdot,
}

impl ProductKind {
    fn n_terminal(self) -> bool {
        matches!(self, ProductKind::B | ProductKind::C)
    }

    /// Mass offset relative to the plain b/y backbone series
    fn offset(self) -> f64 {
        match self {
            ProductKind::B => 0.0,
            ProductKind::Y => 0.0,
            ProductKind::C => NH3,
            ProductKind::Zdot => HYDROGEN - NH3,
        }
    }
}

/// Neutral theoretical product ion
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Product {
    pub kind: ProductKind,
    /// Number of residues contained in the fragment
    pub fragment_number: usize,
    pub monoisotopic_mass: f64,
}

/// Generate theoretical product ions for a candidate peptide
pub struct IonSeries<'p> {
    kind: ProductKind,
    cumulative_mass: f64,
    peptide: &'p Peptide,
    idx: usize,
}

impl<'p> IonSeries<'p> {
    pub fn new(peptide: &'p Peptide, kind: ProductKind) -> Self {
        let cumulative_mass = match kind.n_terminal() {
            true => peptide.nterm_mod_mass(),
            false => peptide.monoisotopic_mass - peptide.nterm_mod_mass(),
        };
        Self {
            kind,
            cumulative_mass,
            peptide,
            idx: 0,
        }
    }
}

impl<'p> Iterator for IonSeries<'p> {
    type Item = Product;

    // Memoize the cumulative fragment mass, modifications included, so each
    // product is O(1)
    fn next(&mut self) -> Option<Self::Item> {
        if self.idx + 1 >= self.peptide.len() {
            return None;
        }
        let residue = self.peptide.residue_and_mod_mass(self.idx);
        self.cumulative_mass += match self.kind.n_terminal() {
            true => residue,
            false => -residue,
        };
        self.idx += 1;

        Some(Product {
            kind: self.kind,
            fragment_number: match self.kind.n_terminal() {
                true => self.idx,
                false => self.peptide.len() - self.idx,
            },
            monoisotopic_mass: self.cumulative_mass + self.kind.offset(),
        })
    }
}
