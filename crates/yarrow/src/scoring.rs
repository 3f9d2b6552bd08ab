use fnv::FnvHashMap;

use crate::ion_series::{Product, ProductKind};
use crate::mass::{Tolerance, PROTON};
use crate::spectrum::Ms2Scan;

/// A theoretical product matched to an observed peak
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MatchedFragmentIon {
    pub product: Product,
    pub mz: f64,
    pub intensity: f64,
    pub charge: u8,
}

/// Match theoretical products against the observed peak list.
///
/// For each product, the most intense peak within `tolerance` wins. Charges
/// `1..=max_fragment_charge` are tried; normally at most one match (the most
/// intense across charge states) is kept per product, while
/// `match_all_charges` keeps a match at every charge state that produced one
/// (used when building spectral libraries).
pub fn match_fragment_ions(
    scan: &Ms2Scan,
    products: &[Product],
    tolerance: Tolerance,
    match_all_charges: bool,
    max_fragment_charge: u8,
) -> Vec<MatchedFragmentIon> {
    let max_charge = match match_all_charges {
        true => max_fragment_charge.max(scan.precursor_charge).max(1),
        false => max_fragment_charge.max(1),
    };

    let mut matched = Vec::new();
    for product in products {
        let mut best: Option<MatchedFragmentIon> = None;
        for charge in 1..=max_charge {
            let mz = (product.monoisotopic_mass + charge as f64 * PROTON) / charge as f64;
            let Some(peak) = scan.most_intense_peak_within(mz, tolerance) else {
                continue;
            };
            let ion = MatchedFragmentIon {
                product: *product,
                mz: peak.mz,
                intensity: peak.intensity,
                charge,
            };
            if match_all_charges {
                matched.push(ion);
            } else if best.map(|b| ion.intensity > b.intensity).unwrap_or(true) {
                best = Some(ion);
            }
        }
        if let Some(ion) = best {
            matched.push(ion);
        }
    }
    matched
}

/// Score = number of matched ions + fraction of total scan intensity matched.
///
/// When `fragments_can_have_different_charges`, an ion matched at several
/// charge states counts once per charge; otherwise duplicate products
/// collapse and the highest-charge match wins.
pub fn calculate_peptide_score(
    scan: &Ms2Scan,
    matched_ions: &[MatchedFragmentIon],
    fragments_can_have_different_charges: bool,
) -> f64 {
    let (count, summed) = if fragments_can_have_different_charges {
        (
            matched_ions.len(),
            matched_ions.iter().map(|m| m.intensity).sum::<f64>(),
        )
    } else {
        let mut by_product: FnvHashMap<(ProductKind, usize), (u8, f64)> = FnvHashMap::default();
        for ion in matched_ions {
            let entry = by_product
                .entry((ion.product.kind, ion.product.fragment_number))
                .or_insert((ion.charge, ion.intensity));
            if ion.charge > entry.0 || (ion.charge == entry.0 && ion.intensity > entry.1) {
                *entry = (ion.charge, ion.intensity);
            }
        }
        (
            by_product.len(),
            by_product.values().map(|(_, intensity)| intensity).sum(),
        )
    };

    let intensity_fraction = if scan.total_intensity > 0.0 {
        summed / scan.total_intensity
    } else {
        0.0
    };
    count as f64 + intensity_fraction
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::enzyme::DigestSpan;
    use crate::ion_series::DissociationType;
    use crate::peptide::Peptide;
    use crate::protein::Protein;
    use crate::spectrum::Peak;

    fn peptide(s: &str) -> Peptide {
        let protein = Protein::new("test", s, false).unwrap();
        Peptide::unmodified(
            &protein,
            DigestSpan {
                start: 0,
                end: s.len(),
                missed_cleavages: 0,
            },
        )
    }

    fn perfect_scan(peptide: &Peptide) -> Ms2Scan {
        let mut products = Vec::new();
        peptide.fragment(DissociationType::Hcd, &mut products);
        let peaks = products
            .iter()
            .map(|p| Peak {
                mz: p.monoisotopic_mass + PROTON,
                intensity: 1.0,
            })
            .collect();
        Ms2Scan::new(0, 1, peptide.monoisotopic_mass, 2, None, peaks)
    }

    #[test]
    fn perfect_match_scores_n_plus_one() {
        let peptide = peptide("PEPTIDEK");
        let scan = perfect_scan(&peptide);

        let mut products = Vec::new();
        peptide.fragment(DissociationType::Hcd, &mut products);
        assert_eq!(products.len(), 14);

        let matched =
            match_fragment_ions(&scan, &products, Tolerance::Ppm(-10.0, 10.0), false, 1);
        assert_eq!(matched.len(), 14);

        let score = calculate_peptide_score(&scan, &matched, false);
        assert!((score - 15.0).abs() < 1e-9);
    }

    #[test]
    fn no_peaks_no_score() {
        let peptide = peptide("PEPTIDEK");
        let scan = Ms2Scan::new(0, 1, peptide.monoisotopic_mass, 2, None, vec![]);
        let mut products = Vec::new();
        peptide.fragment(DissociationType::Hcd, &mut products);
        let matched =
            match_fragment_ions(&scan, &products, Tolerance::Ppm(-10.0, 10.0), false, 2);
        assert!(matched.is_empty());
        assert_eq!(calculate_peptide_score(&scan, &matched, false), 0.0);
    }

    #[test]
    fn charge_two_fragments() {
        let peptide = peptide("PEPTIDEK");
        let mut products = Vec::new();
        peptide.fragment(DissociationType::Hcd, &mut products);

        // Observe every fragment as a doubly-charged peak
        let peaks = products
            .iter()
            .map(|p| Peak {
                mz: (p.monoisotopic_mass + 2.0 * PROTON) / 2.0,
                intensity: 2.0,
            })
            .collect();
        let scan = Ms2Scan::new(0, 1, peptide.monoisotopic_mass, 3, None, peaks);

        // Only singly-charged search misses everything
        let matched =
            match_fragment_ions(&scan, &products, Tolerance::Ppm(-10.0, 10.0), false, 1);
        assert!(matched.is_empty());

        let matched =
            match_fragment_ions(&scan, &products, Tolerance::Ppm(-10.0, 10.0), false, 2);
        assert_eq!(matched.len(), 14);
        assert!(matched.iter().all(|m| m.charge == 2));
    }

    #[test]
    fn all_charges_count_separately() {
        let peptide = peptide("PEPTIDEK");
        let mut products = Vec::new();
        peptide.fragment(DissociationType::Hcd, &mut products);

        let mut peaks = Vec::new();
        for p in &products {
            peaks.push(Peak {
                mz: p.monoisotopic_mass + PROTON,
                intensity: 1.0,
            });
            peaks.push(Peak {
                mz: (p.monoisotopic_mass + 2.0 * PROTON) / 2.0,
                intensity: 1.0,
            });
        }
        let scan = Ms2Scan::new(0, 1, peptide.monoisotopic_mass, 2, None, peaks);

        let single = match_fragment_ions(&scan, &products, Tolerance::Ppm(-10.0, 10.0), false, 2);
        assert_eq!(single.len(), 14);

        let all = match_fragment_ions(&scan, &products, Tolerance::Ppm(-10.0, 10.0), true, 2);
        assert_eq!(all.len(), 28);

        // Deduplicated scoring collapses charge states back to one per product
        let score = calculate_peptide_score(&scan, &all, false);
        assert!((score - (14.0 + 14.0 / 28.0)).abs() < 1e-9);
        let score = calculate_peptide_score(&scan, &all, true);
        assert!((score - (28.0 + 28.0 / 28.0)).abs() < 1e-9);
    }

    #[test]
    fn dedup_keeps_highest_charge_not_highest_intensity() {
        let peptide = peptide("PEPTIDEK");
        let mut products = Vec::new();
        peptide.fragment(DissociationType::Hcd, &mut products);

        // The singly-charged peaks are far more intense than the
        // doubly-charged ones
        let mut peaks = Vec::new();
        for p in &products {
            peaks.push(Peak {
                mz: p.monoisotopic_mass + PROTON,
                intensity: 5.0,
            });
            peaks.push(Peak {
                mz: (p.monoisotopic_mass + 2.0 * PROTON) / 2.0,
                intensity: 1.0,
            });
        }
        let scan = Ms2Scan::new(0, 1, peptide.monoisotopic_mass, 2, None, peaks);

        let all = match_fragment_ions(&scan, &products, Tolerance::Ppm(-10.0, 10.0), true, 2);
        assert_eq!(all.len(), 28);

        // Collapsing credits the charge-2 observation of each product, even
        // though the charge-1 peak is five times as intense
        let score = calculate_peptide_score(&scan, &all, false);
        let total = 14.0 * 5.0 + 14.0 * 1.0;
        assert!((score - (14.0 + 14.0 / total)).abs() < 1e-9);
    }
}
