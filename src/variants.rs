// Variant catalogue: known polymorphic loci with their allele sets and prior
// frequencies, plus a sorted position array for interval queries.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader};

use crate::utils::open_reader;

#[derive(Debug, Clone)]
pub struct VariantSite {
    /// Allele strings in catalogue order; first-seen wins DP cost ties.
    pub alleles: Vec<Vec<u8>>,
    /// Prior frequencies, parallel to `alleles`; the residual mass belongs
    /// to the reference allele.
    pub freqs: Vec<f64>,
    /// Some(len) when every allele has the same length (substitution-only
    /// locus); None marks an indel locus.
    pub same_len: Option<usize>,
}

impl VariantSite {
    fn new(alleles: Vec<Vec<u8>>, freqs: Vec<f64>) -> Self {
        let same_len = match alleles.first() {
            Some(first) if alleles.iter().all(|a| a.len() == first.len()) => Some(first.len()),
            _ => None,
        };
        VariantSite {
            alleles,
            freqs,
            same_len,
        }
    }
}

pub struct VariantCatalogue {
    sites: HashMap<usize, VariantSite>,
    positions: Vec<usize>,
}

impl VariantCatalogue {
    /// Load a catalogue file: one locus per line,
    /// `POS<TAB>ALLELE:FREQ[,ALLELE:FREQ...]`. Blank lines and lines
    /// starting with `#` are skipped.
    pub fn load(path: &str) -> io::Result<Self> {
        let reader = BufReader::new(open_reader(path)?);
        let mut entries = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let bad = |what: &str| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{}:{}: {}", path, lineno + 1, what),
                )
            };
            let mut fields = line.split('\t');
            let pos: usize = fields
                .next()
                .ok_or_else(|| bad("missing position"))?
                .parse()
                .map_err(|_| bad("bad position"))?;
            let allele_field = fields.next().ok_or_else(|| bad("missing allele list"))?;
            let mut alleles = Vec::new();
            for part in allele_field.split(',') {
                let (allele, freq) = part
                    .split_once(':')
                    .ok_or_else(|| bad("allele entry is not ALLELE:FREQ"))?;
                let freq: f64 = freq.parse().map_err(|_| bad("bad allele frequency"))?;
                alleles.push((allele.as_bytes().to_vec(), freq));
            }
            if alleles.is_empty() {
                return Err(bad("locus without alleles"));
            }
            entries.push((pos, alleles));
        }
        let catalogue = Self::from_entries(entries);
        log::info!("loaded variant catalogue: {} loci", catalogue.len());
        Ok(catalogue)
    }

    pub fn from_entries(entries: Vec<(usize, Vec<(Vec<u8>, f64)>)>) -> Self {
        let mut sites = HashMap::with_capacity(entries.len());
        for (pos, pairs) in entries {
            let (alleles, freqs) = pairs.into_iter().unzip();
            sites.insert(pos, VariantSite::new(alleles, freqs));
        }
        let mut positions: Vec<usize> = sites.keys().copied().collect();
        positions.sort_unstable();
        VariantCatalogue { sites, positions }
    }

    pub fn empty() -> Self {
        VariantCatalogue {
            sites: HashMap::new(),
            positions: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    #[inline]
    pub fn site(&self, pos: usize) -> Option<&VariantSite> {
        self.sites.get(&pos)
    }

    /// True when `pos` is an indel locus (catalogued, alleles of mixed length).
    #[inline]
    pub fn is_indel_locus(&self, pos: usize) -> bool {
        matches!(self.sites.get(&pos), Some(site) if site.same_len.is_none())
    }

    pub fn positions(&self) -> &[usize] {
        &self.positions
    }

    /// Whether [i, j] contains a catalogued position. Interpolation probes
    /// narrow the bracket, a partition point finishes it off.
    pub fn interval_has_variant(&self, i: usize, j: usize) -> bool {
        let a = &self.positions;
        if i > j || a.is_empty() {
            return false;
        }
        let (mut l, mut r) = (0usize, a.len() - 1);
        while l < r && a[l] < i && i <= a[r] {
            let probe = l + (r - l) * (i - a[l]) / (a[r] - a[l]);
            let probe = probe.clamp(l, r - 1);
            if a[probe] < i {
                l = probe + 1;
            } else {
                r = probe;
            }
        }
        // first catalogued position >= i, if any, is at or after l
        let k = l + a[l..].partition_point(|&p| p < i);
        k < a.len() && a[k] <= j
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn catalogue_at(positions: &[usize]) -> VariantCatalogue {
        VariantCatalogue::from_entries(
            positions
                .iter()
                .map(|&p| (p, vec![(b"A".to_vec(), 0.5)]))
                .collect(),
        )
    }

    #[test]
    fn same_len_flag() {
        let cat = VariantCatalogue::from_entries(vec![
            (3, vec![(b"A".to_vec(), 0.6), (b"C".to_vec(), 0.3)]),
            (9, vec![(b"A".to_vec(), 0.6), (b"AA".to_vec(), 0.3)]),
        ]);
        assert_eq!(cat.site(3).unwrap().same_len, Some(1));
        assert_eq!(cat.site(9).unwrap().same_len, None);
        assert!(cat.is_indel_locus(9));
        assert!(!cat.is_indel_locus(3));
        assert_eq!(cat.positions(), &[3, 9]);
    }

    #[test]
    fn interval_query_matches_brute_force() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let n = rng.gen_range(1..40);
            let mut positions: Vec<usize> = (0..n).map(|_| rng.gen_range(0..200)).collect();
            positions.sort_unstable();
            positions.dedup();
            let cat = catalogue_at(&positions);
            for _ in 0..200 {
                let i = rng.gen_range(0..220);
                let j = rng.gen_range(0..220);
                let expect = positions.iter().any(|&p| i <= p && p <= j);
                assert_eq!(
                    cat.interval_has_variant(i, j),
                    expect,
                    "positions={:?} i={} j={}",
                    positions,
                    i,
                    j
                );
            }
        }
    }

    #[test]
    fn interval_query_edges() {
        let cat = catalogue_at(&[5, 5, 17, 90]);
        assert!(cat.interval_has_variant(5, 5));
        assert!(cat.interval_has_variant(0, 5));
        assert!(cat.interval_has_variant(90, 300));
        assert!(!cat.interval_has_variant(6, 16));
        assert!(!cat.interval_has_variant(91, 300));
        assert!(!cat.interval_has_variant(10, 6));
        assert!(!VariantCatalogue::empty().interval_has_variant(0, 100));
    }

    #[test]
    fn loads_catalogue_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snp.prof");
        std::fs::write(&path, "# known loci\n6\tT:0.7,C:0.3\n14\tA:0.6,AA:0.4\n").unwrap();
        let cat = VariantCatalogue::load(path.to_str().unwrap()).unwrap();
        assert_eq!(cat.len(), 2);
        let site = cat.site(6).unwrap();
        assert_eq!(site.alleles, vec![b"T".to_vec(), b"C".to_vec()]);
        assert_eq!(site.freqs, vec![0.7, 0.3]);
        assert_eq!(site.same_len, Some(1));
        assert!(cat.is_indel_locus(14));
    }
}
