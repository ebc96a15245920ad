// Multi-genome loading: the whole reference sequence, kept in memory for the
// lifetime of the run.

use std::io::{self, Read};

use bio::io::fasta;

use crate::utils::open_reader;

pub struct Genome {
    seq: Vec<u8>,
}

impl Genome {
    /// Load a multi-genome from `path`.
    ///
    /// FASTA input (possibly gzip/BGZF-compressed) has its records
    /// concatenated in file order; anything else is treated as a raw
    /// sequence file with whitespace stripped. Bases are upper-cased.
    pub fn load(path: &str) -> io::Result<Self> {
        let mut reader = open_reader(path)?;
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw)?;

        let seq = if raw.first() == Some(&b'>') {
            let mut seq = Vec::with_capacity(raw.len());
            for record in fasta::Reader::new(&raw[..]).records() {
                let record = record.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                seq.extend(record.seq().iter().map(|b| b.to_ascii_uppercase()));
            }
            seq
        } else {
            raw.iter()
                .filter(|b| !b.is_ascii_whitespace())
                .map(|b| b.to_ascii_uppercase())
                .collect()
        };

        if seq.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: empty reference sequence", path),
            ));
        }

        log::info!("loaded multi-genome: {} bp", seq.len());
        Ok(Genome { seq })
    }

    pub fn from_seq(seq: Vec<u8>) -> Self {
        Genome { seq }
    }

    pub fn len(&self) -> usize {
        self.seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }

    pub fn seq(&self) -> &[u8] {
        &self.seq
    }

    pub fn base(&self, pos: usize) -> u8 {
        self.seq[pos]
    }

    /// Reversed copy of the sequence, used to build the reverse FM-index.
    pub fn reversed(&self) -> Vec<u8> {
        let mut rev = self.seq.clone();
        rev.reverse();
        rev
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_fasta_and_raw() {
        let dir = tempfile::tempdir().unwrap();

        let fa = dir.path().join("ref.fa");
        std::fs::write(&fa, ">chr1\nacgt\nACGT\n>chr2\nTTTT\n").unwrap();
        let g = Genome::load(fa.to_str().unwrap()).unwrap();
        assert_eq!(g.seq(), b"ACGTACGTTTTT");

        let raw = dir.path().join("ref.mg");
        let mut f = std::fs::File::create(&raw).unwrap();
        f.write_all(b"acgtACGT\n").unwrap();
        drop(f);
        let g = Genome::load(raw.to_str().unwrap()).unwrap();
        assert_eq!(g.seq(), b"ACGTACGT");
        assert_eq!(g.reversed(), b"TGCATGCA");
    }
}
