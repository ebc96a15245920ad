// Paired-end read streaming and per-read derived buffers.
//
// The producer owns a single `ReadPair` and refills it in place; workers
// copy the payload into their own `ReadMem` before handing the buffer back,
// so the producer never overwrites bytes a worker is still reading.

use std::io::{self, BufReader, Read};

use bio::io::fastq;

use crate::utils::open_reader;

/// One paired-end record in producer-owned reusable buffers.
#[derive(Debug, Default)]
pub struct ReadPair {
    pub seq1: Vec<u8>,
    pub qual1: Vec<u8>,
    pub seq2: Vec<u8>,
    pub qual2: Vec<u8>,
}

impl ReadPair {
    pub fn new() -> Self {
        ReadPair::default()
    }
}

#[inline]
pub fn complement(b: u8) -> u8 {
    match b {
        b'A' => b'T',
        b'T' => b'A',
        b'C' => b'G',
        b'G' => b'C',
        other => other,
    }
}

/// Derived views of one read end, refilled in place for every record.
#[derive(Debug, Default)]
pub struct EndBuffers {
    pub seq: Vec<u8>,
    pub qual: Vec<u8>,
    pub rev: Vec<u8>,
    pub comp: Vec<u8>,
    pub rev_comp: Vec<u8>,
    pub rev_qual: Vec<u8>,
}

impl EndBuffers {
    fn with_capacity(cap: usize) -> Self {
        EndBuffers {
            seq: Vec::with_capacity(cap),
            qual: Vec::with_capacity(cap),
            rev: Vec::with_capacity(cap),
            comp: Vec::with_capacity(cap),
            rev_comp: Vec::with_capacity(cap),
            rev_qual: Vec::with_capacity(cap),
        }
    }

    /// Copy `seq`/`qual` in and rebuild reverse, complement,
    /// reverse-complement and reversed-quality views.
    pub fn fill(&mut self, seq: &[u8], qual: &[u8]) {
        self.seq.clear();
        self.seq.extend_from_slice(seq);
        self.qual.clear();
        self.qual.extend_from_slice(qual);

        self.rev.clear();
        self.rev.extend(seq.iter().rev());
        self.comp.clear();
        self.comp.extend(seq.iter().map(|&b| complement(b)));
        self.rev_comp.clear();
        self.rev_comp.extend(seq.iter().rev().map(|&b| complement(b)));
        self.rev_qual.clear();
        self.rev_qual.extend(qual.iter().rev());
    }
}

/// Worker-owned copy of one record plus all derived arrays.
#[derive(Debug)]
pub struct ReadMem {
    pub end1: EndBuffers,
    pub end2: EndBuffers,
}

impl ReadMem {
    pub fn new(read_len: usize) -> Self {
        ReadMem {
            end1: EndBuffers::with_capacity(read_len),
            end2: EndBuffers::with_capacity(read_len),
        }
    }

    pub fn copy_from(&mut self, pair: &ReadPair) {
        self.end1.fill(&pair.seq1, &pair.qual1);
        self.end2.fill(&pair.seq2, &pair.qual2);
    }
}

type FastqRecords = fastq::Records<BufReader<Box<dyn Read + Send>>>;

/// Lock-step reader over the two ends of a paired FASTQ data set, with
/// automatic gzip/BGZF detection on each file.
pub struct PairedFastqReader {
    records1: FastqRecords,
    records2: FastqRecords,
    path1: String,
    path2: String,
}

impl PairedFastqReader {
    pub fn open(path1: &str, path2: &str) -> io::Result<Self> {
        let records1 = fastq::Reader::new(open_reader(path1)?).records();
        let records2 = fastq::Reader::new(open_reader(path2)?).records();
        Ok(PairedFastqReader {
            records1,
            records2,
            path1: path1.to_string(),
            path2: path2.to_string(),
        })
    }

    /// Read the next pair into `pair`, reusing its buffers.
    ///
    /// Returns Ok(false) at a clean EOF on both files; a record on one file
    /// without its mate on the other is an error.
    pub fn next_into(&mut self, pair: &mut ReadPair) -> io::Result<bool> {
        let rec1 = self.records1.next();
        let rec2 = self.records2.next();
        match (rec1, rec2) {
            (None, None) => Ok(false),
            (Some(r1), Some(r2)) => {
                let r1 = r1.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                let r2 = r2.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                pair.seq1.clear();
                pair.seq1.extend_from_slice(r1.seq());
                pair.qual1.clear();
                pair.qual1.extend_from_slice(r1.qual());
                pair.seq2.clear();
                pair.seq2.extend_from_slice(r2.seq());
                pair.qual2.clear();
                pair.qual2.extend_from_slice(r2.qual());
                Ok(true)
            }
            (Some(_), None) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: record without a mate in {}", self.path1, self.path2),
            )),
            (None, Some(_)) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: record without a mate in {}", self.path2, self.path1),
            )),
        }
    }
}

/// Length of the first read in a FASTQ file, used to size the scratch
/// matrices before the pipeline starts.
pub fn probe_read_len(path: &str) -> io::Result<Option<usize>> {
    let mut records = fastq::Reader::new(open_reader(path)?).records();
    match records.next() {
        Some(Ok(record)) => Ok(Some(record.seq().len())),
        Some(Err(e)) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_complement_round_trip() {
        let mut bufs = EndBuffers::default();
        bufs.fill(b"ACGTNACGT", b"IIIIIJJJJ");

        // reverse(complement(r)) == reverse_complement(r)
        let mut expect: Vec<u8> = bufs.comp.clone();
        expect.reverse();
        assert_eq!(bufs.rev_comp, expect);
        assert_eq!(bufs.rev_qual, b"JJJJIIIII".to_vec());

        // deriving from the reverse-complement again restores the read
        let rc = bufs.rev_comp.clone();
        let rq = bufs.rev_qual.clone();
        let mut twice = EndBuffers::default();
        twice.fill(&rc, &rq);
        assert_eq!(twice.rev_comp, b"ACGTNACGT".to_vec());
        assert_eq!(twice.rev_qual, b"IIIIIJJJJ".to_vec());
    }

    #[test]
    fn paired_reader_streams_in_lock_step() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = dir.path().join("r1.fq");
        let p2 = dir.path().join("r2.fq");
        std::fs::write(&p1, "@a/1\nACGT\n+\nIIII\n@b/1\nTTTT\n+\nJJJJ\n").unwrap();
        std::fs::write(&p2, "@a/2\nCCCC\n+\nKKKK\n@b/2\nGGGG\n+\nLLLL\n").unwrap();

        let mut reader =
            PairedFastqReader::open(p1.to_str().unwrap(), p2.to_str().unwrap()).unwrap();
        let mut pair = ReadPair::new();

        assert!(reader.next_into(&mut pair).unwrap());
        assert_eq!(pair.seq1, b"ACGT".to_vec());
        assert_eq!(pair.qual2, b"KKKK".to_vec());

        assert!(reader.next_into(&mut pair).unwrap());
        assert_eq!(pair.seq1, b"TTTT".to_vec());
        assert_eq!(pair.seq2, b"GGGG".to_vec());

        assert!(!reader.next_into(&mut pair).unwrap());
        assert_eq!(probe_read_len(p1.to_str().unwrap()).unwrap(), Some(4));
    }

    #[test]
    fn unpaired_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = dir.path().join("r1.fq");
        let p2 = dir.path().join("r2.fq");
        std::fs::write(&p1, "@a/1\nACGT\n+\nIIII\n@b/1\nTTTT\n+\nJJJJ\n").unwrap();
        std::fs::write(&p2, "@a/2\nCCCC\n+\nKKKK\n").unwrap();

        let mut reader =
            PairedFastqReader::open(p1.to_str().unwrap(), p2.to_str().unwrap()).unwrap();
        let mut pair = ReadPair::new();
        assert!(reader.next_into(&mut pair).unwrap());
        assert!(reader.next_into(&mut pair).is_err());
    }
}
