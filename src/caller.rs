// Variant calling: the per-end alignment driver, the Bayesian posterior
// store, and the producer / workers / consumer pipeline that connects them.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::bounded;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::align::{err_prob, find_extensions, AlignScratch, AlignedTriple, AlleleEvent};
use crate::context::Context;
use crate::params::{SearchMode, STD_BASES};
use crate::reads::{EndBuffers, PairedFastqReader, ReadMem, ReadPair};
use crate::seeding::{find_seeds, Seed};
use crate::utils;

// ---------------------------------------------------------------------------
// Posterior store: one categorical distribution over allele strings per
// observed reference position. Owned exclusively by the updater task.
// ---------------------------------------------------------------------------

pub struct PosteriorStore {
    ctx: Arc<Context>,
    calls: HashMap<u32, HashMap<String, f64>>,
}

impl PosteriorStore {
    pub fn new(ctx: Arc<Context>) -> Self {
        PosteriorStore {
            ctx,
            calls: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn posterior(&self, pos: u32) -> Option<&HashMap<String, f64>> {
        self.calls.get(&pos)
    }

    /// Seed the distribution at `pos` from the catalogue priors, or from
    /// the reference base when the locus is uncatalogued.
    fn seed_position(&mut self, pos: u32) {
        if self.calls.contains_key(&pos) {
            return;
        }
        let Some(&ref_base) = self.ctx.genome.seq().get(pos as usize) else {
            return;
        };
        let eps = self.ctx.opt.posterior_floor;
        let mut map = HashMap::new();
        if let Some(site) = self.ctx.variants.site(pos as usize) {
            let floor = site.alleles.len() as f64 * eps;
            for (allele, &freq) in site.alleles.iter().zip(&site.freqs) {
                map.insert(
                    String::from_utf8_lossy(allele).into_owned(),
                    (freq - floor).max(eps),
                );
            }
            map.entry((ref_base as char).to_string()).or_insert(eps);
        } else {
            map.insert((ref_base as char).to_string(), 1.0 - 3.0 * eps);
            for &b in STD_BASES.iter() {
                if b != ref_base {
                    map.entry((b as char).to_string()).or_insert(eps);
                }
            }
        }
        self.calls.insert(pos, map);
    }

    pub fn update(&mut self, event: &AlleleEvent) {
        if event.bases.len() == 1 {
            self.update_substitution(event);
        } else {
            self.update_indel(event);
        }
    }

    /// Bayes step for a single observed base.
    pub fn update_substitution(&mut self, event: &AlleleEvent) {
        let Some(&q) = event.quals.first() else { return };
        let Ok(observed) = std::str::from_utf8(&event.bases) else {
            return;
        };
        let observed = observed.to_string();
        self.seed_position(event.pos);
        let eps = self.ctx.opt.posterior_floor;
        let Some(map) = self.calls.get_mut(&event.pos) else {
            return;
        };
        map.entry(observed.clone()).or_insert(eps);

        let e = err_prob(q);
        let mut weights: Vec<(String, f64)> = Vec::with_capacity(map.len());
        let mut denom = 0.0;
        for (allele, &prior) in map.iter() {
            let likelihood = if *allele == observed { 1.0 - e } else { e / 3.0 };
            let w = prior * likelihood;
            denom += w;
            weights.push((allele.clone(), w));
        }
        if denom <= 0.0 {
            return; // a Q==33 column carries no information
        }
        for (allele, w) in weights {
            map.insert(allele, w / denom);
        }
    }

    /// Bayes step for a multi-base (or empty) observed allele: the
    /// likelihood is the product of the per-base terms.
    pub fn update_indel(&mut self, event: &AlleleEvent) {
        let (observed, quals): (String, &[u8]) = if event.bases.is_empty() {
            (".".to_string(), b"I")
        } else {
            match std::str::from_utf8(&event.bases) {
                Ok(s) => (s.to_string(), &event.quals),
                Err(_) => return,
            }
        };
        self.seed_position(event.pos);
        let eps = self.ctx.opt.posterior_floor;
        let Some(map) = self.calls.get_mut(&event.pos) else {
            return;
        };
        map.entry(observed.clone()).or_insert(eps);

        let mut weights: Vec<(String, f64)> = Vec::with_capacity(map.len());
        let mut denom = 0.0;
        for (allele, &prior) in map.iter() {
            let mut likelihood = 1.0;
            if *allele == observed {
                for &q in quals {
                    likelihood *= 1.0 - err_prob(q);
                }
            } else {
                for &q in quals {
                    likelihood *= err_prob(q) / 3.0;
                }
            }
            let w = prior * likelihood;
            denom += w;
            weights.push((allele.clone(), w));
        }
        if denom <= 0.0 {
            return;
        }
        for (allele, w) in weights {
            map.insert(allele, w / denom);
        }
    }

    /// Write one line per observed position: `pos\tallele\tphred`, sorted
    /// by position. The quality is -10*log10(1 - p_max), printed as the
    /// literal 1000 when the posterior is within epsilon of certainty.
    pub fn write_calls(&self, w: &mut impl Write) -> io::Result<()> {
        let mut positions: Vec<u32> = self.calls.keys().copied().collect();
        positions.sort_unstable();
        for pos in positions {
            let Some(map) = self.calls.get(&pos) else {
                continue;
            };
            let mut best: Option<(&str, f64)> = None;
            for (allele, &p) in map.iter() {
                best = match best {
                    None => Some((allele, p)),
                    Some((ba, bp)) if p > bp || (p == bp && allele.as_str() < ba) => {
                        Some((allele, p))
                    }
                    keep => keep,
                };
            }
            let Some((allele, p)) = best else { continue };
            let qual = -10.0 * (1.0 - p).log10();
            if qual.is_finite() {
                writeln!(w, "{}\t{}\t{:.5}", pos, allele, qual)?;
            } else {
                writeln!(w, "{}\t{}\t1000", pos, allele)?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-end driver.
// ---------------------------------------------------------------------------

/// Reusable per-worker state: DP matrices, candidate-position buffer,
/// event staging and the anchor PRNG. Never shared between workers.
pub struct WorkerScratch {
    scratch: AlignScratch,
    aligned: AlignedTriple,
    positions: Vec<usize>,
    cand_events: Vec<AlleleEvent>,
    rng: StdRng,
}

impl WorkerScratch {
    pub fn new(opt: &crate::params::CallOpt, worker_id: u64) -> Self {
        let rng = match opt.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(worker_id)),
            None => StdRng::from_entropy(),
        };
        WorkerScratch {
            scratch: AlignScratch::new(opt.read_len),
            aligned: AlignedTriple::default(),
            positions: Vec::with_capacity(opt.max_match),
            cand_events: Vec::new(),
            rng,
        }
    }
}

/// Extend every candidate position of one seed and keep the events of the
/// minimum-distance candidate that produced any. Returns true when `out`
/// was filled.
fn best_supported_match(
    ctx: &Context,
    read: &[u8],
    qual: &[u8],
    seed: &Seed,
    ws: &mut WorkerScratch,
    out: &mut Vec<AlleleEvent>,
) -> bool {
    let mut best = f64::INFINITY;
    let mut found = false;
    for k in 0..ws.positions.len() {
        let anchor = ws.positions[k];
        let accepted = find_extensions(
            &mut ws.scratch,
            &mut ws.aligned,
            ctx.genome.seq(),
            &ctx.variants,
            read,
            qual,
            seed,
            anchor,
            &ctx.opt,
            &mut ws.cand_events,
        );
        if let Some(d) = accepted {
            if !ws.cand_events.is_empty() && d < best {
                best = d;
                found = true;
                std::mem::swap(out, &mut ws.cand_events);
            }
        }
    }
    found
}

/// Align one read end: iterate seed anchors, trying the forward read and
/// then its reverse complement, until an accepted alignment yields allele
/// events. `out` holds the winning events (possibly none).
pub fn find_variants_from_end(
    ctx: &Context,
    end: &EndBuffers,
    ws: &mut WorkerScratch,
    out: &mut Vec<AlleleEvent>,
) {
    out.clear();
    let rlen = end.seq.len();
    if rlen == 0 {
        return;
    }
    let mut p = ctx.opt.start_pos.min(rlen - 1);
    for _ in 0..ctx.opt.iter_num {
        let seed = find_seeds(
            &ctx.rev_index,
            ctx.genome.len(),
            &end.seq,
            &end.rev,
            p,
            ctx.opt.max_match,
            &mut ws.positions,
        );
        if let Some(seed) = seed {
            if best_supported_match(ctx, &end.seq, &end.qual, &seed, ws, out) {
                return;
            }
        }
        // the reverse-complement strand reads the reversed qualities
        let seed = find_seeds(
            &ctx.rev_index,
            ctx.genome.len(),
            &end.rev_comp,
            &end.comp,
            p,
            ctx.opt.max_match,
            &mut ws.positions,
        );
        if let Some(seed) = seed {
            if best_supported_match(ctx, &end.rev_comp, &end.rev_qual, &seed, ws, out) {
                return;
            }
        }
        p = match ctx.opt.search_mode {
            SearchMode::Random if rlen > 1 => ws.rng.gen_range(1..rlen),
            SearchMode::Random => 0,
            SearchMode::Deterministic => (p + ctx.opt.search_step.max(1)) % rlen,
        };
    }
}

// ---------------------------------------------------------------------------
// Pipeline.
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct CallStats {
    pub pairs: u64,
    pub pairs_with_calls: u64,
    pub observations: u64,
}

/// Run the full pipeline: one FASTQ producer, N extender workers, one
/// posterior updater, joined by bounded channels. The producer owns a
/// single record buffer; the acknowledgement channel hands it back after a
/// worker has copied the payload, so a record is never overwritten while
/// it is being read.
pub fn call_variants(
    ctx: Arc<Context>,
    reads1: &str,
    reads2: &str,
    output: &str,
) -> io::Result<CallStats> {
    let mut reader = PairedFastqReader::open(reads1, reads2)?;
    let n_workers = ctx.opt.workers.max(1);
    log::info!("calling variants with {} worker(s)", n_workers);

    let (record_tx, record_rx) = bounded::<ReadPair>(n_workers);
    let (ack_tx, ack_rx) = bounded::<ReadPair>(n_workers);
    let (event_tx, event_rx) = bounded::<AlleleEvent>(1024);

    let producer = thread::spawn(move || -> io::Result<u64> {
        let mut pair = ReadPair::new();
        let mut streamed = 0u64;
        loop {
            match reader.next_into(&mut pair) {
                Ok(true) => {}
                Ok(false) => return Ok(streamed),
                Err(e) => {
                    // dropping the record channel lets the workers drain
                    log::error!("read stream failed after {} pairs: {}", streamed, e);
                    return Err(e);
                }
            }
            streamed += 1;
            if streamed % 100_000 == 0 {
                log::info!("streamed {} read pairs", streamed);
            }
            pair = match record_tx.send(pair) {
                Ok(()) => match ack_rx.recv() {
                    Ok(returned) => returned, // the worker copied the payload
                    Err(_) => return Ok(streamed),
                },
                Err(_) => return Ok(streamed), // workers already gone
            };
        }
    });

    let mut workers = Vec::with_capacity(n_workers);
    for wid in 0..n_workers {
        let ctx = Arc::clone(&ctx);
        let record_rx = record_rx.clone();
        let ack_tx = ack_tx.clone();
        let event_tx = event_tx.clone();
        workers.push(thread::spawn(move || -> (u64, u64, u64) {
            let mut mem = ReadMem::new(ctx.opt.read_len);
            let mut ws = WorkerScratch::new(&ctx.opt, wid as u64);
            let mut events = Vec::new();
            let (mut pairs, mut with_calls, mut observations) = (0u64, 0u64, 0u64);
            for record in record_rx.iter() {
                let malformed = record.seq1.len() != record.qual1.len()
                    || record.seq2.len() != record.qual2.len();
                let oversized = record.seq1.len() > ctx.opt.read_len
                    || record.seq2.len() > ctx.opt.read_len;
                if malformed || oversized {
                    log::warn!(
                        "skipping read pair ({})",
                        if malformed {
                            "sequence/quality length mismatch"
                        } else {
                            "longer than the configured read length"
                        }
                    );
                    let _ = ack_tx.send(record);
                    continue;
                }
                mem.copy_from(&record);
                // hand the buffer back before the expensive part
                let _ = ack_tx.send(record);

                pairs += 1;
                let mut any = false;
                for end in [&mem.end1, &mem.end2] {
                    find_variants_from_end(&ctx, end, &mut ws, &mut events);
                    if !events.is_empty() {
                        any = true;
                    }
                    for event in events.drain(..) {
                        observations += 1;
                        if event_tx.send(event).is_err() {
                            return (pairs, with_calls, observations);
                        }
                    }
                }
                if any {
                    with_calls += 1;
                }
            }
            (pairs, with_calls, observations)
        }));
    }
    drop(record_rx);
    drop(ack_tx);
    drop(event_tx);

    let consumer = {
        let ctx = Arc::clone(&ctx);
        thread::spawn(move || {
            let mut store = PosteriorStore::new(ctx);
            for event in event_rx.iter() {
                store.update(&event);
            }
            store
        })
    };

    let mut stats = CallStats::default();
    for handle in workers {
        let (pairs, with_calls, observations) = handle
            .join()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "worker thread panicked"))?;
        stats.pairs += pairs;
        stats.pairs_with_calls += with_calls;
        stats.observations += observations;
    }
    let produced = producer
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "producer thread panicked"))?;
    let store = consumer
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "updater thread panicked"))?;

    // a mid-stream I/O failure aborts after the drain, with no output
    let streamed = produced?;

    let mut writer = BufWriter::new(File::create(output)?);
    store.write_calls(&mut writer)?;
    writer.flush()?;

    log::info!(
        "processed {} of {} read pairs, {} with calls, {} allele observations, {} positions written",
        stats.pairs,
        streamed,
        stats.pairs_with_calls,
        stats.observations,
        store.len()
    );
    utils::log_mem("pipeline complete");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fm_index::FmIndex;
    use crate::genome::Genome;
    use crate::params::CallOpt;
    use crate::variants::VariantCatalogue;

    fn test_context(
        genome: &[u8],
        entries: Vec<(usize, Vec<(Vec<u8>, f64)>)>,
    ) -> Arc<Context> {
        let genome = Genome::from_seq(genome.to_vec());
        let rev_index = FmIndex::build(&genome.reversed()).unwrap();
        let mut opt = CallOpt {
            read_len: genome.len(),
            workers: 1,
            ..CallOpt::default()
        };
        opt.derive_thresholds(None, None);
        Arc::new(Context {
            genome,
            variants: VariantCatalogue::from_entries(entries),
            rev_index,
            opt,
        })
    }

    fn sum(map: &HashMap<String, f64>) -> f64 {
        map.values().sum()
    }

    fn event(pos: u32, bases: &[u8], quals: &[u8]) -> AlleleEvent {
        AlleleEvent {
            pos,
            bases: bases.to_vec(),
            quals: quals.to_vec(),
        }
    }

    #[test]
    fn posterior_sums_to_one_after_every_update() {
        let ctx = test_context(
            b"ACGTACGTACGT",
            vec![(6, vec![(b"T".to_vec(), 0.7), (b"C".to_vec(), 0.3)])],
        );
        let mut store = PosteriorStore::new(ctx);

        store.update(&event(6, b"C", b"I"));
        assert!((sum(store.posterior(6).unwrap()) - 1.0).abs() < 1e-9);

        store.update(&event(2, b"A", b"5"));
        assert!((sum(store.posterior(2).unwrap()) - 1.0).abs() < 1e-9);

        store.update(&event(6, b"CC", b"II"));
        assert!((sum(store.posterior(6).unwrap()) - 1.0).abs() < 1e-9);

        store.update(&event(2, b"", b""));
        assert!((sum(store.posterior(2).unwrap()) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn catalogued_substitution_dominates_after_one_observation() {
        let ctx = test_context(
            b"ACGTACGTACGT",
            vec![(6, vec![(b"T".to_vec(), 0.7), (b"C".to_vec(), 0.3)])],
        );
        let mut store = PosteriorStore::new(ctx);
        store.update(&event(6, b"C", b"I")); // Q40
        let map = store.posterior(6).unwrap();
        assert!(map["C"] > 0.99, "posterior {:?}", map);
    }

    #[test]
    fn uncatalogued_position_seeds_from_the_reference() {
        let ctx = test_context(b"ACGTACGTACGT", vec![]);
        let mut store = PosteriorStore::new(ctx);
        store.update(&event(6, b"C", b"I")); // reference base is G
        let map = store.posterior(6).unwrap();
        assert!(map.contains_key("G") && map.contains_key("C"));
        assert!(map["C"] > map["G"], "posterior {:?}", map);
    }

    #[test]
    fn indel_observation_is_inserted_and_preferred() {
        let ctx = test_context(
            b"ACGTACGT",
            vec![(4, vec![(b"A".to_vec(), 0.6), (b"AA".to_vec(), 0.4)])],
        );
        let mut store = PosteriorStore::new(ctx);
        store.update(&event(4, b"AA", b"II"));
        let map = store.posterior(4).unwrap();
        assert!(map["AA"] > 0.95, "posterior {:?}", map);
    }

    #[test]
    fn updates_commute_within_tolerance() {
        let ctx = test_context(b"ACGTACGTACGT", vec![]);
        let a = event(6, b"C", b"I");
        let b = event(6, b"C", b"5");

        let mut forward = PosteriorStore::new(Arc::clone(&ctx));
        forward.update(&a);
        forward.update(&b);

        let mut backward = PosteriorStore::new(ctx);
        backward.update(&b);
        backward.update(&a);

        let fm = forward.posterior(6).unwrap();
        let bm = backward.posterior(6).unwrap();
        for (allele, p) in fm {
            assert!((p - bm[allele]).abs() < 1e-6, "allele {}", allele);
        }
    }

    #[test]
    fn two_observations_sharpen_the_posterior() {
        let ctx = test_context(b"ACGTACGTACGT", vec![]);
        let mut one = PosteriorStore::new(Arc::clone(&ctx));
        one.update(&event(6, b"C", b"I"));
        let single = one.posterior(6).unwrap()["C"];

        let mut two = PosteriorStore::new(ctx);
        two.update(&event(6, b"C", b"I"));
        two.update(&event(6, b"C", b"I"));
        let double = two.posterior(6).unwrap()["C"];
        assert!(double > single);
    }

    #[test]
    fn call_output_format() {
        let ctx = test_context(b"ACGTACGTACGT", vec![]);
        let mut store = PosteriorStore::new(Arc::clone(&ctx));
        store.update(&event(6, b"C", b"I"));
        store.update(&event(2, b"A", b"I"));

        let mut out = Vec::new();
        store.write_calls(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        // sorted by position, three tab-separated fields
        assert!(lines[0].starts_with("2\t"));
        assert!(lines[1].starts_with("6\tC\t"));
        for line in lines {
            assert_eq!(line.split('\t').count(), 3);
        }
    }

    #[test]
    fn certain_posterior_prints_the_quality_cap() {
        let ctx = test_context(b"ACGT", vec![]);
        let mut store = PosteriorStore::new(ctx);
        // force certainty directly
        store.calls.insert(1, HashMap::from([("C".to_string(), 1.0)]));
        let mut out = Vec::new();
        store.write_calls(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "1\tC\t1000\n");
    }
}
