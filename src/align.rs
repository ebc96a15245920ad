// Variant-aware extension of seed hits.
//
// Each flank of a seed is scored first by a cheap Hamming walk and, where
// that walk gives up, by an affine-gap DP over three cost layers:
// match/mismatch, gap-in-reference and gap-in-read. Costs are negative
// log10 probabilities derived from base qualities. At a catalogued locus
// the DP consumes a whole allele against one reference column; the
// traceback then recovers the observed allele events.

use std::ops::{Index, IndexMut};

use crate::params::CallOpt;
use crate::seeding::Seed;
use crate::variants::VariantCatalogue;

/// Pseudo-infinity that survives additive chains without overflowing.
const BIG: f64 = f32::MAX as f64;

/// One observed allele: reference position, read bases, base qualities.
/// A single base is a substitution; longer strings are indel observations
/// anchored on the base to their left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlleleEvent {
    pub pos: u32,
    pub bases: Vec<u8>,
    pub quals: Vec<u8>,
}

#[inline]
pub fn err_prob(q: u8) -> f64 {
    10f64.powf(-((q as f64) - 33.0) / 10.0)
}

/// Cost of the base being read correctly.
#[inline]
pub fn base_hit_cost(q: u8) -> f64 {
    -(1.0 - err_prob(q)).log10()
}

/// Cost of the base being a miscall of one specific other base.
#[inline]
pub fn base_miss_cost(q: u8) -> f64 {
    -(err_prob(q) / 3.0).log10()
}

/// Cost of matching `read` exactly against a catalogued allele with prior
/// frequency `freq`; infinite on any mismatch.
pub fn known_allele_cost(read: &[u8], allele: &[u8], qual: &[u8], freq: f64) -> f64 {
    let mut cost = 0.0;
    for i in 0..read.len() {
        if read[i] != allele[i] {
            return BIG;
        }
        cost += base_hit_cost(qual[i]);
    }
    cost - freq.log10()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Diag,
    Up,
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Match,
    GapRef,
    GapRead,
}

/// Traceback record for one DP cell: where the step came from, which layer
/// it continues in, and the allele length when a catalogued allele was
/// consumed against this column.
#[derive(Debug, Clone, Copy)]
pub struct TraceStep {
    pub dir: Dir,
    pub src: Layer,
    pub allele_len: Option<u16>,
}

const STEP_UP: Option<TraceStep> = Some(TraceStep {
    dir: Dir::Up,
    src: Layer::GapRef,
    allele_len: None,
});
const STEP_LEFT: Option<TraceStep> = Some(TraceStep {
    dir: Dir::Left,
    src: Layer::GapRead,
    allele_len: None,
});

pub struct Mat<T> {
    data: Vec<T>,
    cols: usize,
}

impl<T: Clone> Mat<T> {
    fn new(rows: usize, cols: usize, v: T) -> Self {
        Mat {
            data: vec![v; rows * cols],
            cols,
        }
    }

    fn reset_region(&mut self, rows: usize, cols: usize, v: T) {
        for i in 0..rows {
            let row = i * self.cols;
            self.data[row..row + cols].fill(v.clone());
        }
    }
}

impl<T> Index<(usize, usize)> for Mat<T> {
    type Output = T;
    #[inline]
    fn index(&self, (i, j): (usize, usize)) -> &T {
        &self.data[i * self.cols + j]
    }
}

impl<T> IndexMut<(usize, usize)> for Mat<T> {
    #[inline]
    fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut T {
        &mut self.data[i * self.cols + j]
    }
}

/// Distance and traceback matrices for one extension direction.
pub struct DpDir {
    m: Mat<f64>,
    gr: Mat<f64>,
    gq: Mat<f64>,
    tb_m: Mat<Option<TraceStep>>,
    tb_gr: Mat<Option<TraceStep>>,
    tb_gq: Mat<Option<TraceStep>>,
}

impl DpDir {
    fn new(dim: usize) -> Self {
        DpDir {
            m: Mat::new(dim, dim, 0.0),
            gr: Mat::new(dim, dim, 0.0),
            gq: Mat::new(dim, dim, 0.0),
            tb_m: Mat::new(dim, dim, None),
            tb_gr: Mat::new(dim, dim, None),
            tb_gq: Mat::new(dim, dim, None),
        }
    }

    /// Clear the traceback region and lay down the DP borders.
    fn prepare(&mut self, m: usize, n: usize, opt: &CallOpt) {
        self.tb_m.reset_region(m + 1, n + 1, None);
        self.tb_gr.reset_region(m + 1, n + 1, None);
        self.tb_gq.reset_region(m + 1, n + 1, None);

        self.m[(0, 0)] = 0.0;
        self.gr[(0, 0)] = BIG;
        self.gq[(0, 0)] = BIG;
        for i in 1..=m {
            self.m[(i, 0)] = BIG;
            self.gq[(i, 0)] = BIG;
        }
        self.gr[(1, 0)] = opt.gap_open_cost;
        self.tb_gr[(1, 0)] = STEP_UP;
        for i in 2..=m {
            self.gr[(i, 0)] = opt.gap_ext_cost;
            self.tb_gr[(i, 0)] = STEP_UP;
        }
        for j in 1..=n {
            self.m[(0, j)] = BIG;
            self.gr[(0, j)] = BIG;
            self.gq[(0, j)] = 0.0;
            self.tb_gq[(0, j)] = STEP_LEFT;
        }
    }

    /// Minimum over the three layers at (m, n).
    fn bottom(&self, m: usize, n: usize) -> (f64, Layer) {
        let mut dp = self.m[(m, n)];
        let mut layer = Layer::Match;
        if self.gr[(m, n)] < dp {
            dp = self.gr[(m, n)];
            layer = Layer::GapRef;
        }
        if self.gq[(m, n)] < dp {
            dp = self.gq[(m, n)];
            layer = Layer::GapRead;
        }
        (dp, layer)
    }
}

/// Per-worker scratch: both directions' matrices, allocated once at
/// (2R+1) x (2R+1) and reused for every read.
pub struct AlignScratch {
    bw: DpDir,
    fw: DpDir,
}

impl AlignScratch {
    pub fn new(read_len: usize) -> Self {
        let dim = 2 * read_len + 1;
        AlignScratch {
            bw: DpDir::new(dim),
            fw: DpDir::new(dim),
        }
    }
}

/// Outcome of scoring one flank: the fast-path cost, the DP minimum (zero
/// when the fast path consumed everything), the layer the DP bottomed out
/// in, and the unconsumed prefix/suffix sizes handed to the DP.
struct FlankScore {
    ham: f64,
    dp: f64,
    layer: Option<Layer>,
    m: usize,
    n: usize,
}

// ---------------------------------------------------------------------------
// Backward direction: the left flank, consumed right-to-left.
// ---------------------------------------------------------------------------

/// Fast Hamming walk over the left flank, right-to-left. Returns the
/// accumulated cost, the unconsumed prefix sizes and whether the cost
/// already exceeds the acceptance threshold.
fn backward_hamming(
    cat: &VariantCatalogue,
    read: &[u8],
    qual: &[u8],
    rf: &[u8],
    pos: usize,
    opt: &CallOpt,
    events: &mut Vec<AlleleEvent>,
) -> (f64, usize, usize, bool) {
    let mut m = read.len();
    let mut n = rf.len();
    let mut cost = 0.0;

    while m > 0 && n > 0 {
        let col = pos + n - 1;
        match cat.site(col) {
            None => {
                if read[m - 1] != rf[n - 1] {
                    events.push(AlleleEvent {
                        pos: col as u32,
                        bases: vec![read[m - 1]],
                        quals: vec![qual[m - 1]],
                    });
                    cost += opt.sub_cost + base_miss_cost(qual[m - 1]);
                    m -= 1;
                    n -= 1;
                    break;
                }
                m -= 1;
                n -= 1;
            }
            Some(site) if site.same_len.is_some() => {
                let mut best = BIG;
                let mut best_len = 0usize;
                for (allele, &freq) in site.alleles.iter().zip(&site.freqs) {
                    if allele.len() <= m {
                        let c = known_allele_cost(
                            &read[m - allele.len()..m],
                            allele,
                            &qual[m - allele.len()..m],
                            freq,
                        );
                        if c < best {
                            best = c;
                            best_len = allele.len();
                        }
                    }
                }
                if best >= BIG {
                    break;
                }
                cost += best;
                events.push(AlleleEvent {
                    pos: col as u32,
                    bases: read[m - best_len..m].to_vec(),
                    quals: qual[m - best_len..m].to_vec(),
                });
                m -= best_len;
                n -= 1;
            }
            Some(_) => break, // indel locus: only the DP can spend a gap here
        }
        if cost > opt.prob_thres {
            return (cost, m, n, true);
        }
    }
    (cost, m, n, false)
}

/// Affine-gap DP over the prefixes read[..m] / rf[..n], with whole-allele
/// transitions at catalogued columns. `pos` is the absolute offset of rf[0].
fn backward_dp(
    dir: &mut DpDir,
    cat: &VariantCatalogue,
    read: &[u8],
    qual: &[u8],
    rf: &[u8],
    m: usize,
    n: usize,
    pos: usize,
    opt: &CallOpt,
) -> (f64, Layer) {
    dir.prepare(m, n, opt);

    for i in 1..=m {
        let q = qual[i - 1];
        let hit = base_hit_cost(q);
        let miss = opt.sub_cost + base_miss_cost(q);
        let open = opt.gap_open_cost + hit;
        let ext = opt.gap_ext_cost + hit;
        for j in 1..=n {
            match cat.site(pos + j - 1) {
                None => {
                    let sub = if read[i - 1] == rf[j - 1] { hit } else { miss };

                    let mut best = dir.m[(i - 1, j - 1)] + sub;
                    let mut src = Layer::Match;
                    if dir.gr[(i - 1, j - 1)] + sub < best {
                        best = dir.gr[(i - 1, j - 1)] + sub;
                        src = Layer::GapRef;
                    }
                    if dir.gq[(i - 1, j - 1)] + sub < best {
                        best = dir.gq[(i - 1, j - 1)] + sub;
                        src = Layer::GapRead;
                    }
                    dir.m[(i, j)] = best;
                    dir.tb_m[(i, j)] = Some(TraceStep {
                        dir: Dir::Diag,
                        src,
                        allele_len: None,
                    });

                    let mut best = dir.m[(i - 1, j)] + open;
                    let mut src = Layer::Match;
                    if dir.gr[(i - 1, j)] + ext < best {
                        best = dir.gr[(i - 1, j)] + ext;
                        src = Layer::GapRef;
                    }
                    dir.gr[(i, j)] = best;
                    dir.tb_gr[(i, j)] = Some(TraceStep {
                        dir: Dir::Up,
                        src,
                        allele_len: None,
                    });

                    let mut best = dir.m[(i, j - 1)] + opt.gap_open_cost;
                    let mut src = Layer::Match;
                    if dir.gq[(i, j - 1)] + opt.gap_ext_cost < best {
                        best = dir.gq[(i, j - 1)] + opt.gap_ext_cost;
                        src = Layer::GapRead;
                    }
                    dir.gq[(i, j)] = best;
                    dir.tb_gq[(i, j)] = Some(TraceStep {
                        dir: Dir::Left,
                        src,
                        allele_len: None,
                    });
                }
                Some(site) => {
                    dir.m[(i, j)] = BIG;
                    dir.gr[(i, j)] = BIG;
                    dir.gq[(i, j)] = BIG;
                    let mut best = BIG;
                    let mut chosen: Option<(usize, Layer)> = None;
                    for (allele, &freq) in site.alleles.iter().zip(&site.freqs) {
                        let alen = allele.len();
                        if alen > i {
                            continue;
                        }
                        let c =
                            known_allele_cost(&read[i - alen..i], allele, &qual[i - alen..i], freq);
                        if dir.m[(i - alen, j - 1)] + c < best {
                            best = dir.m[(i - alen, j - 1)] + c;
                            chosen = Some((alen, Layer::Match));
                        }
                        if dir.gr[(i - alen, j - 1)] + c < best {
                            best = dir.gr[(i - alen, j - 1)] + c;
                            chosen = Some((alen, Layer::GapRef));
                        }
                        if dir.gq[(i - alen, j - 1)] + c < best {
                            best = dir.gq[(i - alen, j - 1)] + c;
                            chosen = Some((alen, Layer::GapRead));
                        }
                    }
                    if let Some((alen, src)) = chosen {
                        dir.m[(i, j)] = best;
                        dir.tb_m[(i, j)] = Some(TraceStep {
                            dir: Dir::Diag,
                            src,
                            allele_len: Some(alen as u16),
                        });
                    }
                }
            }
        }
    }
    dir.bottom(m, n)
}

fn backward_flank(
    dir: &mut DpDir,
    cat: &VariantCatalogue,
    read: &[u8],
    qual: &[u8],
    rf: &[u8],
    pos: usize,
    opt: &CallOpt,
    events: &mut Vec<AlleleEvent>,
) -> FlankScore {
    let (ham, m, n, over) = backward_hamming(cat, read, qual, rf, pos, opt, events);
    if over {
        return FlankScore {
            ham: opt.prob_thres + 1.0,
            dp: 0.0,
            layer: None,
            m,
            n,
        };
    }
    if m == 0 || n == 0 {
        return FlankScore {
            ham,
            dp: 0.0,
            layer: None,
            m,
            n,
        };
    }
    let (dp, layer) = backward_dp(dir, cat, read, qual, rf, m, n, pos, opt);
    FlankScore {
        ham,
        dp,
        layer: Some(layer),
        m,
        n,
    }
}

/// Recover allele events from the backward DP. Walks the traceback from
/// (m, n), rebuilding the aligned triple, then scans it for gap runs.
#[allow(clippy::too_many_arguments)]
fn backward_traceback(
    dir: &DpDir,
    cat: &VariantCatalogue,
    read: &[u8],
    qual: &[u8],
    rf: &[u8],
    m: usize,
    n: usize,
    pos: usize,
    start_layer: Layer,
    aligned: &mut AlignedTriple,
    events: &mut Vec<AlleleEvent>,
) {
    aligned.clear();
    let mut layer = start_layer;
    let (mut i, mut j) = (m, n);

    while i > 0 || j > 0 {
        let at_variant = j > 0 && cat.site(pos + j - 1).is_some();
        if !at_variant {
            match layer {
                Layer::Match => {
                    if read[i - 1] != rf[j - 1] {
                        events.push(AlleleEvent {
                            pos: (pos + j - 1) as u32,
                            bases: vec![read[i - 1]],
                            quals: vec![qual[i - 1]],
                        });
                    }
                    aligned.push(read[i - 1], qual[i - 1], rf[j - 1]);
                    let Some(step) = dir.tb_m[(i, j)] else { break };
                    layer = step.src;
                    i -= 1;
                    j -= 1;
                }
                Layer::GapRef => {
                    aligned.push(read[i - 1], qual[i - 1], b'-');
                    let Some(step) = dir.tb_gr[(i, j)] else { break };
                    layer = step.src;
                    i -= 1;
                }
                Layer::GapRead => {
                    aligned.push(b'-', b'-', rf[j - 1]);
                    let Some(step) = dir.tb_gq[(i, j)] else { break };
                    layer = step.src;
                    j -= 1;
                }
            }
        } else {
            match dir.tb_m[(i, j)] {
                Some(step) if step.allele_len.is_some() && layer == Layer::Match => {
                    let alen = step.allele_len.map(usize::from).unwrap_or(1);
                    events.push(AlleleEvent {
                        pos: (pos + j - 1) as u32,
                        bases: read[i - alen..i].to_vec(),
                        quals: qual[i - alen..i].to_vec(),
                    });
                    for k in 0..alen - 1 {
                        aligned.push(read[i - 1 - k], qual[i - 1 - k], b'+');
                    }
                    aligned.push(read[i - alen], qual[i - alen], rf[j - 1]);
                    layer = step.src;
                    i -= alen;
                    j -= 1;
                }
                _ => {
                    // no allele fit this column; spend a gap-in-read step
                    aligned.push(b'-', b'-', rf[j - 1]);
                    let Some(step) = dir.tb_gq[(i, j)] else { break };
                    layer = step.src;
                    j -= 1;
                }
            }
        }
    }

    aligned.reverse();
    gap_run_events(aligned, pos, events);
}

// ---------------------------------------------------------------------------
// Forward direction: the right flank, consumed left-to-right. The DP cell
// (i, j) covers the last i read characters against the last j reference
// characters of the unconsumed suffixes; extending a cell consumes leftward
// through the suffix.
// ---------------------------------------------------------------------------

fn forward_hamming(
    cat: &VariantCatalogue,
    read: &[u8],
    qual: &[u8],
    rf: &[u8],
    pos: usize,
    opt: &CallOpt,
    events: &mut Vec<AlleleEvent>,
) -> (f64, usize, usize, bool) {
    let rm = read.len();
    let rn = rf.len();
    let mut m = rm;
    let mut n = rn;
    let mut cost = 0.0;

    while m > 0 && n > 0 {
        let col = pos + rn - n;
        match cat.site(col) {
            None => {
                if read[rm - m] != rf[rn - n] {
                    events.push(AlleleEvent {
                        pos: col as u32,
                        bases: vec![read[rm - m]],
                        quals: vec![qual[rm - m]],
                    });
                    cost += opt.sub_cost + base_miss_cost(qual[rm - m]);
                    m -= 1;
                    n -= 1;
                    break;
                }
                m -= 1;
                n -= 1;
            }
            Some(site) if site.same_len.is_some() => {
                let mut best = BIG;
                let mut best_len = 0usize;
                for (allele, &freq) in site.alleles.iter().zip(&site.freqs) {
                    if allele.len() <= m {
                        let c = known_allele_cost(
                            &read[rm - m..rm - m + allele.len()],
                            allele,
                            &qual[rm - m..rm - m + allele.len()],
                            freq,
                        );
                        if c < best {
                            best = c;
                            best_len = allele.len();
                        }
                    }
                }
                if best >= BIG {
                    break;
                }
                cost += best;
                events.push(AlleleEvent {
                    pos: col as u32,
                    bases: read[rm - m..rm - m + best_len].to_vec(),
                    quals: qual[rm - m..rm - m + best_len].to_vec(),
                });
                m -= best_len;
                n -= 1;
            }
            Some(_) => break,
        }
        if cost > opt.prob_thres {
            return (cost, m, n, true);
        }
    }
    (cost, m, n, false)
}

#[allow(clippy::too_many_arguments)]
fn forward_dp(
    dir: &mut DpDir,
    cat: &VariantCatalogue,
    read: &[u8],
    qual: &[u8],
    rf: &[u8],
    m: usize,
    n: usize,
    pos: usize,
    opt: &CallOpt,
) -> (f64, Layer) {
    let rm = read.len();
    let rn = rf.len();
    dir.prepare(m, n, opt);

    for i in 1..=m {
        let q = qual[rm - i];
        let hit = base_hit_cost(q);
        let miss = opt.sub_cost + base_miss_cost(q);
        let open = opt.gap_open_cost + hit;
        let ext = opt.gap_ext_cost + hit;
        for j in 1..=n {
            match cat.site(pos + rn - j) {
                None => {
                    let sub = if read[rm - i] == rf[rn - j] { hit } else { miss };

                    let mut best = dir.m[(i - 1, j - 1)] + sub;
                    let mut src = Layer::Match;
                    if dir.gr[(i - 1, j - 1)] + sub < best {
                        best = dir.gr[(i - 1, j - 1)] + sub;
                        src = Layer::GapRef;
                    }
                    if dir.gq[(i - 1, j - 1)] + sub < best {
                        best = dir.gq[(i - 1, j - 1)] + sub;
                        src = Layer::GapRead;
                    }
                    dir.m[(i, j)] = best;
                    dir.tb_m[(i, j)] = Some(TraceStep {
                        dir: Dir::Diag,
                        src,
                        allele_len: None,
                    });

                    let mut best = dir.m[(i - 1, j)] + open;
                    let mut src = Layer::Match;
                    if dir.gr[(i - 1, j)] + ext < best {
                        best = dir.gr[(i - 1, j)] + ext;
                        src = Layer::GapRef;
                    }
                    dir.gr[(i, j)] = best;
                    dir.tb_gr[(i, j)] = Some(TraceStep {
                        dir: Dir::Up,
                        src,
                        allele_len: None,
                    });

                    let mut best = dir.m[(i, j - 1)] + opt.gap_open_cost;
                    let mut src = Layer::Match;
                    if dir.gq[(i, j - 1)] + opt.gap_ext_cost < best {
                        best = dir.gq[(i, j - 1)] + opt.gap_ext_cost;
                        src = Layer::GapRead;
                    }
                    dir.gq[(i, j)] = best;
                    dir.tb_gq[(i, j)] = Some(TraceStep {
                        dir: Dir::Left,
                        src,
                        allele_len: None,
                    });
                }
                Some(site) => {
                    dir.m[(i, j)] = BIG;
                    dir.gq[(i, j)] = BIG;
                    let mut best = BIG;
                    let mut chosen: Option<(usize, Layer)> = None;
                    for (allele, &freq) in site.alleles.iter().zip(&site.freqs) {
                        let alen = allele.len();
                        if alen > i {
                            continue;
                        }
                        let c = known_allele_cost(
                            &read[rm - i..rm - i + alen],
                            allele,
                            &qual[rm - i..rm - i + alen],
                            freq,
                        );
                        if dir.m[(i - alen, j - 1)] + c < best {
                            best = dir.m[(i - alen, j - 1)] + c;
                            chosen = Some((alen, Layer::Match));
                        }
                        if dir.gq[(i - alen, j - 1)] + c < best {
                            best = dir.gq[(i - alen, j - 1)] + c;
                            chosen = Some((alen, Layer::GapRead));
                        }
                    }
                    if let Some((alen, src)) = chosen {
                        dir.m[(i, j)] = best;
                        dir.tb_m[(i, j)] = Some(TraceStep {
                            dir: Dir::Diag,
                            src,
                            allele_len: Some(alen as u16),
                        });
                    }
                    // a gap in the reference can still pass through the column
                    let mut best = dir.m[(i - 1, j)] + open;
                    let mut src = Layer::Match;
                    if dir.gr[(i - 1, j)] + ext < best {
                        best = dir.gr[(i - 1, j)] + ext;
                        src = Layer::GapRef;
                    }
                    dir.gr[(i, j)] = best;
                    dir.tb_gr[(i, j)] = Some(TraceStep {
                        dir: Dir::Up,
                        src,
                        allele_len: None,
                    });
                }
            }
        }
    }
    dir.bottom(m, n)
}

fn forward_flank(
    dir: &mut DpDir,
    cat: &VariantCatalogue,
    read: &[u8],
    qual: &[u8],
    rf: &[u8],
    pos: usize,
    opt: &CallOpt,
    events: &mut Vec<AlleleEvent>,
) -> FlankScore {
    let (ham, m, n, over) = forward_hamming(cat, read, qual, rf, pos, opt, events);
    if over {
        return FlankScore {
            ham: opt.prob_thres + 1.0,
            dp: 0.0,
            layer: None,
            m,
            n,
        };
    }
    if m == 0 || n == 0 {
        return FlankScore {
            ham,
            dp: 0.0,
            layer: None,
            m,
            n,
        };
    }
    let (dp, layer) = forward_dp(dir, cat, read, qual, rf, m, n, pos, opt);
    FlankScore {
        ham,
        dp,
        layer: Some(layer),
        m,
        n,
    }
}

#[allow(clippy::too_many_arguments)]
fn forward_traceback(
    dir: &DpDir,
    cat: &VariantCatalogue,
    read: &[u8],
    qual: &[u8],
    rf: &[u8],
    m: usize,
    n: usize,
    pos: usize,
    start_layer: Layer,
    aligned: &mut AlignedTriple,
    events: &mut Vec<AlleleEvent>,
) {
    aligned.clear();
    let rm = read.len();
    let rn = rf.len();
    let mut layer = start_layer;
    let (mut i, mut j) = (m, n);

    while i > 0 || j > 0 {
        let at_variant = j > 0 && cat.site(pos + rn - j).is_some();
        if !at_variant {
            match layer {
                Layer::Match => {
                    if read[rm - i] != rf[rn - j] {
                        events.push(AlleleEvent {
                            pos: (pos + rn - j) as u32,
                            bases: vec![read[rm - i]],
                            quals: vec![qual[rm - i]],
                        });
                    }
                    aligned.push(read[rm - i], qual[rm - i], rf[rn - j]);
                    let Some(step) = dir.tb_m[(i, j)] else { break };
                    layer = step.src;
                    i -= 1;
                    j -= 1;
                }
                Layer::GapRef => {
                    aligned.push(read[rm - i], qual[rm - i], b'-');
                    let Some(step) = dir.tb_gr[(i, j)] else { break };
                    layer = step.src;
                    i -= 1;
                }
                Layer::GapRead => {
                    aligned.push(b'-', b'-', rf[rn - j]);
                    let Some(step) = dir.tb_gq[(i, j)] else { break };
                    layer = step.src;
                    j -= 1;
                }
            }
        } else {
            match layer {
                Layer::Match => match dir.tb_m[(i, j)] {
                    Some(step) if step.allele_len.is_some() => {
                        let alen = step.allele_len.map(usize::from).unwrap_or(1);
                        events.push(AlleleEvent {
                            pos: (pos + rn - j) as u32,
                            bases: read[rm - i..rm - i + alen].to_vec(),
                            quals: qual[rm - i..rm - i + alen].to_vec(),
                        });
                        aligned.push(read[rm - i], qual[rm - i], rf[rn - j]);
                        for k in 1..alen {
                            aligned.push(read[rm - i + k], qual[rm - i + k], b'+');
                        }
                        layer = step.src;
                        i -= alen;
                        j -= 1;
                    }
                    _ => {
                        aligned.push(b'-', b'-', rf[rn - j]);
                        let Some(step) = dir.tb_gq[(i, j)] else { break };
                        layer = step.src;
                        j -= 1;
                    }
                },
                Layer::GapRef => {
                    aligned.push(read[rm - i], qual[rm - i], b'-');
                    let Some(step) = dir.tb_gr[(i, j)] else { break };
                    layer = step.src;
                    i -= 1;
                }
                Layer::GapRead => {
                    aligned.push(b'-', b'-', rf[rn - j]);
                    let Some(step) = dir.tb_gq[(i, j)] else { break };
                    layer = step.src;
                    j -= 1;
                }
            }
        }
    }

    // the forward walk already emitted columns left-to-right
    gap_run_events(aligned, pos + rn - n, events);
}

// ---------------------------------------------------------------------------
// Gap-run recovery shared by both tracebacks.
// ---------------------------------------------------------------------------

/// Reusable aligned read/qual/reference triple built by a traceback.
#[derive(Debug, Default)]
pub struct AlignedTriple {
    read: Vec<u8>,
    qual: Vec<u8>,
    rf: Vec<u8>,
}

impl AlignedTriple {
    fn clear(&mut self) {
        self.read.clear();
        self.qual.clear();
        self.rf.clear();
    }

    fn push(&mut self, r: u8, q: u8, f: u8) {
        self.read.push(r);
        self.qual.push(q);
        self.rf.push(f);
    }

    fn reverse(&mut self) {
        self.read.reverse();
        self.qual.reverse();
        self.rf.reverse();
    }

    fn len(&self) -> usize {
        self.read.len()
    }
}

#[inline]
fn is_ref_base(b: u8) -> bool {
    b != b'-' && b != b'+'
}

/// Scan an aligned triple (left-to-right orientation) for gap runs and emit
/// the indel events, anchored on the base immediately left of each run.
/// `flank_start` is the absolute reference offset of the first reference
/// character in the triple. Runs with no anchored base to their left are
/// dropped. Deletion events carry only the anchor base's quality.
fn gap_run_events(aligned: &AlignedTriple, flank_start: usize, events: &mut Vec<AlleleEvent>) {
    let len = aligned.len();
    let mut ref_consumed = 0usize;
    let mut i = 0usize;

    // leading gap columns have no left anchor
    while i < len {
        if aligned.read[i] == b'-' && is_ref_base(aligned.rf[i]) {
            ref_consumed += 1;
            i += 1;
        } else if aligned.read[i] != b'-' && aligned.rf[i] == b'-' {
            i += 1;
        } else {
            break;
        }
    }

    while i < len {
        if aligned.rf[i] == b'-' {
            // insertion relative to the reference
            let anchored =
                i >= 1 && aligned.read[i - 1] != b'-' && is_ref_base(aligned.rf[i - 1]);
            let mut bases = Vec::new();
            let mut quals = Vec::new();
            if anchored {
                bases.push(aligned.read[i - 1]);
                quals.push(aligned.qual[i - 1]);
            }
            let mut j = i;
            while j < len && aligned.rf[j] == b'-' {
                bases.push(aligned.read[j]);
                quals.push(aligned.qual[j]);
                j += 1;
            }
            if anchored {
                events.push(AlleleEvent {
                    pos: (flank_start + ref_consumed - 1) as u32,
                    bases,
                    quals,
                });
            }
            i = j;
        } else if aligned.read[i] == b'-' {
            // deletion relative to the reference
            let anchored =
                i >= 1 && aligned.read[i - 1] != b'-' && is_ref_base(aligned.rf[i - 1]);
            let anchor_pos = if anchored {
                Some(flank_start + ref_consumed - 1)
            } else {
                None
            };
            let mut bases = Vec::new();
            let mut quals = Vec::new();
            if anchored {
                bases.push(aligned.rf[i - 1]);
                quals.push(aligned.qual[i - 1]);
            }
            let mut j = i;
            while j < len && aligned.read[j] == b'-' {
                bases.push(aligned.rf[j]);
                ref_consumed += 1;
                j += 1;
            }
            if let Some(pos) = anchor_pos {
                events.push(AlleleEvent {
                    pos: pos as u32,
                    bases,
                    quals,
                });
            }
            i = j;
        } else {
            if is_ref_base(aligned.rf[i]) {
                ref_consumed += 1;
            }
            i += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Whole-seed extension.
// ---------------------------------------------------------------------------

fn count_indel_loci(cat: &VariantCatalogue, from: usize, to: usize) -> usize {
    (from..to).filter(|&p| cat.is_indel_locus(p)).count()
}

/// Extend a seed hit at `anchor` (forward offset of the seed's left
/// endpoint) over both flanks.
///
/// Returns the total distance when it passes the acceptance threshold,
/// with all observed allele events (fast-path and traceback) collected in
/// `events`; None when the alignment is rejected, in which case the
/// `events` contents are meaningless.
#[allow(clippy::too_many_arguments)]
pub fn find_extensions(
    scratch: &mut AlignScratch,
    aligned: &mut AlignedTriple,
    genome: &[u8],
    cat: &VariantCatalogue,
    read: &[u8],
    qual: &[u8],
    seed: &Seed,
    anchor: usize,
    opt: &CallOpt,
    events: &mut Vec<AlleleEvent>,
) -> Option<f64> {
    events.clear();
    let glen = genome.len();
    let seed_len = seed.len();

    // Reference flanks get one extra base per indel locus in their span,
    // then are clipped to the genome.
    let left_span_start = anchor.saturating_sub(seed.left);
    let left_extra = count_indel_loci(cat, left_span_start, anchor);
    let left_start = anchor.saturating_sub(seed.left + left_extra);
    let ref_left = &genome[left_start..anchor];

    let right_start = anchor + seed_len;
    let right_span = read.len() - seed.right - 1;
    let right_extra = count_indel_loci(cat, right_start, (right_start + right_span).min(glen));
    let right_end = (right_start + right_span + right_extra).min(glen);
    let ref_right = &genome[right_start..right_end];

    let read_left = &read[..seed.left];
    let qual_left = &qual[..seed.left];
    let read_right = &read[seed.right + 1..];
    let qual_right = &qual[seed.right + 1..];

    let bw = backward_flank(
        &mut scratch.bw,
        cat,
        read_left,
        qual_left,
        ref_left,
        left_start,
        opt,
        events,
    );
    let fw = forward_flank(
        &mut scratch.fw,
        cat,
        read_right,
        qual_right,
        ref_right,
        right_start,
        opt,
        events,
    );

    let total = bw.ham + bw.dp + fw.ham + fw.dp;
    if total > opt.prob_thres {
        return None;
    }

    if let Some(layer) = bw.layer {
        backward_traceback(
            &scratch.bw,
            cat,
            read_left,
            qual_left,
            ref_left,
            bw.m,
            bw.n,
            left_start,
            layer,
            aligned,
            events,
        );
    }
    if let Some(layer) = fw.layer {
        forward_traceback(
            &scratch.fw,
            cat,
            read_right,
            qual_right,
            ref_right,
            fw.m,
            fw.n,
            right_start,
            layer,
            aligned,
            events,
        );
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variants::VariantCatalogue;

    fn opt_with_thres(read_len: usize, dist: usize) -> CallOpt {
        let mut opt = CallOpt {
            read_len,
            ..CallOpt::default()
        };
        opt.derive_thresholds(Some(dist), None);
        opt
    }

    fn extend(
        genome: &[u8],
        cat: &VariantCatalogue,
        read: &[u8],
        qual: &[u8],
        seed: Seed,
        anchor: usize,
        opt: &CallOpt,
    ) -> Option<(f64, Vec<AlleleEvent>)> {
        let mut scratch = AlignScratch::new(opt.read_len);
        let mut aligned = AlignedTriple::default();
        let mut events = Vec::new();
        find_extensions(
            &mut scratch,
            &mut aligned,
            genome,
            cat,
            read,
            qual,
            &seed,
            anchor,
            opt,
            &mut events,
        )
        .map(|d| (d, events))
    }

    #[test]
    fn known_allele_cost_requires_exact_match() {
        let c = known_allele_cost(b"AC", b"AC", b"II", 0.5);
        assert!(c > 0.0 && c < 1.0, "cost {}", c);
        assert!(known_allele_cost(b"AC", b"AG", b"II", 0.5) >= BIG);
    }

    #[test]
    fn exact_read_yields_zero_events() {
        let genome = b"ACGTACGTACGT";
        let cat = VariantCatalogue::empty();
        let read = b"ACGTACGTACGT";
        let qual = vec![b'I'; read.len()];
        let opt = opt_with_thres(read.len(), 2);
        let (d, events) = extend(
            genome,
            &cat,
            read,
            &qual,
            Seed { left: 0, right: 5 },
            0,
            &opt,
        )
        .expect("accepted");
        assert!(d < 0.01, "distance {}", d);
        assert!(events.is_empty());
    }

    #[test]
    fn single_mismatch_is_one_substitution_event() {
        let genome = b"ACGTACGTACGT";
        let cat = VariantCatalogue::empty();
        let read = b"ACGTACCTACGT"; // G->C at reference offset 6
        let qual = vec![b'I'; read.len()];
        let opt = opt_with_thres(read.len(), 2);
        let (d, events) = extend(
            genome,
            &cat,
            read,
            &qual,
            Seed { left: 0, right: 5 },
            0,
            &opt,
        )
        .expect("accepted");
        assert!(d > 9.0 && d < opt.prob_thres, "distance {}", d);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pos, 6);
        assert_eq!(events[0].bases, b"C".to_vec());
        assert_eq!(events[0].quals, b"I".to_vec());
    }

    #[test]
    fn catalogued_substitution_is_cheap() {
        let genome = b"ACGTACGTACGT";
        let cat = VariantCatalogue::from_entries(vec![(
            6,
            vec![(b"T".to_vec(), 0.7), (b"C".to_vec(), 0.3)],
        )]);
        let read = b"ACGTACCTACGT";
        let qual = vec![b'I'; read.len()];
        let opt = opt_with_thres(read.len(), 2);
        let (d, events) = extend(
            genome,
            &cat,
            read,
            &qual,
            Seed { left: 0, right: 5 },
            0,
            &opt,
        )
        .expect("accepted");
        assert!(d < 1.0, "distance {}", d);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pos, 6);
        assert_eq!(events[0].bases, b"C".to_vec());
    }

    #[test]
    fn catalogued_insertion_consumes_whole_allele() {
        let genome = b"ACGTACGT";
        let cat = VariantCatalogue::from_entries(vec![(
            4,
            vec![(b"A".to_vec(), 0.6), (b"AA".to_vec(), 0.4)],
        )]);
        let read = b"ACGTAACGT";
        let qual = vec![b'I'; read.len()];
        let opt = opt_with_thres(read.len(), 1);
        // seed CGT at read [6..=8], anchored at reference 5
        let (d, events) = extend(
            genome,
            &cat,
            read,
            &qual,
            Seed { left: 6, right: 8 },
            5,
            &opt,
        )
        .expect("accepted");
        assert!(d < 1.0, "distance {}", d);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pos, 4);
        assert_eq!(events[0].bases, b"AA".to_vec());
        assert_eq!(events[0].quals, b"II".to_vec());
    }

    #[test]
    fn distance_threshold_is_monotone() {
        let genome = b"ACGTACGTACGT";
        let cat = VariantCatalogue::empty();
        let read = b"ACGTACCTACGT";
        let qual = vec![b'I'; read.len()];
        let seed = Seed { left: 0, right: 5 };

        let opt = opt_with_thres(read.len(), 2);
        let (d, events) = extend(genome, &cat, read, &qual, seed, 0, &opt).expect("accepted");

        // strictly tighter threshold rejects
        let mut tight = opt.clone();
        tight.prob_thres = d - 1e-9;
        assert!(extend(genome, &cat, read, &qual, seed, 0, &tight).is_none());

        // threshold at the observed distance accepts with the same events
        let mut exact = opt.clone();
        exact.prob_thres = d;
        let (d2, events2) = extend(genome, &cat, read, &qual, seed, 0, &exact).expect("accepted");
        assert!((d - d2).abs() < 1e-12);
        assert_eq!(events, events2);
    }

    // With no catalogued loci the DP must behave as a plain quality-weighted
    // affine edit distance; compare against an independent implementation.
    #[test]
    fn empty_catalogue_dp_reduces_to_standard_edit_dp() {
        fn reference_dp(read: &[u8], rf: &[u8], q: u8, opt: &CallOpt) -> f64 {
            let (m, n) = (read.len(), rf.len());
            let hit = base_hit_cost(q);
            let miss = opt.sub_cost + base_miss_cost(q);
            let inf = f32::MAX as f64;
            let mut d = vec![vec![inf; n + 1]; m + 1];
            let mut gr = vec![vec![inf; n + 1]; m + 1];
            let mut gq = vec![vec![inf; n + 1]; m + 1];
            d[0][0] = 0.0;
            if m >= 1 {
                gr[1][0] = opt.gap_open_cost;
            }
            for i in 2..=m {
                gr[i][0] = opt.gap_ext_cost;
            }
            for j in 1..=n {
                gq[0][j] = 0.0;
            }
            for i in 1..=m {
                for j in 1..=n {
                    let sub = if read[i - 1] == rf[j - 1] { hit } else { miss };
                    d[i][j] =
                        (d[i - 1][j - 1].min(gr[i - 1][j - 1]).min(gq[i - 1][j - 1])) + sub;
                    gr[i][j] = (d[i - 1][j] + opt.gap_open_cost + hit)
                        .min(gr[i - 1][j] + opt.gap_ext_cost + hit);
                    gq[i][j] =
                        (d[i][j - 1] + opt.gap_open_cost).min(gq[i][j - 1] + opt.gap_ext_cost);
                }
            }
            d[m][n].min(gr[m][n]).min(gq[m][n])
        }

        let cat = VariantCatalogue::empty();
        let cases: [(&[u8], &[u8]); 5] = [
            (b"ACGT", b"ACGT"),
            (b"ACGT", b"AGGT"),
            (b"ACGTT", b"ACGT"),
            (b"ACG", b"ACGGT"),
            (b"TTACG", b"TACG"),
        ];
        let opt = opt_with_thres(8, 4);
        let mut dir = DpDir::new(2 * 8 + 1);
        for (read, rf) in cases {
            let qual = vec![b'I'; read.len()];
            let (got_bw, _) = backward_dp(
                &mut dir,
                &cat,
                read,
                &qual,
                rf,
                read.len(),
                rf.len(),
                0,
                &opt,
            );
            let (got_fw, _) = forward_dp(
                &mut dir,
                &cat,
                read,
                &qual,
                rf,
                read.len(),
                rf.len(),
                0,
                &opt,
            );
            // The backward DP's free border deletes a reference prefix, the
            // forward DP's a reference suffix, so the forward comparison runs
            // on reversed strings.
            let rev_read: Vec<u8> = read.iter().rev().copied().collect();
            let rev_rf: Vec<u8> = rf.iter().rev().copied().collect();
            let expect_bw = reference_dp(read, rf, b'I', &opt);
            let expect_fw = reference_dp(&rev_read, &rev_rf, b'I', &opt);
            assert!(
                (got_bw - expect_bw).abs() < 1e-9,
                "backward: read {:?} rf {:?}: got {} expect {}",
                read,
                rf,
                got_bw,
                expect_bw
            );
            assert!(
                (got_fw - expect_fw).abs() < 1e-9,
                "forward: read {:?} rf {:?}: got {} expect {}",
                read,
                rf,
                got_fw,
                expect_fw
            );
        }
    }
}
