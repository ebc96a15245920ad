// Alignment and calling parameters, with thresholds derived from the read
// length and the expected sequencing-error / mutation rates.

/// Prior probability of a substitution absent from the catalogue.
pub const NEW_SUB_RATE: f64 = 1e-5;
/// Prior probability of an indel absent from the catalogue.
pub const NEW_INDEL_RATE: f64 = 1e-6;

/// Standard DNA bases used to seed uncatalogued posterior positions.
pub const STD_BASES: [u8; 4] = *b"ACGT";

/// How the per-end driver picks the next seed anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Uniform random position in [1, read_len).
    Random,
    /// Fixed step, wrapping at the read length.
    Deterministic,
}

#[derive(Debug, Clone)]
pub struct CallOpt {
    /// Read length the scratch matrices are sized for; longer reads are skipped.
    pub read_len: usize,
    /// Expected per-base sequencing error rate.
    pub err_rate: f64,
    /// Expected per-base mutation rate.
    pub mut_rate: f64,
    /// Variance factor on the error term of the distance threshold.
    pub err_var_factor: f64,
    /// Variance factor on the mutation term of the distance threshold.
    pub mut_var_factor: f64,
    /// Anchor iterations per end = iter_factor * (dist_thres + 1).
    pub iter_factor: usize,

    // Derived by `derive_thresholds`.
    pub dist_thres: usize,
    pub prob_thres: f64,
    pub iter_num: usize,

    // Costs are negative log10 probabilities.
    pub sub_cost: f64,
    pub gap_open_cost: f64,
    pub gap_ext_cost: f64,

    /// Seeds with more candidate reference positions than this are discarded.
    pub max_match: usize,

    pub search_mode: SearchMode,
    pub start_pos: usize,
    pub search_step: usize,
    pub workers: usize,
    /// Floor probability for posterior map entries.
    pub posterior_floor: f64,
    /// Seed for the anchor PRNG; None draws from the OS.
    pub rng_seed: Option<u64>,
}

impl Default for CallOpt {
    fn default() -> Self {
        let mut opt = CallOpt {
            read_len: 100,
            err_rate: 0.001,
            mut_rate: 0.001,
            err_var_factor: 4.0,
            mut_var_factor: 2.0,
            iter_factor: 2,

            dist_thres: 0,
            prob_thres: 0.0,
            iter_num: 0,

            sub_cost: -NEW_SUB_RATE.log10(),
            gap_open_cost: -NEW_INDEL_RATE.log10(),
            gap_ext_cost: -NEW_SUB_RATE.log10(),

            max_match: 1024,

            search_mode: SearchMode::Random,
            start_pos: 0,
            search_step: 5,
            workers: num_cpus::get(),
            posterior_floor: 0.01,
            rng_seed: None,
        };
        opt.derive_thresholds(None, None);
        opt
    }
}

impl CallOpt {
    /// Derive the integer distance threshold, its float acceptance image and
    /// the per-end iteration count. Call again after changing `read_len`,
    /// the rates, or the variance factors.
    pub fn derive_thresholds(&mut self, dist_override: Option<usize>, iter_override: Option<usize>) {
        let rlen = self.read_len as f64;
        let err = self.err_rate;
        let mutr = self.mut_rate;

        self.dist_thres = match dist_override {
            Some(d) => d,
            None => {
                let err_term = (err * rlen + self.err_var_factor * (rlen * err * (1.0 - err)).sqrt()).ceil();
                let mut_term = (mutr * rlen + self.mut_var_factor * (rlen * mutr * (1.0 - mutr)).sqrt()).ceil();
                (err_term + mut_term) as usize
            }
        };

        // The DP costs are -log10 probabilities, so the acceptance comparison
        // uses the float image of the integer threshold.
        let d = self.dist_thres as f64;
        self.prob_thres = -d * (1.0 - err).log10() - d * NEW_INDEL_RATE.log10();

        self.iter_num = iter_override.unwrap_or(self.iter_factor * (self.dist_thres + 1));

        log::info!(
            "parameters: read_len={}, dist_thres={}, prob_thres={:.5}, iter_num={}, err_rate={}, mut_rate={}, max_match={}",
            self.read_len,
            self.dist_thres,
            self.prob_thres,
            self.iter_num,
            self.err_rate,
            self.mut_rate,
            self.max_match
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_thresholds_are_derived() {
        let opt = CallOpt::default();
        // err = mut = 0.001, R = 100: both terms round up to 2, D* = 4.
        assert_eq!(opt.dist_thres, 4);
        assert_eq!(opt.iter_num, 2 * (opt.dist_thres + 1));
        assert!(opt.prob_thres > 0.0);
    }

    #[test]
    fn distance_override_rescales_prob_thres() {
        let mut opt = CallOpt::default();
        opt.derive_thresholds(Some(1), None);
        let one = opt.prob_thres;
        opt.derive_thresholds(Some(2), None);
        assert!(opt.prob_thres > one);
        assert_eq!(opt.iter_num, 6);
    }
}
