// The immutable run context: reference, catalogue, reverse FM-index and
// options, built once and shared read-only by every worker.

use std::io;
use std::path::Path;

use crate::fm_index::FmIndex;
use crate::genome::Genome;
use crate::params::CallOpt;
use crate::utils;
use crate::variants::VariantCatalogue;

pub struct Context {
    pub genome: Genome,
    pub variants: VariantCatalogue,
    pub rev_index: FmIndex,
    pub opt: CallOpt,
}

impl Context {
    /// Load every shared structure. Any failure here happens before the
    /// pipeline starts, so a broken configuration produces no output file.
    pub fn load(
        genome_file: &str,
        variant_file: &str,
        index_dir: &Path,
        opt: CallOpt,
    ) -> io::Result<Self> {
        let genome = Genome::load(genome_file)?;
        utils::log_mem("after loading multi-genome");

        let variants = VariantCatalogue::load(variant_file)?;
        utils::log_mem("after loading variant catalogue");

        let rev_index = FmIndex::load(index_dir)?;
        utils::log_mem("after loading reverse index");

        if rev_index.len() != genome.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "index covers {} bases but the reference has {}; rebuild the index",
                    rev_index.len(),
                    genome.len()
                ),
            ));
        }
        Ok(Context {
            genome,
            variants,
            rev_index,
            opt,
        })
    }
}
