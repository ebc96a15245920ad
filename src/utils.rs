use std::fs::File;
use std::io::{self, BufReader, Read};
use std::num::NonZeroUsize;
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::read::GzDecoder;
use noodles_bgzf as bgzf;

pub fn realtime() -> f64 {
    let now = SystemTime::now();
    let since_epoch = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| std::time::Duration::from_secs(0));
    since_epoch.as_secs_f64()
}

pub fn cputime() -> f64 {
    let rusage = unsafe {
        let mut rusage = std::mem::MaybeUninit::uninit();
        libc::getrusage(libc::RUSAGE_SELF, rusage.as_mut_ptr());
        rusage.assume_init()
    };
    let user_time = rusage.ru_utime;
    let sys_time = rusage.ru_stime;
    (user_time.tv_sec as f64 + user_time.tv_usec as f64 * 1e-6)
        + (sys_time.tv_sec as f64 + sys_time.tv_usec as f64 * 1e-6)
}

/// Peak resident set size in megabytes (ru_maxrss is reported in KiB on Linux).
pub fn peak_rss_mb() -> f64 {
    let rusage = unsafe {
        let mut rusage = std::mem::MaybeUninit::uninit();
        libc::getrusage(libc::RUSAGE_SELF, rusage.as_mut_ptr());
        rusage.assume_init()
    };
    rusage.ru_maxrss as f64 / 1024.0
}

pub fn log_mem(stage: &str) {
    log::info!(
        "{}: peak RSS {:.1} MB, cpu {:.2} s",
        stage,
        peak_rss_mb(),
        cputime()
    );
}

// Detect whether a gzipped file is BGZF by checking for the BGZF-specific header
fn is_bgzip_format(path: &str) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut header = [0u8; 18]; // BGZF header is at least 18 bytes

    if file.read(&mut header).unwrap_or(0) < 18 {
        return Ok(false);
    }

    // gzip magic bytes
    if header[0] != 0x1f || header[1] != 0x8b {
        return Ok(false);
    }

    // BGZF uses an extra field (FEXTRA flag = 0x04)
    if header[3] & 0x04 == 0 {
        return Ok(false);
    }

    // BGZF carries a 'BC' subfield at the expected offset of the extra field
    if header[12] == b'B' && header[13] == b'C' {
        return Ok(true);
    }

    Ok(false)
}

/// Open a possibly gzip/BGZF-compressed file for reading.
///
/// BGZF files get a multithreaded block decompressor; standard gzip falls
/// back to single-threaded decompression.
pub fn open_reader(path: &str) -> io::Result<Box<dyn Read + Send>> {
    const BUFFER_SIZE: usize = 4 * 1024 * 1024;

    let reader: Box<dyn Read + Send> = if path.ends_with(".gz") {
        if is_bgzip_format(path)? {
            log::debug!("{}: BGZF detected, using parallel decompression", path);
            let file = File::open(path)?;
            let worker_count = NonZeroUsize::new(num_cpus::get()).unwrap_or(NonZeroUsize::MIN);
            let bgzf_reader = bgzf::MultithreadedReader::with_worker_count(worker_count, file);
            Box::new(BufReader::with_capacity(BUFFER_SIZE, bgzf_reader))
        } else {
            log::debug!("{}: standard gzip, single-threaded decompression", path);
            let file = File::open(path)?;
            Box::new(BufReader::with_capacity(BUFFER_SIZE, GzDecoder::new(file)))
        }
    } else {
        let file = File::open(path)?;
        Box::new(BufReader::with_capacity(BUFFER_SIZE, file))
    };

    Ok(reader)
}
