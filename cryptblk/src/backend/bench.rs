//! PBKDF2 iteration calibration.
//!
//! Pick an iteration count that makes one derivation take roughly the
//! requested wall-clock time on this host: run a probe, scale linearly,
//! never go below the floor. The measurement is repeated per call site on
//! purpose (master-key digest and each keyslot add calibrate
//! independently), since the host load can shift between them.

use std::time::Instant;

use cryptolib::backend;

use crate::api::Result;

/// No header leaves the building with fewer iterations than this.
pub(crate) const ITERATIONS_MIN: u32 = 1000;

const PROBE_ITERATIONS: u32 = 10_000;
const BENCH_PASSWORD: &[u8] = b"calibration.pwd!";
const BENCH_SALT: &[u8] = &[0x55u8; 32];

/// Iterations meeting `target_ms` of wall clock for PBKDF2 with `hash`.
/// Calibration failure is non-fatal: the floor is returned and flagged in
/// the log.
pub(crate) fn pbkdf2_iterations(hash: &str, target_ms: u64) -> Result<u32> {
    let digest_size = match backend().hash_size(hash) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("PBKDF2 benchmark skipped, hash {} unusable: {}", hash, e);
            return Ok(ITERATIONS_MIN);
        }
    };
    let mut out = vec![0u8; digest_size];

    let mut probe = PROBE_ITERATIONS;
    // scale the probe up until it takes a measurable amount of time
    for _ in 0..10 {
        let start = Instant::now();
        if let Err(e) = backend().pbkdf2(hash, BENCH_PASSWORD, BENCH_SALT, probe, &mut out) {
            log::warn!("PBKDF2 benchmark failed ({}), using minimum iteration count", e);
            return Ok(ITERATIONS_MIN);
        }
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        if elapsed_ms >= 2.0 {
            let scaled = (probe as f64 * target_ms as f64 / elapsed_ms) as u64;
            let iterations = scaled.min(u32::MAX as u64) as u32;
            log::debug!(
                "PBKDF2-{} benchmark: {} iterations in {:.1} ms -> {} for {} ms",
                hash,
                probe,
                elapsed_ms,
                iterations.max(ITERATIONS_MIN),
                target_ms
            );
            return Ok(iterations.max(ITERATIONS_MIN));
        }
        match probe.checked_mul(10) {
            Some(p) => probe = p,
            None => break,
        }
    }
    log::warn!("PBKDF2 benchmark never converged, using minimum iteration count");
    Ok(ITERATIONS_MIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_is_enforced() {
        // 1 ms target cannot beat the floor on any real host
        let n = pbkdf2_iterations("sha256", 1).unwrap();
        assert!(n >= ITERATIONS_MIN);
    }

    #[test]
    fn unknown_hash_degrades_to_floor() {
        assert_eq!(pbkdf2_iterations("md42", 1000).unwrap(), ITERATIONS_MIN);
    }

    #[test]
    fn longer_target_means_more_iterations() {
        let short = pbkdf2_iterations("sha256", 30).unwrap();
        let long = pbkdf2_iterations("sha256", 300).unwrap();
        // linear scaling with generous slack for noisy CI hosts
        assert!(long > short * 3, "short={} long={}", short, long);
    }
}
