// =============================================================================
// primes.rs — Prime code table (manifold code → representative value)
// =============================================================================
//
// Decoding a quantized entry needs a deterministic code→value table. The file
// format uses the first N primes; any strictly increasing table would satisfy
// the same contract. Built once per `EngineContext` and shared read-only.
// =============================================================================

use crate::error::{EngineError, Result};

/// Manifold codes are u16, so no file can address more entries than this.
/// The last of these primes (821641) is far below 2^24, so every value is
/// exact in f32.
pub const MAX_TABLE_LEN: usize = u16::MAX as usize + 1;

/// Integers above this lose bits when stored as f32.
const F32_EXACT_LIMIT: u32 = 1 << 24;

fn check_exact_in_f32(primes: &[u32]) -> Result<()> {
    match primes.last() {
        Some(&p) if p > F32_EXACT_LIMIT => Err(EngineError::Config(format!(
            "prime {p} is not exactly representable in f32"
        ))),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrimeTable {
    primes: Vec<u32>,
    /// Same table as f32, so the hot loop never converts.
    values: Vec<f32>,
}

impl PrimeTable {
    /// First `n` primes via a sieve of Eratosthenes.
    pub fn generate(n: usize) -> Result<Self> {
        if n == 0 {
            return Err(EngineError::Config("prime table needs at least one entry".into()));
        }
        if n > MAX_TABLE_LEN {
            return Err(EngineError::Config(format!(
                "prime table of {n} entries exceeds the {MAX_TABLE_LEN} codes a u16 can address"
            )));
        }

        let limit = sieve_limit(n);
        let mut composite = Vec::new();
        composite
            .try_reserve_exact(limit + 1)
            .map_err(|e| EngineError::Config(format!("prime sieve allocation: {e}")))?;
        composite.resize(limit + 1, false);

        let mut primes = Vec::with_capacity(n);
        let mut i = 2usize;
        while primes.len() < n && i <= limit {
            if !composite[i] {
                primes.push(i as u32);
                let mut j = i * i;
                while j <= limit {
                    composite[j] = true;
                    j += i;
                }
            }
            i += 1;
        }
        debug_assert_eq!(primes.len(), n, "sieve bound too small");
        check_exact_in_f32(&primes)?;

        let values = primes.iter().map(|&p| p as f32).collect();
        Ok(Self { primes, values })
    }

    pub fn len(&self) -> usize {
        self.primes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primes.is_empty()
    }

    /// O(1) bounds-checked lookup. An out-of-range code is a caller bug and is
    /// reported, never clamped.
    #[inline]
    pub fn lookup(&self, code: usize) -> Result<u32> {
        self.primes
            .get(code)
            .copied()
            .ok_or_else(|| EngineError::index("manifold code", code, self.primes.len()))
    }

    /// Decode table as f32. Codes reaching the kernels were range-checked at
    /// load time, so plain indexing into this slice cannot fail silently.
    #[inline]
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.primes
    }
}

/// Upper bound on the n-th prime (Rosser: p_n < n(ln n + ln ln n) for n ≥ 6).
fn sieve_limit(n: usize) -> usize {
    if n < 6 {
        return 15;
    }
    let nf = n as f64;
    (nf * (nf.ln() + nf.ln().ln())).ceil() as usize + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_primes() {
        let t = PrimeTable::generate(10).unwrap();
        assert_eq!(t.as_slice(), &[2, 3, 5, 7, 11, 13, 17, 19, 23, 29]);
        assert_eq!(t.values()[0], 2.0);
    }

    #[test]
    fn test_strictly_increasing_large() {
        let t = PrimeTable::generate(5000).unwrap();
        assert_eq!(t.len(), 5000);
        assert_eq!(t.as_slice()[0], 2);
        assert!(t.as_slice().windows(2).all(|w| w[0] < w[1]));
        // 5000th prime
        assert_eq!(t.lookup(4999).unwrap(), 48611);
    }

    #[test]
    fn test_small_sizes() {
        for n in 1..=8 {
            let t = PrimeTable::generate(n).unwrap();
            assert_eq!(t.len(), n);
        }
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(PrimeTable::generate(777).unwrap(), PrimeTable::generate(777).unwrap());
    }

    #[test]
    fn test_lookup_out_of_range() {
        let t = PrimeTable::generate(4).unwrap();
        assert_eq!(t.lookup(3).unwrap(), 7);
        let err = t.lookup(4).unwrap_err();
        assert!(matches!(err, EngineError::Index { index: 4, len: 4, .. }));
    }

    #[test]
    fn test_zero_len_rejected() {
        assert!(PrimeTable::generate(0).is_err());
    }

    #[test]
    fn test_full_code_range_is_exact_in_f32() {
        let t = PrimeTable::generate(MAX_TABLE_LEN).unwrap();
        let last = *t.as_slice().last().unwrap();
        assert_eq!(last, 821_641);
        assert!(last < 1 << 24);
        assert!(t.as_slice().iter().zip(t.values()).all(|(&p, &v)| v as u32 == p));

        let err = PrimeTable::generate(MAX_TABLE_LEN + 1).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_prime_past_f32_precision_is_rejected() {
        assert!(check_exact_in_f32(&[2, 3, F32_EXACT_LIMIT]).is_ok());
        let err = check_exact_in_f32(&[2, 3, F32_EXACT_LIMIT + 1]).unwrap_err();
        assert!(matches!(err, EngineError::Config(ref m) if m.contains("16777217")), "{err}");
    }
}
