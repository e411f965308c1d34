//! Bounded-skew binary search over a timestamp-ordered (almost monotonic)
//! sequence of UUIDv7 keys (spec §4.7).

use crate::config::MAX_SKEW_MS;
use crate::error::FrozenError;

/// Looks up `target`'s timestamp in a sequence of length `count` accessed
/// through `get`, tolerating up to `skew_ms` of reordering between any two
/// rows. Returns the index of any row whose timestamp equals the target's,
/// or `KeyNotFoundError` if none exists within the skew window.
pub(crate) fn fuzzy_search<F>(
    target_ts: i64,
    skew_ms: u64,
    count: u64,
    get: F,
) -> Result<u64, FrozenError>
where
    F: Fn(u64) -> Result<i64, FrozenError>,
{
    if skew_ms > MAX_SKEW_MS {
        return Err(FrozenError::invalid_input("skew_ms out of range"));
    }

    let skew = skew_ms as i64;
    let lower = target_ts - skew;
    let upper = target_ts + skew;

    let mut lo: u64 = 0;
    let mut hi: u64 = count;

    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let v = get(mid)?;

        if v < lower {
            lo = mid + 1;
        } else if v > upper {
            hi = mid;
        } else {
            // Inside the skew cluster: the sort order here is unreliable,
            // so scan outward from `mid` in both directions.
            if v == target_ts {
                return Ok(mid);
            }
            let mut left = mid;
            while left > lo {
                left -= 1;
                let lv = get(left)?;
                if lv < lower {
                    break;
                }
                if lv == target_ts {
                    return Ok(left);
                }
            }
            let mut right = mid + 1;
            while right < hi {
                let rv = get(right)?;
                if rv > upper {
                    break;
                }
                if rv == target_ts {
                    return Ok(right);
                }
                right += 1;
            }
            return Err(FrozenError::KeyNotFound);
        }
    }

    Err(FrozenError::KeyNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search(data: &[i64], target: i64, skew: u64) -> Result<u64, FrozenError> {
        fuzzy_search(target, skew, data.len() as u64, |i| Ok(data[i as usize]))
    }

    #[test]
    fn finds_exact_match_in_monotonic_sequence() {
        let data = [10, 20, 30, 40, 50];
        assert_eq!(search(&data, 30, 0).unwrap(), 2);
    }

    #[test]
    fn missing_key_returns_not_found() {
        let data = [10, 20, 30, 40, 50];
        assert!(search(&data, 25, 0).is_err());
    }

    #[test]
    fn e6_scenario_from_spec() {
        let data = [95, 96, 97, 98, 99, 100, 101, 102, 103, 104, 105, 495];
        assert_eq!(search(&data, 100, 10).unwrap(), 5);
        assert!(search(&data, 300, 10).is_err());
    }

    #[test]
    fn skew_zero_requires_exact_sorted_order() {
        let data = [1, 2, 3, 4, 5];
        for (i, &v) in data.iter().enumerate() {
            assert_eq!(search(&data, v, 0).unwrap(), i as u64);
        }
    }

    #[test]
    fn empty_sequence_is_not_found() {
        let data: [i64; 0] = [];
        assert!(search(&data, 1, 0).is_err());
    }

    #[test]
    fn single_element_exact_match() {
        let data = [42];
        assert_eq!(search(&data, 42, 0).unwrap(), 0);
        assert!(search(&data, 43, 0).is_err());
    }
}
