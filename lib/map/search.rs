//! Masked byte-pattern search over the initialized coverage sets.

use crate::address::{Address, AddressSet};
use crate::monitor::{NullMonitor, TaskMonitor};

use super::MemoryMap;

/// The outcome of testing one candidate address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PatternMatch {
    /// The pattern matches at the candidate.
    Hit,
    /// No match and no skip information; advance one address.
    Miss,
    /// No match; the next `skip - 1` addresses cannot match either, so the
    /// cursor may advance by `skip`.
    Skip(u64),
}

/// Compare `pattern` against `data` at every alignment that matters.
///
/// On a forward mismatch the safe skip is the smallest `j` for which the
/// pattern, shifted right by `j`, still agrees with the buffer; no shorter
/// shift can produce a match, so `j` addresses may be skipped. When no
/// shift agrees the whole pattern length may be skipped. Backward searches
/// take no skip.
pub(crate) fn match_in_buffer(
    pattern: &[u8],
    mask: Option<&[u8]>,
    data: &[u8],
    forward: bool,
) -> PatternMatch {
    let matches = |pattern_index: usize, data_index: usize| match mask {
        None => pattern[pattern_index] == data[data_index],
        Some(mask) => {
            pattern[pattern_index] & mask[pattern_index]
                == data[data_index] & mask[pattern_index]
        }
    };
    if (0..pattern.len()).all(|i| matches(i, i)) {
        return PatternMatch::Hit;
    }
    if !forward {
        return PatternMatch::Miss;
    }
    for shift in 1..pattern.len() {
        if (0..pattern.len() - shift).all(|i| matches(i, i + shift)) {
            return PatternMatch::Skip(shift as u64);
        }
    }
    PatternMatch::Skip(pattern.len() as u64)
}

impl MemoryMap {
    /// Find `pattern` in loaded, initialized memory starting at `start`.
    ///
    /// With a mask, byte `i` matches when
    /// `data[i] & mask[i] == pattern[i] & mask[i]`. Returns `None` when the
    /// monitor cancels or the covered region is exhausted.
    pub fn find_bytes(
        &self,
        start: Address,
        pattern: &[u8],
        mask: Option<&[u8]>,
        forward: bool,
        monitor: Option<&dyn TaskMonitor>,
    ) -> Option<Address> {
        let set = self.inner.state_read().loaded_initialized.clone();
        self.search_set(&set, start, None, pattern, mask, forward, monitor)
    }

    /// Find `pattern` in initialized memory between `start` and `end`,
    /// including mapped projections.
    ///
    /// The bound comparison is strict: `end` itself is still tested, and
    /// the search gives up once the cursor steps past it.
    pub fn find_bytes_in_range(
        &self,
        start: Address,
        end: Address,
        pattern: &[u8],
        mask: Option<&[u8]>,
        forward: bool,
        monitor: Option<&dyn TaskMonitor>,
    ) -> Option<Address> {
        let set = self.inner.state_read().all_initialized.clone();
        self.search_set(&set, start, Some(end), pattern, mask, forward, monitor)
    }

    #[allow(clippy::too_many_arguments)]
    fn search_set(
        &self,
        set: &AddressSet,
        start: Address,
        bound: Option<Address>,
        pattern: &[u8],
        mask: Option<&[u8]>,
        forward: bool,
        monitor: Option<&dyn TaskMonitor>,
    ) -> Option<Address> {
        if pattern.is_empty() {
            return None;
        }
        if let Some(mask) = mask {
            debug_assert_eq!(mask.len(), pattern.len());
        }
        let monitor = monitor.unwrap_or(&NullMonitor);
        let mut iter = set.addresses(start, forward);
        let mut buf = vec![0u8; pattern.len()];
        while let Some(addr) = iter.next() {
            if monitor.is_cancelled() {
                return None;
            }
            if let Some(bound) = bound {
                if forward && addr > bound {
                    return None;
                }
                if !forward && addr < bound {
                    return None;
                }
            }
            let result = match self.get_bytes(addr, &mut buf) {
                Ok(n) if n == pattern.len() => match_in_buffer(pattern, mask, &buf, forward),
                _ => PatternMatch::Miss,
            };
            match result {
                PatternMatch::Hit => return Some(addr),
                PatternMatch::Miss => monitor.increment_progress(1),
                PatternMatch::Skip(skip) => {
                    match addr.add_no_wrap(skip) {
                        // jump the iterator forward and re-seat it in the
                        // covered set
                        Ok(jump) => iter = set.addresses(jump, true),
                        // jumping would overflow the space; step instead
                        Err(_) => {
                            for _ in 1..skip {
                                if iter.next().is_none() {
                                    break;
                                }
                            }
                        }
                    }
                    monitor.increment_progress(skip);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{match_in_buffer, PatternMatch};

    #[test]
    fn exact_match() {
        assert_eq!(
            match_in_buffer(&[0xAA, 0xBB], None, &[0xAA, 0xBB], true),
            PatternMatch::Hit
        );
    }

    #[test]
    fn masked_match() {
        // only the high nibbles participate
        assert_eq!(
            match_in_buffer(&[0xA5, 0xB5], Some(&[0xF0, 0xF0]), &[0xAF, 0xBF], true),
            PatternMatch::Hit
        );
        assert_eq!(
            match_in_buffer(&[0xA5, 0xB5], Some(&[0xFF, 0xF0]), &[0xAF, 0xBF], true),
            PatternMatch::Skip(2)
        );
    }

    #[test]
    fn skip_is_smallest_agreeing_shift() {
        // shifted by 1, pattern prefix [0xAA] agrees with data[1]
        assert_eq!(
            match_in_buffer(&[0xAA, 0xBB], None, &[0xAA, 0xAA], true),
            PatternMatch::Skip(1)
        );
        // no shift agrees
        assert_eq!(
            match_in_buffer(&[0xAA, 0xBB], None, &[0xCC, 0xDD], true),
            PatternMatch::Skip(2)
        );
        // shifted by 2, [0x11, 0x22] agrees with data[2..]
        assert_eq!(
            match_in_buffer(&[0x11, 0x22, 0x33, 0x44], None, &[0x55, 0x66, 0x11, 0x22], true),
            PatternMatch::Skip(2)
        );
    }

    #[test]
    fn backward_has_no_skip() {
        assert_eq!(
            match_in_buffer(&[0xAA, 0xBB], None, &[0xAA, 0xAA], false),
            PatternMatch::Miss
        );
    }
}
