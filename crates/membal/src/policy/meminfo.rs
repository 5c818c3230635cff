use std::collections::HashMap;

/// Memory counters reported by a domain, in bytes.
///
/// Parsed from `/proc/meminfo`-style text published by the in-guest agent.
/// The text is untrusted, so every report is checked for consistency before
/// it is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub mem_total: u64,
    pub mem_free: u64,
    pub buffers: u64,
    pub cached: u64,
    pub swap_total: u64,
    pub swap_free: u64,
}

const KEYS: [&str; 6] = [
    "MemTotal",
    "MemFree",
    "Buffers",
    "Cached",
    "SwapTotal",
    "SwapFree",
];

impl MemInfo {
    /// Parses and validates a report. Values are given in KiB, optionally
    /// followed by a `kB` suffix. Returns `None` for anything inconsistent.
    pub fn parse(untrusted: &str) -> Option<Self> {
        let mut values: HashMap<&str, u64> = HashMap::new();
        for line in untrusted.lines() {
            let Some((key, rest)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            if !KEYS.contains(&key) {
                continue;
            }
            let mut fields = rest.split_whitespace();
            let kib: u64 = fields.next()?.parse().ok()?;
            match fields.next() {
                None | Some("kB") => {}
                Some(_) => return None,
            }
            values.insert(key, kib.checked_mul(1024)?);
        }

        let info = Self {
            mem_total: *values.get("MemTotal")?,
            mem_free: *values.get("MemFree")?,
            buffers: *values.get("Buffers")?,
            cached: *values.get("Cached")?,
            swap_total: *values.get("SwapTotal")?,
            swap_free: *values.get("SwapFree")?,
        };
        info.checked_mem_used().is_some().then_some(info)
    }

    /// `None` when the counters contradict each other or do not fit in `u64`.
    fn checked_mem_used(&self) -> Option<u64> {
        let resident = self
            .mem_total
            .checked_sub(self.mem_free)?
            .checked_sub(self.cached)?
            .checked_sub(self.buffers)?;
        resident.checked_add(self.swap_total.checked_sub(self.swap_free)?)
    }

    /// Memory the domain actually uses: everything except free memory and
    /// page cache, plus what was pushed out to swap.
    pub fn mem_used(&self) -> u64 {
        self.mem_total
            .saturating_sub(self.mem_free)
            .saturating_sub(self.cached)
            .saturating_sub(self.buffers)
            .saturating_add(self.swap_total.saturating_sub(self.swap_free))
    }
}
