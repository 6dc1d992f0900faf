use super::findings::{Finding, IdentityKey};
use crate::config::types::WildcardConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Dominant response signature found for one host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WildcardSignature {
    pub host: String,
    pub status: u16,
    pub length_min: u64,
    pub length_max: u64,
    pub matched: usize,
    pub host_total: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub merged: usize,
}

/// Merges findings into a phase's keyed set and flags wildcard responses.
#[derive(Debug, Clone)]
pub struct Normalizer {
    wildcard: WildcardConfig,
}

impl Normalizer {
    pub fn new(wildcard: WildcardConfig) -> Self {
        Self { wildcard }
    }

    pub fn merge_into(
        &self,
        set: &mut BTreeMap<IdentityKey, Finding>,
        incoming: Vec<Finding>,
    ) -> MergeStats {
        let mut stats = MergeStats::default();
        for finding in incoming {
            let key = finding.identity_key();
            match set.get_mut(&key) {
                Some(existing) => {
                    if let Err(rejected) = existing.absorb(finding) {
                        tracing::warn!("identity key collision for {}: {:?}", key, rejected);
                        continue;
                    }
                    stats.merged += 1;
                }
                None => {
                    set.insert(key, finding);
                    stats.inserted += 1;
                }
            }
        }
        stats
    }

    /// Recompute `likely_wildcard` for every path finding in `set`.
    ///
    /// Per host, findings are grouped by status; within a status the length
    /// window `[l, l + tolerance]` holding the most findings is the candidate.
    /// It becomes the host's signature when it holds at least `min_paths`
    /// findings and at least `dominance_ratio` of the host's path findings.
    /// Only findings inside the signature are flagged.
    pub fn suppress_wildcards(
        &self,
        set: &mut BTreeMap<IdentityKey, Finding>,
    ) -> Vec<WildcardSignature> {
        // host -> (total, status -> [(length, key)])
        let mut by_host: BTreeMap<String, (usize, BTreeMap<u16, Vec<(u64, IdentityKey)>>)> =
            BTreeMap::new();

        for (key, finding) in set.iter() {
            let Finding::Path(path) = finding else {
                continue;
            };
            let entry = by_host.entry(path.host.clone()).or_default();
            entry.0 += 1;
            if let (Some(status), Some(length)) = (&path.status_code, &path.content_length) {
                entry
                    .1
                    .entry(status.value)
                    .or_default()
                    .push((length.value, key.clone()));
            }
        }

        let mut signatures = Vec::new();
        let mut flagged: Vec<IdentityKey> = Vec::new();

        for (host, (total, statuses)) in by_host {
            let mut best: Option<(usize, u16, usize, usize, Vec<(u64, IdentityKey)>)> = None;
            for (status, mut entries) in statuses {
                entries.sort();
                let (count, start) = densest_window(&entries, self.wildcard.length_tolerance);
                if best.as_ref().is_none_or(|(best_count, ..)| count > *best_count) {
                    best = Some((count, status, start, start + count, entries));
                }
            }
            let Some((count, status, start, end, entries)) = best else {
                continue;
            };

            let threshold = (self.wildcard.dominance_ratio * total as f64).ceil() as usize;
            if count == 0 || count < self.wildcard.min_paths || count < threshold {
                continue;
            }

            let window = &entries[start..end];
            signatures.push(WildcardSignature {
                host: host.clone(),
                status,
                length_min: window[0].0,
                length_max: window[window.len() - 1].0,
                matched: count,
                host_total: total,
            });
            flagged.extend(window.iter().map(|(_, key)| key.clone()));
        }

        for finding in set.values_mut() {
            if let Finding::Path(path) = finding {
                path.likely_wildcard = false;
            }
        }
        for key in flagged {
            if let Some(Finding::Path(path)) = set.get_mut(&key) {
                path.likely_wildcard = true;
            }
        }

        signatures
    }
}

/// Largest run of sorted entries whose lengths span at most `tolerance`.
/// Returns (count, start index); ties keep the earliest window.
fn densest_window<T>(sorted: &[(u64, T)], tolerance: u64) -> (usize, usize) {
    let mut best = (0, 0);
    let mut start = 0;
    for end in 0..sorted.len() {
        while sorted[end].0 - sorted[start].0 > tolerance {
            start += 1;
        }
        let count = end - start + 1;
        if count > best.0 {
            best = (count, start);
        }
    }
    best
}
