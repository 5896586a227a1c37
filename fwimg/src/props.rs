// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! `build.prop` harvesting and vendor-aware merging.
//!
//! Android scatters device identity across half a dozen partitions, and
//! vendors disagree about which copy is authoritative. The collector
//! reads every candidate partition (four at a time), then merges the
//! resulting maps in vendor-specific priority order so the most
//! trustworthy partition gets the last word on each key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use indexmap::IndexMap;
use log::debug;

use crate::fsdetect::open_filesystem;
use crate::gpt::GptTable;
use crate::source::SharedSource;

/// Paths the collector probes, in order.
const COLLECT_PATHS: [&str; 3] = ["/build.prop", "/etc/build.prop", "/system/build.prop"];

/// Partition base names that usually carry property files.
pub const DEFAULT_PROP_PARTITIONS: [&str; 6] =
    ["system", "vendor", "odm", "product", "system_ext", "my_manifest"];

/// Concurrent partition probes during one collection run.
const COLLECT_FAN_OUT: usize = 4;

/// Rank handed to partitions absent from the priority table.
const RANK_UNLISTED: usize = 999;

/// Case-insensitive, insertion-ordered key/value map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyMap {
    entries: IndexMap<String, String>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn insert(&mut self, key: &str, value: String) {
        self.entries.insert(key.to_ascii_lowercase(), value);
    }

    /// Overlay `other`; its values win on key collisions.
    pub fn merge_from(&mut self, other: &PropertyMap) {
        for (k, v) in &other.entries {
            self.entries.insert(k.clone(), v.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Parse `key=value` lines. Comments, blanks and malformed lines are
/// skipped; values lose surrounding whitespace and trailing
/// non-printable bytes.
pub fn parse_build_prop(data: &[u8]) -> PropertyMap {
    let mut map = PropertyMap::new();
    let text = String::from_utf8_lossy(data);

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value
            .trim()
            .trim_end_matches(|c: char| c.is_control() || c == '\u{fffd}');
        map.insert(key, value.to_owned());
    }
    map
}

/// Cooperative cancellation for multi-partition collection.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Vendor-specific partition priority, most authoritative first.
fn priority_table(vendor: &str) -> &'static [&'static str] {
    let v = vendor.to_ascii_lowercase();
    if ["oplus", "oneplus", "realme", "oppo"].iter().any(|n| v.contains(n)) {
        &["my_manifest", "odm", "vendor", "system_ext", "product", "system"]
    } else if v.contains("lenovo") {
        &["vendor", "odm", "product", "system_ext", "system"]
    } else if v.contains("xiaomi") {
        &["vendor", "odm", "system", "product"]
    } else {
        &["my_manifest", "odm", "vendor", "system_ext", "product", "system"]
    }
}

fn rank_of(table: &[&str], base: &str) -> usize {
    table
        .iter()
        .position(|t| t.eq_ignore_ascii_case(base))
        .unwrap_or(RANK_UNLISTED)
}

const BRAND_KEYS: [&str; 4] = [
    "ro.product.brand",
    "ro.product.vendor.brand",
    "ro.product.system.brand",
    "ro.product.manufacturer",
];

/// Per-partition result of a collection run.
#[derive(Debug, Clone)]
pub struct PartitionProps {
    /// Base name the candidate expanded from (e.g. `vendor`)
    pub base: String,
    /// The partition that actually answered (e.g. `vendor_a`)
    pub partition: String,
    pub props: PropertyMap,
}

/// Multi-partition `build.prop` reader.
pub struct BuildPropCollector {
    partitions: Vec<(String, SharedSource, u64)>,
}

impl BuildPropCollector {
    pub fn new() -> Self {
        Self {
            partitions: Vec::new(),
        }
    }

    /// Register one readable partition. `base_offset` is only used to key
    /// the per-run cache, so passing the partition's device offset (or 0
    /// for standalone images) is fine.
    pub fn add_partition(&mut self, name: &str, source: SharedSource, base_offset: u64) {
        self.partitions.push((name.to_owned(), source, base_offset));
    }

    /// All partitions of a parsed GPT, windowed out of the device view.
    pub fn from_gpt(base: &SharedSource, table: &GptTable) -> Self {
        let mut c = Self::new();
        for p in &table.partitions {
            c.add_partition(&p.name, p.source(base), p.byte_offset());
        }
        c
    }

    fn find(&self, name: &str) -> Option<&(String, SharedSource, u64)> {
        self.partitions.iter().find(|(n, _, _)| n.eq_ignore_ascii_case(name))
    }

    /// Probe one partition for a property file containing `ro.` keys.
    fn probe(source: &SharedSource) -> Option<PropertyMap> {
        let fs = open_filesystem(source.clone()).ok()?;
        for path in COLLECT_PATHS {
            if let Some(content) = fs.read_file(path)
                && content.windows(3).any(|w| w == b"ro.")
            {
                return Some(parse_build_prop(&content));
            }
        }
        None
    }

    /// Read every base's best candidate, with a fan-out of
    /// [`COLLECT_FAN_OUT`] workers. Returns one entry per base that
    /// yielded anything.
    pub fn collect_detailed(
        &self,
        bases: &[&str],
        slot_suffix: Option<&str>,
        cancel: &CancelToken,
    ) -> Vec<PartitionProps> {
        // Per-run probe cache; insert-only, keyed on name + offset
        let cache: Mutex<HashMap<String, Option<PropertyMap>>> = Mutex::new(HashMap::new());
        let results: Mutex<Vec<PartitionProps>> = Mutex::new(Vec::new());
        let cursor = AtomicUsize::new(0);

        thread::scope(|scope| {
            for _ in 0..usize::min(COLLECT_FAN_OUT, bases.len().max(1)) {
                scope.spawn(|| {
                    loop {
                        if cancel.is_cancelled() {
                            return;
                        }
                        let i = cursor.fetch_add(1, Ordering::Relaxed);
                        let Some(base) = bases.get(i) else {
                            return;
                        };

                        // Slotted name first, bare name second
                        let mut candidates = Vec::with_capacity(2);
                        if let Some(slot) = slot_suffix
                            && !slot.is_empty()
                        {
                            candidates.push(format!("{base}_{slot}"));
                        }
                        candidates.push((*base).to_owned());

                        for name in candidates {
                            let Some((actual, source, offset)) = self.find(&name) else {
                                continue;
                            };
                            let key = format!("{actual}_{offset}");

                            let cached = cache.lock().ok().and_then(|c| c.get(&key).cloned());
                            let props = match cached {
                                Some(hit) => hit,
                                None => {
                                    let probed = Self::probe(source);
                                    if let Ok(mut c) = cache.lock() {
                                        c.insert(key, probed.clone());
                                    }
                                    probed
                                }
                            };

                            if let Some(props) = props {
                                debug!("props: {actual} answered for base {base}");
                                if let Ok(mut r) = results.lock() {
                                    r.push(PartitionProps {
                                        base: (*base).to_owned(),
                                        partition: actual.clone(),
                                        props,
                                    });
                                }
                                break;
                            }
                        }
                    }
                });
            }
        });

        results.into_inner().unwrap_or_default()
    }

    /// Collect and merge. The vendor read out of the collected maps picks
    /// the priority table; low-priority partitions are merged first so
    /// high-priority ones override them key by key.
    pub fn collect(
        &self,
        bases: &[&str],
        slot_suffix: Option<&str>,
        cancel: &CancelToken,
    ) -> PropertyMap {
        let collected = self.collect_detailed(bases, slot_suffix, cancel);
        merge_by_priority(collected)
    }
}

impl Default for BuildPropCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Priority-merge already-collected per-partition maps.
pub fn merge_by_priority(mut collected: Vec<PartitionProps>) -> PropertyMap {
    let vendor = collected
        .iter()
        .find_map(|p| {
            BRAND_KEYS
                .iter()
                .find_map(|k| p.props.get(k))
                .filter(|v| !v.is_empty())
        })
        .unwrap_or("")
        .to_owned();
    let table = priority_table(&vendor);

    // Highest rank value (least trusted) first; ties keep probe order
    collected.sort_by_key(|p| std::cmp::Reverse(rank_of(table, &p.base)));

    let mut merged = PropertyMap::new();
    for part in &collected {
        merged.merge_from(&part.props);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext4::tests::Ext4Builder;
    use crate::source::MemSource;

    #[test]
    fn parse_skips_comments_and_blanks() {
        let map = parse_build_prop(
            b"# build properties\n\n  ro.product.model = QRD888  \nnot a property line\n#ro.hidden=1\nro.build.id=AP1A\n",
        );
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("ro.product.model"), Some("QRD888"));
        assert_eq!(map.get("RO.BUILD.ID"), Some("AP1A"));
    }

    #[test]
    fn parse_trims_trailing_garbage() {
        let map = parse_build_prop(b"ro.serialno=ABC123\x00\x00\x07\n");
        assert_eq!(map.get("ro.serialno"), Some("ABC123"));
    }

    #[test]
    fn parse_keeps_equals_in_value() {
        let map = parse_build_prop(b"ro.cmdline=a=b c=d\n");
        assert_eq!(map.get("ro.cmdline"), Some("a=b c=d"));
    }

    fn prop_partition(content: &[u8]) -> SharedSource {
        let mut b = Ext4Builder::new(64);
        b.add_extent_file(2, "build.prop", content);
        MemSource::shared(b.build())
    }

    fn pp(base: &str, lines: &[(&str, &str)]) -> PartitionProps {
        let mut props = PropertyMap::new();
        for (k, v) in lines {
            props.insert(k, (*v).to_owned());
        }
        PartitionProps {
            base: base.to_owned(),
            partition: base.to_owned(),
            props,
        }
    }

    #[test]
    fn higher_priority_partition_wins_merge() {
        // Default table ranks product above system
        let merged = merge_by_priority(vec![
            pp("system", &[("ro.product.model", "FromSystem"), ("ro.only.system", "s")]),
            pp("product", &[("ro.product.model", "FromProduct")]),
        ]);
        assert_eq!(merged.get("ro.product.model"), Some("FromProduct"));
        assert_eq!(merged.get("ro.only.system"), Some("s"));
    }

    #[test]
    fn vendor_table_flips_the_winner() {
        // system_ext beats system by default...
        let parts = || {
            vec![
                pp("system", &[("ro.x", "sys")]),
                pp("system_ext", &[("ro.x", "sysext")]),
            ]
        };
        assert_eq!(merge_by_priority(parts()).get("ro.x"), Some("sysext"));

        // ...but Xiaomi's table does not list system_ext at all
        let mut xiaomi = parts();
        xiaomi[0]
            .props
            .insert("ro.product.brand", "Xiaomi".to_owned());
        assert_eq!(merge_by_priority(xiaomi).get("ro.x"), Some("sys"));
    }

    #[test]
    fn unlisted_partition_only_contributes_missing_keys() {
        let merged = merge_by_priority(vec![
            pp("mystery", &[("ro.product.model", "Ghost"), ("ro.unique", "yes")]),
            pp("system", &[("ro.product.model", "Real")]),
        ]);
        assert_eq!(merged.get("ro.product.model"), Some("Real"));
        assert_eq!(merged.get("ro.unique"), Some("yes"));
    }

    #[test]
    fn collects_from_slotted_partitions() {
        let mut c = BuildPropCollector::new();
        c.add_partition(
            "system_a",
            prop_partition(b"ro.product.model=Slotted\nro.product.brand=acme\n"),
            0,
        );
        c.add_partition("vendor", prop_partition(b"ro.vendor.id=v1\n"), 4096);

        let merged = c.collect(
            &["system", "vendor", "odm"],
            Some("a"),
            &CancelToken::new(),
        );
        assert_eq!(merged.get("ro.product.model"), Some("Slotted"));
        assert_eq!(merged.get("ro.vendor.id"), Some("v1"));
    }

    #[test]
    fn bare_name_is_fallback_for_missing_slot() {
        let mut c = BuildPropCollector::new();
        c.add_partition("system", prop_partition(b"ro.product.model=NoSlots\n"), 0);
        let merged = c.collect(&["system"], Some("b"), &CancelToken::new());
        assert_eq!(merged.get("ro.product.model"), Some("NoSlots"));
    }

    #[test]
    fn partitions_without_ro_keys_are_ignored() {
        let mut c = BuildPropCollector::new();
        c.add_partition("system", prop_partition(b"persist.something=1\n"), 0);
        let merged = c.collect(&["system"], None, &CancelToken::new());
        assert!(merged.is_empty());
    }

    #[test]
    fn cancellation_stops_dispatch() {
        let mut c = BuildPropCollector::new();
        c.add_partition("system", prop_partition(b"ro.a=1\n"), 0);
        let token = CancelToken::new();
        token.cancel();
        let merged = c.collect(&["system"], None, &token);
        assert!(merged.is_empty());
    }

    #[test]
    fn unreadable_partition_yields_nothing_but_run_continues() {
        let mut c = BuildPropCollector::new();
        c.add_partition("vendor", MemSource::shared(vec![0u8; 8192]), 0);
        c.add_partition("system", prop_partition(b"ro.ok=1\n"), 0);
        let merged = c.collect(&["vendor", "system"], None, &CancelToken::new());
        assert_eq!(merged.get("ro.ok"), Some("1"));
    }
}
