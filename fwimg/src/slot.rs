// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! A/B slot detection from GPT attribute bits.
//!
//! Boot-control state lives in per-partition attribute bits: a 2-bit
//! priority at 48/49, active at 50, successful at 51, unbootable at 52.
//! Vendors are inconsistent about which partitions carry meaningful bits,
//! so the verdict is computed over a curated key set first and the whole
//! A/B population as a fallback.

use crate::gpt::Partition;

/// Attribute bit positions (boot_ctrl layout)
const PRIORITY_SHIFT: u32 = 48;
const ACTIVE_BIT: u64 = 1 << 50;
const SUCCESSFUL_BIT: u64 = 1 << 51;
const UNBOOTABLE_BIT: u64 = 1 << 52;

/// Partitions whose slot bits are actually maintained by bootloaders.
const KEY_PARTITIONS: [&str; 10] = [
    "boot", "system", "vendor", "abl", "xbl", "dtbo", "vbmeta", "product", "odm", "system_ext",
];

/// Excluded from the fallback set: bits on these are frequently stale.
const FALLBACK_EXCLUDED: [&str; 2] = ["vendor_boot", "init_boot"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotVerdict {
    A,
    B,
    Unknown,
    Undefined,
    NonExistent,
}

/// Which rule broke the tie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRule {
    ActiveFlag,
    Priority,
    Successful,
    Unbootable,
    AllTied,
    NoneActive,
    Inconclusive,
    NoAbPartitions,
}

impl std::fmt::Display for SlotRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SlotRule::ActiveFlag => "active flag",
            SlotRule::Priority => "slot priority",
            SlotRule::Successful => "successful flag",
            SlotRule::Unbootable => "unbootable flag",
            SlotRule::AllTied => "all metrics tied",
            SlotRule::NoneActive => "no active slot",
            SlotRule::Inconclusive => "inconclusive",
            SlotRule::NoAbPartitions => "no A/B partitions",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SlotStats {
    pub partitions: u32,
    pub active: u32,
    pub successful: u32,
    pub unbootable: u32,
    pub avg_priority: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlotDetection {
    pub verdict: SlotVerdict,
    pub rule: SlotRule,
    pub slot_a: SlotStats,
    pub slot_b: SlotStats,
}

impl SlotDetection {
    /// "_a"/"_b" suffix for partition-name expansion, when decided.
    pub fn suffix(&self) -> Option<&'static str> {
        match self.verdict {
            SlotVerdict::A => Some("a"),
            SlotVerdict::B => Some("b"),
            _ => None,
        }
    }
}

fn stats_for<'a>(parts: impl Iterator<Item = &'a (String, u64)>) -> SlotStats {
    let mut s = SlotStats::default();
    let mut priority_sum = 0u64;
    for (_, attrs) in parts {
        s.partitions += 1;
        priority_sum += (attrs >> PRIORITY_SHIFT) & 0x3;
        if attrs & ACTIVE_BIT != 0 {
            s.active += 1;
        }
        if attrs & SUCCESSFUL_BIT != 0 {
            s.successful += 1;
        }
        if attrs & UNBOOTABLE_BIT != 0 {
            s.unbootable += 1;
        }
    }
    if s.partitions > 0 {
        s.avg_priority = priority_sum as f64 / s.partitions as f64;
    }
    s
}

/// Reduce `(name, attributes)` pairs to a slot verdict. Pure function of
/// its input as a multiset - ordering must not matter.
pub fn detect_slot_from_attrs<'a>(
    parts: impl IntoIterator<Item = (&'a str, u64)>,
) -> SlotDetection {
    // (base-name, attrs) per slot
    let mut slot_a: Vec<(String, u64)> = Vec::new();
    let mut slot_b: Vec<(String, u64)> = Vec::new();

    for (name, attrs) in parts {
        let lower = name.to_ascii_lowercase();
        if let Some(base) = lower.strip_suffix("_a") {
            slot_a.push((base.to_owned(), attrs));
        } else if let Some(base) = lower.strip_suffix("_b") {
            slot_b.push((base.to_owned(), attrs));
        }
    }

    if slot_a.is_empty() && slot_b.is_empty() {
        return SlotDetection {
            verdict: SlotVerdict::NonExistent,
            rule: SlotRule::NoAbPartitions,
            slot_a: SlotStats::default(),
            slot_b: SlotStats::default(),
        };
    }

    let in_key_set = |base: &str| KEY_PARTITIONS.contains(&base);
    let keyed_a = slot_a.iter().filter(|(b, _)| in_key_set(b)).count();
    let keyed_b = slot_b.iter().filter(|(b, _)| in_key_set(b)).count();

    let (a, b) = if keyed_a + keyed_b > 0 {
        (
            stats_for(slot_a.iter().filter(|(base, _)| in_key_set(base))),
            stats_for(slot_b.iter().filter(|(base, _)| in_key_set(base))),
        )
    } else {
        let included = |base: &str| !FALLBACK_EXCLUDED.contains(&base);
        (
            stats_for(slot_a.iter().filter(|(base, _)| included(base))),
            stats_for(slot_b.iter().filter(|(base, _)| included(base))),
        )
    };

    let (verdict, rule) = decide(&a, &b);
    SlotDetection {
        verdict,
        rule,
        slot_a: a,
        slot_b: b,
    }
}

/// Convenience over a parsed partition list.
pub fn detect_slot(partitions: &[Partition]) -> SlotDetection {
    detect_slot_from_attrs(partitions.iter().map(|p| (p.name.as_str(), p.attributes)))
}

fn decide(a: &SlotStats, b: &SlotStats) -> (SlotVerdict, SlotRule) {
    if a.active != b.active {
        let v = if a.active > b.active {
            SlotVerdict::A
        } else {
            SlotVerdict::B
        };
        return (v, SlotRule::ActiveFlag);
    }

    if (a.avg_priority - b.avg_priority).abs() > 0.1 {
        let v = if a.avg_priority > b.avg_priority {
            SlotVerdict::A
        } else {
            SlotVerdict::B
        };
        return (v, SlotRule::Priority);
    }

    if a.successful != b.successful {
        let v = if a.successful > b.successful {
            SlotVerdict::A
        } else {
            SlotVerdict::B
        };
        return (v, SlotRule::Successful);
    }

    if a.unbootable != b.unbootable {
        let v = if a.unbootable < b.unbootable {
            SlotVerdict::A
        } else {
            SlotVerdict::B
        };
        return (v, SlotRule::Unbootable);
    }

    if a.active > 0 && b.active > 0 {
        return (SlotVerdict::Unknown, SlotRule::AllTied);
    }
    if a.active == 0 && b.active == 0 {
        return (SlotVerdict::Undefined, SlotRule::NoneActive);
    }
    (SlotVerdict::Unknown, SlotRule::Inconclusive)
}
