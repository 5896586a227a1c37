// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Projection of a merged property map onto a device descriptor.
//!
//! Every output field has an ordered list of candidate keys; the first
//! non-empty, non-placeholder value wins. Two fields can be recovered
//! from the build fingerprint when their own keys are missing, which
//! happens a lot on heavily customised vendor builds.

use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::Serialize;

use crate::props::PropertyMap;

/// Values that mean "the vendor didn't fill this in"
const VALUE_BLACKLIST: [&str; 3] = ["unknown", "oplus", "ossi"];

const BRAND_KEYS: [&str; 4] = [
    "ro.product.brand",
    "ro.product.vendor.brand",
    "ro.product.system.brand",
    "ro.product.manufacturer",
];
const MODEL_KEYS: [&str; 4] = [
    "ro.product.model",
    "ro.product.vendor.model",
    "ro.product.system.model",
    "ro.product.odm.model",
];
const MARKET_NAME_KEYS: [&str; 5] = [
    "ro.vendor.oplus.market.name",
    "ro.product.marketname",
    "ro.product.vendor.marketname",
    "ro.product.odm.marketname",
    "ro.config.marketing_name",
];
const DEVICE_KEYS: [&str; 4] = [
    "ro.product.device",
    "ro.product.vendor.device",
    "ro.product.system.device",
    "ro.build.product",
];
const ANDROID_VERSION_KEYS: [&str; 3] = [
    "ro.build.version.release",
    "ro.system.build.version.release",
    "ro.vendor.build.version.release",
];
const SECURITY_PATCH_KEYS: [&str; 2] = [
    "ro.build.version.security_patch",
    "ro.vendor.build.security_patch",
];
const OTA_VERSION_KEYS: [&str; 3] = [
    "ro.build.version.ota",
    "ro.build.display.ota",
    "ro.build.display.id",
];
const FINGERPRINT_KEYS: [&str; 4] = [
    "ro.build.fingerprint",
    "ro.system.build.fingerprint",
    "ro.vendor.build.fingerprint",
    "ro.product.build.fingerprint",
];
const BUILD_DATE_KEYS: [&str; 3] = [
    "ro.build.date",
    "ro.system.build.date",
    "ro.vendor.build.date",
];
const SDK_VERSION_KEYS: [&str; 3] = [
    "ro.build.version.sdk",
    "ro.system.build.version.sdk",
    "ro.vendor.build.version.sdk",
];
const BASEBAND_KEYS: [&str; 3] = ["ro.baseband", "ro.boot.baseband", "gsm.version.baseband"];

/// Vendor-specific keys worth surfacing verbatim when present
const EXTRA_KEYS: [&str; 5] = [
    "ro.miui.ui.version.name",
    "ro.build.version.oplusrom",
    "ro.build.version.realmeui",
    "ro.build.version.emui",
    "ro.vivo.os.version",
];

/// Matches the YYMMDD.NNN stamp embedded in build fingerprints
static PATCH_STAMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{6})\.\d{3}").unwrap());

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub brand: String,
    pub model: String,
    pub market_name: String,
    pub device: String,
    pub android_version: String,
    pub security_patch: String,
    pub ota_version: String,
    pub fingerprint: String,
    pub build_date: String,
    pub sdk_version: String,
    pub baseband: String,
    pub extras: IndexMap<String, String>,
}

fn first_usable(props: &PropertyMap, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|k| props.get(k))
        .map(str::trim)
        .find(|v| !v.is_empty() && !VALUE_BLACKLIST.iter().any(|b| v.eq_ignore_ascii_case(b)))
        .unwrap_or("")
        .to_owned()
}

/// `brand/product/device:version/...` - the version hides in the third
/// slash-delimited segment, after the colon.
fn version_from_fingerprint(fingerprint: &str) -> Option<String> {
    let third = fingerprint.split('/').nth(2)?;
    let (_, version) = third.split_once(':')?;
    if version.is_empty() {
        None
    } else {
        Some(version.to_owned())
    }
}

/// Recover a security-patch date from the YYMMDD.NNN build stamp.
fn patch_from_fingerprint(fingerprint: &str) -> Option<String> {
    let stamp = PATCH_STAMP.captures(fingerprint)?.get(1)?.as_str();
    Some(format!(
        "20{}-{}-{}",
        &stamp[0..2],
        &stamp[2..4],
        &stamp[4..6]
    ))
}

/// Project a merged property map to the canonical descriptor.
pub fn extract_device_info(props: &PropertyMap) -> DeviceInfo {
    let fingerprint = first_usable(props, &FINGERPRINT_KEYS);

    let mut android_version = first_usable(props, &ANDROID_VERSION_KEYS);
    if android_version.is_empty()
        && let Some(v) = version_from_fingerprint(&fingerprint)
    {
        android_version = v;
    }

    let mut security_patch = first_usable(props, &SECURITY_PATCH_KEYS);
    if security_patch.is_empty()
        && let Some(p) = patch_from_fingerprint(&fingerprint)
    {
        security_patch = p;
    }

    let mut extras = IndexMap::new();
    for key in EXTRA_KEYS {
        if let Some(v) = props.get(key)
            && !v.trim().is_empty()
        {
            extras.insert(key.to_owned(), v.to_owned());
        }
    }

    DeviceInfo {
        brand: first_usable(props, &BRAND_KEYS),
        model: first_usable(props, &MODEL_KEYS),
        market_name: first_usable(props, &MARKET_NAME_KEYS),
        device: first_usable(props, &DEVICE_KEYS),
        android_version,
        security_patch,
        ota_version: first_usable(props, &OTA_VERSION_KEYS),
        fingerprint,
        build_date: first_usable(props, &BUILD_DATE_KEYS),
        sdk_version: first_usable(props, &SDK_VERSION_KEYS),
        baseband: first_usable(props, &BASEBAND_KEYS),
        extras,
    }
}
