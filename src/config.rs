/*
 * SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: MIT
 *
 * Permission is hereby granted, free of charge, to any person obtaining a
 * copy of this software and associated documentation files (the "Software"),
 * to deal in the Software without restriction, including without limitation
 * the rights to use, copy, modify, merge, publish, distribute, sublicense,
 * and/or sell copies of the Software, and to permit persons to whom the
 * Software is furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL
 * THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
 * DEALINGS IN THE SOFTWARE.
 */
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Endpoint, RaidLevel, ValidationError, VirtualDiskSpec};

pub const DEFAULT_INTERVAL_SECS: u64 = 5;

/// Caller supplied options, as loosely typed as they arrive. Nothing here has
/// been validated; see [`ReconcileConfig::options`] and
/// [`ReconcileConfig::desired_state`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub address: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub bios_config: serde_json::Map<String, Value>,
    pub raid_config: Vec<Value>,
    pub reboot: bool,
    pub force_reboot: bool,
    /// Seconds. 0 waits forever.
    pub timeout: u64,
    /// Seconds between job status checks.
    pub interval: u64,
    pub check_mode: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        ReconcileConfig {
            address: String::new(),
            port: None,
            username: None,
            password: None,
            bios_config: serde_json::Map::new(),
            raid_config: Vec::new(),
            reboot: false,
            force_reboot: false,
            timeout: 0,
            interval: DEFAULT_INTERVAL_SECS,
            check_mode: false,
        }
    }
}

/// How a reconciliation run behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Allow rebooting the host to apply committed jobs.
    pub reboot: bool,
    /// Reboot with ForceRestart instead of GracefulRestart.
    pub force_reboot: bool,
    /// Limit on each wait for jobs. None waits forever.
    pub timeout: Option<Duration>,
    pub interval: Duration,
    /// Plan only, never change anything.
    pub check_mode: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        ReconcileOptions {
            reboot: false,
            force_reboot: false,
            timeout: None,
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            check_mode: false,
        }
    }
}

/// The configuration the controller should end up with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    pub bios: BTreeMap<String, String>,
    /// Order is kept when creating virtual disks.
    pub raid: Vec<VirtualDiskSpec>,
}

impl DesiredState {
    pub fn is_empty(&self) -> bool {
        self.bios.is_empty() && self.raid.is_empty()
    }

    /// Checks that need no knowledge of the controller.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut names = HashSet::new();
        let mut owners: HashMap<&str, &str> = HashMap::new();
        for spec in &self.raid {
            spec.validate()?;
            if !names.insert(spec.name.as_str()) {
                return Err(ValidationError::DuplicateVirtualDisk(spec.name.clone()));
            }
            for disk in &spec.physical_disks {
                if let Some(first) = owners.insert(disk.as_str(), spec.name.as_str()) {
                    return Err(ValidationError::SharedPhysicalDisk {
                        disk: disk.clone(),
                        first: first.to_string(),
                        second: spec.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl ReconcileConfig {
    /// Load the JSON document at `path`.
    pub fn from_file(path: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidDocument {
            path: path.to_string(),
            reason,
        };
        let contents = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        serde_json::from_str(&contents).map_err(|e| invalid(e.to_string()))
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.address.clone(),
            port: self.port,
            user: self.username.clone(),
            password: self.password.clone(),
        }
    }

    pub fn options(&self) -> Result<ReconcileOptions, ValidationError> {
        if self.interval == 0 {
            return Err(ValidationError::InvalidInterval);
        }
        Ok(ReconcileOptions {
            reboot: self.reboot,
            force_reboot: self.force_reboot,
            timeout: (self.timeout > 0).then(|| Duration::from_secs(self.timeout)),
            interval: Duration::from_secs(self.interval),
            check_mode: self.check_mode,
        })
    }

    pub fn desired_state(&self) -> Result<DesiredState, ValidationError> {
        let mut non_strings: Vec<&str> = Vec::new();
        let mut bios = BTreeMap::new();
        for (name, value) in &self.bios_config {
            match value {
                Value::String(s) => {
                    bios.insert(name.clone(), s.clone());
                }
                _ => non_strings.push(name),
            }
        }
        if !non_strings.is_empty() {
            non_strings.sort_unstable();
            return Err(ValidationError::NonStringBiosValue(non_strings.join(", ")));
        }

        let raid = self
            .raid_config
            .iter()
            .enumerate()
            .map(|(index, item)| parse_virtual_disk(index, item))
            .collect::<Result<Vec<_>, _>>()?;

        let desired = DesiredState { bios, raid };
        desired.validate()?;
        Ok(desired)
    }
}

fn invalid(index: usize, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidVirtualDisk {
        index,
        reason: reason.into(),
    }
}

/// One `raid_config` item as the caller writes it.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RaidItem {
    name: String,
    raid_level: IntOrString,
    span_length: IntOrString,
    span_depth: IntOrString,
    #[serde(alias = "physical_disks")]
    pdisks: Vec<String>,
}

// Integers may arrive as JSON numbers or as numeric strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IntOrString {
    Int(u64),
    String(String),
}

impl IntOrString {
    fn positive(&self) -> Option<u32> {
        let value = match self {
            IntOrString::Int(n) => Some(*n),
            IntOrString::String(s) => s.trim().parse::<u64>().ok(),
        };
        value
            .filter(|v| *v > 0)
            .and_then(|v| u32::try_from(v).ok())
    }
}

impl fmt::Display for IntOrString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntOrString::Int(n) => write!(f, "{n}"),
            IntOrString::String(s) => f.write_str(s),
        }
    }
}

fn parse_virtual_disk(index: usize, item: &Value) -> Result<VirtualDiskSpec, ValidationError> {
    let item: RaidItem =
        serde_json::from_value(item.clone()).map_err(|e| invalid(index, e.to_string()))?;
    if item.name.is_empty() {
        return Err(invalid(index, "'name' must be a non-empty string"));
    }

    let raw_level = item.raid_level.to_string();
    let raid_level: RaidLevel =
        raw_level
            .parse()
            .map_err(|_| ValidationError::UnsupportedRaidLevel {
                name: item.name.clone(),
                raid_level: raw_level.clone(),
            })?;

    let span_length = item
        .span_length
        .positive()
        .ok_or_else(|| invalid(index, "'span_length' must be a positive integer"))?;
    let span_depth = item
        .span_depth
        .positive()
        .ok_or_else(|| invalid(index, "'span_depth' must be a positive integer"))?;
    if item.pdisks.is_empty() {
        return Err(invalid(index, "'pdisks' must be a non-empty list of disk ids"));
    }

    Ok(VirtualDiskSpec {
        name: item.name,
        raid_level,
        span_length,
        span_depth,
        physical_disks: item.pdisks,
    })
}
