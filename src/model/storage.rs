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
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::InvalidValueError;
use crate::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RaidLevel {
    Raid0,
    Raid1,
    Raid5,
    Raid6,
    Raid10,
    Raid50,
    Raid60,
}

impl RaidLevel {
    pub fn min_physical_disks(self) -> usize {
        match self {
            RaidLevel::Raid0 => 1,
            RaidLevel::Raid1 => 2,
            RaidLevel::Raid5 => 3,
            RaidLevel::Raid6 => 4,
            RaidLevel::Raid10 => 4,
            RaidLevel::Raid50 => 6,
            RaidLevel::Raid60 => 8,
        }
    }

    pub fn parity_disks_per_span(self) -> u32 {
        match self {
            RaidLevel::Raid5 | RaidLevel::Raid50 => 1,
            RaidLevel::Raid6 | RaidLevel::Raid60 => 2,
            _ => 0,
        }
    }

    pub fn is_mirrored(self) -> bool {
        matches!(self, RaidLevel::Raid1 | RaidLevel::Raid10)
    }

    /// Redfish `RAIDType` value.
    pub fn redfish_type(self) -> &'static str {
        match self {
            RaidLevel::Raid0 => "RAID0",
            RaidLevel::Raid1 => "RAID1",
            RaidLevel::Raid5 => "RAID5",
            RaidLevel::Raid6 => "RAID6",
            RaidLevel::Raid10 => "RAID10",
            RaidLevel::Raid50 => "RAID50",
            RaidLevel::Raid60 => "RAID60",
        }
    }
}

impl fmt::Display for RaidLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redfish_type()[4..])
    }
}

impl FromStr for RaidLevel {
    type Err = InvalidValueError;

    // Accepts "1", "RAID1", "raid10", "1+0" and friends.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let level = match trimmed.get(..4) {
            Some(prefix) if prefix.eq_ignore_ascii_case("raid") => trimmed[4..].trim_start_matches('-'),
            _ => trimmed,
        };
        match level {
            "0" => Ok(RaidLevel::Raid0),
            "1" => Ok(RaidLevel::Raid1),
            "5" => Ok(RaidLevel::Raid5),
            "6" => Ok(RaidLevel::Raid6),
            "10" | "1+0" => Ok(RaidLevel::Raid10),
            "50" | "5+0" => Ok(RaidLevel::Raid50),
            "60" | "6+0" => Ok(RaidLevel::Raid60),
            _ => Err(InvalidValueError(format!("Invalid RAID level value: {s}"))),
        }
    }
}

impl TryFrom<String> for RaidLevel {
    type Error = InvalidValueError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RaidLevel> for String {
    fn from(level: RaidLevel) -> Self {
        level.to_string()
    }
}

/// RAID status of a physical disk as reported by the RAID controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaidStatus {
    Ready,
    Online,
    /// Passthrough mode. The disk has to be converted before it can join a
    /// virtual disk.
    NonRaid,
    Other(String),
}

impl From<&str> for RaidStatus {
    fn from(s: &str) -> Self {
        match s {
            "Ready" => RaidStatus::Ready,
            "Online" => RaidStatus::Online,
            "NonRAID" | "Non-RAID" | "NonRaid" => RaidStatus::NonRaid,
            other => RaidStatus::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalDisk {
    pub id: String,
    pub controller: String,
    pub size_mb: u64,
    pub raid_status: RaidStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingOperation {
    Create,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDisk {
    pub id: String,
    pub name: String,
    pub controller: String,
    pub raid_level: RaidLevel,
    pub span_length: u32,
    pub span_depth: u32,
    pub physical_disks: Vec<String>,
    pub size_mb: u64,
    pub pending_operation: Option<PendingOperation>,
}

impl VirtualDisk {
    pub fn disk_set(&self) -> BTreeSet<&str> {
        self.physical_disks.iter().map(String::as_str).collect()
    }
}

/// A virtual disk the caller wants to exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDiskSpec {
    pub name: String,
    pub raid_level: RaidLevel,
    pub span_length: u32,
    pub span_depth: u32,
    pub physical_disks: Vec<String>,
}

impl VirtualDiskSpec {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let given = self.physical_disks.len();
        let required = self.raid_level.min_physical_disks();
        if given < required {
            return Err(ValidationError::InsufficientPhysicalDisks {
                name: self.name.clone(),
                raid_level: self.raid_level,
                required,
                given,
            });
        }
        let mut seen = BTreeSet::new();
        for disk in &self.physical_disks {
            if !seen.insert(disk.as_str()) {
                return Err(ValidationError::DuplicatePhysicalDisk {
                    name: self.name.clone(),
                    disk: disk.clone(),
                });
            }
        }
        let spanned = u64::from(self.span_length) * u64::from(self.span_depth);
        if spanned != given as u64 {
            return Err(ValidationError::SpanMismatch {
                name: self.name.clone(),
                span_length: self.span_length,
                span_depth: self.span_depth,
                given,
            });
        }
        Ok(())
    }

    /// Same name, RAID level and set of physical disks.
    pub fn matches(&self, disk: &VirtualDisk) -> bool {
        self.name == disk.name
            && self.raid_level == disk.raid_level
            && self.disk_set() == disk.disk_set()
    }

    pub fn disk_set(&self) -> BTreeSet<&str> {
        self.physical_disks.iter().map(String::as_str).collect()
    }

    /// Usable capacity when every member contributes `member_size_mb`.
    pub fn size_mb(&self, member_size_mb: u64) -> u64 {
        let effective_span_length = if self.raid_level.is_mirrored() {
            1
        } else {
            self.span_length
                .saturating_sub(self.raid_level.parity_disks_per_span())
        };
        member_size_mb * u64::from(effective_span_length) * u64::from(self.span_depth)
    }
}

/// Arguments of a single virtual disk creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDiskCreate {
    pub name: String,
    pub raid_level: RaidLevel,
    pub span_length: u32,
    pub span_depth: u32,
    pub physical_disks: Vec<String>,
    pub size_mb: u64,
}

impl VirtualDiskCreate {
    pub fn from_spec(spec: &VirtualDiskSpec, size_mb: u64) -> Self {
        VirtualDiskCreate {
            name: spec.name.clone(),
            raid_level: spec.raid_level,
            span_length: spec.span_length,
            span_depth: spec.span_depth,
            physical_disks: spec.physical_disks.clone(),
            size_mb,
        }
    }
}

impl From<&VirtualDisk> for VirtualDiskCreate {
    fn from(disk: &VirtualDisk) -> Self {
        VirtualDiskCreate {
            name: disk.name.clone(),
            raid_level: disk.raid_level,
            span_length: disk.span_length,
            span_depth: disk.span_depth,
            physical_disks: disk.physical_disks.clone(),
            size_mb: disk.size_mb,
        }
    }
}
