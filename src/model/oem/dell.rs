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
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{
    typed_attribute_value, InvalidValueError, JobId, JobState, ODataId, PendingJob, PendingOperation, PhysicalDisk,
    RaidLevel, RaidStatus, Subsystem, VirtualDisk, VirtualDiskCreate,
};
use crate::ControllerError;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Dell job types that run without a host reboot.
const REALTIME_JOB_TYPE: &str = "RealTimeNoRebootConfiguration";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum DellJobState {
    New,
    Scheduled,
    Running,
    Completed,
    Failed,
    CompletedWithErrors,
    Downloaded,
    Downloading,
    ReadyForExecution,
    Waiting,
    Paused,
    #[serde(other)]
    Unknown,
}

impl DellJobState {
    pub fn to_job_state(self) -> JobState {
        match self {
            DellJobState::New => JobState::Uncommitted,
            DellJobState::Scheduled
            | DellJobState::Waiting
            | DellJobState::ReadyForExecution
            | DellJobState::Downloaded => JobState::Scheduled,
            DellJobState::Completed => JobState::Completed,
            DellJobState::Failed | DellJobState::CompletedWithErrors => JobState::Failed,
            DellJobState::Running
            | DellJobState::Downloading
            | DellJobState::Paused
            | DellJobState::Unknown => JobState::Running,
        }
    }
}

impl fmt::Display for DellJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct Job {
    pub id: String,
    pub name: Option<String>,
    pub job_state: DellJobState,
    pub job_type: Option<String>,
    pub message: Option<String>,
    pub percent_complete: Option<i64>,
    #[serde(rename = "TargetSettingsURI")]
    pub target_settings_uri: Option<String>,
}

impl Job {
    pub fn job_id(&self) -> JobId {
        JobId(self.id.clone())
    }

    /// Work out what a job configures. Dell names RAID jobs after the
    /// controller, e.g. "Configure: RAID.Integrated.1-1".
    pub fn subsystem(&self) -> Subsystem {
        let name = self.name.as_deref().unwrap_or_default();
        match self.job_type.as_deref() {
            Some("BIOSConfiguration") => Subsystem::Bios,
            Some("RAIDConfiguration") | Some(REALTIME_JOB_TYPE) => {
                match name.rsplit(':').next().map(str::trim) {
                    Some(controller) if controller.starts_with("RAID.") => {
                        Subsystem::Raid(controller.to_string())
                    }
                    _ => Subsystem::Other(name.to_string()),
                }
            }
            _ if name.starts_with("ConfigBIOS") => Subsystem::Bios,
            Some(other) => Subsystem::Other(other.to_string()),
            None => Subsystem::Other(name.to_string()),
        }
    }

    pub fn is_realtime(&self) -> bool {
        self.job_type.as_deref() == Some(REALTIME_JOB_TYPE)
    }

    pub fn to_pending_job(&self, requires_reboot: bool) -> PendingJob {
        PendingJob {
            id: self.job_id(),
            target: self.subsystem(),
            state: self.job_state.to_job_state(),
            requires_reboot,
            message: self.message.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct JobCollection {
    #[serde(default)]
    pub members: Vec<Job>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct StorageController {
    pub id: String,
    #[serde(default)]
    pub drives: Vec<ODataId>,
    pub volumes: Option<ODataId>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct Drive {
    pub id: String,
    pub capacity_bytes: Option<u64>,
    pub oem: Option<DriveOem>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct DriveOem {
    pub dell: Option<DriveOemDell>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct DriveOemDell {
    pub dell_physical_disk: Option<DellPhysicalDisk>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct DellPhysicalDisk {
    pub raid_status: Option<String>,
}

impl Drive {
    pub fn raid_status(&self) -> RaidStatus {
        self.oem
            .as_ref()
            .and_then(|oem| oem.dell.as_ref())
            .and_then(|dell| dell.dell_physical_disk.as_ref())
            .and_then(|disk| disk.raid_status.as_deref())
            .map(RaidStatus::from)
            .unwrap_or_else(|| RaidStatus::Other("Unknown".to_string()))
    }

    pub fn to_physical_disk(&self, controller: &str) -> PhysicalDisk {
        PhysicalDisk {
            id: self.id.clone(),
            controller: controller.to_string(),
            size_mb: self.capacity_bytes.unwrap_or_default() / BYTES_PER_MB,
            raid_status: self.raid_status(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeCollection {
    #[serde(default)]
    pub members: Vec<Volume>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct Volume {
    pub id: String,
    pub name: Option<String>,
    #[serde(rename = "RAIDType")]
    pub raid_type: Option<String>,
    pub capacity_bytes: Option<u64>,
    #[serde(default)]
    pub links: VolumeLinks,
    pub oem: Option<VolumeOem>,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeLinks {
    #[serde(default)]
    pub drives: Vec<ODataId>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeOem {
    pub dell: Option<VolumeOemDell>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeOemDell {
    pub dell_virtual_disk: Option<DellVirtualDisk>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct DellVirtualDisk {
    pub span_depth: Option<u32>,
    pub span_length: Option<u32>,
    #[serde(default)]
    pub pending_operations: Option<String>,
}

impl Volume {
    fn dell(&self) -> Option<&DellVirtualDisk> {
        self.oem
            .as_ref()
            .and_then(|oem| oem.dell.as_ref())
            .and_then(|dell| dell.dell_virtual_disk.as_ref())
    }

    pub fn pending_operation(&self) -> Option<PendingOperation> {
        let pending = self.dell()?.pending_operations.as_deref()?;
        if pending.contains("Delete") {
            Some(PendingOperation::Delete)
        } else if pending.contains("Create") {
            Some(PendingOperation::Create)
        } else {
            None
        }
    }

    pub fn to_virtual_disk(&self, controller: &str, url: &str) -> Result<VirtualDisk, ControllerError> {
        let raid_type = self
            .raid_type
            .as_deref()
            .ok_or_else(|| ControllerError::MissingKey {
                key: "RAIDType".to_string(),
                url: url.to_string(),
            })?;
        let raid_level: RaidLevel =
            raid_type
                .parse()
                .map_err(|err: InvalidValueError| ControllerError::InvalidValue {
                    url: url.to_string(),
                    field: "RAIDType".to_string(),
                    err,
                })?;
        let physical_disks = self
            .links
            .drives
            .iter()
            .map(|drive| drive.odata_id_get().map(str::to_string))
            .collect::<Result<Vec<_>, _>>()?;
        let span_depth = self.dell().and_then(|d| d.span_depth).unwrap_or(1).max(1);
        let span_length = self
            .dell()
            .and_then(|d| d.span_length)
            .unwrap_or(physical_disks.len() as u32 / span_depth);
        Ok(VirtualDisk {
            id: self.id.clone(),
            name: self.name.clone().unwrap_or_default(),
            controller: controller.to_string(),
            raid_level,
            span_length,
            span_depth,
            physical_disks,
            size_mb: self.capacity_bytes.unwrap_or_default() / BYTES_PER_MB,
            pending_operation: self.pending_operation(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Copy, Clone)]
pub enum RedfishSettingsApplyTime {
    Immediate,
    OnReset,
}

impl fmt::Display for RedfishSettingsApplyTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct SetBiosAttrs {
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl SetBiosAttrs {
    /// Integer and boolean attributes are rejected by iDRAC when written as
    /// strings, so each value takes the type of the current one.
    pub fn typed(
        values: &BTreeMap<String, String>,
        current: &serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        SetBiosAttrs {
            attributes: values
                .iter()
                .map(|(name, value)| (name.clone(), typed_attribute_value(value, current.get(name))))
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct CreateJob {
    #[serde(rename = "TargetSettingsURI")]
    pub target_settings_uri: String,
}

#[derive(Debug, Serialize, Clone)]
pub struct ConvertToRaid {
    #[serde(rename = "PDArray")]
    pub pd_array: Vec<String>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct CreateVolume {
    pub name: String,
    #[serde(rename = "RAIDType")]
    pub raid_type: String,
    pub capacity_bytes: u64,
    pub drives: Vec<ODataId>,
    pub oem: CreateVolumeOem,
    #[serde(rename = "@Redfish.OperationApplyTime")]
    pub apply_time: RedfishSettingsApplyTime,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct CreateVolumeOem {
    pub dell: CreateVolumeOemDell,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct CreateVolumeOemDell {
    pub dell_virtual_disk: CreateDellVirtualDisk,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct CreateDellVirtualDisk {
    pub span_depth: u32,
    pub span_length: u32,
}

impl CreateVolume {
    /// `drive_root` is the storage controller the drives hang off,
    /// e.g. `/redfish/v1/Systems/System.Embedded.1/Storage/RAID.Integrated.1-1`.
    pub fn new(disk: &VirtualDiskCreate, drive_root: &str) -> Self {
        CreateVolume {
            name: disk.name.clone(),
            raid_type: disk.raid_level.redfish_type().to_string(),
            capacity_bytes: disk.size_mb * BYTES_PER_MB,
            drives: disk
                .physical_disks
                .iter()
                .map(|id| ODataId::from(format!("{drive_root}/Drives/{id}")))
                .collect(),
            oem: CreateVolumeOem {
                dell: CreateVolumeOemDell {
                    dell_virtual_disk: CreateDellVirtualDisk {
                        span_depth: disk.span_depth,
                        span_length: disk.span_length,
                    },
                },
            },
            apply_time: RedfishSettingsApplyTime::OnReset,
        }
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct DeleteVolume {
    #[serde(rename = "@Redfish.OperationApplyTime")]
    pub apply_time: RedfishSettingsApplyTime,
}
