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

use serde::Serialize;

use crate::model::join_ids;
use crate::planner::{ConflictResolution, ReconciliationPlan};
use crate::{ExecutionState, JobId, ReconcileError, ReconcileOptions, VirtualDiskCreate};

const NO_CHANGES: &str = "BIOS and RAID configuration already match the desired state";

/// A disk named by its controller and id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskRef {
    pub controller: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedVirtualDisk {
    pub controller: String,
    #[serde(flatten)]
    pub disk: VirtualDiskCreate,
}

/// The single record every run ends with, success or not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileResult {
    pub changed: bool,
    pub failed: bool,
    pub message: String,
    pub reboots_performed: u32,
    pub reboot_required: bool,
    pub changed_bios_settings: BTreeMap<String, String>,
    pub converted_physical_disks: Vec<DiskRef>,
    pub created_virtual_disks: Vec<CreatedVirtualDisk>,
    pub deleted_virtual_disks: Vec<DiskRef>,
    pub conflicts: Vec<ConflictResolution>,
    pub completed_jobs: Vec<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl ReconcileResult {
    pub fn new(
        plan: &ReconciliationPlan,
        state: &ExecutionState,
        options: &ReconcileOptions,
        outcome: Result<(), ReconcileError>,
    ) -> Self {
        let mut result = Self::from_plan(plan);
        result.reboots_performed = state.reboots_performed;
        result.completed_jobs = state.completed_jobs.clone();
        match outcome {
            Ok(()) => {
                result.changed = !plan.is_empty();
                result.message = if !result.changed {
                    NO_CHANGES.to_string()
                } else if options.check_mode {
                    result.reboot_required = !options.reboot;
                    format!("Check mode: would apply {}", result.summary())
                } else {
                    format!(
                        "Applied {} with {} reboot(s)",
                        result.summary(),
                        state.reboots_performed
                    )
                };
            }
            Err(e) => result.fail(state, options, &e),
        }
        result
    }

    /// A run that failed before a plan existed.
    pub fn failure(
        state: &ExecutionState,
        options: &ReconcileOptions,
        error: &ReconcileError,
    ) -> Self {
        let mut result = ReconcileResult {
            reboots_performed: state.reboots_performed,
            completed_jobs: state.completed_jobs.clone(),
            ..Default::default()
        };
        result.fail(state, options, error);
        result
    }

    pub fn success(&self) -> bool {
        !self.failed
    }

    fn fail(&mut self, state: &ExecutionState, options: &ReconcileOptions, error: &ReconcileError) {
        self.failed = true;
        self.changed = !options.check_mode && state.mutated;
        self.reboot_required = matches!(error, ReconcileError::RebootRequiredButDisallowed { .. });
        self.error_kind = Some(error.kind().to_string());
        self.message = error.to_string();
        if !state.completed_jobs.is_empty() {
            self.message.push_str(&format!(
                ". Completed before the failure: {}",
                join_ids(&state.completed_jobs)
            ));
        }
    }

    fn from_plan(plan: &ReconciliationPlan) -> Self {
        let mut result = ReconcileResult {
            changed_bios_settings: plan.bios.changing.clone(),
            conflicts: plan.conflicts.clone(),
            ..Default::default()
        };
        for raid in &plan.raid {
            result
                .converted_physical_disks
                .extend(raid.convert.iter().map(|id| DiskRef {
                    controller: raid.controller.clone(),
                    id: id.clone(),
                }));
            result
                .created_virtual_disks
                .extend(raid.create.iter().map(|disk| CreatedVirtualDisk {
                    controller: raid.controller.clone(),
                    disk: disk.clone(),
                }));
            result
                .deleted_virtual_disks
                .extend(raid.delete.iter().map(|id| DiskRef {
                    controller: raid.controller.clone(),
                    id: id.clone(),
                }));
        }
        result
    }

    fn summary(&self) -> String {
        let mut parts = Vec::new();
        let counts = [
            (self.changed_bios_settings.len(), "BIOS setting(s)"),
            (self.converted_physical_disks.len(), "physical disk conversion(s)"),
            (self.created_virtual_disks.len(), "virtual disk creation(s)"),
            (self.deleted_virtual_disks.len(), "virtual disk deletion(s)"),
        ];
        for (count, what) in counts {
            if count > 0 {
                parts.push(format!("{count} {what}"));
            }
        }
        if parts.is_empty() {
            // Only staged or committed changes were left to run
            "pending changes".to_string()
        } else {
            parts.join(", ")
        }
    }
}
