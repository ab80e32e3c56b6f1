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
//! Works out what has to happen to bring a controller to the desired state.
//!
//! Planning is pure: it looks at a [`ControllerSnapshot`] and never talks to
//! the controller. Each channel (the BIOS, or one RAID controller) is placed
//! in a [`ConfigPhase`] which tells the orchestrator where to start.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::Serialize;
use tracing::warn;

use crate::{
    BiosAttributes, Controller, ControllerError, DesiredState, JobId, PendingJob,
    PendingOperation, PhysicalDisk, RaidStatus, ReconcileError, Subsystem, ValidationError,
    VirtualDisk, VirtualDiskCreate, VirtualDiskSpec,
};

/// Where a channel stands in the stage, commit, reboot cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConfigPhase {
    /// Uncommitted staged values disagree with the desired ones.
    Conflicting,
    /// Conflicting staged values were dropped.
    Abandoned,
    /// Committed jobs must run before new changes can be staged.
    PreCommitted,
    /// Changes need staging.
    Uncommitted,
    /// Everything is staged, nothing is committed.
    Applied,
    /// Everything is committed and waits for the jobs to run.
    Committed,
    #[default]
    Complete,
}

impl ConfigPhase {
    pub fn initial(committed: bool, changing: bool, pending: bool, conflicting: bool) -> Self {
        if committed {
            if changing || conflicting {
                ConfigPhase::PreCommitted
            } else if pending {
                ConfigPhase::Committed
            } else {
                ConfigPhase::Complete
            }
        } else if conflicting {
            ConfigPhase::Conflicting
        } else if changing {
            ConfigPhase::Uncommitted
        } else if pending {
            ConfigPhase::Applied
        } else {
            ConfigPhase::Complete
        }
    }

    fn stages_changes(self) -> bool {
        matches!(
            self,
            ConfigPhase::Conflicting | ConfigPhase::Abandoned | ConfigPhase::Uncommitted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Resolution {
    /// Uncommitted changes of the channel are dropped and the rest restaged.
    Abandon,
    /// The committed job is run to completion, then the desired value is applied.
    Flush,
}

/// A staged change that disagrees with the desired state. The desired state
/// always wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictResolution {
    pub target: Subsystem,
    /// BIOS attribute or virtual disk name.
    pub item: String,
    pub pending: String,
    pub desired: String,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BiosPlan {
    pub phase: ConfigPhase,
    /// Values to stage.
    pub apply: BTreeMap<String, String>,
    /// Desired values the controller does not have yet.
    pub changing: BTreeMap<String, String>,
    pub committed_jobs: Vec<PendingJob>,
}

impl BiosPlan {
    pub fn needs_apply(&self) -> bool {
        self.phase.stages_changes() && !self.apply.is_empty()
    }

    pub fn needs_commit(&self) -> bool {
        self.needs_apply() || self.phase == ConfigPhase::Applied
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaidPlan {
    pub controller: String,
    pub phase: ConfigPhase,
    /// Passthrough disks to switch to RAID mode.
    pub convert: Vec<String>,
    pub create: Vec<VirtualDiskCreate>,
    /// Pending deletes to restage after an abandon.
    pub delete: Vec<String>,
    pub committed_jobs: Vec<PendingJob>,
}

impl RaidPlan {
    pub fn target(&self) -> Subsystem {
        Subsystem::Raid(self.controller.clone())
    }

    pub fn needs_apply(&self) -> bool {
        self.phase.stages_changes() && !(self.create.is_empty() && self.delete.is_empty())
    }

    pub fn needs_commit(&self) -> bool {
        self.needs_apply() || self.phase == ConfigPhase::Applied
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationPlan {
    pub bios: BiosPlan,
    /// One entry per RAID controller the desired state touches.
    pub raid: Vec<RaidPlan>,
    pub conflicts: Vec<ConflictResolution>,
}

impl ReconciliationPlan {
    pub fn is_empty(&self) -> bool {
        self.bios.phase == ConfigPhase::Complete
            && self
                .raid
                .iter()
                .all(|r| r.phase == ConfigPhase::Complete && r.convert.is_empty())
    }

    /// Every channel with its phase and the committed jobs found on it.
    pub fn channels(&self) -> Vec<(Subsystem, ConfigPhase, &[PendingJob])> {
        let mut channels = vec![(
            Subsystem::Bios,
            self.bios.phase,
            self.bios.committed_jobs.as_slice(),
        )];
        for raid in &self.raid {
            channels.push((raid.target(), raid.phase, raid.committed_jobs.as_slice()));
        }
        channels
    }

    pub fn flush_jobs(&self) -> Vec<PendingJob> {
        self.channels()
            .into_iter()
            .filter(|(_, phase, _)| *phase == ConfigPhase::PreCommitted)
            .flat_map(|(_, _, jobs)| jobs.iter().cloned())
            .collect()
    }

    pub fn needs_conversion(&self) -> bool {
        self.raid.iter().any(|r| !r.convert.is_empty())
    }

    /// Why the host has to reboot before anything new can be applied, and
    /// the jobs that wait for it.
    pub fn reboot_prerequisite(&self) -> Option<(String, Vec<JobId>)> {
        let mut reasons = Vec::new();
        let mut jobs = Vec::new();
        for (_, phase, committed) in self.channels() {
            if !matches!(phase, ConfigPhase::PreCommitted | ConfigPhase::Committed) {
                continue;
            }
            let waiting: Vec<JobId> = committed
                .iter()
                .filter(|job| job.is_awaiting_reboot())
                .map(|job| job.id.clone())
                .collect();
            if waiting.is_empty() {
                continue;
            }
            let reason = if phase == ConfigPhase::PreCommitted {
                "committed jobs must run before new changes can be staged"
            } else {
                "committed jobs are waiting for a reboot"
            };
            if !reasons.contains(&reason) {
                reasons.push(reason);
            }
            jobs.extend(waiting);
        }
        if self.needs_conversion() {
            reasons.push("physical disks must be converted to RAID mode");
        }
        (!reasons.is_empty()).then(|| (reasons.join("; "), jobs))
    }
}

/// What the controller reported, read once per planning round.
#[derive(Debug, Clone, Default)]
pub struct ControllerSnapshot {
    pub bios: BiosAttributes,
    pub physical_disks: Vec<PhysicalDisk>,
    pub virtual_disks: Vec<VirtualDisk>,
    pub jobs: Vec<PendingJob>,
}

impl ControllerSnapshot {
    /// Read only what `desired` needs: nothing at all for an empty state.
    pub async fn read(
        controller: &dyn Controller,
        desired: &DesiredState,
    ) -> Result<Self, ControllerError> {
        let mut snapshot = ControllerSnapshot::default();
        if desired.is_empty() {
            return Ok(snapshot);
        }
        if !desired.bios.is_empty() {
            snapshot.bios = controller.bios_attributes().await?;
        }
        if !desired.raid.is_empty() {
            snapshot.physical_disks = controller.physical_disks().await?;
            snapshot.virtual_disks = controller.virtual_disks().await?;
        }
        snapshot.jobs = controller.unfinished_jobs().await?;
        Ok(snapshot)
    }

    fn committed_jobs(&self, target: &Subsystem) -> Vec<PendingJob> {
        self.jobs
            .iter()
            .filter(|job| job.target == *target && job.state.is_committed())
            .cloned()
            .collect()
    }
}

/// Validate `desired`, read the controller and plan.
pub async fn read_and_plan(
    controller: &dyn Controller,
    desired: &DesiredState,
) -> Result<ReconciliationPlan, ReconcileError> {
    desired.validate()?;
    let snapshot = ControllerSnapshot::read(controller, desired).await?;
    Ok(plan(&snapshot, desired)?)
}

pub fn plan(
    snapshot: &ControllerSnapshot,
    desired: &DesiredState,
) -> Result<ReconciliationPlan, ValidationError> {
    desired.validate()?;
    let mut conflicts = Vec::new();
    let bios = plan_bios(snapshot, &desired.bios, &mut conflicts)?;
    let raid = plan_raid(snapshot, &desired.raid, &mut conflicts)?;
    for conflict in &conflicts {
        warn!(
            "{} {}: staged value {:?} conflicts with desired {:?}, resolving by {:?}",
            conflict.target, conflict.item, conflict.pending, conflict.desired, conflict.resolution
        );
    }
    Ok(ReconciliationPlan {
        bios,
        raid,
        conflicts,
    })
}

fn plan_bios(
    snapshot: &ControllerSnapshot,
    desired: &BTreeMap<String, String>,
    conflicts: &mut Vec<ConflictResolution>,
) -> Result<BiosPlan, ValidationError> {
    if desired.is_empty() {
        return Ok(BiosPlan::default());
    }
    let unknown: Vec<&str> = desired
        .keys()
        .filter(|name| !snapshot.bios.contains_key(*name))
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        return Err(ValidationError::UnknownBiosAttribute(unknown.join(", ")));
    }

    let committed_jobs = snapshot.committed_jobs(&Subsystem::Bios);
    let committed = !committed_jobs.is_empty();
    let mut changing = BTreeMap::new();
    let mut pending = false;
    let mut conflicting = false;
    for (name, goal) in desired {
        let Some(attribute) = snapshot.bios.get(name) else {
            continue;
        };
        match &attribute.pending_value {
            Some(staged) if staged == goal => {
                pending = true;
                continue;
            }
            Some(staged) => {
                conflicting = true;
                conflicts.push(ConflictResolution {
                    target: Subsystem::Bios,
                    item: name.clone(),
                    pending: staged.clone(),
                    desired: goal.clone(),
                    resolution: if committed {
                        Resolution::Flush
                    } else {
                        Resolution::Abandon
                    },
                });
            }
            None => {}
        }
        if attribute.current_value != *goal || attribute.pending_value.is_some() {
            changing.insert(name.clone(), goal.clone());
        }
    }

    let phase = ConfigPhase::initial(committed, !changing.is_empty(), pending, conflicting);
    let apply = if phase == ConfigPhase::Conflicting {
        // Abandoning drops every staged value, not only the conflicting ones.
        let mut apply: BTreeMap<String, String> = snapshot
            .bios
            .iter()
            .filter_map(|(name, a)| a.pending_value.clone().map(|p| (name.clone(), p)))
            .collect();
        apply.extend(changing.clone());
        apply
    } else {
        changing.clone()
    };

    Ok(BiosPlan {
        phase,
        apply,
        changing,
        committed_jobs,
    })
}

fn plan_raid(
    snapshot: &ControllerSnapshot,
    specs: &[VirtualDiskSpec],
    conflicts: &mut Vec<ConflictResolution>,
) -> Result<Vec<RaidPlan>, ValidationError> {
    let disks: HashMap<&str, &PhysicalDisk> = snapshot
        .physical_disks
        .iter()
        .map(|disk| (disk.id.as_str(), disk))
        .collect();

    let mut groups: Vec<(String, Vec<&VirtualDiskSpec>)> = Vec::new();
    for spec in specs {
        let controller = controller_of(spec, &disks)?;
        match groups.iter_mut().find(|(c, _)| *c == controller) {
            Some((_, group)) => group.push(spec),
            None => groups.push((controller, vec![spec])),
        }
    }

    groups
        .into_iter()
        .map(|(controller, group)| plan_controller(snapshot, &disks, controller, &group, conflicts))
        .collect()
}

fn controller_of(
    spec: &VirtualDiskSpec,
    disks: &HashMap<&str, &PhysicalDisk>,
) -> Result<String, ValidationError> {
    let unknown: Vec<&str> = spec
        .physical_disks
        .iter()
        .map(String::as_str)
        .filter(|id| !disks.contains_key(id))
        .collect();
    if !unknown.is_empty() {
        return Err(ValidationError::UnknownPhysicalDisks {
            name: spec.name.clone(),
            disks: unknown.join(", "),
        });
    }
    let controllers: BTreeSet<&str> = spec
        .physical_disks
        .iter()
        .filter_map(|id| disks.get(id.as_str()))
        .map(|disk| disk.controller.as_str())
        .collect();
    let mut iter = controllers.iter();
    match (iter.next(), iter.next()) {
        (Some(controller), None) => Ok(controller.to_string()),
        _ => Err(ValidationError::MultipleControllers {
            name: spec.name.clone(),
            controllers: controllers.into_iter().collect::<Vec<_>>().join(", "),
        }),
    }
}

fn describe_spec(spec: &VirtualDiskSpec) -> String {
    format!(
        "RAID {} on {}",
        spec.raid_level,
        spec.physical_disks.join(", ")
    )
}

fn describe_virtual_disk(disk: &VirtualDisk) -> String {
    format!(
        "RAID {} on {}",
        disk.raid_level,
        disk.physical_disks.join(", ")
    )
}

fn plan_controller(
    snapshot: &ControllerSnapshot,
    disks: &HashMap<&str, &PhysicalDisk>,
    controller: String,
    specs: &[&VirtualDiskSpec],
    conflicts: &mut Vec<ConflictResolution>,
) -> Result<RaidPlan, ValidationError> {
    let target = Subsystem::Raid(controller.clone());
    let committed_jobs = snapshot.committed_jobs(&target);
    let committed = !committed_jobs.is_empty();
    let on_controller: Vec<&VirtualDisk> = snapshot
        .virtual_disks
        .iter()
        .filter(|vd| vd.controller == controller)
        .collect();
    let existing: HashMap<&str, &VirtualDisk> = on_controller
        .iter()
        .copied()
        .map(|vd| (vd.name.as_str(), vd))
        .collect();

    let mut changing = false;
    let mut pending = false;
    let mut conflicting = false;
    for spec in specs {
        let Some(vd) = existing.get(spec.name.as_str()) else {
            changing = true;
            continue;
        };
        if spec.matches(vd) {
            match vd.pending_operation {
                Some(PendingOperation::Delete) => {
                    conflicting = true;
                    conflicts.push(ConflictResolution {
                        target: target.clone(),
                        item: spec.name.clone(),
                        pending: "delete".to_string(),
                        desired: describe_spec(spec),
                        resolution: if committed {
                            Resolution::Flush
                        } else {
                            Resolution::Abandon
                        },
                    });
                }
                Some(PendingOperation::Create) => pending = true,
                None => {}
            }
        } else {
            match vd.pending_operation {
                // Already on its way out.
                Some(PendingOperation::Delete) => changing = true,
                Some(PendingOperation::Create) if !committed => {
                    changing = true;
                    conflicting = true;
                    conflicts.push(ConflictResolution {
                        target: target.clone(),
                        item: spec.name.clone(),
                        pending: format!("create {}", describe_virtual_disk(vd)),
                        desired: describe_spec(spec),
                        resolution: Resolution::Abandon,
                    });
                }
                _ => {
                    return Err(ValidationError::VirtualDiskConflict {
                        name: spec.name.clone(),
                        controller,
                    })
                }
            }
        }
    }

    let phase = ConfigPhase::initial(committed, changing, pending, conflicting);
    let abandoning = phase == ConfigPhase::Conflicting;

    let mut convert: Vec<String> = Vec::new();
    for spec in specs {
        for id in &spec.physical_disks {
            let passthrough = disks
                .get(id.as_str())
                .is_some_and(|disk| disk.raid_status == RaidStatus::NonRaid);
            if passthrough && !convert.contains(id) {
                convert.push(id.clone());
            }
        }
    }

    let mut create = Vec::new();
    let mut delete = Vec::new();
    if phase != ConfigPhase::Complete {
        for spec in specs {
            let needed = match existing.get(spec.name.as_str()) {
                None => true,
                Some(vd) if spec.matches(vd) => match vd.pending_operation {
                    Some(PendingOperation::Create) => abandoning,
                    Some(PendingOperation::Delete) => !abandoning,
                    None => false,
                },
                Some(vd) => {
                    if abandoning && vd.pending_operation == Some(PendingOperation::Delete) {
                        delete.push(vd.id.clone());
                    }
                    true
                }
            };
            if needed {
                let member_size_mb = spec
                    .physical_disks
                    .iter()
                    .filter_map(|id| disks.get(id.as_str()))
                    .map(|disk| disk.size_mb)
                    .min()
                    .unwrap_or_default();
                create.push(VirtualDiskCreate::from_spec(spec, spec.size_mb(member_size_mb)));
            }
        }

        if abandoning {
            let wanted: HashSet<&str> = specs.iter().map(|s| s.name.as_str()).collect();
            for vd in on_controller.iter().copied() {
                if wanted.contains(vd.name.as_str()) {
                    continue;
                }
                match vd.pending_operation {
                    Some(PendingOperation::Create) => create.push(VirtualDiskCreate::from(vd)),
                    Some(PendingOperation::Delete) => delete.push(vd.id.clone()),
                    None => {}
                }
            }
        }
    }

    Ok(RaidPlan {
        controller,
        phase,
        convert,
        create,
        delete,
        committed_jobs,
    })
}
