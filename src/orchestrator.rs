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
//! Applies a [`ReconciliationPlan`] to the controller.
//!
//! Work happens in stages that share one reboot budget: flush jobs that were
//! already committed, convert passthrough disks, and finally abandon
//! conflicting staged changes and stage, commit and run the new ones. After a
//! flush or a conversion the controller is read and planned again.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{error, info, warn};

use crate::model::join_ids;
use crate::planner::{self, ConfigPhase, RaidPlan, ReconciliationPlan};
use crate::{
    Clock, Controller, DesiredState, JobId, JobPoller, PendingJob, PowerState, ReconcileError,
    ReconcileOptions, Subsystem, SystemPowerControl,
};

/// Most reboot cycles a single run may perform.
pub const MAX_REBOOTS: u32 = 3;

/// Progress of one run. Lost when the run ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionState {
    pub reboots_performed: u32,
    pub jobs_outstanding: BTreeSet<JobId>,
    pub completed_jobs: Vec<JobId>,
    /// A call that changes the controller has succeeded.
    pub mutated: bool,
    pub last_error: Option<String>,
    pub phases: BTreeMap<Subsystem, ConfigPhase>,
}

pub struct Orchestrator<'a> {
    controller: &'a dyn Controller,
    clock: &'a dyn Clock,
    options: &'a ReconcileOptions,
    desired: &'a DesiredState,
    state: ExecutionState,
    // The host was off and a reboot cycle powered it on.
    powered_on: bool,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        controller: &'a dyn Controller,
        clock: &'a dyn Clock,
        options: &'a ReconcileOptions,
        desired: &'a DesiredState,
    ) -> Self {
        Orchestrator {
            controller,
            clock,
            options,
            desired,
            state: ExecutionState::default(),
            powered_on: false,
        }
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    /// Fail early when the plan cannot get anywhere without a reboot that
    /// is not allowed.
    pub fn preflight(
        plan: &ReconciliationPlan,
        options: &ReconcileOptions,
    ) -> Result<(), ReconcileError> {
        if options.reboot {
            return Ok(());
        }
        match plan.reboot_prerequisite() {
            Some((reason, jobs)) => Err(ReconcileError::RebootRequiredButDisallowed { reason, jobs }),
            None => Ok(()),
        }
    }

    pub async fn execute(&mut self, plan: &ReconciliationPlan) -> Result<(), ReconcileError> {
        let result = self.run(plan).await;
        if let Err(e) = &result {
            error!("Reconciliation failed: {e}");
            self.state.last_error = Some(e.to_string());
        }
        result
    }

    async fn run(&mut self, initial: &ReconciliationPlan) -> Result<(), ReconcileError> {
        let mut plan = initial.clone();
        let mut converted: BTreeSet<String> = BTreeSet::new();
        loop {
            self.record_phases(&plan);
            if plan.is_empty() {
                info!("Controller already matches the desired configuration");
                return Ok(());
            }
            Self::preflight(&plan, self.options)?;

            // Staged changes survive a flush or a conversion untouched, so
            // conflicts are only abandoned by the stage that replaces them.
            let flush = plan.flush_jobs();
            let unconverted = plan
                .raid
                .iter()
                .any(|raid| raid.convert.iter().any(|disk| !converted.contains(disk)));
            if !flush.is_empty() {
                self.flush(&plan, flush).await?;
            } else if unconverted {
                self.convert(&plan, &mut converted).await?;
            } else {
                return self.apply(&plan).await;
            }

            // Staging starts over from what the controller reports now.
            plan = planner::read_and_plan(self.controller, self.desired).await?;
        }
    }

    fn record_phases(&mut self, plan: &ReconciliationPlan) {
        for (target, phase, _) in plan.channels() {
            self.set_phase(target, phase);
        }
    }

    fn set_phase(&mut self, target: Subsystem, phase: ConfigPhase) {
        let previous = self.state.phases.insert(target.clone(), phase);
        if previous != Some(phase) {
            info!("{target}: {phase:?}");
        }
    }

    async fn abandon(&mut self, target: &Subsystem) -> Result<(), ReconcileError> {
        warn!("Abandoning uncommitted {target} changes that conflict with the desired configuration");
        self.controller.abandon_pending(target).await?;
        self.state.mutated = true;
        self.set_phase(target.clone(), ConfigPhase::Abandoned);
        Ok(())
    }

    /// Stage again what abandoning `raid` dropped besides the conflicting
    /// virtual disks.
    async fn restage(&mut self, raid: &RaidPlan) -> Result<(), ReconcileError> {
        let desired = self.desired;
        let wanted: BTreeSet<&str> = desired.raid.iter().map(|s| s.name.as_str()).collect();
        for id in &raid.delete {
            info!("Deleting virtual disk {id} on {} again", raid.controller);
            self.controller
                .delete_virtual_disk(&raid.controller, id)
                .await?;
        }
        for disk in raid
            .create
            .iter()
            .filter(|disk| !wanted.contains(disk.name.as_str()))
        {
            info!("Creating virtual disk {} on {} again", disk.name, raid.controller);
            self.controller
                .create_virtual_disk(&raid.controller, disk)
                .await?;
        }
        Ok(())
    }

    async fn flush(
        &mut self,
        plan: &ReconciliationPlan,
        jobs: Vec<PendingJob>,
    ) -> Result<(), ReconcileError> {
        let touched: BTreeSet<Subsystem> = plan
            .channels()
            .into_iter()
            .filter(|(_, phase, _)| *phase == ConfigPhase::PreCommitted)
            .map(|(target, _, _)| target)
            .collect();
        let ids: Vec<JobId> = jobs.iter().map(|job| job.id.clone()).collect();
        info!(
            "Running {} committed job(s) before staging new changes: {}",
            ids.len(),
            join_ids(&ids)
        );
        self.drive(jobs, &touched).await
    }

    async fn convert(
        &mut self,
        plan: &ReconciliationPlan,
        converted: &mut BTreeSet<String>,
    ) -> Result<(), ReconcileError> {
        let mut jobs = Vec::new();
        let mut touched = BTreeSet::new();
        for raid in &plan.raid {
            let disks: Vec<String> = raid
                .convert
                .iter()
                .filter(|disk| !converted.contains(*disk))
                .cloned()
                .collect();
            if disks.is_empty() {
                continue;
            }
            let target = raid.target();
            if raid.phase == ConfigPhase::Conflicting {
                self.abandon(&target).await?;
                self.restage(raid).await?;
            }
            info!(
                "Converting {} physical disk(s) on {} to RAID mode: {}",
                disks.len(),
                raid.controller,
                disks.join(", ")
            );
            self.controller
                .convert_physical_disks(&raid.controller, &disks)
                .await?;
            self.state.mutated = true;
            jobs.extend(self.commit(&target).await?);
            converted.extend(disks);
            touched.insert(target);
        }
        self.drive(jobs, &touched).await
    }

    async fn apply(&mut self, plan: &ReconciliationPlan) -> Result<(), ReconcileError> {
        let mut jobs = Vec::new();
        let mut touched = BTreeSet::new();
        for (target, phase, _) in plan.channels() {
            if phase == ConfigPhase::Conflicting {
                self.abandon(&target).await?;
            }
        }

        let bios = &plan.bios;
        if bios.needs_apply() {
            info!("Staging {} BIOS setting(s)", bios.apply.len());
            self.controller.set_bios_attributes(&bios.apply).await?;
            self.state.mutated = true;
            self.set_phase(Subsystem::Bios, ConfigPhase::Applied);
        }
        if bios.needs_commit() {
            jobs.extend(self.commit(&Subsystem::Bios).await?);
            touched.insert(Subsystem::Bios);
        } else if bios.phase == ConfigPhase::Committed {
            jobs.extend(bios.committed_jobs.iter().cloned());
            touched.insert(Subsystem::Bios);
        }

        for raid in &plan.raid {
            let target = raid.target();
            if raid.needs_apply() {
                for id in &raid.delete {
                    info!("Deleting virtual disk {id} on {}", raid.controller);
                    self.controller
                        .delete_virtual_disk(&raid.controller, id)
                        .await?;
                    self.state.mutated = true;
                }
                for disk in &raid.create {
                    info!(
                        "Creating RAID {} virtual disk {} on {} ({} MB)",
                        disk.raid_level, disk.name, raid.controller, disk.size_mb
                    );
                    self.controller
                        .create_virtual_disk(&raid.controller, disk)
                        .await?;
                    self.state.mutated = true;
                }
                self.set_phase(target.clone(), ConfigPhase::Applied);
            }
            if raid.needs_commit() {
                jobs.extend(self.commit(&target).await?);
                touched.insert(target);
            } else if raid.phase == ConfigPhase::Committed {
                jobs.extend(raid.committed_jobs.iter().cloned());
                touched.insert(target);
            }
        }

        self.drive(jobs, &touched).await?;
        for (target, _, _) in plan.channels() {
            self.set_phase(target, ConfigPhase::Complete);
        }
        Ok(())
    }

    async fn commit(&mut self, target: &Subsystem) -> Result<Vec<PendingJob>, ReconcileError> {
        let jobs = self.controller.commit_pending(target).await?;
        self.state.mutated = true;
        let ids: Vec<JobId> = jobs.iter().map(|job| job.id.clone()).collect();
        info!("Committed {target} changes as job(s) {}", join_ids(&ids));
        self.set_phase(target.clone(), ConfigPhase::Committed);
        Ok(jobs)
    }

    /// Run `jobs` to completion, rebooting while any of them waits for it.
    async fn drive(
        &mut self,
        jobs: Vec<PendingJob>,
        touched: &BTreeSet<Subsystem>,
    ) -> Result<(), ReconcileError> {
        let mut tracked: Vec<JobId> = Vec::new();
        let mut waiting: Vec<JobId> = Vec::new();
        for job in &jobs {
            if !tracked.contains(&job.id) {
                tracked.push(job.id.clone());
            }
            if job.is_awaiting_reboot() && !waiting.contains(&job.id) {
                waiting.push(job.id.clone());
            }
        }
        self.state.jobs_outstanding.extend(tracked.iter().cloned());

        let poller = JobPoller::from_options(self.controller, self.clock, self.options);
        while !tracked.is_empty() {
            let rebooted = !waiting.is_empty();
            if rebooted {
                self.reboot_cycle(&waiting).await?;
            }

            let report = poller.wait(&tracked).await?;
            for id in report.completed {
                self.state.jobs_outstanding.remove(&id);
                self.state.completed_jobs.push(id);
            }
            if !report.failed.is_empty() {
                for job in &report.failed {
                    self.state.jobs_outstanding.remove(&job.id);
                }
                return Err(ReconcileError::JobFailed {
                    jobs: report.failed,
                });
            }

            let mut next: Vec<JobId> = report
                .awaiting_reboot
                .into_iter()
                .map(|job| job.id)
                .collect();
            if rebooted {
                // Some changes only queue their follow up jobs once the host
                // has been through POST.
                for job in self.controller.unfinished_jobs().await? {
                    if touched.contains(&job.target)
                        && job.is_awaiting_reboot()
                        && !next.contains(&job.id)
                    {
                        info!("Job {} on {} waits for another reboot", job.id, job.target);
                        self.state.jobs_outstanding.insert(job.id.clone());
                        next.push(job.id);
                    }
                }
            }
            waiting = next.clone();
            tracked = next;
        }

        if self.powered_on {
            info!("Powering the host off again");
            self.controller.power(SystemPowerControl::ForceOff).await?;
            self.powered_on = false;
        }
        Ok(())
    }

    async fn reboot_cycle(&mut self, waiting: &[JobId]) -> Result<(), ReconcileError> {
        if !self.options.reboot {
            return Err(ReconcileError::RebootRequiredButDisallowed {
                reason: "committed jobs are waiting for a reboot".to_string(),
                jobs: waiting.to_vec(),
            });
        }
        if self.state.reboots_performed >= MAX_REBOOTS {
            return Err(ReconcileError::RebootBudgetExceeded {
                reboots: self.state.reboots_performed,
                jobs: waiting.to_vec(),
            });
        }
        let action = match self.controller.get_power_state().await? {
            PowerState::Off => {
                self.powered_on = true;
                SystemPowerControl::On
            }
            _ if self.options.force_reboot => SystemPowerControl::ForceRestart,
            _ => SystemPowerControl::GracefulRestart,
        };
        info!(
            "Reboot {}/{MAX_REBOOTS} ({action}) for job(s) {}",
            self.state.reboots_performed + 1,
            join_ids(waiting)
        );
        self.controller.power(action).await?;
        self.state.reboots_performed += 1;
        self.state.mutated = true;
        Ok(())
    }
}
