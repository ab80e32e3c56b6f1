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

use tracing::{debug, info};

pub mod config;
mod dell;
mod error;
mod jsonmap;
pub mod model;
mod network;
pub mod orchestrator;
pub mod planner;
pub mod poller;
pub mod report;

pub use config::{DesiredState, ReconcileConfig, ReconcileOptions};
pub use dell::Bmc;
pub use error::{ControllerError, ReconcileError, ValidationError};
pub use model::{
    BiosAttribute, BiosAttributes, JobId, JobState, PendingJob, PendingOperation, PhysicalDisk,
    PowerState, RaidLevel, RaidStatus, Subsystem, SystemPowerControl, VirtualDisk,
    VirtualDiskCreate, VirtualDiskSpec,
};
pub use network::{Endpoint, RedfishClientPool, RedfishClientPoolBuilder, REDFISH_ENDPOINT};
pub use orchestrator::{ExecutionState, Orchestrator, MAX_REBOOTS};
pub use planner::{ConfigPhase, ControllerSnapshot, ReconciliationPlan};
pub use poller::{Clock, JobPoller, ManualClock, PollReport, TokioClock};
pub use report::ReconcileResult;

/// Interface to the BIOS and RAID configuration of a management controller.
/// All calls will include one or more network calls.
///
/// Changes are staged first and only take effect once committed. Committing
/// turns staged changes into jobs, most of which need a host reboot to run.
#[async_trait::async_trait]
pub trait Controller: Send + Sync {
    /// Every BIOS attribute with its current value and the value staged for
    /// it, if any.
    async fn bios_attributes(&self) -> Result<BiosAttributes, ControllerError>;

    /// Physical disks attached to any RAID controller.
    async fn physical_disks(&self) -> Result<Vec<PhysicalDisk>, ControllerError>;

    async fn virtual_disks(&self) -> Result<Vec<VirtualDisk>, ControllerError>;

    /// Jobs which have not yet completed or failed.
    async fn unfinished_jobs(&self) -> Result<Vec<PendingJob>, ControllerError>;

    async fn job_status(&self, id: &JobId) -> Result<PendingJob, ControllerError>;

    /// Stage new values for BIOS attributes. Values staged earlier for other
    /// attributes are kept.
    async fn set_bios_attributes(
        &self,
        values: &BTreeMap<String, String>,
    ) -> Result<(), ControllerError>;

    /// Stage switching passthrough disks of `controller` to RAID mode.
    async fn convert_physical_disks(
        &self,
        controller: &str,
        disks: &[String],
    ) -> Result<(), ControllerError>;

    async fn create_virtual_disk(
        &self,
        controller: &str,
        disk: &VirtualDiskCreate,
    ) -> Result<(), ControllerError>;

    async fn delete_virtual_disk(&self, controller: &str, id: &str) -> Result<(), ControllerError>;

    /// Drop every uncommitted change staged for `target`.
    async fn abandon_pending(&self, target: &Subsystem) -> Result<(), ControllerError>;

    /// Commit the changes staged for `target`, returning the jobs which will
    /// apply them.
    async fn commit_pending(&self, target: &Subsystem) -> Result<Vec<PendingJob>, ControllerError>;

    async fn get_power_state(&self) -> Result<PowerState, ControllerError>;

    async fn power(&self, action: SystemPowerControl) -> Result<(), ControllerError>;
}

/// Bring the controller to `desired`, or in check mode report whether that
/// would change anything. Failures are reported in the result, never raised.
pub async fn reconcile(
    controller: &dyn Controller,
    desired: &DesiredState,
    options: &ReconcileOptions,
    clock: &dyn Clock,
) -> ReconcileResult {
    info!(
        "Reconciling {} BIOS setting(s) and {} virtual disk(s){}",
        desired.bios.len(),
        desired.raid.len(),
        if options.check_mode { " in check mode" } else { "" }
    );
    let plan = match planner::read_and_plan(controller, desired).await {
        Ok(plan) => plan,
        Err(e) => return ReconcileResult::failure(&ExecutionState::default(), options, &e),
    };
    debug!("Plan: {plan:?}");

    if options.check_mode {
        let outcome = Orchestrator::preflight(&plan, options);
        return ReconcileResult::new(&plan, &ExecutionState::default(), options, outcome);
    }

    let mut orchestrator = Orchestrator::new(controller, clock, options, desired);
    let outcome = orchestrator.execute(&plan).await;
    ReconcileResult::new(&plan, orchestrator.state(), options, outcome)
}

/// Connect to the BMC `config` names, then [`reconcile_config`]. Connection
/// failures are reported in the result like any other.
pub async fn reconcile_endpoint(
    pool: &RedfishClientPool,
    config: &ReconcileConfig,
    clock: &dyn Clock,
) -> ReconcileResult {
    let options = match config.options() {
        Ok(options) => options,
        Err(e) => {
            return ReconcileResult::failure(
                &ExecutionState::default(),
                &ReconcileOptions::default(),
                &e.into(),
            )
        }
    };
    match pool.create_client(config.endpoint()).await {
        Ok(controller) => reconcile_config(controller.as_ref(), config, clock).await,
        Err(e) => ReconcileResult::failure(&ExecutionState::default(), &options, &e.into()),
    }
}

/// Validate caller supplied options, then [`reconcile`].
pub async fn reconcile_config(
    controller: &dyn Controller,
    config: &ReconcileConfig,
    clock: &dyn Clock,
) -> ReconcileResult {
    let options = match config.options() {
        Ok(options) => options,
        Err(e) => {
            return ReconcileResult::failure(
                &ExecutionState::default(),
                &ReconcileOptions::default(),
                &e.into(),
            )
        }
    };
    match config.desired_state() {
        Ok(desired) => reconcile(controller, &desired, &options, clock).await,
        Err(e) => ReconcileResult::failure(&ExecutionState::default(), &options, &e.into()),
    }
}
