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
use std::sync::{Mutex, Once};
use std::time::Duration;

use redfish_reconcile::planner::Resolution;
use redfish_reconcile::{
    reconcile, reconcile_config, reconcile_endpoint, BiosAttribute, BiosAttributes, Controller,
    ControllerError, DesiredState, JobId, JobState, ManualClock, PendingJob, PendingOperation,
    PhysicalDisk, PowerState, RaidLevel, RaidStatus, ReconcileConfig, ReconcileOptions,
    RedfishClientPool, Subsystem, SystemPowerControl, VirtualDisk, VirtualDiskCreate,
    VirtualDiskSpec,
};
use serde_json::json;

static SETUP: Once = Once::new();

const CTRL: &str = "RAID.Integrated.1-1";
const DISK_MB: u64 = 915_200;

const MUTATING_CALLS: [&str; 7] = [
    "set_bios_attributes",
    "convert_physical_disks",
    "create_virtual_disk",
    "delete_virtual_disk",
    "abandon_pending",
    "commit_pending",
    "power",
];

fn disk_id(bay: u32) -> String {
    format!("Disk.Bay.{bay}:Enclosure.Internal.0-1:{CTRL}")
}

/// How jobs committed during a test behave.
#[derive(Debug, Clone, Copy)]
struct JobBehaviour {
    /// Reboots before the job starts running.
    reboots: u32,
    /// Status queries while running.
    polls: u32,
    fails: bool,
}

impl Default for JobBehaviour {
    fn default() -> Self {
        JobBehaviour {
            reboots: 1,
            polls: 1,
            fails: false,
        }
    }
}

#[derive(Debug)]
struct FakeJob {
    target: Subsystem,
    state: JobState,
    behaviour: JobBehaviour,
    bios: BTreeMap<String, String>,
    creates: Vec<String>,
    deletes: Vec<String>,
    converts: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<String>,
    bios: BTreeMap<String, BiosAttribute>,
    disks: Vec<PhysicalDisk>,
    virtual_disks: Vec<VirtualDisk>,
    staged_converts: Vec<String>,
    jobs: BTreeMap<JobId, FakeJob>,
    next_job: u32,
    next_virtual_disk: u32,
    behaviour: JobBehaviour,
    power: Option<PowerState>,
}

impl State {
    fn add_job(&mut self, mut job: FakeJob) -> JobId {
        self.next_job += 1;
        let id = JobId(format!("JID_{:03}", self.next_job));
        if job.behaviour.reboots == 0 {
            job.state = JobState::Running;
        }
        self.jobs.insert(id.clone(), job);
        id
    }

    fn pending_job(&self, id: &JobId) -> Option<PendingJob> {
        self.jobs.get(id).map(|job| PendingJob {
            id: id.clone(),
            target: job.target.clone(),
            state: job.state,
            requires_reboot: job.state == JobState::Scheduled,
            message: (job.state == JobState::Failed).then(|| "Job failed".to_string()),
        })
    }

    fn reset(&mut self) {
        for job in self.jobs.values_mut() {
            if job.state == JobState::Scheduled {
                job.behaviour.reboots = job.behaviour.reboots.saturating_sub(1);
                if job.behaviour.reboots == 0 {
                    job.state = JobState::Running;
                }
            }
        }
    }

    fn poll(&mut self, id: &JobId) {
        let Some(job) = self.jobs.get_mut(id) else {
            return;
        };
        if job.state != JobState::Running {
            return;
        }
        if job.behaviour.polls > 0 {
            job.behaviour.polls -= 1;
            return;
        }
        if job.behaviour.fails {
            job.state = JobState::Failed;
            return;
        }
        job.state = JobState::Completed;
        let bios = job.bios.clone();
        let creates = job.creates.clone();
        let deletes = job.deletes.clone();
        let converts = job.converts.clone();
        for (name, value) in bios {
            if let Some(attribute) = self.bios.get_mut(&name) {
                attribute.current_value = value;
                attribute.pending_value = None;
            }
        }
        for vd in self.virtual_disks.iter_mut() {
            if creates.contains(&vd.id) {
                vd.pending_operation = None;
            }
        }
        self.virtual_disks.retain(|vd| !deletes.contains(&vd.id));
        for disk in self.disks.iter_mut() {
            if converts.contains(&disk.id) {
                disk.raid_status = RaidStatus::Ready;
            }
        }
    }
}

/// An in memory BMC. Committed jobs wait for reboots, then run for a few
/// status queries.
struct FakeBmc {
    state: Mutex<State>,
}

impl FakeBmc {
    fn new() -> Self {
        SETUP.call_once(|| {
            use tracing_subscriber::fmt::Layer;
            use tracing_subscriber::prelude::*;
            use tracing_subscriber::{filter::LevelFilter, EnvFilter};
            tracing_subscriber::registry()
                .with(
                    EnvFilter::builder()
                        .with_default_directive(LevelFilter::INFO.into())
                        .from_env_lossy(),
                )
                .with(Layer::default().compact().with_test_writer().with_ansi(false))
                .init();
        });
        FakeBmc {
            state: Mutex::new(State {
                power: Some(PowerState::On),
                ..Default::default()
            }),
        }
    }

    fn with_bios(self, name: &str, current: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .bios
            .insert(name.to_string(), BiosAttribute::new(current));
        self
    }

    fn with_staged_bios(self, name: &str, current: &str, pending: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .bios
            .insert(name.to_string(), BiosAttribute::with_pending(current, pending));
        self
    }

    fn with_disks(self, count: u32, raid_status: RaidStatus) -> Self {
        let mut state = self.state.lock().unwrap();
        for bay in 0..count {
            state.disks.push(PhysicalDisk {
                id: disk_id(bay),
                controller: CTRL.to_string(),
                size_mb: DISK_MB,
                raid_status: raid_status.clone(),
            });
        }
        drop(state);
        self
    }

    fn with_passthrough(self, bays: &[u32]) -> Self {
        let mut state = self.state.lock().unwrap();
        for disk in state.disks.iter_mut() {
            if bays.iter().any(|bay| disk.id == disk_id(*bay)) {
                disk.raid_status = RaidStatus::NonRaid;
            }
        }
        drop(state);
        self
    }

    fn with_virtual_disk(
        self,
        name: &str,
        bays: &[u32],
        pending_operation: Option<PendingOperation>,
    ) -> Self {
        let mut state = self.state.lock().unwrap();
        state.next_virtual_disk += 1;
        let id = format!("Disk.Virtual.{}:{CTRL}", state.next_virtual_disk);
        state.virtual_disks.push(VirtualDisk {
            id,
            name: name.to_string(),
            controller: CTRL.to_string(),
            raid_level: RaidLevel::Raid1,
            span_length: bays.len() as u32,
            span_depth: 1,
            physical_disks: bays.iter().map(|bay| disk_id(*bay)).collect(),
            size_mb: DISK_MB,
            pending_operation,
        });
        drop(state);
        self
    }

    /// A BIOS job committed before the run, applying the staged values.
    fn with_committed_bios_job(self) -> Self {
        let mut state = self.state.lock().unwrap();
        let bios = state
            .bios
            .iter()
            .filter_map(|(name, a)| a.pending_value.clone().map(|p| (name.clone(), p)))
            .collect();
        state.add_job(FakeJob {
            target: Subsystem::Bios,
            state: JobState::Scheduled,
            behaviour: JobBehaviour::default(),
            bios,
            creates: vec![],
            deletes: vec![],
            converts: vec![],
        });
        drop(state);
        self
    }

    fn with_job_behaviour(self, behaviour: JobBehaviour) -> Self {
        self.state.lock().unwrap().behaviour = behaviour;
        self
    }

    fn powered_off(self) -> Self {
        self.state.lock().unwrap().power = Some(PowerState::Off);
        self
    }

    fn record(&self, call: impl Into<String>) {
        self.state.lock().unwrap().calls.push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| MUTATING_CALLS.iter().any(|m| call.starts_with(m)))
            .collect()
    }

    fn power_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.starts_with("power "))
            .collect()
    }

    fn bios_value(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .bios
            .get(name)
            .map(|a| a.current_value.clone())
    }

    fn virtual_disks(&self) -> Vec<VirtualDisk> {
        self.state.lock().unwrap().virtual_disks.clone()
    }
}

#[async_trait::async_trait]
impl Controller for FakeBmc {
    async fn bios_attributes(&self) -> Result<BiosAttributes, ControllerError> {
        self.record("bios_attributes");
        Ok(self
            .state
            .lock()
            .unwrap()
            .bios
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn physical_disks(&self) -> Result<Vec<PhysicalDisk>, ControllerError> {
        self.record("physical_disks");
        Ok(self.state.lock().unwrap().disks.clone())
    }

    async fn virtual_disks(&self) -> Result<Vec<VirtualDisk>, ControllerError> {
        self.record("virtual_disks");
        Ok(self.state.lock().unwrap().virtual_disks.clone())
    }

    async fn unfinished_jobs(&self) -> Result<Vec<PendingJob>, ControllerError> {
        self.record("unfinished_jobs");
        let state = self.state.lock().unwrap();
        Ok(state
            .jobs
            .iter()
            .filter(|(_, job)| !job.state.is_terminal())
            .filter_map(|(id, _)| state.pending_job(id))
            .collect())
    }

    async fn job_status(&self, id: &JobId) -> Result<PendingJob, ControllerError> {
        self.record(format!("job_status {id}"));
        let mut state = self.state.lock().unwrap();
        state.poll(id);
        state
            .pending_job(id)
            .ok_or_else(|| ControllerError::GenericError {
                error: format!("no job {id}"),
            })
    }

    async fn set_bios_attributes(
        &self,
        values: &BTreeMap<String, String>,
    ) -> Result<(), ControllerError> {
        self.record("set_bios_attributes");
        let mut state = self.state.lock().unwrap();
        for (name, value) in values {
            if let Some(attribute) = state.bios.get_mut(name) {
                attribute.pending_value = Some(value.clone());
            }
        }
        Ok(())
    }

    async fn convert_physical_disks(
        &self,
        controller: &str,
        disks: &[String],
    ) -> Result<(), ControllerError> {
        self.record(format!("convert_physical_disks {controller}"));
        self.state
            .lock()
            .unwrap()
            .staged_converts
            .extend(disks.iter().cloned());
        Ok(())
    }

    async fn create_virtual_disk(
        &self,
        controller: &str,
        disk: &VirtualDiskCreate,
    ) -> Result<(), ControllerError> {
        self.record(format!("create_virtual_disk {}", disk.name));
        let mut state = self.state.lock().unwrap();
        state.next_virtual_disk += 1;
        let id = format!("Disk.Virtual.{}:{controller}", state.next_virtual_disk);
        state.virtual_disks.push(VirtualDisk {
            id,
            name: disk.name.clone(),
            controller: controller.to_string(),
            raid_level: disk.raid_level,
            span_length: disk.span_length,
            span_depth: disk.span_depth,
            physical_disks: disk.physical_disks.clone(),
            size_mb: disk.size_mb,
            pending_operation: Some(PendingOperation::Create),
        });
        Ok(())
    }

    async fn delete_virtual_disk(&self, _controller: &str, id: &str) -> Result<(), ControllerError> {
        self.record(format!("delete_virtual_disk {id}"));
        let mut state = self.state.lock().unwrap();
        for vd in state.virtual_disks.iter_mut() {
            if vd.id == id {
                vd.pending_operation = Some(PendingOperation::Delete);
            }
        }
        Ok(())
    }

    async fn abandon_pending(&self, target: &Subsystem) -> Result<(), ControllerError> {
        self.record(format!("abandon_pending {target}"));
        let mut state = self.state.lock().unwrap();
        match target {
            Subsystem::Bios => {
                for attribute in state.bios.values_mut() {
                    attribute.pending_value = None;
                }
            }
            _ => {
                state
                    .virtual_disks
                    .retain(|vd| vd.pending_operation != Some(PendingOperation::Create));
                for vd in state.virtual_disks.iter_mut() {
                    vd.pending_operation = None;
                }
                state.staged_converts.clear();
            }
        }
        Ok(())
    }

    async fn commit_pending(&self, target: &Subsystem) -> Result<Vec<PendingJob>, ControllerError> {
        self.record(format!("commit_pending {target}"));
        let mut state = self.state.lock().unwrap();
        let mut job = FakeJob {
            target: target.clone(),
            state: JobState::Scheduled,
            behaviour: state.behaviour,
            bios: BTreeMap::new(),
            creates: vec![],
            deletes: vec![],
            converts: vec![],
        };
        match target {
            Subsystem::Bios => {
                job.bios = state
                    .bios
                    .iter()
                    .filter_map(|(name, a)| a.pending_value.clone().map(|p| (name.clone(), p)))
                    .collect();
            }
            _ => {
                for vd in &state.virtual_disks {
                    match vd.pending_operation {
                        Some(PendingOperation::Create) => job.creates.push(vd.id.clone()),
                        Some(PendingOperation::Delete) => job.deletes.push(vd.id.clone()),
                        None => {}
                    }
                }
                job.converts = std::mem::take(&mut state.staged_converts);
            }
        }
        let id = state.add_job(job);
        Ok(state.pending_job(&id).into_iter().collect())
    }

    async fn get_power_state(&self) -> Result<PowerState, ControllerError> {
        self.record("get_power_state");
        Ok(self.state.lock().unwrap().power.unwrap_or(PowerState::On))
    }

    async fn power(&self, action: SystemPowerControl) -> Result<(), ControllerError> {
        self.record(format!("power {action}"));
        let mut state = self.state.lock().unwrap();
        match action {
            SystemPowerControl::On => {
                if state.power == Some(PowerState::Off) {
                    state.reset();
                }
                state.power = Some(PowerState::On);
            }
            SystemPowerControl::GracefulRestart | SystemPowerControl::ForceRestart => {
                state.reset();
            }
            SystemPowerControl::ForceOff | SystemPowerControl::GracefulShutdown => {
                state.power = Some(PowerState::Off);
            }
        }
        Ok(())
    }
}

fn bios(values: &[(&str, &str)]) -> DesiredState {
    DesiredState {
        bios: values
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        raid: Vec::new(),
    }
}

fn raid1(name: &str, bays: &[u32]) -> VirtualDiskSpec {
    VirtualDiskSpec {
        name: name.to_string(),
        raid_level: RaidLevel::Raid1,
        span_length: bays.len() as u32,
        span_depth: 1,
        physical_disks: bays.iter().map(|bay| disk_id(*bay)).collect(),
    }
}

fn rebooting() -> ReconcileOptions {
    ReconcileOptions {
        reboot: true,
        interval: Duration::from_secs(1),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_numlock_already_on() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new().with_bios("NumLock", "On");
    let clock = ManualClock::new();

    let result = reconcile(&bmc, &bios(&[("NumLock", "On")]), &rebooting(), &clock).await;
    assert!(result.success(), "{}", result.message);
    assert!(!result.changed);
    assert_eq!(result.reboots_performed, 0);
    assert!(bmc.mutating_calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_idempotent() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new()
        .with_bios("NumLock", "Off")
        .with_bios("SysProfile", "PerfOptimized");
    let clock = ManualClock::new();
    let desired = bios(&[("NumLock", "On"), ("SysProfile", "Custom")]);

    let first = reconcile(&bmc, &desired, &rebooting(), &clock).await;
    assert!(first.success(), "{}", first.message);
    assert!(first.changed);
    assert_eq!(first.reboots_performed, 1);
    assert_eq!(first.changed_bios_settings.len(), 2);
    assert_eq!(bmc.bios_value("NumLock").as_deref(), Some("On"));
    assert_eq!(bmc.bios_value("SysProfile").as_deref(), Some("Custom"));

    let before = bmc.mutating_calls().len();
    let second = reconcile(&bmc, &desired, &rebooting(), &clock).await;
    assert!(second.success());
    assert!(!second.changed);
    assert_eq!(second.reboots_performed, 0);
    assert_eq!(bmc.mutating_calls().len(), before);
    Ok(())
}

#[tokio::test]
async fn test_conflicting_staged_value_is_replaced() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new().with_staged_bios("SysProfile", "PerfOptimized", "Custom");
    let clock = ManualClock::new();

    let desired = bios(&[("SysProfile", "PerfPerWattOptimizedOs")]);
    let result = reconcile(&bmc, &desired, &rebooting(), &clock).await;
    assert!(result.success(), "{}", result.message);
    assert!(result.changed);
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].pending, "Custom");
    assert_eq!(result.conflicts[0].desired, "PerfPerWattOptimizedOs");
    assert_eq!(result.conflicts[0].resolution, Resolution::Abandon);
    assert_eq!(
        bmc.bios_value("SysProfile").as_deref(),
        Some("PerfPerWattOptimizedOs")
    );

    let calls = bmc.mutating_calls();
    assert_eq!(calls[0], "abandon_pending BIOS");
    assert_eq!(calls[1], "set_bios_attributes");
    Ok(())
}

#[tokio::test]
async fn test_reboot_budget() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new()
        .with_bios("NumLock", "Off")
        .with_job_behaviour(JobBehaviour {
            reboots: u32::MAX,
            ..Default::default()
        });
    let clock = ManualClock::new();

    let result = reconcile(&bmc, &bios(&[("NumLock", "On")]), &rebooting(), &clock).await;
    assert!(result.failed);
    assert!(result.changed);
    assert_eq!(result.error_kind.as_deref(), Some("RebootBudgetExceeded"));
    assert_eq!(result.reboots_performed, 3);
    assert_eq!(bmc.power_calls().len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_reboot_disallowed() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new().with_bios("NumLock", "Off");
    let clock = ManualClock::new();
    let options = ReconcileOptions {
        reboot: false,
        ..rebooting()
    };

    let result = reconcile(&bmc, &bios(&[("NumLock", "On")]), &options, &clock).await;
    assert!(result.failed);
    assert!(result.reboot_required);
    assert_eq!(
        result.error_kind.as_deref(),
        Some("RebootRequiredButDisallowed")
    );
    assert!(result.message.contains("JID_001"));
    assert!(bmc.power_calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_committed_job_needs_reboot_not_allowed() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new()
        .with_staged_bios("NumLock", "Off", "On")
        .with_committed_bios_job();
    let clock = ManualClock::new();
    let options = ReconcileOptions {
        reboot: false,
        ..rebooting()
    };

    let result = reconcile(&bmc, &bios(&[("NumLock", "On")]), &options, &clock).await;
    assert!(result.failed);
    assert!(!result.changed);
    assert_eq!(
        result.error_kind.as_deref(),
        Some("RebootRequiredButDisallowed")
    );
    assert!(bmc.mutating_calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_check_mode_is_pure() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new()
        .with_bios("NumLock", "Off")
        .with_disks(2, RaidStatus::NonRaid);
    let clock = ManualClock::new();
    let desired = DesiredState {
        raid: vec![raid1("os", &[0, 1])],
        ..bios(&[("NumLock", "On")])
    };
    let options = ReconcileOptions {
        check_mode: true,
        ..rebooting()
    };

    let result = reconcile(&bmc, &desired, &options, &clock).await;
    assert!(result.success(), "{}", result.message);
    assert!(result.changed);
    assert!(!result.reboot_required);
    assert_eq!(result.reboots_performed, 0);
    assert_eq!(result.converted_physical_disks.len(), 2);
    assert_eq!(result.created_virtual_disks.len(), 1);
    assert_eq!(result.created_virtual_disks[0].disk.size_mb, DISK_MB);
    assert!(bmc.mutating_calls().is_empty());
    assert_eq!(clock.elapsed(), Duration::ZERO);
    Ok(())
}

#[tokio::test]
async fn test_check_mode_without_reboot() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new().with_bios("NumLock", "Off");
    let clock = ManualClock::new();
    let options = ReconcileOptions {
        check_mode: true,
        ..Default::default()
    };

    let result = reconcile(&bmc, &bios(&[("NumLock", "On")]), &options, &clock).await;
    assert!(result.success());
    assert!(result.changed);
    assert!(result.reboot_required);
    assert!(bmc.mutating_calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_poll_timeout() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new()
        .with_bios("NumLock", "Off")
        .with_job_behaviour(JobBehaviour {
            polls: u32::MAX,
            ..Default::default()
        });
    let clock = ManualClock::new();
    let options = ReconcileOptions {
        timeout: Some(Duration::from_secs(5)),
        ..rebooting()
    };

    let result = reconcile(&bmc, &bios(&[("NumLock", "On")]), &options, &clock).await;
    assert!(result.failed);
    assert_eq!(result.error_kind.as_deref(), Some("PollTimeout"));
    assert_eq!(result.reboots_performed, 1);
    assert_eq!(clock.elapsed(), Duration::from_secs(5));
    Ok(())
}

#[tokio::test]
async fn test_job_failure() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new()
        .with_bios("NumLock", "Off")
        .with_job_behaviour(JobBehaviour {
            fails: true,
            ..Default::default()
        });
    let clock = ManualClock::new();

    let result = reconcile(&bmc, &bios(&[("NumLock", "On")]), &rebooting(), &clock).await;
    assert!(result.failed);
    assert!(result.changed);
    assert_eq!(result.error_kind.as_deref(), Some("JobFailed"));
    assert!(result.message.contains("JID_001 (BIOS): Job failed"));
    assert_eq!(bmc.bios_value("NumLock").as_deref(), Some("Off"));
    Ok(())
}

#[tokio::test]
async fn test_raid1_single_disk_rejected_before_any_call() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new().with_disks(2, RaidStatus::Ready);
    let clock = ManualClock::new();
    let config: ReconcileConfig = serde_json::from_value(json!({
        "address": "10.0.0.5",
        "reboot": true,
        "raid_config": [
            {"name": "os", "raid_level": "1", "span_length": 1, "span_depth": 1, "pdisks": [disk_id(0)]}
        ]
    }))?;

    let result = reconcile_config(&bmc, &config, &clock).await;
    assert!(result.failed);
    assert!(!result.changed);
    assert_eq!(result.error_kind.as_deref(), Some("ValidationError"));
    assert!(bmc.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_unknown_bios_attribute() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new().with_bios("NumLock", "Off");
    let clock = ManualClock::new();

    let desired = bios(&[("NumLock", "On"), ("NoSuchSetting", "Enabled")]);
    let result = reconcile(&bmc, &desired, &rebooting(), &clock).await;
    assert!(result.failed);
    assert_eq!(result.error_kind.as_deref(), Some("ValidationError"));
    assert!(result.message.contains("NoSuchSetting"));
    assert!(bmc.mutating_calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_committed_job_flushed_by_one_reboot() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new()
        .with_staged_bios("NumLock", "Off", "On")
        .with_committed_bios_job();
    let clock = ManualClock::new();

    let result = reconcile(&bmc, &bios(&[("NumLock", "On")]), &rebooting(), &clock).await;
    assert!(result.success(), "{}", result.message);
    assert!(result.changed);
    assert_eq!(result.reboots_performed, 1);
    assert_eq!(bmc.bios_value("NumLock").as_deref(), Some("On"));
    assert_eq!(
        bmc.mutating_calls(),
        vec!["power GracefulRestart".to_string()]
    );
    Ok(())
}

#[tokio::test]
async fn test_committed_job_runs_before_new_changes() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new()
        .with_staged_bios("NumLock", "Off", "On")
        .with_bios("SysProfile", "PerfOptimized")
        .with_committed_bios_job();
    let clock = ManualClock::new();

    let desired = bios(&[("NumLock", "On"), ("SysProfile", "Custom")]);
    let result = reconcile(&bmc, &desired, &rebooting(), &clock).await;
    assert!(result.success(), "{}", result.message);
    assert_eq!(result.reboots_performed, 2);
    assert_eq!(bmc.bios_value("NumLock").as_deref(), Some("On"));
    assert_eq!(bmc.bios_value("SysProfile").as_deref(), Some("Custom"));
    assert_eq!(
        result.completed_jobs,
        vec![JobId::from("JID_001"), JobId::from("JID_002")]
    );
    Ok(())
}

#[tokio::test]
async fn test_bios_and_raid_share_one_reboot() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new()
        .with_bios("NumLock", "Off")
        .with_disks(2, RaidStatus::Ready);
    let clock = ManualClock::new();
    let desired = DesiredState {
        raid: vec![raid1("os", &[0, 1])],
        ..bios(&[("NumLock", "On")])
    };

    let result = reconcile(&bmc, &desired, &rebooting(), &clock).await;
    assert!(result.success(), "{}", result.message);
    assert_eq!(result.reboots_performed, 1);
    let disks = bmc.virtual_disks();
    assert_eq!(disks.len(), 1);
    assert_eq!(disks[0].name, "os");
    assert_eq!(disks[0].pending_operation, None);
    Ok(())
}

#[tokio::test]
async fn test_conflicting_raid_create_recreated() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new()
        .with_disks(3, RaidStatus::Ready)
        .with_virtual_disk("os", &[0, 2], Some(PendingOperation::Create));
    let clock = ManualClock::new();
    let desired = DesiredState {
        raid: vec![raid1("os", &[0, 1])],
        ..Default::default()
    };

    let result = reconcile(&bmc, &desired, &rebooting(), &clock).await;
    assert!(result.success(), "{}", result.message);
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].resolution, Resolution::Abandon);
    assert_eq!(result.reboots_performed, 1);

    let calls = bmc.mutating_calls();
    assert_eq!(calls[0], format!("abandon_pending RAID:{CTRL}"));
    assert_eq!(calls[1], "create_virtual_disk os");

    let disks = bmc.virtual_disks();
    assert_eq!(disks.len(), 1);
    assert_eq!(disks[0].physical_disks, vec![disk_id(0), disk_id(1)]);
    assert_eq!(disks[0].pending_operation, None);
    Ok(())
}

#[tokio::test]
async fn test_existing_virtual_disk_left_alone() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new()
        .with_disks(4, RaidStatus::Online)
        .with_virtual_disk("os", &[0, 1], None)
        .with_virtual_disk("scratch", &[2, 3], None);
    let clock = ManualClock::new();
    let desired = DesiredState {
        raid: vec![raid1("os", &[0, 1])],
        ..Default::default()
    };

    let result = reconcile(&bmc, &desired, &rebooting(), &clock).await;
    assert!(result.success(), "{}", result.message);
    assert!(!result.changed);
    assert_eq!(bmc.virtual_disks().len(), 2);
    assert!(bmc.mutating_calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_passthrough_disks_converted_first() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new().with_disks(2, RaidStatus::NonRaid);
    let clock = ManualClock::new();
    let desired = DesiredState {
        raid: vec![raid1("os", &[0, 1])],
        ..Default::default()
    };

    let result = reconcile(&bmc, &desired, &rebooting(), &clock).await;
    assert!(result.success(), "{}", result.message);
    assert_eq!(result.reboots_performed, 2);
    assert_eq!(result.converted_physical_disks.len(), 2);

    let calls = bmc.mutating_calls();
    let convert = calls
        .iter()
        .position(|c| c.starts_with("convert_physical_disks"))
        .unwrap();
    let create = calls
        .iter()
        .position(|c| c.starts_with("create_virtual_disk"))
        .unwrap();
    let first_reboot = calls.iter().position(|c| c.starts_with("power")).unwrap();
    assert!(convert < first_reboot && first_reboot < create);
    assert_eq!(bmc.virtual_disks().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_conversion_keeps_other_staged_disks() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new()
        .with_disks(6, RaidStatus::Ready)
        .with_passthrough(&[0, 1])
        .with_virtual_disk("os", &[2, 3], Some(PendingOperation::Create))
        .with_virtual_disk("scratch", &[4, 5], Some(PendingOperation::Create));
    let clock = ManualClock::new();
    let desired = DesiredState {
        raid: vec![raid1("os", &[0, 1])],
        ..Default::default()
    };

    let result = reconcile(&bmc, &desired, &rebooting(), &clock).await;
    assert!(result.success(), "{}", result.message);
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.reboots_performed, 2);

    let calls = bmc.mutating_calls();
    assert_eq!(calls[0], format!("abandon_pending RAID:{CTRL}"));
    assert_eq!(calls[1], "create_virtual_disk scratch");
    assert_eq!(calls[2], format!("convert_physical_disks {CTRL}"));

    let mut disks = bmc.virtual_disks();
    disks.sort_by(|a, b| a.name.cmp(&b.name));
    assert_eq!(disks.len(), 2);
    assert_eq!(disks[0].name, "os");
    assert_eq!(disks[0].physical_disks, vec![disk_id(0), disk_id(1)]);
    assert_eq!(disks[1].name, "scratch");
    assert!(disks.iter().all(|vd| vd.pending_operation.is_none()));
    Ok(())
}

#[tokio::test]
async fn test_conversion_needs_reboot() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new().with_disks(2, RaidStatus::NonRaid);
    let clock = ManualClock::new();
    let desired = DesiredState {
        raid: vec![raid1("os", &[0, 1])],
        ..Default::default()
    };
    let options = ReconcileOptions {
        reboot: false,
        ..rebooting()
    };

    let result = reconcile(&bmc, &desired, &options, &clock).await;
    assert!(result.failed);
    assert!(result.message.contains("converted to RAID mode"));
    assert!(bmc.mutating_calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_powered_off_host_restored() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new().with_bios("NumLock", "Off").powered_off();
    let clock = ManualClock::new();

    let result = reconcile(&bmc, &bios(&[("NumLock", "On")]), &rebooting(), &clock).await;
    assert!(result.success(), "{}", result.message);
    assert_eq!(result.reboots_performed, 1);
    assert_eq!(
        bmc.power_calls(),
        vec!["power On".to_string(), "power ForceOff".to_string()]
    );
    assert_eq!(bmc.bios_value("NumLock").as_deref(), Some("On"));
    Ok(())
}

#[tokio::test]
async fn test_force_reboot() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new().with_bios("NumLock", "Off");
    let clock = ManualClock::new();
    let options = ReconcileOptions {
        force_reboot: true,
        ..rebooting()
    };

    let result = reconcile(&bmc, &bios(&[("NumLock", "On")]), &options, &clock).await;
    assert!(result.success(), "{}", result.message);
    assert_eq!(bmc.power_calls(), vec!["power ForceRestart".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_empty_desired_state_reads_nothing() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new().with_bios("NumLock", "Off");
    let clock = ManualClock::new();

    let result = reconcile(&bmc, &DesiredState::default(), &rebooting(), &clock).await;
    assert!(result.success());
    assert!(!result.changed);
    assert!(bmc.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_config_document() -> Result<(), anyhow::Error> {
    let bmc = FakeBmc::new()
        .with_bios("NumLock", "Off")
        .with_disks(2, RaidStatus::Ready);
    let clock = ManualClock::new();
    let config: ReconcileConfig = serde_json::from_value(json!({
        "address": "10.0.0.5",
        "bios_config": {"NumLock": "On"},
        "raid_config": [
            {
                "name": "os",
                "raid_level": "RAID1",
                "span_length": 2,
                "span_depth": "1",
                "pdisks": [disk_id(0), disk_id(1)]
            }
        ],
        "reboot": true,
        "interval": 1
    }))?;

    let result = reconcile_config(&bmc, &config, &clock).await;
    assert!(result.success(), "{}", result.message);
    let record = serde_json::to_value(&result)?;
    assert_eq!(record["changed"], true);
    assert_eq!(record["failed"], false);
    assert_eq!(record["reboots_performed"], 1);
    assert_eq!(record["changed_bios_settings"]["NumLock"], "On");
    assert_eq!(record["created_virtual_disks"][0]["name"], "os");
    assert_eq!(result.completed_jobs.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_unreachable_bmc_reported_in_result() -> Result<(), anyhow::Error> {
    let pool = RedfishClientPool::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let config: ReconcileConfig = serde_json::from_value(json!({
        "address": "127.0.0.1",
        "port": 1,
        "bios_config": {"NumLock": "On"},
        "reboot": true
    }))?;

    let result = reconcile_endpoint(&pool, &config, &ManualClock::new()).await;
    assert!(result.failed);
    assert!(!result.changed);
    assert_eq!(result.reboots_performed, 0);
    assert_eq!(result.error_kind.as_deref(), Some("ProtocolError"));
    assert!(result.message.contains("127.0.0.1"), "{}", result.message);
    Ok(())
}
