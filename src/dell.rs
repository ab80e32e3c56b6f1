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
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    jsonmap,
    model::{
        attribute_value_string,
        oem::dell::{self, RedfishSettingsApplyTime},
        system::{ComputerSystem, ResetRequest},
        BiosAttribute, BiosAttributes, Collection, JobState, ODataId,
    },
    network::{RedfishHttpClient, REDFISH_ENDPOINT},
    Controller, ControllerError, JobId, PendingJob, PhysicalDisk, PowerState, Subsystem,
    SystemPowerControl, VirtualDisk, VirtualDiskCreate,
};

const EXPAND_ONE_LEVEL: &str = "$expand=*($levels=1)";

/// How long a scheduled job may take to start after a reset before it is
/// taken to need another one.
const RESET_SETTLE_TIME: Duration = Duration::from_secs(15 * 60);

/// The last reset this client issued.
struct Reset {
    at: Instant,
    // Scheduled jobs seen before it
    covered: HashSet<JobId>,
}

/// A Dell iDRAC.
pub struct Bmc {
    client: RedfishHttpClient,
    system_id: String,
    manager_id: String,
    // Every scheduled job this client has seen.
    seen_scheduled: Mutex<HashSet<JobId>>,
    last_reset: Mutex<Option<Reset>>,
    // RAID jobs created by staging, per controller, until committed.
    staged_raid_jobs: Mutex<HashMap<String, Vec<JobId>>>,
}

impl Bmc {
    pub async fn new(client: RedfishHttpClient) -> Result<Bmc, ControllerError> {
        let system_id = first_member(&client, "Systems").await?;
        let manager_id = first_member(&client, "Managers").await?;
        debug!("Using system {system_id} and manager {manager_id}");
        Ok(Bmc {
            client,
            system_id,
            manager_id,
            seen_scheduled: Mutex::new(HashSet::new()),
            last_reset: Mutex::new(None),
            staged_raid_jobs: Mutex::new(HashMap::new()),
        })
    }

    fn system_path(&self) -> String {
        format!("Systems/{}", self.system_id)
    }

    fn bios_settings_path(&self) -> String {
        format!("Systems/{}/Bios/Settings", self.system_id)
    }

    fn jobs_path(&self) -> String {
        format!("Managers/{}/Jobs", self.manager_id)
    }

    async fn attributes(
        &self,
        api: &str,
    ) -> Result<serde_json::Map<String, serde_json::Value>, ControllerError> {
        let (_status_code, mut body): (_, HashMap<String, serde_json::Value>) =
            self.client.get(api).await?;
        jsonmap::extract_object(&mut body, "Attributes", &self.client.url(api))
    }

    /// Ids of the storage controllers that can build virtual disks.
    async fn raid_controllers(&self) -> Result<Vec<String>, ControllerError> {
        let url = format!("{}/Storage", self.system_path());
        let (_status_code, storage): (_, Collection) = self.client.get(&url).await?;
        let mut controllers = Vec::new();
        for member in &storage.members {
            let id = member.odata_id_get()?;
            // AHCI and BOSS controllers are listed too
            if id.starts_with("RAID.") {
                controllers.push(id.to_string());
            }
        }
        Ok(controllers)
    }

    /// Job id from the `Location` of a request which created a job.
    fn job_from_location(
        &self,
        api: &str,
        location: Option<String>,
    ) -> Result<JobId, ControllerError> {
        let location = location.ok_or_else(|| ControllerError::MissingHeader {
            url: self.client.url(api),
            header: "Location".to_string(),
        })?;
        Ok(JobId::from(ODataId::from(location).odata_id_get()?))
    }

    async fn stage_raid_job(&self, controller: &str, api: &str, location: Option<String>) {
        // Some firmware only queues the change and creates no job until commit
        match self.job_from_location(api, location) {
            Ok(id) => {
                debug!("RAID change on {controller} staged as job {id}");
                self.staged_raid_jobs
                    .lock()
                    .await
                    .entry(controller.to_string())
                    .or_default()
                    .push(id);
            }
            Err(e) => debug!("No job for RAID change on {controller}: {e}"),
        }
    }

    async fn jobs(&self) -> Result<Vec<dell::Job>, ControllerError> {
        let url = format!("{}?{EXPAND_ONE_LEVEL}", self.jobs_path());
        let (_status_code, jobs): (_, dell::JobCollection) = self.client.get(&url).await?;
        Ok(jobs.members)
    }

    /// A scheduled job needs a reboot unless the last reset this client
    /// issued came after it was first seen and less than
    /// [`RESET_SETTLE_TIME`] ago. Real time jobs never do.
    async fn pending_job(&self, job: &dell::Job) -> PendingJob {
        let id = job.job_id();
        let scheduled = job.job_state.to_job_state() == JobState::Scheduled && !job.is_realtime();
        let requires_reboot = scheduled
            && match &*self.last_reset.lock().await {
                Some(reset) if reset.covered.contains(&id) => {
                    reset.at.elapsed() >= RESET_SETTLE_TIME
                }
                _ => true,
            };
        if scheduled {
            self.seen_scheduled.lock().await.insert(id);
        }
        job.to_pending_job(requires_reboot)
    }

    async fn note_reset(&self) {
        let covered = self.seen_scheduled.lock().await.clone();
        *self.last_reset.lock().await = Some(Reset {
            at: Instant::now(),
            covered,
        });
    }

    async fn commit_bios(&self) -> Result<Vec<PendingJob>, ControllerError> {
        let api = self.jobs_path();
        let body = dell::CreateJob {
            target_settings_uri: format!("/{REDFISH_ENDPOINT}/{}", self.bios_settings_path()),
        };
        let (_status_code, location) = self.client.post(&api, body).await?;
        let id = self.job_from_location(&api, location)?;
        Ok(vec![self.job_status(&id).await?])
    }

    async fn commit_raid(&self, controller: &str) -> Result<Vec<PendingJob>, ControllerError> {
        let staged = self
            .staged_raid_jobs
            .lock()
            .await
            .remove(controller)
            .unwrap_or_default();
        let target = Subsystem::Raid(controller.to_string());
        if staged.is_empty() {
            // Staged by an earlier run
            return Ok(self
                .unfinished_jobs()
                .await?
                .into_iter()
                .filter(|job| job.target == target)
                .collect());
        }
        let mut jobs = Vec::with_capacity(staged.len());
        for id in &staged {
            jobs.push(self.job_status(id).await?);
        }
        Ok(jobs)
    }

    async fn abandon_raid(&self, controller: &str) -> Result<(), ControllerError> {
        let staged = self
            .staged_raid_jobs
            .lock()
            .await
            .remove(controller)
            .unwrap_or_default();
        let target = Subsystem::Raid(controller.to_string());
        let doomed: Vec<JobId> = self
            .jobs()
            .await?
            .iter()
            .filter(|job| job.subsystem() == target)
            .filter(|job| job.job_state == dell::DellJobState::New || staged.contains(&job.job_id()))
            .map(dell::Job::job_id)
            .collect();
        for id in doomed {
            debug!("Deleting uncommitted job {id} on {controller}");
            let url = format!("{}/{id}", self.jobs_path());
            self.client.delete::<()>(&url, None).await?;
        }
        Ok(())
    }
}

async fn first_member(client: &RedfishHttpClient, api: &str) -> Result<String, ControllerError> {
    let (_status_code, collection): (_, Collection) = client.get(api).await?;
    let first = collection
        .members
        .first()
        .ok_or_else(|| ControllerError::MissingKey {
            key: "Members".to_string(),
            url: client.url(api),
        })?;
    Ok(first.odata_id_get()?.to_string())
}

#[async_trait::async_trait]
impl Controller for Bmc {
    async fn bios_attributes(&self) -> Result<BiosAttributes, ControllerError> {
        let current = self.attributes(&format!("{}/Bios", self.system_path())).await?;
        let staged = self.attributes(&self.bios_settings_path()).await?;
        let mut attributes = BiosAttributes::with_capacity(current.len());
        for (name, value) in current {
            let current_value = attribute_value_string(&value);
            let attribute = match staged.get(&name).map(attribute_value_string) {
                Some(pending) if pending != current_value => {
                    BiosAttribute::with_pending(current_value, pending)
                }
                _ => BiosAttribute::new(current_value),
            };
            attributes.insert(name, attribute);
        }
        Ok(attributes)
    }

    async fn physical_disks(&self) -> Result<Vec<PhysicalDisk>, ControllerError> {
        let mut disks = Vec::new();
        for controller in self.raid_controllers().await? {
            let url = format!("{}/Storage/{controller}", self.system_path());
            let (_status_code, storage): (_, dell::StorageController) =
                self.client.get(&url).await?;
            for drive in &storage.drives {
                let (_status_code, drive): (_, dell::Drive) =
                    self.client.get(&drive.odata_id).await?;
                disks.push(drive.to_physical_disk(&controller));
            }
        }
        Ok(disks)
    }

    async fn virtual_disks(&self) -> Result<Vec<VirtualDisk>, ControllerError> {
        let mut disks = Vec::new();
        for controller in self.raid_controllers().await? {
            let api = format!(
                "{}/Storage/{controller}/Volumes?{EXPAND_ONE_LEVEL}",
                self.system_path()
            );
            let (_status_code, volumes): (_, dell::VolumeCollection) =
                self.client.get(&api).await?;
            let url = self.client.url(&api);
            for volume in &volumes.members {
                disks.push(volume.to_virtual_disk(&controller, &url)?);
            }
        }
        Ok(disks)
    }

    async fn unfinished_jobs(&self) -> Result<Vec<PendingJob>, ControllerError> {
        let mut unfinished = Vec::new();
        for job in self.jobs().await? {
            if !job.job_state.to_job_state().is_terminal() {
                unfinished.push(self.pending_job(&job).await);
            }
        }
        Ok(unfinished)
    }

    async fn job_status(&self, id: &JobId) -> Result<PendingJob, ControllerError> {
        let url = format!("{}/{id}", self.jobs_path());
        let (_status_code, job): (_, dell::Job) = self.client.get(&url).await?;
        Ok(self.pending_job(&job).await)
    }

    async fn set_bios_attributes(
        &self,
        values: &BTreeMap<String, String>,
    ) -> Result<(), ControllerError> {
        let current = self.attributes(&format!("{}/Bios", self.system_path())).await?;
        let body = dell::SetBiosAttrs::typed(values, &current);
        self.client
            .patch(&self.bios_settings_path(), body)
            .await
            .map(|_status_code| ())
    }

    async fn convert_physical_disks(
        &self,
        controller: &str,
        disks: &[String],
    ) -> Result<(), ControllerError> {
        let api = format!(
            "{}/Oem/Dell/DellRaidService/Actions/DellRaidService.ConvertToRAID",
            self.system_path()
        );
        let body = dell::ConvertToRaid {
            pd_array: disks.to_vec(),
        };
        let (_status_code, location) = self.client.post(&api, body).await?;
        self.stage_raid_job(controller, &api, location).await;
        Ok(())
    }

    async fn create_virtual_disk(
        &self,
        controller: &str,
        disk: &VirtualDiskCreate,
    ) -> Result<(), ControllerError> {
        let storage = format!("{}/Storage/{controller}", self.system_path());
        let api = format!("{storage}/Volumes");
        let body = dell::CreateVolume::new(disk, &format!("/{REDFISH_ENDPOINT}/{storage}"));
        let (_status_code, location) = self.client.post(&api, body).await?;
        self.stage_raid_job(controller, &api, location).await;
        Ok(())
    }

    async fn delete_virtual_disk(&self, controller: &str, id: &str) -> Result<(), ControllerError> {
        let api = format!("{}/Storage/Volumes/{id}", self.system_path());
        let body = dell::DeleteVolume {
            apply_time: RedfishSettingsApplyTime::OnReset,
        };
        let (_status_code, location) = self.client.delete(&api, Some(body)).await?;
        self.stage_raid_job(controller, &api, location).await;
        Ok(())
    }

    async fn abandon_pending(&self, target: &Subsystem) -> Result<(), ControllerError> {
        match target {
            Subsystem::Bios => {
                let api = format!(
                    "{}/Actions/DellManager.ClearPending",
                    self.bios_settings_path()
                );
                self.client
                    .post(&api, HashMap::<String, String>::new())
                    .await
                    .map(|_| ())
            }
            Subsystem::Raid(controller) => self.abandon_raid(controller).await,
            Subsystem::Other(name) => Err(ControllerError::NotSupported(format!(
                "abandoning changes to {name}"
            ))),
        }
    }

    async fn commit_pending(&self, target: &Subsystem) -> Result<Vec<PendingJob>, ControllerError> {
        match target {
            Subsystem::Bios => self.commit_bios().await,
            Subsystem::Raid(controller) => self.commit_raid(controller).await,
            Subsystem::Other(name) => Err(ControllerError::NotSupported(format!(
                "committing changes to {name}"
            ))),
        }
    }

    async fn get_power_state(&self) -> Result<PowerState, ControllerError> {
        let (_status_code, system): (_, ComputerSystem) =
            self.client.get(&self.system_path()).await?;
        Ok(system.power_state)
    }

    async fn power(&self, action: SystemPowerControl) -> Result<(), ControllerError> {
        let api = format!("{}/Actions/ComputerSystem.Reset", self.system_path());
        self.client
            .post(&api, ResetRequest { reset_type: action })
            .await?;
        if matches!(
            action,
            SystemPowerControl::On
                | SystemPowerControl::GracefulRestart
                | SystemPowerControl::ForceRestart
        ) {
            self.note_reset().await;
        }
        Ok(())
    }
}
