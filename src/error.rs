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
use std::time::Duration;

use reqwest::StatusCode;

use crate::model::{describe_jobs, join_ids, InvalidValueError, JobId, PendingJob, RaidLevel};

/// Errors raised while talking to the management controller.
#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    #[error("Network error talking to BMC at {url}. {source}")]
    NetworkError { url: String, source: reqwest::Error },

    #[error("HTTP {status_code} at {url}. See debug logs for details.")]
    HTTPErrorCode {
        url: String,
        status_code: StatusCode,
    },

    #[error("Could not deserialize response from {url}. Body: {body}. {source}")]
    JsonDeserializeError {
        url: String,
        body: String,
        source: serde_json::Error,
    },

    #[error("Could not serialize request body for {url}. Obj: {object_debug}. {source}")]
    JsonSerializeError {
        url: String,
        object_debug: String,
        source: serde_json::Error,
    },

    #[error("Remote returned empty body")]
    NoContent,

    #[error("Missing key {key} in JSON at {url}")]
    MissingKey { key: String, url: String },

    #[error("Key {key} should be {expected_type} at {url}")]
    InvalidKeyType {
        key: String,
        expected_type: String,
        url: String,
    },

    #[error("Field {field} parse error at {url}: {err}")]
    InvalidValue {
        url: String,
        field: String,
        err: InvalidValueError,
    },

    #[error("Response from {url} has no {header} header")]
    MissingHeader { url: String, header: String },

    #[error("Operation not supported by this controller: {0}")]
    NotSupported(String),

    #[error("{error}")]
    GenericError { error: String },
}

/// The desired configuration is malformed or cannot be applied to this controller.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Cannot read desired state from {path}: {reason}")]
    InvalidDocument { path: String, reason: String },

    #[error("BIOS settings must be string values. The following settings are not strings: {0}")]
    NonStringBiosValue(String),

    #[error("RAID configuration item {index} is invalid: {reason}")]
    InvalidVirtualDisk { index: usize, reason: String },

    #[error("Virtual disk {name} has unsupported RAID level {raid_level}")]
    UnsupportedRaidLevel { name: String, raid_level: String },

    #[error("Virtual disk {name}: RAID {raid_level} needs at least {required} physical disks, {given} given")]
    InsufficientPhysicalDisks {
        name: String,
        raid_level: RaidLevel,
        required: usize,
        given: usize,
    },

    #[error("Virtual disk {name}: span_length {span_length} x span_depth {span_depth} does not match {given} physical disks")]
    SpanMismatch {
        name: String,
        span_length: u32,
        span_depth: u32,
        given: usize,
    },

    #[error("Virtual disk {name} lists physical disk {disk} more than once")]
    DuplicatePhysicalDisk { name: String, disk: String },

    #[error("Virtual disk name {0} is requested more than once")]
    DuplicateVirtualDisk(String),

    #[error("Physical disk {disk} is requested by both {first} and {second}")]
    SharedPhysicalDisk {
        disk: String,
        first: String,
        second: String,
    },

    #[error("interval must be a positive number of seconds")]
    InvalidInterval,

    #[error("BIOS setting(s) do not exist: {0}")]
    UnknownBiosAttribute(String),

    #[error("Requested RAID configuration for {name} contains physical disks not reported by the controller: {disks}")]
    UnknownPhysicalDisks { name: String, disks: String },

    #[error("Requested RAID configuration for {name} contains physical disks on multiple controllers: {controllers}")]
    MultipleControllers { name: String, controllers: String },

    #[error("Virtual disk {name} already exists on {controller} with a different layout, refusing to replace it")]
    VirtualDiskConflict { name: String, controller: String },
}

/// Every way a reconciliation run can fail. All of them are fatal to the run.
#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
    #[error("Invalid configuration: {0}")]
    Validation(#[from] ValidationError),

    #[error("Controller call failed: {0}")]
    Protocol(#[from] ControllerError),

    #[error("Requested configuration requires the system to be rebooted ({reason}) but the 'reboot' option is false. Waiting on: {}", join_ids(.jobs))]
    RebootRequiredButDisallowed { reason: String, jobs: Vec<JobId> },

    #[error("Jobs still need a reboot after {reboots} reboots: {}", join_ids(.jobs))]
    RebootBudgetExceeded { reboots: u32, jobs: Vec<JobId> },

    #[error("Job(s) failed: {}", describe_jobs(.jobs))]
    JobFailed { jobs: Vec<PendingJob> },

    #[error("Timed out after {} seconds waiting for the BMC to complete pending jobs: {}", .timeout.as_secs(), join_ids(.outstanding))]
    PollTimeout {
        timeout: Duration,
        outstanding: Vec<JobId>,
    },
}

impl ReconcileError {
    /// Short machine friendly name of the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::Validation(_) => "ValidationError",
            ReconcileError::Protocol(_) => "ProtocolError",
            ReconcileError::RebootRequiredButDisallowed { .. } => "RebootRequiredButDisallowed",
            ReconcileError::RebootBudgetExceeded { .. } => "RebootBudgetExceeded",
            ReconcileError::JobFailed { .. } => "JobFailed",
            ReconcileError::PollTimeout { .. } => "PollTimeout",
        }
    }
}
