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
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::{Controller, JobId, JobState, PendingJob, ReconcileError, ReconcileOptions};

/// Source of time for polling.
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// Wall clock time from tokio.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait::async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// A clock that only moves when slept on. Sleeping returns immediately,
/// so simulations run through hours of polling in no time.
#[derive(Debug)]
pub struct ManualClock {
    start: Instant,
    elapsed_nanos: AtomicU64,
}

impl Default for ManualClock {
    fn default() -> Self {
        ManualClock {
            start: Instant::now(),
            elapsed_nanos: AtomicU64::new(0),
        }
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_nanos.load(Ordering::SeqCst))
    }

    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_nanos.fetch_add(nanos, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// How a set of jobs ended up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub completed: Vec<JobId>,
    pub failed: Vec<PendingJob>,
    /// Scheduled jobs that will not start until the host reboots.
    pub awaiting_reboot: Vec<PendingJob>,
}

/// Waits for jobs to reach a final state, checking every `interval`.
pub struct JobPoller<'a> {
    controller: &'a dyn Controller,
    clock: &'a dyn Clock,
    interval: Duration,
    timeout: Option<Duration>,
}

impl<'a> JobPoller<'a> {
    pub fn new(
        controller: &'a dyn Controller,
        clock: &'a dyn Clock,
        interval: Duration,
        timeout: Option<Duration>,
    ) -> Self {
        JobPoller {
            controller,
            clock,
            interval,
            timeout,
        }
    }

    pub fn from_options(
        controller: &'a dyn Controller,
        clock: &'a dyn Clock,
        options: &ReconcileOptions,
    ) -> Self {
        Self::new(controller, clock, options.interval, options.timeout)
    }

    /// Poll until no job in `jobs` is outstanding. A job is outstanding until
    /// it completes, fails, or is parked waiting for a reboot.
    pub async fn wait(&self, jobs: &[JobId]) -> Result<PollReport, ReconcileError> {
        let deadline = self.timeout.map(|timeout| self.clock.now() + timeout);
        let mut outstanding: Vec<JobId> = Vec::with_capacity(jobs.len());
        for id in jobs {
            if !outstanding.contains(id) {
                outstanding.push(id.clone());
            }
        }
        let mut report = PollReport::default();

        loop {
            let mut still_running = Vec::new();
            for id in outstanding {
                let job = self.controller.job_status(&id).await?;
                match job.state {
                    JobState::Completed => {
                        debug!("Job {id} completed");
                        report.completed.push(id);
                    }
                    JobState::Failed => {
                        debug!("Job {id} failed: {:?}", job.message);
                        report.failed.push(job);
                    }
                    JobState::Scheduled if job.requires_reboot => {
                        debug!("Job {id} is waiting for a reboot");
                        report.awaiting_reboot.push(job);
                    }
                    _ => still_running.push(id),
                }
            }
            outstanding = still_running;

            if outstanding.is_empty() {
                return Ok(report);
            }
            if let (Some(deadline), Some(timeout)) = (deadline, self.timeout) {
                if self.clock.now() >= deadline {
                    return Err(ReconcileError::PollTimeout {
                        timeout,
                        outstanding,
                    });
                }
            }
            debug!(
                "Waiting {}s for {} job(s) to complete: {}",
                self.interval.as_secs(),
                outstanding.len(),
                crate::model::join_ids(&outstanding)
            );
            self.clock.sleep(self.interval).await;
        }
    }
}
