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

/* BIOS and RAID reconciliation client
 * Brings a BMC's BIOS settings and virtual disks to the state described in a
 * JSON document, and prints the result as JSON.
 *
 * USAGE: ./client -H 10.153.145.103 -U TheBMCUsername -P TheBMCPassword -f desired.json --reboot
 * -H: IP address of the BMC's Redfish API. Should be HTTPS on port 443.
 * -f: JSON document with bios_config, raid_config and any other option.
 * Run with no params for help.
 * Run with `-v` for more output.
 */

use std::time::Duration;

use anyhow::anyhow;
use redfish_reconcile::{
    ExecutionState, ReconcileConfig, ReconcileOptions, ReconcileResult, RedfishClientPool,
    TokioClock,
};
use tracing::{error, info};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt::Layer;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args: Vec<String> = std::env::args().collect();
    let mut opts = getopts::Options::new();

    opts.optflag("h", "help", "Print this help");
    opts.optflag("v", "verbose", "Log at DEBUG level. Default is INFO");
    opts.optopt(
        "H",
        "hostname",
        "Required. Hostname or IP address of BMC Redfish API",
        "HOST",
    );
    opts.optopt("p", "port", "BMC port. Default is 443", "PORT");
    opts.optopt("U", "username", "BMC username", "USER");
    opts.optopt("P", "password", "BMC password", "PASS");
    opts.optopt(
        "f",
        "file",
        "JSON document with bios_config, raid_config and other options",
        "FILE",
    );
    opts.optflag("", "reboot", "Allow rebooting the host to apply changes");
    opts.optflag("", "force-reboot", "Reboot with a forced restart");
    opts.optopt(
        "",
        "timeout",
        "Seconds to wait for jobs on each reboot. Default waits forever",
        "SECS",
    );
    opts.optopt("", "interval", "Seconds between job status checks", "SECS");
    opts.optflag("", "check", "Report what would change without changing it");

    let args_given = opts.parse(&args[1..])?;
    if args_given.opt_present("h") || !args_given.opt_present("H") {
        eprintln!(
            "{}",
            opts.usage("client -H bmc_ip -U bmc_user -P bmc_pass -f desired.json [--reboot]")
        );
        return Ok(());
    }

    let log_level = if args_given.opt_present("v") {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let env_filter = EnvFilter::from_default_env()
        .add_directive(log_level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);
    tracing_subscriber::registry()
        .with(Layer::default().compact())
        .with(env_filter)
        .init();

    let mut config = match args_given.opt_str("f") {
        Some(path) => match ReconcileConfig::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                let result = ReconcileResult::failure(
                    &ExecutionState::default(),
                    &ReconcileOptions::default(),
                    &e.into(),
                );
                return finish(&path, &result);
            }
        },
        None => ReconcileConfig::default(),
    };
    if let Some(host) = args_given.opt_str("H") {
        config.address = host;
    }
    if let Some(port) = args_given.opt_get::<u16>("p")? {
        config.port = Some(port);
    }
    if let Some(user) = args_given.opt_str("U") {
        config.username = Some(user);
    }
    if let Some(password) = args_given.opt_str("P") {
        config.password = Some(password);
    }
    if let Some(timeout) = args_given.opt_get::<u64>("timeout")? {
        config.timeout = timeout;
    }
    if let Some(interval) = args_given.opt_get::<u64>("interval")? {
        config.interval = interval;
    }
    config.reboot |= args_given.opt_present("reboot");
    config.force_reboot |= args_given.opt_present("force-reboot");
    config.check_mode |= args_given.opt_present("check");

    let result = match RedfishClientPool::builder()
        .timeout(Duration::from_secs(60))
        .build()
    {
        Ok(pool) => redfish_reconcile::reconcile_endpoint(&pool, &config, &TokioClock).await,
        Err(e) => ReconcileResult::failure(
            &ExecutionState::default(),
            &config.options().unwrap_or_default(),
            &e.into(),
        ),
    };
    finish(&config.address, &result)
}

fn finish(target: &str, result: &ReconcileResult) -> Result<(), anyhow::Error> {
    println!("{}", serde_json::to_string_pretty(result)?);
    if result.failed {
        error!("{}", result.message);
        return Err(anyhow!("reconciliation of {target} failed"));
    }
    info!("{}", result.message);
    Ok(())
}
