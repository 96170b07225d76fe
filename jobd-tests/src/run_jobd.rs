// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::process::{Command, Output};

use base64::prelude::BASE64_STANDARD;
use base64::Engine as _;

/// Run the jobd binary located via cargo with one submitted command. The
/// command travels base64-encoded so shell quoting never matters.
pub fn run_jobd_submit(command_json: &str, extra_args: &[&str]) -> Output {
    let encoded = BASE64_STANDARD.encode(command_json);
    println!("Executing jobd located via cargo run");
    Command::new("cargo")
        .args(["run", "-q", "-p", "jobd", "--", "--submit-base64", &encoded])
        .args(["--heartbeat-interval-ms", "100", "--wait-secs", "10"])
        .args(extra_args)
        .output()
        .expect("failed to run jobd")
}
