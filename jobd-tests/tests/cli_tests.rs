// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use jobd_tests::run_jobd::run_jobd_submit;

#[cfg(feature = "requires-cargo")]
fn stdout_json(out: &std::process::Output) -> serde_json::Value {
    println!("stderr: {}", String::from_utf8_lossy(&out.stderr));
    serde_json::from_slice(&out.stdout)
        .unwrap_or_else(|e| panic!("jobd did not print a job record: {e}"))
}

#[cfg(feature = "requires-cargo")]
#[test]
fn submitted_command_runs_to_success() {
    let out = run_jobd_submit(
        r#"{"command":"delete-storage-pool","pool_uuid":"5f0e"}"#,
        &["--msid", "7"],
    );
    assert!(out.status.success());

    let job = stdout_json(&out);
    assert_eq!(job["status"], "succeeded");
    assert_eq!(job["cmd"], "delete-storage-pool");
    assert_eq!(job["init_msid"], 7);
    assert_eq!(job["complete_msid"], 7);
}

#[cfg(feature = "requires-cargo")]
#[test]
fn sync_object_is_recorded_on_the_job() {
    let out = run_jobd_submit(
        r#"{"command":"ready","host_id":3}"#,
        &["--sync-object", "host:3"],
    );
    assert!(out.status.success());
    let job = stdout_json(&out);
    assert_eq!(job["sync_object"]["obj_type"], "host");
    assert_eq!(job["sync_object"]["obj_id"], 3);
}

#[cfg(feature = "requires-cargo")]
#[test]
fn malformed_command_is_refused() {
    let out = run_jobd_submit(r#"{"command":"format-everything"}"#, &[]);
    assert!(!out.status.success());
    assert!(out.stdout.is_empty());
}
