//! Startup validation that cannot place a space terminates the process.
//!
//! The test re-runs its own binary as a child with `CORESPACE_VALIDATE_CHILD` set. The child
//! takes the first page of the read-only space before calling [`corespace::validate`], which
//! must print the failure and exit with status 1.
#![cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]

use std::process::Command;

use corespace::prelude::*;

const CHILD: &str = "CORESPACE_VALIDATE_CHILD";
const TEST_NAME: &str = "validate_exits_when_a_space_is_taken";
/// Child could not take the page itself, so there is nothing to test
const SKIP: i32 = 77;

fn run_child() -> ! {
    let base = layout(Architecture::host())
        .get(SpaceId::ReadOnly)
        .unwrap()
        .base;

    let taken = unsafe {
        libc::mmap(
            base as *mut libc::c_void,
            corespace::os::page_size(),
            libc::PROT_READ,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
            -1,
            0,
        )
    };
    if taken as usize != base {
        std::process::exit(SKIP);
    }

    corespace::validate();
    std::process::exit(0);
}

#[test]
fn validate_exits_when_a_space_is_taken() {
    if std::env::var_os(CHILD).is_some() {
        run_child();
    }

    let output = Command::new(std::env::current_exe().unwrap())
        .args(["--exact", TEST_NAME, "--nocapture", "--test-threads=1"])
        .env(CHILD, "1")
        .output()
        .unwrap();

    if output.status.code() == Some(SKIP) {
        eprintln!("skipping: read-only space base is unavailable");
        return;
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(output.status.code(), Some(1), "stderr: {stderr}");

    let base = layout(Architecture::host())
        .get(SpaceId::ReadOnly)
        .unwrap()
        .base;
    assert!(stderr.contains("Failed to validate"), "stderr: {stderr}");
    assert!(
        stderr.contains(&format!("read-only space at {base:#x}")),
        "stderr: {stderr}"
    );
}
