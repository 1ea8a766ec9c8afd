//! Saving through a stand-in linker.
//!
//! The linker is `/bin/sh -c <script>`, so the tests see exactly the arguments a real `cc`
//! would get and can fail or succeed on demand. One test hands a broken object to the host's
//! real `cc` and is skipped where none is installed.
#![cfg(unix)]

use std::{path::Path, process::Command};

use corespace::{
    image::{
        run_linker, save_executable, CoreSection, ImageObject, LinkInvocation, LinkerConfig,
        SaveRequest, LINKER_SCRIPT,
    },
    prelude::*,
};

/// Checks every object handed over exists, then creates the `-o` output.
const LINK_OK: &str = r#"
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift ;;
    *.o) [ -f "$1" ] || exit 9 ;;
  esac
  shift
done
[ -n "$out" ] || exit 8
printf 'linked' > "$out"
"#;

const LINK_FAIL: &str = "exit 3";

fn shell_linker(script: &str) -> LinkerConfig {
    LinkerConfig::default()
        .with_program("/bin/sh")
        .with_flags(["-c", script, "ld"])
}

fn populated() -> SpaceTable {
    let spaces =
        SpaceTable::validate_with(layout(Architecture::Hppa), Box::new(SimulatedVm::new())).unwrap();
    for id in [SpaceId::ReadOnly, SpaceId::Static, SpaceId::Dynamic0] {
        let base = spaces.descriptor(id).unwrap().base;
        spaces.write(base, &[0xa5; 0x100]).unwrap();
    }
    spaces
}

fn request(spaces: &SpaceTable, work_dir: &Path) -> SaveRequest {
    let free = |id: SpaceId| spaces.descriptor(id).unwrap().base + 0x1000;

    SaveRequest::new(work_dir.join("lisp.core"), work_dir)
        .with_initial_function(0x2800_0040)
        .with_free_pointer(CoreSection::ReadOnly, free(SpaceId::ReadOnly))
        .with_free_pointer(CoreSection::Static, free(SpaceId::Static))
        .with_free_pointer(CoreSection::Dynamic, free(SpaceId::Dynamic0))
}

fn artifacts_left(dir: &Path) -> Vec<String> {
    ["CORRO.o", "CORSTA.o", "CORDYN.o", LINKER_SCRIPT]
        .into_iter()
        .filter(|name| dir.join(name).exists())
        .map(str::to_string)
        .collect()
}

#[test]
fn successful_link_cleans_up() {
    let spaces = populated();
    let dir = tempfile::tempdir().unwrap();
    let request = request(&spaces, dir.path());

    let output = save_executable(&spaces, &request, &shell_linker(LINK_OK)).unwrap();

    assert_eq!(output, dir.path().join("lisp.core"));
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "linked");
    assert!(artifacts_left(dir.path()).is_empty());
}

#[test]
fn failed_link_reports_the_status_and_cleans_up() {
    let spaces = populated();
    let dir = tempfile::tempdir().unwrap();
    let request = request(&spaces, dir.path());

    let error = save_executable(&spaces, &request, &shell_linker(LINK_FAIL)).unwrap_err();
    let Error::LinkFailed { program, status } = error else {
        panic!("expected a link failure");
    };

    assert_eq!(program, Path::new("/bin/sh"));
    assert_eq!(status.code(), Some(3));
    assert!(artifacts_left(dir.path()).is_empty());
    assert!(!dir.path().join("lisp.core").exists());
}

#[test]
fn missing_linker_is_a_spawn_error() {
    let spaces = populated();
    let dir = tempfile::tempdir().unwrap();
    let request = request(&spaces, dir.path());
    let config = LinkerConfig::default().with_program(dir.path().join("no-such-linker"));

    let error = save_executable(&spaces, &request, &config).unwrap_err();
    assert!(matches!(error, Error::LinkerSpawn { .. }));
    assert!(artifacts_left(dir.path()).is_empty());
}

#[test]
fn kept_artifacts_stay_behind() {
    let spaces = populated();
    let dir = tempfile::tempdir().unwrap();
    let request = request(&spaces, dir.path());
    let config = shell_linker(LINK_OK).with_keep_artifacts(true);

    save_executable(&spaces, &request, &config).unwrap();

    assert_eq!(
        artifacts_left(dir.path()),
        vec!["CORRO.o", "CORSTA.o", "CORDYN.o", LINKER_SCRIPT]
    );

    let script = std::fs::read_to_string(dir.path().join(LINKER_SCRIPT)).unwrap();
    assert!(script.contains("CORSTA 0x28000000 : { *(CORSTA) }"));
    assert!(script.ends_with("INSERT AFTER .bss;\n"));

    corespace::image::cleanup(dir.path()).unwrap();
    assert!(artifacts_left(dir.path()).is_empty());
}

#[test]
fn real_linker_rejects_a_truncated_object() {
    let available = Command::new("cc")
        .arg("--version")
        .output()
        .is_ok_and(|output| output.status.success());
    if !available {
        eprintln!("skipping: no cc on this host");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let mut object = ImageObject::new(Architecture::host());
    object.push_section("CORSTA", 0x2800_0000, vec![0xa5; 0x100]);
    let bytes = object.encode().unwrap();

    // A valid ELF header whose section table lies past the end of the file
    let broken = dir.path().join("CORSTA.o");
    std::fs::write(&broken, &bytes[..64]).unwrap();

    let output = dir.path().join("lisp.core");
    let invocation = LinkInvocation::new(&output).with_object(&broken);
    let error = run_linker(&LinkerConfig::default(), &invocation).unwrap_err();

    let Error::LinkFailed { program, status } = error else {
        panic!("expected a link failure");
    };
    assert_eq!(program, Path::new("cc"));
    assert!(!status.success());
    assert!(!output.exists());
}
