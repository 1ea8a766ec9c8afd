//! External linker orchestration.
//!
//! The executable is produced by the platform compiler driver (`cc` by default), which links
//! the runtime with the core objects. Two things are passed on top of the configured flags:
//!
//! - a GNU ld placement script (`-Wl,-T,<script>`) that puts every core section at its space
//!   address and is inserted after `.bss`, so the default script still lays out the runtime
//! - `-Wl,--defsym,initial_function_addr=<address>`, the entry point into the saved image
//!
//! The linker is run synchronously; a non-zero exit is [`Error::LinkFailed`].

use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
};

use log::{debug, info};

use super::{artifacts::LINKER_SCRIPT, CoreSection};
use crate::{Error, Result};

/// Symbol the runtime reads the image entry point from.
pub const INITIAL_FUNCTION_SYMBOL: &str = "initial_function_addr";

/// How the linker is invoked.
///
/// ```rust
/// use corespace::image::LinkerConfig;
///
/// let config = LinkerConfig::default()
///     .with_program("gcc")
///     .with_flag("-no-pie")
///     .with_runtime("/usr/lib/lisp/lisp.a");
/// assert_eq!(config.flags, vec!["-no-pie".to_string()]);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkerConfig {
    /// The compiler driver or linker to run
    pub program: PathBuf,
    /// Extra arguments placed before everything else
    pub flags: Vec<String>,
    /// Runtime archive or startup object linked in before the core objects
    pub runtime: Option<PathBuf>,
    /// Keep the intermediate objects and script after the build
    pub keep_artifacts: bool,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        LinkerConfig {
            program: PathBuf::from("cc"),
            flags: Vec::new(),
            runtime: None,
            keep_artifacts: false,
        }
    }
}

impl LinkerConfig {
    /// Sets the linker program.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Appends one flag.
    #[must_use]
    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }

    /// Replaces all flags.
    #[must_use]
    pub fn with_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flags = flags.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the runtime archive or startup object.
    #[must_use]
    pub fn with_runtime(mut self, runtime: impl Into<PathBuf>) -> Self {
        self.runtime = Some(runtime.into());
        self
    }

    /// Keeps intermediate files after the build.
    #[must_use]
    pub fn with_keep_artifacts(mut self, keep: bool) -> Self {
        self.keep_artifacts = keep;
        self
    }
}

/// One link: output, inputs and the entry point.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkInvocation {
    /// The executable to produce
    pub output: PathBuf,
    /// Core objects, in link order
    pub objects: Vec<PathBuf>,
    /// Placement script for the core sections
    pub script: Option<PathBuf>,
    /// Address of the image's initial function
    pub initial_function: Option<u64>,
}

impl LinkInvocation {
    /// A link producing `output`.
    #[must_use]
    pub fn new(output: impl Into<PathBuf>) -> Self {
        LinkInvocation {
            output: output.into(),
            ..Default::default()
        }
    }

    /// Appends an object.
    #[must_use]
    pub fn with_object(mut self, object: impl Into<PathBuf>) -> Self {
        self.objects.push(object.into());
        self
    }

    /// Sets the placement script.
    #[must_use]
    pub fn with_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.script = Some(script.into());
        self
    }

    /// Defines [`INITIAL_FUNCTION_SYMBOL`] at `address`.
    #[must_use]
    pub fn with_initial_function(mut self, address: Option<u64>) -> Self {
        self.initial_function = address;
        self
    }
}

/// The GNU ld script placing each core section at its address.
///
/// ```rust
/// use corespace::image::{placement_script, CoreSection};
///
/// let script = placement_script(&[(CoreSection::Static, 0x2800_0000)]);
/// assert!(script.contains("CORSTA 0x28000000 : { *(CORSTA) }"));
/// assert!(script.ends_with("INSERT AFTER .bss;\n"));
/// ```
#[must_use]
pub fn placement_script(sections: &[(CoreSection, u64)]) -> String {
    let mut script = String::from("SECTIONS\n{\n");
    for (section, address) in sections {
        let name = section.name();
        let _ = writeln!(script, "  {name} {address:#x} : {{ *({name}) }}");
    }
    script.push_str("}\nINSERT AFTER .bss;\n");
    script
}

/// Writes [`placement_script`] to [`LINKER_SCRIPT`] in `dir`.
///
/// # Errors
///
/// Returns [`Error::FileError`] if the file cannot be written.
pub fn write_placement_script(
    dir: impl AsRef<Path>,
    sections: &[(CoreSection, u64)],
) -> Result<PathBuf> {
    let path = dir.as_ref().join(LINKER_SCRIPT);
    std::fs::write(&path, placement_script(sections))?;
    debug!("Wrote {}", path.display());
    Ok(path)
}

/// Builds the linker command without running it.
#[must_use]
pub fn linker_command(config: &LinkerConfig, invocation: &LinkInvocation) -> Command {
    let mut command = Command::new(&config.program);
    command.args(&config.flags);
    command.arg("-o").arg(&invocation.output);

    if let Some(runtime) = &config.runtime {
        command.arg(runtime);
    }
    command.args(&invocation.objects);

    if let Some(script) = &invocation.script {
        let mut flag = std::ffi::OsString::from("-Wl,-T,");
        flag.push(script);
        command.arg(flag);
    }
    if let Some(address) = invocation.initial_function {
        command.arg(format!(
            "-Wl,--defsym,{INITIAL_FUNCTION_SYMBOL}={address:#x}"
        ));
    }

    command
}

/// Runs the linker and waits for it.
///
/// # Errors
///
/// Returns [`Error::LinkerSpawn`] if the program cannot be started and [`Error::LinkFailed`]
/// with its exit status if it does not succeed.
pub fn run_linker(config: &LinkerConfig, invocation: &LinkInvocation) -> Result<ExitStatus> {
    let mut command = linker_command(config, invocation);
    debug!("Running {command:?}");

    let status = command.status().map_err(|source| Error::LinkerSpawn {
        program: config.program.clone(),
        source,
    })?;

    if !status.success() {
        return Err(Error::LinkFailed {
            program: config.program.clone(),
            status,
        });
    }

    info!("Linked {}", invocation.output.display());
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arguments(command: &Command) -> Vec<String> {
        command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_command_arguments() {
        let config = LinkerConfig::default()
            .with_flag("-no-pie")
            .with_runtime("lisp.a");
        let invocation = LinkInvocation::new("lisp.exe")
            .with_object("CORRO.o")
            .with_object("CORSTA.o")
            .with_script("work/corespace.ld")
            .with_initial_function(Some(0x2800_1000));

        let command = linker_command(&config, &invocation);
        assert_eq!(command.get_program(), "cc");
        assert_eq!(
            arguments(&command),
            vec![
                "-no-pie",
                "-o",
                "lisp.exe",
                "lisp.a",
                "CORRO.o",
                "CORSTA.o",
                "-Wl,-T,work/corespace.ld",
                "-Wl,--defsym,initial_function_addr=0x28001000",
            ]
        );
    }

    #[test]
    fn test_command_minimal() {
        let command = linker_command(&LinkerConfig::default(), &LinkInvocation::new("a.out"));
        assert_eq!(arguments(&command), vec!["-o", "a.out"]);
    }

    #[test]
    fn test_placement_script() {
        let script = placement_script(&[
            (CoreSection::ReadOnly, 0x1000_0000),
            (CoreSection::Dynamic, 0x4000_0000),
        ]);
        assert_eq!(
            script,
            "SECTIONS\n{\n  CORRO 0x10000000 : { *(CORRO) }\n  CORDYN 0x40000000 : { *(CORDYN) }\n}\nINSERT AFTER .bss;\n"
        );
    }

    #[test]
    fn test_missing_program() {
        let config = LinkerConfig::default().with_program("/nonexistent/corespace-ld");
        let error = run_linker(&config, &LinkInvocation::new("a.out")).unwrap_err();
        assert!(matches!(error, Error::LinkerSpawn { .. }));
    }
}
