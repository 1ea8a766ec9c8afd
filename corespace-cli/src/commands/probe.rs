use anyhow::bail;
use corespace::{
    layout::layout,
    os::{SimulatedVm, VmBackend},
    SpaceTable,
};
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::common::{parse_address, parse_arch, SpaceRow},
    output::print_output,
};

#[derive(Debug, Serialize)]
pub struct ProbeResult {
    pub architecture: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mapped: Vec<SpaceRow>,
}

pub fn run(arch: Option<&str>, occupy: &[String], opts: &GlobalOptions) -> anyhow::Result<()> {
    let architecture = parse_arch(arch)?;

    let vm = SimulatedVm::new();
    for value in occupy {
        let address = parse_address(value)?;
        vm.occupy(address & !(vm.page_size() - 1), vm.page_size());
    }

    let table = layout(architecture);
    let (error_message, mapped) = match SpaceTable::validate_with(table, Box::new(vm)) {
        Ok(spaces) => (None, spaces.layout().iter().map(SpaceRow::from).collect()),
        Err(e) => (Some(e.to_string()), Vec::new()),
    };

    let result = ProbeResult {
        architecture: architecture.to_string(),
        valid: error_message.is_none(),
        error_message,
        mapped,
    };

    print_output(&result, opts, |r| {
        let status = if r.valid { "PASS" } else { "FAIL" };
        println!("{status}  {}", r.architecture);
        if let Some(err) = &r.error_message {
            println!("  Error: {err}");
        }
        for space in &r.mapped {
            println!("  {:<16} {}..{}", space.space, space.base, space.end);
        }
    })?;

    if !result.valid {
        bail!("validation failed for {}", result.architecture);
    }
    Ok(())
}
