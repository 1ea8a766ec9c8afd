use anyhow::bail;
use corespace::{layout::LayoutOptions, os::DEFAULT_PAGE_SIZE, Architecture, SpaceId};
use serde::Serialize;
use strum::IntoEnumIterator;

use crate::{app::GlobalOptions, output::print_output};

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub architecture: String,
    pub linkage_table: bool,
    pub valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub problems: Vec<String>,
}

fn check(architecture: Architecture, linkage_table: bool) -> CheckResult {
    let table = LayoutOptions::new()
        .with_linkage_table(linkage_table)
        .build(architecture);
    let mut problems = Vec::new();

    if let Some((first, second)) = table.overlaps() {
        problems.push(format!("{first} space overlaps {second} space"));
    }

    for space in &table {
        if space.base % DEFAULT_PAGE_SIZE != 0 || space.size % DEFAULT_PAGE_SIZE != 0 {
            problems.push(format!("{} space is not page aligned", space.id));
        }
    }

    let dynamic_sizes = (
        table.get(SpaceId::Dynamic0).map(|space| space.size),
        table.get(SpaceId::Dynamic1).map(|space| space.size),
    );
    match dynamic_sizes {
        (Some(first), Some(second)) if first == second => {}
        _ => problems.push("dynamic spaces are missing or differ in size".to_string()),
    }

    CheckResult {
        architecture: architecture.to_string(),
        linkage_table,
        valid: problems.is_empty(),
        problems,
    }
}

pub fn run(opts: &GlobalOptions) -> anyhow::Result<()> {
    let results: Vec<CheckResult> = Architecture::iter()
        .flat_map(|architecture| [check(architecture, false), check(architecture, true)])
        .collect();

    print_output(&results, opts, |results| {
        for result in results {
            let status = if result.valid { "PASS" } else { "FAIL" };
            let linkage = if result.linkage_table {
                "  (linkage table)"
            } else {
                ""
            };
            println!("{status}  {}{linkage}", result.architecture);
            for problem in &result.problems {
                println!("  {problem}");
            }
        }
    })?;

    let failed = results.iter().filter(|result| !result.valid).count();
    if failed > 0 {
        bail!("{failed} layout(s) failed the check");
    }
    Ok(())
}
