use corespace::layout::LayoutOptions;
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::common::{format_size, parse_arch, SpaceRow},
    output::{print_output, Align, TabWriter},
};

#[derive(Debug, Serialize)]
pub struct LayoutReport {
    pub architecture: String,
    pub dynamic_space_size: usize,
    pub spaces: Vec<SpaceRow>,
}

pub fn run(arch: Option<&str>, linkage_table: bool, opts: &GlobalOptions) -> anyhow::Result<()> {
    let architecture = parse_arch(arch)?;

    let mut options = LayoutOptions::new();
    if linkage_table {
        options = options.with_linkage_table(true);
    }
    let table = options.build(architecture);

    let report = LayoutReport {
        architecture: architecture.to_string(),
        dynamic_space_size: table.dynamic_space_size(),
        spaces: table.iter().map(SpaceRow::from).collect(),
    };

    print_output(&report, opts, |r| {
        println!("Layout for {}", r.architecture);
        println!();

        let mut writer = TabWriter::new(vec![
            ("SPACE", Align::Left),
            ("BASE", Align::Left),
            ("END", Align::Left),
            ("SIZE", Align::Right),
            ("PROT", Align::Left),
        ]);
        for space in &r.spaces {
            writer.row(vec![
                space.space.clone(),
                space.base.clone(),
                space.end.clone(),
                format_size(space.size),
                space.protection.clone(),
            ]);
        }
        writer.print();
    })
}
