use std::path::Path;

use anyhow::Context;
use corespace::image::list_core_sections;
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::common::format_size,
    output::{print_output, Align, TabWriter},
};

#[derive(Debug, Serialize)]
pub struct SectionRow {
    pub name: String,
    pub address: String,
    pub size: usize,
}

#[derive(Debug, Serialize)]
pub struct InspectReport {
    pub path: String,
    pub sections: Vec<SectionRow>,
}

pub fn run(path: &Path, opts: &GlobalOptions) -> anyhow::Result<()> {
    let sections = list_core_sections(path)
        .with_context(|| format!("failed to read core sections: {}", path.display()))?;

    let report = InspectReport {
        path: path.display().to_string(),
        sections: sections
            .iter()
            .map(|loaded| SectionRow {
                name: loaded.section.to_string(),
                address: format!("{:#010x}", loaded.address),
                size: loaded.size,
            })
            .collect(),
    };

    print_output(&report, opts, |r| {
        if r.sections.is_empty() {
            println!("{}: no core sections", r.path);
            return;
        }

        println!("{}", r.path);
        let mut writer = TabWriter::new(vec![
            ("SECTION", Align::Left),
            ("ADDRESS", Align::Left),
            ("SIZE", Align::Right),
        ]);
        for section in &r.sections {
            writer.row(vec![
                section.name.clone(),
                section.address.clone(),
                format_size(section.size),
            ]);
        }
        writer.print();
    })
}
