use comfy_table::{presets, CellAlignment, ContentArrangement, Table};
use serde::Serialize;

use crate::app::GlobalOptions;

/// Emit `report` as pretty JSON with `--json`, otherwise hand it to `display`.
pub fn print_output<T: Serialize>(
    report: &T,
    global: &GlobalOptions,
    display: impl FnOnce(&T),
) -> anyhow::Result<()> {
    if global.json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        display(report);
    }
    Ok(())
}

/// Render `rows` under `headers` as borderless columns.
///
/// Columns listed in `numeric` are right-aligned. Trailing whitespace is stripped from every
/// line.
pub fn render_table(headers: &[&str], numeric: &[usize], rows: Vec<Vec<String>>) -> String {
    let mut table = Table::new();
    table
        .load_preset(presets::NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(headers.to_vec())
        .add_rows(rows);

    let last = headers.len().saturating_sub(1);
    for index in 0..headers.len() {
        if let Some(column) = table.column_mut(index) {
            column.set_cell_alignment(if numeric.contains(&index) {
                CellAlignment::Right
            } else {
                CellAlignment::Left
            });
            column.set_padding((u16::from(index != 0), u16::from(index != last)));
        }
    }

    table
        .to_string()
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}
