use anyhow::Result;
use comfy_table::{Cell, Table};

use snugom_migrate::ChangeSetRecord;

use crate::context::ProjectContext;
use crate::examples::ExampleGroup;
use crate::output::{OutputManager, TableDisplay};

pub const EXAMPLES: &[ExampleGroup] = &[
    ExampleGroup {
        title: "History",
        commands: &[
            "snugom-migrate history",
            "snugom-migrate tag v1.4.0                      # Tag the last executed changeset",
        ],
    },
    ExampleGroup {
        title: "Checksums",
        commands: &["snugom-migrate clear-checksums               # Recomputed on the next update"],
    },
];

pub async fn handle_history(ctx: &ProjectContext, output: &OutputManager) -> Result<()> {
    let runner = ctx.runner().await?;
    let records = runner.history().await?;
    if records.is_empty() {
        output.info("No changesets have been executed");
        return Ok(());
    }
    output.display(&records)
}

pub async fn handle_tag(ctx: &ProjectContext, tag: &str, output: &OutputManager) -> Result<()> {
    let runner = ctx.runner().await?;
    if runner.tag(tag).await? {
        output.success(&format!("Tagged the last executed changeset as {tag}"));
    } else {
        output.warning("Nothing to tag; no changesets have been executed");
    }
    Ok(())
}

pub async fn handle_clear_checksums(ctx: &ProjectContext, output: &OutputManager) -> Result<()> {
    let runner = ctx.runner().await?;
    let cleared = runner.clear_checksums().await?;
    output.success(&format!("Cleared {cleared} checksum(s)"));
    Ok(())
}

impl TableDisplay for Vec<ChangeSetRecord> {
    fn to_table(&self, output: &OutputManager) -> Table {
        let mut table = output.create_table();
        output.add_table_header(&mut table, &["#", "Changeset", "Author", "Executed", "Type", "Tag", "Deployment"]);
        for record in self {
            table.add_row(vec![
                Cell::new(record.order_executed),
                Cell::new(&record.id),
                Cell::new(&record.author),
                Cell::new(record.date_executed.format("%Y-%m-%d %H:%M:%S UTC")),
                Cell::new(record.exec_type.as_str()),
                Cell::new(record.tag.as_deref().unwrap_or("")),
                Cell::new(&record.deployment_id),
            ]);
        }
        table
    }

    fn to_compact(&self) -> String {
        format!("Executed: {}", self.len())
    }
}
