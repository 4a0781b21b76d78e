use anyhow::{Context, Result};
use clap::Args;
use comfy_table::{Cell, Color as TableColor, Table};
use std::path::PathBuf;

use snugom_migrate::{ChangeSetStatus, MigrationStats, RunStatus};

use crate::context::ProjectContext;
use crate::examples::ExampleGroup;
use crate::output::{OutputManager, TableDisplay};
use crate::theme::ICONS;

pub const UPDATE_EXAMPLES: &[ExampleGroup] = &[
    ExampleGroup {
        title: "Apply Changes",
        commands: &[
            "snugom-migrate update --changelog db/changelog.json",
            "snugom-migrate update --contexts prod,eu       # Only changesets for these contexts",
        ],
    },
    ExampleGroup {
        title: "Preview",
        commands: &["snugom-migrate update-sql --changelog db/changelog.json"],
    },
];

pub const STATUS_EXAMPLES: &[ExampleGroup] = &[ExampleGroup {
    title: "Inspect",
    commands: &[
        "snugom-migrate status                          # Uses changelog.file from .snugom/migrate.toml",
        "snugom-migrate --output json status",
    ],
}];

pub const SYNC_EXAMPLES: &[ExampleGroup] = &[ExampleGroup {
    title: "Adopt An Existing Database",
    commands: &[
        "snugom-migrate changelog-sync                  # Mark every pending changeset as ran",
        "snugom-migrate mark-next-changeset-ran         # Mark only the next one",
    ],
}];

/// Arguments shared by every command that reads a changelog
#[derive(Args, Debug, Clone, Default)]
pub struct ChangeLogArgs {
    /// Changelog file (defaults to changelog.file in .snugom/migrate.toml)
    #[arg(short, long)]
    pub changelog: Option<PathBuf>,

    /// Only consider changesets for these contexts (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub contexts: Vec<String>,
}

pub async fn handle_update(ctx: &ProjectContext, args: ChangeLogArgs, output: &OutputManager) -> Result<()> {
    let changelog = ctx.load_changelog(args.changelog.as_deref())?;
    let runner = ctx.runner().await?;

    output.heading("Update");
    output.progress("Applying changesets");
    let stats = runner
        .update(&changelog, &args.contexts)
        .await
        .context("Update failed");
    output.clear_line();
    let stats = stats?;

    output.display(&stats)?;
    output.key_value("Deployment", &stats.deployment_id);
    if stats.applied + stats.reran == 0 {
        output.success("Database is up to date");
    } else {
        output.success(&format!(
            "Executed {} changeset(s) in {}ms",
            stats.applied + stats.reran,
            stats.total_time_ms
        ));
    }
    Ok(())
}

pub async fn handle_update_sql(ctx: &ProjectContext, args: ChangeLogArgs, output: &OutputManager) -> Result<()> {
    let changelog = ctx.load_changelog(args.changelog.as_deref())?;
    let runner = ctx.runner().await?;

    let rendered = runner.update_sql(&changelog, &args.contexts).await?;
    if rendered.is_empty() {
        output.info("Nothing to execute");
        return Ok(());
    }
    output.lines(rendered.iter().map(String::as_str));
    Ok(())
}

pub async fn handle_status(ctx: &ProjectContext, args: ChangeLogArgs, output: &OutputManager) -> Result<()> {
    let changelog = ctx.load_changelog(args.changelog.as_deref())?;
    let runner = ctx.runner().await?;

    let statuses = runner.status(&changelog, &args.contexts).await?;
    output.display(&statuses)?;

    for status in &statuses {
        if let RunStatus::ChecksumChanged { stored, current } = &status.status {
            output.bullet(&format!(
                "{}::{} was edited after it ran (recorded {stored}, now {current})",
                status.id, status.author
            ));
        }
    }

    let pending = statuses.iter().filter(|s| s.is_pending()).count();
    if pending == 0 {
        output.success("Database is up to date");
    } else {
        output.warning(&format!("{pending} changeset(s) pending"));
    }
    Ok(())
}

pub async fn handle_validate(ctx: &ProjectContext, args: ChangeLogArgs, output: &OutputManager) -> Result<()> {
    let changelog = ctx.load_changelog(args.changelog.as_deref())?;
    let runner = ctx.runner().await?;

    if let Err(err) = runner.validate(&changelog).await {
        output.error(&format!("{} failed validation", changelog.path));
        return Err(err.into());
    }
    output.success(&format!(
        "{} is valid ({} changeset(s))",
        changelog.path,
        changelog.changesets.len()
    ));
    Ok(())
}

pub async fn handle_changelog_sync(ctx: &ProjectContext, args: ChangeLogArgs, output: &OutputManager) -> Result<()> {
    let changelog = ctx.load_changelog(args.changelog.as_deref())?;
    let runner = ctx.runner().await?;

    let marked = runner.changelog_sync(&changelog, &args.contexts).await?;
    output.success(&format!("Marked {marked} changeset(s) as ran"));
    Ok(())
}

pub async fn handle_mark_next(ctx: &ProjectContext, args: ChangeLogArgs, output: &OutputManager) -> Result<()> {
    let changelog = ctx.load_changelog(args.changelog.as_deref())?;
    let runner = ctx.runner().await?;

    match runner.mark_next_changeset_ran(&changelog, &args.contexts).await? {
        Some(changeset) => output.success(&format!("Marked {changeset} as ran")),
        None => output.info("No pending changesets"),
    }
    Ok(())
}

pub fn status_label(status: &RunStatus) -> &'static str {
    match status {
        RunStatus::NotRan => "pending",
        RunStatus::AlreadyRan => "executed",
        RunStatus::RunAgain => "will re-run",
        RunStatus::ChecksumCleared => "checksum cleared",
        RunStatus::ChecksumChanged { .. } => "checksum changed",
    }
}

impl TableDisplay for MigrationStats {
    fn to_table(&self, output: &OutputManager) -> Table {
        let mut table = output.create_table();
        output.add_table_header(&mut table, &["Applied", "Re-ran", "Skipped", "Filtered", "Repaired", "Statements"]);
        table.add_row(vec![
            Cell::new(self.applied),
            Cell::new(self.reran),
            Cell::new(self.skipped),
            Cell::new(self.filtered),
            Cell::new(self.repaired),
            Cell::new(self.statements),
        ]);
        table
    }

    fn to_compact(&self) -> String {
        format!(
            "deployment={} applied={} reran={} skipped={}",
            self.deployment_id, self.applied, self.reran, self.skipped
        )
    }
}

impl TableDisplay for Vec<ChangeSetStatus> {
    fn to_table(&self, output: &OutputManager) -> Table {
        let mut table = output.create_table();
        output.add_table_header(&mut table, &["Changeset", "Author", "Status", "In context"]);
        for status in self {
            let mut cell = Cell::new(status_label(&status.status));
            if !output.options.no_color {
                cell = cell.fg(match status.status {
                    RunStatus::AlreadyRan => TableColor::Green,
                    RunStatus::ChecksumChanged { .. } => TableColor::Red,
                    _ => TableColor::Yellow,
                });
            }
            table.add_row(vec![
                Cell::new(&status.id),
                Cell::new(&status.author),
                cell,
                Cell::new(if status.in_context { ICONS.success } else { "-" }),
            ]);
        }
        table
    }

    fn to_compact(&self) -> String {
        self.iter()
            .map(|s| format!("{}::{}={}", s.id, s.author, status_label(&s.status)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
