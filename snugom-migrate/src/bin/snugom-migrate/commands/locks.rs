use anyhow::Result;
use clap::Subcommand;
use comfy_table::{Cell, Table};

use snugom_migrate::LockRecord;

use crate::context::ProjectContext;
use crate::examples::ExampleGroup;
use crate::output::{OutputManager, TableDisplay};
use crate::theme::ICONS;

pub const EXAMPLES: &[ExampleGroup] = &[
    ExampleGroup {
        title: "Inspect",
        commands: &["snugom-migrate locks list"],
    },
    ExampleGroup {
        title: "Recovery",
        commands: &[
            "snugom-migrate locks release                   # Release every slot, whoever holds it",
            "snugom-migrate locks release --slot 2",
        ],
    },
];

#[derive(Subcommand)]
pub enum LocksCommands {
    /// Show every change log lock slot
    #[command(name = "list")]
    List,

    /// Force-release lock slots left behind by a crashed run
    #[command(name = "release")]
    Release {
        /// Release only this slot
        #[arg(long)]
        slot: Option<i64>,
    },
}

pub async fn handle_locks_commands(
    command: LocksCommands,
    ctx: &ProjectContext,
    output: &OutputManager,
) -> Result<()> {
    let runner = ctx.runner().await?;

    match command {
        LocksCommands::List => {
            let records = runner.list_locks().await?;
            if records.is_empty() {
                output.info("No lock slots provisioned yet");
                return Ok(());
            }
            output.display(&records)?;
        }
        LocksCommands::Release { slot } => {
            runner.release_locks(slot).await?;
            match slot {
                Some(slot) => output.success(&format!("Released lock slot {slot}")),
                None => output.success("Released all lock slots"),
            }
        }
    }

    Ok(())
}

impl TableDisplay for Vec<LockRecord> {
    fn to_table(&self, output: &OutputManager) -> Table {
        let mut table = output.create_table();
        output.add_table_header(&mut table, &["Slot", "State", "Held by", "Since"]);
        for record in self {
            let state = if record.locked {
                format!("{} locked", ICONS.lock)
            } else {
                format!("{} free", ICONS.unlock)
            };
            table.add_row(vec![
                Cell::new(record.id),
                Cell::new(state),
                Cell::new(record.locked_by.as_deref().unwrap_or("")),
                Cell::new(record.locked_at.as_deref().unwrap_or("")),
            ]);
        }
        table
    }

    fn to_compact(&self) -> String {
        let held = self.iter().filter(|r| r.locked).count();
        format!("Slots: {} held: {held}", self.len())
    }
}
