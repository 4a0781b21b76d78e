use crate::commands::{changelog, history, locks};

#[derive(Clone, Copy)]
pub struct ExampleGroup {
    pub title: &'static str,
    pub commands: &'static [&'static str],
}

#[derive(Clone, Copy)]
pub struct CommandExample {
    pub name: &'static str,
    pub groups: &'static [ExampleGroup],
}

pub fn command_examples() -> &'static [CommandExample] {
    &[
        CommandExample {
            name: "update",
            groups: changelog::UPDATE_EXAMPLES,
        },
        CommandExample {
            name: "update-sql",
            groups: changelog::UPDATE_EXAMPLES,
        },
        CommandExample {
            name: "status",
            groups: changelog::STATUS_EXAMPLES,
        },
        CommandExample {
            name: "changelog-sync",
            groups: changelog::SYNC_EXAMPLES,
        },
        CommandExample {
            name: "history",
            groups: history::EXAMPLES,
        },
        CommandExample {
            name: "locks",
            groups: locks::EXAMPLES,
        },
    ]
}
