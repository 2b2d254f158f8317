//! Two-tier commands. Every user-facing command `X` runs on the operator's
//! workstation, makes sure the API server has the same plugin build, and
//! then runs `X-impl` there over SSH.

pub mod client;
pub mod relocate;
pub mod remote;

pub use client::ClientContext;
pub use remote::RemoteContext;

/// The shape shared by both halves of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    pub impl_name: &'static str,
    /// Takes a controller name after the environment name, and hands the
    /// impl half the controller's connection info.
    pub needs_controller: bool,
}

const fn spec(name: &'static str, impl_name: &'static str, needs_controller: bool) -> CommandSpec {
    CommandSpec {
        name,
        impl_name,
        needs_controller,
    }
}

pub const VERIFY_SOURCE: CommandSpec = spec("verify-source", "verify-source-impl", false);
pub const DUMP_SOURCE_DB: CommandSpec = spec("dump-source-db", "dump-source-db-impl", false);
pub const AGENT_STATUS: CommandSpec = spec("agent-status", "agent-status-impl", false);
pub const START_AGENTS: CommandSpec = spec("start-agents", "start-agents-impl", false);
pub const STOP_AGENTS: CommandSpec = spec("stop-agents", "stop-agents-impl", false);
pub const BACKUP_LXC: CommandSpec = spec("backup-lxc", "backup-lxc-impl", false);
pub const RESTORE_LXC: CommandSpec = spec("restore-lxc", "restore-lxc-impl", false);
pub const MIGRATE_LXC: CommandSpec = spec("migrate-lxc", "migrate-lxc-impl", false);
pub const REVERT_LXD: CommandSpec = spec("revert-lxd", "revert-lxd-impl", false);
pub const UPGRADE_AGENTS: CommandSpec = spec("upgrade-agents", "upgrade-agents-impl", true);
pub const ROLLBACK_AGENTS: CommandSpec = spec("rollback-agents", "rollback-agents-impl", false);
pub const IMPORT: CommandSpec = spec("import", "import-impl", true);
pub const ACTIVATE: CommandSpec = spec("activate", "activate-impl", true);
pub const ABORT: CommandSpec = spec("abort", "abort-impl", true);
pub const UPDATE_MAAS_AGENTNAME: CommandSpec =
    spec("update-maas-agentname", "update-maas-agentname-impl", false);

pub const COMMANDS: &[CommandSpec] = &[
    VERIFY_SOURCE,
    DUMP_SOURCE_DB,
    AGENT_STATUS,
    START_AGENTS,
    STOP_AGENTS,
    BACKUP_LXC,
    RESTORE_LXC,
    MIGRATE_LXC,
    REVERT_LXD,
    UPGRADE_AGENTS,
    ROLLBACK_AGENTS,
    IMPORT,
    ACTIVATE,
    ABORT,
    UPDATE_MAAS_AGENTNAME,
];

/// Find a command by either of its names.
pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS
        .iter()
        .find(|c| c.name == name || c.impl_name == name)
}
