pub mod agents;
pub mod lxc;
pub mod maas;
pub mod model;
pub mod service;
pub mod source;

pub use agents::{agent_status, control_agents};
pub use lxc::{backup_lxc, backup_lxc_impl, restore_lxc, restore_lxc_impl, ArchiveOptions};
pub use maas::update_maas_agentname;
pub use model::{abort_model, abort_upgrade, activate_model, activate_upgrade, import_model};
pub use source::{dump_source_db, verify_source};
