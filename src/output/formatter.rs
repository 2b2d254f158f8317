use colored::Colorize;

use crate::commands::service::AgentStatus;
use crate::state::source::machine_sort_key;

/// Print a success message.
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg.green());
}

/// Print an error message to stderr.
pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red().bold(), msg.red());
}

pub fn print_warning(msg: &str) {
    eprintln!("{} {}", "!".yellow().bold(), msg.yellow());
}

/// Print the per-agent status table, sorted by machine then agent.
pub fn print_agent_status(statuses: &[AgentStatus]) {
    if statuses.is_empty() {
        println!("{}", "No agents found.".dimmed());
        return;
    }

    let mut rows: Vec<&AgentStatus> = statuses.iter().collect();
    rows.sort_by(|a, b| {
        machine_sort_key(&a.machine)
            .cmp(&machine_sort_key(&b.machine))
            .then_with(|| a.agent.cmp(&b.agent))
    });

    let machine_w = column_width("MACHINE", rows.iter().map(|r| r.machine.as_str()));
    let agent_w = column_width("AGENT", rows.iter().map(|r| r.agent.as_str()));
    let status_w = column_width("STATUS", rows.iter().map(|r| r.status.as_str()));

    println!(
        "{:<mw$}  {:<aw$}  {:<sw$}  {}",
        "MACHINE".bold(),
        "AGENT".bold(),
        "STATUS".bold(),
        "VERSION".bold(),
        mw = machine_w,
        aw = agent_w,
        sw = status_w,
    );

    for row in rows {
        let padded = format!("{:<sw$}", row.status, sw = status_w);
        let status = if row.status.starts_with("start") || row.status.starts_with("active") {
            padded.green().to_string()
        } else if row.status == "unknown" {
            padded.yellow().to_string()
        } else {
            padded.red().to_string()
        };
        println!(
            "{:<mw$}  {:<aw$}  {}  {}",
            row.machine,
            row.agent,
            status,
            row.version.dimmed(),
            mw = machine_w,
            aw = agent_w,
        );
    }
}

fn column_width<'a>(header: &str, values: impl Iterator<Item = &'a str>) -> usize {
    values.map(|v| v.len()).max().unwrap_or(0).max(header.len())
}
