use tracing_subscriber::EnvFilter;

/// Environment variable carrying the loggo-style logging config.
pub const LOGGING_CONFIG_ENV: &str = "JUJU_LOGGING_CONFIG";

const CRATE_TARGET: &str = "juju_upgrader";

/// Pick the filter directives for this process. `--debug` wins, then the
/// logging config from the environment, then `info`.
pub fn filter_directives(debug: bool, logging_config: Option<&str>) -> String {
    if debug {
        return "debug".to_string();
    }
    match logging_config.map(translate_loggo_config) {
        Some(directives) if !directives.is_empty() => directives,
        _ => "info".to_string(),
    }
}

pub fn build_filter(debug: bool, logging_config: Option<&str>) -> EnvFilter {
    let directives = filter_directives(debug, logging_config);
    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Translate `<root>=WARNING;upgrader=DEBUG` into `warn,juju_upgrader=debug`.
/// Entries with unknown levels are dropped.
pub fn translate_loggo_config(config: &str) -> String {
    let mut default = None;
    let mut modules = Vec::new();

    for entry in config.split([';', ',']) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (module, level) = match entry.split_once('=') {
            Some((m, l)) => (m.trim(), l.trim()),
            None => ("<root>", entry),
        };
        let Some(level) = map_level(level) else {
            continue;
        };
        match module {
            "<root>" | "" => default = Some(level),
            "upgrader" | "juju.upgrader" => modules.push(format!("{}={}", CRATE_TARGET, level)),
            other => modules.push(format!("{}={}", other.replace('.', "::"), level)),
        }
    }

    let mut directives = Vec::new();
    if let Some(level) = default {
        directives.push(level.to_string());
    }
    directives.extend(modules);
    directives.join(",")
}

fn map_level(level: &str) -> Option<&'static str> {
    match level.to_ascii_uppercase().as_str() {
        "TRACE" => Some("trace"),
        "DEBUG" => Some("debug"),
        "INFO" => Some("info"),
        "WARNING" | "WARN" => Some("warn"),
        "ERROR" | "CRITICAL" => Some("error"),
        _ => None,
    }
}
