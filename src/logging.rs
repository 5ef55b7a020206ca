//! Logging configuration driven by the `K8PSH_DEBUG` environment
//! variable.
//!
//! `K8PSH_DEBUG` holds a comma-separated list of module names (or `all`,
//! case-insensitive) for which debug logging is enabled. Everything else
//! logs at warning level and above, to standard error.

use tracing_subscriber::EnvFilter;

const DEBUG_MODULES: &[&str] = &[
    "channel", "cli", "client", "config", "env", "paths", "pidfile", "protocol", "server", "shims",
];

pub fn init() {
    let filter = EnvFilter::new(debug_filter(std::env::var("K8PSH_DEBUG").ok().as_deref()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn debug_filter(spec: Option<&str>) -> String {
    let Some(spec) = spec else {
        return "warn".to_string();
    };

    let mut directives = vec!["warn".to_string()];

    for item in spec.split([',', ';']) {
        let item = item.trim();

        if item.eq_ignore_ascii_case("all") {
            return "debug".to_string();
        }

        if let Some(module) = DEBUG_MODULES.iter().find(|name| name.eq_ignore_ascii_case(item)) {
            directives.push(format!("k8psh::{module}=debug"));
        }
    }

    directives.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_warnings() {
        assert_eq!(debug_filter(None), "warn");
        assert_eq!(debug_filter(Some("")), "warn");
        assert_eq!(debug_filter(Some("unknown-module")), "warn");
    }

    #[test]
    fn all_enables_global_debug() {
        assert_eq!(debug_filter(Some("all")), "debug");
        assert_eq!(debug_filter(Some("config, ALL")), "debug");
    }

    #[test]
    fn module_lists_enable_targets() {
        assert_eq!(
            debug_filter(Some("config, server")),
            "warn,k8psh::config=debug,k8psh::server=debug"
        );
        assert_eq!(debug_filter(Some("Config")), "warn,k8psh::config=debug");
    }
}
