//! Formatted output helpers for CLI commands.
//!
//! Tables go to stdout so they can be piped; status lines go to stderr.

use capsule_common::types::{ContainerInfo, ContainerState};
use capsule_network::Network;

const BOLD: &str = "\x1b[1m";
const GREEN: &str = "\x1b[32m";
const RESET: &str = "\x1b[0m";

/// Column header of `capsule ps`.
pub const CONTAINER_HEADER: &str = "ID          NAME            PID         STATUS     COMMAND              CREATED";

/// Column header of `capsule network list`.
pub const NETWORK_HEADER: &str = "NAME            IP RANGE            DRIVER";

/// Shortens `text` to `width` characters, marking the cut with `...`.
#[must_use]
pub fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let kept: String = text.chars().take(width.saturating_sub(3)).collect();
    format!("{kept}...")
}

/// One line of `capsule ps`; the pid column is blank unless running.
#[must_use]
pub fn container_row(info: &ContainerInfo) -> String {
    let pid = match info.status {
        ContainerState::Running => info.pid.as_str(),
        ContainerState::Stopped | ContainerState::Exited => "",
    };
    format!(
        "{:<11} {:<15} {:<11} {:<10} {:<20} {}",
        info.id.as_str(),
        truncate(&info.name, 15),
        pid,
        info.status.to_string(),
        truncate(&info.command, 20),
        info.created_time,
    )
}

/// One line of `capsule network list`.
#[must_use]
pub fn network_row(network: &Network) -> String {
    format!(
        "{:<15} {:<19} {}",
        network.name,
        network.ip_range.to_string(),
        network.driver
    )
}

/// Prints `verb name` to stderr, highlighted.
#[allow(clippy::print_stderr)]
pub fn status_line(verb: &str, name: &str) {
    eprintln!("{GREEN}{verb}{RESET} {BOLD}{name}{RESET}");
}

#[cfg(test)]
mod tests {
    use capsule_common::types::ContainerId;

    use super::*;

    fn record(status: ContainerState) -> ContainerInfo {
        ContainerInfo {
            id: ContainerId::new("4829104736"),
            pid: "4242".into(),
            name: "web".into(),
            command: "top".into(),
            created_time: "2026-10-19 12:00:00".into(),
            status,
            volume: String::new(),
            port_mapping: Vec::new(),
            network: None,
            ip: None,
        }
    }

    #[test]
    fn truncate_keeps_short_text() {
        assert_eq!(truncate("top", 20), "top");
    }

    #[test]
    fn truncate_marks_cut() {
        assert_eq!(truncate("sleep 1000000", 8), "sleep...");
        assert_eq!(truncate("sleep 1000000", 8).chars().count(), 8);
    }

    #[test]
    fn running_row_shows_pid() {
        let row = container_row(&record(ContainerState::Running));
        assert!(row.starts_with("4829104736  web"));
        assert!(row.contains("4242"));
        assert!(row.contains("running"));
        assert!(row.ends_with("2026-10-19 12:00:00"));
    }

    #[test]
    fn stopped_row_blanks_pid() {
        let row = container_row(&record(ContainerState::Stopped));
        assert!(!row.contains("4242"));
        assert!(row.contains("stopped"));
    }

    #[test]
    fn network_row_lists_range_and_driver() {
        let network = Network {
            name: "br0".into(),
            ip_range: "10.0.0.1/24".parse().expect("cidr"),
            driver: "bridge".into(),
        };
        let row = network_row(&network);
        assert!(row.starts_with("br0"));
        assert!(row.contains("10.0.0.1/24"));
        assert!(row.ends_with("bridge"));
    }
}
