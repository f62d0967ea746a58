//! CLI surface, via `clap`'s derive API.

use clap::Parser;

/// Transparent debugging proxy for multi-agent systems speaking A2A over HTTP.
#[derive(Debug, Parser)]
#[command(name = "trace", version, about, author)]
pub struct Cli {
    /// Proxy listen port.
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    /// Control-surface (UI) listen port. Defaults to `--port`.
    #[arg(long)]
    pub ui_port: Option<u16>,

    /// Path to a SQLite file for persistence. Empty (the default) uses an
    /// in-memory store that is discarded when the tool exits.
    #[arg(long, default_value = "")]
    pub db: String,

    /// Enable verbose (debug-level) logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Disable serving the control surface entirely.
    #[arg(long)]
    pub no_ui: bool,

    /// The wrapped command and its arguments, separated from the tool's own
    /// flags with `--`.
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

impl Cli {
    pub fn ui_port(&self) -> u16 {
        self.ui_port.unwrap_or(self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ui_port_defaults_to_proxy_port() {
        let cli = Cli::parse_from(["trace", "-p", "9000", "--", "echo", "hi"]);
        assert_eq!(cli.ui_port(), 9000);
    }

    #[test]
    fn ui_port_can_be_overridden() {
        let cli = Cli::parse_from(["trace", "-p", "9000", "--ui-port", "9100", "--", "echo"]);
        assert_eq!(cli.ui_port(), 9100);
    }

    #[test]
    fn command_is_required() {
        let result = Cli::try_parse_from(["trace", "-p", "9000"]);
        assert!(result.is_err());
    }
}
