//! Command-line surface (§6.3): positional task description plus the
//! documented flags, and a handful of generic discovery overrides so the
//! agent binary's path never has to be hardcoded into source.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "loopwright",
    about = "Runs a coding agent CLI inside a PTY under an AI supervisor loop"
)]
pub struct Cli {
    /// The task description handed to the worker on startup.
    pub task: String,

    /// HTTP port for hooks ingress, REST, and the WebSocket broadcast.
    /// Bound to localhost only.
    #[arg(long, default_value_t = 3000)]
    pub port: u16,

    /// Supervisor iteration budget.
    #[arg(long = "max-iterations", default_value_t = 50)]
    pub max_iterations: u32,

    /// Use a mock Dispatcher that always returns `continue`, for exercising
    /// the rest of the loop without spawning a second agent process.
    #[arg(long = "mock-supervisor")]
    pub mock_supervisor: bool,

    /// Emit analysis/diagnostic log lines (raises the default filter from
    /// `info` to `debug`).
    #[arg(short, long)]
    pub verbose: bool,

    /// Path/name of the agent CLI binary. Falls back to `$AGENT_BIN`, then
    /// the generic name `"agent"`.
    #[arg(long = "agent-bin")]
    pub agent_bin: Option<String>,

    /// Flag that puts the agent binary into one-shot print mode.
    #[arg(long = "agent-print-flag", default_value = "--print")]
    pub agent_print_flag: String,

    /// Flag that bypasses the agent's interactive permission prompts for
    /// supervisor turns.
    #[arg(long = "agent-bypass-flag", default_value = "--dangerously-bypass-approvals")]
    pub agent_bypass_flag: String,

    /// Use the long-lived interactive-PTY supervisor strategy instead of
    /// one-shot print mode.
    #[arg(long = "interactive-supervisor")]
    pub interactive_supervisor: bool,

    /// Minimum gap between supervisor turns, in milliseconds.
    #[arg(long = "cooldown-ms", default_value_t = 3000)]
    pub cooldown_ms: u64,

    /// Consecutive supervisor failures before aborting.
    #[arg(long = "failure-threshold", default_value_t = 3)]
    pub failure_threshold: u32,

    /// Working directory for the worker process (default: current directory).
    #[arg(long = "worker-cwd")]
    pub worker_cwd: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cli = Cli::parse_from(["loopwright", "build feature X"]);
        assert_eq!(cli.task, "build feature X");
        assert_eq!(cli.port, 3000);
        assert_eq!(cli.max_iterations, 50);
        assert!(!cli.mock_supervisor);
        assert!(!cli.verbose);
        assert_eq!(cli.agent_print_flag, "--print");
        assert_eq!(cli.agent_bypass_flag, "--dangerously-bypass-approvals");
        assert_eq!(cli.cooldown_ms, 3000);
        assert_eq!(cli.failure_threshold, 3);
    }

    #[test]
    fn mock_supervisor_flag_parses() {
        let cli = Cli::parse_from(["loopwright", "task", "--mock-supervisor", "-v"]);
        assert!(cli.mock_supervisor);
        assert!(cli.verbose);
    }
}
