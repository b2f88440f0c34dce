//! A single `Config` value assembled once at startup from CLI flags and
//! environment overrides, then threaded through construction — nothing
//! downstream re-reads `std::env` at point of use.

use std::path::PathBuf;

use crate::cli::Cli;

#[derive(Debug, Clone)]
pub struct Config {
    pub task_description: String,
    pub port: u16,
    pub max_iterations: u32,
    pub cooldown_ms: u64,
    pub failure_threshold: u32,
    pub tool_history_capacity: usize,
    pub supervisor_timeout_print_ms: u64,
    pub supervisor_timeout_interactive_ms: u64,
    pub mock_supervisor: bool,
    pub interactive_supervisor: bool,
    pub verbose: bool,
    pub agent_bin: String,
    pub agent_print_flag: String,
    pub agent_bypass_flag: String,
    pub worker_cwd: Option<PathBuf>,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Self {
        let agent_bin = cli
            .agent_bin
            .or_else(|| std::env::var("AGENT_BIN").ok())
            .unwrap_or_else(|| "agent".to_string());

        Self {
            task_description: cli.task,
            port: cli.port,
            max_iterations: cli.max_iterations,
            cooldown_ms: cli.cooldown_ms,
            failure_threshold: cli.failure_threshold,
            tool_history_capacity: 50,
            supervisor_timeout_print_ms: 30_000,
            supervisor_timeout_interactive_ms: 60_000,
            mock_supervisor: cli.mock_supervisor,
            interactive_supervisor: cli.interactive_supervisor,
            verbose: cli.verbose,
            agent_bin,
            agent_print_flag: cli.agent_print_flag,
            agent_bypass_flag: cli.agent_bypass_flag,
            worker_cwd: cli.worker_cwd,
        }
    }
}
