//! Agent CLI invocation assembly.
//!
//! Every run of the agent for a given project executes from the project's
//! workspace root — never a per-milestone subdirectory — so the agent's own
//! on-disk state (and its `--resume` continuation) stays coherent across
//! milestones. The first milestone of a session is delivered as the positional
//! prompt; later milestones reach an already-running agent via stdin (see
//! [`crate::ws`]).

use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::AgentConfig;
use crate::store::models::{Milestone, OutputProject};

/// A fully assembled agent invocation.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Merged into the inherited environment, not replacing it.
    pub env: HashMap<String, String>,
}

impl AgentCommand {
    /// Build the invocation for spawning the agent on `milestone`.
    ///
    /// When the project has a persisted `agent_session_id`, the invocation
    /// carries `--resume <id>` so the agent continues its prior conversation;
    /// otherwise it starts fresh and the id is captured from its init frame.
    pub fn build(cfg: &AgentConfig, project: &OutputProject, milestone: &Milestone) -> Self {
        let mut args = vec![
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ];

        if !cfg.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(cfg.allowed_tools.join(","));
        }

        if let Some(ref agent_session_id) = project.agent_session_id {
            args.push("--resume".to_string());
            args.push(agent_session_id.clone());
        }

        // First milestone is delivered by the spawn itself, as the prompt.
        args.push(new_milestone_line(&milestone.context_file_path));

        let mut env = HashMap::new();
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        env.extend(cfg.env.clone());

        AgentCommand {
            program: cfg.binary.clone(),
            args,
            working_dir: PathBuf::from(&project.workspace_path),
            env,
        }
    }
}

/// The slash-command that directs the agent at a milestone's context file.
/// Without the trailing newline; callers that inject over stdin append it.
pub fn new_milestone_line(context_file_path: &str) -> String {
    format!("/new-milestone {context_file_path}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::ProjectStatus;
    use crate::util::now_ms;

    fn project(agent_session_id: Option<&str>) -> OutputProject {
        OutputProject {
            id: "op_A".to_string(),
            workspace_path: "/ws/A".to_string(),
            agent_session_id: agent_session_id.map(ToString::to_string),
            status: ProjectStatus::Created,
            created_at: now_ms(),
            updated_at: now_ms(),
        }
    }

    fn milestone() -> Milestone {
        Milestone {
            id: "m_1".to_string(),
            output_project_id: "op_A".to_string(),
            context_file_path: "/ws/A/.planning/m_1/CONTEXT.md".to_string(),
            created_at: now_ms(),
            dispatched_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_first_run_has_no_resume() {
        let cmd = AgentCommand::build(&AgentConfig::default(), &project(None), &milestone());
        assert_eq!(cmd.program, "claude");
        assert!(!cmd.args.iter().any(|a| a == "--resume"));
        assert_eq!(cmd.working_dir, PathBuf::from("/ws/A"));
        assert_eq!(
            cmd.args.last().map(String::as_str),
            Some("/new-milestone /ws/A/.planning/m_1/CONTEXT.md")
        );
    }

    #[test]
    fn test_subsequent_run_resumes() {
        let cmd = AgentCommand::build(&AgentConfig::default(), &project(Some("ag_42")), &milestone());
        let resume_pos = cmd.args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(cmd.args[resume_pos + 1], "ag_42");
    }

    #[test]
    fn test_stream_json_mode_and_permissions() {
        let cmd = AgentCommand::build(&AgentConfig::default(), &project(None), &milestone());
        let fmt_pos = cmd.args.iter().position(|a| a == "--output-format").unwrap();
        assert_eq!(cmd.args[fmt_pos + 1], "stream-json");
        assert!(cmd.args.iter().any(|a| a == "--dangerously-skip-permissions"));
    }

    #[test]
    fn test_allowed_tools_joined() {
        let cfg = AgentConfig {
            allowed_tools: vec!["Bash".to_string(), "Edit".to_string()],
            ..AgentConfig::default()
        };
        let cmd = AgentCommand::build(&cfg, &project(None), &milestone());
        let pos = cmd.args.iter().position(|a| a == "--allowedTools").unwrap();
        assert_eq!(cmd.args[pos + 1], "Bash,Edit");
    }

    #[test]
    fn test_tools_flag_omitted_when_empty() {
        let cmd = AgentCommand::build(&AgentConfig::default(), &project(None), &milestone());
        assert!(!cmd.args.iter().any(|a| a == "--allowedTools"));
    }

    #[test]
    fn test_term_env_set() {
        let cmd = AgentCommand::build(&AgentConfig::default(), &project(None), &milestone());
        assert_eq!(cmd.env.get("TERM").map(String::as_str), Some("xterm-256color"));
    }
}
