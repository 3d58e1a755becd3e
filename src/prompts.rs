//! Layered prompt compiler for worker and audit runs.
//!
//! Three template sources per prompt, most specific wins:
//! 1. built-in defaults compiled into the binary,
//! 2. installation override under `<config_dir>/overseer/templates/`,
//! 3. workspace override under `<workspace>/.overseer/templates/`.
//!
//! Placeholders (`{{identifier}}`, `{{title}}`, `{{body}}`, `{{branch}}`,
//! `{{workspace}}`, `{{criteria}}`, `{{worker_output}}`) are substituted into
//! the winning template. The compiler is an explicitly constructed object so
//! tests can point it at their own directories; there is no module-level
//! template cache.

use crate::state::types::Dispatch;
use crate::tracker::IssueContext;
use std::path::{Path, PathBuf};
use tracing::debug;

const DEFAULT_WORKER_TEMPLATE: &str = r#"You are implementing issue {{identifier}}: {{title}}

## ISSUE
{{body}}

## ACCEPTANCE CRITERIA
{{criteria}}

## WORKSPACE
Repository checkout: {{workspace}}
Branch: {{branch}}

## RULES
1. Implement exactly what the issue asks for; check existing code first.
2. Run the project's tests and checks before you consider the work done.
3. Commit your changes on the branch above.
4. Do not mark anything complete that you have not verified.
"#;

const DEFAULT_AUDIT_TEMPLATE: &str = r#"You are auditing the implementation of issue {{identifier}}: {{title}}

## ISSUE
{{body}}

## ACCEPTANCE CRITERIA
{{criteria}}

## WORKSPACE
Repository checkout: {{workspace}}
Branch: {{branch}}

## IMPLEMENTER'S REPORT
{{worker_output}}

## YOUR TASK
Independently verify the implementation against each acceptance criterion.
Run the tests yourself; do not trust the report. When finished, output your
verdict as a single JSON object on its own line:

{"pass": true|false, "criteria": ["satisfied criterion", ...], "gaps": ["unmet requirement", ...], "testResults": "summary of test runs"}

Output the verdict JSON exactly once, as the last thing you write.
"#;

/// Prompt template names, doubling as override file stems.
const WORKER_TEMPLATE: &str = "worker";
const AUDIT_TEMPLATE: &str = "audit";

pub struct PromptCompiler {
    /// Installation-level template directory; `None` disables that layer.
    install_dir: Option<PathBuf>,
}

impl PromptCompiler {
    /// Compiler with the installation layer under the per-user config
    /// directory.
    pub fn new() -> Self {
        Self {
            install_dir: dirs::config_dir().map(|d| d.join("overseer").join("templates")),
        }
    }

    /// Compiler with an explicit installation template directory.
    pub fn with_install_dir(install_dir: PathBuf) -> Self {
        Self {
            install_dir: Some(install_dir),
        }
    }

    /// Build the task text for a worker run. When this is a rework attempt
    /// and the failing audit left gaps, an addendum lists them.
    pub fn worker_prompt(
        &self,
        dispatch: &Dispatch,
        issue: &IssueContext,
        rework_gaps: &[String],
    ) -> String {
        let template = self.load_template(WORKER_TEMPLATE, &dispatch.workspace);
        let mut prompt = self.substitute(&template, dispatch, issue, "");

        if dispatch.attempt > 0 && !rework_gaps.is_empty() {
            prompt.push_str("\n## PREVIOUS AUDIT FAILED\n");
            prompt.push_str(&format!(
                "This is rework attempt {}. A previous audit of your implementation failed. Address these gaps:\n",
                dispatch.attempt
            ));
            for gap in rework_gaps {
                prompt.push_str(&format!("- {}\n", gap));
            }
        }
        prompt
    }

    /// Build the task text for an audit run.
    pub fn audit_prompt(
        &self,
        dispatch: &Dispatch,
        issue: &IssueContext,
        worker_output: &str,
    ) -> String {
        let template = self.load_template(AUDIT_TEMPLATE, &dispatch.workspace);
        self.substitute(&template, dispatch, issue, worker_output)
    }

    /// Resolve the template layers for `name`: workspace override, then
    /// installation override, then the built-in default.
    fn load_template(&self, name: &str, workspace: &str) -> String {
        let workspace_override = Path::new(workspace)
            .join(".overseer")
            .join("templates")
            .join(format!("{}.md", name));
        if let Ok(content) = std::fs::read_to_string(&workspace_override) {
            debug!(template = name, path = %workspace_override.display(), "Using workspace template override");
            return content;
        }

        if let Some(dir) = &self.install_dir {
            let install_override = dir.join(format!("{}.md", name));
            if let Ok(content) = std::fs::read_to_string(&install_override) {
                debug!(template = name, path = %install_override.display(), "Using installation template override");
                return content;
            }
        }

        match name {
            AUDIT_TEMPLATE => DEFAULT_AUDIT_TEMPLATE.to_string(),
            _ => DEFAULT_WORKER_TEMPLATE.to_string(),
        }
    }

    fn substitute(
        &self,
        template: &str,
        dispatch: &Dispatch,
        issue: &IssueContext,
        worker_output: &str,
    ) -> String {
        let criteria = if issue.acceptance_criteria.is_empty() {
            "(none listed)".to_string()
        } else {
            issue
                .acceptance_criteria
                .iter()
                .map(|c| format!("- {}", c))
                .collect::<Vec<_>>()
                .join("\n")
        };

        template
            .replace("{{identifier}}", &issue.identifier)
            .replace("{{title}}", &issue.title)
            .replace("{{body}}", &issue.body)
            .replace("{{branch}}", &dispatch.branch)
            .replace("{{workspace}}", &dispatch.workspace)
            .replace("{{criteria}}", &criteria)
            .replace("{{worker_output}}", worker_output)
    }
}

impl Default for PromptCompiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fixture(workspace: &str) -> (Dispatch, IssueContext) {
        let dispatch = Dispatch::new("1", "ENG-42", "Fix login timeout", workspace, "fix/login");
        let issue = IssueContext {
            id: "1".into(),
            identifier: "ENG-42".into(),
            title: "Fix login timeout".into(),
            body: "Sessions expire too early.".into(),
            acceptance_criteria: vec!["sessions last 24h".into(), "tests cover expiry".into()],
        };
        (dispatch, issue)
    }

    fn compiler_without_install_layer() -> PromptCompiler {
        // Point the install layer at a directory that has no overrides.
        PromptCompiler::with_install_dir(PathBuf::from("/nonexistent/overseer/templates"))
    }

    #[test]
    fn test_worker_prompt_substitutes_placeholders() {
        let (dispatch, issue) = fixture("/ws/repo");
        let prompt = compiler_without_install_layer().worker_prompt(&dispatch, &issue, &[]);

        assert!(prompt.contains("ENG-42"));
        assert!(prompt.contains("Fix login timeout"));
        assert!(prompt.contains("Sessions expire too early."));
        assert!(prompt.contains("- sessions last 24h"));
        assert!(prompt.contains("Branch: fix/login"));
        assert!(prompt.contains("/ws/repo"));
        assert!(!prompt.contains("{{"), "all placeholders must be substituted");
    }

    #[test]
    fn test_worker_prompt_first_attempt_has_no_rework_section() {
        let (dispatch, issue) = fixture("/ws/repo");
        let prompt = compiler_without_install_layer().worker_prompt(
            &dispatch,
            &issue,
            &["missing tests".to_string()],
        );
        // attempt == 0: gaps are ignored even if supplied.
        assert!(!prompt.contains("PREVIOUS AUDIT FAILED"));
    }

    #[test]
    fn test_worker_prompt_rework_lists_gaps() {
        let (mut dispatch, issue) = fixture("/ws/repo");
        dispatch.attempt = 1;
        let prompt = compiler_without_install_layer().worker_prompt(
            &dispatch,
            &issue,
            &["missing tests".to_string(), "error path unhandled".to_string()],
        );
        assert!(prompt.contains("PREVIOUS AUDIT FAILED"));
        assert!(prompt.contains("rework attempt 1"));
        assert!(prompt.contains("- missing tests"));
        assert!(prompt.contains("- error path unhandled"));
    }

    #[test]
    fn test_audit_prompt_includes_worker_output_and_verdict_shape() {
        let (dispatch, issue) = fixture("/ws/repo");
        let prompt = compiler_without_install_layer().audit_prompt(
            &dispatch,
            &issue,
            "Implemented session refresh in auth.rs",
        );
        assert!(prompt.contains("Implemented session refresh in auth.rs"));
        assert!(prompt.contains("\"pass\""));
        assert!(prompt.contains("\"testResults\""));
    }

    #[test]
    fn test_empty_criteria_renders_placeholder_line() {
        let (dispatch, mut issue) = fixture("/ws/repo");
        issue.acceptance_criteria.clear();
        let prompt = compiler_without_install_layer().worker_prompt(&dispatch, &issue, &[]);
        assert!(prompt.contains("(none listed)"));
    }

    #[test]
    fn test_workspace_override_beats_install_override() {
        let ws = tempdir().unwrap();
        let install = tempdir().unwrap();

        let ws_templates = ws.path().join(".overseer/templates");
        std::fs::create_dir_all(&ws_templates).unwrap();
        std::fs::write(ws_templates.join("worker.md"), "WS TEMPLATE {{identifier}}").unwrap();
        std::fs::write(install.path().join("worker.md"), "INSTALL TEMPLATE").unwrap();

        let (dispatch, issue) = fixture(ws.path().to_str().unwrap());
        let compiler = PromptCompiler::with_install_dir(install.path().to_path_buf());
        let prompt = compiler.worker_prompt(&dispatch, &issue, &[]);
        assert_eq!(prompt, "WS TEMPLATE ENG-42");
    }

    #[test]
    fn test_install_override_beats_default() {
        let ws = tempdir().unwrap();
        let install = tempdir().unwrap();
        std::fs::write(install.path().join("audit.md"), "INSTALL AUDIT {{title}}").unwrap();

        let (dispatch, issue) = fixture(ws.path().to_str().unwrap());
        let compiler = PromptCompiler::with_install_dir(install.path().to_path_buf());
        let prompt = compiler.audit_prompt(&dispatch, &issue, "output");
        assert_eq!(prompt, "INSTALL AUDIT Fix login timeout");
    }
}
