//! Built-in prompt templates and their renderer.
//!
//! Rendering is a pure function: template name plus variables in,
//! text out. Placeholders use `{{name}}`; unresolved placeholders
//! render as empty strings so partial context never breaks a stage.

use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("unknown prompt template: {0}")]
    UnknownTemplate(String),
}

const PLAN: &str = "\
# Task

{{task}}

# Instructions

Produce a short implementation plan for the task above. Cover the
approach, the files likely to change, and the order of work. Write
plain markdown, no code fences around the whole document.
";

const SPEC: &str = "\
# Task

{{task}}

# Plan

{{plan}}

# Instructions

Write a concise engineering spec for this change: behavior, edge
cases, and acceptance criteria. Be specific enough that an implementer
who has not seen the task can finish the work.
";

const DECOMPOSE: &str = "\
# Task

{{task}}

# Spec

{{spec}}

# Instructions

Break the work into small, independently verifiable work items.
Respond with YAML only, matching this shape:

run_id: {{run_id}}
items:
  - id: W001
    title: <short title>
    objective: <what to do>
    acceptance:
      - <criterion>
    files_hint: []
    depends_on: []

Ids are W001, W002, ... in execution order. Use depends_on only when
an item genuinely requires another item's output.
";

const IMPLEMENT: &str = "\
# Work item {{item_id}}: {{item_title}}

{{item_objective}}

# Acceptance criteria

{{item_acceptance}}

# Relevant files

{{files_hint}}

# Context

{{spec}}

# Instructions

Implement this work item by editing files in the current directory.
Make the smallest change that satisfies every acceptance criterion.
Do not create documentation or report files; only change what the
item requires.
";

const FIX: &str = "\
# Work item {{item_id}}: {{item_title}} (attempt {{attempt}})

The previous attempt did not pass verification.

# Failure evidence

{{evidence}}

# Acceptance criteria

{{item_acceptance}}

# Instructions

Read the failure evidence carefully and fix the problem before doing
anything else. Edit files in the current directory.
";

const REVIEW: &str = "\
# Task

{{task}}

# Diff under review

{{patch_diff}}

# Instructions

Review the change for correctness and completeness against the task.
End your review with a single line:

verdict: approved

or

verdict: changes_requested
";

const PR_BODY: &str = "\
# Task

{{task}}

# Diff

{{patch_diff}}

# Instructions

Write a pull request description for this change: a one-paragraph
summary, a bullet list of changes, and a test notes section.
";

const KNOWLEDGE_UPDATE: &str = "\
# Completed task

{{task}}

# What was changed

{{implementation_report}}

# Instructions

Update the repository knowledge files ({{allowlist}}) with durable
lessons from this run. Only edit content between the drover markers.
Keep edits small and factual; do not restate the task.
";

/// Render a built-in template with the given variables.
pub fn render(template: &str, vars: &BTreeMap<String, String>) -> Result<String, PromptError> {
    let body = match template {
        "plan" => PLAN,
        "spec" => SPEC,
        "decompose" => DECOMPOSE,
        "implement" | "implement_direct" => IMPLEMENT,
        "fix" => FIX,
        "review" => REVIEW,
        "pr_body" | "ship" => PR_BODY,
        "knowledge_update" => KNOWLEDGE_UPDATE,
        other => return Err(PromptError::UnknownTemplate(other.to_string())),
    };
    Ok(substitute(body, vars))
}

/// Replace `{{key}}` placeholders; unknown keys become empty.
fn substitute(body: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        if let Some(end) = after.find("}}") {
            let key = after[..end].trim();
            if let Some(value) = vars.get(key) {
                out.push_str(value);
            }
            rest = &after[end + 2..];
        } else {
            out.push_str(&rest[start..]);
            rest = "";
        }
    }
    out.push_str(rest);
    out
}

pub fn known_templates() -> &'static [&'static str] {
    &[
        "plan",
        "spec",
        "decompose",
        "implement",
        "fix",
        "review",
        "pr_body",
        "knowledge_update",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn render_substitutes_variables() {
        let out = render("plan", &vars(&[("task", "add a function")])).unwrap();
        assert!(out.contains("add a function"));
        assert!(!out.contains("{{task}}"));
    }

    #[test]
    fn unresolved_placeholders_render_empty() {
        let out = render("spec", &vars(&[("task", "t")])).unwrap();
        assert!(!out.contains("{{plan}}"));
    }

    #[test]
    fn unknown_template_is_an_error() {
        assert!(matches!(
            render("nonsense", &BTreeMap::new()),
            Err(PromptError::UnknownTemplate(_))
        ));
    }

    #[test]
    fn rendering_is_deterministic() {
        let v = vars(&[("task", "t"), ("plan", "p")]);
        assert_eq!(render("spec", &v).unwrap(), render("spec", &v).unwrap());
    }

    #[test]
    fn implement_direct_aliases_implement() {
        let v = vars(&[("item_id", "W001")]);
        assert_eq!(
            render("implement", &v).unwrap(),
            render("implement_direct", &v).unwrap()
        );
    }

    #[test]
    fn substitute_handles_unterminated_braces() {
        let out = substitute("hello {{name", &BTreeMap::new());
        assert_eq!(out, "hello {{name");
    }

    #[test]
    fn all_known_templates_render() {
        for name in known_templates() {
            render(name, &BTreeMap::new()).unwrap();
        }
    }
}
