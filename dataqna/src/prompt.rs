//! Prompt rendering for the synthesis and repair collaborators.
//!
//! Templates are compiled into the binary and rendered with minijinja, so a
//! given question, schema context, and feedback always produce the same
//! prompt text.

use anyhow::{Context, Result};
use minijinja::{context, Environment};

use crate::sandbox::builtins;
use crate::session::SchemaContext;
use crate::synthesis::RepairFeedback;

const SYNTHESIZE_TEMPLATE: &str = include_str!("prompts/synthesize.md");
const REPAIR_TEMPLATE: &str = include_str!("prompts/repair.md");

/// Renders collaborator prompts from session state.
pub struct PromptBuilder {
    env: Environment<'static>,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptBuilder {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("synthesize", SYNTHESIZE_TEMPLATE)
            .expect("synthesize template should be valid");
        env.add_template("repair", REPAIR_TEMPLATE)
            .expect("repair template should be valid");
        Self { env }
    }

    pub fn synthesize_prompt(
        &self,
        question: &str,
        schema: &SchemaContext,
        binding_names: &[&str],
        allowed_modules: &[String],
    ) -> Result<String> {
        let template = self.env.get_template("synthesize")?;
        let rendered = template
            .render(context! {
                question => question.trim(),
                tables => schema.tables.trim(),
                fields => non_empty(&schema.fields),
                samples => non_empty(&schema.samples),
                modules => allowed_modules.join(", "),
                core_functions => builtins::CORE_FUNCTIONS.join(", "),
                bindings => binding_names.join(", "),
            })
            .context("render synthesize prompt")?;
        Ok(rendered)
    }

    pub fn repair_prompt(
        &self,
        question: &str,
        schema: &SchemaContext,
        source: &str,
        feedback: &RepairFeedback<'_>,
    ) -> Result<String> {
        let (violations, error, fragment) = match feedback {
            RepairFeedback::Rejected(violations) => {
                let lines: Vec<String> = violations
                    .iter()
                    .map(|v| format!("line {}, column {}: {}", v.line, v.column, v.message))
                    .collect();
                (Some(lines), None, None)
            }
            RepairFeedback::Failed(detail) => (
                None,
                Some(detail.message.clone()),
                detail.fragment.clone(),
            ),
        };
        let template = self.env.get_template("repair")?;
        let rendered = template
            .render(context! {
                question => question.trim(),
                source => source.trim_end(),
                violations => violations,
                error => error,
                fragment => fragment,
                tables => schema.tables.trim(),
                fields => non_empty(&schema.fields),
                samples => non_empty(&schema.samples),
            })
            .context("render repair prompt")?;
        Ok(rendered)
    }
}

fn non_empty(block: &str) -> Option<&str> {
    let trimmed = block.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{ErrorDetail, FaultKind};
    use crate::validate::{Violation, ViolationKind};

    fn schema() -> SchemaContext {
        SchemaContext {
            tables: "people: list of person records".to_string(),
            fields: "people.age: int\npeople.name: string".to_string(),
            samples: String::new(),
        }
    }

    #[test]
    fn synthesize_prompt_includes_question_and_bindings() {
        let builder = PromptBuilder::new();
        let prompt = builder
            .synthesize_prompt(
                "How many adults are there?",
                &schema(),
                &["people"],
                &["stats".to_string()],
            )
            .expect("render");
        assert!(prompt.contains("How many adults are there?"));
        assert!(prompt.contains("people"));
        assert!(prompt.contains("stats"));
        assert!(prompt.contains("filter"));
    }

    #[test]
    fn synthesize_prompt_omits_empty_blocks() {
        let builder = PromptBuilder::new();
        let prompt = builder
            .synthesize_prompt(
                "q",
                &SchemaContext {
                    tables: "people".to_string(),
                    ..SchemaContext::default()
                },
                &["people"],
                &[],
            )
            .expect("render");
        assert!(!prompt.contains("Similar worked examples"));
        assert!(!prompt.contains("Matched fields"));
    }

    #[test]
    fn repair_prompt_lists_violations() {
        let builder = PromptBuilder::new();
        let violations = vec![Violation {
            kind: ViolationKind::ForbiddenConstruct,
            line: 2,
            column: 14,
            message: "call to 'open' (filesystem access) is not permitted".to_string(),
        }];
        let prompt = builder
            .repair_prompt(
                "q",
                &schema(),
                "let result = open(\"x\");",
                &RepairFeedback::Rejected(&violations),
            )
            .expect("render");
        assert!(prompt.contains("line 2, column 14"));
        assert!(prompt.contains("rejected before execution"));
    }

    #[test]
    fn repair_prompt_carries_the_runtime_error() {
        let builder = PromptBuilder::new();
        let detail = ErrorDetail {
            kind: FaultKind::DivideByZero,
            message: "division by zero in '/'".to_string(),
            fragment: Some("line 1: 10 / 0".to_string()),
        };
        let prompt = builder
            .repair_prompt(
                "q",
                &schema(),
                "let result = 10 / 0;",
                &RepairFeedback::Failed(&detail),
            )
            .expect("render");
        assert!(prompt.contains("division by zero"));
        assert!(prompt.contains("line 1: 10 / 0"));
    }
}
