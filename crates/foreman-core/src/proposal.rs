//! Proposals — the single entry point for new work.
//!
//! A proposal is an intent to do work, gated by policy before it may become
//! a mission. It is created by any proposer, transitioned only by the
//! proposal service, and never mutated by workers.

use crate::error::{ForemanError, Result};
use crate::types::ProposalStatus;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Proposal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Uuid,
    pub agent_id: String,
    pub kind: String,
    pub title: String,
    pub body: Option<String>,
    pub status: ProposalStatus,
    /// Immutable copy of the whole policy table at creation time, for audit.
    pub policy_snapshot: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    /// Set exactly when status leaves `pending`.
    pub decided_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// ProposalDraft
// ---------------------------------------------------------------------------

/// Validated input to `submit_proposal`. Construction is the validation
/// boundary: malformed input is rejected before anything is persisted.
#[derive(Debug, Clone)]
pub struct ProposalDraft {
    pub agent_id: String,
    pub kind: String,
    pub title: String,
    pub body: Option<String>,
}

impl ProposalDraft {
    pub fn new(
        agent_id: impl Into<String>,
        kind: impl Into<String>,
        title: impl Into<String>,
        body: Option<String>,
    ) -> Result<Self> {
        let agent_id = agent_id.into();
        let kind = kind.into();
        let title = title.into();

        if agent_id.trim().is_empty() {
            return Err(ForemanError::Validation("agent_id is required".into()));
        }
        if title.trim().is_empty() {
            return Err(ForemanError::Validation("title is required".into()));
        }
        validate_kind(&kind)?;

        Ok(Self {
            agent_id,
            kind,
            title,
            body: body.filter(|b| !b.trim().is_empty()),
        })
    }
}

fn kind_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("static regex"))
}

/// Kinds name worker pools and policy keys, so they are slug-constrained.
pub fn validate_kind(kind: &str) -> Result<()> {
    if kind_regex().is_match(kind) {
        Ok(())
    } else {
        Err(ForemanError::InvalidKind(kind.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Step templates
// ---------------------------------------------------------------------------

/// One step to materialize when a proposal of a given kind is approved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub kind: String,
    pub title: String,
}

impl StepTemplate {
    pub fn new(kind: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            title: title.into(),
        }
    }
}

/// Proposal kind → ordered step list. The registry is a collaborator seam:
/// the engine only sequences creation, it never interprets the steps.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, Vec<StepTemplate>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The original system's built-in templates.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("analysis", vec![StepTemplate::new("analyze", "Run analysis")]);
        registry.register(
            "content",
            vec![
                StepTemplate::new("analyze", "Research topic"),
                StepTemplate::new("generate", "Generate content"),
                StepTemplate::new("review", "Review content"),
            ],
        );
        registry.register("research", vec![StepTemplate::new("analyze", "Deep research")]);
        registry.register(
            "deploy",
            vec![
                StepTemplate::new("analyze", "Pre-deploy checks"),
                StepTemplate::new("review", "Deploy review"),
                StepTemplate::new("publish", "Execute deploy"),
            ],
        );
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, steps: Vec<StepTemplate>) {
        self.templates.insert(kind.into(), steps);
    }

    /// Steps for a proposal kind. Unknown kinds fall back to a single
    /// `analyze` step titled after the proposal.
    pub fn steps_for(&self, kind: &str, proposal_title: &str) -> Vec<StepTemplate> {
        match self.templates.get(kind) {
            Some(steps) => steps.clone(),
            None => vec![StepTemplate::new("analyze", proposal_title)],
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_requires_agent_and_title() {
        assert!(ProposalDraft::new("", "analysis", "x", None).is_err());
        assert!(ProposalDraft::new("pm", "analysis", "", None).is_err());
        assert!(ProposalDraft::new("pm", "analysis", "   ", None).is_err());
        assert!(ProposalDraft::new("pm", "analysis", "ok", None).is_ok());
    }

    #[test]
    fn draft_rejects_bad_kind() {
        assert!(ProposalDraft::new("pm", "", "x", None).is_err());
        assert!(ProposalDraft::new("pm", "Analysis", "x", None).is_err());
        assert!(ProposalDraft::new("pm", "bad kind", "x", None).is_err());
        assert!(ProposalDraft::new("pm", "step_kind2", "x", None).is_ok());
    }

    #[test]
    fn empty_body_is_dropped() {
        let draft = ProposalDraft::new("pm", "analysis", "x", Some("  ".into())).unwrap();
        assert!(draft.body.is_none());
        let draft = ProposalDraft::new("pm", "analysis", "x", Some("details".into())).unwrap();
        assert_eq!(draft.body.as_deref(), Some("details"));
    }

    #[test]
    fn builtin_templates_match_original() {
        let registry = TemplateRegistry::builtin();
        assert_eq!(registry.steps_for("analysis", "t").len(), 1);
        let content: Vec<String> = registry
            .steps_for("content", "t")
            .into_iter()
            .map(|s| s.kind)
            .collect();
        assert_eq!(content, vec!["analyze", "generate", "review"]);
        assert_eq!(registry.steps_for("deploy", "t").len(), 3);
    }

    #[test]
    fn unknown_kind_falls_back_to_single_analyze() {
        let registry = TemplateRegistry::builtin();
        let steps = registry.steps_for("novel_kind", "Check competitor X");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].kind, "analyze");
        assert_eq!(steps[0].title, "Check competitor X");
    }
}
