use crate::output::{ellipsize, print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use foreman_core::db::Db;
use foreman_core::proposal::{ProposalDraft, TemplateRegistry};
use std::path::Path;
use uuid::Uuid;

#[derive(Subcommand)]
pub enum ProposalSubcommand {
    /// Submit a proposal through the policy gates
    Submit {
        /// Proposing agent id
        #[arg(long)]
        agent: String,
        /// Proposal kind (selects the step template)
        #[arg(long)]
        kind: String,
        #[arg(required = true)]
        title: Vec<String>,
        /// Optional body text
        #[arg(long)]
        body: Option<String>,
    },
    /// Approve a pending proposal (creates its mission)
    Approve { id: Uuid },
    /// Reject a pending proposal
    Reject {
        id: Uuid,
        #[arg(long)]
        reason: Option<String>,
    },
    /// List recent proposals
    List {
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Show one proposal
    Get { id: Uuid },
}

pub fn run(root: &Path, subcmd: ProposalSubcommand, json: bool) -> anyhow::Result<()> {
    let db = Db::open_at_root(root)?;
    let templates = TemplateRegistry::builtin();

    match subcmd {
        ProposalSubcommand::Submit {
            agent,
            kind,
            title,
            body,
        } => {
            let draft = ProposalDraft::new(agent, kind, title.join(" "), body)?;
            let submission = db
                .submit_proposal(&draft, &templates)
                .context("failed to submit proposal")?;
            if json {
                print_json(&serde_json::json!({
                    "proposal": submission.proposal,
                    "mission": submission.mission,
                    "steps": submission.steps,
                    "held_reason": submission.held_reason,
                }))?;
            } else {
                println!(
                    "Proposal {} — {}",
                    submission.proposal.id, submission.proposal.status
                );
                if let Some(reason) = &submission.held_reason {
                    println!("Held: {reason}");
                }
                if let Some(mission) = &submission.mission {
                    println!(
                        "Mission {} created with {} step(s).",
                        mission.id,
                        submission.steps.len()
                    );
                }
            }
        }
        ProposalSubcommand::Approve { id } => {
            let (proposal, mission, steps) = db.approve_proposal(id, &templates)?;
            if json {
                print_json(&serde_json::json!({
                    "proposal": proposal,
                    "mission": mission,
                    "steps": steps,
                }))?;
            } else {
                println!(
                    "Approved {} — mission {} with {} step(s).",
                    proposal.id,
                    mission.id,
                    steps.len()
                );
            }
        }
        ProposalSubcommand::Reject { id, reason } => {
            let proposal = db.reject_proposal(id, reason.as_deref())?;
            if json {
                print_json(&proposal)?;
            } else {
                println!("Rejected {}.", proposal.id);
            }
        }
        ProposalSubcommand::List { limit } => {
            let proposals = db.list_proposals(limit)?;
            if json {
                print_json(&proposals)?;
            } else {
                let rows = proposals
                    .iter()
                    .map(|p| {
                        vec![
                            p.id.to_string(),
                            p.agent_id.clone(),
                            p.kind.clone(),
                            p.status.to_string(),
                            ellipsize(&p.title, 40),
                            p.created_at.format("%Y-%m-%d %H:%M").to_string(),
                        ]
                    })
                    .collect();
                print_table(&["ID", "AGENT", "KIND", "STATUS", "TITLE", "CREATED"], rows);
            }
        }
        ProposalSubcommand::Get { id } => {
            let proposal = db
                .get_proposal(id)?
                .with_context(|| format!("proposal '{id}' not found"))?;
            print_json(&proposal)?;
        }
    }
    Ok(())
}
