//! Template moderation state machine and placeholder rendering

use chrono::Utc;
use otpgate_common::types::{AccountId, Channel, TemplateId, TemplateStatus, Verdict};
use otpgate_common::{Error, Result};
use otpgate_storage::models::{NewTemplate, Template, TemplateUpdate};
use otpgate_storage::repository::TemplateRepository;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// Comment stored when a moderator rejects without one
pub const DEFAULT_REJECT_COMMENT: &str = "Rejected by moderator";

const MAX_NAME_CHARS: usize = 100;

/// Template fields supplied by an integrator
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateSubmission {
    pub name: String,
    #[serde(default)]
    pub channel: Channel,
    pub category: Option<String>,
    pub content: String,
    pub variables: Option<Vec<String>>,
}

/// A moderator's decision
#[derive(Debug, Clone, Deserialize)]
pub struct Decision {
    pub status: Verdict,
    pub comment: Option<String>,
}

/// Status reached by applying `verdict` in state `current`
pub fn transition(current: TemplateStatus, verdict: Verdict) -> Result<TemplateStatus> {
    match current {
        TemplateStatus::Pending => Ok(verdict.into()),
        TemplateStatus::Approved | TemplateStatus::Rejected => Err(Error::InvalidTransition {
            from: current.to_string(),
            to: TemplateStatus::from(verdict).to_string(),
        }),
    }
}

/// Template moderation service
pub struct Moderation {
    templates: Arc<dyn TemplateRepository>,
    placeholder: Regex,
}

impl Moderation {
    pub fn new(templates: Arc<dyn TemplateRepository>) -> Result<Self> {
        let placeholder = Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}")
            .map_err(|e| Error::Internal(format!("invalid placeholder pattern: {}", e)))?;
        Ok(Self {
            templates,
            placeholder,
        })
    }

    /// Placeholder names in order of first appearance
    pub fn placeholders(&self, content: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.placeholder
            .captures_iter(content)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
            .filter(|name| seen.insert(name.clone()))
            .collect()
    }

    /// Check a submission and return its variable list
    fn validate(&self, submission: &TemplateSubmission) -> Result<Vec<String>> {
        let name_len = submission.name.trim().chars().count();
        if name_len == 0 || name_len > MAX_NAME_CHARS {
            return Err(Error::validation(
                "name",
                format!("name must be 1 to {} characters", MAX_NAME_CHARS),
            ));
        }
        if submission.content.trim().is_empty() {
            return Err(Error::validation("content", "content must not be empty"));
        }

        let found = self.placeholders(&submission.content);
        let Some(declared) = &submission.variables else {
            return Ok(found);
        };

        let mut unique = HashSet::new();
        if let Some(dup) = declared.iter().find(|v| !unique.insert(v.as_str())) {
            return Err(Error::validation(
                "variables",
                format!("variable '{}' is declared twice", dup),
            ));
        }
        let found_set: HashSet<&str> = found.iter().map(String::as_str).collect();
        if unique != found_set {
            return Err(Error::validation(
                "variables",
                "declared variables must match the placeholders in content",
            ));
        }
        Ok(declared.clone())
    }

    /// Store a new template awaiting review
    pub async fn submit(&self, account_id: AccountId, submission: TemplateSubmission) -> Result<Template> {
        let variables = self.validate(&submission)?;
        let template = self
            .templates
            .create(NewTemplate {
                account_id,
                name: submission.name.trim().to_string(),
                channel: submission.channel,
                category: submission.category,
                content: submission.content,
                variables,
            })
            .await?;

        info!(template_id = %template.id, %account_id, "Template submitted");
        Ok(template)
    }

    /// Replace a template's content and send it back to review
    pub async fn resubmit(
        &self,
        account_id: AccountId,
        template_id: TemplateId,
        submission: TemplateSubmission,
    ) -> Result<Template> {
        let current = self.owned(account_id, template_id).await?;
        let variables = self.validate(&submission)?;
        let from = current.status_enum()?;

        let now = Utc::now();
        let update = TemplateUpdate {
            name: submission.name.trim().to_string(),
            channel: submission.channel,
            category: submission.category,
            content: submission.content,
            variables,
            status: TemplateStatus::Pending,
            admin_comment: None,
            last_submitted_at: now,
            approved_at: None,
            updated_at: now,
        };

        let template = self
            .templates
            .update(template_id, from, update)
            .await?
            .ok_or_else(|| Error::InvalidTransition {
                from: from.to_string(),
                to: TemplateStatus::Pending.to_string(),
            })?;

        info!(%template_id, %from, "Template resubmitted");
        Ok(template)
    }

    /// Apply a moderator decision to a pending template
    pub async fn decide(&self, template_id: TemplateId, decision: Decision) -> Result<Template> {
        let current = self
            .templates
            .get(template_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("template {}", template_id)))?;
        let from = current.status_enum()?;
        let to = transition(from, decision.status)?;

        let now = Utc::now();
        let admin_comment = match to {
            TemplateStatus::Rejected => Some(
                decision
                    .comment
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .unwrap_or_else(|| DEFAULT_REJECT_COMMENT.to_string()),
            ),
            _ => None,
        };
        let approved_at = match to {
            TemplateStatus::Approved => Some(now),
            _ => None,
        };

        let channel = current.channel_enum()?;
        let update = TemplateUpdate {
            name: current.name,
            channel,
            category: current.category,
            content: current.content,
            variables: current.variables,
            status: to,
            admin_comment,
            last_submitted_at: current.last_submitted_at,
            approved_at,
            updated_at: now,
        };

        let template = self
            .templates
            .update(template_id, from, update)
            .await?
            .ok_or_else(|| Error::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            })?;

        info!(%template_id, status = %to, "Template decision recorded");
        Ok(template)
    }

    pub async fn list_for_account(&self, account_id: AccountId) -> Result<Vec<Template>> {
        self.templates.list_by_account(account_id).await
    }

    pub async fn list_for_review(&self, status: Option<TemplateStatus>) -> Result<Vec<Template>> {
        self.templates.list_by_status(status).await
    }

    /// Template the account may use for an SMS send
    pub async fn approved_for_send(&self, account_id: AccountId, template_id: TemplateId) -> Result<Template> {
        let template = self.owned(account_id, template_id).await?;
        if template.status_enum()? != TemplateStatus::Approved {
            return Err(Error::validation(
                "template_id",
                format!("template is {}, not approved", template.status),
            ));
        }
        if template.channel_enum()? != Channel::Sms {
            return Err(Error::validation(
                "template_id",
                format!("template channel is {}, not sms", template.channel),
            ));
        }
        Ok(template)
    }

    async fn owned(&self, account_id: AccountId, template_id: TemplateId) -> Result<Template> {
        self.templates
            .get(template_id)
            .await?
            .filter(|t| t.account_id == account_id)
            .ok_or_else(|| Error::NotFound(format!("template {}", template_id)))
    }

    /// Substitute `{{var}}` placeholders from `metadata`
    pub fn render(&self, content: &str, metadata: &Value) -> Result<String> {
        for name in self.placeholders(content) {
            match metadata.get(&name) {
                None | Some(Value::Null) => {
                    return Err(Error::validation(
                        format!("metadata.{}", name),
                        format!("missing value for template variable '{}'", name),
                    ))
                }
                Some(_) => {}
            }
        }

        let rendered = self.placeholder.replace_all(content, |caps: &regex::Captures| {
            match metadata.get(&caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(value) => value.to_string(),
                None => String::new(),
            }
        });
        Ok(rendered.into_owned())
    }
}
