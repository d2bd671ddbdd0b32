//! Common types for OtpGate

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for accounts
pub type AccountId = Uuid;

/// Unique identifier for API keys
pub type ApiKeyId = Uuid;

/// Unique identifier for templates
pub type TemplateId = Uuid;

/// Unique identifier for messages
pub type MessageId = Uuid;

/// SMS payload encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    #[serde(rename = "GSM7")]
    Gsm7,
    #[serde(rename = "UCS2")]
    Ucs2,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Gsm7 => "GSM7",
            Encoding::Ucs2 => "UCS2",
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Encoding {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GSM7" => Ok(Encoding::Gsm7),
            "UCS2" => Ok(Encoding::Ucs2),
            other => Err(crate::Error::Internal(format!("unknown encoding '{}'", other))),
        }
    }
}

/// Delivery status of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageStatus {
    Pending,
    Delivrd,
    Undeliv,
    Expired,
    Rejected,
    Failed,
}

impl MessageStatus {
    /// Whether this status is final
    pub fn is_terminal(&self) -> bool {
        match self {
            MessageStatus::Pending => false,
            MessageStatus::Delivrd
            | MessageStatus::Undeliv
            | MessageStatus::Expired
            | MessageStatus::Rejected
            | MessageStatus::Failed => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "PENDING",
            MessageStatus::Delivrd => "DELIVRD",
            MessageStatus::Undeliv => "UNDELIV",
            MessageStatus::Expired => "EXPIRED",
            MessageStatus::Rejected => "REJECTED",
            MessageStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(MessageStatus::Pending),
            "DELIVRD" => Ok(MessageStatus::Delivrd),
            "UNDELIV" => Ok(MessageStatus::Undeliv),
            "EXPIRED" => Ok(MessageStatus::Expired),
            "REJECTED" => Ok(MessageStatus::Rejected),
            "FAILED" => Ok(MessageStatus::Failed),
            other => Err(crate::Error::Internal(format!(
                "unknown message status '{}'",
                other
            ))),
        }
    }
}

/// Moderation status of a template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateStatus {
    Pending,
    Approved,
    Rejected,
}

impl TemplateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateStatus::Pending => "pending",
            TemplateStatus::Approved => "approved",
            TemplateStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for TemplateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TemplateStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TemplateStatus::Pending),
            "approved" => Ok(TemplateStatus::Approved),
            "rejected" => Ok(TemplateStatus::Rejected),
            other => Err(crate::Error::validation(
                "status",
                format!("unknown template status '{}'", other),
            )),
        }
    }
}

/// Moderator verdict on a pending template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Rejected,
}

impl From<Verdict> for TemplateStatus {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Approved => TemplateStatus::Approved,
            Verdict::Rejected => TemplateStatus::Rejected,
        }
    }
}

/// Template delivery channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    #[default]
    Sms,
    Whatsapp,
    Email,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Whatsapp => "whatsapp",
            Channel::Email => "email",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sms" => Ok(Channel::Sms),
            "whatsapp" => Ok(Channel::Whatsapp),
            "email" => Ok(Channel::Email),
            other => Err(crate::Error::validation(
                "channel",
                format!("unknown channel '{}'", other),
            )),
        }
    }
}

/// Pricing class of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageClass {
    Service,
    Promotional,
}

impl MessageClass {
    /// Class from the explicit request flag
    pub fn from_flag(promotional: bool) -> Self {
        if promotional {
            MessageClass::Promotional
        } else {
            MessageClass::Service
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageClass::Service => "service",
            MessageClass::Promotional => "promotional",
        }
    }
}

/// Account status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    #[default]
    Active,
    Suspended,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Suspended => "suspended",
        }
    }
}

impl std::str::FromStr for AccountStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AccountStatus::Active),
            "suspended" => Ok(AccountStatus::Suspended),
            other => Err(crate::Error::Internal(format!(
                "unknown account status '{}'",
                other
            ))),
        }
    }
}
