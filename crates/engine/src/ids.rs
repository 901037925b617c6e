use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::ensure;
use uuid::Uuid;

use super::error::{EngineError, EngineResult, InvalidIdSnafu};
use super::types::Role;

/// Prefix that marks client-synthesized identifiers.
pub const TEMPORARY_ID_PREFIX: &str = "tmp_";

// Server identifiers are opaque strings; the wrappers only guarantee they are non-blank.
macro_rules! define_server_id {
    ($name:ident, $id_type:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: &str) -> EngineResult<Self> {
                let trimmed = raw.trim();
                ensure!(
                    !trimmed.is_empty(),
                    InvalidIdSnafu {
                        stage: "parse-id",
                        id_type: $id_type,
                        raw: raw.to_string(),
                    }
                );
                Ok(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = EngineError;

            fn from_str(raw: &str) -> EngineResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_server_id!(ConversationId, "conversation-id");
define_server_id!(ServerMessageId, "message-id");
define_server_id!(RunId, "run-id");

impl RunId {
    /// Stand-in run id for the optimistic entry, replaced once the server names the run.
    pub(crate) fn placeholder(nonce: AttemptNonce) -> Self {
        Self(format!("{TEMPORARY_ID_PREFIX}{nonce}_run"))
    }

    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with(TEMPORARY_ID_PREFIX)
    }
}

/// Nonce for one send attempt. A retry always gets a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptNonce(pub Uuid);

impl AttemptNonce {
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for AttemptNonce {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0.simple())
    }
}

/// Client-synthesized message identifier, unique within one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemporaryId(String);

impl TemporaryId {
    pub(crate) fn for_attempt(nonce: AttemptNonce, role: Role) -> Self {
        Self(format!("{TEMPORARY_ID_PREFIX}{nonce}_{}", role.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TemporaryId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// A message identifier is temporary or server-assigned, never both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Identifier {
    Temporary(TemporaryId),
    Server(ServerMessageId),
}

impl Identifier {
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    pub fn as_temporary(&self) -> Option<&TemporaryId> {
        match self {
            Self::Temporary(id) => Some(id),
            Self::Server(_) => None,
        }
    }

    pub fn as_server(&self) -> Option<&ServerMessageId> {
        match self {
            Self::Server(id) => Some(id),
            Self::Temporary(_) => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Temporary(id) => id.as_str(),
            Self::Server(id) => id.as_str(),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl From<TemporaryId> for Identifier {
    fn from(value: TemporaryId) -> Self {
        Self::Temporary(value)
    }
}

impl From<ServerMessageId> for Identifier {
    fn from(value: ServerMessageId) -> Self {
        Self::Server(value)
    }
}
