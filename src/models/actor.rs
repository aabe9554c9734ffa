use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Customer,
    Rider,
    Operator,
    System,
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActorRole::Customer => "customer",
            ActorRole::Rider => "rider",
            ActorRole::Operator => "operator",
            ActorRole::System => "system",
        };
        f.write_str(name)
    }
}

/// Who caused a change. Recorded on status history entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub role: ActorRole,
    pub id: Uuid,
}

impl Actor {
    pub fn new(role: ActorRole, id: Uuid) -> Self {
        Self { role, id }
    }

    pub fn customer(id: Uuid) -> Self {
        Self::new(ActorRole::Customer, id)
    }

    pub fn rider(id: Uuid) -> Self {
        Self::new(ActorRole::Rider, id)
    }

    pub fn operator(id: Uuid) -> Self {
        Self::new(ActorRole::Operator, id)
    }

    /// The backend dispatcher acting on its own behalf.
    pub fn system() -> Self {
        Self::new(ActorRole::System, Uuid::nil())
    }

    /// Bearer credential understood by the REST and WebSocket surfaces.
    pub fn credential(&self) -> String {
        format!("{}:{}", self.role, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidCredential(pub String);

impl fmt::Display for InvalidCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid credential: {}", self.0)
    }
}

impl FromStr for Actor {
    type Err = InvalidCredential;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (role, id) = raw
            .split_once(':')
            .ok_or_else(|| InvalidCredential("expected <role>:<id>".to_string()))?;

        let role = match role {
            "customer" => ActorRole::Customer,
            "rider" => ActorRole::Rider,
            "operator" => ActorRole::Operator,
            other => return Err(InvalidCredential(format!("unknown role {other}"))),
        };

        let id = Uuid::parse_str(id).map_err(|err| InvalidCredential(err.to_string()))?;
        Ok(Self { role, id })
    }
}
