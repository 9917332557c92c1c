//! Mail address grammar.
//!
//! Accepted forms:
//!
//! ```text
//! <rig>/<role>            every active agent of that role on the rig
//! <rig>/<role>/<name>     one agent
//! */<role>                pattern: that role on every rig
//! group:<name>            recursive member expansion
//! queue:<name>            claimed by exactly one worker
//! channel:<name>          broadcast with retention
//! <name>                  bare: resolved group -> queue -> channel
//! ```

use crate::errors::MailError;

/// A parsed recipient address. Bare names are resolved against the store
/// later; everything else is structural.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Direct {
        rig: String,
        role: String,
        name: Option<String>,
    },
    /// `*/role` — matches the role on every rig.
    Pattern { role: String },
    Group(String),
    Queue(String),
    Channel(String),
    Bare(String),
}

impl Address {
    /// Parse the textual form. Only syntax is validated here.
    pub fn parse(raw: &str) -> Result<Self, MailError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(MailError::UnknownAddress { addr: raw.into() });
        }
        if let Some(name) = raw.strip_prefix("group:") {
            return Ok(Self::Group(nonempty(name, raw)?));
        }
        if let Some(name) = raw.strip_prefix("queue:") {
            return Ok(Self::Queue(nonempty(name, raw)?));
        }
        if let Some(name) = raw.strip_prefix("channel:") {
            return Ok(Self::Channel(nonempty(name, raw)?));
        }
        let parts: Vec<&str> = raw.split('/').collect();
        match parts.as_slice() {
            [single] => Ok(Self::Bare(nonempty(single, raw)?)),
            ["*", role] => Ok(Self::Pattern {
                role: nonempty(role, raw)?,
            }),
            [rig, role] => Ok(Self::Direct {
                rig: nonempty(rig, raw)?,
                role: nonempty(role, raw)?,
                name: None,
            }),
            [rig, role, name] => Ok(Self::Direct {
                rig: nonempty(rig, raw)?,
                role: nonempty(role, raw)?,
                name: Some(nonempty(name, raw)?),
            }),
            _ => Err(MailError::UnknownAddress { addr: raw.into() }),
        }
    }
}

fn nonempty(part: &str, raw: &str) -> Result<String, MailError> {
    if part.is_empty() || part.contains(char::is_whitespace) {
        return Err(MailError::UnknownAddress { addr: raw.into() });
    }
    Ok(part.to_string())
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct {
                rig,
                role,
                name: Some(name),
            } => write!(f, "{rig}/{role}/{name}"),
            Self::Direct { rig, role, name: None } => write!(f, "{rig}/{role}"),
            Self::Pattern { role } => write!(f, "*/{role}"),
            Self::Group(n) => write!(f, "group:{n}"),
            Self::Queue(n) => write!(f, "queue:{n}"),
            Self::Channel(n) => write!(f, "channel:{n}"),
            Self::Bare(n) => f.write_str(n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_direct_forms() {
        assert_eq!(
            Address::parse("gastown/witness").unwrap(),
            Address::Direct {
                rig: "gastown".into(),
                role: "witness".into(),
                name: None
            }
        );
        assert_eq!(
            Address::parse("gastown/crew/alice").unwrap(),
            Address::Direct {
                rig: "gastown".into(),
                role: "crew".into(),
                name: Some("alice".into())
            }
        );
    }

    #[test]
    fn parses_pattern() {
        assert_eq!(
            Address::parse("*/refinery").unwrap(),
            Address::Pattern {
                role: "refinery".into()
            }
        );
    }

    #[test]
    fn parses_prefixed_forms() {
        assert_eq!(Address::parse("group:ops").unwrap(), Address::Group("ops".into()));
        assert_eq!(Address::parse("queue:build").unwrap(), Address::Queue("build".into()));
        assert_eq!(
            Address::parse("channel:alerts").unwrap(),
            Address::Channel("alerts".into())
        );
    }

    #[test]
    fn bare_name_defers_resolution() {
        assert_eq!(Address::parse("alerts").unwrap(), Address::Bare("alerts".into()));
    }

    #[test]
    fn rejects_malformed() {
        assert!(Address::parse("").is_err());
        assert!(Address::parse("group:").is_err());
        assert!(Address::parse("a/b/c/d").is_err());
        assert!(Address::parse("has space").is_err());
    }

    #[test]
    fn display_round_trips() {
        for raw in ["gastown/crew/alice", "*/witness", "group:ops", "queue:build"] {
            assert_eq!(Address::parse(raw).unwrap().to_string(), raw);
        }
    }
}
