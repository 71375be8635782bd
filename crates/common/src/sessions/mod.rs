//! Debug sessions: selectors, the cached lookup layer and operator actions

mod cache;
mod service;

pub use cache::{keys, SessionCache};
pub use service::{SessionService, SessionStatus, SessionSummary};

use crate::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which requests a session captures.
///
/// The four variants are the only valid shapes; a blank tenant id or a
/// non-positive user id is rejected by the constructors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Selector {
    Global,
    Tenant { tenant_id: String },
    User { user_id: i64 },
    TenantUser { tenant_id: String, user_id: i64 },
}

impl Selector {
    /// Validate and build from optional parts; both absent means global
    pub fn new(tenant_id: Option<String>, user_id: Option<i64>) -> Result<Self> {
        let tenant_id = match tenant_id {
            Some(t) if t.trim().is_empty() => {
                return Err(AppError::InvalidSelector {
                    message: "tenant_id must not be blank".to_string(),
                })
            }
            Some(t) => Some(t.trim().to_string()),
            None => None,
        };
        if let Some(u) = user_id {
            if u <= 0 {
                return Err(AppError::InvalidSelector {
                    message: format!("user_id must be positive, got {}", u),
                });
            }
        }

        Ok(Self::from_parts(tenant_id, user_id))
    }

    pub fn tenant(tenant_id: impl Into<String>) -> Result<Self> {
        Self::new(Some(tenant_id.into()), None)
    }

    pub fn user(user_id: i64) -> Result<Self> {
        Self::new(None, Some(user_id))
    }

    pub fn tenant_user(tenant_id: impl Into<String>, user_id: i64) -> Result<Self> {
        Self::new(Some(tenant_id.into()), Some(user_id))
    }

    /// Build from stored columns without validation
    pub(crate) fn from_parts(tenant_id: Option<String>, user_id: Option<i64>) -> Self {
        match (tenant_id, user_id) {
            (None, None) => Selector::Global,
            (Some(tenant_id), None) => Selector::Tenant { tenant_id },
            (None, Some(user_id)) => Selector::User { user_id },
            (Some(tenant_id), Some(user_id)) => Selector::TenantUser { tenant_id, user_id },
        }
    }

    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            Selector::Tenant { tenant_id } | Selector::TenantUser { tenant_id, .. } => {
                Some(tenant_id.as_str())
            }
            _ => None,
        }
    }

    pub fn user_id(&self) -> Option<i64> {
        match self {
            Selector::User { user_id } | Selector::TenantUser { user_id, .. } => Some(*user_id),
            _ => None,
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Selector::Global)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Global => write!(f, "Global"),
            Selector::Tenant { tenant_id } => write!(f, "Tenant: {}", tenant_id),
            Selector::User { user_id } => write!(f, "User: #{}", user_id),
            Selector::TenantUser { tenant_id, user_id } => {
                write!(f, "Tenant: {} / User: #{}", tenant_id, user_id)
            }
        }
    }
}

/// 64 hex characters from 32 random bytes
pub fn generate_token() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shapes_from_parts() {
        assert_eq!(Selector::new(None, None).unwrap(), Selector::Global);
        assert!(matches!(Selector::tenant("acme").unwrap(), Selector::Tenant { .. }));
        assert!(matches!(Selector::user(5).unwrap(), Selector::User { .. }));
        assert!(matches!(
            Selector::tenant_user("acme", 5).unwrap(),
            Selector::TenantUser { .. }
        ));
    }

    #[test]
    fn test_invalid_shapes_rejected() {
        assert!(matches!(
            Selector::tenant("   "),
            Err(AppError::InvalidSelector { .. })
        ));
        assert!(Selector::user(0).is_err());
        assert!(Selector::tenant_user("acme", -3).is_err());
        assert!(Selector::tenant_user("", 3).is_err());
    }

    #[test]
    fn test_accessors() {
        let selector = Selector::tenant_user(" acme ", 9).unwrap();
        assert_eq!(selector.tenant_id(), Some("acme"));
        assert_eq!(selector.user_id(), Some(9));
        assert!(!selector.is_global());
        assert!(Selector::Global.is_global());
    }

    #[test]
    fn test_token_shape() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
    }
}
