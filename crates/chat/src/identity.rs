use std::sync::Arc;

use arc_swap::ArcSwapOption;
use snafu::{ResultExt, Snafu};

use crate::error::{ChatResult, IdentityUnavailableSnafu};

pub const DEFAULT_ANONYMOUS_LABEL: &str = "Anonymous";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    Member,
    Moderator,
    Admin,
}

impl SessionRole {
    pub fn can_moderate(self) -> bool {
        matches!(self, Self::Moderator | Self::Admin)
    }
}

/// Signed-in user as reported by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub display_name: Option<String>,
    pub roles: Vec<SessionRole>,
}

impl Session {
    pub fn new(user_id: impl Into<String>, display_name: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name,
            roles: vec![SessionRole::Member],
        }
    }

    pub fn with_role(mut self, role: SessionRole) -> Self {
        if !self.roles.contains(&role) {
            self.roles.push(role);
        }
        self
    }

    pub fn can_moderate(&self) -> bool {
        self.roles.iter().any(|role| role.can_moderate())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AuthError {
    #[snafu(display("auth provider unavailable on `{stage}`: {details}"))]
    Unavailable {
        stage: &'static str,
        details: String,
    },
}

impl AuthError {
    pub fn unavailable(stage: &'static str, details: impl Into<String>) -> Self {
        UnavailableSnafu {
            stage,
            details: details.into(),
        }
        .build()
    }
}

/// External identity lookup. `Ok(None)` means nobody is signed in.
pub trait AuthProvider: Send + Sync {
    fn current_session(&self) -> Result<Option<Session>, AuthError>;
}

/// In-process session holder for embedders that manage sign-in themselves.
#[derive(Debug, Default)]
pub struct SessionAuth {
    session: ArcSwapOption<Session>,
}

impl SessionAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(session: Session) -> Self {
        let auth = Self::new();
        auth.sign_in(session);
        auth
    }

    pub fn sign_in(&self, session: Session) {
        tracing::info!(user_id = %session.user_id, "session signed in");
        self.session.store(Some(Arc::new(session)));
    }

    pub fn sign_out(&self) {
        if let Some(previous) = self.session.swap(None) {
            tracing::info!(user_id = %previous.user_id, "session signed out");
        }
    }
}

impl AuthProvider for SessionAuth {
    fn current_session(&self) -> Result<Option<Session>, AuthError> {
        Ok(self.session.load_full().map(|session| session.as_ref().clone()))
    }
}

/// Resolves the acting user into what a message is stamped with and what it may do.
///
/// Read-only over the auth collaborator; it never changes session state.
#[derive(Clone)]
pub struct IdentityBinder {
    provider: Arc<dyn AuthProvider>,
    anonymous_label: String,
}

impl IdentityBinder {
    pub fn new(provider: Arc<dyn AuthProvider>) -> Self {
        Self::with_anonymous_label(provider, DEFAULT_ANONYMOUS_LABEL)
    }

    pub fn with_anonymous_label(
        provider: Arc<dyn AuthProvider>,
        anonymous_label: impl Into<String>,
    ) -> Self {
        let anonymous_label = anonymous_label.into().trim().to_string();
        Self {
            provider,
            anonymous_label: if anonymous_label.is_empty() {
                DEFAULT_ANONYMOUS_LABEL.to_string()
            } else {
                anonymous_label
            },
        }
    }

    pub fn anonymous_label(&self) -> &str {
        &self.anonymous_label
    }

    /// Display name of the signed-in user, or the anonymous label when there is none.
    ///
    /// Fails only when the auth collaborator itself cannot answer.
    pub fn current_display_name(&self) -> ChatResult<String> {
        Ok(self
            .current_author()?
            .unwrap_or_else(|| self.anonymous_label.clone()))
    }

    /// Name to stamp on an outgoing message. Anonymous senders get `None`; the label
    /// is substituted when rendering, never persisted.
    pub fn current_author(&self) -> ChatResult<Option<String>> {
        let session = self
            .provider
            .current_session()
            .context(IdentityUnavailableSnafu {
                stage: "identity-resolve-author",
            })?;

        Ok(session
            .and_then(|session| session.display_name)
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty()))
    }

    pub fn is_privileged(&self) -> bool {
        match self.provider.current_session() {
            Ok(Some(session)) => session.can_moderate(),
            Ok(None) => false,
            Err(error) => {
                tracing::warn!(error = %error, "privilege check failed, treating as unprivileged");
                false
            }
        }
    }

    /// User id recorded in audit logs; `None` when signed out or unreachable.
    pub fn audit_actor(&self) -> Option<String> {
        self.provider
            .current_session()
            .ok()
            .flatten()
            .map(|session| session.user_id)
    }
}

impl std::fmt::Debug for IdentityBinder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("IdentityBinder")
            .field("anonymous_label", &self.anonymous_label)
            .finish_non_exhaustive()
    }
}
