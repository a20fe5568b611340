use crate::common::{AuthSession, Profile};
use crate::error::{ChatError, Result};

/// Supplies the signed-in user. Its id is trusted as the sender of every write.
pub trait AuthProvider: Send + Sync {
    fn current_user(&self) -> Result<AuthSession>;
}

/// Fixed identity, for the CLI and tests.
#[derive(Debug, Clone)]
pub struct StaticAuthProvider {
    session: AuthSession,
}

impl StaticAuthProvider {
    pub fn new(user_id: impl Into<String>, full_name: impl Into<String>) -> Self {
        Self {
            session: AuthSession {
                user_id: user_id.into(),
                profile: Profile {
                    full_name: full_name.into(),
                    avatar_url: None,
                    role: "member".to_string(),
                },
            },
        }
    }

    pub fn from_session(session: AuthSession) -> Self {
        Self { session }
    }
}

impl AuthProvider for StaticAuthProvider {
    fn current_user(&self) -> Result<AuthSession> {
        let user_id = &self.session.user_id;
        if user_id.trim().is_empty() {
            return Err(ChatError::Permission("no signed-in user".into()));
        }
        if user_id.trim() != user_id {
            return Err(ChatError::Permission(format!(
                "user id {user_id:?} has surrounding whitespace"
            )));
        }
        Ok(self.session.clone())
    }
}
