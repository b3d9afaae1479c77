//! Credentials shared by the controller and the store facade.

use parking_lot::RwLock;

#[derive(Debug, Clone)]
struct Credentials {
    user_id: String,
    auth_token: String,
}

/// The application key plus the signed-in user, if any.
///
/// A session is created once per application and shared by reference
/// (typically in an `Arc`). Signing in or out is visible to every store that
/// holds it.
#[derive(Debug)]
pub struct Session {
    app_key: String,
    credentials: RwLock<Option<Credentials>>,
}

impl Session {
    /// Creates a signed-out session.
    pub fn new(app_key: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            credentials: RwLock::new(None),
        }
    }

    /// Creates a session already signed in as `user_id`.
    pub fn signed_in(
        app_key: impl Into<String>,
        user_id: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Self {
        let session = Self::new(app_key);
        session.sign_in(user_id, auth_token);
        session
    }

    /// The application key.
    pub fn app_key(&self) -> &str {
        &self.app_key
    }

    /// Records the signed-in user.
    pub fn sign_in(&self, user_id: impl Into<String>, auth_token: impl Into<String>) {
        *self.credentials.write() = Some(Credentials {
            user_id: user_id.into(),
            auth_token: auth_token.into(),
        });
    }

    /// Forgets the signed-in user.
    pub fn sign_out(&self) {
        *self.credentials.write() = None;
    }

    /// Id of the signed-in user.
    pub fn active_user(&self) -> Option<String> {
        self.credentials.read().as_ref().map(|c| c.user_id.clone())
    }

    /// Auth token of the signed-in user.
    pub fn auth_token(&self) -> Option<String> {
        self.credentials.read().as_ref().map(|c| c.auth_token.clone())
    }

    /// True when a user is signed in.
    pub fn is_authenticated(&self) -> bool {
        self.credentials.read().is_some()
    }
}
