use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{PgWireError, PgWireResult};

/// Login settings for the booking front end.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Required role name. `None` accepts any role.
    pub user: Option<String>,
    pub password: String,
}

impl Credentials {
    pub fn new(user: Option<String>, password: String) -> Self {
        Self { user, password }
    }

    fn accepts(&self, user: Option<&str>) -> bool {
        match (&self.user, user) {
            (None, _) => true,
            (Some(expected), Some(given)) => expected == given,
            (Some(_), None) => false,
        }
    }
}

#[derive(Debug)]
pub struct DriveAliveAuthSource {
    credentials: Credentials,
}

impl DriveAliveAuthSource {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl AuthSource for DriveAliveAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user();
        if !self.credentials.accepts(user) {
            tracing::warn!(user = ?user, "login refused for unknown role");
            return Err(PgWireError::InvalidPassword(user.unwrap_or_default().to_string()));
        }
        tracing::debug!(user = ?user, "password login");
        Ok(Password::new(None, self.credentials.password.as_bytes().to_vec()))
    }
}
