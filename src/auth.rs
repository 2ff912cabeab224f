use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Every user authenticates with the one password from `COUNSEL_PASSWORD`.
/// Caller identity inside the booking core is carried by the ids in each statement.
#[derive(Debug)]
pub struct SharedSecretAuth {
    password: String,
}

impl SharedSecretAuth {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SharedSecretAuth {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
