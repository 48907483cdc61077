use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Single shared password for every user name. The cleartext startup
/// handler compares what the client sends against it.
#[derive(Debug)]
pub struct ClinicAuthSource {
    password: String,
}

impl ClinicAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for ClinicAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!(user = ?login.user(), "password requested");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
