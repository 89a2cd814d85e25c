use crate::util::{HttpClient, HttpError};

const LOGIN_URL: &str = "https://account.nicovideo.jp/login/redirector";
const LOGGED_IN_URL: &str = "https://account.nicovideo.jp/my/account";
const DEVICE_NAME: &str = "nicolive-dl";

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("Failed to login")]
    Rejected,
    #[error("No one-time password was entered")]
    MissingOtp,
    #[error("Login request failed")]
    Http(#[from] HttpError),
}

fn is_logged_in(final_url: &str) -> bool {
    final_url == LOGGED_IN_URL
}

/// Log in, storing the session cookies in `client`.
///
/// When the account has two-step verification enabled, pass `otp`; it is
/// called after the password step to obtain the code sent to the user.
pub async fn login<F>(
    client: &HttpClient,
    credentials: &Credentials,
    otp: Option<F>,
) -> Result<(), AuthError>
where
    F: FnOnce() -> Option<String>,
{
    let mut res = client
        .post_form(
            LOGIN_URL,
            &[
                ("mail_tel", credentials.username.as_str()),
                ("password", credentials.password.as_str()),
            ],
        )
        .await?;

    if let Some(otp) = otp {
        let code = otp().ok_or(AuthError::MissingOtp)?;
        let otp_url = res.url().to_string();
        debug!("Sending one-time password to {}", otp_url);

        res = client
            .post_form(
                &otp_url,
                &[
                    ("otp", code.trim()),
                    ("loginBtn", "Login"),
                    ("is_mfa_trusted_device", "true"),
                    ("device_name", DEVICE_NAME),
                ],
            )
            .await?;
    }

    if !is_logged_in(res.url().as_str()) {
        return Err(AuthError::Rejected);
    }

    info!("Logged in as {}", credentials.username);
    Ok(())
}
