//! Best-effort inspection of submitted credential forms.
//!
//! The governor only needs the account value (for the login bucket key) and the submitted
//! anti-forgery token. Both JSON and urlencoded bodies are accepted.

use serde::Deserialize;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormProbe {
    pub account: Option<String>,
    pub csrf_token: Option<String>,
}

#[derive(Deserialize)]
struct JsonForm {
    email: Option<String>,
    username: Option<String>,
    csrf_token: Option<String>,
    #[serde(rename = "_csrf")]
    csrf_alt: Option<String>,
}

impl FormProbe {
    /// Parses `body` according to `content_type`. Anything that is not urlencoded is tried as
    /// JSON. `token_field` is the configured form field name for the token.
    pub fn parse(content_type: Option<&str>, body: &[u8], token_field: &str) -> AppResult<Self> {
        if body.is_empty() {
            return Err(AppError::ValidationError {
                field: "body".to_string(),
                message: "empty body".to_string(),
            });
        }
        let is_form = content_type
            .map(|ct| ct.trim_start().starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);
        if is_form {
            Ok(Self::parse_urlencoded(body, token_field))
        } else {
            Self::parse_json(body, token_field)
        }
    }

    fn parse_urlencoded(body: &[u8], token_field: &str) -> Self {
        let mut email = None;
        let mut username = None;
        let mut token = None;
        for (key, value) in url::form_urlencoded::parse(body) {
            let value = value.into_owned();
            match key.as_ref() {
                "email" => email = Some(value),
                "username" => username = Some(value),
                k if k == token_field || k == "csrf_token" || k == "_csrf" => token = Some(value),
                _ => {}
            }
        }
        Self { account: non_empty(email).or(non_empty(username)), csrf_token: non_empty(token) }
    }

    fn parse_json(body: &[u8], token_field: &str) -> AppResult<Self> {
        let value: serde_json::Value = serde_json::from_slice(body).map_err(|e| AppError::ValidationError {
            field: "body".to_string(),
            message: format!("unparseable body: {}", e),
        })?;
        let custom_token = value.get(token_field).and_then(|v| v.as_str()).map(str::to_string);
        let form: JsonForm = serde_json::from_value(value).map_err(|e| AppError::ValidationError {
            field: "body".to_string(),
            message: format!("unexpected body shape: {}", e),
        })?;
        Ok(Self {
            account: non_empty(form.email).or(non_empty(form.username)),
            csrf_token: non_empty(custom_token).or(non_empty(form.csrf_token)).or(non_empty(form.csrf_alt)),
        })
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}
