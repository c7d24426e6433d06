//! Caller token extraction. The token may arrive as the `token` header,
//! the `token` query parameter or the `token` cookie, each individually
//! switchable in config. The literal string "null" is what a JavaScript
//! client sends for an absent token and is treated as absent.

use axum::http::{header, HeaderMap};
use serde::Deserialize;

use crate::config::Config;

#[derive(Deserialize, Default, Debug)]
#[serde(default)]
pub struct CallParams {
    pub token: Option<String>,
    pub caching: Option<bool>,
}

impl CallParams {
    pub fn caching(&self) -> bool {
        self.caching.unwrap_or(true)
    }
}

/// Resolution order: header, query parameter, cookie. Always yields at
/// least the empty token.
pub fn caller_token(config: &Config, headers: &HeaderMap, params: &CallParams) -> String {
    if config.allow_header_token {
        if let Some(token) = headers.get("token").and_then(|v| v.to_str().ok()) {
            if token != "null" {
                return token.to_string();
            }
        }
    }

    if config.allow_parameter_token {
        if let Some(token) = params.token.as_deref() {
            if !token.is_empty() {
                return token.to_string();
            }
        }
    }

    if config.allow_cookie_token {
        if let Some(token) = cookie_token(headers) {
            if token != "null" {
                return token;
            }
        }
    }

    String::new()
}

fn cookie_token(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        if name == "token" {
            Some(value.to_string())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::try_from(*name).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn header_wins_over_parameter_and_cookie() {
        let config = Config::default();
        let headers = headers(&[("token", "fromheader"), ("cookie", "token=fromcookie")]);
        let params = CallParams {
            token: Some("fromquery".into()),
            caching: None,
        };
        assert_eq!(caller_token(&config, &headers, &params), "fromheader");
    }

    #[test]
    fn null_header_falls_through() {
        let config = Config::default();
        let headers = headers(&[("token", "null"), ("cookie", "a=b; token=fromcookie")]);
        assert_eq!(
            caller_token(&config, &headers, &CallParams::default()),
            "fromcookie"
        );
    }

    #[test]
    fn disabled_transports_are_ignored() {
        let config = Config {
            allow_header_token: false,
            allow_cookie_token: false,
            ..Config::default()
        };
        let headers = headers(&[("token", "fromheader"), ("cookie", "token=fromcookie")]);
        assert_eq!(caller_token(&config, &headers, &CallParams::default()), "");

        let params = CallParams {
            token: Some("fromquery".into()),
            caching: None,
        };
        assert_eq!(caller_token(&config, &headers, &params), "fromquery");
    }
}
