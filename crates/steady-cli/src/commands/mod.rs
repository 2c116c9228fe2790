//! CLI command implementations.

use std::time::Duration;

use anyhow::Context;
use serde_json::Value;

use steady_client::HttpRequest;

pub mod config;
pub mod history;
pub mod query;
pub mod stream;

/// Build a GET, or a POST when a JSON body is given.
pub fn build_request(url: &str, data: Option<&str>, timeout: Option<u64>) -> anyhow::Result<HttpRequest> {
    let mut request = match data {
        Some(raw) => {
            let body: Value = serde_json::from_str(raw).context("--data is not valid JSON")?;
            HttpRequest::post(url, body)
        }
        None => HttpRequest::get(url),
    };
    if let Some(seconds) = timeout {
        request = request.with_timeout(Duration::from_secs(seconds));
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use steady_client::HttpMethod;

    #[test]
    fn test_build_request() {
        let get = build_request("http://h/q", None, None).unwrap();
        assert_eq!(get.method, HttpMethod::Get);
        assert!(get.body.is_none());

        let post = build_request("http://h/q", Some(r#"{"q":"x"}"#), Some(5)).unwrap();
        assert_eq!(post.method, HttpMethod::Post);
        assert_eq!(post.body, Some(json!({"q": "x"})));
        assert_eq!(post.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_build_request_rejects_bad_json() {
        assert!(build_request("http://h/q", Some("{nope"), None).is_err());
    }
}
