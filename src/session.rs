//! Session state and the server-driven session header protocol.
//!
//! HTTP is stateless, but side-effect statements (`USE ENGINE`, `USE
//! DATABASE`, `SET x = y`) mutate a logical connection. The client resends
//! the full parameter set as query-string parameters on every request and
//! learns server-side mutations from response headers, applied in a fixed
//! order after every response.

use std::collections::BTreeMap;

use reqwest::header::HeaderMap;
use reqwest::Url;

use crate::error::{Error, Result};

/// Response header carrying parameter merges.
pub const HEADER_UPDATE_PARAMETERS: &str = "Update-Parameters";
/// Presence-only response header that resets mutable session parameters.
pub const HEADER_RESET_SESSION: &str = "Reset-Session";
/// Response header redirecting the session to a new endpoint.
pub const HEADER_UPDATE_ENDPOINT: &str = "Update-Endpoint";

/// Parameters that survive a `Reset-Session`.
pub const IMMUTABLE_PARAMETERS: [&str; 3] = ["database", "account_id", "output_format"];

/// Keys the server may merge via `Update-Parameters`; everything else in
/// that header is silently ignored.
const UPDATABLE_PARAMETERS: [&str; 1] = ["database"];

/// Account identity resolved for the current session.
#[derive(Clone, Debug, PartialEq)]
pub struct AccountInfo {
    /// Account id, compared against `account_id` in `Update-Endpoint`.
    pub id: String,
    /// Infrastructure generation reported by the backend.
    pub infra_version: u32,
}

/// The mutable record of "the current connection": destination URL plus the
/// request parameters resent with every query.
///
/// Owned by exactly one `Connection`; mutated only by the session header
/// protocol ([`SessionState::apply_response_headers`]) or by endpoint
/// re-resolution.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionState {
    endpoint: Url,
    parameters: BTreeMap<String, String>,
    account: Option<AccountInfo>,
}

impl SessionState {
    /// Create session state for an endpoint. `output_format` is always
    /// present in the parameter set.
    pub fn new(endpoint: Url, output_format: &str) -> Self {
        let mut parameters = BTreeMap::new();
        parameters.insert("output_format".to_string(), output_format.to_string());
        Self {
            endpoint,
            parameters,
            account: None,
        }
    }

    /// Current destination, without query parameters.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Replace the destination endpoint.
    pub fn set_endpoint(&mut self, endpoint: Url) {
        self.endpoint = endpoint;
    }

    /// Current request parameters.
    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// Set one request parameter.
    pub fn set_parameter(&mut self, key: &str, value: &str) {
        self.parameters.insert(key.to_string(), value.to_string());
    }

    /// Remove one request parameter.
    pub fn remove_parameter(&mut self, key: &str) {
        self.parameters.remove(key);
    }

    /// Resolved account, if any.
    pub fn account(&self) -> Option<&AccountInfo> {
        self.account.as_ref()
    }

    /// Cache the resolved account.
    pub fn set_account(&mut self, account: AccountInfo) {
        self.account = Some(account);
    }

    /// Destination URL for the next request: endpoint plus the full session
    /// parameter set as query-string parameters, with `extra` overlaid for
    /// this request only.
    pub fn request_url(&self, extra: &BTreeMap<String, String>) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.clear();
            for (key, value) in &self.parameters {
                if !extra.contains_key(key) {
                    query.append_pair(key, value);
                }
            }
            for (key, value) in extra {
                query.append_pair(key, value);
            }
        }
        url
    }

    /// Apply the session header protocol to this state, in fixed order:
    /// `Update-Parameters`, then `Reset-Session`, then `Update-Endpoint`.
    ///
    /// Malformed `Update-Parameters` entries are dropped, not fatal. A
    /// failed `Update-Endpoint` account check is always fatal and leaves
    /// the state unchanged.
    pub fn apply_response_headers(&mut self, headers: &HeaderMap) -> Result<()> {
        if let Some(raw) = header_str(headers, HEADER_UPDATE_PARAMETERS) {
            self.merge_updated_parameters(raw);
        }

        if headers.contains_key(HEADER_RESET_SESSION) {
            tracing::debug!("session reset requested by server");
            self.parameters
                .retain(|key, _| IMMUTABLE_PARAMETERS.contains(&key.as_str()));
        }

        if let Some(raw) = header_str(headers, HEADER_UPDATE_ENDPOINT) {
            self.follow_endpoint_update(raw)?;
        }

        Ok(())
    }

    /// True when the next query needs a resolved account id to validate a
    /// pending `Update-Endpoint` redirect.
    pub fn endpoint_update_needs_account(headers: &HeaderMap) -> bool {
        header_str(headers, HEADER_UPDATE_ENDPOINT)
            .and_then(parse_endpoint_url)
            .map(|url| url.query_pairs().any(|(k, _)| k == "account_id"))
            .unwrap_or(false)
    }

    fn merge_updated_parameters(&mut self, raw: &str) {
        for entry in raw.split(',') {
            let Some((key, value)) = entry.split_once('=') else {
                tracing::debug!(entry, "dropping malformed Update-Parameters entry");
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if UPDATABLE_PARAMETERS.contains(&key) {
                self.parameters.insert(key.to_string(), value.to_string());
            } else {
                tracing::debug!(key, "ignoring non-updatable session parameter");
            }
        }
    }

    fn follow_endpoint_update(&mut self, raw: &str) -> Result<()> {
        let url = parse_endpoint_url(raw).ok_or_else(|| Error::Connection(format!(
            "server sent an invalid Update-Endpoint header: '{}'",
            raw
        )))?;

        // A redirect must never silently switch accounts; verify before
        // mutating anything.
        let redirect_params: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if let Some((_, redirect_account)) =
            redirect_params.iter().find(|(k, _)| k == "account_id")
        {
            match &self.account {
                Some(account) if account.id == *redirect_account => {}
                Some(account) => {
                    return Err(Error::Connection(format!(
                        "Update-Endpoint account_id '{}' does not match the connection's account '{}'",
                        redirect_account, account.id
                    )));
                }
                None => {
                    return Err(Error::Connection(format!(
                        "Update-Endpoint carries account_id '{}' but no account is resolved for this connection",
                        redirect_account
                    )));
                }
            }
        }

        for (key, value) in redirect_params {
            self.parameters.insert(key, value);
        }
        let mut endpoint = url;
        endpoint.set_query(None);
        tracing::debug!(endpoint = %endpoint, "session endpoint updated by server");
        self.endpoint = endpoint;
        Ok(())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parse an `Update-Endpoint` value; the scheme is optional and defaults
/// to https.
fn parse_endpoint_url(raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };
    Url::parse(&candidate).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    fn session() -> SessionState {
        let mut s = SessionState::new(
            Url::parse("https://engine.example.com/query").unwrap(),
            "JSON_Compact",
        );
        s.set_parameter("database", "dummy");
        s
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_update_parameters_allow_list() {
        let mut s = session();
        s.apply_response_headers(&headers(&[(
            "Update-Parameters",
            "database= dummy2,other=parameter",
        )]))
        .unwrap();
        assert_eq!(s.parameters().get("database").unwrap(), "dummy2");
        assert!(!s.parameters().contains_key("other"));
    }

    #[test]
    fn test_update_parameters_malformed_entry_dropped() {
        let mut s = session();
        s.apply_response_headers(&headers(&[("Update-Parameters", "garbage,database=db2")]))
            .unwrap();
        assert_eq!(s.parameters().get("database").unwrap(), "db2");
    }

    #[test]
    fn test_reset_session_keeps_immutable_keys() {
        let mut s = session();
        s.set_parameter("account_id", "acc-1");
        s.set_parameter("custom", "x");
        s.set_parameter("another", "y");
        s.apply_response_headers(&headers(&[("Reset-Session", "")])).unwrap();
        let keys: Vec<&str> = s.parameters().keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["account_id", "database", "output_format"]);
    }

    #[test]
    fn test_update_endpoint_moves_host_and_merges_params() {
        let mut s = session();
        s.apply_response_headers(&headers(&[(
            "Update-Endpoint",
            "https://host2/query?param=value",
        )]))
        .unwrap();
        assert_eq!(s.endpoint().as_str(), "https://host2/query");
        assert_eq!(s.parameters().get("param").unwrap(), "value");
        // Prior parameters survive.
        assert_eq!(s.parameters().get("database").unwrap(), "dummy");

        let url = s.request_url(&BTreeMap::new());
        assert_eq!(url.host_str(), Some("host2"));
        assert!(url.query().unwrap().contains("param=value"));
    }

    #[test]
    fn test_update_endpoint_scheme_defaults_to_https() {
        let mut s = session();
        s.apply_response_headers(&headers(&[("Update-Endpoint", "host3/query")]))
            .unwrap();
        assert_eq!(s.endpoint().scheme(), "https");
        assert_eq!(s.endpoint().host_str(), Some("host3"));
    }

    #[test]
    fn test_update_endpoint_account_match_accepted() {
        let mut s = session();
        s.set_account(AccountInfo {
            id: "acc-1".to_string(),
            infra_version: 2,
        });
        s.apply_response_headers(&headers(&[(
            "Update-Endpoint",
            "https://host2/query?account_id=acc-1",
        )]))
        .unwrap();
        assert_eq!(s.endpoint().host_str(), Some("host2"));
        assert_eq!(s.parameters().get("account_id").unwrap(), "acc-1");
    }

    #[test]
    fn test_update_endpoint_account_mismatch_is_fatal_and_state_unchanged() {
        let mut s = session();
        s.set_account(AccountInfo {
            id: "acc-Y".to_string(),
            infra_version: 2,
        });
        let before = s.clone();
        let err = s
            .apply_response_headers(&headers(&[(
                "Update-Endpoint",
                "https://host2/query?account_id=acc-X",
            )]))
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(s, before);
    }

    #[test]
    fn test_update_endpoint_account_without_resolution_is_fatal() {
        let mut s = session();
        let err = s
            .apply_response_headers(&headers(&[(
                "Update-Endpoint",
                "https://host2/query?account_id=acc-X",
            )]))
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[test]
    fn test_headers_apply_in_fixed_order() {
        // Update-Parameters merges first, then Reset-Session drops the
        // mutable leftovers, then Update-Endpoint lands.
        let mut s = session();
        s.set_parameter("mutable", "gone");
        s.apply_response_headers(&headers(&[
            ("Update-Parameters", "database=db9"),
            ("Reset-Session", ""),
            ("Update-Endpoint", "https://host4/query?fresh=1"),
        ]))
        .unwrap();
        assert_eq!(s.parameters().get("database").unwrap(), "db9");
        assert!(!s.parameters().contains_key("mutable"));
        assert_eq!(s.parameters().get("fresh").unwrap(), "1");
        assert_eq!(s.endpoint().host_str(), Some("host4"));
    }

    #[test]
    fn test_request_url_resends_full_parameter_set() {
        let s = session();
        let url = s.request_url(&BTreeMap::new());
        let query = url.query().unwrap();
        assert!(query.contains("database=dummy"));
        assert!(query.contains("output_format=JSON_Compact"));
    }

    #[test]
    fn test_request_url_extra_overlays_without_persisting() {
        let s = session();
        let mut extra = BTreeMap::new();
        extra.insert("output_format".to_string(), "JSONLines_Compact".to_string());
        let url = s.request_url(&extra);
        assert!(url.query().unwrap().contains("output_format=JSONLines_Compact"));
        assert!(!url.query().unwrap().contains("JSON_Compact"));
        // Session itself is untouched.
        assert_eq!(s.parameters().get("output_format").unwrap(), "JSON_Compact");
    }

    #[test]
    fn test_endpoint_update_needs_account() {
        assert!(SessionState::endpoint_update_needs_account(&headers(&[(
            "Update-Endpoint",
            "https://host2?account_id=a",
        )])));
        assert!(!SessionState::endpoint_update_needs_account(&headers(&[(
            "Update-Endpoint",
            "https://host2?param=1",
        )])));
        assert!(!SessionState::endpoint_update_needs_account(&HeaderMap::new()));
    }
}
