//! Connections: endpoint/account resolution and query execution.
//!
//! A [`Connection`] owns one [`SessionState`] and decides, for every query,
//! which HTTP endpoint and which parameters represent "the current
//! connection". Three deployment generations share the same contract and
//! differ only in how the initial endpoint and account are resolved:
//!
//! - **Core** — zero-auth local deployment; the caller supplies the endpoint.
//! - **V1** — legacy account/engine model; endpoints come from REST lookups.
//! - **V2** — system-engine model; a shared system engine answers management
//!   SQL and redirects the session via response headers.

use std::collections::BTreeMap;
use std::sync::Arc;

use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::auth::Authenticator;
use crate::error::{CompositeError, Error, Result, ServerError};
use crate::session::{AccountInfo, SessionState};
use crate::statement::{expand_query, ExecuteOptions, Statement, StreamStatement};

/// Default REST endpoint for account and engine resolution.
pub const DEFAULT_API_ENDPOINT: &str = "https://api.emberdb.io";

/// Output format requested for buffered responses.
pub const DEFAULT_OUTPUT_FORMAT: &str = "JSON_Compact";

/// Output format requested for streamed responses.
pub const STREAMING_OUTPUT_FORMAT: &str = "JSONLines_Compact";

/// How the initial endpoint and account were resolved.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionVariant {
    /// Zero-auth local deployment; no account, no REST resolution.
    Core,
    /// Legacy account/engine model: ids and engine URLs come from REST.
    V1 {
        /// Account name, or `None` for the credential's default account.
        account_name: Option<String>,
    },
    /// System-engine model: management SQL on a shared endpoint.
    V2 {
        /// Account name; required for this generation.
        account_name: String,
    },
}

/// Options for establishing a connection.
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    /// REST endpoint for account/engine resolution (V1 and V2).
    pub api_endpoint: String,
    /// Explicit engine endpoint. Required for Core, highest priority for V1.
    pub endpoint: Option<String>,
    /// Account name.
    pub account_name: Option<String>,
    /// Engine to connect to.
    pub engine_name: Option<String>,
    /// Database to use.
    pub database: Option<String>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            api_endpoint: DEFAULT_API_ENDPOINT.to_string(),
            endpoint: None,
            account_name: None,
            engine_name: None,
            database: None,
        }
    }
}

impl ConnectionOptions {
    /// Override the REST resolution endpoint.
    pub fn with_api_endpoint(mut self, url: impl Into<String>) -> Self {
        self.api_endpoint = url.into();
        self
    }

    /// Supply an explicit engine endpoint.
    pub fn with_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Some(url.into());
        self
    }

    /// Set the account name.
    pub fn with_account(mut self, name: impl Into<String>) -> Self {
        self.account_name = Some(name.into());
        self
    }

    /// Set the engine name.
    pub fn with_engine(mut self, name: impl Into<String>) -> Self {
        self.engine_name = Some(name.into());
        self
    }

    /// Set the database.
    pub fn with_database(mut self, name: impl Into<String>) -> Self {
        self.database = Some(name.into());
        self
    }
}

/// A live connection to one engine (or the system engine).
///
/// Multiple queries may be in flight on one connection; each response's
/// session headers are applied as that response is processed, so concurrent
/// queries mutating the session follow "last response processed wins".
/// [`Connection::close`] cancels every in-flight request; a cancelled
/// request rejects with [`Error::Cancelled`], it never hangs.
pub struct Connection {
    http: reqwest::Client,
    auth: Arc<dyn Authenticator>,
    variant: ConnectionVariant,
    api_endpoint: Option<Url>,
    options: ConnectionOptions,
    session: tokio::sync::Mutex<SessionState>,
    cancel: CancellationToken,
}

/// Body shape of a non-2xx response that still carries structured errors.
#[derive(Debug, Deserialize)]
struct ErrorsDocument {
    #[serde(default)]
    errors: Vec<ServerError>,
}

#[derive(Debug, Deserialize)]
struct AccountIdByName {
    account_id: String,
}

#[derive(Debug, Deserialize)]
struct DefaultAccount {
    account: DefaultAccountBody,
}

#[derive(Debug, Deserialize)]
struct DefaultAccountBody {
    id: String,
}

#[derive(Debug, Deserialize)]
struct EngineUrlByLookup {
    engine_url: String,
}

#[derive(Debug, Deserialize)]
struct SystemEngineUrl {
    #[serde(rename = "engineUrl")]
    engine_url: String,
}

#[derive(Debug, Deserialize)]
struct AccountResolve {
    id: String,
    #[serde(rename = "infraVersion", default = "default_infra_version")]
    infra_version: u32,
}

fn default_infra_version() -> u32 {
    2
}

impl Connection {
    /// Connect to a zero-auth local deployment.
    ///
    /// The endpoint is required; account, async-query and transaction
    /// operations answer [`Error::Unsupported`] on this variant.
    pub fn connect_core(
        options: ConnectionOptions,
        auth: Arc<dyn Authenticator>,
        http: reqwest::Client,
    ) -> Result<Self> {
        let endpoint = options.endpoint.as_deref().ok_or_else(|| {
            Error::Configuration(
                "an explicit endpoint is required for a core connection".to_string(),
            )
        })?;
        let endpoint = ensure_scheme(endpoint)?;
        let mut session = SessionState::new(endpoint, DEFAULT_OUTPUT_FORMAT);
        if let Some(database) = &options.database {
            session.set_parameter("database", database);
        }
        Ok(Self {
            http,
            auth,
            variant: ConnectionVariant::Core,
            api_endpoint: None,
            options,
            session: tokio::sync::Mutex::new(session),
            cancel: CancellationToken::new(),
        })
    }

    /// Connect against the legacy account/engine model.
    ///
    /// The account id is resolved by name, or by default-account lookup when
    /// no name is given, and cached. Endpoint priority: explicit endpoint,
    /// then engine-name lookup, then the database's default engine.
    pub async fn connect_v1(
        options: ConnectionOptions,
        auth: Arc<dyn Authenticator>,
        http: reqwest::Client,
    ) -> Result<Self> {
        let api_endpoint = ensure_scheme(&options.api_endpoint)?;
        let connection = Self {
            http,
            auth,
            variant: ConnectionVariant::V1 {
                account_name: options.account_name.clone(),
            },
            api_endpoint: Some(api_endpoint),
            options,
            session: tokio::sync::Mutex::new(SessionState::new(
                // Placeholder until resolution below.
                Url::parse("https://unresolved.invalid").map_err(|e| {
                    Error::Configuration(format!("invalid placeholder URL: {}", e))
                })?,
                DEFAULT_OUTPUT_FORMAT,
            )),
            cancel: CancellationToken::new(),
        };

        connection.resolve_account_id().await?;
        let endpoint = connection.v1_engine_endpoint().await?;
        {
            let mut session = connection.session.lock().await;
            session.set_endpoint(endpoint);
            if let Some(database) = &connection.options.database {
                session.set_parameter("database", database);
            }
        }
        Ok(connection)
    }

    /// Resolve this configuration's endpoint by the V1 priority order.
    async fn v1_engine_endpoint(&self) -> Result<Url> {
        let account_id = self.resolve_account_id().await?;
        if let Some(endpoint) = &self.options.endpoint {
            ensure_scheme(endpoint)
        } else if let Some(engine) = &self.options.engine_name {
            let path = format!("/core/v1/accounts/{}/engines:getURLByName", account_id);
            let url: EngineUrlByLookup = self
                .get_json(self.api_url(&path)?, &[("engine_name", engine.as_str())])
                .await?;
            ensure_scheme(&url.engine_url)
        } else if let Some(database) = &self.options.database {
            let path = format!(
                "/core/v1/accounts/{}/engines:getURLByDatabaseName",
                account_id
            );
            let url: EngineUrlByLookup = self
                .get_json(self.api_url(&path)?, &[("database_name", database.as_str())])
                .await?;
            ensure_scheme(&url.engine_url)
        } else {
            Err(Error::Configuration(
                "an endpoint, engine name or database is required".to_string(),
            ))
        }
    }

    /// Connect against the system-engine model.
    ///
    /// The system engine endpoint and account info are always resolved
    /// first. With an engine name the attached database is verified and the
    /// engine must be exactly "Running"; without one the system engine
    /// itself is the live destination and further negotiation happens
    /// through the session header protocol at query time.
    pub async fn connect_v2(
        options: ConnectionOptions,
        auth: Arc<dyn Authenticator>,
        http: reqwest::Client,
    ) -> Result<Self> {
        let account_name = options.account_name.clone().ok_or_else(|| {
            Error::Configuration("an account name is required for this connection".to_string())
        })?;
        let api_endpoint = ensure_scheme(&options.api_endpoint)?;

        let connection = Self {
            http,
            auth,
            variant: ConnectionVariant::V2 {
                account_name: account_name.clone(),
            },
            api_endpoint: Some(api_endpoint),
            options,
            session: tokio::sync::Mutex::new(SessionState::new(
                Url::parse("https://unresolved.invalid").map_err(|e| {
                    Error::Configuration(format!("invalid placeholder URL: {}", e))
                })?,
                DEFAULT_OUTPUT_FORMAT,
            )),
            cancel: CancellationToken::new(),
        };

        let system: SystemEngineUrl = connection
            .get_json(
                connection.api_url(&format!("/web/v3/account/{}/engineUrl", account_name))?,
                &[],
            )
            .await?;
        let account: AccountResolve = connection
            .get_json(
                connection.api_url(&format!("/web/v3/account/{}/resolve", account_name))?,
                &[],
            )
            .await?;
        let info = AccountInfo {
            id: account.id,
            infra_version: account.infra_version,
        };
        tracing::debug!(
            account = %info.id,
            infra_version = info.infra_version,
            "resolved system engine"
        );

        {
            let mut session = connection.session.lock().await;
            session.set_endpoint(ensure_scheme(&system.engine_url)?);
            // account_id travels with every request while the system engine
            // is the destination.
            session.set_parameter("account_id", &info.id);
            if let Some(database) = &connection.options.database {
                session.set_parameter("database", database);
            }
            session.set_account(info);
        }

        connection.apply_engine_selection().await?;
        Ok(connection)
    }

    /// Apply this configuration's engine/database selection to the session:
    /// verify access, require a running engine, and swap the destination
    /// from the system engine to the direct engine endpoint.
    async fn apply_engine_selection(&self) -> Result<()> {
        match (&self.options.engine_name, &self.options.database) {
            (Some(engine), database) => {
                let database = match database {
                    Some(database) => {
                        self.verify_database_access(database).await?;
                        database.clone()
                    }
                    None => {
                        let database = self.attached_database(engine).await?;
                        self.verify_database_access(&database).await?;
                        database
                    }
                };
                let endpoint = self.running_engine_url(engine, &database).await?;
                let mut session = self.session.lock().await;
                session.set_endpoint(endpoint);
                session.set_parameter("database", &database);
                // A direct engine endpoint is account-scoped already.
                session.remove_parameter("account_id");
            }
            (None, Some(database)) => {
                self.verify_database_access(database).await?;
            }
            (None, None) => {}
        }
        Ok(())
    }

    /// Re-run endpoint resolution for this connection's configuration and
    /// update the session to match; returns the resolved destination.
    ///
    /// Core connections have nothing to resolve and return the configured
    /// endpoint unchanged. On V2 the metadata queries go through the
    /// session's current destination.
    pub async fn resolve_engine_endpoint(&self) -> Result<Url> {
        match &self.variant {
            ConnectionVariant::Core => {}
            ConnectionVariant::V1 { .. } => {
                let endpoint = self.v1_engine_endpoint().await?;
                self.session.lock().await.set_endpoint(endpoint);
            }
            ConnectionVariant::V2 { .. } => self.apply_engine_selection().await?,
        }
        Ok(self.endpoint().await)
    }

    /// The resolution variant of this connection.
    pub fn variant(&self) -> &ConnectionVariant {
        &self.variant
    }

    /// Current destination endpoint.
    pub async fn endpoint(&self) -> Url {
        self.session.lock().await.endpoint().clone()
    }

    /// Current session parameters.
    pub async fn parameters(&self) -> BTreeMap<String, String> {
        self.session.lock().await.parameters().clone()
    }

    /// Resolve the account id for this connection, caching it for reuse.
    ///
    /// Answers [`Error::Unsupported`] on a core connection, which has no
    /// account model at all.
    pub async fn resolve_account_id(&self) -> Result<String> {
        if let Some(account) = self.session.lock().await.account() {
            return Ok(account.id.clone());
        }

        let info = match &self.variant {
            ConnectionVariant::Core => {
                return Err(Error::Unsupported {
                    operation: "resolve_account_id",
                });
            }
            ConnectionVariant::V1 { account_name } => {
                let id = match account_name {
                    Some(name) => {
                        let resolved: AccountIdByName = self
                            .get_json(
                                self.api_url("/iam/v2/accounts:getIdByName")?,
                                &[("account_name", name.as_str())],
                            )
                            .await?;
                        resolved.account_id
                    }
                    None => {
                        let resolved: DefaultAccount =
                            self.get_json(self.api_url("/iam/v2/account")?, &[]).await?;
                        resolved.account.id
                    }
                };
                AccountInfo {
                    id,
                    infra_version: 1,
                }
            }
            ConnectionVariant::V2 { account_name } => {
                let resolved: AccountResolve = self
                    .get_json(
                        self.api_url(&format!("/web/v3/account/{}/resolve", account_name))?,
                        &[],
                    )
                    .await?;
                AccountInfo {
                    id: resolved.id,
                    infra_version: resolved.infra_version,
                }
            }
        };

        let id = info.id.clone();
        self.session.lock().await.set_account(info);
        Ok(id)
    }

    /// Execute a query and buffer its complete result.
    pub async fn execute(&self, sql: &str, options: ExecuteOptions) -> Result<Statement> {
        let response = self.send_query(sql, &options, false).await?;
        let headers = response.headers().clone();
        self.apply_session_headers(&headers).await?;
        let body = self.guard(response.text()).await?;
        Statement::decode(&body, &options)
    }

    /// Execute a query and return its result as a lazily-consumed stream.
    ///
    /// The response body is handed over undecoded; rows flow through a
    /// bounded queue with backpressure toward the transport.
    pub async fn execute_stream(
        &self,
        sql: &str,
        options: ExecuteOptions,
    ) -> Result<StreamStatement> {
        let response = self.send_query(sql, &options, true).await?;
        let headers = response.headers().clone();
        self.apply_session_headers(&headers).await?;
        Ok(StreamStatement::new(response, options))
    }

    /// Cancel every in-flight request on this connection.
    pub fn close(&self) {
        tracing::debug!("closing connection, cancelling in-flight requests");
        self.cancel.cancel();
    }

    async fn send_query(
        &self,
        sql: &str,
        options: &ExecuteOptions,
        streaming: bool,
    ) -> Result<reqwest::Response> {
        let query = expand_query(sql, options)?;
        let mut extra = options.settings.clone();
        if streaming {
            extra
                .entry("output_format".to_string())
                .or_insert_with(|| STREAMING_OUTPUT_FORMAT.to_string());
        }
        let url = self.session.lock().await.request_url(&extra);
        tracing::debug!(url = %url, streaming, "executing query");
        self.send_with_reauth(Method::POST, url, Some(query)).await
    }

    /// Send one request; a 401/403 triggers exactly one re-authentication
    /// plus one retry of the original request, never more.
    async fn send_with_reauth(
        &self,
        method: Method,
        url: Url,
        body: Option<String>,
    ) -> Result<reqwest::Response> {
        let mut reauthenticated = false;
        loop {
            let mut headers = HeaderMap::new();
            self.auth.add_auth_headers(&mut headers).await?;
            let mut request = self.http.request(method.clone(), url.clone()).headers(headers);
            if let Some(body) = &body {
                request = request.body(body.clone());
            }
            let response = self.guard(request.send()).await?;

            let status = response.status();
            if (status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN)
                && !reauthenticated
            {
                reauthenticated = true;
                tracing::debug!(%status, "request rejected, re-authenticating once");
                self.auth.re_authenticate().await?;
                continue;
            }
            if !status.is_success() {
                let text = self.guard(response.text()).await.unwrap_or_default();
                if let Ok(doc) = serde_json::from_str::<ErrorsDocument>(&text) {
                    if !doc.errors.is_empty() {
                        return Err(CompositeError::new(doc.errors).into());
                    }
                }
                return Err(Error::Connection(format!(
                    "server returned {}: {}",
                    status,
                    text.trim()
                )));
            }
            return Ok(response);
        }
    }

    /// Run a future unless this connection is closed first.
    async fn guard<F, T, E>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, E>>,
        Error: From<E>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = fut => result.map_err(Error::from),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, query: &[(&str, &str)]) -> Result<T> {
        let mut url = url;
        for (key, value) in query {
            url.query_pairs_mut().append_pair(key, value);
        }
        let response = self.send_with_reauth(Method::GET, url, None).await?;
        let text = self.guard(response.text()).await?;
        Ok(serde_json::from_str(&text)?)
    }

    fn api_url(&self, path: &str) -> Result<Url> {
        let base = self.api_endpoint.as_ref().ok_or_else(|| {
            Error::Configuration("this connection has no resolution endpoint".to_string())
        })?;
        base.join(path)
            .map_err(|e| Error::Configuration(format!("invalid resolution path '{}': {}", path, e)))
    }

    /// Apply the session header protocol for one response, resolving the
    /// account id first when a pending endpoint update requires it.
    async fn apply_session_headers(&self, headers: &HeaderMap) -> Result<()> {
        if SessionState::endpoint_update_needs_account(headers) {
            let unresolved = self.session.lock().await.account().is_none();
            if unresolved {
                match self.resolve_account_id().await {
                    Ok(_) => {}
                    // No account model: the mismatch check below reports it.
                    Err(Error::Unsupported { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        self.session.lock().await.apply_response_headers(headers)
    }

    /// Fail unless the connected credentials can see `database`.
    async fn verify_database_access(&self, database: &str) -> Result<()> {
        let sql = format!(
            "SELECT database_name FROM information_schema.databases WHERE database_name = '{}'",
            escape_literal(database)
        );
        let result = self.execute(&sql, ExecuteOptions::default()).await?.fetch_result();
        if result.data.is_empty() {
            return Err(Error::Connection(format!(
                "database '{}' does not exist or is not authorized",
                database
            )));
        }
        Ok(())
    }

    /// Database an engine is attached to, from the system engine's metadata.
    async fn attached_database(&self, engine: &str) -> Result<String> {
        let sql = format!(
            "SELECT attached_to FROM information_schema.engines WHERE engine_name = '{}'",
            escape_literal(engine)
        );
        let result = self.execute(&sql, ExecuteOptions::default()).await?.fetch_result();
        let row = result.data.first().ok_or_else(|| {
            Error::Connection(format!("engine '{}' not found", engine))
        })?;
        match row.get(0).and_then(|v| v.as_text()) {
            Some(database) => Ok(database.to_string()),
            None => Err(Error::Connection(format!(
                "engine '{}' is not attached to any database",
                engine
            ))),
        }
    }

    /// Endpoint of a running engine attached to `database`. Absent,
    /// not-attached and stopped engines are three distinguishable failures.
    async fn running_engine_url(&self, engine: &str, database: &str) -> Result<Url> {
        let sql = format!(
            "SELECT url, attached_to, status FROM information_schema.engines \
             WHERE engine_name = '{}'",
            escape_literal(engine)
        );
        let result = self.execute(&sql, ExecuteOptions::default()).await?.fetch_result();
        let row = result.data.first().ok_or_else(|| {
            Error::Connection(format!("engine '{}' not found", engine))
        })?;

        let attached = row.get(1).and_then(|v| v.as_text()).unwrap_or_default();
        if attached != database {
            return Err(Error::Connection(format!(
                "engine '{}' is not attached to database '{}'",
                engine, database
            )));
        }
        let status = row.get(2).and_then(|v| v.as_text()).unwrap_or_default();
        if status != "Running" {
            return Err(Error::Connection(format!(
                "engine '{}' is not running",
                engine
            )));
        }
        let url = row.get(0).and_then(|v| v.as_text()).ok_or_else(|| {
            Error::Connection(format!("engine '{}' reported no endpoint", engine))
        })?;
        ensure_scheme(url)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The authenticator is deliberately omitted: it may hold credentials.
        f.debug_struct("Connection")
            .field("variant", &self.variant)
            .field("api_endpoint", &self.api_endpoint)
            .finish_non_exhaustive()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Double single quotes so names can be inlined into metadata queries.
fn escape_literal(raw: &str) -> String {
    raw.replace('\'', "''")
}

/// Parse an endpoint string; a missing scheme defaults to https.
fn ensure_scheme(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };
    Url::parse(&candidate)
        .map_err(|e| Error::Configuration(format!("invalid endpoint '{}': {}", raw, e)))
}
