mod browser;
mod date_range;
mod error;
mod form;

use std::collections::BTreeMap;
use std::fmt;

use reqwest::header::{ACCEPT, COOKIE};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ClientSettings;

pub use browser::{Browser, HttpBrowser, Page, StoredCookie};
pub use date_range::{
    is_valid_date_format, parse_date, same_year, DateRange, DateRangeError, DATE_FORMAT,
};
pub use error::{PortalError, PortalResult};
pub use form::{Form, FormField, FormMethod};

use error::excerpt;

pub const LOGIN_URL: &str =
    "https://www.acesso.gov.pt/jsp/loginRedirectForm.jsp?path=painelAdquirente.action&partID=EFPF";
pub const CONFIRMATION_URL: &str =
    "https://faturas.portaldasfinancas.gov.pt/painelAdquirente.action";
pub const INVOICES_URL: &str =
    "https://faturas.portaldasfinancas.gov.pt/json/obterDocumentosAdquirente.action";

pub const LOGIN_FORM: &str = "loginForm";
pub const CONFIRMATION_FORM: &str = "form";

/// `ambitoAquisicaoFilter` value selecting every acquisition type.
pub const SCOPE_ALL: &str = "TODOS";

/// Portal URLs used by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalEndpoints {
    pub login: String,
    pub confirmation: String,
    pub invoices: String,
}

impl Default for PortalEndpoints {
    fn default() -> Self {
        Self {
            login: LOGIN_URL.to_string(),
            confirmation: CONFIRMATION_URL.to_string(),
            invoices: INVOICES_URL.to_string(),
        }
    }
}

/// What to do when the date range fails validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InvalidRangePolicy {
    /// Skip the login and still request invoices, without session cookies.
    /// The portal answers such a request as an anonymous visitor.
    #[default]
    SkipLogin,
    /// Fail with [`PortalError::InvalidDateRange`] before touching the network.
    Reject,
}

/// NIF and password for the portal login.
#[derive(Clone)]
pub struct Credentials {
    nif: String,
    password: String,
}

impl Credentials {
    pub fn new(nif: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            nif: nif.into(),
            password: password.into(),
        }
    }

    pub fn nif(&self) -> &str {
        &self.nif
    }

    /// NIF with all but the last three characters hidden, for log lines.
    pub fn masked_nif(&self) -> String {
        let visible = self.nif.chars().count().saturating_sub(3);
        self.nif
            .chars()
            .enumerate()
            .map(|(i, c)| if i < visible { '*' } else { c })
            .collect()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("nif", &self.nif)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Cookies harvested from a completed login, replayed on the invoice request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthenticatedSession {
    cookies: BTreeMap<String, String>,
}

impl AuthenticatedSession {
    /// A session with no cookies at all.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Flattens the browser store to name → value. When two domains hold a cookie
    /// with the same name the later one wins.
    pub fn from_cookies(cookies: Vec<StoredCookie>) -> PortalResult<Self> {
        let mut map = BTreeMap::new();
        for cookie in cookies {
            if cookie.name.trim().is_empty() || cookie.name.contains(['=', ';']) {
                return Err(PortalError::MalformedCookie {
                    domain: cookie.domain,
                    name: cookie.name,
                });
            }
            if let Some(previous) = map.insert(cookie.name.clone(), cookie.value) {
                debug!(
                    name = %cookie.name,
                    domain = %cookie.domain,
                    replaced_len = previous.len(),
                    "Cookie name seen on more than one domain"
                );
            }
        }
        Ok(Self { cookies: map })
    }

    pub fn cookies(&self) -> &BTreeMap<String, String> {
        &self.cookies
    }

    pub fn is_anonymous(&self) -> bool {
        self.cookies.is_empty()
    }

    /// `Cookie` header value, `None` when there is nothing to send.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// One invoice query against the e-Fatura portal: credentials plus a date range.
///
/// Dates are kept as given and only checked when invoices are fetched. Build a
/// new session for every query.
pub struct PortalSession {
    credentials: Credentials,
    range: DateRange,
    endpoints: PortalEndpoints,
    policy: InvalidRangePolicy,
    settings: ClientSettings,
    http: reqwest::Client,
}

impl PortalSession {
    pub fn new(
        nif: impl Into<String>,
        password: impl Into<String>,
        start: impl Into<String>,
        end: impl Into<String>,
    ) -> PortalResult<Self> {
        Self::with_settings(
            Credentials::new(nif, password),
            DateRange::new(start, end),
            ClientSettings::default(),
        )
    }

    pub fn with_settings(
        credentials: Credentials,
        range: DateRange,
        settings: ClientSettings,
    ) -> PortalResult<Self> {
        let http = settings
            .client_builder()
            .build()
            .map_err(|e| PortalError::Config(format!("Unable to construct reqwest client: {e}")))?;

        Ok(Self {
            credentials,
            range,
            endpoints: PortalEndpoints::default(),
            policy: InvalidRangePolicy::default(),
            settings,
            http,
        })
    }

    pub fn with_endpoints(mut self, endpoints: PortalEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_policy(mut self, policy: InvalidRangePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn date_range(&self) -> &DateRange {
        &self.range
    }

    pub fn policy(&self) -> InvalidRangePolicy {
        self.policy
    }

    /// Logs in (when the range is valid) and returns the portal's invoice JSON.
    pub async fn fetch_invoices(&self) -> PortalResult<Value> {
        let session = if self.should_login()? {
            let browser = HttpBrowser::new(&self.settings)?;
            self.login(&browser).await?
        } else {
            AuthenticatedSession::anonymous()
        };
        self.request_invoices(&session).await
    }

    /// Same as [`PortalSession::fetch_invoices`] with the login driven through `browser`.
    pub async fn fetch_invoices_with<B: Browser>(&self, browser: &B) -> PortalResult<Value> {
        let session = if self.should_login()? {
            self.login(browser).await?
        } else {
            AuthenticatedSession::anonymous()
        };
        self.request_invoices(&session).await
    }

    fn should_login(&self) -> PortalResult<bool> {
        match self.range.validate() {
            Ok(()) => Ok(true),
            Err(reason) => match self.policy {
                InvalidRangePolicy::SkipLogin => {
                    warn!(
                        start = self.range.start(),
                        end = self.range.end(),
                        %reason,
                        "Skipping login; invoices will be requested without session cookies"
                    );
                    Ok(false)
                }
                InvalidRangePolicy::Reject => Err(reason.into()),
            },
        }
    }

    /// Drives the login form and the confirmation form, then harvests the
    /// browser's cookies.
    pub async fn login<B: Browser>(&self, browser: &B) -> PortalResult<AuthenticatedSession> {
        info!(nif = %self.credentials.masked_nif(), "Logging in to e-Fatura");

        let login_page = browser.fetch_page(&self.endpoints.login).await?;
        let login_form = login_page.find_form(LOGIN_FORM)?;

        let username_field = login_form
            .username_field()
            .ok_or_else(|| PortalError::FieldNotFound {
                form: LOGIN_FORM.to_string(),
                field: "username".to_string(),
            })?
            .to_string();
        let password_field = login_form
            .password_field()
            .ok_or_else(|| PortalError::FieldNotFound {
                form: LOGIN_FORM.to_string(),
                field: "password".to_string(),
            })?
            .to_string();
        debug!(%username_field, %password_field, "Discovered login fields");

        browser
            .submit_form(
                &login_form,
                &[
                    (username_field.as_str(), self.credentials.nif.as_str()),
                    (password_field.as_str(), self.credentials.password.as_str()),
                ],
            )
            .await?;

        let confirmation_page = browser.fetch_page(&self.endpoints.confirmation).await?;
        let confirmation_form = confirmation_page.find_form(CONFIRMATION_FORM)?;
        browser.submit_form(&confirmation_form, &[]).await?;

        let session = AuthenticatedSession::from_cookies(browser.cookies())?;
        info!(cookies = session.cookies().len(), "✅ Portal session established");
        Ok(session)
    }

    /// Requests the invoice JSON for this session's range with `session`'s cookies.
    pub async fn request_invoices(&self, session: &AuthenticatedSession) -> PortalResult<Value> {
        let mut request = self
            .http
            .get(&self.endpoints.invoices)
            .query(&[
                ("dataInicioFilter", self.range.start()),
                ("dataFimFilter", self.range.end()),
                ("ambitoAquisicaoFilter", SCOPE_ALL),
            ])
            .header(ACCEPT, "application/json");
        if let Some(cookie) = session.cookie_header() {
            request = request.header(COOKIE, cookie);
        }

        info!(
            start = self.range.start(),
            end = self.range.end(),
            anonymous = session.is_anonymous(),
            "Requesting invoices"
        );

        let response = request.send().await?;
        let status = response.status();
        let url = response.url().to_string();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(PortalError::HttpStatus {
                url,
                status,
                message: excerpt(&body),
            });
        }

        let invoices: Value = serde_json::from_str(&body)?;
        debug!(bytes = body.len(), "Invoice payload decoded");
        Ok(invoices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use reqwest::StatusCode;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use url::Url;

    const LOGIN_PATH: &str = "/login";
    const CONFIRM_PATH: &str = "/painelAdquirente.action";
    const INVOICES_PATH: &str = "/json/obterDocumentosAdquirente.action";

    const LOGIN_HTML: &str = r#"<html><body>
        <form name="loginForm" method="post" action="/login/submit">
          <input type="hidden" name="partID" value="EFPF">
          <input type="text" name="username">
          <input type="password" name="password">
        </form></body></html>"#;
    const CONFIRM_HTML: &str = r#"<html><body>
        <form name="form" method="post" action="/painelAdquirente.action">
          <input type="hidden" name="ticket" value="t-1">
        </form></body></html>"#;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Fetch(String),
        Submit(String, Vec<(String, String)>),
    }

    /// Serves fixture HTML by URL and records every call.
    struct FixtureBrowser {
        pages: HashMap<String, String>,
        cookies: Vec<StoredCookie>,
        calls: Mutex<Vec<Call>>,
    }

    impl FixtureBrowser {
        fn new(endpoints: &PortalEndpoints, login_html: &str, confirm_html: &str) -> Self {
            let mut pages = HashMap::new();
            pages.insert(endpoints.login.clone(), login_html.to_string());
            pages.insert(endpoints.confirmation.clone(), confirm_html.to_string());
            Self {
                pages,
                cookies: vec![
                    cookie("acesso.gov.pt", "sessionId", "abc"),
                    cookie("faturas.portaldasfinancas.gov.pt", "token", "xyz"),
                ],
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Browser for FixtureBrowser {
        async fn fetch_page(&self, url: &str) -> PortalResult<Page> {
            self.calls.lock().unwrap().push(Call::Fetch(url.to_string()));
            let body = self.pages.get(url).cloned().unwrap_or_default();
            Ok(Page::new(Url::parse(url)?, StatusCode::OK, body))
        }

        async fn submit_form(&self, form: &Form, fields: &[(&str, &str)]) -> PortalResult<Page> {
            let mut filled = form.clone();
            for (name, value) in fields {
                filled.set(name, value)?;
            }
            self.calls
                .lock()
                .unwrap()
                .push(Call::Submit(filled.name().to_string(), filled.pairs()));
            Ok(Page::new(filled.action().clone(), StatusCode::OK, String::new()))
        }

        fn cookies(&self) -> Vec<StoredCookie> {
            self.cookies.clone()
        }
    }

    fn cookie(domain: &str, name: &str, value: &str) -> StoredCookie {
        StoredCookie {
            domain: domain.to_string(),
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    fn endpoints(server: &MockServer) -> PortalEndpoints {
        PortalEndpoints {
            login: server.url(LOGIN_PATH),
            confirmation: server.url(CONFIRM_PATH),
            invoices: server.url(INVOICES_PATH),
        }
    }

    fn session(start: &str, end: &str, endpoints: PortalEndpoints) -> PortalSession {
        PortalSession::new("123456789", "s3cret", start, end)
            .unwrap()
            .with_endpoints(endpoints)
    }

    #[tokio::test]
    async fn test_valid_range_logs_in_and_replays_cookies() {
        let server = MockServer::start_async().await;
        let invoices = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(INVOICES_PATH)
                    .query_param("dataInicioFilter", "2017-01-01")
                    .query_param("dataFimFilter", "2017-03-01")
                    .query_param("ambitoAquisicaoFilter", "TODOS")
                    .header("cookie", "sessionId=abc; token=xyz");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"[{"id":1,"amount":10.5}]"#);
            })
            .await;

        let endpoints = endpoints(&server);
        let browser = FixtureBrowser::new(&endpoints, LOGIN_HTML, CONFIRM_HTML);
        let portal = session("2017-01-01", "2017-03-01", endpoints.clone());

        let value = portal.fetch_invoices_with(&browser).await.unwrap();

        invoices.assert_async().await;
        assert_eq!(value, serde_json::json!([{"id": 1, "amount": 10.5}]));
        assert_eq!(value[0]["amount"].as_f64(), Some(10.5));
        assert!(value[0]["id"].is_u64());

        assert_eq!(
            browser.calls(),
            vec![
                Call::Fetch(endpoints.login.clone()),
                Call::Submit(
                    "loginForm".into(),
                    vec![
                        ("partID".into(), "EFPF".into()),
                        ("username".into(), "123456789".into()),
                        ("password".into(), "s3cret".into()),
                    ]
                ),
                Call::Fetch(endpoints.confirmation.clone()),
                Call::Submit("form".into(), vec![("ticket".into(), "t-1".into())]),
            ]
        );
    }

    #[tokio::test]
    async fn test_cross_year_range_skips_login() {
        let server = MockServer::start_async().await;
        let invoices = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(INVOICES_PATH)
                    .query_param("dataInicioFilter", "2017-01-01")
                    .query_param("dataFimFilter", "2018-01-01")
                    .header_missing("cookie");
                then.status(200).body("[]");
            })
            .await;

        let endpoints = endpoints(&server);
        let browser = FixtureBrowser::new(&endpoints, LOGIN_HTML, CONFIRM_HTML);
        let portal = session("2017-01-01", "2018-01-01", endpoints);

        let value = portal.fetch_invoices_with(&browser).await.unwrap();

        invoices.assert_async().await;
        assert_eq!(value, serde_json::json!([]));
        assert!(browser.calls().is_empty(), "login must not be attempted");
    }

    #[tokio::test]
    async fn test_unparseable_start_skips_login() {
        let server = MockServer::start_async().await;
        let invoices = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(INVOICES_PATH)
                    .query_param("dataInicioFilter", "not-a-date")
                    .header_missing("cookie");
                then.status(200).body("{}");
            })
            .await;

        let endpoints = endpoints(&server);
        let browser = FixtureBrowser::new(&endpoints, LOGIN_HTML, CONFIRM_HTML);
        let portal = session("not-a-date", "2017-01-01", endpoints);

        portal.fetch_invoices_with(&browser).await.unwrap();

        invoices.assert_async().await;
        assert!(browser.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reject_policy_fails_before_any_request() {
        let server = MockServer::start_async().await;
        let endpoints = endpoints(&server);
        let browser = FixtureBrowser::new(&endpoints, LOGIN_HTML, CONFIRM_HTML);
        let portal =
            session("2017-01-01", "2018-01-01", endpoints).with_policy(InvalidRangePolicy::Reject);

        let err = portal.fetch_invoices_with(&browser).await.unwrap_err();

        assert!(matches!(
            err,
            PortalError::InvalidDateRange(DateRangeError::DifferentYears { .. })
        ));
        assert!(browser.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_login_form_is_fatal() {
        let server = MockServer::start_async().await;
        let endpoints = endpoints(&server);
        let browser = FixtureBrowser::new(
            &endpoints,
            "<html><body>maintenance</body></html>",
            CONFIRM_HTML,
        );
        let portal = session("2017-01-01", "2017-03-01", endpoints.clone());

        let err = portal.fetch_invoices_with(&browser).await.unwrap_err();

        assert!(matches!(err, PortalError::FormNotFound { ref form, .. } if form == "loginForm"));
        assert_eq!(browser.calls(), vec![Call::Fetch(endpoints.login)]);
    }

    #[tokio::test]
    async fn test_missing_confirmation_form_is_fatal() {
        let server = MockServer::start_async().await;
        let endpoints = endpoints(&server);
        let browser = FixtureBrowser::new(&endpoints, LOGIN_HTML, "<html></html>");
        let portal = session("2017-01-01", "2017-03-01", endpoints);

        let err = portal.fetch_invoices_with(&browser).await.unwrap_err();

        assert!(matches!(err, PortalError::FormNotFound { ref form, .. } if form == "form"));
        assert_eq!(browser.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_login_form_without_password_field() {
        let server = MockServer::start_async().await;
        let endpoints = endpoints(&server);
        let browser = FixtureBrowser::new(
            &endpoints,
            r#"<form name="loginForm"><input name="username"></form>"#,
            CONFIRM_HTML,
        );
        let portal = session("2017-01-01", "2017-03-01", endpoints);

        let err = portal.fetch_invoices_with(&browser).await.unwrap_err();

        assert!(matches!(err, PortalError::FieldNotFound { ref field, .. } if field == "password"));
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(INVOICES_PATH);
                then.status(500).body("Erro interno");
            })
            .await;

        let portal = session("2017-01-01", "2017-03-01", endpoints(&server));

        let err = portal
            .request_invoices(&AuthenticatedSession::anonymous())
            .await
            .unwrap_err();

        match err {
            PortalError::HttpStatus {
                status, message, ..
            } => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(message, "Erro interno");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_json_is_an_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(INVOICES_PATH);
                then.status(200).body("<html>login</html>");
            })
            .await;

        let portal = session("2017-01-01", "2017-03-01", endpoints(&server));

        let err = portal
            .request_invoices(&AuthenticatedSession::anonymous())
            .await
            .unwrap_err();

        assert!(matches!(err, PortalError::InvalidJson(_)));
    }

    #[test]
    fn test_session_from_cookies() {
        let session = AuthenticatedSession::from_cookies(vec![
            cookie("a.test", "token", "xyz"),
            cookie("b.test", "sessionId", "abc"),
        ])
        .unwrap();

        assert_eq!(session.cookies().len(), 2);
        assert_eq!(session.cookies()["sessionId"], "abc");
        assert_eq!(session.cookie_header().as_deref(), Some("sessionId=abc; token=xyz"));
        assert!(!session.is_anonymous());
    }

    #[test]
    fn test_session_later_domain_wins() {
        let session = AuthenticatedSession::from_cookies(vec![
            cookie("a.test", "JSESSIONID", "first"),
            cookie("b.test", "JSESSIONID", "second"),
        ])
        .unwrap();
        assert_eq!(session.cookie_header().as_deref(), Some("JSESSIONID=second"));
    }

    #[test]
    fn test_session_rejects_malformed_cookie_names() {
        for name in ["", "  ", "a=b", "a;b"] {
            let err = AuthenticatedSession::from_cookies(vec![cookie("a.test", name, "v")])
                .unwrap_err();
            assert!(matches!(err, PortalError::MalformedCookie { .. }), "{name:?}");
        }
    }

    #[test]
    fn test_anonymous_session_sends_no_cookie_header() {
        let session = AuthenticatedSession::anonymous();
        assert!(session.is_anonymous());
        assert_eq!(session.cookie_header(), None);
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let rendered = format!("{:?}", Credentials::new("123456789", "s3cret"));
        assert!(rendered.contains("123456789"));
        assert!(!rendered.contains("s3cret"));
    }

    #[test]
    fn test_masked_nif_hides_all_but_last_digits() {
        assert_eq!(Credentials::new("123456789", "x").masked_nif(), "******789");
        assert_eq!(Credentials::new("12", "x").masked_nif(), "12");
        assert_eq!(Credentials::new("", "x").masked_nif(), "");
    }

    #[test]
    fn test_default_endpoints() {
        let endpoints = PortalEndpoints::default();
        assert_eq!(endpoints.login, LOGIN_URL);
        assert_eq!(endpoints.confirmation, CONFIRMATION_URL);
        assert_eq!(endpoints.invoices, INVOICES_URL);
        assert_eq!(
            PortalSession::new("1", "2", "x", "y").unwrap().policy(),
            InvalidRangePolicy::SkipLogin
        );
    }
}
