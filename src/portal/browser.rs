use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use reqwest::cookie::Jar;
use reqwest::header::LOCATION;
use reqwest::{redirect, StatusCode};
use tracing::{debug, info};
use url::Url;

use super::error::{excerpt, PortalError, PortalResult};
use super::form::{Form, FormMethod};
use crate::config::ClientSettings;

const MAX_REDIRECTS: usize = 10;

/// A fetched HTML document together with the URL it was finally served from.
#[derive(Debug, Clone)]
pub struct Page {
    url: Url,
    status: StatusCode,
    body: String,
}

impl Page {
    pub fn new(url: Url, status: StatusCode, body: String) -> Self {
        Self { url, status, body }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn find_form(&self, name: &str) -> PortalResult<Form> {
        Form::find(&self.body, &self.url, name)
    }
}

/// A cookie held by the browser, read through structured accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCookie {
    pub domain: String,
    pub name: String,
    pub value: String,
}

/// What the login flow needs from a browser. Implemented over HTTP by
/// [`HttpBrowser`]; tests drive the flow with fixture pages instead.
#[allow(async_fn_in_trait)]
pub trait Browser {
    async fn fetch_page(&self, url: &str) -> PortalResult<Page>;

    /// Submits `form` with `fields` overriding the values found in the markup.
    async fn submit_form(&self, form: &Form, fields: &[(&str, &str)]) -> PortalResult<Page>;

    /// Every cookie currently held by the browser's store.
    fn cookies(&self) -> Vec<StoredCookie>;
}

#[derive(Debug, Clone)]
enum Navigation {
    Get(Url),
    Post(Url, Vec<(String, String)>),
}

impl Navigation {
    fn url(&self) -> &Url {
        match self {
            Navigation::Get(url) | Navigation::Post(url, _) => url,
        }
    }

    fn redirected(self, status: StatusCode, next: Url) -> Self {
        let keeps_method =
            status == StatusCode::TEMPORARY_REDIRECT || status == StatusCode::PERMANENT_REDIRECT;
        match self {
            Navigation::Post(_, body) if keeps_method => Navigation::Post(next, body),
            _ => Navigation::Get(next),
        }
    }
}

/// Cookie-keeping HTTP browser used for the portal login.
///
/// The reqwest jar scopes cookies by domain and path when they are sent back.
/// Redirects are followed here rather than by reqwest so every `Set-Cookie` on
/// an intermediate 3xx also lands in the structured record behind [`Browser::cookies`].
pub struct HttpBrowser {
    http: reqwest::Client,
    store: Mutex<Vec<StoredCookie>>,
}

impl HttpBrowser {
    pub fn new(settings: &ClientSettings) -> PortalResult<Self> {
        let jar = Arc::new(Jar::default());
        let http = settings
            .client_builder()
            .cookie_provider(jar)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| PortalError::Config(format!("Unable to construct browser client: {e}")))?;

        Ok(Self {
            http,
            store: Mutex::new(Vec::new()),
        })
    }

    async fn navigate(&self, start: Navigation) -> PortalResult<Page> {
        let origin = start.url().to_string();
        let mut current = start;

        for _ in 0..=MAX_REDIRECTS {
            let request = match &current {
                Navigation::Get(url) => self.http.get(url.clone()),
                Navigation::Post(url, body) => self.http.post(url.clone()).form(body),
            };
            let response = request.send().await?;
            self.record_cookies(&response);

            let status = response.status();
            let url = current.url().clone();
            debug!(%url, %status, "Browser response");

            if status.is_redirection() {
                if let Some(location) = response.headers().get(LOCATION) {
                    let location = String::from_utf8_lossy(location.as_bytes()).into_owned();
                    let next = url.join(location.trim())?;
                    debug!(from = %url, to = %next, "Following redirect");
                    current = current.redirected(status, next);
                    continue;
                }
            }

            let body = response.text().await?;
            if !status.is_success() {
                return Err(PortalError::HttpStatus {
                    url: url.to_string(),
                    status,
                    message: excerpt(&body),
                });
            }
            return Ok(Page::new(url, status, body));
        }

        Err(PortalError::TooManyRedirects {
            url: origin,
            limit: MAX_REDIRECTS,
        })
    }

    fn record_cookies(&self, response: &reqwest::Response) {
        let host = response.url().host_str().unwrap_or_default().to_string();
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);

        for cookie in response.cookies() {
            let domain = cookie
                .domain()
                .map(|d| d.trim_start_matches('.').to_string())
                .unwrap_or_else(|| host.clone());
            let name = cookie.name().to_string();

            store.retain(|c| !(c.domain == domain && c.name == name));

            let expired = cookie.max_age() == Some(Duration::ZERO)
                || cookie
                    .expires()
                    .map(|at| at <= SystemTime::now())
                    .unwrap_or(false);
            if expired {
                debug!(%domain, %name, "Cookie cleared by server");
                continue;
            }

            debug!(%domain, %name, "Cookie stored");
            store.push(StoredCookie {
                domain,
                name,
                value: cookie.value().to_string(),
            });
        }
    }
}

impl Browser for HttpBrowser {
    async fn fetch_page(&self, url: &str) -> PortalResult<Page> {
        let url = Url::parse(url)?;
        info!(%url, "Fetching page");
        self.navigate(Navigation::Get(url)).await
    }

    async fn submit_form(&self, form: &Form, fields: &[(&str, &str)]) -> PortalResult<Page> {
        let mut form = form.clone();
        for (name, value) in fields {
            form.set(name, value)?;
        }

        info!(form = form.name(), action = %form.action(), "Submitting form");
        let pairs = form.pairs();
        let navigation = match form.method() {
            FormMethod::Get => {
                let mut target = form.action().clone();
                target.set_query(None);
                if !pairs.is_empty() {
                    target.query_pairs_mut().extend_pairs(pairs.iter());
                }
                Navigation::Get(target)
            }
            FormMethod::Post => Navigation::Post(form.action().clone(), pairs),
        };
        self.navigate(navigation).await
    }

    fn cookies(&self) -> Vec<StoredCookie> {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
