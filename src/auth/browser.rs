/// Browser launchers: the user's default browser, or a headless client for automated runs
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};
use url::Url;

use super::AuthError;

static FORM_RE: once_cell::sync::Lazy<Regex> =
    once_cell::sync::Lazy::new(|| Regex::new(r"(?is)<form\b([^>]*)>(.*?)</form>").expect("valid form pattern"));

static INPUT_RE: once_cell::sync::Lazy<Regex> =
    once_cell::sync::Lazy::new(|| Regex::new(r"(?is)<input\b([^>]*)>").expect("valid input pattern"));

static ATTRIBUTE_RE: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| {
    Regex::new(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid attribute pattern")
});

/// Username/password used by the headless browser to fill the provider's login form
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Opens the authorize URL. Completion is signalled by the callback listener, not by `open`.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn open(&self, url: &str, credentials: Option<&Credentials>) -> Result<(), AuthError>;
}

/// Hands the URL to the operating system's default browser.
pub struct SystemBrowser;

#[async_trait]
impl BrowserLauncher for SystemBrowser {
    async fn open(&self, url: &str, _credentials: Option<&Credentials>) -> Result<(), AuthError> {
        println!("\n📱 Opening browser...\n");
        println!("   {}\n", url);
        println!("If the browser does not open, copy the URL above into it.\n");

        let url = url.to_string();
        launch_blocking(move || opener::open(&url)).await
    }
}

/// Run a launcher command off the runtime; xdg-open and friends may block until the browser starts.
async fn launch_blocking<F, E>(launch: F) -> Result<(), AuthError>
where
    F: FnOnce() -> Result<(), E> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    tokio::task::spawn_blocking(launch)
        .await
        .map_err(|e| AuthError::BrowserLaunch(format!("browser task failed: {}", e)))?
        .map_err(|e| AuthError::BrowserLaunch(format!("failed to open browser: {}", e)))
}

/// Programmatic stand-in for a human: fetches the authorize URL, submits the
/// login form with the supplied credentials and follows the redirect chain
/// back to the loopback listener.
pub struct HeadlessBrowser {
    timeout: Duration,
}

impl Default for HeadlessBrowser {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl HeadlessBrowser {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn client(&self) -> Result<reqwest::Client, AuthError> {
        reqwest::Client::builder()
            .cookie_store(true)
            .timeout(self.timeout)
            .build()
            .map_err(|e| AuthError::BrowserLaunch(format!("failed to build HTTP client: {}", e)))
    }
}

#[async_trait]
impl BrowserLauncher for HeadlessBrowser {
    async fn open(&self, url: &str, credentials: Option<&Credentials>) -> Result<(), AuthError> {
        let client = self.client()?;
        let callback = callback_target(url);

        let res = client
            .get(url)
            .send()
            .await
            .map_err(|e| AuthError::BrowserLaunch(format!("GET {} failed: {}", url, e)))?;

        // Provider redirected straight back (existing session or an error redirect)
        if reached_callback(res.url(), callback.as_ref()) {
            debug!("Provider redirected to the callback without a login form");
            return Ok(());
        }

        let page_url = res.url().clone();
        let html = res
            .text()
            .await
            .map_err(|e| AuthError::BrowserLaunch(format!("failed to read login page: {}", e)))?;

        let form = LoginForm::parse(&html, &page_url)
            .ok_or_else(|| AuthError::BrowserLaunch(format!("no login form found at {}", page_url)))?;

        let credentials = credentials.ok_or_else(|| {
            AuthError::BrowserLaunch(
                "provider requires interactive login but no credentials were supplied".to_string(),
            )
        })?;

        info!("Submitting login form to {}", form.action);
        let res = client
            .post(form.action.clone())
            .form(&form.filled(credentials))
            .send()
            .await
            .map_err(|e| AuthError::BrowserLaunch(format!("POST {} failed: {}", form.action, e)))?;

        if reached_callback(res.url(), callback.as_ref()) {
            Ok(())
        } else {
            Err(AuthError::BrowserLaunch(format!(
                "login did not redirect back to the application (ended at {}, HTTP {})",
                res.url(),
                res.status()
            )))
        }
    }
}

/// The `redirect_uri` the authorize URL asks the provider to return to
fn callback_target(authorize_url: &str) -> Option<Url> {
    let url = Url::parse(authorize_url).ok()?;
    let redirect_uri = url
        .query_pairs()
        .find(|(key, _)| key == "redirect_uri")
        .map(|(_, value)| value.into_owned())?;
    Url::parse(&redirect_uri).ok()
}

fn reached_callback(url: &Url, callback: Option<&Url>) -> bool {
    match callback {
        Some(callback) => {
            url.scheme() == callback.scheme()
                && url.host_str() == callback.host_str()
                && url.port_or_known_default() == callback.port_or_known_default()
                && url.path() == callback.path()
        }
        None => is_loopback(url),
    }
}

fn is_loopback(url: &Url) -> bool {
    matches!(url.host_str(), Some("127.0.0.1") | Some("localhost") | Some("[::1]"))
}

#[derive(Debug)]
struct LoginForm {
    action: Url,
    fields: Vec<FormField>,
}

#[derive(Debug)]
struct FormField {
    name: String,
    kind: String,
    value: String,
}

impl LoginForm {
    /// First `<form>` on the page containing a password input.
    fn parse(html: &str, page_url: &Url) -> Option<Self> {
        FORM_RE.captures_iter(html).find_map(|form| {
            let attrs = attributes(&form[1]);
            let fields: Vec<FormField> = INPUT_RE
                .captures_iter(&form[2])
                .filter_map(|input| {
                    let attrs = attributes(&input[1]);
                    Some(FormField {
                        name: attrs.get("name")?.clone(),
                        kind: attrs
                            .get("type")
                            .map(|t| t.to_ascii_lowercase())
                            .unwrap_or_else(|| "text".to_string()),
                        value: attrs.get("value").cloned().unwrap_or_default(),
                    })
                })
                .collect();

            if !fields.iter().any(|f| f.kind == "password") {
                return None;
            }

            let action = match attrs.get("action").filter(|a| !a.is_empty()) {
                Some(action) => page_url.join(action).ok()?,
                None => page_url.clone(),
            };

            Some(Self { action, fields })
        })
    }

    fn filled(&self, credentials: &Credentials) -> Vec<(String, String)> {
        let username_field = self
            .fields
            .iter()
            .find(|f| matches!(f.kind.as_str(), "text" | "email") && looks_like_username(&f.name))
            .or_else(|| self.fields.iter().find(|f| matches!(f.kind.as_str(), "text" | "email")))
            .map(|f| f.name.clone());

        self.fields
            .iter()
            .filter(|f| !matches!(f.kind.as_str(), "submit" | "button" | "checkbox"))
            .map(|f| {
                let value = if f.kind == "password" {
                    credentials.password.clone()
                } else if Some(&f.name) == username_field.as_ref() {
                    credentials.username.clone()
                } else {
                    f.value.clone()
                };
                (f.name.clone(), value)
            })
            .collect()
    }
}

fn looks_like_username(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    ["user", "email", "login"].iter().any(|hint| name.contains(hint))
}

/// `name="value"` pairs of a tag, with basic entity decoding.
fn attributes(tag: &str) -> HashMap<String, String> {
    ATTRIBUTE_RE
        .captures_iter(tag)
        .map(|c| {
            let value = c.get(2).or_else(|| c.get(3)).map(|m| m.as_str()).unwrap_or_default();
            (c[1].to_ascii_lowercase(), decode_entities(value))
        })
        .collect()
}

fn decode_entities(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
