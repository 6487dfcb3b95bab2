// OAuth2 authorization-code + PKCE login against the data hub identity provider

pub mod authenticator;
pub mod browser;
pub mod callback;
pub mod discovery;
pub mod error;
pub mod flow;
pub mod pkce;
pub mod token_manager;

pub use authenticator::{Authenticator, OidcAuthenticator};
pub use browser::{BrowserLauncher, Credentials, HeadlessBrowser, SystemBrowser};
pub use callback::{CallbackListener, CallbackOutcome, CallbackResult};
pub use discovery::ProviderEndpoints;
pub use error::AuthError;
pub use flow::{AuthorizationCodeFlow, FlowState, LoginOutcome, LoginRequest, LoginSettings, TokenState};
pub use pkce::PkceParameters;
pub use token_manager::TokenManager;
