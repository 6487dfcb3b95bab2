/// PKCE parameters (RFC 7636) generated fresh for every login attempt
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};

/// One-shot PKCE material. Not `Clone`: a set is consumed by the attempt that created it.
#[derive(Debug)]
pub struct PkceParameters {
    pub code_verifier: String,
    pub code_challenge: String,
    pub state: String,
    pub redirect_uri: String,
}

impl PkceParameters {
    pub fn generate(redirect_uri: impl Into<String>) -> Self {
        let code_verifier = generate_code_verifier();
        let code_challenge = code_challenge_for(&code_verifier);
        Self {
            code_verifier,
            code_challenge,
            state: generate_state(),
            redirect_uri: redirect_uri.into(),
        }
    }
}

fn random_url_safe(len: usize) -> String {
    use rand::RngCore;
    let mut rng = rand::thread_rng();
    let mut random_bytes = vec![0u8; len];
    rng.fill_bytes(&mut random_bytes);
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Generate PKCE code verifier (43-128 characters per RFC 7636)
fn generate_code_verifier() -> String {
    random_url_safe(32) // 32 bytes = 43 chars base64
}

/// Random nonce for CSRF protection
fn generate_state() -> String {
    random_url_safe(16)
}

/// S256 transform: base64url(SHA-256(verifier)), no padding
pub fn code_challenge_for(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pkce_generation() {
        let pkce = PkceParameters::generate("http://127.0.0.1:1234/signin-oidc");

        assert_eq!(pkce.code_verifier.len(), 43);
        assert_eq!(pkce.code_challenge, code_challenge_for(&pkce.code_verifier));
        assert_ne!(pkce.code_verifier, pkce.code_challenge);
        assert!(!pkce.state.is_empty());
        assert_eq!(pkce.redirect_uri, "http://127.0.0.1:1234/signin-oidc");
    }

    #[test]
    fn test_rfc7636_appendix_b_vector() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            code_challenge_for(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_parameters_are_fresh_per_attempt() {
        let a = PkceParameters::generate("http://127.0.0.1/cb");
        let b = PkceParameters::generate("http://127.0.0.1/cb");

        assert_ne!(a.code_verifier, b.code_verifier);
        assert_ne!(a.state, b.state);
    }
}
