//! Token authentication: pluggable identity verifiers.

pub mod verifier;

pub use verifier::{IdentityVerifier, StaticVerifier, TokenInfoVerifier, VerifyFuture};

use crate::config::{AuthConfig, VerifierKind};
use relaychat_core::ChatResult;
use std::sync::Arc;
use tracing::info;

/// Build the verifier selected by `[auth] verifier`.
pub fn build_verifier(config: &AuthConfig) -> ChatResult<Arc<dyn IdentityVerifier>> {
    match config.verifier {
        VerifierKind::Tokeninfo => {
            info!(
                endpoint = %config.tokeninfo_url,
                identity_field = %config.identity_field,
                audience_check = config.expected_audience.is_some(),
                "using token-introspection verifier"
            );
            let verifier = TokenInfoVerifier::new(
                config.tokeninfo_url.clone(),
                config.identity_field.clone(),
                config.expected_audience.clone(),
                config.verify_timeout,
            )?;
            Ok(Arc::new(verifier))
        }
        VerifierKind::Static => {
            info!(tokens = config.static_tokens.len(), "using static token verifier");
            Ok(Arc::new(StaticVerifier::new(config.static_tokens.clone())))
        }
    }
}
