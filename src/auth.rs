//! Login handshake sequencing.
//!
//! `AuthenticateUser` goes out as soon as a connection opens; if the
//! reply demands a second factor, a time-based code is computed from the
//! configured secret and sent as `Authenticate2FA`. The sequencer is a
//! pure state machine: the supervisor feeds it connection-open and reply
//! events and performs whatever step comes back. It holds nothing across
//! reconnects except the static credential configuration.
use serde_json::Value;

use crate::config::Credentials;
use crate::errors::NdaxError;
use crate::models::{AuthenticateResponse, AuthenticateUserRequest, TwoFactorRequest};
use crate::totp;

/// Which handshake request a pending reply belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthStage {
    Credentials,
    TwoFactor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthState {
    Idle,
    CredentialsSent,
    TwoFactorSent,
    Authenticated,
    Failed,
}

/// What the supervisor must do next.
#[derive(Debug)]
pub(crate) enum AuthStep {
    /// Send `AuthenticateUser`.
    SendCredentials(AuthenticateUserRequest),
    /// Send `Authenticate2FA`.
    SendTwoFactor(TwoFactorRequest),
    /// Handshake complete; privileged requests may flow.
    Authenticated,
    /// No credentials configured: the session is anonymous and
    /// immediately ready for public market data.
    Anonymous,
    /// Handshake failed. Fatal to this connection, surfaced to the
    /// caller, never retried with the same credentials.
    Failed(NdaxError),
}

#[derive(Debug)]
pub(crate) struct AuthSequencer {
    credentials: Option<Credentials>,
    state: AuthState,
}

impl AuthSequencer {
    pub fn new(credentials: Option<Credentials>) -> Self {
        Self {
            credentials,
            state: AuthState::Idle,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    /// Back to Idle for a fresh connection.
    pub fn reset(&mut self) {
        self.state = AuthState::Idle;
    }

    /// A connection just opened.
    pub fn on_connected(&mut self) -> AuthStep {
        match &self.credentials {
            None => {
                self.state = AuthState::Authenticated;
                AuthStep::Anonymous
            }
            Some(creds) => {
                self.state = AuthState::CredentialsSent;
                AuthStep::SendCredentials(AuthenticateUserRequest {
                    user_name: creds.username.clone(),
                    password: creds.password.clone(),
                })
            }
        }
    }

    /// A correlated reply to one of the handshake requests arrived.
    pub fn on_response(&mut self, stage: AuthStage, payload: &Value) -> AuthStep {
        let response: AuthenticateResponse = match serde_json::from_value(payload.clone()) {
            Ok(r) => r,
            Err(e) => return self.fail(format!("unreadable authentication reply: {e}")),
        };

        match stage {
            AuthStage::Credentials if response.requires_two_factor => self.send_two_factor(),
            AuthStage::Credentials | AuthStage::TwoFactor if response.authenticated => {
                self.state = AuthState::Authenticated;
                AuthStep::Authenticated
            }
            _ => {
                let reason = response
                    .error_message
                    .unwrap_or_else(|| "credentials rejected by gateway".into());
                self.fail(reason)
            }
        }
    }

    fn send_two_factor(&mut self) -> AuthStep {
        let secret = match self
            .credentials
            .as_ref()
            .and_then(|c| c.totp_secret.as_deref())
        {
            Some(s) => s,
            None => {
                self.state = AuthState::Failed;
                return AuthStep::Failed(NdaxError::MissingConfig(
                    "account requires two-factor but no totp_secret is configured".into(),
                ));
            }
        };
        match totp::totp_now(secret) {
            Ok(code) => {
                self.state = AuthState::TwoFactorSent;
                AuthStep::SendTwoFactor(TwoFactorRequest { code })
            }
            Err(e) => {
                self.state = AuthState::Failed;
                AuthStep::Failed(e)
            }
        }
    }

    fn fail(&mut self, reason: String) -> AuthStep {
        self.state = AuthState::Failed;
        AuthStep::Failed(NdaxError::AuthenticationFailed(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn creds_with_totp() -> Credentials {
        Credentials::new("alice", "hunter2")
            .with_totp_secret("GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ")
    }

    #[test]
    fn test_anonymous_session_is_immediately_ready() {
        let mut auth = AuthSequencer::new(None);
        assert!(matches!(auth.on_connected(), AuthStep::Anonymous));
        assert!(auth.is_authenticated());
    }

    #[test]
    fn test_single_step_login() {
        let mut auth = AuthSequencer::new(Some(Credentials::new("alice", "hunter2")));
        let step = auth.on_connected();
        let AuthStep::SendCredentials(req) = step else {
            panic!("expected credentials step, got {step:?}");
        };
        assert_eq!(req.user_name, "alice");
        assert_eq!(auth.state, AuthState::CredentialsSent);

        let reply = json!({"Authenticated": true, "SessionToken": "tok", "UserId": 9});
        assert!(matches!(
            auth.on_response(AuthStage::Credentials, &reply),
            AuthStep::Authenticated
        ));
        assert!(auth.is_authenticated());
    }

    #[test]
    fn test_two_factor_path() {
        let mut auth = AuthSequencer::new(Some(creds_with_totp()));
        auth.on_connected();

        let challenge = json!({"Authenticated": false, "Requires2FA": true, "TwoFAType": "Google"});
        let step = auth.on_response(AuthStage::Credentials, &challenge);
        let AuthStep::SendTwoFactor(req) = step else {
            panic!("expected two-factor step, got {step:?}");
        };
        assert_eq!(req.code.len(), 6);
        assert_eq!(auth.state, AuthState::TwoFactorSent);

        let confirmed = json!({"Authenticated": true});
        assert!(matches!(
            auth.on_response(AuthStage::TwoFactor, &confirmed),
            AuthStep::Authenticated
        ));
    }

    #[test]
    fn test_two_factor_rejection_fails_without_retry() {
        let mut auth = AuthSequencer::new(Some(creds_with_totp()));
        auth.on_connected();
        auth.on_response(
            AuthStage::Credentials,
            &json!({"Requires2FA": true}),
        );

        let rejected = json!({"Authenticated": false, "errormsg": "Invalid 2FA code"});
        let step = auth.on_response(AuthStage::TwoFactor, &rejected);
        assert!(matches!(
            step,
            AuthStep::Failed(NdaxError::AuthenticationFailed(_))
        ));
        assert_eq!(auth.state, AuthState::Failed);
    }

    #[test]
    fn test_missing_totp_secret_surfaces_config_error() {
        let mut auth = AuthSequencer::new(Some(Credentials::new("alice", "hunter2")));
        auth.on_connected();
        let step = auth.on_response(AuthStage::Credentials, &json!({"Requires2FA": true}));
        assert!(matches!(step, AuthStep::Failed(NdaxError::MissingConfig(_))));
    }

    #[test]
    fn test_reentry_after_reset() {
        let mut auth = AuthSequencer::new(Some(Credentials::new("alice", "hunter2")));
        auth.on_connected();
        auth.on_response(AuthStage::Credentials, &json!({"Authenticated": true}));
        assert!(auth.is_authenticated());

        // Reconnect: the handshake runs again from Idle.
        auth.reset();
        assert_eq!(auth.state, AuthState::Idle);
        assert!(matches!(auth.on_connected(), AuthStep::SendCredentials(_)));
    }
}
