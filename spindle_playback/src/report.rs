//! Turning lookups into payloads for the people asking

use std::error;

use serde::{Deserialize, Serialize};

use crate::{FetchError, Track};

/// What to tell callers when a lookup fails for lack of authorization
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailurePolicy {
    /// Report the failure, so that an operator can act on it
    #[default]
    Surface,
    /// Log the failure and report that nothing is playing
    Degrade,
}

/// The answer to "what is playing right now?"
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NowPlayingReport {
    /// A track is playing
    Playing {
        /// The track
        track: Track,
    },
    /// Nothing is playing
    Idle,
    /// The lookup could not be authorized
    AuthFailed {
        /// A short, stable name for the failure
        kind: &'static str,
        /// Whether a human must authenticate again
        needs_reauthentication: bool,
        /// A description of the failure
        message: String,
    },
}

impl NowPlayingReport {
    /// Builds a report from the outcome of a lookup
    pub fn from_result(result: Result<Option<Track>, FetchError>, policy: AuthFailurePolicy) -> Self {
        match result {
            Ok(Some(track)) => Self::Playing { track },
            Ok(None) => Self::Idle,
            Err(err) => {
                let failure = err.auth_failure();
                match policy {
                    AuthFailurePolicy::Surface => Self::AuthFailed {
                        kind: failure.kind(),
                        needs_reauthentication: failure.needs_reauthentication(),
                        message: failure.to_string(),
                    },
                    AuthFailurePolicy::Degrade => {
                        tracing::warn!(
                            kind = failure.kind(),
                            error = (failure as &dyn error::Error),
                            "reporting authorization failure as nothing playing"
                        );
                        Self::Idle
                    }
                }
            }
        }
    }

    /// Whether a track is playing
    pub fn is_playing(&self) -> bool {
        matches!(self, Self::Playing { .. })
    }
}
