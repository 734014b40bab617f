use serde::{Deserialize, Serialize};
use spindle_clock::{Clock, DurationSecs, System, UnixTime};

use crate::{AccessToken, AccessTokenRef};

/// An access token as issued by the authority along with its lifetime
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessCredential {
    access_token: AccessToken,
    lifetime: DurationSecs,
    issued: UnixTime,
    expires_at: UnixTime,
}

/// A credential's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The credential may be used
    Valid,
    /// The credential must be replaced before it can be used
    Expired,
}

impl AccessCredential {
    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the lifetime reported by the authority
    #[inline]
    pub fn lifetime(&self) -> DurationSecs {
        self.lifetime
    }

    /// Gets the time that the credential was issued
    #[inline]
    pub fn issued(&self) -> UnixTime {
        self.issued
    }

    /// Gets the time from which the credential must be treated as invalid
    ///
    /// This is earlier than the authority's own expiry by the safety margin
    /// that was configured when the credential was created.
    #[inline]
    pub fn expires_at(&self) -> UnixTime {
        self.expires_at
    }

    /// Gets the interval during which the credential is valid
    #[inline]
    pub fn valid_interval(&self) -> std::ops::Range<UnixTime> {
        self.issued..self.expires_at
    }

    /// Gets the credential's current status
    #[inline]
    pub fn token_status(&self) -> TokenStatus {
        self.token_status_with_clock(&System)
    }

    /// Gets the credential's status based on the current time as reported by the provided clock
    #[inline]
    pub fn token_status_with_clock<C: Clock>(&self, clock: &C) -> TokenStatus {
        self.token_status_at(clock.now())
    }

    /// Gets the credential's status as of the provided time
    #[inline]
    pub fn token_status_at(&self, time: UnixTime) -> TokenStatus {
        if time < self.expires_at {
            TokenStatus::Valid
        } else {
            TokenStatus::Expired
        }
    }

    /// Whether the credential may still be used at the provided time
    #[inline]
    pub fn is_valid_at(&self, time: UnixTime) -> bool {
        matches!(self.token_status_at(time), TokenStatus::Valid)
    }

    /// Gets a duration for how much longer the credential would be valid as of the provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> DurationSecs {
        self.expires_at - time
    }
}

/// Configuration for determining how long a fresh credential may be used
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenLifetimeConfig {
    safety_margin: DurationSecs,
}

impl Default for TokenLifetimeConfig {
    /// Default lifetime configuration
    ///
    /// Treats a credential as expired one minute before the authority says it will.
    fn default() -> Self {
        Self {
            safety_margin: DurationSecs(60),
        }
    }
}

impl TokenLifetimeConfig {
    /// Constructs a new lifetime configuration
    ///
    /// A credential will stop being used `safety_margin` before the authority's
    /// reported expiry, to absorb network latency and clock skew. The margin never
    /// exceeds half of a credential's lifetime, so that very short-lived tokens are
    /// still usable.
    pub const fn new(safety_margin: DurationSecs) -> Self {
        Self { safety_margin }
    }

    /// The configured safety margin
    pub fn safety_margin(&self) -> DurationSecs {
        self.safety_margin
    }

    /// Given an access token and its lifetime, constructs a credential issued at `issued`
    pub fn create_credential<A>(
        &self,
        access_token: A,
        lifetime: DurationSecs,
        issued: UnixTime,
    ) -> AccessCredential
    where
        A: Into<AccessToken>,
    {
        let margin = self.safety_margin.min(lifetime / 2);
        AccessCredential {
            access_token: access_token.into(),
            lifetime,
            issued,
            expires_at: issued + (lifetime - margin),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_pulled_in_by_safety_margin() {
        let config = TokenLifetimeConfig::default();
        let credential =
            config.create_credential(AccessToken::from_static("a"), DurationSecs(3600), UnixTime(1_000));

        assert_eq!(credential.expires_at(), UnixTime(4_540));
        assert_eq!(credential.valid_interval(), UnixTime(1_000)..UnixTime(4_540));
    }

    #[test]
    fn margin_is_clamped_to_half_the_lifetime() {
        let config = TokenLifetimeConfig::new(DurationSecs(300));
        let credential =
            config.create_credential(AccessToken::from_static("a"), DurationSecs(100), UnixTime(0));

        assert_eq!(credential.expires_at(), UnixTime(50));
    }

    #[test]
    fn credential_is_invalid_from_its_expiry_onward() {
        let config = TokenLifetimeConfig::new(DurationSecs(0));
        let credential =
            config.create_credential(AccessToken::from_static("a"), DurationSecs(10), UnixTime(0));

        assert_eq!(credential.token_status_at(UnixTime(9)), TokenStatus::Valid);
        assert_eq!(credential.token_status_at(UnixTime(10)), TokenStatus::Expired);
        assert_eq!(credential.until_expired_at(UnixTime(4)), DurationSecs(6));
        assert_eq!(credential.until_expired_at(UnixTime(40)), DurationSecs(0));
    }
}
