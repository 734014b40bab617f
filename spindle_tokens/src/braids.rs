use aliri_braid::braid;
use std::fmt;

/// Implements redacting `Debug` and `Display` for a secret-bearing borrowed type
///
/// The plain formatters print only a placeholder. The alternate formatters
/// (`{:#}` and `{:#?}`) reveal a prefix of the secret, bounded by the format
/// width when one is given.
macro_rules! redacted {
    ($ty:ty: $hidden:literal, $reveal:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str("\"")?;
                    reveal_prefix(self.as_str(), &mut *f, $reveal)?;
                    f.write_str("\"")
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    reveal_prefix(self.as_str(), &mut *f, $reveal)
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }
    };
}

fn reveal_prefix(secret: &str, f: &mut fmt::Formatter, default_len: usize) -> fmt::Result {
    let max_len = f.width().unwrap_or(default_len);
    if max_len <= 1 {
        return f.write_str("…");
    }

    match secret.char_indices().nth(max_len - 1) {
        Some((idx, _)) => {
            f.write_str(&secret[..idx])?;
            f.write_str("…")
        }
        None => f.write_str(secret),
    }
}

/// The client ID registered with the music provider
#[braid(serde)]
pub struct ClientId;

/// The client secret registered with the music provider
#[braid(serde, debug = "owned", display = "owned")]
pub struct ClientSecret;

redacted!(ClientSecretRef: "CLIENT SECRET", 4);

/// A short-lived bearer token for calls to the provider's API
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

redacted!(AccessTokenRef: "ACCESS TOKEN", 12);

/// A long-lived credential used to mint new access tokens
#[braid(serde, debug = "owned", display = "owned")]
pub struct RefreshToken;

redacted!(RefreshTokenRef: "REFRESH TOKEN", 4);
