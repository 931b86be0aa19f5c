// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Unique Document Identifiers.
//!
//! A UDI is the only handle a client ever gets on a document, so it doubles as
//! an unguessable access token. Layout:
//!
//! ```text
//!  Y Y M - R R R - R R R - R R R
//!  │ │ │   └──────────┬────────┘
//!  │ │ │        9 random symbols (OsRng)
//!  │ │ └─ month: 1-9, then A/B/C for Oct-Dec
//!  └─┴─── two-digit year
//! ```
//!
//! Every symbol (prefix included) comes from [`ALPHABET`], which leaves out the
//! visually ambiguous `0`, `I`, `O` and `Q`. The resulting string is 15
//! characters long with dashes, 12 without.
//!
//! # Example
//!
//! ```
//! use blob_vault::udi::{self, Udi};
//!
//! assert!(udi::validate("26A-XK4-9PB-TTM"));
//! assert!(!udi::validate("../etc/passwd"));
//!
//! assert!("26a-xk4-9pb-ttm".parse::<Udi>().is_err());
//! let udi = Udi::parse_lenient(" 26a-xk4-9pb-ttm ").unwrap();
//! assert_eq!(udi.as_str(), "26A-XK4-9PB-TTM");
//! assert_eq!(udi.groups()[1], "XK4");
//! ```

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ServiceError;
use crate::metrics;
use crate::storage::StorageError;

/// Symbols a UDI may contain.
pub const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPRSTUVWXYZ123456789";

/// Length without dashes.
pub const UDI_LENGTH: usize = 12;

/// Length with dashes.
pub const UDI_LENGTH_DASHED: usize = 15;

/// Candidates tried before giving up on a collision-free identifier.
pub const MAX_TRIES: usize = 5;

const GROUP_LEN: usize = 3;
const GROUP_COUNT: usize = 4;

/// Returns true if `candidate` is a well-formed UDI.
///
/// Case sensitive: lowercase input is rejected (see [`Udi::parse_lenient`]).
pub fn validate(candidate: &str) -> bool {
    if candidate.len() != UDI_LENGTH_DASHED {
        return false;
    }
    let groups: Vec<&str> = candidate.split('-').collect();
    if groups.len() != GROUP_COUNT {
        return false;
    }
    groups.iter().all(|group| {
        group.len() == GROUP_LEN && group.bytes().all(|b| ALPHABET.contains(&b))
    })
}

/// A validated document identifier.
///
/// The only ways to obtain one are [`Udi::parse`] (and its variants) and
/// [`generate`], so holding a `Udi` proves the string passed [`validate`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Udi(String);

impl Udi {
    /// Strict parse: the input must already be a valid, uppercase UDI.
    pub fn parse(candidate: &str) -> Result<Self, ServiceError> {
        if validate(candidate) {
            Ok(Self(candidate.to_string()))
        } else {
            Err(ServiceError::InvalidIdentifier)
        }
    }

    /// Parse user input: surrounding whitespace is trimmed and letters are
    /// uppercased before validation.
    pub fn parse_lenient(candidate: &str) -> Result<Self, ServiceError> {
        Self::parse(&candidate.trim().to_ascii_uppercase())
    }

    /// Build a random candidate for the month containing `now`.
    ///
    /// The candidate is well-formed but not checked for collisions; use
    /// [`generate`] for that.
    pub fn random(now: DateTime<Utc>) -> Self {
        let mut rng = OsRng;
        let mut out = String::with_capacity(UDI_LENGTH_DASHED);

        for (i, symbol) in prefix(now, &mut rng).into_iter().enumerate() {
            if i > 0 && i % GROUP_LEN == 0 {
                out.push('-');
            }
            out.push(symbol);
        }
        for i in GROUP_LEN..UDI_LENGTH {
            if i % GROUP_LEN == 0 {
                out.push('-');
            }
            out.push(random_symbol(&mut rng));
        }

        debug_assert!(validate(&out), "generated malformed udi {out}");
        Self(out)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The four dash-separated groups.
    #[must_use]
    pub fn groups(&self) -> [&str; GROUP_COUNT] {
        let s = self.0.as_str();
        [&s[0..3], &s[4..7], &s[8..11], &s[12..15]]
    }

    /// The first group only. A UDI is the sole credential for its document,
    /// so logs carry this instead of the whole identifier.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.0[..GROUP_LEN]
    }
}

impl fmt::Display for Udi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Udi {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Udi {
    type Error = ServiceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if validate(&value) {
            Ok(Self(value))
        } else {
            Err(ServiceError::InvalidIdentifier)
        }
    }
}

impl From<Udi> for String {
    fn from(udi: Udi) -> Self {
        udi.0
    }
}

impl AsRef<str> for Udi {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn random_symbol<R: Rng>(rng: &mut R) -> char {
    ALPHABET[rng.gen_range(0..ALPHABET.len())] as char
}

/// Year/month prefix. A `0` year digit has no symbol in the alphabet, so it is
/// replaced by a random symbol to keep the identifier valid.
fn prefix<R: Rng>(now: DateTime<Utc>, rng: &mut R) -> [char; GROUP_LEN] {
    let year = now.year().rem_euclid(100) as u32;
    let month = now.month();

    let digit = |d: u32, rng: &mut R| match d {
        0 => random_symbol(rng),
        d => char::from_digit(d, 10).unwrap_or('9'),
    };

    let month_symbol = match month {
        1..=9 => char::from_digit(month, 10).unwrap_or('1'),
        10 => 'A',
        11 => 'B',
        _ => 'C',
    };

    let tens = digit(year / 10, rng);
    let units = digit(year % 10, rng);
    [tens, units, month_symbol]
}

/// Generate an identifier that `exists` reports as unused.
///
/// Up to [`MAX_TRIES`] candidates are drawn. Running out of tries yields
/// [`ServiceError::IdentifierExhausted`]; a failing existence check aborts
/// with [`ServiceError::StorageFault`]. A colliding identifier is never
/// returned.
pub async fn generate<F, Fut>(now: DateTime<Utc>, mut exists: F) -> Result<Udi, ServiceError>
where
    F: FnMut(Udi) -> Fut,
    Fut: Future<Output = Result<bool, StorageError>>,
{
    for attempt in 1..=MAX_TRIES {
        let candidate = Udi::random(now);
        if !exists(candidate.clone()).await? {
            if attempt > 1 {
                debug!(attempt, "udi generated after collision");
            }
            return Ok(candidate);
        }
        metrics::record_udi_collision();
        warn!(attempt, "udi collision, drawing another candidate");
    }
    Err(ServiceError::IdentifierExhausted)
}
