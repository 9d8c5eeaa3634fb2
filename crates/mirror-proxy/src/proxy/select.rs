//! Response ordering: decides which collected response is relayed.
//!
//! Ordering is a pure permutation of the collected responses. Nothing is
//! dropped, duplicated or modified; the relay stage writes the first element
//! and the rest are closed unread.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use axum::http::StatusCode;
use serde::Deserialize;

use crate::error::ConfigError;

/// Rule used to rank collected responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum OrderPolicy {
    /// Destination order as configured.
    #[default]
    #[serde(rename = "command")]
    PreserveOrder,
    /// Accepted statuses first, each block in destination order.
    #[serde(rename = "first-ok")]
    PrioritizeAccepted,
    /// Rejected statuses first, each block in destination order.
    #[serde(rename = "first-ko")]
    PrioritizeRejected,
}

impl OrderPolicy {
    /// Reorder `responses` according to this policy.
    pub fn sort<T: HasStatus>(self, accepted: &StatusSet, responses: Vec<T>) -> Vec<T> {
        match self {
            OrderPolicy::PreserveOrder => responses,
            OrderPolicy::PrioritizeAccepted => {
                let (mut ok, ko) = partition(accepted, responses);
                ok.extend(ko);
                ok
            }
            OrderPolicy::PrioritizeRejected => {
                let (ok, mut ko) = partition(accepted, responses);
                ko.extend(ok);
                ko
            }
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            OrderPolicy::PreserveOrder => "command",
            OrderPolicy::PrioritizeAccepted => "first-ok",
            OrderPolicy::PrioritizeRejected => "first-ko",
        }
    }
}

/// Stable split into (accepted, rejected).
fn partition<T: HasStatus>(accepted: &StatusSet, responses: Vec<T>) -> (Vec<T>, Vec<T>) {
    responses
        .into_iter()
        .partition(|r| accepted.contains(r.status()))
}

impl FromStr for OrderPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "command" => Ok(OrderPolicy::PreserveOrder),
            "first-ok" => Ok(OrderPolicy::PrioritizeAccepted),
            "first-ko" => Ok(OrderPolicy::PrioritizeRejected),
            other => Err(ConfigError::InvalidPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for OrderPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything carrying an HTTP status the selector can rank.
pub trait HasStatus {
    fn status(&self) -> StatusCode;
}

impl<T: HasStatus + ?Sized> HasStatus for &T {
    fn status(&self) -> StatusCode {
        (**self).status()
    }
}

/// Status codes treated as success when ranking responses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "StatusList")]
pub struct StatusSet(BTreeSet<u16>);

impl StatusSet {
    pub fn contains(&self, status: StatusCode) -> bool {
        self.0.contains(&status.as_u16())
    }

    fn from_codes(codes: impl IntoIterator<Item = u16>) -> Result<Self, ConfigError> {
        let mut set = BTreeSet::new();
        for code in codes {
            if StatusCode::from_u16(code).is_err() {
                return Err(ConfigError::InvalidStatusCode(code.to_string()));
            }
            set.insert(code);
        }
        if set.is_empty() {
            return Err(ConfigError::InvalidStatusCode(String::new()));
        }
        Ok(Self(set))
    }
}

impl Default for StatusSet {
    fn default() -> Self {
        Self((200..=204).collect())
    }
}

/// Parses whitespace-separated codes, e.g. `"200 201 202"`.
impl FromStr for StatusSet {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let codes = s
            .split_whitespace()
            .map(|word| {
                word.parse::<u16>()
                    .map_err(|_| ConfigError::InvalidStatusCode(word.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_codes(codes)
    }
}

impl fmt::Display for StatusSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut codes = self.0.iter();
        if let Some(first) = codes.next() {
            write!(f, "{first}")?;
        }
        for code in codes {
            write!(f, " {code}")?;
        }
        Ok(())
    }
}

/// Shapes accepted in config files and environment variables.
#[derive(Deserialize)]
#[serde(untagged)]
enum StatusList {
    Code(u16),
    Text(String),
    Codes(Vec<u16>),
}

impl TryFrom<StatusList> for StatusSet {
    type Error = ConfigError;

    fn try_from(list: StatusList) -> Result<Self, Self::Error> {
        match list {
            StatusList::Code(code) => Self::from_codes([code]),
            StatusList::Text(text) => text.parse(),
            StatusList::Codes(codes) => Self::from_codes(codes),
        }
    }
}
