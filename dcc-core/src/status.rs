//! Per-document check results.
use std::fmt;

use serde::Serialize;

/// Checks tracked for every loaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusKind {
    IsLoaded,
    ValidSchema,
    IsSigned,
    ValidSignature,
    ValidChain,
    NotRevoked,
}

impl StatusKind {
    pub const ALL: [StatusKind; 6] = [
        StatusKind::IsLoaded,
        StatusKind::ValidSchema,
        StatusKind::IsSigned,
        StatusKind::ValidSignature,
        StatusKind::ValidChain,
        StatusKind::NotRevoked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::IsLoaded => "IS_LOADED",
            StatusKind::ValidSchema => "VALID_SCHEMA",
            StatusKind::IsSigned => "IS_SIGNED",
            StatusKind::ValidSignature => "VALID_SIGNATURE",
            StatusKind::ValidChain => "VALID_CHAIN",
            StatusKind::NotRevoked => "NOT_REVOKED",
        }
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    #[default]
    NotApplicable,
    Pass,
    Fail,
}

impl CheckState {
    pub fn from_bool(passed: bool) -> Self {
        if passed { CheckState::Pass } else { CheckState::Fail }
    }

    /// `None` for [`CheckState::NotApplicable`].
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CheckState::NotApplicable => None,
            CheckState::Pass => Some(true),
            CheckState::Fail => Some(false),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
struct Check {
    state: CheckState,
    diagnostic: Option<String>,
}

/// Tri-state result for every [`StatusKind`], plus optional diagnostics.
///
/// Every check starts out [`CheckState::NotApplicable`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    checks: [Check; 6],
}

impl StatusReport {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, kind: StatusKind) -> &mut Check {
        &mut self.checks[kind as usize]
    }

    pub fn state(&self, kind: StatusKind) -> CheckState {
        self.checks[kind as usize].state
    }

    pub fn diagnostic(&self, kind: StatusKind) -> Option<&str> {
        self.checks[kind as usize].diagnostic.as_deref()
    }

    pub fn set(&mut self, kind: StatusKind, state: CheckState) {
        *self.slot(kind) = Check {
            state,
            diagnostic: None,
        };
    }

    pub fn fail(&mut self, kind: StatusKind, diagnostic: impl Into<String>) {
        *self.slot(kind) = Check {
            state: CheckState::Fail,
            diagnostic: Some(diagnostic.into()),
        };
    }

    pub fn is_loaded(&self) -> bool {
        self.state(StatusKind::IsLoaded) == CheckState::Pass
    }

    pub fn is_signed(&self) -> bool {
        self.state(StatusKind::IsSigned) == CheckState::Pass
    }

    /// `None` until a signature verification has run.
    pub fn valid_signature(&self) -> Option<bool> {
        self.state(StatusKind::ValidSignature).as_bool()
    }

    pub fn valid_schema(&self) -> Option<bool> {
        self.state(StatusKind::ValidSchema).as_bool()
    }

    /// True when every check outside `ignore` passed or does not apply.
    pub fn get_status_summary(&self, ignore: &[StatusKind]) -> bool {
        StatusKind::ALL
            .iter()
            .filter(|kind| !ignore.contains(kind))
            .all(|kind| self.state(*kind) != CheckState::Fail)
    }

    pub fn iter(&self) -> impl Iterator<Item = (StatusKind, CheckState)> + '_ {
        StatusKind::ALL.into_iter().map(|kind| (kind, self.state(kind)))
    }
}
