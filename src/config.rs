//! Circulation policy and its loader.
//!
//! Policy values merge in this order (later wins):
//! 1. compiled defaults
//! 2. `circulation.toml` in the working directory
//! 3. `CIRCULATION_*` environment variables (`CIRCULATION_FINE_PER_DAY=3000`)

#![allow(clippy::result_large_err)] // figment::Error is external

use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::{CirculationError, CirculationResult};

/// Fine balance at which a reader is put on warning.
pub const WARNING_FINE_THRESHOLD: u64 = 20_000;

/// Fine balance at which a reader is suspended.
pub const SUSPENSION_FINE_THRESHOLD: u64 = 50_000;

/// Number of overdue records that suspends a reader during the sweep.
pub const SUSPENSION_OVERDUE_COUNT: usize = 3;

/// Tunable circulation rules.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    /// Loan period, also the renewal extension.
    #[serde(default = "default_max_borrow_days")]
    pub max_borrow_days: u32,

    /// Renewals allowed per borrow record.
    #[serde(default = "default_max_renewals")]
    pub max_renewals: u32,

    /// Fine charged per overdue day.
    #[serde(default = "default_fine_per_day")]
    pub fine_per_day: u64,

    /// Borrow limit given to newly registered readers.
    #[serde(default = "default_max_books_per_reader")]
    pub max_books_per_reader: u32,

    /// Days a reservation stays active.
    #[serde(default = "default_reservation_hold_days")]
    pub reservation_hold_days: u32,

    /// Days a reader has to pay a fine.
    #[serde(default = "default_fine_payment_days")]
    pub fine_payment_days: u32,

    /// Available copies at or below which a borrow raises a low-stock alert.
    #[serde(default = "default_low_stock_threshold")]
    pub low_stock_threshold: u32,

    /// Activity entries kept in the persisted log.
    #[serde(default = "default_activity_log_limit")]
    pub activity_log_limit: usize,
}

/// Default loan period
fn default_max_borrow_days() -> u32 {
    14
}

/// Default renewal count
fn default_max_renewals() -> u32 {
    2
}

/// Default per-day fine
fn default_fine_per_day() -> u64 {
    2000
}

/// Default borrow limit
fn default_max_books_per_reader() -> u32 {
    5
}

/// Default reservation window
fn default_reservation_hold_days() -> u32 {
    7
}

/// Default fine payment window
fn default_fine_payment_days() -> u32 {
    14
}

/// Default low-stock threshold
fn default_low_stock_threshold() -> u32 {
    2
}

/// Default activity log cap
fn default_activity_log_limit() -> usize {
    1000
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_borrow_days: default_max_borrow_days(),
            max_renewals: default_max_renewals(),
            fine_per_day: default_fine_per_day(),
            max_books_per_reader: default_max_books_per_reader(),
            reservation_hold_days: default_reservation_hold_days(),
            fine_payment_days: default_fine_payment_days(),
            low_stock_threshold: default_low_stock_threshold(),
            activity_log_limit: default_activity_log_limit(),
        }
    }
}

impl Policy {
    /// Reject values that would make the engine misbehave.
    ///
    /// # Errors
    ///
    /// Returns `CirculationError::InvalidPolicy` naming the first bad field.
    pub fn validate(&self) -> CirculationResult<()> {
        let checks = [
            ("max_borrow_days", self.max_borrow_days == 0),
            ("max_books_per_reader", self.max_books_per_reader == 0),
            ("reservation_hold_days", self.reservation_hold_days == 0),
            ("fine_payment_days", self.fine_payment_days == 0),
            ("activity_log_limit", self.activity_log_limit == 0),
        ];
        match checks.iter().find(|(_, invalid)| *invalid) {
            Some((field, _)) => {
                Err(CirculationError::InvalidPolicy(format!("{field} must be greater than zero")))
            }
            None => Ok(()),
        }
    }
}

/// Load the policy from defaults, `circulation.toml` and the environment.
///
/// # Errors
///
/// Returns the figment error when a source holds malformed or unknown keys.
pub fn load_policy() -> Result<Policy, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(Policy::default()))
        .merge(Toml::file("circulation.toml"))
        .merge(Env::prefixed("CIRCULATION_"))
        .extract()
}

/// Load the policy from a TOML file plus environment overrides.
///
/// # Errors
///
/// Returns the figment error when the file holds malformed or unknown keys.
pub fn load_policy_from_path(path: &Path) -> Result<Policy, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(Policy::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("CIRCULATION_"))
        .extract()
}

/// Load the policy from a TOML string only.
///
/// # Errors
///
/// Returns the figment error when the string holds malformed or unknown keys.
pub fn load_policy_from_str(toml_content: &str) -> Result<Policy, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(Policy::default()))
        .merge(Toml::string(toml_content))
        .extract()
}
