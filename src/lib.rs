/*!
# Glucolog

A self-hosted diabetes log: users register and verify their email with a
one-time code, record blood glucose readings, and get weekly and monthly
statistics with a trend against the previous period.

## Architecture

### HTTP layer (`web` feature)
- **app**: axum router, reading, stats and report handlers
- **auth**: account flows, sessions and the authentication middleware
- **mailer**: OTP and report mails over SMTP (lettre + handlebars)
- **chart**: PNG charts of readings (plotters)

### Core
- **reading**: the reading model, units and validation
- **stats**: derived statistics and the weekly/monthly rollover
- **archive**: applying rollovers to stored accounts, on demand or on a timer
- **otp**: one-time code issuing and verification
- **store**: file-backed JSON database
- **export** / **import**: CSV and XLSX reports, CSV import
- **saving**: compressed per-user backups

## Statistics

Every stat keeps a `current` value and the `previous` period's value.
Rolling stats (7 and 90 days) derive `previous` from the window before.
Weekly stats start on Monday, monthly stats on the 1st, both in UTC; when a
period ends the current value moves to `previous` and a fresh period starts.
*/

#[cfg(feature = "web")]
pub mod app;
pub mod archive;
pub mod auth;
#[cfg(feature = "web")]
pub mod chart;
pub mod config;
pub mod error;
pub mod export;
pub mod import;
#[cfg(feature = "web")]
pub mod mailer;
pub mod otp;
pub mod reading;
pub mod saving;
pub mod stats;
pub mod store;
