use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::OtpError;

pub const OTP_LENGTH: usize = 6;

/// What a one-time code unlocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpPurpose {
    EmailVerification,
    PasswordReset,
}

impl OtpPurpose {
    pub fn subject(&self) -> &'static str {
        match self {
            OtpPurpose::EmailVerification => "Verify your email address",
            OtpPurpose::PasswordReset => "Password Reset Request",
        }
    }
}

/// Limits applied when issuing and checking codes
#[derive(Debug, Clone, Copy)]
pub struct OtpPolicy {
    pub ttl: Duration,
    pub max_attempts: u32,
    pub resend_cooldown: Duration,
}

impl Default for OtpPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::minutes(10),
            max_attempts: 5,
            resend_cooldown: Duration::seconds(60),
        }
    }
}

/// A pending code stored on the user record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtpChallenge {
    pub purpose: OtpPurpose,
    pub code: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempts: u32,
}

/// Random numeric code
pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();

    (0..OTP_LENGTH)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

// compares every byte so timing does not leak the matching prefix
fn codes_match(expected: &str, given: &str) -> bool {
    let (a, b) = (expected.as_bytes(), given.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl OtpChallenge {
    pub fn issue(purpose: OtpPurpose, now: DateTime<Utc>, policy: &OtpPolicy) -> Self {
        Self {
            purpose,
            code: generate_code(),
            issued_at: now,
            expires_at: now + policy.ttl,
            attempts: 0,
        }
    }

    /// Whether a replacement code may be sent yet
    pub fn can_resend(&self, now: DateTime<Utc>, policy: &OtpPolicy) -> Result<(), OtpError> {
        let ready_at = self.issued_at + policy.resend_cooldown;
        if now < ready_at {
            let wait = (ready_at - now).num_seconds().max(1);
            return Err(OtpError::Cooldown(wait));
        }
        Ok(())
    }

    /// Checks a submitted code, counting failed attempts
    pub fn verify(
        &mut self,
        purpose: OtpPurpose,
        code: &str,
        now: DateTime<Utc>,
        policy: &OtpPolicy,
    ) -> Result<(), OtpError> {
        if self.purpose != purpose {
            return Err(OtpError::WrongPurpose);
        }
        if self.attempts >= policy.max_attempts {
            return Err(OtpError::Locked);
        }
        if now > self.expires_at {
            return Err(OtpError::Expired);
        }
        if !codes_match(&self.code, code.trim()) {
            self.attempts += 1;
            let remaining = policy.max_attempts.saturating_sub(self.attempts);
            if remaining == 0 {
                return Err(OtpError::Locked);
            }
            return Err(OtpError::Mismatch { remaining });
        }
        Ok(())
    }
}
