#[cfg(feature = "web")]
use crate::app::AppState;
#[cfg(feature = "web")]
use crate::archive;
use crate::error::{AuthError, OtpError, StoreError};
#[cfg(feature = "web")]
use crate::error::AppError;
use crate::otp::{OtpChallenge, OtpPolicy, OtpPurpose};
use crate::reading::GlucoseUnit;
use crate::stats::Thresholds;
use crate::store::Database;
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
#[cfg(feature = "web")]
use axum::{
    Extension, Json,
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
#[cfg(feature = "web")]
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
#[cfg(feature = "web")]
use std::sync::Arc;
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "session";
pub const MIN_PASSWORD_LEN: usize = 8;

lazy_static! {
    static ref USERNAME_RE: Regex =
        Regex::new(r"^[A-Za-z0-9_-][A-Za-z0-9_.-]{2,31}$").expect("username pattern");
    static ref EMAIL_RE: Regex =
        Regex::new(r"^[^@\s]+@[^@\s.]+(\.[^@\s.]+)+$").expect("email pattern");
}

fn default_low() -> f64 {
    Thresholds::default().low
}

fn default_high() -> f64 {
    Thresholds::default().high
}

/// Per-user display preferences and target range
///
/// Thresholds are stored in mg/dL regardless of the display unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub unit: GlucoseUnit,
    #[serde(default = "default_low")]
    pub low_threshold: f64,
    #[serde(default = "default_high")]
    pub high_threshold: f64,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            display_name: None,
            unit: GlucoseUnit::default(),
            low_threshold: default_low(),
            high_threshold: default_high(),
        }
    }
}

impl Profile {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            low: self.low_threshold,
            high: self.high_threshold,
        }
    }
}

/// Registered application user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub email: String,
    /// Argon2 hash of the user's password
    pub password_hash: String,
    #[serde(default)]
    pub verified: bool,
    pub created_at: DateTime<Utc>,
    /// Pending one-time code, if any
    #[serde(default)]
    pub otp: Option<OtpChallenge>,
    #[serde(default)]
    pub profile: Profile,
}

/// What the API exposes about an account
#[derive(Debug, Clone, Serialize)]
pub struct UserView {
    pub username: String,
    pub email: String,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
    pub profile: Profile,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            username: user.username.clone(),
            email: user.email.clone(),
            verified: user.verified,
            created_at: user.created_at,
            profile: user.profile.clone(),
        }
    }
}

/// Profile fields a user may change; thresholds are in the profile's unit
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub unit: Option<GlucoseUnit>,
    pub low_threshold: Option<f64>,
    pub high_threshold: Option<f64>,
}

pub fn validate_username(username: &str) -> Result<(), AuthError> {
    if USERNAME_RE.is_match(username) {
        Ok(())
    } else {
        Err(AuthError::InvalidInput(
            "Username must be 3-32 letters, digits, '.', '_' or '-'".to_string(),
        ))
    }
}

pub fn validate_email(email: &str) -> Result<(), AuthError> {
    if email.len() <= 254 && EMAIL_RE.is_match(email) {
        Ok(())
    } else {
        Err(AuthError::InvalidInput("Invalid email address".to_string()))
    }
}

pub fn validate_password(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::InvalidInput(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| AuthError::Hash)
}

fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    let parsed_hash = PasswordHash::new(hash).map_err(|_| AuthError::Hash)?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Creates an unverified account and the code that verifies its email
pub fn register_user(
    db: &Database,
    username: &str,
    email: &str,
    password: &str,
    now: DateTime<Utc>,
    policy: &OtpPolicy,
) -> Result<(User, OtpChallenge), AuthError> {
    let username = username.trim();
    let email = email.trim().to_lowercase();
    validate_username(username)?;
    validate_email(&email)?;
    validate_password(password)?;

    let challenge = OtpChallenge::issue(OtpPurpose::EmailVerification, now, policy);
    let user = User {
        username: username.to_string(),
        email,
        password_hash: hash_password(password)?,
        verified: false,
        created_at: now,
        otp: Some(challenge.clone()),
        profile: Profile::default(),
    };

    db.insert_user(user.clone())?;
    log::info!("Registered user {}", user.username);
    Ok((user, challenge))
}

fn find_by_email(db: &Database, email: &str) -> Result<User, AuthError> {
    db.user_by_email(email)?.ok_or(AuthError::UnknownEmail)
}

/// Marks the account verified when `code` matches its pending code
pub fn verify_email(
    db: &Database,
    email: &str,
    code: &str,
    now: DateTime<Utc>,
    policy: &OtpPolicy,
) -> Result<User, AuthError> {
    let user = find_by_email(db, email)?;

    // failed attempts are persisted along with the outcome
    db.update_user(&user.username, |u| -> Result<User, AuthError> {
        if u.verified {
            return Err(AuthError::AlreadyVerified);
        }
        let otp = u.otp.as_mut().ok_or(OtpError::Missing)?;
        otp.verify(OtpPurpose::EmailVerification, code, now, policy)?;
        u.verified = true;
        u.otp = None;
        Ok(u.clone())
    })?
}

/// Issues a fresh code for `purpose`, honouring the resend cooldown
pub fn request_otp(
    db: &Database,
    email: &str,
    purpose: OtpPurpose,
    now: DateTime<Utc>,
    policy: &OtpPolicy,
) -> Result<(User, OtpChallenge), AuthError> {
    let user = find_by_email(db, email)?;

    db.update_user(&user.username, |u| -> Result<(User, OtpChallenge), AuthError> {
        match purpose {
            OtpPurpose::EmailVerification if u.verified => return Err(AuthError::AlreadyVerified),
            OtpPurpose::PasswordReset if !u.verified => return Err(AuthError::NotVerified),
            _ => {}
        }
        if let Some(existing) = u.otp.as_ref().filter(|otp| otp.purpose == purpose) {
            existing.can_resend(now, policy)?;
        }

        let challenge = OtpChallenge::issue(purpose, now, policy);
        u.otp = Some(challenge.clone());
        Ok((u.clone(), challenge))
    })?
}

/// Checks a username-or-email and password pair
pub fn authenticate(db: &Database, login: &str, password: &str) -> Result<User, AuthError> {
    let login = login.trim();
    let user = match db.user(login)? {
        Some(user) => user,
        None => db
            .user_by_email(login)?
            .ok_or(AuthError::InvalidCredentials)?,
    };

    if !verify_password(password, &user.password_hash)? {
        return Err(AuthError::InvalidCredentials);
    }
    if !user.verified {
        return Err(AuthError::NotVerified);
    }
    Ok(user)
}

/// Sets a new password using an emailed reset code
pub fn reset_password(
    db: &Database,
    email: &str,
    code: &str,
    new_password: &str,
    now: DateTime<Utc>,
    policy: &OtpPolicy,
) -> Result<User, AuthError> {
    validate_password(new_password)?;
    let user = find_by_email(db, email)?;
    let hash = hash_password(new_password)?;

    db.update_user(&user.username, |u| -> Result<User, AuthError> {
        let otp = u.otp.as_mut().ok_or(OtpError::Missing)?;
        otp.verify(OtpPurpose::PasswordReset, code, now, policy)?;
        u.password_hash = hash;
        u.otp = None;
        Ok(u.clone())
    })?
}

pub fn change_password(
    db: &Database,
    username: &str,
    old_password: &str,
    new_password: &str,
    confirm_password: &str,
) -> Result<(), AuthError> {
    if new_password != confirm_password {
        return Err(AuthError::PasswordMismatch);
    }
    validate_password(new_password)?;

    let user = db
        .user(username)?
        .ok_or_else(|| StoreError::UserNotFound(username.to_string()))?;
    if !verify_password(old_password, &user.password_hash)? {
        return Err(AuthError::InvalidCredentials);
    }

    let hash = hash_password(new_password)?;
    db.update_user(username, |u| u.password_hash = hash)?;
    Ok(())
}

pub fn update_profile(
    db: &Database,
    username: &str,
    update: ProfileUpdate,
) -> Result<User, AuthError> {
    db.update_user(username, |u| -> Result<User, AuthError> {
        let mut profile = u.profile.clone();
        if let Some(unit) = update.unit {
            profile.unit = unit;
        }
        if let Some(name) = update.display_name {
            let name = name.trim().to_string();
            profile.display_name = if name.is_empty() { None } else { Some(name) };
        }
        if let Some(low) = update.low_threshold {
            profile.low_threshold = profile.unit.to_mg_dl(low);
        }
        if let Some(high) = update.high_threshold {
            profile.high_threshold = profile.unit.to_mg_dl(high);
        }
        profile.thresholds().validate().map_err(AuthError::InvalidInput)?;

        u.profile = profile;
        Ok(u.clone())
    })?
}

/// Authenticated user session
#[derive(Debug, Clone)]
pub struct Session {
    pub username: String,
    pub expires_at: DateTime<Utc>,
}

/// Active sessions keyed by their random token
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn create(&self, username: &str) -> String {
        let token = Uuid::new_v4().to_string();
        let session = Session {
            username: username.to_string(),
            expires_at: Utc::now() + self.ttl,
        };
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.clone(), session);
        token
    }

    /// The username behind a live session token
    pub fn validate(&self, token: &str) -> Option<String> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get(token)
            .filter(|session| session.expires_at > Utc::now())
            .map(|session| session.username.clone())
    }

    pub fn revoke(&self, token: &str) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
    }

    pub fn revoke_user(&self, username: &str) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, session| session.username != username);
    }

    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, session| session.expires_at > now);
        before - sessions.len()
    }
}

// Web handler functions below (only compiled with "web" feature)

/// Username of the authenticated caller, set by [`require_auth`]
#[cfg(feature = "web")]
#[derive(Debug, Clone)]
pub struct CurrentUser(pub String);

#[cfg(feature = "web")]
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[cfg(feature = "web")]
#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub email: String,
    pub code: String,
}

#[cfg(feature = "web")]
#[derive(Debug, Deserialize)]
pub struct ResendRequest {
    pub email: String,
    #[serde(default = "default_purpose")]
    pub purpose: OtpPurpose,
}

#[cfg(feature = "web")]
fn default_purpose() -> OtpPurpose {
    OtpPurpose::EmailVerification
}

#[cfg(feature = "web")]
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Username or email address
    pub login: String,
    pub password: String,
}

#[cfg(feature = "web")]
#[derive(Debug, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[cfg(feature = "web")]
#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub email: String,
    pub code: String,
    pub new_password: String,
}

#[cfg(feature = "web")]
#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
    pub confirm_password: String,
}

#[cfg(feature = "web")]
#[derive(Debug, Deserialize)]
pub struct DeleteAccountRequest {
    pub password: String,
}

#[cfg(feature = "web")]
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub status: &'static str,
    pub token: String,
    pub user: UserView,
}

#[cfg(feature = "web")]
fn otp_policy(state: &AppState) -> OtpPolicy {
    OtpPolicy {
        ttl: state.config.otp_ttl(),
        max_attempts: state.config.otp_max_attempts,
        resend_cooldown: state.config.otp_resend_cooldown(),
    }
}

#[cfg(feature = "web")]
fn session_cookie(token: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .build()
}

/// Session token from the cookie or an `Authorization: Bearer` header
#[cfg(feature = "web")]
fn request_token(jar: &CookieJar, headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        return Some(cookie.value().to_string());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
}

#[cfg(feature = "web")]
fn start_session(state: &AppState, jar: CookieJar, user: &User) -> (CookieJar, Json<SessionResponse>) {
    let token = state.sessions.create(&user.username);
    (
        jar.add(session_cookie(token.clone())),
        Json(SessionResponse {
            status: "ok",
            token,
            user: user.into(),
        }),
    )
}

/// Authentication middleware
///
/// Resolves the session token and stores the caller as [`CurrentUser`];
/// requests without a live session get 401.
#[cfg(feature = "web")]
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let username = request_token(&jar, request.headers())
        .and_then(|token| state.sessions.validate(&token));

    match username {
        Some(username) => {
            request.extensions_mut().insert(CurrentUser(username));
            next.run(request).await
        }
        None => AppError::Unauthorized("Not signed in".to_string()).into_response(),
    }
}

#[cfg(feature = "web")]
pub async fn handle_register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let (user, challenge) = register_user(
        &state.db,
        &req.username,
        &req.email,
        &req.password,
        Utc::now(),
        &otp_policy(&state),
    )?;

    state
        .mailer
        .send_otp(&user.email, &user.username, &challenge, state.config.otp_ttl_minutes)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "status": "ok",
            "message": "Verification code sent",
            "username": user.username,
        })),
    ))
}

/// Verifies the email and signs the user in
#[cfg(feature = "web")]
pub async fn handle_verify_email(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<VerifyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user = verify_email(&state.db, &req.email, &req.code, Utc::now(), &otp_policy(&state))?;
    log::info!("User {} verified their email", user.username);
    Ok(start_session(&state, jar, &user))
}

#[cfg(feature = "web")]
pub async fn handle_resend_otp(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResendRequest>,
) -> Result<impl IntoResponse, AppError> {
    let (user, challenge) =
        request_otp(&state.db, &req.email, req.purpose, Utc::now(), &otp_policy(&state))?;

    state
        .mailer
        .send_otp(&user.email, &user.username, &challenge, state.config.otp_ttl_minutes)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "ok", "message": "Code sent" })),
    ))
}

#[cfg(feature = "web")]
pub async fn handle_login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user = authenticate(&state.db, &req.login, &req.password)?;
    Ok(start_session(&state, jar, &user))
}

#[cfg(feature = "web")]
pub async fn handle_logout(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: axum::http::HeaderMap,
) -> impl IntoResponse {
    if let Some(token) = request_token(&jar, &headers) {
        state.sessions.revoke(&token);
    }
    (
        jar.remove(Cookie::build(SESSION_COOKIE).path("/")),
        Json(serde_json::json!({ "status": "ok" })),
    )
}

/// Starts a password reset
///
/// The response is the same whether or not the email is registered.
#[cfg(feature = "web")]
pub async fn handle_forgot_password(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ForgotPasswordRequest>,
) -> Result<impl IntoResponse, AppError> {
    match request_otp(
        &state.db,
        &req.email,
        OtpPurpose::PasswordReset,
        Utc::now(),
        &otp_policy(&state),
    ) {
        Ok((user, challenge)) => {
            state
                .mailer
                .send_otp(&user.email, &user.username, &challenge, state.config.otp_ttl_minutes)
                .await?;
        }
        Err(AuthError::Store(e)) => return Err(e.into()),
        Err(e) => log::info!("Password reset not issued for {}: {}", req.email, e),
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "status": "ok",
            "message": "If the address is registered, a reset code has been sent",
        })),
    ))
}

#[cfg(feature = "web")]
pub async fn handle_reset_password(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResetPasswordRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user = reset_password(
        &state.db,
        &req.email,
        &req.code,
        &req.new_password,
        Utc::now(),
        &otp_policy(&state),
    )?;
    state.sessions.revoke_user(&user.username);
    log::info!("Password reset for {}", user.username);

    Ok(Json(serde_json::json!({ "status": "ok", "message": "Password reset successful" })))
}

/// Changes the password and replaces every session of the user with a new one
#[cfg(feature = "web")]
pub async fn handle_change_password(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
    jar: CookieJar,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<impl IntoResponse, AppError> {
    change_password(
        &state.db,
        &username,
        &req.old_password,
        &req.new_password,
        &req.confirm_password,
    )?;
    state.sessions.revoke_user(&username);

    let user = state
        .db
        .user(&username)?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
    Ok(start_session(&state, jar, &user))
}

#[cfg(feature = "web")]
pub async fn handle_me(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
) -> Result<Json<UserView>, AppError> {
    let user = state
        .db
        .user(&username)?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
    Ok(Json((&user).into()))
}

/// Updates the profile; stats are recomputed since thresholds may have moved
#[cfg(feature = "web")]
pub async fn handle_update_profile(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
    Json(update): Json<ProfileUpdate>,
) -> Result<Json<UserView>, AppError> {
    let user = update_profile(&state.db, &username, update)?;
    archive::refresh_user(&state.db, &username, Utc::now())?;
    Ok(Json((&user).into()))
}

#[cfg(feature = "web")]
pub async fn handle_delete_account(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
    jar: CookieJar,
    Json(req): Json<DeleteAccountRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user = state
        .db
        .user(&username)?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
    if !verify_password(&req.password, &user.password_hash)? {
        return Err(AuthError::InvalidCredentials.into());
    }

    state.db.remove_user(&username)?;
    state.sessions.revoke_user(&username);
    log::info!("Deleted account {}", username);

    Ok((
        jar.remove(Cookie::build(SESSION_COOKIE).path("/")),
        Json(serde_json::json!({ "status": "ok" })),
    ))
}
