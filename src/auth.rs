use axum::extract::Query;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use pbkdf2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::Pbkdf2;
use rand::{thread_rng, Rng};
use rand_core::OsRng;
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::err::Error;
use crate::models::{NewQualification, Student, StudentProfile};
use crate::service::Registration;
use crate::{breaks, proceeds, Payload, Service};

#[derive(Debug, Clone, Eq, Ord, PartialOrd, PartialEq)]
pub enum AuthResult {
    Success,
    SessionExpired,
    InvalidSession,
}

impl Serialize for AuthResult {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{:?}", self))
    }
}

/// One-way password digest in PHC string format.
pub fn hash_password(plaintext: &str) -> Result<String, Error> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Pbkdf2
        .hash_password(plaintext.as_bytes(), &salt)?
        .to_string())
}

pub fn verify_password(plaintext: &str, digest: &str) -> bool {
    PasswordHash::new(digest)
        .map(|hash| Pbkdf2.verify_password(plaintext.as_bytes(), &hash).is_ok())
        .unwrap_or(false)
}

/// Fresh opaque session token: 32 random bytes through SHA-256, hex-encoded.
pub fn generate_ssid() -> String {
    let ssid_bytes: [u8; 32] = thread_rng().gen();
    let mut hasher: Sha256 = Digest::new();
    hasher.update(ssid_bytes);
    hex::encode(hasher.finalize())
}

pub async fn register_student(
    Json(body): Json<RegisterStudent>,
    Extension(service): Extension<Service>,
) -> Payload<RegisteredStudent> {
    if body.password.is_empty() {
        return breaks(Error::MissingCredentials {
            message: "Provided password was empty!".to_string(),
        });
    }
    if let Err(err) = body.profile.validate() {
        return breaks(err);
    }

    let outcome = service
        .register(body.profile.clone(), body.qualifications, &body.password)
        .await?;
    match outcome {
        Registration::Created(student) => {
            log::info!(
                "New student registered: {} ({}) as {}",
                student.username,
                student.email,
                student.student_id
            );
            proceeds(RegisteredStudent {
                id: student.id,
                student_id: student.student_id,
            })
        }
        Registration::Conflict => {
            log::warn!(
                "Registration failed for {}, username or email already exists",
                body.profile.username
            );
            breaks(Error::UserAlreadyExists {
                message: "Username or Email already exists!".to_string(),
            })
        }
    }
}

pub async fn login_student(
    Json(login): Json<LoginStudent>,
    Extension(service): Extension<Service>,
) -> Payload<LoggedInStudent> {
    if login.username.is_empty() {
        return breaks(Error::InvalidPayload {
            message: "`username` parameter was empty".to_string(),
        });
    }
    if login.password.is_empty() {
        return breaks(Error::InvalidPayload {
            message: "`password` parameter was empty".to_string(),
        });
    }

    let student = match service.login(&login.username, &login.password).await? {
        Some(student) => student,
        None => {
            log::warn!("Failed login attempt for user {}", login.username);
            return breaks(Error::AuthenticationFailure {
                message: "Invalid username or password!".to_string(),
            });
        }
    };

    let session = service.issue_session(student.id).await?;
    log::info!("User {} successfully logged in", student.username);
    proceeds(LoggedInStudent {
        session_id: session.ssid,
        expires_at: session.expires_at,
        student,
    })
}

pub async fn drop_session(
    Json(SessionToken { ssid }): Json<SessionToken>,
    Extension(service): Extension<Service>,
) -> Payload<SessionBasedResponse<SessionDropped>> {
    let (auth_result, session) = service.authenticate(&ssid).await?;
    let session = match session {
        Some(session) => session,
        None => {
            return proceeds(SessionBasedResponse {
                auth_result,
                value: None,
            })
        }
    };

    let dropped = service.drop_session(&session.ssid).await?;
    proceeds(SessionBasedResponse {
        auth_result,
        value: Some(SessionDropped {
            student_id: session.belongs_to,
            drop_success: dropped,
        }),
    })
}

pub async fn check_availability(
    Query(query): Query<AvailabilityQuery>,
    Extension(service): Extension<Service>,
) -> Payload<Availability> {
    let available = service.is_available(&query.username, &query.email).await?;
    proceeds(Availability { available })
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterStudent {
    #[serde(flatten)]
    pub profile: StudentProfile,
    pub password: String,
    #[serde(default)]
    pub qualifications: Vec<NewQualification>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisteredStudent {
    pub id: i32,
    pub student_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginStudent {
    username: String,
    password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggedInStudent {
    session_id: String,
    expires_at: DateTime<Utc>,
    student: Student,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionToken {
    pub ssid: String,
}

/// Request body wrapper for endpoints that require a session token
/// alongside their payload.
#[derive(Debug, Clone, Deserialize)]
pub struct EnsureSession<V> {
    pub ssid: String,
    #[serde(flatten)]
    pub value: V,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionBasedResponse<V> {
    pub auth_result: AuthResult,
    #[serde(flatten)]
    pub value: Option<V>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDropped {
    pub student_id: i32,
    pub drop_success: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AvailabilityQuery {
    pub username: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Availability {
    pub available: bool,
}
