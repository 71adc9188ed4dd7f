use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::Row;

use crate::err::Error;

#[derive(Debug, Clone, Serialize)]
pub struct Student {
    pub id: i32,
    pub student_id: String,
    pub first_name: String,
    pub last_name: String,
    pub age: i32,
    pub dob: NaiveDate,
    pub gender: String,
    pub email: String,
    pub phone_number: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub qualifications: Vec<Qualification>,
}

// Qualifications live in their own table; the store attaches them after
// the row is decoded.
impl sqlx::FromRow<'_, PgRow> for Student {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            student_id: row.try_get("student_id")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            age: row.try_get("age")?,
            dob: row.try_get("dob")?,
            gender: row.try_get("gender")?,
            email: row.try_get("email")?,
            phone_number: row.try_get("phone_number")?,
            username: row.try_get("username")?,
            password_hash: row.try_get("password_hash")?,
            created_at: row.try_get("created_at")?,
            qualifications: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Qualification {
    pub id: i32,
    pub owner_id: i32,
    pub course_name: String,
    pub university: String,
    pub year_of_passing: i32,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StudentSession {
    pub ssid: String,
    pub belongs_to: i32,
    pub expires_at: DateTime<Utc>,
}

/// Scalar profile fields supplied at registration and overwritten
/// wholesale on edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentProfile {
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub age: i32,
    pub dob: NaiveDate,
    pub gender: String,
    pub email: String,
    pub phone_number: String,
    pub username: String,
}

impl StudentProfile {
    /// Boundary validation. The workflows below trust profiles that
    /// passed this check.
    pub fn validate(&self) -> Result<(), Error> {
        if self.first_name.is_empty() {
            return Err(invalid("`first_name` must not be empty"));
        }
        if self.username.len() < 3 {
            return Err(invalid("`username` must be at least 3 characters"));
        }
        if !(5..=100).contains(&self.age) {
            return Err(invalid("`age` must be between 5 and 100"));
        }
        if self.gender.is_empty() {
            return Err(invalid("`gender` must not be empty"));
        }
        if !self.email.contains('@') {
            return Err(invalid("`email` is not a valid address"));
        }
        if self.phone_number.len() != 10
            || !self.phone_number.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid("`phone_number` must be exactly 10 digits"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewQualification {
    pub course_name: String,
    pub university: String,
    pub year_of_passing: i32,
    pub percentage: f64,
}

/// A fully prepared record, ready for insertion: identifier allocated,
/// password already hashed.
#[derive(Debug, Clone)]
pub struct NewStudent {
    pub student_id: String,
    pub profile: StudentProfile,
    pub password_hash: String,
    pub qualifications: Vec<NewQualification>,
}

fn invalid(msg: &str) -> Error {
    Error::InvalidPayload {
        message: msg.to_string(),
    }
}
