//! Persistence layer for student records and sessions.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::fmt;

use crate::models::{NewQualification, NewStudent, Qualification, Student, StudentProfile, StudentSession};

/// Store-level failure, discriminated enough for the workflows to react:
/// a duplicate identifier triggers an allocation retry, a duplicate
/// credential is a registration conflict.
#[derive(Debug)]
pub enum StoreError {
    DuplicateStudentId,
    DuplicateCredential,
    Database(sqlx::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateStudentId => write!(f, "duplicate student identifier"),
            Self::DuplicateCredential => write!(f, "duplicate username or email"),
            Self::Database(err) => write!(f, "database error: {}", err),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db) = err {
            match db.constraint() {
                Some("students_student_id_key") => return Self::DuplicateStudentId,
                Some("students_username_key") | Some("students_email_key") => {
                    return Self::DuplicateCredential
                }
                _ => {}
            }
        }
        Self::Database(err)
    }
}

#[async_trait]
pub trait StudentStore: Send + Sync {
    async fn find_by_id(&self, id: i32) -> Result<Option<Student>, StoreError>;
    async fn find_by_username(&self, username: &str) -> Result<Option<Student>, StoreError>;
    /// Page of students ordered by surrogate key descending, plus the
    /// full record count at query time.
    async fn find_page(&self, offset: i64, limit: i64) -> Result<(Vec<Student>, i64), StoreError>;
    async fn exists_by_username_or_email(
        &self,
        username: &str,
        email: &str,
    ) -> Result<bool, StoreError>;
    /// Identifier of the most recently created record, if any.
    async fn latest_student_id(&self) -> Result<Option<String>, StoreError>;
    /// Inserts the student with its qualifications in one transaction and
    /// returns the assigned surrogate key.
    async fn insert(&self, new: NewStudent) -> Result<i32, StoreError>;
    /// Overwrites scalar fields and replaces the qualification set
    /// wholesale in one transaction.
    async fn update(
        &self,
        id: i32,
        profile: StudentProfile,
        qualifications: Vec<NewQualification>,
    ) -> Result<(), StoreError>;
    async fn delete(&self, id: i32) -> Result<bool, StoreError>;

    async fn create_session(&self, session: &StudentSession) -> Result<(), StoreError>;
    async fn find_session(&self, ssid: &str) -> Result<Option<StudentSession>, StoreError>;
    async fn find_session_for(&self, student: i32) -> Result<Option<StudentSession>, StoreError>;
    async fn delete_session(&self, ssid: &str) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_qualifications(&self, students: &mut [Student]) -> Result<(), StoreError> {
        if students.is_empty() {
            return Ok(());
        }
        let ids: Vec<i32> = students.iter().map(|s| s.id).collect();
        let qualifications = sqlx::query_as::<_, Qualification>(
            "SELECT * FROM qualifications WHERE owner_id = ANY($1) ORDER BY id",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        for qualification in qualifications {
            if let Some(student) = students.iter_mut().find(|s| s.id == qualification.owner_id) {
                student.qualifications.push(qualification);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StudentStore for PgStore {
    async fn find_by_id(&self, id: i32) -> Result<Option<Student>, StoreError> {
        let student = sqlx::query_as::<_, Student>("SELECT * FROM students WHERE id = $1 LIMIT 1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match student {
            Some(mut student) => {
                self.load_qualifications(std::slice::from_mut(&mut student))
                    .await?;
                Ok(Some(student))
            }
            None => Ok(None),
        }
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Student>, StoreError> {
        let student =
            sqlx::query_as::<_, Student>("SELECT * FROM students WHERE username = $1 LIMIT 1")
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;
        match student {
            Some(mut student) => {
                self.load_qualifications(std::slice::from_mut(&mut student))
                    .await?;
                Ok(Some(student))
            }
            None => Ok(None),
        }
    }

    async fn find_page(&self, offset: i64, limit: i64) -> Result<(Vec<Student>, i64), StoreError> {
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM students")
            .fetch_one(&self.pool)
            .await?;
        let mut students = sqlx::query_as::<_, Student>(
            "SELECT * FROM students ORDER BY id DESC OFFSET $1 LIMIT $2",
        )
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        self.load_qualifications(&mut students).await?;
        Ok((students, total))
    }

    async fn exists_by_username_or_email(
        &self,
        username: &str,
        email: &str,
    ) -> Result<bool, StoreError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM students WHERE username = $1 OR email = $2)",
        )
        .bind(username)
        .bind(email)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn latest_student_id(&self) -> Result<Option<String>, StoreError> {
        let latest = sqlx::query_scalar::<_, String>(
            "SELECT student_id FROM students ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(latest)
    }

    async fn insert(&self, new: NewStudent) -> Result<i32, StoreError> {
        let mut tx = self.pool.begin().await?;
        let id = sqlx::query_scalar::<_, i32>(
            "INSERT INTO students \
             (student_id, first_name, last_name, age, dob, gender, email, phone_number, username, password_hash, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) RETURNING id",
        )
        .bind(&new.student_id)
        .bind(&new.profile.first_name)
        .bind(&new.profile.last_name)
        .bind(new.profile.age)
        .bind(new.profile.dob)
        .bind(&new.profile.gender)
        .bind(&new.profile.email)
        .bind(&new.profile.phone_number)
        .bind(&new.profile.username)
        .bind(&new.password_hash)
        .bind(Utc::now())
        .fetch_one(&mut tx)
        .await?;

        for qualification in &new.qualifications {
            sqlx::query(
                "INSERT INTO qualifications (owner_id, course_name, university, year_of_passing, percentage) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(id)
            .bind(&qualification.course_name)
            .bind(&qualification.university)
            .bind(qualification.year_of_passing)
            .bind(qualification.percentage)
            .execute(&mut tx)
            .await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    async fn update(
        &self,
        id: i32,
        profile: StudentProfile,
        qualifications: Vec<NewQualification>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE students SET \
             first_name = $1, last_name = $2, age = $3, dob = $4, gender = $5, \
             email = $6, phone_number = $7, username = $8 WHERE id = $9",
        )
        .bind(&profile.first_name)
        .bind(&profile.last_name)
        .bind(profile.age)
        .bind(profile.dob)
        .bind(&profile.gender)
        .bind(&profile.email)
        .bind(&profile.phone_number)
        .bind(&profile.username)
        .bind(id)
        .execute(&mut tx)
        .await?;

        // Wholesale replacement, no diffing.
        sqlx::query("DELETE FROM qualifications WHERE owner_id = $1")
            .bind(id)
            .execute(&mut tx)
            .await?;
        for qualification in &qualifications {
            sqlx::query(
                "INSERT INTO qualifications (owner_id, course_name, university, year_of_passing, percentage) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(id)
            .bind(&qualification.course_name)
            .bind(&qualification.university)
            .bind(qualification.year_of_passing)
            .bind(qualification.percentage)
            .execute(&mut tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, id: i32) -> Result<bool, StoreError> {
        let affected = sqlx::query("DELETE FROM students WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(affected.rows_affected() >= 1)
    }

    async fn create_session(&self, session: &StudentSession) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO user_sessions VALUES ($1, $2, $3)")
            .bind(&session.ssid)
            .bind(session.belongs_to)
            .bind(session.expires_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_session(&self, ssid: &str) -> Result<Option<StudentSession>, StoreError> {
        let session = sqlx::query_as::<_, StudentSession>(
            "SELECT * FROM user_sessions WHERE ssid = $1 LIMIT 1",
        )
        .bind(ssid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn find_session_for(&self, student: i32) -> Result<Option<StudentSession>, StoreError> {
        let session = sqlx::query_as::<_, StudentSession>(
            "SELECT * FROM user_sessions WHERE belongs_to = $1 LIMIT 1",
        )
        .bind(student)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn delete_session(&self, ssid: &str) -> Result<bool, StoreError> {
        let affected = sqlx::query("DELETE FROM user_sessions WHERE ssid = $1")
            .bind(ssid)
            .execute(&self.pool)
            .await?;
        Ok(affected.rows_affected() >= 1)
    }
}

/// Creates the tables on startup if they are missing. The unique
/// constraint on `student_id` is what makes the allocation retry in the
/// registration workflow sound.
pub async fn prepare_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS students (\
             id SERIAL PRIMARY KEY,\
             student_id TEXT NOT NULL UNIQUE,\
             first_name TEXT NOT NULL,\
             last_name TEXT NOT NULL DEFAULT '',\
             age INT NOT NULL,\
             dob DATE NOT NULL,\
             gender TEXT NOT NULL,\
             email TEXT NOT NULL UNIQUE,\
             phone_number TEXT NOT NULL,\
             username TEXT NOT NULL UNIQUE,\
             password_hash TEXT NOT NULL,\
             created_at TIMESTAMPTZ NOT NULL\
         )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS qualifications (\
             id SERIAL PRIMARY KEY,\
             owner_id INT NOT NULL REFERENCES students(id) ON DELETE CASCADE,\
             course_name TEXT NOT NULL,\
             university TEXT NOT NULL,\
             year_of_passing INT NOT NULL,\
             percentage DOUBLE PRECISION NOT NULL\
         )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS user_sessions (\
             ssid TEXT PRIMARY KEY,\
             belongs_to INT NOT NULL REFERENCES students(id) ON DELETE CASCADE,\
             expires_at TIMESTAMPTZ NOT NULL\
         )",
    )
    .execute(pool)
    .await?;

    Ok(())
}
