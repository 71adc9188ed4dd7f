//! Workflow layer: everything between the HTTP handlers and the store.

use chrono::{Datelike, Duration, Utc};

use crate::auth::{self, AuthResult};
use crate::err::Error;
use crate::ident::next_student_id;
use crate::models::{NewQualification, NewStudent, Student, StudentProfile, StudentSession};
use crate::store::{StoreError, StudentStore};

/// How many times registration re-reads the latest identifier after
/// losing an allocation race to a concurrent insert.
const ALLOCATION_ATTEMPTS: u32 = 3;

const SESSION_TTL_DAYS: i64 = 2;

#[derive(Debug, Clone)]
pub enum Registration {
    Created(Student),
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    NotFound,
    Failed,
}

#[derive(Debug, Clone)]
pub struct StudentService<S> {
    store: S,
}

impl<S: StudentStore> StudentService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Registers a new student: existence check, identifier allocation,
    /// password hashing, then a single transactional insert.
    ///
    /// The `student_id` column is unique, so two registrations that read
    /// the same latest identifier cannot both commit; the loser re-reads
    /// and allocates the next number.
    pub async fn register(
        &self,
        profile: StudentProfile,
        qualifications: Vec<NewQualification>,
        password: &str,
    ) -> Result<Registration, Error> {
        if self
            .store
            .exists_by_username_or_email(&profile.username, &profile.email)
            .await?
        {
            return Ok(Registration::Conflict);
        }

        let password_hash = auth::hash_password(password)?;

        for attempt in 1..=ALLOCATION_ATTEMPTS {
            let latest = self.store.latest_student_id().await?;
            let student_id = next_student_id(latest.as_deref(), Utc::now().year());
            let new = NewStudent {
                student_id: student_id.clone(),
                profile: profile.clone(),
                password_hash: password_hash.clone(),
                qualifications: qualifications.clone(),
            };
            match self.store.insert(new).await {
                Ok(id) => {
                    let student = self.store.find_by_id(id).await?.ok_or_else(|| {
                        Error::InternalError {
                            kind: "DatabaseError",
                            message: format!("Student {} vanished right after insert!", id),
                        }
                    })?;
                    return Ok(Registration::Created(student));
                }
                Err(StoreError::DuplicateStudentId) => {
                    log::warn!(
                        "Identifier {} was taken by a concurrent registration, retrying ({}/{})",
                        student_id,
                        attempt,
                        ALLOCATION_ATTEMPTS
                    );
                    continue;
                }
                // Raced past the existence check into the unique index.
                Err(StoreError::DuplicateCredential) => return Ok(Registration::Conflict),
                Err(err) => return Err(err.into()),
            }
        }

        Err(Error::InternalError {
            kind: "AllocationConflict",
            message: "Could not allocate a student identifier!".to_string(),
        })
    }

    /// Credential check by username. `None` covers both an unknown user
    /// and a wrong password.
    pub async fn login(&self, username: &str, password: &str) -> Result<Option<Student>, Error> {
        let student = self.store.find_by_username(username).await?;
        Ok(student.filter(|s| auth::verify_password(password, &s.password_hash)))
    }

    pub async fn get(&self, id: i32) -> Result<Option<Student>, Error> {
        Ok(self.store.find_by_id(id).await?)
    }

    pub async fn is_available(&self, username: &str, email: &str) -> Result<bool, Error> {
        Ok(!self
            .store
            .exists_by_username_or_email(username, email)
            .await?)
    }

    /// Page of students ordered most-recently-created first. Out-of-range
    /// pages yield an empty set with the correct total.
    pub async fn list_page(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<Student>, i64), Error> {
        let page = page.max(1) as i64;
        let size = page_size.max(1) as i64;
        Ok(self.store.find_page((page - 1) * size, size).await?)
    }

    /// Overwrites the profile and replaces the qualification set
    /// wholesale. Persistence failures surface as `Failed`, absence as
    /// `NotFound`.
    pub async fn update(
        &self,
        id: i32,
        profile: StudentProfile,
        qualifications: Vec<NewQualification>,
    ) -> Result<UpdateOutcome, Error> {
        if self.store.find_by_id(id).await?.is_none() {
            return Ok(UpdateOutcome::NotFound);
        }
        match self.store.update(id, profile, qualifications).await {
            Ok(()) => Ok(UpdateOutcome::Updated),
            Err(err) => {
                log::error!("Failed to update student {}: {}", id, err);
                Ok(UpdateOutcome::Failed)
            }
        }
    }

    /// Deletes the student, cascading to qualifications and sessions.
    pub async fn delete(&self, id: i32) -> Result<bool, Error> {
        match self.store.delete(id).await {
            Ok(deleted) => Ok(deleted),
            Err(err) => {
                log::error!("Failed to delete student {}: {}", id, err);
                Ok(false)
            }
        }
    }

    /// Issues a session token for a logged-in student, reusing a live one
    /// if it exists.
    pub async fn issue_session(&self, student: i32) -> Result<StudentSession, Error> {
        if let Some(existing) = self.store.find_session_for(student).await? {
            if Utc::now().lt(&existing.expires_at) {
                // already authenticated
                return Ok(existing);
            }
            self.store.delete_session(&existing.ssid).await?;
        }

        let session = StudentSession {
            ssid: auth::generate_ssid(),
            belongs_to: student,
            expires_at: Utc::now() + Duration::days(SESSION_TTL_DAYS),
        };
        self.store.create_session(&session).await?;
        Ok(session)
    }

    pub async fn authenticate(
        &self,
        ssid: &str,
    ) -> Result<(AuthResult, Option<StudentSession>), Error> {
        if ssid.is_empty() {
            return Ok((AuthResult::InvalidSession, None));
        }
        match self.store.find_session(ssid).await? {
            Some(session) => {
                if Utc::now().gt(&session.expires_at) {
                    self.store.delete_session(ssid).await?;
                    return Ok((AuthResult::SessionExpired, None));
                }
                Ok((AuthResult::Success, Some(session)))
            }
            None => Ok((AuthResult::InvalidSession, None)),
        }
    }

    pub async fn drop_session(&self, ssid: &str) -> Result<bool, Error> {
        Ok(self.store.delete_session(ssid).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    use crate::models::Qualification;

    /// In-memory stand-in for the Postgres store, enforcing the same
    /// uniqueness rules and descending-id ordering.
    #[derive(Default)]
    struct MemStore {
        state: Mutex<MemState>,
        /// Pending forced losses of the identifier-allocation race: each
        /// one inserts a competing record with the identifier the caller
        /// tried to claim.
        forced_races: AtomicU32,
        /// When set, update/delete report a database failure.
        fail_writes: AtomicBool,
    }

    #[derive(Default)]
    struct MemState {
        students: Vec<Student>,
        sessions: Vec<StudentSession>,
        next_student: i32,
        next_qualification: i32,
        race_counter: u32,
    }

    impl MemState {
        fn materialize(&mut self, new: &NewStudent) -> Student {
            self.next_student += 1;
            let id = self.next_student;
            let qualifications = new
                .qualifications
                .iter()
                .map(|q| {
                    self.next_qualification += 1;
                    Qualification {
                        id: self.next_qualification,
                        owner_id: id,
                        course_name: q.course_name.clone(),
                        university: q.university.clone(),
                        year_of_passing: q.year_of_passing,
                        percentage: q.percentage,
                    }
                })
                .collect();
            Student {
                id,
                student_id: new.student_id.clone(),
                first_name: new.profile.first_name.clone(),
                last_name: new.profile.last_name.clone(),
                age: new.profile.age,
                dob: new.profile.dob,
                gender: new.profile.gender.clone(),
                email: new.profile.email.clone(),
                phone_number: new.profile.phone_number.clone(),
                username: new.profile.username.clone(),
                password_hash: new.password_hash.clone(),
                created_at: Utc::now(),
                qualifications,
            }
        }
    }

    fn db_failure() -> StoreError {
        StoreError::Database(sqlx::Error::PoolClosed)
    }

    #[async_trait]
    impl StudentStore for MemStore {
        async fn find_by_id(&self, id: i32) -> Result<Option<Student>, StoreError> {
            let state = self.state.lock().unwrap();
            Ok(state.students.iter().find(|s| s.id == id).cloned())
        }

        async fn find_by_username(&self, username: &str) -> Result<Option<Student>, StoreError> {
            let state = self.state.lock().unwrap();
            Ok(state.students.iter().find(|s| s.username == username).cloned())
        }

        async fn find_page(
            &self,
            offset: i64,
            limit: i64,
        ) -> Result<(Vec<Student>, i64), StoreError> {
            let state = self.state.lock().unwrap();
            let total = state.students.len() as i64;
            let mut ordered: Vec<Student> = state.students.clone();
            ordered.sort_by(|a, b| b.id.cmp(&a.id));
            let items = ordered
                .into_iter()
                .skip(offset.max(0) as usize)
                .take(limit.max(0) as usize)
                .collect();
            Ok((items, total))
        }

        async fn exists_by_username_or_email(
            &self,
            username: &str,
            email: &str,
        ) -> Result<bool, StoreError> {
            let state = self.state.lock().unwrap();
            Ok(state
                .students
                .iter()
                .any(|s| s.username == username || s.email == email))
        }

        async fn latest_student_id(&self) -> Result<Option<String>, StoreError> {
            let state = self.state.lock().unwrap();
            Ok(state
                .students
                .iter()
                .max_by_key(|s| s.id)
                .map(|s| s.student_id.clone()))
        }

        async fn insert(&self, new: NewStudent) -> Result<i32, StoreError> {
            let mut state = self.state.lock().unwrap();
            if self.forced_races.load(Ordering::SeqCst) > 0 {
                self.forced_races.fetch_sub(1, Ordering::SeqCst);
                // A concurrent registration claims the identifier first.
                state.race_counter += 1;
                let n = state.race_counter;
                let winner = NewStudent {
                    student_id: new.student_id.clone(),
                    profile: StudentProfile {
                        username: format!("winner{}", n),
                        email: format!("winner{}@x.com", n),
                        ..new.profile.clone()
                    },
                    password_hash: new.password_hash.clone(),
                    qualifications: vec![],
                };
                let record = state.materialize(&winner);
                state.students.push(record);
                return Err(StoreError::DuplicateStudentId);
            }
            if state
                .students
                .iter()
                .any(|s| s.username == new.profile.username || s.email == new.profile.email)
            {
                return Err(StoreError::DuplicateCredential);
            }
            if state.students.iter().any(|s| s.student_id == new.student_id) {
                return Err(StoreError::DuplicateStudentId);
            }
            let record = state.materialize(&new);
            let id = record.id;
            state.students.push(record);
            Ok(id)
        }

        async fn update(
            &self,
            id: i32,
            profile: StudentProfile,
            qualifications: Vec<NewQualification>,
        ) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(db_failure());
            }
            let mut state = self.state.lock().unwrap();
            let replacements: Vec<Qualification> = qualifications
                .iter()
                .map(|q| {
                    state.next_qualification += 1;
                    Qualification {
                        id: state.next_qualification,
                        owner_id: id,
                        course_name: q.course_name.clone(),
                        university: q.university.clone(),
                        year_of_passing: q.year_of_passing,
                        percentage: q.percentage,
                    }
                })
                .collect();
            let student = state
                .students
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or_else(db_failure)?;
            student.first_name = profile.first_name;
            student.last_name = profile.last_name;
            student.age = profile.age;
            student.dob = profile.dob;
            student.gender = profile.gender;
            student.email = profile.email;
            student.phone_number = profile.phone_number;
            student.username = profile.username;
            student.qualifications = replacements;
            Ok(())
        }

        async fn delete(&self, id: i32) -> Result<bool, StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(db_failure());
            }
            let mut state = self.state.lock().unwrap();
            let before = state.students.len();
            state.students.retain(|s| s.id != id);
            state.sessions.retain(|s| s.belongs_to != id);
            Ok(state.students.len() < before)
        }

        async fn create_session(&self, session: &StudentSession) -> Result<(), StoreError> {
            let mut state = self.state.lock().unwrap();
            state.sessions.push(session.clone());
            Ok(())
        }

        async fn find_session(&self, ssid: &str) -> Result<Option<StudentSession>, StoreError> {
            let state = self.state.lock().unwrap();
            Ok(state.sessions.iter().find(|s| s.ssid == ssid).cloned())
        }

        async fn find_session_for(
            &self,
            student: i32,
        ) -> Result<Option<StudentSession>, StoreError> {
            let state = self.state.lock().unwrap();
            Ok(state
                .sessions
                .iter()
                .find(|s| s.belongs_to == student)
                .cloned())
        }

        async fn delete_session(&self, ssid: &str) -> Result<bool, StoreError> {
            let mut state = self.state.lock().unwrap();
            let before = state.sessions.len();
            state.sessions.retain(|s| s.ssid != ssid);
            Ok(state.sessions.len() < before)
        }
    }

    fn profile(username: &str, email: &str) -> StudentProfile {
        StudentProfile {
            first_name: "Test".to_string(),
            last_name: "Student".to_string(),
            age: 20,
            dob: NaiveDate::from_ymd_opt(2005, 6, 1).unwrap(),
            gender: "F".to_string(),
            email: email.to_string(),
            phone_number: "0123456789".to_string(),
            username: username.to_string(),
        }
    }

    fn qualification(course: &str) -> NewQualification {
        NewQualification {
            course_name: course.to_string(),
            university: "Test University".to_string(),
            year_of_passing: 2023,
            percentage: 87.5,
        }
    }

    /// Seeds a record directly through the store, skipping the slow
    /// password hash.
    async fn seed(service: &StudentService<MemStore>, n: u32) -> i32 {
        let latest = service.store.latest_student_id().await.unwrap();
        let student_id = next_student_id(latest.as_deref(), Utc::now().year());
        service
            .store
            .insert(NewStudent {
                student_id,
                profile: profile(&format!("user{}", n), &format!("user{}@x.com", n)),
                password_hash: "not-a-real-hash".to_string(),
                qualifications: vec![qualification("Course")],
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn registration_allocates_first_identifier() {
        let service = StudentService::new(MemStore::default());
        let outcome = service
            .register(profile("alice", "alice@x.com"), vec![], "Secret1")
            .await
            .unwrap();
        match outcome {
            Registration::Created(student) => {
                assert_eq!(
                    student.student_id,
                    format!("STU-{}-0001", Utc::now().year())
                );
            }
            Registration::Conflict => panic!("unexpected conflict"),
        }
    }

    #[tokio::test]
    async fn registration_rejects_username_and_email_conflicts() {
        let service = StudentService::new(MemStore::default());
        seed(&service, 1).await;

        // Same username, fresh email.
        let outcome = service
            .register(profile("user1", "fresh@x.com"), vec![], "Secret1")
            .await
            .unwrap();
        assert!(matches!(outcome, Registration::Conflict));

        // Fresh username, same email.
        let outcome = service
            .register(profile("fresh", "user1@x.com"), vec![], "Secret1")
            .await
            .unwrap();
        assert!(matches!(outcome, Registration::Conflict));

        let (_, total) = service.list_page(1, 10).await.unwrap();
        assert_eq!(total, 1, "conflicts must not create records");
    }

    #[tokio::test]
    async fn registration_retries_after_losing_allocation_race() {
        let service = StudentService::new(MemStore::default());
        seed(&service, 1).await;
        service.store.forced_races.store(1, Ordering::SeqCst);

        let outcome = service
            .register(profile("carol", "carol@x.com"), vec![], "Secret1")
            .await
            .unwrap();
        let student = match outcome {
            Registration::Created(student) => student,
            Registration::Conflict => panic!("unexpected conflict"),
        };
        // Seed took 0001, the race winner 0002, the retry lands on 0003.
        assert_eq!(
            student.student_id,
            format!("STU-{}-0003", Utc::now().year())
        );

        let (_, total) = service.list_page(1, 10).await.unwrap();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn registration_gives_up_after_repeated_races() {
        let service = StudentService::new(MemStore::default());
        service.store.forced_races.store(10, Ordering::SeqCst);

        let result = service
            .register(profile("dave", "dave@x.com"), vec![], "Secret1")
            .await;
        assert!(matches!(
            result,
            Err(Error::InternalError {
                kind: "AllocationConflict",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn paging_returns_descending_windows_and_full_total() {
        let service = StudentService::new(MemStore::default());
        for n in 1..=7 {
            seed(&service, n).await;
        }

        let (items, total) = service.list_page(1, 3).await.unwrap();
        assert_eq!(total, 7);
        assert_eq!(items.iter().map(|s| s.id).collect::<Vec<_>>(), vec![7, 6, 5]);

        let (items, total) = service.list_page(2, 3).await.unwrap();
        assert_eq!(total, 7);
        assert_eq!(items.iter().map(|s| s.id).collect::<Vec<_>>(), vec![4, 3, 2]);

        let (items, _) = service.list_page(3, 3).await.unwrap();
        assert_eq!(items.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1]);

        // Out-of-range page: empty, total intact.
        let (items, total) = service.list_page(4, 3).await.unwrap();
        assert!(items.is_empty());
        assert_eq!(total, 7);
    }

    #[tokio::test]
    async fn update_replaces_qualifications_wholesale() {
        let service = StudentService::new(MemStore::default());
        let id = seed(&service, 1).await;
        let before = service.get(id).await.unwrap().unwrap();
        assert_eq!(before.qualifications.len(), 1);
        assert_eq!(before.qualifications[0].course_name, "Course");

        let replacement = vec![qualification("Mathematics"), qualification("Physics")];
        let outcome = service
            .update(id, profile("user1", "user1@x.com"), replacement)
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Updated);

        let after = service.get(id).await.unwrap().unwrap();
        let courses: Vec<&str> = after
            .qualifications
            .iter()
            .map(|q| q.course_name.as_str())
            .collect();
        assert_eq!(courses, vec!["Mathematics", "Physics"]);
        assert!(after.qualifications.iter().all(|q| q.owner_id == id));
    }

    #[tokio::test]
    async fn update_reports_absence_and_failure_distinctly() {
        let service = StudentService::new(MemStore::default());
        let id = seed(&service, 1).await;

        let outcome = service
            .update(id + 100, profile("ghost", "ghost@x.com"), vec![])
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::NotFound);

        service.store.fail_writes.store(true, Ordering::SeqCst);
        let outcome = service
            .update(id, profile("user1", "user1@x.com"), vec![])
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Failed);
    }

    #[tokio::test]
    async fn delete_removes_record_and_flattens_failures() {
        let service = StudentService::new(MemStore::default());
        let id = seed(&service, 1).await;

        assert!(service.delete(id).await.unwrap());
        assert!(service.get(id).await.unwrap().is_none());
        assert!(!service.delete(id).await.unwrap());

        let id = seed(&service, 2).await;
        service.store.fail_writes.store(true, Ordering::SeqCst);
        assert!(!service.delete(id).await.unwrap());
    }

    #[tokio::test]
    async fn sessions_are_issued_reused_and_dropped() {
        let service = StudentService::new(MemStore::default());
        let id = seed(&service, 1).await;

        let session = service.issue_session(id).await.unwrap();
        let again = service.issue_session(id).await.unwrap();
        assert_eq!(session.ssid, again.ssid, "live session should be reused");

        let (result, found) = service.authenticate(&session.ssid).await.unwrap();
        assert_eq!(result, AuthResult::Success);
        assert_eq!(found.unwrap().belongs_to, id);

        let (result, _) = service.authenticate("").await.unwrap();
        assert_eq!(result, AuthResult::InvalidSession);
        let (result, _) = service.authenticate("bogus").await.unwrap();
        assert_eq!(result, AuthResult::InvalidSession);

        assert!(service.drop_session(&session.ssid).await.unwrap());
        let (result, _) = service.authenticate(&session.ssid).await.unwrap();
        assert_eq!(result, AuthResult::InvalidSession);
    }

    #[tokio::test]
    async fn expired_sessions_are_evicted() {
        let service = StudentService::new(MemStore::default());
        let id = seed(&service, 1).await;

        let stale = StudentSession {
            ssid: "stale".to_string(),
            belongs_to: id,
            expires_at: Utc::now() - Duration::days(1),
        };
        service.store.create_session(&stale).await.unwrap();

        let (result, found) = service.authenticate("stale").await.unwrap();
        assert_eq!(result, AuthResult::SessionExpired);
        assert!(found.is_none());
        // Evicted, so a second probe is merely invalid.
        let (result, _) = service.authenticate("stale").await.unwrap();
        assert_eq!(result, AuthResult::InvalidSession);

        // A fresh issue replaces the expired token instead of reusing it.
        let stale = StudentSession {
            ssid: "stale2".to_string(),
            belongs_to: id,
            expires_at: Utc::now() - Duration::days(1),
        };
        service.store.create_session(&stale).await.unwrap();
        let session = service.issue_session(id).await.unwrap();
        assert_ne!(session.ssid, "stale2");
    }

    #[tokio::test]
    async fn register_login_end_to_end() {
        let service = StudentService::new(MemStore::default());

        let outcome = service
            .register(
                profile("alice", "alice@x.com"),
                vec![qualification("Computer Science")],
                "Secret1",
            )
            .await
            .unwrap();
        let alice = match outcome {
            Registration::Created(student) => student,
            Registration::Conflict => panic!("unexpected conflict"),
        };
        assert_eq!(alice.student_id, format!("STU-{}-0001", Utc::now().year()));

        // Bob reuses alice's email.
        let outcome = service
            .register(profile("bob", "alice@x.com"), vec![], "Hunter2")
            .await
            .unwrap();
        assert!(matches!(outcome, Registration::Conflict));

        assert!(service.login("alice", "wrong").await.unwrap().is_none());
        assert!(service.login("nobody", "Secret1").await.unwrap().is_none());

        let logged_in = service.login("alice", "Secret1").await.unwrap().unwrap();
        assert_eq!(logged_in.id, alice.id);
        assert_eq!(logged_in.qualifications.len(), 1);
        assert_eq!(logged_in.qualifications[0].course_name, "Computer Science");

        assert!(service.is_available("carol", "carol@x.com").await.unwrap());
        assert!(!service.is_available("alice", "carol@x.com").await.unwrap());
    }
}
