use axum::extract::{Path, Query};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use crate::auth::{AuthResult, EnsureSession, SessionBasedResponse, SessionToken};
use crate::err::Error;
use crate::models::{NewQualification, Student, StudentProfile, StudentSession};
use crate::service::UpdateOutcome;
use crate::{breaks, proceeds, Payload, Service};

const DEFAULT_PAGE_SIZE: u32 = 15;

pub async fn list_students(
    Query(query): Query<ListQuery>,
    Extension(service): Extension<Service>,
) -> Payload<StudentPage> {
    let page = query.page.max(1);
    let page_size = query.per_page.max(1);
    let (students, total_items) = service.list_page(page, page_size).await?;
    log::info!(
        "Retrieved {} students for page {} (of {} total)",
        students.len(),
        page,
        total_items
    );

    let total_pages = (total_items + page_size as i64 - 1) / page_size as i64;
    proceeds(StudentPage {
        students,
        current_page: page,
        page_size,
        total_items,
        total_pages,
        has_previous_page: page > 1,
        has_next_page: (page as i64) < total_pages,
    })
}

pub async fn read_student(
    Path(id): Path<i32>,
    Extension(service): Extension<Service>,
) -> Payload<Student> {
    match service.get(id).await? {
        Some(student) => proceeds(student),
        None => breaks(Error::UserDoesNotExist {
            message: format!("Student with id `{}` does not exist!", id),
        }),
    }
}

pub async fn update_student(
    Path(id): Path<i32>,
    Json(EnsureSession { ssid, value }): Json<EnsureSession<UpdateStudent>>,
    Extension(service): Extension<Service>,
) -> Payload<SessionBasedResponse<StudentUpdated>> {
    let session = match authorize(&service, &ssid, id).await? {
        Ok(session) => session,
        Err(response) => return response,
    };
    if let Err(err) = value.profile.validate() {
        return breaks(err);
    }

    let outcome = service
        .update(id, value.profile, value.qualifications)
        .await?;
    match outcome {
        UpdateOutcome::Updated => {
            log::info!("Student {} updated their profile", id);
            proceeds(SessionBasedResponse {
                auth_result: AuthResult::Success,
                value: Some(StudentUpdated { id }),
            })
        }
        UpdateOutcome::NotFound => breaks(Error::UserDoesNotExist {
            message: format!("Student with id `{}` does not exist!", id),
        }),
        UpdateOutcome::Failed => {
            log::error!("Failed to update student {}, session {}", id, session.ssid);
            breaks(Error::InternalError {
                kind: "DatabaseError",
                message: "An error occurred while updating the student!".to_string(),
            })
        }
    }
}

pub async fn delete_student(
    Path(id): Path<i32>,
    Json(SessionToken { ssid }): Json<SessionToken>,
    Extension(service): Extension<Service>,
) -> Payload<SessionBasedResponse<StudentDeleted>> {
    if let Err(response) = authorize(&service, &ssid, id).await? {
        return response;
    }

    let deleted = service.delete(id).await?;
    if deleted {
        log::info!("Student {} deleted their account", id);
    }
    proceeds(SessionBasedResponse {
        auth_result: AuthResult::Success,
        value: Some(StudentDeleted {
            student_id: id,
            delete_success: deleted,
        }),
    })
}

/// Validates the session token and checks that it belongs to the student
/// being modified. Self-service only, there are no admin accounts.
async fn authorize<T: Serialize>(
    service: &Service,
    ssid: &str,
    target: i32,
) -> Result<Result<StudentSession, Payload<SessionBasedResponse<T>>>, Error> {
    let (auth_result, session) = service.authenticate(ssid).await?;
    let session = match session {
        Some(session) => session,
        None => {
            return Ok(Err(proceeds(SessionBasedResponse {
                auth_result,
                value: None,
            })))
        }
    };
    if session.belongs_to != target {
        log::warn!(
            "Student {} tried to modify student {}",
            session.belongs_to,
            target
        );
        return Ok(Err(breaks(Error::Forbidden {
            message: "You can only modify your own profile!".to_string(),
        })));
    }
    Ok(Ok(session))
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListQuery {
    #[serde(default = "first_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub per_page: u32,
}

fn first_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentPage {
    pub students: Vec<Student>,
    pub current_page: u32,
    pub page_size: u32,
    pub total_items: i64,
    pub total_pages: i64,
    pub has_previous_page: bool,
    pub has_next_page: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateStudent {
    #[serde(flatten)]
    pub profile: StudentProfile,
    #[serde(default)]
    pub qualifications: Vec<NewQualification>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentUpdated {
    pub id: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentDeleted {
    pub student_id: i32,
    pub delete_success: bool,
}
