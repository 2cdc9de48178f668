//! The HTTP surface. Handlers speak JSON; photo uploads arrive as
//! multipart form data in a field named "file".

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use rollcall_core::PipelineError;
use rollcall_store::{DescriptorError, DescriptorStore, Role, SchoolStore, StoreError, User};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::engine::{EngineError, EngineHandle};
use crate::session::{run_session, SessionError, SessionOutcome};

#[derive(Clone)]
pub struct AppState {
    pub school: SchoolStore,
    pub descriptors: DescriptorStore,
    pub engine: EngineHandle,
    pub match_threshold: f32,
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/users", post(create_user))
        .route("/api/users/{username}", get(get_user).put(update_user))
        .route("/api/users/{username}/courses", get(user_courses))
        .route(
            "/api/users/{username}/descriptor",
            put(enroll_descriptor).delete(remove_descriptor),
        )
        .route("/api/courses", post(create_course).get(list_courses))
        .route(
            "/api/courses/{course_id}",
            get(course_detail).put(rename_course).delete(delete_course),
        )
        .route(
            "/api/courses/{course_id}/roster",
            get(roster).post(add_to_roster),
        )
        .route(
            "/api/courses/{course_id}/attendance",
            post(take_attendance).get(course_records),
        )
        .route(
            "/api/courses/{course_id}/attendance/{username}",
            get(student_record),
        )
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// An error carrying the HTTP status it maps to. The body is always
/// `{"error": "<message>"}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message, "request failed");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::UserNotFound(_)
            | StoreError::CourseNotFound(_)
            | StoreError::NotEnrolled { .. } => StatusCode::NOT_FOUND,
            StoreError::UserExists(_)
            | StoreError::CourseExists(_)
            | StoreError::AlreadyEnrolled { .. } => StatusCode::CONFLICT,
            StoreError::WrongRole { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            StoreError::BadRole(_)
            | StoreError::CorruptStatus(_)
            | StoreError::Db(_)
            | StoreError::Connection(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<DescriptorError> for ApiError {
    fn from(err: DescriptorError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::Pipeline(PipelineError::UnreadablePhoto(_)) => StatusCode::BAD_REQUEST,
            EngineError::Pipeline(PipelineError::NoFaceDetected) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EngineError::Pipeline(_) | EngineError::ChannelClosed => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        Self::new(status, err.to_string())
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Store(e) => e.into(),
            SessionError::Descriptor(e) => e.into(),
            SessionError::Engine(e) => e.into(),
            SessionError::Match(e) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}

fn non_empty(name: &'static str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("{name} must not be empty"),
        ));
    }
    Ok(())
}

/// Pull the photo bytes out of a multipart upload.
async fn read_photo(mut multipart: Multipart) -> Result<Vec<u8>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::new(e.status(), e.to_string()))?
    {
        if field.name() == Some("file") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::new(e.status(), e.to_string()))?;
            if bytes.is_empty() {
                return Err(ApiError::new(
                    StatusCode::BAD_REQUEST,
                    "uploaded photo is empty",
                ));
            }
            return Ok(bytes.to_vec());
        }
    }
    Err(ApiError::new(
        StatusCode::BAD_REQUEST,
        "multipart field \"file\" is required",
    ))
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "service": "rollcalld",
        "version": env!("CARGO_PKG_VERSION"),
        "models": state.engine.models(),
        "match_threshold": state.match_threshold,
    }))
}

#[derive(Deserialize)]
struct CreateUser {
    username: String,
    nickname: String,
    role: Role,
}

async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUser>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    non_empty("username", &req.username)?;
    non_empty("nickname", &req.nickname)?;
    let user = state
        .school
        .create_user(&req.username, &req.nickname, req.role)
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[derive(Serialize)]
struct UserDetail {
    #[serde(flatten)]
    user: User,
    has_descriptor: bool,
}

async fn get_user(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<UserDetail>, ApiError> {
    let user = state.school.user_by_username(&username).await?;
    let has_descriptor = state.descriptors.contains(&username).await?;
    Ok(Json(UserDetail {
        user,
        has_descriptor,
    }))
}

#[derive(Deserialize)]
struct UpdateUser {
    nickname: String,
}

async fn update_user(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Json(req): Json<UpdateUser>,
) -> Result<Json<User>, ApiError> {
    non_empty("nickname", &req.nickname)?;
    Ok(Json(state.school.set_nickname(&username, &req.nickname).await?))
}

async fn user_courses(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<Vec<rollcall_store::Course>>, ApiError> {
    Ok(Json(state.school.courses_of_student(&username).await?))
}

async fn enroll_descriptor(
    State(state): State<AppState>,
    Path(username): Path<String>,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.school.user_by_username(&username).await?;
    let photo = read_photo(multipart).await?;
    let start = std::time::Instant::now();
    let embedding = state.engine.enroll(photo).await?;
    state.descriptors.put(&username, &embedding).await?;
    tracing::info!(
        username = %username,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "descriptor enrolled"
    );
    Ok(Json(json!({
        "username": username,
        "dim": embedding.dim(),
        "model_version": embedding.model_version,
    })))
}

async fn remove_descriptor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.school.user_by_username(&username).await?;
    if state.descriptors.remove(&username).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("no descriptor stored for {username}"),
        ))
    }
}

#[derive(Deserialize)]
struct CreateCourse {
    id: String,
    name: String,
    teacher: String,
}

async fn create_course(
    State(state): State<AppState>,
    Json(req): Json<CreateCourse>,
) -> Result<(StatusCode, Json<rollcall_store::Course>), ApiError> {
    non_empty("id", &req.id)?;
    non_empty("name", &req.name)?;
    let course = state
        .school
        .create_course(&req.id, &req.name, &req.teacher)
        .await?;
    Ok((StatusCode::CREATED, Json(course)))
}

#[derive(Deserialize)]
struct CourseFilter {
    teacher: Option<String>,
}

async fn list_courses(
    State(state): State<AppState>,
    Query(filter): Query<CourseFilter>,
) -> Result<Json<Vec<rollcall_store::Course>>, ApiError> {
    let courses = match filter.teacher {
        Some(teacher) => state.school.courses_by_teacher(&teacher).await?,
        None => state.school.courses().await?,
    };
    Ok(Json(courses))
}

async fn course_detail(
    State(state): State<AppState>,
    Path(course_id): Path<String>,
) -> Result<Json<rollcall_store::Course>, ApiError> {
    Ok(Json(state.school.course(&course_id).await?))
}

#[derive(Deserialize)]
struct RenameCourse {
    name: String,
}

async fn rename_course(
    State(state): State<AppState>,
    Path(course_id): Path<String>,
    Json(req): Json<RenameCourse>,
) -> Result<Json<rollcall_store::Course>, ApiError> {
    non_empty("name", &req.name)?;
    Ok(Json(state.school.rename_course(&course_id, &req.name).await?))
}

async fn delete_course(
    State(state): State<AppState>,
    Path(course_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.school.delete_course(&course_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn roster(
    State(state): State<AppState>,
    Path(course_id): Path<String>,
) -> Result<Json<Vec<rollcall_store::RosterMember>>, ApiError> {
    Ok(Json(state.school.roster(&course_id).await?))
}

#[derive(Deserialize)]
struct AddToRoster {
    username: String,
}

async fn add_to_roster(
    State(state): State<AppState>,
    Path(course_id): Path<String>,
    Json(req): Json<AddToRoster>,
) -> Result<(StatusCode, Json<rollcall_store::RosterMember>), ApiError> {
    let member = state.school.enroll_student(&course_id, &req.username).await?;
    Ok((StatusCode::CREATED, Json(member)))
}

async fn take_attendance(
    State(state): State<AppState>,
    Path(course_id): Path<String>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<SessionOutcome>), ApiError> {
    state.school.course(&course_id).await?;
    let photo = read_photo(multipart).await?;
    let outcome = run_session(
        &state.school,
        &state.descriptors,
        &state.engine,
        state.match_threshold,
        &course_id,
        photo,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn course_records(
    State(state): State<AppState>,
    Path(course_id): Path<String>,
) -> Result<Json<Vec<rollcall_store::StudentRecord>>, ApiError> {
    Ok(Json(state.school.course_records(&course_id).await?))
}

async fn student_record(
    State(state): State<AppState>,
    Path((course_id, username)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let statuses = state.school.record(&course_id, &username).await?;
    Ok(Json(json!({
        "course_id": course_id,
        "username": username,
        "statuses": statuses,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_statuses() {
        let cases = [
            (
                ApiError::from(StoreError::UserNotFound("x".into())),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(StoreError::UserExists("x".into())),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from(StoreError::AlreadyEnrolled {
                    username: "x".into(),
                    course: "c".into(),
                }),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from(StoreError::WrongRole {
                    username: "x".into(),
                    expected: "teacher",
                }),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ApiError::from(StoreError::CorruptStatus("late".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, want) in cases {
            assert_eq!(err.status, want, "{}", err.message);
        }
    }

    #[test]
    fn test_engine_errors_map_to_statuses() {
        let unreadable =
            ApiError::from(EngineError::Pipeline(PipelineError::UnreadablePhoto(
                "bad magic".into(),
            )));
        assert_eq!(unreadable.status, StatusCode::BAD_REQUEST);

        let no_face = ApiError::from(EngineError::Pipeline(PipelineError::NoFaceDetected));
        assert_eq!(no_face.status, StatusCode::UNPROCESSABLE_ENTITY);

        let gone = ApiError::from(EngineError::ChannelClosed);
        assert_eq!(gone.status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
