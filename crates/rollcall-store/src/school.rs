//! The school database: users, courses, rosters, and the attendance ledger.
//!
//! One SQLite file behind a single async connection. Every call runs on the
//! connection's worker thread, so writes are serialized by construction; a
//! session's ledger rows are written inside one transaction.

use chrono::Utc;
use rollcall_core::AttendanceStatus;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("user not found: {0}")]
    UserNotFound(String),
    #[error("course not found: {0}")]
    CourseNotFound(String),
    #[error("username already taken: {0}")]
    UserExists(String),
    #[error("course code already taken: {0}")]
    CourseExists(String),
    #[error("{username} is already enrolled in {course}")]
    AlreadyEnrolled { username: String, course: String },
    #[error("{username} is not enrolled in {course}")]
    NotEnrolled { username: String, course: String },
    #[error("{username} does not hold the {expected} role")]
    WrongRole {
        username: String,
        expected: &'static str,
    },
    #[error("unknown role: {0}")]
    BadRole(String),
    #[error("corrupt ledger status: {0}")]
    CorruptStatus(String),
    #[error("database: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("database connection lost: {0}")]
    Connection(String),
}

// Domain errors raised inside a connection closure travel out through
// tokio_rusqlite::Error::Other and are unwrapped again here.
impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::Rusqlite(e) => StoreError::Db(e),
            tokio_rusqlite::Error::Other(e) => match e.downcast::<StoreError>() {
                Ok(e) => *e,
                Err(e) => StoreError::Connection(e.to_string()),
            },
            other => StoreError::Connection(other.to_string()),
        }
    }
}

impl From<StoreError> for tokio_rusqlite::Error {
    fn from(err: StoreError) -> Self {
        tokio_rusqlite::Error::Other(Box::new(err))
    }
}

/// What a user is allowed to be. Stored as text, parsed strictly on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(Role::Student),
            "teacher" => Ok(Role::Teacher),
            "admin" => Ok(Role::Admin),
            other => Err(StoreError::BadRole(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub nickname: String,
    pub role: Role,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Course {
    pub id: String,
    pub name: String,
    pub teacher: String,
    pub teacher_nickname: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RosterMember {
    pub username: String,
    pub nickname: String,
    pub enrolled_at: String,
}

/// One student's full attendance history for a course, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct StudentRecord {
    pub username: String,
    pub nickname: String,
    pub statuses: Vec<AttendanceStatus>,
    pub present: usize,
    pub absent: usize,
}

/// Handle to the school database. Clone-safe; all clones share one
/// connection and its worker thread.
#[derive(Clone)]
pub struct SchoolStore {
    conn: Connection,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id         INTEGER PRIMARY KEY,
    username   TEXT NOT NULL UNIQUE,
    nickname   TEXT NOT NULL,
    role       TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS courses (
    id         TEXT PRIMARY KEY,
    name       TEXT NOT NULL,
    teacher_id INTEGER NOT NULL REFERENCES users(id),
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS enrollments (
    course_id   TEXT NOT NULL REFERENCES courses(id) ON DELETE CASCADE,
    student_id  INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    enrolled_at TEXT NOT NULL,
    PRIMARY KEY (course_id, student_id)
);
CREATE TABLE IF NOT EXISTS attendance_log (
    id          INTEGER PRIMARY KEY,
    course_id   TEXT NOT NULL REFERENCES courses(id) ON DELETE CASCADE,
    student_id  INTEGER NOT NULL REFERENCES users(id),
    session_id  TEXT NOT NULL,
    status      TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attendance_course_student
    ON attendance_log (course_id, student_id);
";

impl SchoolStore {
    /// Open (creating and initializing if necessary) the school database.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "school database not found, initializing");
        }
        let conn = Connection::open(path).await?;
        Self::init(conn).await
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.pragma_update(None, "busy_timeout", 5000)?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    pub async fn create_user(
        &self,
        username: &str,
        nickname: &str,
        role: Role,
    ) -> Result<User, StoreError> {
        let username = username.to_string();
        let nickname = nickname.to_string();
        let user = self
            .conn
            .call(move |conn| {
                if find_user(conn, &username)?.is_some() {
                    return Err(StoreError::UserExists(username).into());
                }
                let created_at = now();
                conn.execute(
                    "INSERT INTO users (username, nickname, role, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![username, nickname, role.as_str(), created_at],
                )?;
                Ok(User {
                    id: conn.last_insert_rowid(),
                    username,
                    nickname,
                    role,
                    created_at,
                })
            })
            .await?;
        tracing::info!(username = %user.username, role = %user.role, "user created");
        Ok(user)
    }

    pub async fn user_by_username(&self, username: &str) -> Result<User, StoreError> {
        let username = username.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                find_user(conn, &username)?
                    .ok_or_else(|| StoreError::UserNotFound(username).into())
            })
            .await?)
    }

    pub async fn set_nickname(&self, username: &str, nickname: &str) -> Result<User, StoreError> {
        let username = username.to_string();
        let nickname = nickname.to_string();
        let user = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE users SET nickname = ?1 WHERE username = ?2",
                    params![nickname, username],
                )?;
                if changed == 0 {
                    return Err(StoreError::UserNotFound(username).into());
                }
                find_user(conn, &username)?
                    .ok_or_else(|| StoreError::UserNotFound(username).into())
            })
            .await?;
        tracing::info!(username = %user.username, "nickname updated");
        Ok(user)
    }

    pub async fn create_course(
        &self,
        id: &str,
        name: &str,
        teacher: &str,
    ) -> Result<Course, StoreError> {
        let id = id.to_string();
        let name = name.to_string();
        let teacher = teacher.to_string();
        let course = self
            .conn
            .call(move |conn| {
                let owner = find_user(conn, &teacher)?
                    .ok_or_else(|| StoreError::UserNotFound(teacher.clone()))?;
                if owner.role != Role::Teacher {
                    return Err(StoreError::WrongRole {
                        username: teacher,
                        expected: "teacher",
                    }
                    .into());
                }
                if find_course(conn, &id)?.is_some() {
                    return Err(StoreError::CourseExists(id).into());
                }
                let created_at = now();
                conn.execute(
                    "INSERT INTO courses (id, name, teacher_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![id, name, owner.id, created_at],
                )?;
                Ok(Course {
                    id,
                    name,
                    teacher: owner.username,
                    teacher_nickname: owner.nickname,
                    created_at,
                })
            })
            .await?;
        tracing::info!(course = %course.id, teacher = %course.teacher, "course created");
        Ok(course)
    }

    pub async fn courses(&self) -> Result<Vec<Course>, StoreError> {
        Ok(self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT c.id, c.name, u.username, u.nickname, c.created_at
                     FROM courses c JOIN users u ON u.id = c.teacher_id
                     ORDER BY c.rowid",
                )?;
                let rows = stmt.query_map([], course_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?)
    }

    pub async fn courses_by_teacher(&self, teacher: &str) -> Result<Vec<Course>, StoreError> {
        let teacher = teacher.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let owner = find_user(conn, &teacher)?
                    .ok_or_else(|| StoreError::UserNotFound(teacher.clone()))?;
                let mut stmt = conn.prepare(
                    "SELECT c.id, c.name, u.username, u.nickname, c.created_at
                     FROM courses c JOIN users u ON u.id = c.teacher_id
                     WHERE c.teacher_id = ?1
                     ORDER BY c.rowid",
                )?;
                let rows = stmt.query_map(params![owner.id], course_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?)
    }

    pub async fn courses_of_student(&self, username: &str) -> Result<Vec<Course>, StoreError> {
        let username = username.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let user = find_user(conn, &username)?
                    .ok_or_else(|| StoreError::UserNotFound(username.clone()))?;
                let mut stmt = conn.prepare(
                    "SELECT c.id, c.name, u.username, u.nickname, c.created_at
                     FROM enrollments e
                     JOIN courses c ON c.id = e.course_id
                     JOIN users u ON u.id = c.teacher_id
                     WHERE e.student_id = ?1
                     ORDER BY e.rowid",
                )?;
                let rows = stmt.query_map(params![user.id], course_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?)
    }

    pub async fn course(&self, id: &str) -> Result<Course, StoreError> {
        let id = id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                find_course(conn, &id)?.ok_or_else(|| StoreError::CourseNotFound(id).into())
            })
            .await?)
    }

    pub async fn rename_course(&self, id: &str, name: &str) -> Result<Course, StoreError> {
        let id = id.to_string();
        let name = name.to_string();
        let course = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE courses SET name = ?1 WHERE id = ?2",
                    params![name, id],
                )?;
                if changed == 0 {
                    return Err(StoreError::CourseNotFound(id).into());
                }
                find_course(conn, &id)?.ok_or_else(|| StoreError::CourseNotFound(id).into())
            })
            .await?;
        tracing::info!(course = %course.id, "course renamed");
        Ok(course)
    }

    /// Delete a course along with its roster and every ledger row it owns.
    pub async fn delete_course(&self, id: &str) -> Result<(), StoreError> {
        let course_id = id.to_string();
        self.conn
            .call(move |conn| {
                let removed = conn.execute("DELETE FROM courses WHERE id = ?1", params![course_id])?;
                if removed == 0 {
                    return Err(StoreError::CourseNotFound(course_id).into());
                }
                Ok(())
            })
            .await?;
        tracing::info!(course = id, "course deleted");
        Ok(())
    }

    pub async fn enroll_student(
        &self,
        course_id: &str,
        username: &str,
    ) -> Result<RosterMember, StoreError> {
        let course_id_owned = course_id.to_string();
        let username_owned = username.to_string();
        let member = self
            .conn
            .call(move |conn| {
                if find_course(conn, &course_id_owned)?.is_none() {
                    return Err(StoreError::CourseNotFound(course_id_owned).into());
                }
                let user = find_user(conn, &username_owned)?
                    .ok_or_else(|| StoreError::UserNotFound(username_owned.clone()))?;
                if user.role != Role::Student {
                    return Err(StoreError::WrongRole {
                        username: username_owned,
                        expected: "student",
                    }
                    .into());
                }
                let enrolled: Option<i64> = conn
                    .query_row(
                        "SELECT rowid FROM enrollments WHERE course_id = ?1 AND student_id = ?2",
                        params![course_id_owned, user.id],
                        |r| r.get(0),
                    )
                    .optional()?;
                if enrolled.is_some() {
                    return Err(StoreError::AlreadyEnrolled {
                        username: user.username,
                        course: course_id_owned,
                    }
                    .into());
                }
                let enrolled_at = now();
                conn.execute(
                    "INSERT INTO enrollments (course_id, student_id, enrolled_at) VALUES (?1, ?2, ?3)",
                    params![course_id_owned, user.id, enrolled_at],
                )?;
                Ok(RosterMember {
                    username: user.username,
                    nickname: user.nickname,
                    enrolled_at,
                })
            })
            .await?;
        tracing::info!(course = course_id, student = username, "student enrolled");
        Ok(member)
    }

    /// Roster snapshot in enrollment order.
    pub async fn roster(&self, course_id: &str) -> Result<Vec<RosterMember>, StoreError> {
        let course_id = course_id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                if find_course(conn, &course_id)?.is_none() {
                    return Err(StoreError::CourseNotFound(course_id).into());
                }
                let mut stmt = conn.prepare(
                    "SELECT u.username, u.nickname, e.enrolled_at
                     FROM enrollments e JOIN users u ON u.id = e.student_id
                     WHERE e.course_id = ?1
                     ORDER BY e.rowid",
                )?;
                let rows = stmt.query_map(params![course_id], |r| {
                    Ok(RosterMember {
                        username: r.get(0)?,
                        nickname: r.get(1)?,
                        enrolled_at: r.get(2)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?)
    }

    /// Append one session's outcomes to the ledger, all rows in one
    /// transaction. Either the whole session lands or none of it does.
    pub async fn append_session(
        &self,
        course_id: &str,
        session_id: &str,
        entries: Vec<(String, AttendanceStatus)>,
    ) -> Result<(), StoreError> {
        let course_id_owned = course_id.to_string();
        let session_id_owned = session_id.to_string();
        let count = entries.len();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                if find_course(&tx, &course_id_owned)?.is_none() {
                    return Err(StoreError::CourseNotFound(course_id_owned).into());
                }
                let recorded_at = now();
                for (username, status) in &entries {
                    let student_id: Option<i64> = tx
                        .query_row(
                            "SELECT u.id FROM users u
                             JOIN enrollments e ON e.student_id = u.id AND e.course_id = ?1
                             WHERE u.username = ?2",
                            params![course_id_owned, username],
                            |r| r.get(0),
                        )
                        .optional()?;
                    let Some(student_id) = student_id else {
                        return Err(StoreError::NotEnrolled {
                            username: username.clone(),
                            course: course_id_owned,
                        }
                        .into());
                    };
                    tx.execute(
                        "INSERT INTO attendance_log (course_id, student_id, session_id, status, recorded_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![course_id_owned, student_id, session_id_owned, status.as_str(), recorded_at],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        tracing::info!(course = course_id, session = session_id, entries = count, "session appended");
        Ok(())
    }

    /// One student's status sequence for a course, oldest first.
    pub async fn record(
        &self,
        course_id: &str,
        username: &str,
    ) -> Result<Vec<AttendanceStatus>, StoreError> {
        let course_id = course_id.to_string();
        let username = username.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                if find_course(conn, &course_id)?.is_none() {
                    return Err(StoreError::CourseNotFound(course_id).into());
                }
                let student_id: Option<i64> = conn
                    .query_row(
                        "SELECT u.id FROM users u
                         JOIN enrollments e ON e.student_id = u.id AND e.course_id = ?1
                         WHERE u.username = ?2",
                        params![course_id, username],
                        |r| r.get(0),
                    )
                    .optional()?;
                let Some(student_id) = student_id else {
                    return Err(StoreError::NotEnrolled {
                        username,
                        course: course_id,
                    }
                    .into());
                };
                read_statuses(conn, &course_id, student_id)
            })
            .await?)
    }

    /// Every roster student's record, in roster order.
    pub async fn course_records(&self, course_id: &str) -> Result<Vec<StudentRecord>, StoreError> {
        let course_id = course_id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                if find_course(conn, &course_id)?.is_none() {
                    return Err(StoreError::CourseNotFound(course_id).into());
                }
                let members: Vec<(i64, String, String)> = {
                    let mut stmt = conn.prepare(
                        "SELECT u.id, u.username, u.nickname
                         FROM enrollments e JOIN users u ON u.id = e.student_id
                         WHERE e.course_id = ?1
                         ORDER BY e.rowid",
                    )?;
                    let rows = stmt.query_map(params![course_id], |r| {
                        Ok((r.get(0)?, r.get(1)?, r.get(2)?))
                    })?;
                    rows.collect::<Result<Vec<_>, _>>()?
                };

                let mut records = Vec::with_capacity(members.len());
                for (student_id, username, nickname) in members {
                    let statuses = read_statuses(conn, &course_id, student_id)?;
                    let present = statuses
                        .iter()
                        .filter(|s| **s == AttendanceStatus::Present)
                        .count();
                    let absent = statuses
                        .iter()
                        .filter(|s| **s == AttendanceStatus::Absent)
                        .count();
                    records.push(StudentRecord {
                        username,
                        nickname,
                        statuses,
                        present,
                        absent,
                    });
                }
                Ok(records)
            })
            .await?)
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn find_user(
    conn: &rusqlite::Connection,
    username: &str,
) -> Result<Option<User>, tokio_rusqlite::Error> {
    let row: Option<(i64, String, String, String, String)> = conn
        .query_row(
            "SELECT id, username, nickname, role, created_at FROM users WHERE username = ?1",
            params![username],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()?;
    match row {
        Some((id, username, nickname, role, created_at)) => Ok(Some(User {
            id,
            username,
            nickname,
            role: role.parse()?,
            created_at,
        })),
        None => Ok(None),
    }
}

fn find_course(
    conn: &rusqlite::Connection,
    id: &str,
) -> Result<Option<Course>, tokio_rusqlite::Error> {
    Ok(conn
        .query_row(
            "SELECT c.id, c.name, u.username, u.nickname, c.created_at
             FROM courses c JOIN users u ON u.id = c.teacher_id
             WHERE c.id = ?1",
            params![id],
            course_row,
        )
        .optional()?)
}

fn course_row(r: &rusqlite::Row<'_>) -> Result<Course, rusqlite::Error> {
    Ok(Course {
        id: r.get(0)?,
        name: r.get(1)?,
        teacher: r.get(2)?,
        teacher_nickname: r.get(3)?,
        created_at: r.get(4)?,
    })
}

fn read_statuses(
    conn: &rusqlite::Connection,
    course_id: &str,
    student_id: i64,
) -> Result<Vec<AttendanceStatus>, tokio_rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT status FROM attendance_log
         WHERE course_id = ?1 AND student_id = ?2
         ORDER BY id",
    )?;
    let rows = stmt.query_map(params![course_id, student_id], |r| r.get::<_, String>(0))?;
    let mut statuses = Vec::new();
    for row in rows {
        let text = row?;
        let status = text
            .parse::<AttendanceStatus>()
            .map_err(|_| StoreError::CorruptStatus(text))?;
        statuses.push(status);
    }
    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SchoolStore {
        SchoolStore::open_in_memory().await.unwrap()
    }

    /// Teacher, course, and three enrolled students.
    async fn seeded() -> SchoolStore {
        let s = store().await;
        s.create_user("turing", "Alan", Role::Teacher).await.unwrap();
        s.create_course("cs101", "Computability", "turing").await.unwrap();
        for (u, n) in [("amy", "Amy"), ("bob", "Bob"), ("cho", "Cho")] {
            s.create_user(u, n, Role::Student).await.unwrap();
            s.enroll_student("cs101", u).await.unwrap();
        }
        s
    }

    #[tokio::test]
    async fn test_create_and_fetch_user() {
        let s = store().await;
        let created = s.create_user("amy", "Amy", Role::Student).await.unwrap();
        assert_eq!(created.role, Role::Student);

        let fetched = s.user_by_username("amy").await.unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.nickname, "Amy");
    }

    #[tokio::test]
    async fn test_duplicate_username_rejected() {
        let s = store().await;
        s.create_user("amy", "Amy", Role::Student).await.unwrap();
        let err = s.create_user("amy", "Amy II", Role::Student).await.unwrap_err();
        assert!(matches!(err, StoreError::UserExists(u) if u == "amy"));
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let s = store().await;
        let err = s.user_by_username("ghost").await.unwrap_err();
        assert!(matches!(err, StoreError::UserNotFound(_)));
    }

    #[tokio::test]
    async fn test_set_nickname() {
        let s = store().await;
        s.create_user("amy", "Amy", Role::Student).await.unwrap();
        let updated = s.set_nickname("amy", "Amelia").await.unwrap();
        assert_eq!(updated.nickname, "Amelia");

        let err = s.set_nickname("ghost", "Boo").await.unwrap_err();
        assert!(matches!(err, StoreError::UserNotFound(_)));
    }

    #[tokio::test]
    async fn test_course_owner_must_be_teacher() {
        let s = store().await;
        s.create_user("amy", "Amy", Role::Student).await.unwrap();
        let err = s.create_course("cs101", "Intro", "amy").await.unwrap_err();
        assert!(matches!(err, StoreError::WrongRole { expected: "teacher", .. }));
    }

    #[tokio::test]
    async fn test_duplicate_course_code_rejected() {
        let s = seeded().await;
        let err = s
            .create_course("cs101", "Another", "turing")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CourseExists(_)));
    }

    #[tokio::test]
    async fn test_roster_preserves_enrollment_order() {
        let s = seeded().await;
        let roster = s.roster("cs101").await.unwrap();
        let names: Vec<&str> = roster.iter().map(|m| m.username.as_str()).collect();
        assert_eq!(names, ["amy", "bob", "cho"]);
    }

    #[tokio::test]
    async fn test_only_students_join_rosters() {
        let s = seeded().await;
        let err = s.enroll_student("cs101", "turing").await.unwrap_err();
        assert!(matches!(err, StoreError::WrongRole { expected: "student", .. }));
    }

    #[tokio::test]
    async fn test_double_enrollment_rejected() {
        let s = seeded().await;
        let err = s.enroll_student("cs101", "amy").await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyEnrolled { .. }));
    }

    #[tokio::test]
    async fn test_new_student_starts_with_empty_record() {
        let s = seeded().await;
        assert!(s.record("cs101", "amy").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_grows_each_record_by_one() {
        let s = seeded().await;
        let entries = vec![
            ("amy".to_string(), AttendanceStatus::Present),
            ("bob".to_string(), AttendanceStatus::Absent),
            ("cho".to_string(), AttendanceStatus::Unknown),
        ];
        s.append_session("cs101", "s1", entries.clone()).await.unwrap();
        s.append_session("cs101", "s2", entries).await.unwrap();

        for member in ["amy", "bob", "cho"] {
            assert_eq!(s.record("cs101", member).await.unwrap().len(), 2);
        }
    }

    #[tokio::test]
    async fn test_record_preserves_status_order() {
        let s = seeded().await;
        s.append_session("cs101", "s1", vec![("amy".into(), AttendanceStatus::Present)])
            .await
            .unwrap();
        s.append_session("cs101", "s2", vec![("amy".into(), AttendanceStatus::Absent)])
            .await
            .unwrap();
        s.append_session("cs101", "s3", vec![("amy".into(), AttendanceStatus::Present)])
            .await
            .unwrap();

        let record = s.record("cs101", "amy").await.unwrap();
        assert_eq!(
            record,
            vec![
                AttendanceStatus::Present,
                AttendanceStatus::Absent,
                AttendanceStatus::Present,
            ]
        );
    }

    #[tokio::test]
    async fn test_append_is_all_or_none() {
        let s = seeded().await;
        let entries = vec![
            ("amy".to_string(), AttendanceStatus::Present),
            ("intruder".to_string(), AttendanceStatus::Present),
        ];
        let err = s.append_session("cs101", "s1", entries).await.unwrap_err();
        assert!(matches!(err, StoreError::NotEnrolled { .. }));

        // The valid row before the bad one must have rolled back too.
        assert!(s.record("cs101", "amy").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_appends_all_land() {
        let s = seeded().await;
        let mut handles = Vec::new();
        for i in 0..8 {
            let s = s.clone();
            handles.push(tokio::spawn(async move {
                s.append_session(
                    "cs101",
                    &format!("s{i}"),
                    vec![("amy".to_string(), AttendanceStatus::Present)],
                )
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(s.record("cs101", "amy").await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_record_requires_enrollment() {
        let s = seeded().await;
        s.create_user("dan", "Dan", Role::Student).await.unwrap();
        let err = s.record("cs101", "dan").await.unwrap_err();
        assert!(matches!(err, StoreError::NotEnrolled { .. }));
    }

    #[tokio::test]
    async fn test_course_records_in_roster_order_with_counts() {
        let s = seeded().await;
        s.append_session(
            "cs101",
            "s1",
            vec![
                ("amy".into(), AttendanceStatus::Present),
                ("bob".into(), AttendanceStatus::Absent),
                ("cho".into(), AttendanceStatus::Unknown),
            ],
        )
        .await
        .unwrap();
        s.append_session(
            "cs101",
            "s2",
            vec![
                ("amy".into(), AttendanceStatus::Present),
                ("bob".into(), AttendanceStatus::Present),
                ("cho".into(), AttendanceStatus::Unknown),
            ],
        )
        .await
        .unwrap();

        let records = s.course_records("cs101").await.unwrap();
        let names: Vec<&str> = records.iter().map(|r| r.username.as_str()).collect();
        assert_eq!(names, ["amy", "bob", "cho"]);
        assert_eq!((records[0].present, records[0].absent), (2, 0));
        assert_eq!((records[1].present, records[1].absent), (1, 1));
        assert_eq!((records[2].present, records[2].absent), (0, 0));
        assert_eq!(records[2].statuses.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_course_cascades() {
        let s = seeded().await;
        s.append_session("cs101", "s1", vec![("amy".into(), AttendanceStatus::Present)])
            .await
            .unwrap();
        s.delete_course("cs101").await.unwrap();

        let err = s.course("cs101").await.unwrap_err();
        assert!(matches!(err, StoreError::CourseNotFound(_)));

        // Same code can be reused and starts clean.
        s.create_course("cs101", "Computability II", "turing").await.unwrap();
        assert!(s.roster("cs101").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_course_listings() {
        let s = seeded().await;
        s.create_user("curie", "Marie", Role::Teacher).await.unwrap();
        s.create_course("ph201", "Radioactivity", "curie").await.unwrap();
        s.enroll_student("ph201", "amy").await.unwrap();

        assert_eq!(s.courses().await.unwrap().len(), 2);

        let by_teacher = s.courses_by_teacher("curie").await.unwrap();
        assert_eq!(by_teacher.len(), 1);
        assert_eq!(by_teacher[0].id, "ph201");

        let of_amy = s.courses_of_student("amy").await.unwrap();
        let ids: Vec<&str> = of_amy.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["cs101", "ph201"]);
    }

    #[tokio::test]
    async fn test_rename_course() {
        let s = seeded().await;
        let renamed = s.rename_course("cs101", "Computation").await.unwrap();
        assert_eq!(renamed.name, "Computation");

        let err = s.rename_course("nope", "X").await.unwrap_err();
        assert!(matches!(err, StoreError::CourseNotFound(_)));
    }
}
