use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::multipart;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    /// Base URL of the rollcalld server
    #[arg(long, default_value = "http://127.0.0.1:5000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Create a user
    UserAdd {
        username: String,
        /// Display name
        #[arg(short, long)]
        nickname: String,
        /// One of: student, teacher, admin
        #[arg(short, long, default_value = "student")]
        role: String,
    },
    /// Show a user
    UserShow { username: String },
    /// List the courses a student is enrolled in
    UserCourses { username: String },
    /// Enroll a face descriptor from a photo
    Enroll {
        username: String,
        /// Path to the photo file
        photo: PathBuf,
    },
    /// Remove a stored face descriptor
    DescriptorRemove { username: String },
    /// Create a course
    CourseAdd {
        /// Course code, e.g. cs101
        id: String,
        /// Course name
        #[arg(short, long)]
        name: String,
        /// Owning teacher's username
        #[arg(short, long)]
        teacher: String,
    },
    /// List courses
    CourseList {
        /// Only courses owned by this teacher
        #[arg(long)]
        teacher: Option<String>,
    },
    /// Show a course
    CourseShow { id: String },
    /// Rename a course
    CourseRename { id: String, name: String },
    /// Delete a course and all of its records
    CourseRemove { id: String },
    /// Show a course roster
    Roster { course: String },
    /// Add a student to a course roster
    RosterAdd { course: String, username: String },
    /// Run an attendance session from a class photo
    Attendance {
        course: String,
        /// Path to the class photo
        photo: PathBuf,
    },
    /// Show every student's attendance record for a course
    Records { course: String },
    /// Show one student's attendance record
    Record { course: String, username: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = Client::new(&cli.server);

    match cli.command {
        Commands::Status => {
            let v = client.get("/api/status").await?;
            println!(
                "{} {}",
                v["service"].as_str().unwrap_or("rollcalld"),
                v["version"].as_str().unwrap_or("?")
            );
            println!("detector:   {}", v["models"]["detector"].as_str().unwrap_or("?"));
            println!(
                "recognizer: {} ({} dims)",
                v["models"]["recognizer"].as_str().unwrap_or("?"),
                v["models"]["embedding_dim"]
            );
            println!("threshold:  {}", v["match_threshold"]);
        }
        Commands::UserAdd {
            username,
            nickname,
            role,
        } => {
            let v = client
                .post("/api/users", json!({ "username": username, "nickname": nickname, "role": role }))
                .await?;
            println!(
                "created {} ({}) as {}",
                v["username"].as_str().unwrap_or("?"),
                v["nickname"].as_str().unwrap_or("?"),
                v["role"].as_str().unwrap_or("?")
            );
        }
        Commands::UserShow { username } => {
            let v = client.get(&format!("/api/users/{username}")).await?;
            println!(
                "{} ({})",
                v["username"].as_str().unwrap_or("?"),
                v["nickname"].as_str().unwrap_or("?")
            );
            println!("role:          {}", v["role"].as_str().unwrap_or("?"));
            println!(
                "face enrolled: {}",
                if v["has_descriptor"].as_bool().unwrap_or(false) { "yes" } else { "no" }
            );
        }
        Commands::UserCourses { username } => {
            let v = client.get(&format!("/api/users/{username}/courses")).await?;
            print_courses(&v);
        }
        Commands::Enroll { username, photo } => {
            let v = client
                .upload(Method::PUT, &format!("/api/users/{username}/descriptor"), &photo)
                .await?;
            println!(
                "enrolled {}: {} descriptor ({} dims)",
                username,
                v["model_version"].as_str().unwrap_or("?"),
                v["dim"]
            );
        }
        Commands::DescriptorRemove { username } => {
            client
                .delete(&format!("/api/users/{username}/descriptor"))
                .await?;
            println!("descriptor removed for {username}");
        }
        Commands::CourseAdd { id, name, teacher } => {
            let v = client
                .post("/api/courses", json!({ "id": id, "name": name, "teacher": teacher }))
                .await?;
            println!(
                "created {}: {} (teacher {})",
                v["id"].as_str().unwrap_or("?"),
                v["name"].as_str().unwrap_or("?"),
                v["teacher"].as_str().unwrap_or("?")
            );
        }
        Commands::CourseList { teacher } => {
            let path = match teacher {
                Some(t) => format!("/api/courses?teacher={t}"),
                None => "/api/courses".to_string(),
            };
            let v = client.get(&path).await?;
            print_courses(&v);
        }
        Commands::CourseShow { id } => {
            let v = client.get(&format!("/api/courses/{id}")).await?;
            println!("{}: {}", v["id"].as_str().unwrap_or("?"), v["name"].as_str().unwrap_or("?"));
            println!(
                "teacher: {} ({})",
                v["teacher"].as_str().unwrap_or("?"),
                v["teacher_nickname"].as_str().unwrap_or("?")
            );
        }
        Commands::CourseRename { id, name } => {
            let v = client
                .put(&format!("/api/courses/{id}"), json!({ "name": name }))
                .await?;
            println!("renamed {} to {}", id, v["name"].as_str().unwrap_or("?"));
        }
        Commands::CourseRemove { id } => {
            client.delete(&format!("/api/courses/{id}")).await?;
            println!("deleted {id}");
        }
        Commands::Roster { course } => {
            let v = client.get(&format!("/api/courses/{course}/roster")).await?;
            for m in v.as_array().into_iter().flatten() {
                println!(
                    "{} ({})",
                    m["username"].as_str().unwrap_or("?"),
                    m["nickname"].as_str().unwrap_or("?")
                );
            }
        }
        Commands::RosterAdd { course, username } => {
            let v = client
                .post(&format!("/api/courses/{course}/roster"), json!({ "username": username }))
                .await?;
            println!(
                "enrolled {} in {course}",
                v["username"].as_str().unwrap_or("?")
            );
        }
        Commands::Attendance { course, photo } => {
            let v = client
                .upload(Method::POST, &format!("/api/courses/{course}/attendance"), &photo)
                .await?;
            println!("session {}", v["session_id"].as_str().unwrap_or("?"));
            println!("faces detected: {}", v["faces_detected"]);
            for e in v["entries"].as_array().into_iter().flatten() {
                let mut line = format!(
                    "  {:<8} {}",
                    e["status"].as_str().unwrap_or("?"),
                    e["username"].as_str().unwrap_or("?")
                );
                if let Some(d) = e["distance"].as_f64() {
                    line.push_str(&format!("  (face {}, distance {d:.3})", e["matched_face"]));
                }
                println!("{line}");
            }
            println!(
                "present {}  absent {}  unknown {}",
                v["present"], v["absent"], v["unknown"]
            );
        }
        Commands::Records { course } => {
            let v = client.get(&format!("/api/courses/{course}/attendance")).await?;
            for r in v.as_array().into_iter().flatten() {
                println!(
                    "{:<16} {:>3}P {:>3}A  {}",
                    r["username"].as_str().unwrap_or("?"),
                    r["present"],
                    r["absent"],
                    marks(&r["statuses"])
                );
            }
        }
        Commands::Record { course, username } => {
            let v = client
                .get(&format!("/api/courses/{course}/attendance/{username}"))
                .await?;
            println!("{}", marks(&v["statuses"]));
        }
    }

    Ok(())
}

/// One character per session, oldest first: P present, A absent,
/// - unknown.
fn marks(statuses: &Value) -> String {
    statuses
        .as_array()
        .into_iter()
        .flatten()
        .map(|s| match s.as_str() {
            Some("present") => 'P',
            Some("absent") => 'A',
            Some("unknown") => '-',
            _ => '?',
        })
        .collect()
}

fn print_courses(v: &Value) {
    for c in v.as_array().into_iter().flatten() {
        println!(
            "{:<10} {} (teacher {})",
            c["id"].as_str().unwrap_or("?"),
            c["name"].as_str().unwrap_or("?"),
            c["teacher"].as_str().unwrap_or("?")
        );
    }
}

struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    fn new(server: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: server.trim_end_matches('/').to_string(),
        }
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let resp = self.http.get(self.url(path)).send().await?;
        Self::parse(resp).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let resp = self.http.post(self.url(path)).json(&body).send().await?;
        Self::parse(resp).await
    }

    async fn put(&self, path: &str, body: Value) -> Result<Value> {
        let resp = self.http.put(self.url(path)).json(&body).send().await?;
        Self::parse(resp).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let resp = self.http.delete(self.url(path)).send().await?;
        Self::parse(resp).await?;
        Ok(())
    }

    /// Send a photo as the multipart field "file".
    async fn upload(&self, method: Method, path: &str, photo: &Path) -> Result<Value> {
        let bytes = tokio::fs::read(photo)
            .await
            .with_context(|| format!("reading {}", photo.display()))?;
        let file_name = photo
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "photo".to_string());
        let form = multipart::Form::new().part("file", multipart::Part::bytes(bytes).file_name(file_name));
        let resp = self
            .http
            .request(method, self.url(path))
            .multipart(form)
            .send()
            .await?;
        Self::parse(resp).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn parse(resp: reqwest::Response) -> Result<Value> {
        let status = resp.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        if status.is_success() {
            return resp.json().await.context("decoding server response");
        }
        let body: Value = resp.json().await.unwrap_or_default();
        let message = body["error"].as_str().unwrap_or("unknown error");
        bail!("server returned {status}: {message}");
    }
}
