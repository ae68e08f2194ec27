use std::path::PathBuf;

use actix_web::error::{InternalError, JsonPayloadError, QueryPayloadError};
use actix_web::{HttpRequest, HttpResponse, Responder, get, post, web};
use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::job::{LimitOverrides, PoCJob};
use crate::result::ExecutionResult;

#[derive(Serialize)]
struct ErrorResponse {
    reason: &'static str,
    code: u32,
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponse {
        reason: "ERR_INVALID_ARGUMENT",
        code: 1,
    });
    InternalError::from_response(err, response).into()
}

pub fn query_error_handler(err: QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponse {
        reason: "ERR_INVALID_ARGUMENT",
        code: 1,
    });
    InternalError::from_response(err, response).into()
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ExecuteRequest {
    pub language: String,
    pub source: String,
    /// Zip archive already stored on the engine host
    #[serde(default)]
    pub archive_path: Option<PathBuf>,
    #[serde(default)]
    pub limits: LimitOverrides,
}

impl ExecuteRequest {
    pub fn into_job(self) -> PoCJob {
        let job = PoCJob::new(self.language, self.source).with_limits(self.limits);
        match self.archive_path {
            Some(path) => job.with_archive(path),
            None => job,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Render {
    Html,
}

#[derive(Deserialize, Debug)]
pub struct ExecuteQueryParams {
    pub render: Option<Render>,
}

#[derive(Serialize, Debug)]
pub struct ExecuteResponse {
    #[serde(flatten)]
    pub result: ExecutionResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_html: Option<String>,
}

/// Renders captured output as an HTML fragment
///
/// The output is untrusted; every character with meaning in HTML is escaped.
pub fn render_html(output: &str) -> String {
    let mut html = String::with_capacity(output.len() + 24);
    html.push_str("<pre><code>");
    for c in output.chars() {
        match c {
            '&' => html.push_str("&amp;"),
            '<' => html.push_str("&lt;"),
            '>' => html.push_str("&gt;"),
            '"' => html.push_str("&quot;"),
            '\'' => html.push_str("&#39;"),
            _ => html.push(c),
        }
    }
    html.push_str("</code></pre>");
    html
}

#[post("/execute")]
pub async fn post_execute_handler(
    engine: web::Data<Engine>,
    query: web::Query<ExecuteQueryParams>,
    body: web::Json<ExecuteRequest>,
) -> impl Responder {
    let job = body.into_inner().into_job();
    log::debug!("Received job {} for {}", job.id(), job.language());

    match engine.execute(&job).await {
        Ok(result) => {
            let output_html = match query.render {
                Some(Render::Html) => Some(render_html(&result.output)),
                None => None,
            };
            HttpResponse::Ok().json(ExecuteResponse {
                result,
                output_html,
            })
        }
        Err(e) => {
            log::error!("Engine failed to execute job {}: {e:#}", job.id());
            HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_INTERNAL",
                code: 6,
            })
        }
    }
}

#[derive(Serialize, Debug)]
struct RuntimeInfo<'a> {
    language: &'a str,
    image: &'a str,
    compiled: bool,
}

#[get("/runtimes")]
pub async fn get_runtimes_handler(engine: web::Data<Engine>) -> impl Responder {
    let runtimes: Vec<RuntimeInfo> = engine
        .runtimes()
        .profiles()
        .into_iter()
        .map(|profile| RuntimeInfo {
            language: profile.language.as_str(),
            image: &profile.image,
            compiled: profile.build.is_some(),
        })
        .collect();
    HttpResponse::Ok().json(runtimes)
}
