//! Response renderer: turns a configured response into an HTTP response

use crate::listener::REQUEST_TIMEOUT;
use crate::template::{PathVars, Template, TemplateError};
use bytes::{Bytes, BytesMut};
use futures::stream;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use mimicro_common::{BodySource, ConfigError, ResponseConfig};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tracing::warn;

/// Body type of every response produced by Mimicro
pub type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Content type of plain-text error responses
pub const TEXT_PLAIN_UTF8: &str = "text/plain; charset=utf-8";

const NOT_FOUND_BODY: &str = "404 page not found\n";
const FILE_CHUNK_SIZE: usize = 16 * 1024;

/// Errors raised while compiling a response
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("invalid status code {0}")]
    StatusCode(u16),

    #[error("invalid content type {0:?}")]
    ContentType(String),

    #[error("file does not exist {}", .0.display())]
    MissingFile(PathBuf),
}

#[derive(Debug)]
enum CompiledBody {
    Template(Template),
    File { path: Template, base_dir: PathBuf },
}

/// A response ready to be rendered for individual requests
#[derive(Debug)]
pub struct CompiledResponse {
    status: StatusCode,
    content_type: Option<HeaderValue>,
    body: CompiledBody,
}

impl CompiledResponse {
    /// Compile `config`, resolving relative file paths against `base_dir`.
    ///
    /// File paths without variables are checked for existence here, so a
    /// missing file is reported before any listener starts.
    pub fn compile(config: &ResponseConfig, base_dir: &Path) -> Result<Self, CompileError> {
        let status_code = config.effective_status_code();
        let status =
            StatusCode::from_u16(status_code).map_err(|_| CompileError::StatusCode(status_code))?;

        let content_type = config
            .effective_content_type()
            .map(|value| {
                HeaderValue::from_str(value).map_err(|_| CompileError::ContentType(value.to_string()))
            })
            .transpose()?;

        let body = match config.body_source()? {
            BodySource::Template(source) => CompiledBody::Template(Template::parse(source)?),
            BodySource::File(source) => {
                let path = Template::parse(source)?;
                if !path.has_variables() {
                    let resolved = resolve_path(&path.render(&PathVars::new())?, base_dir);
                    if !resolved.is_file() {
                        return Err(CompileError::MissingFile(resolved));
                    }
                }
                CompiledBody::File {
                    path,
                    base_dir: base_dir.to_path_buf(),
                }
            }
        };

        Ok(Self {
            status,
            content_type,
            body,
        })
    }

    /// Render for one request. Never fails: render errors end up in the body.
    pub async fn render(&self, vars: &PathVars) -> Response<ResponseBody> {
        match &self.body {
            CompiledBody::Template(template) => {
                let body = template.render(vars).unwrap_or_else(|e| {
                    warn!("Failed to render response template: {}", e);
                    e.to_string()
                });
                self.build(self.content_type.clone(), full_body(body))
            }
            CompiledBody::File { path, base_dir } => {
                let path = match path.render(vars) {
                    Ok(path) => resolve_path(&path, base_dir),
                    Err(e) => {
                        warn!("Failed to render file path: {}", e);
                        return self.build(self.content_type.clone(), full_body(e.to_string()));
                    }
                };

                match open_file(&path).await {
                    Ok(file) => {
                        let content_type = self
                            .content_type
                            .clone()
                            .unwrap_or_else(|| HeaderValue::from_static(guess_content_type(&path)));
                        let deadline = Instant::now() + REQUEST_TIMEOUT;
                        self.build(Some(content_type), file_body(file, deadline))
                    }
                    Err(e) => {
                        warn!("Failed to open {}: {}", path.display(), e);
                        text_response(
                            StatusCode::NOT_FOUND,
                            format!("file does not exist {}: {}", path.display(), e),
                        )
                    }
                }
            }
        }
    }

    fn build(&self, content_type: Option<HeaderValue>, body: ResponseBody) -> Response<ResponseBody> {
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        if let Some(content_type) = content_type {
            response.headers_mut().insert(CONTENT_TYPE, content_type);
        }
        response
    }
}

/// Absolute paths are used verbatim, relative ones are joined to `base_dir`
pub fn resolve_path(path: &str, base_dir: &Path) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Standard not-found response
pub fn not_found() -> Response<ResponseBody> {
    text_response(StatusCode::NOT_FOUND, NOT_FOUND_BODY)
}

/// Plain-text response in the same shape as [`not_found`]
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ResponseBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN_UTF8));
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    response
}

/// Create a full body
pub fn full_body(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

async fn open_file(path: &Path) -> std::io::Result<tokio::fs::File> {
    let file = tokio::fs::File::open(path).await?;
    if !file.metadata().await?.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "not a regular file",
        ));
    }
    Ok(file)
}

/// Stream a file in fixed-size chunks. The stream fails once `deadline`
/// passes, which aborts the connection mid-body.
fn file_body(file: tokio::fs::File, deadline: Instant) -> ResponseBody {
    let chunks = stream::try_unfold(file, move |file| next_chunk(file, deadline));
    StreamBody::new(chunks).boxed_unsync()
}

async fn next_chunk(
    mut file: tokio::fs::File,
    deadline: Instant,
) -> std::io::Result<Option<(Frame<Bytes>, tokio::fs::File)>> {
    let timed_out = || {
        std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "response not written within the request timeout",
        )
    };
    if Instant::now() >= deadline {
        return Err(timed_out());
    }

    let mut buf = BytesMut::with_capacity(FILE_CHUNK_SIZE);
    let read = tokio::time::timeout_at(deadline, file.read_buf(&mut buf))
        .await
        .map_err(|_| timed_out())??;
    if read == 0 {
        return Ok(None);
    }
    Ok(Some((Frame::data(buf.freeze()), file)))
}

/// Guess content type from file extension
fn guess_content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain; charset=utf-8",
        Some("xml") => "text/xml; charset=utf-8",
        Some("pdf") => "application/pdf",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        _ => "application/octet-stream",
    }
}
