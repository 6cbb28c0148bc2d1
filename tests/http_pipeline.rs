#![cfg(unix)]

use std::{
    io::Write,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    response::Response,
};
use http_body_util::BodyExt;
use md2pdf::{
    application::{
        fetch::FetchResolver,
        pipeline::{PipelineConfig, ToolchainConfig},
        render::ProcessToolchain,
        retention::RetentionReaper,
        submission::SubmissionService,
    },
    domain::{
        request::TemplateReference,
        rewrite::{RewriteRule, RewriteRuleSet},
        types::JobIdentifier,
    },
    infra::{
        http::{HttpState, build_router},
        workspace::WorkspaceRoot,
    },
};
use tempfile::TempDir;
use tower::ServiceExt;
use zip::write::SimpleFileOptions;

const BOUNDARY: &str = "md2pdf-test-boundary";

const FAKE_PANDOC: &str = r#"#!/bin/sh
echo "pandoc $@"
out=""
while [ "$#" -gt 0 ]; do
  case "$1" in
    -o) shift; out="$1" ;;
  esac
  shift
done
case "$out" in
  *.pdf) printf '%%PDF-1.4 fake\n' > "$out" ;;
  *) printf '\\hypertarget{intro}{%%\n\\section{Intro}\\label{intro}}\n' > "$out" ;;
esac
"#;

const FAILING_PANDOC: &str = "#!/bin/sh\necho 'Error producing PDF.' >&2\nexit 43\n";

const SLOW_PANDOC: &str = "#!/bin/sh\nsleep 5\n";

const FAKE_LATEXDIFF: &str = "#!/bin/sh\ncat \"$3\"\n";

const FAKE_XELATEX: &str = "#!/bin/sh\nprintf '%%PDF-1.4 diff\\n' > \"${2%.tex}.pdf\"\n";

struct TestApp {
    _dir: TempDir,
    router: Router,
    work: PathBuf,
    reaper: RetentionReaper,
}

struct Options {
    pandoc: &'static str,
    retention: Duration,
    body_limit: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            pandoc: FAKE_PANDOC,
            retention: Duration::from_secs(120),
            body_limit: 1024 * 1024,
        }
    }
}

fn install(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("write fake tool");
    let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("set perms");
    path.display().to_string()
}

fn app(options: Options) -> TestApp {
    let dir = TempDir::new().expect("temp dir");
    let bin = dir.path().join("bin");
    let static_dir = dir.path().join("static");
    std::fs::create_dir_all(&bin).expect("bin dir");
    std::fs::create_dir_all(&static_dir).expect("static dir");
    std::fs::write(static_dir.join("example.latex"), "$body$").expect("template");

    let config = Arc::new(PipelineConfig {
        static_dir,
        static_content: vec!["example.latex".to_string()],
        default_template: TemplateReference::Named("example.latex".to_string()),
        rewrite_rules: RewriteRuleSet::new(vec![
            RewriteRule::new("DRAFT", "Final").expect("rule"),
        ]),
        toolchain: ToolchainConfig {
            chroot_dir: None,
            shell: PathBuf::from("/bin/sh"),
            pandoc: install(&bin, "pandoc", options.pandoc),
            latexdiff: install(&bin, "latexdiff", FAKE_LATEXDIFF),
            latex_engine: install(&bin, "xelatex", FAKE_XELATEX),
            search_path: std::env::var("PATH").unwrap_or_default(),
        },
        retention: options.retention,
        max_concurrent_renders: None,
    });

    let work = dir.path().join("work");
    let root = WorkspaceRoot::new(work.clone()).expect("root");
    let reaper = RetentionReaper::new();
    let toolchain = Arc::new(ProcessToolchain::new(config.toolchain.clone()));
    let submissions = SubmissionService::new(config, root.clone(), toolchain, reaper.clone())
        .expect("submission service");
    let state = HttpState {
        submissions: Arc::new(submissions),
        fetch: Arc::new(FetchResolver::new(root)),
    };

    TestApp {
        _dir: dir,
        router: build_router(state, options.body_limit),
        work,
        reaper,
    }
}

fn zip_archive(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, contents) in files {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .expect("start file");
        writer.write_all(contents.as_bytes()).expect("write");
    }
    writer.finish().expect("finish").into_inner()
}

fn multipart_body(field: &str, filename: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n\
             Content-Type: application/zip\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn upload_request(archive: &[u8], headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        );
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder
        .body(Body::from(multipart_body("ufile", "bundle.zip", archive)))
        .expect("request")
}

async fn send(router: &Router, request: Request<Body>) -> Response {
    router.clone().oneshot(request).await.expect("response")
}

async fn body_text(response: Response) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}

async fn upload(app: &TestApp, archive: &[u8], extra: &[(&str, &str)]) -> (StatusCode, String) {
    let mut headers = vec![("x-method", "MD-to-PDF")];
    headers.extend_from_slice(extra);
    let response = send(&app.router, upload_request(archive, &headers)).await;
    let status = response.status();
    (status, body_text(response).await)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

/// Renders schedule their workspace for retention once they finish.
async fn wait_for_renders(app: &TestApp, finished: usize) {
    for _ in 0..400 {
        if app.reaper.pending() >= finished {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("renders did not finish in time");
}

async fn fetch_rendered(app: &TestApp, digest: &str, finished: usize) -> Response {
    wait_for_renders(app, finished).await;
    send(&app.router, get(&format!("/fetch/{digest}"))).await
}

fn digest_of(archive: &[u8]) -> String {
    JobIdentifier::from_bytes(archive).to_string()
}

fn content_disposition(response: &Response) -> String {
    response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn uploaded_markdown_is_rendered_and_fetched_as_pdf() {
    let app = app(Options::default());
    let archive = zip_archive(&[("doc.md", "# Title\n"), ("figure.eps", "eps")]);
    let digest = digest_of(&archive);

    let response = send(
        &app.router,
        upload_request(&archive, &[("x-method", "MD-to-PDF")]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(cookie.starts_with(&format!("hashsum={digest}")), "cookie: {cookie}");

    let text = body_text(response).await;
    assert_eq!(
        text,
        format!(
            "\nFile received\nlength: {}\nfilename: bundle.zip\nhash: {digest}\n\
             File is being processed into a PDF, request it using the hash value\n",
            archive.len()
        )
    );

    let response = fetch_rendered(&app, &digest, 1).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).expect("type"),
        "application/pdf"
    );
    assert_eq!(
        content_disposition(&response),
        "attachment; filename=\"doc.pdf\""
    );
    assert!(body_text(response).await.starts_with("%PDF"));
    assert!(app.work.join(&digest).join("example.latex").is_file());
}

#[tokio::test]
async fn fetch_for_unknown_digest_is_not_found() {
    let app = app(Options::default());
    let digest = "0".repeat(64);

    let response = send(&app.router, get(&format!("/fetch?hashsum={digest}"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        body_text(response).await,
        format!("No file was found for the given hashsum: {digest}")
    );

    let response = send(&app.router, get("/fetch/..%2F..%2Fetc")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn failed_render_serves_the_log() {
    let app = app(Options {
        pandoc: FAILING_PANDOC,
        ..Options::default()
    });
    let archive = zip_archive(&[("doc.md", "# Title\n")]);
    let (status, _) = upload(&app, &archive, &[]).await;
    assert_eq!(status, StatusCode::OK);

    let response = fetch_rendered(&app, &digest_of(&archive), 1).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        content_disposition(&response),
        "attachment; filename=\"doc.log\""
    );
    assert!(body_text(response).await.contains("Error producing PDF."));
}

#[tokio::test]
async fn repeated_upload_is_reported_as_duplicate() {
    let app = app(Options::default());
    let archive = zip_archive(&[("doc.md", "# Title\n")]);

    let (_, first) = upload(&app, &archive, &[]).await;
    let (status, second) = upload(&app, &archive, &[]).await;

    assert!(first.contains("File is being processed"));
    assert_eq!(status, StatusCode::OK);
    assert!(
        second.ends_with(
            "File has already been submitted, request the PDF using the hash value\n"
        ),
        "body: {second}"
    );
    assert_eq!(std::fs::read_dir(&app.work).expect("list").count(), 1);
}

#[tokio::test]
async fn archive_without_markdown_is_reported() {
    let app = app(Options::default());
    let archive = zip_archive(&[("notes.txt", "plain")]);

    let (status, text) = upload(&app, &archive, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        text.ends_with("MD file not found in submitted archive\n"),
        "body: {text}"
    );
    assert_eq!(app.reaper.pending(), 1);
}

#[tokio::test]
async fn compare_upload_produces_a_diff_pdf() {
    let app = app(Options::default());
    let archive = zip_archive(&[
        ("report.new.md", "# DRAFT\nnew text\n"),
        ("report.old.md", "# DRAFT\nold text\n"),
    ]);
    let digest = digest_of(&archive);

    let (status, text) = upload(&app, &archive, &[("x-compare", "1")]).await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("File is being processed"), "body: {text}");

    let response = fetch_rendered(&app, &digest, 1).await;
    assert_eq!(
        content_disposition(&response),
        "attachment; filename=\"report.new-diff.pdf\""
    );

    let workspace = app.work.join(&digest);
    assert_eq!(
        std::fs::read_to_string(workspace.join("report.old.md")).expect("old"),
        "# Final\nold text\n"
    );
    let tex = std::fs::read_to_string(workspace.join("report.new-diff.tex")).expect("diff tex");
    assert!(!tex.contains("hypertarget"), "tex: {tex}");
}

#[tokio::test]
async fn compare_upload_without_old_document_is_reported() {
    let app = app(Options::default());
    let archive = zip_archive(&[("report.new.md", "new")]);

    let (_, text) = upload(&app, &archive, &[("x-compare", "yes")]).await;
    assert!(
        text.ends_with(
            "MD file not found in submitted archive: no Markdown file with `old` in its name\n"
        ),
        "body: {text}"
    );
}

#[tokio::test]
async fn template_header_is_passed_to_pandoc() {
    let app = app(Options::default());
    let archive = zip_archive(&[("doc.md", "# Title\n")]);
    let digest = digest_of(&archive);

    upload(&app, &archive, &[("x-latex-template", "/opt/custom.latex")]).await;
    fetch_rendered(&app, &digest, 1).await;

    let log = std::fs::read_to_string(app.work.join(&digest).join("doc.log")).expect("log");
    assert!(log.contains("--template=/opt/custom.latex"), "log: {log}");
}

#[tokio::test]
async fn upload_without_method_header_is_refused() {
    let app = app(Options::default());
    let archive = zip_archive(&[("doc.md", "# Title\n")]);

    let response = send(&app.router, upload_request(&archive, &[])).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(
        body_text(response).await,
        "This server only supports Markdown to PDF rendering, please check your request"
    );
    assert_eq!(std::fs::read_dir(&app.work).expect("list").count(), 0);
}

#[tokio::test]
async fn upload_without_file_field_is_a_bad_request() {
    let app = app(Options::default());
    let request = Request::builder()
        .method("POST")
        .uri("/upload")
        .header("x-method", "MD-to-PDF")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body("other", "x.zip", b"data")))
        .expect("request");

    let response = send(&app.router, request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn oversized_upload_is_rejected_without_a_workspace() {
    let app = app(Options {
        body_limit: 1024,
        ..Options::default()
    });
    let archive = vec![b'x'; 64 * 1024];

    let (status, _) = upload(&app, &archive, &[]).await;
    assert!(status.is_client_error(), "status: {status}");
    assert_eq!(std::fs::read_dir(&app.work).expect("list").count(), 0);
}

#[tokio::test]
async fn workspace_is_reaped_after_the_grace_period() {
    let app = app(Options {
        retention: Duration::from_millis(100),
        ..Options::default()
    });
    let archive = zip_archive(&[("doc.md", "# Title\n")]);
    let digest = digest_of(&archive);

    upload(&app, &archive, &[]).await;

    for _ in 0..400 {
        if !app.work.join(&digest).exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(!app.work.join(&digest).exists());

    let response = send(&app.router, get(&format!("/fetch/{digest}"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let (_, text) = upload(&app, &archive, &[]).await;
    assert!(text.contains("File is being processed"), "body: {text}");
}

#[tokio::test]
async fn shutdown_removes_workspace_of_a_render_still_running() {
    let app = app(Options {
        pandoc: SLOW_PANDOC,
        ..Options::default()
    });
    let archive = zip_archive(&[("doc.md", "# Title\n")]);
    let digest = digest_of(&archive);

    let (_, text) = upload(&app, &archive, &[]).await;
    assert!(text.contains("File is being processed"), "body: {text}");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(app.reaper.rendering(), 1);
    assert_eq!(app.reaper.pending(), 0);

    let idle = tokio::time::timeout(Duration::from_millis(100), app.reaper.wait_idle()).await;
    assert!(idle.is_err());

    assert_eq!(app.reaper.shutdown().await, 1);
    assert!(!app.work.join(&digest).exists());
}

#[tokio::test]
async fn fetch_falls_back_to_the_hashsum_cookie() {
    let app = app(Options::default());
    let archive = zip_archive(&[("doc.md", "# Title\n")]);
    let digest = digest_of(&archive);
    upload(&app, &archive, &[]).await;
    fetch_rendered(&app, &digest, 1).await;

    let request = Request::builder()
        .uri("/fetch")
        .header(header::COOKIE, format!("hashsum={digest}"))
        .body(Body::empty())
        .expect("request");
    let response = send(&app.router, request).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn landing_page_stylesheet_and_health_are_served() {
    let app = app(Options::default());

    let response = send(&app.router, get("/")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.contains("<form"));

    for uri in ["/style", "/style.css"] {
        let response = send(&app.router, get(uri)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).expect("type"),
            "text/css"
        );
    }

    let response = send(&app.router, get("/_health")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}
