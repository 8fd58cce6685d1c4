use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;
use url::Url;
use webmirror::{Downloader, RunOptions};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// 1x1 PNG, enough to look like a real image on disk.
const PNG_BYTES: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x02, 0x00, 0x00, 0x00, 0x90,
    0x77, 0x53, 0xDE, 0x00, 0x00, 0x00, 0x0C, 0x49, 0x44, 0x41, 0x54, 0x08, 0x99, 0x01, 0x01,
    0x00, 0x00, 0x00, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x02, 0x00, 0x01, 0xE2, 0x21, 0xBC, 0x33,
    0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

fn mirror_options(root: PathBuf) -> RunOptions {
    RunOptions {
        output_root: root,
        max_concurrency: 4,
        request_timeout: Duration::from_secs(10),
        download_assets: true,
        include_third_party_assets: false,
    }
}

fn url_on(server: &MockServer, url_path: &str) -> Url {
    Url::parse(&format!("{}{}", server.uri(), url_path)).unwrap()
}

async fn mount_body(server: &MockServer, at: &str, content_type: &str, body: impl Into<Vec<u8>>) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(body.into())
                .insert_header("content-type", content_type),
        )
        .mount(server)
        .await;
}

fn files_with_extension(dir: &Path, extension: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|e| e == extension) {
                found.push(path);
            }
        }
    }
    found
}

async fn requests_for(server: &MockServer, url_path: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.url.path() == url_path)
        .count()
}

#[tokio::test]
async fn test_html_mirror_end_to_end() {
    let server = MockServer::start().await;
    mount_body(
        &server,
        "/page",
        "text/html",
        concat!(
            "<!doctype html><html><head>",
            r#"<link rel="stylesheet" href="/style.css">"#,
            "</head><body><h1>hi</h1>",
            r#"<img src="/img.png">"#,
            "</body></html>"
        )
        .as_bytes()
        .to_vec(),
    )
    .await;
    mount_body(
        &server,
        "/style.css",
        "text/css",
        "body { background-image: url('/img.png'); }".as_bytes().to_vec(),
    )
    .await;
    mount_body(&server, "/img.png", "image/png", PNG_BYTES.to_vec()).await;

    let tmp = tempdir().unwrap();
    let downloader = Downloader::new(mirror_options(tmp.path().to_path_buf())).unwrap();
    let results = downloader
        .run(vec![url_on(&server, "/page")], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert!(results[0].success, "{:?}", results[0].error);

    let html_path = results[0].path.clone().unwrap();
    assert!(html_path.ends_with(Path::new("127.0.0.1/page/index.html")));
    let html = std::fs::read_to_string(&html_path).unwrap();
    assert!(!html.contains(r#"href="/style.css""#));
    assert!(!html.contains(r#"src="/img.png""#));
    assert!(html.contains(r#"href="../style.css""#));
    assert!(html.contains(r#"src="../img.png""#));

    let host_dir = tmp.path().join("127.0.0.1");
    let css_files = files_with_extension(&host_dir, "css");
    let png_files = files_with_extension(&host_dir, "png");
    assert!(!css_files.is_empty());
    assert!(!png_files.is_empty());

    let css = std::fs::read_to_string(&css_files[0]).unwrap();
    assert!(css.contains("url(img.png)"), "css was: {css}");
    assert!(!css.contains("url('/img.png')"));
}

#[tokio::test]
async fn test_rewritten_references_resolve_on_disk() {
    let server = MockServer::start().await;
    mount_body(
        &server,
        "/docs/guide/",
        "text/html",
        concat!(
            "<html><head>",
            r#"<link rel="stylesheet" href="../theme.css">"#,
            r#"<script src="/js/app.js"></script>"#,
            "</head><body>",
            r#"<img src="/images/logo.png">"#,
            "</body></html>"
        )
        .as_bytes()
        .to_vec(),
    )
    .await;
    mount_body(&server, "/docs/theme.css", "text/css", "h1 {}".as_bytes().to_vec()).await;
    mount_body(
        &server,
        "/js/app.js",
        "application/javascript",
        "console.log(1)".as_bytes().to_vec(),
    )
    .await;
    mount_body(&server, "/images/logo.png", "image/png", PNG_BYTES.to_vec()).await;

    let tmp = tempdir().unwrap();
    let downloader = Downloader::new(mirror_options(tmp.path().to_path_buf())).unwrap();
    let results = downloader
        .run(vec![url_on(&server, "/docs/guide/")], &CancellationToken::new())
        .await
        .unwrap();
    assert!(results[0].success, "{:?}", results[0].error);

    let html_path = results[0].path.clone().unwrap();
    let html_dir = html_path.parent().unwrap();
    let html = std::fs::read_to_string(&html_path).unwrap();

    let document = select::document::Document::from(html.as_str());
    let mut checked = 0;
    for node in document.find(select::predicate::Name("link")) {
        let href = node.attr("href").unwrap();
        assert!(!href.starts_with('/'), "still absolute: {href}");
        assert!(html_dir.join(href).exists(), "missing target of {href}");
        checked += 1;
    }
    for tag in ["script", "img"] {
        for node in document.find(select::predicate::Name(tag)) {
            let src = node.attr("src").unwrap();
            assert!(!src.starts_with('/'), "still absolute: {src}");
            assert!(html_dir.join(src).exists(), "missing target of {src}");
            checked += 1;
        }
    }
    assert_eq!(checked, 3);
}

#[tokio::test]
async fn test_shared_asset_is_fetched_once_per_run() {
    let server = MockServer::start().await;
    let page = |img: &str| {
        format!(r#"<html><body><img src="{img}"><img src="{img}"></body></html>"#)
            .into_bytes()
    };
    mount_body(&server, "/a", "text/html", page("/shared.png")).await;
    mount_body(&server, "/b", "text/html", page("/shared.png")).await;
    mount_body(&server, "/shared.png", "image/png", PNG_BYTES.to_vec()).await;

    let tmp = tempdir().unwrap();
    let downloader = Downloader::new(mirror_options(tmp.path().to_path_buf())).unwrap();
    let results = downloader
        .run(
            vec![url_on(&server, "/a"), url_on(&server, "/b")],
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(results.iter().all(|r| r.success));
    assert_eq!(requests_for(&server, "/shared.png").await, 1);
}

#[tokio::test]
async fn test_third_party_assets_are_skipped_by_default() {
    let assets = MockServer::start().await;
    mount_body(&assets, "/lib.js", "application/javascript", "x".as_bytes().to_vec()).await;

    let pages = MockServer::start().await;
    let body = format!(
        r#"<html><head><script src="{}/lib.js"></script></head><body><img src="/own.png"></body></html>"#,
        assets.uri()
    );
    mount_body(&pages, "/page", "text/html", body.into_bytes()).await;
    mount_body(&pages, "/own.png", "image/png", PNG_BYTES.to_vec()).await;

    let tmp = tempdir().unwrap();
    let downloader = Downloader::new(mirror_options(tmp.path().to_path_buf())).unwrap();
    let results = downloader
        .run(vec![url_on(&pages, "/page")], &CancellationToken::new())
        .await
        .unwrap();
    assert!(results[0].success);

    // The cross-origin script was never requested and its reference survived.
    assert!(assets.received_requests().await.unwrap().is_empty());
    let html = std::fs::read_to_string(results[0].path.as_ref().unwrap()).unwrap();
    assert!(html.contains(&format!(r#"src="{}/lib.js""#, assets.uri())));
    assert!(!html.contains(r#"src="/own.png""#));
}

#[tokio::test]
async fn test_third_party_assets_are_mirrored_when_enabled() {
    let assets = MockServer::start().await;
    mount_body(&assets, "/lib.js", "application/javascript", "x".as_bytes().to_vec()).await;

    let pages = MockServer::start().await;
    let body = format!(
        r#"<html><head><script src="{}/lib.js"></script></head></html>"#,
        assets.uri()
    );
    mount_body(&pages, "/page", "text/html", body.into_bytes()).await;

    let tmp = tempdir().unwrap();
    let mut opts = mirror_options(tmp.path().to_path_buf());
    opts.include_third_party_assets = true;
    let downloader = Downloader::new(opts).unwrap();
    let results = downloader
        .run(vec![url_on(&pages, "/page")], &CancellationToken::new())
        .await
        .unwrap();
    assert!(results[0].success);

    assert_eq!(requests_for(&assets, "/lib.js").await, 1);
    let html = std::fs::read_to_string(results[0].path.as_ref().unwrap()).unwrap();
    assert!(!html.contains(&format!(r#"src="{}/lib.js""#, assets.uri())));
    // Both mock servers share the 127.0.0.1 host tree, so the script sits one
    // level above the page's directory.
    assert!(html.contains(r#"src="../lib.js""#));
}

#[tokio::test]
async fn test_failed_asset_leaves_reference_untouched() {
    let server = MockServer::start().await;
    mount_body(
        &server,
        "/page",
        "text/html",
        r#"<html><body><img src="/missing.png"><img src="/present.png"></body></html>"#
            .as_bytes()
            .to_vec(),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/missing.png"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    mount_body(&server, "/present.png", "image/png", PNG_BYTES.to_vec()).await;

    let tmp = tempdir().unwrap();
    let downloader = Downloader::new(mirror_options(tmp.path().to_path_buf())).unwrap();
    let results = downloader
        .run(vec![url_on(&server, "/page")], &CancellationToken::new())
        .await
        .unwrap();

    assert!(results[0].success, "asset failures must not fail the page");
    let html = std::fs::read_to_string(results[0].path.as_ref().unwrap()).unwrap();
    assert!(html.contains(r#"src="/missing.png""#));
    assert!(html.contains(r#"src="../present.png""#));
}

#[tokio::test]
async fn test_page_without_assets_is_written_verbatim() {
    let server = MockServer::start().await;
    let body = "<html><body><p>plain text page</p></body></html>";
    mount_body(&server, "/plain", "text/html", body.as_bytes().to_vec()).await;

    let tmp = tempdir().unwrap();
    let downloader = Downloader::new(mirror_options(tmp.path().to_path_buf())).unwrap();
    let results = downloader
        .run(vec![url_on(&server, "/plain")], &CancellationToken::new())
        .await
        .unwrap();

    assert!(results[0].success);
    let html = std::fs::read_to_string(results[0].path.as_ref().unwrap()).unwrap();
    assert_eq!(html, body);
}

#[tokio::test]
async fn test_css_dependencies_stop_after_one_level() {
    let server = MockServer::start().await;
    mount_body(
        &server,
        "/page",
        "text/html",
        r#"<html><head><link rel="stylesheet" href="/style.css"></head></html>"#
            .as_bytes()
            .to_vec(),
    )
    .await;
    mount_body(
        &server,
        "/style.css",
        "text/css",
        "@import url(/deep.css);".as_bytes().to_vec(),
    )
    .await;
    mount_body(
        &server,
        "/deep.css",
        "text/css",
        ".x { background: url(/never.png); }".as_bytes().to_vec(),
    )
    .await;
    mount_body(&server, "/never.png", "image/png", PNG_BYTES.to_vec()).await;

    let tmp = tempdir().unwrap();
    let downloader = Downloader::new(mirror_options(tmp.path().to_path_buf())).unwrap();
    let results = downloader
        .run(vec![url_on(&server, "/page")], &CancellationToken::new())
        .await
        .unwrap();
    assert!(results[0].success);

    assert_eq!(requests_for(&server, "/style.css").await, 1);
    assert_eq!(requests_for(&server, "/deep.css").await, 1);
    // One level only: the dependency's own references are not followed.
    assert_eq!(requests_for(&server, "/never.png").await, 0);

    let style = std::fs::read_to_string(tmp.path().join("127.0.0.1").join("style.css")).unwrap();
    assert!(style.contains("url(deep.css)"));
    let deep = std::fs::read_to_string(tmp.path().join("127.0.0.1").join("deep.css")).unwrap();
    assert!(deep.contains("url(/never.png)"));
}

#[tokio::test]
async fn test_linked_stylesheet_fetched_as_a_dependency_first_is_still_processed() {
    let server = MockServer::start().await;
    // style-b is queued first and, while being processed, discovers style-a
    // as a dependency. With a single worker that discovery fetches style-a
    // before style-a's own top-level slot opens; style-a's dependency stage
    // must still run when the top-level reference gets its turn.
    mount_body(
        &server,
        "/page",
        "text/html",
        concat!(
            "<html><head>",
            r#"<link rel="stylesheet" href="/style-b.css">"#,
            r#"<link rel="stylesheet" href="/style-a.css">"#,
            "</head></html>"
        )
        .as_bytes()
        .to_vec(),
    )
    .await;
    mount_body(
        &server,
        "/style-b.css",
        "text/css",
        "@import url(/style-a.css);\n.b { color: red; }".as_bytes().to_vec(),
    )
    .await;
    mount_body(
        &server,
        "/style-a.css",
        "text/css",
        ".a { background: url(/pattern.png); }".as_bytes().to_vec(),
    )
    .await;
    mount_body(&server, "/pattern.png", "image/png", PNG_BYTES.to_vec()).await;

    let tmp = tempdir().unwrap();
    let mut opts = mirror_options(tmp.path().to_path_buf());
    opts.max_concurrency = 1;
    let downloader = Downloader::new(opts).unwrap();
    let results = downloader
        .run(vec![url_on(&server, "/page")], &CancellationToken::new())
        .await
        .unwrap();
    assert!(results[0].success, "{:?}", results[0].error);

    // Each file is fetched once no matter how many discovery paths hit it.
    assert_eq!(requests_for(&server, "/style-b.css").await, 1);
    assert_eq!(requests_for(&server, "/style-a.css").await, 1);
    assert_eq!(requests_for(&server, "/pattern.png").await, 1);

    let host_dir = tmp.path().join("127.0.0.1");
    let style_b = std::fs::read_to_string(host_dir.join("style-b.css")).unwrap();
    assert!(style_b.contains("url(style-a.css)"));

    // style-a's own references were resolved and rewritten even though its
    // fetch was won by style-b's dependency discovery.
    let style_a = std::fs::read_to_string(host_dir.join("style-a.css")).unwrap();
    assert!(style_a.contains("url(pattern.png)"), "style-a was: {style_a}");
    assert!(!style_a.contains("url(/pattern.png)"));

    let html = std::fs::read_to_string(results[0].path.as_ref().unwrap()).unwrap();
    assert!(html.contains(r#"href="../style-a.css""#));
    assert!(html.contains(r#"href="../style-b.css""#));
}

#[tokio::test]
async fn test_srcset_candidates_collapse_to_the_local_copy() {
    let server = MockServer::start().await;
    mount_body(
        &server,
        "/page",
        "text/html",
        r#"<html><body><img srcset="/small.png 1x, /big.png 2x"></body></html>"#
            .as_bytes()
            .to_vec(),
    )
    .await;
    mount_body(&server, "/small.png", "image/png", PNG_BYTES.to_vec()).await;
    mount_body(&server, "/big.png", "image/png", PNG_BYTES.to_vec()).await;

    let tmp = tempdir().unwrap();
    let downloader = Downloader::new(mirror_options(tmp.path().to_path_buf())).unwrap();
    let results = downloader
        .run(vec![url_on(&server, "/page")], &CancellationToken::new())
        .await
        .unwrap();
    assert!(results[0].success);

    // Only the first candidate backs the srcset; every candidate is rewritten
    // onto it with its descriptor kept.
    assert_eq!(requests_for(&server, "/small.png").await, 1);
    assert_eq!(requests_for(&server, "/big.png").await, 0);
    let html = std::fs::read_to_string(results[0].path.as_ref().unwrap()).unwrap();
    assert!(html.contains(r#"srcset="../small.png 1x, ../small.png 2x""#));
}
