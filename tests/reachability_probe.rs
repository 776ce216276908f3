use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use sourcegate::config::ReachabilityConfig;
use sourcegate::formats::UrlStatus;
use sourcegate::reachability::ReachabilityChecker;

struct ProbeTarget {
    base_url: String,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ProbeTarget {
    fn spawn() -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start probe target");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}");
        let location = format!("{base_url}/ok");
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                let request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };
                let location = location.clone();
                thread::spawn(move || respond(request, &location));
            }
        });

        Self {
            base_url,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

fn respond(request: tiny_http::Request, location: &str) {
    let is_head = request.method() == &tiny_http::Method::Head;
    let path = request.url().to_string();
    let response = tiny_http::Response::from_string("<html></html>");
    let response = match path.as_str() {
        "/ok" => response,
        "/auth" => response.with_status_code(401),
        "/forbidden" => response.with_status_code(403),
        "/gone" => response.with_status_code(404),
        "/removed" => response.with_status_code(410),
        "/boom" => response.with_status_code(500),
        "/throttled" => response.with_status_code(429),
        "/get-only" if is_head => response.with_status_code(405),
        "/get-only" => response,
        "/moved" => response.with_status_code(302).with_header(
            tiny_http::Header::from_bytes(&b"Location"[..], location.as_bytes())
                .expect("location header"),
        ),
        "/slow" => {
            thread::sleep(Duration::from_millis(1500));
            response
        }
        _ => response.with_status_code(404),
    };
    let _ = request.respond(response);
}

impl Drop for ProbeTarget {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn checker(timeout_ms: u64) -> ReachabilityChecker {
    let config = ReachabilityConfig {
        timeout_ms,
        ..ReachabilityConfig::default()
    };
    ReachabilityChecker::new(&config).expect("build checker")
}

#[tokio::test]
async fn http_outcomes_map_onto_the_status_taxonomy() {
    let target = ProbeTarget::spawn();
    let checker = checker(3000);

    let cases = [
        ("/ok", UrlStatus::Ok, 200),
        ("/auth", UrlStatus::AuthRequired, 401),
        ("/forbidden", UrlStatus::Forbidden, 403),
        ("/gone", UrlStatus::NotFound, 404),
        ("/removed", UrlStatus::NotFound, 410),
        ("/boom", UrlStatus::ServerError, 500),
        ("/throttled", UrlStatus::ConnectionError, 429),
    ];
    for (path, status, code) in cases {
        let report = checker.check(&target.url(path)).await;
        assert_eq!(report.status, status, "{path}");
        assert_eq!(report.http_code, Some(code), "{path}");
    }
}

#[tokio::test]
async fn head_refusal_falls_back_to_get() {
    let target = ProbeTarget::spawn();
    let report = checker(3000).check(&target.url("/get-only")).await;
    assert_eq!(report.status, UrlStatus::Ok);
    assert_eq!(report.http_code, Some(200));
}

#[tokio::test]
async fn redirects_are_followed_and_final_url_recorded() {
    let target = ProbeTarget::spawn();
    let report = checker(3000).check(&target.url("/moved")).await;
    assert_eq!(report.status, UrlStatus::Ok);
    assert_eq!(report.final_url.as_deref(), Some(target.url("/ok").as_str()));
}

#[tokio::test]
async fn slow_pages_time_out() {
    let target = ProbeTarget::spawn();
    let report = checker(200).check(&target.url("/slow")).await;
    assert_eq!(report.status, UrlStatus::Timeout);
    assert!(report.failure_reason.is_some());
}

#[tokio::test]
async fn refused_connections_are_connection_errors() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    };
    let report = checker(1000)
        .check(&format!("http://127.0.0.1:{port}/nothing"))
        .await;
    assert_eq!(report.status, UrlStatus::ConnectionError);
}

#[tokio::test]
async fn malformed_references_never_hit_the_network() {
    let checker = checker(1000);
    assert_eq!(
        checker.check("https://example.com/guide-to-\u{2026}").await.status,
        UrlStatus::InvalidUrlTruncated
    );
    assert_eq!(checker.check("ftp://example.com/x").await.status, UrlStatus::InvalidUrl);
}
