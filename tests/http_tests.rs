//! End-to-end tests for the HTTP front end

use std::net::SocketAddr;
use std::thread::JoinHandle;
use std::time::Duration;

use plantcam::capture::{FrameSource, GrabPolicy, NoIllumination, PixelFormat, SimulatedSensor};
use plantcam::pipeline::{CaptureOrchestrator, CaptureScheduler, OrchestratorHandle, SystemClock};
use plantcam::server::HttpServer;
use plantcam::storage::{DirectoryStore, Naming};
use plantcam::Config;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct Harness {
    addr: SocketAddr,
    handle: OrchestratorHandle,
    core: JoinHandle<()>,
    _dir: tempfile::TempDir,
}

async fn start() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.capture.width = 32;
    config.capture.height = 24;
    config.stream.width = 16;
    config.stream.height = 12;
    config.schedule.poll_interval_ms = 1;

    let source = FrameSource::new(
        Box::new(SimulatedSensor::new(PixelFormat::Rgb24)),
        Box::new(NoIllumination),
        2,
        GrabPolicy::Latest,
        config.still_profile(),
    )
    .unwrap();
    let store = DirectoryStore::open(dir.path(), "plant_", ".jpg", Naming::Sequence).unwrap();
    let catalog = store.catalog();

    // A run during hour 23 also stores the daily image; nothing below counts files
    let (orchestrator, handle) = CaptureOrchestrator::new(
        source,
        CaptureScheduler::new(23),
        Box::new(SystemClock::default()),
        Box::new(store),
        config.orchestrator_settings(),
    );
    let core = std::thread::spawn(move || orchestrator.run());

    let server = HttpServer::bind("127.0.0.1:0", handle.clone(), Some(catalog), 2)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());

    Harness {
        addr,
        handle,
        core,
        _dir: dir,
    }
}

async fn get(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

impl Harness {
    fn stop(self) {
        self.handle.shutdown();
        self.core.join().unwrap();
    }
}

#[tokio::test]
async fn test_capture_list_and_download() {
    let harness = start().await;

    let response = get(harness.addr, "GET /capture HTTP/1.1\r\nHost: cam\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    let name = response
        .lines()
        .find_map(|l| l.strip_prefix("Image saved successfully: "))
        .unwrap()
        .trim()
        .to_string();

    let listing = get(harness.addr, "GET /list HTTP/1.1\r\n\r\n").await;
    assert!(listing.contains(&name), "{listing}");

    let download = get(
        harness.addr,
        &format!("GET /download?file={name} HTTP/1.1\r\n\r\n"),
    )
    .await;
    assert!(download.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(download.contains("Content-Type: image/jpeg\r\n"));

    harness.stop();
}

#[tokio::test]
async fn test_error_statuses() {
    let harness = start().await;

    let missing = get(harness.addr, "GET /nope HTTP/1.1\r\n\r\n").await;
    assert!(missing.starts_with("HTTP/1.1 404"), "{missing}");

    let post = get(harness.addr, "POST /capture HTTP/1.1\r\n\r\n").await;
    assert!(post.starts_with("HTTP/1.1 405"), "{post}");

    let traversal = get(harness.addr, "GET /download?file=../x.jpg HTTP/1.1\r\n\r\n").await;
    assert!(traversal.starts_with("HTTP/1.1 400"), "{traversal}");

    let absent = get(harness.addr, "GET /download?file=plant_4242.jpg HTTP/1.1\r\n\r\n").await;
    assert!(absent.starts_with("HTTP/1.1 404"), "{absent}");

    let index = get(harness.addr, "GET / HTTP/1.1\r\n\r\n").await;
    assert!(index.contains("/stream"));

    harness.stop();
}

#[tokio::test]
async fn test_stream_delivers_multipart_jpeg() {
    let harness = start().await;

    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    stream
        .write_all(b"GET /stream HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let mut received = Vec::new();
    let mut chunk = [0u8; 4096];
    let part_marker = b"--frame\r\nContent-Type: image/jpeg\r\n";
    tokio::time::timeout(Duration::from_secs(10), async {
        while !received
            .windows(part_marker.len())
            .any(|w| w == part_marker)
        {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "stream closed early");
            received.extend_from_slice(&chunk[..n]);
        }
    })
    .await
    .unwrap();

    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("multipart/x-mixed-replace; boundary=frame"));

    drop(stream);
    harness.stop();
}
