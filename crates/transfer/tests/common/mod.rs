use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use loopnode_transfer::{HttpConfig, LoopHttpClient, TransferConfig, TransferService};

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener address");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("test server");
    });
    format!("http://{addr}")
}

/// HTTP config with retry delays short enough for tests.
pub fn test_http_config(base_url: &str) -> HttpConfig {
    HttpConfig {
        base_url: base_url.to_string(),
        request_timeout: Duration::from_secs(5),
        rate_limit_delay: Duration::from_millis(10),
        rate_limit_attempts: 5,
        ..Default::default()
    }
}

pub fn test_service(base_url: &str) -> TransferService {
    let http = LoopHttpClient::new(test_http_config(base_url)).expect("build client");
    TransferService::new(
        Arc::new(http),
        TransferConfig {
            launch_stagger: Duration::from_millis(1),
            ..Default::default()
        },
    )
}

/// A tiny but fully valid PNG.
pub fn png_bytes() -> Vec<u8> {
    let mut png = Vec::new();
    image::RgbImage::new(4, 4)
        .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .expect("encode png");
    png
}

/// Zip archive with the given `(path, content)` entries.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut buffer = Vec::new();
    {
        let mut writer = zip::ZipWriter::new(Cursor::new(&mut buffer));
        for (name, content) in entries {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .expect("start zip entry");
            writer.write_all(content).expect("write zip entry");
        }
        writer.finish().expect("finish zip");
    }
    buffer
}
