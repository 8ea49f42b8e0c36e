//! # Integration Test Fixtures
//!
//! Helpers shared by the end-to-end tests: a one-connection-per-response
//! HTTP server standing in for a channel endpoint, gzip encoding of bucket
//! objects, and builders for offer payloads.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::{Value, json};

/// A mock channel endpoint. Each accepted connection is answered with the
/// next queued body, written in `chunk_size` pieces.
pub struct MockChannel {
    pub url: String,
    handle: thread::JoinHandle<usize>,
}

impl MockChannel {
    /// Serves `bodies` with `200 OK`, one per connection, then stops.
    pub fn serve(bodies: Vec<String>, chunk_size: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to random port");
        let port = listener.local_addr().expect("bound listener has an address").port();
        let handle = thread::spawn(move || {
            let mut served = 0;
            for body in bodies {
                let Ok((mut stream, _)) = listener.accept() else {
                    break;
                };
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let head = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n";
                if stream.write_all(head.as_bytes()).is_err() {
                    continue;
                }
                for piece in body.as_bytes().chunks(chunk_size.max(1)) {
                    if stream.write_all(piece).is_err() {
                        break;
                    }
                    let _ = stream.flush();
                    thread::sleep(Duration::from_millis(1));
                }
                served += 1;
            }
            served
        });
        Self {
            url: format!("http://127.0.0.1:{port}/ads"),
            handle,
        }
    }

    /// Waits for the server thread and returns how many bodies it served.
    pub fn join(self) -> usize {
        self.handle.join().unwrap_or(0)
    }
}

/// One offer record as channels publish it.
pub fn offer(id: &str, payout: f64, expression: &str) -> Value {
    json!({
        "id": id,
        "payout": payout,
        "payout_type": "CPI",
        "expression": expression,
        "creatives": [format!("https://cdn.example.com/{id}.png")],
        "pre_click_rate": 0.1
    })
}

/// The streaming envelope `{"err_msg": ..., "ads": [...]}`. Raw strings in
/// `ads` are spliced in verbatim so tests can inject malformed elements.
pub fn ads_envelope(status: &str, ads: &[String]) -> String {
    format!(r#"{{"err_msg":{},"ads":[{}]}}"#, json!(status), ads.join(","))
}

/// Gzip-compresses `data`.
pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("writing to a Vec cannot fail");
    encoder.finish().expect("writing to a Vec cannot fail")
}

/// A gzipped JSON array of `offers`, as stored in the bucket.
pub fn gzipped_offers(offers: &[Value]) -> Vec<u8> {
    gzip(Value::Array(offers.to_vec()).to_string().as_bytes())
}
