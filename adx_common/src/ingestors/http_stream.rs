//! # HTTP Streaming Channel Fetcher
//!
//! Pulls one channel's inventory from a streaming JSON endpoint. The body is
//! read chunk by chunk and handed to [`AdsStreamDecoder`], so records reach
//! the sink while the download is still running.

use std::ops::ControlFlow;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tracing::{debug, info, warn};

use super::ads_stream::{AdsEvent, AdsStreamDecoder};
use super::{FetchError, FetchSummary};
use crate::inventory::RawOffer;
use crate::retrieve::ApiClient;

/// Consecutive undecodable records tolerated before a channel is abandoned.
pub const MAX_CONSECUTIVE_DECODE_FAILURES: u32 = 50;

/// Expected value of `err_msg`.
pub const SUCCESS_TOKEN: &str = "success";

#[derive(Clone)]
pub struct HttpStreamFetcher {
    client: ApiClient,
}

impl HttpStreamFetcher {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    /// Streams `url` and passes every decoded offer to `sink`.
    ///
    /// # Errors
    ///
    /// Transport failures, non-2xx answers, broken bodies and corrupt
    /// envelopes. Records handed to `sink` before the error stay handed.
    pub async fn fetch(
        &self,
        channel: &str,
        url: &str,
        sink: &mut (dyn FnMut(RawOffer) + Send),
    ) -> Result<FetchSummary, FetchError> {
        let response = self
            .client
            .get_stream(url)
            .await
            .map_err(|e| FetchError::Transport {
                channel: channel.to_string(),
                message: format!("{e:#}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                channel: channel.to_string(),
                status: status.as_u16(),
            });
        }

        drain_ads(channel, response.bytes_stream(), sink).await
    }
}

/// Decodes an ads envelope from any byte stream.
///
/// A record that fails to decode bumps a consecutive-failure counter, a
/// record that decodes resets it. Once the counter passes
/// [`MAX_CONSECUTIVE_DECODE_FAILURES`] the rest of the body is dropped and the
/// summary is marked abandoned.
///
/// # Errors
///
/// Returns an error if the stream yields an error or the envelope is corrupt.
pub async fn drain_ads<S, E>(
    channel: &str,
    body: S,
    sink: &mut (dyn FnMut(RawOffer) + Send),
) -> Result<FetchSummary, FetchError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut body = std::pin::pin!(body);
    let mut decoder = AdsStreamDecoder::new();
    let mut summary = FetchSummary::default();
    let mut consecutive_failures: u32 = 0;

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| FetchError::Stream {
            channel: channel.to_string(),
            message: e.to_string(),
        })?;

        let flow = decoder
            .feed(&chunk, |event| match event {
                AdsEvent::Status(status) => {
                    if status != SUCCESS_TOKEN {
                        warn!(channel, %status, "Channel answered with a suspect status; processing anyway");
                    }
                    summary.status = Some(status);
                    ControlFlow::Continue(())
                }
                AdsEvent::Record(raw) => {
                    consecutive_failures = 0;
                    summary.records += 1;
                    sink(*raw);
                    ControlFlow::Continue(())
                }
                AdsEvent::Malformed(error) => {
                    consecutive_failures += 1;
                    summary.decode_failures += 1;
                    debug!(channel, %error, consecutive_failures, "Skipping undecodable record");
                    if consecutive_failures > MAX_CONSECUTIVE_DECODE_FAILURES {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                }
            })
            .map_err(|e| FetchError::Envelope {
                channel: channel.to_string(),
                error: e,
            })?;

        if flow.is_break() {
            summary.abandoned = true;
            warn!(
                channel,
                records = summary.records,
                decode_failures = summary.decode_failures,
                "Abandoning channel after {} consecutive decode failures",
                consecutive_failures
            );
            return Ok(summary);
        }
    }

    decoder.finish().map_err(|e| FetchError::Envelope {
        channel: channel.to_string(),
        error: e,
    })?;

    info!(
        channel,
        records = summary.records,
        decode_failures = summary.decode_failures,
        "Channel stream drained"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::convert::Infallible;

    fn body_with(valid_head: usize, malformed: usize, valid_tail: usize) -> String {
        let mut ads = Vec::new();
        for i in 0..valid_head {
            ads.push(format!(r#"{{"id":"h{i}","payout":1.0,"expression":"country in {{US}}"}}"#));
        }
        for _ in 0..malformed {
            ads.push(r#"{"payout":"broken"}"#.to_string());
        }
        for i in 0..valid_tail {
            ads.push(format!(r#"{{"id":"t{i}","payout":1.0,"expression":"country in {{US}}"}}"#));
        }
        format!(r#"{{"err_msg":"success","ads":[{}]}}"#, ads.join(","))
    }

    fn chunked(body: String, size: usize) -> impl Stream<Item = Result<Bytes, Infallible>> {
        let chunks: Vec<Result<Bytes, Infallible>> = body
            .into_bytes()
            .chunks(size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(chunks)
    }

    async fn drain(body: String) -> (Result<FetchSummary, FetchError>, Vec<String>) {
        let mut ids = Vec::new();
        let mut sink = |raw: RawOffer| ids.push(raw.id);
        let result = drain_ads("mob", chunked(body, 17), &mut sink).await;
        (result, ids)
    }

    #[tokio::test]
    async fn tolerates_up_to_fifty_consecutive_failures() {
        let (result, ids) = drain(body_with(2, 50, 3)).await;
        let summary = result.unwrap();

        assert_eq!(ids.len(), 5);
        assert_eq!(summary.records, 5);
        assert_eq!(summary.decode_failures, 50);
        assert!(!summary.abandoned);
        assert_eq!(summary.status.as_deref(), Some(SUCCESS_TOKEN));
    }

    #[tokio::test]
    async fn fifty_first_consecutive_failure_abandons_channel() {
        let (result, ids) = drain(body_with(2, 51, 3)).await;
        let summary = result.unwrap();

        assert_eq!(ids, vec!["h0", "h1"]);
        assert_eq!(summary.decode_failures, 51);
        assert!(summary.abandoned);
    }

    #[tokio::test]
    async fn a_good_record_resets_the_failure_counter() {
        let mut ads = Vec::new();
        for round in 0..3 {
            for _ in 0..40 {
                ads.push(r#"{"id":null,"payout":1.0}"#.to_string());
            }
            ads.push(format!(r#"{{"id":"r{round}","payout":1.0}}"#));
        }
        let body = format!(r#"{{"err_msg":"success","ads":[{}]}}"#, ads.join(","));
        let (result, ids) = drain(body).await;
        let summary = result.unwrap();

        assert_eq!(ids, vec!["r0", "r1", "r2"]);
        assert_eq!(summary.decode_failures, 120);
        assert!(!summary.abandoned);
    }

    #[tokio::test]
    async fn truncated_body_keeps_records_already_yielded() {
        let mut body = body_with(3, 0, 0);
        body.truncate(body.len() - 2);
        let (result, ids) = drain(body).await;

        assert_eq!(ids.len(), 3);
        assert!(matches!(result, Err(FetchError::Envelope { .. })));
    }

    #[tokio::test]
    async fn suspect_status_is_still_processed() {
        let body = r#"{"err_msg":"quota exceeded","ads":[{"id":"x","payout":2.0}]}"#.to_string();
        let (result, ids) = drain(body).await;
        let summary = result.unwrap();

        assert_eq!(ids, vec!["x"]);
        assert_eq!(summary.status.as_deref(), Some("quota exceeded"));
    }

    #[tokio::test]
    async fn stream_error_is_reported() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(br#"{"ads":[{"id":"a","payout":1.0},"#)),
            Err("connection reset".to_string()),
        ];
        let mut ids = Vec::new();
        let mut sink = |raw: RawOffer| ids.push(raw.id);
        let result = drain_ads("mob", stream::iter(chunks), &mut sink).await;

        assert_eq!(ids, vec!["a"]);
        assert!(matches!(result, Err(FetchError::Stream { .. })));
    }
}
