use bytes::Bytes;
use futures::{Stream, stream};
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING, VARY};
use http::{HeaderMap, HeaderValue, StatusCode};
use micro_recode::{Encoding, JobQueue, MemorySink, Mode, RecodeError, Recompressor, WireSink};
use std::io;
use std::time::Duration;

const MIB: usize = 1024 * 1024;

/// Compressible but not trivially repetitive text.
fn corpus(len: usize) -> Vec<u8> {
    const WORDS: [&str; 8] = ["alpha ", "beta ", "gamma ", "delta ", "epsilon ", "zeta ", "eta ", "theta\n"];
    let mut state = 0x2545_f491_u32;
    let mut out = Vec::with_capacity(len + 8);
    while out.len() < len {
        state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        out.extend_from_slice(WORDS[(state >> 16) as usize % WORDS.len()].as_bytes());
    }
    out.truncate(len);
    out
}

fn chunked(data: &[u8], size: usize) -> impl Stream<Item = io::Result<Bytes>> + use<> {
    let chunks: Vec<_> = data.chunks(size).map(|c| Ok(Bytes::copy_from_slice(c))).collect();
    stream::iter(chunks)
}

fn request(accept: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static(accept));
    headers
}

fn response(content_type: &'static str, encoding: Encoding, length: usize) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    encoding.apply_header(&mut headers);
    headers
}

fn recompressor(threshold: usize) -> Recompressor {
    Recompressor::builder().threshold(threshold).queue(JobQueue::new(1, Some(Duration::from_secs(60)))).build()
}

#[tokio::test]
async fn gzip_origin_is_buffered_into_brotli() {
    let plain = corpus(2 * MIB);
    let origin = Encoding::Gzip.compress_buffer(Bytes::from(plain.clone()), true).await.unwrap();
    let mut headers = response("text/html", Encoding::Gzip, origin.len());
    let mut sink = MemorySink::new();

    let outcome = Recompressor::default()
        .recompress(&request("gzip, deflate, br"), &mut headers, chunked(&origin, 64 * 1024), &mut sink, false)
        .await
        .unwrap();

    assert_eq!(outcome.encoding_in, Encoding::Gzip);
    assert_eq!(outcome.encoding_out, Encoding::Brotli);
    assert_eq!(outcome.mode, Mode::Buffered);

    let sent = sink.headers().unwrap();
    assert_eq!(sent[CONTENT_ENCODING], "br");
    assert_eq!(sent[CONTENT_LENGTH], sink.body().len().to_string().as_str());
    assert!(!sent.contains_key(TRANSFER_ENCODING));
    assert_eq!(sent[VARY], "accept-encoding");
    assert_eq!(outcome.bytes_written, sink.body().len() as u64);

    let restored = Encoding::Brotli.decompress_buffer(sink.into_body()).await.unwrap();
    assert_eq!(restored, plain);
}

#[tokio::test]
async fn plain_origin_above_threshold_is_streamed_as_gzip() {
    let plain = corpus(33 * MIB);
    let mut headers = response("application/json", Encoding::Identity, plain.len());
    let mut sink = MemorySink::new();

    let outcome = Recompressor::default()
        .recompress(&request("gzip, deflate"), &mut headers, chunked(&plain, 256 * 1024), &mut sink, true)
        .await
        .unwrap();

    assert_eq!(outcome.encoding_out, Encoding::Gzip);
    assert_eq!(outcome.mode, Mode::Streamed);

    let sent = sink.headers().unwrap();
    assert_eq!(sent[CONTENT_ENCODING], "gzip");
    assert_eq!(sent[TRANSFER_ENCODING], "chunked");
    assert!(!sent.contains_key(CONTENT_LENGTH));
    assert!(sink.writes() > 1);

    let restored = Encoding::Gzip.decompress_buffer(sink.into_body()).await.unwrap();
    assert_eq!(restored.len(), plain.len());
    assert_eq!(restored, plain);
}

#[tokio::test]
async fn media_is_sent_as_identity() {
    let plain = corpus(4096);
    let origin = Encoding::Gzip.compress_buffer(Bytes::from(plain.clone()), true).await.unwrap();

    for content_type in ["image/png", "video/mp4", "audio/ogg"] {
        let mut headers = response(content_type, Encoding::Gzip, origin.len());
        let mut sink = MemorySink::new();

        let outcome = recompressor(MIB)
            .recompress(&request("gzip, br"), &mut headers, chunked(&origin, 1000), &mut sink, false)
            .await
            .unwrap();

        assert_eq!(outcome.encoding_out, Encoding::Identity, "{content_type}");
        let sent = sink.headers().unwrap();
        assert!(!sent.contains_key(CONTENT_ENCODING));
        assert_eq!(sent[CONTENT_LENGTH], plain.len().to_string().as_str());
        assert_eq!(sink.body(), &plain[..]);
    }
}

#[tokio::test]
async fn fast_mode_keeps_gzip_origin_off_brotli() {
    let plain = corpus(8192);
    let origin = Encoding::Gzip.compress_buffer(Bytes::from(plain.clone()), true).await.unwrap();
    let mut headers = response("text/css", Encoding::Gzip, origin.len());
    let mut sink = MemorySink::new();

    let outcome = recompressor(MIB)
        .recompress(&request("br, gzip"), &mut headers, chunked(&origin, 512), &mut sink, true)
        .await
        .unwrap();

    assert_eq!(outcome.encoding_out, Encoding::Gzip);
    let restored = Encoding::Gzip.decompress_buffer(sink.into_body()).await.unwrap();
    assert_eq!(restored, plain);
}

#[tokio::test]
async fn fast_mode_still_uses_brotli_for_plain_origin() {
    let plain = corpus(8192);
    let mut headers = response("text/css", Encoding::Identity, plain.len());
    let mut sink = MemorySink::new();

    let outcome = recompressor(MIB)
        .recompress(&request("br, gzip"), &mut headers, chunked(&plain, 512), &mut sink, true)
        .await
        .unwrap();

    assert_eq!(outcome.encoding_out, Encoding::Brotli);
}

#[tokio::test]
async fn every_encoding_pair_round_trips() {
    let accepts: [(&'static str, Encoding); 4] = [
        ("identity", Encoding::Identity),
        ("gzip", Encoding::Gzip),
        ("deflate", Encoding::Deflate),
        ("br", Encoding::Brotli),
    ];

    for size in [0, 50, 3000, 12_000] {
        let plain = corpus(size);
        for encoding_in in Encoding::ALL {
            let origin = encoding_in.compress_buffer(Bytes::from(plain.clone()), true).await.unwrap();
            for (accept, encoding_out) in accepts {
                let mut headers = response("text/plain", encoding_in, origin.len());
                let mut sink = MemorySink::new();

                let outcome = recompressor(8192)
                    .recompress(&request(accept), &mut headers, chunked(&origin, 700), &mut sink, true)
                    .await
                    .unwrap();

                let label = format!("{encoding_in} -> {encoding_out}, {size} bytes");
                assert_eq!(outcome.encoding_out, encoding_out, "{label}");
                assert_eq!(outcome.mode == Mode::Streamed, size >= 8192, "{label}");

                let restored = encoding_out.decompress_buffer(sink.into_body()).await.unwrap();
                assert_eq!(restored, plain, "{label}");
            }
        }
    }
}

#[tokio::test]
async fn truncated_origin_is_never_delivered() {
    let plain = corpus(200_000);
    for encoding_in in [Encoding::Gzip, Encoding::Deflate, Encoding::Brotli] {
        let origin = encoding_in.compress_buffer(Bytes::from(plain.clone()), true).await.unwrap();
        let truncated = &origin[..origin.len() / 2];
        assert!(encoding_in.decompress_buffer(Bytes::copy_from_slice(truncated)).await.is_err(), "{encoding_in}");

        let mut headers = response("text/plain", encoding_in, truncated.len());
        let mut sink = MemorySink::new();
        let err = recompressor(MIB)
            .recompress(&request("gzip"), &mut headers, chunked(truncated, 4096), &mut sink, true)
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), RecodeError::Compression { .. }), "{encoding_in}");
        assert!(!err.head_sent(), "{encoding_in}");
        assert!(sink.headers().is_none(), "{encoding_in}");
    }
}

#[tokio::test]
async fn body_of_exactly_the_threshold_is_streamed() {
    let plain = corpus(4096);
    let mut sink = MemorySink::new();
    let outcome = recompressor(4096)
        .recompress(&request("gzip"), &mut HeaderMap::new(), chunked(&plain, 1024), &mut sink, true)
        .await
        .unwrap();
    assert_eq!(outcome.mode, Mode::Streamed);

    let mut sink = MemorySink::new();
    let outcome = recompressor(4097)
        .recompress(&request("gzip"), &mut HeaderMap::new(), chunked(&plain, 1024), &mut sink, true)
        .await
        .unwrap();
    assert_eq!(outcome.mode, Mode::Buffered);
}

#[tokio::test]
async fn empty_body_is_buffered() {
    let mut headers = response("text/plain", Encoding::Identity, 0);
    let mut sink = MemorySink::new();

    let outcome = recompressor(MIB)
        .recompress(&request("identity"), &mut headers, stream::empty(), &mut sink, false)
        .await
        .unwrap();

    assert_eq!(outcome.mode, Mode::Buffered);
    assert_eq!(sink.headers().unwrap()[CONTENT_LENGTH], "0");
    assert!(sink.is_ended());
    assert!(sink.body().is_empty());
}

#[tokio::test]
async fn wire_sink_receives_a_well_formed_response() {
    let plain = corpus(20_000);
    let mut headers = response("text/plain", Encoding::Identity, plain.len());

    let mut buffered = WireSink::new(Vec::new());
    recompressor(MIB)
        .recompress(&request("deflate"), &mut headers, chunked(&plain, 4096), &mut buffered, false)
        .await
        .unwrap();
    let wire = buffered.into_inner();
    let head_end = wire.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
    let head = std::str::from_utf8(&wire[..head_end]).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains(&format!("content-length: {}\r\n", wire.len() - head_end)));
    assert!(head.contains("content-encoding: deflate\r\n"));

    let restored = Encoding::Deflate.decompress_buffer(Bytes::copy_from_slice(&wire[head_end..])).await.unwrap();
    assert_eq!(restored, plain);

    let mut headers = response("text/plain", Encoding::Identity, plain.len());
    let mut streamed = WireSink::new(Vec::new());
    recompressor(4096)
        .recompress(&request("gzip"), &mut headers, chunked(&plain, 4096), &mut streamed, true)
        .await
        .unwrap();
    let wire = streamed.into_inner();
    let head_end = wire.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
    let head = std::str::from_utf8(&wire[..head_end]).unwrap();
    assert!(head.contains("transfer-encoding: chunked\r\n"));
    assert!(!head.contains("content-length"));
    assert!(wire.ends_with(b"0\r\n\r\n"));
}

#[tokio::test]
async fn queue_timeout_is_reported_before_the_head() {
    let queue = JobQueue::new(1, Some(Duration::from_millis(1)));
    let recompressor = Recompressor::builder().threshold(64 * MIB).queue(queue).build();

    let plain = corpus(MIB / 2);
    let mut sink = MemorySink::new();
    let err = recompressor
        .recompress(&request("br"), &mut HeaderMap::new(), chunked(&plain, 64 * 1024), &mut sink, false)
        .await
        .unwrap_err();

    assert!(matches!(err.kind(), RecodeError::QueueTimeout { .. }));
    assert!(!err.head_sent());
    assert_eq!(err.status_hint(), Some(StatusCode::SERVICE_UNAVAILABLE));
    assert!(sink.headers().is_none());
}
