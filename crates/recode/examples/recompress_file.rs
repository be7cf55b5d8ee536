//! Re-encodes a file as an HTTP response on stdout.
//!
//! ```sh
//! cargo run --example recompress_file -- page.html.gz gzip "gzip, br" > response.txt
//! ```
//!
//! Arguments: the file, its content-encoding (`identity` if omitted) and the
//! accept-encoding to negotiate against (`gzip, deflate, br` if omitted).
//! Set `RECODE_FAST=1` for the fast presets.

use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue};
use micro_recode::{RecodeConfig, Recompressor, WireSink};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).with_writer(std::io::stderr).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        error!("usage: recompress_file <file> [content-encoding] [accept-encoding]");
        return;
    };
    let content_encoding = args.next().unwrap_or_else(|| "identity".to_owned());
    let accept = args.next().unwrap_or_else(|| "gzip, deflate, br".to_owned());
    let fast = std::env::var("RECODE_FAST").is_ok_and(|value| value == "1");

    let file = match File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            error!(path = %path, cause = %e, "open file error");
            return;
        }
    };

    let mut request = HeaderMap::new();
    request.insert(ACCEPT_ENCODING, HeaderValue::from_str(&accept).expect("accept-encoding should be a valid header value"));

    let mut response = HeaderMap::new();
    response.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    response.insert(
        CONTENT_ENCODING,
        HeaderValue::from_str(&content_encoding).expect("content-encoding should be a valid header value"),
    );

    let recompressor = Recompressor::builder().config(&RecodeConfig::default()).build();
    let input = ReaderStream::new(file);
    let mut sink = WireSink::new(tokio::io::stdout());

    match recompressor.recompress(&request, &mut response, input, &mut sink, fast).await {
        Ok(outcome) => info!(
            encoding_in = %outcome.encoding_in,
            encoding_out = %outcome.encoding_out,
            mode = ?outcome.mode,
            bytes_written = outcome.bytes_written,
            "response written"
        ),
        Err(e) => error!(stage = ?e.stage(), status_hint = ?e.status_hint(), cause = %e, "recompress file error"),
    }
}
