//! The image half of ETL: fetch, bomb-guarded decode, downsample, re-encode.
//!
//! Every failure in here maps to the recoverable "invalid data row" kind;
//! the batch transformer counts and drops the row instead of failing the
//! run. Network fetches retry under the configured schedule, the decode and
//! resize never do.

use std::io::{Cursor, Read};
use std::time::Duration;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;

use crate::config::RetryPolicy;
use crate::error::{ConvertError, ConvertResult};
use crate::retry;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

const JPEG_QUALITY: u8 = 90;
/// Compressed payloads past this size are rejected before decode.
const MAX_IMAGE_BYTES: u64 = 64 * 1024 * 1024;

/// HTTP agent with the pipeline's shared timeouts. Built once per process
/// and handed to everything that fetches.
pub fn http_agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(CONNECT_TIMEOUT)
        .timeout_read(READ_TIMEOUT)
        .timeout_write(WRITE_TIMEOUT)
        .build()
}

/// A downsampled, JPEG-encoded image plus its pre-downsample dimensions.
#[derive(Debug, Clone)]
pub struct ProcessedImage {
    pub jpeg: Vec<u8>,
    pub original_width: u32,
    pub original_height: u32,
}

impl ProcessedImage {
    pub fn original_dims(&self) -> (u32, u32) {
        (self.original_width, self.original_height)
    }
}

/// Fetch a row's image and prepare it for upload: decode (guarded by the
/// per-axis limit), shrink by the linear `downsample_factor`, re-encode as
/// JPEG.
pub fn fetch_and_shrink(
    agent: &ureq::Agent,
    url: &str,
    downsample_factor: f32,
    max_dim: u32,
    policy: RetryPolicy,
) -> ConvertResult<ProcessedImage> {
    let bytes = fetch_bytes(agent, url, policy).map_err(|message| ConvertError::InvalidDataRow {
        url: url.to_string(),
        message,
    })?;
    shrink(&bytes, downsample_factor, max_dim).map_err(|message| ConvertError::InvalidDataRow {
        url: url.to_string(),
        message,
    })
}

fn fetch_bytes(agent: &ureq::Agent, url: &str, policy: RetryPolicy) -> Result<Vec<u8>, String> {
    let response = retry::with_backoff(policy, || agent.get(url).call(), should_retry)
        .map_err(|e| e.to_string())?;
    read_body(response)
}

/// Transient server trouble and rate limits retry; client errors are final.
fn should_retry(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
        _ => true,
    }
}

fn read_body(response: ureq::Response) -> Result<Vec<u8>, String> {
    let mut reader = response.into_reader().take(MAX_IMAGE_BYTES + 1);
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).map_err(|e| e.to_string())?;
    if bytes.len() as u64 > MAX_IMAGE_BYTES {
        return Err(format!("image payload exceeds {MAX_IMAGE_BYTES} bytes"));
    }
    Ok(bytes)
}

fn shrink(bytes: &[u8], factor: f32, max_dim: u32) -> Result<ProcessedImage, String> {
    let reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| e.to_string())?;
    // Header-only dimension probe before committing to a full decode.
    let (width, height) = reader.into_dimensions().map_err(|e| e.to_string())?;
    if width > max_dim || height > max_dim {
        return Err(format!(
            "image is {width}x{height}, over the {max_dim} px per-axis decode limit"
        ));
    }

    let decoded = image::load_from_memory(bytes).map_err(|e| e.to_string())?;
    let new_width = ((width as f32 / factor) as u32).max(1);
    let new_height = ((height as f32 / factor) as u32).max(1);
    let resized = decoded.resize_exact(new_width, new_height, FilterType::Triangle);

    let mut jpeg = Vec::new();
    resized
        .into_rgb8()
        .write_with_encoder(JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY))
        .map_err(|e| e.to_string())?;

    Ok(ProcessedImage {
        jpeg,
        original_width: width,
        original_height: height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 30, 30]));
        let mut bytes = Vec::new();
        img.write_with_encoder(image::codecs::png::PngEncoder::new(&mut bytes))
            .unwrap();
        bytes
    }

    fn serve_once(response: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(&response);
            }
        });
        format!("http://{addr}")
    }

    fn http_ok(body: &[u8]) -> Vec<u8> {
        let mut response =
            format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
        response.extend_from_slice(body);
        response
    }

    fn one_shot_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    #[test]
    fn shrink_halves_each_axis_and_keeps_original_dims() {
        let out = shrink(&png_bytes(8, 6), 2.0, 10_000).unwrap();
        assert_eq!(out.original_dims(), (8, 6));

        let reencoded = image::load_from_memory(&out.jpeg).unwrap();
        assert_eq!(reencoded.dimensions(), (4, 3));
    }

    #[test]
    fn factor_one_keeps_the_size() {
        let out = shrink(&png_bytes(5, 5), 1.0, 10_000).unwrap();
        let reencoded = image::load_from_memory(&out.jpeg).unwrap();
        assert_eq!(reencoded.dimensions(), (5, 5));
    }

    #[test]
    fn oversized_images_hit_the_decode_limit() {
        let err = shrink(&png_bytes(32, 4), 2.0, 16).unwrap_err();
        assert!(err.contains("decode limit"));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(shrink(b"not an image at all", 2.0, 10_000).is_err());
    }

    #[test]
    fn fetch_and_shrink_happy_path() {
        let url = serve_once(http_ok(&png_bytes(8, 8)));
        let agent = ureq::Agent::new();
        let out = fetch_and_shrink(&agent, &url, 2.0, 10_000, one_shot_policy()).unwrap();
        assert_eq!(out.original_dims(), (8, 8));
    }

    #[test]
    fn fetch_404_is_an_invalid_data_row() {
        let url = serve_once(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec());
        let agent = ureq::Agent::new();
        let err = fetch_and_shrink(&agent, &url, 2.0, 10_000, one_shot_policy()).unwrap_err();
        assert!(matches!(err, ConvertError::InvalidDataRow { .. }));
        assert!(err.is_recoverable());
    }
}
