//! Integration tests for JPEG normalization

mod common;

use common::{source, STILL};
use plantcam::capture::codec::encode_jpeg;
use plantcam::capture::{ConsumerId, FrameCodec, PixelFormat, SlotState};

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

#[test]
fn test_jpeg_frames_pass_through_without_copy() {
    let (mut source, _) = source(PixelFormat::Mjpeg, 1);
    let codec = FrameCodec::new();
    let frame = source.acquire(ConsumerId(1)).unwrap();

    let encoded = codec.normalize(&frame, 10).unwrap();
    assert!(!encoded.transcoded);
    assert_eq!(encoded.data, frame.data);
    assert_eq!(encoded.data.as_ptr(), frame.data.as_ptr());
    assert_eq!(encoded.sequence, frame.meta.sequence);

    source.release(frame).unwrap();
}

#[test]
fn test_raw_formats_are_transcoded() {
    let codec = FrameCodec::new();

    for format in [
        PixelFormat::Rgb24,
        PixelFormat::Bgr24,
        PixelFormat::Yuyv4,
        PixelFormat::Gray8,
    ] {
        let (mut source, _) = source(format, 1);
        let frame = source.acquire(ConsumerId(1)).unwrap();

        let encoded = codec.normalize(&frame, 75).unwrap();
        assert!(encoded.transcoded, "{format:?}");
        assert_eq!(encoded.data[..2], JPEG_SOI, "{format:?}");
        assert_eq!((encoded.width, encoded.height), (STILL.width, STILL.height));

        source.release(frame).unwrap();
    }
}

#[test]
fn test_convert_restores_ownership() {
    let (mut source, _) = source(PixelFormat::Rgb24, 1);
    let codec = FrameCodec::new();
    let frame = source.acquire(ConsumerId(7)).unwrap();

    let encoded = source.convert(&frame, &codec, 80).unwrap();
    assert!(!encoded.is_empty());
    assert_eq!(source.slot_state(0), Some(SlotState::Owned(ConsumerId(7))));

    source.release(frame).unwrap();
    assert_eq!(source.slot_state(0), Some(SlotState::Free));
}

#[test]
fn test_convert_after_release_is_rejected() {
    let (mut source, _) = source(PixelFormat::Rgb24, 1);
    let codec = FrameCodec::new();

    let frame = source.acquire(ConsumerId(1)).unwrap();
    source.release_checkout(frame.checkout()).unwrap();

    assert!(source.convert(&frame, &codec, 80).is_err());
}

#[test]
fn test_lower_quality_is_smaller() {
    let (width, height) = (64, 48);
    let rgb: Vec<u8> = (0..width * height)
        .flat_map(|i| {
            let v = (i * 37 % 251) as u8;
            [v, v.wrapping_mul(3), v.wrapping_add(91)]
        })
        .collect();

    let low = encode_jpeg(&rgb, width, height, PixelFormat::Rgb24, 5).unwrap();
    let high = encode_jpeg(&rgb, width, height, PixelFormat::Rgb24, 95).unwrap();
    assert!(low.len() < high.len(), "{} >= {}", low.len(), high.len());

    // Out-of-range quality is clamped rather than rejected
    assert!(encode_jpeg(&rgb, width, height, PixelFormat::Rgb24, 0).is_ok());
    assert!(encode_jpeg(&rgb, width, height, PixelFormat::Rgb24, 200).is_ok());
}
