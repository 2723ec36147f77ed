//! 像素压缩往返性质测试
//!
//! 任意宽高（含 0×0）的缓冲压缩后再解压，必须逐样本还原。

use camshare_protocol::{
    CompressedPixels, FrameDecoder, PixelBuffer, Response, encode_frame, swap_bayer_diagonal,
};
use proptest::prelude::*;

fn pixel_buffer() -> impl Strategy<Value = PixelBuffer> {
    (0u32..48, 0u32..48).prop_flat_map(|(w, h)| {
        prop::collection::vec(any::<u16>(), (w * h) as usize)
            .prop_map(move |samples| PixelBuffer::new(w, h, samples).unwrap())
    })
}

proptest! {
    #[test]
    fn prop_compress_decompress_is_identity(buffer in pixel_buffer()) {
        let restored = buffer.compress().decompress().unwrap();
        prop_assert_eq!(restored.to_le_bytes(), buffer.to_le_bytes());
        prop_assert_eq!(restored.width(), buffer.width());
        prop_assert_eq!(restored.height(), buffer.height());
    }

    /// 经过响应信封和帧切分后仍能还原
    #[test]
    fn prop_pixels_survive_framing(buffer in pixel_buffer()) {
        let response = Response::ok_serialized(&buffer.compress()).unwrap();
        let bytes = encode_frame(&response).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        let text = decoder.next_frame().unwrap().unwrap();
        let decoded: Response = serde_json::from_str(&text).unwrap();
        let pixels: CompressedPixels = decoded.payload_as().unwrap();
        prop_assert_eq!(pixels.decompress().unwrap(), buffer);
    }

    /// 对角交换两次还原
    #[test]
    fn prop_bayer_swap_is_involution(buffer in pixel_buffer()) {
        let mut swapped = buffer.clone();
        swap_bayer_diagonal(&mut swapped);
        swap_bayer_diagonal(&mut swapped);
        prop_assert_eq!(swapped, buffer);
    }
}

#[test]
fn test_zero_width_nonzero_height() {
    let buffer = PixelBuffer::zeroed(0, 17);
    assert_eq!(buffer.compress().decompress().unwrap(), buffer);
}
